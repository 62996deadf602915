//! Test utilities for unit testing the controller
//!
//! This module provides helpers for creating test data and wiring
//! components to the in-memory store and workload mocks.

use crate::config::ControllerConfig;
use crate::reconciler::Reconciler;
use crds::{WebsiteSpec, WebsiteStatus};
use std::sync::Arc;
use store_client::{CachedObject, MockStoreClient, MockWorkloads, ResourceIdentity};

/// Identity in the `default` namespace
pub fn identity(name: &str) -> ResourceIdentity {
    ResourceIdentity::new("default", name)
}

/// Valid spec with the given replica count
pub fn spec(replicas: i32) -> WebsiteSpec {
    WebsiteSpec {
        domain: "example.org".to_string(),
        replicas,
        image: "nginx:1.27".to_string(),
        port: 8080,
    }
}

/// Cached snapshot at a given resource version
pub fn cached(id: &ResourceIdentity, resource_version: &str) -> CachedObject {
    CachedObject {
        identity: id.clone(),
        spec: spec(1),
        status: WebsiteStatus::default(),
        resource_version: resource_version.to_string(),
    }
}

/// Reconciler wired to fresh mocks
pub struct TestHarness {
    pub store: MockStoreClient,
    pub workloads: MockWorkloads,
    pub reconciler: Reconciler,
}

impl TestHarness {
    pub fn new() -> Self {
        let store = MockStoreClient::new();
        let workloads = MockWorkloads::new();
        let reconciler = Reconciler::new(
            Arc::new(store.clone()),
            Arc::new(workloads.clone()),
            &ControllerConfig::default(),
        );
        Self {
            store,
            workloads,
            reconciler,
        }
    }
}
