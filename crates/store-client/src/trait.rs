//! Client traits for mocking
//!
//! These traits abstract the resource store and the workload API so the
//! controller can be unit tested against in-memory implementations.
//! All async methods must be `Send` to work with Tokio's work-stealing runtime.

use crate::error::StoreError;
use crate::models::{CachedObject, ResourceConfig, ResourceIdentity, WatchEvent, WorkloadState};
use crds::{WebsiteSpec, WebsiteStatus};
use futures::stream::BoxStream;

/// Stream of watch events; ends when the server closes the watch.
pub type WatchStream = BoxStream<'static, Result<WatchEvent, StoreError>>;

/// Resource store operations over Website objects
#[async_trait::async_trait]
pub trait StoreClientTrait: Send + Sync {
    /// Lists every object of the kind, with the list's resource version.
    async fn list(&self, config: &ResourceConfig) -> Result<(Vec<CachedObject>, String), StoreError>;

    /// Watches changes after `from_resource_version`.
    async fn watch(&self, config: &ResourceConfig, from_resource_version: &str) -> Result<WatchStream, StoreError>;

    /// Reads one object from the authoritative store.
    async fn get(&self, id: &ResourceIdentity) -> Result<CachedObject, StoreError>;

    /// Replaces the desired state of one object.
    async fn update(&self, id: &ResourceIdentity, spec: &WebsiteSpec) -> Result<CachedObject, StoreError>;

    /// Writes status, conditioned on `expected_resource_version`.
    ///
    /// Returns `StoreError::Conflict` if the object changed since that version.
    async fn update_status(
        &self,
        id: &ResourceIdentity,
        status: &WebsiteStatus,
        expected_resource_version: &str,
    ) -> Result<CachedObject, StoreError>;
}

/// Operations on the workload that serves a Website
#[async_trait::async_trait]
pub trait WorkloadClientTrait: Send + Sync {
    /// Current provisioned state, `None` if nothing is provisioned.
    async fn get(&self, id: &ResourceIdentity) -> Result<Option<WorkloadState>, StoreError>;

    /// Provisions a new workload from the full spec.
    async fn ensure(&self, id: &ResourceIdentity, spec: &WebsiteSpec) -> Result<WorkloadState, StoreError>;

    /// Sets the replica count.
    async fn scale(&self, id: &ResourceIdentity, replicas: i32) -> Result<(), StoreError>;

    /// Rolls the workload to a new image and port.
    async fn roll_out(&self, id: &ResourceIdentity, image: &str, port: i32) -> Result<(), StoreError>;

    /// Releases everything provisioned for the identity. Absent workloads are not an error.
    async fn release(&self, id: &ResourceIdentity) -> Result<(), StoreError>;
}
