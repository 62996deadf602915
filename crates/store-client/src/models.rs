//! Typed models exchanged with the resource store
//!
//! Raw store payloads are converted once, at the client boundary, into
//! `CachedObject`. Everything downstream works on these typed values.

use crate::error::StoreError;
use crds::{WEBSITE_GROUP, WEBSITE_RESOURCE, WEBSITE_VERSION, Website, WebsiteSpec, WebsiteStatus};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Namespace used when an object carries none.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Unique key of one Website object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceIdentity {
    /// Namespace of the object
    pub namespace: String,
    /// Name of the object
    pub name: String,
}

impl ResourceIdentity {
    /// Creates an identity from namespace and name.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Last-known snapshot of one Website.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedObject {
    /// Identity of the object
    pub identity: ResourceIdentity,
    /// Desired state
    pub spec: WebsiteSpec,
    /// Observed state as last written by the controller
    pub status: WebsiteStatus,
    /// Opaque store version token
    pub resource_version: String,
}

impl TryFrom<Website> for CachedObject {
    type Error = StoreError;

    fn try_from(website: Website) -> Result<Self, Self::Error> {
        let name = website
            .metadata
            .name
            .ok_or_else(|| StoreError::Conversion("Website missing metadata.name".to_string()))?;
        let namespace = website
            .metadata
            .namespace
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
        let resource_version = website.metadata.resource_version.ok_or_else(|| {
            StoreError::Conversion(format!(
                "Website {namespace}/{name} missing metadata.resourceVersion"
            ))
        })?;

        Ok(Self {
            identity: ResourceIdentity { namespace, name },
            spec: website.spec,
            status: website.status.unwrap_or_default(),
            resource_version,
        })
    }
}

/// One change observed on the watch stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// Object was created
    Added(CachedObject),
    /// Object was changed
    Modified(CachedObject),
    /// Object was removed; carries its final state
    Deleted(CachedObject),
    /// Progress marker; only advances the resume version
    Bookmark {
        /// Version to resume the watch from
        resource_version: String,
    },
}

impl WatchEvent {
    /// Resource version carried by the event.
    #[must_use]
    pub fn resource_version(&self) -> &str {
        match self {
            Self::Added(obj) | Self::Modified(obj) | Self::Deleted(obj) => &obj.resource_version,
            Self::Bookmark { resource_version } => resource_version,
        }
    }
}

/// Identifies the watched resource kind.
///
/// Passed explicitly to the cache and the store client instead of being
/// registered globally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceConfig {
    /// API group, e.g. `example.com`
    pub group: String,
    /// API version, e.g. `v1`
    pub version: String,
    /// Kind, e.g. `Website`
    pub kind: String,
    /// Plural resource name, e.g. `websites`
    pub resource: String,
    /// Namespace to watch; `None` watches all namespaces
    pub namespace: Option<String>,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            group: WEBSITE_GROUP.to_string(),
            version: WEBSITE_VERSION.to_string(),
            kind: "Website".to_string(),
            resource: WEBSITE_RESOURCE.to_string(),
            namespace: None,
        }
    }
}

impl fmt::Display for ResourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}/{}", self.resource, self.group, self.version)
    }
}

/// Provisioned state of the workload backing one Website.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WorkloadState {
    /// Replicas requested from the workload
    pub replicas: i32,
    /// Replicas reported available
    pub available_replicas: i32,
    /// Last applied container image
    pub image: Option<String>,
    /// Last applied container port
    pub port: Option<i32>,
}
