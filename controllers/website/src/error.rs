//! Controller-specific error types.
//!
//! This module defines error types specific to the Website Controller
//! that are not covered by upstream library errors.

use kube::Error as KubeError;
use store_client::StoreError;
use thiserror::Error;

/// Errors that can occur in the Website Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes client setup error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Resource store or workload API error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Initial list never completed
    #[error("Initial sync failed: {0}")]
    InitialSync(String),

    /// Background watch or worker task failed
    #[error("Resource watch failed: {0}")]
    Watch(String),
}

impl ControllerError {
    /// Whether retrying the same identity later may succeed.
    ///
    /// Terminal errors wait for the object to change instead.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store(e) => e.is_transient(),
            Self::Kube(_) | Self::Watch(_) => true,
            Self::InvalidConfig(_) | Self::InitialSync(_) => false,
        }
    }
}
