//! Status reporting.
//!
//! Writes the observed status of a Website back to the store, conditioned
//! on the resource version the reconcile read.

use crds::WebsiteStatus;
use std::sync::Arc;
use store_client::{CachedObject, StoreClientTrait, StoreError};
use tracing::debug;

/// Publishes Website status through the store client.
#[derive(Clone)]
pub struct StatusReporter {
    store: Arc<dyn StoreClientTrait>,
}

impl std::fmt::Debug for StatusReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusReporter").finish_non_exhaustive()
    }
}

impl StatusReporter {
    #[must_use]
    pub fn new(store: Arc<dyn StoreClientTrait>) -> Self {
        Self { store }
    }

    /// Writes `status` for `obj` unless it is already current.
    ///
    /// Returns whether a write happened.
    ///
    /// # Errors
    ///
    /// `StoreError::Conflict` if the object changed since `obj` was read.
    pub async fn publish_status(&self, obj: &CachedObject, status: WebsiteStatus) -> Result<bool, StoreError> {
        if obj.status == status {
            debug!("Status of {} already current ({})", obj.identity, status.phase);
            return Ok(false);
        }

        self.store
            .update_status(&obj.identity, &status, &obj.resource_version)
            .await?;
        debug!(
            "Updated status of {}: {} -> {} ({} available)",
            obj.identity, obj.status.phase, status.phase, status.available_replicas
        );
        Ok(true)
    }
}
