//! Reconciliation logic for Website resources.
//!
//! - `website`: converges the workload behind one Website and reports its phase
//!
//! Every reconcile reads the object from the authoritative store, never from
//! the event cache, so a stale cache can delay work but never cause a wrong
//! mutation.

pub mod website;

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::status::StatusReporter;
use std::sync::Arc;
use std::time::Duration;
use store_client::{ResourceIdentity, StoreClientTrait, StoreError, WorkloadClientTrait};
use tracing::debug;

/// What the worker should do with an identity after a successful reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Action {
    requeue_after: Option<Duration>,
}

impl Action {
    /// Reconcile again after `duration`
    #[must_use]
    pub fn requeue(duration: Duration) -> Self {
        Self {
            requeue_after: Some(duration),
        }
    }

    /// Nothing to do until the object changes
    #[must_use]
    pub fn await_change() -> Self {
        Self { requeue_after: None }
    }

    /// Requested requeue delay, if any
    #[must_use]
    pub fn requeue_after(&self) -> Option<Duration> {
        self.requeue_after
    }
}

/// Reconciles Website resources.
pub struct Reconciler {
    pub(crate) store: Arc<dyn StoreClientTrait>,
    pub(crate) workloads: Arc<dyn WorkloadClientTrait>,
    pub(crate) status: StatusReporter,
    /// Requeue interval while replicas are not all available
    pub(crate) progress_requeue: Duration,
    /// Requeue interval once available, so workload drift is noticed
    pub(crate) resync_interval: Duration,
    /// In-place retries after a status write conflict
    conflict_retries: u32,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("progress_requeue", &self.progress_requeue)
            .field("resync_interval", &self.resync_interval)
            .field("conflict_retries", &self.conflict_retries)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Creates a reconciler over the given store and workload clients.
    pub fn new(
        store: Arc<dyn StoreClientTrait>,
        workloads: Arc<dyn WorkloadClientTrait>,
        config: &ControllerConfig,
    ) -> Self {
        Self {
            status: StatusReporter::new(Arc::clone(&store)),
            store,
            workloads,
            progress_requeue: config.progress_requeue,
            resync_interval: config.resync_interval,
            conflict_retries: config.status_conflict_retries,
        }
    }

    /// Drives one Website toward its desired state.
    ///
    /// A status write that loses a race is retried from a fresh read, up to
    /// the configured number of times, before surfacing as a transient error.
    ///
    /// # Errors
    ///
    /// Transient store errors and exhausted conflict retries. Invalid specs
    /// and terminal workload failures are reported on the object instead.
    pub async fn reconcile(&self, id: &ResourceIdentity) -> Result<Action, ControllerError> {
        let mut conflicts = 0;
        loop {
            match self.reconcile_website(id).await {
                Err(ControllerError::Store(StoreError::Conflict(msg))) if conflicts < self.conflict_retries => {
                    conflicts += 1;
                    debug!(
                        "Conflict reconciling {} ({}), retrying from a fresh read ({}/{})",
                        id, msg, conflicts, self.conflict_retries
                    );
                }
                result => return result,
            }
        }
    }
}
