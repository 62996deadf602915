//! In-memory workloads

use super::lock;
use crate::error::StoreError;
use crate::models::{ResourceIdentity, WorkloadState};
use crate::store_trait::WorkloadClientTrait;
use crate::workload::not_managed;
use crds::WebsiteSpec;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct WorkloadsState {
    workloads: BTreeMap<ResourceIdentity, WorkloadState>,
    // Same-named workloads created by someone else
    foreign: BTreeSet<ResourceIdentity>,
    failures: VecDeque<StoreError>,
    ensure_calls: usize,
    scale_calls: usize,
    roll_out_calls: usize,
    release_calls: usize,
}

impl WorkloadsState {
    fn take_failure(&mut self) -> Result<(), StoreError> {
        self.failures.pop_front().map_or(Ok(()), Err)
    }

    fn check_owned(&self, id: &ResourceIdentity) -> Result<(), StoreError> {
        if self.foreign.contains(id) {
            return Err(not_managed(id));
        }
        Ok(())
    }
}

/// Mock workload API for testing
///
/// Availability never changes on its own; tests drive it with
/// `set_available` so phase transitions are deterministic.
#[derive(Clone, Default)]
pub struct MockWorkloads {
    inner: Arc<Mutex<WorkloadsState>>,
}

impl std::fmt::Debug for MockWorkloads {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockWorkloads")
            .field("workloads", &lock(&self.inner).workloads)
            .finish_non_exhaustive()
    }
}

impl MockWorkloads {
    /// Create a mock with nothing provisioned
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a workload directly (for test setup)
    pub fn insert(&self, id: &ResourceIdentity, state: WorkloadState) {
        lock(&self.inner).workloads.insert(id.clone(), state);
    }

    /// Insert a workload the controller does not own
    pub fn insert_foreign(&self, id: &ResourceIdentity) {
        lock(&self.inner).foreign.insert(id.clone());
    }

    /// Whether a workload the controller does not own is present
    #[must_use]
    pub fn is_foreign(&self, id: &ResourceIdentity) -> bool {
        lock(&self.inner).foreign.contains(id)
    }

    /// Delete a workload behind the controller's back
    pub fn remove(&self, id: &ResourceIdentity) {
        lock(&self.inner).workloads.remove(id);
    }

    /// Set how many replicas are reported available
    pub fn set_available(&self, id: &ResourceIdentity, available: i32) {
        if let Some(w) = lock(&self.inner).workloads.get_mut(id) {
            w.available_replicas = available;
        }
    }

    /// Make the next mutating call fail with `error`
    pub fn fail_next(&self, error: StoreError) {
        lock(&self.inner).failures.push_back(error);
    }

    /// Current state of a workload
    #[must_use]
    pub fn workload(&self, id: &ResourceIdentity) -> Option<WorkloadState> {
        lock(&self.inner).workloads.get(id).cloned()
    }

    /// Number of ensure calls
    #[must_use]
    pub fn ensure_calls(&self) -> usize {
        lock(&self.inner).ensure_calls
    }

    /// Number of scale calls
    #[must_use]
    pub fn scale_calls(&self) -> usize {
        lock(&self.inner).scale_calls
    }

    /// Number of roll_out calls
    #[must_use]
    pub fn roll_out_calls(&self) -> usize {
        lock(&self.inner).roll_out_calls
    }

    /// Number of release calls
    #[must_use]
    pub fn release_calls(&self) -> usize {
        lock(&self.inner).release_calls
    }

    /// Total mutating calls of any kind
    #[must_use]
    pub fn mutations(&self) -> usize {
        let state = lock(&self.inner);
        state.ensure_calls + state.scale_calls + state.roll_out_calls + state.release_calls
    }
}

#[async_trait::async_trait]
impl WorkloadClientTrait for MockWorkloads {
    async fn get(&self, id: &ResourceIdentity) -> Result<Option<WorkloadState>, StoreError> {
        let state = lock(&self.inner);
        state.check_owned(id)?;
        Ok(state.workloads.get(id).cloned())
    }

    async fn ensure(&self, id: &ResourceIdentity, spec: &WebsiteSpec) -> Result<WorkloadState, StoreError> {
        let mut state = lock(&self.inner);
        state.ensure_calls += 1;
        state.take_failure()?;
        state.check_owned(id)?;
        let workload = WorkloadState {
            replicas: spec.replicas,
            available_replicas: 0,
            image: Some(spec.image.clone()),
            port: Some(spec.port),
        };
        state.workloads.insert(id.clone(), workload.clone());
        Ok(workload)
    }

    async fn scale(&self, id: &ResourceIdentity, replicas: i32) -> Result<(), StoreError> {
        let mut state = lock(&self.inner);
        state.scale_calls += 1;
        state.take_failure()?;
        state.check_owned(id)?;
        let workload = state
            .workloads
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("deployments {id}")))?;
        workload.replicas = replicas;
        workload.available_replicas = workload.available_replicas.min(replicas);
        Ok(())
    }

    async fn roll_out(&self, id: &ResourceIdentity, image: &str, port: i32) -> Result<(), StoreError> {
        let mut state = lock(&self.inner);
        state.roll_out_calls += 1;
        state.take_failure()?;
        state.check_owned(id)?;
        let workload = state
            .workloads
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("deployments {id}")))?;
        workload.image = Some(image.to_string());
        workload.port = Some(port);
        Ok(())
    }

    async fn release(&self, id: &ResourceIdentity) -> Result<(), StoreError> {
        let mut state = lock(&self.inner);
        state.release_calls += 1;
        state.take_failure()?;
        // Foreign workloads are never deleted
        state.workloads.remove(id);
        Ok(())
    }
}
