//! Website reconciler
//!
//! Compares the desired spec with the provisioned workload, issues only the
//! mutations needed to close the gap, and derives the reported phase from
//! how many replicas are available.

use super::{Action, Reconciler};
use crate::error::ControllerError;
use crds::{WebsitePhase, WebsiteSpec, WebsiteStatus};
use store_client::{CachedObject, ResourceIdentity, StoreError, WorkloadState};
use tracing::{debug, error, info, warn};

/// Derives the status reported for `spec` given the workload's state.
///
/// Zero desired replicas with zero available counts as `Available`.
#[must_use]
pub fn compute_status(spec: &WebsiteSpec, workload: &WorkloadState) -> WebsiteStatus {
    let available = workload.available_replicas;
    let phase = if available == spec.replicas {
        WebsitePhase::Available
    } else if available == 0 {
        WebsitePhase::Pending
    } else {
        WebsitePhase::Progressing
    };
    WebsiteStatus::new(phase, available)
}

impl Reconciler {
    /// One pass over a Website, without conflict retries.
    pub(crate) async fn reconcile_website(&self, id: &ResourceIdentity) -> Result<Action, ControllerError> {
        let obj = match self.store.get(id).await {
            Ok(obj) => obj,
            Err(StoreError::NotFound(_)) => {
                self.cleanup_website(id).await?;
                return Ok(Action::await_change());
            }
            Err(e) => return Err(e.into()),
        };

        if let Err(e) = obj.spec.validate() {
            warn!("Website {} has an invalid spec: {}", id, e);
            self.report_failure(&obj, e.to_string()).await?;
            return Ok(Action::await_change());
        }

        let workload = match self.converge(&obj).await {
            Ok(workload) => workload,
            Err(e) if e.is_transient() => return Err(e.into()),
            Err(e) => {
                error!("Failed to converge workload for {}: {}", id, e);
                self.report_failure(&obj, e.to_string()).await?;
                return Ok(Action::await_change());
            }
        };

        let status = compute_status(&obj.spec, &workload);
        let phase = status.phase;
        if self.status.publish_status(&obj, status).await? {
            info!(
                "Website {} is {} ({}/{} replicas available)",
                id, phase, workload.available_replicas, obj.spec.replicas
            );
        }

        // Workload changes raise no Website events; only a requeue sees them
        if phase == WebsitePhase::Available {
            Ok(Action::requeue(self.resync_interval))
        } else {
            Ok(Action::requeue(self.progress_requeue))
        }
    }

    /// Makes the workload match the spec, returning its state afterwards.
    async fn converge(&self, obj: &CachedObject) -> Result<WorkloadState, StoreError> {
        let id = &obj.identity;
        let spec = &obj.spec;

        let Some(mut workload) = self.workloads.get(id).await? else {
            info!("Provisioning workload for {} ({} x {})", id, spec.replicas, spec.image);
            return self.workloads.ensure(id, spec).await;
        };

        if workload.replicas != spec.replicas {
            info!("Scaling {} from {} to {} replicas", id, workload.replicas, spec.replicas);
            self.workloads.scale(id, spec.replicas).await?;
            workload.replicas = spec.replicas;
        }

        let image_changed = workload.image.as_deref() != Some(spec.image.as_str());
        let port_changed = workload.port != Some(spec.port);
        if image_changed || port_changed {
            info!("Rolling out {} with image {} on port {}", id, spec.image, spec.port);
            self.workloads.roll_out(id, &spec.image, spec.port).await?;
            workload.image = Some(spec.image.clone());
            workload.port = Some(spec.port);
        }

        Ok(workload)
    }

    /// Records a terminal failure on the object, keeping the last known availability.
    async fn report_failure(&self, obj: &CachedObject, message: String) -> Result<(), ControllerError> {
        let status = WebsiteStatus::failed(obj.status.available_replicas, message);
        self.status.publish_status(obj, status).await?;
        Ok(())
    }

    /// Releases the workload of a Website that no longer exists.
    async fn cleanup_website(&self, id: &ResourceIdentity) -> Result<(), ControllerError> {
        debug!("Website {} is gone, releasing its workload", id);
        self.workloads.release(id).await?;
        info!("Released workload for deleted Website {}", id);
        Ok(())
    }
}
