//! Deployment-backed workloads
//!
//! Each Website is served by an `apps/v1` Deployment with the same name and
//! namespace. The last applied image and port are recorded as annotations so
//! the reconciler compares desired state against what it applied, not
//! against what it assumes succeeded.
//!
//! A same-named Deployment without the controller's labels belongs to someone
//! else: it is reported as `Invalid` and never patched or deleted.

use crate::error::StoreError;
use crate::models::{ResourceIdentity, WorkloadState};
use crate::store_trait::WorkloadClientTrait;
use crds::WebsiteSpec;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Container, ContainerPort, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::api::{Api, DeleteParams, Patch, PatchParams, Preconditions};
use kube::Client;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Annotation holding the last applied container image.
pub const APPLIED_IMAGE_ANNOTATION: &str = "websites.example.com/applied-image";
/// Annotation holding the last applied container port.
pub const APPLIED_PORT_ANNOTATION: &str = "websites.example.com/applied-port";
/// Label selecting the pods of one Website.
pub const WEBSITE_LABEL: &str = "websites.example.com/name";
/// Label marking Deployments this controller owns.
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
/// Field manager used for server-side apply, also the managed-by value.
pub const FIELD_MANAGER: &str = "website-controller";

const CONTAINER_NAME: &str = "website";

/// Workload client provisioning Deployments
#[derive(Clone)]
pub struct DeploymentWorkloads {
    client: Client,
}

impl std::fmt::Debug for DeploymentWorkloads {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentWorkloads").finish_non_exhaustive()
    }
}

impl DeploymentWorkloads {
    /// Creates a workload client.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, id: &ResourceIdentity) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &id.namespace)
    }

    /// Reads the Deployment of `id`, refusing one this controller does not own.
    async fn owned(&self, id: &ResourceIdentity) -> Result<Option<Deployment>, StoreError> {
        let deployment = self
            .api(id)
            .get_opt(&id.name)
            .await
            .map_err(StoreError::from_kube)?;
        match deployment {
            Some(d) if !is_managed(&d, id) => Err(not_managed(id)),
            other => Ok(other),
        }
    }
}

/// Error for a same-named Deployment created by someone else.
pub(crate) fn not_managed(id: &ResourceIdentity) -> StoreError {
    StoreError::Invalid(format!("Deployment {id} exists and is not managed by {FIELD_MANAGER}"))
}

/// Whether `deployment` was provisioned by this controller for `id`.
#[must_use]
pub fn is_managed(deployment: &Deployment, id: &ResourceIdentity) -> bool {
    let Some(labels) = deployment.metadata.labels.as_ref() else {
        return false;
    };
    labels.get(MANAGED_BY_LABEL).map(String::as_str) == Some(FIELD_MANAGER)
        && labels.get(WEBSITE_LABEL) == Some(&id.name)
}

fn container(image: &str, port: i32) -> Container {
    Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(image.to_string()),
        ports: Some(vec![ContainerPort {
            container_port: port,
            ..Default::default()
        }]),
        ..Default::default()
    }
}

/// Builds the Deployment serving one Website.
#[must_use]
pub fn deployment_for(id: &ResourceIdentity, spec: &WebsiteSpec) -> Deployment {
    let labels = BTreeMap::from([(WEBSITE_LABEL.to_string(), id.name.clone())]);
    let mut owner_labels = labels.clone();
    owner_labels.insert(MANAGED_BY_LABEL.to_string(), FIELD_MANAGER.to_string());
    let annotations = BTreeMap::from([
        (APPLIED_IMAGE_ANNOTATION.to_string(), spec.image.clone()),
        (APPLIED_PORT_ANNOTATION.to_string(), spec.port.to_string()),
    ]);

    Deployment {
        metadata: ObjectMeta {
            name: Some(id.name.clone()),
            namespace: Some(id.namespace.clone()),
            labels: Some(owner_labels),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(spec.replicas),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container(&spec.image, spec.port)],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

/// Reads the provisioned state recorded on a Deployment.
#[must_use]
pub fn workload_state(deployment: &Deployment) -> WorkloadState {
    let annotations = deployment.metadata.annotations.as_ref();
    WorkloadState {
        replicas: deployment
            .spec
            .as_ref()
            .and_then(|s| s.replicas)
            .unwrap_or(0),
        available_replicas: deployment
            .status
            .as_ref()
            .and_then(|s| s.available_replicas)
            .unwrap_or(0),
        image: annotations.and_then(|a| a.get(APPLIED_IMAGE_ANNOTATION).cloned()),
        port: annotations
            .and_then(|a| a.get(APPLIED_PORT_ANNOTATION))
            .and_then(|p| p.parse().ok()),
    }
}

#[async_trait::async_trait]
impl WorkloadClientTrait for DeploymentWorkloads {
    async fn get(&self, id: &ResourceIdentity) -> Result<Option<WorkloadState>, StoreError> {
        Ok(self.owned(id).await?.as_ref().map(workload_state))
    }

    async fn ensure(&self, id: &ResourceIdentity, spec: &WebsiteSpec) -> Result<WorkloadState, StoreError> {
        // Never apply over a Deployment someone else created
        self.owned(id).await?;
        let deployment = deployment_for(id, spec);
        let pp = PatchParams::apply(FIELD_MANAGER).force();
        let applied = self
            .api(id)
            .patch(&id.name, &pp, &Patch::Apply(&deployment))
            .await
            .map_err(StoreError::from_kube)?;
        info!("Provisioned Deployment {} ({} replicas of {})", id, spec.replicas, spec.image);
        Ok(workload_state(&applied))
    }

    async fn scale(&self, id: &ResourceIdentity, replicas: i32) -> Result<(), StoreError> {
        let patch = json!({ "spec": { "replicas": replicas } });
        self.api(id)
            .patch(&id.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(StoreError::from_kube)?;
        info!("Scaled Deployment {} to {} replicas", id, replicas);
        Ok(())
    }

    async fn roll_out(&self, id: &ResourceIdentity, image: &str, port: i32) -> Result<(), StoreError> {
        let patch = json!({
            "metadata": {
                "annotations": {
                    APPLIED_IMAGE_ANNOTATION: image,
                    APPLIED_PORT_ANNOTATION: port.to_string(),
                }
            },
            "spec": {
                "template": {
                    "spec": { "containers": [container(image, port)] }
                }
            }
        });
        self.api(id)
            .patch(&id.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(StoreError::from_kube)?;
        info!("Rolling Deployment {} to {} on port {}", id, image, port);
        Ok(())
    }

    async fn release(&self, id: &ResourceIdentity) -> Result<(), StoreError> {
        let api = self.api(id);
        let Some(deployment) = api.get_opt(&id.name).await.map_err(StoreError::from_kube)? else {
            debug!("Deployment {} already gone", id);
            return Ok(());
        };
        if !is_managed(&deployment, id) {
            warn!("Leaving Deployment {} in place: not managed by {}", id, FIELD_MANAGER);
            return Ok(());
        }

        // Only delete the exact object that was checked
        let dp = DeleteParams {
            preconditions: Some(Preconditions {
                uid: deployment.metadata.uid.clone(),
                resource_version: None,
            }),
            ..DeleteParams::default()
        };
        match api.delete(&id.name, &dp).await {
            Ok(_) => {
                info!("Released Deployment {}", id);
                Ok(())
            }
            Err(e) => match StoreError::from_kube(e) {
                StoreError::NotFound(_) => {
                    debug!("Deployment {} already gone", id);
                    Ok(())
                }
                other => Err(other),
            },
        }
    }
}
