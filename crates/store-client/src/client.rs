//! Kubernetes-backed resource store client
//!
//! Talks to the API server through a dynamic `Api` built from an explicit
//! `ResourceConfig`, and converts every payload to a typed `CachedObject`
//! before handing it to callers.
//!
//! On list and watch, an object that does not parse as a Website is logged
//! and skipped, so one malformed object never hides the others.

use crate::error::StoreError;
use crate::models::{CachedObject, ResourceConfig, ResourceIdentity, WatchEvent};
use crate::store_trait::{StoreClientTrait, WatchStream};
use crds::{Website, WebsiteSpec, WebsiteStatus};
use futures::StreamExt;
use kube::api::{Api, ListParams, Patch, PatchParams, WatchParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::Client;
use serde_json::json;
use tracing::{debug, warn};

/// Server-side watch timeout. The API server caps this just below 5 minutes.
const WATCH_TIMEOUT_SECS: u32 = 290;

/// Resource store client over the Kubernetes API
#[derive(Clone)]
pub struct StoreClient {
    client: Client,
    resource: ApiResource,
}

impl std::fmt::Debug for StoreClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreClient")
            .field("resource", &self.resource)
            .finish_non_exhaustive()
    }
}

impl StoreClient {
    /// Creates a client for the kind described by `config`.
    #[must_use]
    pub fn new(client: Client, config: &ResourceConfig) -> Self {
        let gvk = GroupVersionKind::gvk(&config.group, &config.version, &config.kind);
        Self {
            client,
            resource: ApiResource::from_gvk_with_plural(&gvk, &config.resource),
        }
    }

    fn scoped_api(&self, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &self.resource),
            None => Api::all_with(self.client.clone(), &self.resource),
        }
    }

    fn object_api(&self, id: &ResourceIdentity) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), &id.namespace, &self.resource)
    }
}

/// Converts a dynamic payload into a typed snapshot.
fn to_cached(obj: DynamicObject) -> Result<CachedObject, StoreError> {
    let website: Website = obj
        .try_parse()
        .map_err(|e| StoreError::Conversion(e.to_string()))?;
    CachedObject::try_from(website)
}

/// Converts one streamed or listed payload, logging and dropping it if it is
/// not a valid Website.
fn convert_or_skip(obj: DynamicObject) -> Option<CachedObject> {
    let namespace = obj.metadata.namespace.clone().unwrap_or_default();
    let name = obj.metadata.name.clone().unwrap_or_default();
    match to_cached(obj) {
        Ok(cached) => Some(cached),
        Err(e) => {
            warn!("Skipping Website {}/{}: {}", namespace, name, e);
            None
        }
    }
}

fn convert_listed(items: Vec<DynamicObject>) -> Vec<CachedObject> {
    items.into_iter().filter_map(convert_or_skip).collect()
}

/// Maps a raw watch event; `None` if its object could not be converted.
fn to_watch_event(event: kube::api::WatchEvent<DynamicObject>) -> Option<Result<WatchEvent, StoreError>> {
    match event {
        kube::api::WatchEvent::Added(obj) => convert_or_skip(obj).map(|o| Ok(WatchEvent::Added(o))),
        kube::api::WatchEvent::Modified(obj) => convert_or_skip(obj).map(|o| Ok(WatchEvent::Modified(o))),
        kube::api::WatchEvent::Deleted(obj) => convert_or_skip(obj).map(|o| Ok(WatchEvent::Deleted(o))),
        kube::api::WatchEvent::Bookmark(bookmark) => Some(Ok(WatchEvent::Bookmark {
            resource_version: bookmark.metadata.resource_version,
        })),
        kube::api::WatchEvent::Error(err) => {
            if err.code == 410 {
                Some(Err(StoreError::Gone(err.message.clone())))
            } else {
                Some(Err(StoreError::Transient(format!("watch error {}: {}", err.code, err.message))))
            }
        }
    }
}

#[async_trait::async_trait]
impl StoreClientTrait for StoreClient {
    async fn list(&self, config: &ResourceConfig) -> Result<(Vec<CachedObject>, String), StoreError> {
        let api = self.scoped_api(config.namespace.as_deref());
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(StoreError::from_kube)?;
        let resource_version = list.metadata.resource_version.unwrap_or_default();
        let objects = convert_listed(list.items);
        debug!("Listed {} {} at resource version {}", objects.len(), config, resource_version);
        Ok((objects, resource_version))
    }

    async fn watch(&self, config: &ResourceConfig, from_resource_version: &str) -> Result<WatchStream, StoreError> {
        let api = self.scoped_api(config.namespace.as_deref());
        let wp = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
        let stream = api
            .watch(&wp, from_resource_version)
            .await
            .map_err(StoreError::from_kube)?;
        Ok(stream
            .filter_map(|item| {
                futures::future::ready(match item {
                    Ok(event) => to_watch_event(event),
                    Err(e) => Some(Err(StoreError::from_kube(e))),
                })
            })
            .boxed())
    }

    async fn get(&self, id: &ResourceIdentity) -> Result<CachedObject, StoreError> {
        let obj = self
            .object_api(id)
            .get(&id.name)
            .await
            .map_err(StoreError::from_kube)?;
        to_cached(obj)
    }

    async fn update(&self, id: &ResourceIdentity, spec: &WebsiteSpec) -> Result<CachedObject, StoreError> {
        let patch = json!({ "spec": spec });
        let obj = self
            .object_api(id)
            .patch(&id.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(StoreError::from_kube)?;
        to_cached(obj)
    }

    async fn update_status(
        &self,
        id: &ResourceIdentity,
        status: &WebsiteStatus,
        expected_resource_version: &str,
    ) -> Result<CachedObject, StoreError> {
        let mut status_value = serde_json::to_value(status)?;
        if status.message.is_none() {
            // Merge patch only removes keys that are explicitly null
            status_value["message"] = serde_json::Value::Null;
        }
        // The API server rejects the patch with 409 if resourceVersion moved on
        let patch = json!({
            "metadata": { "resourceVersion": expected_resource_version },
            "status": status_value,
        });
        let obj = self
            .object_api(id)
            .patch_status(&id.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(StoreError::from_kube)?;
        to_cached(obj)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(name: &str, spec: serde_json::Value) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "example.com/v1",
            "kind": "Website",
            "metadata": { "name": name, "namespace": "web", "resourceVersion": "7" },
            "spec": spec,
        }))
        .unwrap()
    }

    fn valid(name: &str) -> DynamicObject {
        payload(
            name,
            json!({ "domain": "example.org", "replicas": 2, "image": "nginx:1.27", "port": 8080 }),
        )
    }

    fn missing_replicas(name: &str) -> DynamicObject {
        payload(name, json!({ "domain": "example.org", "image": "nginx:1.27", "port": 8080 }))
    }

    #[test]
    fn test_list_skips_malformed_objects() {
        let objects = convert_listed(vec![valid("blog"), missing_replicas("broken"), valid("shop")]);

        let names: Vec<_> = objects.iter().map(|o| o.identity.name.as_str()).collect();
        assert_eq!(names, vec!["blog", "shop"]);
        assert_eq!(objects[0].spec.replicas, 2);
        assert_eq!(objects[0].resource_version, "7");
    }

    #[test]
    fn test_watch_skips_malformed_objects() {
        assert!(to_watch_event(kube::api::WatchEvent::Modified(missing_replicas("broken"))).is_none());
        match to_watch_event(kube::api::WatchEvent::Added(valid("blog"))) {
            Some(Ok(WatchEvent::Added(obj))) => assert_eq!(obj.identity, ResourceIdentity::new("web", "blog")),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_watch_error_codes() {
        let status = |code: u16| kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "watch failed".to_string(),
            reason: String::new(),
            code,
        };
        assert!(matches!(
            to_watch_event(kube::api::WatchEvent::Error(status(410))),
            Some(Err(StoreError::Gone(_)))
        ));
        assert!(matches!(
            to_watch_event(kube::api::WatchEvent::Error(status(500))),
            Some(Err(StoreError::Transient(_)))
        ));
    }
}
