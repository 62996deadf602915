//! In-memory resource store

use super::lock;
use crate::error::StoreError;
use crate::models::{CachedObject, ResourceConfig, ResourceIdentity, WatchEvent};
use crate::store_trait::{StoreClientTrait, WatchStream};
use crds::{WebsiteSpec, WebsiteStatus};
use futures::StreamExt;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

type WatchSender = mpsc::UnboundedSender<Result<WatchEvent, StoreError>>;

#[derive(Default)]
struct StoreState {
    objects: BTreeMap<ResourceIdentity, CachedObject>,
    last_resource_version: u64,
    // Every change ever made, so a watch can resume from any version
    history: Vec<(u64, WatchEvent)>,
    watchers: Vec<(Option<String>, WatchSender)>,
    list_failures: u32,
    watch_failures: u32,
    broken_streams: u32,
    get_failures: VecDeque<StoreError>,
    status_conflicts: u32,
    list_calls: usize,
    watch_calls: usize,
    get_calls: usize,
    update_calls: usize,
    update_status_calls: usize,
    status_writes: usize,
}

impl StoreState {
    fn next_resource_version(&mut self) -> u64 {
        self.last_resource_version += 1;
        self.last_resource_version
    }

    fn record(&mut self, version: u64, event: WatchEvent) {
        let namespace = event_namespace(&event).map(str::to_string);
        self.watchers.retain(|(filter, tx)| {
            if !in_scope(filter.as_deref(), namespace.as_deref()) {
                return !tx.is_closed();
            }
            tx.send(Ok(event.clone())).is_ok()
        });
        self.history.push((version, event));
    }

    fn store(&mut self, mut obj: CachedObject, added: bool) -> CachedObject {
        let version = self.next_resource_version();
        obj.resource_version = version.to_string();
        self.objects.insert(obj.identity.clone(), obj.clone());
        let event = if added {
            WatchEvent::Added(obj.clone())
        } else {
            WatchEvent::Modified(obj.clone())
        };
        self.record(version, event);
        obj
    }
}

fn event_namespace(event: &WatchEvent) -> Option<&str> {
    match event {
        WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj) => {
            Some(&obj.identity.namespace)
        }
        WatchEvent::Bookmark { .. } => None,
    }
}

fn in_scope(filter: Option<&str>, namespace: Option<&str>) -> bool {
    match (filter, namespace) {
        (Some(filter), Some(ns)) => filter == ns,
        _ => true,
    }
}

/// Mock resource store for testing
///
/// Resource versions are a single counter shared by all objects, as in
/// the Kubernetes API server.
#[derive(Clone, Default)]
pub struct MockStoreClient {
    inner: Arc<Mutex<StoreState>>,
}

impl std::fmt::Debug for MockStoreClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.inner);
        f.debug_struct("MockStoreClient")
            .field("objects", &state.objects.len())
            .field("last_resource_version", &state.last_resource_version)
            .finish_non_exhaustive()
    }
}

impl MockStoreClient {
    /// Create an empty mock store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an object (for test setup), emitting an Added event
    pub fn create(&self, id: &ResourceIdentity, spec: WebsiteSpec) -> CachedObject {
        let obj = CachedObject {
            identity: id.clone(),
            spec,
            status: WebsiteStatus::default(),
            resource_version: String::new(),
        };
        lock(&self.inner).store(obj, true)
    }

    /// Delete an object, emitting a Deleted event with its final state
    pub fn delete(&self, id: &ResourceIdentity) -> Option<CachedObject> {
        let mut state = lock(&self.inner);
        let mut obj = state.objects.remove(id)?;
        let version = state.next_resource_version();
        obj.resource_version = version.to_string();
        state.record(version, WatchEvent::Deleted(obj.clone()));
        Some(obj)
    }

    /// Re-deliver the current object unchanged, as a resync would
    pub fn redeliver(&self, id: &ResourceIdentity) {
        let mut state = lock(&self.inner);
        if let Some(obj) = state.objects.get(id).cloned() {
            let version = state.last_resource_version;
            state.record(version, WatchEvent::Modified(obj));
        }
    }

    /// Current state of an object
    #[must_use]
    pub fn object(&self, id: &ResourceIdentity) -> Option<CachedObject> {
        lock(&self.inner).objects.get(id).cloned()
    }

    /// Fail the next `n` list calls with a transient error
    pub fn fail_lists(&self, n: u32) {
        lock(&self.inner).list_failures = n;
    }

    /// Fail the next `n` watch calls with a transient error
    pub fn fail_watches(&self, n: u32) {
        lock(&self.inner).watch_failures = n;
    }

    /// Make the next `n` watches open, then fail on their first item
    pub fn break_watch_streams(&self, n: u32) {
        lock(&self.inner).broken_streams = n;
    }

    /// Fail the next get call with `error`
    pub fn fail_next_get(&self, error: StoreError) {
        lock(&self.inner).get_failures.push_back(error);
    }

    /// Make the next `n` status writes lose a race against a concurrent writer
    pub fn conflict_status_writes(&self, n: u32) {
        lock(&self.inner).status_conflicts = n;
    }

    /// End every open watch stream, as a dropped connection would
    pub fn close_watches(&self) {
        lock(&self.inner).watchers.clear();
    }

    /// End every open watch stream with a resource version expiry
    pub fn expire_watches(&self) {
        let mut state = lock(&self.inner);
        for (_, tx) in state.watchers.drain(..) {
            let _ = tx.send(Err(StoreError::Gone("too old resource version".to_string())));
        }
    }

    /// Number of open watch streams
    #[must_use]
    pub fn open_watches(&self) -> usize {
        lock(&self.inner)
            .watchers
            .iter()
            .filter(|(_, tx)| !tx.is_closed())
            .count()
    }

    /// Number of list calls made
    #[must_use]
    pub fn list_calls(&self) -> usize {
        lock(&self.inner).list_calls
    }

    /// Number of watch calls made
    #[must_use]
    pub fn watch_calls(&self) -> usize {
        lock(&self.inner).watch_calls
    }

    /// Number of get calls made
    #[must_use]
    pub fn get_calls(&self) -> usize {
        lock(&self.inner).get_calls
    }

    /// Number of update_status calls made, including rejected ones
    #[must_use]
    pub fn update_status_calls(&self) -> usize {
        lock(&self.inner).update_status_calls
    }

    /// Number of status writes that were applied
    #[must_use]
    pub fn status_writes(&self) -> usize {
        lock(&self.inner).status_writes
    }

    /// Number of spec updates applied
    #[must_use]
    pub fn update_calls(&self) -> usize {
        lock(&self.inner).update_calls
    }
}

#[async_trait::async_trait]
impl StoreClientTrait for MockStoreClient {
    async fn list(&self, config: &ResourceConfig) -> Result<(Vec<CachedObject>, String), StoreError> {
        let mut state = lock(&self.inner);
        state.list_calls += 1;
        if state.list_failures > 0 {
            state.list_failures -= 1;
            return Err(StoreError::Transient("list failed".to_string()));
        }
        let objects = state
            .objects
            .values()
            .filter(|o| in_scope(config.namespace.as_deref(), Some(&o.identity.namespace)))
            .cloned()
            .collect();
        Ok((objects, state.last_resource_version.to_string()))
    }

    async fn watch(&self, config: &ResourceConfig, from_resource_version: &str) -> Result<WatchStream, StoreError> {
        let mut state = lock(&self.inner);
        state.watch_calls += 1;
        if state.watch_failures > 0 {
            state.watch_failures -= 1;
            return Err(StoreError::Transient("watch failed".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        if state.broken_streams > 0 {
            state.broken_streams -= 1;
            let _ = tx.send(Err(StoreError::Transient("watch stream broken".to_string())));
            return Ok(stream.boxed());
        }

        let from: u64 = from_resource_version.parse().unwrap_or(0);
        for (version, event) in &state.history {
            if *version > from && in_scope(config.namespace.as_deref(), event_namespace(event)) {
                let _ = tx.send(Ok(event.clone()));
            }
        }
        state.watchers.push((config.namespace.clone(), tx));
        Ok(stream.boxed())
    }

    async fn get(&self, id: &ResourceIdentity) -> Result<CachedObject, StoreError> {
        let mut state = lock(&self.inner);
        state.get_calls += 1;
        if let Some(err) = state.get_failures.pop_front() {
            return Err(err);
        }
        state
            .objects
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("websites {id}")))
    }

    async fn update(&self, id: &ResourceIdentity, spec: &WebsiteSpec) -> Result<CachedObject, StoreError> {
        let mut state = lock(&self.inner);
        let mut obj = state
            .objects
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("websites {id}")))?;
        state.update_calls += 1;
        obj.spec = spec.clone();
        Ok(state.store(obj, false))
    }

    async fn update_status(
        &self,
        id: &ResourceIdentity,
        status: &WebsiteStatus,
        expected_resource_version: &str,
    ) -> Result<CachedObject, StoreError> {
        let mut state = lock(&self.inner);
        state.update_status_calls += 1;
        let obj = state
            .objects
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("websites {id}")))?;

        if state.status_conflicts > 0 {
            state.status_conflicts -= 1;
            // Someone else wrote the object first
            state.store(obj, false);
            return Err(StoreError::Conflict(format!("websites {id} has been modified")));
        }
        if obj.resource_version != expected_resource_version {
            return Err(StoreError::Conflict(format!(
                "websites {id}: expected version {expected_resource_version}, found {}",
                obj.resource_version
            )));
        }

        state.status_writes += 1;
        let mut updated = obj;
        updated.status = status.clone();
        Ok(state.store(updated, false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(replicas: i32) -> WebsiteSpec {
        WebsiteSpec {
            domain: "example.org".to_string(),
            replicas,
            image: "nginx".to_string(),
            port: 80,
        }
    }

    #[tokio::test]
    async fn test_watch_replays_history_after_version() {
        let store = MockStoreClient::new();
        let config = ResourceConfig::default();
        let a = ResourceIdentity::new("default", "a");
        let b = ResourceIdentity::new("default", "b");

        store.create(&a, spec(1));
        let (_, rv) = store.list(&config).await.unwrap();
        store.create(&b, spec(1));

        let mut stream = store.watch(&config, &rv).await.unwrap();
        match stream.next().await {
            Some(Ok(WatchEvent::Added(obj))) => assert_eq!(obj.identity, b),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_status_write_requires_current_version() {
        let store = MockStoreClient::new();
        let id = ResourceIdentity::new("default", "a");
        let created = store.create(&id, spec(1));

        store.update(&id, &spec(2)).await.unwrap();
        let result = store
            .update_status(&id, &WebsiteStatus::default(), &created.resource_version)
            .await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));
        assert_eq!(store.status_writes(), 0);
    }

    #[tokio::test]
    async fn test_broken_stream_yields_error_then_ends() {
        let store = MockStoreClient::new();
        store.break_watch_streams(1);

        let mut stream = store.watch(&ResourceConfig::default(), "0").await.unwrap();
        assert!(matches!(stream.next().await, Some(Err(StoreError::Transient(_)))));
        assert!(stream.next().await.is_none());
        assert_eq!(store.open_watches(), 0);
    }

    #[tokio::test]
    async fn test_namespace_scoped_list() {
        let store = MockStoreClient::new();
        store.create(&ResourceIdentity::new("a", "one"), spec(1));
        store.create(&ResourceIdentity::new("b", "two"), spec(1));

        let config = ResourceConfig {
            namespace: Some("a".to_string()),
            ..Default::default()
        };
        let (objects, _) = store.list(&config).await.unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].identity.name, "one");
    }
}
