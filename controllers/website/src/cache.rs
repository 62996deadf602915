//! Event cache.
//!
//! Mirrors the watched Website objects locally with a list-then-watch loop
//! and forwards every applied change to the delta detector.
//!
//! Whenever a watch ends, for whatever reason, the cache lists again and
//! diffs the fresh list against what it holds, so deletions missed while
//! disconnected still surface as `Delete` events.

use crate::backoff::ExponentialBackoff;
use crate::delta::{RawEvent, RawEventKind};
use crate::error::ControllerError;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use store_client::{
    CachedObject, ResourceConfig, ResourceIdentity, StoreClientTrait, StoreError, WatchEvent,
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Retry behaviour of the list-watch loop.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Consecutive failed first lists before giving up
    pub initial_list_retries: u32,
    /// Delay between failed lists or watch opens
    pub backoff: ExponentialBackoff,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            initial_list_retries: 5,
            backoff: ExponentialBackoff::default(),
        }
    }
}

/// How a watch stream ended.
enum WatchEnd {
    /// Stream closed or expired; relist right away
    Closed,
    /// Watch could not be opened or the stream errored; relist after a delay
    Failed(StoreError),
    /// Shutdown requested or the detector went away
    Stopped,
}

/// Local mirror of the watched Website objects.
pub struct EventCache {
    store: Arc<dyn StoreClientTrait>,
    resource: ResourceConfig,
    config: CacheConfig,
    objects: RwLock<HashMap<ResourceIdentity, CachedObject>>,
    synced: watch::Sender<bool>,
}

impl std::fmt::Debug for EventCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventCache")
            .field("resource", &self.resource)
            .field("objects", &self.len())
            .field("synced", &self.has_synced())
            .finish_non_exhaustive()
    }
}

impl EventCache {
    /// Creates an empty, unsynced cache for `resource`.
    #[must_use]
    pub fn new(store: Arc<dyn StoreClientTrait>, resource: ResourceConfig, config: CacheConfig) -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            store,
            resource,
            config,
            objects: RwLock::new(HashMap::new()),
            synced,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ResourceIdentity, CachedObject>> {
        self.objects.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ResourceIdentity, CachedObject>> {
        self.objects.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the first list has been fully applied.
    #[must_use]
    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Waits until the cache has synced.
    ///
    /// Returns `false` if `shutdown` fires first.
    pub async fn wait_for_sync(&self, mut shutdown: watch::Receiver<bool>) -> bool {
        let mut synced = self.synced.subscribe();
        tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => false,
            result = synced.wait_for(|synced| *synced) => result.is_ok(),
        }
    }

    /// Last-known snapshot of `id`.
    #[must_use]
    pub fn get(&self, id: &ResourceIdentity) -> Option<CachedObject> {
        self.read().get(id).cloned()
    }

    /// Number of cached objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether the cache holds no objects.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Identities of all cached objects.
    #[must_use]
    pub fn keys(&self) -> Vec<ResourceIdentity> {
        self.read().keys().cloned().collect()
    }

    /// Replaces the whole map with a fresh list.
    ///
    /// Returns the events to forward: listed objects in list order, then
    /// deletes for identities the list no longer contains.
    fn replace(&self, listed: Vec<CachedObject>) -> Vec<RawEvent> {
        let mut objects = self.write();
        let mut previous = std::mem::take(&mut *objects);
        let mut forwarded = Vec::with_capacity(listed.len());

        for obj in listed {
            let kind = if previous.remove(&obj.identity).is_some() {
                RawEventKind::Update
            } else {
                RawEventKind::Add
            };
            objects.insert(obj.identity.clone(), obj.clone());
            forwarded.push(RawEvent::new(kind, obj));
        }

        let mut gone: Vec<_> = previous.into_values().collect();
        gone.sort_by(|a, b| a.identity.cmp(&b.identity));
        for obj in gone {
            debug!("{} vanished while the watch was down", obj.identity);
            forwarded.push(RawEvent::new(RawEventKind::Delete, obj));
        }
        forwarded
    }

    /// Applies one watch event, returning the event to forward.
    fn apply(&self, event: WatchEvent) -> Option<RawEvent> {
        let mut objects = self.write();
        match event {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) => {
                let kind = if objects.insert(obj.identity.clone(), obj.clone()).is_some() {
                    RawEventKind::Update
                } else {
                    RawEventKind::Add
                };
                Some(RawEvent::new(kind, obj))
            }
            WatchEvent::Deleted(obj) => {
                objects.remove(&obj.identity);
                Some(RawEvent::new(RawEventKind::Delete, obj))
            }
            WatchEvent::Bookmark { .. } => None,
        }
    }

    /// Runs the list-watch loop until `shutdown` fires.
    ///
    /// # Errors
    ///
    /// Returns `InitialSync` if the first list fails `initial_list_retries`
    /// times in a row. Failures after the first sync are retried forever.
    pub async fn run(
        self: Arc<Self>,
        events: mpsc::Sender<RawEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ControllerError> {
        info!("Starting event cache for {}", self.resource);
        let mut backoff = self.config.backoff.clone();
        let mut failures: u32 = 0;

        loop {
            let listed = tokio::select! {
                biased;
                _ = shutdown.wait_for(|stop| *stop) => break,
                listed = self.store.list(&self.resource) => listed,
            };

            let resource_version = match listed {
                Ok((objects, resource_version)) => {
                    failures = 0;
                    let count = objects.len();
                    let forwarded = self.replace(objects);
                    if !self.has_synced() {
                        self.synced.send_replace(true);
                        info!("Synced {} with {} objects at version {}", self.resource, count, resource_version);
                    } else {
                        debug!("Relisted {} with {} objects at version {}", self.resource, count, resource_version);
                    }
                    if !forward(&events, forwarded).await {
                        break;
                    }
                    resource_version
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    if !self.has_synced() && failures >= self.config.initial_list_retries {
                        error!("Giving up on initial list of {} after {} attempts: {}", self.resource, failures, e);
                        return Err(ControllerError::InitialSync(format!(
                            "listing {} failed {} times: {}",
                            self.resource, failures, e
                        )));
                    }
                    let delay = backoff.next_backoff();
                    warn!("Failed to list {} (attempt {}): {}, retrying in {:?}", self.resource, failures, e, delay);
                    if sleep_or_stop(delay, &mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            match self.watch_from(&resource_version, &events, &mut shutdown, &mut backoff).await {
                WatchEnd::Stopped => break,
                WatchEnd::Closed => {}
                WatchEnd::Failed(e) => {
                    let delay = backoff.next_backoff();
                    warn!("Failed to watch {}: {}, relisting in {:?}", self.resource, e, delay);
                    if sleep_or_stop(delay, &mut shutdown).await {
                        break;
                    }
                }
            }
        }

        info!("Event cache for {} stopped", self.resource);
        Ok(())
    }

    async fn watch_from(
        &self,
        resource_version: &str,
        events: &mpsc::Sender<RawEvent>,
        shutdown: &mut watch::Receiver<bool>,
        backoff: &mut ExponentialBackoff,
    ) -> WatchEnd {
        let mut stream = match self.store.watch(&self.resource, resource_version).await {
            Ok(stream) => stream,
            Err(e) => return WatchEnd::Failed(e),
        };
        let mut resume = resource_version.to_string();
        debug!("Watching {} from version {}", self.resource, resume);

        loop {
            let item = tokio::select! {
                biased;
                _ = shutdown.wait_for(|stop| *stop) => return WatchEnd::Stopped,
                item = stream.next() => item,
            };

            match item {
                None => {
                    debug!("Watch on {} closed at version {}, relisting", self.resource, resume);
                    return WatchEnd::Closed;
                }
                Some(Err(StoreError::Gone(msg))) => {
                    info!("Watch on {} expired at version {} ({}), relisting", self.resource, resume, msg);
                    return WatchEnd::Closed;
                }
                Some(Err(e)) => return WatchEnd::Failed(e),
                Some(Ok(event)) => {
                    // Only a watch that delivers proves the store healthy again
                    backoff.reset();
                    event.resource_version().clone_into(&mut resume);
                    if let Some(raw) = self.apply(event) {
                        if events.send(raw).await.is_err() {
                            return WatchEnd::Stopped;
                        }
                    }
                }
            }
        }
    }
}

/// Sends `batch` in order. Returns `false` if the receiver is gone.
async fn forward(events: &mpsc::Sender<RawEvent>, batch: Vec<RawEvent>) -> bool {
    for event in batch {
        if events.send(event).await.is_err() {
            return false;
        }
    }
    true
}

/// Sleeps for `delay`. Returns `true` if `shutdown` fired first.
async fn sleep_or_stop(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        biased;
        _ = shutdown.wait_for(|stop| *stop) => true,
        () = tokio::time::sleep(delay) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{identity, spec};
    use store_client::MockStoreClient;

    struct Harness {
        store: MockStoreClient,
        cache: Arc<EventCache>,
        events: mpsc::Receiver<RawEvent>,
        stop: watch::Sender<bool>,
        task: tokio::task::JoinHandle<Result<(), ControllerError>>,
    }

    fn start(store: &MockStoreClient, config: CacheConfig) -> Harness {
        let cache = Arc::new(EventCache::new(
            Arc::new(store.clone()),
            ResourceConfig::default(),
            config,
        ));
        let (tx, events) = mpsc::channel(64);
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(Arc::clone(&cache).run(tx, stop_rx));
        Harness {
            store: store.clone(),
            cache,
            events,
            stop,
            task,
        }
    }

    async fn next(events: &mut mpsc::Receiver<RawEvent>) -> (RawEventKind, String) {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        (event.kind, event.object.identity.name)
    }

    async fn watching(store: &MockStoreClient) {
        while store.open_watches() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_initial_list_then_watch() {
        let store = MockStoreClient::new();
        store.create(&identity("a"), spec(1));
        let mut h = start(&store, CacheConfig::default());

        assert_eq!(next(&mut h.events).await, (RawEventKind::Add, "a".to_string()));
        assert!(h.cache.wait_for_sync(h.stop.subscribe()).await);
        assert_eq!(h.cache.len(), 1);

        h.store.create(&identity("b"), spec(2));
        assert_eq!(next(&mut h.events).await, (RawEventKind::Add, "b".to_string()));
        assert_eq!(h.cache.get(&identity("b")).unwrap().spec.replicas, 2);

        h.store.delete(&identity("a"));
        assert_eq!(next(&mut h.events).await, (RawEventKind::Delete, "a".to_string()));
        assert_eq!(h.cache.keys(), vec![identity("b")]);

        h.stop.send(true).unwrap();
        assert!(h.task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_relist_detects_deletions_missed_while_disconnected() {
        let store = MockStoreClient::new();
        store.create(&identity("a"), spec(1));
        store.create(&identity("b"), spec(1));
        let mut h = start(&store, CacheConfig::default());
        next(&mut h.events).await;
        next(&mut h.events).await;
        watching(&h.store).await;

        // Lose the connection, then delete before the watch comes back
        h.store.fail_watches(1);
        h.store.close_watches();
        h.store.delete(&identity("a"));

        // Relist re-delivers b and reports a as deleted
        let mut seen = Vec::new();
        while !seen.contains(&(RawEventKind::Delete, "a".to_string())) {
            seen.push(next(&mut h.events).await);
        }
        assert!(h.cache.get(&identity("a")).is_none());
        assert!(h.cache.get(&identity("b")).is_some());
        assert!(h.store.list_calls() >= 2);

        h.stop.send(true).unwrap();
        assert!(h.task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_expired_watch_relists() {
        let store = MockStoreClient::new();
        store.create(&identity("a"), spec(1));
        let mut h = start(&store, CacheConfig::default());
        next(&mut h.events).await;
        watching(&h.store).await;

        h.store.expire_watches();
        assert_eq!(next(&mut h.events).await, (RawEventKind::Update, "a".to_string()));
        assert_eq!(h.store.list_calls(), 2);

        h.stop.send(true).unwrap();
        assert!(h.task.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_erroring_watch_streams_back_off() {
        let store = MockStoreClient::new();
        store.create(&identity("a"), spec(1));
        store.break_watch_streams(3);
        let started = tokio::time::Instant::now();
        let h = start(&store, CacheConfig::default());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(h.store.list_calls(), 1);

        // Relists after 1s, 2s and 4s; the fourth watch stays open
        watching(&h.store).await;
        assert_eq!(h.store.list_calls(), 4);
        assert!(started.elapsed() >= Duration::from_secs(7));

        h.stop.send(true).unwrap();
        assert!(h.task.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_resets_once_watch_delivers() {
        let store = MockStoreClient::new();
        store.create(&identity("a"), spec(1));
        store.break_watch_streams(2);
        let mut h = start(&store, CacheConfig::default());
        watching(&h.store).await;
        assert_eq!(h.store.list_calls(), 3);
        while h.events.try_recv().is_ok() {}

        h.store.create(&identity("b"), spec(1));
        assert_eq!(next(&mut h.events).await, (RawEventKind::Add, "b".to_string()));

        // The next broken stream waits the base delay again, not 4s
        h.store.break_watch_streams(1);
        h.store.close_watches();
        let broken = tokio::time::Instant::now();
        watching(&h.store).await;
        assert_eq!(h.store.list_calls(), 5);
        assert!(broken.elapsed() < Duration::from_secs(2));

        h.stop.send(true).unwrap();
        assert!(h.task.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_list_retries_then_syncs() {
        let store = MockStoreClient::new();
        store.create(&identity("a"), spec(1));
        store.fail_lists(2);
        let h = start(&store, CacheConfig::default());

        assert!(h.cache.wait_for_sync(h.stop.subscribe()).await);
        assert_eq!(h.store.list_calls(), 3);

        h.stop.send(true).unwrap();
        assert!(h.task.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_list_gives_up() {
        let store = MockStoreClient::new();
        store.fail_lists(10);
        let config = CacheConfig {
            initial_list_retries: 3,
            ..CacheConfig::default()
        };
        let h = start(&store, config);

        let result = h.task.await.unwrap();
        assert!(matches!(result, Err(ControllerError::InitialSync(_))));
        assert!(!h.cache.has_synced());
        assert_eq!(h.store.list_calls(), 3);
    }

    #[tokio::test]
    async fn test_shutdown_before_sync() {
        let store = MockStoreClient::new();
        store.fail_lists(100);
        let h = start(&store, CacheConfig::default());

        h.stop.send(true).unwrap();
        assert!(!h.cache.wait_for_sync(h.stop.subscribe()).await);
        assert!(h.task.await.unwrap().is_ok());
    }
}
