//! Main controller implementation.
//!
//! This module contains the `Controller` struct that wires the event cache,
//! delta detector, work queue and reconcile workers together:
//!
//! - Event cache: list-then-watch mirror of all Website objects
//! - Delta detector: classifies cache events and feeds the queue
//! - Workers: a fixed pool draining the queue, started once the cache has synced

use crate::cache::{CacheConfig, EventCache};
use crate::config::ControllerConfig;
use crate::delta::DeltaDetector;
use crate::error::ControllerError;
use crate::queue::WorkQueue;
use crate::reconciler::Reconciler;
use kube::Client;
use std::sync::Arc;
use store_client::{
    DeploymentWorkloads, ResourceIdentity, StoreClient, StoreClientTrait, WorkloadClientTrait,
};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

/// Capacity of the cache to detector channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Main controller for Website resources.
pub struct Controller {
    config: ControllerConfig,
    cache: Arc<EventCache>,
    queue: Arc<WorkQueue>,
    reconciler: Arc<Reconciler>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("config", &self.config)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Creates a controller talking to the cluster from the ambient kubeconfig.
    ///
    /// # Errors
    ///
    /// Returns `Kube` if no client configuration can be loaded.
    pub async fn new(config: ControllerConfig) -> Result<Self, ControllerError> {
        info!("Initializing Website Controller");

        let kube_client = Client::try_default().await?;
        let store = StoreClient::new(kube_client.clone(), &config.resource);
        let workloads = DeploymentWorkloads::new(kube_client);

        Ok(Self::with_clients(config, Arc::new(store), Arc::new(workloads)))
    }

    /// Creates a controller over explicit store and workload clients.
    pub fn with_clients(
        config: ControllerConfig,
        store: Arc<dyn StoreClientTrait>,
        workloads: Arc<dyn WorkloadClientTrait>,
    ) -> Self {
        let cache = Arc::new(EventCache::new(
            Arc::clone(&store),
            config.resource.clone(),
            CacheConfig {
                initial_list_retries: config.initial_list_retries,
                backoff: config.backoff(),
            },
        ));
        let queue = Arc::new(WorkQueue::new(config.backoff()));
        let reconciler = Arc::new(Reconciler::new(store, workloads, &config));

        Self {
            config,
            cache,
            queue,
            reconciler,
        }
    }

    /// Runs the controller until `shutdown` is set.
    ///
    /// On shutdown, in-flight reconciles finish, pending queue entries are
    /// dropped, and every task is awaited before returning.
    ///
    /// # Errors
    ///
    /// Returns `InitialSync` if the cache never completes its first list, or
    /// `Watch` if a background task panics.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), ControllerError> {
        info!("Website Controller running for {}", self.config.resource);

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let mut cache_task = tokio::spawn(Arc::clone(&self.cache).run(events_tx, shutdown.clone()));
        let detector_task = tokio::spawn(DeltaDetector::new().run(
            events_rx,
            Arc::clone(&self.queue),
            shutdown.clone(),
        ));

        // Workers must not see an identity before the cache holds a full list
        let synced = tokio::select! {
            synced = self.cache.wait_for_sync(shutdown.clone()) => Ok(synced),
            result = &mut cache_task => Err(result),
        };
        let synced = match synced {
            Ok(synced) => synced,
            Err(result) => return self.stop(Vec::new(), detector_task, result).await,
        };

        let mut workers = Vec::with_capacity(self.config.workers);
        if synced {
            info!("Cache synced, starting {} workers", self.config.workers);
            for worker in 0..self.config.workers {
                let queue = Arc::clone(&self.queue);
                let reconciler = Arc::clone(&self.reconciler);
                workers.push(tokio::spawn(run_worker(worker, queue, reconciler)));
            }

            // The select yields a plain value so no watch guard outlives it
            let exited = tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => None,
                result = &mut cache_task => Some(result),
            };
            if let Some(result) = exited {
                warn!("Event cache exited before shutdown was requested");
                return self.stop(workers, detector_task, result).await;
            }
        }

        info!("Shutting down Website Controller");
        let result = self.stop(workers, detector_task, cache_task.await).await;
        info!("Website Controller stopped");
        result
    }

    /// Shuts the queue down and awaits every task.
    async fn stop(
        &self,
        workers: Vec<JoinHandle<()>>,
        detector: JoinHandle<()>,
        cache: Result<Result<(), ControllerError>, JoinError>,
    ) -> Result<(), ControllerError> {
        self.queue.shut_down();
        for (worker, handle) in workers.into_iter().enumerate() {
            task_result(&format!("Worker {worker}"), handle.await)?;
        }
        task_result("Delta detector", detector.await)?;
        task_result("Event cache", cache)?
    }
}

fn task_result<T>(name: &str, joined: Result<T, JoinError>) -> Result<T, ControllerError> {
    joined.map_err(|e| ControllerError::Watch(format!("{} panicked: {}", name, e)))
}

/// Drains the queue until it is shut down.
async fn run_worker(worker: usize, queue: Arc<WorkQueue>, reconciler: Arc<Reconciler>) {
    debug!("Worker {} started", worker);
    while let Some(id) = queue.get().await {
        process(&queue, &reconciler, &id).await;
        queue.done(&id);
    }
    debug!("Worker {} stopped", worker);
}

/// Reconciles one identity and applies the retry policy to the outcome.
async fn process(queue: &Arc<WorkQueue>, reconciler: &Reconciler, id: &ResourceIdentity) {
    match reconciler.reconcile(id).await {
        Ok(action) => {
            queue.forget(id);
            if let Some(delay) = action.requeue_after() {
                debug!("Requeueing {} in {:?}", id, delay);
                queue.add_after(id.clone(), delay);
            }
        }
        Err(e) if e.is_transient() => {
            let delay = queue.add_rate_limited(id.clone());
            warn!(
                "Reconciliation of {} failed (attempt {}): {}, retrying in {:?}",
                id,
                queue.num_requeues(id),
                e,
                delay
            );
        }
        Err(e) => {
            queue.forget(id);
            error!("Reconciliation of {} failed: {}", id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{identity, spec};
    use crds::WebsitePhase;
    use std::time::Duration;
    use store_client::{MockStoreClient, MockWorkloads, StoreError};

    struct Running {
        store: MockStoreClient,
        workloads: MockWorkloads,
        stop: watch::Sender<bool>,
        task: JoinHandle<Result<(), ControllerError>>,
    }

    fn start(store: &MockStoreClient, workloads: &MockWorkloads, config: ControllerConfig) -> Running {
        let controller = Controller::with_clients(
            config,
            Arc::new(store.clone()),
            Arc::new(workloads.clone()),
        );
        let (stop, stop_rx) = watch::channel(false);
        Running {
            store: store.clone(),
            workloads: workloads.clone(),
            stop,
            task: tokio::spawn(controller.run(stop_rx)),
        }
    }

    async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
        for _ in 0..1200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("timed out waiting for {what}");
    }

    impl Running {
        async fn shut_down(self) -> Result<(), ControllerError> {
            self.stop.send(true).unwrap();
            self.task.await.unwrap()
        }

        fn phase(&self, name: &str) -> Option<WebsitePhase> {
            self.store.object(&identity(name)).map(|o| o.status.phase)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_websites_converge_to_available() {
        let store = MockStoreClient::new();
        let workloads = MockWorkloads::new();
        store.create(&identity("blog"), spec(2));
        store.create(&identity("shop"), spec(0));
        let r = start(&store, &workloads, ControllerConfig::default());

        eventually("workloads", || workloads.ensure_calls() == 2).await;
        eventually("shop available", || r.phase("shop") == Some(WebsitePhase::Available)).await;
        assert_eq!(r.phase("blog"), Some(WebsitePhase::Pending));

        // Progress is observed through the periodic requeue, not events
        r.workloads.set_available(&identity("blog"), 1);
        eventually("blog progressing", || r.phase("blog") == Some(WebsitePhase::Progressing)).await;
        r.workloads.set_available(&identity("blog"), 2);
        eventually("blog available", || r.phase("blog") == Some(WebsitePhase::Available)).await;

        assert_eq!(r.workloads.mutations(), 2);
        assert!(r.shut_down().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_redelivery_does_not_mutate() {
        let store = MockStoreClient::new();
        let workloads = MockWorkloads::new();
        store.create(&identity("blog"), spec(0));
        let r = start(&store, &workloads, ControllerConfig::default());
        eventually("blog available", || r.phase("blog") == Some(WebsitePhase::Available)).await;
        tokio::time::sleep(Duration::from_secs(30)).await;

        let mutations = r.workloads.mutations();
        let status_calls = r.store.update_status_calls();
        let gets = r.store.get_calls();
        for _ in 0..5 {
            r.store.redeliver(&identity("blog"));
        }
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(r.workloads.mutations(), mutations);
        assert_eq!(r.store.update_status_calls(), status_calls);
        // Re-deliveries of a dispatched version never reach the reconciler
        assert_eq!(r.store.get_calls(), gets);
        assert!(r.shut_down().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deletion_releases_workload_once() {
        let store = MockStoreClient::new();
        let workloads = MockWorkloads::new();
        store.create(&identity("blog"), spec(0));
        let r = start(&store, &workloads, ControllerConfig::default());
        eventually("blog available", || r.phase("blog") == Some(WebsitePhase::Available)).await;
        tokio::time::sleep(Duration::from_secs(30)).await;

        r.store.delete(&identity("blog"));
        eventually("release", || r.workloads.release_calls() > 0).await;
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(r.workloads.release_calls(), 1);
        assert!(r.workloads.workload(&identity("blog")).is_none());
        assert!(r.shut_down().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deleting_pending_website_releases_once() {
        let store = MockStoreClient::new();
        let workloads = MockWorkloads::new();
        store.create(&identity("blog"), spec(1));
        let r = start(&store, &workloads, ControllerConfig::default());
        // Provisioned but never available, so a progress requeue is pending
        eventually("workload", || r.workloads.ensure_calls() == 1).await;

        r.store.delete(&identity("blog"));
        eventually("release", || r.workloads.release_calls() > 0).await;
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(r.workloads.release_calls(), 1);
        assert!(r.workloads.workload(&identity("blog")).is_none());
        assert!(r.shut_down().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deleting_retrying_website_releases_once() {
        let store = MockStoreClient::new();
        let workloads = MockWorkloads::new();
        workloads.fail_next(StoreError::Transient("apiserver unavailable".to_string()));
        store.create(&identity("blog"), spec(1));
        let r = start(&store, &workloads, ControllerConfig::default());
        eventually("first attempt", || r.workloads.ensure_calls() == 1).await;

        // Deleted while the rate-limited retry is still waiting
        r.store.delete(&identity("blog"));
        eventually("release", || r.workloads.release_calls() > 0).await;
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(r.workloads.release_calls(), 1);
        assert_eq!(r.workloads.ensure_calls(), 1);
        assert!(r.shut_down().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_available_website_resyncs_after_drift() {
        let store = MockStoreClient::new();
        let workloads = MockWorkloads::new();
        store.create(&identity("blog"), spec(2));
        let config = ControllerConfig {
            resync_interval: Duration::from_secs(60),
            ..ControllerConfig::default()
        };
        let r = start(&store, &workloads, config);
        eventually("workload", || r.workloads.ensure_calls() == 1).await;
        r.workloads.set_available(&identity("blog"), 2);
        eventually("blog available", || r.phase("blog") == Some(WebsitePhase::Available)).await;

        // Pods crash; the Website itself does not change
        r.workloads.set_available(&identity("blog"), 0);
        eventually("blog pending", || r.phase("blog") == Some(WebsitePhase::Pending)).await;

        // A deleted Deployment is provisioned again on a later pass
        r.workloads.remove(&identity("blog"));
        eventually("workload again", || r.workloads.ensure_calls() == 2).await;
        assert!(r.shut_down().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_reconcile_before_sync() {
        let store = MockStoreClient::new();
        let workloads = MockWorkloads::new();
        store.create(&identity("blog"), spec(1));
        store.fail_lists(3);
        let r = start(&store, &workloads, ControllerConfig::default());

        // First list failed and the cache is backing off
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(r.store.list_calls(), 1);
        assert_eq!(r.store.get_calls(), 0);
        assert_eq!(r.workloads.mutations(), 0);

        eventually("workload", || r.workloads.ensure_calls() == 1).await;
        assert_eq!(r.store.list_calls(), 4);
        assert!(r.shut_down().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_sync_failure_is_fatal() {
        let store = MockStoreClient::new();
        let workloads = MockWorkloads::new();
        store.fail_lists(100);
        let config = ControllerConfig {
            initial_list_retries: 3,
            ..ControllerConfig::default()
        };
        let r = start(&store, &workloads, config);

        let result = r.task.await.unwrap();
        assert!(matches!(result, Err(ControllerError::InitialSync(_))));
        assert_eq!(store.get_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_retry_with_backoff() {
        let store = MockStoreClient::new();
        let workloads = MockWorkloads::new();
        workloads.fail_next(StoreError::Transient("apiserver unavailable".to_string()));
        workloads.fail_next(StoreError::Transient("apiserver unavailable".to_string()));
        store.create(&identity("blog"), spec(1));
        let r = start(&store, &workloads, ControllerConfig::default());

        eventually("first attempt", || r.workloads.ensure_calls() == 1).await;
        let first = tokio::time::Instant::now();
        eventually("workload", || r.workloads.workload(&identity("blog")).is_some()).await;

        // Retries after 1s then 2s
        assert_eq!(r.workloads.ensure_calls(), 3);
        assert!(first.elapsed() >= Duration::from_secs(2));
        assert!(r.shut_down().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_loss_recovers_missed_deletion() {
        let store = MockStoreClient::new();
        let workloads = MockWorkloads::new();
        store.create(&identity("blog"), spec(0));
        let r = start(&store, &workloads, ControllerConfig::default());
        eventually("blog available", || r.phase("blog") == Some(WebsitePhase::Available)).await;
        eventually("watch", || r.store.open_watches() == 1).await;

        r.store.fail_watches(1);
        r.store.close_watches();
        r.store.delete(&identity("blog"));

        eventually("release", || r.workloads.release_calls() == 1).await;
        assert!(r.shut_down().await.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_drains_tasks() {
        let store = MockStoreClient::new();
        let workloads = MockWorkloads::new();
        let r = start(&store, &workloads, ControllerConfig::default());
        eventually("watch", || store.open_watches() == 1).await;

        assert!(r.shut_down().await.is_ok());
        assert_eq!(store.open_watches(), 0);
    }
}
