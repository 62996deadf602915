//! Delta detection.
//!
//! Turns the raw event stream coming out of the cache into classified
//! deltas, drops re-deliveries of versions that were already dispatched,
//! and hands identities to the work queue.

use crate::queue::WorkQueue;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use store_client::{CachedObject, ResourceIdentity};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// Kind of change the cache applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawEventKind {
    Add,
    Update,
    Delete,
}

/// Event forwarded from the cache, carrying the object as applied.
///
/// For deletes the object is the last known state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub kind: RawEventKind,
    pub object: CachedObject,
}

impl RawEvent {
    #[must_use]
    pub fn new(kind: RawEventKind, object: CachedObject) -> Self {
        Self { kind, object }
    }
}

/// Classified change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaKind {
    Added,
    Updated,
    Deleted,
}

impl fmt::Display for DeltaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Added => write!(f, "added"),
            Self::Updated => write!(f, "updated"),
            Self::Deleted => write!(f, "deleted"),
        }
    }
}

/// A change that needs reconciling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delta {
    pub kind: DeltaKind,
    pub identity: ResourceIdentity,
    pub resource_version: String,
}

/// Tracks the last dispatched resource version per identity.
#[derive(Debug, Default)]
pub struct DeltaDetector {
    dispatched: HashMap<ResourceIdentity, String>,
}

impl DeltaDetector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Classifies one raw event.
    ///
    /// Returns `None` when the event carries a version already dispatched
    /// for that identity.
    pub fn observe(&mut self, event: RawEvent) -> Option<Delta> {
        let CachedObject {
            identity,
            resource_version,
            ..
        } = event.object;

        let kind = match event.kind {
            RawEventKind::Delete => {
                self.dispatched.remove(&identity);
                DeltaKind::Deleted
            }
            RawEventKind::Add | RawEventKind::Update => {
                let kind = match self.dispatched.get(&identity) {
                    None => DeltaKind::Added,
                    Some(last) if *last == resource_version => return None,
                    Some(_) => DeltaKind::Updated,
                };
                self.dispatched.insert(identity.clone(), resource_version.clone());
                kind
            }
        };

        Some(Delta {
            kind,
            identity,
            resource_version,
        })
    }

    /// Number of identities with a dispatched version.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.dispatched.len()
    }

    /// Drains `events` into `queue` until the channel closes or `shutdown` fires.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<RawEvent>,
        queue: Arc<WorkQueue>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Starting delta detector");
        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.wait_for(|stop| *stop) => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            let identity = event.object.identity.clone();
            match self.observe(event) {
                Some(delta) => {
                    info!("Website {}: {}", delta.kind, delta.identity);
                    if delta.kind == DeltaKind::Deleted {
                        // Requeues scheduled for the live object must not outlive it
                        queue.forget(&delta.identity);
                    }
                    queue.add(delta.identity);
                }
                None => debug!("Skipping already dispatched version of {}", identity),
            }
        }
        info!("Delta detector stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::ExponentialBackoff;
    use crate::test_utils::{cached, identity};

    fn event(kind: RawEventKind, name: &str, rv: &str) -> RawEvent {
        RawEvent::new(kind, cached(&identity(name), rv))
    }

    #[test]
    fn test_first_sighting_is_added() {
        let mut detector = DeltaDetector::new();
        let delta = detector.observe(event(RawEventKind::Update, "a", "1")).unwrap();
        assert_eq!(delta.kind, DeltaKind::Added);
        assert_eq!(delta.resource_version, "1");
    }

    #[test]
    fn test_same_version_is_suppressed() {
        let mut detector = DeltaDetector::new();
        assert!(detector.observe(event(RawEventKind::Add, "a", "1")).is_some());
        assert!(detector.observe(event(RawEventKind::Update, "a", "1")).is_none());
        assert!(detector.observe(event(RawEventKind::Add, "a", "1")).is_none());

        let delta = detector.observe(event(RawEventKind::Update, "a", "2")).unwrap();
        assert_eq!(delta.kind, DeltaKind::Updated);
    }

    #[test]
    fn test_delete_always_passes_and_forgets() {
        let mut detector = DeltaDetector::new();
        detector.observe(event(RawEventKind::Add, "a", "1"));

        let delta = detector.observe(event(RawEventKind::Delete, "a", "1")).unwrap();
        assert_eq!(delta.kind, DeltaKind::Deleted);
        assert_eq!(detector.tracked(), 0);

        // Unknown identity still yields a delete
        let delta = detector.observe(event(RawEventKind::Delete, "b", "7")).unwrap();
        assert_eq!(delta.kind, DeltaKind::Deleted);

        // Recreated under the same name is a fresh add
        let delta = detector.observe(event(RawEventKind::Add, "a", "9")).unwrap();
        assert_eq!(delta.kind, DeltaKind::Added);
    }

    #[tokio::test]
    async fn test_run_feeds_queue_once_per_identity() {
        let queue = Arc::new(WorkQueue::new(ExponentialBackoff::default()));
        let (tx, rx) = mpsc::channel(16);
        let (_stop_tx, stop_rx) = watch::channel(false);

        for rv in ["1", "1", "2", "3"] {
            tx.send(event(RawEventKind::Update, "a", rv)).await.unwrap();
        }
        tx.send(event(RawEventKind::Add, "b", "4")).await.unwrap();
        drop(tx);

        DeltaDetector::new().run(rx, Arc::clone(&queue), stop_rx).await;

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.get().await, Some(identity("a")));
        assert_eq!(queue.get().await, Some(identity("b")));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let queue = Arc::new(WorkQueue::new(ExponentialBackoff::default()));
        let (_tx, rx) = mpsc::channel::<RawEvent>(1);
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = tokio::spawn(DeltaDetector::new().run(rx, queue, stop_rx));
        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
