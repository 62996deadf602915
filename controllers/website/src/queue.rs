//! Deduplicating, rate-limited work queue.
//!
//! Holds identities of Websites that need reconciling. Bursts of events for
//! one identity collapse into a single pending entry, an identity is handed
//! to at most one worker at a time, and an identity re-added while in
//! flight is queued again once the worker calls `done`.

use crate::backoff::ExponentialBackoff;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use store_client::ResourceIdentity;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Default)]
struct QueueState {
    /// Ready entries in FIFO order
    queue: VecDeque<ResourceIdentity>,
    /// Identities needing processing, queued or waiting for `done`
    dirty: HashSet<ResourceIdentity>,
    /// Identities currently held by a worker
    processing: HashSet<ResourceIdentity>,
    /// Earliest next-eligible time of delayed adds
    waiting: HashMap<ResourceIdentity, Instant>,
    /// Consecutive transient failures per identity
    retries: HashMap<ResourceIdentity, u32>,
    shutting_down: bool,
}

/// Work queue shared by the delta detector and the reconcile workers.
#[derive(Debug)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    backoff: ExponentialBackoff,
}

impl WorkQueue {
    /// Creates an empty queue using `backoff` for rate-limited adds.
    #[must_use]
    pub fn new(backoff: ExponentialBackoff) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            backoff,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks `id` as needing reconciliation.
    ///
    /// No-op if it is already pending. If it is in flight it is queued
    /// again when the worker calls `done`.
    pub fn add(&self, id: ResourceIdentity) {
        {
            let mut state = self.lock();
            if state.shutting_down || state.dirty.contains(&id) {
                return;
            }
            state.dirty.insert(id.clone());
            if state.processing.contains(&id) {
                return;
            }
            state.queue.push_back(id);
        }
        self.notify.notify_one();
    }

    /// Waits for the next identity and marks it in flight.
    ///
    /// Returns `None` once the queue has been shut down.
    pub async fn get(&self) -> Option<ResourceIdentity> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent add or shutdown is not missed
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(id) = state.queue.pop_front() {
                    state.dirty.remove(&id);
                    state.processing.insert(id.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(id);
                }
            }
            notified.await;
        }
    }

    /// Marks processing of `id` as finished.
    pub fn done(&self, id: &ResourceIdentity) {
        let requeued = {
            let mut state = self.lock();
            state.processing.remove(id);
            if state.dirty.contains(id) && !state.shutting_down {
                state.queue.push_back(id.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            debug!("Re-queued {} after concurrent update", id);
            self.notify.notify_one();
        }
    }

    /// Adds `id` once `delay` has elapsed.
    ///
    /// Only the earliest pending deadline per identity is kept.
    pub fn add_after(self: &Arc<Self>, id: ResourceIdentity, delay: Duration) {
        if delay.is_zero() {
            self.add(id);
            return;
        }
        let deadline = Instant::now() + delay;
        {
            let mut state = self.lock();
            if state.shutting_down {
                return;
            }
            match state.waiting.get(&id) {
                Some(existing) if *existing <= deadline => return,
                _ => {
                    state.waiting.insert(id.clone(), deadline);
                }
            }
        }

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let current = {
                let mut state = queue.lock();
                if state.waiting.get(&id) == Some(&deadline) {
                    state.waiting.remove(&id);
                    true
                } else {
                    false
                }
            };
            if current {
                queue.add(id);
            }
        });
    }

    /// Schedules a retry of `id` after its backoff delay and bumps its retry count.
    ///
    /// Returns the delay used.
    pub fn add_rate_limited(self: &Arc<Self>, id: ResourceIdentity) -> Duration {
        let delay = {
            let mut state = self.lock();
            let retries = state.retries.entry(id.clone()).or_insert(0);
            let delay = self.backoff.delay_for(*retries);
            *retries = retries.saturating_add(1);
            delay
        };
        self.add_after(id, delay);
        delay
    }

    /// Clears the retry count of `id` and cancels its pending delayed add.
    ///
    /// Called once an outcome for `id` is known, so a requeue or retry
    /// scheduled by an earlier pass never fires after it.
    pub fn forget(&self, id: &ResourceIdentity) {
        let mut state = self.lock();
        state.retries.remove(id);
        state.waiting.remove(id);
    }

    /// Consecutive rate-limited retries of `id`.
    #[must_use]
    pub fn num_requeues(&self, id: &ResourceIdentity) -> u32 {
        self.lock().retries.get(id).copied().unwrap_or(0)
    }

    /// Number of entries ready to be handed out.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Whether no entries are ready.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops the queue: pending entries are dropped and `get` returns `None`.
    pub fn shut_down(&self) {
        {
            let mut state = self.lock();
            state.shutting_down = true;
            state.queue.clear();
            state.waiting.clear();
        }
        self.notify.notify_waiters();
    }

    /// Whether `shut_down` has been called.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }
}
