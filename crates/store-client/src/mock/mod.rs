//! In-memory clients for unit testing
//!
//! These mocks implement `StoreClientTrait` and `WorkloadClientTrait`
//! without a running API server. They count calls and can be told to fail,
//! so tests can assert on exactly which store mutations a reconcile made.
//!
//! The mock is organized into:
//! - `store.rs` - Website objects, list/watch, optimistic status writes
//! - `workloads.rs` - provisioned workloads and their availability

mod store;
mod workloads;

pub use store::MockStoreClient;
pub use workloads::MockWorkloads;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks a mutex, recovering the data if a panicking test poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
