//! Website Store Client
//!
//! Typed access to the resource store that holds `Website` objects, and to
//! the workloads the controller provisions for them.
//!
//! # Example
//!
//! ```no_run
//! use store_client::{ResourceConfig, StoreClient, StoreClientTrait};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = kube::Client::try_default().await?;
//! let config = ResourceConfig::default();
//! let store = StoreClient::new(client, &config);
//!
//! let (websites, resource_version) = store.list(&config).await?;
//! println!("{} websites at version {}", websites.len(), resource_version);
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **Typed ingest**: raw objects become `CachedObject` once, at this boundary
//! - **Optimistic status writes**: conditioned on the resource version
//! - **Error classification**: `StoreError::is_transient` drives retries
//! - **`test-util`**: in-memory `MockStoreClient` and `MockWorkloads`

pub mod client;
pub mod error;
pub mod models;
#[path = "trait.rs"]
pub mod store_trait;
pub mod workload;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use client::StoreClient;
pub use error::StoreError;
pub use models::*;
pub use store_trait::{StoreClientTrait, WatchStream, WorkloadClientTrait};
pub use workload::DeploymentWorkloads;
#[cfg(any(test, feature = "test-util"))]
pub use mock::{MockStoreClient, MockWorkloads};
