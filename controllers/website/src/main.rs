//! Website Controller
//!
//! Keeps `Website` custom resources converged with the workloads that serve
//! them:
//! - Event cache: list-then-watch mirror of every Website
//! - Delta detector: turns cache events into deduplicated work
//! - Work queue and workers: reconcile each Website, retrying with backoff
//! - Status reporter: publishes the observed phase back onto the object

mod backoff;
mod cache;
mod config;
mod controller;
mod delta;
mod error;
mod queue;
mod reconciler;
mod status;
#[cfg(test)]
mod test_utils;

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use controller::Controller;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting Website Controller");

    // Load configuration from environment variables
    let config = ControllerConfig::from_env()?;

    info!("Configuration:");
    info!("  Resource: {}", config.resource);
    info!(
        "  Namespace: {}",
        config.resource.namespace.as_deref().unwrap_or("all namespaces")
    );
    info!("  Workers: {}", config.workers);
    info!("  Backoff: {:?} to {:?}", config.backoff_base, config.backoff_max);
    info!("  Progress requeue: {:?}", config.progress_requeue);
    info!("  Resync: {:?}", config.resync_interval);

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        let _ = stop_tx.send(true);
    });

    // Initialize and run controller
    let controller = Controller::new(config).await?;
    controller.run(stop_rx).await?;

    Ok(())
}

/// Resolves on SIGINT or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
