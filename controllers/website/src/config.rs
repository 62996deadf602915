//! Controller configuration.
//!
//! Loaded from environment variables at startup and passed explicitly to
//! every component.

use crate::backoff::ExponentialBackoff;
use crate::error::ControllerError;
use std::str::FromStr;
use std::time::Duration;
use store_client::ResourceConfig;

/// Upper bound on the worker pool size.
pub const MAX_WORKERS: usize = 10;

/// Runtime settings for the Website Controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Watched kind and namespace
    pub resource: ResourceConfig,
    /// Number of reconcile workers (1..=10)
    pub workers: usize,
    /// First retry delay for transient failures
    pub backoff_base: Duration,
    /// Cap on retry delays
    pub backoff_max: Duration,
    /// Attempts at the first list before giving up
    pub initial_list_retries: u32,
    /// Requeue interval while replicas are still coming up
    pub progress_requeue: Duration,
    /// Requeue interval of available Websites, to catch workload drift
    pub resync_interval: Duration,
    /// In-place retries of a reconcile after a status write conflict
    pub status_conflict_retries: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            resource: ResourceConfig::default(),
            workers: 2,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(300),
            initial_list_retries: 5,
            progress_requeue: Duration::from_secs(10),
            resync_interval: Duration::from_secs(300),
            status_conflict_retries: 3,
        }
    }
}

fn parse<T: FromStr>(key: &str, value: Option<String>, default: T) -> Result<T, ControllerError> {
    match value {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| {
            ControllerError::InvalidConfig(format!("{key} must be a non-negative integer, got '{raw}'"))
        }),
    }
}

/// Parses a delay in whole seconds; zero is rejected.
fn parse_secs(key: &str, value: Option<String>, default: Duration) -> Result<Duration, ControllerError> {
    let secs = parse(key, value, default.as_secs())?;
    if secs == 0 {
        return Err(ControllerError::InvalidConfig(format!("{key} must be greater than zero")));
    }
    Ok(Duration::from_secs(secs))
}

impl ControllerConfig {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if a numeric variable does not parse or a
    /// delay is zero.
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if a numeric variable does not parse or a
    /// delay is zero.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ControllerError> {
        let defaults = Self::default();
        let resource = ResourceConfig {
            group: lookup("WEBSITE_GROUP").unwrap_or(defaults.resource.group),
            version: lookup("WEBSITE_VERSION").unwrap_or(defaults.resource.version),
            kind: defaults.resource.kind,
            resource: lookup("WEBSITE_RESOURCE").unwrap_or(defaults.resource.resource),
            namespace: lookup("WATCH_NAMESPACE").filter(|ns| !ns.trim().is_empty()),
        };

        let workers: usize = parse("WORKERS", lookup("WORKERS"), defaults.workers)?;

        Ok(Self {
            resource,
            workers: workers.clamp(1, MAX_WORKERS),
            backoff_base: parse_secs("BACKOFF_BASE_SECS", lookup("BACKOFF_BASE_SECS"), defaults.backoff_base)?,
            backoff_max: parse_secs("BACKOFF_MAX_SECS", lookup("BACKOFF_MAX_SECS"), defaults.backoff_max)?,
            initial_list_retries: parse(
                "INITIAL_LIST_RETRIES",
                lookup("INITIAL_LIST_RETRIES"),
                defaults.initial_list_retries,
            )?
            .max(1),
            progress_requeue: parse_secs(
                "PROGRESS_REQUEUE_SECS",
                lookup("PROGRESS_REQUEUE_SECS"),
                defaults.progress_requeue,
            )?,
            resync_interval: parse_secs("RESYNC_SECS", lookup("RESYNC_SECS"), defaults.resync_interval)?,
            status_conflict_retries: parse(
                "STATUS_CONFLICT_RETRIES",
                lookup("STATUS_CONFLICT_RETRIES"),
                defaults.status_conflict_retries,
            )?,
        })
    }

    /// Backoff shared by the work queue and the list-watch loop.
    #[must_use]
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(self.backoff_base, self.backoff_max)
    }
}
