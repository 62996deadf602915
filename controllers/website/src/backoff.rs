//! # Exponential Backoff
//!
//! Provides a doubling backoff for retries of transient failures.
//!
//! Sequence with the defaults (1s base, 5m cap):
//! 1s, 2s, 4s, 8s, 16s, 32s, 64s, 128s, 256s, 300s (max), 300s, ...

use std::time::Duration;

/// Default first retry delay.
pub const DEFAULT_BASE: Duration = Duration::from_secs(1);
/// Default upper bound on any retry delay.
pub const DEFAULT_MAX: Duration = Duration::from_secs(300);

/// Exponential backoff calculator
///
/// Each delay is double the previous one, capped at `max`. Delays never
/// decrease until `reset()` is called.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_BASE, DEFAULT_MAX)
    }
}

impl ExponentialBackoff {
    /// Create a new backoff starting at `base` and capped at `max`
    ///
    /// A `max` below `base` is raised to `base`.
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            attempt: 0,
        }
    }

    /// Get the next backoff duration and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let delay = self.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Calculate the delay for a given retry count (stateless)
    ///
    /// Retry count 0 yields `base`, each further retry doubles it, and the
    /// result is capped at `max`.
    #[must_use]
    pub fn delay_for(&self, retries: u32) -> Duration {
        // 2^31 seconds is far beyond any sensible cap
        let factor = 1u32.checked_shl(retries.min(31)).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |d| d.min(self.max))
    }
}
