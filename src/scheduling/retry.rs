//! Retry Policy
//!
//! Exponential backoff for failed deployments: `base_delay * multiplier^retry_count`,
//! capped at `max_retries` attempts beyond the first. `max_retries` never
//! exceeds [`MAX_RETRIES_LIMIT`].
//!
//! ## Usage
//!
//! ```rust
//! use std::time::Duration;
//! use tokio_deploy_orchestrator::scheduling::RetryPolicy;
//!
//! let policy = RetryPolicy::default(); // 3 retries, 5s base, doubling
//!
//! assert_eq!(policy.delay_for(0), Duration::from_secs(5));
//! assert_eq!(policy.delay_for(2), Duration::from_secs(20));
//! assert!(!policy.allows(3));
//! ```

use std::time::Duration;
use tracing::debug;

use crate::config::validation::MAX_RETRIES_LIMIT;
use crate::config::RetryConfig;

/// Retry policy configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Growth factor applied per retry already taken.
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(5),
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// Create policy with exponential backoff. `max_retries` is clamped to
    /// [`MAX_RETRIES_LIMIT`].
    pub fn exponential(max_retries: u32, base_delay: Duration, multiplier: u32) -> Self {
        Self {
            max_retries: max_retries.min(MAX_RETRIES_LIMIT),
            base_delay,
            multiplier,
        }
    }

    /// Build from the `[retry]` config section.
    pub fn from_config(config: &RetryConfig) -> Self {
        Self::exponential(
            config.max_retries,
            Duration::from_millis(config.base_delay_ms),
            config.multiplier,
        )
    }

    /// Returns `true` if a deployment that has already retried `retry_count`
    /// times may retry again.
    pub fn allows(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// Backoff before the retry following `retry_count` earlier retries.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(retry_count);
        let delay = self.base_delay.saturating_mul(factor);
        debug!(retry_count, delay_ms = delay.as_millis() as u64, "retry: backoff computed");
        delay
    }
}
