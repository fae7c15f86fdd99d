//! Exponential retry delays.
//!
//! Attempt indices are 0-based: the delay after the first failed attempt is `base`, after the
//! second `2 * base`, and so on, capped at `max`.
//!
//! ```rust
//! use std::time::Duration;
//! use lifeline::Backoff;
//!
//! let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1)).unwrap();
//! assert_eq!(backoff.delay(0), Duration::from_millis(100));
//! assert_eq!(backoff.delay(2), Duration::from_millis(400));
//! assert_eq!(backoff.delay(10), Duration::from_secs(1)); // capped
//! ```
//!
//! Computations that would overflow saturate to [`MAX_BACKOFF`] (1 day) before the cap applies.

use crate::config::RetryConfig;
use std::time::Duration;
use thiserror::Error;

/// Upper bound used when the exponential term overflows (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackoffError {
    #[error("max ({max:?}) must be >= base ({base:?})")]
    MaxLessThanBase { base: Duration, max: Duration },
}

/// Exponential backoff with an upper bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Result<Self, BackoffError> {
        if max < base {
            return Err(BackoffError::MaxLessThanBase { base, max });
        }
        Ok(Self { base, max })
    }

    /// Backoff described by a validated [`RetryConfig`]. A cap below the base is raised to it.
    pub fn from_config(config: &RetryConfig) -> Self {
        let base = Duration::from_millis(config.backoff_ms);
        let max = Duration::from_millis(config.max_backoff_ms).max(base);
        Self { base, max }
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Delay to wait after attempt `attempt` (0-based) fails.
    pub fn delay(&self, attempt: usize) -> Duration {
        let exponent = attempt.min(u32::MAX as usize) as u32;
        let multiplier = 2u128.saturating_pow(exponent);
        let nanos = self.base.as_nanos().saturating_mul(multiplier);
        let exp_delay = Duration::from_nanos(nanos.min(MAX_BACKOFF.as_nanos()) as u64);
        exp_delay.min(self.max)
    }

    /// The delays of the first `retries` retries.
    pub fn schedule(&self, retries: usize) -> impl Iterator<Item = Duration> + '_ {
        (0..retries).map(move |attempt| self.delay(attempt))
    }
}
