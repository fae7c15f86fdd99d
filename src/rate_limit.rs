//! Keyed rate limiting.
//!
//! Each key gets its own window of `max_requests` per `window`, measured either as a fixed
//! window (counter + start) or a sliding one (timestamps over the trailing window). A check
//! that would exceed the limit is denied *without* being counted.
//!
//! Window resets are computed lazily on every check, so accounting is exact regardless of
//! timing. The limiter also owns a background task that only purges idle keys to keep
//! memory bounded; stopping it never changes a decision.

use crate::clock::{millis, Clock};
use crate::config::{RateLimitConfig, WindowStrategy};
use crate::schedule::ScheduledTask;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

mod window;

use window::Window;

/// The decision returned by a rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The request was admitted and counted.
    Allowed {
        /// Permits left in the current window.
        remaining: u32,
    },
    /// The request was rejected and not counted.
    Denied {
        /// How long until a permit frees up.
        retry_after: Duration,
    },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }
}

/// Aggregate limiter counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitStats {
    /// Requests counted in the current window, per key.
    pub keys: BTreeMap<String, u32>,
    pub allowed: u64,
    pub denied: u64,
}

#[derive(Debug)]
struct LimiterState {
    max_requests: u32,
    window_ms: u64,
    strategy: WindowStrategy,
    clock: Arc<dyn Clock>,
    windows: Mutex<HashMap<String, Window>>,
    allowed: AtomicU64,
    denied: AtomicU64,
}

impl LimiterState {
    fn windows(&self) -> MutexGuard<'_, HashMap<String, Window>> {
        self.windows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn purge_idle(&self) -> usize {
        let now = self.clock.now_millis();
        let mut windows = self.windows();
        let before = windows.len();
        windows.retain(|_, w| w.count(now, self.window_ms) > 0);
        let purged = before - windows.len();
        if purged > 0 {
            tracing::trace!(purged, remaining = windows.len(), "rate limiter purged idle keys");
        }
        purged
    }
}

/// Per-key window limiter.
#[derive(Debug)]
pub struct RateLimiter {
    state: Arc<LimiterState>,
    timer: Mutex<Option<ScheduledTask>>,
}

impl RateLimiter {
    /// Build a limiter. Starts the idle-key purge when called inside a tokio runtime.
    pub fn new(config: &RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        let state = Arc::new(LimiterState {
            max_requests: config.max_requests.max(1),
            window_ms: millis(config.window()).max(1),
            strategy: config.strategy,
            clock,
            windows: Mutex::new(HashMap::new()),
            allowed: AtomicU64::new(0),
            denied: AtomicU64::new(0),
        });
        let timer = if config.enabled {
            ScheduledTask::every("rate-limit-purge", config.window(), &state, |s| {
                s.purge_idle();
            })
        } else {
            None
        };
        Self { state, timer: Mutex::new(timer) }
    }

    /// Check and, if admitted, count one request for `key`.
    pub fn check(&self, key: &str) -> Decision {
        let now = self.state.clock.now_millis();
        let decision = {
            let mut windows = self.state.windows();
            let window = windows
                .entry(key.to_string())
                .or_insert_with(|| Window::new(self.state.strategy, now));
            window.try_acquire(now, self.state.max_requests, self.state.window_ms)
        };
        match decision {
            Decision::Allowed { .. } => {
                self.state.allowed.fetch_add(1, Ordering::Relaxed);
            }
            Decision::Denied { retry_after } => {
                self.state.denied.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key, retry_after_ms = millis(retry_after), "rate limit exceeded");
            }
        }
        decision
    }

    /// Requests counted for `key` in its current window.
    pub fn current(&self, key: &str) -> u32 {
        let now = self.state.clock.now_millis();
        self.state.windows().get(key).map_or(0, |w| w.count(now, self.state.window_ms))
    }

    pub fn stats(&self) -> RateLimitStats {
        let now = self.state.clock.now_millis();
        let keys = self
            .state
            .windows()
            .iter()
            .map(|(k, w)| (k.clone(), w.count(now, self.state.window_ms)))
            .collect();
        RateLimitStats {
            keys,
            allowed: self.state.allowed.load(Ordering::Relaxed),
            denied: self.state.denied.load(Ordering::Relaxed),
        }
    }

    /// Drop keys with nothing counted in their current window. Returns how many were dropped.
    pub fn purge_idle(&self) -> usize {
        self.state.purge_idle()
    }

    pub fn has_timer(&self) -> bool {
        self.timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(ScheduledTask::is_running)
    }

    /// Stop the purge task. Accounting of admitted requests is unaffected.
    pub fn shutdown(&self) {
        if let Some(mut timer) = self.timer.lock().unwrap_or_else(PoisonError::into_inner).take() {
            timer.stop();
        }
    }
}
