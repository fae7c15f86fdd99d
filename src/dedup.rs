//! Time-window duplicate suppression.
//!
//! Each event maps to a key through a key function. An event is dropped when its key was
//! last *admitted* less than `window` ago; suppressed duplicates do not extend the window.
//!
//! Memory is bounded by `max_keys`. Whenever the map grows past the bound, the oldest
//! entries are evicted until it is back at 80% of capacity. A background sweep, owned by the
//! deduplicator, additionally drops expired keys; admission decisions never depend on it.

use crate::clock::{millis, Clock};
use crate::config::DedupConfig;
use crate::event::TelemetryEvent;
use crate::schedule::ScheduledTask;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Derives the dedup key of an event.
pub type KeyFn = Arc<dyn Fn(&TelemetryEvent) -> String + Send + Sync>;

/// `session:category:action:label`.
pub fn default_key(event: &TelemetryEvent) -> String {
    format!(
        "{}:{}:{}:{}",
        event.session_id,
        event.category,
        event.action,
        event.label.as_deref().unwrap_or_default()
    )
}

/// Counters describing deduplicator activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DedupStats {
    pub tracked_keys: usize,
    pub admitted: u64,
    pub suppressed: u64,
    pub expired: u64,
    pub evicted: u64,
}

/// Result of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub evicted: usize,
}

#[derive(Debug)]
struct DedupState {
    seen: Mutex<HashMap<String, u64>>,
    window_ms: u64,
    max_keys: usize,
    clock: Arc<dyn Clock>,
    admitted: AtomicU64,
    suppressed: AtomicU64,
    expired: AtomicU64,
    evicted: AtomicU64,
}

impl DedupState {
    fn seen(&self) -> MutexGuard<'_, HashMap<String, u64>> {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn eviction_target(&self) -> usize {
        (self.max_keys * 4 / 5).max(1)
    }

    /// Evict oldest entries until the map is at the eviction target. Caller holds the lock.
    fn evict_oldest(&self, seen: &mut HashMap<String, u64>) -> usize {
        if seen.len() <= self.max_keys {
            return 0;
        }
        let excess = seen.len() - self.eviction_target();
        let mut by_age: Vec<(u64, String)> = seen.iter().map(|(k, ts)| (*ts, k.clone())).collect();
        by_age.sort_unstable();
        for (_, key) in by_age.iter().take(excess) {
            seen.remove(key);
        }
        self.evicted.fetch_add(excess as u64, Ordering::Relaxed);
        tracing::debug!(evicted = excess, remaining = seen.len(), "dedup map over capacity");
        excess
    }

    fn sweep(&self) -> SweepReport {
        let now = self.clock.now_millis();
        let mut seen = self.seen();
        let before = seen.len();
        seen.retain(|_, ts| now.saturating_sub(*ts) < self.window_ms);
        let expired = before - seen.len();
        self.expired.fetch_add(expired as u64, Ordering::Relaxed);
        let evicted = self.evict_oldest(&mut seen);
        if expired > 0 {
            tracing::trace!(expired, remaining = seen.len(), "dedup sweep");
        }
        SweepReport { expired, evicted }
    }
}

/// Suppresses repeat events within a time window.
pub struct Deduplicator {
    enabled: bool,
    state: Arc<DedupState>,
    key_fn: KeyFn,
    timer: Mutex<Option<ScheduledTask>>,
}

impl std::fmt::Debug for Deduplicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deduplicator")
            .field("enabled", &self.enabled)
            .field("window_ms", &self.state.window_ms)
            .field("max_keys", &self.state.max_keys)
            .field("key_fn", &"<fn>")
            .finish()
    }
}

impl Deduplicator {
    /// Build with the default key function. Starts the background sweep when called inside
    /// a tokio runtime and dedup is enabled.
    pub fn new(config: &DedupConfig, clock: Arc<dyn Clock>) -> Self {
        let state = Arc::new(DedupState {
            seen: Mutex::new(HashMap::new()),
            window_ms: millis(config.window()),
            max_keys: config.max_keys.max(1),
            clock,
            admitted: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        });
        let timer = if config.enabled {
            ScheduledTask::every("dedup-sweep", config.sweep_interval(), &state, |s| {
                s.sweep();
            })
        } else {
            None
        };
        Self { enabled: config.enabled, state, key_fn: Arc::new(default_key), timer: Mutex::new(timer) }
    }

    /// Replace the key function.
    pub fn with_key_fn<F>(mut self, key_fn: F) -> Self
    where
        F: Fn(&TelemetryEvent) -> String + Send + Sync + 'static,
    {
        self.key_fn = Arc::new(key_fn);
        self
    }

    /// `Some(event)` if admitted, `None` if it duplicates a key admitted within the window.
    pub fn admit<E: AsRef<TelemetryEvent>>(&self, event: E) -> Option<E> {
        if !self.enabled {
            return Some(event);
        }
        let key = (self.key_fn)(event.as_ref());
        let now = self.state.clock.now_millis();
        let mut seen = self.state.seen();
        if let Some(last) = seen.get(&key) {
            if now.saturating_sub(*last) < self.state.window_ms {
                self.state.suppressed.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(key = %key, "duplicate suppressed");
                return None;
            }
        }
        seen.insert(key, now);
        self.state.evict_oldest(&mut seen);
        self.state.admitted.fetch_add(1, Ordering::Relaxed);
        Some(event)
    }

    /// Drop expired keys now, then enforce the capacity bound.
    pub fn sweep(&self) -> SweepReport {
        self.state.sweep()
    }

    pub fn len(&self) -> usize {
        self.state.seen().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> DedupStats {
        DedupStats {
            tracked_keys: self.len(),
            admitted: self.state.admitted.load(Ordering::Relaxed),
            suppressed: self.state.suppressed.load(Ordering::Relaxed),
            expired: self.state.expired.load(Ordering::Relaxed),
            evicted: self.state.evicted.load(Ordering::Relaxed),
        }
    }

    /// Whether the background sweep is running.
    pub fn has_timer(&self) -> bool {
        self.timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(ScheduledTask::is_running)
    }

    /// Stop the background sweep and run a final one.
    pub fn shutdown(&self) {
        if let Some(mut timer) = self.timer.lock().unwrap_or_else(PoisonError::into_inner).take() {
            timer.stop();
        }
        self.state.sweep();
    }
}

impl AsRef<TelemetryEvent> for TelemetryEvent {
    fn as_ref(&self) -> &TelemetryEvent {
        self
    }
}
