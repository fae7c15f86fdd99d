//! Error classification, history and alerting.
//!
//! The [`ErrorClassifier`] creates [`TelemetryError`]s, keeps a bounded rolling history of
//! them and scores that history against per-severity thresholds. Two callbacks can be
//! registered: one invoked synchronously for every critical error, one invoked when the
//! count of a severity within the history window climbs to its threshold. The threshold
//! callback fires once per upward crossing and re-arms only after the count drops below the
//! threshold again.
//!
//! Callbacks are always invoked after the history lock is released.

use crate::clock::Clock;
use crate::config::ErrorConfig;
use crate::error::{classified, ErrorCategory, Severity, TelemetryError};
use serde::Serialize;
use serde_json::Map;
use std::collections::{BTreeMap, VecDeque};
use std::error::Error;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

/// Invoked for every critical error.
pub type CriticalCallback = Arc<dyn Fn(&TelemetryError) + Send + Sync>;

/// Invoked when a severity reaches its threshold, with the contributing errors (oldest first).
pub type ThresholdCallback = Arc<dyn Fn(Severity, &[TelemetryError]) + Send + Sync>;

/// Counts over the live history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorStats {
    pub total: usize,
    pub by_category: BTreeMap<ErrorCategory, usize>,
    pub by_severity: BTreeMap<Severity, usize>,
    /// Errors within the recent window.
    pub recent: usize,
    pub recent_by_severity: BTreeMap<Severity, usize>,
}

impl ErrorStats {
    pub fn recent_with(&self, severity: Severity) -> usize {
        self.recent_by_severity.get(&severity).copied().unwrap_or(0)
    }
}

#[derive(Debug, Default)]
struct History {
    errors: VecDeque<TelemetryError>,
    /// Severities currently at or above their threshold.
    tripped: [bool; 4],
}

fn slot(severity: Severity) -> usize {
    match severity {
        Severity::Low => 0,
        Severity::Medium => 1,
        Severity::High => 2,
        Severity::Critical => 3,
    }
}

/// Centralized error handler.
pub struct ErrorClassifier {
    config: ErrorConfig,
    clock: Arc<dyn Clock>,
    history: Mutex<History>,
    on_critical: RwLock<Option<CriticalCallback>>,
    on_threshold: RwLock<Option<ThresholdCallback>>,
}

impl std::fmt::Debug for ErrorClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorClassifier")
            .field("config", &self.config)
            .field("len", &self.history().errors.len())
            .finish()
    }
}

impl ErrorClassifier {
    pub fn new(config: ErrorConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            history: Mutex::new(History::default()),
            on_critical: RwLock::new(None),
            on_threshold: RwLock::new(None),
        }
    }

    fn history(&self) -> MutexGuard<'_, History> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register the critical-error callback, replacing any previous one.
    pub fn on_critical<F>(&self, callback: F)
    where
        F: Fn(&TelemetryError) + Send + Sync + 'static,
    {
        *self.on_critical.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    /// Register the threshold callback, replacing any previous one.
    pub fn on_threshold<F>(&self, callback: F)
    where
        F: Fn(Severity, &[TelemetryError]) + Send + Sync + 'static,
    {
        *self.on_threshold.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    /// A new retryable error stamped with the current time and a fresh correlation id.
    ///
    /// Use the `with_*` methods on [`TelemetryError`] to attach context, the originating
    /// event, or to mark it non-retryable.
    pub fn create_error(&self, message: impl Into<String>, category: ErrorCategory, severity: Severity) -> TelemetryError {
        TelemetryError {
            message: message.into(),
            category,
            severity,
            timestamp: self.clock.now_millis(),
            context: Map::new(),
            event: None,
            retryable: true,
            correlation_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Whether an error should be retried. A [`TelemetryError`] reports its own flag; any
    /// other error is treated as transient.
    pub fn is_retryable(err: &(dyn Error + 'static)) -> bool {
        classified(err).map_or(true, |e| e.retryable)
    }

    fn prune(&self, history: &mut History, now: u64) {
        let horizon = now.saturating_sub(self.config.error_window_ms);
        while history.errors.front().is_some_and(|e| e.timestamp < horizon) {
            history.errors.pop_front();
        }
        while history.errors.len() > self.config.max_errors {
            history.errors.pop_front();
        }
    }

    /// Record `error`, run callbacks, and hand the error back for propagation.
    pub fn handle_error(&self, error: TelemetryError) -> TelemetryError {
        match error.severity {
            Severity::Critical => tracing::error!(
                category = %error.category,
                correlation_id = %error.correlation_id,
                "critical telemetry error: {}",
                error.message
            ),
            Severity::High => tracing::warn!(
                category = %error.category,
                correlation_id = %error.correlation_id,
                "telemetry error: {}",
                error.message
            ),
            _ => tracing::debug!(
                category = %error.category,
                severity = %error.severity,
                "telemetry error: {}",
                error.message
            ),
        }

        let crossings = {
            let mut history = self.history();
            history.errors.push_back(error.clone());
            self.prune(&mut history, self.clock.now_millis());
            self.crossings(&mut history)
        };

        if error.is_critical() {
            let callback = self.on_critical.read().unwrap_or_else(PoisonError::into_inner).clone();
            if let Some(callback) = callback {
                callback(&error);
            }
        }

        if !crossings.is_empty() {
            let callback = self.on_threshold.read().unwrap_or_else(PoisonError::into_inner).clone();
            for (severity, contributing) in crossings {
                tracing::warn!(%severity, count = contributing.len(), "error threshold reached");
                if let Some(callback) = &callback {
                    callback(severity, &contributing);
                }
            }
        }

        error
    }

    /// Update tripped flags and return newly crossed severities with their errors.
    fn crossings(&self, history: &mut History) -> Vec<(Severity, Vec<TelemetryError>)> {
        let mut crossed = Vec::new();
        for severity in Severity::ALL {
            let Some(threshold) = self.config.thresholds.get(severity) else {
                continue;
            };
            let count = history.errors.iter().filter(|e| e.severity == severity).count();
            let was_tripped = history.tripped[slot(severity)];
            let tripped = count >= threshold.max(1);
            history.tripped[slot(severity)] = tripped;
            if tripped && !was_tripped {
                let contributing =
                    history.errors.iter().filter(|e| e.severity == severity).cloned().collect();
                crossed.push((severity, contributing));
            }
        }
        crossed
    }

    pub fn stats(&self) -> ErrorStats {
        let now = self.clock.now_millis();
        let mut history = self.history();
        self.prune(&mut history, now);
        let recent_from = now.saturating_sub(self.config.recent_window_ms);

        let mut stats = ErrorStats { total: history.errors.len(), ..ErrorStats::default() };
        for error in &history.errors {
            *stats.by_category.entry(error.category).or_default() += 1;
            *stats.by_severity.entry(error.severity).or_default() += 1;
            if error.timestamp >= recent_from {
                stats.recent += 1;
                *stats.recent_by_severity.entry(error.severity).or_default() += 1;
            }
        }
        stats
    }

    /// Up to `limit` most recent errors, newest first.
    pub fn recent_errors(&self, limit: usize) -> Vec<TelemetryError> {
        self.history().errors.iter().rev().take(limit).cloned().collect()
    }

    /// Forget all history and re-arm every threshold.
    pub fn clear(&self) {
        let mut history = self.history();
        history.errors.clear();
        history.tripped = [false; 4];
    }
}
