//! Health reporting.

use crate::circuit_breaker::CircuitState;
use crate::error::Severity;
use crate::error_handler::ErrorStats;
use crate::rate_limit::RateLimitStats;
use serde::Serialize;
use std::collections::BTreeMap;

/// Recent high-severity errors tolerated before reporting degraded.
pub const DEGRADED_HIGH_ERRORS: usize = 5;

/// Recent errors of any severity tolerated before reporting degraded.
pub const DEGRADED_TOTAL_ERRORS: usize = 20;

/// Overall health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Derive health from error counts and breaker state.
    ///
    /// Unhealthy if any critical error is recent; otherwise degraded if more than
    /// [`DEGRADED_HIGH_ERRORS`] high-severity or [`DEGRADED_TOTAL_ERRORS`] total errors are
    /// recent, or any breaker is open; otherwise healthy.
    pub fn assess(errors: &ErrorStats, any_breaker_open: bool) -> Self {
        if errors.recent_with(Severity::Critical) > 0 {
            HealthStatus::Unhealthy
        } else if errors.recent_with(Severity::High) > DEGRADED_HIGH_ERRORS
            || errors.recent > DEGRADED_TOTAL_ERRORS
            || any_breaker_open
        {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }

    /// The worse of two statuses.
    pub fn combine(self, other: HealthStatus) -> HealthStatus {
        self.max(other)
    }
}

/// Full health snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    /// Epoch millis when the report was taken.
    pub timestamp: u64,
    pub errors: ErrorStats,
    pub circuit_breakers: BTreeMap<String, CircuitState>,
    pub rate_limits: RateLimitStats,
}
