//! Error taxonomy for the telemetry pipeline.
//!
//! Every failure that leaves a reliability wrapper is a [`TelemetryError`]: category ×
//! severity plus enough context to correlate it with the operation and event that caused it.

use crate::event::TelemetryEvent;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Subsystem an error originated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Storage,
    Streaming,
    System,
    Security,
    Analytics,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 5] = [
        ErrorCategory::Storage,
        ErrorCategory::Streaming,
        ErrorCategory::System,
        ErrorCategory::Security,
        ErrorCategory::Analytics,
    ];

    /// Infer the category from an operation key such as `"storage:sqlite"`.
    ///
    /// Keys without a recognised prefix are `System`.
    pub fn from_key(key: &str) -> Self {
        match key.split(':').next().unwrap_or_default() {
            "storage" => ErrorCategory::Storage,
            "streaming" => ErrorCategory::Streaming,
            "security" => ErrorCategory::Security,
            "analytics" => ErrorCategory::Analytics,
            _ => ErrorCategory::System,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Storage => "storage",
            ErrorCategory::Streaming => "streaming",
            ErrorCategory::System => "system",
            ErrorCategory::Security => "security",
            ErrorCategory::Analytics => "analytics",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How bad an error is. Ordered: `Low < Medium < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 4] = [Severity::Low, Severity::Medium, Severity::High, Severity::Critical];

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified pipeline failure.
///
/// Created through [`ErrorClassifier::create_error`](crate::ErrorClassifier::create_error)
/// so it carries a timestamp from the pipeline clock and a fresh correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryError {
    pub message: String,
    pub category: ErrorCategory,
    pub severity: Severity,
    /// Epoch milliseconds.
    pub timestamp: u64,
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<Box<TelemetryEvent>>,
    pub retryable: bool,
    pub correlation_id: String,
}

impl TelemetryError {
    /// Add one context entry.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Merge a whole context map; existing keys are overwritten.
    pub fn with_context_map(mut self, context: Map<String, Value>) -> Self {
        self.context.extend(context);
        self
    }

    /// Attach the event being processed when the error occurred.
    pub fn with_event(mut self, event: &TelemetryEvent) -> Self {
        self.event = Some(Box::new(event.clone()));
        self
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn is_critical(&self) -> bool {
        self.severity == Severity::Critical
    }

    /// Look up a context entry.
    pub fn context_value(&self, key: &str) -> Option<&Value> {
        self.context.get(key)
    }

    /// Attempt history recorded on retry exhaustion, if any.
    pub fn attempts(&self) -> Option<Vec<RetryAttempt>> {
        self.context
            .get("attempts")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

impl fmt::Display for TelemetryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}/{}] {}", self.category, self.severity, self.message)
    }
}

impl std::error::Error for TelemetryError {}

/// One failed attempt inside a retry loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryAttempt {
    /// 0-based attempt index.
    pub attempt: usize,
    pub message: String,
    /// Backoff applied after this attempt, in milliseconds (0 for the final attempt).
    pub delay_ms: u64,
}

/// Error type produced by sinks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A sink failure as a concrete error type.
///
/// `BoxError` is not itself an `Error`, so sink failures are wrapped before they enter the
/// reliability wrappers. A sink that fails with a [`TelemetryError`] keeps its classification.
#[derive(Debug)]
pub struct SinkError(BoxError);

impl SinkError {
    pub fn new(err: impl Into<BoxError>) -> Self {
        SinkError(err.into())
    }

    pub fn into_inner(self) -> BoxError {
        self.0
    }

    fn as_telemetry(&self) -> Option<&TelemetryError> {
        self.0.downcast_ref::<TelemetryError>()
    }
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for SinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

/// The [`TelemetryError`] behind `err`, looking through [`SinkError`].
pub(crate) fn classified<'a>(err: &'a (dyn std::error::Error + 'static)) -> Option<&'a TelemetryError> {
    err.downcast_ref::<TelemetryError>()
        .or_else(|| err.downcast_ref::<SinkError>().and_then(SinkError::as_telemetry))
}

/// Message of an arbitrary error without the classification prefix.
pub(crate) fn describe(err: &(dyn std::error::Error + 'static)) -> String {
    match classified(err) {
        Some(telemetry) => telemetry.message.clone(),
        None => err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(severity: Severity) -> TelemetryError {
        TelemetryError {
            message: "disk full".into(),
            category: ErrorCategory::Storage,
            severity,
            timestamp: 1,
            context: Map::new(),
            event: None,
            retryable: true,
            correlation_id: "c-1".into(),
        }
    }

    #[test]
    fn category_is_inferred_from_key_prefix() {
        assert_eq!(ErrorCategory::from_key("storage:sqlite"), ErrorCategory::Storage);
        assert_eq!(ErrorCategory::from_key("streaming:websocket"), ErrorCategory::Streaming);
        assert_eq!(ErrorCategory::from_key("analytics"), ErrorCategory::Analytics);
        assert_eq!(ErrorCategory::from_key("payments:charge"), ErrorCategory::System);
        assert_eq!(ErrorCategory::from_key(""), ErrorCategory::System);
    }

    #[test]
    fn severity_is_ordered() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::High < Severity::Critical);
        assert_eq!(Severity::ALL.iter().max(), Some(&Severity::Critical));
    }

    #[test]
    fn display_includes_classification() {
        let msg = sample(Severity::High).to_string();
        assert_eq!(msg, "[storage/high] disk full");
    }

    #[test]
    fn describe_strips_prefix_for_telemetry_errors() {
        let err = sample(Severity::Low);
        assert_eq!(describe(&err), "disk full");
        let io = std::io::Error::new(std::io::ErrorKind::Other, "pipe closed");
        assert_eq!(describe(&io), "pipe closed");
    }

    #[test]
    fn sink_errors_keep_inner_classification() {
        let wrapped = SinkError::new(sample(Severity::Medium).retryable(false));
        assert_eq!(describe(&wrapped), "disk full");
        assert!(classified(&wrapped).is_some_and(|e| !e.retryable));

        let plain = SinkError::new("connection reset");
        assert!(classified(&plain).is_none());
        assert_eq!(plain.to_string(), "connection reset");
    }

    #[test]
    fn attempts_round_trip_through_context() {
        let mut err = sample(Severity::High);
        let history = vec![RetryAttempt { attempt: 0, message: "boom".into(), delay_ms: 100 }];
        err.context.insert("attempts".into(), serde_json::to_value(&history).unwrap());
        assert_eq!(err.attempts(), Some(history));
        assert!(sample(Severity::Low).attempts().is_none());
    }
}
