//! Pipeline configuration.
//!
//! Every section has a documented default and is validated once, at construction. The JSON
//! form uses camelCase keys (`timeoutMs`, `maxRequests`, ...) and every field is optional.
//!
//! ```rust
//! use lifeline::PipelineConfig;
//!
//! let config = PipelineConfig::from_json_str(r#"{
//!     "circuitBreaker": { "threshold": 3, "timeoutMs": 10000 },
//!     "pii": { "customPatterns": ["ACCT-\\d{6}"] }
//! }"#).unwrap();
//! assert_eq!(config.circuit_breaker.threshold, 3);
//! assert_eq!(config.rate_limit.max_requests, 1000);
//! ```

use crate::error::Severity;
use crate::pii::PatternKind;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors produced while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{section}.{field} must be > 0")]
    MustBePositive { section: &'static str, field: &'static str },

    #[error("retry.maxBackoffMs ({max}) must be >= retry.backoffMs ({base})")]
    BackoffCapBelowBase { base: u64, max: u64 },

    #[error("pii.redactionToken must not be empty")]
    EmptyRedactionToken,

    #[error("invalid configuration JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
}

fn positive(value: u64, section: &'static str, field: &'static str) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::MustBePositive { section, field });
    }
    Ok(())
}

/// Circuit breaker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    /// Consecutive failures before a key opens.
    pub threshold: usize,
    /// Time a key stays open before a probe is allowed.
    pub timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self { enabled: true, threshold: 5, timeout_ms: 60_000 }
    }
}

impl CircuitBreakerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        positive(self.threshold as u64, "circuitBreaker", "threshold")?;
        positive(self.timeout_ms, "circuitBreaker", "timeoutMs")
    }
}

/// How a rate-limit window is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowStrategy {
    /// Counter reset when the window that started with the first request elapses.
    #[default]
    Fixed,
    /// Requests counted over the trailing window.
    Sliding,
}

/// Rate limiter settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub max_requests: u32,
    pub window_ms: u64,
    pub strategy: WindowStrategy,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { enabled: true, max_requests: 1_000, window_ms: 60_000, strategy: WindowStrategy::Fixed }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        positive(u64::from(self.max_requests), "rateLimit", "maxRequests")?;
        positive(self.window_ms, "rateLimit", "windowMs")
    }
}

/// Retry settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    pub enabled: bool,
    /// Retries after the first attempt.
    pub max_retries: usize,
    /// Base delay; attempt `n` (0-based) waits `backoff_ms * 2^n`.
    pub backoff_ms: u64,
    /// Upper bound on a single delay.
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { enabled: true, max_retries: 3, backoff_ms: 1_000, max_backoff_ms: 30_000 }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_backoff_ms < self.backoff_ms {
            return Err(ConfigError::BackoffCapBelowBase {
                base: self.backoff_ms,
                max: self.max_backoff_ms,
            });
        }
        Ok(())
    }
}

/// PII redaction settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PiiConfig {
    pub enabled: bool,
    /// Built-in pattern kinds to apply.
    pub patterns: Vec<PatternKind>,
    /// Extra regular expressions; every match is redacted.
    pub custom_patterns: Vec<String>,
    /// Field names whose whole value is redacted (case-insensitive).
    pub sensitive_fields: Vec<String>,
    pub redaction_token: String,
}

/// Field names redacted wholesale by default.
pub const DEFAULT_SENSITIVE_FIELDS: &[&str] = &[
    "password",
    "passwd",
    "secret",
    "token",
    "apikey",
    "api_key",
    "accesstoken",
    "access_token",
    "refresh_token",
    "authorization",
    "credentials",
    "private_key",
    "ssn",
    "creditcard",
    "credit_card",
];

impl Default for PiiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            patterns: PatternKind::ALL.to_vec(),
            custom_patterns: Vec::new(),
            sensitive_fields: DEFAULT_SENSITIVE_FIELDS.iter().map(|s| (*s).to_string()).collect(),
            redaction_token: "[REDACTED]".to_string(),
        }
    }
}

impl PiiConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redaction_token.is_empty() {
            return Err(ConfigError::EmptyRedactionToken);
        }
        Ok(())
    }
}

/// Duplicate suppression settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DedupConfig {
    pub enabled: bool,
    pub window_ms: u64,
    pub max_keys: usize,
    /// Background sweep cadence; defaults to the window.
    pub sweep_interval_ms: Option<u64>,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self { enabled: true, window_ms: 5_000, max_keys: 10_000, sweep_interval_ms: None }
    }
}

impl DedupConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.unwrap_or(self.window_ms))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        positive(self.window_ms, "dedup", "windowMs")?;
        positive(self.max_keys as u64, "dedup", "maxKeys")?;
        if let Some(interval) = self.sweep_interval_ms {
            positive(interval, "dedup", "sweepIntervalMs")?;
        }
        Ok(())
    }
}

/// Per-severity counts at which the threshold callback fires. `None` disables a severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeverityThresholds {
    pub low: Option<usize>,
    pub medium: Option<usize>,
    pub high: Option<usize>,
    pub critical: Option<usize>,
}

impl Default for SeverityThresholds {
    fn default() -> Self {
        Self { low: Some(100), medium: Some(50), high: Some(10), critical: Some(1) }
    }
}

impl SeverityThresholds {
    pub fn get(&self, severity: Severity) -> Option<usize> {
        match severity {
            Severity::Low => self.low,
            Severity::Medium => self.medium,
            Severity::High => self.high,
            Severity::Critical => self.critical,
        }
    }
}

/// Error history settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ErrorConfig {
    pub max_errors: usize,
    /// Retention horizon of the history.
    pub error_window_ms: u64,
    /// Sub-window used for `recent` counts and health.
    pub recent_window_ms: u64,
    pub thresholds: SeverityThresholds,
}

impl Default for ErrorConfig {
    fn default() -> Self {
        Self {
            max_errors: 1_000,
            error_window_ms: 3_600_000,
            recent_window_ms: 300_000,
            thresholds: SeverityThresholds::default(),
        }
    }
}

impl ErrorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive(self.max_errors as u64, "errors", "maxErrors")?;
        positive(self.error_window_ms, "errors", "errorWindowMs")?;
        positive(self.recent_window_ms, "errors", "recentWindowMs")
    }
}

/// The reliability subset: what a [`ReliabilityManager`](crate::ReliabilityManager) needs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReliabilityConfig {
    pub circuit_breaker: CircuitBreakerConfig,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    pub errors: ErrorConfig,
}

impl ReliabilityConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.circuit_breaker.validate()?;
        self.rate_limit.validate()?;
        self.retry.validate()?;
        self.errors.validate()
    }
}

/// Full pipeline configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineConfig {
    pub circuit_breaker: CircuitBreakerConfig,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    pub pii: PiiConfig,
    pub dedup: DedupConfig,
    pub errors: ErrorConfig,
}

impl PipelineConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse, and validate a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.reliability().validate()?;
        self.pii.validate()?;
        self.dedup.validate()
    }

    /// The reliability sections as their own config.
    pub fn reliability(&self) -> ReliabilityConfig {
        ReliabilityConfig {
            circuit_breaker: self.circuit_breaker.clone(),
            rate_limit: self.rate_limit.clone(),
            retry: self.retry.clone(),
            errors: self.errors.clone(),
        }
    }
}
