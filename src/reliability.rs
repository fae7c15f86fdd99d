//! Reliability wrappers around fallible async operations.
//!
//! The [`ReliabilityManager`] owns one circuit breaker registry, one keyed rate limiter and
//! one error classifier, and composes them with exponential-backoff retry. Every failure that
//! leaves a wrapper is a recorded [`TelemetryError`].
//!
//! Each wrapper can be disabled through [`ReliabilityConfig`]; a disabled wrapper runs the
//! operation directly but still converts its error.
//!
//! ```rust
//! use lifeline::{OperationContext, ReliabilityConfig, ReliabilityManager};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let manager = ReliabilityManager::new(ReliabilityConfig::default()).unwrap();
//! let ctx = OperationContext::new("storage:sqlite");
//! let stored = manager
//!     .execute_with_retry(
//!         || manager.execute_with_circuit_breaker("storage:sqlite", || async {
//!             Ok::<_, std::io::Error>(42)
//!         }),
//!         &ctx,
//!     )
//!     .await;
//! assert_eq!(stored.unwrap(), 42);
//! # }
//! ```

use crate::backoff::Backoff;
use crate::circuit_breaker::{BreakerError, CircuitBreaker, CircuitState};
use crate::clock::{millis, Clock, SystemClock};
use crate::config::{ConfigError, ReliabilityConfig};
use crate::error::{classified, describe, ErrorCategory, RetryAttempt, Severity, TelemetryError};
use crate::error_handler::ErrorClassifier;
use crate::event::TelemetryEvent;
use crate::health::{HealthReport, HealthStatus};
use crate::rate_limit::{Decision, RateLimiter};
use crate::sleeper::{Sleeper, TokioSleeper};
use serde_json::{Map, Value};
use std::error::Error;
use std::future::Future;
use std::sync::Arc;

/// Describes the operation being protected, for error context and logs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationContext {
    /// Operation key, e.g. `"storage:sqlite"`. Its prefix selects the error category.
    pub operation: String,
    pub details: Map<String, Value>,
    pub event: Option<Arc<TelemetryEvent>>,
}

impl OperationContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self { operation: operation.into(), details: Map::new(), event: None }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    pub fn with_event(mut self, event: Arc<TelemetryEvent>) -> Self {
        self.event = Some(event);
        self
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::from_key(&self.operation)
    }

    fn decorate(&self, error: TelemetryError) -> TelemetryError {
        let error = error
            .with_context("operation", self.operation.clone())
            .with_context_map(self.details.clone());
        match &self.event {
            Some(event) => error.with_event(event),
            None => error,
        }
    }
}

fn as_telemetry<E: Error + 'static>(err: &E) -> Option<&TelemetryError> {
    (err as &(dyn Error + 'static)).downcast_ref::<TelemetryError>()
}

/// Composes breaker, limiter, retry and error classification.
#[derive(Debug)]
pub struct ReliabilityManager {
    config: ReliabilityConfig,
    breaker: CircuitBreaker,
    limiter: RateLimiter,
    errors: Arc<ErrorClassifier>,
    backoff: Backoff,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
}

impl ReliabilityManager {
    /// Build with the system clock and tokio timers.
    pub fn new(config: ReliabilityConfig) -> Result<Self, ConfigError> {
        Self::with_time(config, Arc::new(SystemClock), Arc::new(TokioSleeper))
    }

    /// Build with an explicit time source and sleeper.
    pub fn with_time(
        config: ReliabilityConfig,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let errors = Arc::new(ErrorClassifier::new(config.errors.clone(), clock.clone()));
        Ok(Self {
            breaker: CircuitBreaker::new(&config.circuit_breaker, clock.clone()),
            limiter: RateLimiter::new(&config.rate_limit, clock.clone()),
            backoff: Backoff::from_config(&config.retry),
            errors,
            clock,
            sleeper,
            config,
        })
    }

    pub fn config(&self) -> &ReliabilityConfig {
        &self.config
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn errors(&self) -> &Arc<ErrorClassifier> {
        &self.errors
    }

    /// Classify a foreign error, or pass through one that is already classified.
    fn absorb<E>(&self, err: &E, category: ErrorCategory, severity: Severity) -> TelemetryError
    where
        E: Error + 'static,
    {
        if let Some(classified) = as_telemetry(err) {
            return classified.clone();
        }
        self.errors.handle_error(self.errors.create_error(err.to_string(), category, severity))
    }

    /// Count one request for the event's `category:action` key.
    ///
    /// # Errors
    /// A recorded, non-retryable medium `system` error when the key is over its limit.
    pub fn check_rate_limit(&self, event: &TelemetryEvent) -> Result<(), TelemetryError> {
        if !self.config.rate_limit.enabled {
            return Ok(());
        }
        let key = event.rate_key();
        match self.limiter.check(&key) {
            Decision::Allowed { .. } => Ok(()),
            Decision::Denied { retry_after } => {
                let error = self
                    .errors
                    .create_error(format!("rate limit exceeded for {key}"), ErrorCategory::System, Severity::Medium)
                    .retryable(false)
                    .with_context("key", key)
                    .with_context("retryAfterMs", millis(retry_after))
                    .with_event(event);
                Err(self.errors.handle_error(error))
            }
        }
    }

    /// Run `operation` under the circuit breaker for `key`.
    ///
    /// A failure is recorded as `high` if it left the breaker open, `medium` otherwise, in the
    /// category named by the key prefix. Rejections by an open breaker are non-retryable.
    pub async fn execute_with_circuit_breaker<T, E, Fut, Op>(&self, key: &str, operation: Op) -> Result<T, TelemetryError>
    where
        E: Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>>,
        Op: FnOnce() -> Fut,
    {
        let category = ErrorCategory::from_key(key);
        if !self.config.circuit_breaker.enabled {
            return operation()
                .await
                .map_err(|e| self.absorb(&e, category, Severity::Medium));
        }

        match self.breaker.execute(key, operation).await {
            Ok(value) => Ok(value),
            Err(BreakerError::Open { key, retry_in }) => {
                let error = self
                    .errors
                    .create_error(format!("circuit breaker open for {key}"), category, Severity::Medium)
                    .retryable(false)
                    .with_context("key", key)
                    .with_context("retryInMs", millis(retry_in));
                Err(self.errors.handle_error(error))
            }
            Err(BreakerError::Inner(e)) => {
                let now_open = self.breaker.state(key) == CircuitState::Open;
                let severity = if now_open { Severity::High } else { Severity::Medium };
                let retryable = ErrorClassifier::is_retryable(&e) && !now_open;
                let consecutive = self.breaker.stats(key).map_or(0, |s| s.consecutive_failures);
                let error = self
                    .errors
                    .create_error(describe(&e), classified(&e).map_or(category, |t| t.category), severity)
                    .retryable(retryable)
                    .with_context("key", key)
                    .with_context("breakerState", if now_open { "open" } else { "closed" })
                    .with_context("consecutiveFailures", consecutive);
                Err(self.errors.handle_error(error))
            }
        }
    }

    /// Run `operation`, retrying retryable failures with exponential backoff.
    ///
    /// At most `max_retries` retries follow the first attempt; retry `n` (0-based) waits
    /// `backoff * 2^n`, capped. A non-retryable failure aborts at once with a `medium` error.
    /// Exhaustion yields a `high` error whose `attempts` context lists every failed attempt.
    pub async fn execute_with_retry<T, E, Fut, Op>(&self, mut operation: Op, context: &OperationContext) -> Result<T, TelemetryError>
    where
        E: Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>>,
        Op: FnMut() -> Fut,
    {
        if !self.config.retry.enabled {
            return operation()
                .await
                .map_err(|e| self.absorb(&e, context.category(), Severity::Medium));
        }

        let max_retries = self.config.retry.max_retries;
        let mut history: Vec<RetryAttempt> = Vec::with_capacity(max_retries + 1);
        let mut category = context.category();

        for attempt in 0..=max_retries {
            let (message, retryable) = match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::info!(
                            operation = %context.operation,
                            attempt,
                            retries = history.len(),
                            attempts = ?history,
                            "succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(e) => {
                    if let Some(inner) = classified(&e) {
                        category = inner.category;
                    }
                    (describe(&e), ErrorClassifier::is_retryable(&e))
                }
            };

            if !retryable {
                let error = self
                    .errors
                    .create_error(
                        format!("{} failed with non-retryable error: {message}", context.operation),
                        category,
                        Severity::Medium,
                    )
                    .retryable(false)
                    .with_context("attempt", attempt);
                return Err(self.errors.handle_error(context.decorate(error)));
            }

            if attempt == max_retries {
                history.push(RetryAttempt { attempt, message, delay_ms: 0 });
                break;
            }

            let delay = self.backoff.delay(attempt);
            tracing::warn!(
                operation = %context.operation,
                attempt,
                delay_ms = millis(delay),
                "retrying after failure: {message}"
            );
            history.push(RetryAttempt { attempt, message, delay_ms: millis(delay) });
            self.sleeper.sleep(delay).await;
        }

        let last = history.last().map(|a| a.message.clone()).unwrap_or_default();
        let attempts = serde_json::to_value(&history).unwrap_or(Value::Null);
        let error = self
            .errors
            .create_error(
                format!("{} failed after {} attempts: {last}", context.operation, history.len()),
                category,
                Severity::High,
            )
            .retryable(false)
            .with_context("attempts", attempts);
        Err(self.errors.handle_error(context.decorate(error)))
    }

    /// Run `primary` under breaker and retry; on failure run `fallback`.
    ///
    /// When both fail, a `critical` error carrying both messages is recorded and returned.
    pub async fn execute_with_graceful_degradation<T, E1, E2, PFut, P, FFut, F>(
        &self,
        mut primary: P,
        fallback: F,
        context: &OperationContext,
    ) -> Result<T, TelemetryError>
    where
        E1: Error + Send + Sync + 'static,
        E2: Error + Send + Sync + 'static,
        PFut: Future<Output = Result<T, E1>>,
        P: FnMut() -> PFut,
        FFut: Future<Output = Result<T, E2>>,
        F: FnOnce() -> FFut,
    {
        let key = context.operation.as_str();
        let primary_error = match self
            .execute_with_retry(
                || {
                    let attempt = primary();
                    self.execute_with_circuit_breaker(key, move || attempt)
                },
                context,
            )
            .await
        {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        tracing::warn!(operation = %context.operation, error = %primary_error, "primary failed; running fallback");
        match fallback().await {
            Ok(value) => Ok(value),
            Err(fallback_error) => {
                let fallback_message = describe(&fallback_error);
                let error = self
                    .errors
                    .create_error(
                        format!(
                            "{}: primary and fallback both failed (primary: {}; fallback: {fallback_message})",
                            context.operation, primary_error.message
                        ),
                        context.category(),
                        Severity::Critical,
                    )
                    .retryable(false)
                    .with_context("primaryError", primary_error.message.clone())
                    .with_context("primaryCorrelationId", primary_error.correlation_id.clone())
                    .with_context("fallbackError", fallback_message);
                Err(self.errors.handle_error(context.decorate(error)))
            }
        }
    }

    /// Current health, derived only from component state.
    pub fn health_status(&self) -> HealthReport {
        let errors = self.errors.stats();
        let circuit_breakers = self.breaker.snapshot().into_iter().collect();
        HealthReport {
            status: HealthStatus::assess(&errors, self.breaker.any_open()),
            timestamp: self.clock.now_millis(),
            errors,
            circuit_breakers,
            rate_limits: self.limiter.stats(),
        }
    }

    /// Stop background work owned by the manager.
    pub fn shutdown(&self) {
        self.limiter.shutdown();
        tracing::debug!("reliability manager shut down");
    }
}
