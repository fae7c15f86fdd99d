#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # lifeline
//!
//! A reliability layer and ingestion pipeline for telemetry events.
//!
//! ## Features
//!
//! - **PII sanitization** of labels, metadata and context before anything is stored
//! - **Deduplication** of repeat events inside a sliding time window
//! - **Keyed rate limiting** with fixed or sliding windows
//! - **Circuit breakers** per sink with single-probe half-open recovery
//! - **Retry** with capped exponential backoff
//! - **Error classification** by category and severity, with threshold callbacks
//! - **Event bus** for lifecycle, storage and analytics notifications
//! - **Health reporting** derived from recent errors and breaker state
//!
//! Sinks are plain tower services; the pipeline wraps each one in a
//! [`ReliabilityLayer`] so storage backends only need to store.
//!
//! ## Quick Start
//!
//! ```rust
//! use lifeline::{EventType, IngestionPipeline, LogSink, PipelineConfig, TelemetryEvent};
//!
//! #[tokio::main]
//! async fn main() {
//!     let pipeline = IngestionPipeline::builder(PipelineConfig::default())
//!         .sink("log", LogSink)
//!         .build()
//!         .expect("valid configuration");
//!     pipeline.start();
//!
//!     let event = TelemetryEvent::builder("session-42", EventType::Custom, "editor", "save")
//!         .metadata("author", "dev@example.com")
//!         .build();
//!     let outcome = pipeline.submit(event).await;
//!     assert!(outcome.is_tracked());
//!
//!     pipeline.shutdown();
//! }
//! ```

pub mod backoff;
pub mod bus;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod dedup;
pub mod error;
pub mod error_handler;
pub mod event;
pub mod health;
pub mod layer;
pub mod pii;
pub mod pipeline;
pub mod prelude;
pub mod rate_limit;
pub mod reliability;
pub mod schedule;
pub mod sink;
pub mod sleeper;

// Re-exports
pub use backoff::{Backoff, BackoffError};
pub use bus::{BusEvent, BusSubscriber, EventBus, ListenerId, Topic};
pub use circuit_breaker::{BreakerError, BreakerStats, CircuitBreaker, CircuitState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    CircuitBreakerConfig, ConfigError, DedupConfig, ErrorConfig, PiiConfig, PipelineConfig,
    RateLimitConfig, ReliabilityConfig, RetryConfig, SeverityThresholds, WindowStrategy,
};
pub use dedup::{DedupStats, Deduplicator};
pub use error::{BoxError, ErrorCategory, RetryAttempt, Severity, SinkError, TelemetryError};
pub use error_handler::{ErrorClassifier, ErrorStats};
pub use event::{EventBuilder, EventType, RawEvent, TelemetryEvent};
pub use health::{HealthReport, HealthStatus};
pub use layer::{ReliabilityLayer, ReliabilityService};
pub use pii::{PatternKind, PiiSanitizer, SanitizerError};
pub use pipeline::{IngestionPipeline, PipelineBuilder, PipelineError, PipelineStats, SubmitOutcome};
pub use rate_limit::{Decision, RateLimitStats, RateLimiter};
pub use reliability::{OperationContext, ReliabilityManager};
pub use sink::{boxed, sink_fn, BoxSink, LogSink, MemorySink, StreamingSink};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
