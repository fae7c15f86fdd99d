//! The ingestion pipeline: sanitize → dedup → rate limit → dispatch → notify.
//!
//! ```rust
//! use lifeline::{EventType, IngestionPipeline, MemorySink, PipelineConfig, TelemetryEvent};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let memory = MemorySink::new();
//! let pipeline = IngestionPipeline::builder(PipelineConfig::default())
//!     .sink("memory", memory.clone())
//!     .build()
//!     .unwrap();
//! pipeline.start();
//!
//! let outcome = pipeline
//!     .submit(TelemetryEvent::builder("session-1", EventType::Start, "agent", "run").build())
//!     .await;
//! assert!(outcome.is_tracked());
//! assert_eq!(memory.len(), 1);
//! pipeline.shutdown();
//! # }
//! ```

use crate::bus::{BusEvent, EventBus};
use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, PipelineConfig};
use crate::dedup::{DedupStats, Deduplicator, KeyFn};
use crate::error::{BoxError, TelemetryError};
use crate::event::{RawEvent, TelemetryEvent};
use crate::health::HealthReport;
use crate::layer::{ReliabilityLayer, ReliabilityService};
use crate::pii::{PiiSanitizer, SanitizerError};
use crate::reliability::ReliabilityManager;
use crate::sink::{boxed, BoxSink};
use crate::sleeper::{Sleeper, TokioSleeper};
use futures::future::join_all;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tower::ServiceExt;
use tower_layer::Layer;
use tower_service::Service;
use uuid::Uuid;

/// Errors building a pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Sanitizer(#[from] SanitizerError),

    #[error("duplicate sink name `{0}`")]
    DuplicateSink(String),
}

/// What happened to one submitted event.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// Stored by at least one sink, or there were no sinks.
    Tracked { event: Arc<TelemetryEvent>, failed_sinks: usize },
    /// Dropped as a repeat within the dedup window.
    Duplicate,
    RateLimited(TelemetryError),
    /// Every sink failed.
    Failed(Vec<TelemetryError>),
    /// The pipeline was shut down.
    Closed,
}

impl SubmitOutcome {
    pub fn is_tracked(&self) -> bool {
        matches!(self, SubmitOutcome::Tracked { .. })
    }
}

/// Pipeline counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStats {
    pub submitted: u64,
    pub duplicates: u64,
    pub rate_limited: u64,
    pub tracked: u64,
    pub failed: u64,
    pub sink_failures: u64,
    pub dedup: DedupStats,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    duplicates: AtomicU64,
    rate_limited: AtomicU64,
    tracked: AtomicU64,
    failed: AtomicU64,
    sink_failures: AtomicU64,
}

#[derive(Debug)]
struct RegisteredSink {
    key: String,
    // BoxCloneService is Send but not Sync; calls clone it out from under the lock.
    service: Mutex<ReliabilityService<BoxSink>>,
}

impl RegisteredSink {
    fn service(&self) -> ReliabilityService<BoxSink> {
        self.service.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Wires configuration, sinks and time sources into an [`IngestionPipeline`].
pub struct PipelineBuilder {
    config: PipelineConfig,
    sinks: Vec<(String, BoxSink)>,
    bus: Option<Arc<EventBus>>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    dedup_key: Option<KeyFn>,
}

impl std::fmt::Debug for PipelineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("config", &self.config)
            .field("sinks", &self.sinks.iter().map(|(key, _)| key.as_str()).collect::<Vec<_>>())
            .field("clock", &self.clock)
            .finish()
    }
}

impl PipelineBuilder {
    fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            sinks: Vec::new(),
            bus: None,
            clock: Arc::new(SystemClock),
            sleeper: Arc::new(TokioSleeper),
            dedup_key: None,
        }
    }

    /// Register a storage sink under the breaker key `storage:<name>`.
    pub fn sink<S>(self, name: &str, sink: S) -> Self
    where
        S: Service<Arc<TelemetryEvent>, Response = ()> + Clone + Send + 'static,
        S::Error: Into<BoxError>,
        S::Future: Send + 'static,
    {
        self.register(format!("storage:{name}"), boxed(sink))
    }

    /// Register a streaming sink under the breaker key `streaming:<name>`.
    pub fn streaming_sink<S>(self, name: &str, sink: S) -> Self
    where
        S: Service<Arc<TelemetryEvent>, Response = ()> + Clone + Send + 'static,
        S::Error: Into<BoxError>,
        S::Future: Send + 'static,
    {
        self.register(format!("streaming:{name}"), boxed(sink))
    }

    fn register(mut self, key: String, sink: BoxSink) -> Self {
        self.sinks.push((key, sink));
        self
    }

    /// Share an existing bus instead of creating one.
    pub fn bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Replace the dedup key (default `session:category:action:label`).
    pub fn dedup_key<F>(mut self, key_fn: F) -> Self
    where
        F: Fn(&TelemetryEvent) -> String + Send + Sync + 'static,
    {
        self.dedup_key = Some(Arc::new(key_fn));
        self
    }

    /// Validate the configuration and assemble the pipeline.
    ///
    /// Call inside a tokio runtime so the dedup and limiter timers can start.
    pub fn build(self) -> Result<IngestionPipeline, PipelineError> {
        self.config.validate()?;
        let sanitizer = PiiSanitizer::new(&self.config.pii)?;
        let manager = Arc::new(ReliabilityManager::with_time(
            self.config.reliability(),
            self.clock.clone(),
            self.sleeper,
        )?);

        let mut dedup = Deduplicator::new(&self.config.dedup, self.clock.clone());
        if let Some(key_fn) = self.dedup_key {
            dedup = dedup.with_key_fn(move |event: &TelemetryEvent| key_fn(event));
        }

        let bus = self.bus.unwrap_or_default();
        let critical_bus = Arc::clone(&bus);
        manager
            .errors()
            .on_critical(move |error| critical_bus.publish(BusEvent::StorageCritical(Arc::new(error.clone()))));
        let degraded_bus = Arc::clone(&bus);
        manager.errors().on_threshold(move |severity, errors| {
            degraded_bus.publish(BusEvent::StorageDegraded { severity, errors: Arc::from(errors) })
        });

        let mut sinks: Vec<RegisteredSink> = Vec::with_capacity(self.sinks.len());
        for (key, sink) in self.sinks {
            if sinks.iter().any(|s| s.key == key) {
                return Err(PipelineError::DuplicateSink(key));
            }
            let service = ReliabilityLayer::new(Arc::clone(&manager), key.as_str()).layer(sink);
            sinks.push(RegisteredSink { key, service: Mutex::new(service) });
        }

        tracing::debug!(sinks = sinks.len(), "ingestion pipeline built");
        Ok(IngestionPipeline {
            sanitizer,
            dedup,
            manager,
            sinks,
            bus,
            clock: self.clock,
            counters: Counters::default(),
            closed: AtomicBool::new(false),
        })
    }
}

/// Accepts events and fans them out to every registered sink.
#[derive(Debug)]
pub struct IngestionPipeline {
    sanitizer: PiiSanitizer,
    dedup: Deduplicator,
    manager: Arc<ReliabilityManager>,
    sinks: Vec<RegisteredSink>,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    counters: Counters,
    closed: AtomicBool,
}

impl IngestionPipeline {
    pub fn builder(config: PipelineConfig) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    /// Announce the pipeline on the bus.
    pub fn start(&self) {
        tracing::info!(sinks = self.sinks.len(), "ingestion pipeline started");
        self.bus.publish(BusEvent::Initialized);
    }

    /// Process one event end to end.
    ///
    /// Sink failures are isolated: each publishes `storage:error` and the remaining sinks
    /// still receive the event.
    pub async fn submit(&self, raw: impl Into<RawEvent>) -> SubmitOutcome {
        if self.closed.load(Ordering::Acquire) {
            return SubmitOutcome::Closed;
        }
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);

        let stamped = raw.into().stamp(|| Uuid::new_v4().to_string(), self.clock.now_millis());
        let event = Arc::new(self.sanitizer.sanitize(&stamped));

        let Some(event) = self.dedup.admit(event) else {
            self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            return SubmitOutcome::Duplicate;
        };

        if let Err(error) = self.manager.check_rate_limit(&event) {
            self.counters.rate_limited.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(id = %event.id, key = %event.rate_key(), "event rate limited");
            self.bus.publish(BusEvent::EventError { event: Arc::clone(&event), error: Arc::new(error.clone()) });
            return SubmitOutcome::RateLimited(error);
        }

        let results = join_all(self.sinks.iter().map(|sink| sink.service().oneshot(Arc::clone(&event)))).await;

        let mut errors = Vec::new();
        for (sink, result) in self.sinks.iter().zip(results) {
            if let Err(error) = result {
                self.counters.sink_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(sink = %sink.key, id = %event.id, error = %error, "sink failed to store event");
                self.bus.publish(BusEvent::StorageError {
                    sink: sink.key.clone(),
                    event: Arc::clone(&event),
                    error: Arc::new(error.clone()),
                });
                errors.push(error);
            }
        }

        if !self.sinks.is_empty() && errors.len() == self.sinks.len() {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            return SubmitOutcome::Failed(errors);
        }

        self.counters.tracked.fetch_add(1, Ordering::Relaxed);
        self.bus.publish(BusEvent::EventTracked(Arc::clone(&event)));
        SubmitOutcome::Tracked { event, failed_sinks: errors.len() }
    }

    /// Stop timers, announce shutdown, then drop bus listeners. Idempotent.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.dedup.shutdown();
        self.manager.shutdown();
        self.bus.publish(BusEvent::Shutdown);
        self.bus.clear_listeners();
        tracing::info!(tracked = self.counters.tracked.load(Ordering::Relaxed), "ingestion pipeline shut down");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn health(&self) -> HealthReport {
        self.manager.health_status()
    }

    pub fn stats(&self) -> PipelineStats {
        let c = &self.counters;
        PipelineStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            duplicates: c.duplicates.load(Ordering::Relaxed),
            rate_limited: c.rate_limited.load(Ordering::Relaxed),
            tracked: c.tracked.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            sink_failures: c.sink_failures.load(Ordering::Relaxed),
            dedup: self.dedup.stats(),
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn manager(&self) -> &Arc<ReliabilityManager> {
        &self.manager
    }

    pub fn sanitizer(&self) -> &PiiSanitizer {
        &self.sanitizer
    }

    pub fn deduplicator(&self) -> &Deduplicator {
        &self.dedup
    }

    /// Breaker keys of the registered sinks, in registration order.
    pub fn sink_keys(&self) -> Vec<&str> {
        self.sinks.iter().map(|s| s.key.as_str()).collect()
    }
}
