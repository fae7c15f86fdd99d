//! Convenient re-exports for wiring a pipeline.
pub use crate::{
    bus::{BusEvent, EventBus, Topic},
    config::{PipelineConfig, ReliabilityConfig},
    error::{ErrorCategory, Severity, TelemetryError},
    event::{EventType, RawEvent, TelemetryEvent},
    health::{HealthReport, HealthStatus},
    layer::ReliabilityLayer,
    pipeline::{IngestionPipeline, PipelineBuilder, SubmitOutcome},
    reliability::{OperationContext, ReliabilityManager},
    sink::{sink_fn, LogSink, MemorySink, StreamingSink},
};
