//! Compile-time prelude coverage test.
use lifeline::prelude::*;
use std::sync::Arc;
use tower_layer::Layer;
use tower_service::Service;

#[tokio::test]
async fn prelude_reexports_core_types() {
    let memory = MemorySink::new();
    let manager = Arc::new(ReliabilityManager::new(ReliabilityConfig::default()).expect("valid config"));
    let mut svc = ReliabilityLayer::new(manager.clone(), "storage:memory").layer(lifeline::boxed(memory.clone()));

    let event = Arc::new(
        TelemetryEvent::builder("s", EventType::Start, "agent", "run")
            .build()
            .stamp(|| "id-1".to_string(), 0),
    );
    svc.call(event).await.expect("stored");
    assert_eq!(memory.len(), 1);
    assert_eq!(manager.health_status().status, HealthStatus::Healthy);
    manager.shutdown();
}
