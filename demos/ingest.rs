//! Ingest a handful of events into memory and JSON-lines log output.
//!
//! Run with `RUST_LOG=lifeline=debug cargo run --example ingest`.
use lifeline::prelude::*;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let memory = MemorySink::new();
    let live = StreamingSink::new(64);
    let mut feed = live.subscribe();

    let pipeline = IngestionPipeline::builder(PipelineConfig::default())
        .sink("memory", memory.clone())
        .sink("log", LogSink)
        .streaming_sink("live", live)
        .build()?;

    pipeline.bus().on(Topic::EventTracked, |event| println!("bus: {event}"));
    pipeline.start();

    let events = [
        TelemetryEvent::builder("demo", EventType::Start, "agent", "run").build(),
        TelemetryEvent::builder("demo", EventType::Custom, "auth", "login")
            .metadata("email", "someone@example.com")
            .metadata("note", "card 4111 1111 1111 1111 on file")
            .build(),
        // Same key as the first event: dropped by dedup.
        TelemetryEvent::builder("demo", EventType::Start, "agent", "run").build(),
        TelemetryEvent::builder("demo", EventType::End, "agent", "run").duration(1_250).build(),
    ];

    for raw in events {
        let outcome = pipeline.submit(raw).await;
        println!("outcome: {outcome:?}");
    }

    while let Ok(event) = feed.try_recv() {
        println!("live: {} {}:{}", event.id, event.category, event.action);
    }

    let stored: Vec<Arc<TelemetryEvent>> = memory.events();
    println!("stored {} events", stored.len());
    println!("{}", serde_json::to_string_pretty(&*stored[1])?);
    println!("stats: {}", serde_json::to_string(&pipeline.stats())?);
    println!("health: {}", serde_json::to_string_pretty(&pipeline.health())?);

    pipeline.shutdown();
    Ok(())
}
