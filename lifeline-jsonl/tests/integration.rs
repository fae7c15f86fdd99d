use lifeline::{EventType, IngestionPipeline, PipelineConfig, TelemetryEvent};
use lifeline_jsonl::{read_events, JsonlSink};
use std::sync::Arc;
use tower_service::Service;

fn event(id: &str, action: &str) -> Arc<TelemetryEvent> {
    Arc::new(
        TelemetryEvent::builder("s1", EventType::Custom, "agent", action)
            .build()
            .stamp(|| id.to_string(), 1_700_000_000_000),
    )
}

#[tokio::test]
async fn writes_json_lines() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("events.jsonl");
    let mut sink = JsonlSink::new(&path);

    sink.call(event("a", "start")).await.unwrap();
    sink.call(event("b", "finish")).await.unwrap();

    let contents = std::fs::read_to_string(&path).expect("file");
    assert_eq!(contents.lines().count(), 2);
    assert!(contents.contains("\"sessionId\":\"s1\""));

    let events = read_events(&path).await.unwrap();
    assert_eq!(events.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
}

#[tokio::test]
async fn missing_directory_is_an_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut sink = JsonlSink::new(dir.path().join("nope").join("events.jsonl"));
    assert!(sink.call(event("a", "start")).await.is_err());
}

#[tokio::test]
async fn pipeline_stores_sanitized_events() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("pipeline.jsonl");
    let pipeline = IngestionPipeline::builder(PipelineConfig::default())
        .sink("jsonl", JsonlSink::new(&path))
        .build()
        .expect("pipeline");

    let raw = TelemetryEvent::builder("s1", EventType::Custom, "auth", "login")
        .metadata("contact", "alice@example.com")
        .build();
    assert!(pipeline.submit(raw).await.is_tracked());
    pipeline.shutdown();

    let stored = read_events(&path).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].metadata["contact"], "[REDACTED]");
}
