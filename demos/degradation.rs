//! Graceful degradation: a flaky primary store with a local fallback.
//!
//! The primary fails until its breaker opens; later calls skip it and go straight to the
//! fallback. Health reports `degraded` while the breaker is open.
use lifeline::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut config = ReliabilityConfig::default();
    config.circuit_breaker.threshold = 2;
    config.retry.max_retries = 1;
    config.retry.backoff_ms = 10;
    let manager = ReliabilityManager::new(config)?;

    let primary_calls = Arc::new(AtomicUsize::new(0));
    for request in 0..4 {
        let ctx = OperationContext::new("storage:primary").with("request", request);
        let result = manager
            .execute_with_graceful_degradation(
                || {
                    let calls = primary_calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err::<&str, _>(std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "primary down"))
                    }
                },
                || async { Ok::<_, std::io::Error>("fallback") },
                &ctx,
            )
            .await;
        println!("request {request}: {result:?}");
    }

    println!("primary attempts: {}", primary_calls.load(Ordering::SeqCst));
    let health = manager.health_status();
    println!("status: {:?}", health.status);
    println!("{}", serde_json::to_string_pretty(&health)?);

    manager.shutdown();
    Ok(())
}
