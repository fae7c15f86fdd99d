//! Tower integration: wrap any sink service in breaker + retry.
//!
//! ```rust
//! use std::sync::Arc;
//! use lifeline::{MemorySink, ReliabilityConfig, ReliabilityLayer, ReliabilityManager};
//! use tower::Layer;
//!
//! let manager = Arc::new(ReliabilityManager::new(ReliabilityConfig::default()).unwrap());
//! let guarded = ReliabilityLayer::new(manager, "storage:memory").layer(MemorySink::new());
//! # let _ = guarded;
//! ```

use crate::error::{SinkError, TelemetryError};
use crate::event::TelemetryEvent;
use crate::reliability::{OperationContext, ReliabilityManager};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::ServiceExt;
use tower_layer::Layer;
use tower_service::Service;

/// Applies `execute_with_retry(execute_with_circuit_breaker(key, ..))` to every call.
#[derive(Clone, Debug)]
pub struct ReliabilityLayer {
    manager: Arc<ReliabilityManager>,
    key: Arc<str>,
}

impl ReliabilityLayer {
    /// `key` names the breaker and selects the error category (`storage:*`, `streaming:*`).
    pub fn new(manager: Arc<ReliabilityManager>, key: impl Into<Arc<str>>) -> Self {
        Self { manager, key: key.into() }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl<S> Layer<S> for ReliabilityLayer {
    type Service = ReliabilityService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ReliabilityService { inner, manager: self.manager.clone(), key: self.key.clone() }
    }
}

/// Service produced by [`ReliabilityLayer`].
#[derive(Clone, Debug)]
pub struct ReliabilityService<S> {
    inner: S,
    manager: Arc<ReliabilityManager>,
    key: Arc<str>,
}

impl<S> Service<Arc<TelemetryEvent>> for ReliabilityService<S>
where
    S: Service<Arc<TelemetryEvent>, Response = (), Error = SinkError> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = ();
    type Error = TelemetryError;
    type Future = BoxFuture<'static, Result<(), TelemetryError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Readiness is awaited per attempt on a clone of the inner service.
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: Arc<TelemetryEvent>) -> Self::Future {
        let inner = self.inner.clone();
        let manager = self.manager.clone();
        let key = self.key.clone();
        Box::pin(async move {
            let context = OperationContext::new(&*key).with_event(event.clone());
            // The inner service is Send but not Sync, so the retry closure owns it.
            let (manager, key) = (&*manager, &*key);
            manager
                .execute_with_retry(
                    move || {
                        let attempt = inner.clone().oneshot(event.clone());
                        manager.execute_with_circuit_breaker(key, move || attempt)
                    },
                    &context,
                )
                .await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::ReliabilityConfig;
    use crate::error::Severity;
    use crate::event::EventType;
    use crate::sink::{boxed, sink_fn, MemorySink};
    use crate::sleeper::InstantSleeper;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager(threshold: usize, max_retries: usize) -> Arc<ReliabilityManager> {
        let mut config = ReliabilityConfig::default();
        config.circuit_breaker.threshold = threshold;
        config.retry.max_retries = max_retries;
        Arc::new(
            ReliabilityManager::with_time(config, Arc::new(ManualClock::starting_at(0)), Arc::new(InstantSleeper))
                .unwrap(),
        )
    }

    fn event() -> Arc<TelemetryEvent> {
        Arc::new(
            TelemetryEvent::builder("s", EventType::End, "agent", "run")
                .build()
                .stamp(|| "e1".into(), 0),
        )
    }

    #[tokio::test]
    async fn passes_events_through_to_sink() {
        let memory = MemorySink::new();
        let svc = ReliabilityLayer::new(manager(5, 3), "storage:memory").layer(boxed(memory.clone()));
        svc.oneshot(event()).await.unwrap();
        assert_eq!(memory.len(), 1);
    }

    #[tokio::test]
    async fn retries_flaky_sink() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let flaky = sink_fn(move |_event: Arc<TelemetryEvent>| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "timeout"))
                } else {
                    Ok(())
                }
            }
        });
        let svc = ReliabilityLayer::new(manager(10, 3), "storage:flaky").layer(boxed(flaky));
        svc.oneshot(event()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn persistent_failure_opens_breaker_for_key() {
        let m = manager(2, 5);
        let broken = sink_fn(|_event: Arc<TelemetryEvent>| async {
            Err::<(), _>(std::io::Error::new(std::io::ErrorKind::Other, "unreachable"))
        });
        let svc = ReliabilityLayer::new(m.clone(), "streaming:ws").layer(boxed(broken));

        let err = svc.oneshot(event()).await.unwrap_err();
        assert_eq!(err.severity, Severity::Medium, "aborted once the breaker opened");
        assert_eq!(m.circuit_breaker().state("streaming:ws"), crate::circuit_breaker::CircuitState::Open);
    }
}
