//! Storage and streaming backends.
//!
//! A sink is any tower [`Service`] that accepts `Arc<TelemetryEvent>` and responds with `()`.
//! The pipeline boxes each sink with [`boxed`] and wraps it in a
//! [`ReliabilityLayer`](crate::ReliabilityLayer), so a sink only has to store the event and
//! report failure; retries and circuit breaking happen around it.
//!
//! Three development sinks ship with the crate: [`MemorySink`] keeps events in a bounded
//! buffer, [`LogSink`] writes them to `tracing`, and [`StreamingSink`] fans them out to
//! broadcast subscribers. Closures become sinks through [`sink_fn`].

use crate::error::{BoxError, SinkError};
use crate::event::TelemetryEvent;
use futures::future::BoxFuture;
use std::convert::Infallible;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::broadcast;
use tower::util::{BoxCloneService, ServiceFn};
use tower::{Service, ServiceExt};

/// A type-erased sink.
pub type BoxSink = BoxCloneService<Arc<TelemetryEvent>, (), SinkError>;

/// Erase a sink's type, normalizing its error to [`SinkError`].
pub fn boxed<S>(sink: S) -> BoxSink
where
    S: Service<Arc<TelemetryEvent>, Response = ()> + Clone + Send + 'static,
    S::Error: Into<BoxError>,
    S::Future: Send + 'static,
{
    BoxCloneService::new(sink.map_err(|e: S::Error| SinkError::new(e)))
}

/// Turn an async closure into a sink.
pub fn sink_fn<F, Fut, E>(f: F) -> ServiceFn<F>
where
    F: FnMut(Arc<TelemetryEvent>) -> Fut,
    Fut: Future<Output = Result<(), E>>,
{
    tower::service_fn(f)
}

/// A sink that keeps events in memory, evicting the oldest when full.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<Arc<TelemetryEvent>>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<TelemetryEvent>>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn events(&self) -> Vec<Arc<TelemetryEvent>> {
        self.lock().clone()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<Arc<TelemetryEvent>> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<(), Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: Arc<TelemetryEvent>) -> Self::Future {
        let mut events = self.lock();
        if events.len() >= self.capacity {
            events.remove(0);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        events.push(event);
        Box::pin(async { Ok(()) })
    }
}

/// A sink that logs each event at `info`.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<Arc<TelemetryEvent>> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<(), Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: Arc<TelemetryEvent>) -> Self::Future {
        tracing::info!(
            id = %event.id,
            session = %event.session_id,
            event_type = %event.event_type,
            category = %event.category,
            action = %event.action,
            "telemetry_event"
        );
        Box::pin(async { Ok(()) })
    }
}

/// A sink that broadcasts events to live subscribers.
///
/// Events published while nobody is subscribed are counted as dropped, not failed.
#[derive(Clone, Debug)]
pub struct StreamingSink {
    sender: broadcast::Sender<Arc<TelemetryEvent>>,
    dropped: Arc<AtomicU64>,
}

impl StreamingSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, dropped: Arc::new(AtomicU64::new(0)) }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<TelemetryEvent>> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Service<Arc<TelemetryEvent>> for StreamingSink {
    type Response = ();
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<(), Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: Arc<TelemetryEvent>) -> Self::Future {
        if self.sender.send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;

    fn event(id: &str) -> Arc<TelemetryEvent> {
        Arc::new(
            TelemetryEvent::builder("s", EventType::Custom, "agent", "step")
                .build()
                .stamp(|| id.to_string(), 0),
        )
    }

    #[tokio::test]
    async fn memory_sink_evicts_oldest() {
        let mut sink = MemorySink::with_capacity(2);
        assert!(sink.is_empty());
        sink.call(event("a")).await.unwrap();
        sink.call(event("b")).await.unwrap();
        sink.call(event("c")).await.unwrap();

        assert_eq!(sink.len(), 2);
        assert_eq!(sink.evicted(), 1);
        let ids: Vec<_> = sink.events().iter().map(|e| e.id.clone()).collect();
        assert_eq!(ids, vec!["b", "c"]);

        sink.clear();
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn clones_share_storage() {
        let sink = MemorySink::new();
        let mut handle = sink.clone();
        handle.call(event("x")).await.unwrap();
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test]
    async fn streaming_sink_delivers_and_counts_drops() {
        let mut sink = StreamingSink::new(8);
        sink.call(event("nobody")).await.unwrap();
        assert_eq!(sink.dropped_count(), 1);

        let mut rx = sink.subscribe();
        sink.call(event("live")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().id, "live");
    }

    #[tokio::test]
    async fn boxed_sink_wraps_errors() {
        let failing = sink_fn(|_event: Arc<TelemetryEvent>| async {
            Err::<(), _>(std::io::Error::new(std::io::ErrorKind::Other, "disk full"))
        });
        let err = boxed(failing).oneshot(event("e")).await.unwrap_err();
        assert_eq!(err.to_string(), "disk full");

        let ok = boxed(LogSink).oneshot(event("e")).await;
        assert!(ok.is_ok());
    }
}
