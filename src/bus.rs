//! Lifecycle notifications.
//!
//! The [`EventBus`] is an explicit instance handed to the pipeline, never a global. It offers
//! two ways to listen:
//!
//! - synchronous listeners registered per [`Topic`] with [`EventBus::on`], invoked inline on
//!   the publishing task. A panicking listener is caught, logged and does not affect the
//!   publisher or other listeners;
//! - an async [`BusSubscriber`] from [`EventBus::subscribe`] that sees every event through a
//!   `tokio::sync::broadcast` channel. Slow subscribers skip ahead and the number of missed
//!   events is counted.

use crate::error::{Severity, TelemetryError};
use crate::event::TelemetryEvent;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::broadcast;

/// Default buffer of the broadcast channel.
pub const DEFAULT_BUS_CAPACITY: usize = 1_024;

/// Notification topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Initialized,
    EventTracked,
    EventError,
    StorageError,
    StorageCritical,
    StorageDegraded,
    AnalyticsAnomaly,
    AnalyticsAlert,
    Shutdown,
}

impl Topic {
    pub const ALL: [Topic; 9] = [
        Topic::Initialized,
        Topic::EventTracked,
        Topic::EventError,
        Topic::StorageError,
        Topic::StorageCritical,
        Topic::StorageDegraded,
        Topic::AnalyticsAnomaly,
        Topic::AnalyticsAlert,
        Topic::Shutdown,
    ];

    /// Wire name, e.g. `"event:tracked"`.
    pub fn as_str(self) -> &'static str {
        match self {
            Topic::Initialized => "initialized",
            Topic::EventTracked => "event:tracked",
            Topic::EventError => "event:error",
            Topic::StorageError => "storage:error",
            Topic::StorageCritical => "storage:critical",
            Topic::StorageDegraded => "storage:degraded",
            Topic::AnalyticsAnomaly => "analytics:anomaly",
            Topic::AnalyticsAlert => "analytics:alert",
            Topic::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A published notification. Payloads are shared, never copied per listener.
#[derive(Debug, Clone)]
pub enum BusEvent {
    Initialized,
    /// Stored by at least one sink.
    EventTracked(Arc<TelemetryEvent>),
    /// Rejected before dispatch (e.g. rate limited).
    EventError { event: Arc<TelemetryEvent>, error: Arc<TelemetryError> },
    /// One sink failed to store an event.
    StorageError { sink: String, event: Arc<TelemetryEvent>, error: Arc<TelemetryError> },
    StorageCritical(Arc<TelemetryError>),
    /// A severity reached its threshold.
    StorageDegraded { severity: Severity, errors: Arc<[TelemetryError]> },
    AnalyticsAnomaly(Arc<Value>),
    AnalyticsAlert(Arc<Value>),
    Shutdown,
}

impl BusEvent {
    pub fn topic(&self) -> Topic {
        match self {
            BusEvent::Initialized => Topic::Initialized,
            BusEvent::EventTracked(_) => Topic::EventTracked,
            BusEvent::EventError { .. } => Topic::EventError,
            BusEvent::StorageError { .. } => Topic::StorageError,
            BusEvent::StorageCritical(_) => Topic::StorageCritical,
            BusEvent::StorageDegraded { .. } => Topic::StorageDegraded,
            BusEvent::AnalyticsAnomaly(_) => Topic::AnalyticsAnomaly,
            BusEvent::AnalyticsAlert(_) => Topic::AnalyticsAlert,
            BusEvent::Shutdown => Topic::Shutdown,
        }
    }
}

impl fmt::Display for BusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusEvent::EventTracked(event) => write!(f, "{}: {}", self.topic(), event.id),
            BusEvent::EventError { event, error } => {
                write!(f, "{}: {} ({})", self.topic(), event.id, error)
            }
            BusEvent::StorageError { sink, error, .. } => write!(f, "{}: {sink}: {error}", self.topic()),
            BusEvent::StorageCritical(error) => write!(f, "{}: {error}", self.topic()),
            BusEvent::StorageDegraded { severity, errors } => {
                write!(f, "{}: {} {severity} errors", self.topic(), errors.len())
            }
            _ => write!(f, "{}", self.topic()),
        }
    }
}

/// Handle returned by [`EventBus::on`], used to remove the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&BusEvent) + Send + Sync>;

/// Publish/subscribe hub for pipeline notifications.
pub struct EventBus {
    listeners: RwLock<HashMap<Topic, Vec<(ListenerId, Listener)>>>,
    next_id: AtomicU64,
    sender: broadcast::Sender<BusEvent>,
    published: AtomicU64,
    listener_panics: AtomicU64,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("published", &self.published())
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUS_CAPACITY)
    }

    /// A bus whose broadcast channel buffers `capacity` events per subscriber.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            listeners: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            sender,
            published: AtomicU64::new(0),
            listener_panics: AtomicU64::new(0),
        }
    }

    /// Register a synchronous listener for `topic`.
    pub fn on<F>(&self, topic: Topic, listener: F) -> ListenerId
    where
        F: Fn(&BusEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic)
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns `false` if it was not registered for `topic`.
    pub fn off(&self, topic: Topic, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let Some(registered) = listeners.get_mut(&topic) else {
            return false;
        };
        let before = registered.len();
        registered.retain(|(lid, _)| *lid != id);
        before != registered.len()
    }

    pub fn listener_count(&self, topic: Topic) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&topic)
            .map_or(0, Vec::len)
    }

    /// Remove every synchronous listener. Async subscribers are unaffected.
    pub fn clear_listeners(&self) {
        self.listeners.write().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> BusSubscriber {
        BusSubscriber { receiver: self.sender.subscribe(), lagged: 0 }
    }

    /// Deliver `event` to the topic's listeners, then to async subscribers.
    pub fn publish(&self, event: BusEvent) {
        let topic = event.topic();
        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&topic)
            .map(|registered| registered.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default();

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                self.listener_panics.fetch_add(1, Ordering::Relaxed);
                tracing::error!(%topic, "bus listener panicked");
            }
        }

        self.published.fetch_add(1, Ordering::Relaxed);
        // No subscribers is not an error.
        let _ = self.sender.send(event);
        tracing::trace!(%topic, "bus event published");
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn listener_panics(&self) -> u64 {
        self.listener_panics.load(Ordering::Relaxed)
    }
}

/// Async receiver of every bus event.
#[derive(Debug)]
pub struct BusSubscriber {
    receiver: broadcast::Receiver<BusEvent>,
    lagged: u64,
}

impl BusSubscriber {
    /// Next event, or `None` once the bus is dropped. Skips over events missed while lagging.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    self.lagged += missed;
                    tracing::warn!(missed, "bus subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next event if one is buffered.
    pub fn try_recv(&mut self) -> Option<BusEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(missed)) => self.lagged += missed,
                Err(_) => return None,
            }
        }
    }

    /// Events skipped because this subscriber fell behind.
    pub fn lagged(&self) -> u64 {
        self.lagged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn topics_have_wire_names() {
        assert_eq!(Topic::EventTracked.to_string(), "event:tracked");
        assert_eq!(Topic::StorageDegraded.as_str(), "storage:degraded");
        assert_eq!(BusEvent::Shutdown.topic(), Topic::Shutdown);
    }

    #[test]
    fn listeners_only_see_their_topic() {
        let bus = EventBus::new();
        let inits = Arc::new(AtomicUsize::new(0));
        let counter = inits.clone();
        bus.on(Topic::Initialized, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(BusEvent::Initialized);
        bus.publish(BusEvent::Shutdown);
        assert_eq!(inits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.published(), 2);
    }

    #[test]
    fn off_removes_listener() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let id = bus.on(Topic::Shutdown, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(bus.off(Topic::Shutdown, id));
        assert!(!bus.off(Topic::Shutdown, id));
        assert!(!bus.off(Topic::Initialized, id));
        bus.publish(BusEvent::Shutdown);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn panicking_listener_is_isolated() {
        let bus = EventBus::new();
        let after = Arc::new(AtomicUsize::new(0));
        let counter = after.clone();
        bus.on(Topic::Initialized, |_| panic!("listener bug"));
        bus.on(Topic::Initialized, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(BusEvent::Initialized);
        assert_eq!(after.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_panics(), 1);
    }

    #[test]
    fn clear_listeners_drops_all() {
        let bus = EventBus::new();
        bus.on(Topic::Initialized, |_| {});
        bus.on(Topic::Shutdown, |_| {});
        bus.clear_listeners();
        assert_eq!(bus.listener_count(Topic::Initialized), 0);
        assert_eq!(bus.listener_count(Topic::Shutdown), 0);
    }

    #[tokio::test]
    async fn subscriber_receives_everything() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        bus.publish(BusEvent::Initialized);
        bus.publish(BusEvent::AnalyticsAlert(Arc::new(serde_json::json!({"level": "warn"}))));

        assert!(matches!(sub.recv().await, Some(BusEvent::Initialized)));
        match sub.recv().await {
            Some(BusEvent::AnalyticsAlert(payload)) => assert_eq!(payload["level"], "warn"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_subscriber_counts_lag() {
        let bus = EventBus::with_capacity(2);
        let mut sub = bus.subscribe();
        for _ in 0..5 {
            bus.publish(BusEvent::Initialized);
        }
        assert!(sub.recv().await.is_some());
        assert_eq!(sub.lagged(), 3);
        assert!(sub.try_recv().is_some());
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn subscriber_ends_when_bus_dropped() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        drop(bus);
        assert!(sub.recv().await.is_none());
    }
}
