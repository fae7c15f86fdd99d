//! Telemetry event model.
//!
//! Producers hand the pipeline a [`RawEvent`]; the pipeline stamps it with an id and
//! timestamp (when missing) and from then on only ever handles immutable
//! [`TelemetryEvent`]s, sharing them as `Arc<TelemetryEvent>`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Lifecycle phase an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Start,
    Stream,
    End,
    Error,
    Custom,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventType::Start => "start",
            EventType::Stream => "stream",
            EventType::End => "end",
            EventType::Error => "error",
            EventType::Custom => "custom",
        };
        f.write_str(name)
    }
}

/// An event accepted by the pipeline. Never mutated in place; sanitizing produces a copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryEvent {
    pub id: String,
    pub session_id: String,
    pub event_type: EventType,
    pub category: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    /// Epoch milliseconds.
    pub timestamp: u64,
    /// Milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub context: Map<String, Value>,
}

impl TelemetryEvent {
    /// Start building a new event.
    pub fn builder(
        session_id: impl Into<String>,
        event_type: EventType,
        category: impl Into<String>,
        action: impl Into<String>,
    ) -> EventBuilder {
        EventBuilder {
            raw: RawEvent {
                id: None,
                session_id: session_id.into(),
                event_type,
                category: category.into(),
                action: action.into(),
                label: None,
                value: None,
                timestamp: None,
                duration: None,
                metadata: Map::new(),
                context: Map::new(),
            },
        }
    }

    /// `category:action`, the key rate limiting is counted under.
    pub fn rate_key(&self) -> String {
        format!("{}:{}", self.category, self.action)
    }
}

/// An event as submitted by a producer: `id` and `timestamp` may be absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    #[serde(default)]
    pub id: Option<String>,
    pub session_id: String,
    pub event_type: EventType,
    pub category: String,
    pub action: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub timestamp: Option<u64>,
    #[serde(default)]
    pub duration: Option<u64>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub context: Map<String, Value>,
}

impl RawEvent {
    /// Fill in missing identity fields. Present values are kept as-is.
    pub fn stamp(self, id: impl FnOnce() -> String, now_millis: u64) -> TelemetryEvent {
        TelemetryEvent {
            id: self.id.filter(|id| !id.is_empty()).unwrap_or_else(id),
            session_id: self.session_id,
            event_type: self.event_type,
            category: self.category,
            action: self.action,
            label: self.label,
            value: self.value,
            timestamp: self.timestamp.unwrap_or(now_millis),
            duration: self.duration,
            metadata: self.metadata,
            context: self.context,
        }
    }
}

impl From<TelemetryEvent> for RawEvent {
    fn from(event: TelemetryEvent) -> Self {
        RawEvent {
            id: Some(event.id),
            session_id: event.session_id,
            event_type: event.event_type,
            category: event.category,
            action: event.action,
            label: event.label,
            value: event.value,
            timestamp: Some(event.timestamp),
            duration: event.duration,
            metadata: event.metadata,
            context: event.context,
        }
    }
}

/// Builder for [`RawEvent`].
#[derive(Debug, Clone)]
pub struct EventBuilder {
    raw: RawEvent,
}

impl EventBuilder {
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.raw.id = Some(id.into());
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.raw.label = Some(label.into());
        self
    }

    pub fn value(mut self, value: f64) -> Self {
        self.raw.value = Some(value);
        self
    }

    pub fn timestamp(mut self, millis: u64) -> Self {
        self.raw.timestamp = Some(millis);
        self
    }

    pub fn duration(mut self, millis: u64) -> Self {
        self.raw.duration = Some(millis);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.raw.metadata.insert(key.into(), value.into());
        self
    }

    pub fn context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.raw.context.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> RawEvent {
        self.raw
    }
}

impl From<EventBuilder> for RawEvent {
    fn from(builder: EventBuilder) -> Self {
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stamp_assigns_missing_id_and_timestamp() {
        let raw = TelemetryEvent::builder("s1", EventType::Start, "agent", "run").build();
        let event = raw.stamp(|| "generated".to_string(), 42);
        assert_eq!(event.id, "generated");
        assert_eq!(event.timestamp, 42);
    }

    #[test]
    fn stamp_keeps_present_identity() {
        let raw = TelemetryEvent::builder("s1", EventType::End, "agent", "run")
            .id("given")
            .timestamp(7)
            .build();
        let event = raw.stamp(|| unreachable!("id already present"), 42);
        assert_eq!(event.id, "given");
        assert_eq!(event.timestamp, 7);
    }

    #[test]
    fn serializes_in_camel_case() {
        let event = TelemetryEvent::builder("s1", EventType::Stream, "llm", "token")
            .metadata("model", "opus")
            .build()
            .stamp(|| "e1".into(), 1);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["sessionId"], json!("s1"));
        assert_eq!(value["eventType"], json!("stream"));
        assert!(value.get("label").is_none());
    }

    #[test]
    fn raw_event_parses_without_identity() {
        let raw: RawEvent = serde_json::from_value(json!({
            "sessionId": "s",
            "eventType": "custom",
            "category": "ui",
            "action": "click"
        }))
        .unwrap();
        assert!(raw.id.is_none());
        assert!(raw.timestamp.is_none());
        assert_eq!(raw.event_type, EventType::Custom);
    }
}
