//! Data models for published and stored events.
//!
//! `Event` is the shape accepted at ingress; `StoredRecord` is what the
//! store hands back. Both serialize to the same JSON object.

use chrono::{DateTime, Datelike, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::AggregatorError;

/// Structured event payload. Only JSON objects are accepted at ingress.
pub type Payload = Map<String, Value>;

/// A single event as published by an external producer.
///
/// Identity is the pair `(topic, event_id)`; the same `event_id` under two
/// topics names two different events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Logical stream the event belongs to
    pub topic: String,

    /// Producer-assigned identifier, unique within a topic
    pub event_id: String,

    /// When the event happened, normalized to UTC
    pub timestamp: DateTime<Utc>,

    /// Free-form producer name
    pub source: String,

    /// Arbitrary structured body
    pub payload: Payload,
}

impl Event {
    /// Validate the event before it is allowed onto the queue.
    pub fn validate(&self) -> Result<(), AggregatorError> {
        if self.event_id.is_empty() {
            return Err(AggregatorError::Validation("empty event_id".into()));
        }
        // Four-digit years only
        if !(0..=9999).contains(&self.timestamp.year()) {
            return Err(AggregatorError::Validation(format!(
                "timestamp out of range: {}",
                self.timestamp
            )));
        }
        Ok(())
    }
}

/// Persisted projection of an event. Never updated after it is written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub topic: String,
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub payload: Payload,
}

/// Request body for the publish endpoint: one event or a list of them.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PublishBody {
    One(Event),
    Many(Vec<Event>),
}

impl PublishBody {
    /// Flatten into a list of events.
    #[must_use]
    pub fn into_events(self) -> Vec<Event> {
        match self {
            Self::One(event) => vec![event],
            Self::Many(events) => events,
        }
    }
}

/// Render a timestamp the way it is stored.
///
/// Fixed nanosecond precision in UTC keeps lexical and chronological
/// order identical, so the store can sort on the text column.
#[must_use]
pub fn storage_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parse a timestamp previously written by [`storage_timestamp`].
pub fn parse_storage_timestamp(raw: &str) -> Result<DateTime<Utc>, AggregatorError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| AggregatorError::InvalidData(format!("bad timestamp '{raw}': {e}")))
}
