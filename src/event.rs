//! Events flowing through the pipeline and the positions assigned to them

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Log,
    Meter,
    Trace,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Log => write!(f, "log"),
            EventType::Meter => write!(f, "meter"),
            EventType::Trace => write!(f, "trace"),
        }
    }
}

/// Immutable unit of telemetry data.
///
/// The payload is opaque to the pipeline. `key`, when present, is the
/// logical stream the event belongs to and drives key-hash routing.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub event_type: EventType,
    /// Arrival time in unix milliseconds
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

impl Event {
    pub fn new(event_type: EventType, payload: Vec<u8>) -> Self {
        Self {
            event_type,
            timestamp: current_timestamp_millis(),
            key: None,
            payload,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Claim that everything up to and including `position` in `partition`
/// has been delivered downstream.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Offset {
    pub partition: usize,
    pub position: u64,
}

impl Offset {
    pub fn new(partition: usize, position: u64) -> Self {
        Self { partition, position }
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.partition, self.position)
    }
}

/// An event accepted by the queue, stamped with its offset.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SequenceEvent {
    pub offset: Offset,
    pub event: Event,
}

impl SequenceEvent {
    pub fn partition(&self) -> usize {
        self.offset.partition
    }

    pub fn position(&self) -> u64 {
        self.offset.position
    }
}

/// Current time in milliseconds since the Unix epoch
pub fn current_timestamp_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_builder() {
        let event = Event::new(EventType::Meter, b"cpu=0.5".to_vec())
            .with_key("svc-a")
            .with_timestamp(42);

        assert_eq!(event.event_type, EventType::Meter);
        assert_eq!(event.key.as_deref(), Some("svc-a"));
        assert_eq!(event.timestamp, 42);
    }

    #[test]
    fn test_event_type_serializes_lowercase() {
        let json = serde_json::to_string(&EventType::Trace).unwrap();
        assert_eq!(json, "\"trace\"");
        assert_eq!(EventType::Log.to_string(), "log");
    }

    #[test]
    fn test_keyless_event_omits_key() {
        let event = Event::new(EventType::Log, vec![1, 2]).with_timestamp(7);
        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("key").is_none());
        assert_eq!(json["timestamp"], 7);
    }

    #[test]
    fn test_offset_display() {
        let offset = Offset::new(3, 17);
        assert_eq!(offset.to_string(), "3@17");
    }
}
