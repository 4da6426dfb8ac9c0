//! Events as they are appended to and read back from a brook.

use crate::types::{Position, Timestamp};
use nutype::nutype;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Globally unique identifier of one event occurrence.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        TryFrom,
        Serialize,
        Deserialize
    )
)]
pub struct EventId(String);

impl EventId {
    /// Generates a fresh, time-ordered identifier (UUIDv7).
    pub fn generate() -> Self {
        // A hyphenated UUID is never empty and always 36 characters long.
        Self::try_new(Uuid::now_v7().to_string()).expect("UUID text is always a valid event id")
    }
}

/// An immutable event, ready to be appended to a brook.
///
/// Ordering inside a stream is defined solely by the position the event is
/// assigned on append; `time` is informational.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrookEvent {
    /// Unique id of this occurrence.
    pub id: EventId,
    /// Event type name.
    pub event_type: String,
    /// Originating component.
    pub source: String,
    /// When the event occurred, if known.
    pub time: Option<Timestamp>,
    /// Serialized payload.
    pub data: Vec<u8>,
    /// MIME type of `data`.
    pub data_content_type: String,
    /// Denormalized length of `data`.
    pub data_size_bytes: u64,
}

impl BrookEvent {
    /// Creates an event, deriving `data_size_bytes` from the payload.
    pub fn new(
        id: EventId,
        event_type: impl Into<String>,
        source: impl Into<String>,
        data: Vec<u8>,
        data_content_type: impl Into<String>,
    ) -> Self {
        let data_size_bytes = u64::try_from(data.len()).unwrap_or(u64::MAX);
        Self {
            id,
            event_type: event_type.into(),
            source: source.into(),
            time: None,
            data,
            data_content_type: data_content_type.into(),
            data_size_bytes,
        }
    }

    /// Convenience constructor for JSON payloads.
    pub fn json<T: Serialize>(
        id: EventId,
        event_type: impl Into<String>,
        source: impl Into<String>,
        payload: &T,
    ) -> serde_json::Result<Self> {
        let data = serde_json::to_vec(payload)?;
        Ok(Self::new(id, event_type, source, data, "application/json"))
    }

    /// Sets the occurrence time.
    #[must_use]
    pub const fn with_time(mut self, time: Timestamp) -> Self {
        self.time = Some(time);
        self
    }
}

/// An event together with the position it was durably stored at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    /// Absolute position in the stream.
    pub position: Position,
    /// The event itself.
    pub event: BrookEvent,
}

impl StoredEvent {
    /// Pairs an event with its position.
    pub const fn new(position: Position, event: BrookEvent) -> Self {
        Self { position, event }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_event_records_payload_size() {
        let event = BrookEvent::new(
            EventId::generate(),
            "OrderPlaced",
            "orders",
            vec![1, 2, 3, 4],
            "application/octet-stream",
        );

        assert_eq!(event.data_size_bytes, 4);
        assert!(event.time.is_none());
    }

    #[test]
    fn json_event_serializes_payload() {
        let event = BrookEvent::json(
            EventId::try_new("evt-1").unwrap(),
            "OrderPlaced",
            "orders",
            &serde_json::json!({ "total": 12 }),
        )
        .unwrap();

        assert_eq!(event.data_content_type, "application/json");
        assert_eq!(event.data, br#"{"total":12}"#.to_vec());
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(EventId::generate(), EventId::generate());
    }

    #[test]
    fn event_id_rejects_blank_values() {
        assert!(EventId::try_new("   ").is_err());
    }
}
