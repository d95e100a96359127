//! The event wire shape: validated at construction, immutable after.
//!
//! An [`Event`] that fails validation never exists — construction is
//! all-or-nothing. Equality and hashing are by id.

use crate::error::EventError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Hard cap on the serialized payload size.
pub const MAX_EVENT_PAYLOAD_BYTES: usize = 1_048_576;

/// A validated `namespace.action` event type.
///
/// Exactly one dot, no whitespace anywhere, non-empty on both sides.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EventType(String);

impl EventType {
    pub fn new(raw: impl Into<String>) -> Result<Self, EventError> {
        let raw = raw.into();
        if raw.chars().any(char::is_whitespace) {
            return Err(EventError::InvalidType(raw));
        }
        match raw.split_once('.') {
            Some((ns, action))
                if !ns.is_empty() && !action.is_empty() && !action.contains('.') =>
            {
                Ok(EventType(raw))
            }
            _ => Err(EventError::InvalidType(raw)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn namespace(&self) -> &str {
        // Safe: validated to contain a dot at construction.
        self.0.split_once('.').map(|(ns, _)| ns).unwrap_or(&self.0)
    }

    pub fn action(&self) -> &str {
        self.0.split_once('.').map(|(_, a)| a).unwrap_or(&self.0)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for EventType {
    type Error = EventError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        EventType::new(value)
    }
}

impl From<EventType> for String {
    fn from(ty: EventType) -> String {
        ty.0
    }
}

impl std::str::FromStr for EventType {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::new(s)
    }
}

/// An immutable domain event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// UTC; round-trips through RFC 3339.
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl Event {
    /// Build and validate an event. Fails if the type string is malformed,
    /// the payload is not serializable, or its serialized form exceeds
    /// [`MAX_EVENT_PAYLOAD_BYTES`].
    pub fn new(event_type: &str, data: impl Serialize) -> Result<Self, EventError> {
        let event_type = EventType::new(event_type)?;
        let data = serde_json::to_value(data)?;
        let size = serde_json::to_vec(&data)?.len();
        if size > MAX_EVENT_PAYLOAD_BYTES {
            return Err(EventError::PayloadTooLarge {
                size,
                limit: MAX_EVENT_PAYLOAD_BYTES,
            });
        }
        Ok(Event {
            id: Uuid::new_v4(),
            event_type,
            timestamp: Utc::now(),
            data,
            correlation_id: None,
            source: None,
        })
    }

    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

// Identity is the id; two events with equal ids are the same event.
impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Event {}

impl std::hash::Hash for Event {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn valid_type_parses() {
        let ty = EventType::new("game.points_awarded").unwrap();
        assert_eq!(ty.namespace(), "game");
        assert_eq!(ty.action(), "points_awarded");
    }

    #[test]
    fn malformed_types_are_rejected() {
        for raw in ["invalid", "a.b.c", ".leading", "trailing.", "has space.x", "", "."] {
            assert!(
                EventType::new(raw).is_err(),
                "`{raw}` should fail validation"
            );
        }
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let big = "x".repeat(MAX_EVENT_PAYLOAD_BYTES + 1);
        let err = Event::new("game.blob", json!({ "blob": big })).unwrap_err();
        assert!(matches!(err, EventError::PayloadTooLarge { .. }));
    }

    #[test]
    fn event_survives_serde_round_trip() {
        let event = Event::new("game.points_awarded", json!({ "user_id": 1, "points": 50 }))
            .unwrap()
            .with_source("points_ledger");

        let encoded = serde_json::to_string(&event).unwrap();
        let decoded: Event = serde_json::from_str(&encoded).unwrap();

        assert_eq!(event, decoded);
        assert_eq!(decoded.event_type.as_str(), "game.points_awarded");
        assert_eq!(decoded.timestamp, event.timestamp);
        assert_eq!(decoded.data, event.data);
        assert_eq!(decoded.source.as_deref(), Some("points_ledger"));
    }

    #[test]
    fn equality_is_by_id() {
        let a = Event::new("game.a", json!({})).unwrap();
        let mut b = a.clone();
        b.data = json!({ "altered": true });
        assert_eq!(a, b);

        let c = Event::new("game.a", json!({})).unwrap();
        assert_ne!(a, c);
    }
}
