use chrono::{DateTime, Utc};
/// Event schema registry for the Pulse fan-out pipeline.
///
/// This library defines versioned event schemas shared between the post
/// ingress (producer side) and the fan-out consumer. Each envelope carries a
/// required `schema_version` field so payload incompatibilities are caught
/// as services evolve.
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

/// Current schema version for all events
pub const SCHEMA_VERSION: u32 = 1;

/// Stream and consumer-group names shared by producer and consumer.
pub mod streams {
    /// Main fan-out job stream.
    pub const FANOUT_EVENTS: &str = "fanout:events";
    /// Sorted set holding delayed retries (score = due time, unix seconds).
    pub const FANOUT_RETRY: &str = "fanout:retry";
    /// Dead-letter stream for messages that exhausted their retry budget.
    pub const FANOUT_DEAD: &str = "fanout:dead";
    /// Default consumer group on the fan-out stream.
    pub const FANOUT_GROUP: &str = "fanout-workers";
}

/// Base event envelope for all queued messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope<T> {
    /// Unique event ID for idempotency and tracing
    pub event_id: Uuid,
    /// Event timestamp
    pub timestamp: DateTime<Utc>,
    /// Schema version for compatibility checking
    pub schema_version: u32,
    /// Source service that generated the event
    pub source: String,
    /// Actual event payload
    pub data: T,
}

impl<T> EventEnvelope<T> {
    pub fn new(source: impl Into<String>, data: T) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            schema_version: SCHEMA_VERSION,
            source: source.into(),
            data,
        }
    }
}

impl<T: Serialize> EventEnvelope<T> {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl<T: DeserializeOwned> EventEnvelope<T> {
    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

// ============================================================================
// FAN-OUT EVENTS
// ============================================================================

/// What a fan-out job does to each affected timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanoutKind {
    NewPost,
    DeletePost,
}

/// One fan-out job: propagate a published or deleted post to the author's
/// followers. Produced once per publish/delete action by the post service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanoutMessage {
    pub kind: FanoutKind,
    pub post_id: Uuid,
    pub author_id: Uuid,
    /// Post creation time, milliseconds since epoch. Timeline ordering key.
    pub timestamp: i64,
}

impl FanoutMessage {
    pub fn new_post(post_id: Uuid, author_id: Uuid, timestamp: i64) -> Self {
        Self {
            kind: FanoutKind::NewPost,
            post_id,
            author_id,
            timestamp,
        }
    }

    pub fn delete_post(post_id: Uuid, author_id: Uuid, timestamp: i64) -> Self {
        Self {
            kind: FanoutKind::DeletePost,
            post_id,
            author_id,
            timestamp,
        }
    }
}

// ============================================================================
// Version compatibility helpers
// ============================================================================

pub fn is_compatible(current_version: u32, message_version: u32) -> bool {
    // For now, enforce exact version match
    current_version == message_version
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_envelope_creation() {
        let msg = FanoutMessage::new_post(Uuid::new_v4(), Uuid::new_v4(), 1_700_000_000_000);
        let envelope = EventEnvelope::new("content-service", msg);
        assert_eq!(envelope.schema_version, SCHEMA_VERSION);
        assert_eq!(envelope.source, "content-service");
    }

    #[test]
    fn test_fanout_message_round_trip() {
        let post_id = Uuid::new_v4();
        let author_id = Uuid::new_v4();
        let envelope = EventEnvelope::new(
            "content-service",
            FanoutMessage::delete_post(post_id, author_id, 1234),
        );

        let json = envelope.to_json().unwrap();
        let decoded: EventEnvelope<FanoutMessage> = EventEnvelope::from_json(&json).unwrap();

        assert_eq!(decoded.event_id, envelope.event_id);
        assert_eq!(decoded.data.kind, FanoutKind::DeletePost);
        assert_eq!(decoded.data.post_id, post_id);
        assert_eq!(decoded.data.author_id, author_id);
        assert_eq!(decoded.data.timestamp, 1234);
    }

    #[test]
    fn test_kind_wire_format() {
        let json = serde_json::to_string(&FanoutKind::NewPost).unwrap();
        assert_eq!(json, "\"new_post\"");
        let json = serde_json::to_string(&FanoutKind::DeletePost).unwrap();
        assert_eq!(json, "\"delete_post\"");
    }

    #[test]
    fn test_version_compatibility() {
        assert!(is_compatible(SCHEMA_VERSION, SCHEMA_VERSION));
        assert!(!is_compatible(1, 2));
    }
}
