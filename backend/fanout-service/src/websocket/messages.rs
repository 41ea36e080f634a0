use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::EntrySource;

/// Frames exchanged with live clients. Serialized as tagged JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushMessage {
    /// A post just landed in the receiving user's timeline.
    PostPublished {
        post_id: Uuid,
        author_id: Uuid,
        timestamp: i64,
        source: EntrySource,
    },
    /// Sent once after a successful upgrade.
    Connected { timestamp: i64 },
    Ping { timestamp: i64 },
    Pong { timestamp: i64 },
    Error { code: String, message: String },
}

impl PushMessage {
    pub fn post_published(
        post_id: Uuid,
        author_id: Uuid,
        timestamp: i64,
        source: EntrySource,
    ) -> Self {
        Self::PostPublished {
            post_id,
            author_id,
            timestamp,
            source,
        }
    }

    pub fn connected() -> Self {
        Self::Connected {
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn ping() -> Self {
        Self::Ping {
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn pong() -> Self {
        Self::Pong {
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_post_published_wire_format() {
        let msg = PushMessage::post_published(Uuid::nil(), Uuid::nil(), 1000, EntrySource::Follow);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"post_published\""));
        assert!(json.contains("\"source\":\"follow\""));

        let decoded: PushMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_ping_pong_round_trip() {
        let json = serde_json::to_string(&PushMessage::ping()).unwrap();
        assert!(json.contains("\"type\":\"ping\""));
        let decoded: PushMessage = serde_json::from_str(&json).unwrap();
        assert!(matches!(decoded, PushMessage::Ping { .. }));
    }
}
