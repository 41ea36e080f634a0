use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Provenance tag on a timeline row. Display-only; never used for ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntrySource {
    /// Authored by the timeline owner.
    Own,
    /// From an account the owner follows.
    Follow,
    /// Friend-of-friend amplification.
    Fof,
}

/// One row in a user's timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedEntry {
    pub post_id: Uuid,
    pub author_id: Uuid,
    /// Milliseconds since epoch. Timelines are read newest-first on this key.
    pub timestamp: i64,
    pub source: EntrySource,
}

impl FeedEntry {
    pub fn new(post_id: Uuid, author_id: Uuid, timestamp: i64, source: EntrySource) -> Self {
        Self {
            post_id,
            author_id,
            timestamp,
            source,
        }
    }
}

/// One page of a timeline read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedPage {
    pub entries: Vec<FeedEntry>,
    /// Pass back as `cursor` to fetch strictly older entries.
    pub cursor: Option<i64>,
    pub has_more: bool,
}

impl FeedPage {
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
            cursor: None,
            has_more: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_wire_format() {
        assert_eq!(serde_json::to_string(&EntrySource::Own).unwrap(), "\"own\"");
        assert_eq!(
            serde_json::to_string(&EntrySource::Follow).unwrap(),
            "\"follow\""
        );
        assert_eq!(serde_json::to_string(&EntrySource::Fof).unwrap(), "\"fof\"");
    }

    #[test]
    fn test_feed_entry_round_trip() {
        let entry = FeedEntry::new(Uuid::new_v4(), Uuid::new_v4(), 1000, EntrySource::Follow);
        let json = serde_json::to_string(&entry).unwrap();
        let decoded: FeedEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, entry);
    }
}
