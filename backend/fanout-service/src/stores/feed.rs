//! Per-user timeline storage.
//!
//! Each user's timeline is an independent keyed structure; nothing here is
//! shared across users. Writes are idempotent per post id so the at-least-once
//! queue can redeliver a fan-out job without duplicating rows.
//!
//! Redis layout:
//! - `feed:{user_id}`           ZSET, member = post_id, score = timestamp
//! - `feed:data:{user_id}`      HASH, post_id -> serialized FeedEntry
//! - `feed:tombstone:{user_id}:{post_id}`  deletion marker with TTL

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{FeedEntry, FeedPage};

/// Timeline reads are capped at this many entries per page.
pub const MAX_READ_LIMIT: usize = 100;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FeedStore: Send + Sync {
    /// Insert `entry` into `user_id`'s timeline. Re-adding an existing
    /// `post_id` is a no-op success; a post id deleted within the tombstone
    /// window is not resurrected. Evicts the oldest entries beyond capacity.
    async fn add_entry(&self, user_id: Uuid, entry: FeedEntry) -> Result<()>;

    /// Remove the entry for `post_id` if present (no-op otherwise) and record
    /// a deletion tombstone so a late arriving add cannot resurrect it.
    async fn remove_entry(&self, user_id: Uuid, post_id: Uuid) -> Result<()>;

    /// Up to `limit` entries strictly older than `cursor` (newest first when
    /// no cursor is given), plus the cursor for the next page.
    async fn read(&self, user_id: Uuid, cursor: Option<i64>, limit: usize) -> Result<FeedPage>;
}

/// Redis-backed timeline store.
#[derive(Clone)]
pub struct RedisFeedStore {
    redis: ConnectionManager,
    capacity: usize,
    tombstone_ttl_secs: u64,
}

impl RedisFeedStore {
    pub fn new(redis: ConnectionManager, capacity: usize, tombstone_ttl_secs: u64) -> Self {
        Self {
            redis,
            capacity,
            tombstone_ttl_secs,
        }
    }

    fn feed_key(user_id: Uuid) -> String {
        format!("feed:{}", user_id)
    }

    fn data_key(user_id: Uuid) -> String {
        format!("feed:data:{}", user_id)
    }

    fn tombstone_key(user_id: Uuid, post_id: Uuid) -> String {
        format!("feed:tombstone:{}:{}", user_id, post_id)
    }

    /// Drop the oldest entries beyond the capacity bound, keeping the ZSET
    /// and payload hash in sync.
    async fn evict_overflow(&self, user_id: Uuid) -> Result<()> {
        let mut conn = self.redis.clone();
        let stop = -(self.capacity as isize) - 1;

        let surplus: Vec<String> = conn.zrange(Self::feed_key(user_id), 0, stop).await?;
        if surplus.is_empty() {
            return Ok(());
        }

        redis::pipe()
            .atomic()
            .zrem(Self::feed_key(user_id), surplus.clone())
            .ignore()
            .hdel(Self::data_key(user_id), surplus.clone())
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;

        debug!(
            user_id = %user_id,
            evicted = surplus.len(),
            "Evicted timeline entries beyond capacity"
        );
        Ok(())
    }
}

#[async_trait]
impl FeedStore for RedisFeedStore {
    async fn add_entry(&self, user_id: Uuid, entry: FeedEntry) -> Result<()> {
        let mut conn = self.redis.clone();

        let tombstoned: bool = conn
            .exists(Self::tombstone_key(user_id, entry.post_id))
            .await?;
        if tombstoned {
            debug!(
                user_id = %user_id,
                post_id = %entry.post_id,
                "Skipping add for tombstoned post"
            );
            return Ok(());
        }

        let payload = serde_json::to_string(&entry)?;
        let member = entry.post_id.to_string();

        // ZADD on an existing member is an update of the same score, HSET an
        // overwrite of the same payload, so redelivered adds are no-ops.
        redis::pipe()
            .atomic()
            .zadd(Self::feed_key(user_id), member.clone(), entry.timestamp)
            .ignore()
            .hset(Self::data_key(user_id), member, payload)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;

        self.evict_overflow(user_id).await
    }

    async fn remove_entry(&self, user_id: Uuid, post_id: Uuid) -> Result<()> {
        let mut conn = self.redis.clone();
        let member = post_id.to_string();

        redis::pipe()
            .atomic()
            .zrem(Self::feed_key(user_id), member.clone())
            .ignore()
            .hdel(Self::data_key(user_id), member)
            .ignore()
            .set_ex(
                Self::tombstone_key(user_id, post_id),
                1,
                self.tombstone_ttl_secs,
            )
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;

        Ok(())
    }

    async fn read(&self, user_id: Uuid, cursor: Option<i64>, limit: usize) -> Result<FeedPage> {
        let mut conn = self.redis.clone();
        let limit = limit.clamp(1, MAX_READ_LIMIT);

        // Exclusive upper bound keeps pages strictly older than the cursor.
        let max = match cursor {
            Some(ts) => format!("({}", ts),
            None => "+inf".to_string(),
        };

        let ids: Vec<String> = conn
            .zrevrangebyscore_limit(Self::feed_key(user_id), max, "-inf", 0, (limit + 1) as isize)
            .await?;

        if ids.is_empty() {
            return Ok(FeedPage::empty());
        }

        let has_more = ids.len() > limit;
        let ids: Vec<String> = ids.into_iter().take(limit).collect();

        // Explicit HMGET: the reply stays an array even for a single id.
        let payloads: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(Self::data_key(user_id))
            .arg(&ids)
            .query_async(&mut conn)
            .await?;

        let mut entries = Vec::with_capacity(ids.len());
        for (post_id, payload) in ids.iter().zip(payloads) {
            match payload {
                Some(json) => match serde_json::from_str::<FeedEntry>(&json) {
                    Ok(entry) => entries.push(entry),
                    Err(e) => {
                        warn!(user_id = %user_id, post_id = %post_id, error = %e, "Dropping undecodable timeline entry");
                    }
                },
                None => {
                    // Index and payload can briefly disagree around eviction.
                    warn!(user_id = %user_id, post_id = %post_id, "Timeline entry missing payload");
                }
            }
        }

        let cursor = entries.last().map(|e| e.timestamp);
        Ok(FeedPage {
            entries,
            cursor,
            has_more,
        })
    }
}

/// In-memory timeline store with the same semantics as the Redis store.
/// Used by tests; memory tombstones do not expire.
#[derive(Clone)]
pub struct MemoryFeedStore {
    inner: Arc<RwLock<HashMap<Uuid, UserFeed>>>,
    capacity: usize,
}

#[derive(Default)]
struct UserFeed {
    /// Kept sorted newest-first.
    entries: Vec<FeedEntry>,
    tombstones: HashSet<Uuid>,
}

impl MemoryFeedStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            capacity,
        }
    }

    pub async fn entry_count(&self, user_id: Uuid) -> usize {
        let guard = self.inner.read().await;
        guard.get(&user_id).map(|f| f.entries.len()).unwrap_or(0)
    }
}

impl Default for MemoryFeedStore {
    fn default() -> Self {
        Self::new(800)
    }
}

#[async_trait]
impl FeedStore for MemoryFeedStore {
    async fn add_entry(&self, user_id: Uuid, entry: FeedEntry) -> Result<()> {
        let mut guard = self.inner.write().await;
        let feed = guard.entry(user_id).or_default();

        if feed.tombstones.contains(&entry.post_id) {
            return Ok(());
        }
        if feed.entries.iter().any(|e| e.post_id == entry.post_id) {
            return Ok(());
        }

        feed.entries.push(entry);
        feed.entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        feed.entries.truncate(self.capacity);
        Ok(())
    }

    async fn remove_entry(&self, user_id: Uuid, post_id: Uuid) -> Result<()> {
        let mut guard = self.inner.write().await;
        let feed = guard.entry(user_id).or_default();
        feed.entries.retain(|e| e.post_id != post_id);
        feed.tombstones.insert(post_id);
        Ok(())
    }

    async fn read(&self, user_id: Uuid, cursor: Option<i64>, limit: usize) -> Result<FeedPage> {
        let limit = limit.clamp(1, MAX_READ_LIMIT);
        let guard = self.inner.read().await;

        let Some(feed) = guard.get(&user_id) else {
            return Ok(FeedPage::empty());
        };

        let mut entries: Vec<FeedEntry> = feed
            .entries
            .iter()
            .filter(|e| cursor.map(|c| e.timestamp < c).unwrap_or(true))
            .cloned()
            .collect();

        let has_more = entries.len() > limit;
        entries.truncate(limit);
        let cursor = entries.last().map(|e| e.timestamp);

        Ok(FeedPage {
            entries,
            cursor,
            has_more,
        })
    }
}
