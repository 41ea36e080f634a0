//! Read-side interface to the social graph.
//!
//! The fan-out pipeline only reads follower sets; follow/unfollow mutation is
//! owned by the social service. Ban status is checked on the real-time
//! connection path before a socket is admitted.
//!
//! Redis layout:
//! - `graph:followers:{user_id}`  ZSET, member = follower id, score = follow time
//! - `graph:banned:{user_id}`     flag, "1" when banned

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

use crate::error::Result;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SocialGraphStore: Send + Sync {
    /// One page of follower ids in stable (follow-time) order, plus whether
    /// more pages remain.
    async fn followers(&self, user_id: Uuid, limit: usize, offset: usize)
        -> Result<(Vec<Uuid>, bool)>;

    /// Whether the account is banned.
    async fn is_banned(&self, user_id: Uuid) -> Result<bool>;
}

#[derive(Clone)]
pub struct RedisSocialGraphStore {
    redis: ConnectionManager,
}

impl RedisSocialGraphStore {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }

    fn followers_key(user_id: Uuid) -> String {
        format!("graph:followers:{}", user_id)
    }

    fn banned_key(user_id: Uuid) -> String {
        format!("graph:banned:{}", user_id)
    }
}

#[async_trait]
impl SocialGraphStore for RedisSocialGraphStore {
    async fn followers(
        &self,
        user_id: Uuid,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<Uuid>, bool)> {
        let mut conn = self.redis.clone();

        // Fetch one past the page to learn whether more remain.
        let raw: Vec<String> = conn
            .zrange(
                Self::followers_key(user_id),
                offset as isize,
                (offset + limit) as isize,
            )
            .await?;

        let has_more = raw.len() > limit;

        let mut ids = Vec::with_capacity(raw.len().min(limit));
        for member in raw.into_iter().take(limit) {
            match Uuid::parse_str(&member) {
                Ok(id) => ids.push(id),
                Err(_) => {
                    warn!(user_id = %user_id, member = %member, "Invalid follower id in graph store");
                }
            }
        }

        Ok((ids, has_more))
    }

    async fn is_banned(&self, user_id: Uuid) -> Result<bool> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn.get(Self::banned_key(user_id)).await?;
        Ok(matches!(value.as_deref(), Some("1") | Some("true")))
    }
}

/// In-memory graph store for tests; exposes the mutators the production
/// interface deliberately omits.
#[derive(Default, Clone)]
pub struct MemorySocialGraphStore {
    inner: Arc<RwLock<GraphState>>,
}

#[derive(Default)]
struct GraphState {
    /// Follower ids per user, in follow order.
    followers: HashMap<Uuid, Vec<Uuid>>,
    banned: HashSet<Uuid>,
}

impl MemorySocialGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_follower(&self, user_id: Uuid, follower_id: Uuid) {
        let mut guard = self.inner.write().await;
        let list = guard.followers.entry(user_id).or_default();
        if !list.contains(&follower_id) {
            list.push(follower_id);
        }
    }

    pub async fn set_banned(&self, user_id: Uuid, banned: bool) {
        let mut guard = self.inner.write().await;
        if banned {
            guard.banned.insert(user_id);
        } else {
            guard.banned.remove(&user_id);
        }
    }
}

#[async_trait]
impl SocialGraphStore for MemorySocialGraphStore {
    async fn followers(
        &self,
        user_id: Uuid,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<Uuid>, bool)> {
        let guard = self.inner.read().await;
        let all = guard.followers.get(&user_id).cloned().unwrap_or_default();

        let page: Vec<Uuid> = all.iter().skip(offset).take(limit).copied().collect();
        let has_more = offset + page.len() < all.len();
        Ok((page, has_more))
    }

    async fn is_banned(&self, user_id: Uuid) -> Result<bool> {
        let guard = self.inner.read().await;
        Ok(guard.banned.contains(&user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_formats() {
        let user_id = Uuid::new_v4();
        assert_eq!(
            RedisSocialGraphStore::followers_key(user_id),
            format!("graph:followers:{}", user_id)
        );
        assert_eq!(
            RedisSocialGraphStore::banned_key(user_id),
            format!("graph:banned:{}", user_id)
        );
    }

    #[tokio::test]
    async fn test_follower_pagination() {
        let store = MemorySocialGraphStore::new();
        let user = Uuid::new_v4();
        let followers: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        for f in &followers {
            store.add_follower(user, *f).await;
        }

        let (first, has_more) = store.followers(user, 2, 0).await.unwrap();
        assert_eq!(first, followers[..2]);
        assert!(has_more);

        let (last, has_more) = store.followers(user, 3, 2).await.unwrap();
        assert_eq!(last, followers[2..]);
        assert!(!has_more);
    }

    #[tokio::test]
    async fn test_duplicate_follow_is_ignored() {
        let store = MemorySocialGraphStore::new();
        let user = Uuid::new_v4();
        let follower = Uuid::new_v4();

        store.add_follower(user, follower).await;
        store.add_follower(user, follower).await;

        let (page, _) = store.followers(user, 10, 0).await.unwrap();
        assert_eq!(page.len(), 1);
    }

    #[tokio::test]
    async fn test_ban_flag() {
        let store = MemorySocialGraphStore::new();
        let user = Uuid::new_v4();

        assert!(!store.is_banned(user).await.unwrap());
        store.set_banned(user, true).await;
        assert!(store.is_banned(user).await.unwrap());
        store.set_banned(user, false).await;
        assert!(!store.is_banned(user).await.unwrap());
    }
}
