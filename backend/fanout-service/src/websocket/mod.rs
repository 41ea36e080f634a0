use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{
    mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    RwLock,
};
use uuid::Uuid;

pub mod messages;
pub mod session;

pub use messages::PushMessage;
pub use session::PushSession;

/// Type alias for a live connection's message sender
pub type PushSender = UnboundedSender<PushMessage>;

/// Unique identifier for one live connection.
///
/// Each WebSocket connection gets its own id when it registers, allowing
/// precise cleanup when that connection closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

struct Subscriber {
    id: SubscriberId,
    sender: PushSender,
}

/// Per-user registry of live connections.
///
/// Holds every open socket for a user and forwards freshly fanned-out posts
/// to them. Each user's connection list is its own synchronization domain;
/// there is no cross-user shared state beyond the map itself.
#[derive(Default, Clone)]
pub struct PushHub {
    // user_id -> list of live connections
    inner: Arc<RwLock<HashMap<Uuid, Vec<Subscriber>>>>,
}

impl PushHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection for `user_id`.
    ///
    /// Returns the subscriber id (used for cleanup) and the channel the
    /// connection reads broadcasts from.
    pub async fn subscribe(&self, user_id: Uuid) -> (SubscriberId, UnboundedReceiver<PushMessage>) {
        let (tx, rx) = unbounded_channel();
        let subscriber_id = SubscriberId::new();

        let mut guard = self.inner.write().await;
        guard.entry(user_id).or_default().push(Subscriber {
            id: subscriber_id,
            sender: tx,
        });

        tracing::debug!(
            user_id = %user_id,
            connections = guard.get(&user_id).map(|v| v.len()).unwrap_or(0),
            "Registered live connection"
        );

        (subscriber_id, rx)
    }

    /// Remove one connection. Must be called when a socket closes to avoid
    /// leaking senders; empty users are dropped from the map.
    pub async fn unsubscribe(&self, user_id: Uuid, subscriber_id: SubscriberId) {
        let mut guard = self.inner.write().await;

        if let Some(subscribers) = guard.get_mut(&user_id) {
            subscribers.retain(|s| s.id != subscriber_id);
            if subscribers.is_empty() {
                guard.remove(&user_id);
            }
        }
    }

    /// Forward a post to every live connection of `user_id`.
    ///
    /// Never fails: connections whose receiver is gone are pruned lazily.
    /// Returns the number of connections the message was delivered to.
    pub async fn broadcast_post(&self, user_id: Uuid, msg: PushMessage) -> usize {
        let mut guard = self.inner.write().await;

        let Some(subscribers) = guard.get_mut(&user_id) else {
            return 0;
        };

        let before = subscribers.len();
        subscribers.retain(|s| s.sender.send(msg.clone()).is_ok());
        let delivered = subscribers.len();

        if delivered < before {
            tracing::debug!(
                user_id = %user_id,
                pruned = before - delivered,
                "Pruned dead connections during broadcast"
            );
        }
        if subscribers.is_empty() {
            guard.remove(&user_id);
        }

        delivered
    }

    /// Number of live connections for one user.
    pub async fn connection_count(&self, user_id: Uuid) -> usize {
        let guard = self.inner.read().await;
        guard.get(&user_id).map(|v| v.len()).unwrap_or(0)
    }

    /// Total live connections across all users.
    pub async fn total_connections(&self) -> usize {
        let guard = self.inner.read().await;
        guard.values().map(|v| v.len()).sum()
    }

    /// Number of users with at least one live connection.
    pub async fn connected_users_count(&self) -> usize {
        let guard = self.inner.read().await;
        guard.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribe_and_count() {
        let hub = PushHub::new();
        let user = Uuid::new_v4();

        let (_id, _rx) = hub.subscribe(user).await;
        assert_eq!(hub.connection_count(user).await, 1);
        assert_eq!(hub.connected_users_count().await, 1);
    }

    #[tokio::test]
    async fn test_multiple_connections_same_user() {
        let hub = PushHub::new();
        let user = Uuid::new_v4();

        let _conns: Vec<_> = [hub.subscribe(user).await, hub.subscribe(user).await, hub.subscribe(user).await].into();
        assert_eq!(hub.connection_count(user).await, 3);
        assert_eq!(hub.total_connections().await, 3);
        assert_eq!(hub.connected_users_count().await, 1);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_connections() {
        let hub = PushHub::new();
        let user = Uuid::new_v4();

        let (_id1, mut rx1) = hub.subscribe(user).await;
        let (_id2, mut rx2) = hub.subscribe(user).await;

        let msg = PushMessage::post_published(
            Uuid::new_v4(),
            Uuid::new_v4(),
            1000,
            crate::models::EntrySource::Follow,
        );
        let delivered = hub.broadcast_post(user, msg.clone()).await;
        assert_eq!(delivered, 2);

        assert_eq!(rx1.recv().await.unwrap(), msg);
        assert_eq!(rx2.recv().await.unwrap(), msg);
    }

    #[tokio::test]
    async fn test_broadcast_no_connections() {
        let hub = PushHub::new();
        let delivered = hub
            .broadcast_post(Uuid::new_v4(), PushMessage::ping())
            .await;
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn test_broadcast_prunes_dead_connections() {
        let hub = PushHub::new();
        let user = Uuid::new_v4();

        let (_id1, rx1) = hub.subscribe(user).await;
        let (_id2, mut rx2) = hub.subscribe(user).await;
        drop(rx1);

        let delivered = hub.broadcast_post(user, PushMessage::ping()).await;
        assert_eq!(delivered, 1);
        assert_eq!(hub.connection_count(user).await, 1);
        assert!(matches!(rx2.recv().await, Some(PushMessage::Ping { .. })));
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_only_that_connection() {
        let hub = PushHub::new();
        let user = Uuid::new_v4();

        let (id1, _rx1) = hub.subscribe(user).await;
        let (_id2, _rx2) = hub.subscribe(user).await;

        hub.unsubscribe(user, id1).await;
        assert_eq!(hub.connection_count(user).await, 1);

        hub.unsubscribe(user, id1).await; // repeated cleanup is harmless
        assert_eq!(hub.connection_count(user).await, 1);
    }

    #[tokio::test]
    async fn test_empty_user_removed_from_registry() {
        let hub = PushHub::new();
        let user = Uuid::new_v4();

        let (id, _rx) = hub.subscribe(user).await;
        hub.unsubscribe(user, id).await;

        assert_eq!(hub.connected_users_count().await, 0);
        assert_eq!(hub.total_connections().await, 0);
    }
}
