//! The fan-out orchestrator.
//!
//! Converges every affected timeline and push hub to the state implied by one
//! `FanoutMessage`. The orchestrator holds no state across jobs; correctness
//! under redelivery comes from the stores' idempotent per-post operations.
//!
//! Shape of a job:
//! 1. The author's own timeline is written synchronously and first.
//! 2. Followers are fetched page by page and processed in fixed-size chunks;
//!    chunks run strictly sequentially, operations within a chunk
//!    concurrently, which bounds pressure on the store backend.
//! 3. Live push is dispatched off the critical path and never fails the job.
//!
//! Any timeline write error fails the whole job; the consumer retries it in
//! full with backoff, which is safe because redelivered writes are no-ops.

use std::sync::Arc;

use event_schema::{FanoutKind, FanoutMessage};
use futures::future::join_all;
use tracing::debug;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::metrics;
use crate::models::{EntrySource, FeedEntry};
use crate::stores::{FeedStore, SocialGraphStore};
use crate::websocket::{PushHub, PushMessage};

/// Metric label for a job kind.
pub fn kind_label(kind: FanoutKind) -> &'static str {
    match kind {
        FanoutKind::NewPost => "new_post",
        FanoutKind::DeletePost => "delete_post",
    }
}

pub struct FanoutService {
    feeds: Arc<dyn FeedStore>,
    graph: Arc<dyn SocialGraphStore>,
    hub: PushHub,
    chunk_size: usize,
    follower_page_size: usize,
}

impl FanoutService {
    pub fn new(
        feeds: Arc<dyn FeedStore>,
        graph: Arc<dyn SocialGraphStore>,
        hub: PushHub,
        chunk_size: usize,
        follower_page_size: usize,
    ) -> Self {
        Self {
            feeds,
            graph,
            hub,
            chunk_size: chunk_size.max(1),
            follower_page_size: follower_page_size.max(1),
        }
    }

    pub async fn process(&self, msg: &FanoutMessage) -> Result<()> {
        match msg.kind {
            FanoutKind::NewPost => self.fan_out_new_post(msg).await,
            FanoutKind::DeletePost => self.fan_out_delete_post(msg).await,
        }
    }

    async fn fan_out_new_post(&self, msg: &FanoutMessage) -> Result<()> {
        // Author first, so the author sees their own post even when follower
        // fan-out fails or is delayed.
        let own = FeedEntry::new(msg.post_id, msg.author_id, msg.timestamp, EntrySource::Own);
        self.feeds.add_entry(msg.author_id, own).await?;

        let mut offset = 0;
        let mut fanned: u64 = 0;
        loop {
            let (page, has_more) = self
                .graph
                .followers(msg.author_id, self.follower_page_size, offset)
                .await?;
            if page.is_empty() {
                break;
            }
            offset += page.len();

            // The author's timeline was already written above.
            let followers: Vec<Uuid> =
                page.into_iter().filter(|id| *id != msg.author_id).collect();

            for chunk in followers.chunks(self.chunk_size) {
                let results = join_all(chunk.iter().map(|follower| {
                    let follower = *follower;
                    let entry = FeedEntry::new(
                        msg.post_id,
                        msg.author_id,
                        msg.timestamp,
                        EntrySource::Follow,
                    );
                    async move {
                        self.feeds.add_entry(follower, entry).await?;
                        self.push_to_follower(follower, msg);
                        Ok::<(), AppError>(())
                    }
                }))
                .await;

                for result in results {
                    result?;
                }
                fanned += chunk.len() as u64;
            }

            if !has_more {
                break;
            }
        }

        metrics::record_fanout_targets(kind_label(msg.kind), fanned);
        debug!(
            post_id = %msg.post_id,
            author_id = %msg.author_id,
            followers = fanned,
            "Fan-out complete"
        );
        Ok(())
    }

    async fn fan_out_delete_post(&self, msg: &FanoutMessage) -> Result<()> {
        self.feeds.remove_entry(msg.author_id, msg.post_id).await?;

        let mut offset = 0;
        let mut fanned: u64 = 0;
        loop {
            let (page, has_more) = self
                .graph
                .followers(msg.author_id, self.follower_page_size, offset)
                .await?;
            if page.is_empty() {
                break;
            }
            offset += page.len();

            let followers: Vec<Uuid> =
                page.into_iter().filter(|id| *id != msg.author_id).collect();

            // No push for deletions; clients converge on the next read.
            for chunk in followers.chunks(self.chunk_size) {
                let results = join_all(
                    chunk
                        .iter()
                        .map(|follower| self.feeds.remove_entry(*follower, msg.post_id)),
                )
                .await;

                for result in results {
                    result?;
                }
                fanned += chunk.len() as u64;
            }

            if !has_more {
                break;
            }
        }

        metrics::record_fanout_targets(kind_label(msg.kind), fanned);
        debug!(
            post_id = %msg.post_id,
            author_id = %msg.author_id,
            followers = fanned,
            "Delete fan-out complete"
        );
        Ok(())
    }

    /// Live delivery is a convenience, not a correctness requirement: it runs
    /// off the critical path and its failures never reach the job result.
    fn push_to_follower(&self, follower: Uuid, msg: &FanoutMessage) {
        let hub = self.hub.clone();
        let push = PushMessage::post_published(
            msg.post_id,
            msg.author_id,
            msg.timestamp,
            EntrySource::Follow,
        );
        tokio::spawn(async move {
            let delivered = hub.broadcast_post(follower, push).await;
            metrics::record_push_broadcast(if delivered > 0 {
                "delivered"
            } else {
                "no_connection"
            });
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::feed::MockFeedStore;
    use crate::stores::graph::MockSocialGraphStore;
    use mockall::Sequence;

    fn service(
        feeds: MockFeedStore,
        graph: MockSocialGraphStore,
    ) -> FanoutService {
        FanoutService::new(Arc::new(feeds), Arc::new(graph), PushHub::new(), 5, 500)
    }

    #[tokio::test]
    async fn test_author_feed_written_before_followers_are_fetched() {
        let author = Uuid::new_v4();
        let follower = Uuid::new_v4();
        let mut seq = Sequence::new();

        let mut feeds = MockFeedStore::new();
        let mut graph = MockSocialGraphStore::new();

        feeds
            .expect_add_entry()
            .withf(move |user, entry| *user == author && entry.source == EntrySource::Own)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        graph
            .expect_followers()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |_, _, _| Ok((vec![follower], false)));
        feeds
            .expect_add_entry()
            .withf(move |user, entry| *user == follower && entry.source == EntrySource::Follow)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        let msg = FanoutMessage::new_post(Uuid::new_v4(), author, 1000);
        service(feeds, graph).process(&msg).await.unwrap();
    }

    #[tokio::test]
    async fn test_self_visibility_survives_follower_failures() {
        let author = Uuid::new_v4();
        let followers: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();

        let mut feeds = MockFeedStore::new();
        let mut graph = MockSocialGraphStore::new();

        feeds
            .expect_add_entry()
            .withf(move |user, entry| *user == author && entry.source == EntrySource::Own)
            .times(1)
            .returning(|_, _| Ok(()));
        feeds
            .expect_add_entry()
            .withf(move |user, _| *user != author)
            .returning(|_, _| Err(AppError::Internal("feed store down".into())));
        graph
            .expect_followers()
            .returning(move |_, _, _| Ok((followers.clone(), false)));

        let msg = FanoutMessage::new_post(Uuid::new_v4(), author, 1000);
        let result = service(feeds, graph).process(&msg).await;

        // The job fails (and will be retried), but the author's own write
        // already happened exactly once.
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_author_id_in_follower_set_is_skipped() {
        let author = Uuid::new_v4();
        let follower = Uuid::new_v4();

        let mut feeds = MockFeedStore::new();
        let mut graph = MockSocialGraphStore::new();

        feeds
            .expect_add_entry()
            .withf(move |user, entry| *user == author && entry.source == EntrySource::Own)
            .times(1)
            .returning(|_, _| Ok(()));
        feeds
            .expect_add_entry()
            .withf(move |user, entry| *user == follower && entry.source == EntrySource::Follow)
            .times(1)
            .returning(|_, _| Ok(()));
        // A stale graph may list the author as their own follower.
        graph
            .expect_followers()
            .returning(move |_, _, _| Ok((vec![author, follower], false)));

        let msg = FanoutMessage::new_post(Uuid::new_v4(), author, 1000);
        service(feeds, graph).process(&msg).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_removes_from_author_and_followers() {
        let author = Uuid::new_v4();
        let post_id = Uuid::new_v4();
        let followers: Vec<Uuid> = (0..2).map(|_| Uuid::new_v4()).collect();
        let expected = followers.clone();

        let mut feeds = MockFeedStore::new();
        let mut graph = MockSocialGraphStore::new();

        feeds
            .expect_remove_entry()
            .withf(move |user, post| *post == post_id && (*user == author || expected.contains(user)))
            .times(3)
            .returning(|_, _| Ok(()));
        graph
            .expect_followers()
            .returning(move |_, _, _| Ok((followers.clone(), false)));

        let msg = FanoutMessage::delete_post(post_id, author, 1000);
        service(feeds, graph).process(&msg).await.unwrap();
    }

    #[tokio::test]
    async fn test_follower_pages_are_drained() {
        let author = Uuid::new_v4();
        let first_page: Vec<Uuid> = (0..500).map(|_| Uuid::new_v4()).collect();
        let second_page: Vec<Uuid> = (0..7).map(|_| Uuid::new_v4()).collect();

        let mut feeds = MockFeedStore::new();
        let mut graph = MockSocialGraphStore::new();

        feeds.expect_add_entry().times(1 + 500 + 7).returning(|_, _| Ok(()));

        let first = first_page.clone();
        graph
            .expect_followers()
            .withf(|_, _, offset| *offset == 0)
            .times(1)
            .returning(move |_, _, _| Ok((first.clone(), true)));
        let second = second_page.clone();
        graph
            .expect_followers()
            .withf(|_, _, offset| *offset == 500)
            .times(1)
            .returning(move |_, _, _| Ok((second.clone(), false)));

        let msg = FanoutMessage::new_post(Uuid::new_v4(), author, 1000);
        service(feeds, graph).process(&msg).await.unwrap();
    }
}
