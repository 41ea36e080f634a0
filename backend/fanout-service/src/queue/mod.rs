//! Durable fan-out job queue on Redis Streams.
//!
//! At-least-once contract: jobs are leased to this instance's consumer group
//! entry via XREADGROUP and stay pending until explicitly XACKed. A failed
//! job is re-enqueued through a delayed-retry sorted set (score = due time)
//! and the original delivery is acked; a worker that dies mid-job leaves its
//! delivery pending, and another instance reclaims it with XCLAIM once the
//! visibility timeout expires. Jobs that exhaust their attempt budget move to
//! a dead-letter stream.

use std::collections::HashMap;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{AppError, Result};

/// How long a stream read blocks waiting for new jobs (ms).
const READ_BLOCK_MS: usize = 5000;
/// Retries promoted back onto the stream per promoter pass.
const PROMOTE_BATCH: isize = 100;

/// Exponential backoff schedule for failed fan-out jobs.
///
/// The delay before attempt `n + 1` is `base ^ n` seconds, capped at `max`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_secs: u64,
    pub max_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_secs: 30,
            max_secs: 3600,
        }
    }
}

impl RetryPolicy {
    pub fn new(base_secs: u64, max_secs: u64) -> Self {
        Self { base_secs, max_secs }
    }

    /// Delay to apply after `attempt` failed deliveries.
    pub fn delay(&self, attempt: u32) -> Duration {
        let secs = self
            .base_secs
            .checked_pow(attempt)
            .unwrap_or(self.max_secs);
        Duration::from_secs(secs.min(self.max_secs))
    }
}

/// Configuration for the fan-out stream consumer.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub stream: String,
    pub retry_set: String,
    pub dead_stream: String,
    /// Consumer group name
    pub group: String,
    /// Consumer name (instance ID)
    pub consumer_name: String,
    /// Batch size for reading messages
    pub batch_size: usize,
    /// Idle time after which a pending delivery may be reclaimed.
    pub visibility_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            stream: event_schema::streams::FANOUT_EVENTS.to_string(),
            retry_set: event_schema::streams::FANOUT_RETRY.to_string(),
            dead_stream: event_schema::streams::FANOUT_DEAD.to_string(),
            group: event_schema::streams::FANOUT_GROUP.to_string(),
            consumer_name: format!("instance-{}", uuid::Uuid::new_v4()),
            batch_size: 16,
            visibility_timeout: Duration::from_secs(60),
        }
    }
}

/// One delivery leased from the stream. `attempt` starts at 1 and is carried
/// on the entry so it survives redelivery across instances.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub stream_id: String,
    pub attempt: u32,
    pub payload: String,
}

/// Entry parked in the delayed-retry set.
#[derive(Debug, Serialize, Deserialize)]
struct RetryEntry {
    attempt: u32,
    payload: String,
}

#[derive(Clone)]
pub struct FanoutQueue {
    redis: ConnectionManager,
    config: QueueConfig,
}

impl FanoutQueue {
    pub fn new(redis: ConnectionManager, config: QueueConfig) -> Self {
        Self { redis, config }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Create the consumer group (idempotent).
    pub async fn ensure_group(&self) -> Result<()> {
        let mut conn = self.redis.clone();

        // Ignore BUSYGROUP when the group already exists.
        let _: std::result::Result<(), _> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.config.stream)
            .arg(&self.config.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        Ok(())
    }

    /// Enqueue a new job. Returns the stream entry id.
    pub async fn publish(&self, payload: &str) -> Result<String> {
        self.enqueue_with_attempt(payload, 1).await
    }

    async fn enqueue_with_attempt(&self, payload: &str, attempt: u32) -> Result<String> {
        let mut conn = self.redis.clone();
        let entry_id: String = conn
            .xadd(
                &self.config.stream,
                "*",
                &[
                    ("payload", payload.to_string()),
                    ("attempt", attempt.to_string()),
                ],
            )
            .await?;
        Ok(entry_id)
    }

    /// Lease a batch of new jobs for this consumer. Blocks briefly when the
    /// stream is empty.
    pub async fn read_batch(&self) -> Result<Vec<QueuedMessage>> {
        let mut conn = self.redis.clone();

        let options = StreamReadOptions::default()
            .group(&self.config.group, &self.config.consumer_name)
            .count(self.config.batch_size)
            .block(READ_BLOCK_MS);

        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&self.config.stream], &[">"], &options)
            .await?;

        let Some(reply) = reply else {
            return Ok(Vec::new());
        };

        let mut messages = Vec::new();
        for key in reply.keys {
            for entry in key.ids {
                let Some(payload) = entry.get::<String>("payload") else {
                    warn!(stream_id = %entry.id, "Stream entry missing payload, acking away");
                    self.ack(&entry.id).await?;
                    continue;
                };
                let attempt = entry.get::<u32>("attempt").unwrap_or(1);
                messages.push(QueuedMessage {
                    stream_id: entry.id,
                    attempt,
                    payload,
                });
            }
        }

        Ok(messages)
    }

    /// Acknowledge a delivery as fully processed.
    pub async fn ack(&self, stream_id: &str) -> Result<()> {
        let mut conn = self.redis.clone();
        let _: i64 = conn
            .xack(&self.config.stream, &self.config.group, &[stream_id])
            .await?;
        Ok(())
    }

    /// Park a failed job in the retry set, due after `delay`.
    pub async fn schedule_retry(
        &self,
        payload: &str,
        next_attempt: u32,
        delay: Duration,
    ) -> Result<()> {
        let mut conn = self.redis.clone();

        let member = serde_json::to_string(&RetryEntry {
            attempt: next_attempt,
            payload: payload.to_string(),
        })?;
        let due = chrono::Utc::now().timestamp() + delay.as_secs() as i64;

        let _: i64 = conn.zadd(&self.config.retry_set, member, due).await?;
        debug!(
            next_attempt = next_attempt,
            delay_secs = delay.as_secs(),
            "Scheduled fan-out retry"
        );
        Ok(())
    }

    /// Move due retries back onto the stream. Returns how many were promoted.
    pub async fn promote_due_retries(&self) -> Result<usize> {
        let mut conn = self.redis.clone();
        let now = chrono::Utc::now().timestamp();

        let members: Vec<String> = conn
            .zrangebyscore_limit(&self.config.retry_set, "-inf", now, 0, PROMOTE_BATCH)
            .await?;

        let mut promoted = 0;
        for member in members {
            match serde_json::from_str::<RetryEntry>(&member) {
                Ok(entry) => {
                    self.enqueue_with_attempt(&entry.payload, entry.attempt)
                        .await?;
                    promoted += 1;
                }
                Err(e) => {
                    warn!(error = %e, "Dropping undecodable retry entry");
                }
            }
            let _: i64 = conn.zrem(&self.config.retry_set, member).await?;
        }

        Ok(promoted)
    }

    /// Reclaim deliveries another consumer leased but never acked within the
    /// visibility timeout (crashed or hung worker).
    pub async fn claim_stale(&self) -> Result<Vec<QueuedMessage>> {
        let mut conn = self.redis.clone();
        let idle_ms = self.config.visibility_timeout.as_millis() as u64;

        let pending: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(&self.config.stream)
            .arg(&self.config.group)
            .arg("IDLE")
            .arg(idle_ms)
            .arg("-")
            .arg("+")
            .arg(self.config.batch_size)
            .query_async(&mut conn)
            .await?;

        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = pending.into_iter().map(|(id, ..)| id).collect();

        let claimed: Vec<(String, HashMap<String, String>)> = redis::cmd("XCLAIM")
            .arg(&self.config.stream)
            .arg(&self.config.group)
            .arg(&self.config.consumer_name)
            .arg(idle_ms)
            .arg(&ids)
            .query_async(&mut conn)
            .await?;

        let mut messages = Vec::new();
        for (stream_id, fields) in claimed {
            let Some(payload) = fields.get("payload").cloned() else {
                warn!(stream_id = %stream_id, "Reclaimed entry missing payload, acking away");
                self.ack(&stream_id).await?;
                continue;
            };
            let attempt = fields
                .get("attempt")
                .and_then(|a| a.parse().ok())
                .unwrap_or(1);
            messages.push(QueuedMessage {
                stream_id,
                attempt,
                payload,
            });
        }

        if !messages.is_empty() {
            debug!(count = messages.len(), "Reclaimed stale deliveries");
        }
        Ok(messages)
    }

    /// Record a job that exhausted its retry budget.
    pub async fn dead_letter(&self, payload: &str, attempt: u32, error: &AppError) -> Result<()> {
        let mut conn = self.redis.clone();
        let _: String = conn
            .xadd(
                &self.config.dead_stream,
                "*",
                &[
                    ("payload", payload.to_string()),
                    ("attempt", attempt.to_string()),
                    ("error", error.to_string()),
                ],
            )
            .await?;
        Ok(())
    }

    /// Bound stream growth with approximate trimming.
    pub async fn trim(&self, max_len: usize) -> Result<()> {
        let mut conn = self.redis.clone();
        let _: i64 = redis::cmd("XTRIM")
            .arg(&self.config.stream)
            .arg("MAXLEN")
            .arg("~")
            .arg(max_len)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_secs(30));
        assert_eq!(policy.delay(2), Duration::from_secs(900));
        // 30^3 = 27000 exceeds the one-hour cap
        assert_eq!(policy.delay(3), Duration::from_secs(3600));
        assert_eq!(policy.delay(10), Duration::from_secs(3600));
    }

    #[test]
    fn test_backoff_is_monotonic_and_capped() {
        let policy = RetryPolicy::default();
        let mut previous = Duration::ZERO;
        for attempt in 0..32 {
            let delay = policy.delay(attempt);
            assert!(delay >= previous, "delay shrank at attempt {}", attempt);
            assert!(delay <= Duration::from_secs(policy.max_secs));
            previous = delay;
        }
    }

    #[test]
    fn test_backoff_overflow_saturates_at_cap() {
        let policy = RetryPolicy::new(30, 3600);
        // u64::MAX overflow territory
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(3600));
    }

    #[test]
    fn test_retry_entry_round_trip() {
        let entry = RetryEntry {
            attempt: 3,
            payload: "{\"k\":1}".to_string(),
        };
        let json = serde_json::to_string(&entry).unwrap();
        let decoded: RetryEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.attempt, 3);
        assert_eq!(decoded.payload, entry.payload);
    }

    #[test]
    fn test_queue_config_defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.stream, "fanout:events");
        assert_eq!(config.retry_set, "fanout:retry");
        assert_eq!(config.dead_stream, "fanout:dead");
        assert_eq!(config.group, "fanout-workers");
        assert!(config.consumer_name.starts_with("instance-"));
    }
}
