//! Fan-out stream consumer.
//!
//! Leases jobs from the fan-out stream, runs them through the orchestrator,
//! and acks only after full success. A failed job is parked in the delayed
//! retry set with exponential backoff and the delivery acked; the parked copy
//! carries the incremented attempt count. A consumer that dies mid-job never
//! acks, so the delivery is reclaimed after the visibility timeout. Either
//! path redelivers the whole job; store idempotency absorbs the duplicates.

use std::sync::Arc;
use std::time::{Duration, Instant};

use event_schema::{EventEnvelope, FanoutMessage};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::error::{AppError, Result};
use crate::metrics;
use crate::queue::{FanoutQueue, QueuedMessage, RetryPolicy};
use crate::services::fanout::{kind_label, FanoutService};

/// How often parked retries are promoted back onto the stream.
const PROMOTE_INTERVAL: Duration = Duration::from_secs(5);
/// How often deliveries abandoned by dead consumers are reclaimed.
const RECLAIM_INTERVAL: Duration = Duration::from_secs(30);
/// How often the stream is trimmed to its growth bound.
const TRIM_INTERVAL: Duration = Duration::from_secs(3600);
const STREAM_MAX_LEN: usize = 100_000;

pub struct FanoutConsumer {
    queue: FanoutQueue,
    service: Arc<FanoutService>,
    retry_policy: RetryPolicy,
    max_attempts: u32,
}

impl FanoutConsumer {
    pub fn new(
        queue: FanoutQueue,
        service: Arc<FanoutService>,
        retry_policy: RetryPolicy,
        max_attempts: u32,
    ) -> Self {
        Self {
            queue,
            service,
            retry_policy,
            max_attempts,
        }
    }

    pub async fn run(self) -> Result<()> {
        self.queue.ensure_group().await?;
        info!(
            stream = %self.queue.config().stream,
            group = %self.queue.config().group,
            consumer = %self.queue.config().consumer_name,
            "Fan-out consumer started"
        );

        let mut promote = interval(PROMOTE_INTERVAL);
        let mut reclaim = interval(RECLAIM_INTERVAL);
        let mut trim = interval(TRIM_INTERVAL);

        loop {
            tokio::select! {
                batch = self.queue.read_batch() => {
                    match batch {
                        Ok(messages) => {
                            for message in messages {
                                self.handle_message(message).await;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Stream read failed");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
                _ = promote.tick() => {
                    if let Err(e) = self.queue.promote_due_retries().await {
                        warn!(error = %e, "Retry promotion failed");
                    }
                }
                _ = reclaim.tick() => {
                    match self.queue.claim_stale().await {
                        Ok(stale) => {
                            for message in stale {
                                self.handle_message(message).await;
                            }
                        }
                        Err(e) => warn!(error = %e, "Stale delivery reclaim failed"),
                    }
                }
                _ = trim.tick() => {
                    if let Err(e) = self.queue.trim(STREAM_MAX_LEN).await {
                        warn!(error = %e, "Stream trim failed");
                    }
                }
            }
        }
    }

    async fn handle_message(&self, message: QueuedMessage) {
        match EventEnvelope::<FanoutMessage>::from_json(&message.payload) {
            Ok(envelope)
                if event_schema::is_compatible(
                    event_schema::SCHEMA_VERSION,
                    envelope.schema_version,
                ) =>
            {
                let kind = kind_label(envelope.data.kind);
                let started = Instant::now();

                match self.service.process(&envelope.data).await {
                    Ok(()) => {
                        metrics::observe_job_duration(kind, started.elapsed());
                        match self.queue.ack(&message.stream_id).await {
                            Ok(()) => {
                                metrics::record_job(kind, "acked");
                                debug!(
                                    event_id = %envelope.event_id,
                                    post_id = %envelope.data.post_id,
                                    attempt = message.attempt,
                                    "Fan-out job acked"
                                );
                            }
                            Err(e) => {
                                // The lease expires and the job redelivers;
                                // idempotent writes make the rerun a no-op.
                                warn!(error = %e, stream_id = %message.stream_id, "Ack failed");
                            }
                        }
                    }
                    Err(e) => {
                        metrics::observe_job_duration(kind, started.elapsed());
                        warn!(
                            error = %e,
                            event_id = %envelope.event_id,
                            post_id = %envelope.data.post_id,
                            attempt = message.attempt,
                            retryable = e.is_retryable(),
                            "Fan-out job failed"
                        );
                        self.retry_or_dead(&message, kind, &e).await;
                    }
                }
            }
            Ok(envelope) => {
                warn!(
                    schema_version = envelope.schema_version,
                    stream_id = %message.stream_id,
                    "Incompatible event schema version"
                );
                let cause = AppError::Queue("incompatible schema version".into());
                self.retry_or_dead(&message, "unknown", &cause).await;
            }
            Err(e) => {
                // Malformed payloads are not distinguished from transient
                // failures; they ride the same backoff until dead-lettered.
                warn!(error = %e, stream_id = %message.stream_id, "Undecodable fan-out message");
                let cause = AppError::Serialization(e);
                self.retry_or_dead(&message, "unknown", &cause).await;
            }
        }
    }

    async fn retry_or_dead(&self, message: &QueuedMessage, kind: &str, cause: &AppError) {
        if message.attempt >= self.max_attempts {
            error!(
                attempt = message.attempt,
                stream_id = %message.stream_id,
                cause = %cause,
                "Fan-out job exhausted retries, dead-lettering"
            );
            if let Err(e) = self
                .queue
                .dead_letter(&message.payload, message.attempt, cause)
                .await
            {
                // Leave the delivery pending; the lease redelivers it.
                warn!(error = %e, "Dead-letter write failed");
                return;
            }
            if let Err(e) = self.queue.ack(&message.stream_id).await {
                warn!(error = %e, stream_id = %message.stream_id, "Ack after dead-letter failed");
                return;
            }
            metrics::record_job(kind, "dead");
        } else {
            let delay = self.retry_policy.delay(message.attempt);
            if let Err(e) = self
                .queue
                .schedule_retry(&message.payload, message.attempt + 1, delay)
                .await
            {
                // Leave the delivery pending; the lease redelivers it.
                warn!(error = %e, "Retry scheduling failed, leaving delivery pending");
                return;
            }
            if let Err(e) = self.queue.ack(&message.stream_id).await {
                warn!(error = %e, stream_id = %message.stream_id, "Ack after retry scheduling failed");
                return;
            }
            metrics::record_job(kind, "retried");
        }
    }
}
