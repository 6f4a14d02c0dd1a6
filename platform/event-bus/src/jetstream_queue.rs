//! JetStream implementation of the DurableQueue trait
//!
//! Each queue is a durable pull consumer on a stream that captures its
//! topic. The broker owns the lease: `ack_wait` is the visibility timeout,
//! a release is a NAK, and a delivery left unacknowledged past `ack_wait`
//! comes back on its own. Messages survive broker and consumer restarts.
//!
//! The delivery budget is enforced here rather than with `max_deliver`,
//! because the server silently stops redelivering at that limit. A message
//! whose last allowed delivery fails is written to [`PgDeadLetterStore`]
//! and terminated on the broker. `message_id` is derived from the stream
//! sequence, so every delivery of one stored message carries the same id.

use async_nats::jetstream::{
    self,
    consumer::{pull, AckPolicy, PullConsumer},
    stream, AckKind,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::collections::HashMap;
use std::fmt::Display;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::dead_letters::PgDeadLetterStore;
use crate::queue::{
    DeadLetter, DurableQueue, QueueConfig, QueueDepth, QueueError, QueueMessage, QueueResult,
};

const LEASE_EXPIRED: &str = "lease expired";

/// Where a queue's messages live on the broker
#[derive(Debug, Clone)]
pub struct StreamBinding {
    /// Stream name, created on first use
    pub stream: String,
    /// Subject `enqueue` publishes to
    pub subject: String,
    /// Subjects the stream captures and the consumer filters on
    pub subjects: Vec<String>,
}

impl StreamBinding {
    /// Bind a topic and everything below it (`policies`, `policies.>`)
    pub fn for_topic(stream: impl Into<String>, topic: &str) -> Self {
        Self {
            stream: stream.into(),
            subject: topic.to_string(),
            subjects: vec![topic.to_string(), format!("{}.>", topic)],
        }
    }
}

struct Lease {
    message: jetstream::Message,
    delivered: QueueMessage,
    subject: String,
    leased_until: Instant,
}

pub struct JetStreamQueue {
    config: QueueConfig,
    context: jetstream::Context,
    stream: stream::Stream,
    consumer: PullConsumer,
    subject: String,
    dead_letters: PgDeadLetterStore,
    leases: Mutex<HashMap<Uuid, Lease>>,
    /// Latest release reason per message, carried into the dead letter
    last_errors: Mutex<HashMap<Uuid, String>>,
}

fn unavailable(e: impl Display) -> QueueError {
    QueueError::Unavailable(e.to_string())
}

/// Stable id for every delivery of one stored message
pub fn message_id_for(stream_sequence: u64) -> Uuid {
    Uuid::from_u64_pair(0, stream_sequence)
}

/// Deliveries past the budget mean the last allowed lease ran out
fn over_budget(delivered: u32, max_receive_count: u32) -> bool {
    delivered > max_receive_count
}

fn lease_expired_reason(last_error: Option<&str>) -> String {
    match last_error {
        Some(last) => format!("{}; last error: {}", LEASE_EXPIRED, last),
        None => LEASE_EXPIRED.to_string(),
    }
}

impl JetStreamQueue {
    /// Create the stream and durable consumer if absent and bind a queue to them
    pub async fn declare(
        context: jetstream::Context,
        binding: StreamBinding,
        config: QueueConfig,
        dead_letters: PgDeadLetterStore,
    ) -> QueueResult<Self> {
        let stream = match context.get_stream(&binding.stream).await {
            Ok(stream) => stream,
            Err(_) => context
                .create_stream(stream::Config {
                    name: binding.stream.clone(),
                    subjects: binding.subjects.clone(),
                    ..Default::default()
                })
                .await
                .map_err(unavailable)?,
        };

        let consumer: PullConsumer = stream
            .get_or_create_consumer(
                &config.name,
                pull::Config {
                    durable_name: Some(config.name.clone()),
                    filter_subjects: binding.subjects.clone(),
                    ack_policy: AckPolicy::Explicit,
                    ack_wait: config.visibility_timeout,
                    max_deliver: -1,
                    ..Default::default()
                },
            )
            .await
            .map_err(unavailable)?;

        tracing::info!(
            queue = %config.name,
            stream = %binding.stream,
            subjects = ?binding.subjects,
            ack_wait_ms = config.visibility_timeout.as_millis() as u64,
            "Bound queue to JetStream consumer"
        );

        Ok(Self {
            config,
            context,
            stream,
            consumer,
            subject: binding.subject,
            dead_letters,
            leases: Mutex::new(HashMap::new()),
            last_errors: Mutex::new(HashMap::new()),
        })
    }

    /// Pull up to `max` deliveries; waits up to `wait` for the first when set
    async fn pull(&self, max: usize, wait: Option<Duration>) -> QueueResult<Vec<jetstream::Message>> {
        let mut batch = match wait {
            None => self.consumer.fetch().max_messages(max).messages().await,
            Some(wait) => {
                self.consumer
                    .batch()
                    .max_messages(max)
                    .expires(wait)
                    .messages()
                    .await
            }
        }
        .map_err(unavailable)?;

        let mut messages = Vec::new();
        while let Some(message) = batch.next().await {
            match message {
                Ok(message) => messages.push(message),
                Err(e) if messages.is_empty() => return Err(unavailable(e)),
                Err(e) => {
                    tracing::warn!(queue = %self.config.name, error = %e, "JetStream pull ended early");
                    break;
                }
            }
        }
        Ok(messages)
    }

    /// Turn a delivery into a leased message, or dead-letter it when over budget
    async fn lease(&self, message: jetstream::Message) -> QueueResult<Option<QueueMessage>> {
        let (sequence, delivered, enqueued_at) = {
            let info = message.info().map_err(unavailable)?;
            let published = info.published;
            (
                info.stream_sequence,
                info.delivered.clamp(1, u32::MAX as i64) as u32,
                DateTime::from_timestamp(published.unix_timestamp(), published.nanosecond())
                    .unwrap_or_else(Utc::now),
            )
        };
        let message_id = message_id_for(sequence);
        let subject = message.subject.to_string();
        let last_error = self.last_errors.lock().await.get(&message_id).cloned();

        let mut delivered_message = QueueMessage {
            message_id,
            body: message.payload.to_vec(),
            receive_count: delivered,
            enqueued_at,
            lease_expires_at: None,
            last_error,
        };

        if over_budget(delivered, self.config.max_receive_count) {
            tracing::warn!(
                queue = %self.config.name,
                message_id = %message_id,
                "Message lease expired without acknowledgment"
            );
            delivered_message.receive_count = self.config.max_receive_count;
            let reason = lease_expired_reason(delivered_message.last_error.as_deref());
            if let Err(e) = self
                .move_to_dead_letter(&message, &subject, &delivered_message, &reason)
                .await
            {
                // Left unacknowledged, so it comes back after ack_wait
                tracing::error!(
                    queue = %self.config.name,
                    message_id = %message_id,
                    error = %e,
                    "Failed to dead-letter exhausted message"
                );
            }
            return Ok(None);
        }

        let visibility = self.config.visibility_timeout;
        delivered_message.lease_expires_at = Some(
            Utc::now()
                + chrono::Duration::from_std(visibility)
                    .unwrap_or_else(|_| chrono::Duration::seconds(30)),
        );

        self.leases.lock().await.insert(
            message_id,
            Lease {
                message,
                delivered: delivered_message.clone(),
                subject,
                leased_until: Instant::now() + visibility,
            },
        );
        Ok(Some(delivered_message))
    }

    async fn move_to_dead_letter(
        &self,
        message: &jetstream::Message,
        subject: &str,
        delivered: &QueueMessage,
        reason: &str,
    ) -> QueueResult<()> {
        self.dead_letters
            .insert(&self.config.name, subject, delivered, reason)
            .await
            .map_err(unavailable)?;
        message.ack_with(AckKind::Term).await.map_err(unavailable)?;
        self.last_errors.lock().await.remove(&delivered.message_id);

        let envelope = delivered.envelope().ok();
        tracing::error!(
            queue = %self.config.name,
            message_id = %delivered.message_id,
            subject = %subject,
            event_id = %envelope.as_ref().map(|e| e.event_id.as_str()).unwrap_or("unparseable"),
            event_type = %envelope.as_ref().map(|e| e.event_type.as_str()).unwrap_or("unknown"),
            trace_id = %envelope.as_ref().map(|e| e.trace_id.as_str()).unwrap_or("none"),
            receive_count = delivered.receive_count,
            max_receive_count = self.config.max_receive_count,
            reason = %reason,
            body = %String::from_utf8_lossy(&delivered.body),
            "Message moved to dead-letter destination"
        );
        Ok(())
    }

    /// Forget leases long past expiry; the broker has redelivered them by now
    async fn prune_leases(&self) {
        let now = Instant::now();
        let grace = self.config.visibility_timeout;
        self.leases
            .lock()
            .await
            .retain(|_, lease| lease.leased_until + grace > now);
    }
}

#[async_trait]
impl DurableQueue for JetStreamQueue {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn config(&self) -> &QueueConfig {
        &self.config
    }

    async fn enqueue(&self, body: Vec<u8>) -> QueueResult<Uuid> {
        let ack = self
            .context
            .publish(self.subject.clone(), body.into())
            .await
            .map_err(unavailable)?
            .await
            .map_err(unavailable)?;
        Ok(message_id_for(ack.sequence))
    }

    async fn receive(&self, max_batch: usize, wait_time: Duration) -> QueueResult<Vec<QueueMessage>> {
        if max_batch == 0 {
            return Ok(Vec::new());
        }
        self.prune_leases().await;

        let mut deliveries = self.pull(max_batch, None).await?;
        if deliveries.is_empty() && !wait_time.is_zero() {
            deliveries = self.pull(1, Some(wait_time)).await?;
            if !deliveries.is_empty() && max_batch > 1 {
                deliveries.extend(self.pull(max_batch - 1, None).await?);
            }
        }

        let mut batch = Vec::with_capacity(deliveries.len());
        for message in deliveries {
            if let Some(leased) = self.lease(message).await? {
                batch.push(leased);
            }
        }

        if !batch.is_empty() {
            tracing::debug!(queue = %self.config.name, count = batch.len(), "Leased messages");
        }
        Ok(batch)
    }

    async fn acknowledge(&self, message_id: Uuid) -> QueueResult<()> {
        let lease = self
            .leases
            .lock()
            .await
            .remove(&message_id)
            .ok_or(QueueError::UnknownMessage(message_id))?;
        lease.message.ack().await.map_err(unavailable)?;
        self.last_errors.lock().await.remove(&message_id);

        tracing::debug!(queue = %self.config.name, message_id = %message_id, "Message acknowledged");
        Ok(())
    }

    async fn release(&self, message_id: Uuid, reason: &str) -> QueueResult<()> {
        let lease = self
            .leases
            .lock()
            .await
            .remove(&message_id)
            .ok_or(QueueError::UnknownMessage(message_id))?;
        if lease.leased_until <= Instant::now() {
            return Err(QueueError::NotLeased(message_id));
        }

        self.last_errors
            .lock()
            .await
            .insert(message_id, reason.to_string());

        tracing::debug!(
            queue = %self.config.name,
            message_id = %message_id,
            reason = %reason,
            "Message released for redelivery"
        );

        if lease.delivered.receive_count >= self.config.max_receive_count {
            let mut delivered = lease.delivered;
            delivered.last_error = Some(reason.to_string());
            delivered.lease_expires_at = None;
            return self
                .move_to_dead_letter(&lease.message, &lease.subject, &delivered, reason)
                .await;
        }

        lease
            .message
            .ack_with(AckKind::Nak(None))
            .await
            .map_err(unavailable)
    }

    async fn dead_letters(&self) -> QueueResult<Vec<DeadLetter>> {
        let stored = self
            .dead_letters
            .list(&self.config.name)
            .await
            .map_err(unavailable)?;
        Ok(stored.into_iter().map(|s| s.dead_letter).collect())
    }

    /// Republish the body on its original subject. The redriven copy is a new
    /// stream entry, so it gets a new `message_id` and a fresh budget.
    async fn redrive(&self, message_id: Uuid) -> QueueResult<()> {
        let stored = self
            .dead_letters
            .get(&self.config.name, message_id)
            .await
            .map_err(unavailable)?
            .ok_or(QueueError::NotDeadLettered(message_id))?;

        let ack = self
            .context
            .publish(stored.subject.clone(), stored.dead_letter.message.body.into())
            .await
            .map_err(unavailable)?
            .await
            .map_err(unavailable)?;
        self.dead_letters
            .delete(&self.config.name, message_id)
            .await
            .map_err(unavailable)?;

        tracing::info!(
            queue = %self.config.name,
            message_id = %message_id,
            new_message_id = %message_id_for(ack.sequence),
            subject = %stored.subject,
            "Dead letter redriven"
        );
        Ok(())
    }

    async fn depth(&self) -> QueueResult<QueueDepth> {
        let info = self
            .stream
            .consumer_info(&self.config.name)
            .await
            .map_err(unavailable)?;
        let dead_lettered = self
            .dead_letters
            .count(&self.config.name)
            .await
            .map_err(unavailable)?;

        Ok(QueueDepth {
            available: info.num_pending as usize,
            in_flight: info.num_ack_pending,
            dead_lettered,
        })
    }
}
