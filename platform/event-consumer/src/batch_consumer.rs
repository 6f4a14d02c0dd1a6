//! Batch consumer
//!
//! Per batch cycle:
//!
//! 1. lease up to `batch_size` messages, long-polling for the first and then
//!    accumulating for at most `batching_window`
//! 2. for every message independently: parse, reserve `event_id`, run the
//!    handler under `sink_timeout`, complete the reservation, acknowledge
//! 3. any failure releases that message only; the queue dead-letters it once
//!    its delivery budget is spent
//!
//! A message whose `event_id` is reserved by another delivery is deferred:
//! neither acked nor released, so it returns only after its lease runs out.
//! Reservations and handler calls never outlast the message's lease.
//!
//! At most `maximum_concurrency` batches are in flight per consumer.

use chrono::Utc;
use event_bus::{Backoff, DeliveryConfig, DurableQueue, EventEnvelope, QueueMessage};
use futures::future::join_all;
use futures::FutureExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

use crate::handler::{HandlerError, MessageHandler};
use crate::idempotency::{IdempotencyStore, RecordState, Reservation};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    pub batch_size: usize,
    /// How long to keep accumulating once the first message of a batch arrived
    pub batching_window: Duration,
    /// Long-poll wait for the first message of a batch
    pub receive_wait: Duration,
    /// Batches in flight at once
    pub maximum_concurrency: usize,
    /// Bound on one handler call, independent of the queue lease
    pub sink_timeout: Duration,
    /// How long an idempotency reservation blocks other consumers
    pub reservation_ttl: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self::from_delivery(&DeliveryConfig::default())
    }
}

impl ConsumerConfig {
    pub fn from_delivery(delivery: &DeliveryConfig) -> Self {
        Self {
            batch_size: delivery.batch_size,
            batching_window: delivery.batching_window,
            receive_wait: Duration::from_secs(5),
            maximum_concurrency: delivery.maximum_concurrency,
            sink_timeout: Duration::from_secs(10),
            reservation_ttl: delivery.visibility_timeout,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(30),
        }
    }

    pub fn with_sink_timeout(mut self, sink_timeout: Duration) -> Self {
        self.sink_timeout = sink_timeout;
        self
    }

    pub fn with_receive_wait(mut self, receive_wait: Duration) -> Self {
        self.receive_wait = receive_wait;
        self
    }
}

/// What happened to one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Side effects applied and acknowledged
    Ingested,
    /// Already applied earlier; acknowledged without side effects
    Duplicate,
    /// Handed back to the queue for redelivery or dead-lettering
    Released { reason: String },
    /// Left leased; redelivered once the lease expires
    Deferred { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageFailure {
    pub message_id: Uuid,
    /// `None` when the body never parsed
    pub event_id: Option<String>,
    pub receive_count: u32,
    pub reason: String,
}

/// Per-batch summary
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub received: usize,
    pub ingested: usize,
    pub duplicates: usize,
    pub released: usize,
    pub deferred: usize,
    pub failures: Vec<MessageFailure>,
}

impl BatchReport {
    /// Ids of the messages that were handed back
    pub fn batch_item_failures(&self) -> Vec<Uuid> {
        self.failures.iter().map(|f| f.message_id).collect()
    }

    fn record(&mut self, message: &QueueMessage, event_id: Option<String>, outcome: MessageOutcome) {
        match outcome {
            MessageOutcome::Ingested => self.ingested += 1,
            MessageOutcome::Duplicate => self.duplicates += 1,
            MessageOutcome::Deferred { .. } => self.deferred += 1,
            MessageOutcome::Released { reason } => {
                self.released += 1;
                self.failures.push(MessageFailure {
                    message_id: message.message_id,
                    event_id,
                    receive_count: message.receive_count,
                    reason,
                });
            }
        }
    }
}

/// Leases batches from one queue and applies a handler idempotently
pub struct BatchConsumer {
    queue: Arc<dyn DurableQueue>,
    idempotency: Arc<dyn IdempotencyStore>,
    handler: Arc<dyn MessageHandler>,
    config: ConsumerConfig,
}

impl BatchConsumer {
    pub fn new(
        queue: Arc<dyn DurableQueue>,
        idempotency: Arc<dyn IdempotencyStore>,
        handler: Arc<dyn MessageHandler>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            queue,
            idempotency,
            handler,
            config,
        }
    }

    pub fn queue_name(&self) -> &str {
        self.queue.name()
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Lease one batch and process it. Returns an empty report when nothing arrived.
    pub async fn poll_once(&self) -> Result<BatchReport, event_bus::QueueError> {
        let first = self
            .queue
            .receive(self.config.batch_size, self.config.receive_wait)
            .await?;
        if first.is_empty() {
            return Ok(BatchReport::default());
        }
        let batch = self.fill_batch(first).await;
        Ok(self.process_batch(batch).await)
    }

    /// Top a partial batch up until it is full or the batching window closes
    async fn fill_batch(&self, mut batch: Vec<QueueMessage>) -> Vec<QueueMessage> {
        let deadline = Instant::now() + self.config.batching_window;

        while batch.len() < self.config.batch_size {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            match self
                .queue
                .receive(self.config.batch_size - batch.len(), remaining)
                .await
            {
                Ok(more) if more.is_empty() => break,
                Ok(more) => batch.extend(more),
                Err(e) => {
                    tracing::warn!(
                        queue = %self.queue.name(),
                        error = %e,
                        "Receive failed while filling batch, processing partial batch"
                    );
                    break;
                }
            }
        }

        batch
    }

    /// Process every message of a batch concurrently, isolating failures
    pub async fn process_batch(&self, batch: Vec<QueueMessage>) -> BatchReport {
        let outcomes = join_all(batch.iter().map(|message| self.process_message(message))).await;

        let mut report = BatchReport {
            received: batch.len(),
            ..BatchReport::default()
        };
        for (message, (event_id, outcome)) in batch.iter().zip(outcomes) {
            report.record(message, event_id, outcome);
        }

        tracing::info!(
            queue = %self.queue.name(),
            received = report.received,
            ingested = report.ingested,
            duplicates = report.duplicates,
            released = report.released,
            deferred = report.deferred,
            "Batch processed"
        );
        report
    }

    /// Process one message to a terminal ack or release.
    ///
    /// Also returns the parsed `event_id`, if the body parsed.
    pub async fn process_message(&self, message: &QueueMessage) -> (Option<String>, MessageOutcome) {
        let envelope = match message.envelope() {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(
                    queue = %self.queue.name(),
                    message_id = %message.message_id,
                    receive_count = message.receive_count,
                    error = %e,
                    body = %String::from_utf8_lossy(&message.body),
                    "Malformed envelope"
                );
                let reason = format!("malformed envelope: {}", e);
                return (None, self.release(message, reason).await);
            }
        };

        let span = tracing::info_span!(
            "process_message",
            event_id = %envelope.event_id,
            event_type = %envelope.event_type,
            trace_id = %envelope.trace_id,
            queue = %self.queue.name(),
            receive_count = message.receive_count,
        );

        let event_id = envelope.event_id.clone();
        let outcome = self
            .apply_idempotently(message, &envelope)
            .instrument(span)
            .await;
        (Some(event_id), outcome)
    }

    async fn apply_idempotently(&self, message: &QueueMessage, envelope: &EventEnvelope) -> MessageOutcome {
        let key = envelope.event_id.as_str();

        let lease_left = lease_remaining(message);
        if lease_left.is_some_and(|left| left.is_zero()) {
            tracing::warn!("Lease expired before processing started");
            return MessageOutcome::Deferred {
                reason: "lease expired before processing".to_string(),
            };
        }
        let reservation_ttl = lease_left.map_or(self.config.reservation_ttl, |left| {
            left.min(self.config.reservation_ttl)
        });

        let reservation = match self.idempotency.check_and_reserve(key, reservation_ttl).await {
            Ok(reservation) => reservation,
            Err(e) => {
                tracing::error!(error = %e, "Idempotency store unavailable");
                return self
                    .release(message, format!("idempotency store unavailable: {}", e))
                    .await;
            }
        };

        let token = match reservation {
            Reservation::Duplicate(record) if record.state == RecordState::Completed => {
                tracing::info!("Duplicate event, already ingested");
                self.acknowledge(message).await;
                return MessageOutcome::Duplicate;
            }
            Reservation::Duplicate(record) => {
                tracing::info!(
                    reserved_until = ?record.reserved_until,
                    "Event is being ingested by another delivery, waiting out the lease"
                );
                return MessageOutcome::Deferred {
                    reason: "reserved by another consumer".to_string(),
                };
            }
            Reservation::New(token) => token,
        };

        let sink_timeout = lease_left.map_or(self.config.sink_timeout, |left| {
            left.min(self.config.sink_timeout)
        });
        match self.run_handler(envelope, sink_timeout).await {
            Ok(snapshot) => {
                if let Err(e) = self.idempotency.complete(key, token, snapshot).await {
                    tracing::error!(error = %e, "Failed to record completion");
                    self.abandon(key, token).await;
                    return self
                        .release(message, format!("failed to record completion: {}", e))
                        .await;
                }
                self.acknowledge(message).await;
                tracing::info!("Event ingested");
                MessageOutcome::Ingested
            }
            Err(e) => {
                self.abandon(key, token).await;
                if e.is_permanent() {
                    tracing::warn!(error = %e, "Event rejected by handler");
                } else {
                    tracing::warn!(error = %e, "Handler failed, releasing for retry");
                }
                self.release(message, e.to_string()).await
            }
        }
    }

    async fn run_handler(
        &self,
        envelope: &EventEnvelope,
        sink_timeout: Duration,
    ) -> Result<Option<Value>, HandlerError> {
        match tokio::time::timeout(sink_timeout, self.handler.handle(envelope)).await {
            Ok(result) => result,
            Err(_) => Err(HandlerError::Transient(format!(
                "sink timeout after {}ms",
                sink_timeout.as_millis()
            ))),
        }
    }

    async fn acknowledge(&self, message: &QueueMessage) {
        if let Err(e) = self.queue.acknowledge(message.message_id).await {
            // Lease already lost; the redelivery will be deduplicated
            tracing::warn!(message_id = %message.message_id, error = %e, "Acknowledge failed");
        }
    }

    async fn release(&self, message: &QueueMessage, reason: String) -> MessageOutcome {
        if let Err(e) = self.queue.release(message.message_id, &reason).await {
            tracing::warn!(message_id = %message.message_id, error = %e, "Release failed");
        }
        MessageOutcome::Released { reason }
    }

    async fn abandon(&self, key: &str, token: Uuid) {
        if let Err(e) = self.idempotency.abandon(key, token).await {
            tracing::warn!(key = %key, error = %e, "Failed to abandon reservation");
        }
    }

    /// Consume until `shutdown` flips to `true`.
    ///
    /// Stops leasing new batches on shutdown and waits for in-flight batches,
    /// which ack or release every message they hold.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            queue = %self.queue.name(),
            batch_size = self.config.batch_size,
            maximum_concurrency = self.config.maximum_concurrency,
            "Starting batch consumer"
        );

        let permits = Arc::new(Semaphore::new(self.config.maximum_concurrency.max(1)));
        let mut in_flight: JoinSet<BatchReport> = JoinSet::new();
        let mut backoff = Backoff::new(self.config.initial_backoff, self.config.max_backoff);

        loop {
            while let Some(finished) = in_flight.join_next().now_or_never().flatten() {
                if let Err(e) = finished {
                    tracing::error!(queue = %self.queue.name(), error = %e, "Batch task failed");
                }
            }

            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            let received = tokio::select! {
                received = self.queue.receive(self.config.batch_size, self.config.receive_wait) => received,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            match received {
                Ok(first) if first.is_empty() => {
                    backoff.reset();
                }
                Ok(first) => {
                    backoff.reset();
                    let batch = self.fill_batch(first).await;
                    let consumer = self.clone();
                    in_flight.spawn(async move {
                        let report = consumer.process_batch(batch).await;
                        drop(permit);
                        report
                    });
                }
                Err(e) => {
                    drop(permit);
                    let delay = backoff.next_delay();
                    tracing::error!(
                        queue = %self.queue.name(),
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Queue receive failed, backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        let draining = in_flight.len();
        if draining > 0 {
            tracing::info!(queue = %self.queue.name(), batches = draining, "Waiting for in-flight batches");
        }
        while let Some(finished) = in_flight.join_next().await {
            if let Err(e) = finished {
                tracing::error!(queue = %self.queue.name(), error = %e, "Batch task failed");
            }
        }

        tracing::info!(queue = %self.queue.name(), "Batch consumer stopped");
    }
}

/// Time left on the message's lease; `None` when the queue reported no expiry
fn lease_remaining(message: &QueueMessage) -> Option<Duration> {
    message
        .lease_expires_at
        .map(|expires_at| (expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_follows_delivery_settings() {
        let delivery = DeliveryConfig {
            batch_size: 25,
            maximum_concurrency: 2,
            visibility_timeout: Duration::from_secs(90),
            ..DeliveryConfig::default()
        };
        let config = ConsumerConfig::from_delivery(&delivery);

        assert_eq!(config.batch_size, 25);
        assert_eq!(config.maximum_concurrency, 2);
        assert_eq!(config.reservation_ttl, Duration::from_secs(90));
        assert!(config.sink_timeout < config.reservation_ttl);
    }

    #[test]
    fn test_report_lists_failed_message_ids() {
        let message = QueueMessage {
            message_id: Uuid::new_v4(),
            body: Vec::new(),
            receive_count: 2,
            enqueued_at: Utc::now(),
            lease_expires_at: None,
            last_error: None,
        };

        let mut report = BatchReport::default();
        report.record(&message, None, MessageOutcome::Ingested);
        report.record(
            &message,
            Some("E1".to_string()),
            MessageOutcome::Released {
                reason: "transient: search down".to_string(),
            },
        );

        assert_eq!(report.ingested, 1);
        assert_eq!(report.released, 1);
        assert_eq!(report.batch_item_failures(), vec![message.message_id]);
        assert_eq!(report.failures[0].receive_count, 2);

        report.record(
            &message,
            Some("E2".to_string()),
            MessageOutcome::Deferred {
                reason: "reserved by another consumer".to_string(),
            },
        );
        assert_eq!(report.deferred, 1);
        assert_eq!(report.failures.len(), 1);
    }

    #[test]
    fn test_lease_remaining_clamps_expired_lease() {
        let mut message = QueueMessage {
            message_id: Uuid::new_v4(),
            body: Vec::new(),
            receive_count: 1,
            enqueued_at: Utc::now(),
            lease_expires_at: None,
            last_error: None,
        };
        assert_eq!(lease_remaining(&message), None);

        message.lease_expires_at = Some(Utc::now() - chrono::Duration::seconds(5));
        assert_eq!(lease_remaining(&message), Some(Duration::ZERO));

        message.lease_expires_at = Some(Utc::now() + chrono::Duration::seconds(60));
        let left = lease_remaining(&message).unwrap();
        assert!(left > Duration::from_secs(50) && left <= Duration::from_secs(60));
    }
}
