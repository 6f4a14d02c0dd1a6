//! In-memory implementation of the DurableQueue trait
//!
//! Suitable for:
//! - Unit and integration tests (no external dependencies)
//! - Single-process deployments where the broker and consumers share a runtime
//!
//! Messages survive consumer failures (lease expiry, release) but not process
//! restarts; producers rely on the outbox to re-publish anything unacknowledged.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use crate::queue::{
    DeadLetter, DurableQueue, QueueConfig, QueueDepth, QueueError, QueueMessage, QueueResult,
};

const LEASE_EXPIRED: &str = "lease expired";

struct Entry {
    message: QueueMessage,
    leased_until: Option<Instant>,
}

#[derive(Default)]
struct State {
    /// Live messages keyed by insertion sequence
    live: BTreeMap<u64, Entry>,
    index: HashMap<Uuid, u64>,
    dead: BTreeMap<u64, DeadLetter>,
    dead_index: HashMap<Uuid, u64>,
}

/// DurableQueue implementation backed by process memory
///
/// # Example
/// ```rust
/// use event_bus::{DurableQueue, InMemoryQueue, QueueConfig};
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let queue = InMemoryQueue::new(QueueConfig::new("policies-ingest"));
/// let id = queue.enqueue(b"{}".to_vec()).await?;
///
/// let batch = queue.receive(10, Duration::from_millis(100)).await?;
/// assert_eq!(batch[0].message_id, id);
/// queue.acknowledge(id).await?;
/// # Ok(())
/// # }
/// ```
pub struct InMemoryQueue {
    config: QueueConfig,
    state: Mutex<State>,
    notify: Notify,
    seq: AtomicU64,
}

impl InMemoryQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            seq: AtomicU64::new(0),
        }
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Expire stale leases now rather than waiting for the next `receive`.
    ///
    /// Returns the number of messages moved to the dead-letter destination.
    pub async fn sweep_expired(&self) -> usize {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let before = state.dead.len();

        let expired: Vec<u64> = state
            .live
            .iter()
            .filter(|(_, entry)| matches!(entry.leased_until, Some(until) if until <= now))
            .map(|(seq, _)| *seq)
            .collect();

        for seq in expired {
            self.expire_lease(&mut state, seq);
        }

        let moved = state.dead.len() - before;
        if moved > 0 {
            self.notify.notify_waiters();
        }
        moved
    }

    /// Clear an expired lease; dead-letter the message if its budget is spent
    fn expire_lease(&self, state: &mut State, seq: u64) {
        let exhausted = match state.live.get_mut(&seq) {
            Some(entry) => {
                entry.leased_until = None;
                entry.message.lease_expires_at = None;
                entry.message.receive_count >= self.config.max_receive_count
            }
            None => return,
        };

        tracing::warn!(
            queue = %self.config.name,
            seq = seq,
            "Message lease expired without acknowledgment"
        );

        if exhausted {
            let reason = state
                .live
                .get(&seq)
                .and_then(|entry| entry.message.last_error.clone())
                .map(|last| format!("{}; last error: {}", LEASE_EXPIRED, last))
                .unwrap_or_else(|| LEASE_EXPIRED.to_string());
            self.move_to_dead_letter(state, seq, reason);
        }
    }

    fn move_to_dead_letter(&self, state: &mut State, seq: u64, reason: String) {
        let Some(entry) = state.live.remove(&seq) else {
            return;
        };
        let message = entry.message;
        state.index.remove(&message.message_id);

        let envelope = message.envelope().ok();
        tracing::error!(
            queue = %self.config.name,
            message_id = %message.message_id,
            event_id = %envelope.as_ref().map(|e| e.event_id.as_str()).unwrap_or("unparseable"),
            event_type = %envelope.as_ref().map(|e| e.event_type.as_str()).unwrap_or("unknown"),
            trace_id = %envelope.as_ref().map(|e| e.trace_id.as_str()).unwrap_or("none"),
            receive_count = message.receive_count,
            max_receive_count = self.config.max_receive_count,
            reason = %reason,
            body = %String::from_utf8_lossy(&message.body),
            "Message moved to dead-letter destination"
        );

        let dead_seq = self.next_seq();
        state.dead_index.insert(message.message_id, dead_seq);
        state.dead.insert(
            dead_seq,
            DeadLetter {
                source_queue: self.config.name.clone(),
                message,
                reason,
                dead_lettered_at: Utc::now(),
            },
        );
    }

    /// Lease available messages; returns the batch and the earliest lease still held
    fn lease_available(&self, state: &mut State, max_batch: usize) -> (Vec<QueueMessage>, Option<Instant>) {
        let now = Instant::now();

        let expired: Vec<u64> = state
            .live
            .iter()
            .filter(|(_, entry)| matches!(entry.leased_until, Some(until) if until <= now))
            .map(|(seq, _)| *seq)
            .collect();
        for seq in expired {
            self.expire_lease(state, seq);
        }

        let mut batch = Vec::new();
        let mut next_expiry: Option<Instant> = None;
        let lease_until = now + self.config.visibility_timeout;
        let lease_until_wall = Utc::now()
            + chrono::Duration::from_std(self.config.visibility_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(30));

        for entry in state.live.values_mut() {
            if let Some(until) = entry.leased_until {
                next_expiry = Some(next_expiry.map_or(until, |current| current.min(until)));
                continue;
            }
            if batch.len() >= max_batch {
                continue;
            }

            entry.message.receive_count += 1;
            entry.leased_until = Some(lease_until);
            entry.message.lease_expires_at = Some(lease_until_wall);
            next_expiry = Some(next_expiry.map_or(lease_until, |current| current.min(lease_until)));
            batch.push(entry.message.clone());
        }

        (batch, next_expiry)
    }
}

#[async_trait]
impl DurableQueue for InMemoryQueue {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn config(&self) -> &QueueConfig {
        &self.config
    }

    async fn enqueue(&self, body: Vec<u8>) -> QueueResult<Uuid> {
        let message_id = Uuid::new_v4();
        let seq = self.next_seq();

        {
            let mut state = self.state.lock().await;
            state.index.insert(message_id, seq);
            state.live.insert(
                seq,
                Entry {
                    message: QueueMessage {
                        message_id,
                        body,
                        receive_count: 0,
                        enqueued_at: Utc::now(),
                        lease_expires_at: None,
                        last_error: None,
                    },
                    leased_until: None,
                },
            );
        }

        self.notify.notify_waiters();
        Ok(message_id)
    }

    async fn receive(&self, max_batch: usize, wait_time: Duration) -> QueueResult<Vec<QueueMessage>> {
        if max_batch == 0 {
            return Ok(Vec::new());
        }
        let deadline = Instant::now() + wait_time;

        loop {
            // Register interest before inspecting state so an enqueue between
            // the check and the wait is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (batch, next_expiry) = {
                let mut state = self.state.lock().await;
                self.lease_available(&mut state, max_batch)
            };

            if !batch.is_empty() {
                tracing::debug!(
                    queue = %self.config.name,
                    count = batch.len(),
                    "Leased messages"
                );
                return Ok(batch);
            }

            if Instant::now() >= deadline {
                return Ok(batch);
            }

            let wake_at = next_expiry.map_or(deadline, |expiry| expiry.min(deadline));
            let _ = tokio::time::timeout_at(wake_at, notified).await;
        }
    }

    async fn acknowledge(&self, message_id: Uuid) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        let seq = state
            .index
            .remove(&message_id)
            .ok_or(QueueError::UnknownMessage(message_id))?;
        state.live.remove(&seq);

        tracing::debug!(queue = %self.config.name, message_id = %message_id, "Message acknowledged");
        Ok(())
    }

    async fn release(&self, message_id: Uuid, reason: &str) -> QueueResult<()> {
        {
            let mut state = self.state.lock().await;
            let seq = *state
                .index
                .get(&message_id)
                .ok_or(QueueError::UnknownMessage(message_id))?;

            let exhausted = {
                let entry = state
                    .live
                    .get_mut(&seq)
                    .ok_or(QueueError::UnknownMessage(message_id))?;
                if entry.leased_until.is_none() {
                    return Err(QueueError::NotLeased(message_id));
                }
                entry.leased_until = None;
                entry.message.lease_expires_at = None;
                entry.message.last_error = Some(reason.to_string());
                entry.message.receive_count >= self.config.max_receive_count
            };

            tracing::debug!(
                queue = %self.config.name,
                message_id = %message_id,
                reason = %reason,
                "Message released for redelivery"
            );

            if exhausted {
                self.move_to_dead_letter(&mut state, seq, reason.to_string());
            }
        }

        self.notify.notify_waiters();
        Ok(())
    }

    async fn dead_letters(&self) -> QueueResult<Vec<DeadLetter>> {
        let state = self.state.lock().await;
        Ok(state.dead.values().cloned().collect())
    }

    async fn redrive(&self, message_id: Uuid) -> QueueResult<()> {
        {
            let mut state = self.state.lock().await;
            let dead_seq = state
                .dead_index
                .remove(&message_id)
                .ok_or(QueueError::NotDeadLettered(message_id))?;
            let dead = state
                .dead
                .remove(&dead_seq)
                .ok_or(QueueError::NotDeadLettered(message_id))?;

            let mut message = dead.message;
            message.receive_count = 0;
            message.lease_expires_at = None;
            message.last_error = None;

            let seq = self.next_seq();
            state.index.insert(message_id, seq);
            state.live.insert(
                seq,
                Entry {
                    message,
                    leased_until: None,
                },
            );
        }

        tracing::info!(queue = %self.config.name, message_id = %message_id, "Dead letter redriven");
        self.notify.notify_waiters();
        Ok(())
    }

    async fn depth(&self) -> QueueResult<QueueDepth> {
        self.sweep_expired().await;

        let state = self.state.lock().await;
        let in_flight = state
            .live
            .values()
            .filter(|entry| entry.leased_until.is_some())
            .count();

        Ok(QueueDepth {
            available: state.live.len() - in_flight,
            in_flight,
            dead_lettered: state.dead.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventEnvelope;
    use serde_json::json;

    fn queue(max_receive_count: u32, visibility: Duration) -> InMemoryQueue {
        InMemoryQueue::new(
            QueueConfig::new("test-queue")
                .with_max_receive_count(max_receive_count)
                .with_visibility_timeout(visibility),
        )
    }

    fn envelope(event_id: &str) -> EventEnvelope {
        EventEnvelope::new("PolicyCreated", "policies", json!({"policy": {"policy_id": "POL-1"}}))
            .with_event_id(event_id)
    }

    #[tokio::test]
    async fn test_receive_leases_and_ack_removes() {
        let queue = queue(3, Duration::from_secs(30));
        let id = queue.enqueue_envelope(&envelope("E1")).await.unwrap();

        let batch = queue.receive(10, Duration::from_millis(10)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].message_id, id);
        assert_eq!(batch[0].receive_count, 1);
        assert!(batch[0].lease_expires_at.is_some());
        assert_eq!(batch[0].envelope().unwrap().event_id, "E1");

        // Leased messages are hidden from other consumers
        let again = queue.receive(10, Duration::from_millis(10)).await.unwrap();
        assert!(again.is_empty());

        queue.acknowledge(id).await.unwrap();
        let depth = queue.depth().await.unwrap();
        assert_eq!(depth, QueueDepth::default());
    }

    #[tokio::test]
    async fn test_receive_respects_max_batch() {
        let queue = queue(3, Duration::from_secs(30));
        for i in 0..5 {
            queue.enqueue_envelope(&envelope(&format!("E{}", i))).await.unwrap();
        }

        let first = queue.receive(3, Duration::from_millis(10)).await.unwrap();
        let second = queue.receive(3, Duration::from_millis(10)).await.unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(second.len(), 2);
    }

    #[tokio::test]
    async fn test_release_makes_message_available_and_counts_delivery() {
        let queue = queue(3, Duration::from_secs(30));
        let id = queue.enqueue(b"{}".to_vec()).await.unwrap();

        let first = queue.receive(1, Duration::from_millis(10)).await.unwrap();
        queue.release(id, "sink unavailable").await.unwrap();

        let second = queue.receive(1, Duration::from_millis(10)).await.unwrap();
        assert_eq!(second[0].message_id, id);
        assert!(second[0].receive_count > first[0].receive_count);
        assert_eq!(second[0].last_error.as_deref(), Some("sink unavailable"));
    }

    #[tokio::test]
    async fn test_release_unleased_message_fails() {
        let queue = queue(3, Duration::from_secs(30));
        let id = queue.enqueue(b"{}".to_vec()).await.unwrap();

        assert!(matches!(
            queue.release(id, "nope").await,
            Err(QueueError::NotLeased(_))
        ));
        assert!(matches!(
            queue.acknowledge(Uuid::new_v4()).await,
            Err(QueueError::UnknownMessage(_))
        ));
    }

    #[tokio::test]
    async fn test_dead_letter_after_max_receive_count_releases() {
        let queue = queue(3, Duration::from_secs(30));
        let id = queue.enqueue_envelope(&envelope("E1")).await.unwrap();

        for attempt in 1..=3 {
            let batch = queue.receive(1, Duration::from_millis(10)).await.unwrap();
            assert_eq!(batch.len(), 1, "delivery {} should succeed", attempt);
            assert_eq!(batch[0].receive_count, attempt);
            queue.release(id, "transient failure").await.unwrap();
        }

        // Fourth receive attempt: the message is dead-lettered, not delivered
        let fourth = queue.receive(1, Duration::from_millis(10)).await.unwrap();
        assert!(fourth.is_empty());

        let dead = queue.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].message.message_id, id);
        assert_eq!(dead[0].message.receive_count, 3);
        assert_eq!(dead[0].reason, "transient failure");
        assert_eq!(dead[0].source_queue, "test-queue");
        assert_eq!(dead[0].message.envelope().unwrap().event_id, "E1");

        let depth = queue.depth().await.unwrap();
        assert_eq!(depth.available + depth.in_flight, 0);
        assert_eq!(depth.dead_lettered, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expiry_redelivers() {
        let queue = queue(3, Duration::from_secs(30));
        let id = queue.enqueue(b"{}".to_vec()).await.unwrap();

        let first = queue.receive(1, Duration::ZERO).await.unwrap();
        assert_eq!(first.len(), 1);

        tokio::time::advance(Duration::from_secs(31)).await;

        let second = queue.receive(1, Duration::ZERO).await.unwrap();
        assert_eq!(second[0].message_id, id);
        assert_eq!(second[0].receive_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expiry_alone_dead_letters() {
        let queue = queue(2, Duration::from_secs(5));
        queue.enqueue(b"{}".to_vec()).await.unwrap();

        for _ in 0..2 {
            let batch = queue.receive(1, Duration::ZERO).await.unwrap();
            assert_eq!(batch.len(), 1);
            tokio::time::advance(Duration::from_secs(6)).await;
        }

        assert_eq!(queue.sweep_expired().await, 1);
        let dead = queue.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, LEASE_EXPIRED);
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_poll_wakes_on_enqueue() {
        let queue = std::sync::Arc::new(queue(3, Duration::from_secs(30)));

        let producer = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            producer.enqueue(b"{}".to_vec()).await.unwrap();
        });

        let started = Instant::now();
        let batch = queue.receive(10, Duration::from_secs(20)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert!(started.elapsed() < Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_poll_returns_empty_after_wait() {
        let queue = queue(3, Duration::from_secs(30));

        let started = Instant::now();
        let batch = queue.receive(10, Duration::from_secs(5)).await.unwrap();
        assert!(batch.is_empty());
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_redrive_resets_receive_count() {
        let queue = queue(1, Duration::from_secs(30));
        let id = queue.enqueue(b"{}".to_vec()).await.unwrap();

        queue.receive(1, Duration::ZERO).await.unwrap();
        queue.release(id, "malformed").await.unwrap();
        assert_eq!(queue.dead_letters().await.unwrap().len(), 1);

        queue.redrive(id).await.unwrap();
        assert!(queue.dead_letters().await.unwrap().is_empty());

        let batch = queue.receive(1, Duration::ZERO).await.unwrap();
        assert_eq!(batch[0].message_id, id);
        assert_eq!(batch[0].receive_count, 1);
        assert!(batch[0].last_error.is_none());

        assert!(matches!(
            queue.redrive(id).await,
            Err(QueueError::NotDeadLettered(_))
        ));
    }
}
