//! Durable queue contract
//!
//! A queue holds delivered bodies under a lease/visibility mechanism:
//!
//! - `receive` leases up to `max_batch` available messages for
//!   `visibility_timeout`, long-polling up to `wait_time` when none are ready
//! - `acknowledge` removes a message for good
//! - `release` hands a leased message back immediately (transient failure)
//! - a lease that runs out without ack or release makes the message available
//!   again on its own
//!
//! `receive_count` counts deliveries. A message that has been delivered
//! `max_receive_count` times and is handed back (release or lease expiry) is
//! moved to the dead-letter destination, because another delivery would
//! exceed the budget.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use uuid::Uuid;

use crate::{EnvelopeError, EventEnvelope};

/// Queue settings
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub name: String,
    /// Deliveries allowed before dead-lettering
    pub max_receive_count: u32,
    /// Lease granted by `receive`
    pub visibility_timeout: Duration,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_receive_count: 3,
            visibility_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_max_receive_count(mut self, max_receive_count: u32) -> Self {
        self.max_receive_count = max_receive_count;
        self
    }

    pub fn with_visibility_timeout(mut self, visibility_timeout: Duration) -> Self {
        self.visibility_timeout = visibility_timeout;
        self
    }
}

/// A message as handed to a consumer
#[derive(Debug, Clone, PartialEq)]
pub struct QueueMessage {
    /// Queue-assigned identifier, used for ack/release
    pub message_id: Uuid,
    /// Delivered body; normally a serialized [`EventEnvelope`]
    pub body: Vec<u8>,
    /// Number of times this message has been delivered, this delivery included
    pub receive_count: u32,
    pub enqueued_at: DateTime<Utc>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Reason given with the latest release, if any
    pub last_error: Option<String>,
}

impl QueueMessage {
    /// Parse and validate the wrapped envelope
    pub fn envelope(&self) -> Result<EventEnvelope, EnvelopeError> {
        EventEnvelope::from_slice(&self.body)
    }
}

/// A message that exhausted its delivery budget
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    /// Queue the message was removed from
    pub source_queue: String,
    pub message: QueueMessage,
    /// Last failure reason, or "lease expired" when the consumer went silent
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Point-in-time message counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub available: usize,
    pub in_flight: usize,
    pub dead_lettered: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("message {0} not found")]
    UnknownMessage(Uuid),

    #[error("message {0} is not currently leased")]
    NotLeased(Uuid),

    #[error("message {0} is not in the dead-letter destination")]
    NotDeadLettered(Uuid),

    #[error("failed to encode message body: {0}")]
    Encode(String),

    #[error("queue unavailable: {0}")]
    Unavailable(String),
}

pub type QueueResult<T> = Result<T, QueueError>;

/// Lease-based queue with a dead-letter destination
#[async_trait]
pub trait DurableQueue: Send + Sync {
    fn name(&self) -> &str;

    fn config(&self) -> &QueueConfig;

    /// Append a body to the live queue, returning its message id
    async fn enqueue(&self, body: Vec<u8>) -> QueueResult<Uuid>;

    /// Serialize and enqueue an envelope
    async fn enqueue_envelope(&self, envelope: &EventEnvelope) -> QueueResult<Uuid> {
        let body = envelope
            .to_bytes()
            .map_err(|e| QueueError::Encode(e.to_string()))?;
        self.enqueue(body).await
    }

    /// Lease up to `max_batch` messages, waiting up to `wait_time` for the first
    async fn receive(&self, max_batch: usize, wait_time: Duration) -> QueueResult<Vec<QueueMessage>>;

    /// Remove a message permanently
    async fn acknowledge(&self, message_id: Uuid) -> QueueResult<()>;

    /// Give a leased message back for immediate redelivery
    async fn release(&self, message_id: Uuid, reason: &str) -> QueueResult<()>;

    /// Messages currently held in the dead-letter destination
    async fn dead_letters(&self) -> QueueResult<Vec<DeadLetter>>;

    /// Move a dead letter back to the live queue with a fresh delivery budget
    async fn redrive(&self, message_id: Uuid) -> QueueResult<()>;

    async fn depth(&self) -> QueueResult<QueueDepth>;
}
