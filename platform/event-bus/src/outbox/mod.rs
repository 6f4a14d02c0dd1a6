//! Transactional outbox
//!
//! Records move through `pending → published → reaped`:
//!
//! - inserted in the same atomic unit as the producer's state mutation
//!   (never on their own)
//! - flipped to published by [`OutboxPublisher`] after the broker accepts them
//! - deleted by the reaper once published and past `ttl`
//!
//! A pending record is never dropped; if it cannot be published it is
//! surfaced as a stuck-event alert.

mod memory;
mod postgres;
mod publisher;

pub use memory::{MemoryOutboxStore, OutboxTx};
pub use postgres::PgOutboxStore;
pub use publisher::{OutboxPublisher, PublishReport, PublisherConfig};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::EventEnvelope;

/// One row per pending or published event
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxRecord {
    pub envelope: EventEnvelope,
    pub published: bool,
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Earliest time the reaper may delete the record, once published
    pub ttl: DateTime<Utc>,
    /// Failed broker hand-offs so far
    pub publish_attempts: u32,
    pub last_error: Option<String>,
    /// Earliest time the publisher retries this record
    pub next_attempt_at: DateTime<Utc>,
}

/// Lifecycle position of a record still held by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxState {
    Pending,
    Published,
}

impl OutboxRecord {
    pub fn new(envelope: EventEnvelope, retention: Duration) -> Self {
        let created_at = Utc::now();
        Self {
            envelope,
            published: false,
            published_at: None,
            created_at,
            ttl: created_at + to_chrono(retention),
            publish_attempts: 0,
            last_error: None,
            next_attempt_at: created_at,
        }
    }

    pub fn event_id(&self) -> &str {
        &self.envelope.event_id
    }

    pub fn state(&self) -> OutboxState {
        if self.published {
            OutboxState::Published
        } else {
            OutboxState::Pending
        }
    }

    /// Pending and not backing off at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.published && self.next_attempt_at <= now
    }

    /// Published and past its retention
    pub fn is_reapable(&self, now: DateTime<Utc>) -> bool {
        self.published && self.ttl <= now
    }

    /// Time spent pending so far
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }
}

pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("event {0} is already in the outbox")]
    Duplicate(String),

    #[error("event {0} is not in the outbox")]
    NotFound(String),

    #[error("failed to encode envelope: {0}")]
    Serialization(String),

    #[error("stored envelope is unreadable: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type OutboxResult<T> = Result<T, OutboxError>;

/// Publisher-side view of an outbox
///
/// Inserting is not part of this trait; each store exposes its own
/// transactional entry point tied to the producer's atomic unit.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Unpublished records, oldest first, whether backing off or not
    async fn list_unpublished(&self, limit: usize) -> OutboxResult<Vec<OutboxRecord>>;

    /// Unpublished records whose `next_attempt_at` has passed, oldest first
    async fn list_due(&self, now: DateTime<Utc>, limit: usize) -> OutboxResult<Vec<OutboxRecord>>;

    /// Flip a record to published.
    ///
    /// Returns `false` when it already was; calling twice is harmless.
    async fn mark_published(&self, event_id: &str) -> OutboxResult<bool>;

    /// Note a failed broker hand-off and hold the record back until `retry_at`
    async fn record_failure(
        &self,
        event_id: &str,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> OutboxResult<()>;

    /// Delete published records whose `ttl` is at or before `now`
    async fn reap_expired(&self, now: DateTime<Utc>) -> OutboxResult<u64>;
}
