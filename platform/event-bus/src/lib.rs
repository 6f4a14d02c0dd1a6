//! # Event delivery runtime
//!
//! Shared runtime for moving domain events from a producer's record store to
//! downstream consumers, at-least-once on the wire and deduplicated on arrival.
//!
//! ## Pieces
//!
//! - **EventEnvelope** / **SchemaRegistry**: the unit of delivery and the
//!   versioned payload contracts consumers accept
//! - **OutboxStore** + **OutboxPublisher**: events are written in the same
//!   atomic unit as the producer's state change and relayed to the broker
//! - **EventBus**: fans one envelope out to every subscribed queue
//!   (`InMemoryBus` locally, `NatsBus` in production)
//! - **DurableQueue**: lease/visibility queue with a dead-letter destination
//!   and operator redrive (`InMemoryQueue` in process, `JetStreamQueue` on a
//!   durable JetStream consumer with dead letters in Postgres)
//! - **DeliveryConfig**: batching, concurrency, redelivery and retention knobs
//!
//! ## Usage
//!
//! ```rust,no_run
//! use event_bus::{DeliveryConfig, DurableQueue, EventBus, EventEnvelope, InMemoryBus, InMemoryQueue};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = DeliveryConfig::default();
//! let queue = Arc::new(InMemoryQueue::new(config.queue_config("policies-ingest")));
//!
//! let bus = InMemoryBus::new();
//! bus.subscribe("policies", queue.clone()).await?;
//!
//! let envelope = EventEnvelope::new(
//!     "PolicyCreated",
//!     "policies",
//!     serde_json::json!({ "policy": { "policy_id": "POL-1" } }),
//! );
//! bus.publish(&envelope).await?;
//!
//! let batch = queue.receive(config.batch_size, config.batching_window).await?;
//! assert_eq!(batch.len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod config;
mod dead_letters;
mod envelope;
mod inmemory_bus;
mod jetstream_queue;
mod memory_queue;
mod nats_bus;
pub mod outbox;
pub mod queue;
mod schema;

pub use backoff::{retry_with_backoff, Backoff, RetryConfig};
pub use config::{ConfigError, DeliveryConfig};
pub use dead_letters::{PgDeadLetterStore, StoredDeadLetter};
pub use envelope::{validate_envelope_fields, EnvelopeError, EventEnvelope};
pub use inmemory_bus::{matches_pattern, InMemoryBus};
pub use jetstream_queue::{message_id_for, JetStreamQueue, StreamBinding};
pub use memory_queue::InMemoryQueue;
pub use nats_bus::NatsBus;
pub use outbox::{
    MemoryOutboxStore, OutboxError, OutboxPublisher, OutboxRecord, OutboxState, OutboxStore,
    OutboxTx, PgOutboxStore, PublishReport, PublisherConfig,
};
pub use queue::{
    DeadLetter, DurableQueue, QueueConfig, QueueDepth, QueueError, QueueMessage, QueueResult,
};
pub use schema::{EventSchema, SchemaError, SchemaRegistry};

use async_trait::async_trait;
use std::fmt;

/// Errors that can occur when publishing through a broker
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("failed to publish message: {0}")]
    PublishError(String),

    #[error("failed to subscribe to subject: {0}")]
    SubscribeError(String),

    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("invalid subject pattern: {0}")]
    InvalidSubject(String),
}

/// Result type for broker operations
pub type BusResult<T> = Result<T, BusError>;

/// Broker abstraction: fan one envelope out to everything subscribed to its topic
///
/// Publishing is at-least-once. A failed publish may still have reached some
/// subscribers; callers retry and consumers deduplicate on `event_id`.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an envelope to `envelope.topic`
    ///
    /// # Returns
    /// * `Ok(())` once every subscriber has accepted the message
    /// * `Err(BusError)` if any hand-off failed; the caller should retry
    async fn publish(&self, envelope: &EventEnvelope) -> BusResult<()>;
}

impl fmt::Debug for dyn EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventBus")
    }
}
