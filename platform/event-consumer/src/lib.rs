//! # Event consumer
//!
//! Turns at-least-once delivery into effectively-once side effects.
//!
//! A [`BatchConsumer`] leases batches from a [`event_bus::DurableQueue`],
//! reserves each `event_id` in an [`IdempotencyStore`], runs the
//! [`MessageHandler`] for new events only, and acknowledges or releases every
//! message on its own so one bad message never fails its batch.

mod batch_consumer;
mod handler;
pub mod idempotency;
mod idempotency_pg;

pub use batch_consumer::{BatchConsumer, BatchReport, ConsumerConfig, MessageFailure, MessageOutcome};
pub use handler::{HandlerError, MessageHandler};
pub use idempotency::{
    business_key, IdempotencyError, IdempotencyRecord, IdempotencyStore, InMemoryIdempotencyStore,
    RecordState, Reservation,
};
pub use idempotency_pg::PgIdempotencyStore;
