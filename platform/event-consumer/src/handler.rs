use async_trait::async_trait;
use event_bus::EventEnvelope;
use serde_json::Value;

/// Why a handler could not apply an event
///
/// Both kinds release the message; the kind is kept in the release reason so
/// the dead letter says whether retrying could ever have helped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// Sink outage, timeout, throttling
    #[error("transient: {0}")]
    Transient(String),

    /// Unknown contract, missing field, rejected document
    #[error("permanent: {0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn transient(err: impl std::fmt::Display) -> Self {
        Self::Transient(err.to_string())
    }

    pub fn permanent(err: impl std::fmt::Display) -> Self {
        Self::Permanent(err.to_string())
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

/// Applies one event's side effects
///
/// Implementations must be safe to re-run for the same envelope: the
/// idempotency reservation is released when a call fails, so a later delivery
/// repeats whatever part of the work already happened.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Apply the event, optionally returning a snapshot to keep with the
    /// idempotency record
    async fn handle(&self, envelope: &EventEnvelope) -> Result<Option<Value>, HandlerError>;
}
