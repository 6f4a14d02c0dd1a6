//! # Event Envelope
//!
//! The unit of delivery between producers and consumers.
//!
//! ## Wire Format
//!
//! ```json
//! {
//!   "event_id": "550e8400-e29b-41d4-a716-446655440000",
//!   "event_type": "PolicyCreated",
//!   "event_version": 1,
//!   "occurred_at": "2026-02-12T00:00:00Z",
//!   "trace_id": "4bf92f3577b34da6a3ce929d0e0e4736",
//!   "topic": "policies",
//!   "data": { "policy": { "policy_id": "POL-1A2B3C4D" } }
//! }
//! ```
//!
//! ## Envelope Fields
//!
//! - `event_id`: Unique identifier, used as the idempotency key downstream
//! - `event_type` / `event_version`: Select the schema of `data`
//! - `occurred_at`: When the domain event happened (not when it was enqueued)
//! - `trace_id`: Correlation identifier propagated end-to-end
//! - `topic`: Logical destination the broker fans out on
//! - `data`: Event-specific payload, private to `event_type`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Errors raised when a delivered body cannot be turned into an envelope
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("body is not valid JSON: {0}")]
    Malformed(String),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Immutable event envelope.
///
/// Construct with [`EventEnvelope::new`] and the `with_*` builders; once handed
/// to an outbox the envelope is never modified again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique event identifier (idempotency key)
    pub event_id: String,

    /// Event type tag, e.g. "PolicyCreated"
    pub event_type: String,

    /// Schema version of `data` for this `event_type`
    pub event_version: u32,

    /// When the domain event occurred
    pub occurred_at: DateTime<Utc>,

    /// Correlation identifier propagated end-to-end
    pub trace_id: String,

    /// Logical destination name
    pub topic: String,

    /// Event-specific payload
    pub data: Value,
}

impl EventEnvelope {
    /// Create a version-1 envelope with a fresh event_id, trace_id and occurred_at
    pub fn new(event_type: impl Into<String>, topic: impl Into<String>, data: Value) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            event_version: 1,
            occurred_at: Utc::now(),
            trace_id: Uuid::new_v4().simple().to_string(),
            topic: topic.into(),
            data,
        }
    }

    /// Set an explicit event_id (useful for testing and replay)
    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = event_id.into();
        self
    }

    pub fn with_version(mut self, event_version: u32) -> Self {
        self.event_version = event_version;
        self
    }

    /// Propagate an upstream trace id instead of the generated one
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    pub fn with_occurred_at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }

    /// Serialize to the JSON wire format
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse and validate a delivered body.
    ///
    /// Bodies wrapped by a fan-out service (`{"Message": "..."}` or
    /// `{"Records": [{"Sns": {"Message": "..."}}]}`) are unwrapped first.
    pub fn from_slice(body: &[u8]) -> Result<Self, EnvelopeError> {
        let value: Value =
            serde_json::from_slice(body).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
        let value = unwrap_fanout_wrapper(value)?;

        validate_envelope_fields(&value)?;

        serde_json::from_value(value).map_err(|e| EnvelopeError::Malformed(e.to_string()))
    }
}

/// Strip a fan-out delivery wrapper if present, returning the inner event.
fn unwrap_fanout_wrapper(value: Value) -> Result<Value, EnvelopeError> {
    let inner = if let Some(message) = value.get("Message") {
        Some(message.clone())
    } else {
        value
            .get("Records")
            .and_then(|records| records.get(0))
            .and_then(|record| record.pointer("/Sns/Message"))
            .cloned()
    };

    match inner {
        Some(Value::String(raw)) => {
            serde_json::from_str(&raw).map_err(|e| EnvelopeError::Malformed(e.to_string()))
        }
        Some(_) => Err(EnvelopeError::InvalidField {
            field: "Message",
            reason: "wrapped message must be a JSON string".to_string(),
        }),
        None => Ok(value),
    }
}

/// Validate the envelope fields of a JSON document
///
/// # Validation Rules
///
/// - `event_id`, `event_type`, `trace_id`, `topic`: non-empty strings
/// - `event_version`: positive integer
/// - `occurred_at`: RFC 3339 timestamp
/// - `data`: JSON object
pub fn validate_envelope_fields(envelope: &Value) -> Result<(), EnvelopeError> {
    for field in ["event_id", "event_type", "trace_id", "topic"] {
        let value = envelope
            .get(field)
            .ok_or(EnvelopeError::MissingField(field))?
            .as_str()
            .ok_or_else(|| EnvelopeError::InvalidField {
                field,
                reason: "must be a string".to_string(),
            })?;

        if value.trim().is_empty() {
            return Err(EnvelopeError::InvalidField {
                field,
                reason: "must be non-empty".to_string(),
            });
        }
    }

    let version = envelope
        .get("event_version")
        .ok_or(EnvelopeError::MissingField("event_version"))?;
    match version.as_u64() {
        Some(v) if (1..=u32::MAX as u64).contains(&v) => {}
        _ => {
            return Err(EnvelopeError::InvalidField {
                field: "event_version",
                reason: format!("must be a positive integer, got {}", version),
            })
        }
    }

    let occurred_at = envelope
        .get("occurred_at")
        .ok_or(EnvelopeError::MissingField("occurred_at"))?
        .as_str()
        .ok_or_else(|| EnvelopeError::InvalidField {
            field: "occurred_at",
            reason: "must be a string".to_string(),
        })?;
    DateTime::parse_from_rfc3339(occurred_at).map_err(|_| EnvelopeError::InvalidField {
        field: "occurred_at",
        reason: format!("must be ISO 8601 timestamp, got '{}'", occurred_at),
    })?;

    let data = envelope
        .get("data")
        .ok_or(EnvelopeError::MissingField("data"))?;
    if !data.is_object() {
        return Err(EnvelopeError::InvalidField {
            field: "data",
            reason: "must be an object".to_string(),
        });
    }

    Ok(())
}
