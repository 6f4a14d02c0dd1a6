//! Versioned payload contracts.
//!
//! `data` is private to `event_type` + `event_version`. Consumers register the
//! contracts they understand; anything else is rejected so it can be
//! dead-lettered instead of guessed at.

use std::collections::HashMap;

use crate::EventEnvelope;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    #[error("unknown version {version} for event type {event_type}")]
    UnknownVersion { event_type: String, version: u32 },

    #[error("{event_type} v{version}: missing required field {pointer}")]
    MissingField {
        event_type: String,
        version: u32,
        pointer: String,
    },
}

/// One accepted `(event_type, event_version)` contract.
#[derive(Debug, Clone, Default)]
pub struct EventSchema {
    /// JSON pointers (relative to `data`) that must be present and non-null.
    /// A pointer listing alternatives with `|` is satisfied by any of them.
    pub required: Vec<String>,
}

/// Registry of payload contracts keyed by `(event_type, event_version)`.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<(String, u32), EventSchema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a contract, replacing any previous one for the same key
    pub fn register(mut self, event_type: &str, version: u32, required: &[&str]) -> Self {
        self.schemas.insert(
            (event_type.to_string(), version),
            EventSchema {
                required: required.iter().map(|s| s.to_string()).collect(),
            },
        );
        self
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    /// Check the envelope's payload against its registered contract
    pub fn validate(&self, envelope: &EventEnvelope) -> Result<(), SchemaError> {
        let key = (envelope.event_type.clone(), envelope.event_version);

        let schema = match self.schemas.get(&key) {
            Some(schema) => schema,
            None => {
                let type_known = self
                    .schemas
                    .keys()
                    .any(|(event_type, _)| event_type == &envelope.event_type);
                return Err(if type_known {
                    SchemaError::UnknownVersion {
                        event_type: envelope.event_type.clone(),
                        version: envelope.event_version,
                    }
                } else {
                    SchemaError::UnknownEventType(envelope.event_type.clone())
                });
            }
        };

        for pointer in &schema.required {
            let present = pointer.split('|').any(|alternative| {
                envelope
                    .data
                    .pointer(alternative)
                    .map(|v| !v.is_null())
                    .unwrap_or(false)
            });

            if !present {
                return Err(SchemaError::MissingField {
                    event_type: envelope.event_type.clone(),
                    version: envelope.event_version,
                    pointer: pointer.clone(),
                });
            }
        }

        Ok(())
    }
}
