//! Simulated policy/claim service writing business state and outbox events
//! in one transaction

use anyhow::bail;
use event_bus::{EventEnvelope, MemoryOutboxStore};
use event_consumer::business_key;
use ingest_rs::contracts::{
    CLAIMS_TOPIC, CLAIM_CREATED, POLICIES_TOPIC, POLICY_CREATED, POLICY_UPDATED,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct ProducerState {
    pub policies: BTreeMap<String, Value>,
    pub claims: BTreeMap<String, Value>,
    /// business key -> entity id created by that request
    pub requests: BTreeMap<String, String>,
}

/// Result of one client request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Committed; carries the entity id and the emitted event_id
    Committed { entity_id: String, event_id: String },
    /// Same client key and body seen before; nothing new was written
    Replayed { entity_id: String },
    /// Validation failed; carries the event_id that must never surface
    Rejected { event_id: String },
}

pub struct Producer {
    store: Arc<MemoryOutboxStore<ProducerState>>,
}

impl Producer {
    pub fn new(store: Arc<MemoryOutboxStore<ProducerState>>) -> Self {
        Self { store }
    }

    pub async fn create_policy(&self, client_key: &str, request: Value) -> Outcome {
        let key = business_key(client_key, &request);
        let policy_id = format!("POL-{}", &key[key.len() - 8..]);
        let envelope = EventEnvelope::new(
            POLICY_CREATED,
            POLICIES_TOPIC,
            json!({ "policy": with_id(&request, "policy_id", &policy_id) }),
        );
        let event_id = envelope.event_id.clone();

        let result = self
            .store
            .transact(|state, outbox| {
                if let Some(existing) = state.requests.get(&key) {
                    return Ok(Outcome::Replayed {
                        entity_id: existing.clone(),
                    });
                }
                if request["premium"].as_f64().unwrap_or(0.0) <= 0.0 {
                    bail!("premium must be positive");
                }

                state.requests.insert(key.clone(), policy_id.clone());
                state
                    .policies
                    .insert(policy_id.clone(), envelope.data["policy"].clone());
                outbox.enqueue(envelope)?;
                Ok(Outcome::Committed {
                    entity_id: policy_id.clone(),
                    event_id: event_id.clone(),
                })
            })
            .await;

        result.unwrap_or_else(|e| {
            tracing::debug!(event_id = %event_id, error = %e, "Request rejected");
            Outcome::Rejected { event_id }
        })
    }

    pub async fn update_policy(&self, policy_id: &str, status: &str) -> anyhow::Result<Outcome> {
        let status = status.to_string();
        let policy_id = policy_id.to_string();

        self.store
            .transact(|state, outbox| {
                let Some(policy) = state.policies.get_mut(&policy_id) else {
                    bail!("unknown policy {}", policy_id);
                };
                policy["status"] = json!(status);

                let envelope = EventEnvelope::new(
                    POLICY_UPDATED,
                    POLICIES_TOPIC,
                    json!({ "policy": policy.clone() }),
                );
                let event_id = envelope.event_id.clone();
                outbox.enqueue(envelope)?;
                Ok(Outcome::Committed {
                    entity_id: policy_id.clone(),
                    event_id,
                })
            })
            .await
    }

    pub async fn create_claim(&self, client_key: &str, request: Value) -> Outcome {
        let key = business_key(client_key, &request);
        let claim_id = format!("CLM-{}", &key[key.len() - 8..]);
        let envelope = EventEnvelope::new(
            CLAIM_CREATED,
            CLAIMS_TOPIC,
            json!({ "claim": with_id(&request, "claim_id", &claim_id) }),
        );
        let event_id = envelope.event_id.clone();

        let result = self
            .store
            .transact(|state, outbox| {
                if let Some(existing) = state.requests.get(&key) {
                    return Ok(Outcome::Replayed {
                        entity_id: existing.clone(),
                    });
                }
                let policy_id = request["policy_id"].as_str().unwrap_or_default();
                if !state.policies.contains_key(policy_id) {
                    bail!("claim references unknown policy '{}'", policy_id);
                }

                state.requests.insert(key.clone(), claim_id.clone());
                state
                    .claims
                    .insert(claim_id.clone(), envelope.data["claim"].clone());
                outbox.enqueue(envelope)?;
                Ok(Outcome::Committed {
                    entity_id: claim_id.clone(),
                    event_id: event_id.clone(),
                })
            })
            .await;

        result.unwrap_or_else(|e| {
            tracing::debug!(event_id = %event_id, error = %e, "Request rejected");
            Outcome::Rejected { event_id }
        })
    }
}

fn with_id(request: &Value, field: &str, id: &str) -> Value {
    let mut entity = request.clone();
    entity[field] = json!(id);
    entity
}
