#![allow(dead_code)]

use axum::body::Body;
use axum::response::Response;
use event_bus::{DeliveryConfig, DurableQueue, EventEnvelope, InMemoryBus};
use http_body_util::BodyExt;
use ingest_rs::contracts::{CLAIMS_TOPIC, CLAIM_CREATED, POLICIES_TOPIC, POLICY_CREATED};
use ingest_rs::pipeline;
use serde_json::{json, Value};
use std::sync::Arc;

pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("Failed to read body")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("Body is not JSON")
}

/// Bus with the ingest queues subscribed, using `max_receive_count`
pub async fn topology(max_receive_count: u32) -> (InMemoryBus, Vec<Arc<dyn DurableQueue>>) {
    let delivery = DeliveryConfig {
        max_receive_count,
        ..DeliveryConfig::default()
    };
    let bus = InMemoryBus::new();
    let queues = pipeline::declare_queues(&bus, &delivery)
        .await
        .expect("Failed to declare queues");
    (bus, queues)
}

pub fn queue<'a>(queues: &'a [Arc<dyn DurableQueue>], name: &str) -> &'a Arc<dyn DurableQueue> {
    queues
        .iter()
        .find(|q| q.name() == name)
        .expect("Unknown queue")
}

pub fn policy_created(event_id: &str, policy_id: &str) -> EventEnvelope {
    EventEnvelope::new(
        POLICY_CREATED,
        POLICIES_TOPIC,
        json!({
            "policy": {
                "policy_id": policy_id,
                "customer_id": "CUST-1",
                "status": "active",
                "premium": 1200.0,
                "coverage_type": "auto"
            }
        }),
    )
    .with_event_id(event_id)
}

pub fn claim_created(event_id: &str, claim_id: &str, policy_id: &str) -> EventEnvelope {
    EventEnvelope::new(
        CLAIM_CREATED,
        CLAIMS_TOPIC,
        json!({
            "claim": {
                "claim_id": claim_id,
                "policy_id": policy_id,
                "amount": 500,
                "category": "collision"
            }
        }),
    )
    .with_event_id(event_id)
}
