mod common;

use async_trait::async_trait;
use event_bus::{EventBus, EventEnvelope};
use event_consumer::{
    BatchConsumer, ConsumerConfig, HandlerError, InMemoryIdempotencyStore, MessageHandler,
};
use ingest_rs::contracts::{POLICIES_TOPIC, POLICY_UPDATED};
use ingest_rs::documents::SearchDocument;
use ingest_rs::pipeline::{self, CLAIMS_QUEUE, POLICIES_QUEUE};
use ingest_rs::sinks::{
    FsColdStorage, InMemoryColdStorage, InMemorySearchIndex, SearchSink, SinkError, SinkResult,
};
use ingest_rs::IngestHandler;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

fn handler(cold: &InMemoryColdStorage, search: &InMemorySearchIndex) -> IngestHandler {
    IngestHandler::new(Arc::new(cold.clone()), Arc::new(search.clone()), "ins")
}

fn consumer_config() -> ConsumerConfig {
    ConsumerConfig {
        batching_window: Duration::from_millis(50),
        ..ConsumerConfig::default()
    }
    .with_receive_wait(Duration::from_millis(100))
}

/// Search sink failing the first `failures` upserts with the given error
struct FailingSearch {
    inner: InMemorySearchIndex,
    failures: AtomicUsize,
    permanent: bool,
}

#[async_trait]
impl SearchSink for FailingSearch {
    async fn upsert(&self, document: &SearchDocument) -> SinkResult<()> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(if self.permanent {
                SinkError::Permanent("mapper_parsing_exception".to_string())
            } else {
                SinkError::Transient("503 Service Unavailable".to_string())
            });
        }
        self.inner.upsert(document).await
    }
}

#[tokio::test]
async fn test_policy_event_written_to_both_sinks() {
    let cold = InMemoryColdStorage::new();
    let search = InMemorySearchIndex::new();
    let envelope = common::policy_created("E1", "POL-1");

    let snapshot = handler(&cold, &search)
        .handle(&envelope)
        .await
        .unwrap()
        .unwrap();

    let keys = cold.keys().await;
    assert_eq!(keys.len(), 1);
    assert!(keys[0].starts_with("policies/bronze/ingest_date="));
    assert!(keys[0].ends_with("/event_type=PolicyCreated/E1.json"));
    assert_eq!(snapshot["bronze_key"], keys[0].as_str());

    let archived: EventEnvelope =
        serde_json::from_slice(&cold.get(&keys[0]).await.unwrap()).unwrap();
    assert_eq!(archived, envelope);

    let doc = search.get("ins-policies", "POL-1").await.unwrap();
    assert_eq!(doc["policyId"], "POL-1");
    assert_eq!(doc["customerId"], "CUST-1");
    assert_eq!(doc["type"], "policy");
    assert_eq!(snapshot["document_id"], "POL-1");
}

#[tokio::test]
async fn test_update_replaces_document_by_entity_id() {
    let cold = InMemoryColdStorage::new();
    let search = InMemorySearchIndex::new();
    let handler = handler(&cold, &search);

    handler
        .handle(&common::policy_created("E1", "POL-1"))
        .await
        .unwrap();
    let update = EventEnvelope::new(
        POLICY_UPDATED,
        POLICIES_TOPIC,
        json!({"policy": {"policyId": "POL-1", "status": "cancelled"}}),
    )
    .with_event_id("E2");
    handler.handle(&update).await.unwrap();

    assert_eq!(cold.len().await, 2, "each event is archived under its own key");
    assert_eq!(search.count("ins-policies").await, 1);
    assert_eq!(
        search.get("ins-policies", "POL-1").await.unwrap()["status"],
        "cancelled"
    );
}

#[tokio::test]
async fn test_unknown_version_is_permanent_and_writes_nothing() {
    let cold = InMemoryColdStorage::new();
    let search = InMemorySearchIndex::new();

    let envelope = common::policy_created("E1", "POL-1").with_version(2);
    let err = handler(&cold, &search).handle(&envelope).await.unwrap_err();

    assert!(err.is_permanent());
    assert!(cold.is_empty().await);
    assert_eq!(search.count("ins-policies").await, 0);
}

#[tokio::test]
async fn test_search_outage_is_transient_after_archiving() {
    let cold = InMemoryColdStorage::new();
    let search = Arc::new(FailingSearch {
        inner: InMemorySearchIndex::new(),
        failures: AtomicUsize::new(1),
        permanent: false,
    });
    let handler = IngestHandler::new(Arc::new(cold.clone()), search.clone(), "ins");
    let envelope = common::claim_created("E1", "CLM-1", "POL-1");

    let err = handler.handle(&envelope).await.unwrap_err();
    assert!(matches!(err, HandlerError::Transient(_)));
    assert_eq!(cold.len().await, 1);

    // Retrying overwrites the archived object and indexes the document
    handler.handle(&envelope).await.unwrap();
    assert_eq!(cold.len().await, 1);
    assert_eq!(search.inner.count("ins-claims").await, 1);
}

#[tokio::test]
async fn test_filesystem_cold_storage() {
    let dir = tempfile::tempdir().unwrap();
    let search = InMemorySearchIndex::new();
    let handler = IngestHandler::new(
        Arc::new(FsColdStorage::new(dir.path())),
        Arc::new(search.clone()),
        "ins",
    );

    let snapshot = handler
        .handle(&common::claim_created("E7", "CLM-7", "POL-1"))
        .await
        .unwrap()
        .unwrap();

    let key = snapshot["bronze_key"].as_str().unwrap();
    assert!(key.starts_with("claims/bronze/"));
    let stored = tokio::fs::read(dir.path().join(key)).await.unwrap();
    let archived: EventEnvelope = serde_json::from_slice(&stored).unwrap();
    assert_eq!(archived.event_id, "E7");
}

/// PolicyCreated published, delivered, ingested and acked; delivering the same
/// event again does not create a second sink record.
#[tokio::test]
async fn test_redelivered_event_ingested_once() {
    let (bus, queues) = common::topology(3).await;
    let cold = InMemoryColdStorage::new();
    let search = InMemorySearchIndex::new();
    let consumer = BatchConsumer::new(
        common::queue(&queues, POLICIES_QUEUE).clone(),
        Arc::new(InMemoryIdempotencyStore::new(Duration::from_secs(3600))),
        Arc::new(handler(&cold, &search)),
        consumer_config(),
    );

    let envelope = common::policy_created("E1", "POL-1");
    bus.publish(&envelope).await.unwrap();
    let report = consumer.poll_once().await.unwrap();
    assert_eq!(report.ingested, 1);

    bus.publish(&envelope).await.unwrap();
    let report = consumer.poll_once().await.unwrap();
    assert_eq!(report.ingested, 0);
    assert_eq!(report.duplicates, 1);

    assert_eq!(cold.len().await, 1);
    assert_eq!(search.count("ins-policies").await, 1);
    assert_eq!(
        common::queue(&queues, POLICIES_QUEUE).depth().await.unwrap(),
        Default::default()
    );
}

#[tokio::test]
async fn test_malformed_envelope_released_beside_nine_valid() {
    let (bus, queues) = common::topology(3).await;
    let cold = InMemoryColdStorage::new();
    let search = InMemorySearchIndex::new();
    let policies = common::queue(&queues, POLICIES_QUEUE).clone();
    let consumer = BatchConsumer::new(
        policies.clone(),
        Arc::new(InMemoryIdempotencyStore::new(Duration::from_secs(3600))),
        Arc::new(handler(&cold, &search)),
        consumer_config(),
    );

    for i in 0..9 {
        bus.publish(&common::policy_created(&format!("E{}", i), &format!("POL-{}", i)))
            .await
            .unwrap();
    }
    bus.publish_raw(POLICIES_TOPIC, b"{\"event_type\": \"PolicyCreated\"".to_vec())
        .await
        .unwrap();

    let report = consumer.poll_once().await.unwrap();
    assert_eq!(report.received, 10);
    assert_eq!(report.ingested, 9);
    assert_eq!(report.released, 1);
    assert!(report.failures[0].reason.starts_with("malformed envelope"));
    assert_eq!(search.count("ins-policies").await, 9);

    // The malformed body keeps failing until it is dead-lettered
    for _ in 0..2 {
        let report = consumer.poll_once().await.unwrap();
        assert_eq!(report.released, 1);
    }
    let depth = policies.depth().await.unwrap();
    assert_eq!(depth.available, 0);
    assert_eq!(depth.dead_lettered, 1);
}

#[tokio::test]
async fn test_rejected_document_dead_lettered_after_max_receives() {
    let (bus, queues) = common::topology(3).await;
    let claims = common::queue(&queues, CLAIMS_QUEUE).clone();
    let search = Arc::new(FailingSearch {
        inner: InMemorySearchIndex::new(),
        failures: AtomicUsize::new(usize::MAX),
        permanent: true,
    });
    let consumer = BatchConsumer::new(
        claims.clone(),
        Arc::new(InMemoryIdempotencyStore::new(Duration::from_secs(3600))),
        Arc::new(IngestHandler::new(
            Arc::new(InMemoryColdStorage::new()),
            search,
            "ins",
        )),
        consumer_config(),
    );

    bus.publish(&common::claim_created("E1", "CLM-1", "POL-1"))
        .await
        .unwrap();

    for _ in 0..3 {
        assert_eq!(consumer.poll_once().await.unwrap().released, 1);
    }
    assert_eq!(consumer.poll_once().await.unwrap().received, 0);

    let dead = claims.dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].message.receive_count, 3);
    assert!(dead[0].reason.contains("mapper_parsing_exception"));
}

#[tokio::test]
async fn test_running_consumers_drain_on_shutdown() {
    let (bus, queues) = common::topology(3).await;
    let cold = InMemoryColdStorage::new();
    let search = InMemorySearchIndex::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let tasks = pipeline::spawn_consumers(
        &queues,
        Arc::new(InMemoryIdempotencyStore::new(Duration::from_secs(3600))),
        Arc::new(handler(&cold, &search)),
        &consumer_config(),
        &shutdown_rx,
    );

    bus.publish(&common::policy_created("E1", "POL-1")).await.unwrap();
    bus.publish(&common::claim_created("E2", "CLM-1", "POL-1"))
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while search.count("ins-policies").await + search.count("ins-claims").await < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("events were not ingested");

    shutdown_tx.send(true).unwrap();
    for task in tasks {
        task.await.unwrap();
    }

    for queue in &queues {
        let depth = queue.depth().await.unwrap();
        assert_eq!(depth.available + depth.in_flight + depth.dead_lettered, 0);
    }
    assert_eq!(cold.len().await, 2);
}
