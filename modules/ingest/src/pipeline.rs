//! Queue topology and consumer wiring for the ingestion worker

use async_nats::jetstream;
use event_bus::{
    BusResult, DeliveryConfig, DurableQueue, InMemoryBus, InMemoryQueue, JetStreamQueue,
    PgDeadLetterStore, QueueResult, StreamBinding,
};
use event_consumer::{BatchConsumer, ConsumerConfig, IdempotencyStore, MessageHandler};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::contracts::Domain;

pub const POLICIES_QUEUE: &str = "policies-ingest";
pub const CLAIMS_QUEUE: &str = "claims-ingest";

fn queue_name(domain: Domain) -> &'static str {
    match domain {
        Domain::Policies => POLICIES_QUEUE,
        Domain::Claims => CLAIMS_QUEUE,
    }
}

/// JetStream stream holding a domain's events
pub fn stream_name(domain: Domain) -> &'static str {
    match domain {
        Domain::Policies => "POLICIES",
        Domain::Claims => "CLAIMS",
    }
}

/// Create one queue per domain and subscribe it to the domain topic and its
/// sub-subjects (`policies`, `policies.>`).
pub async fn declare_queues(
    bus: &InMemoryBus,
    delivery: &DeliveryConfig,
) -> BusResult<Vec<Arc<dyn DurableQueue>>> {
    let mut queues: Vec<Arc<dyn DurableQueue>> = Vec::new();

    for domain in [Domain::Policies, Domain::Claims] {
        let queue: Arc<dyn DurableQueue> =
            Arc::new(InMemoryQueue::new(delivery.queue_config(queue_name(domain))));

        bus.subscribe(domain.topic(), queue.clone()).await?;
        bus.subscribe(&format!("{}.>", domain.topic()), queue.clone())
            .await?;

        tracing::info!(
            queue = %queue.name(),
            topic = %domain.topic(),
            max_receive_count = delivery.max_receive_count,
            "Declared ingest queue"
        );
        queues.push(queue);
    }

    Ok(queues)
}

/// Bind one durable JetStream consumer per domain, creating the domain
/// stream (`policies`, `policies.>`) on first start. Dead letters go to
/// Postgres.
pub async fn declare_jetstream_queues(
    context: &jetstream::Context,
    delivery: &DeliveryConfig,
    dead_letters: &PgDeadLetterStore,
) -> QueueResult<Vec<Arc<dyn DurableQueue>>> {
    let mut queues: Vec<Arc<dyn DurableQueue>> = Vec::new();

    for domain in [Domain::Policies, Domain::Claims] {
        let queue = JetStreamQueue::declare(
            context.clone(),
            StreamBinding::for_topic(stream_name(domain), domain.topic()),
            delivery.queue_config(queue_name(domain)),
            dead_letters.clone(),
        )
        .await?;

        tracing::info!(
            queue = %queue.name(),
            stream = %stream_name(domain),
            max_receive_count = delivery.max_receive_count,
            "Declared durable ingest queue"
        );
        queues.push(Arc::new(queue));
    }

    Ok(queues)
}

/// Start one batch consumer per queue. Each task ends after `shutdown`
/// flips and its in-flight batches settle.
pub fn spawn_consumers(
    queues: &[Arc<dyn DurableQueue>],
    idempotency: Arc<dyn IdempotencyStore>,
    handler: Arc<dyn MessageHandler>,
    config: &ConsumerConfig,
    shutdown: &watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    queues
        .iter()
        .map(|queue| {
            let consumer = Arc::new(BatchConsumer::new(
                queue.clone(),
                idempotency.clone(),
                handler.clone(),
                config.clone(),
            ));
            tokio::spawn(consumer.run(shutdown.clone()))
        })
        .collect()
}
