//! In-memory broker: topic fan-out into local durable queues

use crate::queue::DurableQueue;
use crate::{BusError, BusResult, EventBus, EventEnvelope};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

struct Subscription {
    pattern: String,
    queue: Arc<dyn DurableQueue>,
}

/// EventBus implementation that enqueues into in-process queues
///
/// This implementation is suitable for:
/// - Unit tests (no external dependencies)
/// - Local development without a NATS server
/// - Single-process deployments that publish and consume in one runtime
///
/// Each subscribed queue receives its own copy of every matching message and
/// is drained independently.
///
/// # Example
/// ```rust
/// use event_bus::{DurableQueue, EventBus, EventEnvelope, InMemoryBus, InMemoryQueue, QueueConfig};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = InMemoryBus::new();
/// let search = Arc::new(InMemoryQueue::new(QueueConfig::new("policies-search")));
/// bus.subscribe("policies.>", search.clone()).await?;
///
/// let envelope = EventEnvelope::new("PolicyCreated", "policies.created", serde_json::json!({}));
/// bus.publish(&envelope).await?;
///
/// let batch = search.receive(10, Duration::from_millis(10)).await?;
/// assert_eq!(batch.len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct InMemoryBus {
    subscriptions: Arc<RwLock<Vec<Subscription>>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a queue to every topic matching `pattern`
    pub async fn subscribe(&self, pattern: &str, queue: Arc<dyn DurableQueue>) -> BusResult<()> {
        validate_pattern(pattern)?;

        tracing::info!(pattern = %pattern, queue = %queue.name(), "Queue subscribed to topic");

        self.subscriptions.write().await.push(Subscription {
            pattern: pattern.to_string(),
            queue,
        });
        Ok(())
    }

    /// Number of subscriptions, matching or not
    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.read().await.len()
    }

    /// Fan a raw body out on `topic`, returning how many queues accepted it
    ///
    /// Used for bridged deliveries whose body may not even parse; the queue
    /// and consumer decide what to do with it.
    pub async fn publish_raw(&self, topic: &str, body: Vec<u8>) -> BusResult<usize> {
        let subscriptions = self.subscriptions.read().await;

        let mut delivered = 0;
        let mut failures = Vec::new();

        for subscription in subscriptions
            .iter()
            .filter(|s| matches_pattern(topic, &s.pattern))
        {
            match subscription.queue.enqueue(body.clone()).await {
                Ok(message_id) => {
                    delivered += 1;
                    tracing::debug!(
                        topic = %topic,
                        queue = %subscription.queue.name(),
                        message_id = %message_id,
                        "Message fanned out"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        topic = %topic,
                        queue = %subscription.queue.name(),
                        error = %e,
                        "Queue refused message"
                    );
                    failures.push(format!("{}: {}", subscription.queue.name(), e));
                }
            }
        }

        if !failures.is_empty() {
            return Err(BusError::PublishError(failures.join("; ")));
        }

        if delivered == 0 {
            tracing::debug!(topic = %topic, "No subscribers for topic");
        }
        Ok(delivered)
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn publish(&self, envelope: &EventEnvelope) -> BusResult<()> {
        let body = envelope
            .to_bytes()
            .map_err(|e| BusError::SerializationError(e.to_string()))?;

        self.publish_raw(&envelope.topic, body).await?;
        Ok(())
    }
}

fn validate_pattern(pattern: &str) -> BusResult<()> {
    let tokens: Vec<&str> = pattern.split('.').collect();
    for (i, token) in tokens.iter().enumerate() {
        if token.is_empty() {
            return Err(BusError::InvalidSubject(pattern.to_string()));
        }
        if *token == ">" && i != tokens.len() - 1 {
            return Err(BusError::InvalidSubject(pattern.to_string()));
        }
    }
    Ok(())
}

/// Check if a topic matches a subscription pattern
///
/// Supports NATS-style wildcards:
/// - `*` matches exactly one token
/// - `>` matches one or more tokens
///
/// # Examples
/// - `policies.>` matches `policies.created.v1`
/// - `*.created` matches `claims.created`
/// - `policies.*` does NOT match `policies.created.v1` (too many tokens)
pub fn matches_pattern(topic: &str, pattern: &str) -> bool {
    let mut topic_tokens = topic.split('.');
    let mut pattern_tokens = pattern.split('.');

    loop {
        match (pattern_tokens.next(), topic_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(t)) if p == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
