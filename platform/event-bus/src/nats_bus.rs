//! NATS-based implementation of the EventBus trait

use crate::{BusError, BusResult, EventBus, EventEnvelope};
use async_nats::{jetstream, Client, HeaderMap};
use async_trait::async_trait;

/// Header JetStream uses for duplicate detection within its dedup window
const MSG_ID_HEADER: &str = "Nats-Msg-Id";
const EVENT_TYPE_HEADER: &str = "Event-Type";
const EVENT_VERSION_HEADER: &str = "Event-Version";
const TRACE_ID_HEADER: &str = "Trace-Id";

/// EventBus implementation using NATS
///
/// Publishes the serialized envelope to subject = `envelope.topic`, with
/// `Nats-Msg-Id` set to the `event_id` so that a JetStream stream drops
/// publisher retries inside its duplicate window.
///
/// # Example
/// ```rust,no_run
/// use event_bus::{EventBus, EventEnvelope, NatsBus};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let nats_client = async_nats::connect("nats://localhost:4222").await?;
/// let bus = NatsBus::with_jetstream(nats_client);
///
/// let envelope = EventEnvelope::new("PolicyCreated", "policies", serde_json::json!({}));
/// bus.publish(&envelope).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct NatsBus {
    client: Client,
    jetstream: Option<jetstream::Context>,
}

impl NatsBus {
    /// Core NATS publishing: the server accepts the message once flushed
    pub fn new(client: Client) -> Self {
        Self {
            client,
            jetstream: None,
        }
    }

    /// JetStream publishing: `publish` returns only after the stream acks
    pub fn with_jetstream(client: Client) -> Self {
        let context = jetstream::new(client.clone());
        Self {
            client,
            jetstream: Some(context),
        }
    }

    /// Get a reference to the underlying NATS client
    pub fn client(&self) -> &Client {
        &self.client
    }
}

fn headers_for(envelope: &EventEnvelope) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(MSG_ID_HEADER, envelope.event_id.as_str());
    headers.insert(EVENT_TYPE_HEADER, envelope.event_type.as_str());
    headers.insert(EVENT_VERSION_HEADER, envelope.event_version.to_string().as_str());
    headers.insert(TRACE_ID_HEADER, envelope.trace_id.as_str());
    headers
}

#[async_trait]
impl EventBus for NatsBus {
    async fn publish(&self, envelope: &EventEnvelope) -> BusResult<()> {
        let body = envelope
            .to_bytes()
            .map_err(|e| BusError::SerializationError(e.to_string()))?;
        let headers = headers_for(envelope);
        let subject = envelope.topic.clone();

        match &self.jetstream {
            Some(context) => {
                let ack = context
                    .publish_with_headers(subject, headers, body.into())
                    .await
                    .map_err(|e| BusError::PublishError(e.to_string()))?;
                let ack = ack
                    .await
                    .map_err(|e| BusError::PublishError(e.to_string()))?;

                if ack.duplicate {
                    tracing::debug!(
                        event_id = %envelope.event_id,
                        stream = %ack.stream,
                        "JetStream dropped duplicate publish"
                    );
                }
            }
            None => {
                self.client
                    .publish_with_headers(subject, headers, body.into())
                    .await
                    .map_err(|e| BusError::PublishError(e.to_string()))?;
                self.client
                    .flush()
                    .await
                    .map_err(|e| BusError::ConnectionError(e.to_string()))?;
            }
        }

        Ok(())
    }
}
