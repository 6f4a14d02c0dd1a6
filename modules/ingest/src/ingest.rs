use async_trait::async_trait;
use chrono::Utc;
use event_bus::{EventEnvelope, SchemaRegistry};
use event_consumer::{HandlerError, MessageHandler};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::contracts::{self, Domain};
use crate::documents;
use crate::sinks::{bronze_key, ColdStorageSink, SearchSink};

/// Writes policy and claim events to cold storage and the search index
///
/// Cold storage is written first so the raw event is archived even when
/// indexing fails. Both writes overwrite by key and are safe to repeat.
pub struct IngestHandler {
    registry: SchemaRegistry,
    cold_storage: Arc<dyn ColdStorageSink>,
    search: Arc<dyn SearchSink>,
    index_prefix: String,
}

impl IngestHandler {
    pub fn new(
        cold_storage: Arc<dyn ColdStorageSink>,
        search: Arc<dyn SearchSink>,
        index_prefix: impl Into<String>,
    ) -> Self {
        Self {
            registry: contracts::registry(),
            cold_storage,
            search,
            index_prefix: index_prefix.into(),
        }
    }
}

#[async_trait]
impl MessageHandler for IngestHandler {
    async fn handle(&self, envelope: &EventEnvelope) -> Result<Option<Value>, HandlerError> {
        self.registry
            .validate(envelope)
            .map_err(HandlerError::permanent)?;

        let domain = Domain::from_event_type(&envelope.event_type).ok_or_else(|| {
            HandlerError::permanent(format!("no domain for {}", envelope.event_type))
        })?;

        let document = documents::build(domain, &self.index_prefix, &envelope.data)
            .map_err(HandlerError::permanent)?;

        let key = bronze_key(domain, Utc::now(), &envelope.event_type, &envelope.event_id);
        let raw = envelope.to_bytes().map_err(HandlerError::permanent)?;
        self.cold_storage.put(&key, &raw).await?;

        self.search.upsert(&document).await?;

        tracing::info!(
            event_id = %envelope.event_id,
            event_type = %envelope.event_type,
            bronze_key = %key,
            index = %document.index,
            document_id = %document.id,
            "Ingested event"
        );

        Ok(Some(json!({
            "bronze_key": key,
            "index": document.index,
            "document_id": document.id,
        })))
    }
}
