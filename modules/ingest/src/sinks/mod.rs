//! Ingestion destinations
//!
//! Both sinks are overwrite-by-key, so replaying an event after a partial
//! failure converges on the same state.

mod cold_storage;
mod search;

use async_trait::async_trait;
use event_consumer::HandlerError;

use crate::documents::SearchDocument;

pub use cold_storage::{bronze_key, FsColdStorage, InMemoryColdStorage};
pub use search::{HttpSearchIndex, InMemorySearchIndex};

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// Worth retrying: outage, throttling, timeout
    #[error("sink unavailable: {0}")]
    Transient(String),

    /// The sink refused the write and will keep refusing it
    #[error("sink rejected write: {0}")]
    Permanent(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<SinkError> for HandlerError {
    fn from(err: SinkError) -> Self {
        match err {
            SinkError::Permanent(_) => HandlerError::permanent(err),
            SinkError::Transient(_) | SinkError::Io(_) => HandlerError::transient(err),
        }
    }
}

pub type SinkResult<T> = Result<T, SinkError>;

/// Append-only raw event archive, partitioned by ingest date and event type
#[async_trait]
pub trait ColdStorageSink: Send + Sync {
    /// Write `body` under `key`, replacing any previous object with that key
    async fn put(&self, key: &str, body: &[u8]) -> SinkResult<()>;
}

/// Search index keyed by the domain entity id
#[async_trait]
pub trait SearchSink: Send + Sync {
    async fn upsert(&self, document: &SearchDocument) -> SinkResult<()>;
}
