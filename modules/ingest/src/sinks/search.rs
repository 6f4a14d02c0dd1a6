use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use super::{SearchSink, SinkError, SinkResult};
use crate::documents::SearchDocument;

/// Search index reached over the engine's document API
///
/// Each upsert is `PUT {endpoint}/{index}/_doc/{id}`, which replaces the
/// document with that id.
#[derive(Clone)]
pub struct HttpSearchIndex {
    endpoint: String,
    http_client: Client,
}

impl HttpSearchIndex {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> SinkResult<Self> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SinkError::Permanent(format!("http client: {}", e)))?;

        Ok(Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            http_client,
        })
    }

    fn document_url(&self, document: &SearchDocument) -> String {
        format!(
            "{}/{}/_doc/{}",
            self.endpoint,
            document.index,
            urlencode(&document.id)
        )
    }
}

#[async_trait]
impl SearchSink for HttpSearchIndex {
    async fn upsert(&self, document: &SearchDocument) -> SinkResult<()> {
        let url = self.document_url(document);
        let response = self
            .http_client
            .put(&url)
            .json(&document.body)
            .send()
            .await
            .map_err(|e| SinkError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            tracing::info!(index = %document.index, id = %document.id, "Indexed document");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify(status, body))
    }
}

/// 4xx other than 429 will fail the same way on retry
fn classify(status: StatusCode, body: String) -> SinkError {
    let detail = format!("{}: {}", status, body);
    if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS {
        SinkError::Permanent(detail)
    } else {
        SinkError::Transient(detail)
    }
}

fn urlencode(id: &str) -> String {
    id.bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                (b as char).to_string()
            }
            _ => format!("%{:02X}", b),
        })
        .collect()
}

/// Search index held in memory, for tests and local runs
#[derive(Debug, Clone, Default)]
pub struct InMemorySearchIndex {
    documents: Arc<RwLock<HashMap<(String, String), Value>>>,
}

impl InMemorySearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, index: &str, id: &str) -> Option<Value> {
        self.documents
            .read()
            .await
            .get(&(index.to_string(), id.to_string()))
            .cloned()
    }

    /// Number of documents in one index
    pub async fn count(&self, index: &str) -> usize {
        self.documents
            .read()
            .await
            .keys()
            .filter(|(i, _)| i == index)
            .count()
    }
}

#[async_trait]
impl SearchSink for InMemorySearchIndex {
    async fn upsert(&self, document: &SearchDocument) -> SinkResult<()> {
        self.documents.write().await.insert(
            (document.index.clone(), document.id.clone()),
            document.body.clone(),
        );
        Ok(())
    }
}
