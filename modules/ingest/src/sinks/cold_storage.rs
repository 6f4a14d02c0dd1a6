use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

use super::{ColdStorageSink, SinkError, SinkResult};
use crate::contracts::Domain;

/// `<domain>/bronze/ingest_date=<YYYY-MM-DD>/event_type=<type>/<event_id>.json`
pub fn bronze_key(
    domain: Domain,
    ingested_at: DateTime<Utc>,
    event_type: &str,
    event_id: &str,
) -> String {
    format!(
        "{}/bronze/ingest_date={}/event_type={}/{}.json",
        domain.as_str(),
        ingested_at.format("%Y-%m-%d"),
        event_type,
        event_id
    )
}

/// Cold storage on the local filesystem
///
/// Objects are written to a sibling temp file and renamed into place, so a
/// reader never observes a half-written object.
#[derive(Debug, Clone)]
pub struct FsColdStorage {
    root: PathBuf,
}

impl FsColdStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> SinkResult<PathBuf> {
        let relative = Path::new(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, std::path::Component::Normal(_)));
        if key.is_empty() || escapes {
            return Err(SinkError::Permanent(format!("invalid object key '{}'", key)));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ColdStorageSink for FsColdStorage {
    async fn put(&self, key: &str, body: &[u8]) -> SinkResult<()> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, body).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        tracing::debug!(key = %key, bytes = body.len(), "Stored object in cold storage");
        Ok(())
    }
}

/// Cold storage held in memory, for tests and local runs
#[derive(Debug, Clone, Default)]
pub struct InMemoryColdStorage {
    objects: std::sync::Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl InMemoryColdStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.read().await.get(key).cloned()
    }

    pub async fn keys(&self) -> Vec<String> {
        self.objects.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait]
impl ColdStorageSink for InMemoryColdStorage {
    async fn put(&self, key: &str, body: &[u8]) -> SinkResult<()> {
        self.objects
            .write()
            .await
            .insert(key.to_string(), body.to_vec());
        Ok(())
    }
}
