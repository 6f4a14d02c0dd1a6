//! In-process outbox that owns the producer's business state

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

use super::{OutboxError, OutboxRecord, OutboxResult, OutboxStore};
use crate::EventEnvelope;

/// Envelopes staged inside one [`MemoryOutboxStore::transact`] call
#[derive(Debug, Default)]
pub struct OutboxTx {
    staged: Vec<EventEnvelope>,
}

impl OutboxTx {
    /// Stage an envelope; it becomes visible only if the transaction commits
    pub fn enqueue(&mut self, envelope: EventEnvelope) -> Result<(), OutboxError> {
        if self.staged.iter().any(|e| e.event_id == envelope.event_id) {
            return Err(OutboxError::Duplicate(envelope.event_id));
        }
        self.staged.push(envelope);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.staged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }
}

struct Inner<S> {
    state: S,
    records: BTreeMap<u64, OutboxRecord>,
    index: HashMap<String, u64>,
    next_seq: u64,
}

/// Business state `S` and its outbox rows behind one lock
///
/// `transact` applies a closure to a working copy of the state; the copy and
/// the staged envelopes are committed together, or neither is.
///
/// # Example
/// ```rust
/// use event_bus::{EventEnvelope, MemoryOutboxStore, OutboxError, OutboxStore};
/// use std::collections::HashMap;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), OutboxError> {
/// let store: MemoryOutboxStore<HashMap<String, String>> =
///     MemoryOutboxStore::new(HashMap::new(), Duration::from_secs(3600));
///
/// store
///     .transact(|policies, outbox| {
///         policies.insert("POL-1".to_string(), "ACTIVE".to_string());
///         outbox.enqueue(EventEnvelope::new("PolicyCreated", "policies", serde_json::json!({})))
///     })
///     .await?;
///
/// assert_eq!(store.list_unpublished(10).await?.len(), 1);
/// # Ok(())
/// # }
/// ```
pub struct MemoryOutboxStore<S> {
    inner: Mutex<Inner<S>>,
    retention: Duration,
    wake: Arc<Notify>,
}

impl<S> MemoryOutboxStore<S>
where
    S: Clone + Send,
{
    pub fn new(state: S, retention: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state,
                records: BTreeMap::new(),
                index: HashMap::new(),
                next_seq: 0,
            }),
            retention,
            wake: Arc::new(Notify::new()),
        }
    }

    /// Notified after every commit that staged at least one envelope
    pub fn wake_handle(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// Run a business mutation and its outbox inserts as one atomic unit.
    ///
    /// On `Err` from the closure, or a staged `event_id` already present in
    /// the outbox, nothing is committed.
    pub async fn transact<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut S, &mut OutboxTx) -> Result<T, E>,
        E: From<OutboxError>,
    {
        let mut inner = self.inner.lock().await;

        let mut working = inner.state.clone();
        let mut tx = OutboxTx::default();
        let value = f(&mut working, &mut tx)?;

        if let Some(existing) = tx
            .staged
            .iter()
            .find(|e| inner.index.contains_key(&e.event_id))
        {
            tracing::warn!(event_id = %existing.event_id, "Outbox transaction aborted: duplicate event_id");
            return Err(OutboxError::Duplicate(existing.event_id.clone()).into());
        }

        inner.state = working;
        let staged = tx.staged.len();
        for envelope in tx.staged {
            let seq = inner.next_seq;
            inner.next_seq += 1;

            tracing::debug!(
                event_id = %envelope.event_id,
                event_type = %envelope.event_type,
                "Event enqueued to outbox"
            );

            inner.index.insert(envelope.event_id.clone(), seq);
            inner
                .records
                .insert(seq, OutboxRecord::new(envelope, self.retention));
        }
        drop(inner);

        if staged > 0 {
            self.wake.notify_one();
        }
        Ok(value)
    }

    /// Snapshot of the committed business state
    pub async fn state(&self) -> S {
        self.inner.lock().await.state.clone()
    }

    /// Every record still held, oldest first
    pub async fn records(&self) -> Vec<OutboxRecord> {
        self.inner.lock().await.records.values().cloned().collect()
    }

    pub async fn get(&self, event_id: &str) -> Option<OutboxRecord> {
        let inner = self.inner.lock().await;
        let seq = inner.index.get(event_id)?;
        inner.records.get(seq).cloned()
    }
}

#[async_trait]
impl<S> OutboxStore for MemoryOutboxStore<S>
where
    S: Clone + Send,
{
    async fn list_unpublished(&self, limit: usize) -> OutboxResult<Vec<OutboxRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .records
            .values()
            .filter(|r| !r.published)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn list_due(&self, now: DateTime<Utc>, limit: usize) -> OutboxResult<Vec<OutboxRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .records
            .values()
            .filter(|r| r.is_due(now))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_published(&self, event_id: &str) -> OutboxResult<bool> {
        let mut inner = self.inner.lock().await;
        let seq = *inner
            .index
            .get(event_id)
            .ok_or_else(|| OutboxError::NotFound(event_id.to_string()))?;
        let record = inner
            .records
            .get_mut(&seq)
            .ok_or_else(|| OutboxError::NotFound(event_id.to_string()))?;

        if record.published {
            return Ok(false);
        }
        record.published = true;
        record.published_at = Some(Utc::now());
        Ok(true)
    }

    async fn record_failure(
        &self,
        event_id: &str,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> OutboxResult<()> {
        let mut inner = self.inner.lock().await;
        let seq = *inner
            .index
            .get(event_id)
            .ok_or_else(|| OutboxError::NotFound(event_id.to_string()))?;
        if let Some(record) = inner.records.get_mut(&seq) {
            record.publish_attempts += 1;
            record.last_error = Some(error.to_string());
            record.next_attempt_at = retry_at;
        }
        Ok(())
    }

    async fn reap_expired(&self, now: DateTime<Utc>) -> OutboxResult<u64> {
        let mut inner = self.inner.lock().await;

        let reapable: HashSet<u64> = inner
            .records
            .iter()
            .filter(|(_, r)| r.is_reapable(now))
            .map(|(seq, _)| *seq)
            .collect();

        inner.records.retain(|seq, _| !reapable.contains(seq));
        inner.index.retain(|_, seq| !reapable.contains(seq));

        Ok(reapable.len() as u64)
    }
}
