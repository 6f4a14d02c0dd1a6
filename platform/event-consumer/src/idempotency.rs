//! Idempotency store
//!
//! Records "this logical operation has already been applied". A key moves
//! through two states:
//!
//! - `reserved`: a consumer won [`IdempotencyStore::check_and_reserve`] and is
//!   applying side effects. The reservation lapses at `reserved_until` so a
//!   consumer that dies mid-ingestion does not block the key forever. Only the
//!   holder of the reservation token may complete or abandon it.
//! - `completed`: side effects are done; replays are no-ops until `expires_at`.
//!
//! After `expires_at` a replayed key is treated as new.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    Reserved,
    Completed,
}

impl RecordState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordState::Reserved => "reserved",
            RecordState::Completed => "completed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "reserved" => Some(RecordState::Reserved),
            "completed" => Some(RecordState::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IdempotencyRecord {
    pub key: String,
    pub state: RecordState,
    /// What the first successful application returned
    pub result_snapshot: Option<Value>,
    pub reserved_until: Option<DateTime<Utc>>,
    /// Owner of a `reserved` record; `None` once completed
    pub reservation_token: Option<Uuid>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    /// Whether the record still blocks a new reservation at `now`
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            RecordState::Completed => self.expires_at > now,
            RecordState::Reserved => {
                self.expires_at > now && self.reserved_until.is_some_and(|until| until > now)
            }
        }
    }

    /// Reserved under `token`, lapsed or not
    pub fn is_held_by(&self, token: Uuid) -> bool {
        self.state == RecordState::Reserved && self.reservation_token == Some(token)
    }
}

/// Outcome of [`IdempotencyStore::check_and_reserve`]
#[derive(Debug, Clone, PartialEq)]
pub enum Reservation {
    /// The caller now holds the key and must `complete` or `abandon` it with this token
    New(Uuid),
    /// Someone already applied, or is applying, this key
    Duplicate(IdempotencyRecord),
}

#[derive(Debug, thiserror::Error)]
pub enum IdempotencyError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("stored record for {key} is unreadable: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("reservation for {0} kept changing underneath the caller")]
    Contended(String),

    #[error("reservation for {0} is no longer held by the caller")]
    ReservationLost(String),
}

pub type IdempotencyResult<T> = Result<T, IdempotencyError>;

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Atomically reserve `key` unless a live record exists.
    ///
    /// Of any number of concurrent callers for the same key exactly one gets
    /// [`Reservation::New`].
    async fn check_and_reserve(
        &self,
        key: &str,
        reservation_ttl: Duration,
    ) -> IdempotencyResult<Reservation>;

    /// Mark `key` as applied, keeping it for the store's retention.
    ///
    /// Fails with [`IdempotencyError::ReservationLost`] unless `token` still
    /// owns the reservation.
    async fn complete(
        &self,
        key: &str,
        token: Uuid,
        result_snapshot: Option<Value>,
    ) -> IdempotencyResult<()>;

    /// Drop a reservation after a failed application.
    ///
    /// Completed records and reservations taken over by someone else are left alone.
    async fn abandon(&self, key: &str, token: Uuid) -> IdempotencyResult<()>;

    async fn get(&self, key: &str) -> IdempotencyResult<Option<IdempotencyRecord>>;

    /// Delete records past `expires_at`
    async fn purge_expired(&self, now: DateTime<Utc>) -> IdempotencyResult<u64>;
}

/// Composite producer-side key for request dedup:
/// `IDEM#<client key>#<first 16 hex chars of sha256(request json)>`.
///
/// Object keys are serialized in sorted order, so two requests that differ
/// only in field order map to the same key.
pub fn business_key(client_key: &str, request: &Value) -> String {
    let canonical = serde_json::to_string(request).unwrap_or_default();
    let digest = format!("{:x}", Sha256::digest(canonical.as_bytes()));
    format!("IDEM#{}#{}", client_key, &digest[..16])
}

pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

/// Mutex-guarded map, for tests and single-process deployments
pub struct InMemoryIdempotencyStore {
    records: Mutex<HashMap<String, IdempotencyRecord>>,
    ttl: Duration,
}

impl InMemoryIdempotencyStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn check_and_reserve(
        &self,
        key: &str,
        reservation_ttl: Duration,
    ) -> IdempotencyResult<Reservation> {
        let now = Utc::now();
        let mut records = self.records.lock().await;

        if let Some(existing) = records.get(key) {
            if existing.is_live(now) {
                return Ok(Reservation::Duplicate(existing.clone()));
            }
            tracing::debug!(key = %key, state = existing.state.as_str(), "Replacing lapsed idempotency record");
        }

        let token = Uuid::new_v4();
        records.insert(
            key.to_string(),
            IdempotencyRecord {
                key: key.to_string(),
                state: RecordState::Reserved,
                result_snapshot: None,
                reserved_until: Some(now + to_chrono(reservation_ttl)),
                reservation_token: Some(token),
                expires_at: now + to_chrono(self.ttl),
            },
        );
        Ok(Reservation::New(token))
    }

    async fn complete(
        &self,
        key: &str,
        token: Uuid,
        result_snapshot: Option<Value>,
    ) -> IdempotencyResult<()> {
        let now = Utc::now();
        let mut records = self.records.lock().await;

        match records.get_mut(key) {
            Some(record) if record.is_held_by(token) => {
                record.state = RecordState::Completed;
                record.result_snapshot = result_snapshot;
                record.reserved_until = None;
                record.reservation_token = None;
                record.expires_at = now + to_chrono(self.ttl);
                Ok(())
            }
            _ => Err(IdempotencyError::ReservationLost(key.to_string())),
        }
    }

    async fn abandon(&self, key: &str, token: Uuid) -> IdempotencyResult<()> {
        let mut records = self.records.lock().await;
        if matches!(records.get(key), Some(r) if r.is_held_by(token)) {
            records.remove(key);
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> IdempotencyResult<Option<IdempotencyRecord>> {
        Ok(self.records.lock().await.get(key).cloned())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> IdempotencyResult<u64> {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, r| r.expires_at > now);
        Ok((before - records.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    const LEASE: Duration = Duration::from_secs(30);

    async fn reserve(store: &InMemoryIdempotencyStore, key: &str, ttl: Duration) -> Uuid {
        match store.check_and_reserve(key, ttl).await.unwrap() {
            Reservation::New(token) => token,
            other => panic!("expected new reservation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_first_reserve_is_new_then_duplicate() {
        let store = InMemoryIdempotencyStore::new(Duration::from_secs(3600));

        reserve(&store, "E1", LEASE).await;
        match store.check_and_reserve("E1", LEASE).await.unwrap() {
            Reservation::Duplicate(record) => assert_eq!(record.state, RecordState::Reserved),
            other => panic!("expected duplicate, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_completed_record_returns_prior_result() {
        let store = InMemoryIdempotencyStore::new(Duration::from_secs(3600));
        let token = reserve(&store, "E1", LEASE).await;
        store
            .complete("E1", token, Some(json!({"document_id": "POL-1"})))
            .await
            .unwrap();

        match store.check_and_reserve("E1", LEASE).await.unwrap() {
            Reservation::Duplicate(record) => {
                assert_eq!(record.state, RecordState::Completed);
                assert_eq!(record.result_snapshot, Some(json!({"document_id": "POL-1"})));
                assert!(record.reservation_token.is_none());
            }
            other => panic!("expected duplicate, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_abandon_frees_reservation_but_not_completion() {
        let store = InMemoryIdempotencyStore::new(Duration::from_secs(3600));

        let token = reserve(&store, "E1", LEASE).await;
        store.abandon("E1", token).await.unwrap();
        let token = reserve(&store, "E1", LEASE).await;

        store.complete("E1", token, None).await.unwrap();
        store.abandon("E1", token).await.unwrap();
        assert!(matches!(
            store.check_and_reserve("E1", LEASE).await.unwrap(),
            Reservation::Duplicate(_)
        ));
    }

    #[tokio::test]
    async fn test_lapsed_reservation_can_be_taken_over() {
        let store = InMemoryIdempotencyStore::new(Duration::from_secs(3600));

        reserve(&store, "E1", Duration::ZERO).await;
        reserve(&store, "E1", LEASE).await;
    }

    #[tokio::test]
    async fn test_previous_holder_cannot_touch_taken_over_reservation() {
        let store = InMemoryIdempotencyStore::new(Duration::from_secs(3600));

        let stale = reserve(&store, "E1", Duration::ZERO).await;
        let current = reserve(&store, "E1", LEASE).await;

        store.abandon("E1", stale).await.unwrap();
        assert!(matches!(
            store.complete("E1", stale, Some(json!({"stale": true}))).await,
            Err(IdempotencyError::ReservationLost(_))
        ));

        let record = store.get("E1").await.unwrap().unwrap();
        assert_eq!(record.state, RecordState::Reserved);
        assert_eq!(record.reservation_token, Some(current));

        store.complete("E1", current, None).await.unwrap();
        assert_eq!(
            store.get("E1").await.unwrap().unwrap().state,
            RecordState::Completed
        );
    }

    #[tokio::test]
    async fn test_lapsed_holder_completes_when_nobody_took_over() {
        let store = InMemoryIdempotencyStore::new(Duration::from_secs(3600));

        let token = reserve(&store, "E1", Duration::ZERO).await;
        store.complete("E1", token, None).await.unwrap();
        assert_eq!(
            store.get("E1").await.unwrap().unwrap().state,
            RecordState::Completed
        );
    }

    #[tokio::test]
    async fn test_complete_without_reservation_fails() {
        let store = InMemoryIdempotencyStore::new(Duration::from_secs(3600));

        assert!(matches!(
            store.complete("E1", Uuid::new_v4(), None).await,
            Err(IdempotencyError::ReservationLost(_))
        ));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_expired_completion_is_treated_as_new() {
        let store = InMemoryIdempotencyStore::new(Duration::ZERO);
        let token = reserve(&store, "E1", LEASE).await;
        store.complete("E1", token, None).await.unwrap();

        reserve(&store, "E1", LEASE).await;
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = InMemoryIdempotencyStore::new(Duration::from_secs(60));
        for key in ["E1", "E2"] {
            let token = reserve(&store, key, LEASE).await;
            store.complete(key, token, None).await.unwrap();
        }

        assert_eq!(store.purge_expired(Utc::now()).await.unwrap(), 0);
        let later = Utc::now() + chrono::Duration::seconds(120);
        assert_eq!(store.purge_expired(later).await.unwrap(), 2);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_concurrent_reserve_has_exactly_one_winner() {
        let store = Arc::new(InMemoryIdempotencyStore::new(Duration::from_secs(3600)));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.check_and_reserve("E1", LEASE).await.unwrap() })
            })
            .collect();

        let mut new = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), Reservation::New(_)) {
                new += 1;
            }
        }
        assert_eq!(new, 1);
    }

    #[test]
    fn test_business_key_format() {
        let key = business_key("client-abc", &json!({"policy_id": "POL-1", "amount": 10}));
        let parts: Vec<&str> = key.split('#').collect();

        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "IDEM");
        assert_eq!(parts[1], "client-abc");
        assert_eq!(parts[2].len(), 16);
        assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_business_key_ignores_field_order() {
        let a = serde_json::from_str::<Value>(r#"{"a": 1, "b": 2}"#).unwrap();
        let b = serde_json::from_str::<Value>(r#"{"b": 2, "a": 1}"#).unwrap();
        assert_eq!(business_key("k", &a), business_key("k", &b));
        assert_ne!(business_key("k", &a), business_key("k", &json!({"a": 2, "b": 2})));
    }
}
