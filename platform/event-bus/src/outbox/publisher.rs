//! Outbox relay: drains pending records into the broker
//!
//! A failed hand-off only delays that record: it is rescheduled with its own
//! exponential backoff while records behind it keep flowing. The whole loop
//! backs off only when the store itself is unavailable.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::{sleep, Instant};

use super::{to_chrono, OutboxResult, OutboxStore};
use crate::backoff::Backoff;
use crate::EventBus;

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Idle poll period when no wake-up arrives
    pub poll_interval: Duration,
    /// Records fetched per pass
    pub batch_size: usize,
    /// First retry delay for a failed record, doubling per failure
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Pending longer than this raises the stuck-event alert
    pub stuck_threshold: Duration,
    pub reap_interval: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 100,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            stuck_threshold: Duration::from_secs(5 * 60),
            reap_interval: Duration::from_secs(60 * 60),
        }
    }
}

/// Outcome of one drain pass, by event_id
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub published: Vec<String>,
    pub failed: Vec<String>,
    /// Failed records pending longer than the stuck threshold
    pub stuck: Vec<String>,
}

/// Background relay from an [`OutboxStore`] to an [`EventBus`]
///
/// Several publishers may drain the same store: a record published twice is
/// absorbed by consumer-side idempotency.
pub struct OutboxPublisher {
    store: Arc<dyn OutboxStore>,
    bus: Arc<dyn EventBus>,
    config: PublisherConfig,
    wake: Option<Arc<Notify>>,
}

impl OutboxPublisher {
    pub fn new(store: Arc<dyn OutboxStore>, bus: Arc<dyn EventBus>, config: PublisherConfig) -> Self {
        Self {
            store,
            bus,
            config,
            wake: None,
        }
    }

    /// Drain immediately when `wake` is notified instead of waiting for the next poll
    pub fn with_wake(mut self, wake: Arc<Notify>) -> Self {
        self.wake = Some(wake);
        self
    }

    /// One pass over the oldest records that are due.
    ///
    /// Broker failures are per record and end up in the report; a store
    /// failure aborts the pass.
    pub async fn publish_pending(&self) -> OutboxResult<PublishReport> {
        let records = self
            .store
            .list_due(Utc::now(), self.config.batch_size)
            .await?;
        let retry_schedule = Backoff::new(self.config.initial_backoff, self.config.max_backoff);
        let mut report = PublishReport::default();

        for record in records {
            let event_id = record.event_id().to_string();

            match self.bus.publish(&record.envelope).await {
                Ok(()) => {
                    self.store.mark_published(&event_id).await?;
                    tracing::info!(
                        event_id = %event_id,
                        event_type = %record.envelope.event_type,
                        topic = %record.envelope.topic,
                        "Event published successfully"
                    );
                    report.published.push(event_id);
                }
                Err(e) => {
                    let error = e.to_string();
                    let attempts = record.publish_attempts + 1;
                    let retry_in = retry_schedule.delay_for_attempt(attempts);
                    let now = Utc::now();
                    self.store
                        .record_failure(&event_id, &error, now + to_chrono(retry_in))
                        .await?;

                    let age = record.age(now);
                    let stuck = age.to_std().is_ok_and(|a| a >= self.config.stuck_threshold);

                    if stuck {
                        tracing::error!(
                            alert = "outbox_stuck",
                            event_id = %event_id,
                            event_type = %record.envelope.event_type,
                            topic = %record.envelope.topic,
                            age_secs = age.num_seconds(),
                            attempts = attempts,
                            error = %error,
                            "Outbox event stuck unpublished"
                        );
                        report.stuck.push(event_id.clone());
                    } else {
                        tracing::warn!(
                            event_id = %event_id,
                            topic = %record.envelope.topic,
                            attempts = attempts,
                            retry_in_ms = retry_in.as_millis() as u64,
                            error = %error,
                            "Failed to publish event, will retry"
                        );
                    }
                    report.failed.push(event_id);
                }
            }
        }

        Ok(report)
    }

    /// Delete published records past their retention
    pub async fn reap(&self) -> OutboxResult<u64> {
        let reaped = self.store.reap_expired(Utc::now()).await?;
        if reaped > 0 {
            tracing::info!(reaped = reaped, "Reaped published outbox records");
        }
        Ok(reaped)
    }

    /// Run until `shutdown` flips to `true`
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "Starting outbox publisher"
        );

        let mut backoff = Backoff::new(self.config.initial_backoff, self.config.max_backoff);
        let mut last_reap = Instant::now();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let delay = match self.publish_pending().await {
                Ok(report) => {
                    if backoff.is_backing_off() {
                        tracing::info!("Outbox store reachable again");
                    }
                    backoff.reset();
                    if !report.failed.is_empty() {
                        tracing::warn!(
                            published = report.published.len(),
                            failed = report.failed.len(),
                            "Outbox pass had failures, records rescheduled"
                        );
                    }
                    // A full pass may have left more due records behind it
                    if report.published.len() + report.failed.len() >= self.config.batch_size {
                        Duration::ZERO
                    } else {
                        self.config.poll_interval
                    }
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::error!(
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Outbox store unavailable, backing off"
                    );
                    delay
                }
            };

            if last_reap.elapsed() >= self.config.reap_interval {
                if let Err(e) = self.reap().await {
                    tracing::error!(error = %e, "Outbox reaper failed");
                }
                last_reap = Instant::now();
            }

            let wake_enabled = !backoff.is_backing_off();
            let wake = self.wake.clone();
            let woken = async move {
                match wake {
                    Some(notify) if wake_enabled => notify.notified().await,
                    _ => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = sleep(delay) => {}
                _ = woken => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Outbox publisher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        BusError, BusResult, DurableQueue, EventEnvelope, InMemoryBus, InMemoryQueue,
        MemoryOutboxStore, OutboxError, QueueConfig,
    };
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Broker that fails while `down` is set
    struct FlakyBus {
        inner: InMemoryBus,
        down: AtomicBool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EventBus for FlakyBus {
        async fn publish(&self, envelope: &EventEnvelope) -> BusResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.down.load(Ordering::SeqCst) {
                return Err(BusError::ConnectionError("broker unreachable".to_string()));
            }
            self.inner.publish(envelope).await
        }
    }

    /// Broker whose queues for one topic refuse every message
    struct TopicOutageBus {
        inner: InMemoryBus,
        down_topic: String,
    }

    #[async_trait]
    impl EventBus for TopicOutageBus {
        async fn publish(&self, envelope: &EventEnvelope) -> BusResult<()> {
            if envelope.topic == self.down_topic {
                return Err(BusError::PublishError("queue refused message".to_string()));
            }
            self.inner.publish(envelope).await
        }
    }

    type Store = MemoryOutboxStore<HashMap<String, String>>;

    async fn fixture(down: bool) -> (Arc<Store>, Arc<FlakyBus>, Arc<InMemoryQueue>) {
        let store = Arc::new(Store::new(HashMap::new(), Duration::from_secs(3600)));
        let inner = InMemoryBus::new();
        let queue = Arc::new(InMemoryQueue::new(QueueConfig::new("policies-ingest")));
        inner.subscribe("policies", queue.clone()).await.unwrap();
        let bus = Arc::new(FlakyBus {
            inner,
            down: AtomicBool::new(down),
            calls: AtomicUsize::new(0),
        });
        (store, bus, queue)
    }

    async fn create_policy(store: &Store, event_id: &str) {
        store
            .transact(|policies, outbox| -> Result<(), OutboxError> {
                policies.insert(event_id.to_string(), "ACTIVE".to_string());
                outbox.enqueue(
                    EventEnvelope::new("PolicyCreated", "policies", json!({"policy": {}}))
                        .with_event_id(event_id),
                )
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_publish_pending_marks_published() {
        let (store, bus, queue) = fixture(false).await;
        create_policy(&store, "E1").await;
        create_policy(&store, "E2").await;

        let publisher = OutboxPublisher::new(store.clone(), bus, PublisherConfig::default());
        let report = publisher.publish_pending().await.unwrap();

        assert_eq!(report.published, vec!["E1", "E2"]);
        assert!(store.list_unpublished(10).await.unwrap().is_empty());
        assert_eq!(queue.depth().await.unwrap().available, 2);
    }

    /// No per-record delay, so consecutive passes retry immediately
    fn immediate_retry() -> PublisherConfig {
        PublisherConfig {
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            ..PublisherConfig::default()
        }
    }

    #[tokio::test]
    async fn test_broker_failure_leaves_record_pending() {
        let (store, bus, queue) = fixture(true).await;
        create_policy(&store, "E1").await;

        let publisher = OutboxPublisher::new(store.clone(), bus.clone(), immediate_retry());
        let report = publisher.publish_pending().await.unwrap();

        assert_eq!(report.failed, vec!["E1"]);
        assert!(report.stuck.is_empty());
        let record = store.get("E1").await.unwrap();
        assert!(!record.published);
        assert_eq!(record.publish_attempts, 1);

        bus.down.store(false, Ordering::SeqCst);
        let report = publisher.publish_pending().await.unwrap();
        assert_eq!(report.published, vec!["E1"]);
        assert_eq!(queue.depth().await.unwrap().available, 1);
    }

    #[tokio::test]
    async fn test_failed_record_backs_off_alone() {
        let store = Arc::new(Store::new(HashMap::new(), Duration::from_secs(3600)));
        let inner = InMemoryBus::new();
        let claims = Arc::new(InMemoryQueue::new(QueueConfig::new("claims-ingest")));
        inner.subscribe("claims", claims.clone()).await.unwrap();
        let bus = Arc::new(TopicOutageBus {
            inner,
            down_topic: "policies".to_string(),
        });

        create_policy(&store, "E1").await;
        store
            .transact(|_, outbox| {
                outbox.enqueue(
                    EventEnvelope::new("ClaimCreated", "claims", json!({"claim": {}}))
                        .with_event_id("E2"),
                )
            })
            .await
            .unwrap();

        let config = PublisherConfig {
            batch_size: 1,
            initial_backoff: Duration::from_secs(60),
            ..PublisherConfig::default()
        };
        let publisher = OutboxPublisher::new(store.clone(), bus, config);

        let first = publisher.publish_pending().await.unwrap();
        assert_eq!(first.failed, vec!["E1"]);
        let record = store.get("E1").await.unwrap();
        assert!(record.next_attempt_at >= Utc::now() + chrono::Duration::seconds(59));

        // The failing record no longer occupies the batch
        let second = publisher.publish_pending().await.unwrap();
        assert_eq!(second.published, vec!["E2"]);
        assert!(second.failed.is_empty());
        assert_eq!(claims.depth().await.unwrap().available, 1);
        assert!(!store.get("E1").await.unwrap().published);
    }

    #[tokio::test]
    async fn test_stuck_record_is_reported_not_dropped() {
        let (store, bus, _queue) = fixture(true).await;
        create_policy(&store, "E1").await;

        let config = PublisherConfig {
            stuck_threshold: Duration::ZERO,
            ..immediate_retry()
        };
        let publisher = OutboxPublisher::new(store.clone(), bus, config);

        for _ in 0..3 {
            let report = publisher.publish_pending().await.unwrap();
            assert_eq!(report.stuck, vec!["E1"]);
        }
        let record = store.get("E1").await.unwrap();
        assert!(!record.published);
        assert_eq!(record.publish_attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_publishes_on_wake_and_stops_on_shutdown() {
        let (store, bus, queue) = fixture(false).await;
        let config = PublisherConfig {
            poll_interval: Duration::from_secs(3600),
            ..PublisherConfig::default()
        };
        let publisher =
            OutboxPublisher::new(store.clone(), bus, config).with_wake(store.wake_handle());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(publisher.run(shutdown_rx));

        create_policy(&store, "E1").await;

        let batch = queue.receive(1, Duration::from_secs(5)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].envelope().unwrap().event_id, "E1");

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
        assert!(store.get("E1").await.unwrap().published);
    }

    // Record schedules use wall-clock time, so this runs in real time
    #[tokio::test]
    async fn test_run_retries_with_backoff_until_broker_recovers() {
        let (store, bus, queue) = fixture(true).await;
        create_policy(&store, "E1").await;

        let config = PublisherConfig {
            poll_interval: Duration::from_millis(10),
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(80),
            ..PublisherConfig::default()
        };
        let publisher = OutboxPublisher::new(store.clone(), bus.clone(), config);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(publisher.run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(500)).await;
        let attempts_while_down = bus.calls.load(Ordering::SeqCst);
        assert!(attempts_while_down >= 2);
        // 20 + 40 + 80 + 80 + ... keeps attempts well below one per poll interval
        assert!(attempts_while_down < 25);

        bus.down.store(false, Ordering::SeqCst);
        let batch = queue.receive(1, Duration::from_secs(5)).await.unwrap();
        assert_eq!(batch.len(), 1);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
        assert!(store.list_unpublished(10).await.unwrap().is_empty());
    }
}
