//! Fault injection wrappers around the broker and the sinks
//!
//! Faults draw from one seeded ChaCha stream. Task interleaving still varies
//! between runs, so the same `--seed` reproduces the workload and fault
//! rates, not the exact schedule.

use async_trait::async_trait;
use event_bus::{BusError, BusResult, EventBus, EventEnvelope};
use event_consumer::{HandlerError, MessageHandler};
use ingest_rs::documents::SearchDocument;
use ingest_rs::sinks::{ColdStorageSink, SearchSink, SinkError, SinkResult};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Shared seeded coin
#[derive(Clone)]
pub struct Dice {
    rng: Arc<Mutex<ChaCha8Rng>>,
}

impl Dice {
    pub fn new(rng: ChaCha8Rng) -> Self {
        Self {
            rng: Arc::new(Mutex::new(rng)),
        }
    }

    pub fn roll(&self, probability: f64) -> bool {
        if probability <= 0.0 {
            return false;
        }
        match self.rng.lock() {
            Ok(mut rng) => rng.gen_bool(probability.min(1.0)),
            Err(poisoned) => poisoned.into_inner().gen_bool(probability.min(1.0)),
        }
    }

    pub fn below(&self, n: usize) -> usize {
        match self.rng.lock() {
            Ok(mut rng) => rng.gen_range(0..n.max(1)),
            Err(poisoned) => poisoned.into_inner().gen_range(0..n.max(1)),
        }
    }
}

#[derive(Debug, Default)]
pub struct FaultCounters {
    pub publish_failures: AtomicU64,
    pub duplicate_publishes: AtomicU64,
    pub sink_failures: AtomicU64,
}

/// Broker that refuses some publishes and delivers some twice
pub struct FlakyBus {
    inner: Arc<dyn EventBus>,
    dice: Dice,
    failure_rate: f64,
    duplicate_rate: f64,
    counters: Arc<FaultCounters>,
}

impl FlakyBus {
    pub fn new(
        inner: Arc<dyn EventBus>,
        dice: Dice,
        failure_rate: f64,
        duplicate_rate: f64,
        counters: Arc<FaultCounters>,
    ) -> Self {
        Self {
            inner,
            dice,
            failure_rate,
            duplicate_rate,
            counters,
        }
    }
}

#[async_trait]
impl EventBus for FlakyBus {
    async fn publish(&self, envelope: &EventEnvelope) -> BusResult<()> {
        if self.dice.roll(self.failure_rate) {
            self.counters.publish_failures.fetch_add(1, Ordering::Relaxed);
            return Err(BusError::ConnectionError("injected broker outage".to_string()));
        }

        self.inner.publish(envelope).await?;

        if self.dice.roll(self.duplicate_rate) {
            self.counters
                .duplicate_publishes
                .fetch_add(1, Ordering::Relaxed);
            self.inner.publish(envelope).await?;
        }
        Ok(())
    }
}

/// Sink wrapper failing a share of writes with a transient error
pub struct FlakySink<T> {
    inner: T,
    dice: Dice,
    failure_rate: f64,
    counters: Arc<FaultCounters>,
}

impl<T> FlakySink<T> {
    pub fn new(inner: T, dice: Dice, failure_rate: f64, counters: Arc<FaultCounters>) -> Self {
        Self {
            inner,
            dice,
            failure_rate,
            counters,
        }
    }

    fn maybe_fail(&self) -> SinkResult<()> {
        if self.dice.roll(self.failure_rate) {
            self.counters.sink_failures.fetch_add(1, Ordering::Relaxed);
            return Err(SinkError::Transient("injected sink outage".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl<T: ColdStorageSink> ColdStorageSink for FlakySink<T> {
    async fn put(&self, key: &str, body: &[u8]) -> SinkResult<()> {
        self.maybe_fail()?;
        self.inner.put(key, body).await
    }
}

#[async_trait]
impl<T: SearchSink> SearchSink for FlakySink<T> {
    async fn upsert(&self, document: &SearchDocument) -> SinkResult<()> {
        self.maybe_fail()?;
        self.inner.upsert(document).await
    }
}

fn bump(counts: &Mutex<HashMap<String, u32>>, event_id: &str) {
    let mut counts = match counts.lock() {
        Ok(counts) => counts,
        Err(poisoned) => poisoned.into_inner(),
    };
    *counts.entry(event_id.to_string()).or_default() += 1;
}

fn snapshot(counts: &Mutex<HashMap<String, u32>>) -> HashMap<String, u32> {
    match counts.lock() {
        Ok(counts) => counts.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

/// Counts handler runs per event_id, successful and failed
pub struct CountingHandler {
    inner: Arc<dyn MessageHandler>,
    applied: Mutex<HashMap<String, u32>>,
    failed: Mutex<HashMap<String, u32>>,
}

impl CountingHandler {
    pub fn new(inner: Arc<dyn MessageHandler>) -> Self {
        Self {
            inner,
            applied: Mutex::new(HashMap::new()),
            failed: Mutex::new(HashMap::new()),
        }
    }

    pub fn applied(&self) -> HashMap<String, u32> {
        snapshot(&self.applied)
    }

    /// Failed runs, i.e. the events an injected fault actually hit
    pub fn failed(&self) -> HashMap<String, u32> {
        snapshot(&self.failed)
    }
}

#[async_trait]
impl MessageHandler for CountingHandler {
    async fn handle(&self, envelope: &EventEnvelope) -> Result<Option<Value>, HandlerError> {
        match self.inner.handle(envelope).await {
            Ok(snapshot) => {
                bump(&self.applied, &envelope.event_id);
                Ok(snapshot)
            }
            Err(e) => {
                bump(&self.failed, &envelope.event_id);
                Err(e)
            }
        }
    }
}
