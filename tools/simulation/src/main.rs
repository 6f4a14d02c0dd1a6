//! Failure-injection run of the whole delivery pipeline:
//! producer outbox → publisher → broker → queues → batch consumers → sinks.
//!
//! Exits non-zero when any end-of-run invariant is violated.

mod faults;
mod oracle;
mod producer;

use anyhow::{bail, Context};
use clap::Parser;
use event_bus::{
    DeadLetter, DeliveryConfig, DurableQueue, EventBus, InMemoryBus, MemoryOutboxStore,
    OutboxPublisher, OutboxStore, PublisherConfig,
};
use event_consumer::{ConsumerConfig, InMemoryIdempotencyStore, MessageHandler};
use ingest_rs::contracts::{CLAIMS_TOPIC, POLICIES_TOPIC};
use ingest_rs::pipeline;
use ingest_rs::sinks::{ColdStorageSink, InMemoryColdStorage, InMemorySearchIndex, SearchSink};
use ingest_rs::IngestHandler;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing_subscriber::EnvFilter;

use faults::{CountingHandler, Dice, FaultCounters, FlakyBus, FlakySink};
use oracle::{Observation, Violation};
use producer::{Outcome, Producer, ProducerState};

const INDEX_PREFIX: &str = "sim";

#[derive(Parser, Debug)]
#[command(name = "simulation")]
#[command(about = "Drive the event pipeline under injected failures and check its invariants")]
struct Args {
    /// RNG seed for workload and fault generation
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Policies to create
    #[arg(long, default_value_t = 50)]
    policies: usize,

    /// Claims to file against existing policies
    #[arg(long, default_value_t = 50)]
    claims: usize,

    /// Policy status updates
    #[arg(long, default_value_t = 25)]
    updates: usize,

    /// Share of producer requests that fail validation
    #[arg(long, default_value_t = 0.1)]
    reject_rate: f64,

    /// Share of requests retried by the client with the same key
    #[arg(long, default_value_t = 0.1)]
    client_retry_rate: f64,

    /// Share of broker publishes that fail
    #[arg(long, default_value_t = 0.2)]
    publish_failure_rate: f64,

    /// Share of successful publishes delivered twice
    #[arg(long, default_value_t = 0.1)]
    duplicate_rate: f64,

    /// Share of sink writes that fail transiently
    #[arg(long, default_value_t = 0.15)]
    sink_failure_rate: f64,

    /// Unparseable bodies injected straight into the broker
    #[arg(long, default_value_t = 3)]
    malformed: usize,

    #[arg(long, default_value_t = 3)]
    max_receive_count: u32,

    /// Lease per delivery; copies deferred behind a reservation wait this long
    #[arg(long, default_value_t = 2000)]
    visibility_timeout_ms: u64,

    /// Give up waiting for the pipeline to settle after this long
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,
}

#[derive(Debug, Serialize)]
struct Report {
    seed: u64,
    committed_events: usize,
    rejected_requests: usize,
    replayed_requests: usize,
    policies: usize,
    claims: usize,
    publish_failures: u64,
    duplicate_publishes: u64,
    sink_failures: u64,
    redriven: usize,
    dead_letters: usize,
    elapsed_ms: u128,
    violations: Vec<Violation>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let args = Args::parse();
    let report = run(&args).await?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.violations.is_empty() {
        bail!("{} invariant violation(s)", report.violations.len());
    }
    Ok(())
}

async fn run(args: &Args) -> anyhow::Result<Report> {
    let started = Instant::now();
    let dice = Dice::new(ChaCha8Rng::seed_from_u64(args.seed));
    let counters = Arc::new(FaultCounters::default());

    let delivery = DeliveryConfig {
        max_receive_count: args.max_receive_count,
        visibility_timeout: Duration::from_millis(args.visibility_timeout_ms),
        ..DeliveryConfig::default()
    };

    // Broker and ingest side
    let bus = InMemoryBus::new();
    let queues = pipeline::declare_queues(&bus, &delivery)
        .await
        .context("declaring queues")?;

    let cold = InMemoryColdStorage::new();
    let search = InMemorySearchIndex::new();
    let cold_sink: Arc<dyn ColdStorageSink> = Arc::new(FlakySink::new(
        cold.clone(),
        dice.clone(),
        args.sink_failure_rate,
        counters.clone(),
    ));
    let search_sink: Arc<dyn SearchSink> = Arc::new(FlakySink::new(
        search.clone(),
        dice.clone(),
        args.sink_failure_rate,
        counters.clone(),
    ));
    let ingest: Arc<dyn MessageHandler> =
        Arc::new(IngestHandler::new(cold_sink, search_sink, INDEX_PREFIX));
    let counting = Arc::new(CountingHandler::new(ingest));

    let consumer_config = ConsumerConfig {
        batching_window: Duration::from_millis(20),
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(200),
        ..ConsumerConfig::from_delivery(&delivery)
    }
    .with_receive_wait(Duration::from_millis(50))
    .with_sink_timeout(Duration::from_secs(1));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = pipeline::spawn_consumers(
        &queues,
        Arc::new(InMemoryIdempotencyStore::new(delivery.idempotency_ttl)),
        counting.clone(),
        &consumer_config,
        &shutdown_rx,
    );

    // Producer side
    let store = Arc::new(MemoryOutboxStore::new(
        ProducerState::default(),
        delivery.outbox_ttl,
    ));
    let flaky_bus: Arc<dyn EventBus> = Arc::new(FlakyBus::new(
        Arc::new(bus.clone()),
        dice.clone(),
        args.publish_failure_rate,
        args.duplicate_rate,
        counters.clone(),
    ));
    let publisher = OutboxPublisher::new(
        store.clone(),
        flaky_bus,
        PublisherConfig {
            poll_interval: Duration::from_millis(20),
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(200),
            ..PublisherConfig::default()
        },
    )
    .with_wake(store.wake_handle());
    tasks.push(tokio::spawn(publisher.run(shutdown_rx.clone())));

    let producer = Producer::new(store.clone());
    let mut rejected = Vec::new();
    let mut replayed = 0;
    let mut policy_ids = Vec::new();

    let mut tally = |outcome: Outcome, rejected: &mut Vec<String>| match outcome {
        Outcome::Committed { entity_id, .. } => Some(entity_id),
        Outcome::Replayed { .. } => {
            replayed += 1;
            None
        }
        Outcome::Rejected { event_id } => {
            rejected.push(event_id);
            None
        }
    };

    for i in 0..args.policies {
        let premium = if dice.roll(args.reject_rate) { -1.0 } else { 100.0 + i as f64 };
        let request = json!({
            "customer_id": format!("CUST-{}", dice.below(20)),
            "status": "active",
            "premium": premium,
            "coverage_type": (["auto", "home", "life"][dice.below(3)]),
        });
        let client_key = format!("policy-{}", i);

        let outcome = producer.create_policy(&client_key, request.clone()).await;
        if let Some(policy_id) = tally(outcome, &mut rejected) {
            policy_ids.push(policy_id);
        }
        if dice.roll(args.client_retry_rate) {
            let outcome = producer.create_policy(&client_key, request).await;
            tally(outcome, &mut rejected);
        }
    }

    for i in 0..args.claims {
        let policy_id = if policy_ids.is_empty() || dice.roll(args.reject_rate) {
            "POL-unknown".to_string()
        } else {
            policy_ids[dice.below(policy_ids.len())].clone()
        };
        let request = json!({
            "policy_id": policy_id,
            "amount": 100 * (1 + dice.below(50)),
            "category": (["collision", "theft", "water"][dice.below(3)]),
        });
        let client_key = format!("claim-{}", i);

        let outcome = producer.create_claim(&client_key, request.clone()).await;
        tally(outcome, &mut rejected);
        if dice.roll(args.client_retry_rate) {
            let outcome = producer.create_claim(&client_key, request).await;
            tally(outcome, &mut rejected);
        }
    }

    for _ in 0..args.updates {
        if policy_ids.is_empty() {
            break;
        }
        let policy_id = &policy_ids[dice.below(policy_ids.len())];
        let status = ["suspended", "active", "cancelled"][dice.below(3)];
        producer.update_policy(policy_id, status).await?;
    }

    for i in 0..args.malformed {
        let topic = if i % 2 == 0 { POLICIES_TOPIC } else { CLAIMS_TOPIC };
        bus.publish_raw(topic, format!("{{\"event_id\": \"broken-{}\"", i).into_bytes())
            .await
            .context("injecting malformed body")?;
    }

    // Settle, then replay dead letters an injected fault explains, the way an
    // operator would once the sink recovers. Anything else stays for the oracle.
    let deadline = Instant::now() + Duration::from_secs(args.timeout_secs);
    let mut redriven = 0;
    loop {
        settle(store.as_ref(), &queues, deadline).await?;

        let failures = counting.failed();
        let mut replayed_now = 0;
        for queue in &queues {
            for letter in queue.dead_letters().await? {
                let faulted = letter
                    .message
                    .envelope()
                    .is_ok_and(|e| failures.get(&e.event_id).copied().unwrap_or(0) > 0);
                if faulted {
                    queue.redrive(letter.message.message_id).await?;
                    replayed_now += 1;
                }
            }
        }
        if replayed_now == 0 {
            break;
        }
        redriven += replayed_now;
    }

    shutdown_tx.send(true).ok();
    for task in tasks {
        task.await.context("pipeline task panicked")?;
    }

    // Observe
    let state = store.state().await;
    let outbox = store.records().await;
    let mut dead_letters: Vec<DeadLetter> = Vec::new();
    for queue in &queues {
        dead_letters.extend(queue.dead_letters().await?);
    }
    let applied = counting.applied();
    let handler_failures = counting.failed();
    let cold_storage_keys = cold.keys().await;

    let violations = oracle::check(&Observation {
        state: &state,
        outbox: &outbox,
        rejected_event_ids: &rejected,
        applied: &applied,
        handler_failures: &handler_failures,
        cold_storage_keys: &cold_storage_keys,
        indexed_policies: search.count(&format!("{}-policies", INDEX_PREFIX)).await,
        indexed_claims: search.count(&format!("{}-claims", INDEX_PREFIX)).await,
        dead_letters: &dead_letters,
        malformed_injected: args.malformed,
    });

    Ok(Report {
        seed: args.seed,
        committed_events: outbox.len(),
        rejected_requests: rejected.len(),
        replayed_requests: replayed,
        policies: state.policies.len(),
        claims: state.claims.len(),
        publish_failures: counters.publish_failures.load(Ordering::Relaxed),
        duplicate_publishes: counters.duplicate_publishes.load(Ordering::Relaxed),
        sink_failures: counters.sink_failures.load(Ordering::Relaxed),
        redriven,
        dead_letters: dead_letters.len(),
        elapsed_ms: started.elapsed().as_millis(),
        violations,
    })
}

/// Wait until the outbox is drained and no queue holds live messages
async fn settle(
    store: &dyn OutboxStore,
    queues: &[Arc<dyn DurableQueue>],
    deadline: Instant,
) -> anyhow::Result<()> {
    loop {
        let pending = store.list_unpublished(1).await?.len();
        let mut live = 0;
        for queue in queues {
            let depth = queue.depth().await?;
            live += depth.available + depth.in_flight;
        }

        if pending == 0 && live == 0 {
            return Ok(());
        }
        if Instant::now() >= deadline {
            bail!(
                "pipeline did not settle: {} pending outbox records, {} live messages",
                pending,
                live
            );
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
