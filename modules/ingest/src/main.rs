use chrono::Utc;
use event_bus::{retry_with_backoff, InMemoryBus, PgDeadLetterStore, RetryConfig};
use event_consumer::{
    ConsumerConfig, IdempotencyStore, InMemoryIdempotencyStore, PgIdempotencyStore,
};
use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use ingest_rs::{
    build_router,
    config::{BusType, Config},
    pipeline,
    sinks::{ColdStorageSink, FsColdStorage, HttpSearchIndex, InMemorySearchIndex, SearchSink},
    AppState, IngestHandler,
};

const PURGE_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[tokio::main]
async fn main() {
    // Load environment variables from .env file (if present)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    tracing::info!("Starting ingest service...");

    let config = Config::from_env().expect("Failed to load configuration from environment");

    tracing::info!(
        host = %config.host,
        port = config.port,
        bus_type = ?config.bus_type,
        batch_size = config.delivery.batch_size,
        max_receive_count = config.delivery.max_receive_count,
        "Configuration loaded"
    );

    let pool = match &config.database_url {
        Some(url) => {
            tracing::info!("Connecting to database...");
            let pool = PgPoolOptions::new()
                .max_connections(5)
                .connect(url)
                .await
                .expect("Failed to connect to database");

            tracing::info!("Running migrations...");
            sqlx::migrate!("./db/migrations")
                .run(&pool)
                .await
                .expect("Failed to run migrations");
            Some(pool)
        }
        None => None,
    };

    // Idempotency store: Postgres when configured, in-process otherwise
    let ttl = config.delivery.idempotency_ttl;
    let idempotency: Arc<dyn IdempotencyStore> = match &pool {
        Some(pool) => Arc::new(PgIdempotencyStore::new(pool.clone(), ttl)),
        None => {
            tracing::warn!("DATABASE_URL not set, idempotency records are kept in memory");
            Arc::new(InMemoryIdempotencyStore::new(ttl))
        }
    };

    let cold_storage: Arc<dyn ColdStorageSink> =
        Arc::new(FsColdStorage::new(config.cold_storage_dir.clone()));
    let search: Arc<dyn SearchSink> = match &config.search_endpoint {
        Some(endpoint) => {
            tracing::info!(endpoint = %endpoint, "Indexing into search engine");
            Arc::new(
                HttpSearchIndex::new(endpoint.clone(), config.sink_timeout)
                    .expect("Failed to build search client"),
            )
        }
        None => {
            tracing::warn!("SEARCH_ENDPOINT not set, documents are indexed in memory");
            Arc::new(InMemorySearchIndex::new())
        }
    };
    let handler = Arc::new(IngestHandler::new(
        cold_storage,
        search,
        config.search_index_prefix.clone(),
    ));

    // Held until shutdown so pending acks are flushed
    let mut nats_client: Option<async_nats::Client> = None;
    let queues = match config.bus_type {
        BusType::Nats => {
            let pool = pool
                .clone()
                .expect("DATABASE_URL is required with BUS_TYPE=nats");

            tracing::info!("Connecting to NATS at {}", config.nats_url);
            let client = retry_with_backoff(
                || async_nats::connect(config.nats_url.as_str()),
                &RetryConfig {
                    max_attempts: 5,
                    ..RetryConfig::default()
                },
                "nats_connect",
            )
            .await
            .expect("Failed to connect to NATS");

            let context = async_nats::jetstream::new(client.clone());
            let queues = pipeline::declare_jetstream_queues(
                &context,
                &config.delivery,
                &PgDeadLetterStore::new(pool),
            )
            .await
            .expect("Failed to declare JetStream ingest queues");
            nats_client = Some(client);
            queues
        }
        BusType::InMemory => {
            tracing::info!("Using InMemory event bus; events must be published in-process");
            let bus = InMemoryBus::new();
            pipeline::declare_queues(&bus, &config.delivery)
                .await
                .expect("Failed to declare ingest queues")
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    let consumer_config =
        ConsumerConfig::from_delivery(&config.delivery).with_sink_timeout(config.sink_timeout);
    tasks.extend(pipeline::spawn_consumers(
        &queues,
        idempotency.clone(),
        handler,
        &consumer_config,
        &shutdown_rx,
    ));

    tasks.push(tokio::spawn(purge_idempotency_records(
        idempotency,
        shutdown_rx.clone(),
    )));

    let state = AppState::new(queues);
    state.set_ready(true);
    let app = build_router(state.clone());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .expect("Invalid HOST/PORT");
    tracing::info!("Ingest service listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind address");

    let shutdown_state = state.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown_state.set_ready(false);
        })
        .await
        .expect("Server failed to start");

    tracing::info!("Draining consumers...");
    let _ = shutdown_tx.send(true);
    for task in tasks {
        if let Err(e) = task.await {
            tracing::error!(error = %e, "Background task failed during shutdown");
        }
    }
    if let Some(client) = nats_client {
        if let Err(e) = client.flush().await {
            tracing::debug!(error = %e, "NATS flush failed during shutdown");
        }
    }
    tracing::info!("Ingest service stopped");
}

async fn purge_idempotency_records(
    store: Arc<dyn IdempotencyStore>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(PURGE_INTERVAL);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = store.purge_expired(Utc::now()).await {
                    tracing::warn!(error = %e, "Idempotency purge failed");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
