use event_bus::config::parse_or;
use event_bus::{ConfigError, DeliveryConfig};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusType {
    Nats,
    InMemory,
}

impl BusType {
    pub fn from_env() -> Self {
        match env::var("BUS_TYPE")
            .unwrap_or_else(|_| "inmemory".to_string())
            .to_lowercase()
            .as_str()
        {
            "nats" => BusType::Nats,
            "inmemory" => BusType::InMemory,
            other => {
                tracing::warn!(bus_type = %other, "Unknown BUS_TYPE, defaulting to inmemory");
                BusType::InMemory
            }
        }
    }
}

/// Application configuration parsed from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub delivery: DeliveryConfig,
    pub bus_type: BusType,
    pub nats_url: String,
    /// Postgres idempotency store when set, in-memory otherwise.
    /// Required with the NATS bus, which keeps dead letters there.
    pub database_url: Option<String>,
    pub host: String,
    pub port: u16,
    pub cold_storage_dir: PathBuf,
    /// Search engine base URL; documents stay in memory when unset
    pub search_endpoint: Option<String>,
    pub search_index_prefix: String,
    pub sink_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let delivery = DeliveryConfig::from_env()?;

        let port = parse_or("PORT", 8095u16)?;
        let sink_timeout = Duration::from_millis(parse_or("SINK_TIMEOUT_MS", 10_000u64)?);
        if sink_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                key: "SINK_TIMEOUT_MS",
                value: "0".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }

        let search_index_prefix =
            env::var("SEARCH_INDEX_PREFIX").unwrap_or_else(|_| "ins".to_string());
        if search_index_prefix.trim().is_empty() {
            return Err(ConfigError::Missing {
                key: "SEARCH_INDEX_PREFIX",
            });
        }

        let bus_type = BusType::from_env();
        let database_url = non_empty("DATABASE_URL");
        if bus_type == BusType::Nats && database_url.is_none() {
            return Err(ConfigError::Missing {
                key: "DATABASE_URL",
            });
        }

        Ok(Config {
            delivery,
            bus_type,
            nats_url: env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string()),
            database_url,
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port,
            cold_storage_dir: PathBuf::from(
                env::var("COLD_STORAGE_DIR").unwrap_or_else(|_| "./data/bronze".to_string()),
            ),
            search_endpoint: non_empty("SEARCH_ENDPOINT"),
            search_index_prefix,
            sink_timeout,
        })
    }
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}
