//! Delivery configuration shared by publishers, queues and consumers.
//!
//! Every knob that shapes redelivery, batching or retention lives here with its
//! default, so call sites never carry their own magic numbers.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::queue::QueueConfig;

/// Errors raised while reading configuration from the environment
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} must be set")]
    Missing { key: &'static str },

    #[error("{key} has invalid value '{value}': {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Delivery knobs for one pipeline.
///
/// | field                 | env                       | default  |
/// |-----------------------|---------------------------|----------|
/// | `batch_size`          | `BATCH_SIZE`              | 10       |
/// | `batching_window`     | `BATCHING_WINDOW_MS`      | 1s       |
/// | `maximum_concurrency` | `MAXIMUM_CONCURRENCY`     | 5        |
/// | `max_receive_count`   | `MAX_RECEIVE_COUNT`       | 3        |
/// | `visibility_timeout`  | `VISIBILITY_TIMEOUT_SECS` | 30s      |
/// | `idempotency_ttl`     | `IDEMPOTENCY_TTL_SECS`    | 24h      |
/// | `outbox_ttl`          | `OUTBOX_TTL_SECS`         | 7 days   |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryConfig {
    /// Upper bound on messages leased per batch
    pub batch_size: usize,
    /// How long a consumer waits to fill a batch before processing a partial one
    pub batching_window: Duration,
    /// Batches processed concurrently per queue (admission control on sinks)
    pub maximum_concurrency: usize,
    /// Deliveries allowed before a message is dead-lettered
    pub max_receive_count: u32,
    /// Lease granted to each received message
    pub visibility_timeout: Duration,
    /// Retention of idempotency records
    pub idempotency_ttl: Duration,
    /// Retention of published outbox records before the reaper removes them
    pub outbox_ttl: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            batching_window: Duration::from_secs(1),
            maximum_concurrency: 5,
            max_receive_count: 3,
            visibility_timeout: Duration::from_secs(30),
            idempotency_ttl: Duration::from_secs(24 * 60 * 60),
            outbox_ttl: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

impl DeliveryConfig {
    /// Read overrides from the environment; unset keys keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let config = Self {
            batch_size: positive("BATCH_SIZE", defaults.batch_size)?,
            batching_window: Duration::from_millis(parse_or(
                "BATCHING_WINDOW_MS",
                defaults.batching_window.as_millis() as u64,
            )?),
            maximum_concurrency: positive("MAXIMUM_CONCURRENCY", defaults.maximum_concurrency)?,
            max_receive_count: positive("MAX_RECEIVE_COUNT", defaults.max_receive_count)?,
            visibility_timeout: Duration::from_secs(positive(
                "VISIBILITY_TIMEOUT_SECS",
                defaults.visibility_timeout.as_secs(),
            )?),
            idempotency_ttl: Duration::from_secs(positive(
                "IDEMPOTENCY_TTL_SECS",
                defaults.idempotency_ttl.as_secs(),
            )?),
            outbox_ttl: Duration::from_secs(positive(
                "OUTBOX_TTL_SECS",
                defaults.outbox_ttl.as_secs(),
            )?),
        };

        Ok(config)
    }

    /// Queue settings for a queue named `name`
    pub fn queue_config(&self, name: impl Into<String>) -> QueueConfig {
        QueueConfig {
            name: name.into(),
            max_receive_count: self.max_receive_count,
            visibility_timeout: self.visibility_timeout,
        }
    }
}

/// Parse `key` from the environment, falling back to `default` when unset.
pub fn parse_or<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn positive<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialEq + Default + ToString,
    T::Err: std::fmt::Display,
{
    let value = parse_or(key, default)?;
    if value == T::default() {
        return Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}
