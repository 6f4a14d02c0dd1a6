//! Exponential backoff
//!
//! [`Backoff`] paces long-running loops (outbox publisher, consumer receive
//! loop) after an infrastructure failure. [`Backoff::delay_for_attempt`]
//! schedules items that keep their own failure count, such as outbox records.
//! [`retry_with_backoff`] retries a single operation a bounded number of
//! times, e.g. connecting at startup.

use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first included
    pub max_attempts: u32,
    /// Initial backoff duration (doubles on each retry)
    pub initial_backoff: Duration,
    /// Maximum backoff duration to cap exponential growth
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Stateful doubling delay, capped at `max`
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Option<Duration>,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            current: None,
        }
    }

    /// Delay to wait before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        let delay = match self.current {
            None => self.initial,
            Some(previous) => previous.saturating_mul(2).min(self.max),
        };
        self.current = Some(delay);
        delay
    }

    /// Delay after the `attempt`-th consecutive failure (1-based), without mutating state
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(31);
        self.initial
            .saturating_mul(1u32 << doublings)
            .min(self.max)
    }

    /// Back to `initial` after a success
    pub fn reset(&mut self) {
        self.current = None;
    }

    /// True while a failure streak is in progress
    pub fn is_backing_off(&self) -> bool {
        self.current.is_some()
    }
}

impl From<&RetryConfig> for Backoff {
    fn from(config: &RetryConfig) -> Self {
        Self::new(config.initial_backoff, config.max_backoff)
    }
}

/// Retry a fallible async operation with exponential backoff
///
/// # Arguments
/// * `operation` - The async operation to retry
/// * `config` - Retry configuration
/// * `context` - Context string for logging (e.g., "connect_nats")
///
/// # Returns
/// * `Ok(T)` if operation succeeds within max_attempts
/// * `Err(E)` with the last error once attempts are exhausted
///
/// # Example
/// ```rust
/// use event_bus::backoff::{retry_with_backoff, RetryConfig};
///
/// # async fn example() -> Result<(), String> {
/// let config = RetryConfig::default();
/// let result = retry_with_backoff(
///     || async { Ok::<_, String>(42) },
///     &config,
///     "example_operation"
/// ).await?;
/// # Ok(())
/// # }
/// ```
pub async fn retry_with_backoff<F, Fut, T, E>(
    operation: F,
    config: &RetryConfig,
    context: &str,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    let mut backoff = Backoff::from(config);

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(context = %context, attempt = attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if attempt >= config.max_attempts => {
                warn!(
                    context = %context,
                    attempts = attempt,
                    error = %e,
                    "Operation failed after max retries"
                );
                return Err(e);
            }
            Err(e) => {
                let delay = backoff.next_delay();
                warn!(
                    context = %context,
                    attempt = attempt,
                    max_attempts = config.max_attempts,
                    backoff_ms = delay.as_millis() as u64,
                    error = %e,
                    "Operation failed, retrying with backoff"
                );
                sleep(delay).await;
            }
        }
    }
}
