//! Polling and retry helpers with exponential backoff and jitter.
//!
//! [`wait_for`] polls a probe until it yields a value, for conditions such as
//! "a PVC is free" that are not errors but may take hours. [`retry_with_backoff`]
//! re-runs a fallible operation a bounded number of times.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Backoff settings for [`wait_for`]
#[derive(Clone, Debug)]
pub struct WaitPolicy {
    /// Delay after the first unsuccessful probe
    pub initial_delay: Duration,
    /// Upper bound of the delay between probes
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Give up after waiting this long (None = wait forever)
    pub max_wait: Option<Duration>,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            max_wait: None,
        }
    }
}

impl WaitPolicy {
    /// Poll at a fixed interval with no deadline
    pub fn fixed(interval: Duration) -> Self {
        Self {
            initial_delay: interval,
            max_delay: interval,
            backoff_multiplier: 1.0,
            max_wait: None,
        }
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        Duration::from_secs_f64(
            (delay.as_secs_f64() * self.backoff_multiplier).min(self.max_delay.as_secs_f64()),
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WaitError<E> {
    #[error("timed out after {waited:?} waiting for {what}")]
    TimedOut { what: String, waited: Duration },

    #[error("{0}")]
    Probe(E),
}

/// Add jitter: 0.5x to 1.5x of the delay
fn jittered(delay: Duration) -> Duration {
    let jitter = rand::rng().random_range(0.5..1.5);
    Duration::from_secs_f64(delay.as_secs_f64() * jitter)
}

/// Call `probe` until it returns `Some`, sleeping between attempts.
///
/// Probe errors are returned immediately. When `max_wait` is set and the
/// next sleep would end past it, returns [`WaitError::TimedOut`].
pub async fn wait_for<F, Fut, T, E>(
    policy: &WaitPolicy,
    what: &str,
    mut probe: F,
) -> Result<T, WaitError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let started = Instant::now();
    let mut delay = policy.initial_delay;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        if let Some(value) = probe().await.map_err(WaitError::Probe)? {
            if attempt > 1 {
                debug!(what, attempt, waited_ms = started.elapsed().as_millis(), "Wait satisfied");
            }
            return Ok(value);
        }

        let sleep = jittered(delay);
        if let Some(max_wait) = policy.max_wait {
            if started.elapsed() + sleep > max_wait {
                return Err(WaitError::TimedOut {
                    what: what.to_string(),
                    waited: started.elapsed(),
                });
            }
        }

        debug!(what, attempt, delay_ms = sleep.as_millis(), "Waiting");
        tokio::time::sleep(sleep).await;
        delay = policy.next_delay(delay);
    }
}

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Delay before attempt number `attempt + 1`, without jitter
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        Duration::from_secs_f64(
            (self.initial_delay.as_secs_f64() * factor).min(self.max_delay.as_secs_f64()),
        )
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt >= self.max_attempts
    }
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Returns the last error once `max_attempts` is exhausted.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if config.exhausted(attempt) {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let delay = jittered(config.delay_after(attempt));
                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = delay.as_millis(),
                    "Operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
