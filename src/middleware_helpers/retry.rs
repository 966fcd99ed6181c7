use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::errors::ServiceError;

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Factor to multiply delay by after each attempt
    pub backoff_factor: f64,
    /// Spread each pause randomly over 50%..150% of the delay
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::fixed(5, Duration::from_millis(50))
    }
}

impl RetryConfig {
    /// Constant delay between attempts.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: delay,
            max_delay: delay,
            backoff_factor: 1.0,
            jitter: true,
        }
    }
}

fn jittered(delay: Duration) -> Duration {
    let millis = delay.as_millis() as u64;
    if millis == 0 {
        return delay;
    }
    let spread = rand::thread_rng().gen_range(0..=millis);
    Duration::from_millis(millis / 2 + spread)
}

/// Retry policy for determining if an error is retryable
pub trait RetryPolicy<E> {
    fn is_retryable(&self, error: &E) -> bool;
}

/// Retries lost optimistic-lock races and transient storage failures.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransientErrorPolicy;

impl RetryPolicy<ServiceError> for TransientErrorPolicy {
    fn is_retryable(&self, error: &ServiceError) -> bool {
        use sea_orm::DbErr;

        match error {
            ServiceError::ConcurrentModification(_) => true,
            ServiceError::DatabaseError(DbErr::ConnectionAcquire(_) | DbErr::Conn(_)) => true,
            ServiceError::DatabaseError(DbErr::Exec(e) | DbErr::Query(e)) => {
                is_transient_message(&e.to_string())
            }
            _ => false,
        }
    }
}

fn is_transient_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    ["database is locked", "database is busy", "deadlock", "could not serialize"]
        .iter()
        .any(|needle| lower.contains(needle))
}

/// Execute an async function with retries
pub async fn with_retry<F, Fut, T, E>(
    config: &RetryConfig,
    policy: impl RetryPolicy<E>,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = config.initial_delay;
    let mut attempts = 0;

    loop {
        attempts += 1;

        match operation().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!("Operation succeeded after {} attempts", attempts);
                }
                return Ok(result);
            }
            Err(error) => {
                if attempts >= config.max_attempts || !policy.is_retryable(&error) {
                    if attempts > 1 {
                        warn!("Operation failed after {} attempts: {}", attempts, error);
                    }
                    return Err(error);
                }

                let pause = if config.jitter { jittered(delay) } else { delay };
                warn!(
                    "Attempt {} failed: {}. Retrying in {:?}...",
                    attempts, error, pause
                );

                sleep(pause).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_factor)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}
