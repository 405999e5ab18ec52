use std::time::Duration;
use tokio::time::sleep;
use rand::Rng;
use tracing::{warn, debug, error};
use crate::error::AppError;

/// Configuration for exponential backoff retry logic
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one (default: 3)
    pub max_attempts: u32,
    /// Base delay for exponential backoff in milliseconds (default: 100ms)
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds (default: 5000ms)
    pub max_delay_ms: u64,
    /// Jitter factor to prevent thundering herd (0.0 to 1.0, default: 0.1)
    pub jitter_factor: f64,
    /// Exponential backoff multiplier (default: 2.0)
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 5000,
            jitter_factor: 0.1,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Single attempt, no retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Retry configuration for record store writes and reads
    pub fn for_database() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 3000,
            jitter_factor: 0.15,
            backoff_multiplier: 2.0,
        }
    }

    /// Retry configuration for node RPC calls
    pub fn for_blockchain() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 1000,
            max_delay_ms: 8000,
            jitter_factor: 0.25,
            backoff_multiplier: 2.0,
        }
    }

    /// Blockchain preset with the attempt count and base delay taken from scan settings
    pub fn for_scan(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms,
            ..Self::for_blockchain()
        }
    }
}

/// Determines if an error is retryable based on its type and characteristics
pub fn is_retryable_error(error: &AppError) -> bool {
    match error {
        AppError::DatabaseError(msg) => {
            let msg_lower = msg.to_lowercase();

            // Connection-related errors (retryable)
            if msg_lower.contains("connection")
                || msg_lower.contains("timeout")
                || msg_lower.contains("timed out")
                || msg_lower.contains("network")
                || msg_lower.contains("broken pipe")
                || msg_lower.contains("pool") {
                return true;
            }

            // Deadlock and serialization errors (retryable)
            if msg_lower.contains("deadlock")
                || msg_lower.contains("serialization failure")
                || msg_lower.contains("could not serialize access") {
                return true;
            }

            // Constraint violations, syntax errors and the rest are not
            false
        },

        // Node transport failures are transient by nature
        AppError::BlockchainError(_) => true,

        AppError::RateLimitError(_) => true,

        AppError::ValidationError(_)
        | AppError::NotFound(_)
        | AppError::DecodeError(_)
        | AppError::ConfigError(_)
        | AppError::CheckpointError(_)
        | AppError::InternalError(_) => false,
    }
}

/// Calculate the delay for the next retry attempt with exponential backoff and jitter
fn calculate_delay(attempt: u32, config: &RetryConfig) -> Duration {
    let exponential_delay = config.base_delay_ms as f64
        * config.backoff_multiplier.powi(attempt as i32);

    let capped_delay = exponential_delay.min(config.max_delay_ms as f64);

    let mut rng = rand::thread_rng();
    let jitter_range = capped_delay * config.jitter_factor;
    let jitter = if jitter_range > 0.0 {
        rng.gen_range(-jitter_range..=jitter_range)
    } else {
        0.0
    };
    let final_delay = (capped_delay + jitter).max(0.0) as u64;

    Duration::from_millis(final_delay)
}

/// Execute a future with exponential backoff retry logic
pub async fn with_retry<F, Fut, T>(
    operation_name: &str,
    config: &RetryConfig,
    operation: F,
) -> Result<T, AppError>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, AppError>>,
{
    let mut last_error = None;
    let max_attempts = config.max_attempts.max(1);

    for attempt in 0..max_attempts {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(error) => {
                if !is_retryable_error(&error) {
                    debug!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        error = %error,
                        "Operation failed with non-retryable error"
                    );
                    return Err(error);
                }

                if attempt == max_attempts - 1 {
                    if max_attempts > 1 {
                        error!(
                            operation = operation_name,
                            attempt = attempt + 1,
                            max_attempts,
                            error = %error,
                            "Operation failed after all retry attempts"
                        );
                    }
                    last_error = Some(error);
                    break;
                }

                let delay = calculate_delay(attempt, config);
                warn!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Operation failed, retrying after delay"
                );
                last_error = Some(error);

                sleep(delay).await;
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        AppError::InternalError("Retry logic failed without capturing error".to_string())
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay_ms: 1,
            max_delay_ms: 5,
            jitter_factor: 0.0,
            backoff_multiplier: 2.0,
        }
    }

    #[test]
    fn test_is_retryable_error() {
        assert!(is_retryable_error(&AppError::DatabaseError("connection reset by peer".to_string())));
        assert!(is_retryable_error(&AppError::DatabaseError("deadlock detected".to_string())));
        assert!(is_retryable_error(&AppError::BlockchainError("eth_getLogs failed".to_string())));
        assert!(is_retryable_error(&AppError::RateLimitError("429".to_string())));

        assert!(!is_retryable_error(&AppError::DatabaseError("syntax error at or near".to_string())));
        assert!(!is_retryable_error(&AppError::DecodeError("missing topic".to_string())));
        assert!(!is_retryable_error(&AppError::NotFound("block 12".to_string())));
        assert!(!is_retryable_error(&AppError::ConfigError("bad".to_string())));
    }

    #[test]
    fn test_calculate_delay() {
        let config = RetryConfig::default();

        let delay1 = calculate_delay(0, &config);
        let delay2 = calculate_delay(1, &config);
        let delay3 = calculate_delay(2, &config);

        assert!(delay1.as_millis() >= 90);
        assert!(delay2.as_millis() >= 180);
        assert!(delay3.as_millis() >= 360);

        let long_delay = calculate_delay(10, &config);
        assert!(long_delay.as_millis() <= config.max_delay_ms as u128 * 2);
    }

    #[test]
    fn test_for_scan_never_drops_below_one_attempt() {
        assert_eq!(RetryConfig::for_scan(0, 10).max_attempts, 1);
        assert_eq!(RetryConfig::for_scan(5, 10).max_attempts, 5);
    }

    #[tokio::test]
    async fn test_retry_success_after_failures() {
        let attempt_count = Arc::new(AtomicU32::new(0));
        let attempt_count_clone = attempt_count.clone();

        let result = with_retry(
            "test_operation",
            &fast(3),
            move || {
                let count = attempt_count_clone.clone();
                async move {
                    let current = count.fetch_add(1, Ordering::SeqCst);
                    if current < 2 {
                        Err(AppError::BlockchainError("connection timeout".to_string()))
                    } else {
                        Ok(42)
                    }
                }
            },
        ).await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempt_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_non_retryable_error() {
        let attempt_count = Arc::new(AtomicU32::new(0));
        let attempt_count_clone = attempt_count.clone();

        let result = with_retry(
            "test_operation",
            &fast(3),
            move || {
                let count = attempt_count_clone.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Err::<i32, AppError>(AppError::DecodeError("bad topic".to_string()))
                }
            },
        ).await;

        assert!(result.is_err());
        assert_eq!(attempt_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_exhausted_attempts() {
        let attempt_count = Arc::new(AtomicU32::new(0));
        let attempt_count_clone = attempt_count.clone();

        let result = with_retry(
            "test_operation",
            &fast(3),
            move || {
                let count = attempt_count_clone.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Err::<i32, AppError>(AppError::BlockchainError("node unavailable".to_string()))
                }
            },
        ).await;

        assert_eq!(result, Err(AppError::BlockchainError("node unavailable".to_string())));
        assert_eq!(attempt_count.load(Ordering::SeqCst), 3);
    }
}
