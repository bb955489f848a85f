// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry logic with exponential backoff.
//!
//! Errors opt in to classification through [`Retryable`]: a non-retryable
//! error ends the loop immediately, whatever attempts remain.
//!
//! # Example
//!
//! ```
//! use sensor_sync::RetryConfig;
//! use std::time::Duration;
//!
//! // Startup: fail fast on bad config
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_retries, Some(5));
//!
//! // Opportunistic remote write: 3 attempts, 0.5s doubling
//! let remote = RetryConfig::remote_write();
//! assert_eq!(remote.max_retries, Some(3));
//! assert_eq!(remote.initial_delay, Duration::from_millis(500));
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

/// Classifies an error as worth another attempt or not.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Configuration for connection/operation retry behavior.
///
/// Use the preset constructors for common patterns:
/// - [`RetryConfig::startup()`] - Fast-fail for initial connections
/// - [`RetryConfig::remote_write()`] - Bounded retry for opportunistic remote writes
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub max_retries: Option<usize>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::remote_write()
    }
}

impl RetryConfig {
    /// Fast-fail retry for initial startup connection.
    /// Attempts 5 times with exponential backoff, failing after ~3 seconds.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Remote-tier writes on the ingestion path: 3 attempts at 0.5s, 1s.
    /// Failure here is not fatal, the reconciler replays the row later.
    #[must_use]
    pub fn remote_write() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(4),
            factor: 2.0,
        }
    }

    /// Single attempt, no waiting.
    #[must_use]
    pub fn once() -> Self {
        Self {
            max_retries: Some(1),
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            factor: 1.0,
        }
    }

    #[must_use]
    pub fn with_attempts(mut self, attempts: usize) -> Self {
        self.max_retries = Some(attempts.max(1));
        self
    }

    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self.max_delay = self.max_delay.max(delay);
        self
    }

    /// Fast retry for tests (minimal delays)
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }
}

/// The last error of a failed retry loop and how many attempts were made.
#[derive(Debug)]
pub struct RetryFailure<E> {
    pub attempts: usize,
    pub error: E,
}

/// Retry an operation, returning only the final error on failure.
pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display + Retryable,
{
    retry_counted(operation_name, config, operation)
        .await
        .map_err(|failure| failure.error)
}

/// Retry an operation, reporting the attempt count alongside the final error.
pub async fn retry_counted<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, RetryFailure<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display + Retryable,
{
    let mut delay = config.initial_delay;
    let mut attempts = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!("Operation '{}' succeeded after {} retries", operation_name, attempts);
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;

                if !err.is_retryable() {
                    warn!(
                        operation = operation_name,
                        attempts,
                        error = %err,
                        "Operation failed with non-retryable error"
                    );
                    return Err(RetryFailure { attempts, error: err });
                }

                if let Some(max) = config.max_retries {
                    if attempts >= max {
                        return Err(RetryFailure { attempts, error: err });
                    }
                    warn!(
                        "Operation '{}' failed (attempt {}/{}): {}. Retrying in {:?}...",
                        operation_name, attempts, max, err, delay
                    );
                } else {
                    warn!(
                        "Operation '{}' failed (attempt {}, will retry forever): {}. Next retry in {:?}...",
                        operation_name, attempts, err, delay
                    );
                }

                sleep(delay).await;
                delay = (delay.mul_f64(config.factor)).min(config.max_delay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct TestError {
        msg: String,
        retryable: bool,
    }

    impl TestError {
        fn transient(msg: &str) -> Self {
            Self { msg: msg.to_string(), retryable: true }
        }

        fn fatal(msg: &str) -> Self {
            Self { msg: msg.to_string(), retryable: false }
        }
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.msg)
        }
    }

    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            self.retryable
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_first_try() {
        let result: Result<i32, TestError> = retry(
            "test_op",
            &RetryConfig::test(),
            || async { Ok(42) },
        ).await;

        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<i32, TestError> = retry(
            "test_op",
            &RetryConfig::test(),
            || {
                let a = attempts_clone.clone();
                async move {
                    let count = a.fetch_add(1, Ordering::SeqCst) + 1;
                    if count < 3 {
                        Err(TestError::transient(&format!("fail {}", count)))
                    } else {
                        Ok(42)
                    }
                }
            },
        ).await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausts_retries() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<i32, RetryFailure<TestError>> = retry_counted(
            "test_op",
            &RetryConfig::test(),
            || {
                let a = attempts_clone.clone();
                async move {
                    a.fetch_add(1, Ordering::SeqCst);
                    Err(TestError::transient("always fail"))
                }
            },
        ).await;

        let failure = result.unwrap_err();
        assert!(failure.error.msg.contains("always fail"));
        assert_eq!(failure.attempts, 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_stops_immediately() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<i32, RetryFailure<TestError>> = retry_counted(
            "test_op",
            &RetryConfig::test(),
            || {
                let a = attempts_clone.clone();
                async move {
                    a.fetch_add(1, Ordering::SeqCst);
                    Err(TestError::fatal("bad payload"))
                }
            },
        ).await;

        assert_eq!(result.unwrap_err().attempts, 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_write_backoff_schedule() {
        let start = tokio::time::Instant::now();
        let result: Result<(), RetryFailure<TestError>> = retry_counted(
            "remote_put",
            &RetryConfig::remote_write(),
            || async { Err(TestError::transient("remote down")) },
        ).await;

        assert_eq!(result.unwrap_err().attempts, 3);
        // Sleeps of 500ms then 1s between the three attempts
        assert_eq!(start.elapsed(), Duration::from_millis(1500));
    }

    #[test]
    fn test_retry_config_presets() {
        let startup = RetryConfig::startup();
        assert_eq!(startup.max_retries, Some(5));

        let remote = RetryConfig::remote_write();
        assert_eq!(remote.max_retries, Some(3));
        assert_eq!(remote.initial_delay, Duration::from_millis(500));

        assert_eq!(RetryConfig::once().max_retries, Some(1));
        assert_eq!(RetryConfig::default().max_retries, Some(3));
    }

    #[test]
    fn test_builder_clamps_attempts() {
        let config = RetryConfig::remote_write().with_attempts(0);
        assert_eq!(config.max_retries, Some(1));

        let config = RetryConfig::remote_write().with_initial_delay(Duration::from_secs(10));
        assert!(config.max_delay >= Duration::from_secs(10));
    }

    #[test]
    fn test_delay_caps_at_max() {
        let config = RetryConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            factor: 10.0,
            max_retries: Some(5),
        };

        let mut delay = config.initial_delay;
        delay = (delay.mul_f64(config.factor)).min(config.max_delay);

        assert_eq!(delay, Duration::from_secs(5));
    }
}
