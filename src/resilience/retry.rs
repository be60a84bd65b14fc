//! Retry policies and the retry handler.
//!
//! Retries are immediate by default. The last error is returned unchanged so
//! callers can still match on its kind.

use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::RequestError;

/// Retry policy for a single request.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum RetryPolicy {
    /// No retries, the default for non-idempotent POSTs.
    #[default]
    None,
    /// Retry transport failures and retryable statuses with the client's config.
    /// Default for GET.
    Idempotent,
    /// Caller-provided retry config.
    Custom(RetryConfig),
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry. Zero retries immediately.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each retry.
    pub backoff_factor: f64,
    /// Whether to add ±25% jitter to the delay.
    pub jitter: bool,
    /// HTTP status codes that trigger a retry.
    pub retryable_statuses: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::ZERO,
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter: false,
            retryable_statuses: vec![408, 429, 500, 502, 503, 504],
        }
    }
}

impl RetryConfig {
    /// Exponential backoff starting at `initial_delay`, with jitter.
    pub fn with_backoff(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            jitter: true,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (0-indexed: 0 is the first retry).
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        if self.initial_delay.is_zero() {
            return Duration::ZERO;
        }
        let base = self.initial_delay.as_millis() as f64
            * self.backoff_factor.powi(retry.min(32) as i32);
        let capped = base.min(self.max_delay.as_millis() as f64);

        let final_ms = if self.jitter {
            let jitter_range = capped * 0.25;
            let jitter = (rand::random::<f64>() - 0.5) * 2.0 * jitter_range;
            (capped + jitter).max(0.0)
        } else {
            capped
        };

        Duration::from_millis(final_ms as u64)
    }
}

/// Errors that know whether another attempt could succeed.
pub trait Retryable {
    fn is_retryable(&self, config: &RetryConfig) -> bool;
}

impl Retryable for RequestError {
    fn is_retryable(&self, config: &RetryConfig) -> bool {
        match self {
            RequestError::Network(_) | RequestError::Timeout => true,
            RequestError::Http { status, .. } => config.retryable_statuses.contains(status),
            // Failing fast is the point of an open circuit.
            RequestError::CircuitOpen { .. } => false,
            RequestError::Decode(_) => false,
        }
    }
}

/// Snapshot of retry counters.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RetryStats {
    pub total_requests: u64,
    pub total_attempts: u64,
    /// Requests that succeeded after at least one retry.
    pub successful_retries: u64,
    /// Requests that failed after exhausting their attempts or on a
    /// non-retryable error.
    pub failed_retries: u64,
}

impl RetryStats {
    pub fn average_attempts(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.total_attempts as f64 / self.total_requests as f64
        }
    }
}

/// Runs operations under a [`RetryConfig`], classifying errors with [`Retryable`].
#[derive(Debug, Default)]
pub struct RetryHandler {
    config: RetryConfig,
    total_requests: AtomicU64,
    total_attempts: AtomicU64,
    successful_retries: AtomicU64,
    failed_retries: AtomicU64,
}

impl RetryHandler {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `f` with this handler's config.
    pub async fn execute<T, E, F, Fut>(&self, f: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        self.execute_with(&self.config, f).await
    }

    /// Run `f` with an explicit config, counting into this handler's stats.
    pub async fn execute_with<T, E, F, Fut>(&self, config: &RetryConfig, mut f: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let max_attempts = config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.total_attempts.fetch_add(1, Ordering::Relaxed);

            match f().await {
                Ok(value) => {
                    if attempt > 1 {
                        self.successful_retries.fetch_add(1, Ordering::Relaxed);
                    }
                    return Ok(value);
                }
                Err(e) => {
                    if attempt >= max_attempts || !e.is_retryable(config) {
                        self.failed_retries.fetch_add(1, Ordering::Relaxed);
                        return Err(e);
                    }

                    let delay = config.delay_for_attempt(attempt - 1);
                    tracing::debug!(
                        attempt,
                        max = max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying after error: {}",
                        e
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }

    pub fn stats(&self) -> RetryStats {
        RetryStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_attempts: self.total_attempts.load(Ordering::Relaxed),
            successful_retries: self.successful_retries.load(Ordering::Relaxed),
            failed_retries: self.failed_retries.load(Ordering::Relaxed),
        }
    }

    pub fn reset_stats(&self) {
        self.total_requests.store(0, Ordering::Relaxed);
        self.total_attempts.store(0, Ordering::Relaxed);
        self.successful_retries.store(0, Ordering::Relaxed);
        self.failed_retries.store(0, Ordering::Relaxed);
    }
}

/// Attempt `f` up to `max_attempts` times, retrying immediately on any error.
///
/// Returns the last error unchanged.
pub async fn retry<T, E, F, Fut>(mut f: F, max_attempts: u32) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= max_attempts => return Err(e),
            Err(_) => {
                tracing::debug!(attempt, max = max_attempts, "Retrying immediately");
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    fn counting<T: Clone + Send + 'static>(
        results: Vec<Result<T, RequestError>>,
    ) -> (
        Arc<AtomicU32>,
        impl FnMut() -> std::future::Ready<Result<T, RequestError>>,
    ) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let f = move || {
            let i = counter.fetch_add(1, Ordering::SeqCst) as usize;
            std::future::ready(results[i.min(results.len() - 1)].clone())
        };
        (calls, f)
    }

    #[test]
    fn test_retry_policy_default_is_none() {
        assert!(matches!(RetryPolicy::default(), RetryPolicy::None));
    }

    #[test]
    fn test_default_config_is_immediate() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(config.delay_for_attempt(5), Duration::ZERO);
        for status in [408, 429, 500, 502, 503, 504] {
            assert!(config.retryable_statuses.contains(&status));
        }
    }

    #[test]
    fn test_delay_for_attempt_no_jitter() {
        let config = RetryConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            ..RetryConfig::default()
        };
        assert_eq!(config.delay_for_attempt(0).as_millis(), 100);
        assert_eq!(config.delay_for_attempt(1).as_millis(), 200);
        assert_eq!(config.delay_for_attempt(2).as_millis(), 350);
    }

    #[test]
    fn test_classification() {
        let config = RetryConfig::default();
        assert!(RequestError::Network("reset".into()).is_retryable(&config));
        assert!(RequestError::Timeout.is_retryable(&config));
        let http = |status| RequestError::Http {
            status,
            message: String::new(),
        };
        assert!(http(503).is_retryable(&config));
        assert!(!http(404).is_retryable(&config));
        assert!(!RequestError::CircuitOpen {
            resource: "/x".into()
        }
        .is_retryable(&config));
    }

    #[tokio::test]
    async fn test_retry_succeeds_on_third_attempt() {
        let (calls, f) = counting(vec![
            Err(RequestError::Timeout),
            Err(RequestError::Timeout),
            Ok(7),
        ]);
        let result = retry(f, 3).await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_returns_last_error_unchanged() {
        let (calls, f) = counting::<u8>(vec![
            Err(RequestError::Timeout),
            Err(RequestError::Network("a".into())),
            Err(RequestError::Http {
                status: 502,
                message: "bad gateway".into(),
            }),
        ]);
        let err = retry(f, 3).await.unwrap_err();
        assert_eq!(
            err,
            RequestError::Http {
                status: 502,
                message: "bad gateway".into()
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_handler_stops_on_non_retryable() {
        let handler = RetryHandler::new(RetryConfig::default());
        let (calls, f) = counting::<u8>(vec![Err(RequestError::Http {
            status: 400,
            message: "bad".into(),
        })]);
        let err = handler.execute(f).await.unwrap_err();
        assert_eq!(err.status(), Some(400));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(handler.stats().failed_retries, 1);
    }

    #[tokio::test]
    async fn test_handler_stats() {
        let handler = RetryHandler::new(RetryConfig::default());
        let (_, f) = counting(vec![Err(RequestError::Timeout), Ok(1)]);
        handler.execute(f).await.unwrap();
        let (_, f) = counting(vec![Ok(2)]);
        handler.execute(f).await.unwrap();

        let stats = handler.stats();
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.total_attempts, 3);
        assert_eq!(stats.successful_retries, 1);
        assert_eq!(stats.failed_retries, 0);
        assert_eq!(stats.average_attempts(), 1.5);

        handler.reset_stats();
        assert_eq!(handler.stats(), RetryStats::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_waits_between_attempts_with_backoff() {
        let config = RetryConfig {
            initial_delay: Duration::from_millis(100),
            ..RetryConfig::default()
        };
        let handler = RetryHandler::new(config);
        let start = tokio::time::Instant::now();
        let (calls, f) = counting::<u8>(vec![Err(RequestError::Timeout)]);
        let _ = handler.execute(f).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 100ms + 200ms, advanced by the paused clock.
        assert!(start.elapsed() >= Duration::from_millis(300));
    }
}
