//! Bounded exponential backoff for object store operations.

use smartcity_types::config::RetryConfig;
use std::future::Future;
use tracing::{debug, warn};

use super::stats::StreamMetrics;

/// Outcome of a failed attempt.
pub enum BackoffError<E> {
    /// The operation may succeed if retried.
    Temporary(E),

    /// Retrying will not help.
    Permanent(E),
}

impl<E> BackoffError<E> {
    pub fn should_retry(&self) -> bool {
        match self {
            BackoffError::Temporary(_) => true,
            BackoffError::Permanent(_) => false,
        }
    }

    pub fn inner(self) -> E {
        match self {
            BackoffError::Permanent(error) | BackoffError::Temporary(error) => error,
        }
    }
}

/// Runs `operation` until it succeeds, fails permanently, or has been
/// retried `config.max_retries` times.
///
/// The delay before retry `n` is `initial_backoff * 2^(n-1)`, capped at
/// `max_backoff`.  Retries are logged at `debug` level until `warn_after`
/// consecutive failures have accumulated, and at `warn` level afterwards.
/// Each retry increments `metrics.storage_retries`.
pub async fn retry_with_backoff<T, E, F, Fut>(
    context: &str,
    config: &RetryConfig,
    metrics: &StreamMetrics,
    mut operation: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BackoffError<E>>>,
{
    let mut failures = 0;
    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(error) if !error.should_retry() || failures >= config.max_retries => {
                return Err(error.inner());
            }
            Err(error) => {
                failures += 1;
                let delay = config.backoff(failures);
                let error = error.inner();
                if failures >= config.warn_after {
                    warn!(
                        "{context} failed ({failures} consecutive failures), retrying in {delay:?}: {error}"
                    );
                } else {
                    debug!("{context} failed, retrying in {delay:?}: {error}");
                }
                StreamMetrics::incr(&metrics.storage_retries);
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::{retry_with_backoff, BackoffError};
    use crate::controller::stats::StreamMetrics;
    use smartcity_types::config::RetryConfig;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio::time::Instant;

    fn config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff_ms: 100,
            max_backoff_ms: 250,
            warn_after: 3,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_failures() {
        let metrics = StreamMetrics::default();
        let start = Instant::now();
        let mut attempts = 0;
        let result: Result<u32, String> =
            retry_with_backoff("flush", &config(10), &metrics, || {
                attempts += 1;
                let attempt = attempts;
                async move {
                    if attempt <= 3 {
                        Err(BackoffError::Temporary(format!("outage {attempt}")))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;
        assert_eq!(result, Ok(4));
        assert_eq!(metrics.storage_retries.load(Ordering::Acquire), 3);
        // 100ms + 200ms + 250ms (capped).
        assert_eq!(start.elapsed(), Duration::from_millis(550));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up() {
        let metrics = StreamMetrics::default();
        let mut attempts = 0;
        let result: Result<(), String> = retry_with_backoff("put", &config(2), &metrics, || {
            attempts += 1;
            async { Err(BackoffError::Temporary("down".to_string())) }
        })
        .await;
        assert_eq!(result, Err("down".to_string()));
        assert_eq!(attempts, 3);
        assert_eq!(metrics.storage_retries.load(Ordering::Acquire), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_are_not_retried() {
        let metrics = StreamMetrics::default();
        let mut attempts = 0;
        let result: Result<(), String> = retry_with_backoff("put", &config(5), &metrics, || {
            attempts += 1;
            async { Err(BackoffError::Permanent("denied".to_string())) }
        })
        .await;
        assert_eq!(result, Err("denied".to_string()));
        assert_eq!(attempts, 1);
        assert_eq!(metrics.storage_retries.load(Ordering::Acquire), 0);
    }
}
