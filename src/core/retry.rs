//! Retry with exponential backoff

use crate::error::{classify, ErrorCategory};
use anyhow::Result;
use std::time::Duration;
use tokio::time::sleep;

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Backoff multiplier
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    pub fn new(max_retries: u32, initial_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }

    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::from_secs(0),
            max_delay: Duration::from_secs(0),
            backoff_multiplier: 1.0,
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_secs_f64(secs).min(self.max_delay)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(2, Duration::from_secs(1))
    }
}

/// Retry transient failures; permanent errors short-circuit immediately
pub async fn retry_transient<F, Fut, T>(config: &RetryConfig, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut last_error = None;

    for attempt in 0..=config.max_retries {
        match f().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!("Succeeded after {} retry attempt(s)", attempt);
                }
                return Ok(result);
            }
            Err(e) => {
                if classify(&e) == ErrorCategory::Permanent {
                    tracing::error!("Permanent error, not retrying: {:#}", e);
                    return Err(e);
                }

                if attempt < config.max_retries {
                    let delay = config.delay_for(attempt);
                    tracing::warn!(
                        "Attempt {} failed ({:#}), retrying in {:?}",
                        attempt + 1,
                        e,
                        delay
                    );
                    sleep(delay).await;
                } else {
                    tracing::error!("All {} attempts failed", config.max_retries + 1);
                }
                last_error = Some(e);
            }
        }
    }

    Err(last_error.expect("retry loop exited without an error"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_delay_progression() {
        let config = RetryConfig::new(5, Duration::from_secs(1));
        assert_eq!(config.delay_for(0), Duration::from_secs(1));
        assert_eq!(config.delay_for(1), Duration::from_secs(2));
        assert_eq!(config.delay_for(2), Duration::from_secs(4));
        // Clamped to max_delay.
        assert_eq!(config.delay_for(10), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_success_first_try() {
        let config = RetryConfig::default();
        let counter = Arc::new(AtomicUsize::new(0));

        let result: Result<i32> = retry_transient(&config, || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::Relaxed);
                Ok(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_transient_retried() {
        let config = RetryConfig::new(3, Duration::from_millis(1));
        let counter = Arc::new(AtomicUsize::new(0));

        let result = retry_transient(&config, || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::Relaxed) < 2 {
                    Err(PipelineError::Transient("flaky".into()).into())
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(counter.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_permanent_not_retried() {
        let config = RetryConfig::new(3, Duration::from_millis(1));
        let counter = Arc::new(AtomicUsize::new(0));

        let result: Result<i32> = retry_transient(&config, || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::Relaxed);
                Err(PipelineError::Input("corrupt".into()).into())
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_all_attempts_exhausted() {
        let config = RetryConfig::new(2, Duration::from_millis(1));
        let counter = Arc::new(AtomicUsize::new(0));

        let result: Result<i32> = retry_transient(&config, || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::Relaxed);
                Err(PipelineError::Transient("always".into()).into())
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::Relaxed), 3);
    }
}
