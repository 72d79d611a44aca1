//! Builder chaining a rate limiter, circuit breaker, and retry policy around
//! a user operation.
//!
//! Wrapping order is fixed: **retry → circuit-breaker → limiter → user**,
//! outer to inner. The limiter check runs first on every attempt, so a
//! throttled call never reaches the breaker or the user operation; a
//! `Throttled` rejection also short-circuits the retry layer rather than
//! being retried like any other failure.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::breaker::CircuitBreaker;
use crate::error::{RateLimitError, Result};
use crate::quota::Quota;
use crate::retry::RetryPolicy;
use crate::rule::{drive_limiter, RateAlgorithm};
use crate::storage::Storage;

#[cfg(feature = "concurrent")]
use crate::algorithm::ConcurrentLimiter;

/// Binds a key to optional limiter/breaker/retry layers and runs a user
/// operation through them.
pub struct Composer<'a, S> {
    key: String,
    storage: &'a S,
    limiter_quota: Option<Quota>,
    algorithm: RateAlgorithm,
    breaker: Option<Arc<CircuitBreaker>>,
    retry: Option<RetryPolicy>,
    #[cfg(feature = "concurrent")]
    concurrency: Option<Arc<ConcurrentLimiter>>,
}

impl<'a, S: Storage> Composer<'a, S> {
    pub fn new(key: impl Into<String>, storage: &'a S) -> Self {
        Self {
            key: key.into(),
            storage,
            limiter_quota: None,
            algorithm: RateAlgorithm::default(),
            breaker: None,
            retry: None,
            #[cfg(feature = "concurrent")]
            concurrency: None,
        }
    }

    /// Gate calls behind a rate limit of `rate` requests per `per`.
    pub fn limit(mut self, rate: u64, per: Duration, algorithm: RateAlgorithm) -> Self {
        self.limiter_quota = Some(Quota::new(rate, per));
        self.algorithm = algorithm;
        self
    }

    /// Trip a circuit breaker after `failures` within `within`, staying open
    /// for `timeout`.
    pub fn break_on(mut self, failures: u32, within: Duration, timeout: Duration) -> Self {
        self.breaker = Some(Arc::new(CircuitBreaker::new(self.key.clone(), failures, within, timeout)));
        self
    }

    /// Retry a failed call up to `times` times with exponential backoff
    /// between `base_delay` and `max_delay`.
    pub fn retry_on_failure(mut self, times: usize, base_delay: Duration, max_delay: Duration) -> Self {
        self.retry = Some(RetryPolicy::new(times, base_delay, max_delay, 0.0));
        self
    }

    /// Bound the number of concurrent in-flight calls for this key (hedged
    /// requests), rejecting beyond `max_concurrent`.
    #[cfg(feature = "concurrent")]
    pub fn hedge(mut self, max_concurrent: u32) -> Self {
        self.concurrency = Some(Arc::new(ConcurrentLimiter::new(max_concurrent)));
        self
    }

    async fn run_once<T, Fut, F>(&self, op: &F) -> Result<T>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T>> + Send,
    {
        #[cfg(feature = "concurrent")]
        let _permit = match &self.concurrency {
            Some(limiter) => match limiter.try_acquire(&self.key) {
                Some(permit) => Some(permit),
                None => return Err(RateLimitError::RateLimitExceeded {
                    retry_after: None,
                    remaining: 0,
                    limit: 0,
                }),
            },
            None => None,
        };

        if let Some(breaker) = &self.breaker {
            if breaker.is_open() {
                return Err(RateLimitError::CircuitOpen { key: self.key.clone() });
            }
        }

        if let Some(quota) = &self.limiter_quota {
            let decision = drive_limiter(self.storage, &self.key, quota.clone(), self.algorithm, true).await?;
            if decision.is_denied() {
                let retry_after = decision.info().retry_after.unwrap_or(Duration::ZERO);
                return Err(RateLimitError::Throttled {
                    limiter_key: self.key.clone(),
                    retry_after,
                });
            }
        }

        let result = op().await;

        if let Some(breaker) = &self.breaker {
            match &result {
                Ok(_) => breaker.record_success(),
                Err(_) => breaker.record_failure(),
            }
        }

        result
    }

    /// Execute `op` wrapped as retry → circuit-breaker → limiter → `op`.
    ///
    /// A `Throttled` rejection from the limiter is never retried.
    pub async fn call<T, Fut, F>(&self, op: F) -> Result<T>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T>> + Send,
    {
        match &self.retry {
            Some(retry) => retry.run(|| self.run_once(&op)).await,
            None => self.run_once(&op).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_composer_plain_call() {
        let storage = MemoryStorage::new();
        let composer = Composer::new("job:1", &storage);

        let result = composer.call(|| async { Ok::<_, RateLimitError>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_composer_throttles() {
        let storage = MemoryStorage::new();
        let composer = Composer::new("job:2", &storage).limit(1, Duration::from_secs(60), RateAlgorithm::FixedWindow);

        assert!(composer.call(|| async { Ok::<_, RateLimitError>(()) }).await.is_ok());
        let err = composer.call(|| async { Ok::<_, RateLimitError>(()) }).await.unwrap_err();
        assert!(matches!(err, RateLimitError::Throttled { .. }));
    }

    #[tokio::test]
    async fn test_composer_throttle_not_retried() {
        let storage = MemoryStorage::new();
        let attempts = AtomicU32::new(0);
        let composer = Composer::new("job:3", &storage)
            .limit(1, Duration::from_secs(60), RateAlgorithm::FixedWindow)
            .retry_on_failure(3, Duration::from_millis(1), Duration::from_millis(5));

        composer.call(|| async { Ok::<_, RateLimitError>(()) }).await.unwrap();

        let err = composer
            .call(|| async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Ok::<_, RateLimitError>(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, RateLimitError::Throttled { .. }));
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_composer_breaker_opens() {
        let storage = MemoryStorage::new();
        let composer = Composer::new("job:4", &storage).break_on(2, Duration::from_secs(60), Duration::from_secs(300));

        for _ in 0..2 {
            let _ = composer
                .call(|| async { Err::<(), _>(RateLimitError::Internal("boom".into())) })
                .await;
        }

        let err = composer.call(|| async { Ok::<_, RateLimitError>(()) }).await.unwrap_err();
        assert!(matches!(err, RateLimitError::CircuitOpen { .. }));
    }

    #[tokio::test]
    async fn test_composer_retries_transient_failures() {
        let storage = MemoryStorage::new();
        let attempts = AtomicU32::new(0);
        let composer =
            Composer::new("job:5", &storage).retry_on_failure(5, Duration::from_millis(1), Duration::from_millis(5));

        let result = composer
            .call(|| async {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                if attempt < 2 {
                    Err(RateLimitError::Internal("transient".into()))
                } else {
                    Ok(())
                }
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
