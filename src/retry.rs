//! Retry policy wrapper around the `backon` crate.
//!
//! Used by the Composer (`crate::composer`) as the outermost layer around
//! retry → circuit-breaker → limiter → user operation. `RateLimitError::Throttled`
//! is never retried; a throttle rejection propagates straight through.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};

use crate::error::RateLimitError;

/// Exponential-backoff retry around a fallible async operation.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_attempts: usize,
    base_delay: Duration,
    max_delay: Duration,
    jitter: bool,
}

impl RetryPolicy {
    /// `jitter_factor > 0.0` enables backon's randomized jitter; backon only
    /// supports an on/off jitter, not a continuous factor, so any positive
    /// value enables it.
    pub fn new(
        max_attempts: usize,
        base_delay: Duration,
        max_delay: Duration,
        jitter_factor: f32,
    ) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            jitter: jitter_factor > 0.0,
        }
    }

    fn builder(&self) -> ExponentialBuilder {
        let builder = ExponentialBuilder::new()
            .with_min_delay(self.base_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_attempts);

        if self.jitter {
            builder.with_jitter()
        } else {
            builder
        }
    }

    /// Run `op`, retrying on every error except a throttle rejection.
    ///
    /// A throttle rejection propagates unchanged (it was never retried).
    /// Any other error that survives all attempts is wrapped in
    /// `RateLimitError::RetryExhausted` so callers never need to import
    /// `backon` to recognize retry exhaustion.
    pub async fn run<T, Fut, F>(&self, mut op: F) -> Result<T, RateLimitError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RateLimitError>>,
    {
        let attempts = AtomicU32::new(0);

        let result = (|| {
            attempts.fetch_add(1, Ordering::SeqCst);
            op()
        })
        .retry(self.builder())
        .when(|err| !matches!(err, RateLimitError::Throttled { .. }))
        .await;

        result.map_err(|err| {
            if matches!(err, RateLimitError::Throttled { .. }) {
                err
            } else {
                RateLimitError::RetryExhausted {
                    attempts: attempts.load(Ordering::SeqCst),
                    last_error: Box::new(err),
                }
            }
        })
    }
}
