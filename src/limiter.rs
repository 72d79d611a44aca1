//! Thin per-key rate limiter façade.
//!
//! `RateLimitManager` composes limiters across routes; `Limiter` is the
//! single-key primitive that rules (`crate::rule`) and the Composer build
//! on, wrapping one `Algorithm` + `Storage` pair behind a small, typed API.

use std::time::Duration;

use tracing::{debug, trace};

use crate::algorithm::Algorithm;
use crate::decision::Decision;
use crate::error::{RateLimitError, Result};
use crate::quota::Quota;
use crate::storage::Storage;

/// A rate limiter bound to one storage key, algorithm, and quota.
///
/// Built fresh per rule evaluation rather than cached, so a dynamic quota
/// (recomputed per request) is always honored.
pub struct Limiter<'a, A, S> {
    key: String,
    quota: Quota,
    algorithm: &'a A,
    storage: &'a S,
}

impl<'a, A, S> Limiter<'a, A, S>
where
    A: Algorithm,
    S: Storage,
{
    /// Create a new limiter for `key` under `quota`.
    pub fn new(key: impl Into<String>, quota: Quota, algorithm: &'a A, storage: &'a S) -> Self {
        Self {
            key: key.into(),
            quota,
            algorithm,
            storage,
        }
    }

    /// Non-consuming check: would the next request be allowed?
    pub async fn allow(&self) -> Result<bool> {
        let decision = self.algorithm.check(self.storage, &self.key, &self.quota).await?;
        trace!(key = %self.key, algorithm = self.algorithm.name(), allowed = decision.is_allowed(), "rate_limit.checked");
        Ok(decision.is_allowed())
    }

    /// Check and consume quota; returns `Err(RateLimitError::Throttled)` when
    /// denied.
    pub async fn throttle(&self) -> Result<Decision> {
        let decision = self
            .algorithm
            .check_and_record(self.storage, &self.key, &self.quota)
            .await?;

        trace!(key = %self.key, algorithm = self.algorithm.name(), allowed = decision.is_allowed(), "rate_limit.checked");

        if decision.is_allowed() {
            debug!(key = %self.key, algorithm = self.algorithm.name(), "rate_limit.allowed");
            Ok(decision)
        } else {
            let retry_after = decision.info().retry_after.unwrap_or(Duration::ZERO);
            debug!(key = %self.key, algorithm = self.algorithm.name(), ?retry_after, "rate_limit.throttled");
            Err(RateLimitError::Throttled {
                limiter_key: self.key.clone(),
                retry_after,
            })
        }
    }

    /// Check or check-and-record depending on `record`, without converting a
    /// denial into `Err` — used by rules that need the raw `Decision` (e.g.
    /// `Track`, which records but never blocks).
    pub async fn decision(&self, record: bool) -> Result<Decision> {
        let decision = if record {
            self.algorithm
                .check_and_record(self.storage, &self.key, &self.quota)
                .await?
        } else {
            self.algorithm.check(self.storage, &self.key, &self.quota).await?
        };
        trace!(key = %self.key, algorithm = self.algorithm.name(), allowed = decision.is_allowed(), "rate_limit.checked");
        Ok(decision)
    }

    /// Requests remaining in the current window, from a non-consuming peek.
    ///
    /// For GCRA this is the burst-slot count, not a literal request tally;
    /// callers must not treat it as an exact count.
    pub async fn remaining(&self) -> Result<u64> {
        let decision = self.algorithm.check(self.storage, &self.key, &self.quota).await?;
        Ok(decision.info().remaining)
    }

    /// How long until the next request would be allowed, if currently denied.
    pub async fn retry_after(&self) -> Result<Option<Duration>> {
        let decision = self.algorithm.check(self.storage, &self.key, &self.quota).await?;
        Ok(decision.info().retry_after)
    }

    /// Clear this limiter's state.
    pub async fn reset(&self) -> Result<()> {
        self.algorithm.reset(self.storage, &self.key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::FixedWindow;
    use crate::storage::MemoryStorage;

    #[tokio::test]
    async fn test_limiter_throttle_denies_after_limit() {
        let storage = MemoryStorage::new();
        let algorithm = FixedWindow::new();
        let quota = Quota::per_minute(1);
        let limiter = Limiter::new("throttle:users:42", quota, &algorithm, &storage);

        assert!(limiter.throttle().await.is_ok());
        let err = limiter.throttle().await.unwrap_err();
        assert!(matches!(err, RateLimitError::Throttled { .. }));
    }

    #[tokio::test]
    async fn test_limiter_allow_does_not_consume() {
        let storage = MemoryStorage::new();
        let algorithm = FixedWindow::new();
        let quota = Quota::per_minute(3);
        let limiter = Limiter::new("throttle:users:7", quota, &algorithm, &storage);

        assert!(limiter.allow().await.unwrap());
        assert!(limiter.allow().await.unwrap());
        assert_eq!(limiter.remaining().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_limiter_reset() {
        let storage = MemoryStorage::new();
        let algorithm = FixedWindow::new();
        let quota = Quota::per_minute(1);
        let limiter = Limiter::new("throttle:users:9", quota, &algorithm, &storage);

        limiter.throttle().await.unwrap();
        assert!(limiter.throttle().await.is_err());

        limiter.reset().await.unwrap();
        assert!(limiter.throttle().await.is_ok());
    }
}
