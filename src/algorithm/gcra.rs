//! GCRA (Generic Cell Rate Algorithm) implementation.
//!
//! GCRA is an efficient rate limiting algorithm that tracks a Theoretical Arrival Time (TAT)
//! instead of counters. It's known for:
//! - Low memory usage (only one timestamp per key)
//! - Precise control over request spacing
//!
//! # How It Works
//!
//! Instead of counting requests in a window, GCRA tracks when the next request
//! is theoretically allowed (TAT - Theoretical Arrival Time). This implementation
//! fixes delay tolerance at zero: a request is admitted only once the previous
//! reservation has fully elapsed, so requests are spaced evenly at
//! `emission_interval = period / limit` with no burst allowance.
//!
//! ```text
//! Period: 100ms between requests (10/sec), delay tolerance = 0
//!
//! Time 0ms:   Request arrives, TAT(stored) = none -> effective TAT = 0ms <= 0ms. ALLOWED, TAT = 100ms
//! Time 10ms:  Request arrives, effective TAT = 100ms > 10ms. DENIED, retry_after = 90ms
//! Time 100ms: Request arrives, effective TAT = 100ms <= 100ms. ALLOWED, TAT = 200ms
//! ```

use std::time::Duration;

use crate::algorithm::{current_timestamp_ms, timestamp_to_instant, Algorithm};
use crate::decision::{Decision, DecisionMetadata, RateLimitInfo};
use crate::error::Result;
use crate::quota::Quota;
use crate::storage::{Storage, StorageEntry};

/// GCRA (Generic Cell Rate Algorithm) rate limiter.
///
/// Delay tolerance is fixed at zero: there is no burst allowance, only even
/// spacing of one request per `period / limit`. `remaining` is therefore not
/// a magnitude but a boolean-as-int (`1` if the next request would be
/// admitted right now, `0` otherwise) — callers should not treat it as a
/// real count.
///
/// # Example
///
/// ```ignore
/// use throttle_gate::{GCRA, Quota, MemoryStorage};
///
/// let algorithm = GCRA::new();
/// let storage = MemoryStorage::new();
/// let quota = Quota::per_second(10);
///
/// let decision = algorithm.check_and_record(&storage, "user:123", &quota).await?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct GCRA;

impl GCRA {
    /// Create a new GCRA algorithm instance.
    pub fn new() -> Self {
        Self
    }

    /// Calculate the decision based on current TAT and quota.
    ///
    /// Returns `(allowed, stored_tat, retry_after_ms)`. Delay tolerance is
    /// zero: a request is admitted only if the existing reservation has
    /// already elapsed (`tat <= now`); a denial leaves the stored TAT
    /// untouched.
    fn calculate_decision(&self, current_tat: Option<u64>, now: u64, quota: &Quota) -> (bool, u64, u64) {
        let emission_interval_ms = quota.period().as_millis() as u64;

        let tat = current_tat.unwrap_or(0).max(now);
        let allowed = tat <= now;

        if allowed {
            let new_tat = tat + emission_interval_ms;
            (true, new_tat, 0)
        } else {
            let retry_after_ms = tat - now;
            (false, tat, retry_after_ms)
        }
    }

    /// Build rate limit info from a decision.
    fn build_info(&self, tat: u64, now: u64, quota: &Quota, allowed: bool, retry_after_ms: u64) -> RateLimitInfo {
        let limit = quota.max_requests();
        let remaining = if allowed { 1 } else { 0 };

        let reset_at = if tat > now {
            timestamp_to_instant(tat)
        } else {
            timestamp_to_instant(now)
        };

        let mut info = RateLimitInfo::new(limit, remaining, reset_at, timestamp_to_instant(now))
            .with_algorithm("gcra")
            .with_metadata(DecisionMetadata::new().with_tat(tat));

        if !allowed && retry_after_ms > 0 {
            info = info.with_retry_after(Duration::from_millis(retry_after_ms));
        }

        info
    }
}

impl Algorithm for GCRA {
    fn name(&self) -> &'static str {
        "gcra"
    }

    async fn check_and_record<S: Storage>(
        &self,
        storage: &S,
        key: &str,
        quota: &Quota,
    ) -> Result<Decision> {
        let now = current_timestamp_ms();
        let period_ms = quota.period().as_millis() as u64;

        // The stored TAT can sit at most one emission interval ahead of now.
        let ttl = Duration::from_millis((period_ms * 2).max(1000));

        let decision = storage
            .execute_atomic(key, ttl, |entry| {
                let current_tat = entry.and_then(|e| e.tat);
                let (allowed, new_tat, retry_after_ms) = self.calculate_decision(current_tat, now, quota);

                let new_entry = StorageEntry::with_tat(new_tat);
                let info = self.build_info(new_tat, now, quota, allowed, retry_after_ms);

                let decision = if allowed {
                    Decision::allowed(info)
                } else {
                    Decision::denied(info)
                };

                (new_entry, decision)
            })
            .await?;

        Ok(decision)
    }

    async fn check<S: Storage>(
        &self,
        storage: &S,
        key: &str,
        quota: &Quota,
    ) -> Result<Decision> {
        let now = current_timestamp_ms();

        let entry = storage.get(key).await?;
        let current_tat = entry.and_then(|e| e.tat);

        let (allowed, tat, retry_after_ms) = self.calculate_decision(current_tat, now, quota);
        let info = self.build_info(tat, now, quota, allowed, retry_after_ms);

        Ok(if allowed {
            Decision::allowed(info)
        } else {
            Decision::denied(info)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[tokio::test]
    async fn test_gcra_basic() {
        let algorithm = GCRA::new();
        let storage = MemoryStorage::new();
        let quota = Quota::per_second(10); // 100ms between requests

        // First request should be allowed
        let decision = algorithm
            .check_and_record(&storage, "user:1", &quota)
            .await
            .unwrap();
        assert!(decision.is_allowed());
    }

    #[tokio::test]
    async fn test_gcra_no_burst_allowance() {
        let algorithm = GCRA::new();
        let storage = MemoryStorage::new();
        // Even with a burst configured, GCRA's delay tolerance is fixed at
        // zero: only one admission per emission interval, ever.
        let quota = Quota::per_second(1).with_burst(5);

        let decision = algorithm
            .check_and_record(&storage, "user:1", &quota)
            .await
            .unwrap();
        assert!(decision.is_allowed());

        let decision = algorithm
            .check_and_record(&storage, "user:1", &quota)
            .await
            .unwrap();
        assert!(decision.is_denied(), "second immediate request should be denied");
        assert!(decision.info().retry_after.is_some());
    }

    #[tokio::test]
    async fn test_gcra_recovery() {
        let algorithm = GCRA::new();
        let storage = MemoryStorage::new();
        let quota = Quota::new(1, Duration::from_millis(200));

        algorithm.check_and_record(&storage, "user:1", &quota).await.unwrap();

        // Immediately after, denied.
        let decision = algorithm
            .check_and_record(&storage, "user:1", &quota)
            .await
            .unwrap();
        assert!(decision.is_denied());

        // Wait for the emission interval to elapse.
        tokio::time::sleep(Duration::from_millis(250)).await;

        let decision = algorithm
            .check_and_record(&storage, "user:1", &quota)
            .await
            .unwrap();
        assert!(decision.is_allowed());
    }

    #[tokio::test]
    async fn test_gcra_check_without_record() {
        let algorithm = GCRA::new();
        let storage = MemoryStorage::new();
        let quota = Quota::new(5, Duration::from_millis(500));

        // Check without recording
        let decision = algorithm.check(&storage, "user:1", &quota).await.unwrap();
        assert!(decision.is_allowed());
        assert_eq!(decision.info().remaining, 1);

        // Check again - should still be allowed (no consumption)
        let decision = algorithm.check(&storage, "user:1", &quota).await.unwrap();
        assert!(decision.is_allowed());

        // Now record one
        algorithm.check_and_record(&storage, "user:1", &quota).await.unwrap();

        // Immediately after, a further check reports no remaining admission.
        let decision = algorithm.check(&storage, "user:1", &quota).await.unwrap();
        assert_eq!(decision.info().remaining, 0);
    }

    #[tokio::test]
    async fn test_gcra_separate_keys() {
        let algorithm = GCRA::new();
        let storage = MemoryStorage::new();
        let quota = Quota::per_second(1);

        // User 1 uses their quota
        algorithm.check_and_record(&storage, "user:1", &quota).await.unwrap();
        let decision = algorithm.check_and_record(&storage, "user:1", &quota).await.unwrap();
        assert!(decision.is_denied());

        // User 2 should still have quota
        let decision = algorithm.check_and_record(&storage, "user:2", &quota).await.unwrap();
        assert!(decision.is_allowed());
    }

    #[tokio::test]
    async fn test_gcra_reset() {
        let algorithm = GCRA::new();
        let storage = MemoryStorage::new();
        let quota = Quota::per_second(1);

        // Use quota
        algorithm.check_and_record(&storage, "user:1", &quota).await.unwrap();
        let decision = algorithm.check_and_record(&storage, "user:1", &quota).await.unwrap();
        assert!(decision.is_denied());

        // Reset
        algorithm.reset(&storage, "user:1").await.unwrap();

        // Should be allowed again
        let decision = algorithm.check_and_record(&storage, "user:1", &quota).await.unwrap();
        assert!(decision.is_allowed());
    }

    #[test]
    fn test_algorithm_name() {
        let algorithm = GCRA::new();
        assert_eq!(algorithm.name(), "gcra");
    }
}
