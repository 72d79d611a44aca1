//! Fixed Window rate limiting algorithm.

use std::time::Duration;

use crate::algorithm::{current_timestamp_ms, timestamp_to_instant, Algorithm};
use crate::decision::{Decision, RateLimitInfo};
use crate::error::Result;
use crate::quota::Quota;
use crate::storage::{Storage, StorageEntry};

/// Fixed Window rate limiting algorithm.
///
/// Counts requests in discrete, non-overlapping windows anchored to the
/// first request seen in each window. Cheapest algorithm to evaluate but
/// allows up to `2x` the configured limit across a window boundary.
#[derive(Debug, Clone, Default)]
pub struct FixedWindow;

impl FixedWindow {
    /// Create a new Fixed Window algorithm instance.
    pub fn new() -> Self {
        Self
    }

    /// Calculate the current window start, anchored to the stored entry
    /// if the previous window is still live, else to `now`.
    fn window_start(&self, now: u64, window_ms: u64, entry: &Option<StorageEntry>) -> u64 {
        match entry {
            Some(e) if now < e.window_start + window_ms => e.window_start,
            _ => now,
        }
    }
}

impl Algorithm for FixedWindow {
    fn name(&self) -> &'static str {
        "fixed_window"
    }

    async fn check_and_record<S: Storage>(
        &self,
        storage: &S,
        key: &str,
        quota: &Quota,
    ) -> Result<Decision> {
        let now = current_timestamp_ms();
        let window_ms = quota.window().as_millis() as u64;
        let ttl = Duration::from_millis(window_ms);
        let limit = quota.max_requests();

        let decision = storage
            .execute_atomic(key, ttl, |entry| {
                let window_start = self.window_start(now, window_ms, &entry);
                let count = match &entry {
                    Some(e) if e.window_start == window_start => e.count,
                    _ => 0,
                };

                let reset_at = timestamp_to_instant(window_start + window_ms);
                let window_start_instant = timestamp_to_instant(window_start);

                if count < limit {
                    let new_entry = StorageEntry::new(count + 1, window_start).set_last_update(now);
                    let remaining = limit - count - 1;
                    let info = RateLimitInfo::new(limit, remaining, reset_at, window_start_instant)
                        .with_algorithm("fixed_window");
                    (new_entry, Decision::allowed(info))
                } else {
                    let new_entry = entry.unwrap_or_else(|| StorageEntry::new(count, window_start));
                    let retry_after = Duration::from_millis(window_start + window_ms - now);
                    let info = RateLimitInfo::new(limit, 0, reset_at, window_start_instant)
                        .with_algorithm("fixed_window")
                        .with_retry_after(retry_after);
                    (new_entry, Decision::denied(info))
                }
            })
            .await?;

        Ok(decision)
    }

    async fn check<S: Storage>(&self, storage: &S, key: &str, quota: &Quota) -> Result<Decision> {
        let now = current_timestamp_ms();
        let window_ms = quota.window().as_millis() as u64;
        let limit = quota.max_requests();

        let entry = storage.get(key).await?;
        let window_start = self.window_start(now, window_ms, &entry);
        let count = match &entry {
            Some(e) if e.window_start == window_start => e.count,
            _ => 0,
        };

        let reset_at = timestamp_to_instant(window_start + window_ms);
        let window_start_instant = timestamp_to_instant(window_start);
        let remaining = limit.saturating_sub(count);
        let info = RateLimitInfo::new(limit, remaining, reset_at, window_start_instant)
            .with_algorithm("fixed_window");

        Ok(if count < limit {
            Decision::allowed(info)
        } else {
            let retry_after = Duration::from_millis(window_start + window_ms - now);
            Decision::denied(info.with_retry_after(retry_after))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[tokio::test]
    async fn test_fixed_window_basic() {
        let algorithm = FixedWindow::new();
        let storage = MemoryStorage::new();
        let quota = Quota::per_minute(5);

        for i in 1..=5 {
            let decision = algorithm
                .check_and_record(&storage, "user:1", &quota)
                .await
                .unwrap();
            assert!(decision.is_allowed(), "request {i} should be allowed");
        }

        let decision = algorithm
            .check_and_record(&storage, "user:1", &quota)
            .await
            .unwrap();
        assert!(decision.is_denied());
    }

    #[tokio::test]
    async fn test_fixed_window_check_without_record() {
        let algorithm = FixedWindow::new();
        let storage = MemoryStorage::new();
        let quota = Quota::per_minute(3);

        algorithm
            .check_and_record(&storage, "user:2", &quota)
            .await
            .unwrap();

        let decision = algorithm.check(&storage, "user:2", &quota).await.unwrap();
        assert!(decision.is_allowed());
        assert_eq!(decision.info().remaining, 2);

        // check() must not have consumed anything
        let decision2 = algorithm.check(&storage, "user:2", &quota).await.unwrap();
        assert_eq!(decision2.info().remaining, 2);
    }

    #[tokio::test]
    async fn test_fixed_window_separate_keys() {
        let algorithm = FixedWindow::new();
        let storage = MemoryStorage::new();
        let quota = Quota::per_minute(1);

        let a = algorithm
            .check_and_record(&storage, "a", &quota)
            .await
            .unwrap();
        let b = algorithm
            .check_and_record(&storage, "b", &quota)
            .await
            .unwrap();
        assert!(a.is_allowed());
        assert!(b.is_allowed());
    }

    #[tokio::test]
    async fn test_fixed_window_reset() {
        let algorithm = FixedWindow::new();
        let storage = MemoryStorage::new();
        let quota = Quota::per_minute(1);

        algorithm
            .check_and_record(&storage, "user:3", &quota)
            .await
            .unwrap();
        let denied = algorithm
            .check_and_record(&storage, "user:3", &quota)
            .await
            .unwrap();
        assert!(denied.is_denied());

        algorithm.reset(&storage, "user:3").await.unwrap();

        let allowed = algorithm
            .check_and_record(&storage, "user:3", &quota)
            .await
            .unwrap();
        assert!(allowed.is_allowed());
    }

    #[test]
    fn test_algorithm_name() {
        assert_eq!(FixedWindow::new().name(), "fixed_window");
    }
}
