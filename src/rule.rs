//! Filter rules: safelist, blocklist, throttle, track, fail2ban, allow2ban.
//!
//! Each rule produces a `RuleOutcome` for a request; the middleware pipeline
//! (`crate::middleware::pipeline`) orders rules by category and short-circuits
//! on the first decisive verdict.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::algorithm::{FixedWindow, TokenBucket};
#[cfg(feature = "gcra")]
use crate::algorithm::GCRA;
use crate::breaker::CircuitBreaker;
use crate::error::Result;
use crate::key::Key;
use crate::limiter::Limiter;
use crate::quota::Quota;
use crate::storage::Storage;

/// Which `Algorithm` a `Throttle`/`Track` rule drives its `Limiter` with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RateAlgorithm {
    #[default]
    FixedWindow,
    TokenBucket,
    #[cfg(feature = "gcra")]
    Gcra,
}

/// A quota that is either fixed or recomputed per request.
///
/// Re-evaluated on every check, never cached across requests, so a
/// request-dependent limit (e.g. a paid tier) always reflects the current
/// request.
#[derive(Clone)]
pub enum QuotaSource<R> {
    Static(Quota),
    Dynamic(Arc<dyn Fn(&R) -> Quota + Send + Sync>),
}

impl<R> QuotaSource<R> {
    fn resolve(&self, request: &R) -> Quota {
        match self {
            Self::Static(quota) => quota.clone(),
            Self::Dynamic(f) => f(request),
        }
    }
}

impl<R> fmt::Debug for QuotaSource<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(q) => f.debug_tuple("Static").field(q).finish(),
            Self::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

impl<R> From<Quota> for QuotaSource<R> {
    fn from(quota: Quota) -> Self {
        Self::Static(quota)
    }
}

/// Match-time data for a `Fail2Ban` ban, carried on `RuleOutcome::Blocklisted`
/// so an instrumentation sink can report which discriminator tripped the
/// breaker and for how long.
#[derive(Debug, Clone, PartialEq)]
pub struct Fail2BanMatch {
    pub discriminator: String,
    pub maxretry: u32,
    pub findtime: Duration,
    pub bantime: Duration,
    pub failures: u64,
    pub time_until_unban: Duration,
}

/// Outcome of evaluating one rule against one request.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleOutcome {
    /// The key extractor returned `None`; the rule does not apply (fail open).
    NoMatch,
    /// Unconditional allow; short-circuits the remaining pipeline.
    Safelisted { rule: String },
    /// Unconditional deny. `fail2ban` is set when the ban came from a
    /// `Fail2Ban` rule rather than a plain predicate-based blocklist.
    Blocklisted {
        rule: String,
        fail2ban: Option<Fail2BanMatch>,
    },
    /// A throttle denied the request.
    Throttled {
        rule: String,
        discriminator: String,
        limit: u64,
        remaining: u64,
        retry_after: Duration,
    },
    /// A tracker recorded the request without denying it.
    Tracked { rule: String, remaining: u64 },
    /// The rule evaluated and did not object.
    Passed { rule: String },
}

impl RuleOutcome {
    /// Whether this outcome should stop further pipeline evaluation.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Safelisted { .. } | Self::Blocklisted { .. } | Self::Throttled { .. }
        )
    }
}

pub(crate) async fn drive_limiter<S: Storage>(
    storage: &S,
    key: &str,
    quota: Quota,
    algorithm: RateAlgorithm,
    record: bool,
) -> Result<crate::decision::Decision> {
    match algorithm {
        RateAlgorithm::FixedWindow => {
            let algo = FixedWindow::new();
            Limiter::new(key, quota, &algo, storage).decision(record).await
        }
        RateAlgorithm::TokenBucket => {
            let algo = TokenBucket::new();
            Limiter::new(key, quota, &algo, storage).decision(record).await
        }
        #[cfg(feature = "gcra")]
        RateAlgorithm::Gcra => {
            let algo = GCRA::new();
            Limiter::new(key, quota, &algo, storage).decision(record).await
        }
    }
}

type Predicate<R> = Arc<dyn Fn(&R) -> bool + Send + Sync>;

/// A filter rule, keyed off an application-supplied `Key<R>` extractor.
pub enum Rule<R> {
    Safelist {
        name: String,
        predicate: Predicate<R>,
    },
    Blocklist {
        name: String,
        predicate: Predicate<R>,
    },
    Throttle {
        name: String,
        key: Arc<dyn Key<R>>,
        quota: QuotaSource<R>,
        algorithm: RateAlgorithm,
    },
    Track {
        name: String,
        key: Arc<dyn Key<R>>,
        quota: QuotaSource<R>,
        algorithm: RateAlgorithm,
    },
    Fail2Ban {
        name: String,
        key: Arc<dyn Key<R>>,
        breaker: Arc<CircuitBreaker>,
    },
    Allow2Ban {
        name: String,
        key: Arc<dyn Key<R>>,
        /// The paired Fail2Ban breaker this rule resets once its own
        /// success counter reaches `max_count`.
        paired_breaker: Arc<CircuitBreaker>,
        max_count: u64,
        find_time: Duration,
    },
}

impl<R: 'static> fmt::Debug for Rule<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule").field("name", &self.name()).finish()
    }
}

impl<R: 'static> Rule<R> {
    pub fn name(&self) -> &str {
        match self {
            Self::Safelist { name, .. }
            | Self::Blocklist { name, .. }
            | Self::Throttle { name, .. }
            | Self::Track { name, .. }
            | Self::Fail2Ban { name, .. }
            | Self::Allow2Ban { name, .. } => name,
        }
    }

    pub fn safelist(name: impl Into<String>, predicate: impl Fn(&R) -> bool + Send + Sync + 'static) -> Self {
        Self::Safelist {
            name: name.into(),
            predicate: Arc::new(predicate),
        }
    }

    pub fn blocklist(name: impl Into<String>, predicate: impl Fn(&R) -> bool + Send + Sync + 'static) -> Self {
        Self::Blocklist {
            name: name.into(),
            predicate: Arc::new(predicate),
        }
    }

    pub fn throttle(
        name: impl Into<String>,
        key: impl Key<R>,
        quota: impl Into<QuotaSource<R>>,
        algorithm: RateAlgorithm,
    ) -> Self {
        Self::Throttle {
            name: name.into(),
            key: Arc::new(key),
            quota: quota.into(),
            algorithm,
        }
    }

    pub fn track(
        name: impl Into<String>,
        key: impl Key<R>,
        quota: impl Into<QuotaSource<R>>,
        algorithm: RateAlgorithm,
    ) -> Self {
        Self::Track {
            name: name.into(),
            key: Arc::new(key),
            quota: quota.into(),
            algorithm,
        }
    }

    pub fn fail2ban(
        name: impl Into<String>,
        key: impl Key<R>,
        max_retry: u32,
        find_time: Duration,
        ban_time: Duration,
    ) -> Self {
        let name = name.into();
        Self::Fail2Ban {
            breaker: Arc::new(CircuitBreaker::new(name.clone(), max_retry, find_time, ban_time)),
            name,
            key: Arc::new(key),
        }
    }

    /// Build an Allow2Ban rule paired with an existing Fail2Ban breaker,
    /// identified by `fail2ban_name`. Resetting happens through that shared
    /// `CircuitBreaker` handle; callers must pass the same `Arc` the
    /// `Fail2Ban` rule holds.
    pub fn allow2ban(
        name: impl Into<String>,
        key: impl Key<R>,
        paired_breaker: Arc<CircuitBreaker>,
        max_count: u64,
        find_time: Duration,
    ) -> Self {
        Self::Allow2Ban {
            name: name.into(),
            key: Arc::new(key),
            paired_breaker,
            max_count,
            find_time,
        }
    }

    /// Evaluate this rule against `request`.
    pub async fn evaluate<S: Storage>(&self, request: &R, storage: &S) -> Result<RuleOutcome> {
        match self {
            Self::Safelist { name, predicate } => Ok(if predicate(request) {
                RuleOutcome::Safelisted { rule: name.clone() }
            } else {
                RuleOutcome::Passed { rule: name.clone() }
            }),

            Self::Blocklist { name, predicate } => Ok(if predicate(request) {
                RuleOutcome::Blocklisted {
                    rule: name.clone(),
                    fail2ban: None,
                }
            } else {
                RuleOutcome::Passed { rule: name.clone() }
            }),

            Self::Throttle {
                name,
                key,
                quota,
                algorithm,
            } => {
                let Some(discriminator) = key.extract(request) else {
                    return Ok(RuleOutcome::NoMatch);
                };
                let quota = quota.resolve(request);
                let storage_key = format!("throttle:{name}:{discriminator}");
                let decision = drive_limiter(storage, &storage_key, quota.clone(), *algorithm, true).await?;

                Ok(if decision.is_allowed() {
                    RuleOutcome::Passed { rule: name.clone() }
                } else {
                    RuleOutcome::Throttled {
                        rule: name.clone(),
                        discriminator,
                        limit: decision.info().limit,
                        remaining: decision.info().remaining,
                        retry_after: decision.info().retry_after.unwrap_or(Duration::ZERO),
                    }
                })
            }

            Self::Track {
                name,
                key,
                quota,
                algorithm,
            } => {
                let Some(discriminator) = key.extract(request) else {
                    return Ok(RuleOutcome::NoMatch);
                };
                let quota = quota.resolve(request);
                let storage_key = format!("track:{name}:{discriminator}");
                let decision = drive_limiter(storage, &storage_key, quota, *algorithm, true).await?;

                Ok(RuleOutcome::Tracked {
                    rule: name.clone(),
                    remaining: decision.info().remaining,
                })
            }

            Self::Fail2Ban { name, key, breaker } => {
                let Some(discriminator) = key.extract(request) else {
                    return Ok(RuleOutcome::NoMatch);
                };

                Ok(if breaker.is_open() {
                    RuleOutcome::Blocklisted {
                        rule: name.clone(),
                        fail2ban: Some(Fail2BanMatch {
                            discriminator,
                            maxretry: breaker.failure_threshold(),
                            findtime: breaker.find_time(),
                            bantime: breaker.ban_time(),
                            failures: breaker.failure_count(),
                            time_until_unban: breaker.time_until_unban().unwrap_or(Duration::ZERO),
                        }),
                    }
                } else {
                    RuleOutcome::Passed { rule: name.clone() }
                })
            }

            Self::Allow2Ban {
                name,
                key,
                paired_breaker,
                max_count,
                find_time,
            } => {
                let Some(discriminator) = key.extract(request) else {
                    return Ok(RuleOutcome::NoMatch);
                };
                let storage_key = format!("allow2ban:{name}:{discriminator}");
                let quota = Quota::new(*max_count, *find_time);
                let algo = FixedWindow::new();
                let decision = Limiter::new(storage_key, quota, &algo, storage)
                    .decision(true)
                    .await?;

                // Reaching the threshold of successful requests heals the
                // paired Fail2Ban breaker; this rule never blocks directly.
                if decision.is_denied() {
                    paired_breaker.reset();
                }
                Ok(RuleOutcome::Passed { rule: name.clone() })
            }
        }
    }

    /// Push a host-observed failure/success into a `Fail2Ban` breaker.
    /// No-op for any other rule variant.
    pub fn record_outcome(&self, did_fail: bool) {
        if let Self::Fail2Ban { breaker, .. } = self {
            if did_fail {
                breaker.record_failure();
            } else {
                breaker.record_success();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::StaticKey;
    use crate::storage::MemoryStorage;

    #[tokio::test]
    async fn test_safelist_matches() {
        let storage = MemoryStorage::new();
        let rule: Rule<u32> = Rule::safelist("internal", |r: &u32| *r == 1);

        let outcome = rule.evaluate(&1u32, &storage).await.unwrap();
        assert_eq!(outcome, RuleOutcome::Safelisted { rule: "internal".into() });

        let outcome = rule.evaluate(&2u32, &storage).await.unwrap();
        assert_eq!(outcome, RuleOutcome::Passed { rule: "internal".into() });
    }

    #[tokio::test]
    async fn test_blocklist_matches() {
        let storage = MemoryStorage::new();
        let rule: Rule<u32> = Rule::blocklist("banned", |r: &u32| *r == 666);

        let outcome = rule.evaluate(&666u32, &storage).await.unwrap();
        assert_eq!(
            outcome,
            RuleOutcome::Blocklisted {
                rule: "banned".into(),
                fail2ban: None,
            }
        );
    }

    #[tokio::test]
    async fn test_throttle_denies_after_limit() {
        let storage = MemoryStorage::new();
        let rule: Rule<u32> = Rule::throttle(
            "login",
            StaticKey::new("user:1"),
            Quota::per_minute(1),
            RateAlgorithm::FixedWindow,
        );

        let first = rule.evaluate(&0u32, &storage).await.unwrap();
        assert_eq!(first, RuleOutcome::Passed { rule: "login".into() });

        let second = rule.evaluate(&0u32, &storage).await.unwrap();
        assert!(matches!(second, RuleOutcome::Throttled { .. }));
    }

    #[tokio::test]
    async fn test_track_never_blocks() {
        let storage = MemoryStorage::new();
        let rule: Rule<u32> = Rule::track(
            "visits",
            StaticKey::new("user:1"),
            Quota::per_minute(1),
            RateAlgorithm::FixedWindow,
        );

        for _ in 0..5 {
            let outcome = rule.evaluate(&0u32, &storage).await.unwrap();
            assert!(matches!(outcome, RuleOutcome::Tracked { .. }));
        }
    }

    #[tokio::test]
    async fn test_fail2ban_blocks_after_threshold() {
        let storage = MemoryStorage::new();
        let rule: Rule<u32> = Rule::fail2ban(
            "abuse",
            StaticKey::new("1.2.3.4"),
            2,
            Duration::from_secs(60),
            Duration::from_secs(300),
        );

        assert_eq!(
            rule.evaluate(&0u32, &storage).await.unwrap(),
            RuleOutcome::Passed { rule: "abuse".into() }
        );

        rule.record_outcome(true);
        rule.record_outcome(true);

        let outcome = rule.evaluate(&0u32, &storage).await.unwrap();
        match outcome {
            RuleOutcome::Blocklisted { rule, fail2ban } => {
                assert_eq!(rule, "abuse");
                let fail2ban = fail2ban.expect("fail2ban match data");
                assert_eq!(fail2ban.discriminator, "1.2.3.4");
                assert_eq!(fail2ban.maxretry, 2);
                assert_eq!(fail2ban.findtime, Duration::from_secs(60));
                assert_eq!(fail2ban.bantime, Duration::from_secs(300));
                assert_eq!(fail2ban.failures, 2);
            }
            other => panic!("expected Blocklisted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_key_no_match_fails_open() {
        let storage = MemoryStorage::new();
        let rule: Rule<Option<u32>> = Rule::throttle(
            "maybe",
            crate::key::FnKey::new("maybe", |r: &Option<u32>| r.map(|v| v.to_string())),
            Quota::per_minute(1),
            RateAlgorithm::FixedWindow,
        );

        let outcome = rule.evaluate(&None, &storage).await.unwrap();
        assert_eq!(outcome, RuleOutcome::NoMatch);
    }
}
