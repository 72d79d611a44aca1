//! Circuit breaker wrapper around the `failsafe` crate.
//!
//! Fail2Ban/Allow2Ban rules (`crate::rule`) and the Composer (`crate::composer`)
//! both key a breaker on an identifier and push failure/success observations
//! into it; the breaker owns no rate-limit state itself (see `DESIGN.md`).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use failsafe::{backoff, failure_policy, Config};

type Policy = failure_policy::ConsecutiveFailures<backoff::Constant>;
type Machine = failsafe::StateMachine<Policy, ()>;

/// A named circuit breaker with a bounded failure-counting window.
///
/// `failsafe::failure_policy::consecutive_failures` counts failures without
/// regard to elapsed time; `find_time` is layered on top here by decaying the
/// streak (an implicit success) once more than `find_time` has passed since
/// the last recorded failure, approximating "N failures within a window".
pub struct CircuitBreaker {
    name: String,
    machine: Machine,
    failure_threshold: u32,
    find_time: Duration,
    ban_time: Duration,
    last_failure: Mutex<Option<Instant>>,
    failures: AtomicU64,
    opened_at: Mutex<Option<Instant>>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("open", &self.is_open())
            .finish()
    }
}

impl CircuitBreaker {
    /// `failure_threshold` consecutive failures within `failure_window` trips
    /// the breaker open for `reset_timeout` before it moves to half-open.
    pub fn new(
        name: impl Into<String>,
        failure_threshold: u32,
        failure_window: Duration,
        reset_timeout: Duration,
    ) -> Self {
        let machine = Config::new()
            .failure_policy(failure_policy::consecutive_failures(
                failure_threshold,
                backoff::constant(reset_timeout),
            ))
            .build();

        Self {
            name: name.into(),
            machine,
            failure_threshold,
            find_time: failure_window,
            ban_time: reset_timeout,
            last_failure: Mutex::new(None),
            failures: AtomicU64::new(0),
            opened_at: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Consecutive failures required before the breaker opens.
    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    /// Window a failure streak is allowed to span before it decays.
    pub fn find_time(&self) -> Duration {
        self.find_time
    }

    /// How long the breaker stays open once tripped.
    pub fn ban_time(&self) -> Duration {
        self.ban_time
    }

    /// Failures recorded in the current streak.
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Remaining time before the breaker would move to half-open, if it is
    /// currently open.
    pub fn time_until_unban(&self) -> Option<Duration> {
        let opened_at = (*self.opened_at.lock().unwrap())?;
        Some(self.ban_time.saturating_sub(opened_at.elapsed()))
    }

    /// Whether the breaker currently rejects calls.
    pub fn is_open(&self) -> bool {
        !self.machine.is_call_permitted()
    }

    /// Record a successful observation, healing the breaker on half-open.
    pub fn record_success(&self) {
        self.machine.on_success();
        *self.last_failure.lock().unwrap() = None;
        self.failures.store(0, Ordering::Relaxed);
        *self.opened_at.lock().unwrap() = None;
    }

    /// Record a failed observation, decaying a stale streak first.
    pub fn record_failure(&self) {
        let mut last = self.last_failure.lock().unwrap();
        if let Some(prev) = *last {
            if prev.elapsed() > self.find_time {
                self.machine.on_success();
                self.failures.store(0, Ordering::Relaxed);
            }
        }
        *last = Some(Instant::now());
        self.failures.fetch_add(1, Ordering::Relaxed);
        self.machine.on_error();
        if self.is_open() {
            self.opened_at.lock().unwrap().get_or_insert(Instant::now());
        }
    }

    /// Force the breaker back to closed, clearing its failure streak.
    pub fn reset(&self) {
        self.machine.reset();
        *self.last_failure.lock().unwrap() = None;
        self.failures.store(0, Ordering::Relaxed);
        *self.opened_at.lock().unwrap() = None;
    }

    /// Run `f` under the breaker: rejected outright if open, otherwise its
    /// outcome is recorded as success/failure.
    pub fn call<F, E, R>(&self, f: F) -> Result<R, failsafe::Error<E>>
    where
        F: FnOnce() -> Result<R, E>,
    {
        use failsafe::CircuitBreaker as _;
        self.machine.call(f)
    }
}
