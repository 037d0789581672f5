//! # Circuit Breaker
//!
//! Three-state guard around one unreliable remote operation.
//!
//! ```text
//! Closed ──(failure_threshold consecutive transport failures)──▶ Open
//! Open ──(recovery_timeout elapsed, next caller)──▶ HalfOpen (that caller is the trial)
//! HalfOpen ──(trial succeeds)──▶ Closed
//! HalfOpen ──(trial fails)──▶ Open (timer restarts)
//! ```
//!
//! Every instance owns its own state behind a single mutex; nothing is
//! shared between breakers. Only outcomes whose error reports
//! [`FailureKind::trips_breaker`] count toward the threshold. Admission and
//! outcome recording are both short critical sections; the lock is never
//! held across the guarded call.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use quanta::{Clock, Instant};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::BreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Classifies an error for breaker accounting.
pub trait FailureKind {
    /// `true` for transport/availability failures (timeout, connection
    /// error, 5xx). Application-level rejections return `false`.
    fn trips_breaker(&self) -> bool;
}

/// Fast-fail returned without invoking the guarded operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("circuit breaker '{breaker}' is open")]
pub struct CircuitOpen {
    pub breaker: &'static str,
}

#[derive(Debug, Error)]
pub enum BreakerError<E> {
    #[error(transparent)]
    Open(#[from] CircuitOpen),
    #[error("{0}")]
    Inner(E),
}

/// Point-in-time view of a breaker, taken under its lock.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerSnapshot {
    pub name: &'static str,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    /// Time since the most recent counted failure.
    pub since_last_failure: Option<Duration>,
    pub trial_in_flight: bool,
    pub times_opened: u64,
    pub times_half_opened: u64,
    pub times_closed: u64,
    pub rejected_calls: u64,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    last_failure_at: Option<Instant>,
    trial_in_flight: bool,
    times_opened: u64,
    times_half_opened: u64,
    times_closed: u64,
    rejected_calls: u64,
}

pub struct CircuitBreaker {
    name: &'static str,
    config: BreakerConfig,
    clock: Clock,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(name: &'static str, config: BreakerConfig) -> Self {
        Self::with_clock(name, config, Clock::new())
    }

    /// Builds a breaker reading time from `clock` (use `Clock::mock()` in tests).
    pub fn with_clock(name: &'static str, config: BreakerConfig, clock: Clock) -> Self {
        Self {
            name,
            config: BreakerConfig {
                failure_threshold: config.failure_threshold.max(1),
                ..config
            },
            clock,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                last_failure_at: None,
                trial_in_flight: false,
                times_opened: 0,
                times_half_opened: 0,
                times_closed: 0,
                rejected_calls: 0,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn config(&self) -> BreakerConfig {
        self.config
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Stored state. An Open breaker whose timeout has elapsed still reports
    /// Open until the next caller is admitted as the trial.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let now = self.clock.now();
        let inner = self.lock();
        BreakerSnapshot {
            name: self.name,
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            failure_threshold: self.config.failure_threshold,
            recovery_timeout: self.config.recovery_timeout,
            since_last_failure: inner
                .last_failure_at
                .map(|t| now.saturating_duration_since(t)),
            trial_in_flight: inner.trial_in_flight,
            times_opened: inner.times_opened,
            times_half_opened: inner.times_half_opened,
            times_closed: inner.times_closed,
            rejected_calls: inner.rejected_calls,
        }
    }

    /// Admission check. On success the caller must report the outcome via
    /// the returned [`Permit`]; dropping it unresolved counts as a failure.
    pub fn try_acquire(&self) -> Result<Permit<'_>, CircuitOpen> {
        let now = self.clock.now();
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(Permit::new(self, false)),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| now.saturating_duration_since(t))
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.config.recovery_timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    inner.times_half_opened += 1;
                    info!(breaker = self.name, "circuit half-open, admitting trial call");
                    Ok(Permit::new(self, true))
                } else {
                    inner.rejected_calls += 1;
                    Err(CircuitOpen { breaker: self.name })
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    inner.rejected_calls += 1;
                    Err(CircuitOpen { breaker: self.name })
                } else {
                    inner.trial_in_flight = true;
                    Ok(Permit::new(self, true))
                }
            }
        }
    }

    /// Run `op` under the breaker.
    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: FailureKind,
    {
        let permit = self.try_acquire()?;
        let result = op().await;
        match &result {
            Ok(_) => permit.success(),
            Err(e) if e.trips_breaker() => permit.failure(),
            Err(_) => permit.neutral(),
        }
        result.map_err(BreakerError::Inner)
    }

    /// Force the breaker back to Closed.
    pub fn reset(&self) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            inner.times_closed += 1;
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    fn close(&self, inner: &mut Inner) {
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
        inner.times_closed += 1;
        info!(breaker = self.name, "circuit closed");
    }

    fn open(&self, inner: &mut Inner, now: Instant) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(now);
        inner.trial_in_flight = false;
        inner.times_opened += 1;
        warn!(
            breaker = self.name,
            failures = inner.consecutive_failures,
            recovery_s = self.config.recovery_timeout.as_secs_f64(),
            "circuit opened"
        );
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.lock();
        if trial {
            self.close(&mut inner);
        } else if inner.state == CircuitState::Closed {
            inner.consecutive_failures = 0;
        }
    }

    fn on_failure(&self, trial: bool) {
        let now = self.clock.now();
        let mut inner = self.lock();
        inner.last_failure_at = Some(now);
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        if trial {
            self.open(&mut inner, now);
        } else if inner.state == CircuitState::Closed
            && inner.consecutive_failures >= self.config.failure_threshold
        {
            self.open(&mut inner, now);
        }
    }

    fn on_neutral(&self, trial: bool) {
        if trial {
            let mut inner = self.lock();
            self.close(&mut inner);
        }
    }
}

/// Admission ticket for one guarded call.
#[must_use = "an unresolved permit counts as a failure when dropped"]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    resolved: bool,
}

impl<'a> Permit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            resolved: false,
        }
    }

    /// Whether this permit is the single HalfOpen trial.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.resolved = true;
        self.breaker.on_success(self.trial);
    }

    /// A transport/availability failure.
    pub fn failure(mut self) {
        self.resolved = true;
        self.breaker.on_failure(self.trial);
    }

    /// The remote answered but the result was unusable; not a breaker failure.
    pub fn neutral(mut self) {
        self.resolved = true;
        self.breaker.on_neutral(self.trial);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.resolved {
            self.breaker.on_failure(self.trial);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    enum TestError {
        Transport,
        Malformed,
    }

    impl FailureKind for TestError {
        fn trips_breaker(&self) -> bool {
            matches!(self, TestError::Transport)
        }
    }

    fn breaker(threshold: u32, recovery: Duration) -> (CircuitBreaker, std::sync::Arc<quanta::Mock>) {
        let (clock, mock) = Clock::mock();
        let cfg = BreakerConfig {
            failure_threshold: threshold,
            recovery_timeout: recovery,
        };
        (CircuitBreaker::with_clock("test", cfg, clock), mock)
    }

    #[tokio::test]
    async fn opens_after_threshold_and_fails_fast() {
        for n in 1..=6u32 {
            let (cb, _mock) = breaker(n, Duration::from_secs(30));
            for _ in 0..n {
                let r: Result<(), _> = cb.call(|| async { Err(TestError::Transport) }).await;
                assert!(matches!(r, Err(BreakerError::Inner(TestError::Transport))));
            }
            assert_eq!(cb.state(), CircuitState::Open);

            let mut invoked = false;
            let r: Result<(), BreakerError<TestError>> = cb
                .call(|| {
                    invoked = true;
                    async { Ok(()) }
                })
                .await;
            assert!(matches!(r, Err(BreakerError::Open(CircuitOpen { breaker: "test" }))));
            assert!(!invoked, "operation must not run while open");
        }
    }

    #[tokio::test]
    async fn success_resets_consecutive_counter() {
        let (cb, _mock) = breaker(3, Duration::from_secs(30));
        for _ in 0..2 {
            let _: Result<(), _> = cb.call(|| async { Err(TestError::Transport) }).await;
        }
        assert_eq!(cb.snapshot().consecutive_failures, 2);
        let _: Result<(), BreakerError<TestError>> = cb.call(|| async { Ok(()) }).await;
        assert_eq!(cb.snapshot().consecutive_failures, 0);
        for _ in 0..2 {
            let _: Result<(), _> = cb.call(|| async { Err(TestError::Transport) }).await;
        }
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn application_errors_do_not_count() {
        let (cb, _mock) = breaker(2, Duration::from_secs(30));
        for _ in 0..5 {
            let r: Result<(), _> = cb.call(|| async { Err(TestError::Malformed) }).await;
            assert!(matches!(r, Err(BreakerError::Inner(TestError::Malformed))));
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().consecutive_failures, 0);
    }

    #[test]
    fn half_open_admits_exactly_one_trial() {
        let (cb, mock) = breaker(1, Duration::from_secs(30));
        cb.try_acquire().unwrap().failure();
        assert_eq!(cb.state(), CircuitState::Open);

        mock.increment(Duration::from_secs(29));
        assert!(cb.try_acquire().is_err());

        mock.increment(Duration::from_secs(1));
        let trial = cb.try_acquire().unwrap();
        assert!(trial.is_trial());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        // A concurrent caller during the trial is rejected.
        assert_eq!(cb.try_acquire().err(), Some(CircuitOpen { breaker: "test" }));

        trial.success();
        assert_eq!(cb.state(), CircuitState::Closed);
        let next = cb.try_acquire().unwrap();
        assert!(!next.is_trial());
        next.success();
    }

    #[test]
    fn failed_trial_reopens_and_restarts_timer() {
        let (cb, mock) = breaker(2, Duration::from_secs(60));
        cb.try_acquire().unwrap().failure();
        cb.try_acquire().unwrap().failure();
        mock.increment(Duration::from_secs(60));

        cb.try_acquire().unwrap().failure();
        assert_eq!(cb.state(), CircuitState::Open);

        mock.increment(Duration::from_secs(59));
        assert!(cb.try_acquire().is_err());
        mock.increment(Duration::from_secs(1));
        let trial = cb.try_acquire().unwrap();
        assert!(trial.is_trial());
        trial.success();

        let snap = cb.snapshot();
        assert_eq!(snap.state, CircuitState::Closed);
        assert_eq!(snap.times_opened, 2);
        assert_eq!(snap.times_half_opened, 2);
        assert_eq!(snap.times_closed, 1);
        assert_eq!(snap.rejected_calls, 1);
    }

    #[test]
    fn dropped_permit_counts_as_failure() {
        let (cb, _mock) = breaker(2, Duration::from_secs(30));
        drop(cb.try_acquire().unwrap());
        assert_eq!(cb.snapshot().consecutive_failures, 1);
        drop(cb.try_acquire().unwrap());
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn neutral_trial_closes_circuit() {
        let (cb, mock) = breaker(1, Duration::from_secs(5));
        cb.try_acquire().unwrap().failure();
        mock.increment(Duration::from_secs(5));
        cb.try_acquire().unwrap().neutral();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().consecutive_failures, 0);
    }

    #[test]
    fn stale_success_does_not_close_open_circuit() {
        let (cb, _mock) = breaker(1, Duration::from_secs(30));
        let slow = cb.try_acquire().unwrap();
        cb.try_acquire().unwrap().failure();
        assert_eq!(cb.state(), CircuitState::Open);
        slow.success();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn breakers_are_independent() {
        let (clock, _mock) = Clock::mock();
        let login = CircuitBreaker::with_clock("login", BreakerConfig::login(), clock.clone());
        let api = CircuitBreaker::with_clock("api", BreakerConfig::api(), clock);
        for _ in 0..3 {
            login.try_acquire().unwrap().failure();
        }
        assert_eq!(login.state(), CircuitState::Open);
        assert_eq!(api.state(), CircuitState::Closed);
        assert_eq!(api.snapshot().failure_threshold, 5);
        assert_eq!(login.snapshot().recovery_timeout, Duration::from_secs(30));
    }

    #[test]
    fn snapshot_tracks_last_failure_age() {
        let (cb, mock) = breaker(5, Duration::from_secs(30));
        assert!(cb.snapshot().since_last_failure.is_none());
        cb.try_acquire().unwrap().failure();
        mock.increment(Duration::from_millis(250));
        assert_eq!(cb.snapshot().since_last_failure, Some(Duration::from_millis(250)));
    }
}
