//! Circuit breaker guarding an upstream dependency (one per carrier).
//!
//! # State Machine
//!
//! ```text
//! Closed   --[failure_count >= failure_threshold]--> Open
//! Open     --[reset_timeout elapsed, can_attempt()]--> HalfOpen
//! HalfOpen --[one trial call in flight]--> further can_attempt() rejected
//! HalfOpen --[record_success()]--> Closed (counters reset)
//! HalfOpen --[record_failure()]--> Open (open timer restarted)
//! ```
//!
//! Only consecutive failures count toward the threshold: a success in
//! `Closed` resets `failure_count`. The breaker does no I/O; callers invoke
//! `can_attempt` and then exactly one of `record_success` / `record_failure`
//! per attempt.
//!
//! # Thread Safety
//!
//! State lives behind a `Mutex`, so concurrent fan-out (`send_many`) updates
//! counters atomically. Breaker state is process-local.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::sync::lock;

/// Breaker thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the circuit (default: 5).
    pub failure_threshold: u32,
    /// Cooldown before a trial call is allowed through (default: 60s).
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation; calls flow through.
    Closed,
    /// Upstream considered unhealthy; calls are rejected without I/O.
    Open,
    /// Cooldown elapsed; a single trial call is let through.
    HalfOpen,
}

/// Point-in-time view of a breaker, for health endpoints and logs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u64,
    pub total_attempts: u64,
    /// `success_count / total_attempts`, or 1.0 before any attempt.
    pub success_ratio: f64,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_opened_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u64,
    total_attempts: u64,
    last_failure_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
    last_opened_at: Option<DateTime<Utc>>,
    /// Monotonic twin of `last_opened_at`, drives the cooldown.
    opened_instant: Option<Instant>,
    /// When the HalfOpen trial call was admitted; cleared when it reports.
    trial_started: Option<Instant>,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            total_attempts: 0,
            last_failure_at: None,
            last_success_at: None,
            last_opened_at: None,
            opened_instant: None,
            trial_started: None,
        }
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.last_opened_at = Some(Utc::now());
        self.opened_instant = Some(Instant::now());
        self.trial_started = None;
    }
}

/// Per-dependency health gate.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Whether a call may be attempted now.
    ///
    /// In `Open`, returns true only once the cooldown has elapsed, moving the
    /// breaker to `HalfOpen` as part of the same check. `HalfOpen` admits one
    /// trial call until it records an outcome; a trial that never reports
    /// is given up on after another `reset_timeout`.
    pub fn can_attempt(&self) -> bool {
        let mut inner = lock(&self.inner);
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => {
                let free = inner
                    .trial_started
                    .is_none_or(|at| at.elapsed() >= self.config.reset_timeout);
                if free {
                    inner.trial_started = Some(Instant::now());
                }
                free
            }
            CircuitState::Open => {
                let cooled = inner
                    .opened_instant
                    .is_none_or(|at| at.elapsed() >= self.config.reset_timeout);
                if cooled {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_started = Some(Instant::now());
                    info!(breaker = %self.name, "circuit half-open; allowing one trial call");
                }
                cooled
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = lock(&self.inner);
        inner.total_attempts += 1;
        inner.success_count += 1;
        inner.last_success_at = Some(Utc::now());

        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
                inner.opened_instant = None;
                inner.trial_started = None;
                info!(breaker = %self.name, "circuit closed; upstream recovered");
            }
            // A call admitted before the trip finished late; state stays Open.
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = lock(&self.inner);
        inner.total_attempts += 1;
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure_at = Some(Utc::now());

        match inner.state {
            CircuitState::Closed => {
                if inner.failure_count >= self.config.failure_threshold {
                    inner.open();
                    warn!(
                        breaker = %self.name,
                        failures = inner.failure_count,
                        reset_timeout_secs = self.config.reset_timeout.as_secs(),
                        "circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.open();
                warn!(breaker = %self.name, "trial call failed; circuit re-opened");
            }
            CircuitState::Open => {}
        }
    }

    /// Current state without triggering the Open -> HalfOpen transition.
    pub fn state(&self) -> CircuitState {
        lock(&self.inner).state
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = lock(&self.inner);
        let success_ratio = if inner.total_attempts == 0 {
            1.0
        } else {
            inner.success_count as f64 / inner.total_attempts as f64
        };

        CircuitSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            total_attempts: inner.total_attempts,
            success_ratio,
            last_failure_at: inner.last_failure_at,
            last_success_at: inner.last_success_at,
            last_opened_at: inner.last_opened_at,
        }
    }

    /// Force back to `Closed` with zeroed counters (operator action).
    pub fn reset(&self) {
        *lock(&self.inner) = BreakerInner::new();
        info!(breaker = %self.name, "circuit manually reset");
    }
}

/// One breaker per named upstream dependency.
///
/// Constructed at startup and shared; there is no global instance.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// The breaker for `name`, created with the registry config on first use.
    pub fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        lock(&self.breakers)
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.config.clone())))
            .clone()
    }

    /// Snapshots of every registered breaker, sorted by name.
    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let mut out: Vec<_> = lock(&self.breakers)
            .values()
            .map(|b| b.snapshot())
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "carrier",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                reset_timeout: Duration::from_secs(60),
            },
        )
    }

    fn trip(b: &CircuitBreaker) {
        for _ in 0..b.config().failure_threshold {
            assert!(b.can_attempt());
            b.record_failure();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_and_rejects_until_cooldown() {
        let b = breaker(5);
        for _ in 0..4 {
            b.record_failure();
        }
        assert_eq!(b.state(), CircuitState::Closed);

        b.record_failure();
        assert_eq!(b.state(), CircuitState::Open);
        assert!(!b.can_attempt());

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(!b.can_attempt());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(b.can_attempt());
        assert_eq!(b.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn success_in_closed_resets_consecutive_failures() {
        let b = breaker(3);
        b.record_failure();
        b.record_failure();
        b.record_success();
        b.record_failure();
        b.record_failure();

        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.snapshot().failure_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_trial_closes_and_resets_counters() {
        let b = breaker(2);
        trip(&b);
        tokio::time::advance(Duration::from_secs(60)).await;

        assert!(b.can_attempt());
        b.record_success();

        let snap = b.snapshot();
        assert_eq!(snap.state, CircuitState::Closed);
        assert_eq!(snap.failure_count, 0);
        assert!(b.can_attempt());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_trial_reopens_and_restarts_timer() {
        let b = breaker(2);
        trip(&b);
        tokio::time::advance(Duration::from_secs(60)).await;
        let first_open = b.snapshot().last_opened_at;

        assert!(b.can_attempt());
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Open);
        assert!(b.snapshot().last_opened_at >= first_open);

        // The cooldown counts from the failed trial, not the original trip.
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!b.can_attempt());
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(b.can_attempt());
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_one_trial_at_a_time() {
        let b = breaker(2);
        trip(&b);
        tokio::time::advance(Duration::from_secs(60)).await;

        assert!(b.can_attempt());
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert!(!b.can_attempt());
        assert!(!b.can_attempt());

        b.record_success();
        assert_eq!(b.state(), CircuitState::Closed);
        assert!(b.can_attempt());
        assert!(b.can_attempt());
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_trial_frees_up_after_cooldown() {
        let b = breaker(2);
        trip(&b);
        tokio::time::advance(Duration::from_secs(60)).await;

        // Admitted, never reports back.
        assert!(b.can_attempt());
        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(!b.can_attempt());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(b.can_attempt());
        assert_eq!(b.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn snapshot_tracks_ratio_and_timestamps() {
        let b = breaker(10);
        assert_eq!(b.snapshot().success_ratio, 1.0);

        b.record_success();
        b.record_success();
        b.record_success();
        b.record_failure();

        let snap = b.snapshot();
        assert_eq!(snap.total_attempts, 4);
        assert_eq!(snap.success_count, 3);
        assert_eq!(snap.success_ratio, 0.75);
        assert!(snap.last_success_at.is_some());
        assert!(snap.last_failure_at.is_some());
        assert!(snap.last_opened_at.is_none());
    }

    #[test]
    fn reset_returns_to_closed() {
        let b = breaker(1);
        b.record_failure();
        assert!(!b.can_attempt());

        b.reset();
        assert!(b.can_attempt());
        assert_eq!(b.snapshot().total_attempts, 0);
    }

    #[test]
    fn concurrent_failures_are_all_counted() {
        let b = Arc::new(breaker(1_000));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let b = b.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        b.record_failure();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let snap = b.snapshot();
        assert_eq!(snap.total_attempts, 800);
        assert_eq!(snap.failure_count, 800);
        assert_eq!(snap.state, CircuitState::Closed);
    }

    #[test]
    fn registry_hands_out_one_breaker_per_dependency() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::default());
        let a = registry.breaker("twilio");
        let again = registry.breaker("twilio");
        let other = registry.breaker("vonage");

        assert!(Arc::ptr_eq(&a, &again));
        assert!(!Arc::ptr_eq(&a, &other));

        let names: Vec<_> = registry.snapshots().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["twilio", "vonage"]);
    }
}
