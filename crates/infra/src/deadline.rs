//! Deadline propagation for suspending operations.
//!
//! A [`Deadline`] is an optional absolute instant carried down a call chain.
//! Each sub-operation runs under the earlier of its own timeout and the
//! caller's deadline, so nothing waits forever and an outer budget bounds all
//! nested work.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

/// The bounded operation did not finish in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("deadline exceeded after {0:?}")]
pub struct DeadlineExceeded(pub Duration);

/// Absolute point in time after which work should be abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    /// No overall deadline; only per-operation timeouts apply.
    pub fn none() -> Self {
        Self { at: None }
    }

    pub fn at(instant: Instant) -> Self {
        Self { at: Some(instant) }
    }

    pub fn after(duration: Duration) -> Self {
        Self::at(Instant::now() + duration)
    }

    pub fn instant(&self) -> Option<Instant> {
        self.at
    }

    /// Time left before expiry (`None` when unbounded).
    pub fn remaining(&self) -> Option<Duration> {
        self.at.map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_some_and(|d| d.is_zero())
    }

    /// The earlier of this deadline and `now + timeout`.
    pub fn bound(&self, timeout: Duration) -> Instant {
        let local = Instant::now() + timeout;
        match self.at {
            Some(at) if at < local => at,
            _ => local,
        }
    }

    /// Run `fut` bounded by `timeout` and this deadline, whichever is sooner.
    pub async fn run<F, T>(&self, timeout: Duration, fut: F) -> Result<T, DeadlineExceeded>
    where
        F: Future<Output = T>,
    {
        let started = Instant::now();
        tokio::time::timeout_at(self.bound(timeout), fut)
            .await
            .map_err(|_| DeadlineExceeded(started.elapsed()))
    }
}
