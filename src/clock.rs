//! Time source used by the limiter and the client pool.
//!
//! Production code runs on [`SystemClock`], which defers to tokio's timer.
//! Tests substitute a [`ManualClock`] whose time only moves when told to.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

/// A monotonic clock that can also suspend the calling task.
#[async_trait]
pub trait Clock: Send + Sync + fmt::Debug {
    /// The current instant.
    fn now(&self) -> Instant;

    /// Suspend the calling task for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Wall-clock implementation backed by `tokio::time`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// A controllable clock for tests.
///
/// Every call to [`Clock::sleep`] returns immediately and is recorded. When
/// built with [`ManualClock::advancing`], a sleep also moves the clock forward
/// by the requested duration, which models a caller that actually waited.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
    sleeps: Mutex<Vec<Duration>>,
    advance_on_sleep: bool,
}

impl ManualClock {
    /// A clock frozen at its creation instant.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
            sleeps: Mutex::new(Vec::new()),
            advance_on_sleep: false,
        }
    }

    /// A clock that advances by each requested sleep.
    pub fn advancing() -> Self {
        Self {
            advance_on_sleep: true,
            ..Self::new()
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }

    /// Durations passed to `sleep`, in call order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().clone()
    }

    /// Number of times `sleep` was invoked.
    pub fn sleep_count(&self) -> usize {
        self.sleeps.lock().len()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock()
    }

    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().push(duration);
        if self.advance_on_sleep {
            self.advance(duration);
        }
    }
}
