//! Time, interruption and completion polling.
//!
//! All waiting in a run goes through a [`Clock`] so tests can substitute
//! [`ManualClock`], and every sleep is interruptible through [`Interrupt`] so an
//! operator abort is observed between polls rather than after them.

use crate::error::{AppResult, DaqError};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Shared abort flag with a wakeable sleep.
///
/// Clones share state. Triggering wakes every thread sleeping in
/// [`Interrupt::sleep`].
#[derive(Clone, Default)]
pub struct Interrupt {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Interrupt {
    /// Untriggered interrupt.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag and wake sleepers.
    pub fn trigger(&self) {
        let (flag, cvar) = &*self.inner;
        *flag.lock() = true;
        cvar.notify_all();
    }

    /// Whether `trigger` has been called since the last `reset`.
    pub fn is_triggered(&self) -> bool {
        *self.inner.0.lock()
    }

    /// Clear the flag.
    pub fn reset(&self) {
        *self.inner.0.lock() = false;
    }

    /// Sleep for `duration` unless triggered first. Returns `true` if interrupted.
    pub fn sleep(&self, duration: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let deadline = Instant::now() + duration;
        let mut triggered = flag.lock();
        while !*triggered {
            if cvar.wait_until(&mut triggered, deadline).timed_out() {
                break;
            }
        }
        *triggered
    }
}

impl std::fmt::Debug for Interrupt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interrupt")
            .field("triggered", &self.is_triggered())
            .finish()
    }
}

/// Source of time for a run.
pub trait Clock {
    /// Current instant.
    fn now(&self) -> Instant;

    /// Idle for `duration` or until `interrupt` fires. Returns `true` if interrupted.
    fn sleep(&self, duration: Duration, interrupt: &Interrupt) -> bool;
}

/// Wall clock with real, interruptible sleeps.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration, interrupt: &Interrupt) -> bool {
        interrupt.sleep(duration)
    }
}

/// Fake clock whose sleeps advance time instantly.
///
/// Clones share the same time line.
#[derive(Debug, Clone)]
pub struct ManualClock {
    origin: Instant,
    offset: Arc<Mutex<Duration>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    /// Clock starting at the current instant.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    /// Move time forward.
    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }

    /// Time advanced since creation.
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock()
    }

    fn sleep(&self, duration: Duration, interrupt: &Interrupt) -> bool {
        if interrupt.is_triggered() {
            return true;
        }
        self.advance(duration);
        interrupt.is_triggered()
    }
}

/// Polls a predicate until it holds or a wall-clock bound passes.
pub struct PollingWaiter<'a, C: Clock + ?Sized> {
    clock: &'a C,
    interrupt: &'a Interrupt,
}

impl<'a, C: Clock + ?Sized> PollingWaiter<'a, C> {
    /// Waiter using `clock`, aborting when `interrupt` fires.
    pub fn new(clock: &'a C, interrupt: &'a Interrupt) -> Self {
        Self { clock, interrupt }
    }

    /// Evaluate `predicate` every `poll_interval` until it returns `true`.
    ///
    /// # Errors
    ///
    /// - [`DaqError::TestTimeout`] on the first check at or past `timeout`
    /// - [`DaqError::TestAborted`] if the interrupt fires
    /// - any error from `predicate`, unchanged
    pub fn wait_until<F>(&self, mut predicate: F, poll_interval: Duration, timeout: Duration) -> AppResult<()>
    where
        F: FnMut() -> AppResult<bool>,
    {
        let start = self.clock.now();
        let mut polls: u64 = 0;

        loop {
            if self.interrupt.is_triggered() {
                return Err(DaqError::TestAborted);
            }

            polls += 1;
            if predicate()? {
                debug!(polls, elapsed = ?self.clock.now().duration_since(start), "condition met");
                return Ok(());
            }

            let elapsed = self.clock.now().duration_since(start);
            if elapsed >= timeout {
                return Err(DaqError::TestTimeout(timeout));
            }
            trace!(polls, ?elapsed, "still waiting");

            if self.clock.sleep(poll_interval, self.interrupt) {
                return Err(DaqError::TestAborted);
            }
        }
    }
}
