//! Monotonic time sources for guard state machines
//!
//! All window expiry, permit cycles and open-state waits are computed from a
//! monotonic clock anchored at clock creation, never from wall time. Wall
//! clock adjustments (NTP skew, manual changes) must not move a guard's
//! notion of elapsed time.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Abstract monotonic time source.
///
/// Returns nanoseconds elapsed since the clock was created. Guards share one
/// clock instance so that all of their derived timestamps are comparable.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Monotonic nanoseconds since clock creation.
    fn now_nanos(&self) -> u64;
}

/// Production clock backed by [`Instant`].
#[derive(Debug)]
pub struct MonotonicClock {
    start: Instant,
}

impl MonotonicClock {
    /// Create a clock anchored at the current instant.
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_nanos(&self) -> u64 {
        self.start.elapsed().as_nanos() as u64
    }
}

/// Hand-driven clock for tests.
///
/// Time only moves when `advance` (or `set`) is called, which makes window
/// expiry and cycle rollover deterministic without sleeping.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    /// Create a clock at t = 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the clock forward by `nanos`.
    pub fn advance(&self, nanos: u64) {
        self.nanos.fetch_add(nanos, Ordering::SeqCst);
    }

    /// Move the clock forward by `millis` milliseconds.
    pub fn advance_millis(&self, millis: u64) {
        self.advance(millis * 1_000_000);
    }

    /// Set the clock to an absolute value.
    pub fn set(&self, nanos: u64) {
        self.nanos.store(nanos, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_nanos(&self) -> u64 {
        self.nanos.load(Ordering::SeqCst)
    }
}
