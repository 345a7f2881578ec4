//! Semaphore-based bulkhead for concurrency limiting
//!
//! A bulkhead caps how many calls may run a protected section at once.
//! Acquisition is a lock-free counter race on the hot path; callers that
//! lose the race may wait on a condvar up to `max_wait_duration`, never
//! longer. Permits are RAII guards, so every exit path (success, error, or
//! panic) releases exactly once.

use crate::errors::{GuardError, GuardResult};
use crate::events::{BusEvent, EventBus};
use crate::registry::NamedGuard;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant, SystemTime};

/// Bulkhead configuration.
#[derive(Debug, Clone, Copy)]
pub struct BulkheadConfig {
    /// Maximum calls allowed inside the protected section at once.
    pub max_concurrent_calls: usize,
    /// How long an acquisition may wait for a permit. Zero means fail
    /// immediately when no permit is free.
    pub max_wait_duration: Duration,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 25,
            max_wait_duration: Duration::ZERO,
        }
    }
}

impl BulkheadConfig {
    /// Set the concurrency limit.
    pub fn with_max_concurrent_calls(mut self, limit: usize) -> Self {
        self.max_concurrent_calls = limit;
        self
    }

    /// Set the maximum acquisition wait.
    pub fn with_max_wait_duration(mut self, wait: Duration) -> Self {
        self.max_wait_duration = wait;
        self
    }
}

/// Kind tag for bulkhead events. Shared with [`crate::pool::ThreadPoolBulkhead`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkheadEventKind {
    /// A call was admitted.
    CallPermitted,
    /// A call was rejected because the bulkhead was saturated.
    CallRejected,
    /// An admitted call finished and returned its capacity.
    CallFinished,
}

/// Event published by a bulkhead.
#[derive(Debug, Clone)]
pub struct BulkheadEvent {
    /// Name of the publishing bulkhead.
    pub bulkhead_name: String,
    /// Wall-clock time the event was created.
    pub created_at: SystemTime,
    /// What happened.
    pub kind: BulkheadEventKind,
}

impl BulkheadEvent {
    pub(crate) fn new(bulkhead_name: &str, kind: BulkheadEventKind) -> Self {
        Self {
            bulkhead_name: bulkhead_name.to_string(),
            created_at: SystemTime::now(),
            kind,
        }
    }
}

impl BusEvent for BulkheadEvent {
    type Kind = BulkheadEventKind;

    fn entity_name(&self) -> &str {
        &self.bulkhead_name
    }

    fn kind(&self) -> BulkheadEventKind {
        self.kind
    }
}

/// Concurrency-limiting admission gate.
#[derive(Debug)]
pub struct Bulkhead {
    name: String,
    config: BulkheadConfig,
    in_flight: AtomicUsize,
    /// Gate serializing waiters only; the acquire fast path never touches it.
    wait_gate: Mutex<()>,
    released: Condvar,
    events: EventBus<BulkheadEvent>,
}

impl Bulkhead {
    /// Create a bulkhead.
    ///
    /// # Panics
    ///
    /// Panics if `max_concurrent_calls` is 0.
    pub fn new(name: impl Into<String>, config: BulkheadConfig) -> Self {
        assert!(
            config.max_concurrent_calls > 0,
            "Bulkhead limit must be greater than 0"
        );
        Self {
            name: name.into(),
            config,
            in_flight: AtomicUsize::new(0),
            wait_gate: Mutex::new(()),
            released: Condvar::new(),
            events: EventBus::new(),
        }
    }

    /// Bulkhead name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration bound at creation.
    pub fn config(&self) -> &BulkheadConfig {
        &self.config
    }

    /// Permits currently available.
    pub fn available_permits(&self) -> usize {
        self.config
            .max_concurrent_calls
            .saturating_sub(self.in_flight.load(Ordering::Acquire))
    }

    /// Event bus for this bulkhead.
    pub fn events(&self) -> &EventBus<BulkheadEvent> {
        &self.events
    }

    /// Try to take a permit without waiting.
    pub fn try_acquire(self: &Arc<Self>) -> Option<BulkheadPermit> {
        if self.grab_slot() {
            Some(self.admitted())
        } else {
            self.rejected();
            None
        }
    }

    /// Take a permit, waiting up to `max_wait_duration` for one to free up.
    /// Returns `None` when the wait expires with the bulkhead still full.
    pub fn acquire(self: &Arc<Self>) -> Option<BulkheadPermit> {
        if self.grab_slot() {
            return Some(self.admitted());
        }
        if self.config.max_wait_duration.is_zero() {
            self.rejected();
            return None;
        }

        let deadline = Instant::now() + self.config.max_wait_duration;
        let mut gate = self.wait_gate.lock();
        loop {
            if self.grab_slot() {
                drop(gate);
                return Some(self.admitted());
            }
            if self.released.wait_until(&mut gate, deadline).timed_out() {
                // One last attempt: a permit may have freed right at the
                // deadline without a wakeup reaching us in time.
                let admitted = self.grab_slot();
                drop(gate);
                return if admitted {
                    Some(self.admitted())
                } else {
                    self.rejected();
                    None
                };
            }
        }
    }

    /// Run `f` inside the bulkhead: acquire, execute, release.
    pub fn call<T, E>(self: &Arc<Self>, f: impl FnOnce() -> Result<T, E>) -> GuardResult<T, E> {
        let _permit = self.acquire().ok_or_else(|| GuardError::BulkheadFull {
            name: self.name.clone(),
            limit: self.config.max_concurrent_calls,
        })?;
        f().map_err(GuardError::Execution)
    }

    /// Wrap `f` so every invocation runs inside the bulkhead.
    pub fn decorate<T, E>(
        self: &Arc<Self>,
        mut f: impl FnMut() -> Result<T, E>,
    ) -> impl FnMut() -> GuardResult<T, E> {
        let bulkhead = Arc::clone(self);
        move || bulkhead.call(|| f())
    }

    /// CAS race for a free slot, in the style of a counting semaphore.
    fn grab_slot(&self) -> bool {
        let mut current = self.in_flight.load(Ordering::Acquire);
        loop {
            if current >= self.config.max_concurrent_calls {
                return false;
            }
            match self.in_flight.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn admitted(self: &Arc<Self>) -> BulkheadPermit {
        self.events.publish(BulkheadEvent::new(
            &self.name,
            BulkheadEventKind::CallPermitted,
        ));
        BulkheadPermit {
            bulkhead: Arc::clone(self),
        }
    }

    fn rejected(&self) {
        self.events.publish(BulkheadEvent::new(
            &self.name,
            BulkheadEventKind::CallRejected,
        ));
    }

    fn release(&self) {
        self.in_flight.fetch_sub(1, Ordering::Release);
        // Touch the gate so a waiter between its failed race and its wait
        // cannot miss the notification.
        drop(self.wait_gate.lock());
        self.released.notify_one();
        self.events.publish(BulkheadEvent::new(
            &self.name,
            BulkheadEventKind::CallFinished,
        ));
    }
}

impl NamedGuard for Bulkhead {
    type Config = BulkheadConfig;

    fn with_config(name: &str, config: BulkheadConfig) -> Self {
        Self::new(name, config)
    }
}

/// RAII permit; releases its slot when dropped.
#[derive(Debug)]
pub struct BulkheadPermit {
    bulkhead: Arc<Bulkhead>,
}

impl Drop for BulkheadPermit {
    fn drop(&mut self) {
        self.bulkhead.release();
    }
}
