//! Permit-cycle rate limiter
//!
//! Time is divided into fixed refresh cycles; each cycle grants
//! `limit_for_period` permissions. The whole limiter state (current cycle
//! number and remaining permissions) is packed into one atomic word, so an
//! acquisition is a single CAS loop: rollover credit and the permission
//! decrement are applied together, and a cycle boundary is applied exactly
//! once no matter how many callers race it.
//!
//! Permissions may go negative: a negative count is a backlog of
//! reservations that the next cycle's credit pays off first. The backlog is
//! floored at `-limit_for_period`; once the floor is hit, callers are denied
//! without consuming anything.

use crate::clock::{Clock, MonotonicClock};
use crate::errors::{GuardError, GuardResult};
use crate::events::{BusEvent, EventBus};
use crate::registry::NamedGuard;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

/// Rate limiter configuration.
#[derive(Debug, Clone, Copy)]
pub struct RateLimiterConfig {
    /// Permissions granted per refresh cycle.
    pub limit_for_period: u32,
    /// Length of one refresh cycle.
    pub limit_refresh_period: Duration,
    /// How long a blocking acquisition may wait for the next cycle. Zero
    /// makes every acquisition non-blocking.
    pub timeout_duration: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            limit_for_period: 50,
            limit_refresh_period: Duration::from_millis(500),
            timeout_duration: Duration::from_secs(5),
        }
    }
}

impl RateLimiterConfig {
    /// Set the permissions granted per cycle.
    pub fn with_limit_for_period(mut self, limit: u32) -> Self {
        self.limit_for_period = limit;
        self
    }

    /// Set the cycle length.
    pub fn with_limit_refresh_period(mut self, period: Duration) -> Self {
        self.limit_refresh_period = period;
        self
    }

    /// Set the acquisition timeout.
    pub fn with_timeout_duration(mut self, timeout: Duration) -> Self {
        self.timeout_duration = timeout;
        self
    }
}

/// Kind tag for rate limiter events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimiterEventKind {
    /// A permission was granted.
    SuccessfulAcquire,
    /// A permission was denied.
    FailedAcquire,
}

/// Event published by a rate limiter.
#[derive(Debug, Clone)]
pub struct RateLimiterEvent {
    /// Name of the publishing limiter.
    pub limiter_name: String,
    /// Wall-clock time the event was created.
    pub created_at: SystemTime,
    /// What happened.
    pub kind: RateLimiterEventKind,
}

impl RateLimiterEvent {
    fn new(limiter_name: &str, kind: RateLimiterEventKind) -> Self {
        Self {
            limiter_name: limiter_name.to_string(),
            created_at: SystemTime::now(),
            kind,
        }
    }
}

impl BusEvent for RateLimiterEvent {
    type Kind = RateLimiterEventKind;

    fn entity_name(&self) -> &str {
        &self.limiter_name
    }

    fn kind(&self) -> RateLimiterEventKind {
        self.kind
    }
}

/// What one CAS pass over the limiter state concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    /// Permission granted for the current cycle.
    Granted,
    /// A reservation was consumed; admission happens `nanos` from now.
    MustWait { nanos: u64 },
    /// Backlog floor reached; nothing was consumed.
    Saturated,
}

/// Permit-cycle admission gate.
#[derive(Debug)]
pub struct RateLimiter {
    name: String,
    config: RateLimiterConfig,
    period_nanos: u64,
    /// Packed `(cycle: u32, active_permissions: i32)`.
    state: AtomicU64,
    clock: Arc<dyn Clock>,
    events: EventBus<RateLimiterEvent>,
}

fn pack(cycle: u32, permissions: i32) -> u64 {
    ((cycle as u64) << 32) | (permissions as u32 as u64)
}

fn unpack(word: u64) -> (u32, i32) {
    ((word >> 32) as u32, word as u32 as i32)
}

impl RateLimiter {
    /// Create a rate limiter on the production clock.
    ///
    /// # Panics
    ///
    /// Panics if `limit_for_period` is 0 or the refresh period is zero.
    pub fn new(name: impl Into<String>, config: RateLimiterConfig) -> Self {
        Self::with_clock(name, config, Arc::new(MonotonicClock::new()))
    }

    /// Create a rate limiter on an explicit clock (used by tests).
    pub fn with_clock(
        name: impl Into<String>,
        config: RateLimiterConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        assert!(
            config.limit_for_period > 0,
            "RateLimiter limit must be greater than 0"
        );
        let period_nanos = config.limit_refresh_period.as_nanos() as u64;
        assert!(period_nanos > 0, "RateLimiter refresh period must be non-zero");
        Self {
            name: name.into(),
            state: AtomicU64::new(pack(0, config.limit_for_period as i32)),
            period_nanos,
            config,
            clock,
            events: EventBus::new(),
        }
    }

    /// Limiter name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration bound at creation.
    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Event bus for this limiter.
    pub fn events(&self) -> &EventBus<RateLimiterEvent> {
        &self.events
    }

    /// Permissions left in the current cycle as if the rollover had already
    /// been applied. Negative values are backlog.
    pub fn available_permissions(&self) -> i32 {
        let (cycle, permissions) = unpack(self.state.load(Ordering::Acquire));
        let current_cycle = (self.clock.now_nanos() / self.period_nanos) as u32;
        if current_cycle > cycle {
            let credit = (current_cycle - cycle) as i64 * self.config.limit_for_period as i64;
            (permissions as i64 + credit).min(self.config.limit_for_period as i64) as i32
        } else {
            permissions
        }
    }

    /// Nanoseconds a caller arriving now would wait for a permission, as a
    /// derived view of the same state. Zero while the current cycle still
    /// has permissions.
    pub fn nanos_to_wait(&self) -> u64 {
        let available = self.available_permissions();
        if available > 0 {
            return 0;
        }
        let limit = self.config.limit_for_period as u64;
        let reservation_depth = 1 + (-(available as i64)) as u64;
        let cycles_ahead = (reservation_depth + limit - 1) / limit;
        let now = self.clock.now_nanos();
        let boundary = (now / self.period_nanos + cycles_ahead) * self.period_nanos;
        boundary.saturating_sub(now)
    }

    /// Acquire a permission, waiting up to `timeout_duration` for the next
    /// cycle boundary when the current cycle is exhausted.
    pub fn acquire_permission(&self) -> bool {
        match self.try_consume() {
            Decision::Granted => self.granted(),
            Decision::MustWait { nanos } => {
                let timeout_nanos = self.config.timeout_duration.as_nanos() as u64;
                if timeout_nanos > 0 && nanos <= timeout_nanos {
                    std::thread::sleep(Duration::from_nanos(nanos));
                    self.granted()
                } else {
                    // The reservation stays consumed; the next cycle's
                    // credit reclaims it.
                    self.denied()
                }
            }
            Decision::Saturated => self.denied(),
        }
    }

    /// Acquire a permission without ever blocking, regardless of the
    /// configured timeout.
    pub fn try_acquire_permission(&self) -> bool {
        match self.try_consume() {
            Decision::Granted => self.granted(),
            _ => self.denied(),
        }
    }

    /// Run `f` once a permission is granted.
    pub fn call<T, E>(&self, f: impl FnOnce() -> Result<T, E>) -> GuardResult<T, E> {
        if !self.acquire_permission() {
            return Err(GuardError::RateLimited {
                name: self.name.clone(),
                timeout: self.config.timeout_duration,
            });
        }
        f().map_err(GuardError::Execution)
    }

    /// Wrap `f` so every invocation first acquires a permission.
    pub fn decorate<T, E>(
        self: &Arc<Self>,
        mut f: impl FnMut() -> Result<T, E>,
    ) -> impl FnMut() -> GuardResult<T, E> {
        let limiter = Arc::clone(self);
        move || limiter.call(|| f())
    }

    fn granted(&self) -> bool {
        self.events.publish(RateLimiterEvent::new(
            &self.name,
            RateLimiterEventKind::SuccessfulAcquire,
        ));
        true
    }

    fn denied(&self) -> bool {
        self.events.publish(RateLimiterEvent::new(
            &self.name,
            RateLimiterEventKind::FailedAcquire,
        ));
        false
    }

    /// One CAS loop applying rollover credit and the permission decrement
    /// together. The winning CAS for a given boundary is the only writer
    /// that applies that boundary's credit.
    fn try_consume(&self) -> Decision {
        let limit = self.config.limit_for_period as i64;
        loop {
            let now = self.clock.now_nanos();
            let current_cycle = (now / self.period_nanos) as u32;
            let observed = self.state.load(Ordering::Acquire);
            let (cycle, permissions) = unpack(observed);

            let refreshed = if current_cycle > cycle {
                let credit = (current_cycle - cycle) as i64 * limit;
                (permissions as i64 + credit).min(limit) as i32
            } else {
                permissions
            };

            if refreshed <= -(limit as i32) {
                return Decision::Saturated;
            }

            let next = refreshed - 1;
            if self
                .state
                .compare_exchange_weak(
                    observed,
                    pack(current_cycle, next),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                continue;
            }

            if next >= 0 {
                return Decision::Granted;
            }
            // The reservation is covered `cycles_ahead` boundaries from the
            // start of the current cycle.
            let cycles_ahead = (((-next) as u64) + limit as u64 - 1) / limit as u64;
            let boundary = (current_cycle as u64 + cycles_ahead) * self.period_nanos;
            return Decision::MustWait {
                nanos: boundary.saturating_sub(now),
            };
        }
    }
}

impl NamedGuard for RateLimiter {
    type Config = RateLimiterConfig;

    fn with_config(name: &str, config: RateLimiterConfig) -> Self {
        Self::new(name, config)
    }
}
