//! Circuit breaker with a CAS-swapped five-state machine
//!
//! The breaker's entire mutable state is one atomic reference to an
//! immutable state value (tag, sliding window, entry timestamp). A
//! transition builds the target value and compare-and-swaps the reference;
//! a racer that loses the swap observes the new state and never publishes a
//! duplicate transition. Admission checks are lock-free, and no lock is
//! ever held while caller-supplied work runs.
//!
//! States: `Closed` admits and records; `Open` denies until its wait
//! elapses; `HalfOpen` admits a bounded number of trial calls; `Disabled`
//! and `ForcedOpen` are manual overrides that bypass the thresholds:
//! `Disabled` always admits and never records, `ForcedOpen` never admits.

use crate::clock::{Clock, MonotonicClock};
use crate::errors::{GuardError, GuardResult};
use crate::events::{BusEvent, EventBus};
use crate::metrics::{Outcome, SlidingWindow, Snapshot};
use crate::registry::NamedGuard;
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

/// The five breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Normal operation: calls admitted and recorded.
    Closed,
    /// Failing fast: calls denied until the open wait elapses.
    Open,
    /// Probing: a bounded number of trial calls admitted.
    HalfOpen,
    /// Manual override: always admits, never records.
    Disabled,
    /// Manual override: never admits.
    ForcedOpen,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Closed => "CLOSED",
            State::Open => "OPEN",
            State::HalfOpen => "HALF_OPEN",
            State::Disabled => "DISABLED",
            State::ForcedOpen => "FORCED_OPEN",
        };
        f.write_str(name)
    }
}

/// Shape of the breaker's sliding window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlidingWindowType {
    /// Window over the last N calls.
    CountBased,
    /// Window over the last N seconds.
    TimeBased,
}

/// Predicate over a caller-owned error value.
pub type ErrorPredicate = Arc<dyn Fn(&dyn Any) -> bool + Send + Sync>;

/// Circuit breaker configuration.
#[derive(Clone)]
pub struct CircuitBreakerConfig {
    /// Failure percentage at or above which the breaker opens.
    pub failure_rate_threshold: f32,
    /// Slow-call percentage at or above which the breaker opens.
    pub slow_call_rate_threshold: f32,
    /// Calls at least this long count as slow.
    pub slow_call_duration_threshold: Duration,
    /// Window shape.
    pub sliding_window_type: SlidingWindowType,
    /// Window size: calls for count-based, seconds for time-based.
    pub sliding_window_size: u32,
    /// Outcomes required before rates are evaluated.
    pub minimum_number_of_calls: u32,
    /// Trial calls admitted while half-open.
    pub permitted_number_of_calls_in_half_open_state: u32,
    /// How long the breaker stays open before probing.
    pub wait_duration_in_open_state: Duration,
    /// Jitter factor applied to the open wait; 0.0 disables jitter.
    pub wait_jitter_factor: f64,
    /// Whether an elapsed open wait moves the breaker to half-open on the
    /// next admission check, without an explicit transition call.
    pub automatic_transition_from_open_to_half_open: bool,
    /// Errors that count as failures. `None` records every error.
    pub record_error: Option<ErrorPredicate>,
    /// Errors excluded from the window entirely.
    pub ignore_error: Option<ErrorPredicate>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 50.0,
            slow_call_rate_threshold: 100.0,
            slow_call_duration_threshold: Duration::from_secs(60),
            sliding_window_type: SlidingWindowType::CountBased,
            sliding_window_size: 100,
            minimum_number_of_calls: 100,
            permitted_number_of_calls_in_half_open_state: 10,
            wait_duration_in_open_state: Duration::from_secs(60),
            wait_jitter_factor: 0.0,
            automatic_transition_from_open_to_half_open: false,
            record_error: None,
            ignore_error: None,
        }
    }
}

impl fmt::Debug for CircuitBreakerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerConfig")
            .field("failure_rate_threshold", &self.failure_rate_threshold)
            .field("slow_call_rate_threshold", &self.slow_call_rate_threshold)
            .field(
                "slow_call_duration_threshold",
                &self.slow_call_duration_threshold,
            )
            .field("sliding_window_type", &self.sliding_window_type)
            .field("sliding_window_size", &self.sliding_window_size)
            .field("minimum_number_of_calls", &self.minimum_number_of_calls)
            .field(
                "permitted_number_of_calls_in_half_open_state",
                &self.permitted_number_of_calls_in_half_open_state,
            )
            .field("wait_duration_in_open_state", &self.wait_duration_in_open_state)
            .field("wait_jitter_factor", &self.wait_jitter_factor)
            .field(
                "automatic_transition_from_open_to_half_open",
                &self.automatic_transition_from_open_to_half_open,
            )
            .field("record_error", &self.record_error.is_some())
            .field("ignore_error", &self.ignore_error.is_some())
            .finish()
    }
}

/// Kind tag for breaker events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitBreakerEventKind {
    /// A recorded success.
    Success,
    /// A recorded failure.
    Error,
    /// An error excluded from the window by the classifier.
    IgnoredError,
    /// An admission denial.
    NotPermitted,
    /// A winning state swap.
    StateTransition,
    /// An explicit reset.
    Reset,
}

/// Event payload published by a breaker.
#[derive(Debug, Clone)]
pub enum CircuitBreakerPayload {
    /// Success with its measured duration.
    Success {
        /// How long the call took.
        duration: Duration,
    },
    /// Failure with its measured duration.
    Error {
        /// How long the call took.
        duration: Duration,
    },
    /// Ignored error with its measured duration.
    IgnoredError {
        /// How long the call took.
        duration: Duration,
    },
    /// Admission denial in the named state.
    NotPermitted {
        /// State that denied the call.
        state: State,
    },
    /// A state change.
    StateTransition {
        /// State before the winning swap.
        from: State,
        /// State after the winning swap.
        to: State,
    },
    /// An explicit reset.
    Reset,
}

/// Event published by a circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerEvent {
    /// Name of the publishing breaker.
    pub breaker_name: String,
    /// Wall-clock time the event was created.
    pub created_at: SystemTime,
    /// What happened.
    pub payload: CircuitBreakerPayload,
}

impl CircuitBreakerEvent {
    fn new(breaker_name: &str, payload: CircuitBreakerPayload) -> Self {
        Self {
            breaker_name: breaker_name.to_string(),
            created_at: SystemTime::now(),
            payload,
        }
    }
}

impl BusEvent for CircuitBreakerEvent {
    type Kind = CircuitBreakerEventKind;

    fn entity_name(&self) -> &str {
        &self.breaker_name
    }

    fn kind(&self) -> CircuitBreakerEventKind {
        match self.payload {
            CircuitBreakerPayload::Success { .. } => CircuitBreakerEventKind::Success,
            CircuitBreakerPayload::Error { .. } => CircuitBreakerEventKind::Error,
            CircuitBreakerPayload::IgnoredError { .. } => CircuitBreakerEventKind::IgnoredError,
            CircuitBreakerPayload::NotPermitted { .. } => CircuitBreakerEventKind::NotPermitted,
            CircuitBreakerPayload::StateTransition { .. } => {
                CircuitBreakerEventKind::StateTransition
            }
            CircuitBreakerPayload::Reset => CircuitBreakerEventKind::Reset,
        }
    }
}

/// Context handed to a fallback when the breaker denies admission.
#[derive(Debug, Clone)]
pub struct FallbackContext {
    /// Name of the denying breaker.
    pub breaker_name: String,
    /// State the breaker was in.
    pub state: State,
}

/// Point-in-time breaker metrics.
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerMetrics {
    /// Aggregate of the current state's window.
    pub calls: Snapshot,
    /// Admission denials since creation.
    pub not_permitted_calls: u64,
}

/// Immutable value the breaker's atomic state reference points at.
///
/// The half-open trial budget is an interior counter, which keeps the value
/// shareable while letting concurrent admission checks draw from one pool.
#[derive(Debug)]
struct StateValue {
    state: State,
    window: Arc<SlidingWindow>,
    entered_at: u64,
    open_wait_nanos: u64,
    trial_permits: AtomicU32,
}

impl StateValue {
    fn with_window(state: State, window: Arc<SlidingWindow>, entered_at: u64) -> Self {
        Self {
            state,
            window,
            entered_at,
            open_wait_nanos: 0,
            trial_permits: AtomicU32::new(0),
        }
    }
}

/// How the thresholds relate to the current window aggregate.
enum ThresholdCheck {
    BelowMinimumCalls,
    Below,
    Exceeded,
}

/// Admission gate with sliding-window failure accounting.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    current: ArcSwap<StateValue>,
    /// Serializes transitions only, so transition events publish in swap
    /// order. Never held on the admission or recording path.
    transition_gate: Mutex<()>,
    not_permitted: AtomicU64,
    events: EventBus<CircuitBreakerEvent>,
}

impl CircuitBreaker {
    /// Create a breaker on the production clock, starting closed.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_clock(name, config, Arc::new(MonotonicClock::new()))
    }

    /// Create a breaker on an explicit clock (used by tests).
    pub fn with_clock(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now_nanos();
        let closed = StateValue::with_window(State::Closed, Arc::new(full_window(&config)), now);
        Self {
            name: name.into(),
            config,
            clock,
            current: ArcSwap::from_pointee(closed),
            transition_gate: Mutex::new(()),
            not_permitted: AtomicU64::new(0),
            events: EventBus::new(),
        }
    }

    /// Fluent construction.
    pub fn builder(name: impl Into<String>) -> crate::builder::CircuitBreakerBuilder {
        crate::builder::CircuitBreakerBuilder::new(name)
    }

    /// Breaker name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration bound at creation.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state tag.
    pub fn state(&self) -> State {
        self.current.load().state
    }

    /// Event bus for this breaker.
    pub fn events(&self) -> &EventBus<CircuitBreakerEvent> {
        &self.events
    }

    /// Aggregate of the current state's window plus the denial counter.
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let current = self.current.load();
        CircuitBreakerMetrics {
            calls: current.window.snapshot(self.clock.now_nanos()),
            not_permitted_calls: self.not_permitted.load(Ordering::Relaxed),
        }
    }

    /// Ask for admission. Denials increment the not-permitted counter and
    /// publish a [`CircuitBreakerEventKind::NotPermitted`] event.
    pub fn try_acquire_permission(&self) -> bool {
        loop {
            let current = self.current.load_full();
            match current.state {
                State::Closed | State::Disabled => return true,
                State::ForcedOpen => return self.deny(State::ForcedOpen),
                State::Open => {
                    let elapsed = self.clock.now_nanos().saturating_sub(current.entered_at);
                    if self.config.automatic_transition_from_open_to_half_open
                        && elapsed >= current.open_wait_nanos
                    {
                        self.transition_to_half_open();
                        // Re-read: either we won the swap or another caller
                        // did; the half-open budget decides from here.
                        continue;
                    }
                    return self.deny(State::Open);
                }
                State::HalfOpen => {
                    let mut permits = current.trial_permits.load(Ordering::Acquire);
                    loop {
                        if permits == 0 {
                            return self.deny(State::HalfOpen);
                        }
                        match current.trial_permits.compare_exchange_weak(
                            permits,
                            permits - 1,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        ) {
                            Ok(_) => return true,
                            Err(actual) => permits = actual,
                        }
                    }
                }
            }
        }
    }

    /// Return a half-open trial slot that was acquired but never used, so an
    /// abandoned call does not starve the probe budget.
    pub fn release_permission(&self) {
        let current = self.current.load();
        if current.state == State::HalfOpen {
            current.trial_permits.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Record a successful call.
    pub fn on_success(&self, duration: Duration) {
        self.events.publish(CircuitBreakerEvent::new(
            &self.name,
            CircuitBreakerPayload::Success { duration },
        ));
        self.record(Outcome::from_call(false, self.is_slow(duration)));
    }

    /// Record a failed call, subject to the record/ignore classifier.
    pub fn on_error(&self, duration: Duration, cause: &dyn Any) {
        if self.is_ignored(cause) {
            self.events.publish(CircuitBreakerEvent::new(
                &self.name,
                CircuitBreakerPayload::IgnoredError { duration },
            ));
            return;
        }
        self.events.publish(CircuitBreakerEvent::new(
            &self.name,
            CircuitBreakerPayload::Error { duration },
        ));
        self.record(Outcome::from_call(true, self.is_slow(duration)));
    }

    /// Run `f` under the breaker: admission check, execution, outcome
    /// recording.
    pub fn call<T, E>(&self, f: impl FnOnce() -> Result<T, E>) -> GuardResult<T, E>
    where
        E: 'static,
    {
        if !self.try_acquire_permission() {
            return Err(GuardError::CallNotPermitted {
                name: self.name.clone(),
                state: self.state(),
            });
        }
        self.measure(f)
    }

    /// Like [`CircuitBreaker::call`], but a denied admission runs `fallback`
    /// instead of surfacing `CallNotPermitted`.
    pub fn call_with_fallback<T, E>(
        &self,
        f: impl FnOnce() -> Result<T, E>,
        fallback: impl FnOnce(&FallbackContext) -> Result<T, E>,
    ) -> GuardResult<T, E>
    where
        E: 'static,
    {
        if !self.try_acquire_permission() {
            let context = FallbackContext {
                breaker_name: self.name.clone(),
                state: self.state(),
            };
            return fallback(&context).map_err(GuardError::Execution);
        }
        self.measure(f)
    }

    /// Wrap `f` so every invocation runs under the breaker.
    pub fn decorate<T, E>(
        self: &Arc<Self>,
        mut f: impl FnMut() -> Result<T, E>,
    ) -> impl FnMut() -> GuardResult<T, E>
    where
        E: 'static,
    {
        let breaker = Arc::clone(self);
        move || breaker.call(|| f())
    }

    /// Force the breaker open until further notice; thresholds no longer
    /// apply.
    pub fn force_open(&self) {
        let now = self.clock.now_nanos();
        self.transition(State::ForcedOpen, |_, config| {
            StateValue::with_window(State::ForcedOpen, Arc::new(full_window(config)), now)
        });
    }

    /// Disable the breaker: every call admitted, nothing recorded.
    pub fn disable(&self) {
        let now = self.clock.now_nanos();
        self.transition(State::Disabled, |_, config| {
            StateValue::with_window(State::Disabled, Arc::new(full_window(config)), now)
        });
    }

    /// Move to open, keeping the window that tripped the breaker for
    /// reporting.
    pub fn transition_to_open(&self) {
        let now = self.clock.now_nanos();
        let wait = self.open_wait_nanos();
        self.transition(State::Open, |previous, _| {
            let mut value = StateValue::with_window(State::Open, Arc::clone(&previous.window), now);
            value.open_wait_nanos = wait;
            value
        });
    }

    /// Move to half-open with a fresh window sized to the trial budget.
    pub fn transition_to_half_open(&self) {
        let now = self.clock.now_nanos();
        let permitted = self.config.permitted_number_of_calls_in_half_open_state;
        self.transition(State::HalfOpen, |_, _| {
            let window = Arc::new(SlidingWindow::count_based(permitted, permitted));
            let mut value = StateValue::with_window(State::HalfOpen, window, now);
            value.trial_permits = AtomicU32::new(permitted);
            value
        });
    }

    /// Move to closed with a fresh full-size window.
    pub fn transition_to_closed(&self) {
        let now = self.clock.now_nanos();
        self.transition(State::Closed, |_, config| {
            StateValue::with_window(State::Closed, Arc::new(full_window(config)), now)
        });
    }

    /// Force closed with a brand-new window regardless of current state.
    /// Always publishes a reset event, plus a transition event when the
    /// state actually changed.
    pub fn reset(&self) {
        let now = self.clock.now_nanos();
        let fresh = Arc::new(StateValue::with_window(
            State::Closed,
            Arc::new(full_window(&self.config)),
            now,
        ));
        let _gate = self.transition_gate.lock();
        let previous = self.current.swap(fresh);
        if previous.state != State::Closed {
            self.publish_transition(previous.state, State::Closed);
        }
        tracing::debug!(breaker = %self.name, "reset");
        self.events
            .publish(CircuitBreakerEvent::new(&self.name, CircuitBreakerPayload::Reset));
    }

    fn measure<T, E>(&self, f: impl FnOnce() -> Result<T, E>) -> GuardResult<T, E>
    where
        E: 'static,
    {
        let start = self.clock.now_nanos();
        match f() {
            Ok(value) => {
                self.on_success(Duration::from_nanos(
                    self.clock.now_nanos().saturating_sub(start),
                ));
                Ok(value)
            }
            Err(error) => {
                self.on_error(
                    Duration::from_nanos(self.clock.now_nanos().saturating_sub(start)),
                    &error,
                );
                Err(GuardError::Execution(error))
            }
        }
    }

    /// Write one outcome into the current state's window and apply whatever
    /// transition the refreshed rates call for.
    fn record(&self, outcome: Outcome) {
        let current = self.current.load_full();
        match current.state {
            State::Disabled | State::ForcedOpen => return,
            _ => {}
        }

        let snapshot = current.window.record(self.clock.now_nanos(), outcome);
        match current.state {
            State::Closed => {
                if matches!(self.check_thresholds(snapshot), ThresholdCheck::Exceeded) {
                    self.transition_to_open();
                }
            }
            State::HalfOpen => match self.check_thresholds(snapshot) {
                ThresholdCheck::Exceeded => self.transition_to_open(),
                ThresholdCheck::Below => self.transition_to_closed(),
                ThresholdCheck::BelowMinimumCalls => {}
            },
            // Stray completions from calls admitted before the swap land in
            // the preserved window for reporting only.
            _ => {}
        }
    }

    fn check_thresholds(&self, snapshot: Snapshot) -> ThresholdCheck {
        if snapshot.failure_rate < 0.0 {
            return ThresholdCheck::BelowMinimumCalls;
        }
        if snapshot.failure_rate >= self.config.failure_rate_threshold
            || snapshot.slow_call_rate >= self.config.slow_call_rate_threshold
        {
            ThresholdCheck::Exceeded
        } else {
            ThresholdCheck::Below
        }
    }

    /// CAS transition loop. Idempotent: when the breaker is already in
    /// `target` nothing happens and nothing is published. Exactly one
    /// transition event goes out per winning swap.
    fn transition(
        &self,
        target: State,
        build: impl Fn(&StateValue, &CircuitBreakerConfig) -> StateValue,
    ) {
        let _gate = self.transition_gate.lock();
        let mut current = self.current.load_full();
        loop {
            if current.state == target {
                return;
            }
            let next = Arc::new(build(&current, &self.config));
            let previous = self.current.compare_and_swap(&current, next);
            if Arc::ptr_eq(&previous, &current) {
                self.publish_transition(current.state, target);
                return;
            }
            // Lost the race; re-evaluate against the winner's state.
            current = Arc::clone(&previous);
        }
    }

    fn publish_transition(&self, from: State, to: State) {
        tracing::debug!(breaker = %self.name, %from, %to, "state transition");
        self.events.publish(CircuitBreakerEvent::new(
            &self.name,
            CircuitBreakerPayload::StateTransition { from, to },
        ));
    }

    fn deny(&self, state: State) -> bool {
        self.not_permitted.fetch_add(1, Ordering::Relaxed);
        self.events.publish(CircuitBreakerEvent::new(
            &self.name,
            CircuitBreakerPayload::NotPermitted { state },
        ));
        false
    }

    fn is_slow(&self, duration: Duration) -> bool {
        duration >= self.config.slow_call_duration_threshold
    }

    /// Ignored errors never touch the window: explicitly ignored causes,
    /// and causes the record predicate rules out.
    fn is_ignored(&self, cause: &dyn Any) -> bool {
        if let Some(ignore) = &self.config.ignore_error
            && ignore(cause)
        {
            return true;
        }
        if let Some(record) = &self.config.record_error {
            return !record(cause);
        }
        false
    }

    fn open_wait_nanos(&self) -> u64 {
        let base = self.config.wait_duration_in_open_state;
        if self.config.wait_jitter_factor > 0.0 {
            let base_ms = base.as_millis() as u64;
            let policy = chrono_machines::Policy {
                max_attempts: 1,
                base_delay_ms: base_ms,
                multiplier: 1.0,
                max_delay_ms: base_ms,
            };
            policy.calculate_delay(1, self.config.wait_jitter_factor) * 1_000_000
        } else {
            base.as_nanos() as u64
        }
    }
}

fn full_window(config: &CircuitBreakerConfig) -> SlidingWindow {
    match config.sliding_window_type {
        SlidingWindowType::CountBased => SlidingWindow::count_based(
            config.sliding_window_size,
            config.minimum_number_of_calls,
        ),
        SlidingWindowType::TimeBased => SlidingWindow::time_based(
            config.sliding_window_size,
            config.minimum_number_of_calls,
        ),
    }
}

impl NamedGuard for CircuitBreaker {
    type Config = CircuitBreakerConfig;

    fn with_config(name: &str, config: CircuitBreakerConfig) -> Self {
        Self::new(name, config)
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::AtomicUsize;

    fn small_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_rate_threshold: 50.0,
            minimum_number_of_calls: 4,
            sliding_window_size: 4,
            permitted_number_of_calls_in_half_open_state: 2,
            wait_duration_in_open_state: Duration::from_secs(1),
            automatic_transition_from_open_to_half_open: true,
            ..CircuitBreakerConfig::default()
        }
    }

    fn breaker_with_manual_clock(
        config: CircuitBreakerConfig,
    ) -> (Arc<CircuitBreaker>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let breaker = Arc::new(CircuitBreaker::with_clock("test", config, clock.clone()));
        (breaker, clock)
    }

    #[test]
    fn test_starts_closed_and_permits() {
        let (breaker, _clock) = breaker_with_manual_clock(small_config());
        assert_eq!(breaker.state(), State::Closed);
        assert!(breaker.try_acquire_permission());
    }

    #[test]
    fn test_opens_at_failure_rate_threshold() {
        let (breaker, _clock) = breaker_with_manual_clock(small_config());

        let _ = breaker.call(|| Err::<(), _>("error 1"));
        let _ = breaker.call(|| Err::<(), _>("error 2"));
        let _ = breaker.call(|| Ok::<_, &str>(()));
        assert_eq!(breaker.state(), State::Closed);

        // Fourth call reaches the minimum; 2 failures of 4 = 50% >= 50%.
        let _ = breaker.call(|| Ok::<_, &str>(()));
        assert_eq!(breaker.state(), State::Open);
    }

    #[test]
    fn test_open_preserves_triggering_window() {
        let (breaker, _clock) = breaker_with_manual_clock(small_config());

        for _ in 0..4 {
            let _ = breaker.call(|| Err::<(), _>("boom"));
        }
        assert_eq!(breaker.state(), State::Open);

        let metrics = breaker.metrics();
        assert_eq!(metrics.calls.total_calls, 4);
        assert_eq!(metrics.calls.failed_calls, 4);
    }

    #[test]
    fn test_open_denies_and_counts() {
        let (breaker, _clock) = breaker_with_manual_clock(small_config());
        for _ in 0..4 {
            let _ = breaker.call(|| Err::<(), _>("boom"));
        }

        let result = breaker.call(|| Ok::<_, &str>("unreachable"));
        match result {
            Err(GuardError::CallNotPermitted { name, state }) => {
                assert_eq!(name, "test");
                assert_eq!(state, State::Open);
            }
            other => panic!("Expected CallNotPermitted, got {other:?}"),
        }
        assert_eq!(breaker.metrics().not_permitted_calls, 1);
    }

    #[test]
    fn test_auto_transition_to_half_open_after_wait() {
        let (breaker, clock) = breaker_with_manual_clock(small_config());
        for _ in 0..4 {
            let _ = breaker.call(|| Err::<(), _>("boom"));
        }
        assert_eq!(breaker.state(), State::Open);

        // Still inside the wait: denied, state unchanged.
        clock.advance_millis(500);
        assert!(!breaker.try_acquire_permission());
        assert_eq!(breaker.state(), State::Open);

        clock.advance_millis(500);
        assert!(breaker.try_acquire_permission());
        assert_eq!(breaker.state(), State::HalfOpen);
    }

    #[test]
    fn test_half_open_successes_close_the_breaker() {
        let (breaker, clock) = breaker_with_manual_clock(small_config());
        for _ in 0..4 {
            let _ = breaker.call(|| Err::<(), _>("boom"));
        }
        clock.advance_millis(1_000);

        // Two permitted trial successes fill the probe window.
        assert!(breaker.call(|| Ok::<_, &str>(())).is_ok());
        assert!(breaker.call(|| Ok::<_, &str>(())).is_ok());
        assert_eq!(breaker.state(), State::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let (breaker, clock) = breaker_with_manual_clock(CircuitBreakerConfig {
            permitted_number_of_calls_in_half_open_state: 1,
            ..small_config()
        });
        for _ in 0..4 {
            let _ = breaker.call(|| Err::<(), _>("boom"));
        }
        clock.advance_millis(1_000);

        let _ = breaker.call(|| Err::<(), _>("still broken"));
        assert_eq!(breaker.state(), State::Open);
    }

    #[test]
    fn test_half_open_budget_denies_extra_trials() {
        let (breaker, clock) = breaker_with_manual_clock(small_config());
        for _ in 0..4 {
            let _ = breaker.call(|| Err::<(), _>("boom"));
        }
        clock.advance_millis(1_000);

        assert!(breaker.try_acquire_permission());
        assert!(breaker.try_acquire_permission());
        // Budget of two exhausted; the third probe is denied.
        assert!(!breaker.try_acquire_permission());

        breaker.release_permission();
        assert!(breaker.try_acquire_permission());
    }

    #[test]
    fn test_no_auto_transition_when_disabled_in_config() {
        let (breaker, clock) = breaker_with_manual_clock(CircuitBreakerConfig {
            automatic_transition_from_open_to_half_open: false,
            ..small_config()
        });
        for _ in 0..4 {
            let _ = breaker.call(|| Err::<(), _>("boom"));
        }
        clock.advance_millis(10_000);

        assert!(!breaker.try_acquire_permission());
        assert_eq!(breaker.state(), State::Open);

        breaker.transition_to_half_open();
        assert_eq!(breaker.state(), State::HalfOpen);
        assert!(breaker.try_acquire_permission());
    }

    #[test]
    fn test_slow_calls_trip_the_breaker() {
        let (breaker, clock) = breaker_with_manual_clock(CircuitBreakerConfig {
            slow_call_rate_threshold: 50.0,
            slow_call_duration_threshold: Duration::from_millis(100),
            failure_rate_threshold: 100.0,
            ..small_config()
        });

        for _ in 0..4 {
            let clock = clock.clone();
            let _ = breaker.call(|| {
                clock.advance_millis(200);
                Ok::<_, &str>(())
            });
        }
        // Every call succeeded, but all were slow.
        assert_eq!(breaker.state(), State::Open);
    }

    #[test]
    fn test_ignored_errors_leave_window_untouched() {
        let config = CircuitBreakerConfig {
            ignore_error: Some(Arc::new(|cause| {
                cause
                    .downcast_ref::<&str>()
                    .map(|e| e.contains("client"))
                    .unwrap_or(false)
            })),
            ..small_config()
        };
        let (breaker, _clock) = breaker_with_manual_clock(config);
        let ignored = Arc::new(AtomicUsize::new(0));

        let i = ignored.clone();
        breaker
            .events()
            .on_kind(CircuitBreakerEventKind::IgnoredError, move |_| {
                i.fetch_add(1, Ordering::SeqCst);
            });

        for _ in 0..10 {
            let _ = breaker.call(|| Err::<(), _>("client error"));
        }

        assert_eq!(breaker.state(), State::Closed);
        assert_eq!(breaker.metrics().calls.total_calls, 0);
        assert_eq!(ignored.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_record_predicate_excludes_errors() {
        let config = CircuitBreakerConfig {
            record_error: Some(Arc::new(|cause| {
                cause
                    .downcast_ref::<&str>()
                    .map(|e| e.contains("server"))
                    .unwrap_or(true)
            })),
            ..small_config()
        };
        let (breaker, _clock) = breaker_with_manual_clock(config);

        for _ in 0..10 {
            let _ = breaker.call(|| Err::<(), _>("validation"));
        }
        assert_eq!(breaker.state(), State::Closed);

        for _ in 0..4 {
            let _ = breaker.call(|| Err::<(), _>("server error"));
        }
        assert_eq!(breaker.state(), State::Open);
    }

    #[test]
    fn test_disabled_admits_and_never_records() {
        let (breaker, _clock) = breaker_with_manual_clock(small_config());
        breaker.disable();
        assert_eq!(breaker.state(), State::Disabled);

        for _ in 0..20 {
            let _ = breaker.call(|| Err::<(), _>("boom"));
        }
        assert_eq!(breaker.state(), State::Disabled);
        assert_eq!(breaker.metrics().calls.total_calls, 0);
    }

    #[test]
    fn test_forced_open_never_permits() {
        let (breaker, clock) = breaker_with_manual_clock(small_config());
        breaker.force_open();

        clock.advance_millis(60_000);
        assert!(!breaker.try_acquire_permission());
        assert_eq!(breaker.state(), State::ForcedOpen);
    }

    #[test]
    fn test_reset_always_publishes_reset() {
        let (breaker, _clock) = breaker_with_manual_clock(small_config());
        let resets = Arc::new(AtomicUsize::new(0));
        let transitions = Arc::new(AtomicUsize::new(0));

        let r = resets.clone();
        breaker
            .events()
            .on_kind(CircuitBreakerEventKind::Reset, move |_| {
                r.fetch_add(1, Ordering::SeqCst);
            });
        let t = transitions.clone();
        breaker
            .events()
            .on_kind(CircuitBreakerEventKind::StateTransition, move |_| {
                t.fetch_add(1, Ordering::SeqCst);
            });

        // Reset while already closed: reset event only.
        breaker.reset();
        assert_eq!(resets.load(Ordering::SeqCst), 1);
        assert_eq!(transitions.load(Ordering::SeqCst), 0);

        for _ in 0..4 {
            let _ = breaker.call(|| Err::<(), _>("boom"));
        }
        let transitions_before = transitions.load(Ordering::SeqCst);

        breaker.reset();
        assert_eq!(breaker.state(), State::Closed);
        assert_eq!(breaker.metrics().calls.total_calls, 0);
        assert_eq!(resets.load(Ordering::SeqCst), 2);
        assert_eq!(transitions.load(Ordering::SeqCst), transitions_before + 1);
    }

    #[test]
    fn test_transition_is_idempotent() {
        let (breaker, _clock) = breaker_with_manual_clock(small_config());
        let transitions = Arc::new(AtomicUsize::new(0));

        let t = transitions.clone();
        breaker
            .events()
            .on_kind(CircuitBreakerEventKind::StateTransition, move |_| {
                t.fetch_add(1, Ordering::SeqCst);
            });

        breaker.transition_to_open();
        breaker.transition_to_open();
        breaker.transition_to_open();

        assert_eq!(transitions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_racing_transitions_publish_once() {
        for _ in 0..20 {
            let (breaker, _clock) = breaker_with_manual_clock(small_config());
            let transitions = Arc::new(AtomicUsize::new(0));

            let t = transitions.clone();
            breaker
                .events()
                .on_kind(CircuitBreakerEventKind::StateTransition, move |_| {
                    t.fetch_add(1, Ordering::SeqCst);
                });

            let mut handles = Vec::new();
            for _ in 0..4 {
                let breaker = Arc::clone(&breaker);
                handles.push(std::thread::spawn(move || breaker.transition_to_open()));
            }
            for handle in handles {
                handle.join().unwrap();
            }

            assert_eq!(breaker.state(), State::Open);
            // Every losing racer observed the winner instead of re-publishing.
            assert_eq!(transitions.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn test_fallback_runs_when_open() {
        let (breaker, _clock) = breaker_with_manual_clock(small_config());
        for _ in 0..4 {
            let _ = breaker.call(|| Err::<(), _>("boom"));
        }

        let result = breaker.call_with_fallback(
            || Err::<&str, _>("should not run"),
            |context| {
                assert_eq!(context.breaker_name, "test");
                assert_eq!(context.state, State::Open);
                Ok("from fallback")
            },
        );
        assert_eq!(result.unwrap(), "from fallback");
    }

    #[test]
    fn test_decorate_preserves_call_shape() {
        let (breaker, _clock) = breaker_with_manual_clock(small_config());
        let mut guarded = breaker.decorate(|| Ok::<_, &str>("value"));

        assert_eq!(guarded().unwrap(), "value");
        assert_eq!(guarded().unwrap(), "value");
        assert_eq!(breaker.metrics().calls.total_calls, 2);
    }

    #[test]
    fn test_time_based_window_forgets_old_failures() {
        let (breaker, clock) = breaker_with_manual_clock(CircuitBreakerConfig {
            sliding_window_type: SlidingWindowType::TimeBased,
            sliding_window_size: 2,
            minimum_number_of_calls: 2,
            ..small_config()
        });

        let _ = breaker.call(|| Err::<(), _>("boom"));
        clock.advance_millis(5_000);

        // The old failure aged out; these two successes are the whole window.
        let _ = breaker.call(|| Ok::<_, &str>(()));
        let _ = breaker.call(|| Ok::<_, &str>(()));
        assert_eq!(breaker.state(), State::Closed);
        assert_eq!(breaker.metrics().calls.failed_calls, 0);
    }
}
