//! Retry controller with backoff
//!
//! A retry wraps one invocation in an attempt loop scoped to that call:
//! the first attempt runs immediately, later attempts run after a backoff
//! delay computed by `chrono-machines` (base interval, optional exponential
//! multiplier, bounded jitter). Which failures are worth retrying is decided
//! by predicates over the caller's own error and result types, downcast from
//! `&dyn Any` so this crate never needs to know them.

use crate::errors::{GuardError, GuardResult};
use crate::events::{BusEvent, EventBus};
use crate::pool::CancelToken;
use crate::registry::NamedGuard;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Predicate over a caller-owned error or result value.
pub type AnyPredicate = Arc<dyn Fn(&dyn Any) -> bool + Send + Sync>;

/// Retry configuration.
#[derive(Clone)]
pub struct RetryConfig {
    /// Maximum attempts, the first call included.
    pub max_attempts: u32,
    /// Backoff before the second attempt.
    pub initial_interval: Duration,
    /// Exponential growth factor applied per attempt; 1.0 keeps the
    /// interval constant.
    pub backoff_multiplier: f64,
    /// Upper bound on any single backoff delay.
    pub max_interval: Duration,
    /// Jitter factor in `[0.0, 1.0]`; 0.0 disables jitter.
    pub jitter_factor: f64,
    /// Errors worth retrying. `None` retries every error.
    pub retry_on_error: Option<AnyPredicate>,
    /// Errors to give up on immediately, published as ignored.
    pub ignore_error: Option<AnyPredicate>,
    /// Results that count as logical failures and take the backoff path.
    pub retry_on_result: Option<AnyPredicate>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_millis(500),
            backoff_multiplier: 1.0,
            max_interval: Duration::from_secs(60),
            jitter_factor: 0.0,
            retry_on_error: None,
            ignore_error: None,
            retry_on_result: None,
        }
    }
}

impl RetryConfig {
    /// Set the attempt budget.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Set the base backoff interval.
    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    /// Set the exponential multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Set the backoff ceiling.
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set the jitter factor.
    pub fn with_jitter_factor(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    /// Retry only errors matching `predicate`. The value handed to the
    /// predicate downcasts to the caller's error type.
    pub fn retry_error_when<E: 'static>(
        mut self,
        predicate: impl Fn(&E) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.retry_on_error = Some(Arc::new(move |any| {
            any.downcast_ref::<E>().map(&predicate).unwrap_or(true)
        }));
        self
    }

    /// Give up immediately on errors matching `predicate`.
    pub fn ignore_error_when<E: 'static>(
        mut self,
        predicate: impl Fn(&E) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.ignore_error = Some(Arc::new(move |any| {
            any.downcast_ref::<E>().map(&predicate).unwrap_or(false)
        }));
        self
    }

    /// Treat successful results matching `predicate` as logical failures.
    pub fn retry_result_when<T: 'static>(
        mut self,
        predicate: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.retry_on_result = Some(Arc::new(move |any| {
            any.downcast_ref::<T>().map(&predicate).unwrap_or(false)
        }));
        self
    }
}

impl fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryConfig")
            .field("max_attempts", &self.max_attempts)
            .field("initial_interval", &self.initial_interval)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("max_interval", &self.max_interval)
            .field("jitter_factor", &self.jitter_factor)
            .field("retry_on_error", &self.retry_on_error.is_some())
            .field("ignore_error", &self.ignore_error.is_some())
            .field("retry_on_result", &self.retry_on_result.is_some())
            .finish()
    }
}

/// Kind tag for retry events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryEventKind {
    /// A backoff wait was scheduled before another attempt.
    Retry,
    /// The call succeeded after at least one retry.
    Success,
    /// The attempt budget was exhausted.
    Error,
    /// An error matched the ignore predicate; no retry happened.
    IgnoredError,
}

/// Event published by a retry controller.
#[derive(Debug, Clone)]
pub struct RetryEvent {
    /// Name of the publishing retry.
    pub retry_name: String,
    /// Wall-clock time the event was created.
    pub created_at: SystemTime,
    /// What happened.
    pub kind: RetryEventKind,
    /// Attempts made when the event fired.
    pub attempts: u32,
    /// Backoff wait scheduled, for `Retry` events.
    pub wait: Option<Duration>,
}

impl RetryEvent {
    fn new(retry_name: &str, kind: RetryEventKind, attempts: u32, wait: Option<Duration>) -> Self {
        Self {
            retry_name: retry_name.to_string(),
            created_at: SystemTime::now(),
            kind,
            attempts,
            wait,
        }
    }
}

impl BusEvent for RetryEvent {
    type Kind = RetryEventKind;

    fn entity_name(&self) -> &str {
        &self.retry_name
    }

    fn kind(&self) -> RetryEventKind {
        self.kind
    }
}

/// Attempt-loop controller.
pub struct Retry {
    name: String,
    config: RetryConfig,
    policy: chrono_machines::Policy,
    events: EventBus<RetryEvent>,
}

impl fmt::Debug for Retry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retry")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish()
    }
}

impl Retry {
    /// Create a retry controller.
    pub fn new(name: impl Into<String>, config: RetryConfig) -> Self {
        let policy = chrono_machines::Policy {
            max_attempts: config.max_attempts as _,
            base_delay_ms: config.initial_interval.as_millis() as u64,
            multiplier: config.backoff_multiplier,
            max_delay_ms: config.max_interval.as_millis() as u64,
        };
        Self {
            name: name.into(),
            config,
            policy,
            events: EventBus::new(),
        }
    }

    /// Retry name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration bound at creation.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Event bus for this retry.
    pub fn events(&self) -> &EventBus<RetryEvent> {
        &self.events
    }

    /// Backoff before attempt `attempt + 1`, never zero.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let millis = self
            .policy
            .calculate_delay(attempt as _, self.config.jitter_factor);
        Duration::from_millis(millis.max(1))
    }

    /// Run `f` under the attempt loop.
    pub fn call<T, E>(&self, f: impl FnMut() -> Result<T, E>) -> GuardResult<T, E>
    where
        T: 'static,
        E: 'static,
    {
        self.run(f, None)
    }

    /// Run `f` under the attempt loop, stopping between attempts once
    /// `cancel` is set. An attempt already in flight is never interrupted.
    pub fn call_cancellable<T, E>(
        &self,
        cancel: &CancelToken,
        f: impl FnMut() -> Result<T, E>,
    ) -> GuardResult<T, E>
    where
        T: 'static,
        E: 'static,
    {
        self.run(f, Some(cancel))
    }

    /// Wrap `f` so every invocation runs its own attempt loop.
    pub fn decorate<T, E>(
        self: &Arc<Self>,
        mut f: impl FnMut() -> Result<T, E>,
    ) -> impl FnMut() -> GuardResult<T, E>
    where
        T: 'static,
        E: 'static,
    {
        let retry = Arc::clone(self);
        move || retry.call(&mut f)
    }

    fn run<T, E>(
        &self,
        mut f: impl FnMut() -> Result<T, E>,
        cancel: Option<&CancelToken>,
    ) -> GuardResult<T, E>
    where
        T: 'static,
        E: 'static,
    {
        let mut attempt = 1u32;
        loop {
            match f() {
                Ok(value) => {
                    let flagged = self
                        .config
                        .retry_on_result
                        .as_ref()
                        .map(|p| p(&value))
                        .unwrap_or(false);
                    if flagged && attempt < self.config.max_attempts {
                        self.backoff(attempt, cancel);
                        attempt += 1;
                        continue;
                    }
                    // A flagged result that survives the last attempt is
                    // returned as-is; it is the caller's value to judge.
                    if attempt > 1 {
                        self.publish(RetryEventKind::Success, attempt, None);
                    }
                    return Ok(value);
                }
                Err(error) => {
                    let ignored = self
                        .config
                        .ignore_error
                        .as_ref()
                        .map(|p| p(&error))
                        .unwrap_or(false);
                    if ignored {
                        self.publish(RetryEventKind::IgnoredError, attempt, None);
                        return Err(GuardError::Execution(error));
                    }

                    let retryable = self
                        .config
                        .retry_on_error
                        .as_ref()
                        .map(|p| p(&error))
                        .unwrap_or(true);
                    let cancelled = cancel.map(CancelToken::is_cancelled).unwrap_or(false);

                    if retryable && !cancelled && attempt < self.config.max_attempts {
                        self.backoff(attempt, cancel);
                        attempt += 1;
                        continue;
                    }
                    if retryable && !cancelled {
                        self.publish(RetryEventKind::Error, attempt, None);
                        return Err(GuardError::RetriesExhausted {
                            name: self.name.clone(),
                            attempts: attempt,
                            last_error: error,
                        });
                    }
                    return Err(GuardError::Execution(error));
                }
            }
        }
    }

    fn backoff(&self, attempt: u32, cancel: Option<&CancelToken>) {
        let wait = self.backoff_for(attempt);
        self.publish(RetryEventKind::Retry, attempt, Some(wait));
        if cancel.map(CancelToken::is_cancelled).unwrap_or(false) {
            return;
        }
        std::thread::sleep(wait);
    }

    fn publish(&self, kind: RetryEventKind, attempts: u32, wait: Option<Duration>) {
        self.events
            .publish(RetryEvent::new(&self.name, kind, attempts, wait));
    }
}

impl NamedGuard for Retry {
    type Config = RetryConfig;

    fn with_config(name: &str, config: RetryConfig) -> Self {
        Self::new(name, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    fn quick_config() -> RetryConfig {
        RetryConfig::default()
            .with_max_attempts(3)
            .with_initial_interval(Duration::from_millis(5))
    }

    #[test]
    fn test_success_on_third_attempt() {
        let retry = Retry::new("test", quick_config());
        let attempts = AtomicU32::new(0);

        let start = Instant::now();
        let result = retry.call(|| {
            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err("transient")
            } else {
                Ok("recovered")
            }
        });

        assert_eq!(result.unwrap(), "recovered");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        // Two backoff delays of 5ms each.
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn test_exhaustion_wraps_last_error() {
        let retry = Retry::new("test", quick_config());

        let result = retry.call(|| Err::<(), _>("still down"));
        match result {
            Err(GuardError::RetriesExhausted {
                name,
                attempts,
                last_error,
            }) => {
                assert_eq!(name, "test");
                assert_eq!(attempts, 3);
                assert_eq!(last_error, "still down");
            }
            other => panic!("Expected RetriesExhausted, got {other:?}"),
        }
    }

    #[test]
    fn test_non_retryable_error_fails_fast() {
        let retry = Retry::new(
            "test",
            quick_config().retry_error_when(|e: &&str| e.contains("transient")),
        );
        let attempts = AtomicU32::new(0);

        let result = retry.call(|| {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>("permanent")
        });

        assert!(matches!(result, Err(GuardError::Execution("permanent"))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_ignored_error_publishes_and_returns() {
        let retry = Retry::new(
            "test",
            quick_config().ignore_error_when(|e: &&str| *e == "not found"),
        );
        let ignored = Arc::new(AtomicU32::new(0));

        let i = ignored.clone();
        retry
            .events()
            .on_kind(RetryEventKind::IgnoredError, move |_| {
                i.fetch_add(1, Ordering::SeqCst);
            });

        let result = retry.call(|| Err::<(), _>("not found"));
        assert!(matches!(result, Err(GuardError::Execution("not found"))));
        assert_eq!(ignored.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_retry_on_result_takes_backoff_path() {
        let retry = Retry::new(
            "test",
            quick_config().retry_result_when(|status: &u16| *status == 503),
        );
        let attempts = AtomicU32::new(0);

        let result = retry.call(|| {
            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 2 { Ok::<_, String>(503u16) } else { Ok(200) }
        });

        assert_eq!(result.unwrap(), 200);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_flagged_result_returned_after_exhaustion() {
        let retry = Retry::new(
            "test",
            quick_config().retry_result_when(|status: &u16| *status == 503),
        );
        let attempts = AtomicU32::new(0);

        let result = retry.call(|| {
            attempts.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(503u16)
        });

        assert_eq!(result.unwrap(), 503);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_exponential_backoff_grows() {
        let retry = Retry::new(
            "test",
            RetryConfig::default()
                .with_initial_interval(Duration::from_millis(100))
                .with_backoff_multiplier(2.0)
                .with_max_interval(Duration::from_millis(250)),
        );

        let first = retry.backoff_for(1);
        let second = retry.backoff_for(2);
        let third = retry.backoff_for(3);

        assert_eq!(first, Duration::from_millis(100));
        assert_eq!(second, Duration::from_millis(200));
        // Capped by max_interval.
        assert_eq!(third, Duration::from_millis(250));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let retry = Retry::new(
            "test",
            RetryConfig::default()
                .with_initial_interval(Duration::from_millis(1000))
                .with_jitter_factor(0.25),
        );

        for _ in 0..50 {
            let wait = retry.backoff_for(1);
            assert!(wait >= Duration::from_millis(750), "wait {wait:?}");
            assert!(wait <= Duration::from_millis(1000), "wait {wait:?}");
        }
    }

    #[test]
    fn test_retry_events_count_backoffs() {
        let retry = Retry::new("test", quick_config());
        let retries = Arc::new(AtomicU32::new(0));
        let successes = Arc::new(AtomicU32::new(0));

        let r = retries.clone();
        retry.events().on_kind(RetryEventKind::Retry, move |event| {
            assert!(event.wait.is_some());
            r.fetch_add(1, Ordering::SeqCst);
        });
        let s = successes.clone();
        retry.events().on_kind(RetryEventKind::Success, move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });

        let attempts = AtomicU32::new(0);
        let result = retry.call(|| {
            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 { Err("transient") } else { Ok(()) }
        });

        assert!(result.is_ok());
        assert_eq!(retries.load(Ordering::SeqCst), 2);
        assert_eq!(successes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancellation_between_attempts() {
        let retry = Retry::new("test", quick_config().with_max_attempts(10));
        let cancel = CancelToken::new();
        let attempts = AtomicU32::new(0);

        let cancel_clone = cancel.clone();
        let result = retry.call_cancellable(&cancel, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if n == 2 {
                cancel_clone.cancel();
            }
            Err::<(), _>("transient")
        });

        // The loop stopped as soon as the flag was observed, well before the
        // attempt budget ran out.
        assert!(matches!(result, Err(GuardError::Execution("transient"))));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_first_attempt_success_publishes_nothing() {
        let retry = Retry::new("test", quick_config());
        let events = Arc::new(AtomicU32::new(0));

        let e = events.clone();
        retry.events().on_event(move |_| {
            e.fetch_add(1, Ordering::SeqCst);
        });

        assert!(retry.call(|| Ok::<_, String>(())).is_ok());
        assert_eq!(events.load(Ordering::SeqCst), 0);
    }
}
