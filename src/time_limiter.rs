//! Deadline wrapper for asynchronously executing work
//!
//! A time limiter bounds how long a caller waits on a [`TaskHandle`]. Work
//! finishing inside the deadline propagates its outcome unchanged; when the
//! deadline elapses first the caller gets a `Timeout` condition and the task
//! receives a best-effort cancellation signal; the signal stops the
//! waiting, not necessarily the work.

use crate::errors::{GuardError, GuardResult};
use crate::events::{BusEvent, EventBus};
use crate::pool::{TaskHandle, ThreadPoolBulkhead, resolve};
use crate::registry::NamedGuard;
use std::time::{Duration, SystemTime};

/// Time limiter configuration.
#[derive(Debug, Clone, Copy)]
pub struct TimeLimiterConfig {
    /// Deadline applied to each wrapped wait.
    pub timeout_duration: Duration,
    /// Whether expiry also signals cancellation to the running work.
    pub cancel_running_work: bool,
}

impl Default for TimeLimiterConfig {
    fn default() -> Self {
        Self {
            timeout_duration: Duration::from_secs(1),
            cancel_running_work: true,
        }
    }
}

impl TimeLimiterConfig {
    /// Set the deadline.
    pub fn with_timeout_duration(mut self, timeout: Duration) -> Self {
        self.timeout_duration = timeout;
        self
    }

    /// Control whether expiry cancels the underlying work.
    pub fn with_cancel_running_work(mut self, cancel: bool) -> Self {
        self.cancel_running_work = cancel;
        self
    }
}

/// Kind tag for time limiter events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeLimiterEventKind {
    /// The wrapped work finished in time and succeeded.
    Success,
    /// The wrapped work finished in time but failed.
    Error,
    /// The deadline elapsed first.
    Timeout,
}

/// Event published by a time limiter.
#[derive(Debug, Clone)]
pub struct TimeLimiterEvent {
    /// Name of the publishing limiter.
    pub limiter_name: String,
    /// Wall-clock time the event was created.
    pub created_at: SystemTime,
    /// What happened.
    pub kind: TimeLimiterEventKind,
}

impl TimeLimiterEvent {
    fn new(limiter_name: &str, kind: TimeLimiterEventKind) -> Self {
        Self {
            limiter_name: limiter_name.to_string(),
            created_at: SystemTime::now(),
            kind,
        }
    }
}

impl BusEvent for TimeLimiterEvent {
    type Kind = TimeLimiterEventKind;

    fn entity_name(&self) -> &str {
        &self.limiter_name
    }

    fn kind(&self) -> TimeLimiterEventKind {
        self.kind
    }
}

/// Deadline-bound wait over asynchronous work.
#[derive(Debug)]
pub struct TimeLimiter {
    name: String,
    config: TimeLimiterConfig,
    events: EventBus<TimeLimiterEvent>,
}

impl TimeLimiter {
    /// Create a time limiter.
    pub fn new(name: impl Into<String>, config: TimeLimiterConfig) -> Self {
        Self {
            name: name.into(),
            config,
            events: EventBus::new(),
        }
    }

    /// Limiter name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration bound at creation.
    pub fn config(&self) -> &TimeLimiterConfig {
        &self.config
    }

    /// Event bus for this limiter.
    pub fn events(&self) -> &EventBus<TimeLimiterEvent> {
        &self.events
    }

    /// Wait on `handle` up to the configured deadline.
    pub fn limit<T, E>(&self, handle: TaskHandle<T, E>) -> GuardResult<T, E> {
        let timeout = self.config.timeout_duration;
        match handle.recv_within(timeout) {
            Some(outcome) => match resolve(outcome) {
                Ok(value) => {
                    self.publish(TimeLimiterEventKind::Success);
                    Ok(value)
                }
                Err(error) => {
                    self.publish(TimeLimiterEventKind::Error);
                    Err(error)
                }
            },
            None => {
                if self.config.cancel_running_work {
                    handle.cancel();
                }
                tracing::debug!(
                    limiter = %self.name,
                    task = handle.entity_name(),
                    ?timeout,
                    "deadline elapsed before task completion"
                );
                self.publish(TimeLimiterEventKind::Timeout);
                Err(GuardError::Timeout {
                    name: self.name.clone(),
                    timeout,
                })
            }
        }
    }

    /// Submit `f` to `pool` and bound the wait on its completion.
    pub fn execute<T, E>(
        &self,
        pool: &ThreadPoolBulkhead,
        f: impl FnOnce() -> Result<T, E> + Send + 'static,
    ) -> GuardResult<T, E>
    where
        T: Send + 'static,
        E: Send + 'static,
    {
        let handle = pool.submit(f)?;
        self.limit(handle)
    }

    fn publish(&self, kind: TimeLimiterEventKind) {
        self.events.publish(TimeLimiterEvent::new(&self.name, kind));
    }
}

impl NamedGuard for TimeLimiter {
    type Config = TimeLimiterConfig;

    fn with_config(name: &str, config: TimeLimiterConfig) -> Self {
        Self::new(name, config)
    }
}
