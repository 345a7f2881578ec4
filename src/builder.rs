//! Builder API for ergonomic circuit breaker configuration

use crate::circuit::{CircuitBreaker, CircuitBreakerConfig, SlidingWindowType};
use crate::clock::Clock;
use std::sync::Arc;
use std::time::Duration;

/// Fluent builder for [`CircuitBreaker`].
pub struct CircuitBreakerBuilder {
    name: String,
    config: CircuitBreakerConfig,
    clock: Option<Arc<dyn Clock>>,
}

impl CircuitBreakerBuilder {
    /// Start building a breaker with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: CircuitBreakerConfig::default(),
            clock: None,
        }
    }

    /// Failure percentage at or above which the breaker opens.
    pub fn failure_rate_threshold(mut self, percent: f32) -> Self {
        self.config.failure_rate_threshold = percent.clamp(0.0, 100.0);
        self
    }

    /// Slow-call percentage at or above which the breaker opens.
    pub fn slow_call_rate_threshold(mut self, percent: f32) -> Self {
        self.config.slow_call_rate_threshold = percent.clamp(0.0, 100.0);
        self
    }

    /// Calls at least this long count as slow.
    pub fn slow_call_duration_threshold(mut self, threshold: Duration) -> Self {
        self.config.slow_call_duration_threshold = threshold;
        self
    }

    /// Use a window over the last `calls` calls.
    pub fn count_based_window(mut self, calls: u32) -> Self {
        self.config.sliding_window_type = SlidingWindowType::CountBased;
        self.config.sliding_window_size = calls;
        self
    }

    /// Use a window over the last `seconds` seconds.
    pub fn time_based_window(mut self, seconds: u32) -> Self {
        self.config.sliding_window_type = SlidingWindowType::TimeBased;
        self.config.sliding_window_size = seconds;
        self
    }

    /// Outcomes required before rates are evaluated.
    pub fn minimum_number_of_calls(mut self, calls: u32) -> Self {
        self.config.minimum_number_of_calls = calls;
        self
    }

    /// Trial calls admitted while half-open.
    pub fn permitted_calls_in_half_open_state(mut self, calls: u32) -> Self {
        self.config.permitted_number_of_calls_in_half_open_state = calls.max(1);
        self
    }

    /// How long the breaker stays open before probing.
    pub fn wait_duration_in_open_state(mut self, wait: Duration) -> Self {
        self.config.wait_duration_in_open_state = wait;
        self
    }

    /// Jitter factor applied to the open wait (0.0 = none, 1.0 = full).
    pub fn wait_jitter_factor(mut self, factor: f64) -> Self {
        self.config.wait_jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    /// Move to half-open automatically once the open wait elapses.
    pub fn automatic_transition_from_open_to_half_open(mut self) -> Self {
        self.config.automatic_transition_from_open_to_half_open = true;
        self
    }

    /// Count only errors matching `predicate` as failures. The value handed
    /// to the predicate downcasts to the caller's error type.
    pub fn record_error_when<E: 'static>(
        mut self,
        predicate: impl Fn(&E) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.config.record_error = Some(Arc::new(move |any| {
            any.downcast_ref::<E>().map(&predicate).unwrap_or(true)
        }));
        self
    }

    /// Exclude errors matching `predicate` from the window entirely.
    pub fn ignore_error_when<E: 'static>(
        mut self,
        predicate: impl Fn(&E) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.config.ignore_error = Some(Arc::new(move |any| {
            any.downcast_ref::<E>().map(&predicate).unwrap_or(false)
        }));
        self
    }

    /// Use an explicit clock (tests drive a [`crate::clock::ManualClock`]).
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Build the breaker.
    pub fn build(self) -> CircuitBreaker {
        match self.clock {
            Some(clock) => CircuitBreaker::with_clock(self.name, self.config, clock),
            None => CircuitBreaker::new(self.name, self.config),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::State;

    #[test]
    fn test_builder_defaults() {
        let breaker = CircuitBreakerBuilder::new("test").build();
        assert_eq!(breaker.state(), State::Closed);
        assert_eq!(breaker.config().failure_rate_threshold, 50.0);
    }

    #[test]
    fn test_builder_custom_config() {
        let breaker = CircuitBreaker::builder("test")
            .failure_rate_threshold(25.0)
            .count_based_window(10)
            .minimum_number_of_calls(5)
            .permitted_calls_in_half_open_state(3)
            .wait_duration_in_open_state(Duration::from_secs(30))
            .automatic_transition_from_open_to_half_open()
            .build();

        let config = breaker.config();
        assert_eq!(config.failure_rate_threshold, 25.0);
        assert_eq!(config.sliding_window_size, 10);
        assert_eq!(config.minimum_number_of_calls, 5);
        assert_eq!(config.permitted_number_of_calls_in_half_open_state, 3);
        assert!(config.automatic_transition_from_open_to_half_open);
    }

    #[test]
    fn test_builder_record_predicate() {
        let breaker = CircuitBreaker::builder("test")
            .count_based_window(2)
            .minimum_number_of_calls(2)
            .record_error_when(|e: &&str| e.contains("server"))
            .build();

        for _ in 0..5 {
            let _ = breaker.call(|| Err::<(), _>("client"));
        }
        assert_eq!(breaker.state(), State::Closed);

        let _ = breaker.call(|| Err::<(), _>("server 1"));
        let _ = breaker.call(|| Err::<(), _>("server 2"));
        assert_eq!(breaker.state(), State::Open);
    }

    #[test]
    fn test_threshold_clamping() {
        let breaker = CircuitBreaker::builder("test")
            .failure_rate_threshold(250.0)
            .wait_jitter_factor(7.0)
            .build();

        assert_eq!(breaker.config().failure_rate_threshold, 100.0);
        assert_eq!(breaker.config().wait_jitter_factor, 1.0);
    }
}
