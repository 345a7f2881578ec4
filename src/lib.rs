//! GuardMachines - composable fault-tolerance guards
//!
//! This crate provides a set of guards that wrap an arbitrary unit of work
//! and protect callers from cascading failure, overload and unbounded
//! latency:
//! - Circuit breaker with sliding-window failure and slow-call rates
//! - Semaphore bulkhead and thread-pool bulkhead for concurrency limiting
//! - Permit-cycle rate limiter
//! - Retry controller with backoff and jitter
//! - Deadline-bound time limiter
//!
//! Guards are shared: many threads invoke the same named instance
//! concurrently. Admission decisions, outcome recording and state
//! transitions are atomic; no guard holds a lock while caller work runs.
//! Named instances live in a [`Registry`], and every guard publishes
//! immutable events on its own [`EventBus`] for observers that must not
//! affect the call path.
//!
//! # Example
//!
//! ```rust
//! use guard_machines::CircuitBreaker;
//!
//! let breaker = CircuitBreaker::builder("payment_api")
//!     .failure_rate_threshold(50.0)
//!     .count_based_window(10)
//!     .minimum_number_of_calls(4)
//!     .build();
//!
//! let result = breaker.call(|| {
//!     // Your service call here
//!     Ok::<_, String>("success")
//! });
//! assert!(result.is_ok());
//!
//! if !breaker.try_acquire_permission() {
//!     println!("circuit is open, skipping call");
//! }
//! ```

pub mod builder;
pub mod bulkhead;
pub mod circuit;
pub mod clock;
pub mod errors;
pub mod events;
pub mod metrics;
pub mod pool;
pub mod rate_limiter;
pub mod registry;
pub mod retry;
pub mod time_limiter;

pub use builder::CircuitBreakerBuilder;
pub use bulkhead::{Bulkhead, BulkheadConfig, BulkheadEvent, BulkheadEventKind, BulkheadPermit};
pub use circuit::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerEvent, CircuitBreakerEventKind,
    CircuitBreakerMetrics, CircuitBreakerPayload, FallbackContext, SlidingWindowType, State,
};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use errors::{GuardError, GuardResult};
pub use events::{BusEvent, EventBus};
pub use metrics::{NO_RATE, Outcome, SlidingWindow, Snapshot};
pub use pool::{
    CancelToken, TaskHandle, ThreadPoolBulkhead, ThreadPoolBulkheadConfig,
};
pub use rate_limiter::{
    RateLimiter, RateLimiterConfig, RateLimiterEvent, RateLimiterEventKind,
};
pub use registry::{NamedGuard, Registry, RegistryEvent, RegistryEventKind};
pub use retry::{Retry, RetryConfig, RetryEvent, RetryEventKind};
pub use time_limiter::{TimeLimiter, TimeLimiterConfig, TimeLimiterEvent, TimeLimiterEventKind};

/// Registry of named circuit breakers.
pub type CircuitBreakerRegistry = Registry<CircuitBreaker>;
/// Registry of named semaphore bulkheads.
pub type BulkheadRegistry = Registry<Bulkhead>;
/// Registry of named thread-pool bulkheads.
pub type ThreadPoolBulkheadRegistry = Registry<ThreadPoolBulkhead>;
/// Registry of named rate limiters.
pub type RateLimiterRegistry = Registry<RateLimiter>;
/// Registry of named retry controllers.
pub type RetryRegistry = Registry<Retry>;
/// Registry of named time limiters.
pub type TimeLimiterRegistry = Registry<TimeLimiter>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_registry_aliases_share_config() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            sliding_window_size: 8,
            ..CircuitBreakerConfig::default()
        });

        let breaker = registry.get_or_create("checkout");
        assert_eq!(breaker.config().sliding_window_size, 8);
        assert_eq!(breaker.name(), "checkout");
    }

    #[test]
    fn test_guards_compose_around_one_call() {
        let retry = Arc::new(Retry::new(
            "compose-retry",
            RetryConfig::default()
                .with_max_attempts(3)
                .with_initial_interval(Duration::from_millis(1)),
        ));
        let bulkhead = Arc::new(Bulkhead::new(
            "compose-bh",
            BulkheadConfig::default().with_max_concurrent_calls(2),
        ));
        let breaker = Arc::new(CircuitBreaker::builder("compose-cb").build());

        let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let calls_clone = calls.clone();
        let breaker_clone = Arc::clone(&breaker);
        let bulkhead_clone = Arc::clone(&bulkhead);

        // Retry outermost, then bulkhead, then breaker, then the work.
        let result = retry.call(move || {
            bulkhead_clone
                .call(|| {
                    breaker_clone.call(|| {
                        let n = calls_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                        if n < 2 { Err("warming up") } else { Ok("ready") }
                    })
                })
                .map_err(|_| "bulkhead or inner failure")
        });

        assert_eq!(result.unwrap(), "ready");
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}
