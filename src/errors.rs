//! Error types for guard operations
//!
//! Admission failures are the primary output of a guard and must stay
//! distinguishable from the wrapped work's own failure, so every variant
//! except `Execution` identifies the guard that denied the call.

use crate::circuit::State;
use std::time::Duration;
use thiserror::Error;

/// Result alias for guarded calls.
pub type GuardResult<T, E> = Result<T, GuardError<E>>;

/// Errors surfaced by a guarded call.
///
/// `E` is the error type of the wrapped work; it only appears in the
/// `Execution` and `RetriesExhausted` variants.
#[derive(Debug, Error)]
pub enum GuardError<E> {
    /// The circuit breaker denied admission.
    #[error("circuit breaker '{name}' does not permit calls in state {state}")]
    CallNotPermitted {
        /// Name of the denying breaker.
        name: String,
        /// State the breaker was in when it denied the call.
        state: State,
    },

    /// The bulkhead (semaphore- or pool-based) is at capacity.
    #[error("bulkhead '{name}' is full (limit: {limit})")]
    BulkheadFull {
        /// Name of the saturated bulkhead.
        name: String,
        /// Configured concurrency or queue limit.
        limit: usize,
    },

    /// The rate limiter's permit cycle was exhausted and the wait timed out.
    #[error("rate limiter '{name}' did not grant a permission within {timeout:?}")]
    RateLimited {
        /// Name of the denying limiter.
        name: String,
        /// Configured acquisition timeout.
        timeout: Duration,
    },

    /// The deadline elapsed before the wrapped work completed.
    #[error("call guarded by '{name}' timed out after {timeout:?}")]
    Timeout {
        /// Name of the time limiter.
        name: String,
        /// The deadline that elapsed.
        timeout: Duration,
    },

    /// All retry attempts were consumed without success.
    #[error("retry '{name}' exhausted all {attempts} attempts")]
    RetriesExhausted {
        /// Name of the retry controller.
        name: String,
        /// Total attempts made, including the first call.
        attempts: u32,
        /// The failure observed on the final attempt.
        last_error: E,
    },

    /// The wrapped work itself failed; no guard interfered.
    #[error("guarded call failed: {0}")]
    Execution(E),
}

impl<E> GuardError<E> {
    /// True when a guard denied or cut short the call, as opposed to the
    /// wrapped work failing on its own.
    pub fn is_guard_denial(&self) -> bool {
        !matches!(self, GuardError::Execution(_))
    }

    /// Extract the wrapped work's error, if this condition carries one.
    pub fn into_inner(self) -> Option<E> {
        match self {
            GuardError::Execution(e) => Some(e),
            GuardError::RetriesExhausted { last_error, .. } => Some(last_error),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_names_the_guard() {
        let err: GuardError<String> = GuardError::BulkheadFull {
            name: "db".to_string(),
            limit: 4,
        };
        assert_eq!(err.to_string(), "bulkhead 'db' is full (limit: 4)");

        let err: GuardError<String> = GuardError::CallNotPermitted {
            name: "api".to_string(),
            state: State::Open,
        };
        assert!(err.to_string().contains("'api'"));
        assert!(err.to_string().contains("OPEN"));
    }

    #[test]
    fn test_guard_denial_classification() {
        let denial: GuardError<&str> = GuardError::RateLimited {
            name: "rl".to_string(),
            timeout: Duration::from_millis(10),
        };
        assert!(denial.is_guard_denial());

        let own: GuardError<&str> = GuardError::Execution("boom");
        assert!(!own.is_guard_denial());
        assert_eq!(own.into_inner(), Some("boom"));
    }

    #[test]
    fn test_retries_exhausted_keeps_last_error() {
        let err: GuardError<&str> = GuardError::RetriesExhausted {
            name: "r".to_string(),
            attempts: 3,
            last_error: "still down",
        };
        assert_eq!(err.into_inner(), Some("still down"));
    }
}
