//! Error types for resilience policies

use crate::circuit_breaker::CircuitState;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Unified error type for all resilience policies.
///
/// Policy rejections carry the name of the policy that produced them; the
/// underlying operation's error travels unchanged in [`PolicyError::Inner`].
#[derive(Debug)]
pub enum PolicyError<E> {
    /// The circuit breaker denied the call (open, forced-open, or half-open
    /// trial budget exhausted).
    CallNotPermitted { policy: Arc<str>, state: CircuitState },
    /// The rate limiter could not grant a permit within its timeout.
    RequestNotPermitted { policy: Arc<str>, timeout: Duration },
    /// The bulkhead was at capacity for the whole wait budget.
    BulkheadFull { policy: Arc<str>, max_concurrent: usize },
    /// All retry attempts were exhausted; carries the last underlying error.
    RetriesExhausted { policy: Arc<str>, attempts: usize, last: E },
    /// The operation exceeded the time limiter's deadline.
    TimedOut { policy: Arc<str>, elapsed: Duration, limit: Duration },
    /// The underlying operation failed.
    Inner(E),
}

impl<E: Clone> Clone for PolicyError<E> {
    fn clone(&self) -> Self {
        match self {
            Self::CallNotPermitted { policy, state } => {
                Self::CallNotPermitted { policy: policy.clone(), state: *state }
            }
            Self::RequestNotPermitted { policy, timeout } => {
                Self::RequestNotPermitted { policy: policy.clone(), timeout: *timeout }
            }
            Self::BulkheadFull { policy, max_concurrent } => {
                Self::BulkheadFull { policy: policy.clone(), max_concurrent: *max_concurrent }
            }
            Self::RetriesExhausted { policy, attempts, last } => Self::RetriesExhausted {
                policy: policy.clone(),
                attempts: *attempts,
                last: last.clone(),
            },
            Self::TimedOut { policy, elapsed, limit } => {
                Self::TimedOut { policy: policy.clone(), elapsed: *elapsed, limit: *limit }
            }
            Self::Inner(e) => Self::Inner(e.clone()),
        }
    }
}

impl<E: PartialEq> PartialEq for PolicyError<E> {
    fn eq(&self, other: &Self) -> bool {
        use PolicyError::*;
        match (self, other) {
            (
                CallNotPermitted { policy: p1, state: s1 },
                CallNotPermitted { policy: p2, state: s2 },
            ) => p1 == p2 && s1 == s2,
            (
                RequestNotPermitted { policy: p1, timeout: t1 },
                RequestNotPermitted { policy: p2, timeout: t2 },
            ) => p1 == p2 && t1 == t2,
            (
                BulkheadFull { policy: p1, max_concurrent: m1 },
                BulkheadFull { policy: p2, max_concurrent: m2 },
            ) => p1 == p2 && m1 == m2,
            (
                RetriesExhausted { policy: p1, attempts: a1, last: l1 },
                RetriesExhausted { policy: p2, attempts: a2, last: l2 },
            ) => p1 == p2 && a1 == a2 && l1 == l2,
            (
                TimedOut { policy: p1, elapsed: e1, limit: l1 },
                TimedOut { policy: p2, elapsed: e2, limit: l2 },
            ) => p1 == p2 && e1 == e2 && l1 == l2,
            (Inner(e1), Inner(e2)) => e1 == e2,
            _ => false,
        }
    }
}

impl<E: Eq> Eq for PolicyError<E> {}

impl<E: fmt::Display> fmt::Display for PolicyError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CallNotPermitted { policy, state } => {
                write!(f, "circuit breaker '{}' does not permit calls (state: {})", policy, state)
            }
            Self::RequestNotPermitted { policy, timeout } => {
                write!(f, "rate limiter '{}' denied the request within {:?}", policy, timeout)
            }
            Self::BulkheadFull { policy, max_concurrent } => {
                write!(f, "bulkhead '{}' is full ({} concurrent calls)", policy, max_concurrent)
            }
            Self::RetriesExhausted { policy, attempts, last } => {
                write!(
                    f,
                    "retry '{}' exhausted after {} attempts, last error: {}",
                    policy, attempts, last
                )
            }
            Self::TimedOut { policy, elapsed, limit } => {
                write!(
                    f,
                    "time limiter '{}' cut the call after {:?} (limit: {:?})",
                    policy, elapsed, limit
                )
            }
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for PolicyError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::RetriesExhausted { last, .. } => Some(last),
            _ => None,
        }
    }
}

impl<E> PolicyError<E> {
    /// Check if this error is a circuit-breaker rejection.
    pub fn is_call_not_permitted(&self) -> bool {
        matches!(self, Self::CallNotPermitted { .. })
    }

    /// Check if this error is a rate-limiter rejection.
    pub fn is_request_not_permitted(&self) -> bool {
        matches!(self, Self::RequestNotPermitted { .. })
    }

    /// Check if this error is a bulkhead rejection.
    pub fn is_bulkhead_full(&self) -> bool {
        matches!(self, Self::BulkheadFull { .. })
    }

    /// Check if this error is a retry exhaustion.
    pub fn is_retries_exhausted(&self) -> bool {
        matches!(self, Self::RetriesExhausted { .. })
    }

    /// Check if this error is a time-limiter deadline.
    pub fn is_timed_out(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }

    /// Check if this error wraps an underlying operation error.
    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }

    /// Get the underlying error if this is an `Inner` variant.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Borrow the underlying error, whether propagated directly or carried by
    /// an exhausted retry.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::RetriesExhausted { last, .. } => Some(last),
            _ => None,
        }
    }

    /// Name of the policy that produced this rejection, if any.
    pub fn policy(&self) -> Option<&str> {
        match self {
            Self::CallNotPermitted { policy, .. }
            | Self::RequestNotPermitted { policy, .. }
            | Self::BulkheadFull { policy, .. }
            | Self::RetriesExhausted { policy, .. }
            | Self::TimedOut { policy, .. } => Some(policy),
            Self::Inner(_) => None,
        }
    }
}

/// Errors returned when validating policy configuration.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
    #[error("{field} must be within ({min}, {max}] (got {value})")]
    RateOutOfRange { field: &'static str, value: f32, min: f32, max: f32 },
    #[error("{field} of {requested:?} exceeds the maximum allowed {limit:?}")]
    ExceedsMaximum { field: &'static str, requested: Duration, limit: Duration },
    #[error("{field} of {requested:?} is below the minimum supported {min:?}")]
    BelowMinimum { field: &'static str, requested: Duration, min: Duration },
    #[error("{field} must not exceed {max} (got {value})")]
    TooLarge { field: &'static str, value: u64, max: u64 },
}
