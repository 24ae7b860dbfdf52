//! Time limiter: a deadline on async operations.
//!
//! Wraps an operation with `tokio::time::timeout`; when the deadline elapses
//! the inner future is dropped (not forcibly aborted), so cancellation-unsafe
//! work may leave partial state behind. Elapsed time is measured from just
//! before the operation is invoked and can slightly exceed the configured
//! limit due to scheduling overhead.

use crate::error::{ConfigError, PolicyError};
use crate::events::{EventBus, EventKind, TimeLimiterEvent};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Maximum allowed deadline (30 days); guards accidental `u64::MAX`-style
/// configuration while still permitting long jobs.
pub const MAX_TIME_LIMIT: Duration = Duration::from_secs(30 * 24 * 60 * 60);

#[derive(Clone)]
pub struct TimeLimiter {
    name: Arc<str>,
    limit: Option<Duration>,
    bus: EventBus,
}

impl fmt::Debug for TimeLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeLimiter")
            .field("name", &self.name)
            .field("limit", &self.limit)
            .finish()
    }
}

impl TimeLimiter {
    pub fn new(name: impl Into<Arc<str>>, limit: Duration) -> Result<Self, ConfigError> {
        if limit.is_zero() {
            return Err(ConfigError::Zero { field: "time_limit" });
        }
        if limit > MAX_TIME_LIMIT {
            return Err(ConfigError::ExceedsMaximum {
                field: "time_limit",
                requested: limit,
                limit: MAX_TIME_LIMIT,
            });
        }
        let name = name.into();
        Ok(Self { bus: EventBus::new(name.clone()), name, limit: Some(limit) })
    }

    /// Limiter with no deadline; used as the composition-stack passthrough.
    pub fn unbounded(name: impl Into<Arc<str>>) -> Self {
        let name = name.into();
        Self { bus: EventBus::new(name.clone()), name, limit: None }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    /// Configured deadline, if any.
    pub fn limit(&self) -> Option<Duration> {
        self.limit
    }

    /// Run the operation under the deadline.
    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, PolicyError<E>>
    where
        T: Send,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, PolicyError<E>>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        let Some(limit) = self.limit else {
            return operation().await;
        };
        let start = Instant::now();
        match tokio::time::timeout(limit, operation()).await {
            Ok(result) => result,
            Err(_) => {
                let elapsed = start.elapsed();
                tracing::warn!(
                    policy = %self.name,
                    limit_ms = limit.as_millis() as u64,
                    "operation exceeded its deadline"
                );
                self.bus.emit(EventKind::TimeLimiter(TimeLimiterEvent::Timeout { limit }));
                Err(PolicyError::TimedOut { policy: self.name.clone(), elapsed, limit })
            }
        }
    }
}
