#![forbid(unsafe_code)]

//! # Breakwater
//!
//! Fault-tolerance primitives for Rust: circuit breaker, rate limiter,
//! bulkhead, retry, and a time limiter, composable into a single stack.
//!
//! ## Features
//!
//! - **Circuit breaker** with count- or time-based sliding outcome windows,
//!   slow-call detection, and five states including `Disabled`/`ForcedOpen`
//! - **Rate limiter** dispensing a fixed permit budget per refresh cycle,
//!   with cooperative reservations and timed waiting
//! - **Bulkhead** bounding concurrent calls with RAII permits
//! - **Retry** with constant/linear/exponential backoff and jitter
//! - **Per-policy event bus** with bounded history and filtered subscribers
//! - **Adapters** for sync callables, futures, push streams, and tower stacks
//! - **Lock-free hot paths** built on atomics and `arc-swap`
//!
//! ## Quick Start
//!
//! ```rust
//! use breakwater::{Backoff, CircuitBreaker, Jitter, PolicyError, PolicyStack, RetryPolicy};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! async fn flaky_operation(
//!     attempts: Arc<AtomicUsize>,
//! ) -> Result<(), PolicyError<std::io::Error>> {
//!     if attempts.fetch_add(1, Ordering::Relaxed) < 2 {
//!         Err(PolicyError::Inner(std::io::Error::new(
//!             std::io::ErrorKind::Other,
//!             "transient failure",
//!         )))
//!     } else {
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), PolicyError<std::io::Error>> {
//!     let attempts = Arc::new(AtomicUsize::new(0));
//!
//!     let retry = RetryPolicy::builder("example")
//!         .max_attempts(3)
//!         .backoff(Backoff::exponential(Duration::from_millis(50)))
//!         .jitter(Jitter::Full)
//!         .build()
//!         .expect("valid retry policy");
//!
//!     let stack: PolicyStack<std::io::Error> = PolicyStack::builder("example")
//!         .retry(retry)
//!         .circuit_breaker(CircuitBreaker::with_defaults("example"))
//!         .build();
//!
//!     stack.execute(|| flaky_operation(attempts.clone())).await?;
//!     Ok(())
//! }
//! ```

mod backoff;
mod bulkhead;
mod circuit_breaker;
mod clock;
mod error;
mod events;
mod middleware;
mod rate_limiter;
mod registry;
mod retry;
mod sleeper;
mod stack;
mod streams;
mod time_limiter;
mod window;

// Re-exports
pub use backoff::{Backoff, Jitter, MAX_BACKOFF};
pub use bulkhead::{Bulkhead, BulkheadConfig, BulkheadMetrics, BulkheadPermit};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerConfigBuilder, CircuitBreakerMetrics,
    CircuitPermit, CircuitState, MAX_WAIT_IN_OPEN,
};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use error::{ConfigError, PolicyError};
pub use events::{
    BulkheadEvent, CircuitBreakerEvent, Event, EventBus, EventKind, RateLimiterEvent, RetryEvent,
    Subscription, TimeLimiterEvent, DEFAULT_EVENT_CAPACITY,
};
pub use middleware::{
    CircuitBreakerLayer, CircuitBreakerService, RateLimiterLayer, RateLimiterService,
};
pub use rate_limiter::{
    RateLimiter, RateLimiterConfig, RateLimiterConfigBuilder, RateLimiterMetrics,
    MAX_LIMIT_FOR_PERIOD, MIN_REFRESH_PERIOD,
};
pub use registry::{
    BulkheadRegistry, CircuitBreakerRegistry, RateLimiterRegistry, RegisteredPolicy, Registry,
    RegistryEvent, RegistrySubscription, RetryRegistry, TimeLimiterRegistry,
};
pub use retry::{RetryMetrics, RetryPolicy, RetryPolicyBuilder};
pub use sleeper::{RecordingSleeper, Sleeper, TokioSleeper};
pub use stack::{PolicyStack, PolicyStackBuilder};
pub use streams::{BulkheadStream, CircuitBreakerStream, RateLimiterStream, RetryStream};
pub use time_limiter::{TimeLimiter, MAX_TIME_LIMIT};
pub use window::{Outcome, SlidingWindow, WindowSnapshot, WindowType};

pub mod prelude;
