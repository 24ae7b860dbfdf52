//! Convenient re-exports for common Breakwater types.
pub use crate::{
    Backoff, Bulkhead, BulkheadConfig, BulkheadRegistry, CircuitBreaker, CircuitBreakerConfig,
    CircuitBreakerLayer, CircuitBreakerRegistry, CircuitState, ConfigError, Event, EventBus,
    EventKind, Jitter, PolicyError, PolicyStack, PolicyStackBuilder, RateLimiter,
    RateLimiterConfig, RateLimiterLayer, RateLimiterRegistry, Registry, RegistryEvent,
    RetryPolicy, RetryPolicyBuilder, TimeLimiter, WindowType,
};
