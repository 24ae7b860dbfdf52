//! Tower middleware adapters.
//!
//! `Layer`/`Service` pairs for the circuit breaker and the rate limiter, so
//! either policy can sit in an ordinary tower stack. The service error type
//! becomes [`PolicyError<S::Error>`]: rejections surface as policy variants,
//! inner service errors travel in `Inner`.

use crate::circuit_breaker::{CircuitBreaker, PermitGuard};
use crate::error::PolicyError;
use crate::rate_limiter::RateLimiter;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;
use tower_layer::Layer;
use tower_service::Service;

/// A layer that guards a service with a [`CircuitBreaker`].
#[derive(Clone, Debug)]
pub struct CircuitBreakerLayer {
    breaker: CircuitBreaker,
}

impl CircuitBreakerLayer {
    pub fn new(breaker: CircuitBreaker) -> Self {
        Self { breaker }
    }
}

impl<S> Layer<S> for CircuitBreakerLayer {
    type Service = CircuitBreakerService<S>;

    fn layer(&self, service: S) -> Self::Service {
        CircuitBreakerService { inner: service, breaker: self.breaker.clone() }
    }
}

/// Middleware service guarded by a circuit breaker.
#[derive(Clone, Debug)]
pub struct CircuitBreakerService<S> {
    inner: S,
    breaker: CircuitBreaker,
}

impl<S, Req> Service<Req> for CircuitBreakerService<S>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: std::error::Error + Send + Sync + 'static,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = PolicyError<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(PolicyError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let breaker = self.breaker.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let Some(permit) = breaker.try_acquire() else {
                return Err(breaker.rejection());
            };
            let mut guard = PermitGuard::new(breaker.clone(), permit);
            let start = Instant::now();
            match inner.call(req).await {
                Ok(response) => {
                    breaker.on_success(guard.disarm(), start.elapsed());
                    Ok(response)
                }
                Err(error) => {
                    breaker.on_error(guard.disarm(), start.elapsed(), &error);
                    Err(PolicyError::Inner(error))
                }
            }
        })
    }
}

/// A layer that throttles a service with a [`RateLimiter`].
#[derive(Clone, Debug)]
pub struct RateLimiterLayer {
    limiter: RateLimiter,
}

impl RateLimiterLayer {
    pub fn new(limiter: RateLimiter) -> Self {
        Self { limiter }
    }
}

impl<S> Layer<S> for RateLimiterLayer {
    type Service = RateLimiterService<S>;

    fn layer(&self, service: S) -> Self::Service {
        RateLimiterService { inner: service, limiter: self.limiter.clone() }
    }
}

/// Middleware service throttled by a rate limiter.
#[derive(Clone, Debug)]
pub struct RateLimiterService<S> {
    inner: S,
    limiter: RateLimiter,
}

impl<S, Req> Service<Req> for RateLimiterService<S>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: std::error::Error + Send + Sync + 'static,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = PolicyError<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(PolicyError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let limiter = self.limiter.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            if !limiter.acquire().await {
                return Err(limiter.rejection());
            }
            inner.call(req).await.map_err(PolicyError::Inner)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{CircuitBreakerConfig, CircuitState};
    use crate::rate_limiter::RateLimiterConfig;
    use crate::window::WindowType;
    use std::fmt;
    use std::time::Duration;
    use tower::{service_fn, ServiceExt};

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(String);

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "TestError: {}", self.0)
        }
    }

    impl std::error::Error for TestError {}

    fn echo() -> impl Service<i32, Response = i32, Error = TestError, Future: Send> + Clone + Send + 'static
    {
        service_fn(|req: i32| async move {
            if req < 0 {
                Err(TestError("negative".to_owned()))
            } else {
                Ok(req)
            }
        })
    }

    #[tokio::test]
    async fn breaker_layer_passes_successes_through() {
        let breaker = CircuitBreaker::with_defaults("svc");
        let service = CircuitBreakerLayer::new(breaker.clone()).layer(echo());

        let response = service.oneshot(7).await;
        assert_eq!(response.unwrap(), 7);
        assert_eq!(breaker.metrics().total_calls, 1);
    }

    #[tokio::test]
    async fn breaker_layer_opens_and_rejects() {
        let config = CircuitBreakerConfig::builder()
            .sliding_window(WindowType::CountBased, 2)
            .minimum_number_of_calls(2)
            .build()
            .expect("valid config");
        let breaker = CircuitBreaker::new("svc", config);
        let layer = CircuitBreakerLayer::new(breaker.clone());

        for _ in 0..2 {
            let result = layer.layer(echo()).oneshot(-1).await;
            assert!(matches!(result, Err(PolicyError::Inner(_))));
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let rejected = layer.layer(echo()).oneshot(7).await;
        assert!(matches!(rejected, Err(e) if e.is_call_not_permitted()));
    }

    #[tokio::test]
    async fn rate_limiter_layer_throttles() {
        let config = RateLimiterConfig::builder()
            .limit_for_period(1)
            .limit_refresh_period(Duration::from_secs(1))
            .timeout_duration(Duration::ZERO)
            .build()
            .expect("valid config");
        let limiter = RateLimiter::new("svc", config);
        let layer = RateLimiterLayer::new(limiter);

        let first = layer.layer(echo()).oneshot(1).await;
        assert_eq!(first.unwrap(), 1);

        let second = layer.layer(echo()).oneshot(2).await;
        assert!(matches!(second, Err(e) if e.is_request_not_permitted()));
    }
}
