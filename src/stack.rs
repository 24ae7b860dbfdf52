//! Composable policy stack.
//!
//! Layer order, outermost first: Retry → CircuitBreaker → RateLimiter →
//! Bulkhead → TimeLimiter → operation. Every layer defaults to a passthrough
//! (single attempt, disabled breaker, unlimited limiter/bulkhead, no
//! deadline), so a stack only enforces what was explicitly configured.

use crate::bulkhead::Bulkhead;
use crate::circuit_breaker::CircuitBreaker;
use crate::error::PolicyError;
use crate::rate_limiter::RateLimiter;
use crate::retry::RetryPolicy;
use crate::time_limiter::TimeLimiter;
use std::future::Future;
use std::sync::{Arc, Mutex};

pub struct PolicyStack<E> {
    retry: RetryPolicy<E>,
    circuit_breaker: CircuitBreaker,
    rate_limiter: RateLimiter,
    bulkhead: Bulkhead,
    time_limiter: TimeLimiter,
}

impl<E> Clone for PolicyStack<E> {
    fn clone(&self) -> Self {
        Self {
            retry: self.retry.clone(),
            circuit_breaker: self.circuit_breaker.clone(),
            rate_limiter: self.rate_limiter.clone(),
            bulkhead: self.bulkhead.clone(),
            time_limiter: self.time_limiter.clone(),
        }
    }
}

impl<E> std::fmt::Debug for PolicyStack<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyStack")
            .field("retry", &self.retry)
            .field("circuit_breaker", &self.circuit_breaker)
            .field("rate_limiter", &self.rate_limiter)
            .field("bulkhead", &self.bulkhead)
            .field("time_limiter", &self.time_limiter)
            .finish()
    }
}

impl<E> PolicyStack<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn builder(name: impl Into<Arc<str>>) -> PolicyStackBuilder<E> {
        PolicyStackBuilder::new(name)
    }

    pub fn retry(&self) -> &RetryPolicy<E> {
        &self.retry
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.circuit_breaker
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn bulkhead(&self) -> &Bulkhead {
        &self.bulkhead
    }

    pub fn time_limiter(&self) -> &TimeLimiter {
        &self.time_limiter
    }

    /// Run an operation through every configured layer.
    pub async fn execute<T, Fut, Op>(&self, operation: Op) -> Result<T, PolicyError<E>>
    where
        T: Send,
        Fut: Future<Output = Result<T, PolicyError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        // The operation is shared down the layers through a mutex so each
        // retry attempt can re-invoke it.
        let op = Arc::new(Mutex::new(operation));

        self.retry
            .execute(|| {
                let op = op.clone();
                let circuit_breaker = self.circuit_breaker.clone();
                let rate_limiter = self.rate_limiter.clone();
                let bulkhead = self.bulkhead.clone();
                let time_limiter = self.time_limiter.clone();
                async move {
                    circuit_breaker
                        .execute(|| {
                            let op = op.clone();
                            let rate_limiter = rate_limiter.clone();
                            let bulkhead = bulkhead.clone();
                            let time_limiter = time_limiter.clone();
                            async move {
                                rate_limiter
                                    .execute(|| {
                                        let op = op.clone();
                                        let bulkhead = bulkhead.clone();
                                        let time_limiter = time_limiter.clone();
                                        async move {
                                            bulkhead
                                                .execute(|| {
                                                    let op = op.clone();
                                                    let time_limiter = time_limiter.clone();
                                                    async move {
                                                        time_limiter
                                                            .execute(|| {
                                                                let mut op = op
                                                                    .lock()
                                                                    .expect("operation lock poisoned");
                                                                (*op)()
                                                            })
                                                            .await
                                                    }
                                                })
                                                .await
                                        }
                                    })
                                    .await
                            }
                        })
                        .await
                }
            })
            .await
    }
}

pub struct PolicyStackBuilder<E> {
    name: Arc<str>,
    retry: Option<RetryPolicy<E>>,
    circuit_breaker: Option<CircuitBreaker>,
    rate_limiter: Option<RateLimiter>,
    bulkhead: Option<Bulkhead>,
    time_limiter: Option<TimeLimiter>,
}

impl<E> PolicyStackBuilder<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            retry: None,
            circuit_breaker: None,
            rate_limiter: None,
            bulkhead: None,
            time_limiter: None,
        }
    }

    pub fn retry(mut self, policy: RetryPolicy<E>) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn circuit_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.circuit_breaker = Some(breaker);
        self
    }

    pub fn rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn bulkhead(mut self, bulkhead: Bulkhead) -> Self {
        self.bulkhead = Some(bulkhead);
        self
    }

    pub fn time_limiter(mut self, limiter: TimeLimiter) -> Self {
        self.time_limiter = Some(limiter);
        self
    }

    pub fn build(self) -> PolicyStack<E> {
        let name = self.name;
        let circuit_breaker = self.circuit_breaker.unwrap_or_else(|| {
            let breaker = CircuitBreaker::with_defaults(name.clone());
            breaker.disable();
            breaker
        });
        PolicyStack {
            retry: self.retry.unwrap_or_else(|| RetryPolicy::no_retry(name.clone())),
            circuit_breaker,
            rate_limiter: self
                .rate_limiter
                .unwrap_or_else(|| RateLimiter::unlimited(name.clone())),
            bulkhead: self.bulkhead.unwrap_or_else(|| Bulkhead::unlimited(name.clone())),
            time_limiter: self.time_limiter.unwrap_or_else(|| TimeLimiter::unbounded(name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError;

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "test error")
        }
    }

    impl std::error::Error for TestError {}

    #[tokio::test]
    async fn default_stack_is_a_passthrough() {
        let stack: PolicyStack<TestError> = PolicyStack::builder("passthrough").build();

        let ok = stack.execute(|| async { Ok::<_, PolicyError<TestError>>(42) }).await;
        assert_eq!(ok.unwrap(), 42);

        let err = stack
            .execute(|| async { Err::<(), _>(PolicyError::Inner(TestError)) })
            .await;
        assert!(matches!(err, Err(PolicyError::Inner(_))), "no layer interferes");
    }

    #[tokio::test]
    async fn breaker_rejections_bubble_out_unretried() {
        let stack: PolicyStack<TestError> = PolicyStack::builder("guarded")
            .circuit_breaker(CircuitBreaker::with_defaults("guarded"))
            .build();

        stack.circuit_breaker().force_open();

        let result = stack.execute(|| async { Ok::<_, PolicyError<TestError>>(1) }).await;
        assert!(matches!(result, Err(e) if e.is_call_not_permitted()));
    }
}
