//! Retry policy: bounded re-execution with backoff and outcome classification.
//!
//! The inter-attempt wait is parked on the [`Sleeper`], so async callers
//! never block a worker thread and dropping the outer future cancels both the
//! pending wait and the in-flight attempt. Only `Inner` errors are candidates
//! for retry; rejections produced by sibling policies in a composed stack
//! pass through untouched.

use crate::backoff::{Backoff, Jitter};
use crate::error::{ConfigError, PolicyError};
use crate::events::{EventBus, EventKind, RetryEvent};
use crate::sleeper::{Sleeper, TokioSleeper};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Aggregate counters kept across the lifetime of a policy instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryMetrics {
    pub calls: u64,
    pub successful_without_retry: u64,
    pub successful_with_retry: u64,
    pub failed_without_retry: u64,
    pub failed_with_retry: u64,
}

#[derive(Debug, Default)]
struct Counters {
    calls: AtomicU64,
    successful_without_retry: AtomicU64,
    successful_with_retry: AtomicU64,
    failed_without_retry: AtomicU64,
    failed_with_retry: AtomicU64,
}

struct Shared<E> {
    name: Arc<str>,
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    retry_on: Arc<dyn Fn(&E) -> bool + Send + Sync>,
    sleeper: Arc<dyn Sleeper>,
    bus: EventBus,
    counters: Counters,
}

pub struct RetryPolicy<E> {
    shared: Arc<Shared<E>>,
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        Self { shared: self.shared.clone() }
    }
}

impl<E> std::fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("name", &self.shared.name)
            .field("max_attempts", &self.shared.max_attempts)
            .field("backoff", &self.shared.backoff)
            .field("jitter", &self.shared.jitter)
            .finish()
    }
}

impl<E> RetryPolicy<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn builder(name: impl Into<Arc<str>>) -> RetryPolicyBuilder<E> {
        RetryPolicyBuilder::new(name)
    }

    /// Single-attempt policy; used as the composition-stack passthrough.
    pub fn no_retry(name: impl Into<Arc<str>>) -> Self {
        RetryPolicyBuilder::new(name)
            .max_attempts(1)
            .build()
            .unwrap_or_else(|_| unreachable!("one attempt is always a valid budget"))
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn events(&self) -> &EventBus {
        &self.shared.bus
    }

    pub fn max_attempts(&self) -> usize {
        self.shared.max_attempts
    }

    /// Aggregate counter snapshot.
    pub fn metrics(&self) -> RetryMetrics {
        let c = &self.shared.counters;
        RetryMetrics {
            calls: c.calls.load(Ordering::Relaxed),
            successful_without_retry: c.successful_without_retry.load(Ordering::Relaxed),
            successful_with_retry: c.successful_with_retry.load(Ordering::Relaxed),
            failed_without_retry: c.failed_without_retry.load(Ordering::Relaxed),
            failed_with_retry: c.failed_with_retry.load(Ordering::Relaxed),
        }
    }

    /// Run `operation`, retrying `Inner` errors accepted by the retry
    /// predicate until the attempt budget runs out.
    pub async fn execute<T, Fut, Op>(&self, mut operation: Op) -> Result<T, PolicyError<E>>
    where
        T: Send,
        Fut: Future<Output = Result<T, PolicyError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        self.execute_classified(&mut operation, |_: &T| false).await
    }

    /// Like [`execute`], additionally re-trying `Ok` values accepted by
    /// `retry_on_result`. An exhausted budget returns the offending value.
    ///
    /// [`execute`]: RetryPolicy::execute
    pub async fn execute_classified<T, Fut, Op, R>(
        &self,
        mut operation: Op,
        retry_on_result: R,
    ) -> Result<T, PolicyError<E>>
    where
        T: Send,
        Fut: Future<Output = Result<T, PolicyError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
        R: Fn(&T) -> bool + Send,
    {
        let shared = &self.shared;
        shared.counters.calls.fetch_add(1, Ordering::Relaxed);

        for attempt in 1..=shared.max_attempts {
            match operation().await {
                Ok(value) => {
                    if retry_on_result(&value) && attempt < shared.max_attempts {
                        self.pause_before(attempt).await;
                        continue;
                    }
                    if attempt == 1 {
                        shared.counters.successful_without_retry.fetch_add(1, Ordering::Relaxed);
                    } else {
                        shared.counters.successful_with_retry.fetch_add(1, Ordering::Relaxed);
                        shared
                            .bus
                            .emit(EventKind::Retry(RetryEvent::Success { attempts: attempt }));
                    }
                    return Ok(value);
                }
                Err(PolicyError::Inner(error)) => {
                    if !(shared.retry_on)(&error) {
                        self.count_failure(attempt);
                        shared.bus.emit(EventKind::Retry(RetryEvent::Ignored));
                        return Err(PolicyError::Inner(error));
                    }
                    if attempt == shared.max_attempts {
                        self.count_failure(attempt);
                        shared.bus.emit(EventKind::Retry(RetryEvent::Exhausted {
                            attempts: shared.max_attempts,
                        }));
                        tracing::warn!(
                            policy = %shared.name,
                            attempts = shared.max_attempts,
                            error = %error,
                            "retry budget exhausted"
                        );
                        return Err(PolicyError::RetriesExhausted {
                            policy: shared.name.clone(),
                            attempts: shared.max_attempts,
                            last: error,
                        });
                    }
                    self.pause_before(attempt).await;
                }
                // Sibling-policy rejections are not retried.
                Err(other) => {
                    self.count_failure(attempt);
                    return Err(other);
                }
            }
        }

        unreachable!("retry loop returns within the attempt budget")
    }

    /// Lift a synchronous callable; inter-attempt waits park the calling
    /// thread.
    pub fn decorate<T, F>(&self, mut f: F) -> impl FnMut() -> Result<T, PolicyError<E>>
    where
        F: FnMut() -> Result<T, E>,
    {
        let policy = self.clone();
        move || {
            let shared = &policy.shared;
            shared.counters.calls.fetch_add(1, Ordering::Relaxed);
            let mut attempt = 1;
            loop {
                match f() {
                    Ok(value) => {
                        if attempt == 1 {
                            shared
                                .counters
                                .successful_without_retry
                                .fetch_add(1, Ordering::Relaxed);
                        } else {
                            shared.counters.successful_with_retry.fetch_add(1, Ordering::Relaxed);
                            shared
                                .bus
                                .emit(EventKind::Retry(RetryEvent::Success { attempts: attempt }));
                        }
                        return Ok(value);
                    }
                    Err(error) => {
                        if !(shared.retry_on)(&error) {
                            policy.count_failure(attempt);
                            shared.bus.emit(EventKind::Retry(RetryEvent::Ignored));
                            return Err(PolicyError::Inner(error));
                        }
                        if attempt == shared.max_attempts {
                            policy.count_failure(attempt);
                            shared.bus.emit(EventKind::Retry(RetryEvent::Exhausted {
                                attempts: shared.max_attempts,
                            }));
                            return Err(PolicyError::RetriesExhausted {
                                policy: shared.name.clone(),
                                attempts: shared.max_attempts,
                                last: error,
                            });
                        }
                        let delay = shared.jitter.apply(shared.backoff.delay(attempt));
                        shared
                            .bus
                            .emit(EventKind::Retry(RetryEvent::Attempt { attempt, delay }));
                        std::thread::sleep(delay);
                        attempt += 1;
                    }
                }
            }
        }
    }

    pub(crate) fn name_arc(&self) -> Arc<str> {
        self.shared.name.clone()
    }

    pub(crate) fn should_retry_error(&self, error: &E) -> bool {
        (self.shared.retry_on)(error)
    }

    pub(crate) fn delay_for(&self, attempt: usize) -> std::time::Duration {
        self.shared.jitter.apply(self.shared.backoff.delay(attempt))
    }

    pub(crate) fn sleeper_handle(&self) -> Arc<dyn Sleeper> {
        self.shared.sleeper.clone()
    }

    pub(crate) fn emit(&self, event: RetryEvent) {
        self.shared.bus.emit(EventKind::Retry(event));
    }

    /// Emit the retry event and park until the next attempt may start.
    async fn pause_before(&self, attempt: usize) {
        let shared = &self.shared;
        let delay = shared.jitter.apply(shared.backoff.delay(attempt));
        tracing::debug!(
            policy = %shared.name,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "retrying after backoff"
        );
        shared.bus.emit(EventKind::Retry(RetryEvent::Attempt { attempt, delay }));
        shared.sleeper.sleep(delay).await;
    }

    fn count_failure(&self, attempt: usize) {
        if attempt == 1 {
            self.shared.counters.failed_without_retry.fetch_add(1, Ordering::Relaxed);
        } else {
            self.shared.counters.failed_with_retry.fetch_add(1, Ordering::Relaxed);
        }
    }
}

pub struct RetryPolicyBuilder<E> {
    name: Arc<str>,
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    retry_on: Arc<dyn Fn(&E) -> bool + Send + Sync>,
    sleeper: Arc<dyn Sleeper>,
}

impl<E> RetryPolicyBuilder<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            max_attempts: 3,
            backoff: Backoff::exponential(std::time::Duration::from_millis(500)),
            jitter: Jitter::Full,
            retry_on: Arc::new(|_| true),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Total attempt budget, including the first call.
    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Only errors accepted by this predicate are retried; everything else is
    /// propagated on the first occurrence.
    pub fn retry_on<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.retry_on = Arc::new(predicate);
        self
    }

    pub fn sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn build(self) -> Result<RetryPolicy<E>, ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Zero { field: "max_attempts" });
        }
        Ok(RetryPolicy {
            shared: Arc::new(Shared {
                bus: EventBus::new(self.name.clone()),
                name: self.name,
                max_attempts: self.max_attempts,
                backoff: self.backoff,
                jitter: self.jitter,
                retry_on: self.retry_on,
                sleeper: self.sleeper,
                counters: Counters::default(),
            }),
        })
    }
}
