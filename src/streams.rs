//! Push-stream operators.
//!
//! Each operator acquires its policy's permission on the downstream's first
//! poll, before the upstream is ever polled. A denial yields the rejection
//! error as the only item. The upstream's terminal signal (natural end or
//! first `Err` item) produces exactly one outcome report, and dropping an
//! operator before the terminal releases whatever it holds exactly once,
//! which is the cancellation path.

use crate::bulkhead::{Bulkhead, BulkheadPermit};
use crate::circuit_breaker::{CircuitBreaker, CircuitPermit};
use crate::error::PolicyError;
use crate::events::RetryEvent;
use crate::rate_limiter::RateLimiter;
use crate::retry::RetryPolicy;
use futures::future::BoxFuture;
use futures::Stream;
use pin_project::{pin_project, pinned_drop};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

impl CircuitBreaker {
    /// Gate a stream behind this breaker. One permission covers the whole
    /// stream; its terminal signal is the call outcome.
    pub fn wrap_stream<S>(&self, stream: S) -> CircuitBreakerStream<S> {
        CircuitBreakerStream {
            breaker: self.clone(),
            stream,
            permit: None,
            started: None,
            begun: false,
            done: false,
        }
    }
}

impl Bulkhead {
    /// Gate a stream behind this bulkhead. The slot is held from acquisition
    /// to the terminal signal (or cancellation), then released exactly once.
    pub fn wrap_stream<S>(&self, stream: S) -> BulkheadStream<S> {
        let bulkhead = self.clone();
        let acquire = {
            let bulkhead = bulkhead.clone();
            Box::pin(async move { bulkhead.acquire().await }) as BoxFuture<'static, _>
        };
        BulkheadStream { bulkhead, stream, acquire: Some(acquire), permit: None, done: false }
    }
}

impl RateLimiter {
    /// Spend one permit on the whole stream.
    pub fn wrap_stream<S>(&self, stream: S) -> RateLimiterStream<S> {
        let limiter = self.clone();
        let acquire = {
            let limiter = limiter.clone();
            Box::pin(async move { limiter.acquire().await }) as BoxFuture<'static, bool>
        };
        RateLimiterStream { limiter, stream, acquire: Some(acquire), done: false }
    }
}

impl<E> RetryPolicy<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Re-subscribe a stream from its factory on retryable `Err` items.
    /// Items already emitted by a failed attempt stay emitted; each retry
    /// replays the factory's stream from the start.
    pub fn wrap_stream_factory<S, F>(&self, factory: F) -> RetryStream<S, F, E>
    where
        F: FnMut() -> S,
    {
        RetryStream {
            policy: self.clone(),
            factory,
            stream: None,
            sleep: None,
            attempt: 1,
            done: false,
        }
    }
}

#[pin_project(PinnedDrop)]
pub struct CircuitBreakerStream<S> {
    breaker: CircuitBreaker,
    #[pin]
    stream: S,
    permit: Option<CircuitPermit>,
    started: Option<Instant>,
    begun: bool,
    done: bool,
}

impl<S, T, E> Stream for CircuitBreakerStream<S>
where
    S: Stream<Item = Result<T, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    type Item = Result<T, PolicyError<E>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        if *this.done {
            return Poll::Ready(None);
        }
        if !*this.begun {
            *this.begun = true;
            match this.breaker.try_acquire() {
                Some(permit) => {
                    *this.permit = Some(permit);
                    *this.started = Some(Instant::now());
                }
                None => {
                    *this.done = true;
                    return Poll::Ready(Some(Err(this.breaker.rejection())));
                }
            }
        }
        match this.stream.poll_next(cx) {
            Poll::Ready(Some(Ok(item))) => Poll::Ready(Some(Ok(item))),
            Poll::Ready(Some(Err(error))) => {
                if let Some(permit) = this.permit.take() {
                    let elapsed = this.started.map(|s| s.elapsed()).unwrap_or_default();
                    this.breaker.on_error(permit, elapsed, &error);
                }
                *this.done = true;
                Poll::Ready(Some(Err(PolicyError::Inner(error))))
            }
            Poll::Ready(None) => {
                if let Some(permit) = this.permit.take() {
                    let elapsed = this.started.map(|s| s.elapsed()).unwrap_or_default();
                    this.breaker.on_success(permit, elapsed);
                }
                *this.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[pinned_drop]
impl<S> PinnedDrop for CircuitBreakerStream<S> {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        // Cancelled before the terminal signal: no outcome, slot returned.
        if let Some(permit) = this.permit.take() {
            this.breaker.release(permit);
        }
    }
}

#[pin_project]
pub struct BulkheadStream<S> {
    bulkhead: Bulkhead,
    #[pin]
    stream: S,
    acquire: Option<BoxFuture<'static, Option<BulkheadPermit>>>,
    permit: Option<BulkheadPermit>,
    done: bool,
}

impl<S, T, E> Stream for BulkheadStream<S>
where
    S: Stream<Item = Result<T, E>>,
{
    type Item = Result<T, PolicyError<E>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        if *this.done {
            return Poll::Ready(None);
        }
        if let Some(acquire) = this.acquire.as_mut() {
            match acquire.as_mut().poll(cx) {
                Poll::Ready(Some(permit)) => {
                    *this.permit = Some(permit);
                    *this.acquire = None;
                }
                Poll::Ready(None) => {
                    *this.acquire = None;
                    *this.done = true;
                    return Poll::Ready(Some(Err(this.bulkhead.rejection())));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
        match this.stream.poll_next(cx) {
            Poll::Ready(Some(Ok(item))) => Poll::Ready(Some(Ok(item))),
            Poll::Ready(Some(Err(error))) => {
                // Permit drop releases the slot and emits CallFinished.
                *this.permit = None;
                *this.done = true;
                Poll::Ready(Some(Err(PolicyError::Inner(error))))
            }
            Poll::Ready(None) => {
                *this.permit = None;
                *this.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[pin_project]
pub struct RateLimiterStream<S> {
    limiter: RateLimiter,
    #[pin]
    stream: S,
    acquire: Option<BoxFuture<'static, bool>>,
    done: bool,
}

impl<S, T, E> Stream for RateLimiterStream<S>
where
    S: Stream<Item = Result<T, E>>,
{
    type Item = Result<T, PolicyError<E>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        if *this.done {
            return Poll::Ready(None);
        }
        if let Some(acquire) = this.acquire.as_mut() {
            match acquire.as_mut().poll(cx) {
                Poll::Ready(true) => *this.acquire = None,
                Poll::Ready(false) => {
                    *this.acquire = None;
                    *this.done = true;
                    return Poll::Ready(Some(Err(this.limiter.rejection())));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
        match this.stream.poll_next(cx) {
            Poll::Ready(Some(Ok(item))) => Poll::Ready(Some(Ok(item))),
            Poll::Ready(Some(Err(error))) => {
                *this.done = true;
                Poll::Ready(Some(Err(PolicyError::Inner(error))))
            }
            Poll::Ready(None) => {
                *this.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

pub struct RetryStream<S, F, E> {
    policy: RetryPolicy<E>,
    factory: F,
    stream: Option<Pin<Box<S>>>,
    sleep: Option<BoxFuture<'static, ()>>,
    attempt: usize,
    done: bool,
}

impl<S, F, T, E> Stream for RetryStream<S, F, E>
where
    S: Stream<Item = Result<T, E>>,
    F: FnMut() -> S + Unpin,
    E: std::error::Error + Send + Sync + 'static,
{
    type Item = Result<T, PolicyError<E>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        loop {
            if let Some(sleep) = this.sleep.as_mut() {
                match sleep.as_mut().poll(cx) {
                    Poll::Ready(()) => this.sleep = None,
                    Poll::Pending => return Poll::Pending,
                }
            }
            if this.stream.is_none() {
                this.stream = Some(Box::pin((this.factory)()));
            }
            let stream = this
                .stream
                .as_mut()
                .expect("RetryStream.poll_next: attempt stream just installed");
            match stream.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(item))) => return Poll::Ready(Some(Ok(item))),
                Poll::Ready(Some(Err(error))) => {
                    if !this.policy.should_retry_error(&error) {
                        this.done = true;
                        this.policy.emit(RetryEvent::Ignored);
                        return Poll::Ready(Some(Err(PolicyError::Inner(error))));
                    }
                    if this.attempt >= this.policy.max_attempts() {
                        this.done = true;
                        this.policy.emit(RetryEvent::Exhausted { attempts: this.attempt });
                        return Poll::Ready(Some(Err(PolicyError::RetriesExhausted {
                            policy: this.policy.name_arc(),
                            attempts: this.attempt,
                            last: error,
                        })));
                    }
                    let delay = this.policy.delay_for(this.attempt);
                    this.policy.emit(RetryEvent::Attempt { attempt: this.attempt, delay });
                    this.attempt += 1;
                    this.stream = None;
                    let sleeper = this.policy.sleeper_handle();
                    this.sleep = Some(Box::pin(async move { sleeper.sleep(delay).await }));
                    // Loop back to poll the sleep (and then the fresh attempt).
                }
                Poll::Ready(None) => {
                    if this.attempt > 1 {
                        this.policy.emit(RetryEvent::Success { attempts: this.attempt });
                    }
                    this.done = true;
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bulkhead::BulkheadConfig;
    use crate::circuit_breaker::{CircuitBreakerConfig, CircuitState};
    use crate::events::{BulkheadEvent, EventKind};
    use crate::rate_limiter::RateLimiterConfig;
    use crate::sleeper::RecordingSleeper;
    use crate::window::WindowType;
    use futures::StreamExt;
    use std::fmt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(String);

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "TestError: {}", self.0)
        }
    }

    impl std::error::Error for TestError {}

    fn ok_stream(items: Vec<i32>) -> impl Stream<Item = Result<i32, TestError>> {
        futures::stream::iter(items.into_iter().map(Ok))
    }

    fn breaker(window: u32) -> CircuitBreaker {
        let config = CircuitBreakerConfig::builder()
            .sliding_window(WindowType::CountBased, window)
            .minimum_number_of_calls(window)
            .build()
            .expect("valid config");
        CircuitBreaker::new("stream-cb", config)
    }

    fn count_finished(bulkhead: &Bulkhead) -> usize {
        bulkhead
            .events()
            .history()
            .iter()
            .filter(|e| e.kind == EventKind::Bulkhead(BulkheadEvent::CallFinished))
            .count()
    }

    #[tokio::test]
    async fn breaker_stream_forwards_items_and_records_one_success() {
        let breaker = breaker(4);
        let collected: Vec<_> = breaker.wrap_stream(ok_stream(vec![1, 2, 3])).collect().await;

        assert_eq!(collected.len(), 3);
        assert!(collected.iter().all(|item| item.is_ok()));
        // One permission, one outcome, regardless of item count.
        assert_eq!(breaker.metrics().total_calls, 1);
        assert_eq!(breaker.metrics().failed_calls, 0);
    }

    #[tokio::test]
    async fn breaker_stream_emits_rejection_when_denied() {
        let breaker = breaker(4);
        breaker.force_open();

        let collected: Vec<_> = breaker.wrap_stream(ok_stream(vec![1])).collect().await;
        assert_eq!(collected.len(), 1);
        assert!(matches!(&collected[0], Err(e) if e.is_call_not_permitted()));
        assert_eq!(breaker.metrics().total_calls, 0, "upstream never ran");
    }

    #[tokio::test]
    async fn breaker_stream_records_error_terminal_and_fuses() {
        let breaker = breaker(4);
        let upstream = futures::stream::iter(vec![
            Ok(1),
            Err(TestError("mid-stream".to_owned())),
            Ok(2),
        ]);

        let collected: Vec<_> = breaker.wrap_stream(upstream).collect().await;
        assert_eq!(collected.len(), 2, "stream fuses after the error item");
        assert!(collected[0].is_ok());
        assert!(matches!(&collected[1], Err(PolicyError::Inner(_))));
        assert_eq!(breaker.metrics().failed_calls, 1);
    }

    #[tokio::test]
    async fn cancelled_breaker_stream_returns_its_trial_slot() {
        let config = CircuitBreakerConfig::builder()
            .sliding_window(WindowType::CountBased, 1)
            .minimum_number_of_calls(1)
            .permitted_calls_in_half_open(1)
            .wait_duration_in_open(Duration::from_millis(1))
            .build()
            .expect("valid config");
        let breaker = CircuitBreaker::new("stream-cb", config);

        // Open, then wait out the open state so the next permission is the
        // single half-open trial.
        let permit = breaker.try_acquire().expect("closed permits");
        breaker.on_error(permit, Duration::ZERO, &TestError("boom".to_owned()));
        assert_eq!(breaker.state(), CircuitState::Open);
        tokio::time::sleep(Duration::from_millis(20)).await;

        {
            let mut stream =
                breaker.wrap_stream(futures::stream::pending::<Result<(), TestError>>());
            assert!(futures::poll!(stream.next()).is_pending());
            assert!(breaker.try_acquire().is_none(), "trial slot is held by the stream");
            // Dropped here: cancellation before any item.
        }

        assert!(breaker.try_acquire().is_some(), "cancellation returned the trial slot");
    }

    #[tokio::test]
    async fn bulkhead_stream_holds_one_slot_for_the_whole_stream() {
        let bulkhead =
            Bulkhead::new("stream-bh", BulkheadConfig::new(1, Duration::ZERO).unwrap());

        let mut stream = bulkhead.wrap_stream(ok_stream(vec![1, 2]));
        assert_eq!(stream.next().await, Some(Ok(1)));
        assert_eq!(bulkhead.metrics().available_permits, 0, "slot held mid-stream");

        assert_eq!(stream.next().await, Some(Ok(2)));
        assert_eq!(stream.next().await, None);
        assert_eq!(bulkhead.metrics().available_permits, 1);
        assert_eq!(count_finished(&bulkhead), 1);
    }

    #[tokio::test]
    async fn bulkhead_stream_rejects_when_saturated() {
        let bulkhead =
            Bulkhead::new("stream-bh", BulkheadConfig::new(1, Duration::ZERO).unwrap());
        let held = bulkhead.acquire().await.expect("slot");

        let collected: Vec<_> = bulkhead.wrap_stream(ok_stream(vec![1])).collect().await;
        assert_eq!(collected.len(), 1);
        assert!(matches!(&collected[0], Err(e) if e.is_bulkhead_full()));

        held.complete();
    }

    #[tokio::test]
    async fn cancelled_bulkhead_stream_releases_exactly_once() {
        let bulkhead =
            Bulkhead::new("stream-bh", BulkheadConfig::new(1, Duration::ZERO).unwrap());

        {
            let mut stream =
                bulkhead.wrap_stream(futures::stream::pending::<Result<(), TestError>>());
            assert!(futures::poll!(stream.next()).is_pending());
            assert_eq!(bulkhead.metrics().available_permits, 0);
            // Cancelled before any item.
        }

        assert_eq!(bulkhead.metrics().available_permits, 1);
        assert_eq!(count_finished(&bulkhead), 1, "exactly one release for one acquisition");

        // No outcome events beyond the permit lifecycle.
        let kinds: Vec<_> = bulkhead.events().history().iter().map(|e| e.kind.clone()).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::Bulkhead(BulkheadEvent::CallPermitted),
                EventKind::Bulkhead(BulkheadEvent::CallFinished),
            ]
        );
    }

    #[tokio::test]
    async fn rate_limiter_stream_spends_one_permit() {
        let config = RateLimiterConfig::builder()
            .limit_for_period(1)
            .limit_refresh_period(Duration::from_secs(1))
            .timeout_duration(Duration::ZERO)
            .build()
            .expect("valid config");
        let limiter = RateLimiter::new("stream-rl", config);

        let first: Vec<_> = limiter.wrap_stream(ok_stream(vec![1, 2])).collect().await;
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|item| item.is_ok()));

        let second: Vec<_> = limiter.wrap_stream(ok_stream(vec![3])).collect().await;
        assert_eq!(second.len(), 1);
        assert!(matches!(&second[0], Err(e) if e.is_request_not_permitted()));
    }

    #[tokio::test]
    async fn retry_stream_resubscribes_until_success() {
        let policy: RetryPolicy<TestError> = RetryPolicy::builder("stream-retry")
            .max_attempts(3)
            .sleeper(RecordingSleeper::new())
            .build()
            .expect("valid policy");

        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        let collected: Vec<_> = policy
            .wrap_stream_factory(move || {
                let n = attempts_clone.fetch_add(1, Ordering::SeqCst);
                let items: Vec<Result<i32, TestError>> = if n < 2 {
                    vec![Ok(1), Err(TestError(format!("attempt {}", n)))]
                } else {
                    vec![Ok(1), Ok(2)]
                };
                futures::stream::iter(items)
            })
            .collect()
            .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        // Two failed attempts each re-emitted their prefix before the error.
        let ok_items = collected.iter().filter(|item| item.is_ok()).count();
        assert_eq!(ok_items, 4);
        assert!(collected.iter().all(|item| item.is_ok()));
    }

    #[tokio::test]
    async fn retry_stream_exhaustion_carries_the_last_error() {
        let policy: RetryPolicy<TestError> = RetryPolicy::builder("stream-retry")
            .max_attempts(2)
            .sleeper(RecordingSleeper::new())
            .build()
            .expect("valid policy");

        let collected: Vec<_> = policy
            .wrap_stream_factory(|| {
                futures::stream::iter(vec![Err::<i32, _>(TestError("persistent".to_owned()))])
            })
            .collect()
            .await;

        assert_eq!(collected.len(), 1);
        match &collected[0] {
            Err(PolicyError::RetriesExhausted { attempts, last, .. }) => {
                assert_eq!(*attempts, 2);
                assert_eq!(last.0, "persistent");
            }
            other => panic!("expected RetriesExhausted, got {:?}", other),
        }
    }
}
