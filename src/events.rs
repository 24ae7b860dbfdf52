//! Per-policy event bus.
//!
//! Every policy instance owns an [`EventBus`]: a bounded ring of the most
//! recent events plus a set of subscribers. Publishing never blocks the hot
//! path. The oldest event is evicted when the ring is full, delivery runs
//! synchronously on the publisher thread, and a panicking handler is caught
//! and discarded so it can never affect policy behavior.
//!
//! # Event Types
//!
//! Each policy kind emits specific events:
//!
//! - **Circuit breaker**: `Success`, `Error`, `IgnoredError`, `NotPermitted`,
//!   `StateTransition`, `Reset`, `FailureRateExceeded`, `SlowCallRateExceeded`
//! - **Rate limiter**: `SuccessfulAcquire`, `FailedAcquire`
//! - **Bulkhead**: `CallPermitted`, `CallRejected`, `CallFinished`
//! - **Retry**: `Attempt`, `Success`, `Exhausted`, `Ignored`
//! - **Time limiter**: `Timeout`

use crate::circuit_breaker::CircuitState;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime};

/// Default number of events retained in a bus's history ring.
pub const DEFAULT_EVENT_CAPACITY: usize = 100;

/// A timestamped, typed lifecycle event tagged with the emitting policy's name.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub policy: Arc<str>,
    pub recorded_at: SystemTime,
    pub kind: EventKind,
}

/// Policy events emitted during execution.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    CircuitBreaker(CircuitBreakerEvent),
    RateLimiter(RateLimiterEvent),
    Bulkhead(BulkheadEvent),
    Retry(RetryEvent),
    TimeLimiter(TimeLimiterEvent),
}

/// Events emitted by circuit breakers.
#[derive(Debug, Clone, PartialEq)]
pub enum CircuitBreakerEvent {
    /// A permitted call completed successfully and was recorded.
    Success { duration: Duration },
    /// A permitted call failed with a recordable error.
    Error { duration: Duration, message: String },
    /// A permitted call failed, but classification said the error does not
    /// count against the window.
    IgnoredError { message: String },
    /// An acquisition attempt was denied.
    NotPermitted,
    /// The breaker moved between states.
    StateTransition { from: CircuitState, to: CircuitState },
    /// The breaker was reset to closed with a fresh window.
    Reset,
    /// The failure rate crossed its configured threshold.
    FailureRateExceeded { rate: f32 },
    /// The slow-call rate crossed its configured threshold.
    SlowCallRateExceeded { rate: f32 },
}

/// Events emitted by rate limiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimiterEvent {
    SuccessfulAcquire,
    FailedAcquire,
}

/// Events emitted by bulkheads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkheadEvent {
    CallPermitted,
    CallRejected,
    CallFinished,
}

/// Events emitted by retry policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryEvent {
    /// A retry is about to happen after the given delay.
    Attempt { attempt: usize, delay: Duration },
    /// The operation succeeded after at least one retry.
    Success { attempts: usize },
    /// All attempts were exhausted.
    Exhausted { attempts: usize },
    /// The error did not match the retry predicate and was propagated as-is.
    Ignored,
}

/// Events emitted by time limiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeLimiterEvent {
    Timeout { limit: Duration },
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::CircuitBreaker(e) => write!(f, "CircuitBreaker::{}", e),
            EventKind::RateLimiter(e) => write!(f, "RateLimiter::{}", e),
            EventKind::Bulkhead(e) => write!(f, "Bulkhead::{}", e),
            EventKind::Retry(e) => write!(f, "Retry::{}", e),
            EventKind::TimeLimiter(e) => write!(f, "TimeLimiter::{}", e),
        }
    }
}

impl fmt::Display for CircuitBreakerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitBreakerEvent::Success { duration } => {
                write!(f, "Success(duration={:?})", duration)
            }
            CircuitBreakerEvent::Error { duration, message } => {
                write!(f, "Error(duration={:?}, {})", duration, message)
            }
            CircuitBreakerEvent::IgnoredError { message } => {
                write!(f, "IgnoredError({})", message)
            }
            CircuitBreakerEvent::NotPermitted => write!(f, "NotPermitted"),
            CircuitBreakerEvent::StateTransition { from, to } => {
                write!(f, "StateTransition({} -> {})", from, to)
            }
            CircuitBreakerEvent::Reset => write!(f, "Reset"),
            CircuitBreakerEvent::FailureRateExceeded { rate } => {
                write!(f, "FailureRateExceeded({:.1}%)", rate)
            }
            CircuitBreakerEvent::SlowCallRateExceeded { rate } => {
                write!(f, "SlowCallRateExceeded({:.1}%)", rate)
            }
        }
    }
}

impl fmt::Display for RateLimiterEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimiterEvent::SuccessfulAcquire => write!(f, "SuccessfulAcquire"),
            RateLimiterEvent::FailedAcquire => write!(f, "FailedAcquire"),
        }
    }
}

impl fmt::Display for BulkheadEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BulkheadEvent::CallPermitted => write!(f, "CallPermitted"),
            BulkheadEvent::CallRejected => write!(f, "CallRejected"),
            BulkheadEvent::CallFinished => write!(f, "CallFinished"),
        }
    }
}

impl fmt::Display for RetryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryEvent::Attempt { attempt, delay } => {
                write!(f, "Attempt(#{}, delay={:?})", attempt, delay)
            }
            RetryEvent::Success { attempts } => write!(f, "Success(attempts={})", attempts),
            RetryEvent::Exhausted { attempts } => write!(f, "Exhausted(attempts={})", attempts),
            RetryEvent::Ignored => write!(f, "Ignored"),
        }
    }
}

impl fmt::Display for TimeLimiterEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeLimiterEvent::Timeout { limit } => write!(f, "Timeout(limit={:?})", limit),
        }
    }
}

type EventFilter = Arc<dyn Fn(&Event) -> bool + Send + Sync>;
type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;

struct SubscriberEntry {
    id: u64,
    filter: Option<EventFilter>,
    handler: EventHandler,
}

struct BusInner {
    policy: Arc<str>,
    capacity: usize,
    history: Mutex<VecDeque<Event>>,
    subscribers: Mutex<Vec<SubscriberEntry>>,
    next_id: AtomicU64,
}

/// Bounded in-memory publish/subscribe bus owned by a single policy instance.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("policy", &self.inner.policy)
            .field("capacity", &self.inner.capacity)
            .finish()
    }
}

impl EventBus {
    pub fn new(policy: Arc<str>) -> Self {
        Self::with_capacity(policy, DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(policy: Arc<str>, capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                policy,
                capacity: capacity.max(1),
                history: Mutex::new(VecDeque::new()),
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Name of the policy this bus belongs to.
    pub fn policy(&self) -> &str {
        &self.inner.policy
    }

    /// Configured history capacity.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Record an event kind against this bus's policy and deliver it.
    pub(crate) fn emit(&self, kind: EventKind) {
        self.publish(Event {
            policy: self.inner.policy.clone(),
            recorded_at: SystemTime::now(),
            kind,
        });
    }

    /// Publish a fully-formed event (the registry uses this to forward member
    /// events without re-tagging them).
    ///
    /// Non-blocking: the oldest history entry is evicted when the ring is
    /// full, and subscriber panics are swallowed.
    pub fn publish(&self, event: Event) {
        {
            let mut history =
                self.inner.history.lock().expect("EventBus.publish: history lock poisoned");
            if history.len() >= self.inner.capacity {
                history.pop_front();
            }
            history.push_back(event.clone());
        }

        // Snapshot the subscriber list so no lock is held across handlers.
        let handlers: Vec<(Option<EventFilter>, EventHandler)> = {
            let subscribers = self
                .inner
                .subscribers
                .lock()
                .expect("EventBus.publish: subscribers lock poisoned");
            subscribers.iter().map(|s| (s.filter.clone(), s.handler.clone())).collect()
        };

        for (filter, handler) in handlers {
            if filter.as_ref().map_or(true, |matches| matches(&event)) {
                let _ = catch_unwind(AssertUnwindSafe(|| handler(&event)));
            }
        }
    }

    /// Subscribe to every event published on this bus.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribe_entry(None, Arc::new(handler))
    }

    /// Subscribe with a filter; only events matching the predicate are
    /// delivered to the handler.
    pub fn subscribe_filtered<P, F>(&self, filter: P, handler: F) -> Subscription
    where
        P: Fn(&Event) -> bool + Send + Sync + 'static,
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribe_entry(Some(Arc::new(filter)), Arc::new(handler))
    }

    fn subscribe_entry(&self, filter: Option<EventFilter>, handler: EventHandler) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .lock()
            .expect("EventBus.subscribe: subscribers lock poisoned")
            .push(SubscriberEntry { id, filter, handler });
        Subscription { bus: Arc::downgrade(&self.inner), id }
    }

    /// Chronological snapshot of the retained history.
    pub fn history(&self) -> Vec<Event> {
        self.inner
            .history
            .lock()
            .expect("EventBus.history: history lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// Chronological snapshot of the retained history, filtered.
    pub fn history_where<P>(&self, filter: P) -> Vec<Event>
    where
        P: Fn(&Event) -> bool,
    {
        self.inner
            .history
            .lock()
            .expect("EventBus.history_where: history lock poisoned")
            .iter()
            .filter(|e| filter(e))
            .cloned()
            .collect()
    }
}

/// Cancellation token returned by [`EventBus::subscribe`].
///
/// Dropping the token leaves the subscription active; call [`cancel`] to
/// detach the handler. The token only holds a weak reference, so a dropped
/// bus never keeps subscribers alive.
///
/// [`cancel`]: Subscription::cancel
#[derive(Debug)]
pub struct Subscription {
    bus: Weak<BusInner>,
    id: u64,
}

impl Subscription {
    /// Detach the handler from the bus. Idempotent.
    pub fn cancel(&self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.subscribers
                .lock()
                .expect("Subscription.cancel: subscribers lock poisoned")
                .retain(|s| s.id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn bus() -> EventBus {
        EventBus::new(Arc::from("test-policy"))
    }

    fn bulkhead_event(kind: BulkheadEvent) -> EventKind {
        EventKind::Bulkhead(kind)
    }

    #[test]
    fn publish_reaches_subscribers_in_subscription_order() {
        let bus = bus();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = order.clone();
            bus.subscribe(move |_| order.lock().unwrap().push(tag));
        }

        bus.emit(bulkhead_event(BulkheadEvent::CallPermitted));

        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn history_is_bounded_and_chronological() {
        let bus = EventBus::with_capacity(Arc::from("bounded"), 3);

        bus.emit(bulkhead_event(BulkheadEvent::CallPermitted));
        bus.emit(bulkhead_event(BulkheadEvent::CallRejected));
        bus.emit(bulkhead_event(BulkheadEvent::CallFinished));
        bus.emit(bulkhead_event(BulkheadEvent::CallPermitted));

        let history = bus.history();
        assert_eq!(history.len(), 3);
        // Oldest event evicted
        assert_eq!(history[0].kind, bulkhead_event(BulkheadEvent::CallRejected));
        assert_eq!(history[2].kind, bulkhead_event(BulkheadEvent::CallPermitted));
    }

    #[test]
    fn filtered_subscription_only_sees_matching_events() {
        let bus = bus();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();

        bus.subscribe_filtered(
            |e| matches!(e.kind, EventKind::Bulkhead(BulkheadEvent::CallRejected)),
            move |_| {
                seen_clone.fetch_add(1, Ordering::SeqCst);
            },
        );

        bus.emit(bulkhead_event(BulkheadEvent::CallPermitted));
        bus.emit(bulkhead_event(BulkheadEvent::CallRejected));
        bus.emit(bulkhead_event(BulkheadEvent::CallFinished));

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancelled_subscription_stops_receiving() {
        let bus = bus();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();

        let subscription = bus.subscribe(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(bulkhead_event(BulkheadEvent::CallPermitted));
        subscription.cancel();
        bus.emit(bulkhead_event(BulkheadEvent::CallPermitted));

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_handler_does_not_poison_the_bus() {
        let bus = bus();
        let after = Arc::new(AtomicUsize::new(0));
        let after_clone = after.clone();

        bus.subscribe(|_| panic!("handler blew up"));
        bus.subscribe(move |_| {
            after_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(bulkhead_event(BulkheadEvent::CallPermitted));
        bus.emit(bulkhead_event(BulkheadEvent::CallFinished));

        // The panicking subscriber never stopped delivery to the next one.
        assert_eq!(after.load(Ordering::SeqCst), 2);
        assert_eq!(bus.history().len(), 2);
    }

    #[test]
    fn events_are_tagged_with_the_policy_name() {
        let bus = bus();
        bus.emit(bulkhead_event(BulkheadEvent::CallPermitted));
        let history = bus.history();
        assert_eq!(&*history[0].policy, "test-policy");
    }

    #[test]
    fn history_where_filters_the_snapshot() {
        let bus = bus();
        bus.emit(bulkhead_event(BulkheadEvent::CallPermitted));
        bus.emit(bulkhead_event(BulkheadEvent::CallRejected));

        let rejected = bus
            .history_where(|e| matches!(e.kind, EventKind::Bulkhead(BulkheadEvent::CallRejected)));
        assert_eq!(rejected.len(), 1);
    }
}
