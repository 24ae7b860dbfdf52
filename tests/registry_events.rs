use breakwater::{
    BulkheadEvent, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerEvent,
    CircuitBreakerRegistry, CircuitState, Event, EventKind, PolicyError, RegistryEvent,
    WindowType,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
struct TestError;

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "test error")
    }
}

impl std::error::Error for TestError {}

fn tight_breaker(name: &str) -> CircuitBreaker {
    let config = CircuitBreakerConfig::builder()
        .sliding_window(WindowType::CountBased, 2)
        .minimum_number_of_calls(2)
        .permitted_calls_in_half_open(1)
        .wait_duration_in_open(Duration::from_millis(30))
        .build()
        .unwrap();
    CircuitBreaker::new(name, config)
}

fn state_walk(events: &[Event]) -> Vec<(CircuitState, CircuitState)> {
    events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::CircuitBreaker(CircuitBreakerEvent::StateTransition { from, to }) => {
                Some((*from, *to))
            }
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn state_transitions_form_a_valid_walk_of_the_machine() {
    let breaker = tight_breaker("walk");

    // Closed → Open
    for _ in 0..2 {
        let _ = breaker
            .execute(|| async { Err::<(), _>(PolicyError::Inner(TestError)) })
            .await;
    }
    // Open → HalfOpen (lazy, after the wait) → Closed
    tokio::time::sleep(Duration::from_millis(60)).await;
    let _ = breaker.execute(|| async { Ok::<_, PolicyError<TestError>>(()) }).await;

    let walk = state_walk(&breaker.events().history());
    assert_eq!(
        walk,
        vec![
            (CircuitState::Closed, CircuitState::Open),
            (CircuitState::Open, CircuitState::HalfOpen),
            (CircuitState::HalfOpen, CircuitState::Closed),
        ]
    );
    // Each hop starts where the previous one ended.
    for pair in walk.windows(2) {
        assert_eq!(pair[0].1, pair[1].0);
    }
}

#[tokio::test]
async fn permit_event_precedes_the_terminal_event_for_a_call() {
    let bulkhead = breakwater::Bulkhead::new(
        "ordered",
        breakwater::BulkheadConfig::new(1, Duration::ZERO).unwrap(),
    );

    let _ = bulkhead.execute(|| async { Ok::<_, PolicyError<TestError>>(()) }).await;

    let kinds: Vec<EventKind> =
        bulkhead.events().history().iter().map(|e| e.kind.clone()).collect();
    let permitted = kinds
        .iter()
        .position(|k| *k == EventKind::Bulkhead(BulkheadEvent::CallPermitted))
        .expect("permit event present");
    let finished = kinds
        .iter()
        .position(|k| *k == EventKind::Bulkhead(BulkheadEvent::CallFinished))
        .expect("terminal event present");
    assert!(permitted < finished);
}

#[test]
fn subscribers_observe_events_in_publish_order() {
    let breaker = tight_breaker("ordered");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = seen.clone();
    breaker.events().subscribe(move |event| {
        seen_clone.lock().unwrap().push(event.kind.clone());
    });

    breaker.force_open();
    breaker.reset();

    let seen = seen.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![
            EventKind::CircuitBreaker(CircuitBreakerEvent::StateTransition {
                from: CircuitState::Closed,
                to: CircuitState::ForcedOpen,
            }),
            EventKind::CircuitBreaker(CircuitBreakerEvent::Reset),
        ]
    );
}

#[tokio::test]
async fn registry_merges_member_events_tagged_by_name() {
    let registry = CircuitBreakerRegistry::new();
    let payments = registry.get_or_create("payments", tight_breaker);
    let orders = registry.get_or_create("orders", tight_breaker);

    let _ = payments.execute(|| async { Ok::<_, PolicyError<TestError>>(()) }).await;
    let _ = orders
        .execute(|| async { Err::<(), _>(PolicyError::Inner(TestError)) })
        .await;

    let merged = registry.events().history();
    assert!(merged
        .iter()
        .any(|e| &*e.policy == "payments"
            && matches!(e.kind, EventKind::CircuitBreaker(CircuitBreakerEvent::Success { .. }))));
    assert!(merged
        .iter()
        .any(|e| &*e.policy == "orders"
            && matches!(e.kind, EventKind::CircuitBreaker(CircuitBreakerEvent::Error { .. }))));
}

#[test]
fn registry_lifecycle_and_memoisation_work_together() {
    let registry = CircuitBreakerRegistry::new();
    let lifecycle = Arc::new(Mutex::new(Vec::new()));
    let lifecycle_clone = lifecycle.clone();
    registry.subscribe(move |event| {
        lifecycle_clone.lock().unwrap().push(event.clone());
    });

    let resolver_runs = Arc::new(AtomicUsize::new(0));
    for _ in 0..3 {
        let resolver_runs = resolver_runs.clone();
        registry.get_or_create("payments", move |name| {
            resolver_runs.fetch_add(1, Ordering::SeqCst);
            tight_breaker(name)
        });
    }

    assert_eq!(resolver_runs.load(Ordering::SeqCst), 1);
    assert_eq!(
        lifecycle.lock().unwrap().clone(),
        vec![RegistryEvent::EntryAdded { name: "payments".to_owned() }]
    );
}
