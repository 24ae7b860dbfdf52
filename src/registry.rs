//! Named, process-scoped registries of policy instances.
//!
//! A [`Registry`] exclusively owns its members: `get_or_create` memoises by
//! name, so every caller asking for `"payments"` shares the same instance.
//! The registry also exposes a merged event stream: on insertion it
//! subscribes to the member's bus and forwards every event, already tagged
//! with the member's name, onto a registry-level bus.

use crate::bulkhead::Bulkhead;
use crate::circuit_breaker::CircuitBreaker;
use crate::events::{EventBus, Subscription};
use crate::rate_limiter::RateLimiter;
use crate::retry::RetryPolicy;
use crate::time_limiter::TimeLimiter;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Implemented by every policy type a [`Registry`] can hold.
pub trait RegisteredPolicy: Clone + Send + Sync + 'static {
    fn policy_name(&self) -> &str;
    fn policy_events(&self) -> &EventBus;
}

impl RegisteredPolicy for CircuitBreaker {
    fn policy_name(&self) -> &str {
        self.name()
    }
    fn policy_events(&self) -> &EventBus {
        self.events()
    }
}

impl RegisteredPolicy for RateLimiter {
    fn policy_name(&self) -> &str {
        self.name()
    }
    fn policy_events(&self) -> &EventBus {
        self.events()
    }
}

impl RegisteredPolicy for Bulkhead {
    fn policy_name(&self) -> &str {
        self.name()
    }
    fn policy_events(&self) -> &EventBus {
        self.events()
    }
}

impl<E: std::error::Error + Send + Sync + 'static> RegisteredPolicy for RetryPolicy<E> {
    fn policy_name(&self) -> &str {
        self.name()
    }
    fn policy_events(&self) -> &EventBus {
        self.events()
    }
}

impl RegisteredPolicy for TimeLimiter {
    fn policy_name(&self) -> &str {
        self.name()
    }
    fn policy_events(&self) -> &EventBus {
        self.events()
    }
}

/// Registry lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    EntryAdded { name: String },
    EntryRemoved { name: String },
    EntryReplaced { name: String },
}

type RegistryHandler = Arc<dyn Fn(&RegistryEvent) + Send + Sync>;

struct Entry<P> {
    policy: P,
    forward: Subscription,
}

struct RegistryInner<P> {
    entries: Mutex<HashMap<String, Entry<P>>>,
    merged: EventBus,
    handlers: Mutex<Vec<(u64, RegistryHandler)>>,
    next_id: AtomicU64,
}

pub struct Registry<P> {
    inner: Arc<RegistryInner<P>>,
}

impl<P> Clone for Registry<P> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<P> fmt::Debug for Registry<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self.inner.entries.lock().map(|m| m.len()).unwrap_or(0);
        f.debug_struct("Registry").field("entries", &count).finish()
    }
}

impl<P> Default for Registry<P> {
    fn default() -> Self {
        Self::new()
    }
}

pub type CircuitBreakerRegistry = Registry<CircuitBreaker>;
pub type RateLimiterRegistry = Registry<RateLimiter>;
pub type BulkheadRegistry = Registry<Bulkhead>;
pub type RetryRegistry<E> = Registry<RetryPolicy<E>>;
pub type TimeLimiterRegistry = Registry<TimeLimiter>;

impl<P> Registry<P> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                entries: Mutex::new(HashMap::new()),
                merged: EventBus::new(Arc::from("registry")),
                handlers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Bus receiving every member's events, tagged with the member's name.
    pub fn events(&self) -> &EventBus {
        &self.inner.merged
    }

    /// Subscribe to registry lifecycle events. Cancel via the returned token.
    pub fn subscribe<F>(&self, handler: F) -> RegistrySubscription<P>
    where
        F: Fn(&RegistryEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .handlers
            .lock()
            .expect("Registry.subscribe: handlers lock poisoned")
            .push((id, Arc::new(handler)));
        RegistrySubscription { registry: Arc::downgrade(&self.inner), id }
    }

    fn notify(&self, event: RegistryEvent) {
        let handlers: Vec<RegistryHandler> = self
            .inner
            .handlers
            .lock()
            .expect("Registry.notify: handlers lock poisoned")
            .iter()
            .map(|(_, h)| h.clone())
            .collect();
        for handler in handlers {
            let _ = catch_unwind(AssertUnwindSafe(|| handler(&event)));
        }
    }
}

impl<P: RegisteredPolicy> Registry<P> {
    /// Get the instance registered under `name`, creating it with `resolver`
    /// on first use. Later calls return the memoised instance and never
    /// invoke the resolver.
    pub fn get_or_create<F>(&self, name: &str, resolver: F) -> P
    where
        F: FnOnce(&str) -> P,
    {
        if let Some(existing) = self.get(name) {
            return existing;
        }

        // Build outside the lock; resolver is user code.
        let candidate = resolver(name);
        let forward = self.forward_events(&candidate);

        let (policy, added) = {
            let mut entries =
                self.inner.entries.lock().expect("Registry.get_or_create: entries lock poisoned");
            if let Some(entry) = entries.get(name) {
                // Raced with another creator; keep the incumbent.
                forward.cancel();
                (entry.policy.clone(), false)
            } else {
                entries.insert(name.to_owned(), Entry { policy: candidate.clone(), forward });
                (candidate, true)
            }
        };

        if added {
            tracing::debug!(name, "policy registered");
            self.notify(RegistryEvent::EntryAdded { name: name.to_owned() });
        }
        policy
    }

    pub fn get(&self, name: &str) -> Option<P> {
        self.inner
            .entries
            .lock()
            .expect("Registry.get: entries lock poisoned")
            .get(name)
            .map(|entry| entry.policy.clone())
    }

    /// Remove and return the instance registered under `name`.
    pub fn remove(&self, name: &str) -> Option<P> {
        let removed = self
            .inner
            .entries
            .lock()
            .expect("Registry.remove: entries lock poisoned")
            .remove(name);
        removed.map(|entry| {
            entry.forward.cancel();
            self.notify(RegistryEvent::EntryRemoved { name: name.to_owned() });
            entry.policy
        })
    }

    /// Install `policy` under `name`, returning the displaced instance if the
    /// name was taken.
    pub fn replace(&self, name: &str, policy: P) -> Option<P> {
        let forward = self.forward_events(&policy);
        let previous = {
            let mut entries =
                self.inner.entries.lock().expect("Registry.replace: entries lock poisoned");
            entries.insert(name.to_owned(), Entry { policy, forward })
        };
        match previous {
            Some(entry) => {
                entry.forward.cancel();
                self.notify(RegistryEvent::EntryReplaced { name: name.to_owned() });
                Some(entry.policy)
            }
            None => {
                self.notify(RegistryEvent::EntryAdded { name: name.to_owned() });
                None
            }
        }
    }

    /// Snapshot of all registered instances, sorted by name.
    pub fn all(&self) -> Vec<P> {
        let entries = self.inner.entries.lock().expect("Registry.all: entries lock poisoned");
        let mut named: Vec<(&String, &Entry<P>)> = entries.iter().collect();
        named.sort_by(|a, b| a.0.cmp(b.0));
        named.into_iter().map(|(_, entry)| entry.policy.clone()).collect()
    }

    fn forward_events(&self, policy: &P) -> Subscription {
        let merged = self.inner.merged.clone();
        policy.policy_events().subscribe(move |event| merged.publish(event.clone()))
    }
}

/// Cancellation token for a registry lifecycle subscription.
#[derive(Debug)]
pub struct RegistrySubscription<P> {
    registry: Weak<RegistryInner<P>>,
    id: u64,
}

impl<P> RegistrySubscription<P> {
    /// Detach the handler. Idempotent.
    pub fn cancel(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry
                .handlers
                .lock()
                .expect("RegistrySubscription.cancel: handlers lock poisoned")
                .retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;

    fn breaker(name: &str) -> CircuitBreaker {
        CircuitBreaker::new(name, CircuitBreakerConfig::default())
    }

    #[test]
    fn get_or_create_memoises_by_name() {
        let registry = CircuitBreakerRegistry::new();
        let created = Arc::new(AtomicU64::new(0));

        let created_clone = created.clone();
        let first = registry.get_or_create("payments", move |name| {
            created_clone.fetch_add(1, Ordering::SeqCst);
            breaker(name)
        });
        let created_clone = created.clone();
        let second = registry.get_or_create("payments", move |name| {
            created_clone.fetch_add(1, Ordering::SeqCst);
            breaker(name)
        });

        assert_eq!(created.load(Ordering::SeqCst), 1, "resolver runs once per name");
        // Same underlying instance: state changes are visible through both.
        first.force_open();
        assert_eq!(second.state(), first.state());
    }

    #[test]
    fn remove_forgets_the_instance() {
        let registry = CircuitBreakerRegistry::new();
        registry.get_or_create("payments", breaker);

        assert!(registry.remove("payments").is_some());
        assert!(registry.get("payments").is_none());
        assert!(registry.remove("payments").is_none());
    }

    #[test]
    fn replace_swaps_and_returns_the_incumbent() {
        let registry = CircuitBreakerRegistry::new();
        let original = registry.get_or_create("payments", breaker);
        original.force_open();

        let displaced = registry.replace("payments", breaker("payments"));
        assert!(displaced.is_some());

        let current = registry.get("payments").expect("replacement registered");
        assert_ne!(current.state(), displaced.unwrap().state());
    }

    #[test]
    fn all_returns_members_sorted_by_name() {
        let registry = CircuitBreakerRegistry::new();
        registry.get_or_create("zeta", breaker);
        registry.get_or_create("alpha", breaker);

        let names: Vec<String> =
            registry.all().iter().map(|b| b.name().to_owned()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn lifecycle_events_fire_for_add_remove_replace() {
        let registry = CircuitBreakerRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let subscription = registry.subscribe(move |event| {
            seen_clone.lock().unwrap().push(event.clone());
        });

        registry.get_or_create("payments", breaker);
        registry.replace("payments", breaker("payments"));
        registry.remove("payments");

        let events = seen.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                RegistryEvent::EntryAdded { name: "payments".to_owned() },
                RegistryEvent::EntryReplaced { name: "payments".to_owned() },
                RegistryEvent::EntryRemoved { name: "payments".to_owned() },
            ]
        );

        subscription.cancel();
        registry.get_or_create("orders", breaker);
        assert_eq!(seen.lock().unwrap().len(), 3, "cancelled subscriber sees nothing new");
    }

    #[test]
    fn member_events_are_merged_and_tagged() {
        let registry = CircuitBreakerRegistry::new();
        let payments = registry.get_or_create("payments", breaker);
        let orders = registry.get_or_create("orders", breaker);

        payments.force_open();
        orders.force_open();

        let merged = registry.events().history();
        let tags: Vec<&str> = merged.iter().map(|e| &*e.policy).collect();
        assert!(tags.contains(&"payments"));
        assert!(tags.contains(&"orders"));
    }

    #[test]
    fn removed_member_stops_feeding_the_merged_stream() {
        let registry = CircuitBreakerRegistry::new();
        let payments = registry.get_or_create("payments", breaker);

        let removed = registry.remove("payments").expect("registered");
        let before = registry.events().history().len();

        removed.force_open();
        drop(payments);
        assert_eq!(registry.events().history().len(), before);
    }
}
