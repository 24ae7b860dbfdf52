//! Bulkhead: a bounded concurrent-call gate with timed acquisition.
//!
//! Counting-semaphore semantics over `max_concurrent_calls`. Acquisition
//! parks for at most `max_wait_duration`; completion is an RAII concern.
//! Dropping the [`BulkheadPermit`] releases the slot and emits `CallFinished`
//! exactly once, so crashed or cancelled callers can never leak permits.

use crate::error::{ConfigError, PolicyError};
use crate::events::{BulkheadEvent, EventBus, EventKind};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bulkhead configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BulkheadConfig {
    pub max_concurrent_calls: usize,
    /// How long an acquisition may wait for a slot. Zero means reject
    /// immediately when saturated.
    pub max_wait_duration: Duration,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self { max_concurrent_calls: 25, max_wait_duration: Duration::ZERO }
    }
}

impl BulkheadConfig {
    pub fn new(max_concurrent_calls: usize, max_wait_duration: Duration) -> Result<Self, ConfigError> {
        if max_concurrent_calls == 0 {
            return Err(ConfigError::Zero { field: "max_concurrent_calls" });
        }
        Ok(Self { max_concurrent_calls, max_wait_duration })
    }
}

/// Point-in-time gauge snapshot for exporters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkheadMetrics {
    pub available_permits: usize,
    pub max_concurrent_calls: usize,
}

#[derive(Clone)]
pub struct Bulkhead {
    name: Arc<str>,
    config: Arc<BulkheadConfig>,
    semaphore: Arc<Semaphore>,
    bus: EventBus,
}

impl fmt::Debug for Bulkhead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bulkhead")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("available_permits", &self.semaphore.available_permits())
            .finish()
    }
}

impl Bulkhead {
    pub fn new(name: impl Into<Arc<str>>, config: BulkheadConfig) -> Self {
        let name = name.into();
        Self {
            bus: EventBus::new(name.clone()),
            name,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_calls)),
            config: Arc::new(config),
        }
    }

    /// Bulkhead that never rejects; used as the composition-stack passthrough.
    pub fn unlimited(name: impl Into<Arc<str>>) -> Self {
        // Semaphore::MAX_PERMITS is roughly usize::MAX >> 3; a billion slots
        // is a safe stand-in for "no limit".
        Self::new(
            name,
            BulkheadConfig { max_concurrent_calls: 1_000_000_000, max_wait_duration: Duration::ZERO },
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    pub fn config(&self) -> &BulkheadConfig {
        &self.config
    }

    /// Immediate acquisition; never parks regardless of the wait budget.
    pub fn try_acquire(&self) -> Option<BulkheadPermit> {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => Some(self.permitted(permit)),
            Err(_) => {
                self.rejected();
                None
            }
        }
    }

    /// Acquire a slot, parking up to `max_wait_duration` for one to free up.
    pub async fn acquire(&self) -> Option<BulkheadPermit> {
        if self.config.max_wait_duration.is_zero() {
            return self.try_acquire();
        }
        let acquired =
            tokio::time::timeout(self.config.max_wait_duration, self.semaphore.clone().acquire_owned())
                .await;
        match acquired {
            Ok(Ok(permit)) => Some(self.permitted(permit)),
            // The semaphore is never closed, so the inner error is unreachable
            // in practice; treat both shapes as a rejection.
            Ok(Err(_)) | Err(_) => {
                self.rejected();
                None
            }
        }
    }

    /// Polled gauge snapshot.
    pub fn metrics(&self) -> BulkheadMetrics {
        BulkheadMetrics {
            available_permits: self.semaphore.available_permits(),
            max_concurrent_calls: self.config.max_concurrent_calls,
        }
    }

    /// Wrap an async operation: acquire, run, release on every exit path.
    ///
    /// The permit is scoped to the returned future, so cancellation releases
    /// it exactly once; outcome classification never affects accounting.
    pub async fn execute<T, E, Fut, Op>(&self, mut operation: Op) -> Result<T, PolicyError<E>>
    where
        T: Send,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, PolicyError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let Some(permit) = self.acquire().await else {
            return Err(self.rejection());
        };
        let result = operation().await;
        permit.complete();
        result
    }

    /// Lift a synchronous callable into a concurrency-gated callable.
    /// Acquisition is immediate (no parking on the calling thread).
    pub fn decorate<T, E, F>(&self, mut f: F) -> impl FnMut() -> Result<T, PolicyError<E>>
    where
        E: std::error::Error + Send + Sync + 'static,
        F: FnMut() -> Result<T, E>,
    {
        let bulkhead = self.clone();
        move || {
            let Some(permit) = bulkhead.try_acquire() else {
                return Err(bulkhead.rejection());
            };
            let result = f().map_err(PolicyError::Inner);
            permit.complete();
            result
        }
    }

    pub(crate) fn rejection<E>(&self) -> PolicyError<E> {
        PolicyError::BulkheadFull {
            policy: self.name.clone(),
            max_concurrent: self.config.max_concurrent_calls,
        }
    }

    fn permitted(&self, permit: OwnedSemaphorePermit) -> BulkheadPermit {
        self.bus.emit(EventKind::Bulkhead(BulkheadEvent::CallPermitted));
        BulkheadPermit { permit: Some(permit), bus: self.bus.clone() }
    }

    fn rejected(&self) {
        tracing::debug!(
            policy = %self.name,
            max_concurrent = self.config.max_concurrent_calls,
            "bulkhead rejected call"
        );
        self.bus.emit(EventKind::Bulkhead(BulkheadEvent::CallRejected));
    }
}

/// A held bulkhead slot. Releasing is idempotent by construction: the slot
/// returns and `CallFinished` fires exactly once, on [`complete`] or drop,
/// whichever comes first.
///
/// [`complete`]: BulkheadPermit::complete
#[derive(Debug)]
#[must_use = "holding the permit is what gates concurrency; drop or complete() it when done"]
pub struct BulkheadPermit {
    permit: Option<OwnedSemaphorePermit>,
    bus: EventBus,
}

impl BulkheadPermit {
    /// Explicitly finish the call and release the slot.
    pub fn complete(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(permit) = self.permit.take() {
            drop(permit);
            self.bus.emit(EventKind::Bulkhead(BulkheadEvent::CallFinished));
        }
    }
}

impl Drop for BulkheadPermit {
    fn drop(&mut self) {
        self.release();
    }
}
