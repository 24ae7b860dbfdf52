//! Waiting primitives for retry pauses and rate-limiter parking.
//!
//! Policies never call the timer directly; they park on a [`Sleeper`].
//! Swapping in [`RecordingSleeper`] makes timing-sensitive paths resolve
//! instantly in tests, and pairing it with a [`ManualClock`] moves logical
//! time forward by exactly the requested wait, so refill accounting still
//! observes the passage of time it asked for.

use crate::clock::ManualClock;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How a policy pauses: between retry attempts, or until the rate-limiter
/// cycle holding a reserved permit begins.
#[async_trait]
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    async fn sleep(&self, duration: Duration);
}

/// Parks on the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Test double that resolves immediately and records every requested
/// duration, in call order. Built with [`driving`], it also advances a
/// [`ManualClock`] by each slept amount.
///
/// [`driving`]: RecordingSleeper::driving
#[derive(Debug, Clone, Default)]
pub struct RecordingSleeper {
    slept: Arc<Mutex<Vec<Duration>>>,
    clock: Option<ManualClock>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sleeper that advances `clock` by each slept duration, so waits are
    /// observable through the clock without any real delay.
    pub fn driving(clock: ManualClock) -> Self {
        Self { slept: Arc::default(), clock: Some(clock) }
    }

    /// Snapshot of the recorded sleep durations, in call order.
    pub fn slept(&self) -> Vec<Duration> {
        self.slept.lock().expect("RecordingSleeper.slept: mutex poisoned").clone()
    }

    /// Sum of everything slept so far.
    pub fn total_slept(&self) -> Duration {
        self.slept().iter().sum()
    }

    pub fn clear(&self) {
        self.slept.lock().expect("RecordingSleeper.clear: mutex poisoned").clear();
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.slept.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).push(duration);
        if let Some(clock) = &self.clock {
            clock.advance(duration);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;

    #[tokio::test]
    async fn tokio_sleeper_actually_waits() {
        let sleeper = TokioSleeper;
        let start = std::time::Instant::now();
        sleeper.sleep(Duration::from_millis(50)).await;
        // Small tolerance for timing jitter
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[tokio::test]
    async fn recording_sleeper_is_instant_and_remembers() {
        let sleeper = RecordingSleeper::new();
        let start = std::time::Instant::now();

        sleeper.sleep(Duration::from_secs(10)).await;
        sleeper.sleep(Duration::from_secs(20)).await;

        assert!(start.elapsed() < Duration::from_millis(100));
        assert_eq!(sleeper.slept(), vec![Duration::from_secs(10), Duration::from_secs(20)]);
        assert_eq!(sleeper.total_slept(), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn driving_sleeper_advances_the_clock() {
        let clock = ManualClock::new();
        let sleeper = RecordingSleeper::driving(clock.clone());

        sleeper.sleep(Duration::from_millis(250)).await;
        sleeper.sleep(Duration::from_millis(750)).await;

        assert_eq!(clock.now_nanos(), 1_000_000_000);
        assert_eq!(sleeper.slept().len(), 2);
    }

    #[tokio::test]
    async fn clear_forgets_history_but_not_the_clock() {
        let clock = ManualClock::new();
        let sleeper = RecordingSleeper::driving(clock.clone());

        sleeper.sleep(Duration::from_millis(100)).await;
        sleeper.clear();

        assert!(sleeper.slept().is_empty());
        assert_eq!(clock.now_nanos(), 100_000_000, "clock advances survive a clear");
    }
}
