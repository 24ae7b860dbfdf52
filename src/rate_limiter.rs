//! Rate limiter: a refill-based permit dispenser with timed waiting.
//!
//! The whole limiter state is one atomic word packing the active cycle and
//! the permits remaining in it. Permits may go negative: a caller that cannot
//! be served from the current cycle reserves a permit in an upcoming one by
//! driving the count below zero, then parks until that cycle starts. The
//! reservation is cooperative (concurrent waiters each reserve distinct
//! future permits) and bounded by the acquisition timeout.
//!
//! Bit layout: 40 bits of cycle index, 24 bits of two's-complement permits.
//! At the minimum refresh period of 1ms the cycle counter runs for ~34 years
//! before wrapping.

use crate::clock::{Clock, MonotonicClock};
use crate::error::{ConfigError, PolicyError};
use crate::events::{EventBus, EventKind, RateLimiterEvent};
use crate::sleeper::{Sleeper, TokioSleeper};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const PERMIT_BITS: u32 = 24;
const PERMIT_MASK: u64 = (1 << PERMIT_BITS) - 1;
const PERMIT_MIN: i64 = -(1 << (PERMIT_BITS - 1));
const PERMIT_MAX: i64 = (1 << (PERMIT_BITS - 1)) - 1;

/// Largest supported `limit_for_period`; leaves headroom in the packed
/// permit field for outstanding reservations.
pub const MAX_LIMIT_FOR_PERIOD: u32 = 1 << (PERMIT_BITS - 2);

/// Shortest supported refresh period; keeps the packed cycle index from
/// wrapping within any realistic process lifetime.
pub const MIN_REFRESH_PERIOD: Duration = Duration::from_millis(1);

fn pack(cycle: u64, permits: i32) -> u64 {
    (cycle << PERMIT_BITS) | (permits as u32 as u64 & PERMIT_MASK)
}

fn unpack(word: u64) -> (u64, i32) {
    let cycle = word >> PERMIT_BITS;
    // Sign-extend the low 24 bits.
    let permits = (((word & PERMIT_MASK) as u32) << 8) as i32 >> 8;
    (cycle, permits)
}

/// Rate limiter configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RateLimiterConfig {
    /// Permits dispensed per refresh cycle.
    pub limit_for_period: u32,
    /// Cycle duration.
    pub limit_refresh_period: Duration,
    /// Maximum time [`RateLimiter::acquire`] may wait for a permit.
    pub timeout_duration: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            limit_for_period: 50,
            limit_refresh_period: Duration::from_secs(1),
            timeout_duration: Duration::from_secs(5),
        }
    }
}

impl RateLimiterConfig {
    pub fn builder() -> RateLimiterConfigBuilder {
        RateLimiterConfigBuilder { config: Self::default() }
    }
}

pub struct RateLimiterConfigBuilder {
    config: RateLimiterConfig,
}

impl RateLimiterConfigBuilder {
    pub fn limit_for_period(mut self, limit: u32) -> Self {
        self.config.limit_for_period = limit;
        self
    }

    pub fn limit_refresh_period(mut self, period: Duration) -> Self {
        self.config.limit_refresh_period = period;
        self
    }

    /// Zero means acquisition never waits (immediate grant or denial).
    pub fn timeout_duration(mut self, timeout: Duration) -> Self {
        self.config.timeout_duration = timeout;
        self
    }

    pub fn build(self) -> Result<RateLimiterConfig, ConfigError> {
        let c = &self.config;
        if c.limit_for_period == 0 {
            return Err(ConfigError::Zero { field: "limit_for_period" });
        }
        if c.limit_for_period > MAX_LIMIT_FOR_PERIOD {
            return Err(ConfigError::TooLarge {
                field: "limit_for_period",
                value: c.limit_for_period as u64,
                max: MAX_LIMIT_FOR_PERIOD as u64,
            });
        }
        if c.limit_refresh_period < MIN_REFRESH_PERIOD {
            return Err(ConfigError::BelowMinimum {
                field: "limit_refresh_period",
                requested: c.limit_refresh_period,
                min: MIN_REFRESH_PERIOD,
            });
        }
        Ok(self.config)
    }
}

/// Outcome of the lock-free claim step.
enum Claim {
    /// A permit was claimed; the caller must park for `wait` before
    /// proceeding (zero when served from the current cycle).
    Granted { wait: Duration },
    Denied,
}

/// Point-in-time gauge snapshot for exporters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterMetrics {
    /// Permits left in the current cycle; negative when waiters hold
    /// reservations against upcoming cycles.
    pub available_permits: i32,
    /// Refresh cycles elapsed since the limiter was created.
    pub cycle: u64,
}

#[derive(Clone)]
pub struct RateLimiter {
    name: Arc<str>,
    config: Arc<RateLimiterConfig>,
    state: Arc<AtomicU64>,
    bus: EventBus,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("metrics", &self.metrics())
            .finish()
    }
}

impl RateLimiter {
    pub fn new(name: impl Into<Arc<str>>, config: RateLimiterConfig) -> Self {
        let name = name.into();
        let initial = pack(0, config.limit_for_period as i32);
        Self {
            bus: EventBus::new(name.clone()),
            name,
            config: Arc::new(config),
            state: Arc::new(AtomicU64::new(initial)),
            clock: Arc::new(MonotonicClock::default()),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Limiter that never denies; used as the composition-stack passthrough.
    pub fn unlimited(name: impl Into<Arc<str>>) -> Self {
        Self::new(
            name,
            RateLimiterConfig {
                limit_for_period: MAX_LIMIT_FOR_PERIOD,
                limit_refresh_period: Duration::from_secs(1),
                timeout_duration: Duration::ZERO,
            },
        )
    }

    /// Override the clock (useful for deterministic tests). Call before the
    /// limiter is shared.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Override the sleeper used to park waiting acquisitions.
    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Immediate grant or denial; never waits.
    pub fn try_acquire(&self) -> bool {
        match self.claim(Duration::ZERO) {
            Claim::Granted { .. } => {
                self.granted();
                true
            }
            Claim::Denied => {
                self.denied();
                false
            }
        }
    }

    /// Acquire with the configured timeout, parking on the sleeper while the
    /// reserved permit's cycle begins. Dropping the future mid-park hands the
    /// reservation back (best-effort).
    pub async fn acquire(&self) -> bool {
        self.acquire_timeout(self.config.timeout_duration).await
    }

    /// Acquire with an explicit timeout.
    pub async fn acquire_timeout(&self, timeout: Duration) -> bool {
        match self.claim(timeout) {
            Claim::Granted { wait } => {
                if !wait.is_zero() {
                    let reservation = Reservation { limiter: self, armed: true };
                    self.sleeper.sleep(wait).await;
                    reservation.disarm();
                }
                self.granted();
                true
            }
            Claim::Denied => {
                self.denied();
                false
            }
        }
    }

    /// Synchronous acquisition for decorated callables; parks the calling
    /// thread for at most the configured timeout.
    pub fn acquire_blocking(&self) -> bool {
        match self.claim(self.config.timeout_duration) {
            Claim::Granted { wait } => {
                if !wait.is_zero() {
                    std::thread::sleep(wait);
                }
                self.granted();
                true
            }
            Claim::Denied => {
                self.denied();
                false
            }
        }
    }

    /// Polled gauge snapshot. Projects the refill the next claim would see.
    pub fn metrics(&self) -> RateLimiterMetrics {
        let (cycle, permits) = unpack(self.state.load(Ordering::Acquire));
        let now_cycle = self.current_cycle();
        if now_cycle > cycle {
            let elapsed = (now_cycle - cycle) as i64;
            let limit = self.config.limit_for_period as i64;
            let refreshed = (permits as i64)
                .saturating_add(elapsed.saturating_mul(limit))
                .min(limit)
                .clamp(PERMIT_MIN, PERMIT_MAX);
            RateLimiterMetrics { available_permits: refreshed as i32, cycle: now_cycle }
        } else {
            RateLimiterMetrics { available_permits: permits, cycle }
        }
    }

    /// Wrap an async operation: acquire (waiting up to the configured
    /// timeout), then run it. Ignored or failed operations do not return the
    /// consumed permit; the cycle budget accounts for attempts, not results.
    pub async fn execute<T, E, Fut, Op>(&self, mut operation: Op) -> Result<T, PolicyError<E>>
    where
        T: Send,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, PolicyError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        if !self.acquire().await {
            return Err(self.rejection());
        }
        operation().await
    }

    /// Lift a synchronous callable into a rate-limited callable.
    pub fn decorate<T, E, F>(&self, mut f: F) -> impl FnMut() -> Result<T, PolicyError<E>>
    where
        E: std::error::Error + Send + Sync + 'static,
        F: FnMut() -> Result<T, E>,
    {
        let limiter = self.clone();
        move || {
            if !limiter.acquire_blocking() {
                return Err(limiter.rejection());
            }
            f().map_err(PolicyError::Inner)
        }
    }

    pub(crate) fn rejection<E>(&self) -> PolicyError<E> {
        PolicyError::RequestNotPermitted {
            policy: self.name.clone(),
            timeout: self.config.timeout_duration,
        }
    }

    /// CAS loop implementing the refill/reserve algorithm. Emits nothing; the
    /// caller reports the outcome after any parking completes.
    fn claim(&self, timeout: Duration) -> Claim {
        let period = self.config.limit_refresh_period.as_nanos() as u64;
        let limit = self.config.limit_for_period as i64;
        loop {
            let observed = self.state.load(Ordering::Acquire);
            let (cycle, permits) = unpack(observed);
            let now = self.clock.now_nanos();
            let now_cycle = now / period;

            let (new_cycle, refreshed) = if now_cycle > cycle {
                let elapsed = (now_cycle - cycle) as i64;
                (now_cycle, (permits as i64).saturating_add(elapsed.saturating_mul(limit)).min(limit))
            } else {
                (cycle, permits as i64)
            };

            let after = (refreshed - 1).clamp(PERMIT_MIN, PERMIT_MAX);
            let wait_nanos = if after >= 0 {
                0
            } else {
                let deficit = (-after) as u64;
                let cycles_to_wait = (deficit + limit as u64 - 1) / limit as u64;
                (new_cycle + cycles_to_wait).saturating_mul(period).saturating_sub(now)
            };

            if wait_nanos > timeout.as_nanos() as u64 {
                return Claim::Denied;
            }

            let next = pack(new_cycle, after as i32);
            if self
                .state
                .compare_exchange(observed, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Claim::Granted { wait: Duration::from_nanos(wait_nanos) };
            }
            // Lost the CAS; another caller moved the state. Re-read and retry.
        }
    }

    fn current_cycle(&self) -> u64 {
        self.clock.now_nanos() / self.config.limit_refresh_period.as_nanos() as u64
    }

    fn granted(&self) {
        self.bus.emit(EventKind::RateLimiter(RateLimiterEvent::SuccessfulAcquire));
    }

    fn denied(&self) {
        tracing::debug!(policy = %self.name, "rate limiter denied acquisition");
        self.bus.emit(EventKind::RateLimiter(RateLimiterEvent::FailedAcquire));
    }
}

/// Hands a reserved permit back if the waiting caller is cancelled mid-park.
struct Reservation<'a> {
    limiter: &'a RateLimiter,
    armed: bool,
}

impl Reservation<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let _ = self.limiter.state.fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
            let (cycle, permits) = unpack(word);
            Some(pack(cycle, (permits as i64 + 1).clamp(PERMIT_MIN, PERMIT_MAX) as i32))
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::sleeper::RecordingSleeper;
    use std::fmt;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(String);

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "TestError: {}", self.0)
        }
    }

    impl std::error::Error for TestError {}

    fn limiter(limit: u32, period: Duration, timeout: Duration, clock: ManualClock) -> RateLimiter {
        let config = RateLimiterConfig::builder()
            .limit_for_period(limit)
            .limit_refresh_period(period)
            .timeout_duration(timeout)
            .build()
            .expect("valid config");
        RateLimiter::new("api", config).with_clock(clock).with_sleeper(RecordingSleeper::new())
    }

    #[test]
    fn pack_unpack_roundtrips_negative_permits() {
        for permits in [-8_388_608, -1, 0, 1, 8_388_607] {
            let (cycle, unpacked) = unpack(pack(123_456, permits));
            assert_eq!(cycle, 123_456);
            assert_eq!(unpacked, permits);
        }
    }

    #[test]
    fn grants_at_most_limit_per_cycle() {
        let clock = ManualClock::new();
        let limiter = limiter(5, Duration::from_secs(1), Duration::ZERO, clock.clone());

        let granted = (0..10).filter(|_| limiter.try_acquire()).count();
        assert_eq!(granted, 5);

        clock.advance(Duration::from_secs(1));
        let granted = (0..10).filter(|_| limiter.try_acquire()).count();
        assert_eq!(granted, 5, "refill restores exactly the period limit");
    }

    #[tokio::test]
    async fn denies_within_timeout_when_cycle_exhausted() {
        let clock = ManualClock::new();
        let limiter =
            limiter(1, Duration::from_secs(1), Duration::from_millis(100), clock.clone());

        assert!(limiter.acquire().await, "first permit of the cycle");
        assert!(!limiter.acquire().await, "next refresh is 1s away, timeout is 100ms");

        let history = limiter.events().history();
        assert!(matches!(
            history[0].kind,
            EventKind::RateLimiter(RateLimiterEvent::SuccessfulAcquire)
        ));
        assert!(matches!(
            history[1].kind,
            EventKind::RateLimiter(RateLimiterEvent::FailedAcquire)
        ));
    }

    #[tokio::test]
    async fn waiting_acquire_reserves_upcoming_cycles() {
        let clock = ManualClock::new();
        let sleeper = RecordingSleeper::new();
        let config = RateLimiterConfig::builder()
            .limit_for_period(1)
            .limit_refresh_period(Duration::from_secs(1))
            .timeout_duration(Duration::from_secs(2))
            .build()
            .expect("valid config");
        let limiter = RateLimiter::new("api", config)
            .with_clock(clock.clone())
            .with_sleeper(sleeper.clone());

        assert!(limiter.acquire().await, "cycle 0 permit");
        assert!(limiter.acquire().await, "reserves the cycle 1 permit");
        assert!(limiter.acquire().await, "reserves the cycle 2 permit");
        assert!(!limiter.acquire().await, "cycle 3 is beyond the 2s timeout");

        assert_eq!(
            sleeper.slept(),
            vec![Duration::from_secs(1), Duration::from_secs(2)],
            "each waiter parks until its reserved cycle starts"
        );
    }

    #[tokio::test]
    async fn driving_sleeper_moves_waiters_through_fresh_cycles() {
        let clock = ManualClock::new();
        let sleeper = RecordingSleeper::driving(clock.clone());
        let config = RateLimiterConfig::builder()
            .limit_for_period(1)
            .limit_refresh_period(Duration::from_secs(1))
            .timeout_duration(Duration::from_secs(1))
            .build()
            .expect("valid config");
        let limiter = RateLimiter::new("api", config)
            .with_clock(clock.clone())
            .with_sleeper(sleeper.clone());

        // Each wait advances the clock into the reserved cycle, so every
        // follow-up claim starts from a fresh cycle and never times out.
        for _ in 0..4 {
            assert!(limiter.acquire().await);
        }
        assert_eq!(sleeper.slept(), vec![Duration::from_secs(1); 3]);
        assert_eq!(limiter.metrics().cycle, 3);
    }

    #[test]
    fn metrics_project_the_refill() {
        let clock = ManualClock::new();
        let limiter = limiter(3, Duration::from_secs(1), Duration::ZERO, clock.clone());

        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert_eq!(limiter.metrics().available_permits, 1);

        clock.advance(Duration::from_secs(5));
        let metrics = limiter.metrics();
        assert_eq!(metrics.available_permits, 3, "refill caps at the period limit");
        assert_eq!(metrics.cycle, 5);
    }

    #[tokio::test]
    async fn cancelled_waiter_returns_its_reservation() {
        let clock = ManualClock::new();
        let config = RateLimiterConfig::builder()
            .limit_for_period(1)
            .limit_refresh_period(Duration::from_secs(1))
            .timeout_duration(Duration::from_secs(5))
            .build()
            .expect("valid config");
        // Real tokio sleeper so the waiter actually parks.
        let limiter = RateLimiter::new("api", config).with_clock(clock.clone());

        assert!(limiter.try_acquire());
        assert_eq!(limiter.metrics().available_permits, 0);

        {
            let waiting = limiter.acquire();
            futures::pin_mut!(waiting);
            assert!(futures::poll!(waiting.as_mut()).is_pending());
            // Dropped here while parked on its reservation.
        }

        assert_eq!(
            limiter.metrics().available_permits,
            0,
            "reservation handed back: cycle 0 is merely spent, not over-reserved"
        );
    }

    #[tokio::test]
    async fn execute_wraps_operations() {
        let clock = ManualClock::new();
        let limiter = limiter(1, Duration::from_secs(1), Duration::ZERO, clock.clone());

        let ok = limiter
            .execute(|| async { Ok::<_, PolicyError<TestError>>(7) })
            .await;
        assert_eq!(ok.unwrap(), 7);

        let rejected = limiter
            .execute(|| async { Ok::<_, PolicyError<TestError>>(8) })
            .await;
        assert!(matches!(rejected, Err(e) if e.is_request_not_permitted()));
    }

    #[test]
    fn decorate_blocks_briefly_then_grants() {
        let config = RateLimiterConfig::builder()
            .limit_for_period(1)
            .limit_refresh_period(Duration::from_millis(20))
            .timeout_duration(Duration::from_millis(200))
            .build()
            .expect("valid config");
        let limiter = RateLimiter::new("api", config);

        let mut protected = limiter.decorate(|| Ok::<_, TestError>(1));
        assert_eq!(protected().unwrap(), 1);
        // Second call waits for the next 20ms cycle on the calling thread.
        assert_eq!(protected().unwrap(), 1);
    }

    #[test]
    fn unlimited_limiter_never_denies() {
        let limiter = RateLimiter::unlimited("open");
        for _ in 0..10_000 {
            assert!(limiter.try_acquire());
        }
    }

    #[test]
    fn builder_validates_bounds() {
        assert!(matches!(
            RateLimiterConfig::builder().limit_for_period(0).build(),
            Err(ConfigError::Zero { .. })
        ));
        assert!(matches!(
            RateLimiterConfig::builder().limit_for_period(MAX_LIMIT_FOR_PERIOD + 1).build(),
            Err(ConfigError::TooLarge { .. })
        ));
        assert!(matches!(
            RateLimiterConfig::builder().limit_refresh_period(Duration::from_micros(10)).build(),
            Err(ConfigError::BelowMinimum { .. })
        ));
    }
}
