//! Circuit breaker: a five-state machine over a sliding outcome window.
//!
//! The hot path is lock-free: the current state lives in an
//! [`arc_swap::ArcSwap`] pointing at an immutable [`Generation`]. A state
//! transition installs a fresh generation (new number, new window) with a
//! pointer compare-and-swap; losing the race means another caller already
//! transitioned and the loser simply re-reads. Permits are stamped with the
//! generation number they were granted under, so an outcome reported after a
//! transition is attributed to the window that permitted the call, a window
//! that no longer exists, and is dropped rather than polluting the new one.

use crate::clock::{Clock, MonotonicClock};
use crate::error::{ConfigError, PolicyError};
use crate::events::{CircuitBreakerEvent, EventBus, EventKind};
use crate::window::{classify_success, Outcome, SlidingWindow, WindowType};
use arc_swap::ArcSwap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Upper bound guarding accidental `Duration::MAX`-style wait configuration.
pub const MAX_WAIT_IN_OPEN: Duration = Duration::from_secs(30 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls permitted; outcomes feed the closed-state window.
    Closed,
    /// Calls denied until the open-state wait elapses.
    Open,
    /// A bounded number of trial calls decide between closing and reopening.
    HalfOpen,
    /// Always permits, records nothing; left only by explicit command.
    Disabled,
    /// Always denies, records nothing; left only by explicit command.
    ForcedOpen,
}

impl CircuitState {
    /// Stable numeric form for gauge exporters.
    pub fn ordinal(self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
            CircuitState::Disabled => 3,
            CircuitState::ForcedOpen => 4,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
            CircuitState::Disabled => "disabled",
            CircuitState::ForcedOpen => "forced-open",
        };
        write!(f, "{}", name)
    }
}

type ErrorPredicate = Arc<dyn Fn(&(dyn std::error::Error + 'static)) -> bool + Send + Sync>;

fn record_all() -> ErrorPredicate {
    Arc::new(|_| true)
}

fn ignore_none() -> ErrorPredicate {
    Arc::new(|_| false)
}

/// Circuit breaker configuration. Build via [`CircuitBreakerConfig::builder`].
#[derive(Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CircuitBreakerConfig {
    pub failure_rate_threshold: f32,
    pub slow_call_rate_threshold: f32,
    pub slow_call_duration_threshold: Duration,
    pub permitted_calls_in_half_open: u32,
    pub window_type: WindowType,
    pub window_size: u32,
    pub minimum_number_of_calls: u32,
    pub wait_duration_in_open: Duration,
    pub automatic_half_open: bool,
    #[cfg_attr(feature = "serde", serde(skip, default = "record_all"))]
    record_error: ErrorPredicate,
    #[cfg_attr(feature = "serde", serde(skip, default = "ignore_none"))]
    ignore_error: ErrorPredicate,
}

impl fmt::Debug for CircuitBreakerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerConfig")
            .field("failure_rate_threshold", &self.failure_rate_threshold)
            .field("slow_call_rate_threshold", &self.slow_call_rate_threshold)
            .field("slow_call_duration_threshold", &self.slow_call_duration_threshold)
            .field("permitted_calls_in_half_open", &self.permitted_calls_in_half_open)
            .field("window_type", &self.window_type)
            .field("window_size", &self.window_size)
            .field("minimum_number_of_calls", &self.minimum_number_of_calls)
            .field("wait_duration_in_open", &self.wait_duration_in_open)
            .field("automatic_half_open", &self.automatic_half_open)
            .finish()
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 50.0,
            slow_call_rate_threshold: 100.0,
            slow_call_duration_threshold: Duration::from_secs(60),
            permitted_calls_in_half_open: 10,
            window_type: WindowType::CountBased,
            window_size: 100,
            minimum_number_of_calls: 100,
            wait_duration_in_open: Duration::from_secs(60),
            automatic_half_open: false,
            record_error: record_all(),
            ignore_error: ignore_none(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder { config: Self::default() }
    }
}

pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    /// Failure percentage at or above which a saturated window opens the
    /// circuit. Must be within (0, 100].
    pub fn failure_rate_threshold(mut self, percent: f32) -> Self {
        self.config.failure_rate_threshold = percent;
        self
    }

    /// Slow-call percentage at or above which a saturated window opens the
    /// circuit. Must be within (0, 100].
    pub fn slow_call_rate_threshold(mut self, percent: f32) -> Self {
        self.config.slow_call_rate_threshold = percent;
        self
    }

    /// Successful calls taking at least this long count as slow.
    pub fn slow_call_duration_threshold(mut self, threshold: Duration) -> Self {
        self.config.slow_call_duration_threshold = threshold;
        self
    }

    pub fn permitted_calls_in_half_open(mut self, calls: u32) -> Self {
        self.config.permitted_calls_in_half_open = calls;
        self
    }

    pub fn sliding_window(mut self, window_type: WindowType, size: u32) -> Self {
        self.config.window_type = window_type;
        self.config.window_size = size;
        self
    }

    pub fn minimum_number_of_calls(mut self, calls: u32) -> Self {
        self.config.minimum_number_of_calls = calls;
        self
    }

    pub fn wait_duration_in_open(mut self, wait: Duration) -> Self {
        self.config.wait_duration_in_open = wait;
        self
    }

    /// When enabled, entering OPEN schedules a single-shot task that performs
    /// the OPEN → HALF_OPEN transition; otherwise the transition is lazy.
    pub fn automatic_half_open(mut self, enabled: bool) -> Self {
        self.config.automatic_half_open = enabled;
        self
    }

    /// An error counts against the window only if this predicate accepts it.
    pub fn record_error<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&(dyn std::error::Error + 'static)) -> bool + Send + Sync + 'static,
    {
        self.config.record_error = Arc::new(predicate);
        self
    }

    /// An error matching this predicate bypasses the window entirely (it is
    /// still propagated to the caller).
    pub fn ignore_error<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&(dyn std::error::Error + 'static)) -> bool + Send + Sync + 'static,
    {
        self.config.ignore_error = Arc::new(predicate);
        self
    }

    pub fn build(self) -> Result<CircuitBreakerConfig, ConfigError> {
        let c = &self.config;
        for (field, value) in [
            ("failure_rate_threshold", c.failure_rate_threshold),
            ("slow_call_rate_threshold", c.slow_call_rate_threshold),
        ] {
            if !(value > 0.0 && value <= 100.0) {
                return Err(ConfigError::RateOutOfRange { field, value, min: 0.0, max: 100.0 });
            }
        }
        if c.permitted_calls_in_half_open == 0 {
            return Err(ConfigError::Zero { field: "permitted_calls_in_half_open" });
        }
        if c.window_size == 0 {
            return Err(ConfigError::Zero { field: "window_size" });
        }
        if c.minimum_number_of_calls == 0 {
            return Err(ConfigError::Zero { field: "minimum_number_of_calls" });
        }
        if c.wait_duration_in_open.is_zero() {
            return Err(ConfigError::Zero { field: "wait_duration_in_open" });
        }
        if c.wait_duration_in_open > MAX_WAIT_IN_OPEN {
            return Err(ConfigError::ExceedsMaximum {
                field: "wait_duration_in_open",
                requested: c.wait_duration_in_open,
                limit: MAX_WAIT_IN_OPEN,
            });
        }
        Ok(self.config)
    }
}

/// One epoch of the state machine. Immutable except for the interior-mutable
/// window and the half-open trial counter.
struct Generation {
    number: u64,
    state: CircuitState,
    window: SlidingWindow,
    opened_at_nanos: u64,
    half_open_taken: AtomicU32,
}

/// Grant to proceed, stamped with the generation it was issued under.
///
/// Every permit must be consumed by exactly one of [`CircuitBreaker::on_success`],
/// [`CircuitBreaker::on_error`], [`CircuitBreaker::on_result_failure`], or
/// [`CircuitBreaker::release`].
#[derive(Debug)]
#[must_use = "a permit must be paired with a terminal report or released"]
pub struct CircuitPermit {
    generation: u64,
}

/// Point-in-time gauge snapshot for exporters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    pub total_calls: u32,
    pub failed_calls: u32,
    pub slow_calls: u32,
    pub failure_rate: f32,
    pub slow_call_rate: f32,
    pub not_permitted_calls: u64,
}

#[derive(Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: Arc<CircuitBreakerConfig>,
    generation: Arc<ArcSwap<Generation>>,
    bus: EventBus,
    clock: Arc<dyn Clock>,
    not_permitted: Arc<AtomicU64>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("config", &self.config)
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<Arc<str>>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        let initial = Generation {
            number: 0,
            state: CircuitState::Closed,
            window: closed_window(&config),
            opened_at_nanos: 0,
            half_open_taken: AtomicU32::new(0),
        };
        Self {
            bus: EventBus::new(name.clone()),
            name,
            config: Arc::new(config),
            generation: Arc::new(ArcSwap::from_pointee(initial)),
            clock: Arc::new(MonotonicClock::default()),
            not_permitted: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Breaker with default configuration.
    pub fn with_defaults(name: impl Into<Arc<str>>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    /// Override the clock (useful for deterministic tests). Call before the
    /// breaker is shared.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    pub fn state(&self) -> CircuitState {
        self.generation.load().state
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Request permission for one call.
    ///
    /// Returns `None` when the circuit denies the call; a `NotPermitted`
    /// event is emitted. In OPEN state an elapsed wait duration triggers the
    /// lazy transition to HALF_OPEN before granting.
    pub fn try_acquire(&self) -> Option<CircuitPermit> {
        loop {
            let generation = self.generation.load_full();
            match generation.state {
                CircuitState::Closed | CircuitState::Disabled => {
                    return Some(CircuitPermit { generation: generation.number });
                }
                CircuitState::ForcedOpen => {
                    self.note_rejection();
                    return None;
                }
                CircuitState::Open => {
                    let now = self.clock.now_nanos();
                    let elapsed = now.saturating_sub(generation.opened_at_nanos);
                    if elapsed < self.config.wait_duration_in_open.as_nanos() as u64 {
                        self.note_rejection();
                        return None;
                    }
                    // Wait elapsed: promote to half-open and retry; a losing
                    // CAS means someone else already moved the state machine.
                    self.transition(&generation, CircuitState::HalfOpen);
                }
                CircuitState::HalfOpen => {
                    let taken = generation.half_open_taken.fetch_add(1, Ordering::AcqRel);
                    if taken >= self.config.permitted_calls_in_half_open {
                        generation.half_open_taken.fetch_sub(1, Ordering::Release);
                        self.note_rejection();
                        return None;
                    }
                    return Some(CircuitPermit { generation: generation.number });
                }
            }
        }
    }

    /// Return a permit without reporting an outcome (cancellation path).
    /// Frees the half-open trial slot the permit occupied, if any.
    pub fn release(&self, permit: CircuitPermit) {
        let generation = self.generation.load_full();
        if generation.number == permit.generation && generation.state == CircuitState::HalfOpen {
            generation.half_open_taken.fetch_sub(1, Ordering::Release);
        }
    }

    /// Report a successful call. The duration decides slow-call
    /// classification against the configured threshold.
    pub fn on_success(&self, permit: CircuitPermit, duration: Duration) {
        let Some(generation) = self.current_for(&permit) else { return };
        let outcome = classify_success(duration, self.config.slow_call_duration_threshold);
        let now = self.clock.now_nanos();
        generation.window.record(outcome, now);
        self.bus.emit(EventKind::CircuitBreaker(CircuitBreakerEvent::Success { duration }));
        self.evaluate(&generation, now);
    }

    /// Report a failed call. Classification runs first: an error is recorded
    /// iff the record predicate accepts it and the ignore predicate does not.
    /// Ignored errors emit `IgnoredError`, return the half-open trial slot,
    /// and leave the window untouched.
    pub fn on_error(
        &self,
        permit: CircuitPermit,
        duration: Duration,
        error: &(dyn std::error::Error + 'static),
    ) {
        let Some(generation) = self.current_for(&permit) else { return };
        if !(self.config.record_error)(error) || (self.config.ignore_error)(error) {
            if generation.state == CircuitState::HalfOpen {
                generation.half_open_taken.fetch_sub(1, Ordering::Release);
            }
            self.bus.emit(EventKind::CircuitBreaker(CircuitBreakerEvent::IgnoredError {
                message: error.to_string(),
            }));
            return;
        }
        self.record_failure(&generation, duration, error.to_string());
    }

    /// Report a call whose successful *value* was classified as a failure by
    /// a result predicate (programmatic-only option on the adapters).
    pub fn on_result_failure(&self, permit: CircuitPermit, duration: Duration) {
        let Some(generation) = self.current_for(&permit) else { return };
        self.record_failure(&generation, duration, "result classified as failure".to_owned());
    }

    /// Polled gauge snapshot.
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let generation = self.generation.load_full();
        let snap = generation.window.snapshot(self.clock.now_nanos());
        CircuitBreakerMetrics {
            state: generation.state,
            total_calls: snap.total_calls,
            failed_calls: snap.failed_calls,
            slow_calls: snap.slow_calls,
            failure_rate: snap.failure_rate,
            slow_call_rate: snap.slow_call_rate,
            not_permitted_calls: self.not_permitted.load(Ordering::Relaxed),
        }
    }

    /// Reset to CLOSED with a fresh window and emit `Reset`.
    pub fn reset(&self) {
        loop {
            let current = self.generation.load_full();
            let next = Arc::new(Generation {
                number: current.number + 1,
                state: CircuitState::Closed,
                window: closed_window(&self.config),
                opened_at_nanos: 0,
                half_open_taken: AtomicU32::new(0),
            });
            let previous =
                arc_swap::Guard::into_inner(self.generation.compare_and_swap(&current, next));
            if Arc::ptr_eq(&previous, &current) {
                break;
            }
        }
        tracing::info!(policy = %self.name, "circuit breaker reset");
        self.bus.emit(EventKind::CircuitBreaker(CircuitBreakerEvent::Reset));
    }

    /// Stop recording and permit everything until told otherwise.
    pub fn disable(&self) {
        self.force_state(CircuitState::Disabled);
    }

    /// Deny everything until told otherwise.
    pub fn force_open(&self) {
        self.force_state(CircuitState::ForcedOpen);
    }

    pub fn transition_to_closed(&self) {
        self.force_state(CircuitState::Closed);
    }

    pub fn transition_to_open(&self) {
        self.force_state(CircuitState::Open);
    }

    /// Wrap an async operation: acquire, run, measure, report.
    ///
    /// Dropping the returned future mid-flight releases the permit without an
    /// outcome report.
    pub async fn execute<T, E, Fut, Op>(&self, mut operation: Op) -> Result<T, PolicyError<E>>
    where
        T: Send,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, PolicyError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let Some(permit) = self.try_acquire() else {
            return Err(self.rejection());
        };
        let mut guard = PermitGuard::new(self.clone(), permit);
        let start = Instant::now();
        let result = operation().await;
        let elapsed = start.elapsed();
        match &result {
            Ok(_) => self.on_success(guard.disarm(), elapsed),
            Err(err) => self.on_error(guard.disarm(), elapsed, err),
        }
        result
    }

    /// Like [`execute`], additionally treating any `Ok` value accepted by
    /// `record_result` as a failure outcome.
    ///
    /// [`execute`]: CircuitBreaker::execute
    pub async fn execute_classified<T, E, Fut, Op, R>(
        &self,
        mut operation: Op,
        record_result: R,
    ) -> Result<T, PolicyError<E>>
    where
        T: Send,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, PolicyError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
        R: Fn(&T) -> bool + Send,
    {
        let Some(permit) = self.try_acquire() else {
            return Err(self.rejection());
        };
        let mut guard = PermitGuard::new(self.clone(), permit);
        let start = Instant::now();
        let result = operation().await;
        let elapsed = start.elapsed();
        match &result {
            Ok(value) if record_result(value) => self.on_result_failure(guard.disarm(), elapsed),
            Ok(_) => self.on_success(guard.disarm(), elapsed),
            Err(err) => self.on_error(guard.disarm(), elapsed, err),
        }
        result
    }

    /// Lift a synchronous callable into a protected callable.
    pub fn decorate<T, E, F>(&self, mut f: F) -> impl FnMut() -> Result<T, PolicyError<E>>
    where
        E: std::error::Error + Send + Sync + 'static,
        F: FnMut() -> Result<T, E>,
    {
        let breaker = self.clone();
        move || {
            let Some(permit) = breaker.try_acquire() else {
                return Err(breaker.rejection());
            };
            let start = Instant::now();
            match f() {
                Ok(value) => {
                    breaker.on_success(permit, start.elapsed());
                    Ok(value)
                }
                Err(e) => {
                    breaker.on_error(permit, start.elapsed(), &e);
                    Err(PolicyError::Inner(e))
                }
            }
        }
    }

    pub(crate) fn rejection<E>(&self) -> PolicyError<E> {
        PolicyError::CallNotPermitted { policy: self.name.clone(), state: self.state() }
    }

    /// Current generation, but only if the permit was issued under it and the
    /// state records outcomes.
    fn current_for(&self, permit: &CircuitPermit) -> Option<Arc<Generation>> {
        let generation = self.generation.load_full();
        if generation.number != permit.generation {
            // The state machine moved on; the permitting window is gone.
            return None;
        }
        match generation.state {
            CircuitState::Disabled | CircuitState::ForcedOpen => None,
            _ => Some(generation),
        }
    }

    fn record_failure(&self, generation: &Arc<Generation>, duration: Duration, message: String) {
        let now = self.clock.now_nanos();
        generation.window.record(Outcome::Failure, now);
        self.bus
            .emit(EventKind::CircuitBreaker(CircuitBreakerEvent::Error { duration, message }));
        self.evaluate(generation, now);
    }

    fn evaluate(&self, generation: &Arc<Generation>, now: u64) {
        let snap = generation.window.snapshot(now);
        if !snap.saturated {
            return;
        }
        let failure = snap.failure_rate >= self.config.failure_rate_threshold;
        let slow = snap.slow_call_rate >= self.config.slow_call_rate_threshold;
        match generation.state {
            CircuitState::Closed | CircuitState::HalfOpen if failure || slow => {
                if self.transition(generation, CircuitState::Open) {
                    let kind = if failure {
                        CircuitBreakerEvent::FailureRateExceeded { rate: snap.failure_rate }
                    } else {
                        CircuitBreakerEvent::SlowCallRateExceeded { rate: snap.slow_call_rate }
                    };
                    self.bus.emit(EventKind::CircuitBreaker(kind));
                }
            }
            CircuitState::HalfOpen => {
                // All trial outcomes in and below both thresholds.
                self.transition(generation, CircuitState::Closed);
            }
            _ => {}
        }
    }

    /// Install the next generation iff `from` is still current. Returns
    /// whether this caller effected the transition.
    fn transition(&self, from: &Arc<Generation>, to: CircuitState) -> bool {
        let now = self.clock.now_nanos();
        let next = Arc::new(Generation {
            number: from.number + 1,
            state: to,
            window: match to {
                CircuitState::Closed => closed_window(&self.config),
                CircuitState::HalfOpen => half_open_window(&self.config),
                _ => idle_window(),
            },
            opened_at_nanos: if to == CircuitState::Open { now } else { 0 },
            half_open_taken: AtomicU32::new(0),
        });
        let previous = arc_swap::Guard::into_inner(self.generation.compare_and_swap(from, next));
        if !Arc::ptr_eq(&previous, from) {
            return false;
        }
        tracing::info!(
            policy = %self.name,
            from = %from.state,
            to = %to,
            generation = from.number + 1,
            "circuit breaker state transition"
        );
        self.bus.emit(EventKind::CircuitBreaker(CircuitBreakerEvent::StateTransition {
            from: from.state,
            to,
        }));
        if to == CircuitState::Open && self.config.automatic_half_open {
            self.schedule_half_open(from.number + 1);
        }
        true
    }

    fn force_state(&self, to: CircuitState) {
        loop {
            let current = self.generation.load_full();
            if current.state == to {
                return;
            }
            if self.transition(&current, to) {
                return;
            }
        }
    }

    /// Single-shot task performing OPEN → HALF_OPEN once the wait elapses.
    /// The generation stamp makes stale wakeups no-ops, so state changes in
    /// the meantime implicitly cancel the task.
    fn schedule_half_open(&self, open_generation: u64) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            // No runtime available; fall back to the lazy transition.
            return;
        };
        let breaker = self.clone();
        let wait = self.config.wait_duration_in_open;
        handle.spawn(async move {
            tokio::time::sleep(wait).await;
            let generation = breaker.generation.load_full();
            if generation.number == open_generation && generation.state == CircuitState::Open {
                breaker.transition(&generation, CircuitState::HalfOpen);
            }
        });
    }

    fn note_rejection(&self) {
        self.not_permitted.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(policy = %self.name, state = %self.state(), "call not permitted");
        self.bus.emit(EventKind::CircuitBreaker(CircuitBreakerEvent::NotPermitted));
    }
}

/// Releases an unconsumed permit when an adapter future is dropped mid-call.
pub(crate) struct PermitGuard {
    breaker: CircuitBreaker,
    permit: Option<CircuitPermit>,
}

impl PermitGuard {
    pub(crate) fn new(breaker: CircuitBreaker, permit: CircuitPermit) -> Self {
        Self { breaker, permit: Some(permit) }
    }

    pub(crate) fn disarm(&mut self) -> CircuitPermit {
        self.permit.take().expect("PermitGuard.disarm: permit already taken")
    }
}

impl Drop for PermitGuard {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            self.breaker.release(permit);
        }
    }
}

fn closed_window(config: &CircuitBreakerConfig) -> SlidingWindow {
    SlidingWindow::new(config.window_type, config.window_size, config.minimum_number_of_calls)
}

fn half_open_window(config: &CircuitBreakerConfig) -> SlidingWindow {
    SlidingWindow::new(
        WindowType::CountBased,
        config.permitted_calls_in_half_open,
        config.permitted_calls_in_half_open,
    )
}

/// Placeholder for states that never record outcomes.
fn idle_window() -> SlidingWindow {
    SlidingWindow::new(WindowType::CountBased, 1, 1)
}
