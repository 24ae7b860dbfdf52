//! Interval functions for retry policies: backoff growth plus jitter.
//!
//! The wait before attempt N is `jitter.apply(backoff.delay(N))`, a pure
//! function of the 1-based attempt number, so schedules are reproducible in
//! tests with [`Jitter::None`].

use rand::Rng;
use std::time::Duration;

/// Hard ceiling on computed delays; guards against runaway exponential growth.
pub const MAX_BACKOFF: Duration = Duration::from_secs(60 * 60);

/// Backoff growth strategy.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Backoff {
    /// Fixed delay between attempts.
    Constant { delay: Duration },
    /// Delay grows linearly with the attempt number.
    Linear { base: Duration },
    /// Delay grows geometrically: `base * factor^(attempt - 1)`, optionally
    /// capped.
    Exponential { base: Duration, factor: f64, max: Option<Duration> },
}

impl Backoff {
    pub fn constant(delay: Duration) -> Self {
        Backoff::Constant { delay }
    }

    pub fn linear(base: Duration) -> Self {
        Backoff::Linear { base }
    }

    /// Exponential backoff with the conventional doubling factor.
    pub fn exponential(base: Duration) -> Self {
        Backoff::Exponential { base, factor: 2.0, max: None }
    }

    /// Exponential backoff with an explicit multiplier.
    pub fn exponential_with_factor(base: Duration, factor: f64) -> Self {
        Backoff::Exponential { base, factor, max: None }
    }

    /// Cap exponential growth. No effect on the other strategies.
    pub fn with_max(mut self, cap: Duration) -> Self {
        if let Backoff::Exponential { max, .. } = &mut self {
            *max = Some(cap);
        }
        self
    }

    /// Delay before the given attempt (1-indexed). Saturates at
    /// [`MAX_BACKOFF`] instead of overflowing.
    pub fn delay(&self, attempt: usize) -> Duration {
        match self {
            Backoff::Constant { delay } => *delay,
            Backoff::Linear { base } => base
                .checked_mul(attempt as u32)
                .unwrap_or(MAX_BACKOFF)
                .min(MAX_BACKOFF),
            Backoff::Exponential { base, factor, max } => {
                let exponent = attempt.saturating_sub(1).min(u32::MAX as usize) as i32;
                let scaled = base.as_secs_f64() * factor.max(1.0).powi(exponent);
                let delay = if scaled.is_finite() && scaled < MAX_BACKOFF.as_secs_f64() {
                    Duration::from_secs_f64(scaled)
                } else {
                    MAX_BACKOFF
                };
                match max {
                    Some(cap) => delay.min(*cap),
                    None => delay,
                }
            }
        }
    }
}

/// Randomization applied on top of the backoff delay to spread out retry
/// storms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Jitter {
    /// Use the exact backoff delay.
    None,
    /// Uniform in `[0, delay]`.
    Full,
    /// Uniform in `[delay / 2, delay]`.
    Equal,
}

impl Jitter {
    pub fn full() -> Self {
        Jitter::Full
    }

    pub fn equal() -> Self {
        Jitter::Equal
    }

    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rand::rng())
    }

    /// Deterministic variant for tests.
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        let millis = delay.as_millis() as u64;
        match self {
            Jitter::None => delay,
            Jitter::Full => {
                if millis == 0 {
                    return Duration::ZERO;
                }
                Duration::from_millis(rng.random_range(0..=millis))
            }
            Jitter::Equal => {
                if millis == 0 {
                    return Duration::ZERO;
                }
                Duration::from_millis(rng.random_range(millis / 2..=millis))
            }
        }
    }
}
