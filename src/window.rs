//! Sliding outcome window backing the circuit breaker.
//!
//! Lock-free on the hot path: the aggregate triple (total, failed, slow)
//! lives in one packed `AtomicU64`, so every update is a single CAS and
//! every snapshot is a single load of an internally consistent triple.
//! Count-based windows keep the last N outcomes in a ring of atomic slots
//! behind an atomic write index; time-based windows keep N per-second
//! partial aggregates, each an atomic epoch plus a packed counter word,
//! cleared by CAS when the slot rotates to a new second. A new outcome is
//! published to the shared totals before its slot, so an evictor can only
//! ever subtract counts a writer has already published; `failed <= total`
//! and `slow <= total` therefore hold in every snapshot, even mid-record.

use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;

const NANOS_PER_SEC: u64 = 1_000_000_000;

const FIELD_BITS: u32 = 21;
const FIELD_MASK: u64 = (1 << FIELD_BITS) - 1;
const FIELD_MAX: u32 = FIELD_MASK as u32;

const SLOT_EMPTY: u8 = 0;

/// Window shape selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum WindowType {
    CountBased,
    TimeBased,
}

/// Classified result of one permitted call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// Successful, but slower than the configured slow-call threshold.
    SlowSuccess,
    Failure,
}

fn encode(outcome: Outcome) -> u8 {
    match outcome {
        Outcome::Success => 1,
        Outcome::SlowSuccess => 2,
        Outcome::Failure => 3,
    }
}

fn decode(slot: u8) -> Option<Outcome> {
    match slot {
        1 => Some(Outcome::Success),
        2 => Some(Outcome::SlowSuccess),
        3 => Some(Outcome::Failure),
        _ => None,
    }
}

/// Point-in-time aggregate view of a window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowSnapshot {
    pub total_calls: u32,
    pub failed_calls: u32,
    pub slow_calls: u32,
    /// Failed calls as a percentage of total calls; 0 when the window is empty.
    pub failure_rate: f32,
    /// Slow calls as a percentage of total calls; 0 when the window is empty.
    pub slow_call_rate: f32,
    /// True once at least `minimum_number_of_calls` outcomes are in-window.
    /// Rates from an unsaturated window are not actionable.
    pub saturated: bool,
}

/// The aggregate triple, packed 21 bits per field into one `u64` so reads
/// and CAS updates are always internally consistent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct Counts {
    total: u32,
    failed: u32,
    slow: u32,
}

impl Counts {
    fn add(mut self, outcome: Outcome) -> Self {
        self.total = bump(self.total);
        match outcome {
            Outcome::Success => {}
            Outcome::SlowSuccess => self.slow = bump(self.slow),
            Outcome::Failure => self.failed = bump(self.failed),
        }
        self
    }

    fn remove(mut self, outcome: Outcome) -> Self {
        self.total = self.total.saturating_sub(1);
        match outcome {
            Outcome::Success => {}
            Outcome::SlowSuccess => self.slow = self.slow.saturating_sub(1),
            Outcome::Failure => self.failed = self.failed.saturating_sub(1),
        }
        self
    }

    fn subtract(mut self, other: Counts) -> Self {
        self.total = self.total.saturating_sub(other.total);
        self.failed = self.failed.saturating_sub(other.failed);
        self.slow = self.slow.saturating_sub(other.slow);
        self
    }
}

fn bump(count: u32) -> u32 {
    count.saturating_add(1).min(FIELD_MAX)
}

fn pack(counts: Counts) -> u64 {
    ((counts.total as u64 & FIELD_MASK) << (2 * FIELD_BITS))
        | ((counts.failed as u64 & FIELD_MASK) << FIELD_BITS)
        | (counts.slow as u64 & FIELD_MASK)
}

fn unpack(word: u64) -> Counts {
    Counts {
        total: ((word >> (2 * FIELD_BITS)) & FIELD_MASK) as u32,
        failed: ((word >> FIELD_BITS) & FIELD_MASK) as u32,
        slow: (word & FIELD_MASK) as u32,
    }
}

fn update_counts<F>(word: &AtomicU64, f: F)
where
    F: Fn(Counts) -> Counts,
{
    let _ = word.fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| Some(pack(f(unpack(w)))));
}

/// One second's partial aggregate in a time-based window.
#[derive(Debug)]
struct Bucket {
    epoch_sec: AtomicU64,
    counts: AtomicU64,
}

#[derive(Debug)]
enum Shape {
    Count {
        slots: Box<[AtomicU8]>,
        head: AtomicUsize,
    },
    Time {
        buckets: Box<[Bucket]>,
        /// Epoch second the expiry walk has reached.
        latest_sec: AtomicU64,
    },
}

/// Thread-safe accumulator of call outcomes with count- or time-based
/// eviction. All state is atomics; `record` and `snapshot` never lock.
#[derive(Debug)]
pub struct SlidingWindow {
    min_calls: u32,
    totals: AtomicU64,
    shape: Shape,
}

impl SlidingWindow {
    /// A `size` of zero is clamped to one. For count-based windows the
    /// saturation point is additionally clamped to the window size, since a
    /// ring of N slots can never hold more than N outcomes.
    pub fn new(window_type: WindowType, size: u32, minimum_number_of_calls: u32) -> Self {
        let size = size.max(1);
        let (shape, min_calls) = match window_type {
            WindowType::CountBased => (
                Shape::Count {
                    slots: (0..size).map(|_| AtomicU8::new(SLOT_EMPTY)).collect(),
                    head: AtomicUsize::new(0),
                },
                minimum_number_of_calls.min(size),
            ),
            WindowType::TimeBased => (
                Shape::Time {
                    buckets: (0..size)
                        .map(|_| Bucket {
                            epoch_sec: AtomicU64::new(0),
                            counts: AtomicU64::new(0),
                        })
                        .collect(),
                    latest_sec: AtomicU64::new(0),
                },
                minimum_number_of_calls,
            ),
        };
        Self { min_calls: min_calls.max(1), totals: AtomicU64::new(0), shape }
    }

    /// Record one outcome. `now_nanos` is only consulted by time-based
    /// windows.
    pub fn record(&self, outcome: Outcome, now_nanos: u64) {
        // Publish to the shared totals first. An evictor subtracts only what
        // some writer already published, so the counters never underflow.
        self.update_totals(|counts| counts.add(outcome));
        match &self.shape {
            Shape::Count { slots, head } => {
                let idx = head.fetch_add(1, Ordering::Relaxed) % slots.len();
                let previous = slots[idx].swap(encode(outcome), Ordering::AcqRel);
                if let Some(evicted) = decode(previous) {
                    self.update_totals(|counts| counts.remove(evicted));
                }
            }
            Shape::Time { buckets, latest_sec } => {
                let now_sec = now_nanos / NANOS_PER_SEC;
                self.expire_through(buckets, latest_sec, now_sec);
                let bucket = &buckets[(now_sec % buckets.len() as u64) as usize];
                loop {
                    let epoch = bucket.epoch_sec.load(Ordering::Acquire);
                    if epoch >= now_sec {
                        update_counts(&bucket.counts, |counts| counts.add(outcome));
                        return;
                    }
                    // Slot still holds an older second; rotate it out. The
                    // CAS winner clears it, everyone re-reads.
                    if bucket
                        .epoch_sec
                        .compare_exchange(epoch, now_sec, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        let stale = bucket.counts.swap(0, Ordering::AcqRel);
                        if stale != 0 {
                            self.update_totals(|counts| counts.subtract(unpack(stale)));
                        }
                    }
                }
            }
        }
    }

    /// Aggregate view; time-based windows first expire stale buckets.
    pub fn snapshot(&self, now_nanos: u64) -> WindowSnapshot {
        if let Shape::Time { buckets, latest_sec } = &self.shape {
            self.expire_through(buckets, latest_sec, now_nanos / NANOS_PER_SEC);
        }
        let counts = unpack(self.totals.load(Ordering::Acquire));
        let rate = |count: u32| {
            if counts.total == 0 {
                0.0
            } else {
                count as f32 * 100.0 / counts.total as f32
            }
        };
        WindowSnapshot {
            total_calls: counts.total,
            failed_calls: counts.failed,
            slow_calls: counts.slow,
            failure_rate: rate(counts.failed),
            slow_call_rate: rate(counts.slow),
            saturated: counts.total >= self.min_calls,
        }
    }

    pub fn minimum_number_of_calls(&self) -> u32 {
        self.min_calls
    }

    fn update_totals<F>(&self, f: F)
    where
        F: Fn(Counts) -> Counts,
    {
        update_counts(&self.totals, f);
    }

    /// Walk the expiry cursor forward to `now_sec`, clearing each slot as
    /// the second it stored falls out of the window. Concurrent callers
    /// split the walk between them via the CAS on `latest_sec`.
    fn expire_through(&self, buckets: &[Bucket], latest_sec: &AtomicU64, now_sec: u64) {
        let len = buckets.len() as u64;
        loop {
            let seen = latest_sec.load(Ordering::Acquire);
            if now_sec <= seen {
                return;
            }
            if now_sec - seen > len {
                // Everything in the ring is stale; jump the cursor so the
                // walk below clears each slot exactly once.
                let _ = latest_sec.compare_exchange(
                    seen,
                    now_sec - len,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                continue;
            }
            let next = seen + 1;
            if latest_sec
                .compare_exchange(seen, next, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            // The slot for second `next` last held second `next - len`,
            // which is now outside the window.
            let bucket = &buckets[(next % len) as usize];
            let epoch = bucket.epoch_sec.load(Ordering::Acquire);
            if epoch < next
                && bucket
                    .epoch_sec
                    .compare_exchange(epoch, next, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                let stale = bucket.counts.swap(0, Ordering::AcqRel);
                if stale != 0 {
                    self.update_totals(|counts| counts.subtract(unpack(stale)));
                }
            }
        }
    }
}

/// Classify a call duration against the slow-call threshold.
pub(crate) fn classify_success(duration: Duration, slow_threshold: Duration) -> Outcome {
    if duration >= slow_threshold {
        Outcome::SlowSuccess
    } else {
        Outcome::Success
    }
}
