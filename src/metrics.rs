//! Sliding windows over call outcomes
//!
//! A window aggregates recent call outcomes and derives the failure rate and
//! slow-call rate the circuit breaker's thresholds are checked against.
//! Two shapes are supported:
//!
//! - count-based: a ring of the last N call outcomes
//! - time-based: one bucket per second over the last N seconds
//!
//! Both report rates of `NO_RATE` (-1.0) until `minimum_number_of_calls`
//! outcomes have been recorded, so a breaker never trips on a sample too
//! small to mean anything.

use parking_lot::Mutex;

/// Sentinel rate reported while the window holds fewer than the minimum
/// number of calls.
pub const NO_RATE: f32 = -1.0;

/// Outcome of a single recorded call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Completed successfully within the slow-call threshold.
    Success,
    /// Completed successfully but took too long.
    SlowSuccess,
    /// Failed within the slow-call threshold.
    Failure,
    /// Failed and took too long.
    SlowFailure,
}

impl Outcome {
    /// Classify a call from its failure and slowness flags.
    pub fn from_call(failed: bool, slow: bool) -> Self {
        match (failed, slow) {
            (false, false) => Outcome::Success,
            (false, true) => Outcome::SlowSuccess,
            (true, false) => Outcome::Failure,
            (true, true) => Outcome::SlowFailure,
        }
    }

    fn is_failure(self) -> bool {
        matches!(self, Outcome::Failure | Outcome::SlowFailure)
    }

    fn is_slow(self) -> bool {
        matches!(self, Outcome::SlowSuccess | Outcome::SlowFailure)
    }
}

/// Point-in-time view of a window's aggregate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Snapshot {
    /// Outcomes currently inside the window.
    pub total_calls: u32,
    /// Failed outcomes inside the window.
    pub failed_calls: u32,
    /// Slow outcomes (successful or failed) inside the window.
    pub slow_calls: u32,
    /// Failure percentage, or [`NO_RATE`] below the minimum call count.
    pub failure_rate: f32,
    /// Slow-call percentage, or [`NO_RATE`] below the minimum call count.
    pub slow_call_rate: f32,
}

#[derive(Debug, Clone, Copy, Default)]
struct Aggregate {
    total: u32,
    failures: u32,
    slow: u32,
}

impl Aggregate {
    fn add(&mut self, outcome: Outcome) {
        self.total += 1;
        if outcome.is_failure() {
            self.failures += 1;
        }
        if outcome.is_slow() {
            self.slow += 1;
        }
    }

    fn remove(&mut self, outcome: Outcome) {
        self.total -= 1;
        if outcome.is_failure() {
            self.failures -= 1;
        }
        if outcome.is_slow() {
            self.slow -= 1;
        }
    }

    fn subtract(&mut self, other: &BucketTotals) {
        self.total -= other.total;
        self.failures -= other.failures;
        self.slow -= other.slow;
    }

    fn snapshot(&self, minimum_calls: u32) -> Snapshot {
        let (failure_rate, slow_call_rate) = if self.total < minimum_calls {
            (NO_RATE, NO_RATE)
        } else {
            (
                self.failures as f32 / self.total as f32 * 100.0,
                self.slow as f32 / self.total as f32 * 100.0,
            )
        };
        Snapshot {
            total_calls: self.total,
            failed_calls: self.failures,
            slow_calls: self.slow,
            failure_rate,
            slow_call_rate,
        }
    }
}

#[derive(Debug)]
struct CountRing {
    slots: Vec<Option<Outcome>>,
    next: usize,
    aggregate: Aggregate,
}

impl CountRing {
    fn new(size: usize) -> Self {
        Self {
            slots: vec![None; size],
            next: 0,
            aggregate: Aggregate::default(),
        }
    }

    fn record(&mut self, outcome: Outcome) {
        if let Some(evicted) = self.slots[self.next].replace(outcome) {
            self.aggregate.remove(evicted);
        }
        self.aggregate.add(outcome);
        self.next = (self.next + 1) % self.slots.len();
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct BucketTotals {
    total: u32,
    failures: u32,
    slow: u32,
}

impl BucketTotals {
    fn clear(&mut self) {
        *self = Self::default();
    }

    fn add(&mut self, outcome: Outcome) {
        self.total += 1;
        if outcome.is_failure() {
            self.failures += 1;
        }
        if outcome.is_slow() {
            self.slow += 1;
        }
    }
}

#[derive(Debug)]
struct TimeRing {
    buckets: Vec<BucketTotals>,
    head: usize,
    head_second: u64,
    aggregate: Aggregate,
}

impl TimeRing {
    fn new(seconds: usize) -> Self {
        Self {
            buckets: vec![BucketTotals::default(); seconds],
            head: 0,
            head_second: 0,
            aggregate: Aggregate::default(),
        }
    }

    /// Rotate the ring so the head bucket covers `now_second`, expiring
    /// everything the rotation passes over.
    fn advance(&mut self, now_second: u64) {
        if now_second <= self.head_second {
            return;
        }
        let elapsed = (now_second - self.head_second).min(self.buckets.len() as u64);
        for _ in 0..elapsed {
            self.head = (self.head + 1) % self.buckets.len();
            let expired = self.buckets[self.head];
            self.aggregate.subtract(&expired);
            self.buckets[self.head].clear();
        }
        self.head_second = now_second;
    }

    fn record(&mut self, now_second: u64, outcome: Outcome) {
        self.advance(now_second);
        self.buckets[self.head].add(outcome);
        self.aggregate.add(outcome);
    }
}

#[derive(Debug)]
enum Ring {
    Count(CountRing),
    Time(TimeRing),
}

/// Thread-safe sliding window of call outcomes.
///
/// The interior lock covers only the ring bookkeeping; it is never held
/// while caller-supplied work runs.
#[derive(Debug)]
pub struct SlidingWindow {
    minimum_calls: u32,
    ring: Mutex<Ring>,
}

impl SlidingWindow {
    /// Window over the last `size` calls. The effective minimum call count
    /// is capped at the window size.
    pub fn count_based(size: u32, minimum_calls: u32) -> Self {
        let size = size.max(1);
        Self {
            minimum_calls: minimum_calls.clamp(1, size),
            ring: Mutex::new(Ring::Count(CountRing::new(size as usize))),
        }
    }

    /// Window over the last `seconds` seconds, one bucket per second.
    pub fn time_based(seconds: u32, minimum_calls: u32) -> Self {
        let seconds = seconds.max(1);
        Self {
            minimum_calls: minimum_calls.max(1),
            ring: Mutex::new(Ring::Time(TimeRing::new(seconds as usize))),
        }
    }

    /// Record one outcome and return the aggregate after recording, so the
    /// caller can check thresholds against exactly the state it produced.
    pub fn record(&self, now_nanos: u64, outcome: Outcome) -> Snapshot {
        let mut ring = self.ring.lock();
        match &mut *ring {
            Ring::Count(count) => count.record(outcome),
            Ring::Time(time) => time.record(now_nanos / 1_000_000_000, outcome),
        }
        self.aggregate_of(&ring).snapshot(self.minimum_calls)
    }

    /// Current aggregate without recording. Time-based windows expire stale
    /// buckets as part of the read.
    pub fn snapshot(&self, now_nanos: u64) -> Snapshot {
        let mut ring = self.ring.lock();
        if let Ring::Time(time) = &mut *ring {
            time.advance(now_nanos / 1_000_000_000);
        }
        self.aggregate_of(&ring).snapshot(self.minimum_calls)
    }

    /// The minimum number of recorded calls before rates are reported.
    pub fn minimum_calls(&self) -> u32 {
        self.minimum_calls
    }

    fn aggregate_of<'a>(&self, ring: &'a Ring) -> &'a Aggregate {
        match ring {
            Ring::Count(count) => &count.aggregate,
            Ring::Time(time) => &time.aggregate,
        }
    }
}
