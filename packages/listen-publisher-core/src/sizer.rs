//! Adaptive batch sizer (§4.C, component C).
//!
//! Grows or shrinks the next `applyWrites` batch size based on streaks
//! of consecutive fast/successful or slow/failed responses, the same
//! observe-then-adjust shape as [`crate::governor::Governor`] but keyed
//! on latency/error outcomes instead of header quota.

use std::sync::atomic::{AtomicU32, Ordering};

/// Hard floor on batch size, regardless of how many consecutive
/// successes have been observed.
pub const MIN_BATCH_SIZE: u32 = 10;

/// Hard ceiling on batch size, matching the PDS's own per-request
/// record limit.
pub const MAX_BATCH_SIZE: u32 = 200;

/// Target latency, in milliseconds, a response is compared against to
/// decide whether the batch should grow or shrink (§4.C).
pub const TARGET_LATENCY_MS: u64 = 2000;

/// Consecutive fast, successful responses required before the sizer
/// grows the batch.
const GROW_STREAK_THRESHOLD: u32 = 3;

/// Consecutive slow or failed responses required before the sizer
/// shrinks the batch.
const SHRINK_STREAK_THRESHOLD: u32 = 2;

/// Shrink multiplier applied once the shrink streak threshold is reached.
const SHRINK_FACTOR: f64 = 0.7;

/// Growth multiplier applied once the grow streak threshold is reached.
const GROWTH_FACTOR: f64 = 1.5;

/// Tracks recent batch outcomes and recommends the next batch size.
pub struct BatchSizer {
    current: AtomicU32,
    fast_streak: AtomicU32,
    slow_streak: AtomicU32,
}

impl BatchSizer {
    /// Seeds the sizer logarithmically from the number of records
    /// pending, so a large backlog starts with a larger batch than a
    /// small one, without guessing blindly at `MAX_BATCH_SIZE` (§4.C).
    /// `override_size`, when set (`PublisherConfig::batch_size_override`),
    /// skips the estimate entirely.
    pub fn seed_from_backlog(pending_records: usize, override_size: Option<u32>) -> Self {
        let seeded = match override_size {
            Some(size) => size,
            None if pending_records == 0 => MIN_BATCH_SIZE,
            None => {
                let log = (pending_records as f64).ln().max(0.0);
                (MIN_BATCH_SIZE as f64 * (1.0 + log)).round() as u32
            }
        };
        Self {
            current: AtomicU32::new(seeded.clamp(MIN_BATCH_SIZE, MAX_BATCH_SIZE)),
            fast_streak: AtomicU32::new(0),
            slow_streak: AtomicU32::new(0),
        }
    }

    /// Current recommended batch size.
    pub fn current(&self) -> u32 {
        self.current.load(Ordering::SeqCst)
    }

    /// Records a batch's observed outcome: `latency_ms` is the
    /// wall-clock time the request took, `ok` is whether it succeeded.
    ///
    /// A response counts as "fast" only if it both succeeded and beat
    /// [`TARGET_LATENCY_MS`]; anything else (slow success, or any
    /// failure) counts as "slow". Each streak resets to zero whenever
    /// the opposite outcome is observed (§4.C).
    pub fn record_outcome(&self, latency_ms: u64, ok: bool) {
        if ok && latency_ms < TARGET_LATENCY_MS {
            self.slow_streak.store(0, Ordering::SeqCst);
            let streak = self.fast_streak.fetch_add(1, Ordering::SeqCst) + 1;
            if streak >= GROW_STREAK_THRESHOLD {
                self.fast_streak.store(0, Ordering::SeqCst);
                self.grow();
            }
        } else {
            self.fast_streak.store(0, Ordering::SeqCst);
            let streak = self.slow_streak.fetch_add(1, Ordering::SeqCst) + 1;
            if streak >= SHRINK_STREAK_THRESHOLD {
                self.slow_streak.store(0, Ordering::SeqCst);
                self.shrink();
            }
        }
    }

    fn grow(&self) {
        self.current
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                let next = (current as f64 * GROWTH_FACTOR).floor() as u32;
                Some(next.clamp(MIN_BATCH_SIZE, MAX_BATCH_SIZE))
            })
            .expect("fetch_update closure always returns Some");
    }

    fn shrink(&self) {
        self.current
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                let next = (current as f64 * SHRINK_FACTOR).floor() as u32;
                Some(next.clamp(MIN_BATCH_SIZE, MAX_BATCH_SIZE))
            })
            .expect("fetch_update closure always returns Some");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeds_within_bounds_for_small_backlog() {
        let sizer = BatchSizer::seed_from_backlog(5, None);
        assert!(sizer.current() >= MIN_BATCH_SIZE);
        assert!(sizer.current() <= MAX_BATCH_SIZE);
    }

    #[test]
    fn seeds_larger_for_bigger_backlog() {
        let small = BatchSizer::seed_from_backlog(10, None);
        let large = BatchSizer::seed_from_backlog(100_000, None);
        assert!(large.current() >= small.current());
    }

    #[test]
    fn empty_backlog_seeds_to_minimum() {
        let sizer = BatchSizer::seed_from_backlog(0, None);
        assert_eq!(sizer.current(), MIN_BATCH_SIZE);
    }

    #[test]
    fn grows_after_streak_of_fast_successes() {
        let sizer = BatchSizer::seed_from_backlog(0, None);
        let before = sizer.current();
        sizer.record_outcome(500, true);
        sizer.record_outcome(500, true);
        assert_eq!(sizer.current(), before, "should not grow before streak threshold");
        sizer.record_outcome(500, true);
        assert!(sizer.current() > before, "should grow once streak threshold reached");
    }

    #[test]
    fn slow_latency_on_success_still_shrinks() {
        // Scenario 4 (§8): three consecutive successful batches at
        // 3000ms latency (above the 2000ms target) drop the size from
        // 50 to 35 once the 2-slow-response streak threshold is hit.
        let sizer = BatchSizer::seed_from_backlog(5, Some(50));
        sizer.record_outcome(3000, true);
        assert_eq!(sizer.current(), 50, "should not shrink before the 2-slow streak threshold");
        sizer.record_outcome(3000, true);
        assert_eq!(sizer.current(), 35);
        // Streak reset after shrinking: a third slow response alone
        // isn't enough to shrink again.
        sizer.record_outcome(3000, true);
        assert_eq!(sizer.current(), 35);
    }

    #[test]
    fn failed_batch_counts_as_slow_even_if_fast() {
        let sizer = BatchSizer::seed_from_backlog(5, Some(100));
        sizer.record_outcome(100, false);
        sizer.record_outcome(100, false);
        assert_eq!(sizer.current(), 70);
    }

    #[test]
    fn never_shrinks_below_minimum() {
        let sizer = BatchSizer::seed_from_backlog(0, None);
        for _ in 0..40 {
            sizer.record_outcome(5000, false);
        }
        assert_eq!(sizer.current(), MIN_BATCH_SIZE);
    }

    #[test]
    fn never_grows_above_maximum() {
        let sizer = BatchSizer::seed_from_backlog(0, None);
        for _ in 0..300 {
            sizer.record_outcome(100, true);
        }
        assert_eq!(sizer.current(), MAX_BATCH_SIZE);
    }

    #[test]
    fn explicit_override_bypasses_backlog_estimate() {
        let sizer = BatchSizer::seed_from_backlog(5, Some(150));
        assert_eq!(sizer.current(), 150);
    }

    #[test]
    fn slow_response_resets_fast_streak() {
        let sizer = BatchSizer::seed_from_backlog(0, None);
        sizer.record_outcome(500, true);
        sizer.record_outcome(500, true);
        sizer.record_outcome(3000, true);
        let after_slow = sizer.current();
        sizer.record_outcome(500, true);
        sizer.record_outcome(500, true);
        assert_eq!(sizer.current(), after_slow, "fast streak should have reset on the slow response");
    }

    #[test]
    fn fast_response_resets_slow_streak() {
        let sizer = BatchSizer::seed_from_backlog(5, Some(100));
        sizer.record_outcome(3000, true);
        sizer.record_outcome(500, true);
        sizer.record_outcome(3000, true);
        assert_eq!(sizer.current(), 100, "slow streak should have reset on the fast response");
    }
}
