//! Sampling counters
//!
//! Sampled probes call static methods on a tracker class at run time:
//!
//! | Method                | Contract                                                       |
//! |-----------------------|----------------------------------------------------------------|
//! | `hit(I)Z`             | should this hit fire?                                          |
//! | `hitTimed(I)J`        | `0` if this hit shouldn't fire, otherwise the start timestamp  |
//! | `hitAdaptive(I)Z`     | like `hit`, but the tracker picks (and keeps adjusting) the rate |
//! | `getEndTs(I)J`        | last timestamp recorded by this thread for the counter         |
//! | `updateEndTs(I)V`     | record the current time for this thread                        |
//!
//! The instrumentor only generates calls matching that contract. [`MethodCounter`] is a Rust
//! implementation of the same contract, which pins down what the generated gates can assume.

use parking_lot::RwLock;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

thread_local! {
    /// Last timestamps recorded by this thread, keyed by tracker then counter
    static END_TIMESTAMPS: RefCell<HashMap<(u64, i32), i64>> = RefCell::new(HashMap::new());
}

static NEXT_TRACKER: AtomicU64 = AtomicU64::new(0);

/// Source of timestamps, in nanoseconds
///
/// Timestamps are never `0`, since `0` is what `hitTimed` returns for "not sampled".
pub trait Clock: Send + Sync {
    fn nano_time(&self) -> i64;
}

/// Monotonic clock starting at 1
pub struct MonotonicClock(Instant);

impl Default for MonotonicClock {
    fn default() -> MonotonicClock {
        MonotonicClock(Instant::now())
    }
}

impl Clock for MonotonicClock {
    fn nano_time(&self) -> i64 {
        i64::try_from(self.0.elapsed().as_nanos())
            .unwrap_or(i64::MAX - 1)
            .saturating_add(1)
    }
}

/// Source of the randomized countdowns between samples
pub trait RandomSource: Send + Sync {
    /// Uniform value in `0..bound` (`bound > 0`)
    fn below(&self, bound: u32) -> u32;
}

/// Xorshift generator
///
/// Statistical quality is irrelevant here, the countdowns only need to avoid locking onto
/// periodic behaviour in the traced program.
pub struct XorShift(AtomicU64);

impl XorShift {
    pub fn new(seed: u64) -> XorShift {
        XorShift(AtomicU64::new(seed.max(1)))
    }
}

impl Default for XorShift {
    fn default() -> XorShift {
        XorShift::new(0x2545_f491_4f6c_dd1d)
    }
}

impl RandomSource for XorShift {
    fn below(&self, bound: u32) -> u32 {
        let step = |mut x: u64| {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            x
        };
        let previous = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |x| Some(step(x)))
            .unwrap_or(1);
        (step(previous) % u64::from(bound.max(1))) as u32
    }
}

/// How adaptive counters adjust their sampling rate
pub trait AdaptivePolicy: Send + Sync {
    /// New rate, given the current one and the time since the previous sample on this thread
    fn adjust(&self, rate: u32, gap_nanos: i64) -> u32;
}

/// Keep the time between samples inside a window by nudging the rate one step at a time
pub struct GapWindow {
    pub min_gap_nanos: i64,
    pub max_gap_nanos: i64,
    pub min_rate: u32,
    pub max_rate: u32,
}

impl Default for GapWindow {
    fn default() -> GapWindow {
        GapWindow {
            min_gap_nanos: 500,
            max_gap_nanos: 1500,
            min_rate: 1,
            max_rate: 5000,
        }
    }
}

impl AdaptivePolicy for GapWindow {
    fn adjust(&self, rate: u32, gap_nanos: i64) -> u32 {
        if gap_nanos < self.min_gap_nanos && rate < self.max_rate {
            rate + 1
        } else if gap_nanos > self.max_gap_nanos && rate > self.min_rate {
            rate - 1
        } else {
            rate
        }
    }
}

struct Counter {
    /// Hits left before the next sample
    countdown: AtomicI64,

    /// Mean number of hits per sample (`0` samples everything)
    rate: AtomicU32,
}

/// Reference implementation of the tracker contract
///
/// End timestamps live in thread-local storage, so they go away with the thread which recorded
/// them.
pub struct MethodCounter {
    /// Key of this tracker's end timestamps
    tracker: u64,
    counters: RwLock<HashMap<i32, Arc<Counter>>>,
    clock: Box<dyn Clock>,
    random: Box<dyn RandomSource>,
    policy: Box<dyn AdaptivePolicy>,
}

impl Default for MethodCounter {
    fn default() -> MethodCounter {
        MethodCounter::new(
            Box::new(MonotonicClock::default()),
            Box::new(XorShift::default()),
            Box::new(GapWindow::default()),
        )
    }
}

impl MethodCounter {
    pub fn new(
        clock: Box<dyn Clock>,
        random: Box<dyn RandomSource>,
        policy: Box<dyn AdaptivePolicy>,
    ) -> MethodCounter {
        MethodCounter {
            tracker: NEXT_TRACKER.fetch_add(1, Ordering::Relaxed),
            counters: RwLock::new(HashMap::new()),
            clock,
            random,
            policy,
        }
    }

    /// Register a counter (re-registering keeps the existing state)
    ///
    /// A `mean` of `0` makes every hit fire. Adaptive counters start at the mean given here.
    pub fn register(&self, id: i32, mean: u32) {
        let mut counters = self.counters.write();
        counters.entry(id).or_insert_with(|| {
            Arc::new(Counter {
                countdown: AtomicI64::new(0),
                rate: AtomicU32::new(mean),
            })
        });
    }

    /// Current rate of a counter
    pub fn rate(&self, id: i32) -> Option<u32> {
        self.counter(id)
            .map(|counter| counter.rate.load(Ordering::Relaxed))
    }

    pub fn hit(&self, id: i32) -> bool {
        match self.counter(id) {
            None => true,
            Some(counter) => self.take_sample(&counter),
        }
    }

    pub fn hit_timed(&self, id: i32) -> i64 {
        if self.hit(id) {
            let now = self.clock.nano_time();
            self.set_timestamp(id, now);
            now
        } else {
            0
        }
    }

    pub fn hit_adaptive(&self, id: i32) -> bool {
        let counter = match self.counter(id) {
            None => return true,
            Some(counter) => counter,
        };
        let rate = counter.rate.load(Ordering::Relaxed);
        if rate != 0 && counter.countdown.fetch_sub(1, Ordering::Relaxed) > 0 {
            return false;
        }

        let now = self.clock.nano_time();
        let previous = self.get_end_ts(id);
        let mut rate = rate;
        if previous != 0 {
            rate = self.policy.adjust(rate, now - previous);
            counter.rate.store(rate, Ordering::Relaxed);
        }
        self.set_timestamp(id, now);
        if rate != 0 {
            self.reset_countdown(&counter, rate);
        }
        true
    }

    pub fn get_end_ts(&self, id: i32) -> i64 {
        END_TIMESTAMPS.with(|timestamps| {
            timestamps
                .borrow()
                .get(&(self.tracker, id))
                .copied()
                .unwrap_or(0)
        })
    }

    pub fn update_end_ts(&self, id: i32) {
        let now = self.clock.nano_time();
        self.set_timestamp(id, now);
    }

    fn counter(&self, id: i32) -> Option<Arc<Counter>> {
        self.counters.read().get(&id).cloned()
    }

    /// Count down, and fire (restarting the countdown) when it runs out
    fn take_sample(&self, counter: &Counter) -> bool {
        let rate = counter.rate.load(Ordering::Relaxed);
        if rate == 0 {
            return true;
        }
        if counter.countdown.fetch_sub(1, Ordering::Relaxed) <= 0 {
            self.reset_countdown(counter, rate);
            true
        } else {
            false
        }
    }

    /// Next gap is uniform in `1..=2*rate` hits, so samples are about `rate` hits apart
    fn reset_countdown(&self, counter: &Counter, rate: u32) {
        let gap = self.random.below(rate.saturating_mul(2)) + 1;
        counter.countdown.store(i64::from(gap) - 1, Ordering::Relaxed);
    }

    fn set_timestamp(&self, id: i32, timestamp: i64) {
        END_TIMESTAMPS.with(|timestamps| {
            timestamps.borrow_mut().insert((self.tracker, id), timestamp);
        });
    }
}

impl Drop for MethodCounter {
    /// Forget the timestamps this thread recorded (other threads drop theirs when they exit)
    fn drop(&mut self) {
        let tracker = self.tracker;
        let _ = END_TIMESTAMPS.try_with(|timestamps| {
            timestamps
                .borrow_mut()
                .retain(|(owner, _), _| *owner != tracker);
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// Clock that advances by a fixed step every time it is read
    struct SteppingClock {
        now: AtomicI64,
        step: i64,
    }

    impl Clock for SteppingClock {
        fn nano_time(&self) -> i64 {
            self.now.fetch_add(self.step, Ordering::Relaxed) + self.step
        }
    }

    /// Always picks the middle of the range
    struct Middle;

    impl RandomSource for Middle {
        fn below(&self, bound: u32) -> u32 {
            bound / 2
        }
    }

    fn counter(step: i64) -> MethodCounter {
        MethodCounter::new(
            Box::new(SteppingClock {
                now: AtomicI64::new(0),
                step,
            }),
            Box::new(Middle),
            Box::new(GapWindow::default()),
        )
    }

    #[test]
    fn fixed_sampling_fires_about_every_mean_hits() {
        let counter = counter(10);
        counter.register(1, 4);

        let fired: Vec<bool> = (0..12).map(|_| counter.hit(1)).collect();

        // First hit fires, then every fifth
        assert_eq!(
            fired,
            vec![true, false, false, false, false, true, false, false, false, false, true, false]
        );
    }

    #[test]
    fn unsampled_counters_always_fire() {
        let counter = counter(10);
        counter.register(2, 0);
        assert!((0..5).all(|_| counter.hit(2)));
        assert!(counter.hit(99));
    }

    #[test]
    fn timed_hits_record_the_start() {
        let counter = counter(10);
        counter.register(3, 1);

        let start = counter.hit_timed(3);
        assert_ne!(start, 0);
        assert_eq!(counter.get_end_ts(3), start);
        assert_eq!(counter.hit_timed(3), 0);

        counter.update_end_ts(3);
        assert!(counter.get_end_ts(3) > start);
    }

    #[test]
    fn end_timestamps_are_per_thread() {
        let counter = counter(10);
        counter.register(6, 0);
        let start = counter.hit_timed(6);
        assert_ne!(start, 0);

        std::thread::scope(|scope| {
            scope
                .spawn(|| {
                    assert_eq!(counter.get_end_ts(6), 0);
                    counter.update_end_ts(6);
                    assert!(counter.get_end_ts(6) > start);
                })
                .join()
                .unwrap();
        });
        assert_eq!(counter.get_end_ts(6), start);

        // Another tracker on the same thread starts out empty
        let other = self::counter(10);
        assert_eq!(other.get_end_ts(6), 0);
        drop(counter);
        END_TIMESTAMPS.with(|timestamps| {
            assert!(timestamps.borrow().keys().all(|(tracker, _)| *tracker == other.tracker));
        });
    }

    #[test]
    fn adaptive_rate_follows_the_gap() {
        // Samples very close together: the rate goes up
        let fast = counter(100);
        fast.register(4, 1);
        for _ in 0..50 {
            fast.hit_adaptive(4);
        }
        assert!(fast.rate(4).unwrap() > 1);

        // Samples far apart: the rate drops back to the minimum
        let slow = counter(10_000);
        slow.register(5, 10);
        for _ in 0..500 {
            slow.hit_adaptive(5);
        }
        assert_eq!(slow.rate(5), Some(1));
    }

    #[test]
    fn gap_window_bounds() {
        let policy = GapWindow::default();
        assert_eq!(policy.adjust(10, 100), 11);
        assert_eq!(policy.adjust(5000, 100), 5000);
        assert_eq!(policy.adjust(10, 1000), 10);
        assert_eq!(policy.adjust(10, 2000), 9);
        assert_eq!(policy.adjust(1, 2000), 1);
    }
}
