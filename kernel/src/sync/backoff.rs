//! Bounded spin-then-yield policy shared by every lock.
//!
//! `spin` only ever executes PAUSE and is safe with interrupts disabled.
//! `snooze` spins while the wait is young and then gives the CPU away
//! through the installed executive, but only when this context may
//! be preempted.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::arch::irq;
use crate::atomic::pause;
use crate::config::{SPIN_COUNT_MAX, SPIN_COUNT_MIN};
use crate::sync::wait;

/// Steps after which `spin` stops growing.
const SPIN_LIMIT: u32 = 6;

/// Steps after which `snooze` reports completion.
const YIELD_LIMIT: u32 = 10;

/// Exponential backoff for contended retry loops.
#[derive(Debug, Default)]
pub struct Backoff {
    step: u32,
}

impl Backoff {
    pub const fn new() -> Self {
        Self { step: 0 }
    }

    pub fn reset(&mut self) {
        self.step = 0;
    }

    /// Pauses for `2^step` iterations, capped.
    #[inline]
    pub fn spin(&mut self) {
        for _ in 0..1u32 << self.step.min(SPIN_LIMIT) {
            pause();
        }
        if self.step <= SPIN_LIMIT {
            self.step += 1;
        }
    }

    /// Spins while the wait is short, yields once it is long.
    pub fn snooze(&mut self) {
        if self.step <= SPIN_LIMIT || !irq::enabled() || !wait::yield_now() {
            for _ in 0..1u32 << self.step.min(SPIN_LIMIT) {
                pause();
            }
        }
        if self.step <= YIELD_LIMIT {
            self.step += 1;
        }
    }

    /// True once the caller has waited long enough that it should block
    /// instead of spinning.
    pub fn is_completed(&self) -> bool {
        self.step > YIELD_LIMIT
    }
}

/// Adaptive spin budget of a blocking lock.
///
/// Raised by one on every acquisition that succeeded while spinning,
/// lowered by one every time a thread gave up and queued. Stays within
/// `[SPIN_COUNT_MIN, SPIN_COUNT_MAX]` and starts at the midpoint.
#[derive(Debug)]
pub struct SpinTuner {
    count: AtomicU32,
}

impl SpinTuner {
    pub const fn new() -> Self {
        Self {
            count: AtomicU32::new(SPIN_COUNT_MIN + ((SPIN_COUNT_MAX - SPIN_COUNT_MIN) >> 1)),
        }
    }

    /// Current number of optimistic spins.
    #[inline]
    pub fn limit(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }

    /// Spinning paid off.
    pub fn reward(&self) {
        let _ = self
            .count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| {
                (c < SPIN_COUNT_MAX).then_some(c + 1)
            });
    }

    /// Spinning did not pay off.
    pub fn penalize(&self) {
        let _ = self
            .count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| {
                (c > SPIN_COUNT_MIN).then_some(c - 1)
            });
    }
}

impl Default for SpinTuner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snooze_completes_after_bounded_steps() {
        let mut b = Backoff::new();
        let mut steps = 0;
        while !b.is_completed() {
            b.snooze();
            steps += 1;
        }
        assert_eq!(steps, YIELD_LIMIT + 1);
        b.reset();
        assert!(!b.is_completed());
    }

    #[test]
    fn spin_never_completes() {
        let mut b = Backoff::new();
        for _ in 0..100 {
            b.spin();
        }
        assert!(!b.is_completed());
    }

    #[test]
    fn tuner_starts_at_midpoint_and_stays_in_bounds() {
        let t = SpinTuner::new();
        assert_eq!(t.limit(), 2050);

        for _ in 0..10_000 {
            t.reward();
        }
        assert_eq!(t.limit(), SPIN_COUNT_MAX);

        for _ in 0..10_000 {
            t.penalize();
        }
        assert_eq!(t.limit(), SPIN_COUNT_MIN);
    }
}
