// =============================================================================
// MinimalOS NextGen — Exclusive Spinlock
// =============================================================================
//
// One `i32` word:
//
//   0          free
//   1          held
//   1 | 2      held by a `_noirq` acquirer that found interrupts enabled
//
// The `_noirq` variants disable interrupts before spinning and keep the prior
// interrupt state in bit 1 of the lock word itself, so the matching unlock
// knows what to restore without the caller carrying it around. Any lock that
// an interrupt handler can take MUST be taken with the `_noirq` variants (or
// with interrupts already off): otherwise the handler spins forever on a lock
// held by the code it interrupted.
//
// Waiting is a PAUSE loop in every variant: a spin lock never yields or
// suspends, so it is safe wherever blocking is not. Not fair. Use
// `TicketLock` where FIFO order matters.
// =============================================================================

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicI32, Ordering};

use crate::arch::irq;
use crate::atomic::AtomicInt;
use crate::sync::backoff::Backoff;

const HELD: i32 = 1;
const IRQ_WAS_ENABLED: i32 = 2;

/// The bare lock word.
#[derive(Debug)]
pub struct RawSpinLock {
    value: AtomicI32,
}

impl RawSpinLock {
    pub const fn new() -> Self {
        Self {
            value: AtomicI32::new(0),
        }
    }

    /// Test-and-test-and-set: only attempt the CAS once the word reads free,
    /// so waiters share the cache line instead of bouncing it.
    #[inline]
    fn acquire(&self, held_value: i32) {
        let mut b = Backoff::new();
        while self.value.load(Ordering::Relaxed) != 0 || self.value.cmpxchg(0, held_value) != 0 {
            b.spin();
        }
    }

    /// Acquires without touching the interrupt flag.
    pub fn lock(&self) {
        self.acquire(HELD);
    }

    pub fn try_lock(&self) -> bool {
        self.value.load(Ordering::Relaxed) == 0 && self.value.cmpxchg(0, HELD) == 0
    }

    /// Releases a lock taken with `lock`/`try_lock`.
    pub fn unlock(&self) {
        let old = self.value.xchg(0);
        assert!(old & HELD != 0, "spinlock: unlock of a free lock");
    }

    /// Disables interrupts, then acquires.
    pub fn lock_noirq(&self) {
        let was_enabled = irq::save_disable();
        self.acquire(Self::held_value(was_enabled));
    }

    /// Single attempt with interrupts disabled. On failure the interrupt
    /// flag is back where it was.
    pub fn try_lock_noirq(&self) -> bool {
        let was_enabled = irq::save_disable();
        if self.try_acquire(Self::held_value(was_enabled)) {
            return true;
        }
        irq::restore(was_enabled);
        false
    }

    /// Spins with interrupts disabled until the lock is taken or `now()`
    /// reaches `deadline_ns`. On timeout the interrupt flag is restored.
    pub fn try_lock_until_noirq(&self, deadline_ns: u64, mut now: impl FnMut() -> u64) -> bool {
        let was_enabled = irq::save_disable();
        let held_value = Self::held_value(was_enabled);
        let mut b = Backoff::new();
        loop {
            if self.try_acquire(held_value) {
                return true;
            }
            if now() >= deadline_ns {
                irq::restore(was_enabled);
                return false;
            }
            b.spin();
        }
    }

    /// Releases a `_noirq` acquisition and restores the interrupt flag
    /// recorded in the lock word.
    pub fn unlock_noirq(&self) {
        let old = self.value.xchg(0);
        assert!(old & HELD != 0, "spinlock: unlock of a free lock");
        irq::restore(old & IRQ_WAS_ENABLED != 0);
    }

    /// Releases the lock but leaves the interrupt flag alone, returning the
    /// lock word so `lock_restore` can re-take it with the same disposition.
    pub fn unlock_save(&self) -> i32 {
        let old = self.value.xchg(0);
        assert!(old & HELD != 0, "spinlock: unlock of a free lock");
        old
    }

    /// Re-acquires a lock released by `unlock_save`.
    pub fn lock_restore(&self, saved: i32) {
        debug_assert!(saved & HELD != 0);
        self.acquire(saved);
    }

    pub fn is_locked(&self) -> bool {
        self.value.load(Ordering::Relaxed) != 0
    }

    #[inline]
    fn try_acquire(&self, held_value: i32) -> bool {
        self.value.load(Ordering::Relaxed) == 0 && self.value.cmpxchg(0, held_value) == 0
    }

    #[inline]
    fn held_value(irq_was_enabled: bool) -> i32 {
        if irq_was_enabled {
            HELD | IRQ_WAS_ENABLED
        } else {
            HELD
        }
    }
}

impl Default for RawSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Spin lock around a value.
pub struct SpinLock<T> {
    raw: RawSpinLock,
    data: UnsafeCell<T>,
}

// SAFETY: the lock serializes all access to `data`.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            raw: RawSpinLock::new(),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquires without disabling interrupts.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.raw.lock();
        SpinLockGuard { lock: self, noirq: false }
    }

    /// Acquires with interrupts disabled until the guard drops.
    pub fn lock_noirq(&self) -> SpinLockGuard<'_, T> {
        self.raw.lock_noirq();
        SpinLockGuard { lock: self, noirq: true }
    }

    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        self.raw
            .try_lock()
            .then(|| SpinLockGuard { lock: self, noirq: false })
    }

    pub fn try_lock_noirq(&self) -> Option<SpinLockGuard<'_, T>> {
        self.raw
            .try_lock_noirq()
            .then(|| SpinLockGuard { lock: self, noirq: true })
    }

    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

/// RAII guard; releases in the mode it was acquired in.
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
    noirq: bool,
}

impl<T> SpinLockGuard<'_, T> {
    /// Drops the lock without touching the interrupt flag. The guard must
    /// be re-armed with `lock_restore` before it is used or dropped.
    pub(crate) fn unlock_save(&self) -> i32 {
        self.lock.raw.unlock_save()
    }

    pub(crate) fn lock_restore(&self, saved: i32) {
        self.lock.raw.lock_restore(saved);
    }

    fn release(&self) {
        if self.noirq {
            self.lock.raw.unlock_noirq();
        } else {
            self.lock.raw.unlock();
        }
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard holds the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard holds the lock.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn excludes_concurrent_holders() {
        let lock = Arc::new(SpinLock::new(0u64));
        let inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let lock = Arc::clone(&lock);
                let inside = Arc::clone(&inside);
                thread::spawn(move || {
                    for _ in 0..2000 {
                        let mut g = if i % 2 == 0 { lock.lock() } else { lock.lock_noirq() };
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        *g += 1;
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), 8000);
    }

    #[test]
    fn noirq_restores_prior_interrupt_state() {
        let lock = RawSpinLock::new();
        assert!(irq::enabled());
        lock.lock_noirq();
        assert!(!irq::enabled());
        lock.unlock_noirq();
        assert!(irq::enabled());

        let was = irq::save_disable();
        lock.lock_noirq();
        lock.unlock_noirq();
        assert!(!irq::enabled());
        irq::restore(was);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = RawSpinLock::new();
        assert!(lock.try_lock());
        assert!(!lock.try_lock());
        assert!(!lock.try_lock_noirq());
        assert!(irq::enabled());
        lock.unlock();
        assert!(!lock.is_locked());
    }

    #[test]
    fn timed_acquire_gives_up_with_interrupts_restored() {
        let lock = RawSpinLock::new();
        lock.lock();
        let mut clock = 0;
        let got = lock.try_lock_until_noirq(100, || {
            clock += 10;
            clock
        });
        assert!(!got);
        assert!(irq::enabled());
        lock.unlock();

        assert!(lock.try_lock_until_noirq(100, || 0));
        assert!(!irq::enabled());
        lock.unlock_noirq();
        assert!(irq::enabled());
    }

    #[test]
    fn unlock_save_keeps_the_interrupt_disposition() {
        let lock = RawSpinLock::new();
        lock.lock_noirq();
        let saved = lock.unlock_save();
        assert!(!lock.is_locked());
        assert!(!irq::enabled());
        lock.lock_restore(saved);
        lock.unlock_noirq();
        assert!(irq::enabled());
    }

    #[test]
    fn contended_lock_never_yields() {
        testing::install_host_executive();
        let lock = Arc::new(RawSpinLock::new());
        lock.lock();

        let holder = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                thread::sleep(std::time::Duration::from_millis(30));
                lock.unlock();
            })
        };

        let before = testing::host_yields();
        lock.lock();
        assert_eq!(testing::host_yields(), before);
        lock.unlock();
        holder.join().unwrap();
    }

    #[test]
    #[should_panic(expected = "unlock of a free lock")]
    fn unlocking_a_free_lock_is_fatal() {
        RawSpinLock::new().unlock();
    }
}
