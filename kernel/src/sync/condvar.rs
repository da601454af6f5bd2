// =============================================================================
// MinimalOS NextGen — Condition Variable
// =============================================================================
//
// A protecting spin lock and a wait chain, nothing else. `wait` queues the
// caller under the condvar's spin lock *before* it drops the caller's lock,
// then suspends and releases the spin lock in one step. A notifier that
// changed the condition under the caller's lock therefore either runs
// before the waiter queued (and the waiter sees the new condition) or finds
// it on the chain: no wakeup is lost.
//
// Woken threads re-take the caller's lock on their own, so a third thread
// may get there first. Callers re-check their predicate in a loop.
// =============================================================================

use crate::sync::mutex::MutexGuard;
use crate::sync::spinlock::{RawSpinLock, SpinLockGuard};
use crate::sync::wait::{self, WaitChain};

#[derive(Debug, Default)]
pub struct Condvar {
    lock: RawSpinLock,
    waiters: WaitChain,
}

impl Condvar {
    pub const fn new() -> Self {
        Self {
            lock: RawSpinLock::new(),
            waiters: WaitChain::new(),
        }
    }

    /// Releases `guard`'s mutex, sleeps until notified, re-locks.
    pub fn wait<'a, T: ?Sized>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        let mutex = guard.mutex();
        assert!(mutex.is_held(), "condvar: wait without holding the mutex");

        self.lock.lock_noirq();
        wait::block_on_then(&self.waiters, &self.lock, move || drop(guard));
        mutex.lock()
    }

    /// Waits until `condition` returns false.
    pub fn wait_while<'a, T: ?Sized>(
        &self,
        mut guard: MutexGuard<'a, T>,
        mut condition: impl FnMut(&mut T) -> bool,
    ) -> MutexGuard<'a, T> {
        while condition(&mut *guard) {
            guard = self.wait(guard);
        }
        guard
    }

    /// Same as [`wait`](Self::wait) against a spin lock. The spin lock is
    /// re-taken with the interrupt disposition it was first taken with.
    pub fn wait_spin<'a, T>(&self, guard: SpinLockGuard<'a, T>) -> SpinLockGuard<'a, T> {
        self.lock.lock_noirq();
        let mut saved = 0;
        wait::block_on_then(&self.waiters, &self.lock, || saved = guard.unlock_save());
        guard.lock_restore(saved);
        guard
    }

    pub fn notify_one(&self) -> bool {
        self.notify_n(1) == 1
    }

    /// Wakes up to `n` waiters, oldest first. Returns how many woke.
    pub fn notify_n(&self, n: usize) -> usize {
        self.lock.lock_noirq();
        let mut woken = 0;
        // SAFETY: we hold the protecting lock.
        while woken < n && unsafe { wait::wake_front(&self.waiters) }.is_some() {
            woken += 1;
        }
        self.lock.unlock_noirq();
        woken
    }

    pub fn notify_all(&self) -> usize {
        self.notify_n(usize::MAX)
    }

    /// Wakes anything still waiting; the condvar must not be used after.
    pub fn destroy(&self) {
        self.lock.lock_noirq();
        // SAFETY: we hold the protecting lock.
        while unsafe { wait::wake_front(&self.waiters) }.is_some() {}
        self.lock.unlock_noirq();
    }
}
