//! Blocking mutex.
//!
//! Contenders first spin (outside the protecting spin lock) for a budget
//! the lock tunes itself: an acquisition that needed no queueing raises
//! it, a thread that had to queue lowers it. When the budget runs out the
//! thread links itself onto the wait chain and suspends, releasing the
//! protecting lock in the same step. `unlock` hands ownership straight to
//! the oldest waiter; it never re-races.
//!
//! Not usable from interrupt handlers.

use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

use crate::atomic::pause;
use crate::sync::backoff::SpinTuner;
use crate::sync::spinlock::RawSpinLock;
use crate::sync::wait::{self, WaitChain};
use crate::thread::ThreadId;

const FREE: u32 = ThreadId::NONE_RAW;

pub struct RawMutex {
    owner: AtomicU32,
    lock: RawSpinLock,
    waiters: WaitChain,
    spin: SpinTuner,
}

impl RawMutex {
    pub const fn new() -> Self {
        Self {
            owner: AtomicU32::new(FREE),
            lock: RawSpinLock::new(),
            waiters: WaitChain::new(),
            spin: SpinTuner::new(),
        }
    }

    fn try_claim(&self, me: u32) -> bool {
        self.owner
            .compare_exchange(FREE, me, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn lock(&self) {
        let me = wait::current_thread().to_raw();
        assert_ne!(
            self.owner.load(Ordering::Relaxed),
            me,
            "mutex: recursive lock"
        );

        if self.try_claim(me) {
            self.spin.reward();
            return;
        }

        let mut spins = 0u32;
        loop {
            while spins < self.spin.limit() && self.owner.load(Ordering::Relaxed) != FREE {
                pause();
                spins += 1;
            }

            self.lock.lock_noirq();

            if self.try_claim(me) {
                self.lock.unlock_noirq();
                self.spin.reward();
                return;
            }

            if spins < self.spin.limit() {
                // Lost a race after seeing it free; keep spinning.
                self.lock.unlock_noirq();
                continue;
            }

            self.spin.penalize();
            wait::block_on(&self.waiters, &self.lock);

            // The releaser made us owner before resuming us.
            assert_eq!(
                self.owner.load(Ordering::Acquire),
                me,
                "mutex: woken without ownership"
            );
            return;
        }
    }

    pub fn try_lock(&self) -> bool {
        self.try_claim(wait::current_thread().to_raw())
    }

    pub fn unlock(&self) {
        let me = wait::current_thread().to_raw();

        self.lock.lock_noirq();
        assert_eq!(
            self.owner.load(Ordering::Relaxed),
            me,
            "mutex: unlocked by a thread that does not own it"
        );

        // SAFETY: we hold the protecting lock.
        let next = unsafe { self.waiters.pop_front() };
        match next {
            Some(next) => self.owner.store(next.to_raw(), Ordering::Release),
            None => self.owner.store(FREE, Ordering::Release),
        }
        self.lock.unlock_noirq();

        if let Some(next) = next {
            wait::executive().resume(next);
        }
    }

    /// Whether the calling thread owns the mutex.
    pub fn is_held(&self) -> bool {
        self.owner.load(Ordering::Relaxed) == wait::current_thread().to_raw()
    }

    pub fn is_locked(&self) -> bool {
        self.owner.load(Ordering::Relaxed) != FREE
    }

    /// Owner, if any.
    pub fn owner(&self) -> Option<ThreadId> {
        ThreadId::from_raw(self.owner.load(Ordering::Relaxed))
    }

    /// Checks that nothing holds or waits on the mutex.
    pub fn destroy(&self) {
        self.lock.lock_noirq();
        let idle = self.waiters.is_empty() && self.owner.load(Ordering::Relaxed) == FREE;
        self.lock.unlock_noirq();
        assert!(idle, "mutex: destroyed while held or waited on");
    }
}

impl Default for RawMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RawMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawMutex")
            .field("owner", &self.owner())
            .field("spin", &self.spin.limit())
            .finish_non_exhaustive()
    }
}

/// A blocking mutex protecting a `T`.
pub struct Mutex<T: ?Sized> {
    raw: RawMutex,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            raw: RawMutex::new(),
            data: UnsafeCell::new(value),
        }
    }

    /// Destroys the mutex, returning the value.
    pub fn into_inner(self) -> T {
        self.raw.destroy();
        self.data.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.raw.lock();
        MutexGuard { mutex: self }
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        self.raw.try_lock().then(|| MutexGuard { mutex: self })
    }

    pub fn is_held(&self) -> bool {
        self.raw.is_held()
    }

    pub fn raw(&self) -> &RawMutex {
        &self.raw
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex").field("raw", &self.raw).finish_non_exhaustive()
    }
}

pub struct MutexGuard<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
}

impl<'a, T: ?Sized> MutexGuard<'a, T> {
    pub(crate) fn mutex(&self) -> &'a Mutex<T> {
        self.mutex
    }
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard owns the mutex.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard owns the mutex.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.raw.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn one_holder_at_a_time() {
        testing::install_host_executive();
        let mutex = Arc::new(Mutex::new(0u64));
        let inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let mutex = Arc::clone(&mutex);
                let inside = Arc::clone(&inside);
                thread::spawn(move || {
                    for _ in 0..2000 {
                        let mut g = mutex.lock();
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

        assert_eq!(*mutex.lock(), 12_000);
        assert!(!mutex.raw().is_locked());
    }

    #[test]
    fn unlock_hands_off_to_queued_waiter() {
        testing::install_host_executive();
        let mutex = Arc::new(Mutex::new(Vec::new()));

        let guard = mutex.lock();
        assert!(mutex.is_held());

        let waiter = {
            let mutex = Arc::clone(&mutex);
            thread::spawn(move || {
                mutex.lock().push(wait::current_thread());
            })
        };

        // Let the waiter exhaust its spin budget and queue.
        while {
            mutex.raw().lock.lock_noirq();
            let queued = !mutex.raw().waiters.is_empty();
            mutex.raw().lock.unlock_noirq();
            !queued
        } {
            thread::sleep(Duration::from_millis(1));
        }

        drop(guard);
        waiter.join().unwrap();

        let g = mutex.lock();
        assert_eq!(g.len(), 1);
        assert_ne!(g[0], wait::current_thread());
    }

    #[test]
    fn try_lock_fails_while_owned_elsewhere() {
        testing::install_host_executive();
        let mutex = Arc::new(Mutex::new(()));
        let g = mutex.lock();

        let other = Arc::clone(&mutex);
        let got = thread::spawn(move || other.try_lock().is_some())
            .join()
            .unwrap();
        assert!(!got);

        drop(g);
        assert!(mutex.try_lock().is_some());
    }

    #[test]
    #[should_panic(expected = "does not own")]
    fn unlock_by_non_owner_panics() {
        testing::install_host_executive();
        let mutex = RawMutex::new();
        mutex.unlock();
    }

    #[test]
    fn into_inner_after_use() {
        testing::install_host_executive();
        let mutex = Mutex::new(5);
        *mutex.lock() += 1;
        assert_eq!(mutex.into_inner(), 6);
    }
}
