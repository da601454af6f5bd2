//! Blocking reader/writer lock.
//!
//! `state` is 0 when free, the reader count when shared, and the encoded
//! owner (`-(id + 1)`) when exclusive. Writers and readers queue on
//! separate wait chains, every waiter stamped with its arrival order. Once
//! a writer is queued new readers queue behind it, so writers are not
//! starved. Releasing the exclusive hold admits every queued reader that
//! arrived before the next queued writer, all at once; only if there is
//! none does the next writer get the lock.

use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};

use crate::atomic::pause;
use crate::sync::backoff::SpinTuner;
use crate::sync::spinlock::RawSpinLock;
use crate::sync::wait::{self, WaitChain};
use crate::thread::ThreadId;

fn exclusive(id: ThreadId) -> i64 {
    -i64::from(id.to_raw()) - 1
}

pub struct RawRwLock {
    state: AtomicI64,
    // Writers on `ex_waiters`; readable without `lock`.
    writers_queued: AtomicU32,
    // Arrival stamps for both chains; advanced under `lock`.
    arrivals: AtomicU64,
    lock: RawSpinLock,
    ex_waiters: WaitChain,
    sh_waiters: WaitChain,
    spin: SpinTuner,
}

impl RawRwLock {
    pub const fn new() -> Self {
        Self {
            state: AtomicI64::new(0),
            writers_queued: AtomicU32::new(0),
            arrivals: AtomicU64::new(0),
            lock: RawSpinLock::new(),
            ex_waiters: WaitChain::new(),
            sh_waiters: WaitChain::new(),
            spin: SpinTuner::new(),
        }
    }

    fn worth_spinning(&self, spins: u32) -> bool {
        spins < self.spin.limit()
            && self.state.load(Ordering::Relaxed) < 0
            && self.writers_queued.load(Ordering::Relaxed) == 0
    }

    fn stamp(&self) -> u64 {
        self.arrivals.fetch_add(1, Ordering::Relaxed)
    }

    fn queue_writer(&self) {
        self.writers_queued.fetch_add(1, Ordering::Relaxed);
        wait::block_on_ordered(&self.ex_waiters, &self.lock, self.stamp());
    }

    /// Turns every queued reader stamped before the head writer (every
    /// queued reader if no writer waits) into a shared holder and resumes
    /// it. Caller holds `lock` and the exclusive hold. Returns how many.
    fn admit_early_readers(&self) -> u32 {
        let executive = wait::executive();
        // SAFETY (all chain accesses): the caller holds the protecting lock.
        let writer = unsafe { self.ex_waiters.front_ticket() };
        let mut admitted = 0;

        while let Some(ticket) = unsafe { self.sh_waiters.front_ticket() } {
            if writer.is_some_and(|w| ticket > w) {
                break;
            }
            let Some(reader) = (unsafe { self.sh_waiters.pop_front() }) else {
                break;
            };
            if admitted == 0 {
                self.state.store(0, Ordering::Relaxed);
            }
            self.state.fetch_add(1, Ordering::Release);
            admitted += 1;
            executive.resume(reader);
        }
        admitted
    }

    /// Pops the next writer and makes it owner. Caller holds `lock`.
    fn hand_to_writer(&self) -> Option<ThreadId> {
        // SAFETY: the caller holds the protecting lock.
        let next = unsafe { self.ex_waiters.pop_front() }?;
        self.writers_queued.fetch_sub(1, Ordering::Relaxed);
        self.state.store(exclusive(next), Ordering::Release);
        Some(next)
    }

    pub fn ex_lock(&self) {
        let me = wait::current_thread();
        assert!(!self.have_exclusive(), "rwlock: recursive exclusive lock");

        let mut spins = 0u32;
        loop {
            if self.worth_spinning(spins) {
                pause();
                spins += 1;
                continue;
            }

            self.lock.lock_noirq();

            if self.state.load(Ordering::Relaxed) == 0
                && self.writers_queued.load(Ordering::Relaxed) == 0
            {
                self.state.store(exclusive(me), Ordering::Release);
                self.lock.unlock_noirq();
                self.spin.reward();
                return;
            }

            if spins >= self.spin.limit() {
                self.spin.penalize();
                self.queue_writer();
                assert_eq!(
                    self.state.load(Ordering::Acquire),
                    exclusive(me),
                    "rwlock: writer woken without ownership"
                );
                return;
            }

            self.lock.unlock_noirq();
            pause();
            spins += 1;
        }
    }

    pub fn ex_try_lock(&self) -> bool {
        let me = wait::current_thread();
        self.lock.lock_noirq();
        let free = self.state.load(Ordering::Relaxed) == 0
            && self.writers_queued.load(Ordering::Relaxed) == 0;
        if free {
            self.state.store(exclusive(me), Ordering::Release);
        }
        self.lock.unlock_noirq();
        free
    }

    pub fn ex_unlock(&self) {
        let me = wait::current_thread();
        let executive = wait::executive();

        self.lock.lock_noirq();
        assert_eq!(
            self.state.load(Ordering::Relaxed),
            exclusive(me),
            "rwlock: exclusive unlock by a non-owner"
        );

        if self.admit_early_readers() > 0 {
            self.lock.unlock_noirq();
            return;
        }

        if let Some(next) = self.hand_to_writer() {
            self.lock.unlock_noirq();
            executive.resume(next);
            return;
        }

        self.state.store(0, Ordering::Release);
        self.lock.unlock_noirq();
    }

    pub fn sh_lock(&self) {
        let mut spins = 0u32;
        loop {
            if self.worth_spinning(spins) {
                pause();
                spins += 1;
                continue;
            }

            self.lock.lock_noirq();

            if self.state.load(Ordering::Relaxed) >= 0
                && self.writers_queued.load(Ordering::Relaxed) == 0
            {
                self.state.fetch_add(1, Ordering::Acquire);
                self.lock.unlock_noirq();
                self.spin.reward();
                return;
            }

            if spins >= self.spin.limit() {
                self.spin.penalize();
                wait::block_on_ordered(&self.sh_waiters, &self.lock, self.stamp());
                // The releaser counted us in before resuming us.
                assert!(self.state.load(Ordering::Acquire) > 0);
                return;
            }

            self.lock.unlock_noirq();
            pause();
            spins += 1;
        }
    }

    pub fn sh_try_lock(&self) -> bool {
        self.lock.lock_noirq();
        let ok = self.state.load(Ordering::Relaxed) >= 0
            && self.writers_queued.load(Ordering::Relaxed) == 0;
        if ok {
            self.state.fetch_add(1, Ordering::Acquire);
        }
        self.lock.unlock_noirq();
        ok
    }

    pub fn sh_unlock(&self) {
        self.lock.lock_noirq();
        let readers = self.state.load(Ordering::Relaxed);
        assert!(readers > 0, "rwlock: shared unlock without a shared hold");
        self.state.store(readers - 1, Ordering::Release);

        let next = if readers == 1 {
            self.hand_to_writer()
        } else {
            None
        };
        self.lock.unlock_noirq();

        if let Some(next) = next {
            wait::executive().resume(next);
        }
    }

    /// Converts the caller's shared hold into an exclusive one.
    ///
    /// Immediate if the caller is the only reader. Otherwise the caller
    /// gives up its shared hold and queues as a writer, so a writer queued
    /// earlier gets in first.
    pub fn upgrade(&self) {
        let me = wait::current_thread();

        self.lock.lock_noirq();
        let readers = self.state.load(Ordering::Relaxed);
        assert!(readers > 0, "rwlock: upgrade without a shared hold");

        if readers == 1 && self.writers_queued.load(Ordering::Relaxed) == 0 {
            self.state.store(exclusive(me), Ordering::Release);
            self.lock.unlock_noirq();
            return;
        }

        self.state.store(readers - 1, Ordering::Relaxed);
        if readers == 1 {
            // We were the last reader; the head writer goes first.
            if let Some(next) = self.hand_to_writer() {
                wait::executive().resume(next);
            }
        }
        self.queue_writer();
        assert_eq!(self.state.load(Ordering::Acquire), exclusive(me));
    }

    /// Whether the calling thread holds the lock exclusively.
    pub fn have_exclusive(&self) -> bool {
        self.state.load(Ordering::Relaxed) == exclusive(wait::current_thread())
    }

    /// Reader count; 0 when free or exclusively held.
    pub fn readers(&self) -> u32 {
        u32::try_from(self.state.load(Ordering::Relaxed)).unwrap_or(0)
    }

    pub fn is_exclusive(&self) -> bool {
        self.state.load(Ordering::Relaxed) < 0
    }

    /// Checks that nothing holds or waits on the lock.
    pub fn destroy(&self) {
        self.lock.lock_noirq();
        let idle = self.state.load(Ordering::Relaxed) == 0
            && self.ex_waiters.is_empty()
            && self.sh_waiters.is_empty();
        self.lock.unlock_noirq();
        assert!(idle, "rwlock: destroyed while held or waited on");
    }
}

impl Default for RawRwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RawRwLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawRwLock")
            .field("state", &self.state.load(Ordering::Relaxed))
            .field("writers_queued", &self.writers_queued.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// A blocking reader/writer lock protecting a `T`.
pub struct RwLock<T: ?Sized> {
    raw: RawRwLock,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for RwLock<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for RwLock<T> {}

impl<T> RwLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            raw: RawRwLock::new(),
            data: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.raw.destroy();
        self.data.into_inner()
    }
}

impl<T: ?Sized> RwLock<T> {
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.raw.sh_lock();
        RwLockReadGuard { lock: self }
    }

    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, T>> {
        self.raw.sh_try_lock().then(|| RwLockReadGuard { lock: self })
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.raw.ex_lock();
        RwLockWriteGuard { lock: self }
    }

    pub fn try_write(&self) -> Option<RwLockWriteGuard<'_, T>> {
        self.raw.ex_try_lock().then(|| RwLockWriteGuard { lock: self })
    }

    pub fn raw(&self) -> &RawRwLock {
        &self.raw
    }
}

impl<T: Default> Default for RwLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized> fmt::Debug for RwLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RwLock").field("raw", &self.raw).finish_non_exhaustive()
    }
}

pub struct RwLockReadGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
}

impl<'a, T: ?Sized> RwLockReadGuard<'a, T> {
    /// See [`RawRwLock::upgrade`]: the data may have changed by the time
    /// this returns.
    pub fn upgrade(self) -> RwLockWriteGuard<'a, T> {
        let lock = self.lock;
        core::mem::forget(self);
        lock.raw.upgrade();
        RwLockWriteGuard { lock }
    }
}

impl<T: ?Sized> Deref for RwLockReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: shared hold.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for RwLockReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.sh_unlock();
    }
}

pub struct RwLockWriteGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
}

impl<T: ?Sized> Deref for RwLockWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: exclusive hold.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for RwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: exclusive hold.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for RwLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.ex_unlock();
    }
}
