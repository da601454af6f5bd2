// =============================================================================
// MinimalOS NextGen — Reader/Writer Spinlock
// =============================================================================
//
// One signed word:
//
//   0            free
//   -1           held exclusively
//   N > 0        held by N readers
//   (1<<30) + N  N readers still inside, a writer is waiting for them to
//                leave; no new reader may enter
//
// A writer first tries the fast path (CAS 0 -> -1). If readers are inside it
// claims bit 30, which shuts out new readers, then waits for the count to
// drain to exactly the residual it expects (0, or 1 when upgrading from its
// own shared hold) and swaps the whole word to -1.
//
// Interrupt state is not touched. Callers reachable from an interrupt handler
// must take it with interrupts already disabled.
// =============================================================================

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicI32, Ordering};

use crate::arch;
use crate::atomic::AtomicInt;
use crate::sync::backoff::Backoff;

const EXCLUSIVE: i32 = -1;
const WRITER_PENDING: i32 = 1 << 30;

#[derive(Debug)]
pub struct RawRwSpinLock {
    value: AtomicI32,
}

impl RawRwSpinLock {
    pub const fn new() -> Self {
        Self {
            value: AtomicI32::new(0),
        }
    }

    /// `expect` is the number of readers allowed to remain: 0 for a plain
    /// acquire, 1 when the caller itself is the remaining reader.
    fn ex_lock_draining(&self, expect: i32) {
        let mut own_pending = false;
        let mut old = self.value.ld_acq();
        let mut b = Backoff::new();

        loop {
            if !own_pending {
                if old == expect && self.value.cmpxchg_upd(&mut old, EXCLUSIVE) {
                    return;
                }

                // Readers inside and no other writer waiting: shut the door.
                if old > 0 && old < WRITER_PENDING {
                    let new = old | WRITER_PENDING;
                    if self.value.cmpxchg_upd(&mut old, new) {
                        own_pending = true;
                        old |= WRITER_PENDING;
                    }
                    continue;
                }
            } else if old == WRITER_PENDING + expect {
                if self.value.cmpxchg_upd(&mut old, EXCLUSIVE) {
                    return;
                }
                continue;
            }

            b.spin();
            old = self.value.ld_acq();
        }
    }

    pub fn ex_lock(&self) {
        self.ex_lock_draining(0);
    }

    pub fn ex_try_lock(&self) -> bool {
        self.value.load(Ordering::Relaxed) == 0 && self.value.cmpxchg(0, EXCLUSIVE) == 0
    }

    pub fn ex_unlock(&self) {
        let old = self.value.xchg(0);
        assert_eq!(old, EXCLUSIVE, "rwspinlock: exclusive unlock without exclusive hold");
    }

    pub fn sh_lock(&self) {
        let mut old = self.value.ld_acq();
        loop {
            if (0..WRITER_PENDING).contains(&old) {
                let new = old + 1;
                if self.value.cmpxchg_upd(&mut old, new) {
                    return;
                }
                continue;
            }

            // Held exclusively or a writer is draining readers.
            arch::wait_for_change(&self.value, old);
            old = self.value.ld_acq();
        }
    }

    /// Fails if a writer holds the lock or is waiting for it.
    pub fn sh_try_lock(&self) -> bool {
        let mut old = self.value.ld_acq();
        while (0..WRITER_PENDING).contains(&old) {
            let new = old + 1;
            if self.value.cmpxchg_upd(&mut old, new) {
                return true;
            }
        }
        false
    }

    pub fn sh_unlock(&self) {
        let mut old = self.value.ld_acq();
        loop {
            assert!(
                old & !WRITER_PENDING > 0,
                "rwspinlock: shared unlock without shared hold"
            );
            let new = old - 1;
            if self.value.cmpxchg_upd(&mut old, new) {
                return;
            }
        }
    }

    /// Converts the caller's shared hold into an exclusive one. Waits for
    /// the other readers to leave; new readers are held off meanwhile.
    ///
    /// Two readers upgrading at once deadlock: each waits for the other
    /// to leave.
    pub fn upgrade(&self) {
        assert!(self.value.load(Ordering::Relaxed) > 0, "rwspinlock: upgrade without shared hold");
        self.ex_lock_draining(1);
    }

    /// Converts an exclusive hold into a single shared hold.
    pub fn downgrade(&self) {
        let old = self.value.xchg(1);
        assert_eq!(old, EXCLUSIVE, "rwspinlock: downgrade without exclusive hold");
    }

    /// Readers currently inside (0 when free or exclusively held).
    pub fn readers(&self) -> i32 {
        let v = self.value.load(Ordering::Relaxed);
        if v < 0 { 0 } else { v & !WRITER_PENDING }
    }

    pub fn is_exclusive(&self) -> bool {
        self.value.load(Ordering::Relaxed) == EXCLUSIVE
    }
}

impl Default for RawRwSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Reader/writer spin lock around a value.
pub struct RwSpinLock<T> {
    raw: RawRwSpinLock,
    data: UnsafeCell<T>,
}

// SAFETY: readers only get `&T` (needs `Sync`), writers get `&mut T`.
unsafe impl<T: Send> Send for RwSpinLock<T> {}
unsafe impl<T: Send + Sync> Sync for RwSpinLock<T> {}

impl<T> RwSpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            raw: RawRwSpinLock::new(),
            data: UnsafeCell::new(value),
        }
    }

    pub fn read(&self) -> RwSpinReadGuard<'_, T> {
        self.raw.sh_lock();
        RwSpinReadGuard { lock: self }
    }

    pub fn try_read(&self) -> Option<RwSpinReadGuard<'_, T>> {
        self.raw.sh_try_lock().then(|| RwSpinReadGuard { lock: self })
    }

    pub fn write(&self) -> RwSpinWriteGuard<'_, T> {
        self.raw.ex_lock();
        RwSpinWriteGuard { lock: self }
    }

    pub fn try_write(&self) -> Option<RwSpinWriteGuard<'_, T>> {
        self.raw.ex_try_lock().then(|| RwSpinWriteGuard { lock: self })
    }

    pub fn raw(&self) -> &RawRwSpinLock {
        &self.raw
    }
}

pub struct RwSpinReadGuard<'a, T> {
    lock: &'a RwSpinLock<T>,
}

impl<'a, T> RwSpinReadGuard<'a, T> {
    pub fn upgrade(self) -> RwSpinWriteGuard<'a, T> {
        let lock = self.lock;
        core::mem::forget(self);
        lock.raw.upgrade();
        RwSpinWriteGuard { lock }
    }
}

impl<T> Deref for RwSpinReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: shared hold; writers are excluded.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for RwSpinReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.sh_unlock();
    }
}

pub struct RwSpinWriteGuard<'a, T> {
    lock: &'a RwSpinLock<T>,
}

impl<'a, T> RwSpinWriteGuard<'a, T> {
    pub fn downgrade(self) -> RwSpinReadGuard<'a, T> {
        let lock = self.lock;
        core::mem::forget(self);
        lock.raw.downgrade();
        RwSpinReadGuard { lock }
    }
}

impl<T> Deref for RwSpinWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: exclusive hold.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for RwSpinWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: exclusive hold.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for RwSpinWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.ex_unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn readers_share_writers_exclude() {
        let lock = Arc::new(RwSpinLock::new(0u64));
        let readers = Arc::new(AtomicUsize::new(0));
        let writers = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let lock = Arc::clone(&lock);
                let readers = Arc::clone(&readers);
                let writers = Arc::clone(&writers);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        if i % 3 == 0 {
                            let mut g = lock.write();
                            assert_eq!(writers.fetch_add(1, Ordering::SeqCst), 0);
                            assert_eq!(readers.load(Ordering::SeqCst), 0);
                            *g += 1;
                            writers.fetch_sub(1, Ordering::SeqCst);
                        } else {
                            let _g = lock.read();
                            readers.fetch_add(1, Ordering::SeqCst);
                            assert_eq!(writers.load(Ordering::SeqCst), 0);
                            readers.fetch_sub(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.read(), 2000);
        assert_eq!(lock.raw().readers(), 0);
    }

    #[test]
    fn waiting_writer_shuts_out_new_readers() {
        let lock = Arc::new(RawRwSpinLock::new());
        lock.sh_lock();

        let writer = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                lock.ex_lock();
                lock.ex_unlock();
            })
        };

        while lock.value.load(Ordering::Relaxed) & WRITER_PENDING == 0 {
            thread::yield_now();
        }
        assert!(!lock.sh_try_lock());
        assert_eq!(lock.readers(), 1);

        lock.sh_unlock();
        writer.join().unwrap();
        assert!(lock.sh_try_lock());
        lock.sh_unlock();
    }

    #[test]
    fn upgrade_waits_for_other_readers() {
        let lock = Arc::new(RwSpinLock::new(1));
        let other = lock.read();

        let upgrader = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                let mut w = lock.read().upgrade();
                *w += 1;
                let r = w.downgrade();
                *r
            })
        };

        thread::sleep(Duration::from_millis(20));
        assert!(!lock.raw().is_exclusive());
        drop(other);

        assert_eq!(upgrader.join().unwrap(), 2);
        assert!(lock.try_write().is_some());
    }

    #[test]
    #[should_panic(expected = "shared unlock without shared hold")]
    fn shared_unlock_of_free_lock_is_fatal() {
        RawRwSpinLock::new().sh_unlock();
    }
}
