// =============================================================================
// MinimalOS NextGen — Ticket Spinlock
// =============================================================================
//
// A ticket spinlock provides mutual exclusion with FIFO fairness: threads
// acquire the lock in exactly the order they took their tickets.
//
// HOW IT WORKS:
//   - Two counters: `next_ticket` and `now_serving`
//   - To lock: atomically add 2 to `next_ticket`, keeping the old value as
//     your ticket. Spin until `now_serving` (ignoring bit 0) equals it.
//   - To unlock: advance `now_serving` by 2, which admits the next ticket.
//
// Tickets advance by 2 so bit 0 of `next_ticket` is always clear. The holder
// uses bit 0 of `now_serving` to remember whether interrupts were enabled
// before it disabled them; unlock reads it back and clears it as it advances.
//
// IRQ SAFETY:
//   Interrupts are disabled BEFORE taking a ticket. Otherwise a handler on
//   the same core could take a later ticket and spin forever behind us.
// =============================================================================

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

use crate::arch::irq;
use crate::atomic::AtomicInt;
use crate::sync::backoff::Backoff;

const IRQ_BIT: u32 = 1;

/// The bare ticket pair.
#[derive(Debug)]
pub struct RawTicketLock {
    /// Ticket currently admitted; bit 0 is the holder's saved interrupt flag.
    now_serving: AtomicU32,
    /// Next ticket to hand out; always even.
    next_ticket: AtomicU32,
}

impl RawTicketLock {
    pub const fn new() -> Self {
        Self {
            now_serving: AtomicU32::new(0),
            next_ticket: AtomicU32::new(0),
        }
    }

    /// Disables interrupts, takes a ticket and waits for it.
    pub fn lock(&self) {
        let was_enabled = irq::save_disable();
        self.wait_for_turn(was_enabled as u32);
    }

    /// Succeeds only if nobody holds or waits for the lock.
    pub fn try_lock(&self) -> bool {
        let was_enabled = irq::save_disable();
        let serving = self.now_serving.load(Ordering::Acquire) & !IRQ_BIT;
        if self.next_ticket.cmpxchg(serving, serving.wrapping_add(2)) == serving {
            self.now_serving.store(serving | was_enabled as u32, Ordering::Relaxed);
            return true;
        }
        irq::restore(was_enabled);
        false
    }

    /// Admits the next ticket and restores the interrupt flag.
    pub fn unlock(&self) {
        let saved = self.release();
        irq::restore(saved & IRQ_BIT != 0);
    }

    /// Admits the next ticket but leaves interrupts as they are. Returns
    /// what `lock_restore` needs to re-take the lock.
    pub fn unlock_save(&self) -> u32 {
        self.release() & IRQ_BIT
    }

    /// Takes a new ticket and, once admitted, restores the saved disposition.
    pub fn lock_restore(&self, saved: u32) {
        self.wait_for_turn(saved & IRQ_BIT);
    }

    /// Holder plus waiters.
    pub fn queued(&self) -> u32 {
        let serving = self.now_serving.load(Ordering::Relaxed) & !IRQ_BIT;
        self.next_ticket.load(Ordering::Relaxed).wrapping_sub(serving) / 2
    }

    pub fn is_locked(&self) -> bool {
        self.queued() != 0
    }

    fn wait_for_turn(&self, irq_bit: u32) {
        let ticket = self.next_ticket.xadd(2);

        let mut b = Backoff::new();
        while self.now_serving.load(Ordering::Acquire) & !IRQ_BIT != ticket {
            b.spin();
        }

        // Only the holder writes `now_serving` until it unlocks.
        self.now_serving.store(ticket | irq_bit, Ordering::Relaxed);
    }

    fn release(&self) -> u32 {
        let serving = self.now_serving.load(Ordering::Relaxed);
        assert!(
            self.next_ticket.load(Ordering::Relaxed) != serving & !IRQ_BIT,
            "ticketlock: unlock of a free lock"
        );
        self.now_serving
            .store((serving & !IRQ_BIT).wrapping_add(2), Ordering::Release);
        serving
    }
}

impl Default for RawTicketLock {
    fn default() -> Self {
        Self::new()
    }
}

/// A ticket lock around a value; interrupts stay disabled while the
/// guard lives.
///
/// ```ignore
/// static COUNTER: TicketLock<u64> = TicketLock::new(0);
///
/// *COUNTER.lock() += 1;
/// ```
pub struct TicketLock<T> {
    raw: RawTicketLock,
    data: UnsafeCell<T>,
}

// SAFETY: the ticket protocol serializes all access to `data`.
unsafe impl<T: Send> Send for TicketLock<T> {}
unsafe impl<T: Send> Sync for TicketLock<T> {}

impl<T> TicketLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            raw: RawTicketLock::new(),
            data: UnsafeCell::new(value),
        }
    }

    pub fn lock(&self) -> TicketLockGuard<'_, T> {
        self.raw.lock();
        TicketLockGuard { lock: self }
    }

    pub fn try_lock(&self) -> Option<TicketLockGuard<'_, T>> {
        self.raw.try_lock().then(|| TicketLockGuard { lock: self })
    }

    /// Exclusive access without locking; `&mut self` proves nobody else
    /// can reach the lock.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    pub fn raw(&self) -> &RawTicketLock {
        &self.raw
    }
}

/// RAII guard for a held ticket lock.
pub struct TicketLockGuard<'a, T> {
    lock: &'a TicketLock<T>,
}

impl<T> Deref for TicketLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: we hold the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for TicketLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: we hold the lock.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for TicketLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::vec::Vec;

    #[test]
    fn grants_in_ticket_order() {
        const N: usize = 6;
        let lock = Arc::new(TicketLock::new(Vec::new()));

        let held = lock.lock();
        let handles: Vec<_> = (0..N)
            .map(|i| {
                let l = Arc::clone(&lock);
                let h = thread::spawn(move || l.lock().push(i));
                // Wait until thread i holds ticket i + 1 before starting the next.
                while lock.raw().queued() != i as u32 + 2 {
                    thread::yield_now();
                }
                h
            })
            .collect();
        drop(held);

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), (0..N).collect::<Vec<_>>());
    }

    #[test]
    fn interrupt_flag_round_trips_through_bit_zero() {
        let lock = RawTicketLock::new();
        lock.lock();
        assert!(!irq::enabled());
        assert_eq!(lock.queued(), 1);
        lock.unlock();
        assert!(irq::enabled());
        assert!(!lock.is_locked());
    }

    #[test]
    fn try_lock_only_when_uncontended() {
        let lock = RawTicketLock::new();
        assert!(lock.try_lock());
        assert!(!lock.try_lock());
        lock.unlock();
        assert!(irq::enabled());
        assert!(lock.try_lock());
        lock.unlock();
    }

    #[test]
    fn unlock_save_and_restore() {
        let lock = RawTicketLock::new();
        lock.lock();
        let saved = lock.unlock_save();
        assert_eq!(saved, 1);
        assert!(!lock.is_locked());
        assert!(!irq::enabled());
        lock.lock_restore(saved);
        lock.unlock();
        assert!(irq::enabled());
    }
}
