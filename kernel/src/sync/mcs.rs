//! MCS queue lock.
//!
//! The lock is a single tail pointer. Each acquirer brings its own queue
//! node, swaps it into the tail, links itself behind its predecessor and
//! spins on its *own* node's `locked` flag; the predecessor clears that
//! flag on release. Every waiter spins on a different cache line, and
//! the queue is strictly FIFO.
//!
//! Interrupts are disabled from acquire to release; the prior state is
//! kept in the node.

use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use crate::arch::irq;
use crate::sync::backoff::Backoff;

/// A waiter's queue entry. Must stay put while it is queued, which the
/// guard's borrow enforces.
#[derive(Debug)]
pub struct McsNode {
    next: AtomicPtr<McsNode>,
    locked: AtomicBool,
    irq_was_enabled: AtomicBool,
    queued: AtomicBool,
}

impl McsNode {
    pub const fn new() -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
            locked: AtomicBool::new(false),
            irq_was_enabled: AtomicBool::new(false),
            queued: AtomicBool::new(false),
        }
    }

    fn as_ptr(&self) -> *mut McsNode {
        self as *const McsNode as *mut McsNode
    }

    fn claim(&self) {
        assert!(
            !self.queued.swap(true, Ordering::Relaxed),
            "mcslock: node is already queued"
        );
        self.next.store(ptr::null_mut(), Ordering::Relaxed);
    }
}

impl Default for McsNode {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct McsLock {
    tail: AtomicPtr<McsNode>,
}

impl McsLock {
    pub const fn new() -> Self {
        Self {
            tail: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub fn lock<'a>(&'a self, node: &'a McsNode) -> McsGuard<'a> {
        node.claim();
        node.locked.store(true, Ordering::Relaxed);
        node.irq_was_enabled
            .store(irq::save_disable(), Ordering::Relaxed);

        let pred = self.tail.swap(node.as_ptr(), Ordering::AcqRel);
        if !pred.is_null() {
            // SAFETY: a queued node stays valid until its owner has handed
            // the lock on, which cannot happen before we link in.
            unsafe { (*pred).next.store(node.as_ptr(), Ordering::Release) };

            let mut b = Backoff::new();
            while node.locked.load(Ordering::Acquire) {
                b.spin();
            }
        }

        McsGuard { lock: self, node }
    }

    /// Succeeds only if the queue is empty.
    pub fn try_lock<'a>(&'a self, node: &'a McsNode) -> Option<McsGuard<'a>> {
        node.claim();
        let was_enabled = irq::save_disable();

        match self.tail.compare_exchange(
            ptr::null_mut(),
            node.as_ptr(),
            Ordering::AcqRel,
            Ordering::Relaxed,
        ) {
            Ok(_) => {
                node.irq_was_enabled.store(was_enabled, Ordering::Relaxed);
                Some(McsGuard { lock: self, node })
            }
            Err(_) => {
                irq::restore(was_enabled);
                node.queued.store(false, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn is_locked(&self) -> bool {
        !self.tail.load(Ordering::Relaxed).is_null()
    }

    fn unlock(&self, node: &McsNode) {
        let mut next = node.next.load(Ordering::Acquire);

        if next.is_null() {
            // No visible successor: try to swing the tail back to empty.
            if self
                .tail
                .compare_exchange(node.as_ptr(), ptr::null_mut(), Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                self.finish(node);
                return;
            }

            // Someone swapped in behind us but has not linked yet.
            let mut b = Backoff::new();
            loop {
                next = node.next.load(Ordering::Acquire);
                if !next.is_null() {
                    break;
                }
                b.spin();
            }
        }

        // SAFETY: the successor spins on its node until we clear `locked`.
        unsafe { (*next).locked.store(false, Ordering::Release) };
        self.finish(node);
    }

    fn finish(&self, node: &McsNode) {
        node.queued.store(false, Ordering::Relaxed);
        irq::restore(node.irq_was_enabled.load(Ordering::Relaxed));
    }
}

impl Default for McsLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Held MCS lock; releasing hands off to the next queued node.
pub struct McsGuard<'a> {
    lock: &'a McsLock,
    node: &'a McsNode,
}

impl Drop for McsGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock(self.node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn excludes_concurrent_holders() {
        let lock = Arc::new(McsLock::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let total = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let inside = Arc::clone(&inside);
                let total = Arc::clone(&total);
                thread::spawn(move || {
                    let node = McsNode::new();
                    for _ in 0..2000 {
                        let _g = lock.lock(&node);
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        total.fetch_add(1, Ordering::Relaxed);
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(total.load(Ordering::Relaxed), 8000);
        assert!(!lock.is_locked());
    }

    #[test]
    fn try_lock_needs_an_empty_queue() {
        let lock = McsLock::new();
        let a = McsNode::new();
        let b = McsNode::new();

        let g = lock.try_lock(&a).expect("free lock");
        assert!(!irq::enabled());
        assert!(lock.try_lock(&b).is_none());
        drop(g);
        assert!(irq::enabled());
        assert!(!lock.is_locked());
        assert!(lock.try_lock(&b).is_some());
    }

    #[test]
    #[should_panic(expected = "already queued")]
    fn a_node_cannot_be_queued_twice() {
        let lock = McsLock::new();
        let node = McsNode::new();
        let _g = lock.lock(&node);
        let _h = lock.try_lock(&node);
    }
}
