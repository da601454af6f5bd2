//! TCB layout and the fixed thread table.

use core::sync::atomic::{AtomicBool, AtomicI32, AtomicIsize, AtomicU16, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crate::arch::Stack;
use crate::atomic::atomic_max;
use crate::config::MAX_THREADS;
use crate::sched::ContextPtr;
use crate::sync::{Condvar, Mutex};

use super::{AtomicStatus, Status, ThreadId, ThreadState};

/// Thread control block.
///
/// Every field is atomic or lock-protected: other CPUs read a TCB while
/// scanning for the next thread, and only CAS on `status` decides who may
/// act on it.
pub struct Tcb {
    pub(crate) status: AtomicStatus,
    pub(crate) generation: AtomicU16,
    pub(crate) priority: AtomicI32,
    /// Added to `priority` until the next dispatch.
    pub(crate) boost: AtomicI32,
    pub(crate) affinity: AtomicU64,
    /// Meaningful only while `Sleeping`.
    pub(crate) wake_time: AtomicU64,
    /// Saved context; meaningful only while not `Running`.
    pub(crate) context: AtomicUsize,
    pub(crate) stack: spin::Mutex<Option<Stack>>,
    /// Whether `stack` goes back to the platform when the thread finishes.
    pub(crate) owns_stack: AtomicBool,
    pub(crate) detached: AtomicBool,
    pub(crate) exit_code: AtomicIsize,
    /// Set, under `lock`, once `exit_code` is final.
    pub(crate) exited: AtomicBool,
    pub(crate) lock: Mutex<()>,
    pub(crate) done_cond: Condvar,
    /// Nanoseconds spent running.
    pub(crate) used_time: AtomicU64,
    /// When the thread was last dispatched.
    pub(crate) sched_timestamp: AtomicU64,
    /// CPU it last ran on.
    pub(crate) cpu: AtomicU32,
}

impl Tcb {
    pub const fn new() -> Self {
        Self {
            status: AtomicStatus::new(Status::idle(ThreadState::Uninitialized)),
            generation: AtomicU16::new(0),
            priority: AtomicI32::new(0),
            boost: AtomicI32::new(0),
            affinity: AtomicU64::new(u64::MAX),
            wake_time: AtomicU64::new(0),
            context: AtomicUsize::new(0),
            stack: spin::Mutex::new(None),
            owns_stack: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            exit_code: AtomicIsize::new(0),
            exited: AtomicBool::new(false),
            lock: Mutex::new(()),
            done_cond: Condvar::new(),
            used_time: AtomicU64::new(0),
            sched_timestamp: AtomicU64::new(0),
            cpu: AtomicU32::new(0),
        }
    }

    pub fn status(&self) -> Status {
        self.status.load()
    }

    pub fn priority(&self) -> i32 {
        self.priority.load(Ordering::Relaxed)
    }

    /// `priority + boost`, saturating.
    pub fn effective_priority(&self) -> i32 {
        self.priority
            .load(Ordering::Relaxed)
            .saturating_add(self.boost.load(Ordering::Relaxed))
    }

    pub fn affinity(&self) -> u64 {
        self.affinity.load(Ordering::Relaxed)
    }

    pub fn may_run_on(&self, cpu: usize) -> bool {
        self.affinity() & (1 << cpu) != 0
    }

    pub fn context(&self) -> ContextPtr {
        ContextPtr::from_raw(self.context.load(Ordering::Acquire))
    }

    pub(crate) fn save_context(&self, ctx: ContextPtr) {
        self.context.store(ctx.as_raw(), Ordering::Release);
    }

    pub fn used_time(&self) -> u64 {
        self.used_time.load(Ordering::Relaxed)
    }

    /// Resets per-thread fields of a slot the caller just claimed.
    pub(crate) fn prepare(&self, priority: i32, affinity: u64, detached: bool) {
        self.priority.store(priority, Ordering::Relaxed);
        self.boost.store(0, Ordering::Relaxed);
        self.affinity.store(affinity, Ordering::Relaxed);
        self.wake_time.store(0, Ordering::Relaxed);
        self.context.store(0, Ordering::Relaxed);
        self.detached.store(detached, Ordering::SeqCst);
        self.exit_code.store(0, Ordering::Relaxed);
        self.exited.store(false, Ordering::Release);
        self.used_time.store(0, Ordering::Relaxed);
        self.sched_timestamp.store(0, Ordering::Relaxed);
    }

    /// Returns a finished, non-busy slot to the pool; ids of the old
    /// thread stop resolving. Only one of several racing callers wins.
    pub(crate) fn try_recycle(&self) -> bool {
        // Busy-Uninitialized keeps `claim` off the slot until the new
        // generation is visible.
        let won = self
            .status
            .compare_exchange(
                Status::idle(ThreadState::Finished),
                Status::busy(ThreadState::Uninitialized),
            )
            .is_ok();
        if won {
            self.generation.fetch_add(1, Ordering::AcqRel);
            self.status.store(Status::idle(ThreadState::Uninitialized));
        }
        won
    }
}

impl Default for Tcb {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed-capacity TCB arena.
pub struct ThreadTable {
    slots: [Tcb; MAX_THREADS],
    /// One past the highest slot ever claimed; bounds every scan.
    count: AtomicUsize,
}

impl ThreadTable {
    pub const fn new() -> Self {
        Self {
            slots: [const { Tcb::new() }; MAX_THREADS],
            count: AtomicUsize::new(0),
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        MAX_THREADS
    }

    /// Slot by index, without a generation check.
    pub fn slot(&self, index: usize) -> &Tcb {
        &self.slots[index]
    }

    /// Id of whatever currently occupies `index`.
    pub fn id_of(&self, index: usize) -> ThreadId {
        ThreadId::new(
            index as u16,
            self.slots[index].generation.load(Ordering::Acquire),
        )
    }

    /// The TCB `id` names, if it is still the same thread.
    pub fn get(&self, id: ThreadId) -> Option<&Tcb> {
        let tcb = self.slots.get(id.index())?;
        let live = tcb.generation.load(Ordering::Acquire) == id.generation()
            && tcb.status().state != ThreadState::Uninitialized;
        live.then_some(tcb)
    }

    /// Claims an unused slot, moving it to `Initializing`. `None` when the
    /// table is full.
    pub(crate) fn claim(&self) -> Option<ThreadId> {
        let uninit = Status::idle(ThreadState::Uninitialized);
        let init = Status::idle(ThreadState::Initializing);

        let index = self
            .slots
            .iter()
            .position(|tcb| tcb.status.compare_exchange(uninit, init).is_ok())?;
        atomic_max(&self.count, index + 1);
        Some(self.id_of(index))
    }
}

impl Default for ThreadTable {
    fn default() -> Self {
        Self::new()
    }
}
