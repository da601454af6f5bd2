// =============================================================================
// MinimalOS NextGen — CPU Control Blocks
// =============================================================================
//
// One block per CPU, in a fixed table indexed by the CPU number the
// platform reports for the calling CPU. A block holds:
//
//   - `cur_thread`  the thread this CPU is executing (a back-reference)
//   - `apic_id`     hardware identity, the IPI destination
//   - `goto_thread` one-shot forced first dispatch, used at AP bring-up
//   - CPU-local storage slots, allocated kernel-wide by `cls_alloc`
//
// Nothing here is locked: each field is written either only by its own
// CPU or once during bring-up.
// =============================================================================

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::config::{CPU_LOCAL_SLOTS, MAX_CPUS};
use crate::thread::ThreadId;

pub struct CpuBlock {
    cur_thread: AtomicU32,
    apic_id: AtomicU32,
    goto_thread: AtomicU32,
    locals: [AtomicUsize; CPU_LOCAL_SLOTS],
}

impl CpuBlock {
    pub const fn new() -> Self {
        Self {
            cur_thread: AtomicU32::new(ThreadId::NONE_RAW),
            apic_id: AtomicU32::new(0),
            goto_thread: AtomicU32::new(ThreadId::NONE_RAW),
            locals: [const { AtomicUsize::new(0) }; CPU_LOCAL_SLOTS],
        }
    }

    pub fn cur_thread(&self) -> Option<ThreadId> {
        ThreadId::from_raw(self.cur_thread.load(Ordering::Acquire))
    }

    pub(crate) fn set_cur_thread(&self, id: ThreadId) {
        self.cur_thread.store(id.to_raw(), Ordering::Release);
    }

    pub fn apic_id(&self) -> u32 {
        self.apic_id.load(Ordering::Relaxed)
    }

    pub(crate) fn set_goto_thread(&self, id: ThreadId) {
        self.goto_thread.store(id.to_raw(), Ordering::Release);
    }

    pub(crate) fn take_goto_thread(&self) -> Option<ThreadId> {
        // Cheap check first; the slot is almost always empty.
        if self.goto_thread.load(Ordering::Relaxed) == ThreadId::NONE_RAW {
            return None;
        }
        ThreadId::from_raw(self.goto_thread.swap(ThreadId::NONE_RAW, Ordering::AcqRel))
    }

    pub fn local(&self, slot: usize) -> usize {
        self.locals[slot].load(Ordering::Relaxed)
    }

    pub fn set_local(&self, slot: usize, value: usize) {
        self.locals[slot].store(value, Ordering::Relaxed);
    }
}

impl Default for CpuBlock {
    fn default() -> Self {
        Self::new()
    }
}

pub struct CpuTable {
    cpus: [CpuBlock; MAX_CPUS],
    count: AtomicUsize,
    next_local: AtomicUsize,
}

impl CpuTable {
    pub const fn new() -> Self {
        Self {
            cpus: [const { CpuBlock::new() }; MAX_CPUS],
            count: AtomicUsize::new(0),
            next_local: AtomicUsize::new(0),
        }
    }

    /// CPUs registered so far.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn get(&self, index: usize) -> &CpuBlock {
        &self.cpus[index]
    }

    /// Gives the CPU with hardware id `apic_id` the next block. `None` when
    /// the table is full.
    pub(crate) fn register(&self, apic_id: u32) -> Option<usize> {
        let index = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < MAX_CPUS).then_some(n + 1)
            })
            .ok()?;
        self.cpus[index].apic_id.store(apic_id, Ordering::Relaxed);
        Some(index)
    }

    /// Registered blocks, with their indices.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &CpuBlock)> {
        self.cpus[..self.count()].iter().enumerate()
    }

    // ── CPU-local storage ───────────────────────────────────────

    /// Reserves a slot in every CPU's local storage. `None` once all
    /// `CPU_LOCAL_SLOTS` are taken.
    pub fn local_alloc(&self) -> Option<usize> {
        self.next_local
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                (n < CPU_LOCAL_SLOTS).then_some(n + 1)
            })
            .ok()
    }

    /// Sets `slot` on every registered CPU to `init(cpu_index)`.
    pub fn local_init_each(&self, slot: usize, mut init: impl FnMut(usize) -> usize) {
        for (index, cpu) in self.iter() {
            cpu.set_local(slot, init(index));
        }
    }

    /// Calls `f(cpu_index, value)` for `slot` on every registered CPU.
    pub fn local_for_each(&self, slot: usize, mut f: impl FnMut(usize, usize)) {
        for (index, cpu) in self.iter() {
            f(index, cpu.local(slot));
        }
    }
}

impl Default for CpuTable {
    fn default() -> Self {
        Self::new()
    }
}
