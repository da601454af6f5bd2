//! Thread control blocks and the fixed table that owns them.
//!
//! A [`ThreadId`] is an index into the table plus the generation the slot
//! had when the thread was created. Recycling a slot bumps its generation,
//! so an id held past `thread_wait` (or a detached thread's exit) no longer
//! resolves.

mod state;
mod table;

pub use state::{AtomicStatus, Status, ThreadState};
pub use table::{Tcb, ThreadTable};

use core::fmt;

use bitflags::bitflags;

use crate::arch::Stack;
use crate::config::{DEFAULT_STACK_SIZE, IDLE_PRIORITY};

// ── Thread identifiers ──────────────────────────────────────────

/// Generation-checked handle to a TCB slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId {
    index: u16,
    generation: u16,
}

impl ThreadId {
    /// Packed form of "no thread", used as the free value of lock owner
    /// words. No real id packs to it: indices stay far below `u16::MAX`.
    pub const NONE_RAW: u32 = u32::MAX;

    pub const fn new(index: u16, generation: u16) -> Self {
        Self { index, generation }
    }

    pub const fn index(self) -> usize {
        self.index as usize
    }

    pub const fn generation(self) -> u16 {
        self.generation
    }

    /// Packs the id into one word, for lock owner fields.
    pub const fn to_raw(self) -> u32 {
        ((self.generation as u32) << 16) | self.index as u32
    }

    pub const fn from_raw(raw: u32) -> Option<Self> {
        if raw == Self::NONE_RAW {
            None
        } else {
            Some(Self {
                index: raw as u16,
                generation: (raw >> 16) as u16,
            })
        }
    }
}

impl fmt::Debug for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}.{}", self.index, self.generation)
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ── Creation options ────────────────────────────────────────────

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ThreadFlags: u32 {
        /// Recycle the slot as soon as the thread finishes; nobody will
        /// `thread_wait` for it.
        const DETACHED = 1 << 0;
        /// Publish the new thread `Suspended` instead of `Ready`; it runs
        /// once someone calls `thread_resume`.
        const START_SUSPENDED = 1 << 1;
    }
}

/// Parameters of `thread_create`.
#[derive(Debug, Clone, Copy)]
pub struct ThreadOptions {
    pub priority: i32,
    /// CPUs the thread may run on; 0 means all.
    pub affinity: u64,
    /// Size of the stack to allocate. Ignored when `stack` is given.
    pub stack_size: usize,
    /// Caller-owned stack. It is not released when the thread finishes.
    pub stack: Option<Stack>,
    pub flags: ThreadFlags,
}

impl ThreadOptions {
    pub const fn new() -> Self {
        Self {
            priority: 0,
            affinity: 0,
            stack_size: DEFAULT_STACK_SIZE,
            stack: None,
            flags: ThreadFlags::empty(),
        }
    }

    pub const fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub const fn affinity(mut self, mask: u64) -> Self {
        self.affinity = mask;
        self
    }

    pub const fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    pub const fn stack(mut self, stack: Stack) -> Self {
        self.stack = Some(stack);
        self
    }

    pub const fn flags(mut self, flags: ThreadFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Options of a CPU's idle thread.
    pub(crate) const fn idle(cpu: usize) -> Self {
        Self::new()
            .priority(IDLE_PRIORITY)
            .affinity(1 << cpu)
            .flags(ThreadFlags::DETACHED)
    }
}

impl Default for ThreadOptions {
    fn default() -> Self {
        Self::new()
    }
}
