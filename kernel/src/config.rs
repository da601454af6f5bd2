//! Capacities and tunables.
//!
//! Table sizes are compile-time constants because the TCB and CPU tables
//! are fixed arrays. Everything that can change per boot lives in
//! [`SchedConfig`].

/// Number of TCB slots.
pub const MAX_THREADS: usize = 256;

/// Number of CPU control blocks. Affinity masks are `u64`, one bit per CPU.
pub const MAX_CPUS: usize = 64;

/// CPU-local storage slots per CPU.
pub const CPU_LOCAL_SLOTS: usize = 16;

/// Smallest stack `thread_create` accepts.
pub const MIN_STACK_SIZE: usize = 4096;

/// Stack size used when the caller does not pick one.
pub const DEFAULT_STACK_SIZE: usize = 64 << 10;

/// Unmapped guard region on each side of an allocated stack.
pub const STACK_GUARD_SIZE: usize = 8 << 10;

/// Bounds of a blocking lock's adaptive spin count.
pub const SPIN_COUNT_MIN: u32 = 4;
pub const SPIN_COUNT_MAX: u32 = 4096;

/// Local APIC timer interrupt.
pub const TIMER_VECTOR: u8 = 32;

/// Software interrupt raised by `thread_yield`.
pub const YIELD_VECTOR: u8 = 72;

/// IPI asking another CPU to run the scheduler.
pub const RESCHED_VECTOR: u8 = 73;

/// Effective priority of a CPU's idle thread.
pub const IDLE_PRIORITY: i32 = i32::MIN;

/// Per-boot scheduler tunables.
#[derive(Debug, Clone, Copy)]
pub struct SchedConfig {
    /// Timer period in nanoseconds.
    pub quantum_ns: u64,
    /// Priority boost granted to a thread woken by `resume`.
    pub wake_boost: i32,
    /// `resume` spins this many times waiting for its target to finish
    /// suspending before it logs a warning, and warns again at every
    /// doubling.
    pub resume_spin_warn: u32,
}

impl SchedConfig {
    pub const fn new() -> Self {
        Self {
            quantum_ns: 10_000_000,
            wake_boost: 8,
            resume_spin_warn: 1 << 20,
        }
    }
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self::new()
    }
}
