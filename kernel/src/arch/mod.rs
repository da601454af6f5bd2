// =============================================================================
// MinimalOS NextGen — Architecture Seam
// =============================================================================
//
// The scheduler never touches hardware directly. It consumes:
//
//   - `irq`:      save/disable/restore of this CPU's interrupt flag, used by
//                 every `_noirq` lock variant
//   - `Platform`: time, CPU identity, IPIs, the self-trap behind
//                 `thread_yield`, halting, stacks and initial contexts
//
// On bare metal (`target_os = "none"`) `x86_64::X86Platform` implements
// `Platform` on top of `khal`. Anywhere else the interrupt flag is emulated
// and tests supply their own `Platform`.
// =============================================================================

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod x86_64;

use crate::sched::{ContextPtr, SwitchResult};
use crate::thread::ThreadId;

/// Entry point of a thread: takes the creation argument, returns the exit
/// code that `thread_wait` reports.
pub type ThreadFn = fn(usize) -> isize;

/// Handler for an interrupt vector; receives the interrupted context and
/// returns the one to resume.
pub type IrqHandler = fn(vector: u8, ctx: ContextPtr) -> SwitchResult;

/// Destination of an inter-processor interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpiTarget {
    /// Every CPU including the sender.
    All,
    /// Every CPU except the sender.
    Others,
    /// One CPU by hardware id.
    Apic(u32),
}

/// A thread stack: `[base, base + size)` is usable, guard pages (if any)
/// surround it and belong to whoever allocated it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stack {
    pub base: usize,
    pub size: usize,
}

impl Stack {
    /// One past the highest usable byte; stacks grow down from here.
    pub fn top(&self) -> usize {
        self.base + self.size
    }
}

/// What a new thread's first dispatch needs.
#[derive(Debug, Clone, Copy)]
pub struct ThreadStart {
    pub entry: ThreadFn,
    pub arg: usize,
    pub id: ThreadId,
}

/// Hardware services the scheduler depends on.
pub trait Platform: Sync {
    /// Monotonic nanoseconds since boot.
    fn now_ns(&self) -> u64;

    /// Index of the calling CPU in the CPU table.
    fn cpu_index(&self) -> usize;

    /// Hardware id (local APIC id) of the calling CPU.
    fn hardware_cpu_id(&self) -> u32;

    /// Delivers `vector` to `target`.
    fn send_ipi(&self, target: IpiTarget, vector: u8);

    /// Routes `vector` to `handler`.
    fn register_handler(&self, vector: u8, handler: IrqHandler);

    /// Traps into the scheduler entry as if the timer had fired.
    fn yield_now(&self);

    /// Waits for the next interrupt.
    fn halt(&self);

    /// Allocates a stack of `size` usable bytes with guard regions.
    fn alloc_stack(&self, size: usize) -> Option<Stack>;

    /// Releases a stack from `alloc_stack`.
    ///
    /// # Safety
    /// Nothing may still be running on, or pointing into, `stack`.
    unsafe fn free_stack(&self, stack: Stack);

    /// Builds the saved context a new thread is first resumed from: it must
    /// land in a trampoline that calls `start.entry(start.arg)` and then
    /// exits the thread with the returned code.
    fn init_context(&self, stack: &Stack, start: ThreadStart) -> ContextPtr;
}

/// Interrupt flag control for the calling CPU.
pub mod irq {
    #[cfg(target_os = "none")]
    mod imp {
        #[inline(always)]
        pub fn save_disable() -> bool {
            khal::cpu::irq_save_disable()
        }

        #[inline(always)]
        pub fn restore(was_enabled: bool) {
            khal::cpu::irq_restore(was_enabled)
        }

        #[inline(always)]
        pub fn enabled() -> bool {
            khal::cpu::irq_enabled()
        }
    }

    // Hosted unit tests: each OS thread plays one CPU.
    #[cfg(all(not(target_os = "none"), test))]
    mod imp {
        use core::cell::Cell;

        std::thread_local! {
            static ENABLED: Cell<bool> = const { Cell::new(true) };
        }

        pub fn save_disable() -> bool {
            ENABLED.with(|flag| flag.replace(false))
        }

        pub fn restore(was_enabled: bool) {
            if was_enabled {
                ENABLED.with(|flag| flag.set(true));
            }
        }

        pub fn enabled() -> bool {
            ENABLED.with(|flag| flag.get())
        }
    }

    #[cfg(all(not(target_os = "none"), not(test)))]
    mod imp {
        use core::sync::atomic::{AtomicBool, Ordering};

        static ENABLED: AtomicBool = AtomicBool::new(true);

        pub fn save_disable() -> bool {
            ENABLED.swap(false, Ordering::Relaxed)
        }

        pub fn restore(was_enabled: bool) {
            if was_enabled {
                ENABLED.store(true, Ordering::Relaxed);
            }
        }

        pub fn enabled() -> bool {
            ENABLED.load(Ordering::Relaxed)
        }
    }

    /// Disables interrupts, returns whether they were enabled.
    #[inline(always)]
    pub fn save_disable() -> bool {
        imp::save_disable()
    }

    /// Undoes one `save_disable`.
    #[inline(always)]
    pub fn restore(was_enabled: bool) {
        imp::restore(was_enabled)
    }

    /// Whether interrupts are enabled on this CPU.
    #[inline(always)]
    pub fn enabled() -> bool {
        imp::enabled()
    }
}

/// Waits for the word at `addr` to change from `seen`, or for a short
/// while, whichever comes first. Uses MONITOR/MWAIT where available and
/// interrupts can still break the wait; otherwise a plain pause.
#[inline]
pub fn wait_for_change(addr: &core::sync::atomic::AtomicI32, seen: i32) {
    #[cfg(target_os = "none")]
    {
        use core::sync::atomic::Ordering;
        use spin::Once;

        static HAS_MWAIT: Once<bool> = Once::new();

        if irq::enabled() && *HAS_MWAIT.call_once(khal::cpu::has_monitor_mwait) {
            // SAFETY: support was checked; the address is a live atomic.
            unsafe {
                khal::cpu::monitor(addr.as_ptr() as *const u8);
                if addr.load(Ordering::Acquire) == seen {
                    khal::cpu::mwait();
                }
            }
            return;
        }
    }
    let _ = (addr, seen);
    crate::atomic::pause();
}
