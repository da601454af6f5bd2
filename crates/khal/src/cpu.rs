//! CPU instructions used by locks and the scheduler.
//!
//! Thin wrappers: execute the instruction and return. Interrupt flag
//! handling goes through the `x86_64` crate; the rest is inline asm or
//! `core::arch` intrinsics.

use core::arch::asm;
use core::arch::x86_64::{__cpuid, _rdtsc};

use x86_64::instructions::interrupts;

/// Spin-wait hint (`PAUSE`).
#[inline(always)]
pub fn pause() {
    core::hint::spin_loop();
}

/// Halts until the next interrupt.
///
/// Interrupts must be enabled or this never wakes up.
#[inline(always)]
pub fn halt() {
    x86_64::instructions::hlt();
}

/// Stops this CPU for good.
pub fn halt_forever() -> ! {
    loop {
        interrupts::disable();
        x86_64::instructions::hlt();
    }
}

/// Executes `INT3` so an attached debugger stops here.
#[inline(always)]
pub fn debug_trap() {
    interrupts::int3();
}

/// Returns whether RFLAGS.IF is set.
#[inline(always)]
pub fn irq_enabled() -> bool {
    interrupts::are_enabled()
}

/// Disables interrupts and returns whether they were enabled before.
#[inline(always)]
pub fn irq_save_disable() -> bool {
    let was_enabled = interrupts::are_enabled();
    interrupts::disable();
    was_enabled
}

/// Re-enables interrupts if `was_enabled`, otherwise leaves them off.
#[inline(always)]
pub fn irq_restore(was_enabled: bool) {
    if was_enabled {
        interrupts::enable();
    }
}

/// Raises software interrupt `VECTOR` on this CPU.
#[inline(always)]
pub fn soft_interrupt<const VECTOR: u8>() {
    // SAFETY: the vector has an IDT gate installed by the caller's setup.
    unsafe {
        asm!("int {v}", v = const VECTOR, options(nomem));
    }
}

/// Reads the time stamp counter.
#[inline]
pub fn read_tsc() -> u64 {
    // SAFETY: RDTSC exists on every x86_64 CPU and has no side effects.
    unsafe { _rdtsc() }
}

/// TSC frequency in Hz from CPUID leaves 0x15/0x16, if the CPU reports it.
pub fn tsc_frequency_hz() -> Option<u64> {
    // SAFETY: CPUID is unprivileged and always present in long mode.
    let max_leaf = unsafe { __cpuid(0) }.eax;

    if max_leaf >= 0x15 {
        let leaf = unsafe { __cpuid(0x15) };
        if leaf.eax != 0 && leaf.ebx != 0 && leaf.ecx != 0 {
            return Some(leaf.ecx as u64 * leaf.ebx as u64 / leaf.eax as u64);
        }
    }

    if max_leaf >= 0x16 {
        let mhz = unsafe { __cpuid(0x16) }.eax & 0xFFFF;
        if mhz != 0 {
            return Some(mhz as u64 * 1_000_000);
        }
    }

    None
}

/// Whether MONITOR/MWAIT are usable (CPUID.1:ECX bit 3).
pub fn has_monitor_mwait() -> bool {
    // SAFETY: see `tsc_frequency_hz`.
    unsafe { __cpuid(1) }.ecx & (1 << 3) != 0
}

/// Arms the address monitor on the cache line holding `addr`.
///
/// # Safety
/// MONITOR/MWAIT must be supported (`has_monitor_mwait`).
#[inline]
pub unsafe fn monitor(addr: *const u8) {
    unsafe {
        asm!(
            "monitor",
            in("rax") addr,
            in("ecx") 0u32,
            in("edx") 0u32,
            options(nostack, preserves_flags)
        );
    }
}

/// Waits until the monitored line is written or an interrupt arrives.
///
/// # Safety
/// Must follow `monitor` on the same CPU.
#[inline]
pub unsafe fn mwait() {
    unsafe {
        asm!(
            "mwait",
            in("eax") 0u32,
            in("ecx") 0u32,
            options(nostack, preserves_flags)
        );
    }
}

/// Reads an MSR.
///
/// # Safety
/// `msr` must exist on this CPU, otherwise this raises #GP.
#[inline]
pub unsafe fn read_msr(msr: u32) -> u64 {
    let (low, high): (u32, u32);
    unsafe {
        asm!(
            "rdmsr",
            in("ecx") msr,
            out("eax") low,
            out("edx") high,
            options(nomem, nostack, preserves_flags)
        );
    }
    (high as u64) << 32 | low as u64
}

/// Writes an MSR.
///
/// # Safety
/// `msr` must exist and accept `value`.
#[inline]
pub unsafe fn write_msr(msr: u32, value: u64) {
    unsafe {
        asm!(
            "wrmsr",
            in("ecx") msr,
            in("eax") value as u32,
            in("edx") (value >> 32) as u32,
            options(nomem, nostack, preserves_flags)
        );
    }
}
