//! Local APIC driver.
//!
//! Each CPU has its own local APIC. The scheduler needs four things from
//! it: the hardware id of the CPU it runs on, a periodic timer that
//! drives preemption, end-of-interrupt, and the interrupt command
//! register (ICR) to send IPIs (INIT/STARTUP during bring-up, fixed
//! vectors for reschedule requests afterwards).
//!
//! The registers are memory-mapped at the physical base held in the
//! IA32_APIC_BASE MSR; `init` stores the virtual address every CPU uses.

use core::ptr;
use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;

use crate::cpu;

/// IA32_APIC_BASE Model Specific Register.
const IA32_APIC_BASE_MSR: u32 = 0x1B;

/// Bit 11 of IA32_APIC_BASE MSR: Global APIC enable/disable.
const APIC_BASE_ENABLE: u64 = 1 << 11;

const APIC_REG_ID: u32 = 0x020;
const APIC_REG_TPR: u32 = 0x080;
const APIC_REG_EOI: u32 = 0x0B0;
const APIC_REG_SVR: u32 = 0x0F0;
const APIC_REG_ICR_LOW: u32 = 0x300;
const APIC_REG_ICR_HIGH: u32 = 0x310;
const APIC_REG_LVT_TIMER: u32 = 0x320;
const APIC_REG_TIMER_INIT: u32 = 0x380;
const APIC_REG_TIMER_CURRENT: u32 = 0x390;
const APIC_REG_TIMER_DIV: u32 = 0x3E0;

/// SVR bit 8: APIC Software Enable.
const SVR_APIC_ENABLE: u32 = 1 << 8;

/// Spurious interrupt vector number.
pub const SPURIOUS_VECTOR: u8 = 0xFF;

/// LVT timer mode: periodic.
const TIMER_PERIODIC: u32 = 1 << 17;

/// LVT mask bit.
const LVT_MASKED: u32 = 1 << 16;

/// Timer divider values for APIC_REG_TIMER_DIV.
#[derive(Debug, Clone, Copy)]
#[repr(u32)]
pub enum TimerDivide {
    By1 = 0b1011,
    By2 = 0b0000,
    By4 = 0b0001,
    By8 = 0b0010,
    By16 = 0b0011,
    By32 = 0b1000,
    By64 = 0b1001,
    By128 = 0b1010,
}

bitflags! {
    /// Low dword of the interrupt command register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Icr: u32 {
        const DELIVERY_FIXED   = 0b000 << 8;
        const DELIVERY_INIT    = 0b101 << 8;
        const DELIVERY_STARTUP = 0b110 << 8;
        /// Read-only: the previous IPI has not been accepted yet.
        const SEND_PENDING     = 1 << 12;
        const LEVEL_ASSERT     = 1 << 14;
        const TRIGGER_LEVEL    = 1 << 15;
        const DEST_SELF        = 0b01 << 18;
        const DEST_ALL         = 0b10 << 18;
        const DEST_OTHERS      = 0b11 << 18;
    }
}

/// Who receives an IPI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// A single CPU by local APIC id.
    Apic(u32),
    /// Every CPU including the sender.
    All,
    /// Every CPU except the sender.
    Others,
}

/// Virtual base of the local APIC registers, shared by all CPUs.
static APIC_BASE: AtomicU64 = AtomicU64::new(0);

#[inline]
unsafe fn read_reg(offset: u32) -> u32 {
    let addr = APIC_BASE.load(Ordering::Relaxed) + offset as u64;
    unsafe { ptr::read_volatile(addr as *const u32) }
}

#[inline]
unsafe fn write_reg(offset: u32, value: u32) {
    let addr = APIC_BASE.load(Ordering::Relaxed) + offset as u64;
    unsafe { ptr::write_volatile(addr as *mut u32, value) }
}

/// Enables the local APIC of the calling CPU and returns its id.
///
/// `hhdm_offset` translates the physical register page into the
/// direct map; the page must already be mapped. The first caller
/// publishes the base for everybody; APs call this again to enable
/// their own APIC.
pub fn init(hhdm_offset: u64) -> u32 {
    unsafe {
        let msr_value = cpu::read_msr(IA32_APIC_BASE_MSR);
        let phys_base = msr_value & 0xFFFF_FFFF_FFFF_F000;
        APIC_BASE.store(hhdm_offset + phys_base, Ordering::Relaxed);

        if msr_value & APIC_BASE_ENABLE == 0 {
            cpu::write_msr(IA32_APIC_BASE_MSR, msr_value | APIC_BASE_ENABLE);
        }

        write_reg(APIC_REG_SVR, SVR_APIC_ENABLE | SPURIOUS_VECTOR as u32);
        write_reg(APIC_REG_TPR, 0);
    }
    id()
}

/// Local APIC id of the calling CPU.
pub fn id() -> u32 {
    unsafe { read_reg(APIC_REG_ID) >> 24 }
}

/// Signals end of interrupt for the in-service APIC interrupt.
pub fn eoi() {
    unsafe {
        write_reg(APIC_REG_EOI, 0);
    }
}

/// Starts the timer in periodic mode.
pub fn enable_timer(vector: u8, initial_count: u32, divider: TimerDivide) {
    unsafe {
        write_reg(APIC_REG_TIMER_DIV, divider as u32);
        write_reg(APIC_REG_LVT_TIMER, TIMER_PERIODIC | vector as u32);
        write_reg(APIC_REG_TIMER_INIT, initial_count);
    }
}

/// Starts a masked one-shot countdown from `u32::MAX`, for calibration
/// against another clock with `timer_current`.
pub fn start_countdown(divider: TimerDivide) {
    unsafe {
        write_reg(APIC_REG_TIMER_DIV, divider as u32);
        write_reg(APIC_REG_LVT_TIMER, LVT_MASKED);
        write_reg(APIC_REG_TIMER_INIT, u32::MAX);
    }
}

/// Current value of the timer countdown.
pub fn timer_current() -> u32 {
    unsafe { read_reg(APIC_REG_TIMER_CURRENT) }
}

/// Masks the timer.
pub fn disable_timer() {
    unsafe {
        let lvt = read_reg(APIC_REG_LVT_TIMER);
        write_reg(APIC_REG_LVT_TIMER, lvt | LVT_MASKED);
    }
}

/// Spins until the previous IPI has been accepted.
fn wait_icr_idle() {
    while Icr::from_bits_retain(unsafe { read_reg(APIC_REG_ICR_LOW) }).contains(Icr::SEND_PENDING) {
        cpu::pause();
    }
}

/// Writes the ICR. Writing the low dword sends the interrupt.
fn send(dest: Destination, command: Icr, vector: u8) {
    let (high, shorthand) = match dest {
        Destination::Apic(apic_id) => (apic_id << 24, Icr::empty()),
        Destination::All => (0, Icr::DEST_ALL),
        Destination::Others => (0, Icr::DEST_OTHERS),
    };

    wait_icr_idle();
    unsafe {
        write_reg(APIC_REG_ICR_HIGH, high);
        write_reg(APIC_REG_ICR_LOW, (command | shorthand).bits() | vector as u32);
    }
}

/// Sends a fixed-delivery interrupt `vector`.
pub fn send_ipi(dest: Destination, vector: u8) {
    send(dest, Icr::DELIVERY_FIXED | Icr::LEVEL_ASSERT, vector);
}

/// Sends INIT (level assert) to `dest`.
pub fn send_init(dest: Destination) {
    send(dest, Icr::DELIVERY_INIT | Icr::LEVEL_ASSERT | Icr::TRIGGER_LEVEL, 0);
}

/// Sends STARTUP; the AP begins real-mode execution at `page << 12`.
pub fn send_startup(dest: Destination, page: u8) {
    send(dest, Icr::DELIVERY_STARTUP | Icr::LEVEL_ASSERT, page);
}
