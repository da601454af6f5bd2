// =============================================================================
// MinimalOS NextGen — x86_64 Platform
// =============================================================================
//
// The bare-metal side of the scheduler: the kernel-wide `SCHEDULER`, the
// `Platform` it runs on, and the interrupt entry that drives it.
//
// INTERRUPT ENTRY (timer, yield and reschedule vectors):
//
//   1. The CPU pushes SS, RSP, RFLAGS, CS, RIP. The stub pushes the fifteen
//      general purpose registers on top, which leaves a `Frame` at RSP. Its
//      address is the thread's `ContextPtr`.
//   2. `isr_dispatch` runs the registered handler (normally `schedule`) and
//      returns the frame to resume plus the outgoing thread, if any.
//   3. The stub loads RSP from the returned frame. Only now is the outgoing
//      thread's stack unused, so only now does `isr_after_switch` run the
//      post-switch hook.
//   4. Pop the registers, `iretq`.
//
// A new thread's first context is a `Frame` built by `init_context` whose
// RIP is `thread_entry`, so its first dispatch takes the same exit path.
//
// The caller owns the IDT, the GDT and the real-mode AP trampoline; this
// module only supplies the vectors (`install_vectors`) and the long-mode
// AP entry (`ap_main`).
// =============================================================================

use core::arch::global_asm;
use core::mem::size_of;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use khal::apic::{self, Destination, TimerDivide};
use khal::cpu;
use log::{debug, error};
use spin::Once;
use x86_64::VirtAddr;
use x86_64::instructions::segmentation::{CS, SS, Segment};
use x86_64::structures::idt::InterruptDescriptorTable;

use crate::arch::{IpiTarget, IrqHandler, Platform, Stack, ThreadStart};
use crate::config::{
    RESCHED_VECTOR, STACK_GUARD_SIZE, SchedConfig, TIMER_VECTOR, YIELD_VECTOR,
};
use crate::error::Result;
use crate::sched::{ContextPtr, Hooks, PostSwitch, Scheduler, SwitchResult};
use crate::smp::{ApStartup, Topology};
use crate::sync::wait;
use crate::thread::ThreadId;

/// The kernel's scheduler.
pub static SCHEDULER: Scheduler<X86Platform> =
    Scheduler::new(X86Platform::new(), SchedConfig::new());

/// Holds the calling CPU's index in the CPU table.
const IA32_GS_BASE: u32 = 0xC000_0101;

/// RFLAGS of a new thread: IF plus the always-set bit 1.
const INITIAL_RFLAGS: u64 = 0x202;

/// TSC window the APIC timer is calibrated over.
const CALIBRATION_NS: u64 = 10_000_000;

// ── Memory manager seam ─────────────────────────────────────────

/// Stack memory, supplied by the memory manager.
pub trait MemoryMapper: Sync {
    /// Maps `size` bytes of kernel memory with `guard` unmapped bytes on
    /// both sides and returns the base of the usable range.
    fn map_stack(&self, size: usize, guard: usize) -> Option<usize>;

    /// Unmaps a range from `map_stack`.
    ///
    /// # Safety
    /// `base`, `size` and `guard` must be exactly what `map_stack`
    /// produced, and nothing may reference the range any more.
    unsafe fn unmap_stack(&self, base: usize, size: usize, guard: usize);
}

// ── Saved register frame ────────────────────────────────────────

/// Layout the entry stub leaves on the stack; lowest address first.
#[allow(dead_code)]
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
struct Frame {
    r15: u64,
    r14: u64,
    r13: u64,
    r12: u64,
    r11: u64,
    r10: u64,
    r9: u64,
    r8: u64,
    rbp: u64,
    rdi: u64,
    rsi: u64,
    rdx: u64,
    rcx: u64,
    rbx: u64,
    rax: u64,
    // Pushed by the CPU.
    rip: u64,
    cs: u64,
    rflags: u64,
    rsp: u64,
    ss: u64,
}

const _: () = assert!(size_of::<Frame>() % 16 == 0);

// ── Platform ────────────────────────────────────────────────────

pub struct X86Platform {
    mapper: Once<&'static dyn MemoryMapper>,
    handlers: [Once<IrqHandler>; 256],
    hhdm_offset: AtomicU64,
    tsc_hz: AtomicU64,
    tsc_base: AtomicU64,
    /// APIC timer count per scheduling quantum.
    timer_count: AtomicU32,
}

impl X86Platform {
    pub const fn new() -> Self {
        Self {
            mapper: Once::new(),
            handlers: [const { Once::new() }; 256],
            hhdm_offset: AtomicU64::new(0),
            tsc_hz: AtomicU64::new(0),
            tsc_base: AtomicU64::new(0),
            timer_count: AtomicU32::new(0),
        }
    }

    fn handler(&self, vector: u8) -> Option<IrqHandler> {
        self.handlers[vector as usize].get().copied()
    }

    fn ticks_to_ns(&self, ticks: u64) -> u64 {
        let hz = self.tsc_hz.load(Ordering::Relaxed).max(1);
        (ticks as u128 * 1_000_000_000 / hz as u128) as u64
    }

    fn spin_ns(&self, ns: u64) {
        let deadline = self.now_ns().saturating_add(ns);
        while self.now_ns() < deadline {
            cpu::pause();
        }
    }

    /// Measures how far the APIC timer counts in one quantum.
    fn calibrate_timer(&self, quantum_ns: u64) {
        apic::start_countdown(TimerDivide::By16);
        let start = self.now_ns();
        while self.now_ns() - start < CALIBRATION_NS {
            cpu::pause();
        }
        let counted = (u32::MAX - apic::timer_current()) as u64;
        apic::disable_timer();

        let per_quantum = (counted * quantum_ns / CALIBRATION_NS).clamp(1, u32::MAX as u64);
        self.timer_count.store(per_quantum as u32, Ordering::Relaxed);
        debug!("x86: apic timer {per_quantum} counts per {quantum_ns} ns");
    }
}

impl Default for X86Platform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for X86Platform {
    fn now_ns(&self) -> u64 {
        let base = self.tsc_base.load(Ordering::Relaxed);
        self.ticks_to_ns(cpu::read_tsc().saturating_sub(base))
    }

    fn cpu_index(&self) -> usize {
        // SAFETY: GS base exists on every x86_64 CPU; `set_cpu_index` ran
        // before anything asks.
        unsafe { cpu::read_msr(IA32_GS_BASE) as usize }
    }

    fn hardware_cpu_id(&self) -> u32 {
        apic::id()
    }

    fn send_ipi(&self, target: IpiTarget, vector: u8) {
        let dest = match target {
            IpiTarget::All => Destination::All,
            IpiTarget::Others => Destination::Others,
            IpiTarget::Apic(id) => Destination::Apic(id),
        };
        apic::send_ipi(dest, vector);
    }

    fn register_handler(&self, vector: u8, handler: IrqHandler) {
        let slot = &self.handlers[vector as usize];
        if slot.is_completed() {
            error!("x86: vector {vector} already has a handler");
            return;
        }
        slot.call_once(|| handler);
    }

    fn yield_now(&self) {
        cpu::soft_interrupt::<YIELD_VECTOR>();
    }

    fn halt(&self) {
        if cpu::irq_enabled() {
            cpu::halt();
        } else {
            cpu::pause();
        }
    }

    fn alloc_stack(&self, size: usize) -> Option<Stack> {
        let mapper = self.mapper.get()?;
        let base = mapper.map_stack(size, STACK_GUARD_SIZE)?;
        Some(Stack { base, size })
    }

    unsafe fn free_stack(&self, stack: Stack) {
        if let Some(mapper) = self.mapper.get() {
            // SAFETY: forwarded from the caller; the range came from
            // `alloc_stack` with the same guard size.
            unsafe { mapper.unmap_stack(stack.base, stack.size, STACK_GUARD_SIZE) };
        }
    }

    fn init_context(&self, stack: &Stack, start: ThreadStart) -> ContextPtr {
        // ThreadStart at the top, the frame below it, both 16-aligned.
        let start_addr = (stack.top() - size_of::<ThreadStart>()) & !0xF;
        let frame_addr = start_addr - 16 - size_of::<Frame>();

        let frame = Frame {
            rip: thread_entry as usize as u64,
            cs: CS::get_reg().0 as u64,
            rflags: INITIAL_RFLAGS,
            // As if `thread_entry` had been called.
            rsp: start_addr as u64 - 8,
            ss: SS::get_reg().0 as u64,
            rdi: start_addr as u64,
            ..Frame::default()
        };

        // SAFETY: both writes land inside the freshly created, unused
        // stack and are suitably aligned.
        unsafe {
            (start_addr as *mut ThreadStart).write(start);
            (frame_addr as *mut Frame).write(frame);
        }
        ContextPtr::from_raw(frame_addr)
    }
}

fn set_cpu_index(cpu: usize) {
    // SAFETY: see `X86Platform::cpu_index`.
    unsafe { cpu::write_msr(IA32_GS_BASE, cpu as u64) };
}

// ── Interrupt entry ─────────────────────────────────────────────

macro_rules! isr_stub {
    ($name:literal, $vector:expr) => {
        global_asm!(
            concat!(".global ", $name),
            concat!($name, ":"),
            "push rax",
            "push rbx",
            "push rcx",
            "push rdx",
            "push rsi",
            "push rdi",
            "push rbp",
            "push r8",
            "push r9",
            "push r10",
            "push r11",
            "push r12",
            "push r13",
            "push r14",
            "push r15",
            "mov edi, {vector}",
            "jmp ksched_isr_common",
            vector = const $vector,
        );
    };
}

isr_stub!("ksched_isr_timer", TIMER_VECTOR);
isr_stub!("ksched_isr_yield", YIELD_VECTOR);
isr_stub!("ksched_isr_resched", RESCHED_VECTOR);

// RSP is 16-aligned here: the CPU aligned it before pushing its five
// words, and the fifteen pushes above keep it so.
global_asm!(
    "ksched_isr_common:",
    "mov rsi, rsp",
    "cld",
    "call {dispatch}",
    "mov rsp, rax",
    "cmp rdx, -1",
    "je 2f",
    "mov rdi, rdx",
    "call {after_switch}",
    "2:",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop r11",
    "pop r10",
    "pop r9",
    "pop r8",
    "pop rbp",
    "pop rdi",
    "pop rsi",
    "pop rdx",
    "pop rcx",
    "pop rbx",
    "pop rax",
    "iretq",
    dispatch = sym isr_dispatch,
    after_switch = sym isr_after_switch,
);

unsafe extern "C" {
    fn ksched_isr_timer();
    fn ksched_isr_yield();
    fn ksched_isr_resched();
}

/// Returned in RAX:RDX.
#[repr(C)]
struct EntryResult {
    rsp: u64,
    /// Raw id of the outgoing thread, or `u64::MAX`.
    outgoing: u64,
}

extern "C" fn isr_dispatch(vector: u64, frame: usize) -> EntryResult {
    let vector = vector as u8;
    let ctx = ContextPtr::from_raw(frame);
    let result = match SCHEDULER.platform().handler(vector) {
        Some(handler) => handler(vector, ctx),
        None => SwitchResult::resume(ctx),
    };

    // `int` does not go through the APIC.
    if vector != YIELD_VECTOR {
        apic::eoi();
    }

    EntryResult {
        rsp: result.context.as_raw() as u64,
        outgoing: result
            .post_switch
            .map_or(u64::MAX, |post| post.outgoing.to_raw() as u64),
    }
}

extern "C" fn isr_after_switch(outgoing: u64) {
    if let Some(outgoing) = ThreadId::from_raw(outgoing as u32) {
        SCHEDULER.finish_switch(PostSwitch { outgoing });
    }
}

/// First code of every thread; `start` points at its `ThreadStart`.
extern "C" fn thread_entry(start: usize) -> ! {
    // SAFETY: `init_context` wrote a ThreadStart there, above this
    // thread's initial stack pointer.
    let start = unsafe { (start as *const ThreadStart).read() };
    let code = (start.entry)(start.arg);
    SCHEDULER.exit(code)
}

fn dispatch(_vector: u8, ctx: ContextPtr) -> SwitchResult {
    SCHEDULER.schedule(ctx)
}

fn idle_main(_cpu: usize) -> isize {
    SCHEDULER.idle_loop()
}

/// Points the scheduler vectors of `idt` at the entry stubs.
pub fn install_vectors(idt: &mut InterruptDescriptorTable) {
    let stubs: [(u8, unsafe extern "C" fn()); 3] = [
        (TIMER_VECTOR, ksched_isr_timer),
        (YIELD_VECTOR, ksched_isr_yield),
        (RESCHED_VECTOR, ksched_isr_resched),
    ];
    for (vector, stub) in stubs {
        // SAFETY: the stubs follow the interrupt calling convention and
        // end in `iretq`.
        unsafe {
            idt[vector].set_handler_addr(VirtAddr::new(stub as usize as u64));
        }
    }
}

// ── Bring-up ────────────────────────────────────────────────────

/// What the boot code hands the scheduler.
pub struct BootConfig {
    /// Offset of the direct map of physical memory.
    pub hhdm_offset: u64,
    pub mapper: &'static dyn MemoryMapper,
    /// TSC frequency, if the boot code measured it. Otherwise CPUID is
    /// asked.
    pub tsc_hz: Option<u64>,
}

/// Brings the scheduler up on the boot CPU; the caller becomes its boot
/// thread. Call once with interrupts disabled, after `klog::init` and
/// with `install_vectors` applied to the loaded IDT. Interrupts stay
/// disabled; enable them after `start_timer`.
pub fn init_bsp(boot: BootConfig) -> Result<ThreadId> {
    let platform = SCHEDULER.platform();
    platform.mapper.call_once(|| boot.mapper);
    platform.hhdm_offset.store(boot.hhdm_offset, Ordering::Relaxed);

    let Some(tsc_hz) = boot.tsc_hz.or_else(cpu::tsc_frequency_hz) else {
        panic!("x86: TSC frequency unknown");
    };
    platform.tsc_hz.store(tsc_hz, Ordering::Relaxed);
    platform.tsc_base.store(cpu::read_tsc(), Ordering::Relaxed);

    apic::init(boot.hhdm_offset);
    set_cpu_index(0);
    platform.calibrate_timer(SCHEDULER.config().quantum_ns);

    wait::install(&SCHEDULER);
    SCHEDULER.init_bsp(Hooks {
        idle: idle_main,
        dispatch,
    })
}

/// Starts the calling CPU's preemption timer.
pub fn start_timer() {
    let count = SCHEDULER.platform().timer_count.load(Ordering::Relaxed);
    apic::enable_timer(TIMER_VECTOR, count, TimerDivide::By16);
}

/// INIT/STARTUP sequencing through the local APIC.
struct ApicStartup {
    /// Page of the real-mode trampoline, below 1 MiB.
    page: u8,
}

impl ApStartup for ApicStartup {
    fn send_init_others(&self) {
        apic::send_init(Destination::Others);
    }

    fn send_startup(&self, apic_id: u32) {
        apic::send_startup(Destination::Apic(apic_id), self.page);
    }

    fn delay_ns(&self, ns: u64) {
        SCHEDULER.platform().spin_ns(ns);
    }
}

/// Starts the other CPUs of `topology`. Each must reach `ap_main` through
/// the trampoline at physical page `trampoline_page`. Returns how many
/// checked in.
pub fn start_aps(topology: &Topology<'_>, trampoline_page: u8) -> usize {
    SCHEDULER.start_aps(
        topology,
        &ApicStartup {
            page: trampoline_page,
        },
    )
}

/// Long-mode entry of an application processor, reached from the AP
/// trampoline with a temporary stack and the kernel's GDT and IDT loaded.
pub fn ap_main() -> ! {
    let apic_id = apic::init(SCHEDULER.platform().hhdm_offset.load(Ordering::Relaxed));
    let Some(cpu) = SCHEDULER.register_ap(apic_id) else {
        cpu::halt_forever();
    };
    set_cpu_index(cpu);

    if let Err(err) = SCHEDULER.init_ap(cpu) {
        error!("smp: cpu {cpu} failed to start: {err}");
        cpu::halt_forever();
    }
    start_timer();

    // The first `schedule` runs the idle thread queued by `init_ap`; this
    // stack is never resumed.
    loop {
        SCHEDULER.yield_now();
    }
}
