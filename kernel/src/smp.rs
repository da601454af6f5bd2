// =============================================================================
// MinimalOS NextGen — SMP Bring-up
// =============================================================================
//
// The boot CPU wakes the others with one INIT to all-but-self, a settle
// delay, then one startup IPI per APIC id the topology describes, staggered
// and each followed by a wait for that CPU to check in. A starting CPU:
//
//   1. registers its CPU block (`register_ap`)
//   2. creates its idle thread in INITIALIZING and parks it in the block's
//      `goto_thread` slot (`init_ap`)
//   3. yields: its first `schedule` dispatches the idle thread
//      unconditionally, without looking at a table it is not yet part of
// =============================================================================

use core::sync::atomic::Ordering;

use log::{debug, warn};

use crate::arch::Platform;
use crate::error::Result;
use crate::sched::Scheduler;
use crate::thread::{ThreadId, ThreadState};

/// Delay between INIT and the first startup IPI.
const INIT_SETTLE_NS: u64 = 10_000_000;

/// Total stagger budget, split evenly across all CPUs.
const STAGGER_BUDGET_NS: u64 = 16_666_666;

/// How long a CPU gets to check in before it is given up on.
const CHECK_IN_TIMEOUT_NS: u64 = 100_000_000;

const CHECK_IN_POLL_NS: u64 = 100_000;

/// CPU topology as firmware reports it. Counts are taken as given.
#[derive(Debug, Clone, Copy)]
pub struct Topology<'a> {
    /// Base APIC id of each package.
    pub packages: &'a [u32],
    pub cores_per_package: u32,
    pub threads_per_core: u32,
    /// Low APIC id bits that select the thread within a core.
    pub thread_bits: u32,
}

impl Topology<'_> {
    pub fn cpu_count(&self) -> usize {
        self.packages.len() * self.cores_per_package as usize * self.threads_per_core as usize
    }

    /// Every APIC id, package by package.
    pub fn apic_ids(&self) -> impl Iterator<Item = u32> + '_ {
        let (cores, threads, shift) = (self.cores_per_package, self.threads_per_core, self.thread_bits);
        self.packages.iter().flat_map(move |&base| {
            (0..threads).flat_map(move |thread| {
                (0..cores).map(move |core| base + (thread | (core << shift)))
            })
        })
    }
}

/// The INIT/startup IPI sequence and a calibrated delay. Only bring-up
/// needs these, so they live outside `Platform`.
pub trait ApStartup {
    /// INIT to every CPU but the caller.
    fn send_init_others(&self);
    /// Startup IPI pointing `apic_id` at the AP trampoline.
    fn send_startup(&self, apic_id: u32);
    fn delay_ns(&self, ns: u64);
}

impl<P: Platform> Scheduler<P> {
    /// Starts every CPU in `topology` except the caller. Returns how many
    /// checked in.
    pub fn start_aps(&self, topology: &Topology<'_>, startup: &impl ApStartup) -> usize {
        let total = topology.cpu_count();
        if total <= 1 {
            return 0;
        }

        let bsp = self.current_cpu().apic_id();
        startup.send_init_others();
        startup.delay_ns(INIT_SETTLE_NS);

        let stagger = STAGGER_BUDGET_NS / total as u64;
        let mut started = 0;
        for apic_id in topology.apic_ids().filter(|&id| id != bsp) {
            let expect = self.aps_running() + 1;
            startup.send_startup(apic_id);
            startup.delay_ns(stagger);

            if self.wait_check_in(expect, startup) {
                started += 1;
            } else {
                warn!("smp: cpu with apic id {apic_id} did not start");
            }
        }

        debug!("smp: {started} of {} application processors up", total - 1);
        started
    }

    fn wait_check_in(&self, expect: u32, startup: &impl ApStartup) -> bool {
        let deadline = self.platform().now_ns().saturating_add(CHECK_IN_TIMEOUT_NS);
        while self.aps_running() < expect {
            if self.platform().now_ns() >= deadline {
                return false;
            }
            startup.delay_ns(CHECK_IN_POLL_NS);
        }
        true
    }

    /// Application processors that have checked in.
    pub fn aps_running(&self) -> u32 {
        self.aps_running.load(Ordering::Acquire)
    }

    /// First step on a starting CPU: claims its CPU block. The caller must
    /// make `Platform::cpu_index` report the returned index before
    /// `init_ap`.
    pub fn register_ap(&self, apic_id: u32) -> Option<usize> {
        let cpu = self.cpus().register(apic_id);
        if cpu.is_none() {
            warn!("smp: no cpu block left for apic id {apic_id}");
        }
        cpu
    }

    /// Second step: queues this CPU's idle thread as its forced first
    /// dispatch and checks in. The caller then yields and never returns.
    pub fn init_ap(&self, cpu: usize) -> Result<ThreadId> {
        let idle = self.create_idle(cpu, ThreadState::Initializing)?;
        self.cpus().get(cpu).set_goto_thread(idle);
        self.aps_running.fetch_add(1, Ordering::AcqRel);
        debug!("smp: cpu {cpu} online, idle {idle}");
        Ok(idle)
    }
}
