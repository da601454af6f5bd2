// =============================================================================
// MinimalOS NextGen — Scheduler Core
// =============================================================================
//
// There is no run queue and no scheduler lock. Every CPU independently runs
// `schedule` from its timer interrupt and from `thread_yield` (a self-trap
// into the same entry), scans the thread table and claims the next thread
// with a CAS on its status. The only transitions a CPU makes on a thread it
// does not run are READY -> RUNNING (dispatch) and expired SLEEPING ->
// READY (wakeup); everything else a thread does to itself.
//
// HAND-OFF PROTOCOL:
//   1. The outgoing thread's context is saved and its status gets the busy
//      flag (READY|BUSY, SUSPENDED|BUSY, ...). Busy threads are invisible
//      to every other CPU's scan.
//   2. `schedule` returns the incoming context plus a `PostSwitch` naming
//      the outgoing thread.
//   3. The entry trampoline switches stacks, then calls `finish_switch`,
//      which clears the busy flag. Only now may another CPU pick the
//      outgoing thread, because only now is nothing running on its stack.
//
// A finished thread's stack is released in step 3 for the same reason.
// =============================================================================

mod lifecycle;
#[cfg(test)]
pub(crate) mod tests;

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use log::{debug, warn};
use spin::Once;

use crate::arch::{IpiTarget, IrqHandler, Platform, ThreadFn};
use crate::atomic::pause;
use crate::config::{RESCHED_VECTOR, SchedConfig, TIMER_VECTOR, YIELD_VECTOR};
use crate::cpu::{CpuBlock, CpuTable};
use crate::error::Result;
use crate::sync::spinlock::RawSpinLock;
use crate::sync::wait::Executive;
use crate::thread::{Status, Tcb, ThreadId, ThreadOptions, ThreadState, ThreadTable};

/// Opaque pointer to a saved register frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextPtr(usize);

impl ContextPtr {
    pub const NULL: Self = Self(0);

    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> usize {
        self.0
    }
}

/// Work that must run on the incoming stack, after the switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostSwitch {
    pub outgoing: ThreadId,
}

/// What the interrupt entry resumes, and what it must do once it has.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct SwitchResult {
    pub context: ContextPtr,
    pub post_switch: Option<PostSwitch>,
}

impl SwitchResult {
    /// Resume the interrupted context unchanged.
    pub const fn resume(context: ContextPtr) -> Self {
        Self {
            context,
            post_switch: None,
        }
    }
}

/// Entry points the scheduler cannot name itself.
#[derive(Clone, Copy)]
pub struct Hooks {
    /// Body of every CPU's idle thread.
    pub idle: ThreadFn,
    /// Interrupt handler that runs `schedule`; installed on the timer,
    /// yield and reschedule vectors.
    pub dispatch: IrqHandler,
}

pub struct Scheduler<P: Platform> {
    platform: P,
    config: SchedConfig,
    threads: ThreadTable,
    cpus: CpuTable,
    idle_entry: Once<ThreadFn>,
    /// Idle threads exist; sleeping may really suspend.
    idle_ready: AtomicBool,
    /// Application processors that checked in.
    pub(crate) aps_running: AtomicU32,
}

impl<P: Platform> Scheduler<P> {
    pub const fn new(platform: P, config: SchedConfig) -> Self {
        Self {
            platform,
            config,
            threads: ThreadTable::new(),
            cpus: CpuTable::new(),
            idle_entry: Once::new(),
            idle_ready: AtomicBool::new(false),
            aps_running: AtomicU32::new(0),
        }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn config(&self) -> &SchedConfig {
        &self.config
    }

    pub fn threads(&self) -> &ThreadTable {
        &self.threads
    }

    pub fn cpus(&self) -> &CpuTable {
        &self.cpus
    }

    /// Control block of the calling CPU.
    pub fn current_cpu(&self) -> &CpuBlock {
        self.cpus.get(self.platform.cpu_index())
    }

    /// Index of the calling CPU.
    pub fn cpu_number(&self) -> usize {
        self.platform.cpu_index()
    }

    pub fn cpu_count(&self) -> usize {
        self.cpus.count()
    }

    /// The calling thread, if this CPU runs one yet.
    pub fn try_current(&self) -> Option<ThreadId> {
        self.current_cpu().cur_thread()
    }

    pub fn current(&self) -> ThreadId {
        match self.try_current() {
            Some(id) => id,
            None => panic!("cpu {} has no current thread", self.cpu_number()),
        }
    }

    fn current_tcb(&self) -> &Tcb {
        self.threads.slot(self.current().index())
    }

    /// Brings up the scheduler on the boot CPU. The caller becomes thread
    /// 0, and CPU 0 gets an idle thread.
    ///
    /// Call with interrupts disabled, before the timer is started.
    pub fn init_bsp(&self, hooks: Hooks) -> Result<ThreadId> {
        let cpu = match self.cpus.register(self.platform.hardware_cpu_id()) {
            Some(cpu) => cpu,
            None => panic!("init_bsp: cpu table already full"),
        };
        assert_eq!(cpu, self.platform.cpu_index(), "init_bsp: not on cpu 0");
        self.idle_entry.call_once(|| hooks.idle);

        let boot = match self.threads.claim() {
            Some(id) => id,
            None => panic!("init_bsp: thread table already full"),
        };
        let tcb = self.threads.slot(boot.index());
        tcb.prepare(0, u64::MAX, false);
        tcb.cpu.store(cpu as u32, Ordering::Relaxed);
        tcb.sched_timestamp
            .store(self.platform.now_ns(), Ordering::Relaxed);
        tcb.status.store(Status::idle(ThreadState::Running));
        self.cpus.get(cpu).set_cur_thread(boot);

        let idle = self.create_idle(cpu, ThreadState::Ready)?;

        for vector in [TIMER_VECTOR, YIELD_VECTOR, RESCHED_VECTOR] {
            self.platform.register_handler(vector, hooks.dispatch);
        }

        debug!("sched: boot thread {boot}, idle {idle} on cpu {cpu}");
        Ok(boot)
    }

    /// Creates `cpu`'s idle thread in `state`.
    pub(crate) fn create_idle(&self, cpu: usize, state: ThreadState) -> Result<ThreadId> {
        let idle = match self.idle_entry.get() {
            Some(entry) => *entry,
            None => panic!("idle thread requested before init_bsp"),
        };
        self.spawn(idle, cpu, ThreadOptions::idle(cpu), state)
    }

    /// Lets `thread_sleep_until` really suspend. Until then it busy-waits,
    /// because nothing could run in the sleeper's place.
    pub fn idle_set_ready(&self) {
        self.idle_ready.store(true, Ordering::Release);
    }

    pub fn is_idle_ready(&self) -> bool {
        self.idle_ready.load(Ordering::Acquire)
    }

    /// Body of an idle thread.
    pub fn idle_loop(&self) -> ! {
        loop {
            self.platform.halt();
        }
    }

    /// Asks every other CPU to run `schedule` soon.
    pub fn request_reschedule(&self) {
        self.platform.send_ipi(IpiTarget::Others, RESCHED_VECTOR);
    }

    // ── The decision ────────────────────────────────────────────

    /// Picks what this CPU runs next. Called from interrupt context with
    /// interrupts disabled; `ctx` is the interrupted thread's frame.
    pub fn schedule(&self, ctx: ContextPtr) -> SwitchResult {
        let cpu_index = self.platform.cpu_index();
        let cpu = self.cpus.get(cpu_index);
        let now = self.platform.now_ns();

        if let Some(goto) = cpu.take_goto_thread() {
            return self.dispatch_forced(cpu_index, goto, now);
        }

        let outgoing = match cpu.cur_thread() {
            Some(id) => id,
            None => panic!("schedule: cpu {cpu_index} has no thread"),
        };
        let out = self.threads.slot(outgoing.index());

        let ran_for = now.saturating_sub(out.sched_timestamp.load(Ordering::Relaxed));
        out.used_time.fetch_add(ran_for, Ordering::Relaxed);

        let out_ready = Self::park_outgoing(out, outgoing, ctx);
        let next = self.choose_next(cpu_index, outgoing.index(), out_ready, now);
        let tcb = self.threads.slot(next);

        tcb.boost.store(0, Ordering::Relaxed);
        tcb.cpu.store(cpu_index as u32, Ordering::Relaxed);
        tcb.sched_timestamp.store(now, Ordering::Relaxed);

        if next == outgoing.index() {
            return SwitchResult::resume(ctx);
        }

        cpu.set_cur_thread(self.threads.id_of(next));
        SwitchResult {
            context: tcb.context(),
            post_switch: Some(PostSwitch { outgoing }),
        }
    }

    /// Saves the outgoing context and marks the thread busy. Returns
    /// whether it may keep running.
    fn park_outgoing(out: &Tcb, id: ThreadId, ctx: ContextPtr) -> bool {
        let status = out.status();
        match status {
            Status {
                state: ThreadState::Running,
                busy: false,
            } => {
                out.save_context(ctx);
                let parked = out
                    .status
                    .compare_exchange(status, Status::busy(ThreadState::Ready));
                assert!(parked.is_ok(), "schedule: {id} changed state while running");
                true
            }
            // Resumed before it finished suspending.
            Status {
                state: ThreadState::Ready,
                busy: true,
            } => {
                out.save_context(ctx);
                true
            }
            Status {
                state: ThreadState::Sleeping | ThreadState::Suspended,
                busy: true,
            } => {
                out.save_context(ctx);
                false
            }
            Status {
                state: ThreadState::Destructing,
                busy: true,
            } => {
                out.status.store(Status::busy(ThreadState::Finished));
                false
            }
            other => panic!("schedule: {id} left the cpu in state {other:?}"),
        }
    }

    /// Scans the table once around, starting after the outgoing thread,
    /// and claims the best eligible thread.
    ///
    /// The first candidate at least as good as a still-ready outgoing
    /// thread is taken unless a later one is strictly better, which makes
    /// equal priorities round-robin. With nothing better the outgoing
    /// thread keeps the CPU.
    fn choose_next(&self, cpu: usize, out_index: usize, out_ready: bool, now: u64) -> usize {
        let out = self.threads.slot(out_index);
        let mut retries = 0u32;

        loop {
            let count = self.threads.count();
            let out_prio = out.effective_priority();
            let mut best: Option<(usize, i32)> = None;

            for step in 1..count {
                let index = (out_index + step) % count;
                let tcb = self.threads.slot(index);
                if !tcb.may_run_on(cpu) {
                    continue;
                }

                let mut status = tcb.status();
                if status == Status::idle(ThreadState::Sleeping)
                    && tcb.wake_time.load(Ordering::Acquire) <= now
                {
                    // Several CPUs may race this wakeup; one wins.
                    let _ = tcb
                        .status
                        .compare_exchange(status, Status::idle(ThreadState::Ready));
                    status = tcb.status();
                }
                if status != Status::idle(ThreadState::Ready) {
                    continue;
                }

                let prio = tcb.effective_priority();
                let better = match best {
                    None => !out_ready || prio >= out_prio,
                    Some((_, best_prio)) => prio > best_prio,
                };
                if better {
                    best = Some((index, prio));
                }
            }

            match best {
                Some((index, _)) => {
                    let claimed = self.threads.slot(index).status.compare_exchange(
                        Status::idle(ThreadState::Ready),
                        Status::idle(ThreadState::Running),
                    );
                    if claimed.is_ok() {
                        return index;
                    }
                }
                None if out_ready => {
                    let kept = out.status.compare_exchange(
                        Status::busy(ThreadState::Ready),
                        Status::idle(ThreadState::Running),
                    );
                    assert!(kept.is_ok(), "schedule: outgoing thread changed while parked");
                    return out_index;
                }
                None => {}
            }

            // Another CPU claimed our pick, or nothing is runnable here
            // for the moment.
            retries += 1;
            if retries.is_power_of_two() {
                warn!("sched: cpu {cpu} choose-next retry {retries}");
            }
            pause();
        }
    }

    /// First dispatch on a freshly started CPU.
    fn dispatch_forced(&self, cpu_index: usize, id: ThreadId, now: u64) -> SwitchResult {
        let tcb = match self.threads.get(id) {
            Some(tcb) => tcb,
            None => panic!("schedule: forced thread {id} is gone"),
        };
        let started = tcb.status.compare_exchange(
            Status::idle(ThreadState::Initializing),
            Status::idle(ThreadState::Running),
        );
        assert!(started.is_ok(), "schedule: forced thread {id} not initializing");

        tcb.cpu.store(cpu_index as u32, Ordering::Relaxed);
        tcb.sched_timestamp.store(now, Ordering::Relaxed);
        self.cpus.get(cpu_index).set_cur_thread(id);
        SwitchResult::resume(tcb.context())
    }

    /// Post-switch hook: runs on the incoming stack once the outgoing
    /// thread's stack is no longer in use.
    pub fn finish_switch(&self, post: PostSwitch) {
        let tcb = self.threads.slot(post.outgoing.index());
        if tcb.status().state != ThreadState::Finished {
            tcb.status.clear_busy();
            return;
        }

        if let Some(stack) = tcb.stack.lock().take() {
            if tcb.owns_stack.swap(false, Ordering::AcqRel) {
                // SAFETY: the thread finished and we have left its stack.
                unsafe { self.platform.free_stack(stack) };
            }
        }

        tcb.status.clear_busy();
        if tcb.detached.load(Ordering::SeqCst) {
            tcb.try_recycle();
        }
        debug!("sched: {} finished", post.outgoing);
    }
}

impl<P: Platform> Executive for Scheduler<P> {
    fn current(&self) -> ThreadId {
        Scheduler::current(self)
    }

    fn suspend_release(&self, lock: &RawSpinLock, out_id: &AtomicU32) {
        self.suspend_release(lock, out_id);
    }

    fn resume(&self, id: ThreadId) {
        self.resume(id);
    }

    fn yield_now(&self) {
        self.yield_now();
    }
}
