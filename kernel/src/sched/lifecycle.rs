//! Thread lifecycle and the calls a thread makes on itself or others:
//! create, exit, wait, detach, sleep, suspend/resume, priority, affinity,
//! CPU-local storage.

use core::sync::atomic::{AtomicU32, Ordering};

use log::{debug, warn};

use crate::arch::{Platform, ThreadFn, ThreadStart};
use crate::config::MIN_STACK_SIZE;
use crate::error::{Result, ThreadError};
use crate::sync::backoff::Backoff;
use crate::sync::spinlock::RawSpinLock;
use crate::thread::{Status, Tcb, ThreadFlags, ThreadId, ThreadOptions, ThreadState};

use super::Scheduler;

impl<P: Platform> Scheduler<P> {
    fn tcb(&self, id: ThreadId) -> Result<&Tcb> {
        self.threads.get(id).ok_or(ThreadError::InvalidThread(id))
    }

    pub fn get_id(&self) -> ThreadId {
        self.current()
    }

    // ── Creation ────────────────────────────────────────────────

    /// Starts `entry(arg)` on a new thread.
    ///
    /// Waits (yielding) for a free slot when the table is full.
    pub fn create(&self, entry: ThreadFn, arg: usize, options: ThreadOptions) -> Result<ThreadId> {
        let state = if options.flags.contains(ThreadFlags::START_SUSPENDED) {
            ThreadState::Suspended
        } else {
            ThreadState::Ready
        };
        self.spawn(entry, arg, options, state)
    }

    pub(crate) fn spawn(
        &self,
        entry: ThreadFn,
        arg: usize,
        options: ThreadOptions,
        state: ThreadState,
    ) -> Result<ThreadId> {
        let size = options.stack.map_or(options.stack_size, |stack| stack.size);
        if size < MIN_STACK_SIZE {
            return Err(ThreadError::StackTooSmall { size });
        }

        let id = self.claim_slot();
        let tcb = self.threads.slot(id.index());

        let (stack, owned) = match options.stack {
            Some(stack) => (stack, false),
            None => match self.platform.alloc_stack(size) {
                Some(stack) => (stack, true),
                None => {
                    // Never published; hand the slot back as it was.
                    tcb.status.store(Status::idle(ThreadState::Uninitialized));
                    return Err(ThreadError::StackAllocation { size });
                }
            },
        };

        let affinity = match options.affinity {
            0 => u64::MAX,
            mask => mask,
        };
        tcb.prepare(
            options.priority,
            affinity,
            options.flags.contains(ThreadFlags::DETACHED),
        );
        *tcb.stack.lock() = Some(stack);
        tcb.owns_stack.store(owned, Ordering::Release);
        tcb.save_context(self.platform.init_context(&stack, ThreadStart { entry, arg, id }));
        tcb.status.store(Status::idle(state));

        debug!("sched: created {id} ({state:?}, priority {})", options.priority);
        Ok(id)
    }

    fn claim_slot(&self) -> ThreadId {
        loop {
            if let Some(id) = self.threads.claim() {
                return id;
            }
            warn!("sched: thread table full, waiting for a slot");
            self.yield_now();
        }
    }

    // ── Termination ─────────────────────────────────────────────

    /// Ends the calling thread with `code`.
    pub fn exit(&self, code: isize) -> ! {
        self.begin_exit(code);
        loop {
            // Destructing threads are never dispatched again.
            self.platform.yield_now();
            self.platform.halt();
        }
    }

    /// Publishes the exit code, wakes waiters and marks the caller
    /// `Destructing`. The next `schedule` on this CPU finishes it.
    pub(crate) fn begin_exit(&self, code: isize) {
        let id = self.current();
        let tcb = self.threads.slot(id.index());

        {
            let _guard = tcb.lock.lock();
            tcb.exit_code.store(code, Ordering::Relaxed);
            tcb.exited.store(true, Ordering::Release);
            tcb.done_cond.notify_all();
        }

        let marked = tcb.status.compare_exchange(
            Status::idle(ThreadState::Running),
            Status::busy(ThreadState::Destructing),
        );
        assert!(marked.is_ok(), "exit: {id} was not running");
        debug!("sched: {id} exiting with {code}");
    }

    /// Blocks until `id` finishes, recycles its slot and returns its exit
    /// code. Each thread may be waited for once, by one waiter.
    pub fn wait(&self, id: ThreadId) -> Result<isize> {
        assert_ne!(self.try_current(), Some(id), "wait: a thread cannot wait for itself");
        let tcb = self.tcb(id)?;
        if tcb.detached.load(Ordering::SeqCst) {
            return Err(ThreadError::InvalidThread(id));
        }

        drop(
            tcb.done_cond
                .wait_while(tcb.lock.lock(), |_| !tcb.exited.load(Ordering::Acquire)),
        );
        let code = tcb.exit_code.load(Ordering::Relaxed);

        // The code is out, but the thread may still be leaving its CPU.
        let mut backoff = Backoff::new();
        loop {
            if tcb.generation.load(Ordering::Acquire) != id.generation() {
                return Err(ThreadError::InvalidThread(id));
            }
            if tcb.try_recycle() {
                return Ok(code);
            }
            backoff.snooze();
        }
    }

    /// Non-blocking `wait`.
    pub fn try_wait(&self, id: ThreadId) -> Result<isize> {
        let tcb = self.tcb(id)?;
        if !tcb.exited.load(Ordering::Acquire) || !tcb.try_recycle() {
            return Err(ThreadError::NotFinished);
        }
        Ok(tcb.exit_code.load(Ordering::Relaxed))
    }

    /// Detaches `id`: its slot is recycled as soon as it finishes, and it
    /// can no longer be waited for.
    pub fn close(&self, id: ThreadId) -> Result<()> {
        let tcb = self.tcb(id)?;
        tcb.detached.store(true, Ordering::SeqCst);
        // Already finished and off its CPU: nobody else will recycle it.
        tcb.try_recycle();
        Ok(())
    }

    // ── Yield, sleep, suspend ───────────────────────────────────

    pub fn yield_now(&self) {
        self.platform.yield_now();
    }

    /// Sleeps until `now_ns() >= deadline`.
    pub fn sleep_until(&self, deadline: u64) {
        if !self.is_idle_ready() {
            while self.platform.now_ns() < deadline {
                self.platform.halt();
            }
            return;
        }

        let id = self.current();
        let tcb = self.threads.slot(id.index());
        tcb.wake_time.store(deadline, Ordering::Release);
        let slept = tcb.status.compare_exchange(
            Status::idle(ThreadState::Running),
            Status::busy(ThreadState::Sleeping),
        );
        assert!(slept.is_ok(), "sleep: {id} was not running");
        self.platform.yield_now();
    }

    pub fn sleep_for(&self, ms: u64) {
        let deadline = self
            .platform
            .now_ns()
            .saturating_add(ms.saturating_mul(1_000_000));
        self.sleep_until(deadline);
    }

    /// Suspends the caller and releases `lock` (held via `lock_noirq`) in
    /// one step. The caller's id goes to `out_id` first, so whoever takes
    /// `lock` next can resume it.
    pub fn suspend_release(&self, lock: &RawSpinLock, out_id: &AtomicU32) {
        let id = self.current();
        out_id.store(id.to_raw(), Ordering::Release);

        let tcb = self.threads.slot(id.index());
        let suspended = tcb.status.compare_exchange(
            Status::idle(ThreadState::Running),
            Status::busy(ThreadState::Suspended),
        );
        assert!(suspended.is_ok(), "suspend: {id} was not running");

        lock.unlock_noirq();
        self.platform.yield_now();
    }

    /// Makes a suspended thread ready, with a wake boost.
    ///
    /// The target may still be on its way into `suspend_release`; this
    /// spins until it gets there.
    pub fn resume(&self, id: ThreadId) {
        let Some(tcb) = self.threads.get(id) else {
            warn!("sched: resume of dead thread {id}");
            return;
        };

        let mut spins = 0u64;
        let mut backoff = Backoff::new();
        loop {
            let status = tcb.status();
            match status.state {
                ThreadState::Suspended => {
                    tcb.boost.store(self.config.wake_boost, Ordering::Relaxed);
                    let ready = Status {
                        state: ThreadState::Ready,
                        busy: status.busy,
                    };
                    if tcb.status.compare_exchange(status, ready).is_ok() {
                        return;
                    }
                    continue;
                }
                ThreadState::Destructing | ThreadState::Finished => {
                    panic!("resume: {id} is {status:?}")
                }
                _ => {}
            }

            spins += 1;
            if resume_stall_report(spins, self.config.resume_spin_warn) {
                let cpu = tcb.cpu.load(Ordering::Relaxed);
                warn!("sched: resume of {id} stalled: {spins} spins, {status:?} on cpu {cpu}");
            }
            backoff.spin();
        }
    }

    // ── Priority, affinity, accounting ──────────────────────────

    pub fn set_priority(&self, id: ThreadId, priority: i32) -> Result<()> {
        self.tcb(id)?.priority.store(priority, Ordering::Relaxed);
        Ok(())
    }

    pub fn get_priority(&self, id: ThreadId) -> Result<i32> {
        Ok(self.tcb(id)?.priority())
    }

    /// Restricts `id` to the CPUs in `mask` (0 means all). A thread that
    /// excludes the CPU it is running on moves off it right away.
    pub fn set_affinity(&self, id: ThreadId, mask: u64) -> Result<()> {
        let mask = if mask == 0 { u64::MAX } else { mask };
        self.tcb(id)?.affinity.store(mask, Ordering::Relaxed);

        if self.try_current() == Some(id) && mask & (1 << self.cpu_number()) == 0 {
            self.yield_now();
        }
        Ok(())
    }

    pub fn get_affinity(&self, id: ThreadId) -> Result<u64> {
        Ok(self.tcb(id)?.affinity())
    }

    /// Nanoseconds `id` has spent on a CPU, as of its last switch.
    pub fn get_usage(&self, id: ThreadId) -> Result<u64> {
        Ok(self.tcb(id)?.used_time())
    }

    // ── CPU-local storage ───────────────────────────────────────

    pub fn cls_alloc(&self) -> Option<usize> {
        self.cpus.local_alloc()
    }

    pub fn cls_get(&self, slot: usize) -> usize {
        self.current_cpu().local(slot)
    }

    pub fn cls_set(&self, slot: usize, value: usize) {
        self.current_cpu().set_local(slot, value);
    }

    pub fn cls_init_each_cpu(&self, slot: usize, init: impl FnMut(usize) -> usize) {
        self.cpus.local_init_each(slot, init);
    }

    pub fn cls_for_each_cpu(&self, slot: usize, f: impl FnMut(usize, usize)) {
        self.cpus.local_for_each(slot, f);
    }
}

/// Whether a resume that has spun `spins` times reports it: at `threshold`
/// and at every doubling after it.
pub(super) fn resume_stall_report(spins: u64, threshold: u32) -> bool {
    let threshold = u64::from(threshold);
    threshold != 0 && spins % threshold == 0 && (spins / threshold).is_power_of_two()
}
