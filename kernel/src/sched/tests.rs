use std::boxed::Box;
use std::sync::atomic::{AtomicU64, AtomicUsize};
use std::thread;
use std::time::Duration;
use std::vec::Vec;

use super::lifecycle::resume_stall_report;
use super::*;
use crate::arch::Stack;
use crate::config::{DEFAULT_STACK_SIZE, IDLE_PRIORITY, MIN_STACK_SIZE};
use crate::error::ThreadError;
use crate::testing::{self, HALT_STEP_NS, MockPlatform};
use crate::thread::ThreadFlags;

fn idle_body(_: usize) -> isize {
    0
}

fn worker(_: usize) -> isize {
    0
}

fn dispatch(_vector: u8, ctx: ContextPtr) -> SwitchResult {
    SwitchResult::resume(ctx)
}

pub(crate) fn frame(raw: usize) -> ContextPtr {
    ContextPtr::from_raw(raw)
}

/// A scheduler booted on mock CPU 0; the test thread is its boot thread.
pub(crate) fn boot() -> Box<Scheduler<MockPlatform>> {
    boot_with(SchedConfig::new())
}

fn boot_with(config: SchedConfig) -> Box<Scheduler<MockPlatform>> {
    testing::install_host_executive();
    let sched = Box::new(Scheduler::new(MockPlatform::new(), config));
    sched
        .init_bsp(Hooks {
            idle: idle_body,
            dispatch,
        })
        .unwrap();
    sched
}

/// One timer tick as the interrupt entry runs it. Returns the thread the
/// CPU runs afterwards.
fn tick(sched: &Scheduler<MockPlatform>) -> ThreadId {
    let ctx = frame(0x1000 + sched.current().index());
    let switch = sched.schedule(ctx);
    if let Some(post) = switch.post_switch {
        sched.finish_switch(post);
    }
    sched.current()
}

fn spawn(sched: &Scheduler<MockPlatform>, priority: i32) -> ThreadId {
    sched
        .create(worker, 0, ThreadOptions::new().priority(priority))
        .unwrap()
}

fn status(sched: &Scheduler<MockPlatform>, id: ThreadId) -> Status {
    sched.threads().slot(id.index()).status()
}

fn suspend_self(sched: &Scheduler<MockPlatform>) {
    let lock = RawSpinLock::new();
    let out = AtomicU32::new(ThreadId::NONE_RAW);
    lock.lock_noirq();
    sched.suspend_release(&lock, &out);
    assert!(!lock.is_locked());
    assert_eq!(ThreadId::from_raw(out.load(Ordering::SeqCst)), Some(sched.current()));
}

#[test]
fn boot_adopts_caller_and_creates_idle() {
    let sched = boot();
    let me = sched.current();
    assert_eq!(me.index(), 0);
    assert_eq!(status(&sched, me), Status::idle(ThreadState::Running));

    let idle = sched.threads().slot(1);
    assert_eq!(idle.status(), Status::idle(ThreadState::Ready));
    assert_eq!(idle.priority(), IDLE_PRIORITY);
    assert_eq!(idle.affinity(), 1);

    assert_eq!(
        *sched.platform().handlers.lock().unwrap(),
        [TIMER_VECTOR, YIELD_VECTOR, RESCHED_VECTOR]
    );
    assert_eq!(sched.cpu_count(), 1);
    assert_eq!(sched.cpus().get(0).apic_id(), MockPlatform::apic_id_of(0));
    assert_eq!(Executive::current(&*sched), me);
}

#[test]
fn lone_thread_keeps_the_cpu() {
    let sched = boot();
    let me = sched.current();

    let switch = sched.schedule(frame(0x42));
    assert_eq!(switch, SwitchResult::resume(frame(0x42)));
    assert_eq!(sched.current(), me);
    assert_eq!(status(&sched, me), Status::idle(ThreadState::Running));
}

#[test]
fn priorities_order_dispatch_and_equals_round_robin() {
    let sched = boot();
    let boot_id = sched.current();
    let p0 = spawn(&sched, 0);
    let a = spawn(&sched, 5);
    let low = spawn(&sched, -5);
    let b = spawn(&sched, 5);

    let order: Vec<_> = (0..4).map(|_| tick(&sched)).collect();
    assert_eq!(order, [a, b, a, b]);

    // With both priority-5 threads blocked, the priority-0 threads share
    // the CPU and the priority -5 thread still waits.
    suspend_self(&sched);
    assert_eq!(tick(&sched), a);
    suspend_self(&sched);
    assert_eq!(tick(&sched), boot_id);
    assert_eq!(tick(&sched), p0);
    assert_eq!(tick(&sched), boot_id);
    assert_eq!(status(&sched, low), Status::idle(ThreadState::Ready));
}

#[test]
fn busy_outgoing_is_invisible_until_post_switch() {
    let sched = boot();
    let me = sched.current();
    let other = spawn(&sched, 0);

    let switch = sched.schedule(frame(0x10));
    assert_eq!(sched.current(), other);
    assert_eq!(status(&sched, me), Status::busy(ThreadState::Ready));
    assert_eq!(sched.threads().slot(me.index()).context(), frame(0x10));
    assert_eq!(
        switch.context,
        sched.threads().slot(other.index()).context()
    );

    // The hook has not run: `me` is still on its way off the CPU.
    let again = sched.schedule(frame(0x20));
    assert_eq!(again.post_switch, None);
    assert_eq!(sched.current(), other);

    sched.finish_switch(switch.post_switch.unwrap());
    assert_eq!(status(&sched, me), Status::idle(ThreadState::Ready));
    assert_eq!(tick(&sched), me);
}

#[test]
fn sleeper_wakes_only_after_deadline() {
    let sched = boot();
    sched.idle_set_ready();
    let me = sched.current();
    let idle = sched.threads().id_of(1);

    sched.platform().set_now(1_000);
    sched.sleep_until(5_000);
    assert_eq!(status(&sched, me), Status::busy(ThreadState::Sleeping));
    assert_eq!(sched.platform().yields.load(Ordering::SeqCst), 1);

    assert_eq!(tick(&sched), idle);
    assert_eq!(status(&sched, me), Status::idle(ThreadState::Sleeping));

    sched.platform().set_now(4_999);
    assert_eq!(tick(&sched), idle);

    sched.platform().set_now(5_000);
    assert_eq!(tick(&sched), me);
}

#[test]
fn sleep_before_idle_ready_halts_until_deadline() {
    let sched = boot();
    let me = sched.current();
    let deadline = 3 * HALT_STEP_NS + 1;

    sched.sleep_until(deadline);
    assert!(sched.platform().now_ns() >= deadline);
    assert_eq!(sched.platform().halts.load(Ordering::SeqCst), 4);
    assert_eq!(sched.platform().yields.load(Ordering::SeqCst), 0);
    assert_eq!(status(&sched, me), Status::idle(ThreadState::Running));
}

#[test]
fn sleep_for_converts_milliseconds() {
    let sched = boot();
    sched.idle_set_ready();
    sched.platform().set_now(10);
    sched.sleep_for(2);
    let tcb = sched.threads().slot(0);
    assert_eq!(tcb.wake_time.load(Ordering::SeqCst), 2_000_010);
}

#[test]
fn resume_boosts_until_next_dispatch() {
    let sched = boot();
    let me = sched.current();
    let other = spawn(&sched, 0);

    suspend_self(&sched);
    assert_eq!(status(&sched, me), Status::busy(ThreadState::Suspended));
    assert_eq!(tick(&sched), other);
    assert_eq!(status(&sched, me), Status::idle(ThreadState::Suspended));

    sched.resume(me);
    let tcb = sched.threads().slot(me.index());
    assert_eq!(tcb.status(), Status::idle(ThreadState::Ready));
    assert_eq!(tcb.effective_priority(), sched.config().wake_boost);

    assert_eq!(tick(&sched), me);
    assert_eq!(tcb.effective_priority(), 0);
}

#[test]
fn resume_before_the_switch_keeps_the_thread_running() {
    let sched = boot();
    let me = sched.current();

    suspend_self(&sched);
    sched.resume(me);
    assert_eq!(status(&sched, me), Status::busy(ThreadState::Ready));

    let switch = sched.schedule(frame(0x77));
    assert_eq!(switch, SwitchResult::resume(frame(0x77)));
    assert_eq!(status(&sched, me), Status::idle(ThreadState::Running));
}

#[test]
fn resume_spins_until_the_target_suspends() {
    let sched = boot_with(SchedConfig {
        resume_spin_warn: 4,
        ..SchedConfig::new()
    });
    let me = sched.current();

    thread::scope(|s| {
        let resumer = s.spawn(|| sched.resume(me));
        thread::sleep(Duration::from_millis(20));
        assert!(!resumer.is_finished());
        assert_eq!(status(&sched, me), Status::idle(ThreadState::Running));

        suspend_self(&sched);
        resumer.join().unwrap();
    });
    assert_eq!(status(&sched, me), Status::busy(ThreadState::Ready));
}

#[test]
fn stalled_resume_reports_at_threshold_and_doublings() {
    let reported: Vec<u64> = (1..=40).filter(|&n| resume_stall_report(n, 5)).collect();
    assert_eq!(reported, [5, 10, 20, 40]);
    assert!(!resume_stall_report(5, 0));
    assert!(resume_stall_report(5 << 40, 5));
}

#[test]
fn start_suspended_waits_for_resume() {
    let sched = boot();
    let me = sched.current();
    let child = sched
        .create(
            worker,
            0,
            ThreadOptions::new().flags(ThreadFlags::START_SUSPENDED),
        )
        .unwrap();
    assert_eq!(status(&sched, child), Status::idle(ThreadState::Suspended));
    assert_eq!(tick(&sched), me);

    sched.resume(child);
    assert_eq!(tick(&sched), child);
}

#[test]
fn wait_returns_exit_code_and_recycles() {
    let sched = boot();
    let me = sched.current();
    let child = spawn(&sched, 1);
    assert_eq!(sched.platform().live_stacks.load(Ordering::SeqCst), 2);

    assert_eq!(tick(&sched), child);
    sched.begin_exit(42);
    assert_eq!(status(&sched, child), Status::busy(ThreadState::Destructing));
    assert_eq!(sched.try_wait(child), Err(ThreadError::NotFinished));

    assert_eq!(tick(&sched), me);
    assert_eq!(status(&sched, child), Status::idle(ThreadState::Finished));
    assert_eq!(sched.platform().live_stacks.load(Ordering::SeqCst), 1);

    assert_eq!(sched.wait(child), Ok(42));
    assert_eq!(sched.wait(child), Err(ThreadError::InvalidThread(child)));
    assert!(sched.threads().get(child).is_none());
}

#[test]
fn wait_blocks_until_exit() {
    let sched = boot();
    let child = spawn(&sched, 1);
    assert_eq!(tick(&sched), child);

    thread::scope(|s| {
        let waiter = s.spawn(|| sched.wait(child));
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());

        sched.begin_exit(7);
        tick(&sched);
        assert_eq!(waiter.join().unwrap(), Ok(7));
    });
}

#[test]
fn detached_thread_recycles_itself() {
    let sched = boot();
    let child = sched
        .create(
            worker,
            0,
            ThreadOptions::new().priority(1).flags(ThreadFlags::DETACHED),
        )
        .unwrap();

    assert_eq!(tick(&sched), child);
    sched.begin_exit(0);
    tick(&sched);

    assert!(sched.threads().get(child).is_none());
    assert_eq!(
        status(&sched, child),
        Status::idle(ThreadState::Uninitialized)
    );
    assert_eq!(sched.platform().live_stacks.load(Ordering::SeqCst), 1);
    assert_eq!(sched.wait(child), Err(ThreadError::InvalidThread(child)));

    let next = spawn(&sched, 0);
    assert_eq!(next.index(), child.index());
    assert_ne!(next, child);
}

#[test]
fn close_after_finish_recycles() {
    let sched = boot();
    let child = spawn(&sched, 1);
    assert_eq!(tick(&sched), child);
    sched.begin_exit(3);
    tick(&sched);

    assert_eq!(sched.close(child), Ok(()));
    assert!(sched.threads().get(child).is_none());
    assert_eq!(sched.close(child), Err(ThreadError::InvalidThread(child)));
}

#[test]
fn creation_errors_leave_the_table_clean() {
    let sched = boot();
    assert_eq!(
        sched.create(worker, 0, ThreadOptions::new().stack_size(MIN_STACK_SIZE - 1)),
        Err(ThreadError::StackTooSmall {
            size: MIN_STACK_SIZE - 1
        })
    );

    sched.platform().fail_alloc.store(true, Ordering::SeqCst);
    assert_eq!(
        sched.create(worker, 0, ThreadOptions::new()),
        Err(ThreadError::StackAllocation {
            size: DEFAULT_STACK_SIZE
        })
    );
    assert_eq!(
        sched.threads().slot(2).status(),
        Status::idle(ThreadState::Uninitialized)
    );
    sched.platform().fail_alloc.store(false, Ordering::SeqCst);

    assert_eq!(spawn(&sched, 0).index(), 2);
}

#[test]
fn caller_stacks_are_not_released() {
    let sched = boot();
    let stack = Stack {
        base: 0x9000_0000,
        size: MIN_STACK_SIZE,
    };
    let child = sched
        .create(worker, 0, ThreadOptions::new().stack(stack).priority(9))
        .unwrap();
    assert_eq!(sched.platform().live_stacks.load(Ordering::SeqCst), 1);

    assert_eq!(tick(&sched), child);
    sched.begin_exit(0);
    tick(&sched);
    assert_eq!(sched.platform().live_stacks.load(Ordering::SeqCst), 1);
    assert_eq!(sched.wait(child), Ok(0));
}

#[test]
fn affinity_keeps_threads_off_other_cpus() {
    let sched = boot();
    let me = sched.current();
    let pinned = sched
        .create(worker, 0, ThreadOptions::new().priority(3).affinity(1 << 1))
        .unwrap();

    assert_eq!(tick(&sched), me);
    sched.set_affinity(pinned, 0).unwrap();
    assert_eq!(sched.get_affinity(pinned), Ok(u64::MAX));
    assert_eq!(tick(&sched), pinned);
}

#[test]
fn excluding_the_current_cpu_yields() {
    let sched = boot();
    let me = sched.current();

    sched.set_affinity(me, 1 << 0).unwrap();
    assert_eq!(sched.platform().yields.load(Ordering::SeqCst), 0);
    sched.set_affinity(me, 1 << 3).unwrap();
    assert_eq!(sched.platform().yields.load(Ordering::SeqCst), 1);
}

#[test]
fn priority_is_settable() {
    let sched = boot();
    let child = spawn(&sched, 0);
    sched.set_priority(child, 12).unwrap();
    assert_eq!(sched.get_priority(child), Ok(12));
    assert_eq!(tick(&sched), child);
}

#[test]
fn usage_accumulates_per_switch() {
    let sched = boot();
    let me = sched.current();
    let other = spawn(&sched, 0);

    sched.platform().set_now(5_000_000);
    assert_eq!(tick(&sched), other);
    assert_eq!(sched.get_usage(me), Ok(5_000_000));

    sched.platform().set_now(7_000_000);
    assert_eq!(tick(&sched), me);
    assert_eq!(sched.get_usage(other), Ok(2_000_000));
}

#[test]
fn reschedule_request_goes_to_other_cpus() {
    let sched = boot();
    sched.request_reschedule();
    assert_eq!(
        *sched.platform().ipis.lock().unwrap(),
        [(IpiTarget::Others, RESCHED_VECTOR)]
    );
}

#[test]
fn cpu_local_storage_reads_the_calling_cpu() {
    let sched = boot();
    let slot = sched.cls_alloc().unwrap();
    sched.cls_set(slot, 7);
    assert_eq!(sched.cls_get(slot), 7);

    sched.cls_init_each_cpu(slot, |cpu| cpu + 40);
    let mut values = Vec::new();
    sched.cls_for_each_cpu(slot, |cpu, value| values.push((cpu, value)));
    assert_eq!(values, [(0, 40)]);
}

/// Every OS thread plays one CPU, ticking `schedule`/`finish_switch` over
/// one shared table. Each sleeper sleeps the first time it runs.
#[test]
fn cpus_never_share_a_thread_and_sleepers_wake_once() {
    const CPUS: usize = 4;
    const SLEEPERS: usize = 12;
    const TICK_NS: u64 = 1_000;
    const SLEEP_NS: u64 = 20_000;
    const MAX_TICKS: usize = 1_000_000;

    let sched = boot();
    for cpu in 1..CPUS {
        let index = sched.register_ap(MockPlatform::apic_id_of(cpu)).unwrap();
        assert_eq!(index, cpu);
        sched.init_ap(index).unwrap();
    }
    sched.idle_set_ready();
    let sleepers: Vec<ThreadId> = (0..SLEEPERS).map(|_| spawn(&sched, 0)).collect();

    let slots = sched.threads().count();
    let counters = |n: usize| (0..n).map(|_| AtomicUsize::new(0)).collect::<Vec<_>>();
    let on_cpu = counters(slots);
    let wakes = counters(slots);
    let slept: Vec<AtomicBool> = (0..slots).map(|_| AtomicBool::new(false)).collect();
    let asleep: Vec<AtomicBool> = (0..slots).map(|_| AtomicBool::new(false)).collect();
    let deadline: Vec<AtomicU64> = (0..slots).map(|_| AtomicU64::new(0)).collect();
    let woken = AtomicUsize::new(0);

    // CPU 0 starts out on the boot thread.
    on_cpu[sched.current().index()].store(1, Ordering::SeqCst);

    let sched: &Scheduler<MockPlatform> = &sched;
    let is_sleeper = |index: usize| sleepers.iter().any(|id| id.index() == index);

    thread::scope(|s| {
        for cpu in 0..CPUS {
            let (on_cpu, wakes, slept, asleep, deadline, woken) =
                (&on_cpu, &wakes, &slept, &asleep, &deadline, &woken);
            s.spawn(move || {
                MockPlatform::bind_cpu(cpu);
                let mut current = sched.try_current();
                let mut ticks = 0;

                while woken.load(Ordering::SeqCst) < SLEEPERS {
                    ticks += 1;
                    assert!(ticks < MAX_TICKS, "cpu {cpu}: sleepers never all woke");
                    let now = sched.platform().now.fetch_add(TICK_NS, Ordering::SeqCst) + TICK_NS;

                    if let Some(id) = current {
                        let i = id.index();
                        if is_sleeper(i) && !slept[i].swap(true, Ordering::SeqCst) {
                            deadline[i].store(now + SLEEP_NS, Ordering::SeqCst);
                            asleep[i].store(true, Ordering::SeqCst);
                            sched.sleep_until(now + SLEEP_NS);
                        }
                    }

                    let switch = sched.schedule(frame(0x1000 + cpu));
                    let next = sched.current();
                    if current != Some(next) {
                        if let Some(prev) = current {
                            on_cpu[prev.index()].fetch_sub(1, Ordering::SeqCst);
                        }
                        let i = next.index();
                        assert_eq!(
                            on_cpu[i].fetch_add(1, Ordering::SeqCst),
                            0,
                            "{next} dispatched on cpu {cpu} while running elsewhere"
                        );
                        if asleep[i].swap(false, Ordering::SeqCst) {
                            assert!(sched.platform().now_ns() >= deadline[i].load(Ordering::SeqCst));
                            wakes[i].fetch_add(1, Ordering::SeqCst);
                            woken.fetch_add(1, Ordering::SeqCst);
                        }
                        current = Some(next);
                    }
                    // The outgoing thread stays invisible to the other
                    // CPUs until this runs.
                    if let Some(post) = switch.post_switch {
                        sched.finish_switch(post);
                    }
                }
            });
        }
    });

    for id in &sleepers {
        assert!(slept[id.index()].load(Ordering::SeqCst), "{id} never ran");
        assert_eq!(wakes[id.index()].load(Ordering::SeqCst), 1, "{id}");
    }
    let running: usize = on_cpu.iter().map(|n| n.load(Ordering::SeqCst)).sum();
    assert_eq!(running, CPUS);
    assert!(on_cpu.iter().all(|n| n.load(Ordering::SeqCst) <= 1));
}
