//! Host doubles for unit tests: an executive backed by OS threads and a
//! scripted platform.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, Thread};

use crate::arch::{IpiTarget, IrqHandler, Platform, Stack, ThreadStart};
use crate::config::STACK_GUARD_SIZE;
use crate::sched::ContextPtr;
use crate::sync::spinlock::RawSpinLock;
use crate::sync::wait::{self, Executive};
use crate::thread::ThreadId;

// ── Executive over OS threads ───────────────────────────────────

struct Parker {
    thread: Thread,
    woken: AtomicBool,
}

/// Each OS thread that touches a blocking lock gets a `ThreadId` on first
/// use; suspension is `park`, resumption is `unpark`.
pub(crate) struct HostExecutive {
    parkers: Mutex<Vec<Arc<Parker>>>,
}

std::thread_local! {
    static HOST_ID: std::cell::Cell<u32> = const { std::cell::Cell::new(ThreadId::NONE_RAW) };
    static HOST_YIELDS: std::cell::Cell<usize> = const { std::cell::Cell::new(0) };
}

/// Yields the calling OS thread made through the host executive.
pub(crate) fn host_yields() -> usize {
    HOST_YIELDS.with(|n| n.get())
}

impl HostExecutive {
    const fn new() -> Self {
        Self {
            parkers: Mutex::new(Vec::new()),
        }
    }

    fn parker(&self, id: ThreadId) -> Arc<Parker> {
        let parkers = self.parkers.lock().unwrap();
        Arc::clone(&parkers[id.index()])
    }
}

impl Executive for HostExecutive {
    fn current(&self) -> ThreadId {
        let raw = HOST_ID.with(|id| id.get());
        if let Some(id) = ThreadId::from_raw(raw) {
            return id;
        }

        let mut parkers = self.parkers.lock().unwrap();
        let id = ThreadId::new(parkers.len() as u16, 0);
        parkers.push(Arc::new(Parker {
            thread: thread::current(),
            woken: AtomicBool::new(false),
        }));
        HOST_ID.with(|slot| slot.set(id.to_raw()));
        id
    }

    fn suspend_release(&self, lock: &RawSpinLock, out_id: &AtomicU32) {
        let me = self.current();
        let parker = self.parker(me);
        parker.woken.store(false, Ordering::SeqCst);
        out_id.store(me.to_raw(), Ordering::Release);

        lock.unlock_noirq();
        while !parker.woken.swap(false, Ordering::SeqCst) {
            thread::park();
        }
    }

    fn resume(&self, id: ThreadId) {
        let parker = self.parker(id);
        parker.woken.store(true, Ordering::SeqCst);
        parker.thread.unpark();
    }

    fn yield_now(&self) {
        HOST_YIELDS.with(|n| n.set(n.get() + 1));
        thread::yield_now();
    }
}

static HOST: HostExecutive = HostExecutive::new();

/// Installs the host executive for this test binary. Idempotent.
pub(crate) fn install_host_executive() {
    wait::install(&HOST);
}

// ── Scripted platform ───────────────────────────────────────────

/// Clock advance per `halt`, so halting loops make progress.
pub(crate) const HALT_STEP_NS: u64 = 1_000_000;

std::thread_local! {
    static BOUND_CPU: std::cell::Cell<Option<usize>> = const { std::cell::Cell::new(None) };
}

/// A platform whose clock, CPU identity and stack supply the test drives.
///
/// The CPU index is `cpu` unless the calling OS thread bound itself with
/// [`MockPlatform::bind_cpu`], so several OS threads can act as several
/// CPUs at once.
pub(crate) struct MockPlatform {
    pub now: AtomicU64,
    pub cpu: AtomicUsize,
    pub yields: AtomicUsize,
    pub halts: AtomicUsize,
    pub ipis: Mutex<Vec<(IpiTarget, u8)>>,
    pub handlers: Mutex<Vec<u8>>,
    pub startups: Mutex<Vec<u32>>,
    pub live_stacks: AtomicUsize,
    pub fail_alloc: AtomicBool,
    next_stack: AtomicUsize,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self {
            now: AtomicU64::new(0),
            cpu: AtomicUsize::new(0),
            yields: AtomicUsize::new(0),
            halts: AtomicUsize::new(0),
            ipis: Mutex::new(Vec::new()),
            handlers: Mutex::new(Vec::new()),
            startups: Mutex::new(Vec::new()),
            live_stacks: AtomicUsize::new(0),
            fail_alloc: AtomicBool::new(false),
            next_stack: AtomicUsize::new(0x10_0000),
        }
    }

    pub fn set_now(&self, ns: u64) {
        self.now.store(ns, Ordering::SeqCst);
    }

    pub fn set_cpu(&self, cpu: usize) {
        self.cpu.store(cpu, Ordering::SeqCst);
    }

    /// Makes the calling OS thread CPU `cpu` from now on.
    pub fn bind_cpu(cpu: usize) {
        BOUND_CPU.with(|bound| bound.set(Some(cpu)));
    }

    /// Hardware id the mock reports for CPU `index`.
    pub fn apic_id_of(index: usize) -> u32 {
        index as u32 * 2
    }
}

impl Platform for MockPlatform {
    fn now_ns(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn cpu_index(&self) -> usize {
        BOUND_CPU
            .with(|bound| bound.get())
            .unwrap_or_else(|| self.cpu.load(Ordering::SeqCst))
    }

    fn hardware_cpu_id(&self) -> u32 {
        Self::apic_id_of(self.cpu_index())
    }

    fn send_ipi(&self, target: IpiTarget, vector: u8) {
        self.ipis.lock().unwrap().push((target, vector));
    }

    fn register_handler(&self, vector: u8, _handler: IrqHandler) {
        self.handlers.lock().unwrap().push(vector);
    }

    fn yield_now(&self) {
        self.yields.fetch_add(1, Ordering::SeqCst);
    }

    fn halt(&self) {
        self.halts.fetch_add(1, Ordering::SeqCst);
        self.now.fetch_add(HALT_STEP_NS, Ordering::SeqCst);
    }

    fn alloc_stack(&self, size: usize) -> Option<Stack> {
        if self.fail_alloc.load(Ordering::SeqCst) {
            return None;
        }
        let span = size + 2 * STACK_GUARD_SIZE;
        let base = self.next_stack.fetch_add(span, Ordering::SeqCst) + STACK_GUARD_SIZE;
        self.live_stacks.fetch_add(1, Ordering::SeqCst);
        Some(Stack { base, size })
    }

    unsafe fn free_stack(&self, _stack: Stack) {
        self.live_stacks.fetch_sub(1, Ordering::SeqCst);
    }

    fn init_context(&self, stack: &Stack, _start: ThreadStart) -> ContextPtr {
        ContextPtr::from_raw(stack.top() - 256)
    }
}
