//! Wait chains and the executive that blocking locks suspend through.
//!
//! A wait chain is an intrusive, circular, doubly linked list. The chain
//! head is the sentinel; each waiter links a [`Waiter`] that lives on its
//! own stack for as long as it is blocked. Every chain operation happens
//! under the owning lock's protecting spin lock.
//!
//! The head starts out unlinked (null) and is pointed at itself on first
//! use. When the last waiter leaves it is reset to null again, so an idle
//! lock holds no self-pointers and may be moved.

use core::cell::Cell;
use core::ptr;
use core::sync::atomic::{AtomicU32, Ordering};

use spin::Once;

use crate::sync::spinlock::RawSpinLock;
use crate::thread::ThreadId;

/// Thread services the blocking layer needs. The scheduler implements
/// this for kernel threads; unit tests install one backed by OS threads.
pub trait Executive: Sync {
    /// Id of the calling thread.
    fn current(&self) -> ThreadId;

    /// Publishes the caller's id into `out_id`, marks the caller suspended,
    /// releases `lock` (taken with `lock_noirq`) and gives up the CPU, all
    /// such that a `resume` issued by whoever takes `lock` next cannot be
    /// lost. Returns after `resume`.
    fn suspend_release(&self, lock: &RawSpinLock, out_id: &AtomicU32);

    /// Makes a thread that is in, or about to enter, `suspend_release`
    /// runnable again.
    fn resume(&self, id: ThreadId);

    /// Gives the CPU to another runnable thread, if any.
    fn yield_now(&self);
}

static EXECUTIVE: Once<&'static dyn Executive> = Once::new();

/// Installs the executive. The first call wins; returns whether this one
/// did.
pub fn install(executive: &'static dyn Executive) -> bool {
    let mut installed = false;
    EXECUTIVE.call_once(|| {
        installed = true;
        executive
    });
    installed
}

/// The installed executive.
///
/// Blocking before one is installed is a kernel bug.
pub fn executive() -> &'static dyn Executive {
    match EXECUTIVE.get() {
        Some(executive) => *executive,
        None => panic!("blocking lock used before an executive was installed"),
    }
}

/// Yields through the executive if there is one. Returns whether it did.
pub(crate) fn yield_now() -> bool {
    match EXECUTIVE.get() {
        Some(executive) => {
            executive.yield_now();
            true
        }
        None => false,
    }
}

/// Id of the calling thread.
pub fn current_thread() -> ThreadId {
    executive().current()
}

#[derive(Debug)]
#[repr(C)]
struct WaitLink {
    next: Cell<*const WaitLink>,
    prev: Cell<*const WaitLink>,
}

impl WaitLink {
    const fn unlinked() -> Self {
        Self {
            next: Cell::new(ptr::null()),
            prev: Cell::new(ptr::null()),
        }
    }
}

/// One blocked thread's entry on a wait chain.
#[derive(Debug)]
#[repr(C)]
pub struct Waiter {
    // Must stay first: chain pointers are cast back to `Waiter`.
    link: WaitLink,
    thread: AtomicU32,
    ticket: Cell<u64>,
}

impl Waiter {
    pub const fn new() -> Self {
        Self {
            link: WaitLink::unlinked(),
            thread: AtomicU32::new(ThreadId::NONE_RAW),
            ticket: Cell::new(0),
        }
    }

    /// Arrival stamp, for a lock that orders waiters across two chains.
    pub fn ticket(&self) -> u64 {
        self.ticket.get()
    }

    pub fn set_ticket(&self, ticket: u64) {
        self.ticket.set(ticket);
    }

    /// Where `Executive::suspend_release` publishes the sleeper's id.
    pub fn id_slot(&self) -> &AtomicU32 {
        &self.thread
    }

    pub fn thread(&self) -> Option<ThreadId> {
        ThreadId::from_raw(self.thread.load(Ordering::Acquire))
    }

    pub fn is_linked(&self) -> bool {
        !self.link.next.get().is_null()
    }
}

impl Default for Waiter {
    fn default() -> Self {
        Self::new()
    }
}

/// FIFO of blocked threads.
#[derive(Debug)]
pub struct WaitChain {
    head: WaitLink,
}

// SAFETY: all access happens under the owning lock's spin lock.
unsafe impl Sync for WaitChain {}
unsafe impl Send for WaitChain {}

impl WaitChain {
    pub const fn new() -> Self {
        Self {
            head: WaitLink::unlinked(),
        }
    }

    fn sentinel(&self) -> *const WaitLink {
        &self.head
    }

    pub fn is_empty(&self) -> bool {
        let next = self.head.next.get();
        next.is_null() || next == self.sentinel()
    }

    /// Appends `waiter`.
    ///
    /// # Safety
    /// The caller holds the owning spin lock, `waiter` is not on any chain,
    /// and `waiter` stays valid and unmoved until it has been popped.
    pub unsafe fn push_back(&self, waiter: &Waiter) {
        let head = self.sentinel();
        if self.head.next.get().is_null() {
            self.head.next.set(head);
            self.head.prev.set(head);
        }

        let node = &waiter.link as *const WaitLink;
        let tail = self.head.prev.get();
        waiter.link.next.set(head);
        waiter.link.prev.set(tail);
        // SAFETY: `tail` is the sentinel or a linked, live waiter.
        unsafe { (*tail).next.set(node) };
        self.head.prev.set(node);
    }

    /// Unlinks the oldest waiter and returns the id it published.
    ///
    /// # Safety
    /// The caller holds the owning spin lock.
    pub unsafe fn pop_front(&self) -> Option<ThreadId> {
        if self.is_empty() {
            return None;
        }

        let node = self.head.next.get();
        // SAFETY: a non-empty chain links only live waiters, and `WaitLink`
        // is the first field of the `repr(C)` `Waiter`.
        let waiter = unsafe { &*(node as *const Waiter) };
        let next = waiter.link.next.get();

        self.head.next.set(next);
        if next == self.sentinel() {
            self.head.next.set(ptr::null());
            self.head.prev.set(ptr::null());
        } else {
            // SAFETY: `next` is a linked, live waiter.
            unsafe { (*next).prev.set(self.sentinel()) };
        }

        waiter.link.next.set(ptr::null());
        waiter.link.prev.set(ptr::null());

        let id = waiter.thread();
        assert!(id.is_some(), "wait chain: waiter never published its id");
        id
    }

    /// Ticket of the oldest waiter, without unlinking it.
    ///
    /// # Safety
    /// The caller holds the owning spin lock.
    pub unsafe fn front_ticket(&self) -> Option<u64> {
        if self.is_empty() {
            return None;
        }
        // SAFETY: as in `pop_front`.
        let waiter = unsafe { &*(self.head.next.get() as *const Waiter) };
        Some(waiter.ticket())
    }

    /// Number of queued waiters. O(n); diagnostics only.
    ///
    /// # Safety
    /// The caller holds the owning spin lock.
    pub unsafe fn len(&self) -> usize {
        if self.is_empty() {
            return 0;
        }
        let mut n = 0;
        let mut cur = self.head.next.get();
        while cur != self.sentinel() {
            n += 1;
            // SAFETY: every linked node is live.
            cur = unsafe { (*cur).next.get() };
        }
        n
    }
}

impl Default for WaitChain {
    fn default() -> Self {
        Self::new()
    }
}

/// Queues the calling thread on `chain` and suspends it, releasing `lock`.
/// Returns once someone has popped it and resumed it.
///
/// `lock` must be held via `lock_noirq`.
pub(crate) fn block_on(chain: &WaitChain, lock: &RawSpinLock) {
    suspend_on(chain, lock, 0, || {});
}

/// Like [`block_on`], stamping the waiter with `ticket` so the owner can
/// tell it apart from waiters on a sibling chain.
pub(crate) fn block_on_ordered(chain: &WaitChain, lock: &RawSpinLock, ticket: u64) {
    suspend_on(chain, lock, ticket, || {});
}

/// Like [`block_on`], but runs `queued` after the caller is on the chain
/// and before it suspends. A wakeup issued from then on is not lost as
/// long as the waker has to take `lock` first.
pub(crate) fn block_on_then(chain: &WaitChain, lock: &RawSpinLock, queued: impl FnOnce()) {
    suspend_on(chain, lock, 0, queued);
}

fn suspend_on(chain: &WaitChain, lock: &RawSpinLock, ticket: u64, queued: impl FnOnce()) {
    let waiter = Waiter::new();
    waiter.set_ticket(ticket);
    let executive = executive();
    waiter.id_slot().store(executive.current().to_raw(), Ordering::Release);
    // SAFETY: we hold `lock`, and `waiter` outlives the suspension: it is
    // only popped by a waker holding `lock`, who then resumes us.
    unsafe { chain.push_back(&waiter) };
    queued();
    executive.suspend_release(lock, waiter.id_slot());
    debug_assert!(!waiter.is_linked());
}

/// Pops the oldest waiter and resumes it. Returns its id.
///
/// # Safety
/// The caller holds the chain's spin lock.
pub(crate) unsafe fn wake_front(chain: &WaitChain) -> Option<ThreadId> {
    // SAFETY: forwarded.
    let id = unsafe { chain.pop_front() }?;
    executive().resume(id);
    Some(id)
}
