// =============================================================================
// MinimalOS NextGen — Kernel Synchronization Primitives
// =============================================================================
//
// Two layers:
//
//   Spin layer (never suspends, usable from interrupt handlers when taken
//   with the `_noirq` variants):
//     spinlock:  test-and-set, prior IRQ state kept in the lock word
//     ticket:    FIFO, prior IRQ state kept in `now_serving` bit 0
//     mcs:       FIFO queue lock, each waiter spins on its own node
//     rwspin:    readers/writer with a writer-pending bit
//
//   Blocking layer (may suspend the caller, never from interrupt context):
//     mutex, rwlock, condvar: FIFO wait chains serviced head first
//
// Lock ordering:
//   Level 1 (innermost): a blocking lock's protecting spin lock
//   Level 2: a TCB's `lock` mutex
//   Level 3: caller-defined locks
//
// A blocking lock's protecting spin lock is only ever held across wait
// chain manipulation and the suspend-and-release step. Never call into
// anything that may suspend while holding a spin lock.
// =============================================================================

pub mod backoff;
pub mod condvar;
pub mod mcs;
pub mod mutex;
pub mod rwlock;
pub mod rwspin;
pub mod spinlock;
pub mod ticket;
pub mod wait;

pub use backoff::{Backoff, SpinTuner};
pub use condvar::Condvar;
pub use mcs::{McsGuard, McsLock, McsNode};
pub use mutex::{Mutex, MutexGuard, RawMutex};
pub use rwlock::{RawRwLock, RwLock, RwLockReadGuard, RwLockWriteGuard};
pub use rwspin::{RawRwSpinLock, RwSpinLock, RwSpinReadGuard, RwSpinWriteGuard};
pub use spinlock::{RawSpinLock, SpinLock, SpinLockGuard};
pub use ticket::{RawTicketLock, TicketLock, TicketLockGuard};
pub use wait::{Executive, WaitChain, Waiter};
