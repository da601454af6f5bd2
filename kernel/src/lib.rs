// =============================================================================
// MinimalOS NextGen — SMP Scheduler
// =============================================================================
//
// Layers, innermost first:
//
//   atomic   word-sized atomic helpers and the PAUSE hint
//   sync     spin locks (exclusive, ticket, MCS, reader/writer) and blocking
//            locks (mutex, rwlock, condition variable)
//   thread   thread control blocks and their fixed table
//   cpu      per-CPU control blocks and CPU-local storage
//   sched    the scheduler: dispatch, lifecycle, sleep, suspend/resume
//   smp      application processor bring-up
//   arch     the hardware seam, and its x86_64 implementation
//
// The blocking locks reach the scheduler only through `sync::wait::Executive`,
// so they can be tested on the host against OS threads.
// =============================================================================

#![cfg_attr(not(test), no_std)]

pub mod arch;
pub mod atomic;
pub mod config;
pub mod cpu;
pub mod error;
#[cfg(all(feature = "panic-handler", target_os = "none", not(test)))]
mod panic;
pub mod sched;
pub mod smp;
pub mod sync;
pub mod thread;

#[cfg(test)]
mod testing;

pub use arch::{IpiTarget, Platform, Stack, ThreadFn};
pub use config::SchedConfig;
pub use error::{Result, ThreadError};
pub use sched::{ContextPtr, Hooks, PostSwitch, Scheduler, SwitchResult};
pub use smp::{ApStartup, Topology};
pub use thread::{ThreadFlags, ThreadId, ThreadOptions, ThreadState};
