//! Hardware Abstraction Layer.
//!
//! Everything the scheduler needs from an x86_64 CPU: the local APIC
//! (timer, EOI, inter-processor interrupts), a handful of privileged
//! instructions, and COM1 for log output.
#![no_std]

#[cfg(target_arch = "x86_64")]
pub mod apic;
#[cfg(target_arch = "x86_64")]
pub mod cpu;
#[cfg(target_arch = "x86_64")]
pub mod serial;

#[cfg(target_arch = "x86_64")]
pub use serial::Serial;
