//! Errors the thread API reports to its callers.
//!
//! Invariant violations are not errors: they panic. Table exhaustion is
//! not an error either; creation waits for a slot.

use core::fmt;

use crate::thread::ThreadId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadError {
    /// Requested stack is below `MIN_STACK_SIZE`.
    StackTooSmall { size: usize },
    /// The platform could not provide a stack.
    StackAllocation { size: usize },
    /// The id does not name a live thread (never created, recycled, or
    /// detached).
    InvalidThread(ThreadId),
    /// The thread has not finished.
    NotFinished,
}

impl fmt::Display for ThreadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StackTooSmall { size } => write!(f, "stack of {size} bytes is too small"),
            Self::StackAllocation { size } => write!(f, "could not allocate a {size} byte stack"),
            Self::InvalidThread(id) => write!(f, "{id} is not a live thread"),
            Self::NotFinished => f.write_str("thread has not finished"),
        }
    }
}

impl core::error::Error for ThreadError {}

pub type Result<T, E = ThreadError> = core::result::Result<T, E>;
