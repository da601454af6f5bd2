//! Lifecycle state plus the orthogonal busy flag, packed in one byte so
//! both change in a single CAS.

use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};

/// Where a thread is in its lifecycle.
///
/// ```text
/// Uninitialized -> Initializing -> Ready | Suspended -> Running
/// Running -> Ready | Sleeping | Suspended | Destructing
/// Destructing -> Finished -> Uninitialized
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    Uninitialized = 0,
    Initializing = 1,
    Ready = 2,
    Running = 3,
    Sleeping = 4,
    Suspended = 5,
    Destructing = 6,
    Finished = 7,
}

impl ThreadState {
    const fn from_bits(bits: u8) -> Self {
        match bits {
            0 => Self::Uninitialized,
            1 => Self::Initializing,
            2 => Self::Ready,
            3 => Self::Running,
            4 => Self::Sleeping,
            5 => Self::Suspended,
            6 => Self::Destructing,
            _ => Self::Finished,
        }
    }
}

const BUSY: u8 = 0x80;

/// A state together with its busy flag.
///
/// A busy TCB is mid hand-off: the CPU that just switched away from it
/// has not yet left its stack. No other CPU may select it, and only the
/// outgoing CPU's post-switch hook clears the flag.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Status {
    pub state: ThreadState,
    pub busy: bool,
}

impl Status {
    pub const fn idle(state: ThreadState) -> Self {
        Self { state, busy: false }
    }

    pub const fn busy(state: ThreadState) -> Self {
        Self { state, busy: true }
    }

    const fn bits(self) -> u8 {
        self.state as u8 | if self.busy { BUSY } else { 0 }
    }

    const fn from_bits(bits: u8) -> Self {
        Self {
            state: ThreadState::from_bits(bits & !BUSY),
            busy: bits & BUSY != 0,
        }
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.busy {
            write!(f, "{:?}|Busy", self.state)
        } else {
            write!(f, "{:?}", self.state)
        }
    }
}

/// CAS and busy-clearing are `SeqCst`: detaching a thread races its
/// finishing CPU through a store-then-load handshake on `detached` and
/// the status.
#[derive(Debug)]
pub struct AtomicStatus(AtomicU8);

impl AtomicStatus {
    pub const fn new(status: Status) -> Self {
        Self(AtomicU8::new(status.bits()))
    }

    pub fn load(&self) -> Status {
        Status::from_bits(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, status: Status) {
        self.0.store(status.bits(), Ordering::Release);
    }

    /// Replaces `current` with `new`; on failure returns what was there.
    pub fn compare_exchange(&self, current: Status, new: Status) -> Result<Status, Status> {
        self.0
            .compare_exchange(current.bits(), new.bits(), Ordering::SeqCst, Ordering::SeqCst)
            .map(Status::from_bits)
            .map_err(Status::from_bits)
    }

    /// Clears the busy flag, whatever the state. Returns the status it
    /// left behind.
    pub fn clear_busy(&self) -> Status {
        Status::from_bits(self.0.fetch_and(!BUSY, Ordering::SeqCst) & !BUSY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_flag_is_orthogonal_to_state() {
        let s = AtomicStatus::new(Status::idle(ThreadState::Running));
        assert_eq!(
            s.compare_exchange(
                Status::idle(ThreadState::Running),
                Status::busy(ThreadState::Suspended)
            ),
            Ok(Status::idle(ThreadState::Running))
        );
        assert_eq!(s.load(), Status::busy(ThreadState::Suspended));

        // A CAS expecting the non-busy variant must not match.
        assert!(
            s.compare_exchange(
                Status::idle(ThreadState::Suspended),
                Status::idle(ThreadState::Ready)
            )
            .is_err()
        );

        assert_eq!(s.clear_busy(), Status::idle(ThreadState::Suspended));
        assert_eq!(format!("{:?}", Status::busy(ThreadState::Ready)), "Ready|Busy");
    }
}
