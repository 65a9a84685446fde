use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};

/// Attachment state of a socket to its driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetachState {
    /// Attached; zero or more threads may be processing the socket.
    Attached,
    /// Detachment requested, completion not yet schedulable because at
    /// least one thread is still processing the socket.
    Detaching,
    /// The completion has been (or should be) scheduled.
    Detached,
}

// State in the low 2 bits, processor count above.
const STATE_MASK: u64 = 0b11;
const STATE_ATTACHED: u64 = 0;
const STATE_DETACHING: u64 = 1;
const STATE_DETACHED: u64 = 2;
const COUNT_ONE: u64 = 4;

/// Reference-counted detach coordinator.
///
/// Every code path that touches the socket brackets its work with
/// [`acquire`](Self::acquire)/[`release`](Self::release). The thread whose
/// `release` observes the detach request with no remaining processors is
/// the one (and only one) told to schedule the completion.
#[derive(Debug)]
pub struct DetachContext {
    value: AtomicU64,
}

impl Default for DetachContext {
    fn default() -> Self {
        Self::new()
    }
}

impl DetachContext {
    pub fn new() -> Self {
        Self { value: AtomicU64::new(STATE_ATTACHED) }
    }

    /// Increments the processor count and returns true iff the socket was
    /// attached at acquisition. The count is incremented either way; the
    /// caller must pair this with [`release`](Self::release) even when
    /// denied.
    pub fn acquire(&self) -> bool {
        let prior = self.value.fetch_add(COUNT_ONE, Ordering::AcqRel);
        prior & STATE_MASK == STATE_ATTACHED
    }

    /// Decrements the processor count. Returns true iff this release took
    /// the socket from detaching to detached, in which case the caller must
    /// schedule the detach completion on the socket's strand.
    pub fn release(&self) -> bool {
        let mut current = self.value.load(Ordering::Acquire);
        loop {
            debug_assert!(current >= COUNT_ONE, "release without acquire");
            let state = current & STATE_MASK;
            let count = current >> 2;

            let announce = state == STATE_DETACHING && count == 1;
            let next = if announce {
                STATE_DETACHED
            } else {
                ((count - 1) << 2) | state
            };

            match self.value.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return announce,
                Err(observed) => current = observed,
            }
        }
    }

    /// Requests detachment. `Ok(())` means the socket is detached right now
    /// and the caller must schedule the completion itself; `WouldBlock`
    /// means threads are still processing and the last one out will
    /// schedule it; `Invalid` means detachment was already requested.
    pub fn request(&self) -> Result<()> {
        let mut current = self.value.load(Ordering::Acquire);
        loop {
            if current & STATE_MASK != STATE_ATTACHED {
                return Err(Error::Invalid);
            }
            let count = current >> 2;
            let next =
                if count == 0 { STATE_DETACHED } else { (count << 2) | STATE_DETACHING };

            match self.value.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return if count == 0 { Ok(()) } else { Err(Error::WouldBlock) };
                }
                Err(observed) => current = observed,
            }
        }
    }

    pub fn state(&self) -> DetachState {
        match self.value.load(Ordering::Acquire) & STATE_MASK {
            STATE_ATTACHED => DetachState::Attached,
            STATE_DETACHING => DetachState::Detaching,
            _ => DetachState::Detached,
        }
    }

    /// Number of threads currently processing the socket.
    pub fn processors(&self) -> u64 {
        self.value.load(Ordering::Acquire) >> 2
    }
}
