//! Blocking signal primitive for the producer/consumer handoff.

use std::sync::{Condvar, Mutex, PoisonError};

/// A manual-reset, level-persisting signal.
///
/// Once [`set`](Signal::set), every [`wait`](Signal::wait) returns
/// immediately until someone calls [`clear`](Signal::clear). This is the
/// edge/level hybrid the ring buffer handoff needs: the producer sets it
/// after publishing a position, the consumer clears it only once fully
/// drained, and a set that races a clear is resolved by the caller
/// re-checking positions after the clear (both operations take the same
/// internal lock, so the orders are totally observable).
#[derive(Default)]
pub struct Signal {
    state: Mutex<bool>,
    cond: Condvar,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the signal and wakes all waiters.
    pub fn set(&self) {
        let mut raised = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        *raised = true;
        self.cond.notify_all();
    }

    /// Lowers the signal; future waits block until the next `set`.
    pub fn clear(&self) {
        let mut raised = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        *raised = false;
    }

    /// Non-blocking probe of the current level.
    pub fn is_set(&self) -> bool {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until the signal is raised. Returns immediately if it
    /// already is.
    pub fn wait(&self) {
        let mut raised = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        while !*raised {
            raised = self
                .cond
                .wait(raised)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}
