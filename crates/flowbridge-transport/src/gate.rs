//! [`CallbackGate`] – tracks bus callbacks currently running into an element.
//!
//! A bus may invoke a subscription callback from its own thread right up to
//! the moment the subscription is cancelled, and a callback that already
//! started keeps running after that.  The subscriber closes its gate on
//! destruction and waits for the permits still out; late callbacks find the
//! gate closed and return without touching the element.
//!
//! Closing from inside a callback (the consumer tears the stream down from
//! its own notification) does not wait for the caller's own permit.

use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct GateState {
    /// Thread of every outstanding permit.
    holders: Vec<ThreadId>,
    closed: bool,
}

#[derive(Debug, Default)]
pub struct CallbackGate {
    state: Mutex<GateState>,
    idle: Condvar,
}

impl CallbackGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit one callback.  `None` once the gate is closed.
    pub fn enter(&self) -> Option<GatePermit<'_>> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        let holder = thread::current().id();
        state.holders.push(holder);
        Some(GatePermit { gate: self, holder })
    }

    /// Refuse further callbacks and block until the admitted ones are done.
    ///
    /// Permits held by the calling thread are not waited for.
    pub fn close_and_wait(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        state.closed = true;
        while state.holders.iter().any(|holder| *holder != me) {
            self.idle.wait(&mut state);
        }
    }

    /// Number of callbacks currently admitted.
    pub fn active(&self) -> usize {
        self.state.lock().holders.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

/// Held for the duration of one callback.
#[derive(Debug)]
pub struct GatePermit<'a> {
    gate: &'a CallbackGate,
    holder: ThreadId,
}

impl Drop for GatePermit<'_> {
    fn drop(&mut self) {
        let mut state = self.gate.state.lock();
        if let Some(pos) = state.holders.iter().position(|h| *h == self.holder) {
            state.holders.swap_remove(pos);
        }
        self.gate.idle.notify_all();
    }
}
