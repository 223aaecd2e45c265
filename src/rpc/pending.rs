//! Pending request table
//!
//! Maps request ids to one-shot completion slots. The id counter and the table
//! live behind a single mutex, so id allocation, registration, completion and
//! removal are serialized against each other.

use crate::rpc::error::TransportError;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::oneshot;

/// What a waiter eventually receives
pub type Outcome = Result<Value, TransportError>;

#[derive(Debug)]
struct PendingInner {
    next_id: u64,
    waiters: HashMap<u64, oneshot::Sender<Outcome>>,
}

/// Table of in-flight requests
#[derive(Debug)]
pub struct PendingRequests {
    inner: Mutex<PendingInner>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PendingInner {
                next_id: 1,
                waiters: HashMap::new(),
            }),
        }
    }

    /// Allocate the next id and register a waiter for it
    pub fn register(&self) -> (u64, oneshot::Receiver<Outcome>) {
        let (sender, receiver) = oneshot::channel();
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.waiters.insert(id, sender);
        (id, receiver)
    }

    /// Fill the slot for `id`. Returns false if no such request is pending
    /// (unknown, timed out, or already completed).
    pub fn complete(&self, id: u64, outcome: Outcome) -> bool {
        let sender = self.inner.lock().waiters.remove(&id);
        match sender {
            // A dropped receiver means the caller went away; nothing to deliver
            Some(sender) => sender.send(outcome).is_ok(),
            None => false,
        }
    }

    /// Remove a waiter without filling it
    pub fn cancel(&self, id: u64) -> bool {
        self.inner.lock().waiters.remove(&id).is_some()
    }

    /// Complete every outstanding waiter with an error built by `error`.
    /// Returns how many waiters were failed.
    pub fn fail_all(&self, error: impl Fn() -> TransportError) -> usize {
        let drained: Vec<_> = self.inner.lock().waiters.drain().collect();
        let count = drained.len();
        for (_, sender) in drained {
            let _ = sender.send(Err(error()));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes a pending entry when a request future is dropped before completion
pub struct PendingGuard<'a> {
    pending: &'a PendingRequests,
    id: u64,
    armed: bool,
}

impl<'a> PendingGuard<'a> {
    pub fn new(pending: &'a PendingRequests, id: u64) -> Self {
        Self {
            pending,
            id,
            armed: true,
        }
    }

    /// The entry was consumed by the read loop or teardown
    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pending.cancel(self.id);
        }
    }
}
