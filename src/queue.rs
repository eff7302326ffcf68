//! Unbounded multi-producer queue of `WriteOp`, supporting atomic drain.

use crate::types::WriteOp;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// A `parking_lot::Mutex`-guarded `VecDeque`: a short synchronous critical
/// section, never held across an await point. This gives practical
/// non-blocking behavior (no method ever suspends while holding the lock)
/// without reaching for a lock-free queue.
pub struct PendingQueue {
    inner: Mutex<VecDeque<WriteOp>>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
        }
    }

    /// Append one op. Never blocks beyond the brief critical section.
    pub fn push(&self, op: WriteOp) {
        self.inner.lock().push_back(op);
    }

    /// Pop up to `n` ops, in FIFO order. Returns fewer if the queue is
    /// shorter (a concurrent producer may not have finished appending yet).
    pub fn pop_up_to(&self, n: usize) -> Vec<WriteOp> {
        let mut guard = self.inner.lock();
        let take = n.min(guard.len());
        guard.drain(..take).collect()
    }

    /// Atomically take every op currently in the queue and leave it empty.
    /// Concurrent `push` calls that begin after this returns are not
    /// included; pushes that raced with (but completed before) the lock
    /// acquisition are included, since they are indistinguishable from
    /// ones that arrived slightly earlier.
    pub fn drain(&self) -> Vec<WriteOp> {
        let mut guard = self.inner.lock();
        guard.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl Default for PendingQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OpType;

    fn op(uri: &str) -> WriteOp {
        WriteOp::write(uri, OpType::Create, None, None)
    }

    #[test]
    fn drain_empties_and_returns_all() {
        let q = PendingQueue::new();
        q.push(op("a"));
        q.push(op("b"));
        q.push(op("c"));

        let drained = q.drain();
        assert_eq!(drained.len(), 3);
        assert!(q.is_empty());
    }

    #[test]
    fn pop_up_to_tolerates_short_queue() {
        let q = PendingQueue::new();
        q.push(op("a"));

        let popped = q.pop_up_to(5);
        assert_eq!(popped.len(), 1);
        assert!(q.is_empty());
    }

    #[test]
    fn drain_then_push_does_not_resurrect_drained_items() {
        let q = PendingQueue::new();
        q.push(op("a"));
        let first = q.drain();
        q.push(op("b"));
        let second = q.drain();

        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
    }
}
