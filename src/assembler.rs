//! Turns a stream of `add` calls into `WriteBatch` units of size
//! `batch_size`, using an atomic sequence counter as a lock-free tie-breaker.

use crate::queue::PendingQueue;
use crate::types::WriteOp;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Sequences incoming ops into batch-sized chunks.
///
/// Uses plain atomics rather than a lock as the sole coordination mechanism
/// between concurrent producers.
pub struct BatchAssembler {
    queue: Arc<PendingQueue>,
    batch_size: u64,
    batch_counter: AtomicU64,
    batch_number: AtomicU64,
}

impl BatchAssembler {
    pub fn new(queue: Arc<PendingQueue>, batch_size: usize) -> Self {
        assert!(batch_size >= 1, "batch_size must already be clamped to >= 1");
        Self {
            queue,
            batch_size: batch_size as u64,
            batch_counter: AtomicU64::new(0),
            batch_number: AtomicU64::new(0),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size as usize
    }

    /// Append `op`. If this call's increment lands exactly on a batch
    /// boundary, exactly one caller observes `Some` and is responsible for
    /// popping and submitting the batch: `batch_counter mod batch_size == 0`
    /// as the fire predicate means exactly one caller observes the trigger
    /// for each boundary, with no lock required.
    pub fn add(&self, op: WriteOp) -> Option<(u64, Vec<WriteOp>)> {
        self.queue.push(op);
        let record_num = self.batch_counter.fetch_add(1, Ordering::SeqCst) + 1;
        if record_num % self.batch_size == 0 {
            let batch_number = self.batch_number.fetch_add(1, Ordering::SeqCst);
            let ops = self.queue.pop_up_to(self.batch_size as usize);
            Some((batch_number, ops))
        } else {
            None
        }
    }

    /// Reset the counter so the next natural batch boundary starts clean;
    /// called by `flush` after it has drained the queue.
    pub fn reset_counter(&self) {
        self.batch_counter.store(0, Ordering::SeqCst);
    }

    /// Allocate the next batch number, used by `flush` so its manually
    /// carved chunks continue the same round-robin sequence as naturally
    /// triggered batches.
    pub fn allocate_batch_number(&self) -> u64 {
        self.batch_number.fetch_add(1, Ordering::SeqCst)
    }
}
