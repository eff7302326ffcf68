//! Listener capability for batch success/failure notification.

use crate::types::WriteBatch;
use std::sync::Arc;

/// A listener notified when a batch succeeds or fails.
///
/// An `Err` returned from a listener is caught and logged at the dispatch
/// site, never propagated, so one faulty listener cannot prevent others from
/// running or fail the batch itself.
pub trait BatchListener: Send + Sync {
    /// Called once per successful batch, after `items_so_far` has advanced.
    fn on_success(&self, batch: &WriteBatch, items_written: usize) -> Result<(), String>;

    /// Called once per failed batch.
    fn on_failure(&self, batch: &WriteBatch, error: &str) -> Result<(), String>;
}

/// A listener built from a pair of closures, split into two hooks since the
/// coordinator needs distinct success and failure paths rather than a
/// single error callback.
pub struct FnListener<S, F>
where
    S: Fn(&WriteBatch, usize) + Send + Sync,
    F: Fn(&WriteBatch, &str) + Send + Sync,
{
    on_success: S,
    on_failure: F,
}

impl<S, F> FnListener<S, F>
where
    S: Fn(&WriteBatch, usize) + Send + Sync,
    F: Fn(&WriteBatch, &str) + Send + Sync,
{
    pub fn new(on_success: S, on_failure: F) -> Arc<Self> {
        Arc::new(Self {
            on_success,
            on_failure,
        })
    }
}

impl<S, F> BatchListener for FnListener<S, F>
where
    S: Fn(&WriteBatch, usize) + Send + Sync,
    F: Fn(&WriteBatch, &str) + Send + Sync,
{
    fn on_success(&self, batch: &WriteBatch, items_written: usize) -> Result<(), String> {
        (self.on_success)(batch, items_written);
        Ok(())
    }

    fn on_failure(&self, batch: &WriteBatch, error: &str) -> Result<(), String> {
        (self.on_failure)(batch, error);
        Ok(())
    }
}

/// Dispatch a batch outcome to every listener, catching and logging any
/// error a listener returns so it cannot break the others or fail the
/// batch. Returns the count of listeners that raised, purely for tests.
pub(crate) fn dispatch_success(
    listeners: &[Arc<dyn BatchListener>],
    batch: &WriteBatch,
    items_written: usize,
) -> usize {
    let mut failures = 0;
    for listener in listeners {
        if let Err(e) = listener.on_success(batch, items_written) {
            failures += 1;
            tracing::warn!(error = %e, batch_number = batch.batch_number, "success listener raised, continuing");
        }
    }
    failures
}

pub(crate) fn dispatch_failure(
    listeners: &[Arc<dyn BatchListener>],
    batch: &WriteBatch,
    error: &str,
) -> usize {
    let mut failures = 0;
    for listener in listeners {
        if let Err(e) = listener.on_failure(batch, error) {
            failures += 1;
            tracing::warn!(error = %e, batch_number = batch.batch_number, "failure listener raised, continuing");
        }
    }
    failures
}
