//! The unit of work: writes one `WriteBatch` through a `HostClient`, runs
//! success/failure callbacks, and closes closeable document handles.

use crate::host_client::HostClient;
use crate::listener::{dispatch_failure, dispatch_success, BatchListener};
use crate::types::WriteBatch;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// An optional hook run immediately before the batch is written.
pub type BeforeWriteHook = Arc<dyn Fn(&WriteBatch) + Send + Sync>;

/// Rewrites a transport error message before it reaches failure listeners,
/// used by failover to mark resubmitted batches as retry failures rather
/// than plain transport failures.
pub type ErrorWrap = Arc<dyn Fn(String) -> String + Send + Sync>;

pub struct BatchTask {
    batch: WriteBatch,
    client: Arc<dyn HostClient>,
    success_listeners: Vec<Arc<dyn BatchListener>>,
    failure_listeners: Vec<Arc<dyn BatchListener>>,
    on_before_write: Option<BeforeWriteHook>,
    error_wrap: Option<ErrorWrap>,
    items_so_far: Option<Arc<AtomicU64>>,
}

impl BatchTask {
    pub fn new(
        batch: WriteBatch,
        client: Arc<dyn HostClient>,
        success_listeners: Vec<Arc<dyn BatchListener>>,
        failure_listeners: Vec<Arc<dyn BatchListener>>,
    ) -> Self {
        assert!(!batch.ops.is_empty(), "BatchTask constructed with zero ops");
        Self {
            batch,
            client,
            success_listeners,
            failure_listeners,
            on_before_write: None,
            error_wrap: None,
            items_so_far: None,
        }
    }

    pub fn with_before_write(mut self, hook: BeforeWriteHook) -> Self {
        self.on_before_write = Some(hook);
        self
    }

    pub fn with_items_so_far_counter(mut self, counter: Arc<AtomicU64>) -> Self {
        self.items_so_far = Some(counter);
        self
    }

    pub fn batch_number(&self) -> u64 {
        self.batch.batch_number
    }

    pub fn host(&self) -> &crate::types::HostRef {
        &self.batch.host
    }

    /// Rebuild this task against a different host/client, keeping the
    /// original batch number and ops, for failover resubmission.
    /// `error_wrap`, when set, rewrites a transport failure message so the
    /// caller can distinguish "retry also failed" from a plain
    /// first-attempt failure.
    pub fn rebuilt_for(
        self,
        client: Arc<dyn HostClient>,
        new_host: crate::types::HostRef,
        on_before_write: Option<BeforeWriteHook>,
        error_wrap: Option<ErrorWrap>,
    ) -> Self {
        let mut batch = self.batch;
        batch.host = new_host;
        Self {
            batch,
            client,
            success_listeners: self.success_listeners,
            failure_listeners: self.failure_listeners,
            on_before_write,
            error_wrap,
            items_so_far: self.items_so_far,
        }
    }

    pub fn into_batch(self) -> WriteBatch {
        self.batch
    }

    /// Execute the batch. Errors never propagate to the caller: a failed
    /// write is routed to failure listeners instead of crossing back to the
    /// producer.
    pub async fn run(self) {
        let BatchTask {
            batch,
            client,
            success_listeners,
            failure_listeners,
            on_before_write,
            error_wrap,
            items_so_far,
        } = self;

        if let Some(hook) = &on_before_write {
            hook(&batch);
        }

        let write_result = if let Some(temporal) = &batch.temporal_collection {
            client.write_temporal(&batch, temporal).await
        } else {
            client.write(&batch).await
        };

        let mut close_err: Option<String> = None;
        for op in &batch.ops {
            if let Err(e) = op.close_handles() {
                close_err = Some(e.0);
            }
        }

        let wrap = |err: String| match &error_wrap {
            Some(f) => f(err),
            None => err,
        };

        match write_result {
            Ok(()) if close_err.is_none() => {
                let written = batch.real_op_count();
                if let Some(counter) = &items_so_far {
                    counter.fetch_add(written as u64, Ordering::SeqCst);
                }
                let failures = dispatch_success(&success_listeners, &batch, written);
                if failures > 0 {
                    tracing::debug!(batch_number = batch.batch_number, failures, "some success listeners raised");
                }
            }
            Ok(()) => {
                let err = wrap(close_err.unwrap());
                tracing::warn!(batch_number = batch.batch_number, error = %err, "batch written but closing handles failed");
                dispatch_failure(&failure_listeners, &batch, &err);
            }
            Err(err) => {
                let err = wrap(err);
                tracing::warn!(batch_number = batch.batch_number, host = %batch.host, error = %err, "batch write failed");
                dispatch_failure(&failure_listeners, &batch, &err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host_client::MockHostClient;
    use crate::listener::FnListener;
    use crate::types::{HostRef, OpType, WriteOp};
    use std::sync::atomic::AtomicBool;

    fn batch(ops: usize) -> WriteBatch {
        WriteBatch {
            batch_number: 1,
            host: HostRef("h".into()),
            ops: (0..ops)
                .map(|i| WriteOp::write(format!("u{i}"), OpType::Create, None, None))
                .collect(),
            transform: None,
            temporal_collection: None,
        }
    }

    #[test]
    #[should_panic(expected = "zero ops")]
    fn zero_op_batch_task_refuses_to_be_constructed() {
        let client = MockHostClient::new("h");
        let _ = BatchTask::new(
            WriteBatch {
                batch_number: 1,
                host: HostRef("h".into()),
                ops: vec![],
                transform: None,
                temporal_collection: None,
            },
            client,
            vec![],
            vec![],
        );
    }

    #[tokio::test]
    async fn success_dispatches_to_success_listener_and_advances_counter() {
        let client = MockHostClient::new("h");
        let counter = Arc::new(AtomicU64::new(0));
        let saw_success = Arc::new(AtomicBool::new(false));
        let saw_success2 = saw_success.clone();

        let listener = FnListener::new(
            move |_b: &WriteBatch, n: usize| {
                assert_eq!(n, 2);
                saw_success2.store(true, Ordering::SeqCst);
            },
            |_b, _e| panic!("failure listener should not fire"),
        );

        let task = BatchTask::new(batch(2), client, vec![listener.clone()], vec![listener])
            .with_items_so_far_counter(counter.clone());
        task.run().await;

        assert!(saw_success.load(Ordering::SeqCst));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failure_dispatches_to_failure_listener_without_advancing_counter() {
        let client = MockHostClient::new("h");
        client.fail_next(1);
        let counter = Arc::new(AtomicU64::new(0));
        let saw_failure = Arc::new(AtomicBool::new(false));
        let saw_failure2 = saw_failure.clone();

        let listener = FnListener::new(
            |_b, _n| panic!("success listener should not fire"),
            move |_b: &WriteBatch, _e: &str| {
                saw_failure2.store(true, Ordering::SeqCst);
            },
        );

        let task = BatchTask::new(batch(1), client, vec![listener.clone()], vec![listener])
            .with_items_so_far_counter(counter.clone());
        task.run().await;

        assert!(saw_failure.load(Ordering::SeqCst));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn second_success_listener_still_runs_when_first_errors() {
        let client = MockHostClient::new("h");
        let count = Arc::new(AtomicU64::new(0));
        let count2 = count.clone();

        struct Bad;
        impl BatchListener for Bad {
            fn on_success(&self, _b: &WriteBatch, _n: usize) -> Result<(), String> {
                Err("boom".to_string())
            }
            fn on_failure(&self, _b: &WriteBatch, _e: &str) -> Result<(), String> {
                Ok(())
            }
        }

        let good = FnListener::new(
            move |_b: &WriteBatch, _n: usize| {
                count2.fetch_add(1, Ordering::SeqCst);
            },
            |_b, _e| {},
        );

        let task = BatchTask::new(batch(1), client, vec![Arc::new(Bad), good], vec![]);
        task.run().await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn error_wrap_rewrites_failure_message_for_failover_retries() {
        let client = MockHostClient::new("h");
        client.fail_next(1);
        let seen = Arc::new(std::sync::Mutex::new(String::new()));
        let seen2 = seen.clone();

        let listener = FnListener::new(
            |_b, _n| panic!("success listener should not fire"),
            move |_b: &WriteBatch, e: &str| {
                *seen2.lock().unwrap() = e.to_string();
            },
        );

        let failing_client = MockHostClient::new("h2");
        failing_client.fail_next(1);
        let wrap: ErrorWrap = Arc::new(|e| format!("retry failed: {e}"));
        let task = BatchTask::new(batch(1), client, vec![], vec![listener])
            .rebuilt_for(failing_client, HostRef("h2".into()), None, Some(wrap));
        task.run().await;

        assert!(seen.lock().unwrap().starts_with("retry failed:"));
    }
}
