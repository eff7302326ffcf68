//! Bounded worker pool that tracks in-flight `BatchTask`s so a waiter can
//! block until a snapshot of previously-submitted work has drained.

use crate::task::BatchTask;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};

/// Stable identity of a submitted `BatchTask`, used as the active-set and
/// snapshot map key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct WaiterId(u64);

/// Per-task completion state: one condition-variable-like primitive per
/// task, giving each submitted task its own wakeup list since several
/// waiters may be blocked on `await_completion` at once.
#[derive(Default)]
struct TaskCompletion {
    waiters: Vec<oneshot::Sender<()>>,
}

/// Configuration for [`CompletionPool`].
#[derive(Clone, Debug)]
pub struct CompletionPoolConfig {
    pub thread_count: usize,
    pub queue_capacity: usize,
    /// Kept for interface fidelity with the original thread-pool idle
    /// timeout parameter; has no effect here since workers are long-lived
    /// tokio tasks parked on a `Notify` rather than OS threads that could
    /// go idle and be reclaimed.
    pub idle_timeout: Duration,
}

impl CompletionPoolConfig {
    pub fn new(thread_count: usize) -> Self {
        let thread_count = thread_count.max(1);
        Self {
            thread_count,
            queue_capacity: thread_count * 3,
            idle_timeout: Duration::from_secs(60),
        }
    }
}

struct QueueState {
    queue: VecDeque<(TaskId, BatchTask)>,
    capacity: usize,
    shutdown: bool,
}

/// A bounded worker pool for [`BatchTask`]s with a caller-runs saturation
/// policy and snapshot-based completion tracking.
///
/// `thread_count` long-lived worker loops pull from a bounded internal
/// queue (capacity `queue_capacity`); once that queue is full the
/// submitting caller executes the batch inline instead (caller-runs).
pub struct CompletionPool {
    config: CompletionPoolConfig,
    state: Mutex<QueueState>,
    notify: Notify,
    active: Mutex<HashSet<TaskId>>,
    completions: Mutex<HashMap<TaskId, Arc<Mutex<TaskCompletion>>>>,
    snapshots: Mutex<HashMap<WaiterId, HashSet<TaskId>>>,
    next_task_id: AtomicU64,
    next_waiter_id: AtomicU64,
}

impl CompletionPool {
    pub fn new(config: CompletionPoolConfig) -> Arc<Self> {
        let pool = Arc::new(Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                capacity: config.queue_capacity,
                shutdown: false,
            }),
            notify: Notify::new(),
            active: Mutex::new(HashSet::new()),
            completions: Mutex::new(HashMap::new()),
            snapshots: Mutex::new(HashMap::new()),
            next_task_id: AtomicU64::new(0),
            next_waiter_id: AtomicU64::new(0),
            config,
        });

        for _ in 0..pool.config.thread_count {
            let worker = Arc::clone(&pool);
            tokio::spawn(async move { worker.worker_loop().await });
        }

        pool
    }

    pub fn config(&self) -> &CompletionPoolConfig {
        &self.config
    }

    async fn worker_loop(self: Arc<Self>) {
        loop {
            let notified = self.notify.notified();
            let item = {
                let mut state = self.state.lock();
                state.queue.pop_front()
            };
            match item {
                Some((id, task)) => {
                    task.run().await;
                    self.complete(id);
                }
                None => {
                    if self.state.lock().shutdown {
                        return;
                    }
                    notified.await;
                }
            }
        }
    }

    fn register(&self) -> TaskId {
        let id = TaskId(self.next_task_id.fetch_add(1, Ordering::Relaxed));
        self.active.lock().insert(id);
        self.completions
            .lock()
            .insert(id, Arc::new(Mutex::new(TaskCompletion::default())));
        id
    }

    async fn place(&self, id: TaskId, task: BatchTask) {
        enum Placement {
            Queued,
            Rejected(BatchTask),
        }

        let placement = {
            let mut state = self.state.lock();
            if !state.shutdown && state.queue.len() < state.capacity {
                state.queue.push_back((id, task));
                Placement::Queued
            } else {
                Placement::Rejected(task)
            }
        };

        match placement {
            Placement::Queued => {
                self.notify.notify_one();
            }
            Placement::Rejected(task) => {
                tracing::debug!(task_id = id.0, "completion pool saturated, running batch on caller's task");
                task.run().await;
                self.complete(id);
            }
        }
    }

    /// Submit a task. Queues it behind existing work if the pool has spare
    /// queue capacity; otherwise executes it inline on the calling task
    /// (caller-runs backpressure).
    pub async fn submit(&self, task: BatchTask) -> TaskId {
        let id = self.register();
        self.place(id, task).await;
        id
    }

    /// Register a fresh task identity without submitting it for execution
    /// yet, used by failover to mint the replacement identity before the
    /// replacement batch actually runs.
    pub fn register_for_replace(&self) -> TaskId {
        self.register()
    }

    /// Run an already-registered (via [`CompletionPool::register_for_replace`])
    /// task, honoring the same queue/caller-runs policy as `submit`.
    pub async fn run_registered(&self, id: TaskId, task: BatchTask) {
        self.place(id, task).await;
    }

    fn complete(&self, id: TaskId) {
        self.active.lock().remove(&id);
        let mut snapshots = self.snapshots.lock();
        for set in snapshots.values_mut() {
            set.remove(&id);
        }
        drop(snapshots);
        self.notify_and_drop(id);
    }

    fn notify_and_drop(&self, id: TaskId) {
        let completion = self.completions.lock().remove(&id);
        if let Some(completion) = completion {
            for waiter in completion.lock().waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }

    /// Atomically swap `old` for `new` in the active set and in every
    /// snapshot that contains `old`, then wake `old`'s waiters so they
    /// re-evaluate against the new identity.
    pub fn replace_task(&self, old: TaskId, new: TaskId) {
        let had_old = {
            let mut active = self.active.lock();
            let had = active.remove(&old);
            if had {
                active.insert(new);
            }
            had
        };
        if !had_old {
            return;
        }

        let mut snapshots = self.snapshots.lock();
        for set in snapshots.values_mut() {
            if set.remove(&old) {
                set.insert(new);
            }
        }
        drop(snapshots);

        self.notify_and_drop(old);
    }

    /// Drain every task still waiting in the internal queue (not yet
    /// started by a worker), leaving already-running work untouched. Used
    /// by failover to reassign queued-but-not-started batches; already
    /// running tasks are not preempted.
    pub fn drain_pending(&self) -> Vec<(TaskId, BatchTask)> {
        self.state.lock().queue.drain(..).collect()
    }

    /// Cancel all unstarted (queued) tasks, removing them from `active` and
    /// every snapshot and waking their waiters. Already-running tasks are
    /// left to finish.
    pub fn shutdown_now(&self) {
        let drained = {
            let mut state = self.state.lock();
            state.shutdown = true;
            state.queue.drain(..).collect::<Vec<_>>()
        };
        self.notify.notify_waiters();

        for (id, _task) in drained {
            self.active.lock().remove(&id);
            let mut snapshots = self.snapshots.lock();
            for set in snapshots.values_mut() {
                set.remove(&id);
            }
            drop(snapshots);
            self.notify_and_drop(id);
        }
    }

    /// Capture a point-in-time copy of the active set and block until every
    /// task it contained reaches a terminal state, or `timeout` elapses.
    /// Returns `true` iff the snapshot fully drained in time.
    pub async fn await_completion(&self, timeout: Option<Duration>) -> bool {
        let waiter_id = WaiterId(self.next_waiter_id.fetch_add(1, Ordering::Relaxed));
        let initial: HashSet<TaskId> = self.active.lock().iter().copied().collect();
        self.snapshots.lock().insert(waiter_id, initial);

        // Re-scan: close the window between copying `active` and registering
        // the snapshot, in case a short task finished in between.
        {
            let active = self.active.lock();
            let mut snapshots = self.snapshots.lock();
            if let Some(set) = snapshots.get_mut(&waiter_id) {
                set.retain(|id| active.contains(id));
            }
        }

        let deadline = timeout.map(|d| tokio::time::Instant::now() + d);
        let result = loop {
            let next: Option<TaskId> = {
                let snapshots = self.snapshots.lock();
                snapshots.get(&waiter_id).and_then(|s| s.iter().min().copied())
            };

            let Some(task_id) = next else {
                break true;
            };

            let rx = {
                let completions = self.completions.lock();
                completions.get(&task_id).map(|c| {
                    let (tx, rx) = oneshot::channel();
                    c.lock().waiters.push(tx);
                    rx
                })
            };

            let Some(rx) = rx else {
                // Task already completed between the snapshot scan and here.
                if let Some(set) = self.snapshots.lock().get_mut(&waiter_id) {
                    set.remove(&task_id);
                }
                continue;
            };

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, rx).await.is_err() {
                        break false;
                    }
                }
                None => {
                    let _ = rx.await;
                }
            }
        };

        self.snapshots.lock().remove(&waiter_id);
        result
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    pub fn is_active(&self, id: TaskId) -> bool {
        self.active.lock().contains(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host_client::MockHostClient;
    use crate::listener::FnListener;
    use crate::types::{HostRef, OpType, WriteBatch, WriteOp};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration as StdDuration;

    fn batch(n: u64, ops: usize) -> WriteBatch {
        WriteBatch {
            batch_number: n,
            host: HostRef("h".into()),
            ops: (0..ops)
                .map(|i| WriteOp::write(format!("u{i}"), OpType::Create, None, None))
                .collect(),
            transform: None,
            temporal_collection: None,
        }
    }

    #[tokio::test]
    async fn await_completion_true_when_snapshot_already_empty() {
        let pool = CompletionPool::new(CompletionPoolConfig::new(2));
        assert!(pool.await_completion(Some(Duration::from_nanos(0))).await);
    }

    #[tokio::test]
    async fn await_completion_waits_for_submitted_tasks() {
        let pool = CompletionPool::new(CompletionPoolConfig::new(2));
        let client = MockHostClient::new("h");
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let listener = FnListener::new(
            move |_b: &WriteBatch, _n: usize| {
                count2.fetch_add(1, Ordering::SeqCst);
            },
            |_b, _e| {},
        );

        let task = BatchTask::new(batch(1, 2), client, vec![listener], vec![]);
        pool.submit(task).await;

        let done = pool.await_completion(Some(Duration::from_secs(5))).await;
        assert!(done);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn caller_runs_when_saturated() {
        // thread_count=1, queue_capacity=0: first task occupies the sole
        // worker for a while, leaving no room to queue the second.
        let mut cfg = CompletionPoolConfig::new(1);
        cfg.queue_capacity = 0;
        let pool = CompletionPool::new(cfg);

        let slow_client = MockHostClient::new("h");
        slow_client.set_delay(StdDuration::from_millis(200));
        let fast_client = MockHostClient::new("h");

        let slow_task = BatchTask::new(batch(1, 1), slow_client, vec![], vec![]);
        pool.submit(slow_task).await;
        tokio::time::sleep(StdDuration::from_millis(20)).await; // let the worker pick it up

        let fast_task = BatchTask::new(batch(2, 1), fast_client.clone(), vec![], vec![]);
        pool.submit(fast_task).await; // queue is full -> caller-runs, completes inline

        assert_eq!(fast_client.writes_attempted(), 1);
    }

    #[tokio::test]
    async fn replace_task_updates_pending_snapshot() {
        let pool = CompletionPool::new(CompletionPoolConfig::new(4));
        let old = pool.register_for_replace();
        let waiter_id = WaiterId(pool.next_waiter_id.fetch_add(1, Ordering::Relaxed));
        pool.snapshots.lock().insert(waiter_id, HashSet::from([old]));

        let new = pool.register_for_replace();
        pool.replace_task(old, new);

        let snapshot = pool.snapshots.lock().get(&waiter_id).cloned().unwrap();
        assert!(snapshot.contains(&new));
        assert!(!snapshot.contains(&old));
    }

    #[tokio::test]
    async fn drain_pending_returns_queued_not_running_tasks() {
        let mut cfg = CompletionPoolConfig::new(1);
        cfg.queue_capacity = 4;
        let pool = CompletionPool::new(cfg);

        let slow_client = MockHostClient::new("h");
        slow_client.set_delay(StdDuration::from_millis(200));
        pool.submit(BatchTask::new(batch(1, 1), slow_client, vec![], vec![])).await;
        tokio::time::sleep(StdDuration::from_millis(20)).await;

        let waiting_client = MockHostClient::new("h");
        pool.submit(BatchTask::new(batch(2, 1), waiting_client, vec![], vec![])).await;

        let drained = pool.drain_pending();
        assert_eq!(drained.len(), 1, "only the queued (not yet running) task should drain");
    }

    #[tokio::test]
    async fn shutdown_now_drops_queued_tasks_from_active_set() {
        let mut cfg = CompletionPoolConfig::new(1);
        cfg.queue_capacity = 4;
        let pool = CompletionPool::new(cfg);

        let slow_client = MockHostClient::new("h");
        slow_client.set_delay(StdDuration::from_millis(200));
        pool.submit(BatchTask::new(batch(1, 1), slow_client, vec![], vec![])).await;
        tokio::time::sleep(StdDuration::from_millis(20)).await;

        let waiting_client = MockHostClient::new("h");
        pool.submit(BatchTask::new(batch(2, 1), waiting_client, vec![], vec![])).await;

        assert_eq!(pool.active_count(), 2);
        pool.shutdown_now();
        assert_eq!(pool.active_count(), 1, "the queued task is dropped, the running one stays until it finishes");
    }
}
