//! The public surface: lifecycle, configuration, submission, flush,
//! quiescence, and failover re-queuing on topology change.

use crate::assembler::BatchAssembler;
use crate::error::{ConfigError, CoordinatorError};
use crate::host_client::{ForestConfiguration, HostClient};
use crate::listener::BatchListener;
use crate::pool::{CompletionPool, CompletionPoolConfig};
use crate::queue::PendingQueue;
use crate::roster::HostRoster;
use crate::task::{BatchTask, ErrorWrap};
use crate::types::{CloseHandle, HostRef, OpType, WriteBatch, WriteOp};
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex as AsyncMutex;

/// Builds a `HostClient` for a freshly-seen host name, supplied by the
/// caller so this module stays decoupled from how a real client is wired
/// up (connection pooling, auth, ...).
pub type HostClientFactory = Arc<dyn Fn(&str) -> Arc<dyn HostClient> + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Configurable,
    Running,
    Stopped,
}

#[derive(Clone)]
struct CoordinatorConfig {
    batch_size: usize,
    thread_count: Option<usize>,
    job_name: Option<String>,
    job_id: Option<String>,
    transform: Option<String>,
    temporal_collection: Option<String>,
    default_metadata: Option<CloseHandle>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            thread_count: None,
            job_name: None,
            job_id: None,
            transform: None,
            temporal_collection: None,
            default_metadata: None,
        }
    }
}

/// Aggregates single-document submissions into fixed-size batches
/// dispatched round-robin across cluster hosts.
///
/// A single live object with fluent setters and a `start`-style activation
/// boundary, rather than a builder consumed by a terminal `.build()`, since
/// configuration here is only frozen by the `Configurable -> Running`
/// transition rather than by construction.
pub struct Coordinator {
    phase: Mutex<Phase>,
    config: Mutex<CoordinatorConfig>,
    roster: Mutex<HostRoster>,
    make_client: HostClientFactory,
    reconfigure: AsyncMutex<()>,

    queue: Arc<PendingQueue>,
    assembler: Mutex<Option<Arc<BatchAssembler>>>,
    pool: Mutex<Option<Arc<CompletionPool>>>,

    success_listeners: Mutex<Vec<Arc<dyn BatchListener>>>,
    failure_listeners: Mutex<Vec<Arc<dyn BatchListener>>>,

    items_so_far: Arc<AtomicU64>,
    job_start_time: Mutex<Option<SystemTime>>,
    job_end_time: Mutex<Option<SystemTime>>,
    job_ticket: Mutex<Option<String>>,

    primary_index: AtomicUsize,
    failover_counter: AtomicU64,
}

impl Coordinator {
    /// Construct a coordinator over the hosts reported by `initial_forests`,
    /// using `make_client` to build a `HostClient` for each one.
    pub fn new(initial_forests: &dyn ForestConfiguration, make_client: HostClientFactory) -> Arc<Self> {
        let roster = HostRoster::empty().rebuild(initial_forests, |h| (make_client)(h)).roster;
        Arc::new(Self {
            phase: Mutex::new(Phase::Configurable),
            config: Mutex::new(CoordinatorConfig::default()),
            roster: Mutex::new(roster),
            make_client,
            reconfigure: AsyncMutex::new(()),
            queue: Arc::new(PendingQueue::new()),
            assembler: Mutex::new(None),
            pool: Mutex::new(None),
            success_listeners: Mutex::new(Vec::new()),
            failure_listeners: Mutex::new(Vec::new()),
            items_so_far: Arc::new(AtomicU64::new(0)),
            job_start_time: Mutex::new(None),
            job_end_time: Mutex::new(None),
            job_ticket: Mutex::new(None),
            primary_index: AtomicUsize::new(0),
            failover_counter: AtomicU64::new(0),
        })
    }

    fn require_configurable(&self) -> Result<(), ConfigError> {
        if *self.phase.lock() != Phase::Configurable {
            Err(ConfigError::AlreadyStarted)
        } else {
            Ok(())
        }
    }

    // ---- configuration setters (pre-start only) ----

    pub fn with_batch_size(&self, n: i64) -> Result<(), ConfigError> {
        self.require_configurable()?;
        let clamped = if n < 1 {
            tracing::warn!(requested = n, "batch_size must be >= 1, clamping to 1");
            1
        } else {
            n as usize
        };
        self.config.lock().batch_size = clamped;
        Ok(())
    }

    pub fn with_thread_count(&self, n: i64) -> Result<(), ConfigError> {
        self.require_configurable()?;
        let thread_count = if n < 1 {
            tracing::warn!(requested = n, "thread_count must be >= 1, defaulting to roster size at start");
            None
        } else {
            Some(n as usize)
        };
        self.config.lock().thread_count = thread_count;
        Ok(())
    }

    pub fn with_job_name(&self, name: impl Into<String>) -> Result<(), ConfigError> {
        self.require_configurable()?;
        self.config.lock().job_name = Some(name.into());
        Ok(())
    }

    pub fn with_job_id(&self, id: impl Into<String>) -> Result<(), ConfigError> {
        self.require_configurable()?;
        self.config.lock().job_id = Some(id.into());
        Ok(())
    }

    pub fn with_transform(&self, transform: impl Into<String>) -> Result<(), ConfigError> {
        self.require_configurable()?;
        self.config.lock().transform = Some(transform.into());
        Ok(())
    }

    pub fn with_temporal_collection(&self, collection: impl Into<String>) -> Result<(), ConfigError> {
        self.require_configurable()?;
        self.config.lock().temporal_collection = Some(collection.into());
        Ok(())
    }

    pub fn with_default_metadata(&self, handle: CloseHandle) -> Result<(), ConfigError> {
        self.require_configurable()?;
        self.config.lock().default_metadata = Some(handle);
        Ok(())
    }

    pub fn on_batch_success(&self, listener: Arc<dyn BatchListener>) {
        self.success_listeners.lock().push(listener);
    }

    pub fn on_batch_failure(&self, listener: Arc<dyn BatchListener>) {
        self.failure_listeners.lock().push(listener);
    }

    pub fn set_batch_success_listeners(&self, listeners: Vec<Arc<dyn BatchListener>>) -> Result<(), ConfigError> {
        self.require_configurable()?;
        *self.success_listeners.lock() = listeners;
        Ok(())
    }

    pub fn set_batch_failure_listeners(&self, listeners: Vec<Arc<dyn BatchListener>>) -> Result<(), ConfigError> {
        self.require_configurable()?;
        *self.failure_listeners.lock() = listeners;
        Ok(())
    }

    // ---- lifecycle ----

    /// Idempotent, thread-safe first-use activation (`Configurable ->
    /// Running`). Called by `start` and lazily by the first `add`/`add_all`/
    /// `flush`.
    fn initialize(&self) {
        let mut phase = self.phase.lock();
        if *phase != Phase::Configurable {
            return;
        }

        let config = self.config.lock().clone();
        let roster = self.roster.lock();
        let thread_count = config.thread_count.unwrap_or_else(|| roster.len().max(1));
        drop(roster);

        let assembler = Arc::new(BatchAssembler::new(Arc::clone(&self.queue), config.batch_size));
        let pool = CompletionPool::new(CompletionPoolConfig::new(thread_count));

        *self.assembler.lock() = Some(assembler);
        *self.pool.lock() = Some(pool);
        *self.job_start_time.lock() = Some(SystemTime::now());
        *phase = Phase::Running;
    }

    pub fn start(&self, ticket: impl Into<String>) {
        *self.job_ticket.lock() = Some(ticket.into());
        self.initialize();
    }

    pub async fn stop(&self) -> Result<(), CoordinatorError> {
        let _guard = self.reconfigure.lock().await;
        {
            let mut phase = self.phase.lock();
            if *phase == Phase::Stopped {
                return Ok(());
            }
            *phase = Phase::Stopped;
        }

        if let Some(pool) = self.pool.lock().clone() {
            pool.shutdown_now();
        }
        *self.job_end_time.lock() = Some(SystemTime::now());
        Ok(())
    }

    // ---- submission ----

    fn assembler_or_init(&self) -> Arc<BatchAssembler> {
        self.initialize();
        self.assembler.lock().clone().expect("initialize always installs an assembler")
    }

    fn require_not_stopped(&self) -> Result<(), CoordinatorError> {
        if *self.phase.lock() == Phase::Stopped {
            Err(CoordinatorError::Stopped)
        } else {
            Ok(())
        }
    }

    /// Append one op. Lazily initializes the coordinator on first call.
    /// Returns immediately unless this call happens to land on a batch
    /// boundary, in which case the new batch is submitted before returning;
    /// the only case this can block is pool saturation, where submission
    /// runs the batch inline.
    pub async fn add(&self, op: WriteOp) -> Result<(), CoordinatorError> {
        self.require_not_stopped()?;
        let assembler = self.assembler_or_init();

        if let Some((batch_number, mut ops)) = assembler.add(op) {
            if let Some(handle) = self.config.lock().default_metadata.clone() {
                ops.insert(0, WriteOp::DefaultMetadata(handle));
            }
            self.submit_batch(batch_number, ops).await;
        }
        Ok(())
    }

    pub async fn add_all(&self, ops: impl IntoIterator<Item = WriteOp>) -> Result<(), CoordinatorError> {
        for op in ops {
            self.add(op).await?;
        }
        Ok(())
    }

    /// Submit `pojo` as a document's content under `uri`. The "convertor
    /// picks a handle" step is modeled as `T`'s own `Into<CloseHandle>` impl:
    /// callers that have a richer typed value convert it themselves, which
    /// keeps POJO serialization out of this crate while still giving it a
    /// typed submission entry point alongside [`Coordinator::add`].
    pub async fn add_as<T: Into<CloseHandle>>(&self, uri: impl Into<String>, pojo: T) -> Result<(), CoordinatorError> {
        self.add(WriteOp::write(uri, OpType::Create, None, Some(pojo.into()))).await
    }

    async fn submit_batch(&self, batch_number: u64, ops: Vec<WriteOp>) {
        let real_ops = ops.iter().filter(|op| !op.is_default_metadata()).count();
        if real_ops == 0 {
            return;
        }

        let roster = self.roster.lock().clone();
        if roster.is_empty() {
            tracing::warn!(batch_number, "no hosts in roster, dropping batch");
            return;
        }
        let index = (batch_number as usize) % roster.len();
        let entry = roster.entry_at(index).expect("index computed modulo roster length").clone();

        let config = self.config.lock().clone();
        let batch = WriteBatch {
            batch_number,
            host: entry.host,
            ops,
            transform: config.transform,
            temporal_collection: config.temporal_collection,
        };

        let task = BatchTask::new(
            batch,
            entry.client,
            self.success_listeners.lock().clone(),
            self.failure_listeners.lock().clone(),
        )
        .with_items_so_far_counter(Arc::clone(&self.items_so_far));

        if let Some(pool) = self.pool.lock().clone() {
            pool.submit(task).await;
        }
    }

    /// Force submission of everything currently queued, even if it does
    /// not fill a full batch.
    pub async fn flush(&self, wait: bool) -> Result<(), CoordinatorError> {
        self.require_not_stopped()?;
        let assembler = self.assembler_or_init();

        let drained = self.queue.drain();
        assembler.reset_counter();

        let batch_size = assembler.batch_size();
        let total = drained.len();
        let mut submitted = 0usize;
        for chunk in drained.chunks(batch_size) {
            if *self.phase.lock() == Phase::Stopped {
                break;
            }
            let batch_number = assembler.allocate_batch_number();
            let mut ops = chunk.to_vec();
            submitted += ops.len();
            if let Some(handle) = self.config.lock().default_metadata.clone() {
                ops.insert(0, WriteOp::DefaultMetadata(handle));
            }
            self.submit_batch(batch_number, ops).await;
        }

        let abandoned = total - submitted;
        if abandoned > 0 {
            tracing::warn!(abandoned, "coordinator stopped during flush, dropping remaining ops");
        }

        if wait {
            self.await_completion(None).await;
        }
        Ok(())
    }

    /// Block until every task submitted before this call reaches a
    /// terminal state, or `timeout` elapses. `None` waits indefinitely.
    pub async fn await_completion(&self, timeout: Option<Duration>) -> bool {
        match self.pool.lock().clone() {
            Some(pool) => pool.await_completion(timeout).await,
            None => true,
        }
    }

    // ---- retry ----

    /// Run `batch` synchronously on the calling task. Failure listeners are
    /// suppressed; a transport error is re-raised.
    pub async fn retry(&self, batch: WriteBatch) -> Result<(), CoordinatorError> {
        self.run_retry(batch, false).await
    }

    /// Same as [`Coordinator::retry`], but failure listeners fire on error
    /// instead of being suppressed.
    pub async fn retry_with_failure_listeners(&self, batch: WriteBatch) -> Result<(), CoordinatorError> {
        self.run_retry(batch, true).await
    }

    /// A manual retry is not part of the round-robin batch-formation flow, so
    /// it targets the "primary" host rather than `batch.batch_number mod
    /// |roster|`: the same host failover keeps pointed at a live entry
    /// (see [`Coordinator::with_forest_config`]'s primary reassignment).
    async fn run_retry(&self, batch: WriteBatch, notify_failure_listeners: bool) -> Result<(), CoordinatorError> {
        match *self.phase.lock() {
            Phase::Configurable => return Err(CoordinatorError::State),
            Phase::Stopped => return Err(CoordinatorError::Stopped),
            Phase::Running => {}
        }

        let roster = self.roster.lock().clone();
        let index = if roster.is_empty() {
            0
        } else {
            self.primary_index.load(Ordering::SeqCst) % roster.len()
        };
        let client = roster
            .entry_at(index)
            .map(|e| e.client.clone())
            .ok_or_else(|| CoordinatorError::Transport("no hosts available for retry".to_string()))?;

        let write_result = if let Some(temporal) = &batch.temporal_collection {
            client.write_temporal(&batch, temporal).await
        } else {
            client.write(&batch).await
        };

        match write_result {
            Ok(()) => Ok(()),
            Err(err) => {
                if notify_failure_listeners {
                    let listeners = self.failure_listeners.lock().clone();
                    crate::listener::dispatch_failure(&listeners, &batch, &err);
                }
                Err(CoordinatorError::Transport(err))
            }
        }
    }

    // ---- topology / failover ----

    /// Apply a fresh `ForestConfiguration` read. Before `start`, this is a
    /// plain roster swap. While running, hosts that left trigger failover:
    /// queued-but-not-started batches targeting a removed host are
    /// rewritten onto the new roster.
    pub async fn with_forest_config(&self, cfg: &dyn ForestConfiguration) -> Result<(), CoordinatorError> {
        let _serialize = self.reconfigure.lock().await;

        let old_roster = self.roster.lock().clone();
        let result = old_roster.rebuild(cfg, |h| (self.make_client)(h));
        *self.roster.lock() = result.roster.clone();

        let running = *self.phase.lock() == Phase::Running;
        if !running || result.removed.is_empty() {
            return Ok(());
        }

        let new_roster = result.roster;
        if new_roster.is_empty() {
            tracing::warn!("all hosts removed from roster, queued work cannot be reassigned");
            return Ok(());
        }

        let primary = self.primary_index.load(Ordering::SeqCst);
        if let Some(entry) = old_roster.entry_at(primary) {
            if result.removed.contains(&entry.host) {
                let new_primary = rand::thread_rng().gen_range(0..new_roster.len());
                self.primary_index.store(new_primary, Ordering::SeqCst);
                tracing::warn!(new_primary, "primary host removed, reassigned randomly");
            }
        }

        let pool = match self.pool.lock().clone() {
            Some(pool) => pool,
            None => return Ok(()),
        };

        let drained = pool.drain_pending();
        for (old_id, task) in drained {
            let host = task.host().clone();
            let (new_client, new_host, wrap): (_, _, Option<ErrorWrap>) = if result.removed.contains(&host) {
                let idx = (self.failover_counter.fetch_add(1, Ordering::SeqCst) as usize) % new_roster.len();
                let entry = new_roster.entry_at(idx).expect("index computed modulo roster length");
                tracing::warn!(old_host = %host, new_host = %entry.host, "reassigning queued batch away from removed host");
                (
                    entry.client.clone(),
                    entry.host.clone(),
                    Some(Arc::new(|e: String| CoordinatorError::RetryFailed(e).to_string()) as ErrorWrap),
                )
            } else {
                match new_roster.entries().iter().find(|e| e.host == host) {
                    Some(entry) => (entry.client.clone(), entry.host.clone(), None),
                    None => {
                        let idx = (self.failover_counter.fetch_add(1, Ordering::SeqCst) as usize) % new_roster.len();
                        let entry = new_roster.entry_at(idx).expect("index computed modulo roster length");
                        (entry.client.clone(), entry.host.clone(), None)
                    }
                }
            };

            let new_id = pool.register_for_replace();
            let new_task = task.rebuilt_for(new_client, new_host, None, wrap);
            pool.replace_task(old_id, new_id);
            pool.run_registered(new_id, new_task).await;
        }

        Ok(())
    }

    // ---- introspection ----

    pub fn batch_size(&self) -> usize {
        self.config.lock().batch_size
    }

    pub fn thread_count(&self) -> Option<usize> {
        self.config.lock().thread_count
    }

    pub fn job_start_time(&self) -> Option<SystemTime> {
        *self.job_start_time.lock()
    }

    pub fn job_end_time(&self) -> Option<SystemTime> {
        *self.job_end_time.lock()
    }

    pub fn job_ticket(&self) -> Option<String> {
        self.job_ticket.lock().clone()
    }

    pub fn roster_hosts(&self) -> Vec<HostRef> {
        self.roster.lock().entries().iter().map(|e| e.host.clone()).collect()
    }

    pub fn transform(&self) -> Option<String> {
        self.config.lock().transform.clone()
    }

    pub fn temporal_collection(&self) -> Option<String> {
        self.config.lock().temporal_collection.clone()
    }

    /// The default metadata handle configured via
    /// [`Coordinator::with_default_metadata`], if any.
    pub fn document_metadata(&self) -> Option<CloseHandle> {
        self.config.lock().default_metadata.clone()
    }

    pub fn items_so_far(&self) -> u64 {
        self.items_so_far.load(Ordering::SeqCst)
    }
}
