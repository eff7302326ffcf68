//! Out-of-scope collaborators, consumed as interfaces: the per-host
//! transport (`HostClient`) and the cluster-topology oracle
//! (`ForestConfiguration`).

use crate::types::WriteBatch;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Writes batches of documents to one cluster host.
///
/// Implementations are expected to be cheap to clone (an `Arc`-wrapped
/// connection pool handle), since the coordinator holds one per
/// [`crate::roster::HostEntry`] for the life of the roster entry.
#[async_trait]
pub trait HostClient: Send + Sync {
    /// Plain bulk write.
    async fn write(&self, batch: &WriteBatch) -> Result<(), String>;

    /// Bulk write with temporal-collection semantics (content format
    /// "unknown").
    async fn write_temporal(&self, batch: &WriteBatch, temporal_collection: &str) -> Result<(), String>;

    /// String identity used for round-robin equality against
    /// [`crate::types::HostRef`].
    fn host(&self) -> String;
}

/// One writable shard as reported by the topology oracle.
#[derive(Clone, Debug)]
pub struct Forest {
    pub database_name: String,
    pub host: String,
}

/// Reports the current set of hosts with writable shards.
pub trait ForestConfiguration: Send + Sync {
    fn forests(&self) -> Vec<Forest>;

    /// Project the forest list down to its distinct host set, preserving
    /// first-seen order (used as the new roster order on rebuild).
    fn hosts(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for forest in self.forests() {
            if seen.insert(forest.host.clone()) {
                out.push(forest.host);
            }
        }
        out
    }
}

/// An in-memory `HostClient` test double that records every batch it
/// receives and can be configured to fail or slow down, standing in for a
/// real server in tests.
pub struct MockHostClient {
    host: String,
    written: Mutex<Vec<u64>>,
    writes_attempted: AtomicUsize,
    fail_next: AtomicUsize,
    delay: Mutex<Duration>,
}

impl MockHostClient {
    pub fn new(host: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            host: host.into(),
            written: Mutex::new(Vec::new()),
            writes_attempted: AtomicUsize::new(0),
            fail_next: AtomicUsize::new(0),
            delay: Mutex::new(Duration::ZERO),
        })
    }

    /// Make the next `n` writes to this host fail.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Make every subsequent `write`/`write_temporal` call sleep for `d`
    /// before recording, used to hold a worker busy in saturation tests.
    pub fn set_delay(&self, d: Duration) {
        *self.delay.lock().unwrap() = d;
    }

    pub fn batch_numbers_written(&self) -> Vec<u64> {
        self.written.lock().unwrap().clone()
    }

    pub fn writes_attempted(&self) -> usize {
        self.writes_attempted.load(Ordering::SeqCst)
    }

    fn record(&self, batch: &WriteBatch) -> Result<(), String> {
        self.writes_attempted.fetch_add(1, Ordering::SeqCst);
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            return Err(format!("simulated failure writing batch {}", batch.batch_number));
        }
        self.written.lock().unwrap().push(batch.batch_number);
        Ok(())
    }
}

#[async_trait]
impl HostClient for MockHostClient {
    async fn write(&self, batch: &WriteBatch) -> Result<(), String> {
        eprintln!("DEBUG write start batch={}", batch.batch_number);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        eprintln!("DEBUG write after sleep batch={}", batch.batch_number);
        self.record(batch)
    }

    async fn write_temporal(&self, batch: &WriteBatch, _temporal_collection: &str) -> Result<(), String> {
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.record(batch)
    }

    fn host(&self) -> String {
        self.host.clone()
    }
}

/// A fixed `ForestConfiguration` test double.
pub struct StaticForestConfiguration {
    forests: Vec<Forest>,
}

impl StaticForestConfiguration {
    pub fn new(hosts: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let forests = hosts
            .into_iter()
            .enumerate()
            .map(|(i, host)| Forest {
                database_name: format!("db-{i}"),
                host: host.into(),
            })
            .collect();
        Self { forests }
    }
}

impl ForestConfiguration for StaticForestConfiguration {
    fn forests(&self) -> Vec<Forest> {
        self.forests.clone()
    }
}
