//! Batch Write Coordinator
//!
//! An asynchronous batched write coordinator for a clustered document
//! store. Client code submits documents one at a time from many tasks;
//! the coordinator aggregates them into fixed-size batches, dispatches
//! each batch to one host of the cluster in round-robin order, notifies
//! listeners of success or failure, supports forced flushing, a
//! bounded-wait quiesce operation, and reassigns in-flight work when the
//! set of available hosts changes.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use batch_write_coordinator::{Coordinator, OpType, StaticForestConfiguration, WriteOp, MockHostClient, HostClient};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let topology = StaticForestConfiguration::new(["host-a", "host-b"]);
//!     let coordinator = Coordinator::new(&topology, Arc::new(|host: &str| {
//!         MockHostClient::new(host) as Arc<dyn HostClient>
//!     }));
//!     coordinator.with_batch_size(100)?;
//!     coordinator.start("job-1");
//!
//!     coordinator.add(WriteOp::write("doc1.json", OpType::Create, None, None)).await?;
//!     coordinator.flush(true).await?;
//!     coordinator.stop().await?;
//!     Ok(())
//! }
//! ```

mod assembler;
mod coordinator;
mod error;
mod host_client;
mod listener;
mod pool;
mod queue;
mod roster;
mod task;
mod types;

pub use coordinator::{Coordinator, HostClientFactory};
pub use error::{CloseError, ConfigError, CoordinatorError};
pub use host_client::{Forest, ForestConfiguration, HostClient, MockHostClient, StaticForestConfiguration};
pub use listener::{BatchListener, FnListener};
pub use pool::{CompletionPool, CompletionPoolConfig, TaskId};
pub use queue::PendingQueue;
pub use roster::{HostEntry, HostRoster};
pub use task::BatchTask;
pub use types::{CloseHandle, Closeable, HostRef, OpType, WriteBatch, WriteOp};
