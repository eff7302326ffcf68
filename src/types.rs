//! Core data types for the batch write coordinator.

use crate::error::CloseError;
use std::fmt;
use std::sync::Arc;

/// Something that owns a resource which must be released after a batch has
/// been written or discarded (a document content stream, a metadata blob).
///
/// The coordinator treats document content and metadata as opaque; this is
/// the only contract it requires of them.
pub trait Closeable: Send + Sync {
    fn close(&self) -> Result<(), CloseError>;
}

/// A handle to an opaque, closeable document value (content or metadata).
pub type CloseHandle = Arc<dyn Closeable>;

/// The kind of write a [`WriteOp`] performs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpType {
    Create,
    Replace,
    Delete,
    Patch,
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OpType::Create => "CREATE",
            OpType::Replace => "REPLACE",
            OpType::Delete => "DELETE",
            OpType::Patch => "PATCH",
        };
        write!(f, "{s}")
    }
}

/// A single document write submitted by a producer.
///
/// Represented as a sum type rather than overloading a "null uri" write so
/// that a synthetic default-metadata entry can never be mistaken for a real
/// document (see [`WriteOp::DefaultMetadata`]).
#[derive(Clone)]
pub enum WriteOp {
    /// A real document write.
    Write {
        uri: String,
        op_type: OpType,
        metadata: Option<CloseHandle>,
        content: Option<CloseHandle>,
    },
    /// The synthetic leading marker inserted when default metadata is
    /// configured on the coordinator. Never counted as a "real" op when
    /// deciding whether a batch has at least one document to submit.
    DefaultMetadata(CloseHandle),
}

impl WriteOp {
    /// Construct a document write. Panics if `uri` is empty, matching the
    /// spec's invariant that a `WriteOp`'s uri is non-empty; callers at the
    /// coordinator boundary are expected to validate before constructing.
    pub fn write(
        uri: impl Into<String>,
        op_type: OpType,
        metadata: Option<CloseHandle>,
        content: Option<CloseHandle>,
    ) -> Self {
        let uri = uri.into();
        debug_assert!(!uri.is_empty(), "WriteOp uri must not be empty");
        WriteOp::Write {
            uri,
            op_type,
            metadata,
            content,
        }
    }

    pub fn is_default_metadata(&self) -> bool {
        matches!(self, WriteOp::DefaultMetadata(_))
    }

    /// Close every closeable handle carried by this op. Closes all of them
    /// even if one fails, returning the last error seen.
    pub(crate) fn close_handles(&self) -> Result<(), CloseError> {
        let mut last = None;
        let handles: Vec<&CloseHandle> = match self {
            WriteOp::Write {
                metadata, content, ..
            } => metadata.iter().chain(content.iter()).collect(),
            WriteOp::DefaultMetadata(h) => vec![h],
        };
        for handle in handles {
            if let Err(e) = handle.close() {
                last = Some(e);
            }
        }
        match last {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Opaque identity of a cluster host, used for round-robin equality.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct HostRef(pub String);

impl fmt::Display for HostRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A batch of ops assigned to one host, built either by reaching
/// `batch_size` adds or by `flush`.
pub struct WriteBatch {
    pub batch_number: u64,
    pub host: HostRef,
    pub ops: Vec<WriteOp>,
    pub transform: Option<String>,
    pub temporal_collection: Option<String>,
}

impl WriteBatch {
    /// Number of real (non-default-metadata) ops in this batch.
    pub fn real_op_count(&self) -> usize {
        self.ops.iter().filter(|op| !op.is_default_metadata()).count()
    }
}
