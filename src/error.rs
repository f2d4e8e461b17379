//! Error types for the streaming layer.

use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub type Result<T, E = StreamError> = std::result::Result<T, E>;

/// Which collaborator primitive failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendOp {
    Resolve,
    ReadPart,
    WritePart,
    CreateEmpty,
}

impl fmt::Display for BackendOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendOp::Resolve => "resolve",
            BackendOp::ReadPart => "read part",
            BackendOp::WritePart => "write part",
            BackendOp::CreateEmpty => "create empty",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Error)]
pub enum StreamError {
    /// Invalid byte range, rejected at construction before any I/O.
    #[error("Start byte {start} is not before end byte {end}")]
    Configuration { start: u64, end: u64 },

    #[error("Block size must be greater than zero")]
    InvalidBlockSize,

    /// A chunk primitive of the storage backend failed.
    #[error("Backend {op} failed: {cause:#}")]
    Backend {
        op: BackendOp,
        cause: Arc<anyhow::Error>,
    },

    #[error("Invalid {encoding} payload: {message}")]
    Encoding {
        encoding: &'static str,
        message: String,
    },

    #[error("Stream is {0}")]
    InvalidState(&'static str),

    /// The write was never acknowledged: it was dropped from the queue, or
    /// `stop()` landed while it was in flight and it may have reached storage.
    #[error("Write discarded before it was acknowledged")]
    Discarded,

    #[error("Stream is closed for writing")]
    Closed,
}

impl StreamError {
    pub fn backend(op: BackendOp, cause: anyhow::Error) -> Self {
        StreamError::Backend {
            op,
            cause: Arc::new(cause),
        }
    }

    pub fn is_backend(&self) -> bool {
        matches!(self, StreamError::Backend { .. })
    }
}
