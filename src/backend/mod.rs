//! Storage collaborator consumed by the streams.
//!
//! The streams never touch storage directly: every byte moves through one of
//! the chunk primitives below. Each call completes exactly once and is
//! assumed to be atomic on its own; nothing larger is.

pub mod memory;
pub mod sandbox;

pub use memory::{MemoryFile, MemoryFs};
pub use sandbox::{SandboxFile, SandboxFs};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// A resolved file, snapshotted at resolution time.
pub trait FileObject: Clone + Send + Sync + 'static {
    /// Size in bytes when the file was resolved
    fn size(&self) -> u64;

    /// Full path inside the storage root, for diagnostics
    fn full_path(&self) -> &str;
}

/// What a stream is pointed at: a path still to resolve, or a resolved file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileRef<F> {
    Path(String),
    Resolved(F),
}

impl<F: FileObject> FileRef<F> {
    pub fn path(path: impl Into<String>) -> Self {
        FileRef::Path(path.into())
    }

    pub fn display_path(&self) -> &str {
        match self {
            FileRef::Path(path) => path,
            FileRef::Resolved(file) => file.full_path(),
        }
    }
}

impl<F> From<&str> for FileRef<F> {
    fn from(path: &str) -> Self {
        FileRef::Path(path.to_string())
    }
}

impl<F> From<String> for FileRef<F> {
    fn from(path: String) -> Self {
        FileRef::Path(path)
    }
}

/// Chunk-level primitives of an asynchronous, capability-limited store.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    type File: FileObject;

    /// Resolve a path to a readable file object.
    async fn resolve_file(&self, path: &str) -> Result<Self::File>;

    /// Read the bytes in `[start, end)`. Fewer bytes come back at end of file.
    async fn read_part(&self, file: &Self::File, start: u64, end: u64) -> Result<Bytes>;

    /// Write `data` at `offset`, which the write stream keeps at the append cursor.
    async fn write_part(&self, file: &Self::File, offset: u64, data: Bytes) -> Result<()>;

    /// Create (or truncate) `path` to zero length and return it resolved.
    async fn create_empty(&self, path: &str) -> Result<Self::File>;
}

/// Resolve a `FileRef` through `backend` when it is still a path.
pub async fn resolve<B: Backend>(backend: &B, file: &FileRef<B::File>) -> Result<B::File> {
    match file {
        FileRef::Resolved(file) => Ok(file.clone()),
        FileRef::Path(path) => backend.resolve_file(path).await,
    }
}
