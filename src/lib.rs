//! cofs - streaming file access over asynchronous, chunked storage.
//!
//! A storage backend exposes only chunk primitives (`read_part`,
//! `write_part`, `create_empty`). On top of them this crate provides:
//!
//! - [`ReadStream`]: sequential fixed-size chunk pulls with pause, resume and stop
//! - [`WriteStream`]: queued, single-flight, ordered appends with `drain`
//! - [`FileAccess`]: whole-file read/write/copy built from the streams
//!
//! ```no_run
//! use cofs::{FileAccess, FileRef, MemoryFs};
//! use std::sync::Arc;
//!
//! # async fn demo() -> cofs::Result<()> {
//! let fs = Arc::new(MemoryFs::new());
//! let access = FileAccess::new(fs);
//! access.write_file("greeting.txt", "hello").await?;
//! let data = access.read_file(FileRef::path("greeting.txt")).await?;
//! assert_eq!(&data[..], b"hello");
//! # Ok(())
//! # }
//! ```

pub mod access;
pub mod backend;
pub mod config;
pub mod encoding;
pub mod error;
pub mod streaming;

pub use access::{FileAccess, FileInfo};
pub use backend::{Backend, FileObject, FileRef, MemoryFs, SandboxFs};
pub use config::{Settings, StreamConfig, DEFAULT_BLOCK_SIZE};
pub use encoding::Encoding;
pub use error::{BackendOp, Result, StreamError};
pub use streaming::{
    ChunkPlan, EventChannel, EventKind, Publisher, ReadOutcome, ReadState, ReadStream,
    StreamEvent, WriteAck, WriteOutcome, WriteState, WriteStream,
};
