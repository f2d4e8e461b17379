//! File-access façade over an injected backend.
//!
//! Whole-file reads and writes are built from the streams, so they share the
//! same chunking, ordering and error routing.

use crate::backend::{Backend, FileObject, FileRef};
use crate::config::StreamConfig;
use crate::error::{BackendOp, Result, StreamError};
use crate::streaming::{
    EventKind, Publisher, ReadOutcome, ReadStream, StreamEvent, WriteOutcome, WriteStream,
};
use bytes::{Bytes, BytesMut};
use serde::Serialize;
use std::sync::{Arc, Mutex};

/// Queued writes at which `copy` pauses its reader.
pub const COPY_HIGH_WATER: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileInfo {
    pub path: String,
    pub size: u64,
}

pub struct FileAccess<B: Backend> {
    backend: Arc<B>,
    config: StreamConfig,
}

impl<B: Backend> FileAccess<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            config: StreamConfig::default(),
        }
    }

    /// Default stream options for whole-file operations.
    pub fn with_config(mut self, config: StreamConfig) -> Self {
        self.config = config;
        self
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn create_read_stream(
        &self,
        file: FileRef<B::File>,
        config: StreamConfig,
    ) -> Result<ReadStream<B>> {
        ReadStream::new(Arc::clone(&self.backend), file, config)
    }

    pub fn create_write_stream(
        &self,
        file: FileRef<B::File>,
        config: StreamConfig,
    ) -> Result<WriteStream<B>> {
        WriteStream::new(Arc::clone(&self.backend), file, config)
    }

    pub async fn stat(&self, path: &str) -> Result<FileInfo> {
        let file = self
            .backend
            .resolve_file(path)
            .await
            .map_err(|e| StreamError::backend(BackendOp::Resolve, e))?;
        Ok(FileInfo {
            path: file.full_path().to_string(),
            size: file.size(),
        })
    }

    /// Read a whole file into memory.
    pub async fn read_file(&self, file: FileRef<B::File>) -> Result<Bytes> {
        let stream = self.create_read_stream(file, self.config)?;
        let buf = Arc::new(Mutex::new(BytesMut::new()));
        let sink = Arc::clone(&buf);
        stream.on(EventKind::Data, move |event| {
            if let StreamEvent::Data(data) = event {
                lock(&sink).extend_from_slice(data);
            }
        });

        match stream.start().await? {
            ReadOutcome::Finished => Ok(lock(&buf).split().freeze()),
            ReadOutcome::Stopped => Err(StreamError::InvalidState("stopped")),
            ReadOutcome::Errored => Err(StreamError::InvalidState("errored")),
        }
    }

    /// Create (or truncate) `path` and write `data` to it.
    ///
    /// Returns the number of bytes written.
    pub async fn write_file(&self, path: &str, data: impl Into<Bytes>) -> Result<u64> {
        let stream = self.create_write_stream(FileRef::path(path), StreamConfig::default())?;
        let written = stream.write(data).await;
        stream.end().await?;
        written
    }

    /// Stream `src` into `dst`, pausing the reader while the write queue is
    /// deep and resuming it on `drain`.
    ///
    /// `progress` receives the size of each chunk as it is queued.
    pub async fn copy<P>(&self, src: FileRef<B::File>, dst: &str, progress: P) -> Result<u64>
    where
        P: Fn(u64) + Send + Sync + 'static,
    {
        let reader = self.create_read_stream(src, self.config)?;
        let writer = Arc::new(
            self.create_write_stream(FileRef::path(dst), StreamConfig::default())?,
        );
        let write_error: Arc<Mutex<Option<StreamError>>> = Arc::new(Mutex::new(None));

        let on_data = {
            let writer = Arc::clone(&writer);
            let handle = reader.clone();
            reader.on(EventKind::Data, move |event| {
                if let StreamEvent::Data(data) = event {
                    drop(writer.write(data.clone()));
                    progress(data.len() as u64);
                    if writer.pending() >= COPY_HIGH_WATER {
                        handle.pause();
                        // The queue may have drained before the pause landed.
                        if writer.pending() == 0 {
                            handle.resume();
                        }
                    }
                }
            })
        };
        let on_drain = {
            let reader = reader.clone();
            writer.on(EventKind::Drain, move |_| reader.resume())
        };
        let on_error = {
            let reader = reader.clone();
            let slot = Arc::clone(&write_error);
            writer.on(EventKind::Error, move |event| {
                if let StreamEvent::Error(err) = event {
                    lock(&slot).get_or_insert_with(|| err.clone());
                }
                reader.stop();
            })
        };

        let read = reader.start().await;
        if read.is_err() {
            writer.stop();
        }
        let written = writer.end().await;

        reader.off(on_data);
        writer.off(on_drain);
        writer.off(on_error);

        read?;
        if let Some(err) = lock(&write_error).take() {
            return Err(err);
        }
        match written? {
            WriteOutcome::Ended => Ok(writer.cursor()),
            WriteOutcome::Stopped => Err(StreamError::InvalidState("stopped")),
            WriteOutcome::Errored => Err(StreamError::InvalidState("errored")),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
