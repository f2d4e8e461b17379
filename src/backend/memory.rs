//! In-memory backend for tests and demos.

use super::{Backend, FileObject};
use anyhow::{bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryFile {
    path: String,
    size: u64,
}

impl FileObject for MemoryFile {
    fn size(&self) -> u64 {
        self.size
    }

    fn full_path(&self) -> &str {
        &self.path
    }
}

#[derive(Debug, Default)]
struct State {
    files: BTreeMap<String, Vec<u8>>,
    /// (offset, len) of every successful write_part, in call order
    writes: Vec<(u64, usize)>,
    fail_reads_from: Option<u64>,
    fail_writes_from: Option<u64>,
}

/// Map-backed store. Paths are normalized to a single leading `/`.
#[derive(Debug, Default)]
pub struct MemoryFs {
    state: Mutex<State>,
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    format!("/{}", trimmed)
}

impl MemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create or replace a file with `content`.
    pub fn insert(&self, path: &str, content: impl Into<Vec<u8>>) {
        self.state().files.insert(normalize(path), content.into());
    }

    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        self.state().files.get(&normalize(path)).cloned()
    }

    pub fn exists(&self, path: &str) -> bool {
        self.state().files.contains_key(&normalize(path))
    }

    /// Offsets and lengths of completed writes, oldest first.
    pub fn write_log(&self) -> Vec<(u64, usize)> {
        self.state().writes.clone()
    }

    /// Fail every read whose range starts at or after `offset`.
    pub fn fail_reads_from(&self, offset: u64) {
        self.state().fail_reads_from = Some(offset);
    }

    /// Fail every write at or after `offset`.
    pub fn fail_writes_from(&self, offset: u64) {
        self.state().fail_writes_from = Some(offset);
    }
}

#[async_trait]
impl Backend for MemoryFs {
    type File = MemoryFile;

    async fn resolve_file(&self, path: &str) -> Result<MemoryFile> {
        let path = normalize(path);
        let state = self.state();
        match state.files.get(&path) {
            Some(content) => Ok(MemoryFile {
                size: content.len() as u64,
                path,
            }),
            None => bail!("File not found: {}", path),
        }
    }

    async fn read_part(&self, file: &MemoryFile, start: u64, end: u64) -> Result<Bytes> {
        let state = self.state();
        if state.fail_reads_from.is_some_and(|at| start >= at) {
            bail!("Injected read failure at offset {}", start);
        }
        let Some(content) = state.files.get(&file.path) else {
            bail!("File not found: {}", file.path);
        };

        let len = content.len() as u64;
        let start = start.min(len) as usize;
        let end = end.min(len) as usize;
        Ok(Bytes::copy_from_slice(&content[start..end.max(start)]))
    }

    async fn write_part(&self, file: &MemoryFile, offset: u64, data: Bytes) -> Result<()> {
        let mut state = self.state();
        if state.fail_writes_from.is_some_and(|at| offset >= at) {
            bail!("Injected write failure at offset {}", offset);
        }
        let Some(content) = state.files.get_mut(&file.path) else {
            bail!("File not found: {}", file.path);
        };

        let offset_usize = offset as usize;
        let end = offset_usize + data.len();
        if content.len() < end {
            content.resize(end, 0);
        }
        content[offset_usize..end].copy_from_slice(&data);
        state.writes.push((offset, data.len()));
        Ok(())
    }

    async fn create_empty(&self, path: &str) -> Result<MemoryFile> {
        let path = normalize(path);
        self.state().files.insert(path.clone(), Vec::new());
        Ok(MemoryFile { path, size: 0 })
    }
}
