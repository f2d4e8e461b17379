//! Directory-rooted, quota-bound backend over `tokio::fs`.

use super::{Backend, FileObject};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};

/// Validate that a sandbox path is safe and doesn't escape the root.
/// Returns the full path if valid.
fn validate_path(root: &Path, relative: &str) -> Result<PathBuf> {
    let relative = relative.trim_start_matches('/');
    if relative.is_empty() {
        bail!("Empty path not allowed");
    }

    let rel_path = Path::new(relative);
    for component in rel_path.components() {
        match component {
            Component::ParentDir => {
                bail!("Path traversal not allowed: {}", relative);
            }
            Component::Prefix(_) | Component::RootDir => {
                bail!("Absolute paths not allowed: {}", relative);
            }
            _ => {}
        }
    }

    let full = root.join(rel_path);
    if !normalize_path(&full).starts_with(normalize_path(root)) {
        bail!("Path escapes sandbox root: {}", relative);
    }

    Ok(full)
}

/// Normalize a path without requiring it to exist (unlike canonicalize)
fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                normalized.pop();
            }
            Component::CurDir => {}
            c => normalized.push(c),
        }
    }
    normalized
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxFile {
    /// Path relative to the sandbox root, with a leading `/`
    path: String,
    full_path: PathBuf,
    size: u64,
}

impl SandboxFile {
    pub fn local_path(&self) -> &Path {
        &self.full_path
    }
}

impl FileObject for SandboxFile {
    fn size(&self) -> u64 {
        self.size
    }

    fn full_path(&self) -> &str {
        &self.path
    }
}

/// Local directory exposed only through chunk primitives.
#[derive(Debug)]
pub struct SandboxFs {
    root: PathBuf,
    quota_bytes: Option<u64>,
    /// Bytes written through this instance
    used_bytes: AtomicU64,
}

impl SandboxFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            quota_bytes: None,
            used_bytes: AtomicU64::new(0),
        }
    }

    pub fn with_quota(mut self, quota_bytes: u64) -> Self {
        self.quota_bytes = Some(quota_bytes);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes.load(Ordering::SeqCst)
    }

    fn file_for(&self, path: &str, full_path: PathBuf, size: u64) -> SandboxFile {
        SandboxFile {
            path: format!("/{}", path.trim_start_matches('/')),
            full_path,
            size,
        }
    }

    /// Reserve `len` bytes against the quota.
    fn charge(&self, len: u64) -> Result<()> {
        let Some(quota) = self.quota_bytes else {
            self.used_bytes.fetch_add(len, Ordering::SeqCst);
            return Ok(());
        };
        let reserved = self
            .used_bytes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                used.checked_add(len).filter(|total| *total <= quota)
            });
        if reserved.is_err() {
            bail!(
                "Quota exceeded: writing {} bytes would pass the {} byte limit",
                len,
                quota
            );
        }
        Ok(())
    }

    fn refund(&self, len: u64) {
        self.used_bytes.fetch_sub(len, Ordering::SeqCst);
    }
}

#[async_trait]
impl Backend for SandboxFs {
    type File = SandboxFile;

    async fn resolve_file(&self, path: &str) -> Result<SandboxFile> {
        let full_path = validate_path(&self.root, path)?;
        let meta = fs::metadata(&full_path)
            .await
            .with_context(|| format!("Failed to stat {}", path))?;
        if !meta.is_file() {
            bail!("Not a regular file: {}", path);
        }
        Ok(self.file_for(path, full_path, meta.len()))
    }

    async fn read_part(&self, file: &SandboxFile, start: u64, end: u64) -> Result<Bytes> {
        let mut handle = File::open(&file.full_path)
            .await
            .with_context(|| format!("Failed to open {}", file.path))?;
        handle.seek(SeekFrom::Start(start)).await?;

        let len = end.saturating_sub(start);
        let mut buf = Vec::with_capacity(len as usize);
        handle.take(len).read_to_end(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    async fn write_part(&self, file: &SandboxFile, offset: u64, data: Bytes) -> Result<()> {
        let len = data.len() as u64;
        self.charge(len)?;

        let written = async {
            let mut handle = OpenOptions::new()
                .write(true)
                .open(&file.full_path)
                .await
                .with_context(|| format!("Failed to open {} for writing", file.path))?;
            handle.seek(SeekFrom::Start(offset)).await?;
            handle.write_all(&data).await?;
            handle.flush().await?;
            Ok::<_, anyhow::Error>(())
        }
        .await;

        if written.is_err() {
            self.refund(len);
        }
        written
    }

    async fn create_empty(&self, path: &str) -> Result<SandboxFile> {
        let full_path = validate_path(&self.root, path)?;
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        File::create(&full_path)
            .await
            .with_context(|| format!("Failed to create {}", path))?;
        Ok(self.file_for(path, full_path, 0))
    }
}
