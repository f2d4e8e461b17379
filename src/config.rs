//! Stream and application configuration.

use crate::error::{Result, StreamError};
use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Default chunk size for read streams (4KB)
pub const DEFAULT_BLOCK_SIZE: u64 = 4096;

/// Byte range and chunking options shared by read and write streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Bytes requested per backend call
    pub block_size: u64,
    /// First byte offset (read) or initial append cursor (write)
    pub start: u64,
    /// Exclusive end offset; the file size is used when unset
    pub end: Option<u64>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            start: 0,
            end: None,
        }
    }
}

impl StreamConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_block_size(mut self, block_size: u64) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_start(mut self, start: u64) -> Self {
        self.start = start;
        self
    }

    pub fn with_end(mut self, end: u64) -> Self {
        self.end = Some(end);
        self
    }

    /// Reject configurations that can never describe a transfer.
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(StreamError::InvalidBlockSize);
        }
        if let Some(end) = self.end {
            if end <= self.start {
                return Err(StreamError::Configuration {
                    start: self.start,
                    end,
                });
            }
        }
        Ok(())
    }
}

/// Settings for the `cofs` binary, read from `config.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Sandbox root every path is resolved against
    pub root: PathBuf,
    pub block_size: u64,
    /// Upper bound on bytes written through one sandbox instance
    pub quota_bytes: Option<u64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            root: default_root(),
            block_size: DEFAULT_BLOCK_SIZE,
            quota_bytes: None,
        }
    }
}

impl Settings {
    /// Default location: `<config_dir>/cofs/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("cofs").join("config.toml"))
    }

    pub fn from_toml(text: &str) -> anyhow::Result<Self> {
        toml::from_str(text).context("Failed to parse settings")
    }

    /// Load settings from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_toml(&text)
    }

    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig::default().with_block_size(self.block_size)
    }
}

fn default_root() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("cofs"))
        .unwrap_or_else(|| PathBuf::from(".cofs"))
}
