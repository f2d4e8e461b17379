//! Command-line front end over a sandboxed store.

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use cofs::access::COPY_HIGH_WATER;
use cofs::{
    Encoding, EventKind, FileAccess, FileRef, Publisher, ReadStream, SandboxFs, Settings,
    StreamConfig, StreamEvent,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// Chunks waiting for stdout before `read` pauses the stream.
const READ_HIGH_WATER: usize = 8;
/// Backlog at or below which a paused `read` resumes.
const READ_LOW_WATER: usize = 2;
/// Largest stdin buffer `write` allocates, whatever `--block-size` says.
const MAX_STDIN_CHUNK: u64 = 1 << 20;

#[derive(Debug, Parser)]
#[command(
    name = "cofs",
    version,
    about = "Stream files in and out of a sandboxed, quota-bound store"
)]
pub struct Cli {
    /// Settings file (default: <config dir>/cofs/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Sandbox root directory
    #[arg(long, env = "COFS_ROOT", global = true)]
    pub root: Option<PathBuf>,

    /// Bytes per backend call
    #[arg(long, global = true)]
    pub block_size: Option<u64>,

    /// Maximum bytes this invocation may write
    #[arg(long, global = true)]
    pub quota: Option<u64>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Stream a file to stdout
    Read {
        path: String,
        /// First byte to read
        #[arg(long)]
        start: Option<u64>,
        /// Stop before this byte
        #[arg(long)]
        end: Option<u64>,
    },
    /// Write stdin to a file, replacing it
    Write {
        path: String,
        /// How stdin is encoded: utf8 (raw bytes), hex or base64
        #[arg(long, default_value = "utf8")]
        encoding: String,
    },
    /// Copy a file inside the sandbox
    Copy {
        src: String,
        dst: String,
        /// Hide the progress bar
        #[arg(long)]
        no_progress: bool,
    },
    /// Print file information as JSON
    Stat { path: String },
}

impl Cli {
    /// Settings file values, overridden by command-line flags.
    pub fn settings(&self) -> Result<Settings> {
        let mut settings = match self.config.clone().or_else(Settings::default_path) {
            Some(path) => Settings::load(&path)?,
            None => Settings::default(),
        };
        if let Some(root) = &self.root {
            settings.root = root.clone();
        }
        if let Some(block_size) = self.block_size {
            settings.block_size = block_size;
        }
        if let Some(quota) = self.quota {
            settings.quota_bytes = Some(quota);
        }
        Ok(settings)
    }
}

pub async fn run(cli: Cli) -> Result<()> {
    let settings = cli.settings()?;
    tracing::debug!("Using sandbox root {}", settings.root.display());

    let mut backend = SandboxFs::new(&settings.root);
    if let Some(quota) = settings.quota_bytes {
        backend = backend.with_quota(quota);
    }
    let access = FileAccess::new(Arc::new(backend)).with_config(settings.stream_config());

    match cli.command {
        Command::Read { path, start, end } => {
            let mut config = settings.stream_config();
            if let Some(start) = start {
                config = config.with_start(start);
            }
            if let Some(end) = end {
                config = config.with_end(end);
            }
            read_to_stdout(&access, &path, config).await
        }
        Command::Write { path, encoding } => {
            let encoding: Encoding = encoding.parse()?;
            write_from_stdin(&access, &path, encoding, settings.block_size).await
        }
        Command::Copy {
            src,
            dst,
            no_progress,
        } => copy(&access, &src, &dst, !no_progress).await,
        Command::Stat { path } => {
            let info = access.stat(&path).await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
            Ok(())
        }
    }
}

async fn read_to_stdout(
    access: &FileAccess<SandboxFs>,
    path: &str,
    config: StreamConfig,
) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    read_into(access, path, config, &mut stdout).await
}

/// Stream `path` into `out`, pausing the reader while `out` lags behind.
async fn read_into<W>(
    access: &FileAccess<SandboxFs>,
    path: &str,
    config: StreamConfig,
    out: &mut W,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let stream = access.create_read_stream(FileRef::path(path), config)?;

    // Handlers are synchronous; hand chunks to an async writer. Once
    // READ_HIGH_WATER chunks are waiting the reader pauses.
    let backlog = Arc::new(AtomicUsize::new(0));
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    let listener = {
        let handle = stream.clone();
        let backlog = Arc::clone(&backlog);
        stream.on(EventKind::Data, move |event| {
            let StreamEvent::Data(data) = event else {
                return;
            };
            let waiting = backlog.fetch_add(1, Ordering::SeqCst) + 1;
            if tx.send(data.clone()).is_err() {
                handle.stop();
                return;
            }
            if waiting >= READ_HIGH_WATER {
                handle.pause();
                // The writer may have caught up before the pause landed.
                if backlog.load(Ordering::SeqCst) == 0 {
                    handle.resume();
                }
            }
        })
    };

    let task = {
        let stream = stream.clone();
        tokio::spawn(async move {
            let outcome = stream.start().await;
            // Dropping the listener closes the channel.
            stream.off(listener);
            outcome
        })
    };

    let piped = pipe(&stream, &mut rx, &backlog, out).await;
    if piped.is_err() {
        stream.stop();
        drop(rx);
    }
    let outcome = task.await??;
    piped?;

    tracing::debug!("Read of {} ended: {:?}", path, outcome);
    Ok(())
}

async fn pipe<W>(
    stream: &ReadStream<SandboxFs>,
    rx: &mut mpsc::UnboundedReceiver<Bytes>,
    backlog: &AtomicUsize,
    out: &mut W,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(bytes) = rx.recv().await {
        out.write_all(&bytes).await.context("Failed to write output")?;
        let waiting = backlog.fetch_sub(1, Ordering::SeqCst) - 1;
        if waiting <= READ_LOW_WATER && stream.is_paused() {
            stream.resume();
        }
    }
    out.flush().await.context("Failed to flush output")?;
    Ok(())
}

/// Stdin buffer size for `write`: the block size, within sane bounds.
fn stdin_chunk_len(block_size: u64) -> usize {
    block_size.clamp(1, MAX_STDIN_CHUNK) as usize
}

async fn write_from_stdin(
    access: &FileAccess<SandboxFs>,
    path: &str,
    encoding: Encoding,
    block_size: u64,
) -> Result<()> {
    let stream = access.create_write_stream(FileRef::path(path), StreamConfig::default())?;
    let mut stdin = tokio::io::stdin();

    if encoding == Encoding::Utf8 {
        let mut buf = vec![0u8; stdin_chunk_len(block_size)];
        loop {
            let n = stdin.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            let ack = stream.write(Bytes::copy_from_slice(&buf[..n]));
            // A failed ack halts the stream; `end()` reports why.
            if stream.pending() >= COPY_HIGH_WATER && ack.await.is_err() {
                break;
            }
        }
    } else {
        let mut text = String::new();
        stdin
            .read_to_string(&mut text)
            .await
            .context("Failed to read stdin")?;
        drop(stream.write_str(text.trim(), encoding)?);
    }

    stream.end().await?;
    tracing::info!("Wrote {} bytes to {}", stream.cursor(), path);
    Ok(())
}

async fn copy(access: &FileAccess<SandboxFs>, src: &str, dst: &str, progress: bool) -> Result<()> {
    let size = access.stat(src).await?.size;
    let bar = if progress {
        let bar = ProgressBar::new(size);
        bar.set_style(
            ProgressStyle::with_template("{bar:40.cyan/blue} {bytes}/{total_bytes} ({eta})")?
                .progress_chars("=>-"),
        );
        bar
    } else {
        ProgressBar::hidden()
    };

    let ticker = bar.clone();
    let copied = access
        .copy(FileRef::path(src), dst, move |n| ticker.inc(n))
        .await?;
    bar.finish_and_clear();

    tracing::info!("Copied {} bytes from {} to {}", copied, src, dst);
    Ok(())
}
