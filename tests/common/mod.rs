//! Shared helpers for integration tests.
//!
//! `GatedFs` parks every backend call until the test answers it, so tests
//! decide exactly when each chunk read or append completes.

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use cofs::{Backend, EventKind, FileObject, Publisher, StreamEvent};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone)]
pub struct GatedFile {
    path: String,
    size: u64,
}

impl FileObject for GatedFile {
    fn size(&self) -> u64 {
        self.size
    }

    fn full_path(&self) -> &str {
        &self.path
    }
}

/// A backend call waiting for the test to answer it.
#[derive(Debug)]
pub enum Call {
    Read {
        start: u64,
        end: u64,
        reply: oneshot::Sender<Result<Bytes>>,
    },
    Write {
        offset: u64,
        data: Bytes,
        reply: oneshot::Sender<Result<()>>,
    },
    Create {
        path: String,
        reply: oneshot::Sender<Result<()>>,
    },
}

pub struct GatedFs {
    size: u64,
    calls: mpsc::UnboundedSender<Call>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl GatedFs {
    /// Backend whose files all report `size` bytes.
    pub fn new(size: u64) -> (Arc<Self>, Calls) {
        let (tx, rx) = mpsc::unbounded_channel();
        let fs = Arc::new(Self {
            size,
            calls: tx,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        });
        (fs, Calls { rx })
    }

    /// Highest number of reads or writes outstanding at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn gate<T>(&self, call: impl FnOnce(oneshot::Sender<Result<T>>) -> Call) -> Result<T> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let (tx, rx) = oneshot::channel();
        let outcome = match self.calls.send(call(tx)) {
            Ok(()) => rx
                .await
                .unwrap_or_else(|_| Err(anyhow::anyhow!("test dropped the call"))),
            Err(_) => Err(anyhow::anyhow!("test is gone")),
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}

#[async_trait]
impl Backend for GatedFs {
    type File = GatedFile;

    async fn resolve_file(&self, path: &str) -> Result<GatedFile> {
        Ok(GatedFile {
            path: format!("/{}", path.trim_start_matches('/')),
            size: self.size,
        })
    }

    async fn read_part(&self, _file: &GatedFile, start: u64, end: u64) -> Result<Bytes> {
        self.gate(|reply| Call::Read { start, end, reply }).await
    }

    async fn write_part(&self, _file: &GatedFile, offset: u64, data: Bytes) -> Result<()> {
        self.gate(|reply| Call::Write {
            offset,
            data,
            reply,
        })
        .await
    }

    async fn create_empty(&self, path: &str) -> Result<GatedFile> {
        let path = path.to_string();
        self.gate(|reply| Call::Create {
            path: path.clone(),
            reply,
        })
        .await?;
        Ok(GatedFile {
            path: format!("/{}", path.trim_start_matches('/')),
            size: 0,
        })
    }
}

/// Test side of a `GatedFs`.
pub struct Calls {
    rx: mpsc::UnboundedReceiver<Call>,
}

impl Calls {
    /// The next parked call. Panics if none shows up within a second.
    pub async fn next(&mut self) -> Call {
        tokio::time::timeout(Duration::from_secs(1), self.rx.recv())
            .await
            .expect("timed out waiting for a backend call")
            .expect("backend dropped")
    }

    /// Panics if a call arrives within a short grace period.
    pub async fn assert_idle(&mut self) {
        if let Ok(Some(call)) =
            tokio::time::timeout(Duration::from_millis(50), self.rx.recv()).await
        {
            panic!("Unexpected backend call: {:?}", call);
        }
    }

    pub async fn expect_read(&mut self, start: u64, end: u64) -> oneshot::Sender<Result<Bytes>> {
        match self.next().await {
            Call::Read {
                start: s,
                end: e,
                reply,
            } => {
                assert_eq!((s, e), (start, end), "read range");
                reply
            }
            other => panic!("Expected read [{}, {}), got {:?}", start, end, other),
        }
    }

    pub async fn expect_write(&mut self, offset: u64, data: &[u8]) -> oneshot::Sender<Result<()>> {
        match self.next().await {
            Call::Write {
                offset: o,
                data: d,
                reply,
            } => {
                assert_eq!(o, offset, "write offset");
                assert_eq!(&d[..], data, "write payload");
                reply
            }
            other => panic!("Expected write at {}, got {:?}", offset, other),
        }
    }

    pub async fn expect_create(&mut self) -> oneshot::Sender<Result<()>> {
        match self.next().await {
            Call::Create { reply, .. } => reply,
            other => panic!("Expected create, got {:?}", other),
        }
    }
}

/// Records events from a stream as short labels.
#[derive(Clone, Default)]
pub struct Recorder {
    entries: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    pub fn attach(stream: &impl Publisher) -> Self {
        let recorder = Self::default();
        for kind in [
            EventKind::Data,
            EventKind::Finish,
            EventKind::Drain,
            EventKind::Pause,
            EventKind::Resume,
            EventKind::Stop,
            EventKind::Error,
        ] {
            let entries = Arc::clone(&recorder.entries);
            stream.on(kind, move |event| {
                let label = match event {
                    StreamEvent::Data(data) => format!("data:{}", String::from_utf8_lossy(data)),
                    StreamEvent::Finish => "finish".to_string(),
                    StreamEvent::Drain => "drain".to_string(),
                    StreamEvent::Pause => "pause".to_string(),
                    StreamEvent::Resume => "resume".to_string(),
                    StreamEvent::Stop => "stop".to_string(),
                    StreamEvent::Error(_) => "error".to_string(),
                    StreamEvent::Debug(_) => return,
                };
                entries.lock().unwrap().push(label);
            });
        }
        recorder
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }

    pub fn count(&self, label: &str) -> usize {
        self.entries().iter().filter(|e| e.as_str() == label).count()
    }

    /// Wait until `label` has been recorded `times` times.
    pub async fn wait_for(&self, label: &str, times: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        while self.count(label) < times {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {} x{}, have {:?}",
                label,
                times,
                self.entries()
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}
