//! Read stream: sequential chunk pulls with pause-deferred delivery.
//!
//! The pull loop walks a `ChunkPlan` one range at a time. A chunk fetched
//! while paused is held and delivered only after `resume()`, behind the
//! `resume` event; `finish` is deferred the same way. `stop()` is observed
//! once the in-flight fetch returns, and its result is dropped.

use crate::backend::{self, Backend, FileObject, FileRef};
use crate::config::StreamConfig;
use crate::error::{BackendOp, Result, StreamError};
use crate::streaming::chunks::ChunkPlan;
use crate::streaming::events::{EventChannel, Publisher, StreamEvent};
use crate::streaming::flow::FlowControl;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    Idle,
    Resolving,
    Fetching,
    /// A chunk (or `finish`) is held until resume
    AwaitingResume,
    Delivering,
    Finished,
    Stopped,
    Errored,
}

/// How a call to `start` ended when it did not fail outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Finished,
    Stopped,
    /// A backend error was delivered to an `error` listener
    Errored,
}

struct Inner<B: Backend> {
    backend: Arc<B>,
    file: FileRef<B::File>,
    config: StreamConfig,
    events: EventChannel,
    flow: FlowControl,
    state: Mutex<ReadState>,
    /// Next byte offset to fetch
    cursor: AtomicU64,
}

/// Handle to a read stream. Clones share the same stream.
pub struct ReadStream<B: Backend> {
    inner: Arc<Inner<B>>,
}

impl<B: Backend> Clone for ReadStream<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Backend> Publisher for ReadStream<B> {
    fn events(&self) -> &EventChannel {
        &self.inner.events
    }
}

impl<B: Backend> ReadStream<B> {
    /// Create an idle stream. Invalid ranges fail here, before any I/O.
    pub fn new(backend: Arc<B>, file: FileRef<B::File>, config: StreamConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                backend,
                file,
                cursor: AtomicU64::new(config.start),
                config,
                events: EventChannel::new(),
                flow: FlowControl::new(),
                state: Mutex::new(ReadState::Idle),
            }),
        })
    }

    pub fn state(&self) -> ReadState {
        *self.lock_state()
    }

    pub fn cursor(&self) -> u64 {
        self.inner.cursor.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &StreamConfig {
        &self.inner.config
    }

    pub fn file_ref(&self) -> &FileRef<B::File> {
        &self.inner.file
    }

    pub fn is_paused(&self) -> bool {
        self.inner.flow.is_paused()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.flow.is_stopped()
    }

    /// Defer delivery of chunks and `finish` until `resume()`.
    pub fn pause(&self) {
        let events = &self.inner.events;
        if self.inner.flow.pause_with(|| {
            events.queue(StreamEvent::Pause);
        }) {
            events.flush();
        }
    }

    /// Release a held chunk or `finish`; it is delivered after `resume` handlers.
    pub fn resume(&self) {
        let events = &self.inner.events;
        if self.inner.flow.resume_with(|| {
            events.queue(StreamEvent::Resume);
        }) {
            events.flush();
        }
    }

    /// Stop for good. Nothing but this `stop` event is emitted afterwards.
    pub fn stop(&self) {
        let events = &self.inner.events;
        if self.inner.flow.stop_with(|| {
            events.queue(StreamEvent::Stop);
        }) {
            events.flush();
        }
    }

    /// Run the pull loop to completion.
    ///
    /// A backend error is emitted on `error`; with no listener it is returned
    /// as `Err` instead.
    pub async fn start(&self) -> Result<ReadOutcome> {
        {
            let mut state = self.lock_state();
            if *state != ReadState::Idle {
                return Err(StreamError::InvalidState("already started"));
            }
            *state = ReadState::Resolving;
        }
        let outcome = self.run().await;
        // Return only once this run's events have reached their handlers.
        self.inner.events.settled().await;
        outcome
    }

    /// Run the pull loop on the tokio runtime.
    pub fn spawn(&self) -> JoinHandle<Result<ReadOutcome>> {
        let stream = self.clone();
        tokio::spawn(async move { stream.start().await })
    }

    async fn run(&self) -> Result<ReadOutcome> {
        let inner = &self.inner;
        if inner.flow.is_stopped() {
            return Ok(self.halt());
        }

        let file = match backend::resolve(inner.backend.as_ref(), &inner.file).await {
            Ok(file) => file,
            Err(e) => return self.fail(StreamError::backend(BackendOp::Resolve, e)),
        };
        if inner.flow.is_stopped() {
            return Ok(self.halt());
        }

        inner
            .events
            .debug(format!("Starting stream for {}", file.full_path()));
        let plan = ChunkPlan::for_config(&inner.config, file.size());

        for range in plan {
            if inner.flow.is_stopped() {
                return Ok(self.halt());
            }

            self.set_state(ReadState::Fetching);
            let fetched = inner
                .backend
                .read_part(&file, range.start, range.end)
                .await;

            if inner.flow.is_stopped() {
                inner.events.debug("Stopped, discarding fetched chunk");
                return Ok(self.halt());
            }
            let data = match fetched {
                Ok(data) => data,
                Err(e) => return self.fail(StreamError::backend(BackendOp::ReadPart, e)),
            };

            inner.events.debug("Sending data block");
            let end = range.end;
            let delivered = self
                .deliver(StreamEvent::Data(data), "data", || {
                    self.set_state(ReadState::Delivering);
                    inner.cursor.store(end, Ordering::SeqCst);
                })
                .await;
            if !delivered {
                return Ok(self.halt());
            }
        }

        inner.events.debug("Sending finish");
        let delivered = self
            .deliver(StreamEvent::Finish, "finish", || {
                self.set_state(ReadState::Finished)
            })
            .await;
        if !delivered {
            return Ok(self.halt());
        }
        Ok(ReadOutcome::Finished)
    }

    /// Deliver `event` once the stream is flowing, waiting out any pause.
    ///
    /// `commit` and the queueing of `event` happen together with respect to
    /// pause, resume and stop. Returns false if the stream stopped first.
    async fn deliver(&self, event: StreamEvent, what: &str, commit: impl Fn()) -> bool {
        let inner = &self.inner;
        let mut held = false;
        loop {
            let flow = inner.flow.if_flowing(|| {
                commit();
                inner.events.queue(event.clone());
            });
            if flow.stopped {
                return false;
            }
            if !flow.paused {
                inner.events.flush();
                if held {
                    tracing::debug!("Resumed, sent {}", what);
                }
                return true;
            }

            if !held {
                held = true;
                self.set_state(ReadState::AwaitingResume);
                inner
                    .events
                    .debug(format!("Paused, waiting for resume to send {}", what));
            }
            if inner.flow.until_unpaused().await.stopped {
                return false;
            }
        }
    }

    fn halt(&self) -> ReadOutcome {
        self.set_state(ReadState::Stopped);
        tracing::debug!("Read stream stopped at offset {}", self.cursor());
        ReadOutcome::Stopped
    }

    fn fail(&self, err: StreamError) -> Result<ReadOutcome> {
        self.set_state(ReadState::Errored);
        tracing::warn!("Read stream failed: {}", err);
        self.inner.events.emit_error(err)?;
        Ok(ReadOutcome::Errored)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ReadState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, next: ReadState) {
        let mut state = self.lock_state();
        tracing::trace!("Read stream {:?} -> {:?}", *state, next);
        *state = next;
    }
}
