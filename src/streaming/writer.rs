//! Write stream: ordered, single-flight appends fed by a pending-write queue.
//!
//! `write` only enqueues. A driver task primes the target with a zero-length
//! create, then drains the queue one entry at a time, each append landing at
//! the current cursor. At most one append is in flight per stream.
//!
//! A backend error with no `error` listener is never dropped: it is returned
//! by `end()`, handed to the next `write()`, or raised as a panic when the
//! stream is dropped without either.

use crate::backend::{Backend, FileObject, FileRef};
use crate::config::StreamConfig;
use crate::encoding::Encoding;
use crate::error::{BackendOp, Result, StreamError};
use crate::streaming::events::{EventChannel, Publisher, StreamEvent};
use crate::streaming::flow::FlowControl;
use bytes::Bytes;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::sync::{oneshot, Notify};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    /// Creating the target; dequeuing is held
    Priming,
    /// Waiting for writes (or for resume)
    Ready,
    Writing,
    /// `end()` flushed every queued write
    Ended,
    Stopped,
    Errored,
}

/// Final state of the driver, returned by `end()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Ended,
    Stopped,
    /// A backend error was delivered to an `error` listener
    Errored,
}

/// Completion of one `write`: the cursor after the append, or why it never landed.
#[derive(Debug)]
pub struct WriteAck {
    rx: oneshot::Receiver<Result<u64>>,
}

impl WriteAck {
    fn rejected(err: StreamError) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(err));
        Self { rx }
    }
}

impl Future for WriteAck {
    type Output = Result<u64>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // Sender dropped: the entry was discarded by stop or a halted queue.
            Poll::Ready(Err(_)) => Poll::Ready(Err(StreamError::Discarded)),
            Poll::Pending => Poll::Pending,
        }
    }
}

struct PendingWrite {
    payload: Bytes,
    ack: oneshot::Sender<Result<u64>>,
}

#[derive(Default)]
struct Queue {
    entries: VecDeque<PendingWrite>,
    /// No further writes are accepted
    closed: bool,
}

enum Next {
    Write(PendingWrite),
    Wait,
    Done,
}

struct Inner<B: Backend> {
    backend: Arc<B>,
    file: FileRef<B::File>,
    events: EventChannel,
    flow: FlowControl,
    queue: Mutex<Queue>,
    pushed: Notify,
    state: Mutex<WriteState>,
    /// Append offset, advanced as writes complete
    cursor: AtomicU64,
    /// Error no listener received and no caller has been handed yet
    fault: Mutex<Option<StreamError>>,
}

/// A write stream bound to one file. Dropping it lets queued writes finish.
pub struct WriteStream<B: Backend> {
    inner: Arc<Inner<B>>,
    driver: Mutex<Option<JoinHandle<Result<WriteOutcome>>>>,
    runtime: Handle,
}

impl<B: Backend> Publisher for WriteStream<B> {
    fn events(&self) -> &EventChannel {
        &self.inner.events
    }
}

impl<B: Backend> WriteStream<B> {
    /// Create the stream and start priming the target.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(backend: Arc<B>, file: FileRef<B::File>, config: StreamConfig) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current()
            .map_err(|_| StreamError::InvalidState("outside a tokio runtime"))?;

        let inner = Arc::new(Inner {
            backend,
            file,
            events: EventChannel::new(),
            flow: FlowControl::new(),
            queue: Mutex::new(Queue::default()),
            pushed: Notify::new(),
            state: Mutex::new(WriteState::Priming),
            cursor: AtomicU64::new(config.start),
            fault: Mutex::new(None),
        });
        let driver = runtime.spawn(Arc::clone(&inner).drive());

        Ok(Self {
            inner,
            driver: Mutex::new(Some(driver)),
            runtime,
        })
    }

    pub fn state(&self) -> WriteState {
        *self.inner.lock_state()
    }

    /// Offset the next append lands at.
    pub fn cursor(&self) -> u64 {
        self.inner.cursor.load(Ordering::SeqCst)
    }

    /// Writes queued but not yet submitted.
    pub fn pending(&self) -> usize {
        self.inner.queue().entries.len()
    }

    pub fn is_paused(&self) -> bool {
        self.inner.flow.is_paused()
    }

    /// Enqueue `data`. Returns immediately; await the ack for completion.
    ///
    /// Once the stream has halted the ack fails with `Closed`, or with the
    /// halting error if nobody has been handed it yet.
    pub fn write(&self, data: impl Into<Bytes>) -> WriteAck {
        let (tx, rx) = oneshot::channel();
        {
            let mut queue = self.inner.queue();
            if queue.closed {
                let err = self.inner.take_fault().unwrap_or(StreamError::Closed);
                return WriteAck::rejected(err);
            }
            queue.entries.push_back(PendingWrite {
                payload: data.into(),
                ack: tx,
            });
        }
        self.inner.pushed.notify_one();
        WriteAck { rx }
    }

    /// Decode `text` with `encoding` and enqueue it. Malformed text enqueues nothing.
    pub fn write_str(&self, text: &str, encoding: Encoding) -> Result<WriteAck> {
        let payload = encoding.decode(text)?;
        Ok(self.write(payload))
    }

    /// Hold dequeuing. Queued writes stay queued.
    pub fn pause(&self) {
        let events = &self.inner.events;
        if self.inner.flow.pause_with(|| {
            events.queue(StreamEvent::Pause);
        }) {
            events.flush();
        }
    }

    pub fn resume(&self) {
        let events = &self.inner.events;
        if self.inner.flow.resume_with(|| {
            events.queue(StreamEvent::Resume);
        }) {
            events.flush();
        }
    }

    /// Discard every queued write and halt for good.
    ///
    /// An append already submitted to the backend cannot be recalled; its
    /// result is dropped.
    pub fn stop(&self) {
        let events = &self.inner.events;
        if !self.inner.flow.stop_with(|| {
            events.queue(StreamEvent::Stop);
        }) {
            return;
        }
        let discarded = self.inner.close_queue();
        self.inner.pushed.notify_one();
        events.flush();
        if discarded > 0 {
            events.debug(format!("Stopped, discarding {} queued writes", discarded));
        }
    }

    /// Refuse new writes, wait for the queue to flush and the driver to exit.
    ///
    /// An error nobody listened for is returned here. A paused stream only
    /// finishes after `resume()`.
    pub async fn end(&self) -> Result<WriteOutcome> {
        self.inner.queue().closed = true;
        self.inner.pushed.notify_one();

        let driver = self
            .driver
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(driver) = driver else {
            return Err(StreamError::InvalidState("already ended"));
        };

        let result = driver.await;
        // Whatever the driver failed with is handed over here.
        self.inner.take_fault();
        match result {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => Err(StreamError::InvalidState("write driver cancelled")),
        }
    }
}

impl<B: Backend> Drop for WriteStream<B> {
    fn drop(&mut self) {
        self.inner.queue().closed = true;
        self.inner.pushed.notify_one();

        let driver = self
            .driver
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        // `end()` already reported the outcome.
        let Some(driver) = driver else {
            return;
        };

        if let Some(err) = self.inner.take_fault() {
            if !std::thread::panicking() {
                panic!("{}", unobserved(&self.inner.file, &err));
            }
            return;
        }

        // Queued writes still land; an unobserved failure among them is raised
        // on the runtime.
        let inner = Arc::clone(&self.inner);
        self.runtime.spawn(async move {
            let _ = driver.await;
            if let Some(err) = inner.take_fault() {
                panic!("{}", unobserved(&inner.file, &err));
            }
        });
    }
}

fn unobserved<F: FileObject>(file: &FileRef<F>, err: &StreamError) -> String {
    format!(
        "Write stream for {} failed with no error listener: {}",
        file.display_path(),
        err
    )
}

impl<B: Backend> Inner<B> {
    fn queue(&self) -> MutexGuard<'_, Queue> {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_state(&self) -> MutexGuard<'_, WriteState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, next: WriteState) {
        let mut state = self.lock_state();
        if *state != next {
            tracing::trace!("Write stream {:?} -> {:?}", *state, next);
            *state = next;
        }
    }

    fn take_fault(&self) -> Option<StreamError> {
        self.fault
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// Close the queue and drop its entries. Their acks resolve as discarded.
    fn close_queue(&self) -> usize {
        let discarded: Vec<PendingWrite> = {
            let mut queue = self.queue();
            queue.closed = true;
            queue.entries.drain(..).collect()
        };
        discarded.len()
    }

    fn next_entry(&self) -> Next {
        let mut queue = self.queue();
        match queue.entries.pop_front() {
            Some(entry) => Next::Write(entry),
            None if queue.closed => Next::Done,
            None => Next::Wait,
        }
    }

    async fn drive(self: Arc<Self>) -> Result<WriteOutcome> {
        let outcome = self.run().await;
        self.events.settled().await;
        outcome
    }

    async fn run(&self) -> Result<WriteOutcome> {
        if self.flow.is_stopped() {
            self.set_state(WriteState::Stopped);
            return Ok(WriteOutcome::Stopped);
        }
        let target = self.file.display_path().to_string();
        self.events.debug(format!("Priming {}", target));

        let file = match self.backend.create_empty(&target).await {
            Ok(file) => file,
            Err(e) => return self.fail(StreamError::backend(BackendOp::CreateEmpty, e)),
        };
        self.events
            .debug(format!("Primed {}, starting writes", file.full_path()));

        let mut flow_rx = self.flow.subscribe();
        loop {
            let flow = *flow_rx.borrow_and_update();
            if flow.stopped {
                self.set_state(WriteState::Stopped);
                return Ok(WriteOutcome::Stopped);
            }
            if flow.paused {
                self.set_state(WriteState::Ready);
                if flow_rx.changed().await.is_err() {
                    return Ok(WriteOutcome::Stopped);
                }
                continue;
            }

            let entry = match self.next_entry() {
                Next::Write(entry) => entry,
                Next::Done => {
                    self.set_state(WriteState::Ended);
                    self.events.debug(format!("Closed {}", file.full_path()));
                    return Ok(WriteOutcome::Ended);
                }
                Next::Wait => {
                    self.set_state(WriteState::Ready);
                    tokio::select! {
                        _ = self.pushed.notified() => {}
                        changed = flow_rx.changed() => {
                            if changed.is_err() {
                                return Ok(WriteOutcome::Stopped);
                            }
                        }
                    }
                    continue;
                }
            };

            self.set_state(WriteState::Writing);
            let offset = self.cursor.load(Ordering::SeqCst);
            let len = entry.payload.len() as u64;
            let written = self.backend.write_part(&file, offset, entry.payload).await;

            if self.flow.is_stopped() {
                self.events.debug("Stopped, dropping in-flight write result");
                self.set_state(WriteState::Stopped);
                return Ok(WriteOutcome::Stopped);
            }

            match written {
                Ok(()) => {
                    let next = offset + len;
                    self.cursor.store(next, Ordering::SeqCst);
                    let _ = entry.ack.send(Ok(next));

                    let drained = self.queue().entries.is_empty();
                    if drained {
                        self.events.emit(&StreamEvent::Drain);
                    }
                }
                Err(e) => {
                    let err = StreamError::backend(BackendOp::WritePart, e);
                    let _ = entry.ack.send(Err(err.clone()));
                    return self.fail(err);
                }
            }
        }
    }

    /// Halt the queue for good and route `err` through the error channel.
    fn fail(&self, err: StreamError) -> Result<WriteOutcome> {
        let discarded = self.close_queue();
        tracing::warn!(
            "Write stream failed at offset {} ({} queued writes discarded): {}",
            self.cursor.load(Ordering::SeqCst),
            discarded,
            err
        );
        let outcome = match self.events.emit_error(err) {
            Ok(()) => Ok(WriteOutcome::Errored),
            Err(err) => {
                *self
                    .fault
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(err.clone());
                Err(err)
            }
        };
        self.set_state(WriteState::Errored);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryFs;
    use crate::streaming::events::EventKind;
    use crate::streaming::test_utils::EventLog;
    use std::time::Duration;

    fn writer(fs: &Arc<MemoryFs>) -> WriteStream<MemoryFs> {
        WriteStream::new(Arc::clone(fs), FileRef::path("out.txt"), StreamConfig::new()).unwrap()
    }

    #[tokio::test]
    async fn test_writes_append_in_order() {
        let fs = Arc::new(MemoryFs::new());
        let stream = writer(&fs);

        let first = stream.write("hello ");
        let second = stream.write(b"world".to_vec());

        assert_eq!(first.await.unwrap(), 6);
        assert_eq!(second.await.unwrap(), 11);
        assert_eq!(stream.end().await.unwrap(), WriteOutcome::Ended);

        assert_eq!(fs.contents("out.txt").unwrap(), b"hello world");
        assert_eq!(fs.write_log(), vec![(0, 6), (6, 5)]);
        assert_eq!(stream.cursor(), 11);
        assert_eq!(stream.state(), WriteState::Ended);
    }

    #[tokio::test]
    async fn test_priming_truncates_existing_file() {
        let fs = Arc::new(MemoryFs::new());
        fs.insert("out.txt", b"previous contents".to_vec());
        let stream = writer(&fs);

        stream.write("new").await.unwrap();
        stream.end().await.unwrap();

        assert_eq!(fs.contents("out.txt").unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_end_without_writes_creates_empty_file() {
        let fs = Arc::new(MemoryFs::new());
        let stream = writer(&fs);

        assert_eq!(stream.end().await.unwrap(), WriteOutcome::Ended);
        assert_eq!(fs.contents("out.txt").unwrap(), b"");
        assert!(matches!(
            stream.end().await,
            Err(StreamError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_drain_fires_once_per_burst() {
        let fs = Arc::new(MemoryFs::new());
        let stream = writer(&fs);
        let log = EventLog::attach(stream.events());

        let acks: Vec<_> = ["a", "b", "c"].iter().map(|s| stream.write(*s)).collect();
        for ack in acks {
            ack.await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(log.count("drain"), 1);

        stream.write("d").await.unwrap();
        stream.end().await.unwrap();
        assert_eq!(log.count("drain"), 2);
    }

    #[tokio::test]
    async fn test_pause_holds_queue_until_resume() {
        let fs = Arc::new(MemoryFs::new());
        let stream = writer(&fs);
        stream.pause();

        let ack = stream.write("held");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(stream.pending(), 1);
        assert!(fs.write_log().is_empty());

        stream.resume();
        assert_eq!(ack.await.unwrap(), 4);
        assert_eq!(stream.pending(), 0);
        stream.end().await.unwrap();
        assert_eq!(fs.contents("out.txt").unwrap(), b"held");
    }

    #[tokio::test]
    async fn test_stop_discards_pending_writes() {
        let fs = Arc::new(MemoryFs::new());
        let stream = writer(&fs);
        let log = EventLog::attach(stream.events());
        stream.pause();

        let first = stream.write("one");
        let second = stream.write("two");
        stream.stop();
        stream.stop();

        assert!(matches!(first.await, Err(StreamError::Discarded)));
        assert!(matches!(second.await, Err(StreamError::Discarded)));
        assert!(matches!(stream.write("late").await, Err(StreamError::Closed)));
        assert_eq!(stream.end().await.unwrap(), WriteOutcome::Stopped);

        assert_eq!(log.entries(), vec!["pause", "stop"]);
        assert!(fs.write_log().is_empty());
        assert!(!fs.exists("out.txt"));
    }

    #[tokio::test]
    async fn test_observed_append_failure_halts_queue() {
        let fs = Arc::new(MemoryFs::new());
        fs.fail_writes_from(3);
        let stream = writer(&fs);
        let log = EventLog::attach(stream.events());
        stream.pause();

        let ok = stream.write("abc");
        let failed = stream.write("def");
        let never = stream.write("ghi");
        stream.resume();

        assert_eq!(ok.await.unwrap(), 3);
        assert!(failed.await.unwrap_err().is_backend());
        assert!(matches!(never.await, Err(StreamError::Discarded)));
        assert_eq!(stream.end().await.unwrap(), WriteOutcome::Errored);

        assert_eq!(log.count("error"), 1);
        assert_eq!(stream.state(), WriteState::Errored);
        assert_eq!(fs.contents("out.txt").unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_unobserved_append_failure_surfaces_from_end() {
        let fs = Arc::new(MemoryFs::new());
        fs.fail_writes_from(0);
        let stream = writer(&fs);

        let ack = stream.write("boom");
        assert!(ack.await.is_err());

        let err = stream.end().await.unwrap_err();
        assert!(matches!(
            err,
            StreamError::Backend {
                op: BackendOp::WritePart,
                ..
            }
        ));
    }

    async fn wait_for_state(stream: &WriteStream<MemoryFs>, state: WriteState) {
        for _ in 0..200 {
            if stream.state() == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("stream never reached {:?}, still {:?}", state, stream.state());
    }

    #[tokio::test]
    async fn test_next_write_returns_unobserved_failure() {
        let fs = Arc::new(MemoryFs::new());
        fs.fail_writes_from(0);
        let stream = writer(&fs);

        drop(stream.write("boom"));
        wait_for_state(&stream, WriteState::Errored).await;

        let err = stream.write("again").await.unwrap_err();
        assert!(err.is_backend());
        // Handed over once; later writes only see the closed stream.
        assert!(matches!(stream.write("later").await, Err(StreamError::Closed)));
        assert!(stream.end().await.unwrap_err().is_backend());
    }

    #[tokio::test]
    async fn test_dropping_stream_raises_unobserved_failure() {
        let fs = Arc::new(MemoryFs::new());
        fs.fail_writes_from(0);
        let stream = writer(&fs);

        drop(stream.write("boom"));
        wait_for_state(&stream, WriteState::Errored).await;

        let dropped = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || drop(stream)));
        let payload = dropped.unwrap_err();
        let message = payload.downcast_ref::<String>().unwrap();
        assert!(message.contains("failed with no error listener"), "{}", message);
        assert!(message.contains("out.txt"));
    }

    #[tokio::test]
    async fn test_dropping_stream_after_end_is_quiet() {
        let fs = Arc::new(MemoryFs::new());
        fs.fail_writes_from(0);
        let stream = writer(&fs);

        drop(stream.write("boom"));
        assert!(stream.end().await.is_err());
        drop(stream);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_resume_handlers_finish_before_drain() {
        let fs = Arc::new(MemoryFs::new());
        let stream = writer(&fs);
        let log = EventLog::attach(stream.events());
        stream.on(EventKind::Resume, |_| {
            std::thread::sleep(Duration::from_millis(50));
        });

        stream.pause();
        let ack = stream.write("held");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(fs.write_log().is_empty());

        stream.resume();
        assert_eq!(ack.await.unwrap(), 4);
        stream.end().await.unwrap();
        assert_eq!(log.entries(), vec!["pause", "resume", "drain"]);
    }

    #[tokio::test]
    async fn test_write_str_decodes_payload() {
        let fs = Arc::new(MemoryFs::new());
        let stream = writer(&fs);

        stream.write_str("68656c6c6f", Encoding::Hex).unwrap().await.unwrap();
        stream.write_str("IHdvcmxk", Encoding::Base64).unwrap().await.unwrap();
        assert!(stream.write_str("zz", Encoding::Hex).is_err());
        stream.end().await.unwrap();

        assert_eq!(fs.contents("out.txt").unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_start_offset_seeds_cursor() {
        let fs = Arc::new(MemoryFs::new());
        let stream = WriteStream::new(
            Arc::clone(&fs),
            FileRef::path("out.txt"),
            StreamConfig::new().with_start(2),
        )
        .unwrap();

        assert_eq!(stream.write("xy").await.unwrap(), 4);
        stream.end().await.unwrap();
        assert_eq!(fs.contents("out.txt").unwrap(), b"\0\0xy");
    }

    #[tokio::test]
    async fn test_drain_handler_can_write_again() {
        let fs = Arc::new(MemoryFs::new());
        let stream = Arc::new(writer(&fs));

        let again = Arc::clone(&stream);
        stream.once(EventKind::Drain, move |_| {
            drop(again.write("!"));
        });

        stream.write("hi").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        stream.end().await.unwrap();
        assert_eq!(fs.contents("out.txt").unwrap(), b"hi!");
    }

    #[test]
    fn test_new_outside_runtime_fails() {
        let fs = Arc::new(MemoryFs::new());
        let result = WriteStream::new(fs, FileRef::path("out.txt"), StreamConfig::new());
        assert!(matches!(result, Err(StreamError::InvalidState(_))));
    }
}
