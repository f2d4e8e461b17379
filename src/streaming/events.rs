//! Event channel shared by read and write streams.
//!
//! Events are delivered in the order they were queued, one at a time per
//! channel, whichever thread queued them. The thread that finds the channel
//! idle becomes its dispatcher and drains the queue; an emit from any other
//! thread, or from inside a handler, only queues. Handlers run without any
//! lock held, so a handler may register listeners or call back into its
//! stream (`pause()` from a `data` handler).

use crate::error::{Result, StreamError};
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

/// Name of an event, used for subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Data,
    Finish,
    Drain,
    Pause,
    Resume,
    Stop,
    Error,
    Debug,
}

/// An event published by a stream.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A chunk read from the backend
    Data(Bytes),
    /// Every range was delivered
    Finish,
    /// The write queue became empty
    Drain,
    Pause,
    Resume,
    Stop,
    Error(StreamError),
    /// Trace message
    Debug(String),
}

impl StreamEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            StreamEvent::Data(_) => EventKind::Data,
            StreamEvent::Finish => EventKind::Finish,
            StreamEvent::Drain => EventKind::Drain,
            StreamEvent::Pause => EventKind::Pause,
            StreamEvent::Resume => EventKind::Resume,
            StreamEvent::Stop => EventKind::Stop,
            StreamEvent::Error(_) => EventKind::Error,
            StreamEvent::Debug(_) => EventKind::Debug,
        }
    }
}

pub type Handler = Arc<dyn Fn(&StreamEvent) + Send + Sync>;

/// Returned by `on`/`once`; pass to `off` to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Listener {
    id: u64,
    kind: EventKind,
    once: bool,
    handler: Handler,
}

#[derive(Default)]
struct Dispatch {
    pending: VecDeque<StreamEvent>,
    /// A thread is draining `pending`
    running: bool,
}

#[derive(Default)]
pub struct EventChannel {
    listeners: Mutex<Vec<Listener>>,
    next_id: AtomicU64,
    dispatch: Mutex<Dispatch>,
    idle: Notify,
}

/// Releases the dispatcher role even if a handler panics.
struct Dispatching<'a> {
    channel: &'a EventChannel,
    released: bool,
}

impl Drop for Dispatching<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.channel.dispatch().running = false;
        }
        self.channel.idle.notify_waiters();
    }
}

impl std::fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventChannel")
            .field("listeners", &self.listeners().len())
            .finish()
    }
}

impl EventChannel {
    pub fn new() -> Self {
        Self::default()
    }

    fn listeners(&self) -> MutexGuard<'_, Vec<Listener>> {
        // Handlers never run under the lock, so poisoning cannot leave the list torn.
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn dispatch(&self) -> MutexGuard<'_, Dispatch> {
        self.dispatch
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register `handler` for `kind`; a `once` handler is removed after its first call.
    pub fn add_listener(&self, kind: EventKind, handler: Handler, once: bool) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners().push(Listener {
            id,
            kind,
            once,
            handler,
        });
        ListenerId(id)
    }

    pub fn on<F>(&self, kind: EventKind, handler: F) -> ListenerId
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        self.add_listener(kind, Arc::new(handler), false)
    }

    pub fn once<F>(&self, kind: EventKind, handler: F) -> ListenerId
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        self.add_listener(kind, Arc::new(handler), true)
    }

    /// Remove a listener. Returns false if it was already gone.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners();
        let before = listeners.len();
        listeners.retain(|l| l.id != id.0);
        listeners.len() != before
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners().iter().filter(|l| l.kind == kind).count()
    }

    /// Queue `event` and deliver everything pending.
    ///
    /// Returns the number of handlers registered for the event's kind when
    /// it was queued. If another thread is delivering, or this is a handler
    /// emitting from inside a delivery, the event is delivered by that
    /// dispatcher right after the events queued before it.
    pub fn emit(&self, event: &StreamEvent) -> usize {
        let count = self.queue(event.clone());
        self.flush();
        count
    }

    /// Queue `event` without delivering it. Pair with `flush()`.
    ///
    /// Takes no lock other than the queue's, so it may be called while the
    /// caller holds its own state lock.
    pub fn queue(&self, event: StreamEvent) -> usize {
        let count = self.listener_count(event.kind());
        if count > 0 {
            self.dispatch().pending.push_back(event);
        }
        count
    }

    /// Deliver queued events unless another dispatcher is already at it.
    pub fn flush(&self) {
        {
            let mut dispatch = self.dispatch();
            if dispatch.running || dispatch.pending.is_empty() {
                return;
            }
            dispatch.running = true;
        }

        let mut guard = Dispatching {
            channel: self,
            released: false,
        };
        loop {
            let next = {
                let mut dispatch = self.dispatch();
                match dispatch.pending.pop_front() {
                    Some(event) => event,
                    None => {
                        dispatch.running = false;
                        guard.released = true;
                        break;
                    }
                }
            };
            self.deliver(&next);
        }
    }

    /// Wait until every queued event has been delivered.
    pub async fn settled(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.flush();
            {
                let dispatch = self.dispatch();
                if !dispatch.running && dispatch.pending.is_empty() {
                    return;
                }
            }
            notified.await;
        }
    }

    fn deliver(&self, event: &StreamEvent) {
        let kind = event.kind();
        let handlers: Vec<Handler> = {
            let mut listeners = self.listeners();
            let mut selected = Vec::new();
            listeners.retain(|l| {
                if l.kind != kind {
                    return true;
                }
                selected.push(Arc::clone(&l.handler));
                !l.once
            });
            selected
        };

        for handler in &handlers {
            handler(event);
        }
    }

    /// Publish a trace message on the `debug` channel and to `tracing`.
    pub fn debug(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!("{}", message);
        self.emit(&StreamEvent::Debug(message));
    }

    /// Route an error to `error` listeners.
    ///
    /// With no listener the error is handed back so the calling operation
    /// fails with it instead of dropping it.
    pub fn emit_error(&self, err: StreamError) -> Result<()> {
        if self.emit(&StreamEvent::Error(err.clone())) == 0 {
            tracing::error!("Unobserved stream error: {}", err);
            return Err(err);
        }
        Ok(())
    }
}

/// Subscription surface shared by every stream type.
pub trait Publisher {
    fn events(&self) -> &EventChannel;

    fn on<F>(&self, kind: EventKind, handler: F) -> ListenerId
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        self.events().on(kind, handler)
    }

    fn once<F>(&self, kind: EventKind, handler: F) -> ListenerId
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        self.events().once(kind, handler)
    }

    fn off(&self, id: ListenerId) -> bool {
        self.events().off(id)
    }
}
