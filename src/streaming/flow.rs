//! Pause/resume/stop flags shared between a stream handle and its driver loop.

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flow {
    pub paused: bool,
    pub stopped: bool,
}

impl Flow {
    pub fn is_flowing(&self) -> bool {
        !self.paused && !self.stopped
    }
}

/// Flow flags behind a watch channel so loops can await changes.
///
/// Stop is terminal: once set, `pause` and `resume` no longer change anything.
#[derive(Debug)]
pub struct FlowControl {
    tx: watch::Sender<Flow>,
}

impl Default for FlowControl {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowControl {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Flow::default());
        Self { tx }
    }

    pub fn current(&self) -> Flow {
        *self.tx.borrow()
    }

    pub fn is_paused(&self) -> bool {
        self.current().paused
    }

    pub fn is_stopped(&self) -> bool {
        self.current().stopped
    }

    /// Returns true if the flag changed.
    pub fn pause(&self) -> bool {
        self.pause_with(|| {})
    }

    pub fn resume(&self) -> bool {
        self.resume_with(|| {})
    }

    pub fn stop(&self) -> bool {
        self.stop_with(|| {})
    }

    /// Set the pause flag and, if it changed, run `announce` before any
    /// waiter can observe the change.
    pub fn pause_with(&self, announce: impl FnOnce()) -> bool {
        self.transition(
            |flow| {
                if flow.paused || flow.stopped {
                    return false;
                }
                flow.paused = true;
                true
            },
            announce,
        )
    }

    /// Clear the pause flag. `announce` runs before the loop can move on, so
    /// anything it queues lands ahead of held deliveries.
    pub fn resume_with(&self, announce: impl FnOnce()) -> bool {
        self.transition(
            |flow| {
                if !flow.paused || flow.stopped {
                    return false;
                }
                flow.paused = false;
                true
            },
            announce,
        )
    }

    pub fn stop_with(&self, announce: impl FnOnce()) -> bool {
        self.transition(
            |flow| {
                if flow.stopped {
                    return false;
                }
                flow.stopped = true;
                true
            },
            announce,
        )
    }

    fn transition(&self, apply: impl FnOnce(&mut Flow) -> bool, announce: impl FnOnce()) -> bool {
        self.tx.send_if_modified(|flow| {
            if !apply(flow) {
                return false;
            }
            announce();
            true
        })
    }

    /// Run `commit` only while flowing. Transitions are held off until it
    /// returns, so it lands wholly before or after a pause, resume or stop.
    ///
    /// `commit` must not call back into this `FlowControl`.
    pub fn if_flowing(&self, commit: impl FnOnce()) -> Flow {
        let guard = self.tx.borrow();
        let flow = *guard;
        if flow.is_flowing() {
            commit();
        }
        flow
    }

    pub fn subscribe(&self) -> watch::Receiver<Flow> {
        self.tx.subscribe()
    }

    /// Wait until the stream is either unpaused or stopped.
    pub async fn until_unpaused(&self) -> Flow {
        let mut rx = self.tx.subscribe();
        let flow = match rx.wait_for(|flow| !flow.paused || flow.stopped).await {
            Ok(flow) => *flow,
            // The sender lives in `self`, so this arm is unreachable in practice.
            Err(_) => self.current(),
        };
        flow
    }
}
