//! Event recording for stream unit tests.

use crate::streaming::events::{EventChannel, EventKind, StreamEvent};
use std::sync::{Arc, Mutex};

const RECORDED: [EventKind; 7] = [
    EventKind::Data,
    EventKind::Finish,
    EventKind::Drain,
    EventKind::Pause,
    EventKind::Resume,
    EventKind::Stop,
    EventKind::Error,
];

/// Ordered log of every non-debug event, as short labels (`data:<utf8>`, `finish`, ...).
#[derive(Clone, Default)]
pub struct EventLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl EventLog {
    pub fn attach(events: &EventChannel) -> Self {
        let log = Self::default();
        for kind in RECORDED {
            let entries = Arc::clone(&log.entries);
            events.on(kind, move |event| {
                entries.lock().unwrap().push(label(event));
            });
        }
        log
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }

    pub fn count(&self, label: &str) -> usize {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|entry| entry.as_str() == label)
            .count()
    }
}

fn label(event: &StreamEvent) -> String {
    match event {
        StreamEvent::Data(data) => format!("data:{}", String::from_utf8_lossy(data)),
        StreamEvent::Finish => "finish".to_string(),
        StreamEvent::Drain => "drain".to_string(),
        StreamEvent::Pause => "pause".to_string(),
        StreamEvent::Resume => "resume".to_string(),
        StreamEvent::Stop => "stop".to_string(),
        StreamEvent::Error(_) => "error".to_string(),
        StreamEvent::Debug(msg) => format!("debug:{}", msg),
    }
}
