// Typed event channel between the recorder, the upload pipeline and whoever
// wires them together (orchestrator, CLI).

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::db::schema::UploadDestination;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Event {
    RecordingStarted,
    SegmentStarted { index: u32 },
    SegmentCompleted { id: String, destination: UploadDestination },
    RecordingStopped,
    RecordingError { message: String },
    StorageCleaned { deleted: usize },
    UploadCompleted { id: String, url: String },
    /// A user-visible upload problem (permanent failure, quota, retry cap).
    UploadAttention { id: String, file_name: String, reason: String },
}

/// Fan-out of events to any number of subscribers. Emitting never blocks.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Sender<Event>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<Event> {
        let (tx, rx) = mpsc::channel();
        match self.subscribers.lock() {
            Ok(mut subs) => subs.push(tx),
            Err(poisoned) => poisoned.into_inner().push(tx),
        }
        rx
    }

    pub fn emit(&self, event: Event) {
        log::debug!("event: {:?}", event);
        let mut subs = match self.subscribers.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        subs.retain(|tx| tx.send(event.clone()).is_ok());
    }
}
