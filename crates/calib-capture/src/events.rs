//! Notifications published to the host.

use std::sync::mpsc;

use parking_lot::Mutex;

use crate::controller::{CaptureState, LoadSummary};
use crate::worker::CalibrationOutcome;

/// Immutable notification about controller progress.
#[derive(Clone, Debug, PartialEq)]
pub enum CaptureEvent {
    StateChanged(CaptureState),
    SampleCountChanged(usize),
    CalibrationStarted { samples: usize },
    CalibrationFinished(CalibrationOutcome),
    LoadProgress { loaded: usize, total: usize },
    LoadFinished(LoadSummary),
    DataCleared,
}

/// Fan-out of events to any number of receivers.
///
/// Dropped receivers are pruned on the next emit.
#[derive(Debug, Default)]
pub(crate) struct EventBus {
    subscribers: Mutex<Vec<mpsc::Sender<CaptureEvent>>>,
}

impl EventBus {
    pub(crate) fn subscribe(&self) -> mpsc::Receiver<CaptureEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.lock().push(tx);
        rx
    }

    pub(crate) fn emit(&self, event: CaptureEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}
