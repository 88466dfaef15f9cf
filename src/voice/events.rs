//! Session events published to UI subscribers
//!
//! Stage errors never cross stage boundaries; they are reported here instead.

use serde::Serialize;
use tokio::sync::broadcast;

use super::filter::Rejection;
use crate::error::ErrorKind;

/// Channel capacity for session events
pub const EVENT_CAPACITY: usize = 256;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Capturing,
    Ended,
}

/// Something observable happened in a voice session
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Lifecycle change
    State { state: SessionState },
    /// Ambient calibration finished
    Calibrated { speech: f32, silence: f32 },
    /// Microphone level for meters
    Energy { level: f32 },
    /// VAD: user started talking
    SpeechStarted,
    /// VAD: user stopped talking
    SpeechEnded,
    /// A chunk left the capture cycle
    ChunkCaptured { seq: u64 },
    /// Transcript accepted and queued as a turn
    Transcript { text: String },
    /// Transcript dropped by the filter
    TranscriptRejected { text: String, reason: Rejection },
    /// Reasoning engine replied
    Reply { text: String },
    /// Assistant audio scheduled
    PlaybackScheduled { id: u64 },
    /// Assistant audio cut off
    PlaybackInterrupted { count: usize },
    /// Non-fatal stage failure, or the fatal one that ended the session
    Error { kind: ErrorKind, message: String },
    /// Session is over
    Ended { reason: String },
}

impl SessionEvent {
    /// Build an error event from a pipeline error
    #[must_use]
    pub fn from_error(error: &crate::Error) -> Self {
        Self::Error {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// Best-effort event publisher
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_CAPACITY)
    }
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to future events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    /// Publish; ignored when nobody listens
    pub fn emit(&self, event: SessionEvent) {
        let _ = self.tx.send(event);
    }
}
