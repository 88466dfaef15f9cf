//! Speaker-tagged conversation log persisted when a session ends

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

/// Default idle time after which partial assistant text is flushed
pub const DEFAULT_IDLE_FLUSH: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub speaker: Speaker,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Which transport produced a transcript
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptSource {
    /// Local capture/transcribe/reason/speak pipeline
    Pipeline,
    /// Hosted duplex provider through the relay
    Realtime,
}

impl TranscriptSource {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pipeline => "pipeline",
            Self::Realtime => "realtime",
        }
    }
}

impl std::str::FromStr for TranscriptSource {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "pipeline" => Ok(Self::Pipeline),
            "realtime" => Ok(Self::Realtime),
            other => Err(crate::Error::Database(format!(
                "unknown transcript source: {other}"
            ))),
        }
    }
}

/// One persisted conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptRecord {
    pub id: Uuid,
    pub session_id: Uuid,
    pub source: TranscriptSource,
    pub entries: Vec<TranscriptEntry>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

/// Accumulates entries for one session
///
/// Assistant text may arrive as deltas. Deltas are buffered until an explicit
/// end-of-turn, a user entry, an idle timeout or the end of the session.
#[derive(Debug)]
pub struct TranscriptLog {
    session_id: Uuid,
    source: TranscriptSource,
    started_at: DateTime<Utc>,
    entries: Vec<TranscriptEntry>,
    pending: String,
    last_delta: Option<Instant>,
    idle_flush: Duration,
}

impl TranscriptLog {
    #[must_use]
    pub fn new(session_id: Uuid, source: TranscriptSource) -> Self {
        Self {
            session_id,
            source,
            started_at: Utc::now(),
            entries: Vec::new(),
            pending: String::new(),
            last_delta: None,
            idle_flush: DEFAULT_IDLE_FLUSH,
        }
    }

    #[must_use]
    pub fn with_idle_flush(mut self, idle_flush: Duration) -> Self {
        self.idle_flush = idle_flush;
        self
    }

    #[must_use]
    pub const fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Record a complete user utterance
    pub fn push_user(&mut self, text: impl Into<String>) {
        self.flush_assistant();
        self.push(Speaker::User, text.into());
    }

    /// Record a complete assistant reply
    pub fn push_assistant(&mut self, text: impl Into<String>) {
        self.flush_assistant();
        self.push(Speaker::Assistant, text.into());
    }

    /// Buffer a partial assistant reply
    pub fn append_assistant_delta(&mut self, delta: &str, now: Instant) {
        self.pending.push_str(delta);
        self.last_delta = Some(now);
    }

    /// Move buffered assistant text into the log; returns whether anything moved
    pub fn flush_assistant(&mut self) -> bool {
        self.last_delta = None;
        let text = std::mem::take(&mut self.pending);
        if text.trim().is_empty() {
            return false;
        }
        self.push(Speaker::Assistant, text);
        true
    }

    /// Flush buffered assistant text if no delta arrived for the idle timeout
    pub fn flush_if_idle(&mut self, now: Instant) -> bool {
        match self.last_delta {
            Some(last) if now.duration_since(last) >= self.idle_flush => {
                tracing::debug!(session_id = %self.session_id, "assistant text flushed after idle timeout");
                self.flush_assistant()
            }
            _ => false,
        }
    }

    /// When the idle flush would fire, if text is pending
    #[must_use]
    pub fn idle_deadline(&self) -> Option<Instant> {
        self.last_delta.map(|last| last + self.idle_flush)
    }

    #[must_use]
    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    /// Close the log into a record, flushing any buffered text
    #[must_use]
    pub fn finish(mut self) -> TranscriptRecord {
        self.flush_assistant();
        TranscriptRecord {
            id: Uuid::new_v4(),
            session_id: self.session_id,
            source: self.source,
            entries: self.entries,
            started_at: self.started_at,
            ended_at: Utc::now(),
        }
    }

    fn push(&mut self, speaker: Speaker, text: String) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        self.entries.push(TranscriptEntry {
            speaker,
            text: text.to_string(),
            timestamp: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deltas_flush_on_user_entry() {
        let mut log = TranscriptLog::new(Uuid::new_v4(), TranscriptSource::Realtime);
        let now = Instant::now();
        log.append_assistant_delta("Hello, ", now);
        log.append_assistant_delta("how can I help?", now);
        assert!(log.entries().is_empty());

        log.push_user("Find me a candidate");
        let speakers: Vec<_> = log.entries().iter().map(|e| e.speaker).collect();
        assert_eq!(speakers, vec![Speaker::Assistant, Speaker::User]);
        assert_eq!(log.entries()[0].text, "Hello, how can I help?");
    }

    #[test]
    fn test_idle_flush() {
        let mut log = TranscriptLog::new(Uuid::new_v4(), TranscriptSource::Realtime)
            .with_idle_flush(Duration::from_secs(5));
        let t0 = Instant::now();
        log.append_assistant_delta("partial", t0);

        assert!(!log.flush_if_idle(t0 + Duration::from_secs(4)));
        assert_eq!(log.idle_deadline(), Some(t0 + Duration::from_secs(5)));
        assert!(log.flush_if_idle(t0 + Duration::from_secs(5)));
        assert_eq!(log.entries().len(), 1);
        assert!(log.idle_deadline().is_none());
        assert!(!log.flush_if_idle(t0 + Duration::from_secs(20)));
    }

    #[test]
    fn test_finish_flushes_pending() {
        let session_id = Uuid::new_v4();
        let mut log = TranscriptLog::new(session_id, TranscriptSource::Pipeline);
        log.push_user("Hi");
        log.append_assistant_delta("Bye", Instant::now());

        let record = log.finish();
        assert_eq!(record.session_id, session_id);
        assert_eq!(record.entries.len(), 2);
        assert!(record.ended_at >= record.started_at);
    }

    #[test]
    fn test_blank_entries_are_skipped() {
        let mut log = TranscriptLog::new(Uuid::new_v4(), TranscriptSource::Pipeline);
        log.push_user("  ");
        log.append_assistant_delta(" ", Instant::now());
        assert!(!log.flush_assistant());
        assert!(log.entries().is_empty());
    }

    #[test]
    fn test_source_roundtrip() {
        for source in [TranscriptSource::Pipeline, TranscriptSource::Realtime] {
            assert_eq!(source.as_str().parse::<TranscriptSource>().unwrap(), source);
        }
        assert!("other".parse::<TranscriptSource>().is_err());
    }
}
