//! Voice pipeline
//!
//! Capture, voice activity detection, chunked transcription, single-flight
//! turn processing, cached synthesis and interruptible playback.

pub mod cache;
pub mod capture;
pub mod events;
pub mod filter;
pub mod playback;
pub mod session;
pub mod stt;
pub mod transcript;
pub mod tts;
pub mod turn;
pub mod vad;

use chrono::{DateTime, Utc};

pub use cache::{
    CacheConfig, CacheEntry, CacheKey, FsSpeechCache, MemorySpeechCache, PruneReport,
    SpeechCache, SynthesisRequest, TieredSpeechCache,
};
pub use capture::{
    AudioCapture, AudioChunk, CaptureConfig, CaptureEvent, CaptureTap, SAMPLE_RATE, rms,
    run_chunk_cycle, samples_to_wav,
};
pub use events::{EventBus, SessionEvent, SessionState};
pub use filter::{FilterConfig, Rejection, TranscriptFilter};
pub use playback::{
    AudioSink, CpalSink, NullSink, Playback, PlaybackController, PlaybackOutcome, decode_mp3,
};
pub use session::{SessionConfig, SessionDeps, VoiceSession};
pub use stt::{SpeechToText, TranscriptionClient, TranscriptionConfig};
pub use transcript::{
    Speaker, TranscriptEntry, TranscriptLog, TranscriptRecord, TranscriptSource,
};
pub use tts::{
    AudioSource, AudioStream, HttpSynthesisBackend, SpeechSynthesizer, SynthesisBackend,
    SynthesisConfig, SynthesisResponse,
};
pub use turn::{
    Attachment, ConversationTurn, HttpTurnProcessor, ReasoningConfig, ToolExecution,
    TurnOutcome, TurnProcessor, TurnQueue, TurnQueueConfig, TurnReply,
};
pub use vad::{
    Calibrator, Thresholds, VadConfig, VadEvent, VadTransition, VoiceActivityDetector, run_vad,
};

/// Transcript accepted by the filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcript {
    pub text: String,
    pub timestamp: DateTime<Utc>,
}
