//! EVA Voice - real-time voice conversation pipeline for the EVA recruiting assistant
//!
//! This library provides:
//! - Microphone capture in fixed windows with energy-based voice activity detection
//! - Chunked transcription with hallucination filtering
//! - Single-flight turn processing against the reasoning service
//! - Cached speech synthesis and interruptible playback
//! - A pass-through relay for hosted duplex speech providers
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │      Microphone     │        Browser client          │
//! └──────────┬──────────┴───────────────┬────────────────┘
//!            │                          │
//! ┌──────────▼──────────┐    ┌──────────▼─────────────────┐
//! │   Voice session     │    │        Realtime relay      │
//! │ VAD │ STT │ filter  │    │  client ⇄ relay ⇄ provider │
//! │ turns │ TTS │ play  │    └──────────┬─────────────────┘
//! └──────────┬──────────┘               │
//!            │                          │
//! ┌──────────▼──────────────────────────▼────────────────┐
//! │          Transcripts (SQLite) │ Speech cache (disk)   │
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod relay;
pub mod voice;

pub use config::Config;
pub use db::{DbConn, DbPool, TranscriptRepo};
pub use error::{Error, ErrorKind, Result};
pub use voice::{SessionConfig, SessionDeps, SessionEvent, VoiceSession};
