//! TOML configuration file loading
//!
//! Supports `~/.config/eva/voice/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct VoiceConfigFile {
    /// Data directory override (database)
    #[serde(default)]
    pub data_dir: Option<String>,

    /// Microphone chunking
    #[serde(default)]
    pub capture: CaptureFileConfig,

    /// Voice activity detection
    #[serde(default)]
    pub vad: VadFileConfig,

    /// Speech-to-text service and transcript filtering
    #[serde(default)]
    pub transcription: TranscriptionFileConfig,

    /// Text-to-speech service
    #[serde(default)]
    pub synthesis: SynthesisFileConfig,

    /// Speech cache
    #[serde(default)]
    pub cache: CacheFileConfig,

    /// Turn processing
    #[serde(default)]
    pub turn: TurnFileConfig,

    /// Realtime relay
    #[serde(default)]
    pub relay: RelayFileConfig,

    /// Server/runtime configuration
    #[serde(default)]
    pub server: ServerFileConfig,
}

/// Capture chunking configuration
#[derive(Debug, Default, Deserialize)]
pub struct CaptureFileConfig {
    /// Nominal chunk duration in milliseconds
    pub chunk_ms: Option<u64>,
    /// Pause between stopping one recording and starting the next
    pub restart_gap_ms: Option<u64>,
}

/// VAD configuration
#[derive(Debug, Default, Deserialize)]
pub struct VadFileConfig {
    pub speech_threshold: Option<f32>,
    pub silence_threshold: Option<f32>,
    pub debounce_ms: Option<u64>,
    pub calibration_ms: Option<u64>,
    pub tick_ms: Option<u64>,
    pub floor: Option<f32>,
    pub ceiling: Option<f32>,
    /// Run ambient calibration at session start
    pub calibrate: Option<bool>,
    /// Interrupt assistant playback when the user starts speaking
    pub interrupt_on_speech: Option<bool>,
}

/// Transcription configuration
#[derive(Debug, Default, Deserialize)]
pub struct TranscriptionFileConfig {
    /// Base URL of the speech-to-text service
    pub url: Option<String>,
    /// Language hint (e.g. "en")
    pub language: Option<String>,
    pub timeout_secs: Option<u64>,
    /// Duplicate suppression window in milliseconds
    pub duplicate_window_ms: Option<u64>,
    /// Minimum length of a single-word transcript
    pub min_chars: Option<usize>,
    /// Additional hallucinated phrases to reject
    #[serde(default)]
    pub deny_phrases: Vec<String>,
}

/// Synthesis configuration
#[derive(Debug, Default, Deserialize)]
pub struct SynthesisFileConfig {
    /// Base URL of the text-to-speech service
    pub url: Option<String>,
    pub voice_id: Option<String>,
    pub model_id: Option<String>,
    pub timeout_secs: Option<u64>,
}

/// Speech cache configuration
#[derive(Debug, Default, Deserialize)]
pub struct CacheFileConfig {
    /// Directory holding cached audio
    pub dir: Option<String>,
    /// Age-based retention in days
    pub retention_days: Option<u64>,
    /// Size of the in-process cache tier in megabytes
    pub memory_mb: Option<u64>,
}

/// Turn processing configuration
#[derive(Debug, Default, Deserialize)]
pub struct TurnFileConfig {
    /// Base URL of the reasoning service
    pub reasoning_url: Option<String>,
    pub inter_turn_delay_ms: Option<u64>,
    pub queue_capacity: Option<usize>,
    pub timeout_secs: Option<u64>,
}

/// Realtime relay configuration
#[derive(Debug, Default, Deserialize)]
pub struct RelayFileConfig {
    /// Upstream provider websocket URL
    pub upstream_url: Option<String>,
    /// Max frames buffered per direction
    pub max_in_flight: Option<usize>,
    /// Flush assistant text after this many milliseconds without a delta
    pub idle_flush_ms: Option<u64>,
}

/// Server/runtime configuration
#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    /// API server port
    pub port: Option<u16>,
}

/// Load the TOML config file from the standard path
///
/// Returns `VoiceConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> VoiceConfigFile {
    config_file_path().map_or_else(VoiceConfigFile::default, |path| load_config_file_from(&path))
}

/// Load a TOML config file from an explicit path
///
/// Returns `VoiceConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file_from(path: &Path) -> VoiceConfigFile {
    if !path.exists() {
        return VoiceConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                VoiceConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            VoiceConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/eva/voice/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| {
        d.config_dir()
            .join("eva")
            .join("voice")
            .join("config.toml")
    })
}
