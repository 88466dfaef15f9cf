//! Configuration management for the voice service
//!
//! Precedence is environment, then `~/.config/eva/voice/config.toml`, then
//! built-in defaults.

pub mod file;

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::relay::RelayConfig;
use crate::voice::{
    CacheConfig, CaptureConfig, FilterConfig, ReasoningConfig, SessionConfig, SynthesisConfig,
    TranscriptionConfig, TurnQueueConfig, VadConfig,
};
use crate::{Error, Result};
use file::VoiceConfigFile;

/// Default API server port
pub const DEFAULT_PORT: u16 = 18790;

/// Voice service configuration
#[derive(Debug)]
pub struct Config {
    /// Path to data directory (database)
    pub data_dir: PathBuf,

    pub capture: CaptureConfig,
    pub vad: VadConfig,
    pub filter: FilterConfig,

    /// Barge-in: stop assistant audio when the user starts speaking
    pub interrupt_on_speech: bool,

    pub transcription: TranscriptionConfig,
    pub synthesis: SynthesisConfig,
    pub cache: CacheConfig,
    pub reasoning: ReasoningConfig,
    pub turns: TurnQueueConfig,
    pub relay: RelayConfig,

    /// HTTP API server configuration
    pub api_server: ApiServerConfig,
}

/// HTTP API server configuration
#[derive(Debug)]
pub struct ApiServerConfig {
    /// Port to listen on
    pub port: u16,

    /// API key for `/api/*` endpoints (from `EVA_API_KEY` env)
    pub api_key: Option<SecretString>,
}

fn default_data_dir() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from(".eva"),
        |d| d.data_local_dir().join("eva").join("voice"),
    )
}

fn millis(value: Option<u64>, default: Duration) -> Duration {
    value.map_or(default, Duration::from_millis)
}

fn secs(value: Option<u64>, default: Duration) -> Duration {
    value.map_or(default, Duration::from_secs)
}

impl Config {
    /// Load configuration from the environment and the config file
    ///
    /// # Errors
    ///
    /// Returns error if the resulting configuration is invalid
    pub fn load() -> Result<Self> {
        Self::from_sources(file::load_config_file(), |key| std::env::var(key).ok())
    }

    /// Assemble configuration from a parsed file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if a value is out of range
    pub fn from_sources(
        fc: VoiceConfigFile,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let env_parse = |key: &str| env(key).and_then(|v| v.parse::<u64>().ok());
        let secret = |key: &str| env(key).filter(|v| !v.is_empty()).map(SecretString::from);

        let data_dir = env("EVA_DATA_DIR")
            .or(fc.data_dir)
            .map_or_else(default_data_dir, PathBuf::from);

        let capture_defaults = CaptureConfig::default();
        let capture = CaptureConfig {
            chunk_duration: millis(
                env_parse("EVA_CHUNK_MS").or(fc.capture.chunk_ms),
                capture_defaults.chunk_duration,
            ),
            restart_gap: millis(fc.capture.restart_gap_ms, capture_defaults.restart_gap),
        };

        let vad_defaults = VadConfig::default();
        let vad = VadConfig {
            speech_threshold: fc
                .vad
                .speech_threshold
                .unwrap_or(vad_defaults.speech_threshold),
            silence_threshold: fc
                .vad
                .silence_threshold
                .unwrap_or(vad_defaults.silence_threshold),
            debounce: millis(fc.vad.debounce_ms, vad_defaults.debounce),
            calibration_window: millis(fc.vad.calibration_ms, vad_defaults.calibration_window),
            tick: millis(fc.vad.tick_ms, vad_defaults.tick),
            floor: fc.vad.floor.unwrap_or(vad_defaults.floor),
            ceiling: fc.vad.ceiling.unwrap_or(vad_defaults.ceiling),
            calibrate: fc.vad.calibrate.unwrap_or(vad_defaults.calibrate),
        };
        let interrupt_on_speech = fc.vad.interrupt_on_speech.unwrap_or(false);

        let filter_defaults = FilterConfig::default();
        let filter = FilterConfig {
            duplicate_window: millis(
                fc.transcription.duplicate_window_ms,
                filter_defaults.duplicate_window,
            ),
            min_chars: fc.transcription.min_chars.unwrap_or(filter_defaults.min_chars),
            extra_deny_phrases: fc.transcription.deny_phrases,
        };

        let api_token = || secret("EVA_API_TOKEN");

        let stt_defaults = TranscriptionConfig::default();
        let transcription = TranscriptionConfig {
            base_url: env("EVA_TRANSCRIPTION_URL")
                .or(fc.transcription.url)
                .unwrap_or(stt_defaults.base_url),
            api_token: api_token(),
            language: env("EVA_LANGUAGE")
                .or(fc.transcription.language)
                .unwrap_or(stt_defaults.language),
            timeout: secs(fc.transcription.timeout_secs, stt_defaults.timeout),
        };

        let tts_defaults = SynthesisConfig::default();
        let synthesis = SynthesisConfig {
            base_url: env("EVA_SYNTHESIS_URL")
                .or(fc.synthesis.url)
                .unwrap_or(tts_defaults.base_url),
            api_token: api_token(),
            voice_id: env("EVA_VOICE_ID")
                .or(fc.synthesis.voice_id)
                .unwrap_or(tts_defaults.voice_id),
            model_id: fc.synthesis.model_id.unwrap_or(tts_defaults.model_id),
            timeout: secs(fc.synthesis.timeout_secs, tts_defaults.timeout),
        };

        let cache_defaults = CacheConfig::default();
        let cache = CacheConfig {
            dir: env("EVA_CACHE_DIR")
                .or(fc.cache.dir)
                .map_or(cache_defaults.dir, PathBuf::from),
            retention: fc
                .cache
                .retention_days
                .map_or(cache_defaults.retention, |days| {
                    Duration::from_secs(days.saturating_mul(24 * 60 * 60))
                }),
            memory_capacity: fc
                .cache
                .memory_mb
                .map_or(cache_defaults.memory_capacity, |mb| {
                    mb.saturating_mul(1024 * 1024)
                }),
        };

        let reasoning_defaults = ReasoningConfig::default();
        let reasoning = ReasoningConfig {
            base_url: env("EVA_REASONING_URL")
                .or(fc.turn.reasoning_url)
                .unwrap_or(reasoning_defaults.base_url),
            api_token: api_token(),
            timeout: secs(fc.turn.timeout_secs, reasoning_defaults.timeout),
        };

        let turn_defaults = TurnQueueConfig::default();
        let turns = TurnQueueConfig {
            inter_turn_delay: millis(fc.turn.inter_turn_delay_ms, turn_defaults.inter_turn_delay),
            capacity: fc.turn.queue_capacity.unwrap_or(turn_defaults.capacity),
        };

        let relay_defaults = RelayConfig::default();
        let relay = RelayConfig {
            upstream_url: env("EVA_RELAY_UPSTREAM_URL")
                .or(fc.relay.upstream_url)
                .unwrap_or(relay_defaults.upstream_url),
            provider_api_key: secret("EVA_PROVIDER_API_KEY"),
            relay_token: secret("EVA_RELAY_TOKEN"),
            max_in_flight: fc
                .relay
                .max_in_flight
                .unwrap_or(relay_defaults.max_in_flight),
            idle_flush: millis(fc.relay.idle_flush_ms, relay_defaults.idle_flush),
        };

        let api_server = ApiServerConfig {
            port: env("EVA_API_PORT")
                .or_else(|| env("PORT"))
                .and_then(|p| p.parse().ok())
                .or(fc.server.port)
                .unwrap_or(DEFAULT_PORT),
            api_key: secret("EVA_API_KEY"),
        };

        let config = Self {
            data_dir,
            capture,
            vad,
            filter,
            interrupt_on_speech,
            transcription,
            synthesis,
            cache,
            reasoning,
            turns,
            relay,
            api_server,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` naming the offending setting
    pub fn validate(&self) -> Result<()> {
        if self.capture.chunk_duration.is_zero() {
            return Err(Error::Config("capture.chunk_ms must be positive".to_string()));
        }
        if self.vad.tick.is_zero() {
            return Err(Error::Config("vad.tick_ms must be positive".to_string()));
        }
        if self.vad.speech_threshold <= self.vad.silence_threshold {
            return Err(Error::Config(format!(
                "vad.speech_threshold ({}) must exceed vad.silence_threshold ({})",
                self.vad.speech_threshold, self.vad.silence_threshold
            )));
        }
        if self.vad.floor > self.vad.ceiling {
            return Err(Error::Config("vad.floor must not exceed vad.ceiling".to_string()));
        }
        if self.turns.capacity == 0 {
            return Err(Error::Config("turn.queue_capacity must be positive".to_string()));
        }
        if self.relay.max_in_flight == 0 {
            return Err(Error::Config("relay.max_in_flight must be positive".to_string()));
        }

        check_url("transcription.url", &self.transcription.base_url, &["http", "https"])?;
        check_url("synthesis.url", &self.synthesis.base_url, &["http", "https"])?;
        check_url("turn.reasoning_url", &self.reasoning.base_url, &["http", "https"])?;
        check_url("relay.upstream_url", &self.relay.upstream_url, &["ws", "wss"])?;
        Ok(())
    }

    /// Path of the `SQLite` database
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("eva.db")
    }

    /// Per-session pipeline settings
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            capture: self.capture.clone(),
            vad: self.vad.clone(),
            filter: self.filter.clone(),
            turns: self.turns.clone(),
            interrupt_on_speech: self.interrupt_on_speech,
        }
    }
}

fn check_url(field: &str, value: &str, schemes: &[&str]) -> Result<()> {
    let parsed = url::Url::parse(value)
        .map_err(|e| Error::Config(format!("{field} is not a valid URL ({value}): {e}")))?;
    if !schemes.contains(&parsed.scheme()) {
        return Err(Error::Config(format!(
            "{field} must use one of {schemes:?}, got {}",
            parsed.scheme()
        )));
    }
    Ok(())
}
