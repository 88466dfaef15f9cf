//! Error types for the EVA voice pipeline

use thiserror::Error;

/// Result type alias for voice pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the voice pipeline
#[derive(Debug, Error)]
pub enum Error {
    /// Microphone or output device unavailable, denied or revoked
    #[error("device error: {0}")]
    Device(String),

    /// Transcription or synthesis network failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Turn processor failure
    #[error("reasoning error: {0}")]
    Reasoning(String),

    /// Malformed relay frame or unexpected message shape
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Speech cache read/write failure
    #[error("cache error: {0}")]
    Cache(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Authentication/authorization error
    #[error("auth error: {0}")]
    Auth(String),

    /// Audio encoding/decoding error
    #[error("audio error: {0}")]
    Audio(String),

    /// Operation on a session or queue that has already ended
    #[error("session error: {0}")]
    Session(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Coarse classification used when reporting errors on the session event channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Device,
    Transport,
    Reasoning,
    Protocol,
    Cache,
    Internal,
}

impl ErrorKind {
    /// Stable string form for logs and event payloads
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Device => "device",
            Self::Transport => "transport",
            Self::Reasoning => "reasoning",
            Self::Protocol => "protocol",
            Self::Cache => "cache",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Classify this error
    ///
    /// HTTP and auth failures on the transcription/synthesis calls are transport
    /// failures from the session's point of view.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Device(_) => ErrorKind::Device,
            Self::Transport(_) | Self::Http(_) | Self::Auth(_) => ErrorKind::Transport,
            Self::Reasoning(_) => ErrorKind::Reasoning,
            Self::Protocol(_) | Self::Serialization(_) => ErrorKind::Protocol,
            Self::Cache(_) => ErrorKind::Cache,
            _ => ErrorKind::Internal,
        }
    }

    /// Whether this error must end the voice session
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Device(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_device_errors_are_fatal() {
        assert!(Error::Device("permission denied".to_string()).is_fatal());
        assert!(!Error::Transport("timeout".to_string()).is_fatal());
        assert!(!Error::Reasoning("boom".to_string()).is_fatal());
        assert!(!Error::Protocol("bad frame".to_string()).is_fatal());
        assert!(!Error::Cache("disk full".to_string()).is_fatal());
    }

    #[test]
    fn test_error_kind_classification() {
        assert_eq!(Error::Auth("missing".to_string()).kind(), ErrorKind::Transport);
        assert_eq!(Error::Cache("x".to_string()).kind(), ErrorKind::Cache);
        assert_eq!(Error::Config("x".to_string()).kind(), ErrorKind::Internal);
        assert_eq!(ErrorKind::Reasoning.to_string(), "reasoning");
    }
}
