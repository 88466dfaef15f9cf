//! Speech-to-text (STT) processing

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use secrecy::{ExposeSecret, SecretString};
use uuid::Uuid;

use super::capture::AudioChunk;
use crate::{Error, Result};

/// Transcribes one audio chunk to text
#[async_trait]
pub trait SpeechToText: Send + Sync {
    /// Transcribe a chunk recorded in `session_id`
    ///
    /// # Errors
    ///
    /// Returns error if the transcription service cannot be reached or rejects the request
    async fn transcribe(&self, session_id: Uuid, chunk: &AudioChunk) -> Result<String>;
}

/// Transcription service settings
#[derive(Debug)]
pub struct TranscriptionConfig {
    /// Base URL; requests go to `{base_url}/transcribe`
    pub base_url: String,
    /// Bearer token for the service
    pub api_token: Option<SecretString>,
    /// Language hint
    pub language: String,
    /// Per-request timeout
    pub timeout: Duration,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000/api/voice".to_string(),
            api_token: None,
            language: "en".to_string(),
            timeout: Duration::from_secs(15),
        }
    }
}

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct TranscribeRequest<'a> {
    session_id: String,
    audio_data: String,
    language: &'a str,
}

#[derive(serde::Deserialize)]
struct TranscribeResponse {
    #[serde(default)]
    transcript: String,
}

/// HTTP transcription client
pub struct TranscriptionClient {
    client: reqwest::Client,
    endpoint: String,
    api_token: Option<SecretString>,
    language: String,
}

impl TranscriptionClient {
    /// Create a new transcription client
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new(config: TranscriptionConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: format!("{}/transcribe", config.base_url.trim_end_matches('/')),
            api_token: config.api_token,
            language: config.language,
        })
    }
}

#[async_trait]
impl SpeechToText for TranscriptionClient {
    async fn transcribe(&self, session_id: Uuid, chunk: &AudioChunk) -> Result<String> {
        let token = self
            .api_token
            .as_ref()
            .ok_or_else(|| Error::Auth("transcription token not configured".to_string()))?;

        tracing::debug!(seq = chunk.seq, audio_bytes = chunk.bytes.len(), "starting transcription");

        let request = TranscribeRequest {
            session_id: session_id.to_string(),
            audio_data: base64::engine::general_purpose::STANDARD.encode(&chunk.bytes),
            language: &self.language,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(token.expose_secret())
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = %status, body = %body, "transcription service error");
            return Err(Error::Transport(format!("transcription error {status}: {body}")));
        }

        let result: TranscribeResponse = response
            .json()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        tracing::debug!(seq = chunk.seq, transcript = %result.transcript, "transcription complete");
        Ok(result.transcript)
    }
}
