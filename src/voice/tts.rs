//! Text-to-speech (TTS) processing
//!
//! [`SpeechSynthesizer`] checks the speech cache before calling the synthesis
//! service. On a miss, audio is forwarded to the caller as it arrives while a
//! copy is kept and written to the cache once the stream completes.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::task::TaskTracker;

use super::cache::{CacheEntry, CacheKey, SpeechCache, SynthesisRequest};
use crate::{Error, Result};

/// Chunks buffered between the network reader and the caller
const STREAM_BUFFER: usize = 8;

/// Header the synthesis service uses to report its own cache status
const CACHE_STATUS_HEADER: &str = "x-cache-status";

/// Synthesis service response
pub struct SynthesisResponse {
    /// The service served this from its own cache
    pub upstream_cached: bool,
    pub stream: BoxStream<'static, Result<Bytes>>,
}

/// Raw synthesis backend
#[async_trait]
pub trait SynthesisBackend: Send + Sync {
    /// Start synthesizing
    ///
    /// # Errors
    ///
    /// Returns error if the request cannot be sent or is rejected
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<SynthesisResponse>;
}

/// Synthesis service settings
#[derive(Debug)]
pub struct SynthesisConfig {
    /// Base URL; requests go to `{base_url}/synthesize`
    pub base_url: String,
    pub api_token: Option<SecretString>,
    pub voice_id: String,
    pub model_id: String,
    pub timeout: Duration,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000/api/voice".to_string(),
            api_token: None,
            voice_id: "rachel".to_string(),
            model_id: "eleven_turbo_v2".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Synthesis service reached over HTTP
pub struct HttpSynthesisBackend {
    client: reqwest::Client,
    endpoint: String,
    api_token: Option<SecretString>,
}

impl HttpSynthesisBackend {
    /// Create a new HTTP synthesis backend
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new(base_url: &str, api_token: Option<SecretString>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: format!("{}/synthesize", base_url.trim_end_matches('/')),
            api_token,
        })
    }
}

#[async_trait]
impl SynthesisBackend for HttpSynthesisBackend {
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<SynthesisResponse> {
        #[derive(serde::Serialize)]
        #[serde(rename_all = "camelCase")]
        struct SynthesizeRequest<'a> {
            text: &'a str,
            voice_id: &'a str,
            model_id: &'a str,
        }

        let token = self
            .api_token
            .as_ref()
            .ok_or_else(|| Error::Auth("synthesis token not configured".to_string()))?;

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(token.expose_secret())
            .json(&SynthesizeRequest {
                text: &request.text,
                voice_id: &request.voice_id,
                model_id: &request.model_id,
            })
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Transport(format!("synthesis error {status}: {body}")));
        }

        let upstream_cached = response
            .headers()
            .get(CACHE_STATUS_HEADER)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("hit"));

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| Error::Transport(e.to_string())))
            .boxed();

        Ok(SynthesisResponse {
            upstream_cached,
            stream,
        })
    }
}

/// Where the audio of a stream comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioSource {
    Cache,
    Network,
    /// Blank input, nothing to say
    Empty,
}

/// MP3 audio handed to the caller
pub struct AudioStream {
    source: AudioSource,
    inner: BoxStream<'static, Result<Bytes>>,
}

impl AudioStream {
    fn empty() -> Self {
        Self {
            source: AudioSource::Empty,
            inner: stream::empty().boxed(),
        }
    }

    fn cached(audio: Bytes) -> Self {
        Self {
            source: AudioSource::Cache,
            inner: stream::once(async move { Ok(audio) }).boxed(),
        }
    }

    fn network(rx: mpsc::Receiver<Result<Bytes>>) -> Self {
        Self {
            source: AudioSource::Network,
            inner: ReceiverStream::new(rx).boxed(),
        }
    }

    #[must_use]
    pub const fn source(&self) -> AudioSource {
        self.source
    }

    /// Drain the stream into one buffer
    ///
    /// # Errors
    ///
    /// Returns the first error the stream yields
    pub async fn collect_bytes(mut self) -> Result<Bytes> {
        let mut audio = BytesMut::new();
        while let Some(chunk) = self.inner.next().await {
            audio.extend_from_slice(&chunk?);
        }
        Ok(audio.freeze())
    }
}

impl Stream for AudioStream {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

/// Cache-aware speech synthesizer
pub struct SpeechSynthesizer {
    backend: Arc<dyn SynthesisBackend>,
    cache: Arc<dyn SpeechCache>,
    voice_id: String,
    model_id: String,
    writes: TaskTracker,
}

impl SpeechSynthesizer {
    #[must_use]
    pub fn new(
        backend: Arc<dyn SynthesisBackend>,
        cache: Arc<dyn SpeechCache>,
        voice_id: impl Into<String>,
        model_id: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            cache,
            voice_id: voice_id.into(),
            model_id: model_id.into(),
            writes: TaskTracker::new(),
        }
    }

    /// Synthesize `text` with the configured voice and model
    ///
    /// # Errors
    ///
    /// Returns error if the backend call fails; cache failures are logged only
    pub async fn synthesize(&self, text: &str) -> Result<AudioStream> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(AudioStream::empty());
        }

        let request = SynthesisRequest {
            text: text.to_string(),
            voice_id: self.voice_id.clone(),
            model_id: self.model_id.clone(),
        };
        let key = CacheKey::new(&request);

        match self.cache.get(&key).await {
            Ok(Some(entry)) => {
                tracing::debug!(key = %key, bytes = entry.audio.len(), "speech cache hit");
                return Ok(AudioStream::cached(entry.audio));
            }
            Ok(None) => tracing::debug!(key = %key, "speech cache miss"),
            Err(e) => tracing::warn!(key = %key, error = %e, "speech cache read failed, treating as miss"),
        }

        let response = self.backend.synthesize(&request).await?;
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let cache = Arc::clone(&self.cache);

        self.writes.spawn(async move {
            let SynthesisResponse {
                upstream_cached,
                mut stream,
            } = response;
            let mut copy = BytesMut::new();
            let mut complete = true;

            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(bytes) => {
                        copy.extend_from_slice(&bytes);
                        // Keep reading after the caller hangs up so the copy completes
                        let _ = tx.send(Ok(bytes)).await;
                    }
                    Err(e) => {
                        complete = false;
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                }
            }
            drop(tx);

            if !complete || upstream_cached || copy.is_empty() {
                return;
            }

            let entry = CacheEntry::new(&request, copy.freeze());
            if let Err(e) = cache.put(entry).await {
                tracing::warn!(key = %key, error = %e, "speech cache write failed");
            }
        });

        Ok(AudioStream::network(rx))
    }

    /// Synthesize and collect the full audio
    ///
    /// # Errors
    ///
    /// Returns error if synthesis fails
    pub async fn synthesize_bytes(&self, text: &str) -> Result<Bytes> {
        self.synthesize(text).await?.collect_bytes().await
    }

    /// Wait for in-flight cache writes to finish
    pub async fn wait_for_cache_writes(&self) {
        self.writes.close();
        self.writes.wait().await;
        self.writes.reopen();
    }
}
