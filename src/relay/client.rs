//! Local client for the realtime protocol
//!
//! Streams microphone chunks to a relay (or the provider directly) and plays
//! the audio that comes back.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::{
    Message, client::IntoClientRequest, http::HeaderValue, http::header::AUTHORIZATION,
};
use tokio_util::sync::CancellationToken;

use super::protocol::{self, ClientMessage, Modality, ServerEvent, Setup};
use crate::voice::{
    CaptureConfig, CaptureEvent, CaptureTap, EventBus, PlaybackController, SessionEvent,
    run_chunk_cycle,
};
use crate::{Error, Result};

/// Rate assumed for raw PCM without a `rate=` parameter
const DEFAULT_PCM_RATE: u32 = 24_000;

const CHUNK_MIME: &str = "audio/wav";

/// Realtime conversation over a duplex socket
pub struct RealtimeClient {
    url: String,
    token: Option<SecretString>,
    voice: Option<String>,
    playback: Arc<PlaybackController>,
    events: EventBus,
}

impl RealtimeClient {
    #[must_use]
    pub fn new(
        url: impl Into<String>,
        token: Option<SecretString>,
        playback: Arc<PlaybackController>,
    ) -> Self {
        Self {
            url: url.into(),
            token,
            voice: None,
            playback,
            events: EventBus::default(),
        }
    }

    #[must_use]
    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = Some(voice.into());
        self
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Converse until cancelled or the server closes the socket
    ///
    /// # Errors
    ///
    /// Returns `Error::Transport` if the socket cannot be opened or fails,
    /// `Error::Device` if the microphone is lost
    pub async fn run(
        &self,
        tap: CaptureTap,
        capture: CaptureConfig,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| Error::Transport(e.to_string()))?;
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token.expose_secret()))
                .map_err(|e| Error::Transport(e.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (socket, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| Error::Transport(format!("realtime connect failed: {e}")))?;
        let (mut sink, mut stream) = socket.split();
        tracing::info!(url = %self.url, "realtime session connected");

        let setup = ClientMessage::Setup(Setup {
            response_modalities: vec![Modality::Audio],
            voice: self.voice.clone(),
        });
        send(&mut sink, &setup).await?;

        let capture_cancel = cancel.child_token();
        let (chunk_tx, mut chunk_rx) = mpsc::channel(8);
        let capture_task = tokio::spawn(run_chunk_cycle(
            tap,
            capture,
            chunk_tx,
            capture_cancel.clone(),
        ));

        let result = loop {
            tokio::select! {
                () = cancel.cancelled() => break Ok(()),
                event = chunk_rx.recv() => match event {
                    Some(CaptureEvent::Chunk(chunk)) => {
                        self.events.emit(SessionEvent::ChunkCaptured { seq: chunk.seq });
                        let frame = ClientMessage::audio(CHUNK_MIME, &chunk.bytes);
                        if let Err(e) = send(&mut sink, &frame).await {
                            break Err(e);
                        }
                    }
                    Some(CaptureEvent::DeviceLost(reason)) => break Err(Error::Device(reason)),
                    None => break Ok(()),
                },
                message = stream.next() => match message {
                    Some(Ok(Message::Text(text))) => self.handle_frame(text.as_str()),
                    Some(Ok(Message::Binary(data))) => {
                        if let Ok(text) = std::str::from_utf8(&data) {
                            self.handle_frame(text);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Err(Error::Transport(e.to_string())),
                },
            }
        };

        capture_cancel.cancel();
        let _ = capture_task.await;
        let _ = sink.close().await;
        self.playback.interrupt_all();

        if let Err(e) = &result {
            self.events.emit(SessionEvent::from_error(e));
        }
        tracing::info!("realtime session closed");
        result
    }

    /// React to one server frame
    pub fn handle_frame(&self, text: &str) {
        let message = match protocol::parse_frame(text) {
            Ok(frame) => protocol::as_server_message(&frame),
            Err(e) => {
                tracing::warn!(error = %e, "ignoring server frame");
                return;
            }
        };
        let Some(message) = message else {
            return;
        };

        for event in ServerEvent::classify(&message) {
            match event {
                ServerEvent::SetupComplete => tracing::debug!("realtime setup complete"),
                ServerEvent::Text(text) => self.events.emit(SessionEvent::Reply { text }),
                ServerEvent::Audio(chunk) => {
                    let played = chunk.decode().and_then(|bytes| {
                        if chunk.mime_type.starts_with("audio/pcm") {
                            let rate = pcm_rate(&chunk.mime_type).unwrap_or(DEFAULT_PCM_RATE);
                            Ok(self.playback.play_samples(pcm16_to_f32(&bytes), rate))
                        } else {
                            self.playback.play(&bytes)
                        }
                    });
                    match played {
                        Ok(playback) => {
                            self.events
                                .emit(SessionEvent::PlaybackScheduled { id: playback.id() });
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "failed to play realtime audio");
                            self.events.emit(SessionEvent::from_error(&e));
                        }
                    }
                }
                ServerEvent::Interrupted => {
                    let count = self.playback.interrupt_all();
                    self.events.emit(SessionEvent::PlaybackInterrupted { count });
                }
                ServerEvent::TurnComplete => tracing::trace!("realtime turn complete"),
                ServerEvent::Error(body) => {
                    let error = Error::Protocol(format!("{}: {}", body.code, body.reason));
                    tracing::warn!(error = %error, "realtime server error");
                    self.events.emit(SessionEvent::from_error(&error));
                }
            }
        }
    }
}

async fn send<S>(sink: &mut S, message: &ClientMessage) -> Result<()>
where
    S: futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let text = serde_json::to_string(message)?;
    sink.send(Message::text(text))
        .await
        .map_err(|e| Error::Transport(e.to_string()))
}

fn pcm_rate(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .filter_map(|param| param.trim().strip_prefix("rate="))
        .find_map(|rate| rate.parse().ok())
}

/// Little-endian 16-bit PCM to f32 samples
#[must_use]
pub fn pcm16_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / 32768.0)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::voice::NullSink;

    fn client() -> RealtimeClient {
        let playback = Arc::new(PlaybackController::new(Arc::new(NullSink)));
        RealtimeClient::new("ws://127.0.0.1:1/realtime", None, playback)
    }

    #[test]
    fn test_pcm16_to_f32() {
        let samples = pcm16_to_f32(&[0x00, 0x00, 0xff, 0x7f, 0x00, 0x80, 0x01]);
        assert_eq!(samples.len(), 3);
        assert!(samples[0].abs() < f32::EPSILON);
        assert!(samples[1] > 0.99);
        assert!((samples[2] + 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_pcm_rate() {
        assert_eq!(pcm_rate("audio/pcm;rate=16000"), Some(16000));
        assert_eq!(pcm_rate("audio/pcm; rate=24000"), Some(24000));
        assert_eq!(pcm_rate("audio/pcm"), None);
    }

    #[tokio::test]
    async fn test_interrupted_stops_playback() {
        let client = client();
        let mut events = client.subscribe();

        // One second of silence at 24 kHz
        let audio = protocol::MediaChunk::encode("audio/pcm;rate=24000", &vec![0u8; 48_000]);
        let frame = json!({ "serverContent": { "modelTurn": { "parts": [{ "inlineData": audio }] } } });
        client.handle_frame(&frame.to_string());
        assert_eq!(client.playback.live_count(), 1);
        assert!(matches!(
            events.recv().await.unwrap(),
            SessionEvent::PlaybackScheduled { .. }
        ));

        client.handle_frame(&json!({ "serverContent": { "interrupted": true } }).to_string());
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::PlaybackInterrupted { count: 1 }
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(client.playback.live_count(), 0);
    }

    #[tokio::test]
    async fn test_text_and_error_frames() {
        let client = client();
        let mut events = client.subscribe();

        client.handle_frame("not json");
        client.handle_frame(
            &json!({ "serverContent": { "modelTurn": { "parts": [{ "text": "Hello" }] } } })
                .to_string(),
        );
        client.handle_frame(&json!({ "error": { "code": "503", "reason": "busy" } }).to_string());

        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::Reply {
                text: "Hello".to_string()
            }
        );
        assert!(matches!(
            events.recv().await.unwrap(),
            SessionEvent::Error { kind: crate::ErrorKind::Protocol, .. }
        ));
    }
}
