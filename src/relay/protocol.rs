//! Realtime duplex protocol frames
//!
//! The relay forwards frames verbatim; these types are only used to observe
//! the conversation and by the local [`RealtimeClient`](super::RealtimeClient).

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Output modality requested in the setup frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Modality {
    Text,
    Audio,
}

/// First frame a client sends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub response_modalities: Vec<Modality>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
}

/// Base64 media payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaChunk {
    pub mime_type: String,
    pub data: String,
}

impl MediaChunk {
    #[must_use]
    pub fn encode(mime_type: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            mime_type: mime_type.into(),
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }

    /// Decode the payload
    ///
    /// # Errors
    ///
    /// Returns `Error::Protocol` if the payload is not valid base64
    pub fn decode(&self) -> Result<Vec<u8>> {
        base64::engine::general_purpose::STANDARD
            .decode(&self.data)
            .map_err(|e| Error::Protocol(format!("invalid media payload: {e}")))
    }
}

/// User input: audio chunks or typed text
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_chunks: Option<Vec<MediaChunk>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// Frames sent by the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(Setup),
    RealtimeInput(RealtimeInput),
}

impl ClientMessage {
    #[must_use]
    pub fn audio(mime_type: &str, bytes: &[u8]) -> Self {
        Self::RealtimeInput(RealtimeInput {
            media_chunks: Some(vec![MediaChunk::encode(mime_type, bytes)]),
            text: None,
        })
    }

    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::RealtimeInput(RealtimeInput {
            media_chunks: None,
            text: Some(text.into()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<MediaChunk>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_turn: Option<ModelTurn>,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub interrupted: bool,
}

/// Structured error frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// HTTP status of the failed upstream handshake, or `connect_failed`
    pub code: String,
    pub reason: String,
}

/// Frames sent by the provider (and the relay's own error frame)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_content: Option<ServerContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl ServerMessage {
    /// The relay's error frame
    #[must_use]
    pub fn error(code: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            error: Some(ErrorBody {
                code: code.into(),
                reason: reason.into(),
            }),
            ..Self::default()
        }
    }
}

/// What a server frame means to a listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    SetupComplete,
    Text(String),
    Audio(MediaChunk),
    TurnComplete,
    Interrupted,
    Error(ErrorBody),
}

impl ServerEvent {
    /// Flatten a frame into events, in frame order
    #[must_use]
    pub fn classify(message: &ServerMessage) -> Vec<Self> {
        let mut events = Vec::new();

        if message.setup_complete.is_some() {
            events.push(Self::SetupComplete);
        }
        if let Some(error) = &message.error {
            events.push(Self::Error(error.clone()));
        }

        if let Some(content) = &message.server_content {
            // Barge-in wins over anything else in the same frame
            if content.interrupted {
                events.push(Self::Interrupted);
            }
            if let Some(turn) = &content.model_turn {
                for part in &turn.parts {
                    if let Some(text) = &part.text {
                        events.push(Self::Text(text.clone()));
                    }
                    if let Some(data) = &part.inline_data {
                        events.push(Self::Audio(data.clone()));
                    }
                }
            }
            if content.turn_complete {
                events.push(Self::TurnComplete);
            }
        }

        events
    }
}

/// Check that a text frame is JSON
///
/// # Errors
///
/// Returns `Error::Protocol` for malformed frames
pub fn parse_frame(text: &str) -> Result<serde_json::Value> {
    serde_json::from_str(text).map_err(|e| Error::Protocol(format!("malformed frame: {e}")))
}

/// Interpret a frame as a client message, if it has a known shape
#[must_use]
pub fn as_client_message(frame: &serde_json::Value) -> Option<ClientMessage> {
    serde_json::from_value(frame.clone()).ok()
}

/// Interpret a frame as a server message, if it has a known shape
#[must_use]
pub fn as_server_message(frame: &serde_json::Value) -> Option<ServerMessage> {
    serde_json::from_value(frame.clone()).ok()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_setup_frame_shape() {
        let setup = ClientMessage::Setup(Setup {
            response_modalities: vec![Modality::Audio],
            voice: Some("Puck".to_string()),
        });
        assert_eq!(
            serde_json::to_value(&setup).unwrap(),
            json!({ "setup": { "responseModalities": ["AUDIO"], "voice": "Puck" } })
        );
    }

    #[test]
    fn test_input_frames() {
        assert_eq!(
            serde_json::to_value(ClientMessage::text("hello")).unwrap(),
            json!({ "realtimeInput": { "text": "hello" } })
        );
        assert_eq!(
            serde_json::to_value(ClientMessage::audio("audio/pcm", b"ab")).unwrap(),
            json!({ "realtimeInput": { "mediaChunks": [{ "mimeType": "audio/pcm", "data": "YWI=" }] } })
        );
    }

    #[test]
    fn test_classify_server_content() {
        let message: ServerMessage = serde_json::from_value(json!({
            "serverContent": {
                "modelTurn": { "parts": [
                    { "text": "Sure, " },
                    { "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": "AAA=" } }
                ]},
                "turnComplete": true
            }
        }))
        .unwrap();

        let events = ServerEvent::classify(&message);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], ServerEvent::Text("Sure, ".to_string()));
        assert!(matches!(events[1], ServerEvent::Audio(_)));
        assert_eq!(events[2], ServerEvent::TurnComplete);
    }

    #[test]
    fn test_classify_interrupted_and_setup() {
        let interrupted: ServerMessage =
            serde_json::from_value(json!({ "serverContent": { "interrupted": true } })).unwrap();
        assert_eq!(ServerEvent::classify(&interrupted), vec![ServerEvent::Interrupted]);

        let setup: ServerMessage = serde_json::from_value(json!({ "setupComplete": {} })).unwrap();
        assert_eq!(ServerEvent::classify(&setup), vec![ServerEvent::SetupComplete]);
    }

    #[test]
    fn test_error_frame_shape() {
        assert_eq!(
            serde_json::to_value(ServerMessage::error("connect_failed", "refused")).unwrap(),
            json!({ "error": { "code": "connect_failed", "reason": "refused" } })
        );
    }

    #[test]
    fn test_malformed_frame_is_protocol_error() {
        let err = parse_frame("{not json").unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert!(parse_frame(r#"{"anything":1}"#).is_ok());
    }

    #[test]
    fn test_media_chunk_roundtrip_rejects_garbage() {
        let chunk = MediaChunk {
            mime_type: "audio/pcm".to_string(),
            data: "!!".to_string(),
        };
        assert!(chunk.decode().is_err());
    }
}
