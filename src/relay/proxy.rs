//! WebSocket relay between a browser and the realtime provider
//!
//! Frames are forwarded untouched in both directions. The provider credential
//! stays on this side of the relay.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{
    self, Message as UpstreamMessage, client::IntoClientRequest, http::HeaderValue,
    http::header::AUTHORIZATION,
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use super::RelayConfig;
use super::protocol::{self, ClientMessage, ErrorBody, ServerEvent, ServerMessage};
use crate::api::auth::bearer_token;
use crate::db::TranscriptRepo;
use crate::voice::{TranscriptLog, TranscriptRecord, TranscriptSource};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(1);

type Upstream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type SharedObserver = Arc<Mutex<ConversationObserver>>;

/// Shared relay state
pub struct RelayState {
    pub config: RelayConfig,
    /// Where finished realtime transcripts go
    pub transcripts: Option<TranscriptRepo>,
}

#[derive(Debug, Deserialize)]
struct RelayQuery {
    token: Option<String>,
}

/// Build relay router
pub fn router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/realtime", get(upgrade))
        .with_state(state)
}

async fn upgrade(
    State(state): State<Arc<RelayState>>,
    Query(query): Query<RelayQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let provided = bearer_token(&headers).or(query.token.as_deref());
    if !authorize(state.config.relay_token.as_ref(), provided) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    ws.on_upgrade(move |socket| relay_session(socket, state))
}

fn authorize(expected: Option<&SecretString>, provided: Option<&str>) -> bool {
    let Some(expected) = expected else {
        tracing::warn!("relay token not configured - allowing unauthenticated access");
        return true;
    };

    match provided {
        Some(token) if token == expected.expose_secret() => true,
        Some(_) => {
            tracing::warn!("invalid relay token provided");
            false
        }
        None => {
            tracing::debug!("no relay token provided");
            false
        }
    }
}

async fn relay_session(mut socket: WebSocket, state: Arc<RelayState>) {
    let session_id = Uuid::new_v4();

    let upstream = match connect_upstream(&state.config).await {
        Ok(upstream) => upstream,
        Err(failure) => {
            tracing::warn!(
                %session_id,
                code = %failure.code,
                reason = %failure.reason,
                "upstream connect failed"
            );
            let frame = ServerMessage::error(failure.code, failure.reason);
            if let Ok(text) = serde_json::to_string(&frame) {
                let _ = socket.send(Message::Text(text.into())).await;
            }
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };
    tracing::info!(%session_id, "relay session started");

    let observer: SharedObserver = Arc::new(Mutex::new(
        ConversationObserver::new(session_id).with_idle_flush(state.config.idle_flush),
    ));

    let (client_sink, client_stream) = socket.split();
    let (upstream_sink, upstream_stream) = upstream.split();
    let capacity = state.config.max_in_flight.max(1);
    let (to_upstream, upstream_rx) = mpsc::channel(capacity);
    let (to_client, client_rx) = mpsc::channel(capacity);

    let upstream_writer = tokio::spawn(write_upstream(upstream_sink, upstream_rx));
    let client_writer = tokio::spawn(write_client(client_sink, client_rx));
    let mut client_reader = tokio::spawn(read_client(client_stream, to_upstream, observer.clone()));
    let mut upstream_reader =
        tokio::spawn(read_upstream(upstream_stream, to_client, observer.clone()));
    let idle = tokio::spawn(flush_idle(observer.clone()));

    // Whichever side goes away first takes the other one with it
    tokio::select! {
        _ = &mut client_reader => {
            tracing::debug!(%session_id, "client disconnected");
            upstream_reader.abort();
        }
        _ = &mut upstream_reader => {
            tracing::debug!(%session_id, "upstream disconnected");
            client_reader.abort();
        }
    }
    idle.abort();

    let _ = tokio::time::timeout(CLOSE_TIMEOUT, async {
        let _ = upstream_writer.await;
        let _ = client_writer.await;
    })
    .await;

    let record = observer.lock().await.finish();
    tracing::info!(%session_id, "relay session ended");

    if let (Some(record), Some(repo)) = (record, state.transcripts.clone()) {
        persist(repo, record);
    }
}

async fn connect_upstream(config: &RelayConfig) -> Result<Upstream, ErrorBody> {
    let mut request = config
        .upstream_url
        .as_str()
        .into_client_request()
        .map_err(connect_failed)?;

    if let Some(key) = &config.provider_api_key {
        let value = HeaderValue::from_str(&format!("Bearer {}", key.expose_secret()))
            .map_err(connect_failed)?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }

    match tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(request)).await {
        Ok(Ok((stream, _))) => Ok(stream),
        Ok(Err(tungstenite::Error::Http(response))) => Err(ErrorBody {
            code: response.status().as_u16().to_string(),
            reason: format!("upstream rejected handshake: {}", response.status()),
        }),
        Ok(Err(e)) => Err(connect_failed(e)),
        Err(_) => Err(connect_failed("timed out")),
    }
}

fn connect_failed(reason: impl std::fmt::Display) -> ErrorBody {
    ErrorBody {
        code: "connect_failed".to_string(),
        reason: reason.to_string(),
    }
}

async fn read_client(
    mut stream: SplitStream<WebSocket>,
    tx: mpsc::Sender<UpstreamMessage>,
    observer: SharedObserver,
) {
    while let Some(message) = stream.next().await {
        let forward = match message {
            Ok(Message::Text(text)) => match protocol::parse_frame(text.as_str()) {
                Ok(frame) => {
                    observer.lock().await.observe_client(&frame);
                    UpstreamMessage::text(text.as_str().to_string())
                }
                Err(e) => {
                    tracing::warn!(error = %e, "dropping client frame");
                    continue;
                }
            },
            Ok(Message::Binary(data)) => UpstreamMessage::Binary(data),
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        if tx.send(forward).await.is_err() {
            break;
        }
    }
}

async fn read_upstream(
    mut stream: SplitStream<Upstream>,
    tx: mpsc::Sender<Message>,
    observer: SharedObserver,
) {
    while let Some(message) = stream.next().await {
        let forward = match message {
            Ok(UpstreamMessage::Text(text)) => match protocol::parse_frame(text.as_str()) {
                Ok(frame) => {
                    observer.lock().await.observe_server(&frame, Instant::now());
                    Message::Text(text.as_str().to_string().into())
                }
                Err(e) => {
                    tracing::warn!(error = %e, "dropping upstream frame");
                    continue;
                }
            },
            Ok(UpstreamMessage::Binary(data)) => {
                // Some providers send JSON in binary frames
                if let Some(frame) = std::str::from_utf8(&data)
                    .ok()
                    .and_then(|text| protocol::parse_frame(text).ok())
                {
                    observer.lock().await.observe_server(&frame, Instant::now());
                }
                Message::Binary(data)
            }
            Ok(UpstreamMessage::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        if tx.send(forward).await.is_err() {
            break;
        }
    }
}

async fn write_upstream(
    mut sink: SplitSink<Upstream, UpstreamMessage>,
    mut rx: mpsc::Receiver<UpstreamMessage>,
) {
    while let Some(message) = rx.recv().await {
        if let Err(e) = sink.send(message).await {
            tracing::debug!(error = %e, "upstream write failed");
            break;
        }
    }
    let _ = sink.close().await;
}

async fn write_client(mut sink: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<Message>) {
    while let Some(message) = rx.recv().await {
        if let Err(e) = sink.send(message).await {
            tracing::debug!(error = %e, "client write failed");
            break;
        }
    }
    let _ = sink.close().await;
}

async fn flush_idle(observer: SharedObserver) {
    let mut ticker = tokio::time::interval(IDLE_CHECK_INTERVAL);
    loop {
        ticker.tick().await;
        observer.lock().await.flush_if_idle(Instant::now());
    }
}

fn persist(repo: TranscriptRepo, record: TranscriptRecord) {
    tokio::task::spawn_blocking(move || {
        if let Err(e) = repo.save(&record) {
            tracing::error!(id = %record.id, error = %e, "failed to save realtime transcript");
        }
    });
}

/// Builds a transcript from the frames passing through the relay
#[derive(Debug)]
pub struct ConversationObserver {
    log: Option<TranscriptLog>,
}

impl ConversationObserver {
    #[must_use]
    pub fn new(session_id: Uuid) -> Self {
        Self {
            log: Some(TranscriptLog::new(session_id, TranscriptSource::Realtime)),
        }
    }

    #[must_use]
    pub fn with_idle_flush(mut self, idle_flush: Duration) -> Self {
        self.log = self.log.map(|log| log.with_idle_flush(idle_flush));
        self
    }

    /// Typed user input becomes a user entry
    pub fn observe_client(&mut self, frame: &serde_json::Value) {
        let Some(log) = self.log.as_mut() else {
            return;
        };
        if let Some(ClientMessage::RealtimeInput(input)) = protocol::as_client_message(frame)
            && let Some(text) = input.text
        {
            log.push_user(text);
        }
    }

    /// Model text is buffered until the turn completes or is interrupted
    pub fn observe_server(&mut self, frame: &serde_json::Value, now: Instant) {
        let Some(log) = self.log.as_mut() else {
            return;
        };
        let Some(message) = protocol::as_server_message(frame) else {
            return;
        };

        for event in ServerEvent::classify(&message) {
            match event {
                ServerEvent::Text(text) => log.append_assistant_delta(&text, now),
                ServerEvent::TurnComplete | ServerEvent::Interrupted => {
                    log.flush_assistant();
                }
                _ => {}
            }
        }
    }

    pub fn flush_if_idle(&mut self, now: Instant) -> bool {
        self.log
            .as_mut()
            .is_some_and(|log| log.flush_if_idle(now))
    }

    /// Close the log; `None` if nothing was said or already finished
    pub fn finish(&mut self) -> Option<TranscriptRecord> {
        let record = self.log.take()?.finish();
        if record.entries.is_empty() {
            return None;
        }
        Some(record)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::voice::Speaker;

    #[test]
    fn test_authorize() {
        let token = SecretString::from("relay-secret");
        assert!(authorize(None, None));
        assert!(authorize(Some(&token), Some("relay-secret")));
        assert!(!authorize(Some(&token), Some("wrong")));
        assert!(!authorize(Some(&token), None));
    }

    #[test]
    fn test_observer_builds_transcript() {
        let mut observer = ConversationObserver::new(Uuid::new_v4());
        let now = Instant::now();

        observer.observe_client(&json!({ "setup": { "responseModalities": ["AUDIO"] } }));
        observer.observe_client(&json!({ "realtimeInput": { "text": "Who applied today?" } }));
        observer.observe_server(
            &json!({ "serverContent": { "modelTurn": { "parts": [{ "text": "Three " }] } } }),
            now,
        );
        observer.observe_server(
            &json!({ "serverContent": { "modelTurn": { "parts": [{ "text": "candidates." }] } } }),
            now,
        );
        observer.observe_server(&json!({ "serverContent": { "turnComplete": true } }), now);

        let record = observer.finish().unwrap();
        assert_eq!(record.source, TranscriptSource::Realtime);
        assert_eq!(record.entries.len(), 2);
        assert_eq!(record.entries[0].speaker, Speaker::User);
        assert_eq!(record.entries[1].text, "Three candidates.");
        assert!(observer.finish().is_none());
    }

    #[test]
    fn test_observer_ignores_unknown_frames() {
        let mut observer = ConversationObserver::new(Uuid::new_v4());
        observer.observe_client(&json!({ "somethingElse": 1 }));
        observer.observe_server(&json!([1, 2, 3]), Instant::now());
        assert!(observer.finish().is_none());
    }

    #[test]
    fn test_observer_idle_flush() {
        let mut observer =
            ConversationObserver::new(Uuid::new_v4()).with_idle_flush(Duration::from_secs(5));
        let t0 = Instant::now();
        observer.observe_server(
            &json!({ "serverContent": { "modelTurn": { "parts": [{ "text": "Partial" }] } } }),
            t0,
        );
        assert!(!observer.flush_if_idle(t0 + Duration::from_secs(1)));
        assert!(observer.flush_if_idle(t0 + Duration::from_secs(5)));
    }

    #[test]
    fn test_connect_failed_body() {
        let body = connect_failed("connection refused");
        assert_eq!(body.code, "connect_failed");
        assert_eq!(body.reason, "connection refused");
    }
}
