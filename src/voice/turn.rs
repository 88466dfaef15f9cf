//! Conversation turns and the single-flight turn queue

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{Error, Result};

/// A user utterance handed to the reasoning engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationTurn {
    pub session_id: Uuid,
    pub utterance: String,
    pub timestamp: DateTime<Utc>,
    pub attachments: Vec<Attachment>,
}

impl ConversationTurn {
    /// Create a turn with no attachments
    #[must_use]
    pub fn new(session_id: Uuid, utterance: impl Into<String>) -> Self {
        Self {
            session_id,
            utterance: utterance.into(),
            timestamp: Utc::now(),
            attachments: Vec::new(),
        }
    }
}

/// File attached to a turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub name: String,
    pub mime_type: String,
    /// Base64 payload
    pub data: String,
}

/// A tool the reasoning engine ran while producing a reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolExecution {
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub is_error: bool,
}

/// Reasoning engine output for one turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnReply {
    pub reply: String,
    #[serde(default)]
    pub tool_executions: Vec<ToolExecution>,
}

/// Opaque reasoning engine
#[async_trait]
pub trait TurnProcessor: Send + Sync {
    /// Produce a reply for one turn
    ///
    /// # Errors
    ///
    /// Returns `Error::Reasoning` if the engine fails
    async fn process(&self, turn: &ConversationTurn) -> Result<TurnReply>;
}

/// Reasoning service settings
#[derive(Debug)]
pub struct ReasoningConfig {
    /// Base URL; requests go to `{base_url}/turn`
    pub base_url: String,
    pub api_token: Option<SecretString>,
    pub timeout: Duration,
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000/api/voice".to_string(),
            api_token: None,
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TurnRequest<'a> {
    session_id: String,
    message: &'a str,
    attachments: &'a [Attachment],
}

/// Reasoning engine reached over HTTP
pub struct HttpTurnProcessor {
    client: reqwest::Client,
    endpoint: String,
    api_token: Option<SecretString>,
}

impl HttpTurnProcessor {
    /// Create a new HTTP turn processor
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new(config: ReasoningConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: format!("{}/turn", config.base_url.trim_end_matches('/')),
            api_token: config.api_token,
        })
    }
}

#[async_trait]
impl TurnProcessor for HttpTurnProcessor {
    async fn process(&self, turn: &ConversationTurn) -> Result<TurnReply> {
        let request = TurnRequest {
            session_id: turn.session_id.to_string(),
            message: &turn.utterance,
            attachments: &turn.attachments,
        };

        let mut builder = self.client.post(&self.endpoint).json(&request);
        if let Some(token) = &self.api_token {
            builder = builder.bearer_auth(token.expose_secret());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::Reasoning(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Reasoning(format!("reasoning error {status}: {body}")));
        }

        response
            .json()
            .await
            .map_err(|e| Error::Reasoning(e.to_string()))
    }
}

/// Queue tuning
#[derive(Debug, Clone)]
pub struct TurnQueueConfig {
    /// Pause after each turn before the next starts
    pub inter_turn_delay: Duration,
    /// Max turns waiting behind the active one
    pub capacity: usize,
}

impl Default for TurnQueueConfig {
    fn default() -> Self {
        Self {
            inter_turn_delay: Duration::from_millis(100),
            capacity: 32,
        }
    }
}

/// Result of processing one turn
#[derive(Debug)]
pub enum TurnOutcome {
    Completed {
        turn: ConversationTurn,
        reply: TurnReply,
    },
    Failed {
        turn: ConversationTurn,
        error: Error,
    },
}

#[derive(Debug, Default)]
struct QueueState {
    pending: AtomicUsize,
    active: AtomicBool,
}

/// FIFO queue that runs at most one turn at a time
///
/// Dropping the queue or cancelling the parent token stops the pump;
/// turns still waiting are discarded unprocessed.
pub struct TurnQueue {
    tx: mpsc::Sender<ConversationTurn>,
    state: Arc<QueueState>,
    cancel: CancellationToken,
}

impl TurnQueue {
    /// Start the pump task
    pub fn spawn(
        processor: Arc<dyn TurnProcessor>,
        config: TurnQueueConfig,
        outcomes: mpsc::Sender<TurnOutcome>,
        parent: &CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        let state = Arc::new(QueueState::default());
        let cancel = parent.child_token();

        tokio::spawn(pump(
            processor,
            config,
            rx,
            outcomes,
            Arc::clone(&state),
            cancel.clone(),
        ));

        Self { tx, state, cancel }
    }

    /// Append a turn
    ///
    /// # Errors
    ///
    /// Returns `Error::Session` if the queue has been closed
    pub async fn enqueue(&self, turn: ConversationTurn) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Session("turn queue closed".to_string()));
        }

        self.state.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(turn).await.is_err() {
            self.state.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::Session("turn queue closed".to_string()));
        }
        Ok(())
    }

    /// Turns waiting, not counting the active one
    #[must_use]
    pub fn pending(&self) -> usize {
        self.state.pending.load(Ordering::SeqCst)
    }

    /// Whether a turn is being processed right now
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state.active.load(Ordering::SeqCst)
    }

    /// Stop the pump and discard waiting turns
    pub fn close(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for TurnQueue {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn pump(
    processor: Arc<dyn TurnProcessor>,
    config: TurnQueueConfig,
    mut rx: mpsc::Receiver<ConversationTurn>,
    outcomes: mpsc::Sender<TurnOutcome>,
    state: Arc<QueueState>,
    cancel: CancellationToken,
) {
    loop {
        let turn = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            turn = rx.recv() => match turn {
                Some(turn) => turn,
                None => break,
            },
        };

        state.pending.fetch_sub(1, Ordering::SeqCst);
        state.active.store(true, Ordering::SeqCst);
        tracing::debug!(utterance = %turn.utterance, "processing turn");

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                state.active.store(false, Ordering::SeqCst);
                break;
            }
            result = processor.process(&turn) => result,
        };
        state.active.store(false, Ordering::SeqCst);

        let outcome = match result {
            Ok(reply) => TurnOutcome::Completed { turn, reply },
            Err(error) => {
                tracing::warn!(utterance = %turn.utterance, error = %error, "turn failed");
                TurnOutcome::Failed { turn, error }
            }
        };
        if outcomes.send(outcome).await.is_err() {
            break;
        }

        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(config.inter_turn_delay) => {}
        }
    }

    rx.close();
    let mut discarded = 0usize;
    while rx.try_recv().is_ok() {
        discarded += 1;
    }
    state.pending.store(0, Ordering::SeqCst);

    if discarded > 0 {
        tracing::info!(discarded, "turn queue closed, pending turns discarded");
    } else {
        tracing::debug!("turn queue closed");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;
    use tokio::time::Instant;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    /// Records overlap and start times; fails on utterances starting with "fail"
    struct RecordingProcessor {
        running: AtomicUsize,
        max_running: AtomicUsize,
        log: Mutex<Vec<(String, Instant)>>,
        work: Duration,
    }

    impl RecordingProcessor {
        fn new(work: Duration) -> Self {
            Self {
                running: AtomicUsize::new(0),
                max_running: AtomicUsize::new(0),
                log: Mutex::new(Vec::new()),
                work,
            }
        }
    }

    #[async_trait]
    impl TurnProcessor for RecordingProcessor {
        async fn process(&self, turn: &ConversationTurn) -> Result<TurnReply> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            self.log
                .lock()
                .unwrap()
                .push((turn.utterance.clone(), Instant::now()));

            tokio::time::sleep(self.work).await;
            self.running.fetch_sub(1, Ordering::SeqCst);

            if turn.utterance.starts_with("fail") {
                return Err(Error::Reasoning("engine down".to_string()));
            }
            Ok(TurnReply {
                reply: format!("re: {}", turn.utterance),
                tool_executions: Vec::new(),
            })
        }
    }

    fn turn(text: &str) -> ConversationTurn {
        ConversationTurn::new(Uuid::nil(), text)
    }

    #[tokio::test(start_paused = true)]
    async fn test_turns_are_serialized_fifo_with_gap() {
        let processor = Arc::new(RecordingProcessor::new(Duration::from_millis(300)));
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let queue = TurnQueue::spawn(
            Arc::clone(&processor) as Arc<dyn TurnProcessor>,
            TurnQueueConfig::default(),
            out_tx,
            &cancel,
        );

        for text in ["one", "fail two", "three"] {
            queue.enqueue(turn(text)).await.unwrap();
        }

        let mut replies = Vec::new();
        for _ in 0..3 {
            match out_rx.recv().await.unwrap() {
                TurnOutcome::Completed { reply, .. } => replies.push(reply.reply),
                TurnOutcome::Failed { turn, error } => {
                    assert_eq!(turn.utterance, "fail two");
                    assert!(matches!(error, Error::Reasoning(_)));
                }
            }
        }
        assert_eq!(replies, vec!["re: one", "re: three"]);
        assert_eq!(processor.max_running.load(Ordering::SeqCst), 1);

        let log = processor.log.lock().unwrap().clone();
        let order: Vec<_> = log.iter().map(|(u, _)| u.as_str()).collect();
        assert_eq!(order, vec!["one", "fail two", "three"]);
        for pair in log.windows(2) {
            let gap = pair[1].1.duration_since(pair[0].1);
            assert!(gap >= Duration::from_millis(400), "gap was {gap:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_discards_pending() {
        let processor = Arc::new(RecordingProcessor::new(Duration::from_secs(5)));
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let queue = TurnQueue::spawn(
            Arc::clone(&processor) as Arc<dyn TurnProcessor>,
            TurnQueueConfig::default(),
            out_tx,
            &cancel,
        );

        for text in ["a long one", "b", "c"] {
            queue.enqueue(turn(text)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(queue.is_active());
        assert_eq!(queue.pending(), 2);

        queue.close();
        assert!(queue.enqueue(turn("late")).await.is_err());

        // Pump exits without emitting anything else
        assert!(out_rx.recv().await.is_none());
        assert_eq!(processor.log.lock().unwrap().len(), 1);
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parent_cancel_stops_queue() {
        let processor = Arc::new(RecordingProcessor::new(Duration::from_millis(1)));
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let queue = TurnQueue::spawn(processor, TurnQueueConfig::default(), out_tx, &cancel);

        cancel.cancel();
        assert!(queue.is_closed());
        assert!(out_rx.recv().await.is_none());
    }

    #[test]
    fn test_reply_deserializes_camel_case() {
        let reply: TurnReply = serde_json::from_value(json!({
            "reply": "Booked for 3pm.",
            "toolExecutions": [
                { "name": "calendar.create", "arguments": { "at": "15:00" }, "isError": false }
            ]
        }))
        .unwrap();
        assert_eq!(reply.tool_executions.len(), 1);
        assert_eq!(reply.tool_executions[0].name, "calendar.create");
        assert!(reply.tool_executions[0].result.is_none());
    }

    #[tokio::test]
    async fn test_http_processor_contract() {
        let server = MockServer::start().await;
        let session_id = Uuid::new_v4();

        Mock::given(method("POST"))
            .and(path("/turn"))
            .and(body_partial_json(json!({
                "sessionId": session_id.to_string(),
                "message": "Schedule a call",
                "attachments": [],
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "reply": "Done",
                "toolExecutions": []
            })))
            .expect(1)
            .mount(&server)
            .await;

        let processor = HttpTurnProcessor::new(ReasoningConfig {
            base_url: server.uri(),
            ..ReasoningConfig::default()
        })
        .unwrap();
        let reply = processor
            .process(&ConversationTurn::new(session_id, "Schedule a call"))
            .await
            .unwrap();
        assert_eq!(reply.reply, "Done");
    }

    #[tokio::test]
    async fn test_http_processor_failure_is_reasoning_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let processor = HttpTurnProcessor::new(ReasoningConfig {
            base_url: server.uri(),
            ..ReasoningConfig::default()
        })
        .unwrap();
        let err = processor.process(&turn("hi there")).await.unwrap_err();
        assert!(matches!(err, Error::Reasoning(_)));
    }
}
