//! Shared test utilities

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use eva_voice::voice::{
    AudioChunk, AudioSink, ConversationTurn, MemorySpeechCache, PlaybackController, SessionDeps,
    SpeechSynthesizer, SpeechToText, SynthesisBackend, SynthesisRequest, SynthesisResponse,
    TurnProcessor, TurnReply,
};
use eva_voice::{DbPool, Error, Result, TranscriptRepo, db};

/// Set up an in-memory test database
#[must_use]
pub fn setup_test_db() -> DbPool {
    db::init_memory().expect("failed to init test db")
}

/// Transcriber that answers from a script, keyed by chunk sequence number
pub struct ScriptedStt {
    lines: Vec<&'static str>,
    pub calls: AtomicUsize,
}

impl ScriptedStt {
    pub fn new(lines: Vec<&'static str>) -> Self {
        Self {
            lines,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SpeechToText for ScriptedStt {
    async fn transcribe(&self, _session_id: Uuid, chunk: &AudioChunk) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let index = usize::try_from(chunk.seq).unwrap_or(usize::MAX);
        Ok(self.lines.get(index).copied().unwrap_or("").to_string())
    }
}

/// Reasoning engine that always gives the same reply, or always fails
pub struct CannedProcessor {
    reply: &'static str,
    fail: bool,
    pub turns: std::sync::Mutex<Vec<ConversationTurn>>,
}

impl CannedProcessor {
    pub fn new(reply: &'static str) -> Self {
        Self {
            reply,
            fail: false,
            turns: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new("")
        }
    }

    pub fn calls(&self) -> usize {
        self.turns.lock().unwrap().len()
    }
}

#[async_trait]
impl TurnProcessor for CannedProcessor {
    async fn process(&self, turn: &ConversationTurn) -> Result<TurnReply> {
        self.turns.lock().unwrap().push(turn.clone());
        if self.fail {
            return Err(Error::Reasoning("engine unavailable".to_string()));
        }
        Ok(TurnReply {
            reply: self.reply.to_string(),
            tool_executions: Vec::new(),
        })
    }
}

/// Synthesis backend returning fixed bytes
pub struct FakeBackend {
    pub calls: AtomicUsize,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SynthesisBackend for FakeBackend {
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<SynthesisResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let audio = Bytes::from(format!("audio:{}", request.text));
        Ok(SynthesisResponse {
            upstream_cached: false,
            stream: futures::stream::iter(vec![Ok(audio)]).boxed(),
        })
    }
}

/// Sink that counts render calls
///
/// Returns at once, or with `hold` set keeps the source live until it is
/// stopped (capped at five seconds).
#[derive(Default)]
pub struct CountingSink {
    pub renders: AtomicUsize,
    hold: bool,
}

impl CountingSink {
    pub fn holding() -> Self {
        Self {
            renders: AtomicUsize::new(0),
            hold: true,
        }
    }
}

impl AudioSink for CountingSink {
    fn render(&self, _samples: &[f32], _sample_rate: u32, stop: &CancellationToken) -> Result<()> {
        self.renders.fetch_add(1, Ordering::SeqCst);
        let start = std::time::Instant::now();
        while self.hold && !stop.is_cancelled() && start.elapsed() < Duration::from_secs(5) {
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    }
}

/// Fakes wired into session dependencies
pub struct Harness {
    pub stt: Arc<ScriptedStt>,
    pub processor: Arc<CannedProcessor>,
    pub backend: Arc<FakeBackend>,
    pub sink: Arc<CountingSink>,
    pub repo: TranscriptRepo,
    pub deps: SessionDeps,
}

impl Harness {
    pub fn new(lines: Vec<&'static str>, reply: &'static str) -> Self {
        Self::build(lines, CannedProcessor::new(reply), CountingSink::default())
    }

    /// Harness whose playback stays live until interrupted
    pub fn holding_playback(lines: Vec<&'static str>, reply: &'static str) -> Self {
        Self::build(lines, CannedProcessor::new(reply), CountingSink::holding())
    }

    /// Harness whose reasoning engine fails every turn
    pub fn failing_turns(lines: Vec<&'static str>) -> Self {
        Self::build(lines, CannedProcessor::failing(), CountingSink::default())
    }

    fn build(lines: Vec<&'static str>, processor: CannedProcessor, sink: CountingSink) -> Self {
        let stt = Arc::new(ScriptedStt::new(lines));
        let processor = Arc::new(processor);
        let backend = Arc::new(FakeBackend::new());
        let sink = Arc::new(sink);
        let repo = TranscriptRepo::new(setup_test_db());

        let synthesizer = Arc::new(SpeechSynthesizer::new(
            backend.clone(),
            Arc::new(MemorySpeechCache::new(1024 * 1024, Duration::from_secs(60))),
            "rachel",
            "eleven_turbo_v2",
        ));

        let deps = SessionDeps {
            stt: stt.clone(),
            processor: processor.clone(),
            synthesizer,
            playback: Arc::new(PlaybackController::new(sink.clone())),
            transcripts: Some(repo.clone()),
        };

        Self {
            stt,
            processor,
            backend,
            sink,
            repo,
            deps,
        }
    }
}
