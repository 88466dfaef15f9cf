//! Voice session orchestration
//!
//! A session wires the pipeline stages together as tasks connected by
//! bounded channels:
//!
//! ```text
//! chunk cycle -> dispatch -> (one task per chunk) transcribe -> filter -> turn queue -> speaker
//! vad loop    -> listening events / barge-in
//! ```
//!
//! Every task observes the session's cancellation token. Only device loss
//! ends a session from the inside, through the same teardown as
//! [`VoiceSession::end`]; everything else is reported as an event.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use super::capture::{AudioCapture, CaptureConfig, CaptureEvent, CaptureTap, run_chunk_cycle};
use super::events::{EventBus, SessionEvent, SessionState};
use super::filter::{FilterConfig, Rejection, TranscriptFilter};
use super::playback::PlaybackController;
use super::stt::SpeechToText;
use super::transcript::{TranscriptLog, TranscriptSource};
use super::tts::SpeechSynthesizer;
use super::turn::{ConversationTurn, TurnOutcome, TurnProcessor, TurnQueue, TurnQueueConfig};
use super::vad::{VadConfig, VadEvent, run_vad};
use crate::db::TranscriptRepo;
use crate::{Error, Result};

/// Capacity of the internal stage channels
const STAGE_CAPACITY: usize = 16;

/// Per-session tuning
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub capture: CaptureConfig,
    pub vad: VadConfig,
    pub filter: FilterConfig,
    pub turns: TurnQueueConfig,
    /// Cut assistant audio as soon as the user starts speaking
    pub interrupt_on_speech: bool,
}

/// Collaborators injected into a session
#[derive(Clone)]
pub struct SessionDeps {
    pub stt: Arc<dyn SpeechToText>,
    pub processor: Arc<dyn TurnProcessor>,
    pub synthesizer: Arc<SpeechSynthesizer>,
    pub playback: Arc<PlaybackController>,
    /// Where the transcript goes when the session ends
    pub transcripts: Option<TranscriptRepo>,
}

/// State shared between the session handle and its pipeline tasks
struct SessionCore {
    id: Uuid,
    state: Mutex<SessionState>,
    queue: Mutex<Option<Arc<TurnQueue>>>,
    tap: Mutex<Option<CaptureTap>>,
    log: Arc<Mutex<TranscriptLog>>,
    events: EventBus,
    /// Stops the pipeline tasks
    cancel: CancellationToken,
    /// Fires once teardown has run
    ended: CancellationToken,
    tasks: TaskTracker,
    playback: Arc<PlaybackController>,
    transcripts: Option<TranscriptRepo>,
}

impl SessionCore {
    fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    /// Tear the session down; later calls do nothing
    ///
    /// Runs from [`VoiceSession::end`] or from the pipeline itself on a
    /// fatal error. The transcript save is tracked on the session's tasks.
    fn shutdown(&self, reason: &str) {
        {
            let mut state = lock(&self.state);
            if *state == SessionState::Ended {
                return;
            }
            *state = SessionState::Ended;
        }

        self.cancel.cancel();

        if let Some(tap) = lock(&self.tap).take() {
            tap.close();
        }
        if let Some(queue) = lock(&self.queue).as_ref() {
            queue.close();
        }

        let stopped = self.playback.interrupt_all();
        if stopped > 0 {
            self.events
                .emit(SessionEvent::PlaybackInterrupted { count: stopped });
        }

        self.events.emit(SessionEvent::State {
            state: SessionState::Ended,
        });
        self.events.emit(SessionEvent::Ended {
            reason: reason.to_string(),
        });
        tracing::info!(session_id = %self.id, reason = %reason, "voice session ended");

        self.persist_transcript();
        self.tasks.close();
        self.ended.cancel();
    }

    fn persist_transcript(&self) {
        let record = {
            let mut log = lock(&self.log);
            std::mem::replace(
                &mut *log,
                TranscriptLog::new(self.id, TranscriptSource::Pipeline),
            )
            .finish()
        };

        if record.entries.is_empty() {
            tracing::debug!(session_id = %self.id, "empty transcript, not persisting");
            return;
        }

        let Some(repo) = self.transcripts.clone() else {
            return;
        };

        self.tasks.spawn_blocking(move || {
            if let Err(e) = repo.save(&record) {
                tracing::warn!(session_id = %record.session_id, error = %e, "failed to persist transcript");
            }
        });
    }
}

/// One conversation between a user and the assistant
pub struct VoiceSession {
    core: Arc<SessionCore>,
    config: SessionConfig,
    deps: SessionDeps,
    capture: Option<AudioCapture>,
}

impl VoiceSession {
    #[must_use]
    pub fn new(deps: SessionDeps, config: SessionConfig) -> Self {
        let id = Uuid::new_v4();
        let core = SessionCore {
            id,
            state: Mutex::new(SessionState::Idle),
            queue: Mutex::new(None),
            tap: Mutex::new(None),
            log: Arc::new(Mutex::new(TranscriptLog::new(id, TranscriptSource::Pipeline))),
            events: EventBus::default(),
            cancel: CancellationToken::new(),
            ended: CancellationToken::new(),
            tasks: TaskTracker::new(),
            playback: Arc::clone(&deps.playback),
            transcripts: deps.transcripts.clone(),
        };

        Self {
            core: Arc::new(core),
            config,
            deps,
            capture: None,
        }
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.core.id
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.core.state()
    }

    /// Subscribe to session events
    #[must_use]
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<SessionEvent> {
        self.core.events.subscribe()
    }

    /// Turns waiting behind the active one
    #[must_use]
    pub fn pending_turns(&self) -> usize {
        lock(&self.core.queue).as_ref().map_or(0, |q| q.pending())
    }

    /// Resolves once the session has ended, on its own (device loss) or
    /// through [`VoiceSession::end`]
    pub async fn stopped(&self) {
        self.core.ended.cancelled().await;
    }

    /// Wait for an ended session's tasks, including the transcript save
    pub async fn finished(&self) {
        self.core.ended.cancelled().await;
        self.core.tasks.wait().await;
    }

    /// Open the default microphone and start the pipeline
    ///
    /// # Errors
    ///
    /// Returns `Error::Device` if the microphone cannot be opened; the session
    /// is ended in that case
    pub fn start(&mut self) -> Result<()> {
        if self.state() != SessionState::Idle {
            return Err(Error::Session(format!("session {} already started", self.id())));
        }

        let opened = AudioCapture::new().and_then(|mut capture| {
            let tap = capture.start()?;
            Ok((capture, tap))
        });

        match opened {
            Ok((capture, tap)) => {
                self.capture = Some(capture);
                self.start_with_tap(tap)
            }
            Err(e) => {
                tracing::error!(session_id = %self.id(), error = %e, "failed to open microphone");
                self.core.events.emit(SessionEvent::from_error(&e));
                self.core.shutdown(&e.to_string());
                Err(e)
            }
        }
    }

    /// Start the pipeline on an already running capture tap
    ///
    /// # Errors
    ///
    /// Returns `Error::Session` if the session was already started or ended
    pub fn start_with_tap(&mut self, tap: CaptureTap) -> Result<()> {
        let core = &self.core;
        {
            let mut state = lock(&core.state);
            if *state != SessionState::Idle {
                return Err(Error::Session(format!("session {} already started", core.id)));
            }
            *state = SessionState::Capturing;
        }

        let (chunk_tx, chunk_rx) = mpsc::channel(STAGE_CAPACITY);
        let (vad_tx, vad_rx) = mpsc::channel(STAGE_CAPACITY * 4);
        let (text_tx, text_rx) = mpsc::channel(STAGE_CAPACITY);
        let (outcome_tx, outcome_rx) = mpsc::channel(STAGE_CAPACITY);

        let queue = Arc::new(TurnQueue::spawn(
            Arc::clone(&self.deps.processor),
            self.config.turns.clone(),
            outcome_tx,
            &core.cancel,
        ));
        *lock(&core.queue) = Some(Arc::clone(&queue));
        *lock(&core.tap) = Some(tap.clone());

        core.tasks.spawn(run_chunk_cycle(
            tap.clone(),
            self.config.capture.clone(),
            chunk_tx,
            core.cancel.clone(),
        ));
        core.tasks.spawn(run_vad(
            tap,
            self.config.vad.clone(),
            vad_tx,
            core.cancel.clone(),
        ));

        core.tasks.spawn(dispatch_chunks(
            Arc::clone(core),
            Arc::clone(&self.deps.stt),
            chunk_rx,
            text_tx,
        ));

        core.tasks.spawn(filter_transcripts(
            core.id,
            TranscriptFilter::new(&self.config.filter),
            text_rx,
            queue,
            Arc::clone(&core.log),
            core.events.clone(),
            core.cancel.clone(),
        ));

        core.tasks.spawn(speak_replies(
            Arc::clone(&self.deps.synthesizer),
            Arc::clone(&self.deps.playback),
            outcome_rx,
            Arc::clone(&core.log),
            core.events.clone(),
            core.cancel.clone(),
        ));

        core.tasks.spawn(forward_vad(
            vad_rx,
            Arc::clone(&self.deps.playback),
            self.config.interrupt_on_speech,
            core.events.clone(),
        ));

        core.events.emit(SessionEvent::State {
            state: SessionState::Capturing,
        });
        tracing::info!(session_id = %core.id, "voice session started");
        Ok(())
    }

    /// End the session
    ///
    /// Stops the chunk timer and VAD, releases the microphone, discards
    /// queued turns and silences playback. The transcript is saved in the
    /// background; await [`VoiceSession::finished`] to wait for it.
    pub fn end(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
        self.core.shutdown("ended by user");
    }
}

impl Drop for VoiceSession {
    fn drop(&mut self) {
        self.core.cancel.cancel();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Hand each chunk to its own transcription task
async fn dispatch_chunks(
    core: Arc<SessionCore>,
    stt: Arc<dyn SpeechToText>,
    mut chunks: mpsc::Receiver<CaptureEvent>,
    transcripts: mpsc::Sender<(u64, Result<String>)>,
) {
    while let Some(event) = chunks.recv().await {
        match event {
            CaptureEvent::Chunk(chunk) => {
                core.events
                    .emit(SessionEvent::ChunkCaptured { seq: chunk.seq });

                let stt = Arc::clone(&stt);
                let tx = transcripts.clone();
                let cancel = core.cancel.clone();
                let session_id = core.id;

                core.tasks.spawn(async move {
                    let result = tokio::select! {
                        () = cancel.cancelled() => return,
                        result = stt.transcribe(session_id, &chunk) => result,
                    };
                    let _ = tx.send((chunk.seq, result)).await;
                });
            }
            CaptureEvent::DeviceLost(reason) => {
                let error = Error::Device(reason);
                tracing::error!(session_id = %core.id, error = %error, "ending session");
                core.events.emit(SessionEvent::from_error(&error));
                core.shutdown(&error.to_string());
                break;
            }
        }
    }
}

/// Filter transcripts in resolution order and queue accepted ones
async fn filter_transcripts(
    session_id: Uuid,
    mut filter: TranscriptFilter,
    mut rx: mpsc::Receiver<(u64, Result<String>)>,
    queue: Arc<TurnQueue>,
    log: Arc<Mutex<TranscriptLog>>,
    events: EventBus,
    cancel: CancellationToken,
) {
    loop {
        let (seq, result) = tokio::select! {
            () = cancel.cancelled() => break,
            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        let text = match result {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(session_id = %session_id, seq, error = %e, "transcription failed, chunk dropped");
                events.emit(SessionEvent::from_error(&e));
                continue;
            }
        };

        let transcript = match filter.evaluate(&text, Instant::now()) {
            Ok(transcript) => transcript,
            Err(reason) => {
                tracing::debug!(session_id = %session_id, seq, reason = %reason, text = %text, "transcript rejected");
                if reason != Rejection::Empty {
                    events.emit(SessionEvent::TranscriptRejected { text, reason });
                }
                continue;
            }
        };

        tracing::info!(session_id = %session_id, seq, text = %transcript.text, "transcript accepted");
        lock(&log).push_user(transcript.text.clone());
        events.emit(SessionEvent::Transcript {
            text: transcript.text.clone(),
        });

        let turn = ConversationTurn {
            session_id,
            utterance: transcript.text,
            timestamp: transcript.timestamp,
            attachments: Vec::new(),
        };
        if let Err(e) = queue.enqueue(turn).await {
            tracing::debug!(session_id = %session_id, error = %e, "turn queue closed");
            break;
        }
    }
}

/// Log replies, synthesize them and schedule playback
async fn speak_replies(
    synthesizer: Arc<SpeechSynthesizer>,
    playback: Arc<PlaybackController>,
    mut outcomes: mpsc::Receiver<TurnOutcome>,
    log: Arc<Mutex<TranscriptLog>>,
    events: EventBus,
    cancel: CancellationToken,
) {
    while let Some(outcome) = outcomes.recv().await {
        let reply = match outcome {
            TurnOutcome::Completed { reply, .. } => reply,
            TurnOutcome::Failed { error, .. } => {
                events.emit(SessionEvent::from_error(&error));
                continue;
            }
        };

        if !reply.tool_executions.is_empty() {
            tracing::debug!(tools = reply.tool_executions.len(), "reply included tool executions");
        }

        lock(&log).push_assistant(reply.reply.clone());
        events.emit(SessionEvent::Reply {
            text: reply.reply.clone(),
        });

        let audio = tokio::select! {
            () = cancel.cancelled() => break,
            audio = synthesizer.synthesize_bytes(&reply.reply) => audio,
        };

        match audio.and_then(|audio| {
            if audio.is_empty() {
                Ok(None)
            } else {
                playback.play(&audio).map(Some)
            }
        }) {
            Ok(Some(source)) => events.emit(SessionEvent::PlaybackScheduled { id: source.id() }),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(error = %e, "failed to speak reply");
                events.emit(SessionEvent::from_error(&e));
            }
        }
    }
}

/// Publish listening state and handle barge-in
async fn forward_vad(
    mut rx: mpsc::Receiver<VadEvent>,
    playback: Arc<PlaybackController>,
    interrupt_on_speech: bool,
    events: EventBus,
) {
    while let Some(event) = rx.recv().await {
        match event {
            VadEvent::Energy(level) => events.emit(SessionEvent::Energy { level }),
            VadEvent::Calibrated(t) => events.emit(SessionEvent::Calibrated {
                speech: t.speech,
                silence: t.silence,
            }),
            VadEvent::SpeechStart => {
                events.emit(SessionEvent::SpeechStarted);
                if interrupt_on_speech {
                    let count = playback.interrupt_all();
                    if count > 0 {
                        events.emit(SessionEvent::PlaybackInterrupted { count });
                    }
                }
            }
            VadEvent::SpeechEnd => events.emit(SessionEvent::SpeechEnded),
        }
    }
}
