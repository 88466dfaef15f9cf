//! Voice pipeline integration tests
//!
//! Tests the session end to end without requiring audio hardware

use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::broadcast;

use eva_voice::ErrorKind;
use eva_voice::voice::{
    CaptureConfig, CaptureTap, FilterConfig, Rejection, SessionConfig, SessionEvent, SessionState,
    Speaker, TranscriptSource, TurnQueueConfig, VadConfig, VoiceSession,
};

mod common;
use common::Harness;

const REPLY: &str = "Sure, what time works for you?";

fn fast_config() -> SessionConfig {
    SessionConfig {
        capture: CaptureConfig {
            chunk_duration: Duration::from_millis(100),
            restart_gap: Duration::from_millis(10),
        },
        vad: VadConfig {
            calibrate: false,
            tick: Duration::from_millis(20),
            ..VadConfig::default()
        },
        filter: FilterConfig::default(),
        turns: TurnQueueConfig {
            inter_turn_delay: Duration::from_millis(10),
            capacity: 8,
        },
        interrupt_on_speech: false,
    }
}

/// Collect events until `done` matches one, or time runs out
async fn collect_until(
    events: &mut broadcast::Receiver<SessionEvent>,
    timeout: Duration,
    done: impl Fn(&SessionEvent) -> bool,
) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    let _ = tokio::time::timeout(timeout, async {
        loop {
            match events.recv().await {
                Ok(SessionEvent::Energy { .. }) => {}
                Ok(event) => {
                    let finished = done(&event);
                    seen.push(event);
                    if finished {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
    .await;
    seen
}

#[tokio::test]
async fn test_hallucinations_filtered_and_one_turn_spoken() {
    let harness = Harness::new(
        vec!["Thank you.", "you", "Can you schedule a call tomorrow?"],
        REPLY,
    );
    let mut session = VoiceSession::new(harness.deps.clone(), fast_config());
    let mut events = session.subscribe();

    session.start_with_tap(CaptureTap::new()).unwrap();
    assert_eq!(session.state(), SessionState::Capturing);

    let seen = collect_until(&mut events, Duration::from_secs(5), |e| {
        matches!(e, SessionEvent::PlaybackScheduled { .. })
    })
    .await;

    // Let a few more (silent) chunks flow through before ending
    tokio::time::sleep(Duration::from_millis(300)).await;
    session.end();
    assert_eq!(session.state(), SessionState::Ended);

    let rejected: Vec<_> = seen
        .iter()
        .filter_map(|e| match e {
            SessionEvent::TranscriptRejected { reason, .. } => Some(*reason),
            _ => None,
        })
        .collect();
    assert_eq!(rejected.len(), 2, "events: {seen:?}");
    assert!(rejected.iter().all(|r| *r != Rejection::Duplicate));

    assert!(seen.contains(&SessionEvent::Transcript {
        text: "Can you schedule a call tomorrow?".to_string()
    }));
    assert!(seen.contains(&SessionEvent::Reply {
        text: REPLY.to_string()
    }));
    assert!(
        seen.iter()
            .any(|e| matches!(e, SessionEvent::PlaybackScheduled { .. }))
    );

    assert!(harness.stt.calls.load(Ordering::SeqCst) >= 3);
    assert_eq!(harness.processor.calls(), 1);
    assert_eq!(harness.backend.calls.load(Ordering::SeqCst), 1);

    let turn = harness.processor.turns.lock().unwrap()[0].clone();
    assert_eq!(turn.session_id, session.id());
    assert_eq!(turn.utterance, "Can you schedule a call tomorrow?");

    tokio::time::timeout(Duration::from_secs(2), session.finished())
        .await
        .expect("session tasks did not finish");
    let records = harness.repo.list_for_session(session.id()).unwrap();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.source, TranscriptSource::Pipeline);
    let entries: Vec<_> = record
        .entries
        .iter()
        .map(|e| (e.speaker, e.text.as_str()))
        .collect();
    assert_eq!(
        entries,
        vec![
            (Speaker::User, "Can you schedule a call tomorrow?"),
            (Speaker::Assistant, REPLY),
        ]
    );

    assert_eq!(harness.sink.renders.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_silent_session_persists_nothing() {
    let harness = Harness::new(vec![], REPLY);
    let mut session = VoiceSession::new(harness.deps.clone(), fast_config());
    let mut events = session.subscribe();

    session.start_with_tap(CaptureTap::new()).unwrap();
    tokio::time::sleep(Duration::from_millis(350)).await;
    session.end();

    let seen = collect_until(&mut events, Duration::from_secs(1), |e| {
        matches!(e, SessionEvent::Ended { .. })
    })
    .await;
    assert!(
        !seen
            .iter()
            .any(|e| matches!(e, SessionEvent::TranscriptRejected { .. }))
    );
    assert!(seen.contains(&SessionEvent::Ended {
        reason: "ended by user".to_string()
    }));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.processor.calls(), 0);
    assert!(harness.repo.list_for_session(session.id()).unwrap().is_empty());
}

#[tokio::test]
async fn test_device_loss_ends_session() {
    let harness = Harness::new(vec!["Can you schedule a call tomorrow?"], REPLY);
    let mut session = VoiceSession::new(harness.deps.clone(), fast_config());
    let mut events = session.subscribe();

    let tap = CaptureTap::new();
    session.start_with_tap(tap.clone()).unwrap();

    collect_until(&mut events, Duration::from_secs(5), |e| {
        matches!(e, SessionEvent::PlaybackScheduled { .. })
    })
    .await;
    tap.set_fault("device unplugged");

    // Nobody calls end(); the session tears itself down
    tokio::time::timeout(Duration::from_secs(2), session.stopped())
        .await
        .expect("session did not stop after device loss");
    assert_eq!(session.state(), SessionState::Ended);
    assert!(tap.is_closed());

    let seen = collect_until(&mut events, Duration::from_secs(1), |e| {
        matches!(e, SessionEvent::Ended { .. })
    })
    .await;
    assert!(seen.iter().any(|e| matches!(
        e,
        SessionEvent::Error {
            kind: ErrorKind::Device,
            ..
        }
    )));
    assert!(seen.contains(&SessionEvent::State {
        state: SessionState::Ended
    }));
    let reason = seen.iter().find_map(|e| match e {
        SessionEvent::Ended { reason } => Some(reason.clone()),
        _ => None,
    });
    assert!(reason.unwrap().contains("device unplugged"));

    tokio::time::timeout(Duration::from_secs(2), session.finished())
        .await
        .expect("session tasks did not finish");
    let records = harness.repo.list_for_session(session.id()).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].entries.len(), 2);

    // A later end() is a no-op
    session.end();
    assert!(
        collect_until(&mut events, Duration::from_millis(200), |_| false)
            .await
            .iter()
            .all(|e| !matches!(e, SessionEvent::Ended { .. }))
    );
}

#[tokio::test]
async fn test_speech_interrupts_live_playback() {
    let harness = Harness::holding_playback(vec!["Can you schedule a call tomorrow?"], REPLY);
    let config = SessionConfig {
        interrupt_on_speech: true,
        ..fast_config()
    };
    let mut session = VoiceSession::new(harness.deps.clone(), config);
    let mut events = session.subscribe();

    let tap = CaptureTap::new();
    session.start_with_tap(tap.clone()).unwrap();

    collect_until(&mut events, Duration::from_secs(5), |e| {
        matches!(e, SessionEvent::PlaybackScheduled { .. })
    })
    .await;
    assert_eq!(harness.deps.playback.live_count(), 1);

    tap.push(&[0.5; 2048]);
    let seen = collect_until(&mut events, Duration::from_secs(2), |e| {
        matches!(e, SessionEvent::PlaybackInterrupted { .. })
    })
    .await;

    let started = seen
        .iter()
        .position(|e| *e == SessionEvent::SpeechStarted)
        .expect("no speech start");
    let interrupted = seen
        .iter()
        .position(|e| *e == SessionEvent::PlaybackInterrupted { count: 1 })
        .expect("playback not interrupted");
    assert!(started < interrupted);
    assert_eq!(harness.deps.playback.live_count(), 0);
    assert_eq!(session.state(), SessionState::Capturing);

    session.end();
}

#[tokio::test]
async fn test_speech_leaves_playback_when_barge_in_disabled() {
    let harness = Harness::holding_playback(vec!["Can you schedule a call tomorrow?"], REPLY);
    let mut session = VoiceSession::new(harness.deps.clone(), fast_config());
    let mut events = session.subscribe();

    let tap = CaptureTap::new();
    session.start_with_tap(tap.clone()).unwrap();

    collect_until(&mut events, Duration::from_secs(5), |e| {
        matches!(e, SessionEvent::PlaybackScheduled { .. })
    })
    .await;

    tap.push(&[0.5; 2048]);
    let seen = collect_until(&mut events, Duration::from_secs(2), |e| {
        *e == SessionEvent::SpeechStarted
    })
    .await;
    assert!(seen.contains(&SessionEvent::SpeechStarted));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.deps.playback.live_count(), 1);

    // Ending the session still silences it
    session.end();
    let seen = collect_until(&mut events, Duration::from_secs(1), |e| {
        matches!(e, SessionEvent::Ended { .. })
    })
    .await;
    assert!(seen.contains(&SessionEvent::PlaybackInterrupted { count: 1 }));
}

#[tokio::test]
async fn test_failed_turn_reported_and_session_continues() {
    let harness = Harness::failing_turns(vec!["Can you schedule a call tomorrow?"]);
    let mut session = VoiceSession::new(harness.deps.clone(), fast_config());
    let mut events = session.subscribe();

    session.start_with_tap(CaptureTap::new()).unwrap();

    let seen = collect_until(&mut events, Duration::from_secs(5), |e| {
        matches!(e, SessionEvent::Error { .. })
    })
    .await;
    assert!(seen.iter().any(|e| matches!(
        e,
        SessionEvent::Error {
            kind: ErrorKind::Reasoning,
            ..
        }
    )));
    assert!(
        !seen
            .iter()
            .any(|e| matches!(e, SessionEvent::Reply { .. }))
    );
    assert_eq!(session.state(), SessionState::Capturing);
    assert_eq!(harness.backend.calls.load(Ordering::SeqCst), 0);

    session.end();
    tokio::time::timeout(Duration::from_secs(2), session.finished())
        .await
        .expect("session tasks did not finish");

    let records = harness.repo.list_for_session(session.id()).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].entries.len(), 1);
    assert_eq!(records[0].entries[0].speaker, Speaker::User);
}

#[tokio::test]
async fn test_end_is_idempotent() {
    let harness = Harness::new(vec![], REPLY);
    let mut session = VoiceSession::new(harness.deps.clone(), fast_config());
    let mut events = session.subscribe();

    session.start_with_tap(CaptureTap::new()).unwrap();
    session.end();
    session.end();

    let seen = collect_until(&mut events, Duration::from_millis(300), |_| false).await;
    let ended = seen
        .iter()
        .filter(|e| matches!(e, SessionEvent::Ended { .. }))
        .count();
    assert_eq!(ended, 1);
    assert!(session.start_with_tap(CaptureTap::new()).is_err());
}
