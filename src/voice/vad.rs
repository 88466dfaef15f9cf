//! Voice activity detection
//!
//! Energy-based detector with two thresholds and a silence debounce, plus an
//! ambient-noise calibration routine that derives the thresholds from the
//! room's noise floor.
//!
//! The state machine is driven by explicit `(sample, now)` ticks so it can be
//! exercised without real timers; [`run_vad`] is the tick loop used by a live
//! session.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::capture::CaptureTap;

/// Minimum distance kept between speech and silence thresholds
const MIN_THRESHOLD_GAP: f32 = 0.001;

/// Detector tuning
#[derive(Debug, Clone)]
pub struct VadConfig {
    /// Initial speech (enter) threshold, used until calibration completes
    pub speech_threshold: f32,
    /// Initial silence (leave) threshold
    pub silence_threshold: f32,
    /// How long energy must stay below the silence threshold to end speech
    pub debounce: Duration,
    /// Ambient sampling window for calibration
    pub calibration_window: Duration,
    /// Sampling interval of the tick loop
    pub tick: Duration,
    /// Lower clamp for calibrated thresholds
    pub floor: f32,
    /// Upper clamp for calibrated thresholds
    pub ceiling: f32,
    /// Calibrate at startup
    pub calibrate: bool,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            speech_threshold: 0.06,
            silence_threshold: 0.03,
            debounce: Duration::from_millis(4000),
            calibration_window: Duration::from_millis(2000),
            tick: Duration::from_millis(20),
            floor: 0.01,
            ceiling: 0.5,
            calibrate: true,
        }
    }
}

/// Enter/leave thresholds; `speech` is always above `silence`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub speech: f32,
    pub silence: f32,
}

impl Thresholds {
    /// Build thresholds, lowering `silence` if needed to keep hysteresis
    #[must_use]
    pub fn new(speech: f32, silence: f32) -> Self {
        let silence = if silence < speech {
            silence
        } else {
            (speech - MIN_THRESHOLD_GAP).max(0.0)
        };
        Self { speech, silence }
    }
}

/// Discrete detector output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadTransition {
    SpeechStart,
    SpeechEnd,
}

/// Events published by the VAD loop
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VadEvent {
    /// Per-tick energy level (for visualization)
    Energy(f32),
    /// Calibration finished with these thresholds
    Calibrated(Thresholds),
    SpeechStart,
    SpeechEnd,
}

/// Two-state hysteresis detector
#[derive(Debug)]
pub struct VoiceActivityDetector {
    thresholds: Thresholds,
    debounce: Duration,
    speaking: bool,
    /// Pending debounce deadline while speaking and below the silence threshold
    silence_deadline: Option<Instant>,
}

impl VoiceActivityDetector {
    /// Create a detector in the quiet state
    #[must_use]
    pub fn new(config: &VadConfig) -> Self {
        Self {
            thresholds: Thresholds::new(config.speech_threshold, config.silence_threshold),
            debounce: config.debounce,
            speaking: false,
            silence_deadline: None,
        }
    }

    /// Feed one energy sample
    ///
    /// Returns a transition when the state changes. Start and end strictly
    /// alternate.
    pub fn process(&mut self, sample: f32, now: Instant) -> Option<VadTransition> {
        if !self.speaking {
            if sample >= self.thresholds.speech {
                self.speaking = true;
                self.silence_deadline = None;
                tracing::trace!(sample, "speech start");
                return Some(VadTransition::SpeechStart);
            }
            return None;
        }

        if sample >= self.thresholds.silence {
            // Energy came back before the debounce elapsed
            self.silence_deadline = None;
            return None;
        }

        match self.silence_deadline {
            None => {
                self.silence_deadline = Some(now + self.debounce);
                None
            }
            Some(deadline) if now >= deadline => {
                self.speaking = false;
                self.silence_deadline = None;
                tracing::trace!(sample, "speech end");
                Some(VadTransition::SpeechEnd)
            }
            Some(_) => None,
        }
    }

    /// Return to quiet and cancel any pending debounce, emitting nothing
    pub const fn reset(&mut self) {
        self.speaking = false;
        self.silence_deadline = None;
    }

    /// Whether the detector is in the speaking state
    #[must_use]
    pub const fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Whether a silence debounce is pending
    #[must_use]
    pub const fn debounce_pending(&self) -> bool {
        self.silence_deadline.is_some()
    }

    /// Current thresholds
    #[must_use]
    pub const fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    /// Replace thresholds (e.g. after calibration)
    pub const fn set_thresholds(&mut self, thresholds: Thresholds) {
        self.thresholds = thresholds;
    }
}

/// Ambient noise calibration
#[derive(Debug)]
pub struct Calibrator {
    window: Duration,
    floor: f32,
    ceiling: f32,
    fallback: Thresholds,
    started: Option<Instant>,
    samples: Vec<f32>,
}

impl Calibrator {
    /// Create a calibrator using the window and clamps from `config`
    #[must_use]
    pub fn new(config: &VadConfig) -> Self {
        Self {
            window: config.calibration_window,
            floor: config.floor,
            ceiling: config.ceiling,
            fallback: Thresholds::new(config.speech_threshold, config.silence_threshold),
            started: None,
            samples: Vec::new(),
        }
    }

    /// Record one ambient sample
    pub fn observe(&mut self, sample: f32, now: Instant) {
        self.started.get_or_insert(now);
        self.samples.push(sample);
    }

    /// Whether the sampling window has elapsed
    #[must_use]
    pub fn is_complete(&self, now: Instant) -> bool {
        self.started
            .is_some_and(|started| now.duration_since(started) >= self.window)
    }

    /// Derive thresholds from the observed noise floor
    ///
    /// `silence = clamp(mean + 1σ)`, `speech = clamp(mean + 2.5σ)`. Without
    /// samples the configured thresholds are returned unchanged.
    #[must_use]
    pub fn finish(&self) -> Thresholds {
        let Some((mean, std_dev)) = mean_and_std_dev(&self.samples) else {
            return self.fallback;
        };

        let silence = (mean + std_dev).clamp(self.floor, self.ceiling);
        let speech = std_dev.mul_add(2.5, mean).clamp(self.floor, self.ceiling);

        Thresholds::new(speech, silence)
    }
}

/// Population mean and standard deviation
#[allow(clippy::cast_precision_loss)]
fn mean_and_std_dev(samples: &[f32]) -> Option<(f32, f32)> {
    if samples.is_empty() {
        return None;
    }

    let n = samples.len() as f32;
    let mean = samples.iter().sum::<f32>() / n;
    let variance = samples.iter().map(|s| (s - mean).powi(2)).sum::<f32>() / n;
    Some((mean, variance.sqrt()))
}

/// Run the per-tick VAD loop until cancelled
///
/// Calibrates first (when enabled), then publishes the energy level every
/// tick and transitions as they happen. On cancellation the detector is reset
/// so no debounce outlives the session.
pub async fn run_vad(
    tap: CaptureTap,
    config: VadConfig,
    tx: mpsc::Sender<VadEvent>,
    cancel: CancellationToken,
) {
    let mut detector = VoiceActivityDetector::new(&config);
    let mut calibrator = config.calibrate.then(|| Calibrator::new(&config));
    let mut ticker = tokio::time::interval(config.tick);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        let now = tokio::select! {
            () = cancel.cancelled() => break,
            now = ticker.tick() => now,
        };

        let level = tap.level();

        if let Some(cal) = calibrator.as_mut() {
            cal.observe(level, now);
            if cal.is_complete(now) {
                let thresholds = cal.finish();
                tracing::info!(
                    speech = thresholds.speech,
                    silence = thresholds.silence,
                    "vad calibrated"
                );
                detector.set_thresholds(thresholds);
                calibrator = None;
                if tx.send(VadEvent::Calibrated(thresholds)).await.is_err() {
                    break;
                }
            }
            continue;
        }

        // Energy events are best-effort; a slow consumer must not stall ticks
        let _ = tx.try_send(VadEvent::Energy(level));

        let event = match detector.process(level, now) {
            Some(VadTransition::SpeechStart) => VadEvent::SpeechStart,
            Some(VadTransition::SpeechEnd) => VadEvent::SpeechEnd,
            None => continue,
        };
        if tx.send(event).await.is_err() {
            break;
        }
    }

    detector.reset();
    tracing::debug!("vad loop stopped");
}
