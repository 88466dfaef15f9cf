//! Audio playback to speakers
//!
//! [`PlaybackController`] schedules decoded sources back to back on one
//! output timeline and can stop every live source at once (barge-in).

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Sample rate for playback (matches common TTS output)
const PLAYBACK_SAMPLE_RATE: u32 = 24000;

/// How often a rendering sink checks its stop token
const STOP_POLL: Duration = Duration::from_millis(10);

/// Blocking audio output
pub trait AudioSink: Send + Sync {
    /// Render mono samples, returning early once `stop` is cancelled
    ///
    /// # Errors
    ///
    /// Returns `Error::Audio` if the output device fails
    fn render(&self, samples: &[f32], sample_rate: u32, stop: &CancellationToken) -> Result<()>;
}

/// Default output device
pub struct CpalSink {
    config: StreamConfig,
}

impl CpalSink {
    /// Open the default output device
    ///
    /// # Errors
    ///
    /// Returns `Error::Device` if no usable output device exists
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Device("no output device available".to_string()))?;

        let supports = |c: &cpal::SupportedStreamConfigRange, channels: u16| {
            c.channels() == channels
                && c.min_sample_rate() <= SampleRate(PLAYBACK_SAMPLE_RATE)
                && c.max_sample_rate() >= SampleRate(PLAYBACK_SAMPLE_RATE)
        };

        let supported_config = device
            .supported_output_configs()
            .map_err(|e| Error::Device(e.to_string()))?
            .find(|c| supports(c, 1))
            .or_else(|| {
                // Fallback: try stereo
                device.supported_output_configs().ok()?.find(|c| supports(c, 2))
            })
            .ok_or_else(|| Error::Device("no suitable output config found".to_string()))?;

        let config = supported_config
            .with_sample_rate(SampleRate(PLAYBACK_SAMPLE_RATE))
            .config();

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = PLAYBACK_SAMPLE_RATE,
            channels = config.channels,
            "audio playback initialized"
        );

        Ok(Self { config })
    }
}

impl AudioSink for CpalSink {
    fn render(&self, samples: &[f32], sample_rate: u32, stop: &CancellationToken) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }

        let device = cpal::default_host()
            .default_output_device()
            .ok_or_else(|| Error::Device("no output device".to_string()))?;

        let samples = Arc::new(resample(samples, sample_rate, PLAYBACK_SAMPLE_RATE));
        let sample_count = samples.len();
        let channels = usize::from(self.config.channels);
        let position = Arc::new(Mutex::new(0usize));
        let finished = CancellationToken::new();

        let stream = {
            let samples = Arc::clone(&samples);
            let position = Arc::clone(&position);
            let finished = finished.clone();
            device
                .build_output_stream(
                    &self.config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        let Ok(mut pos) = position.lock() else {
                            return;
                        };
                        for frame in data.chunks_mut(channels) {
                            let sample = samples.get(*pos).copied().unwrap_or_else(|| {
                                finished.cancel();
                                0.0
                            });
                            frame.fill(sample);
                            if *pos < samples.len() {
                                *pos += 1;
                            }
                        }
                    },
                    |err| {
                        tracing::error!(error = %err, "audio playback error");
                    },
                    None,
                )
                .map_err(|e| Error::Audio(e.to_string()))?
        };

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;

        // Poll for completion with timeout
        let duration_ms = (sample_count as u64 * 1000) / u64::from(PLAYBACK_SAMPLE_RATE);
        let timeout = Duration::from_millis(duration_ms + 500);
        let start = std::time::Instant::now();

        while !finished.is_cancelled() && !stop.is_cancelled() && start.elapsed() < timeout {
            std::thread::sleep(STOP_POLL);
        }

        drop(stream);
        tracing::debug!(samples = sample_count, stopped = stop.is_cancelled(), "playback complete");
        Ok(())
    }
}

/// Discards audio but takes as long as playing it would
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl AudioSink for NullSink {
    fn render(&self, samples: &[f32], sample_rate: u32, stop: &CancellationToken) -> Result<()> {
        let total = source_duration(samples.len(), sample_rate);
        let start = std::time::Instant::now();

        while start.elapsed() < total && !stop.is_cancelled() {
            std::thread::sleep(STOP_POLL.min(total.saturating_sub(start.elapsed())));
        }
        Ok(())
    }
}

/// How a playback source ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Completed,
    Interrupted,
    Failed(String),
}

/// Handle to one scheduled source
#[derive(Debug)]
pub struct Playback {
    id: u64,
    duration: Duration,
    done: oneshot::Receiver<PlaybackOutcome>,
}

impl Playback {
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub const fn duration(&self) -> Duration {
        self.duration
    }

    /// Wait for the source to end
    pub async fn finished(self) -> PlaybackOutcome {
        self.done.await.unwrap_or(PlaybackOutcome::Interrupted)
    }
}

#[derive(Default)]
struct Timeline {
    next_id: u64,
    live: HashMap<u64, CancellationToken>,
    /// When the last scheduled source ends
    end: Option<Instant>,
}

/// Schedules and interrupts audio sources
pub struct PlaybackController {
    sink: Arc<dyn AudioSink>,
    timeline: Arc<Mutex<Timeline>>,
}

impl PlaybackController {
    #[must_use]
    pub fn new(sink: Arc<dyn AudioSink>) -> Self {
        Self {
            sink,
            timeline: Arc::new(Mutex::new(Timeline::default())),
        }
    }

    /// Decode MP3 audio and schedule it
    ///
    /// # Errors
    ///
    /// Returns `Error::Audio` if the bytes are not valid MP3
    pub fn play(&self, mp3_data: &[u8]) -> Result<Playback> {
        let (samples, sample_rate) = decode_mp3(mp3_data)?;
        Ok(self.play_samples(samples, sample_rate))
    }

    /// Schedule raw mono samples after whatever is already queued
    pub fn play_samples(&self, samples: Vec<f32>, sample_rate: u32) -> Playback {
        let duration = source_duration(samples.len(), sample_rate);
        let stop = CancellationToken::new();
        let (done_tx, done) = oneshot::channel();

        let (id, start_at) = {
            let mut timeline = lock(&self.timeline);
            let id = timeline.next_id;
            timeline.next_id += 1;

            let now = Instant::now();
            let start_at = timeline.end.filter(|end| *end > now).unwrap_or(now);
            timeline.end = Some(start_at + duration);
            timeline.live.insert(id, stop.clone());
            (id, start_at)
        };

        let sink = Arc::clone(&self.sink);
        let timeline = Arc::clone(&self.timeline);

        tokio::spawn(async move {
            let outcome = tokio::select! {
                () = stop.cancelled() => PlaybackOutcome::Interrupted,
                () = tokio::time::sleep_until(start_at) => {
                    let render_stop = stop.clone();
                    let result = tokio::task::spawn_blocking(move || {
                        sink.render(&samples, sample_rate, &render_stop)
                    })
                    .await;

                    match result {
                        _ if stop.is_cancelled() => PlaybackOutcome::Interrupted,
                        Ok(Ok(())) => PlaybackOutcome::Completed,
                        Ok(Err(e)) => PlaybackOutcome::Failed(e.to_string()),
                        Err(e) => PlaybackOutcome::Failed(e.to_string()),
                    }
                }
            };

            lock(&timeline).live.remove(&id);
            tracing::trace!(id, ?outcome, "playback source ended");
            let _ = done_tx.send(outcome);
        });

        Playback { id, duration, done }
    }

    /// Stop every live source and reset the timeline
    ///
    /// Returns the number of sources stopped.
    pub fn interrupt_all(&self) -> usize {
        let stopped: Vec<CancellationToken> = {
            let mut timeline = lock(&self.timeline);
            timeline.end = None;
            timeline.live.drain().map(|(_, stop)| stop).collect()
        };

        for stop in &stopped {
            stop.cancel();
        }

        if !stopped.is_empty() {
            tracing::debug!(count = stopped.len(), "playback interrupted");
        }
        stopped.len()
    }

    /// Sources scheduled or playing
    #[must_use]
    pub fn live_count(&self) -> usize {
        lock(&self.timeline).live.len()
    }
}

fn lock(timeline: &Mutex<Timeline>) -> std::sync::MutexGuard<'_, Timeline> {
    timeline
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[allow(clippy::cast_precision_loss)]
fn source_duration(samples: usize, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(samples as f64 / f64::from(sample_rate))
}

/// Linear resampling, good enough for speech
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn resample(samples: &[f32], from: u32, to: u32) -> Vec<f32> {
    if from == to || from == 0 || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = f64::from(from) / f64::from(to);
    let out_len = (samples.len() as f64 / ratio) as usize;
    let last = samples.len() - 1;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = (pos as usize).min(last);
            let next = (idx + 1).min(last);
            let frac = (pos - idx as f64) as f32;
            samples[idx].mul_add(1.0 - frac, samples[next] * frac)
        })
        .collect()
}

/// Decode MP3 bytes to mono f32 samples and their sample rate
///
/// # Errors
///
/// Returns `Error::Audio` if a frame cannot be decoded
pub fn decode_mp3(mp3_data: &[u8]) -> Result<(Vec<f32>, u32)> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3_data));
    let mut samples = Vec::new();
    let mut sample_rate = PLAYBACK_SAMPLE_RATE;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                sample_rate = u32::try_from(frame.sample_rate).unwrap_or(PLAYBACK_SAMPLE_RATE);

                if frame.channels == 2 {
                    // Stereo: average channels
                    samples.extend(frame.data.chunks(2).map(|pair| {
                        let left = f32::from(pair[0]) / 32768.0;
                        let right = f32::from(pair.get(1).copied().unwrap_or(pair[0])) / 32768.0;
                        f32::midpoint(left, right)
                    }));
                } else {
                    samples.extend(frame.data.iter().map(|&s| f32::from(s) / 32768.0));
                }
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Audio(format!("MP3 decode error: {e}"))),
        }
    }

    Ok((samples, sample_rate))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(ms: u64) -> Vec<f32> {
        vec![0.1; usize::try_from(ms * 16).unwrap()]
    }

    fn controller() -> PlaybackController {
        PlaybackController::new(Arc::new(NullSink))
    }

    #[tokio::test]
    async fn test_interrupt_stops_all_live_sources() {
        let playback = controller();
        let sources: Vec<_> = (0..3).map(|_| playback.play_samples(tone(1000), 16000)).collect();
        assert_eq!(playback.live_count(), 3);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(playback.interrupt_all(), 3);
        assert_eq!(playback.live_count(), 0);

        for source in sources {
            assert_eq!(source.finished().await, PlaybackOutcome::Interrupted);
        }
        assert_eq!(playback.interrupt_all(), 0);
    }

    #[tokio::test]
    async fn test_completed_source_prunes_itself() {
        let playback = controller();
        let source = playback.play_samples(tone(30), 16000);
        assert_eq!(source.finished().await, PlaybackOutcome::Completed);
        assert_eq!(playback.live_count(), 0);
    }

    #[tokio::test]
    async fn test_sources_play_back_to_back() {
        let playback = controller();
        let started = std::time::Instant::now();
        let first = playback.play_samples(tone(100), 16000);
        let second = playback.play_samples(tone(100), 16000);

        assert_eq!(first.finished().await, PlaybackOutcome::Completed);
        assert_eq!(second.finished().await, PlaybackOutcome::Completed);
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_play_after_interrupt_starts_immediately() {
        let playback = controller();
        let _long = playback.play_samples(tone(5000), 16000);
        playback.interrupt_all();

        let started = std::time::Instant::now();
        let next = playback.play_samples(tone(20), 16000);
        assert_eq!(next.finished().await, PlaybackOutcome::Completed);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_invalid_mp3_yields_no_samples() {
        let (samples, _) = decode_mp3(b"not an mp3").unwrap_or_default();
        assert!(samples.is_empty());
    }

    #[test]
    fn test_resample_length() {
        let out = resample(&tone(100), 16000, 24000);
        assert_eq!(out.len(), 2400);
        assert!(out.iter().all(|s| (s - 0.1).abs() < 1e-6));
    }

    #[test]
    fn test_source_duration() {
        assert_eq!(source_duration(16000, 16000), Duration::from_secs(1));
        assert_eq!(source_duration(10, 0), Duration::ZERO);
    }
}
