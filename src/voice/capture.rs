//! Audio capture from microphone and fixed-interval chunking

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Sample rate for audio capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Samples kept for level metering (~32ms at 16kHz)
const LEVEL_WINDOW: usize = 512;

/// Chunk cycle timing
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Nominal duration of one emitted chunk
    pub chunk_duration: Duration,
    /// Pause between flushing one recording and starting the next
    pub restart_gap: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            chunk_duration: Duration::from_millis(2000),
            restart_gap: Duration::from_millis(50),
        }
    }
}

/// One fixed-duration slice of encoded microphone audio
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Monotonic sequence number, starting at 0 per session
    pub seq: u64,
    /// Nominal duration of the recording window
    pub duration: Duration,
    /// WAV-encoded 16-bit mono audio
    pub bytes: Bytes,
}

#[derive(Debug, Default)]
struct TapInner {
    samples: Vec<f32>,
    recent: VecDeque<f32>,
    fault: Option<String>,
    closed: bool,
}

/// Shared, thread-safe view of the capture buffer
///
/// The device callback pushes into it; the chunk cycle drains it and the
/// VAD loop reads its level. Cloning shares the same buffer.
#[derive(Debug, Clone, Default)]
pub struct CaptureTap {
    inner: Arc<Mutex<TapInner>>,
}

impl CaptureTap {
    /// Create a detached tap (fed manually via [`CaptureTap::push`])
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw samples
    pub fn push(&self, data: &[f32]) {
        if let Ok(mut inner) = self.inner.lock() {
            if inner.closed {
                return;
            }
            inner.samples.extend_from_slice(data);
            for &sample in data {
                if inner.recent.len() == LEVEL_WINDOW {
                    inner.recent.pop_front();
                }
                inner.recent.push_back(sample);
            }
        }
    }

    /// Take all samples recorded since the last call
    #[must_use]
    pub fn take_samples(&self) -> Vec<f32> {
        self.inner
            .lock()
            .map(|mut inner| std::mem::take(&mut inner.samples))
            .unwrap_or_default()
    }

    /// Drop buffered samples (start of a new recording)
    pub fn clear(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.samples.clear();
        }
    }

    /// RMS energy of the most recent frame, clamped to [0, 1]
    #[must_use]
    pub fn level(&self) -> f32 {
        self.inner
            .lock()
            .map(|inner| {
                let (front, back) = inner.recent.as_slices();
                let recent: Vec<f32> = front.iter().chain(back).copied().collect();
                rms(&recent).clamp(0.0, 1.0)
            })
            .unwrap_or(0.0)
    }

    /// Mark the device as failed
    pub fn set_fault(&self, reason: impl Into<String>) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.fault.get_or_insert_with(|| reason.into());
        }
    }

    /// Stop accepting samples and drop anything buffered
    ///
    /// The device stream stays with its [`AudioCapture`] owner; a closed tap
    /// ignores whatever it still delivers.
    pub fn close(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.closed = true;
            inner.samples.clear();
            inner.recent.clear();
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().is_ok_and(|inner| inner.closed)
    }

    /// Device failure reported by the audio backend, if any
    #[must_use]
    pub fn fault(&self) -> Option<String> {
        self.inner.lock().ok().and_then(|inner| inner.fault.clone())
    }
}

/// Captures audio from the default input device
///
/// The underlying stream is not `Send`; it stays with the owner while the
/// [`CaptureTap`] it feeds is handed to tasks.
pub struct AudioCapture {
    config: StreamConfig,
    tap: CaptureTap,
    stream: Option<Stream>,
}

impl AudioCapture {
    /// Open the default input device
    ///
    /// # Errors
    ///
    /// Returns `Error::Device` if no input device is available or it has no
    /// usable 16kHz mono configuration
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_input_device()
            .ok_or_else(|| Error::Device("no input device available".to_string()))?;

        let supported_config = device
            .supported_input_configs()
            .map_err(|e| Error::Device(e.to_string()))?
            .find(|c| {
                c.channels() == 1
                    && c.min_sample_rate() <= SampleRate(SAMPLE_RATE)
                    && c.max_sample_rate() >= SampleRate(SAMPLE_RATE)
            })
            .ok_or_else(|| Error::Device("no suitable audio config found".to_string()))?;

        let config = supported_config
            .with_sample_rate(SampleRate(SAMPLE_RATE))
            .config();

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = SAMPLE_RATE,
            channels = config.channels,
            "audio capture initialized"
        );

        Ok(Self {
            config,
            tap: CaptureTap::new(),
            stream: None,
        })
    }

    /// Start capturing and return the shared tap
    ///
    /// # Errors
    ///
    /// Returns `Error::Device` if the stream cannot be built or started
    /// (including a denied microphone permission)
    pub fn start(&mut self) -> Result<CaptureTap> {
        if self.stream.is_some() {
            return Ok(self.tap.clone());
        }

        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| Error::Device("no input device".to_string()))?;

        let data_tap = self.tap.clone();
        let error_tap = self.tap.clone();

        let stream = device
            .build_input_stream(
                &self.config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| data_tap.push(data),
                move |err| {
                    tracing::error!(error = %err, "audio capture error");
                    error_tap.set_fault(err.to_string());
                },
                None,
            )
            .map_err(|e| Error::Device(e.to_string()))?;

        stream.play().map_err(|e| Error::Device(e.to_string()))?;
        self.stream = Some(stream);

        tracing::debug!("audio capture started");
        Ok(self.tap.clone())
    }

    /// Stop capturing and release the device
    pub fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            tracing::debug!("audio capture stopped");
        }
    }

    /// Check if currently capturing
    #[must_use]
    pub const fn is_capturing(&self) -> bool {
        self.stream.is_some()
    }

    /// The tap fed by this capture
    #[must_use]
    pub fn tap(&self) -> CaptureTap {
        self.tap.clone()
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Items produced by the chunk cycle
#[derive(Debug)]
pub enum CaptureEvent {
    /// One recording window elapsed
    Chunk(AudioChunk),
    /// The input device failed; capture cannot continue
    DeviceLost(String),
}

/// Run the record/flush/restart cycle until cancelled
///
/// Emits one chunk per cycle regardless of content; silence is filtered
/// downstream, not here.
pub async fn run_chunk_cycle(
    tap: CaptureTap,
    config: CaptureConfig,
    tx: mpsc::Sender<CaptureEvent>,
    cancel: CancellationToken,
) {
    let mut seq = 0u64;

    loop {
        tap.clear();

        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(config.chunk_duration) => {}
        }

        if let Some(reason) = tap.fault() {
            tracing::error!(reason = %reason, "input device lost");
            let _ = tx.send(CaptureEvent::DeviceLost(reason)).await;
            break;
        }

        let samples = tap.take_samples();
        let bytes = match samples_to_wav(&samples, SAMPLE_RATE) {
            Ok(wav) => Bytes::from(wav),
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode chunk, skipping");
                continue;
            }
        };

        let chunk = AudioChunk {
            seq,
            duration: config.chunk_duration,
            bytes,
        };
        seq += 1;
        tracing::trace!(seq = chunk.seq, samples = samples.len(), "chunk emitted");

        if tx.send(CaptureEvent::Chunk(chunk)).await.is_err() {
            break;
        }

        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(config.restart_gap) => {}
        }
    }

    tracing::debug!("chunk cycle stopped");
}

/// Convert f32 samples to WAV bytes for STT APIs
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            // Convert f32 [-1.0, 1.0] to i16
            #[allow(clippy::cast_possible_truncation)]
            let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer
                .write_sample(sample_i16)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

/// Calculate RMS energy of audio samples
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rms() {
        assert!(rms(&[0.0f32; 100]) < 0.001);
        assert!(rms(&[0.5f32; 100]) > 0.4);
        assert!(rms(&[]).abs() < f32::EPSILON);
    }

    #[test]
    fn test_tap_level_tracks_recent_frame() {
        let tap = CaptureTap::new();
        tap.push(&[0.8; 2048]);
        assert!(tap.level() > 0.7);

        // A full window of silence replaces the loud frame
        tap.push(&[0.0; LEVEL_WINDOW]);
        assert!(tap.level() < 0.001);
    }

    #[test]
    fn test_tap_take_drains_buffer() {
        let tap = CaptureTap::new();
        tap.push(&[0.1; 10]);
        assert_eq!(tap.take_samples().len(), 10);
        assert!(tap.take_samples().is_empty());
    }

    #[test]
    fn test_closed_tap_ignores_samples() {
        let tap = CaptureTap::new();
        tap.push(&[0.5; 100]);
        tap.close();
        assert!(tap.is_closed());
        assert!(tap.take_samples().is_empty());

        tap.push(&[0.5; 100]);
        assert!(tap.take_samples().is_empty());
        assert!(tap.level() < 0.001);
    }

    #[test]
    fn test_fault_keeps_first_reason() {
        let tap = CaptureTap::new();
        assert!(tap.fault().is_none());
        tap.set_fault("revoked");
        tap.set_fault("second");
        assert_eq!(tap.fault().as_deref(), Some("revoked"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunk_cycle_emits_silence_chunks_in_sequence() {
        let tap = CaptureTap::new();
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_chunk_cycle(
            tap,
            CaptureConfig::default(),
            tx,
            cancel.clone(),
        ));

        for expected in 0..3 {
            match rx.recv().await.unwrap() {
                CaptureEvent::Chunk(chunk) => {
                    assert_eq!(chunk.seq, expected);
                    assert_eq!(chunk.duration, Duration::from_millis(2000));
                    // WAV header is always present, even for silence
                    assert!(chunk.bytes.len() >= 44);
                }
                CaptureEvent::DeviceLost(r) => panic!("unexpected device loss: {r}"),
            }
        }

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunk_cycle_reports_device_loss() {
        let tap = CaptureTap::new();
        tap.set_fault("permission revoked");
        let (tx, mut rx) = mpsc::channel(8);
        let handle = tokio::spawn(run_chunk_cycle(
            tap,
            CaptureConfig::default(),
            tx,
            CancellationToken::new(),
        ));

        match rx.recv().await.unwrap() {
            CaptureEvent::DeviceLost(reason) => assert_eq!(reason, "permission revoked"),
            CaptureEvent::Chunk(_) => panic!("expected device loss"),
        }
        handle.await.unwrap();
    }
}
