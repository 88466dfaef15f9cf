use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use eva_voice::api::{ApiServer, ApiState};
use eva_voice::config::{Config, file::config_file_path};
use eva_voice::db::{self, TranscriptRepo};
use eva_voice::relay::RealtimeClient;
use eva_voice::voice::{
    AudioCapture, AudioSink, CacheConfig, Calibrator, CpalSink, FsSpeechCache,
    HttpSynthesisBackend, HttpTurnProcessor, NullSink, PlaybackController, SessionDeps,
    SessionEvent, SpeechSynthesizer, SynthesisConfig, TieredSpeechCache, TranscriptionClient,
    VadConfig, VoiceSession, rms,
};

/// EVA - real-time voice conversations with the recruiting assistant
#[derive(Parser)]
#[command(name = "eva", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
#[allow(clippy::enum_variant_names)]
enum Command {
    /// Run the API server and realtime relay
    Serve {
        /// Port to listen on (overrides config)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Talk to EVA from this machine until Ctrl-C
    Talk {
        /// Use the hosted duplex provider through the relay
        #[arg(long)]
        realtime: bool,
        /// Relay URL for --realtime (defaults to the local server)
        #[arg(long)]
        relay_url: Option<String>,
        /// Discard assistant audio instead of playing it
        #[arg(long)]
        no_audio: bool,
    },
    /// Measure ambient noise and suggest VAD thresholds
    Calibrate {
        /// Sampling window in seconds
        #[arg(short, long, default_value = "3")]
        seconds: u64,
    },
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
    /// Test TTS output
    TestTts {
        /// Text to speak
        #[arg(default_value = "Hi, I'm EVA. Let's find your next hire.")]
        text: String,
    },
    /// Manage the speech cache
    Cache {
        #[command(subcommand)]
        command: CacheCommand,
    },
    /// List recent conversation transcripts
    Transcripts {
        /// Number of transcripts to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum CacheCommand {
    /// Delete cached audio older than the retention period
    Prune {
        /// Override the configured retention
        #[arg(long)]
        max_age_days: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,eva_voice=info",
        1 => "info,eva_voice=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

#[allow(clippy::future_not_send)]
async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load()?;
    tracing::debug!(?config, "loaded configuration");

    match cli.command {
        Command::Serve { port } => serve(config, port).await,
        Command::Talk {
            realtime: true,
            relay_url,
            no_audio,
        } => talk_realtime(config, relay_url, no_audio).await,
        Command::Talk { no_audio, .. } => talk(config, no_audio).await,
        Command::Calibrate { seconds } => calibrate(&config.vad, seconds).await,
        Command::TestMic { duration } => test_mic(duration).await,
        Command::TestSpeaker => test_speaker().await,
        Command::TestTts { text } => test_tts(config, &text).await,
        Command::Cache {
            command: CacheCommand::Prune { max_age_days },
        } => prune_cache(&config.cache, max_age_days).await,
        Command::Transcripts { limit } => list_transcripts(&config, limit),
    }
}

/// Run the API server and relay until interrupted
async fn serve(config: Config, port: Option<u16>) -> anyhow::Result<()> {
    let pool = db::init(&config.db_path())?;
    let port = port.unwrap_or(config.api_server.port);

    let state = Arc::new(ApiState::new(pool, config.api_server.api_key, config.relay));
    let server = ApiServer::new(state, port);

    tracing::info!(port, "eva voice server ready");

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("shutting down"),
    }

    Ok(())
}

fn build_sink(no_audio: bool) -> anyhow::Result<Arc<dyn AudioSink>> {
    if no_audio {
        return Ok(Arc::new(NullSink));
    }
    Ok(Arc::new(CpalSink::new()?))
}

fn build_synthesizer(
    synthesis: SynthesisConfig,
    cache: &CacheConfig,
) -> anyhow::Result<Arc<SpeechSynthesizer>> {
    let backend =
        HttpSynthesisBackend::new(&synthesis.base_url, synthesis.api_token, synthesis.timeout)?;
    Ok(Arc::new(SpeechSynthesizer::new(
        Arc::new(backend),
        Arc::new(TieredSpeechCache::new(cache)),
        synthesis.voice_id,
        synthesis.model_id,
    )))
}

/// Local capture/transcribe/reason/speak session
#[allow(clippy::future_not_send)]
async fn talk(config: Config, no_audio: bool) -> anyhow::Result<()> {
    let session_config = config.session_config();
    let repo = TranscriptRepo::new(db::init(&config.db_path())?);

    let synthesizer = build_synthesizer(config.synthesis, &config.cache)?;
    let deps = SessionDeps {
        stt: Arc::new(TranscriptionClient::new(config.transcription)?),
        processor: Arc::new(HttpTurnProcessor::new(config.reasoning)?),
        synthesizer: synthesizer.clone(),
        playback: Arc::new(PlaybackController::new(build_sink(no_audio)?)),
        transcripts: Some(repo),
    };

    let mut session = VoiceSession::new(deps, session_config);
    let printer = tokio::spawn(print_events(session.subscribe()));

    session.start()?;
    println!("Listening... press Ctrl-C to stop\n");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        () = session.stopped() => {}
    }

    session.end();
    session.finished().await;
    synthesizer.wait_for_cache_writes().await;
    printer.abort();

    Ok(())
}

/// Duplex session through the realtime relay
#[allow(clippy::future_not_send)]
async fn talk_realtime(
    config: Config,
    relay_url: Option<String>,
    no_audio: bool,
) -> anyhow::Result<()> {
    let url = relay_url
        .unwrap_or_else(|| format!("ws://127.0.0.1:{}/realtime", config.api_server.port));
    let playback = Arc::new(PlaybackController::new(build_sink(no_audio)?));
    let client = RealtimeClient::new(url, config.relay.relay_token, playback)
        .with_voice(config.synthesis.voice_id);
    let printer = tokio::spawn(print_events(client.subscribe()));

    let mut capture = AudioCapture::new()?;
    let tap = capture.start()?;
    println!("Connected... press Ctrl-C to stop\n");

    let cancel = CancellationToken::new();
    let session = client.run(tap, config.capture, cancel.clone());
    tokio::pin!(session);

    let result = tokio::select! {
        result = &mut session => result,
        _ = tokio::signal::ctrl_c() => {
            cancel.cancel();
            session.await
        }
    };

    capture.stop();
    printer.abort();
    result?;
    Ok(())
}

async fn print_events(mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::Transcript { text }) => println!("you: {text}"),
            Ok(SessionEvent::Reply { text }) => println!("eva: {text}"),
            Ok(SessionEvent::Error { kind, message }) => {
                eprintln!("error ({}): {message}", kind.as_str());
            }
            Ok(SessionEvent::Energy { .. }) => {}
            Ok(event) => tracing::debug!(?event, "session event"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "event printer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Sample ambient noise and print thresholds for the config file
#[allow(clippy::future_not_send)]
async fn calibrate(vad: &VadConfig, seconds: u64) -> anyhow::Result<()> {
    println!("Calibrating for {seconds} seconds... stay quiet!\n");

    let mut capture = AudioCapture::new()?;
    let tap = capture.start()?;

    let mut calibrator = Calibrator::new(&VadConfig {
        calibration_window: Duration::from_secs(seconds.max(1)),
        ..vad.clone()
    });
    let mut ticker = tokio::time::interval(vad.tick);
    loop {
        let now = ticker.tick().await;
        calibrator.observe(tap.level(), now);
        if calibrator.is_complete(now) {
            break;
        }
    }
    capture.stop();

    let thresholds = calibrator.finish();
    println!("[vad]");
    println!("speech_threshold = {:.4}", thresholds.speech);
    println!("silence_threshold = {:.4}", thresholds.silence);
    if let Some(path) = config_file_path() {
        println!("\nAdd these to {} to skip calibration", path.display());
    }

    Ok(())
}

/// Test microphone input
#[allow(clippy::future_not_send)]
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let mut capture = AudioCapture::new()?;
    let tap = capture.start()?;
    println!("---");

    for i in 0..duration {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let samples = tap.take_samples();
        let energy = rms(&samples);
        let peak = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "#".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!(
            "[{:2}s] RMS: {:.4} | Peak: {:.4} | [{}]",
            i + 1,
            energy,
            peak,
            meter
        );

        if let Some(reason) = tap.fault() {
            anyhow::bail!("input device lost: {reason}");
        }
    }

    capture.stop();

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

/// Test speaker output with a sine wave
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let playback = PlaybackController::new(Arc::new(CpalSink::new()?));

    let sample_rate = 24000_u32;
    let frequency = 440.0_f32;
    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..sample_rate * 2)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3 // 30% volume
        })
        .collect();

    println!("Playing {} samples at {} Hz...", samples.len(), sample_rate);
    let outcome = playback.play_samples(samples, sample_rate).finished().await;
    println!("Playback {outcome:?}");

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");

    Ok(())
}

/// Synthesize through the cache and play the result
async fn test_tts(config: Config, text: &str) -> anyhow::Result<()> {
    println!("Testing TTS with text: \"{text}\"\n");

    let synthesizer = build_synthesizer(config.synthesis, &config.cache)?;

    println!("Synthesizing speech...");
    let stream = synthesizer.synthesize(text).await?;
    let source = stream.source();
    let mp3_data = stream.collect_bytes().await?;
    println!("Got {} bytes of audio data ({source:?})", mp3_data.len());

    println!("Playing audio...");
    let playback = PlaybackController::new(Arc::new(CpalSink::new()?));
    let outcome = playback.play(&mp3_data)?.finished().await;
    println!("Playback {outcome:?}");

    synthesizer.wait_for_cache_writes().await;

    println!("\n---");
    println!("If you heard the speech, TTS is working!");

    Ok(())
}

async fn prune_cache(cache: &CacheConfig, max_age_days: Option<u64>) -> anyhow::Result<()> {
    let max_age = max_age_days.map_or(cache.retention, |days| {
        Duration::from_secs(days.saturating_mul(24 * 60 * 60))
    });

    let store = FsSpeechCache::new(cache.dir.clone());
    let report = store.prune(max_age).await?;

    println!(
        "Examined {} entries in {}, removed {} and {} orphaned files ({} bytes freed)",
        report.examined,
        store.root().display(),
        report.removed,
        report.orphans_removed,
        report.bytes_freed
    );

    Ok(())
}

fn list_transcripts(config: &Config, limit: usize) -> anyhow::Result<()> {
    let repo = TranscriptRepo::new(db::init(&config.db_path())?);
    let summaries = repo.list_recent(limit)?;

    if summaries.is_empty() {
        println!("No transcripts yet");
        return Ok(());
    }

    for summary in summaries {
        println!(
            "{}  {:<8}  {:>3} entries  {}",
            summary.id,
            summary.source.as_str(),
            summary.entry_count,
            summary.ended_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    Ok(())
}
