//! cadence Demo Application
//!
//! Plays a URI headlessly: frames are counted instead of drawn, audio goes to
//! the default output device (feature `audio-output`) or to a simulated
//! real-time sink. Player events are logged as they arrive.
//!
//! ```bash
//! RUST_LOG=cadence_core=debug cargo run -p cadence-demo -- "synthetic://clip?duration=5&audio=48000x2"
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use cadence_core::{
    MediaBackend, Player, PlayerConfig, PlayerEvent, PlayerState, SyntheticBackend,
    SyntheticConfig, VideoFrame, VideoOutput,
};
use cadence_core::synthetic::SCHEME;
use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "cadence-demo", about = "Headless media playback")]
struct Args {
    /// Media URI (`synthetic://` sources need no codec libraries)
    #[arg(default_value = "synthetic://demo?duration=10&audio=48000x2")]
    uri: String,

    /// Decode video in software only
    #[arg(long)]
    no_hardware: bool,

    /// Seconds that must be buffered before playback resumes
    #[arg(long, default_value_t = 0.0)]
    min_buffered: f64,

    /// Lower bound for seek targets in seconds
    #[arg(long, default_value_t = 0.0)]
    seek_min_time: f64,

    /// Decode-ahead limit per decoder in seconds
    #[arg(long, default_value_t = 2.0)]
    max_decoded: f64,

    /// Seek here once playback starts
    #[arg(long)]
    seek: Option<f64>,

    /// Switch to this audio stream index once tracks are ready
    #[arg(long)]
    audio_track: Option<usize>,

    /// Output volume, 0-100
    #[arg(long, default_value_t = 100)]
    volume: u32,

    /// Stop after this many seconds of wall time
    #[arg(long)]
    limit: Option<f64>,
}

impl Args {
    fn player_config(&self) -> PlayerConfig {
        PlayerConfig::default()
            .with_hardware_decode(!self.no_hardware)
            .with_min_buffered_duration(self.min_buffered)
            .with_seek_min_time(self.seek_min_time)
            .with_max_decoded_duration(self.max_decoded)
    }
}

/// Counts presented frames in place of a renderer.
#[derive(Default)]
struct FrameCounter {
    frames: AtomicU64,
    hardware: AtomicU64,
}

impl VideoOutput for FrameCounter {
    fn render_frame(&self, frame: &VideoFrame) {
        let n = self.frames.fetch_add(1, Ordering::Relaxed) + 1;
        if frame.hardware {
            self.hardware.fetch_add(1, Ordering::Relaxed);
        }
        if n % 100 == 0 {
            tracing::debug!(
                "Frame {} at {:.3}s ({}x{})",
                n,
                frame.position,
                frame.width,
                frame.height
            );
        }
    }
}

#[cfg(feature = "ffmpeg")]
fn backend_for(uri: &str) -> Arc<dyn MediaBackend> {
    if uri.starts_with(SCHEME) {
        Arc::new(SyntheticBackend::new(SyntheticConfig::default()))
    } else {
        Arc::new(cadence_core::FfmpegBackend::new())
    }
}

#[cfg(not(feature = "ffmpeg"))]
fn backend_for(uri: &str) -> Arc<dyn MediaBackend> {
    if !uri.starts_with(SCHEME) {
        tracing::warn!("Built without ffmpeg, only {} sources will open", SCHEME);
    }
    Arc::new(SyntheticBackend::new(SyntheticConfig::default()))
}

/// Pulls audio from the player on a timer, like a device callback would.
struct SimulatedSink {
    running: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl SimulatedSink {
    const CHANNELS: u16 = 2;
    const PERIOD: Duration = Duration::from_millis(10);

    fn start(player: Arc<Player>) -> std::io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let handle = thread::Builder::new()
            .name("cadence-sink".to_string())
            .spawn(move || {
                // 10 ms at 48 kHz
                let mut buffer = vec![0.0f32; 480 * Self::CHANNELS as usize];
                let mut next = Instant::now();
                while flag.load(Ordering::Acquire) {
                    player.render_audio(&mut buffer, Self::CHANNELS);
                    next += Self::PERIOD;
                    if let Some(wait) = next.checked_duration_since(Instant::now()) {
                        thread::sleep(wait);
                    }
                }
            })?;
        Ok(Self {
            running,
            handle: Some(handle),
        })
    }
}

impl Drop for SimulatedSink {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(feature = "audio-output")]
mod device {
    use std::sync::Arc;

    use cadence_core::{AudioFormat, Player};
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

    /// Format of the default output device, as f32 stereo or mono.
    pub fn output_format() -> Result<(cpal::Device, cpal::StreamConfig, AudioFormat), String> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| "No audio output device available".to_string())?;
        let supported = device
            .default_output_config()
            .map_err(|e| format!("Failed to get default output config: {e}"))?;
        let mut config: cpal::StreamConfig = supported.config();
        config.channels = config.channels.clamp(1, 2);
        let format = AudioFormat::new(config.sample_rate.0, config.channels);
        Ok((device, config, format))
    }

    pub fn start(
        device: &cpal::Device,
        config: &cpal::StreamConfig,
        player: Arc<Player>,
    ) -> Result<cpal::Stream, String> {
        let channels = config.channels;
        let stream = device
            .build_output_stream(
                config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    player.render_audio(data, channels);
                },
                |err| tracing::error!("Audio stream error: {}", err),
                None,
            )
            .map_err(|e| format!("Failed to build output stream: {e}"))?;
        stream
            .play()
            .map_err(|e| format!("Failed to start output stream: {e}"))?;
        Ok(stream)
    }
}

fn log_event(event: &PlayerEvent) {
    match event {
        PlayerEvent::StreamOpened => tracing::info!("Stream opened"),
        PlayerEvent::TracksReady(info) => tracing::info!(
            "Tracks ready: {}x{} @ {:.2} fps, {:.3}s, video={:?} audio={:?} ({} audio tracks), decode={:?}",
            info.presentation_size.0,
            info.presentation_size.1,
            info.fps,
            info.duration,
            info.video_track,
            info.audio_track,
            info.audio_tracks.len(),
            info.decode_path
        ),
        PlayerEvent::EndOfFile => tracing::info!("End of file"),
        PlayerEvent::PlaybackFinished => tracing::info!("Playback finished"),
        PlayerEvent::Error(err) if err.is_fatal() => tracing::error!("{}", err),
        PlayerEvent::Error(err) => tracing::warn!("{}", err),
        PlayerEvent::StateChanged { previous, current } => {
            tracing::info!("State {} -> {}", previous, current)
        }
        PlayerEvent::BufferingChanged(buffering) => tracing::debug!("Buffering: {}", buffering),
        PlayerEvent::BufferedDurationChanged(_) | PlayerEvent::PlayableTimeChanged(_) => {}
        PlayerEvent::ProgressChanged(progress) => tracing::debug!("Progress {:.2}s", progress),
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("cadence_core=info,cadence_demo=info")),
        )
        .init();

    let args = Args::parse();
    let frames = Arc::new(FrameCounter::default());
    let player = Player::new(backend_for(&args.uri), args.player_config())
        .with_video_output(frames.clone());

    #[cfg(feature = "audio-output")]
    let device = match device::output_format() {
        Ok(device) => Some(device),
        Err(err) => {
            tracing::warn!("{}, using a simulated sink", err);
            None
        }
    };
    #[cfg(feature = "audio-output")]
    let player = match &device {
        Some((_, _, format)) => player.with_audio_output(Arc::new(*format)),
        None => player,
    };

    let player = Arc::new(player);
    player.audio_handle().set_volume(args.volume.min(100));
    let events = player.events();

    #[cfg(feature = "audio-output")]
    let _stream = device.and_then(|(device, config, _)| {
        device::start(&device, &config, Arc::clone(&player))
            .map_err(|err| tracing::warn!("{}", err))
            .ok()
    });
    #[cfg(feature = "audio-output")]
    let _sink = if _stream.is_none() {
        SimulatedSink::start(Arc::clone(&player)).ok()
    } else {
        None
    };
    #[cfg(not(feature = "audio-output"))]
    let _sink = match SimulatedSink::start(Arc::clone(&player)) {
        Ok(sink) => Some(sink),
        Err(err) => {
            tracing::warn!("Cannot start audio sink: {}", err);
            None
        }
    };

    if let Err(err) = player.open(&args.uri) {
        tracing::error!("{}", err);
        std::process::exit(1);
    }
    player.play();

    let started = Instant::now();
    let limit = args.limit.map(Duration::from_secs_f64);
    let mut seek_pending = args.seek;
    let mut track_pending = args.audio_track;
    let mut failed = false;

    loop {
        if limit.is_some_and(|limit| started.elapsed() >= limit) {
            tracing::info!("Time limit reached");
            break;
        }
        let event = match events.recv_timeout(Duration::from_millis(100)) {
            Ok(event) => event,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        };
        log_event(&event);

        match event {
            PlayerEvent::TracksReady(_) => {
                if let Some(index) = track_pending.take() {
                    player.select_audio_track(index);
                }
            }
            PlayerEvent::StateChanged { current, .. } => match current {
                PlayerState::Playing => {
                    if let Some(target) = seek_pending.take() {
                        player.seek(target);
                    }
                }
                PlayerState::Finished => break,
                PlayerState::Failed => {
                    failed = true;
                    break;
                }
                _ => {}
            },
            _ => {}
        }
    }

    let metrics = player.sync_metrics();
    tracing::info!(
        "Presented {} frames ({} hardware), {} audio frames rendered, {} underruns",
        frames.frames.load(Ordering::Relaxed),
        frames.hardware.load(Ordering::Relaxed),
        player.audio_handle().frames_rendered(),
        player.audio_handle().underruns()
    );
    tracing::info!(
        "A/V sync: {} samples, max drift {} ms, avg {} us, {:.1}% out of sync",
        metrics.sample_count,
        metrics.max_drift_ms(),
        metrics.avg_drift_us,
        metrics.out_of_sync_percentage()
    );

    player.close();
    if failed {
        std::process::exit(1);
    }
}
