//! Shared helpers for the player integration tests.
//!
//! Everything runs against the synthetic backend: no media files, no codec
//! libraries and no audio device. [`AudioClock`] stands in for a device
//! callback by pulling 10 ms of audio every 10 ms.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use cadence_core::{
    Player, PlayerConfig, PlayerEvent, PlayerState, SyntheticBackend, SyntheticConfig, VideoFrame,
    VideoOutput,
};
use crossbeam_channel::Receiver;
use parking_lot::Mutex;

/// Upper bound for anything a test waits on.
pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Sink recording what the display loop rendered.
#[derive(Default)]
pub struct RecordingOutput {
    rendered: Mutex<Vec<(f64, bool)>>,
}

impl RecordingOutput {
    /// Positions of every rendered frame, redraws included.
    pub fn positions(&self) -> Vec<f64> {
        self.rendered.lock().iter().map(|(p, _)| *p).collect()
    }

    /// Positions with consecutive redraws of the same frame collapsed.
    pub fn distinct_positions(&self) -> Vec<f64> {
        let mut positions = self.positions();
        positions.dedup();
        positions
    }

    /// Distinct frames that came out of a hardware session.
    pub fn hardware_frames(&self) -> usize {
        let mut rendered = self.rendered.lock().clone();
        rendered.dedup();
        rendered.iter().filter(|(_, hw)| *hw).count()
    }

    pub fn count(&self) -> usize {
        self.rendered.lock().len()
    }
}

impl VideoOutput for RecordingOutput {
    fn render_frame(&self, frame: &VideoFrame) {
        self.rendered.lock().push((frame.position, frame.hardware));
    }
}

/// A player over a synthetic source, with a recording video sink.
pub struct Harness {
    pub player: Arc<Player>,
    pub output: Arc<RecordingOutput>,
    pub backend: Arc<SyntheticBackend>,
    pub events: Receiver<PlayerEvent>,
}

impl Harness {
    pub fn new(source: SyntheticConfig) -> Self {
        Self::with_config(source, PlayerConfig::default())
    }

    pub fn with_config(source: SyntheticConfig, config: PlayerConfig) -> Self {
        init_logging();
        let backend = Arc::new(SyntheticBackend::new(source));
        let output = Arc::new(RecordingOutput::default());
        let player = Player::new(backend.clone(), config).with_video_output(output.clone());
        let events = player.events();
        Self {
            player: Arc::new(player),
            output,
            backend,
            events,
        }
    }

    /// Opens `uri` and waits until the tracks are prepared and buffered.
    pub fn open_ready(&self, uri: &str) {
        if let Err(err) = self.player.open(uri) {
            panic!("open failed: {err}");
        }
        assert!(
            wait_until(|| self.player.state() == PlayerState::Suspended),
            "player never became ready, state {}",
            self.player.state()
        );
    }

    pub fn wait_for_state(&self, state: PlayerState) -> bool {
        wait_until(|| self.player.state() == state)
    }
}

/// Routes player logs through the test writer; `RUST_LOG` selects levels.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Polls `condition` until it holds or [`TIMEOUT`] passes.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Receives events until one matches `pred`, returning everything seen.
pub fn collect_until(
    events: &Receiver<PlayerEvent>,
    mut pred: impl FnMut(&PlayerEvent) -> bool,
) -> Option<Vec<PlayerEvent>> {
    let deadline = Instant::now() + TIMEOUT;
    let mut seen = Vec::new();
    loop {
        let remaining = deadline.checked_duration_since(Instant::now())?;
        let event = events.recv_timeout(remaining).ok()?;
        let done = pred(&event);
        seen.push(event);
        if done {
            return Some(seen);
        }
    }
}

/// Everything currently queued, without waiting.
pub fn drain(events: &Receiver<PlayerEvent>) -> Vec<PlayerEvent> {
    events.try_iter().collect()
}

/// The `current` side of every state change.
pub fn states(events: &[PlayerEvent]) -> Vec<PlayerState> {
    events
        .iter()
        .filter_map(|e| match e {
            PlayerEvent::StateChanged { current, .. } => Some(*current),
            _ => None,
        })
        .collect()
}

pub fn errors(events: &[PlayerEvent]) -> Vec<cadence_core::DecodeError> {
    events
        .iter()
        .filter_map(|e| match e {
            PlayerEvent::Error(err) => Some(err.clone()),
            _ => None,
        })
        .collect()
}

/// Drives [`Player::render_audio`] in real time like a stereo 48 kHz device.
pub struct AudioClock {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl AudioClock {
    pub fn start(player: Arc<Player>) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let handle = thread::Builder::new()
            .name("test-audio-clock".to_string())
            .spawn(move || {
                let mut buffer = vec![0.0f32; 480 * 2];
                while flag.load(Ordering::Acquire) {
                    player.render_audio(&mut buffer, 2);
                    thread::sleep(Duration::from_millis(10));
                }
            })
            .ok();
        assert!(handle.is_some(), "cannot spawn audio clock");
        Self { running, handle }
    }
}

impl Drop for AudioClock {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
