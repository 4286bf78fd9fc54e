//! Playback orchestration.
//!
//! [`Player`] opens a source through a [`MediaBackend`], builds one decoder
//! per selected stream and drives them from worker threads:
//!
//! ```text
//!            ┌────────────── cadence-read ──────────────┐
//! container ─┤ seek / track switch / backpressure / EOF ├─► packet queues
//!            └──────────────────────────────────────────┘
//!   cadence-video-decode, cadence-audio-decode: packets ─► frame queues
//!   cadence-display: video frames ─► VideoOutput, paced by the audio clock
//!   render_audio (external callback): audio frames ─► sink, advances the clock
//! ```
//!
//! # State Machine
//!
//! ```text
//! Idle → OpeningStream → PreparingTracks → Buffering ⇄ Playing ⇄ Suspended
//!                 │                            ▲
//!                 └─► Failed          Seeking ─┘ (from any non-terminal state)
//!
//! EOF drained → Finished;  close() → Closed;  fatal error → Failed
//! ```
//!
//! Once tracks are prepared the state is derived from the playback flags:
//! finished, then seeking, then buffering, then the user's play/pause
//! intent. Events are published on an unbounded channel, see [`Player::events`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};

use crate::audio::{AudioFormat, AudioHandle, AudioOutput};
use crate::audio_decoder::{AudioDecodeHooks, AudioDecoder};
use crate::codec::FallbackReason;
use crate::demux::{ensure_initialized, FormatContext, InterruptFlag, MediaBackend, Track};
use crate::error::{DecodeError, ErrorKind, Result};
use crate::frame::{AudioFrame, VideoFrame};
use crate::sync::{
    clamp_seek_target, should_throttle_read, video_frame_delay, video_sync_delay,
    BufferingPolicy, SyncMetrics, SyncMetricsSnapshot,
};
use crate::video_decoder::{
    DecodePath, HwAccelConfig, VideoDecodeHooks, VideoDecoder, DEFAULT_MAX_DECODED_DURATION,
};

/// Default read-loop backpressure cap on queued packet bytes.
pub const DEFAULT_MAX_PACKET_BYTES: usize = 20 * 1024 * 1024;

/// Default minimum spacing of progress events.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Display loop poll interval while seeking or buffering.
const DISPLAY_POLL: Duration = Duration::from_millis(10);

/// Redraw cadence of the held frame while suspended.
const PAUSED_REDRAW: Duration = Duration::from_millis(30);

/// Longest wait for a decoded frame before the display loop rechecks state.
const FRAME_WAIT: Duration = Duration::from_millis(50);

/// Buffered durations at or below this are treated as empty.
const EMPTY_EPSILON: f64 = 0.000_001;

/// Displayed frames between A/V sync status logs.
const SYNC_LOG_INTERVAL: u64 = 250;

/// Receives decoded video frames from the display loop.
pub trait VideoOutput: Send + Sync {
    fn render_frame(&self, frame: &VideoFrame);
}

/// Discards frames.
impl VideoOutput for () {
    fn render_frame(&self, _frame: &VideoFrame) {}
}

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct PlayerConfig {
    /// Try hardware decoding for video
    pub hardware_decode: bool,
    /// Buffered seconds required to leave buffering
    pub min_buffered_duration: f64,
    /// Lower bound for seek targets, in seconds
    pub seek_min_time: f64,
    /// Queued packet bytes across decoders that pause reading
    pub max_packet_bytes: usize,
    /// Decoded seconds per stream that pause decoding
    pub max_decoded_duration: f64,
    /// Minimum spacing of progress events
    pub progress_interval: Duration,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            hardware_decode: true,
            min_buffered_duration: 0.0,
            seek_min_time: 0.0,
            max_packet_bytes: DEFAULT_MAX_PACKET_BYTES,
            max_decoded_duration: DEFAULT_MAX_DECODED_DURATION,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }
}

impl PlayerConfig {
    pub fn with_hardware_decode(mut self, enabled: bool) -> Self {
        self.hardware_decode = enabled;
        self
    }

    pub fn with_min_buffered_duration(mut self, seconds: f64) -> Self {
        self.min_buffered_duration = seconds;
        self
    }

    pub fn with_seek_min_time(mut self, seconds: f64) -> Self {
        self.seek_min_time = seconds;
        self
    }

    pub fn with_max_packet_bytes(mut self, bytes: usize) -> Self {
        self.max_packet_bytes = bytes;
        self
    }

    pub fn with_max_decoded_duration(mut self, seconds: f64) -> Self {
        self.max_decoded_duration = seconds;
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Video decoder acceleration settings.
    pub fn hw_accel(&self) -> HwAccelConfig {
        if self.hardware_decode {
            HwAccelConfig::default()
        } else {
            HwAccelConfig::software_only()
        }
    }
}

/// Lifecycle state of a [`Player`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Idle,
    OpeningStream,
    PreparingTracks,
    Buffering,
    Playing,
    Suspended,
    Seeking,
    Finished,
    Failed,
    Closed,
}

impl PlayerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlayerState::Idle => "idle",
            PlayerState::OpeningStream => "opening",
            PlayerState::PreparingTracks => "preparing",
            PlayerState::Buffering => "buffering",
            PlayerState::Playing => "playing",
            PlayerState::Suspended => "suspended",
            PlayerState::Seeking => "seeking",
            PlayerState::Finished => "finished",
            PlayerState::Failed => "failed",
            PlayerState::Closed => "closed",
        }
    }

    /// Returns true for `Finished`, `Failed` and `Closed`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PlayerState::Finished | PlayerState::Failed | PlayerState::Closed
        )
    }

    fn is_final(&self) -> bool {
        matches!(self, PlayerState::Failed | PlayerState::Closed)
    }
}

impl std::fmt::Display for PlayerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Description of the opened media, published once tracks are ready.
#[derive(Debug, Clone)]
pub struct MediaInfo {
    pub uri: String,
    /// Seconds; [`crate::demux::UNKNOWN_DURATION`] when the container has none
    pub duration: f64,
    pub bit_rate_kbps: u64,
    pub metadata: HashMap<String, String>,
    /// Coded video size in pixels
    pub presentation_size: (u32, u32),
    /// Display aspect ratio (0 when unknown)
    pub aspect: f64,
    pub fps: f64,
    pub video_time_base: f64,
    pub audio_time_base: f64,
    pub video_tracks: Vec<Track>,
    pub audio_tracks: Vec<Track>,
    /// Stream index of the playing video track
    pub video_track: Option<usize>,
    /// Stream index of the playing audio track
    pub audio_track: Option<usize>,
    pub seek_enabled: bool,
    pub decode_path: Option<DecodePath>,
}

impl MediaInfo {
    fn from_format(format: &FormatContext, decode_path: Option<DecodePath>) -> Self {
        let video = format.video();
        let audio = format.audio();
        Self {
            uri: format.uri().to_string(),
            duration: format.duration(),
            bit_rate_kbps: format.bit_rate_kbps(),
            metadata: format.metadata().clone(),
            presentation_size: video.map_or((0, 0), |v| (v.width, v.height)),
            aspect: video.map_or(0.0, |v| v.aspect),
            fps: video.map_or(0.0, |v| v.fps),
            video_time_base: video.map_or(0.0, |v| v.time_base),
            audio_time_base: audio.map_or(0.0, |a| a.time_base),
            video_tracks: format.video_tracks().to_vec(),
            audio_tracks: format.audio_tracks().to_vec(),
            video_track: video.map(|v| v.track.index),
            audio_track: audio.map(|a| a.track.index),
            seek_enabled: format.seek_enabled(),
            decode_path,
        }
    }

    pub fn has_video(&self) -> bool {
        self.video_track.is_some()
    }

    pub fn has_audio(&self) -> bool {
        self.audio_track.is_some()
    }
}

/// Notifications published by a [`Player`].
#[derive(Debug, Clone)]
pub enum PlayerEvent {
    StreamOpened,
    TracksReady(MediaInfo),
    EndOfFile,
    PlaybackFinished,
    /// A fatal error, or a non-fatal one such as a hardware fallback
    Error(DecodeError),
    StateChanged {
        previous: PlayerState,
        current: PlayerState,
    },
    BufferingChanged(bool),
    BufferedDurationChanged(f64),
    ProgressChanged(f64),
    PlayableTimeChanged(f64),
}

/// Point-in-time view of the playback flags.
#[derive(Debug, Clone)]
pub struct PlaybackSnapshot {
    pub state: PlayerState,
    /// Seconds
    pub progress: f64,
    pub audio_clock: f64,
    pub buffered_duration: f64,
    pub playable_time: f64,
    pub buffering: bool,
    pub seeking: bool,
    pub end_of_file: bool,
    pub finished: bool,
    pub error: Option<DecodeError>,
}

struct PlaybackState {
    state: PlayerState,
    /// Tracks are ready; the state is derived from here on
    prepared: bool,
    play_requested: bool,
    buffering: bool,
    seeking: bool,
    seek_request: Option<f64>,
    track_request: Option<usize>,
    end_of_file: bool,
    finished: bool,
    progress: f64,
    audio_clock: f64,
    buffered_duration: f64,
    playable_time: f64,
    last_progress_event: Option<Instant>,
    min_buffered: f64,
    media: Option<MediaInfo>,
    error: Option<DecodeError>,
}

impl PlaybackState {
    fn new(min_buffered: f64) -> Self {
        Self {
            state: PlayerState::Idle,
            prepared: false,
            play_requested: false,
            buffering: false,
            seeking: false,
            seek_request: None,
            track_request: None,
            end_of_file: false,
            finished: false,
            progress: 0.0,
            audio_clock: 0.0,
            buffered_duration: 0.0,
            playable_time: 0.0,
            last_progress_event: None,
            min_buffered,
            media: None,
            error: None,
        }
    }

    fn derived_state(&self) -> PlayerState {
        if self.finished {
            PlayerState::Finished
        } else if self.seeking {
            PlayerState::Seeking
        } else if self.buffering {
            PlayerState::Buffering
        } else if self.play_requested {
            PlayerState::Playing
        } else {
            PlayerState::Suspended
        }
    }

    fn has_audio(&self) -> bool {
        self.media.as_ref().is_some_and(MediaInfo::has_audio)
    }

    fn duration(&self) -> f64 {
        self.media.as_ref().map_or(0.0, |m| m.duration)
    }

    /// Clears everything tied to the opened stream.
    fn reset(&mut self) {
        self.prepared = false;
        self.play_requested = false;
        self.buffering = false;
        self.seeking = false;
        self.seek_request = None;
        self.track_request = None;
        self.end_of_file = false;
        self.finished = false;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerKind {
    Read,
    VideoDecode,
    AudioDecode,
    Display,
}

impl WorkerKind {
    const ALL: [WorkerKind; 4] = [
        WorkerKind::Read,
        WorkerKind::VideoDecode,
        WorkerKind::AudioDecode,
        WorkerKind::Display,
    ];

    fn index(self) -> usize {
        self as usize
    }

    fn thread_name(self) -> &'static str {
        match self {
            WorkerKind::Read => "cadence-read",
            WorkerKind::VideoDecode => "cadence-video-decode",
            WorkerKind::AudioDecode => "cadence-audio-decode",
            WorkerKind::Display => "cadence-display",
        }
    }
}

/// Worker bookkeeping. A loop decides to exit and clears its `running` flag
/// under this lock, and restarts check the flag under it too.
#[derive(Default)]
struct Workers {
    running: [bool; 4],
    handles: Vec<JoinHandle<()>>,
}

struct CurrentAudio {
    frame: AudioFrame,
    /// Samples already rendered
    offset: usize,
}

struct Shared {
    config: PlayerConfig,
    backend: Arc<dyn MediaBackend>,
    video_output: RwLock<Arc<dyn VideoOutput>>,
    audio_output: RwLock<Arc<dyn AudioOutput>>,
    events: Sender<PlayerEvent>,
    interrupt: InterruptFlag,
    closed: AtomicBool,
    failed: AtomicBool,
    state: Mutex<PlaybackState>,
    format: Mutex<Option<FormatContext>>,
    video: RwLock<Option<Arc<VideoDecoder>>>,
    audio: RwLock<Option<Arc<AudioDecoder>>>,
    workers: Mutex<Workers>,
    current_video: Mutex<Option<VideoFrame>>,
    current_audio: Mutex<Option<CurrentAudio>>,
    audio_handle: AudioHandle,
    metrics: SyncMetrics,
}

/// Media player core.
///
/// Dropping the player closes it.
pub struct Player {
    shared: Arc<Shared>,
    events: Receiver<PlayerEvent>,
}

impl Player {
    /// Creates an idle player. Frames go nowhere and audio is converted to
    /// 48 kHz stereo until outputs are attached.
    pub fn new(backend: Arc<dyn MediaBackend>, config: PlayerConfig) -> Self {
        let (sender, events) = crossbeam_channel::unbounded();
        let min_buffered = config.min_buffered_duration.max(0.0);
        let shared = Arc::new(Shared {
            config,
            backend,
            video_output: RwLock::new(Arc::new(())),
            audio_output: RwLock::new(Arc::new(AudioFormat::default())),
            events: sender,
            interrupt: InterruptFlag::new(),
            closed: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            state: Mutex::new(PlaybackState::new(min_buffered)),
            format: Mutex::new(None),
            video: RwLock::new(None),
            audio: RwLock::new(None),
            workers: Mutex::new(Workers::default()),
            current_video: Mutex::new(None),
            current_audio: Mutex::new(None),
            audio_handle: AudioHandle::new(),
            metrics: SyncMetrics::new(),
        });
        Self { shared, events }
    }

    /// Sets the sink for decoded video frames.
    pub fn with_video_output(self, output: Arc<dyn VideoOutput>) -> Self {
        *self.shared.video_output.write() = output;
        self
    }

    /// Sets the audio sink. Its format is queried on every decode step;
    /// replacing the sink itself only affects decoders created afterwards.
    pub fn with_audio_output(self, output: Arc<dyn AudioOutput>) -> Self {
        *self.shared.audio_output.write() = output;
        self
    }

    /// Starts opening `uri` on a background thread.
    ///
    /// Fails if the player was already opened or closed.
    pub fn open(&self, uri: &str) -> Result<()> {
        {
            let mut st = self.shared.state.lock();
            if st.state != PlayerState::Idle || self.shared.is_closed() {
                return Err(DecodeError::new(
                    ErrorKind::FormatOpenInput,
                    format!("cannot open {uri} while {}", st.state),
                ));
            }
            self.shared.set_state(&mut st, PlayerState::OpeningStream);
        }

        let shared = Arc::clone(&self.shared);
        let target = uri.to_string();
        let mut workers = self.shared.workers.lock();
        let spawned = thread::Builder::new()
            .name("cadence-open".to_string())
            .spawn(move || shared.open_stream(&target));
        match spawned {
            Ok(handle) => {
                workers.handles.push(handle);
                Ok(())
            }
            Err(err) => {
                drop(workers);
                let err = DecodeError::new(
                    ErrorKind::FormatCreate,
                    format!("cannot spawn open thread: {err}"),
                );
                self.shared.fail(err.clone());
                Err(err)
            }
        }
    }

    /// Requests playback. A finished stream restarts from the beginning.
    pub fn play(&self) {
        let shared = &self.shared;
        let finished = {
            let mut st = shared.state.lock();
            if st.state.is_final() {
                return;
            }
            st.play_requested = true;
            shared.transition(&mut st);
            st.finished
        };
        tracing::debug!("Play requested");
        if finished {
            self.seek(0.0);
        }
    }

    /// Gates output while the read and decode loops keep buffering.
    pub fn pause(&self) {
        let shared = &self.shared;
        let mut st = shared.state.lock();
        if st.state.is_final() {
            return;
        }
        st.play_requested = false;
        shared.transition(&mut st);
        tracing::debug!("Pause requested");
    }

    /// Requests a seek; the read loop performs it.
    ///
    /// The target is clamped so that enough media remains to refill the
    /// buffer. Ignored when the stream is not seekable or has failed.
    pub fn seek(&self, seconds: f64) {
        self.shared.request_seek(seconds);
    }

    /// Switches to another audio track by stream index. Unknown indices and
    /// the current track are ignored by the read loop.
    pub fn select_audio_track(&self, index: usize) {
        {
            let mut st = self.shared.state.lock();
            if !st.prepared || st.state.is_final() {
                return;
            }
            st.track_request = Some(index);
        }
        tracing::debug!("Audio track {} requested", index);
        self.shared.ensure_workers();
    }

    /// Takes the next audio frame for the sink and advances the audio clock.
    ///
    /// Returns `None` while output is gated (seeking, buffering, suspended,
    /// finished or failed) or no frame is decoded yet.
    pub fn fetch_audio_frame(&self) -> Option<AudioFrame> {
        self.shared.fetch_audio_frame()
    }

    /// Fills `out` with interleaved samples for a sink with `channels`
    /// channels, padding with silence. Returns the sample frames taken from
    /// decoded audio.
    pub fn render_audio(&self, out: &mut [f32], channels: u16) -> usize {
        self.shared.render_audio(out, channels)
    }

    /// Stops every worker and releases the stream. Idempotent.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Receiver of player events. Clones share one queue.
    pub fn events(&self) -> Receiver<PlayerEvent> {
        self.events.clone()
    }

    pub fn state(&self) -> PlayerState {
        self.shared.state.lock().state
    }

    pub fn snapshot(&self) -> PlaybackSnapshot {
        let st = self.shared.state.lock();
        PlaybackSnapshot {
            state: st.state,
            progress: st.progress,
            audio_clock: st.audio_clock,
            buffered_duration: st.buffered_duration,
            playable_time: st.playable_time,
            buffering: st.buffering,
            seeking: st.seeking,
            end_of_file: st.end_of_file,
            finished: st.finished,
            error: st.error.clone(),
        }
    }

    /// Media description, once tracks are ready.
    pub fn media_info(&self) -> Option<MediaInfo> {
        self.shared.state.lock().media.clone()
    }

    /// The latched fatal error.
    pub fn error(&self) -> Option<DecodeError> {
        self.shared.state.lock().error.clone()
    }

    /// Current video decode path, if a video track is playing.
    pub fn decode_path(&self) -> Option<DecodePath> {
        self.shared.video_decoder().map(|v| v.decode_path())
    }

    pub fn set_min_buffered_duration(&self, seconds: f64) {
        let mut st = self.shared.state.lock();
        st.min_buffered = seconds.max(0.0);
        self.shared.check_buffering_locked(&mut st);
        self.shared.transition(&mut st);
    }

    pub fn audio_handle(&self) -> &AudioHandle {
        &self.shared.audio_handle
    }

    pub fn sync_metrics(&self) -> SyncMetricsSnapshot {
        self.shared.metrics.snapshot()
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.shared.close();
    }
}

struct VideoHooks<'a>(&'a Arc<Shared>);

impl VideoDecodeHooks for VideoHooks<'_> {
    fn on_error(&self, error: &DecodeError) {
        self.0.fail(error.clone());
    }

    fn on_fallback(&self, reason: &FallbackReason) {
        self.0.report_fallback(reason);
        let mut st = self.0.state.lock();
        if let Some(media) = st.media.as_mut() {
            media.decode_path = Some(DecodePath::Software);
        }
    }

    fn on_buffered_duration_stale(&self) {
        self.0.update_buffered_duration();
    }

    fn on_decode_finished(&self) {
        self.0.update_buffered_duration();
    }
}

struct AudioHooks<'a>(&'a Arc<Shared>);

impl AudioDecodeHooks for AudioHooks<'_> {
    fn on_error(&self, error: &DecodeError) {
        self.0.fail(error.clone());
    }

    fn on_buffered_duration_stale(&self) {
        self.0.update_buffered_duration();
    }

    fn on_decode_finished(&self) {
        self.0.update_buffered_duration();
    }
}

/// Flags the display loop acts on, copied out of the state lock.
struct DisplayView {
    seeking: bool,
    buffering: bool,
    playing: bool,
    has_audio: bool,
    end_of_file: bool,
    finished: bool,
    audio_clock: f64,
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn should_stop(&self) -> bool {
        self.is_closed() || self.failed.load(Ordering::Acquire)
    }

    fn video_decoder(&self) -> Option<Arc<VideoDecoder>> {
        self.video.read().clone()
    }

    fn audio_decoder(&self) -> Option<Arc<AudioDecoder>> {
        self.audio.read().clone()
    }

    /// Publishes an event. After a fatal error only error events go out.
    fn emit(&self, event: PlayerEvent) {
        if self.failed.load(Ordering::Acquire) && !matches!(event, PlayerEvent::Error(_)) {
            return;
        }
        // Fails only once every receiver is gone
        let _ = self.events.send(event);
    }

    fn set_state(&self, st: &mut PlaybackState, next: PlayerState) {
        if st.state == next {
            return;
        }
        let previous = std::mem::replace(&mut st.state, next);
        tracing::debug!("Player state {} -> {}", previous, next);
        self.emit(PlayerEvent::StateChanged {
            previous,
            current: next,
        });
    }

    /// Re-derives the state from the playback flags.
    fn transition(&self, st: &mut PlaybackState) {
        if !st.prepared || st.state.is_final() {
            return;
        }
        let next = st.derived_state();
        self.set_state(st, next);
    }

    /// Latches the first fatal error and stops the pipeline.
    fn fail(&self, err: DecodeError) {
        {
            let mut st = self.state.lock();
            if st.error.is_some() || st.state == PlayerState::Closed {
                return;
            }
            tracing::error!("Playback failed: {}", err);
            st.error = Some(err.clone());
            self.emit(PlayerEvent::Error(err));
            self.set_state(&mut st, PlayerState::Failed);
            self.failed.store(true, Ordering::Release);
        }
        self.destroy_decoders();
    }

    fn report_fallback(&self, reason: &FallbackReason) {
        match reason {
            FallbackReason::DeviceUnavailable(_) | FallbackReason::SessionFailed(_) => {
                tracing::warn!("Hardware decoding unavailable: {}", reason);
                self.emit(PlayerEvent::Error(reason.clone().into_error()));
            }
            FallbackReason::Disabled | FallbackReason::UnsupportedCodec(_) => {
                tracing::debug!("Software decoding: {}", reason);
            }
        }
    }

    fn destroy_decoders(&self) {
        if let Some(video) = self.video_decoder() {
            video.destroy();
        }
        if let Some(audio) = self.audio_decoder() {
            audio.destroy();
        }
    }

    fn clear_current_frames(&self) {
        *self.current_video.lock() = None;
        *self.current_audio.lock() = None;
    }

    fn open_stream(self: &Arc<Self>, uri: &str) {
        tracing::info!("Opening {}", uri);
        let opened = ensure_initialized(self.backend.as_ref())
            .and_then(|()| FormatContext::open(self.backend.as_ref(), uri, self.interrupt.clone()));
        let mut format = match opened {
            Ok(format) => format,
            Err(err) => {
                if !self.is_closed() {
                    self.fail(err);
                }
                return;
            }
        };
        if self.is_closed() {
            format.close();
            return;
        }
        self.emit(PlayerEvent::StreamOpened);
        {
            let mut st = self.state.lock();
            self.set_state(&mut st, PlayerState::PreparingTracks);
        }

        let stream_errors = [format.video_error(), format.audio_error()];
        for err in stream_errors.into_iter().flatten() {
            if err.kind() == ErrorKind::StreamNotFound {
                continue;
            }
            tracing::warn!("Stream unavailable: {}", err);
            self.emit(PlayerEvent::Error(err.clone()));
        }

        let video_params = format.video().cloned();
        let video = match (video_params, format.take_video_codec()) {
            (Some(params), Some(codec)) => {
                let decoder = VideoDecoder::new(
                    codec,
                    params.time_base,
                    params.fps,
                    self.config.hw_accel(),
                    self.config.max_decoded_duration,
                );
                if let Some(reason) = decoder.fallback_reason() {
                    self.report_fallback(&reason);
                }
                Some(Arc::new(decoder))
            }
            _ => None,
        };
        let audio_params = format.audio().cloned();
        let audio = match (audio_params, format.take_audio_codec()) {
            (Some(params), Some(codec)) => Some(Arc::new(AudioDecoder::new(
                codec,
                params.time_base,
                Arc::clone(&*self.audio_output.read()),
                self.config.max_decoded_duration,
            ))),
            _ => None,
        };

        let info = MediaInfo::from_format(&format, video.as_ref().map(|v| v.decode_path()));
        self.audio_handle.set_available(audio.is_some());
        *self.video.write() = video;
        *self.audio.write() = audio;
        *self.format.lock() = Some(format);

        {
            let mut st = self.state.lock();
            if st.state.is_final() {
                return;
            }
            tracing::info!(
                "Tracks ready: video={:?} audio={:?} duration={:.3}s fps={:.2}",
                info.video_track,
                info.audio_track,
                info.duration,
                info.fps
            );
            st.media = Some(info.clone());
            st.prepared = true;
            self.emit(PlayerEvent::TracksReady(info));
            self.set_buffering(&mut st, true);
            self.transition(&mut st);
        }
        self.ensure_workers();
    }

    /// Starts every worker loop that has work but is not running.
    fn ensure_workers(self: &Arc<Self>) {
        if self.is_closed() {
            return;
        }
        let mut workers = self.workers.lock();
        // close() may have collected the handles since the check above
        if self.is_closed() {
            return;
        }
        workers.handles.retain(|handle| !handle.is_finished());
        for kind in WorkerKind::ALL {
            if workers.running[kind.index()] || self.worker_done(kind) {
                continue;
            }
            if let Err(err) = self.spawn_worker(&mut workers, kind) {
                drop(workers);
                self.fail(err);
                return;
            }
        }
    }

    /// Whether a loop of this kind has nothing left to do.
    fn worker_done(&self, kind: WorkerKind) -> bool {
        if self.should_stop() {
            return true;
        }
        match kind {
            WorkerKind::Read => {
                let st = self.state.lock();
                !st.prepared
                    || (st.end_of_file && st.seek_request.is_none() && st.track_request.is_none())
            }
            WorkerKind::VideoDecode => self
                .video_decoder()
                .map_or(true, |v| v.is_destroyed() || v.is_drained()),
            WorkerKind::AudioDecode => self
                .audio_decoder()
                .map_or(true, |a| a.is_destroyed() || a.is_drained()),
            WorkerKind::Display => {
                let Some(video) = self.video_decoder() else {
                    return true;
                };
                let st = self.state.lock();
                st.finished || (st.end_of_file && video.is_empty())
            }
        }
    }

    fn spawn_worker(self: &Arc<Self>, workers: &mut Workers, kind: WorkerKind) -> Result<()> {
        let shared = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(kind.thread_name().to_string())
            .spawn(move || {
                loop {
                    match kind {
                        WorkerKind::Read => shared.read_loop(),
                        WorkerKind::VideoDecode => {
                            if let Some(video) = shared.video_decoder() {
                                video.run(&VideoHooks(&shared));
                            }
                        }
                        WorkerKind::AudioDecode => {
                            if let Some(audio) = shared.audio_decoder() {
                                audio.run(&AudioHooks(&shared));
                            }
                        }
                        WorkerKind::Display => shared.display_loop(),
                    }
                    let mut workers = shared.workers.lock();
                    if shared.worker_done(kind) {
                        workers.running[kind.index()] = false;
                        break;
                    }
                }
                tracing::debug!("{} exited", kind.thread_name());
            })
            .map_err(|err| {
                DecodeError::new(
                    ErrorKind::FormatCreate,
                    format!("cannot spawn {}: {err}", kind.thread_name()),
                )
            })?;
        tracing::debug!("Started {}", kind.thread_name());
        workers.running[kind.index()] = true;
        workers.handles.push(handle);
        Ok(())
    }

    fn track_indices(&self) -> (Option<usize>, Option<usize>) {
        let st = self.state.lock();
        st.media
            .as_ref()
            .map_or((None, None), |m| (m.video_track, m.audio_track))
    }

    fn read_loop(self: &Arc<Self>) {
        tracing::debug!("Read loop started");
        let (mut video_index, mut audio_index) = self.track_indices();

        loop {
            if self.should_stop() {
                break;
            }

            let track_request = self.state.lock().track_request.take();
            if let Some(index) = track_request {
                self.switch_audio_track(index);
                (video_index, audio_index) = self.track_indices();
                continue;
            }
            let seek_request = self.state.lock().seek_request.take();
            if let Some(target) = seek_request {
                self.perform_seek(target);
                continue;
            }

            let video = self.video_decoder();
            let audio = self.audio_decoder();
            let queued = video.as_ref().map_or(0, |v| v.packet_size())
                + audio.as_ref().map_or(0, |a| a.packet_size());
            let suspended = !self.state.lock().play_requested;
            if let Some(delay) = should_throttle_read(queued, self.config.max_packet_bytes, suspended)
            {
                tracing::debug!("Read throttled with {} bytes queued", queued);
                thread::sleep(delay);
                continue;
            }

            let read = match self.format.lock().as_mut() {
                Some(format) => format.read_packet(),
                None => Ok(None),
            };
            let packet = match read {
                Ok(Some(packet)) => packet,
                Ok(None) => {
                    self.mark_end_of_file();
                    break;
                }
                Err(err) => {
                    tracing::warn!("Read failed, treating as end of file: {}", err);
                    self.mark_end_of_file();
                    break;
                }
            };

            let index = Some(packet.stream_index);
            if index == video_index {
                if let Some(video) = &video {
                    if let Err(err) = video.put_packet(packet) {
                        tracing::trace!("Dropping video packet: {}", err);
                    }
                }
            } else if index == audio_index {
                if let Some(audio) = &audio {
                    if let Err(err) = audio.put_packet(packet) {
                        tracing::trace!("Dropping audio packet: {}", err);
                    }
                }
            } else {
                tracing::trace!(stream = packet.stream_index, "skipping packet");
                continue;
            }
            self.update_buffered_duration();
        }

        self.check_buffering();
        tracing::debug!("Read loop stopped");
    }

    fn mark_end_of_file(&self) {
        if self.should_stop() {
            return;
        }
        tracing::debug!("End of file");
        if let Some(video) = self.video_decoder() {
            video.set_end_of_file(true);
        }
        if let Some(audio) = self.audio_decoder() {
            audio.set_end_of_file(true);
        }
        self.state.lock().end_of_file = true;
        self.emit(PlayerEvent::EndOfFile);
        self.update_buffered_duration();
    }

    fn request_seek(self: &Arc<Self>, seconds: f64) {
        {
            let mut st = self.state.lock();
            let Some((seek_enabled, duration, has_audio)) = st
                .media
                .as_ref()
                .map(|m| (m.seek_enabled, m.duration, m.has_audio()))
            else {
                return;
            };
            if !seek_enabled || st.error.is_some() || st.state.is_final() {
                return;
            }
            let target = clamp_seek_target(
                seconds,
                duration,
                st.min_buffered,
                self.config.seek_min_time,
                has_audio,
            );
            tracing::debug!("Seek requested to {:.3}s (clamped to {:.3}s)", seconds, target);
            self.set_progress(&mut st, target);
            st.seeking = true;
            st.finished = false;
            st.seek_request = Some(target);
            self.transition(&mut st);
        }
        if let Some(video) = self.video_decoder() {
            video.set_paused(true);
        }
        if let Some(audio) = self.audio_decoder() {
            audio.set_paused(true);
        }
        self.ensure_workers();
    }

    fn perform_seek(self: &Arc<Self>, target: f64) {
        tracing::debug!("Seeking to {:.3}s", target);
        {
            let mut st = self.state.lock();
            st.end_of_file = false;
            st.finished = false;
        }
        if let Some(format) = self.format.lock().as_mut() {
            if let Err(err) = format.seek(target) {
                tracing::warn!("Seek to {:.3}s failed: {}", target, err);
            }
        }
        if let Some(video) = self.video_decoder() {
            video.flush();
            video.set_end_of_file(false);
            video.set_paused(false);
        }
        if let Some(audio) = self.audio_decoder() {
            audio.flush();
            audio.set_end_of_file(false);
            audio.set_paused(false);
        }
        self.clear_current_frames();
        {
            let mut st = self.state.lock();
            if st.seek_request.is_none() {
                st.seeking = false;
            }
            st.audio_clock = st.progress;
            self.set_buffering(&mut st, true);
            self.transition(&mut st);
        }
        self.update_buffered_duration();
        self.ensure_workers();
    }

    fn switch_audio_track(self: &Arc<Self>, index: usize) {
        let selected = match self.format.lock().as_mut() {
            Some(format) => match format.select_audio_track(index) {
                Ok(true) => format.take_audio_codec().zip(format.audio().cloned()),
                Ok(false) => {
                    tracing::debug!("Audio track {} already selected or unknown", index);
                    None
                }
                Err(err) => {
                    tracing::warn!("Cannot switch to audio track {}: {}", index, err);
                    None
                }
            },
            None => None,
        };
        let Some((codec, params)) = selected else {
            return;
        };

        let decoder = Arc::new(AudioDecoder::new(
            codec,
            params.time_base,
            Arc::clone(&*self.audio_output.read()),
            self.config.max_decoded_duration,
        ));
        if let Some(previous) = self.audio.write().replace(Arc::clone(&decoder)) {
            previous.destroy();
        }
        *self.current_audio.lock() = None;
        self.audio_handle.set_available(true);

        let (finished, clock) = {
            let mut st = self.state.lock();
            if let Some(media) = st.media.as_mut() {
                media.audio_track = Some(index);
                media.audio_time_base = params.time_base;
                let info = media.clone();
                self.emit(PlayerEvent::TracksReady(info));
            }
            (st.finished, st.audio_clock)
        };
        if finished {
            decoder.set_end_of_file(true);
        } else {
            {
                let mut st = self.state.lock();
                self.set_progress(&mut st, clock);
            }
            self.perform_seek(clock);
        }
        self.ensure_workers();
    }

    fn display_view(&self) -> DisplayView {
        let st = self.state.lock();
        DisplayView {
            seeking: st.seeking,
            buffering: st.buffering,
            playing: st.play_requested,
            has_audio: st.has_audio(),
            end_of_file: st.end_of_file,
            finished: st.finished,
            audio_clock: st.audio_clock,
        }
    }

    fn display_loop(self: &Arc<Self>) {
        let Some(video) = self.video_decoder() else {
            return;
        };
        let fps = video.fps();
        let mut displayed: u64 = 0;
        tracing::debug!("Display loop started");

        loop {
            if self.should_stop() {
                break;
            }
            let view = self.display_view();
            if view.finished {
                break;
            }
            if view.end_of_file && video.is_empty() {
                self.update_buffered_duration();
                break;
            }
            if view.seeking || view.buffering {
                thread::sleep(DISPLAY_POLL);
                continue;
            }

            if !view.playing {
                // Keep the held frame on screen; show one if there is none yet
                if self.redraw_current() {
                    thread::sleep(PAUSED_REDRAW);
                } else if let Some(frame) = video.get_frame_timeout(DISPLAY_POLL) {
                    tracing::debug!("Preview frame at {:.3}s", frame.position);
                    self.show(frame);
                }
                continue;
            }

            if view.has_audio {
                if let Some(delay) = self.current_sync_delay(fps, view.audio_clock) {
                    thread::sleep(delay);
                    continue;
                }
            }
            if video.frame_queue_is_empty() {
                self.update_buffered_duration();
            }
            let Some(frame) = video.get_frame_timeout(FRAME_WAIT) else {
                continue;
            };
            if self.is_regressing(&frame) {
                tracing::warn!("Discarding late video frame at {:.3}s", frame.position);
                self.metrics.record_discard();
                continue;
            }

            let position = frame.position;
            if view.has_audio {
                self.metrics.record_frame(position, view.audio_clock);
                self.show(frame);
            } else {
                let delay = video_frame_delay(frame.duration, fps);
                self.show(frame);
                {
                    let mut st = self.state.lock();
                    self.set_progress(&mut st, position);
                }
                thread::sleep(delay);
            }
            if view.end_of_file {
                self.update_buffered_duration();
            }

            displayed += 1;
            if view.has_audio && displayed % SYNC_LOG_INTERVAL == 0 {
                self.metrics.log_status();
            }
        }
        tracing::debug!("Display loop stopped after {} frames", displayed);
    }

    /// How long the frame on screen still has before the audio clock passes it.
    fn current_sync_delay(&self, fps: f64, audio_clock: f64) -> Option<Duration> {
        let current = self.current_video.lock();
        let frame = current.as_ref()?;
        video_sync_delay(frame.position, frame.duration, fps, audio_clock)
    }

    fn is_regressing(&self, frame: &VideoFrame) -> bool {
        self.current_video
            .lock()
            .as_ref()
            .is_some_and(|current| frame.position < current.position)
    }

    fn show(&self, frame: VideoFrame) {
        let output = Arc::clone(&*self.video_output.read());
        output.render_frame(&frame);
        *self.current_video.lock() = Some(frame);
    }

    fn redraw_current(&self) -> bool {
        let output = Arc::clone(&*self.video_output.read());
        let current = self.current_video.lock();
        match current.as_ref() {
            Some(frame) => {
                output.render_frame(frame);
                true
            }
            None => false,
        }
    }

    fn fetch_audio_frame(&self) -> Option<AudioFrame> {
        if self.should_stop() {
            return None;
        }
        let end_of_file = {
            let st = self.state.lock();
            if st.seeking || st.buffering || !st.play_requested || st.finished || !st.has_audio() {
                return None;
            }
            st.end_of_file
        };
        let audio = self.audio_decoder()?;
        if audio.frame_queue_is_empty() {
            self.update_buffered_duration();
            return None;
        }
        let frame = audio.get_frame_non_blocking()?;
        if end_of_file {
            self.update_buffered_duration();
        }
        let mut st = self.state.lock();
        st.audio_clock = frame.position;
        self.set_progress(&mut st, frame.position);
        Some(frame)
    }

    fn render_audio(&self, out: &mut [f32], channels: u16) -> usize {
        let channels = usize::from(channels.max(1));
        let mut written = 0;
        {
            let mut current = self.current_audio.lock();
            while written < out.len() {
                if current.is_none() {
                    let Some(frame) = self.fetch_audio_frame() else {
                        break;
                    };
                    frame.start_playing();
                    *current = Some(CurrentAudio { frame, offset: 0 });
                }
                let Some(playing) = current.as_mut() else {
                    break;
                };
                if usize::from(playing.frame.channels) != channels {
                    tracing::warn!(
                        "Dropping audio frame with {} channels for a {} channel sink",
                        playing.frame.channels,
                        channels
                    );
                    playing.frame.stop_playing();
                    *current = None;
                    continue;
                }
                let available = &playing.frame.samples[playing.offset..];
                let count = available.len().min(out.len() - written);
                out[written..written + count].copy_from_slice(&available[..count]);
                written += count;
                playing.offset += count;
                if playing.offset >= playing.frame.samples.len() {
                    playing.frame.stop_playing();
                    *current = None;
                }
            }
        }

        self.audio_handle.apply_volume(&mut out[..written]);
        out[written..].fill(0.0);
        self.audio_handle
            .add_frames_rendered((out.len() / channels) as u64);
        if written < out.len() && self.state.lock().state == PlayerState::Playing {
            self.audio_handle.record_underrun();
        }
        written / channels
    }

    /// Recomputes the buffered duration from the master stream.
    fn update_buffered_duration(&self) {
        let has_audio = self.state.lock().has_audio();
        let buffered = if has_audio {
            self.audio_decoder().map_or(0.0, |a| a.duration())
        } else {
            self.video_decoder().map_or(0.0, |v| v.duration())
        };
        let buffered = if buffered <= EMPTY_EPSILON { 0.0 } else { buffered };

        let mut st = self.state.lock();
        if !st.prepared || st.state.is_final() {
            return;
        }
        if buffered != st.buffered_duration {
            st.buffered_duration = buffered;
            self.emit(PlayerEvent::BufferedDurationChanged(buffered));
            self.update_playable_time(&mut st);
        }
        if buffered <= 0.0 && st.end_of_file && !st.finished && !st.seeking {
            tracing::info!("Playback finished");
            st.finished = true;
            self.emit(PlayerEvent::PlaybackFinished);
        }
        self.check_buffering_locked(&mut st);
        self.transition(&mut st);
    }

    fn check_buffering(&self) {
        let mut st = self.state.lock();
        self.check_buffering_locked(&mut st);
        self.transition(&mut st);
    }

    fn check_buffering_locked(&self, st: &mut PlaybackState) {
        if !st.prepared || st.seeking {
            return;
        }
        let next = BufferingPolicy::new(st.min_buffered).next(
            st.buffering,
            st.buffered_duration,
            st.end_of_file,
        );
        self.set_buffering(st, next);
    }

    fn set_buffering(&self, st: &mut PlaybackState, buffering: bool) {
        if st.buffering == buffering {
            return;
        }
        if buffering && st.state == PlayerState::Playing {
            self.metrics.record_underrun();
        }
        st.buffering = buffering;
        tracing::debug!(
            "Buffering {} at {:.3}s buffered",
            if buffering { "started" } else { "finished" },
            st.buffered_duration
        );
        self.emit(PlayerEvent::BufferingChanged(buffering));
    }

    fn set_progress(&self, st: &mut PlaybackState, progress: f64) {
        if progress == st.progress {
            return;
        }
        st.progress = progress;
        let now = Instant::now();
        let due = st
            .last_progress_event
            .map_or(true, |at| now.duration_since(at) >= self.config.progress_interval);
        if progress <= EMPTY_EPSILON || (progress - st.duration()).abs() <= EMPTY_EPSILON || due {
            st.last_progress_event = Some(now);
            self.emit(PlayerEvent::ProgressChanged(progress));
        }
        self.update_playable_time(st);
    }

    fn update_playable_time(&self, st: &mut PlaybackState) {
        let duration = st.duration();
        let playable = (st.progress + st.buffered_duration).clamp(0.0, duration.max(0.0));
        if (playable - st.playable_time).abs() > EMPTY_EPSILON {
            st.playable_time = playable;
            self.emit(PlayerEvent::PlayableTimeChanged(playable));
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("Closing player");
        self.interrupt.trigger();
        self.destroy_decoders();

        let handles = std::mem::take(&mut self.workers.lock().handles);
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("Player worker panicked");
            }
        }
        // The open thread may have installed decoders after the first pass
        self.destroy_decoders();
        self.clear_current_frames();

        {
            let mut st = self.state.lock();
            st.reset();
            if self.failed.load(Ordering::Acquire) {
                st.state = PlayerState::Closed;
            } else {
                self.set_state(&mut st, PlayerState::Closed);
            }
        }
        if let Some(mut format) = self.format.lock().take() {
            format.close();
        }
        self.audio_handle.set_available(false);
    }
}
