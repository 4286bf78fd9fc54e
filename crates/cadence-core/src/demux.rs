//! Container demuxing.
//!
//! [`FormatContext`] opens a media container through a [`MediaBackend`],
//! classifies its streams into video and audio [`Track`]s, opens one codec
//! per selected stream and then hands out compressed packets to the read
//! loop. Seeking is backward biased (to the keyframe at or before the target)
//! and does not touch any queue; flushing is the player's job.
//!
//! Long-blocking I/O (network reads, probing) polls an [`InterruptFlag`] so
//! that closing the player aborts it promptly.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::codec::{AudioCodec, CodecId, VideoCodec};
use crate::error::{DecodeError, ErrorKind, Result};
use crate::frame::MediaType;

/// Timebase used when a video stream reports none (seconds per tick).
pub const DEFAULT_VIDEO_TIME_BASE: f64 = 0.000_04;

/// Timebase used when an audio stream reports none (seconds per tick).
pub const DEFAULT_AUDIO_TIME_BASE: f64 = 0.000_025;

/// Duration reported for containers that do not know their length.
pub const UNKNOWN_DURATION: f64 = f32::MAX as f64;

/// A compressed, timestamped chunk of one elementary stream.
#[derive(Debug, Clone)]
pub struct CompressedPacket {
    /// Index of the stream this packet belongs to
    pub stream_index: usize,
    /// Compressed payload
    pub data: Bytes,
    /// Presentation timestamp in stream timebase units
    pub pts: Option<i64>,
    /// Decode timestamp in stream timebase units
    pub dts: Option<i64>,
    /// Duration in stream timebase units (0 = unknown)
    pub duration: i64,
}

impl CompressedPacket {
    /// Payload size in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Kind of an elementary stream as reported by the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Video,
    Audio,
    Subtitle,
    Data,
}

/// Container-level description of one elementary stream.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub index: usize,
    pub kind: StreamKind,
    pub codec: CodecId,
    /// Timebase as (numerator, denominator); a zero denominator means unknown
    pub time_base: (i32, i32),
    /// Average frame rate (video)
    pub avg_frame_rate: (i32, i32),
    /// Real base frame rate (video)
    pub real_frame_rate: (i32, i32),
    /// Sample aspect ratio (video)
    pub sample_aspect_ratio: (i32, i32),
    pub width: u32,
    pub height: u32,
    pub sample_rate: u32,
    pub channels: u16,
    /// Cover art and similar single-picture pseudo streams
    pub attached_picture: bool,
    pub metadata: HashMap<String, String>,
}

impl StreamInfo {
    /// A stream description with everything unknown.
    pub fn new(index: usize, kind: StreamKind, codec: CodecId) -> Self {
        Self {
            index,
            kind,
            codec,
            time_base: (0, 0),
            avg_frame_rate: (0, 0),
            real_frame_rate: (0, 0),
            sample_aspect_ratio: (0, 0),
            width: 0,
            height: 0,
            sample_rate: 0,
            channels: 0,
            attached_picture: false,
            metadata: HashMap::new(),
        }
    }

    /// Timebase in seconds per tick, or `default` when the stream has none.
    pub fn time_base_or(&self, default: f64) -> f64 {
        let tb = rational_to_f64(self.time_base);
        if tb > 0.0 {
            tb
        } else {
            default
        }
    }

    /// Frames per second: average rate, then real base rate, then `1 / time_base`.
    pub fn fps(&self, time_base: f64) -> f64 {
        let avg = rational_to_f64(self.avg_frame_rate);
        if avg > 0.0 {
            return avg;
        }
        let real = rational_to_f64(self.real_frame_rate);
        if real > 0.0 {
            return real;
        }
        if time_base > 0.0 {
            1.0 / time_base
        } else {
            0.0
        }
    }
}

/// Converts a (numerator, denominator) pair to a float, 0 when undefined.
pub fn rational_to_f64((num, den): (i32, i32)) -> f64 {
    if den == 0 || num == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

/// Descriptive metadata of a track, parsed from the stream's tags.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackMetadata {
    /// ISO language code (`language` tag)
    pub language: String,
    /// Bits per second (`BPS` tag)
    pub bit_rate: u64,
    /// Duration as written by the muxer (`DURATION` tag)
    pub duration: String,
    /// Payload size (`NUMBER_OF_BYTES` tag)
    pub number_of_bytes: u64,
    /// Frame count (`NUMBER_OF_FRAMES` tag)
    pub number_of_frames: u64,
}

impl TrackMetadata {
    /// Parses the recognized tags; `None` when the stream has no tags at all.
    pub fn from_tags(tags: &HashMap<String, String>) -> Option<Self> {
        if tags.is_empty() {
            return None;
        }
        let number = |key: &str| {
            tags.get(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(0)
        };
        Some(Self {
            language: tags.get("language").cloned().unwrap_or_default(),
            bit_rate: number("BPS"),
            duration: tags.get("DURATION").cloned().unwrap_or_default(),
            number_of_bytes: number("NUMBER_OF_BYTES"),
            number_of_frames: number("NUMBER_OF_FRAMES"),
        })
    }
}

/// A selectable audio or video stream of the opened container.
#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    /// Container stream index
    pub index: usize,
    pub media_type: MediaType,
    pub codec: CodecId,
    pub metadata: Option<TrackMetadata>,
}

/// Cancellation flag polled by blocking backend I/O.
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    /// Creates a cleared flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests that pending and future I/O abort.
    pub fn trigger(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Returns true once [`trigger`](Self::trigger) has been called.
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Entry point of a container/codec library.
pub trait MediaBackend: Send + Sync {
    /// Stable backend name, also the key for one-time initialization.
    fn name(&self) -> &'static str;

    /// Process-wide library setup. Runs once per backend name, see
    /// [`ensure_initialized`].
    fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// Opens and probes a container.
    fn open_input(&self, uri: &str, interrupt: InterruptFlag) -> Result<Box<dyn ContainerReader>>;
}

/// An opened container.
pub trait ContainerReader: Send {
    /// All elementary streams of the container.
    fn streams(&self) -> &[StreamInfo];

    /// Container duration in seconds, if known.
    fn duration(&self) -> Option<f64>;

    /// Overall bitrate in bits per second (0 = unknown).
    fn bit_rate(&self) -> u64;

    /// Container level tags.
    fn metadata(&self) -> &HashMap<String, String>;

    /// Reads the next packet of any stream; `Ok(None)` at end of stream.
    fn read_packet(&mut self) -> Result<Option<CompressedPacket>>;

    /// Seeks to the keyframe at or before `seconds`.
    fn seek(&mut self, seconds: f64) -> Result<()>;

    /// Opens a decoder for a video stream.
    fn open_video_codec(&mut self, stream_index: usize) -> Result<Box<dyn VideoCodec>>;

    /// Opens a decoder for an audio stream.
    fn open_audio_codec(&mut self, stream_index: usize) -> Result<Box<dyn AudioCodec>>;
}

fn initialized_backends() -> &'static Mutex<HashSet<&'static str>> {
    static INITIALIZED: OnceLock<Mutex<HashSet<&'static str>>> = OnceLock::new();
    INITIALIZED.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Runs the backend's one-time setup unless it already succeeded in this
/// process. A failed setup is retried on the next call.
pub fn ensure_initialized(backend: &dyn MediaBackend) -> Result<()> {
    let mut done = initialized_backends().lock();
    if done.contains(backend.name()) {
        return Ok(());
    }
    backend.initialize()?;
    tracing::info!("Initialized media backend {}", backend.name());
    done.insert(backend.name());
    Ok(())
}

/// Parameters of the opened video stream.
#[derive(Debug, Clone)]
pub struct VideoParams {
    pub track: Track,
    /// Seconds per tick
    pub time_base: f64,
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    /// Display aspect ratio (width / height, corrected by the sample aspect ratio)
    pub aspect: f64,
}

/// Parameters of the opened audio stream.
#[derive(Debug, Clone)]
pub struct AudioParams {
    pub track: Track,
    /// Seconds per tick
    pub time_base: f64,
    pub sample_rate: u32,
    pub channels: u16,
}

/// An opened container with its selected video and audio streams.
pub struct FormatContext {
    reader: Option<Box<dyn ContainerReader>>,
    uri: String,
    video_tracks: Vec<Track>,
    audio_tracks: Vec<Track>,
    video: Option<VideoParams>,
    audio: Option<AudioParams>,
    video_codec: Option<Box<dyn VideoCodec>>,
    audio_codec: Option<Box<dyn AudioCodec>>,
    video_error: Option<DecodeError>,
    audio_error: Option<DecodeError>,
    metadata: HashMap<String, String>,
    duration: f64,
    bit_rate_kbps: u64,
}

impl FormatContext {
    /// Opens `uri`, enumerates its tracks and opens the video and audio codecs.
    ///
    /// Fails only if neither a video nor an audio stream could be opened; a
    /// missing or broken track of one type is kept as a partial error.
    pub fn open(backend: &dyn MediaBackend, uri: &str, interrupt: InterruptFlag) -> Result<Self> {
        let reader = backend.open_input(uri, interrupt)?;

        let mut video_tracks = Vec::new();
        let mut audio_tracks = Vec::new();
        for stream in reader.streams() {
            let media_type = match stream.kind {
                StreamKind::Video => MediaType::Video,
                StreamKind::Audio => MediaType::Audio,
                StreamKind::Subtitle | StreamKind::Data => continue,
            };
            let track = Track {
                index: stream.index,
                media_type,
                codec: stream.codec,
                metadata: TrackMetadata::from_tags(&stream.metadata),
            };
            match media_type {
                MediaType::Video => video_tracks.push(track),
                MediaType::Audio => audio_tracks.push(track),
            }
        }

        let metadata = reader.metadata().clone();
        let duration = reader.duration().unwrap_or(UNKNOWN_DURATION);
        let bit_rate_kbps = reader.bit_rate() / 1000;

        let mut context = Self {
            reader: Some(reader),
            uri: uri.to_string(),
            video_tracks,
            audio_tracks,
            video: None,
            audio: None,
            video_codec: None,
            audio_codec: None,
            video_error: None,
            audio_error: None,
            metadata,
            duration,
            bit_rate_kbps,
        };

        if let Err(err) = context.open_video() {
            tracing::warn!("Video track unavailable for {}: {}", uri, err);
            context.video_error = Some(err);
        }
        let first_audio = context.audio_tracks.first().map(|t| t.index);
        let audio_result = match first_audio {
            Some(index) => context.open_audio(index),
            None => Err(DecodeError::stream_not_found("audio")),
        };
        if let Err(err) = audio_result {
            tracing::warn!("Audio track unavailable for {}: {}", uri, err);
            context.audio_error = Some(err);
        }

        if let (Some(video_err), Some(audio_err)) = (&context.video_error, &context.audio_error) {
            let err = if video_err.kind() == ErrorKind::StreamNotFound
                && audio_err.kind() != ErrorKind::StreamNotFound
            {
                audio_err.clone()
            } else {
                video_err.clone()
            };
            context.close();
            return Err(err);
        }

        tracing::info!(
            "Opened {}: duration={:.3}s, bitrate={}kbps, video={:?}, audio={:?}",
            uri,
            context.duration,
            context.bit_rate_kbps,
            context.video.as_ref().map(|v| v.track.index),
            context.audio.as_ref().map(|a| a.track.index),
        );
        Ok(context)
    }

    fn reader_mut(&mut self) -> Result<&mut Box<dyn ContainerReader>> {
        self.reader
            .as_mut()
            .ok_or_else(|| DecodeError::new(ErrorKind::FormatOpenInput, "format context closed"))
    }

    fn stream(&self, index: usize) -> Option<&StreamInfo> {
        self.reader
            .as_ref()?
            .streams()
            .iter()
            .find(|s| s.index == index)
    }

    /// Opens the first video track that is not an attached picture and opens.
    fn open_video(&mut self) -> Result<()> {
        let candidates: Vec<Track> = self
            .video_tracks
            .iter()
            .filter(|t| self.stream(t.index).is_some_and(|s| !s.attached_picture))
            .cloned()
            .collect();

        let mut last_error = DecodeError::stream_not_found("video");
        for track in candidates {
            let Some(stream) = self.stream(track.index).cloned() else {
                continue;
            };
            match self.reader_mut()?.open_video_codec(track.index) {
                Ok(codec) => {
                    let time_base = stream.time_base_or(DEFAULT_VIDEO_TIME_BASE);
                    let sar = rational_to_f64(stream.sample_aspect_ratio);
                    let aspect = if stream.height == 0 {
                        0.0
                    } else if sar > 0.0 {
                        stream.width as f64 / stream.height as f64 * sar
                    } else {
                        stream.width as f64 / stream.height as f64
                    };
                    self.video = Some(VideoParams {
                        track,
                        time_base,
                        fps: stream.fps(time_base),
                        width: stream.width,
                        height: stream.height,
                        aspect,
                    });
                    self.video_codec = Some(codec);
                    return Ok(());
                }
                Err(err) => {
                    tracing::debug!("Video stream {} failed to open: {}", track.index, err);
                    last_error = err;
                }
            }
        }
        Err(last_error)
    }

    fn open_audio(&mut self, index: usize) -> Result<()> {
        let Some(track) = self.audio_tracks.iter().find(|t| t.index == index).cloned() else {
            return Err(DecodeError::stream_not_found("audio"));
        };
        let Some(stream) = self.stream(index).cloned() else {
            return Err(DecodeError::stream_not_found("audio"));
        };
        let codec = self.reader_mut()?.open_audio_codec(index)?;
        self.audio = Some(AudioParams {
            track,
            time_base: stream.time_base_or(DEFAULT_AUDIO_TIME_BASE),
            sample_rate: stream.sample_rate,
            channels: stream.channels,
        });
        self.audio_codec = Some(codec);
        Ok(())
    }

    /// Reads the next packet; `Ok(None)` at end of stream or after close.
    pub fn read_packet(&mut self) -> Result<Option<CompressedPacket>> {
        match self.reader.as_mut() {
            Some(reader) => reader.read_packet(),
            None => Ok(None),
        }
    }

    /// Seeks the container to the keyframe at or before `seconds`.
    pub fn seek(&mut self, seconds: f64) -> Result<()> {
        let target = seconds.max(0.0);
        tracing::debug!("Demuxer seek to {:.3}s", target);
        self.reader_mut()?.seek(target)
    }

    /// Switches the active audio track.
    ///
    /// Returns `Ok(false)` without doing anything if `index` is already
    /// selected or is not an audio track. On success the new codec is
    /// available through [`take_audio_codec`](Self::take_audio_codec).
    pub fn select_audio_track(&mut self, index: usize) -> Result<bool> {
        let current = self.audio.as_ref().map(|a| a.track.index);
        if current == Some(index) || !self.audio_tracks.iter().any(|t| t.index == index) {
            return Ok(false);
        }
        let previous = self.audio.take();
        let previous_codec = self.audio_codec.take();
        match self.open_audio(index) {
            Ok(()) => {
                tracing::info!("Switched audio track {:?} -> {}", current, index);
                self.audio_error = None;
                Ok(true)
            }
            Err(err) => {
                self.audio = previous;
                self.audio_codec = previous_codec;
                Err(err)
            }
        }
    }

    /// Takes the opened video codec, leaving `None` behind.
    pub fn take_video_codec(&mut self) -> Option<Box<dyn VideoCodec>> {
        self.video_codec.take()
    }

    /// Takes the opened audio codec, leaving `None` behind.
    pub fn take_audio_codec(&mut self) -> Option<Box<dyn AudioCodec>> {
        self.audio_codec.take()
    }

    /// Releases the container and any codec not yet taken. Idempotent.
    pub fn close(&mut self) {
        self.video_codec = None;
        self.audio_codec = None;
        if self.reader.take().is_some() {
            tracing::debug!("Closed format context for {}", self.uri);
        }
    }

    /// Returns true once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.reader.is_none()
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn video_tracks(&self) -> &[Track] {
        &self.video_tracks
    }

    pub fn audio_tracks(&self) -> &[Track] {
        &self.audio_tracks
    }

    pub fn video(&self) -> Option<&VideoParams> {
        self.video.as_ref()
    }

    pub fn audio(&self) -> Option<&AudioParams> {
        self.audio.as_ref()
    }

    /// Why the video track is unavailable, if it is.
    pub fn video_error(&self) -> Option<&DecodeError> {
        self.video_error.as_ref()
    }

    /// Why the audio track is unavailable, if it is.
    pub fn audio_error(&self) -> Option<&DecodeError> {
        self.audio_error.as_ref()
    }

    /// Duration in seconds ([`UNKNOWN_DURATION`] when the container has none).
    pub fn duration(&self) -> f64 {
        self.duration
    }

    /// Overall bitrate in kbit/s.
    pub fn bit_rate_kbps(&self) -> u64 {
        self.bit_rate_kbps
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    /// Seeking is only meaningful for inputs with a positive duration.
    pub fn seek_enabled(&self) -> bool {
        self.duration > 0.0
    }
}

impl Drop for FormatContext {
    fn drop(&mut self) {
        self.close();
    }
}
