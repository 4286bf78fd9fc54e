//! Deterministic in-process media backend.
//!
//! `synthetic://` sources generate a moving gradient video stream and sine
//! audio streams on the fly, with no files, codec libraries or devices
//! involved. Every knob of the real pipeline that matters to the player can
//! be exercised: packet sizes, decode-order reordering, unknown durations,
//! attached pictures, hardware sessions and failure injection at each stage.
//!
//! A URI query overrides the backend configuration, e.g.
//! `synthetic://clip?duration=30&fps=30&audio=48000x2,44100x1&hardware=1`.

use std::collections::{HashMap, VecDeque};
use std::f32::consts::TAU;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::codec::{
    AudioCodec, CodecError, CodecId, FallbackReason, HardwareSession, Picture, PlaneRef,
    SampleBlock, VideoCodec,
};
use crate::demux::{
    CompressedPacket, ContainerReader, InterruptFlag, MediaBackend, StreamInfo, StreamKind,
};
use crate::error::{DecodeError, ErrorKind, Result};
use crate::frame::PixelFormat;

/// URI scheme handled by [`SyntheticBackend`].
pub const SCHEME: &str = "synthetic://";

/// Video timestamps tick at 90 kHz like MPEG transport streams.
const VIDEO_CLOCK: i32 = 90_000;

/// Sample frames per audio packet.
const AUDIO_BLOCK_FRAMES: u64 = 1024;

/// Payload bytes of every audio packet.
const AUDIO_PACKET_BYTES: usize = 256;

/// Payloads start with the little-endian frame or block index.
const INDEX_BYTES: usize = 8;

/// Shape of the generated video stream.
#[derive(Debug, Clone)]
pub struct SyntheticVideo {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Keyframe interval in frames
    pub gop: u32,
    pub codec: CodecId,
    /// Emit packets in decode order (pairs of frames swapped within a GOP)
    pub reorder: bool,
}

impl Default for SyntheticVideo {
    fn default() -> Self {
        Self {
            width: 64,
            height: 36,
            fps: 25,
            gop: 25,
            codec: CodecId::H264,
            reorder: false,
        }
    }
}

/// Shape of one generated audio stream.
#[derive(Debug, Clone)]
pub struct SyntheticAudio {
    pub sample_rate: u32,
    pub channels: u16,
    pub codec: CodecId,
    pub language: Option<String>,
    /// Tone frequency in Hz
    pub frequency: f32,
}

impl SyntheticAudio {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            codec: CodecId::Aac,
            language: None,
            frequency: 440.0,
        }
    }

    pub fn with_language(mut self, language: &str) -> Self {
        self.language = Some(language.to_string());
        self
    }
}

/// A failure to inject into a synthetic source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyntheticFailure {
    /// Opening the input fails
    OpenInput,
    /// Probing stream information fails
    FindStreamInfo,
    /// Opening any video decoder fails
    VideoCodecOpen,
    /// Opening any audio decoder fails
    AudioCodecOpen,
    /// The hardware device cannot be opened
    HardwareDevice,
    /// The hardware session errors after this many packets
    HardwareDecode { after_packets: u64 },
    /// The software video decoder rejects packets after this many
    VideoDecode { after_packets: u64 },
    /// The audio decoder rejects packets after this many
    AudioDecode { after_packets: u64 },
    /// Reading fails after this many packets
    Read { after_packets: u64 },
}

/// Configuration of a [`SyntheticBackend`].
#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    /// Stream length in seconds; `None` for an endless source of unknown length
    pub duration: Option<f64>,
    pub video: Option<SyntheticVideo>,
    pub audio: Vec<SyntheticAudio>,
    /// Add a cover-art stream ahead of the real video stream
    pub attached_picture: bool,
    /// Offer a hardware decode session for hardware-decodable codecs
    pub hardware: bool,
    /// Payload bytes of every video packet
    pub packet_bytes: usize,
    /// Whether packets carry their duration
    pub known_packet_durations: bool,
    /// Delay before each packet read, simulating a slow source
    pub read_delay: Duration,
    pub failures: Vec<SyntheticFailure>,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            duration: Some(10.0),
            video: Some(SyntheticVideo::default()),
            audio: Vec::new(),
            attached_picture: false,
            hardware: false,
            packet_bytes: 512,
            known_packet_durations: true,
            read_delay: Duration::ZERO,
            failures: Vec::new(),
        }
    }
}

impl SyntheticConfig {
    /// A source without a video stream; add tracks with [`with_audio`](Self::with_audio).
    pub fn audio_only() -> Self {
        Self {
            video: None,
            ..Self::default()
        }
    }

    pub fn with_duration(mut self, seconds: f64) -> Self {
        self.duration = Some(seconds);
        self
    }

    pub fn with_unknown_duration(mut self) -> Self {
        self.duration = None;
        self
    }

    pub fn with_video(mut self, video: SyntheticVideo) -> Self {
        self.video = Some(video);
        self
    }

    pub fn with_audio(mut self, audio: SyntheticAudio) -> Self {
        self.audio.push(audio);
        self
    }

    pub fn with_attached_picture(mut self) -> Self {
        self.attached_picture = true;
        self
    }

    pub fn with_hardware(mut self) -> Self {
        self.hardware = true;
        self
    }

    pub fn with_packet_bytes(mut self, bytes: usize) -> Self {
        self.packet_bytes = bytes;
        self
    }

    pub fn with_unknown_packet_durations(mut self) -> Self {
        self.known_packet_durations = false;
        self
    }

    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = delay;
        self
    }

    pub fn with_failure(mut self, failure: SyntheticFailure) -> Self {
        self.failures.push(failure);
        self
    }

    fn fails(&self, failure: SyntheticFailure) -> bool {
        self.failures.contains(&failure)
    }

    /// Packet count after which the matching failure triggers, if configured.
    fn failure_threshold(&self, pick: impl Fn(&SyntheticFailure) -> Option<u64>) -> Option<u64> {
        self.failures.iter().find_map(pick)
    }

    /// Applies `key=value` overrides from a URI query string.
    fn apply_query(&mut self, query: &str) {
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let flag = matches!(value, "1" | "true" | "yes");
            match key {
                "duration" if value == "live" => self.duration = None,
                "duration" => {
                    if let Ok(seconds) = value.parse() {
                        self.duration = Some(seconds);
                    }
                }
                "video" if value == "0" || value == "none" => self.video = None,
                "fps" | "width" | "height" | "gop" | "reorder" => {
                    let video = self.video.get_or_insert_with(SyntheticVideo::default);
                    let number = value.parse::<u32>().ok().filter(|n| *n > 0);
                    match (key, number) {
                        ("fps", Some(n)) => video.fps = n,
                        ("width", Some(n)) => video.width = n,
                        ("height", Some(n)) => video.height = n,
                        ("gop", Some(n)) => video.gop = n,
                        ("reorder", _) => video.reorder = flag,
                        _ => tracing::warn!("Ignoring synthetic option {}={}", key, value),
                    }
                }
                "audio" => {
                    self.audio = value
                        .split(',')
                        .filter_map(|entry| {
                            let (rate, channels) = entry.split_once('x')?;
                            Some(SyntheticAudio::new(rate.parse().ok()?, channels.parse().ok()?))
                        })
                        .collect();
                }
                "hardware" => self.hardware = flag,
                "packet_bytes" => {
                    if let Ok(bytes) = value.parse() {
                        self.packet_bytes = bytes;
                    }
                }
                _ => tracing::warn!("Ignoring synthetic option {}={}", key, value),
            }
        }
    }
}

/// Counters shared between a [`SyntheticBackend`] and the sources it opened.
#[derive(Debug, Default)]
pub struct SyntheticStats {
    initializations: AtomicU64,
    opens: AtomicU64,
    packets_read: AtomicU64,
    seeks: AtomicU64,
    last_seek: Mutex<Option<f64>>,
}

impl SyntheticStats {
    /// Number of times the backend's one-time setup ran.
    pub fn initializations(&self) -> u64 {
        self.initializations.load(Ordering::Relaxed)
    }

    /// Number of sources opened.
    pub fn opens(&self) -> u64 {
        self.opens.load(Ordering::Relaxed)
    }

    /// Packets handed out across all sources.
    pub fn packets_read(&self) -> u64 {
        self.packets_read.load(Ordering::Relaxed)
    }

    /// Seeks performed across all sources.
    pub fn seeks(&self) -> u64 {
        self.seeks.load(Ordering::Relaxed)
    }

    /// Target of the most recent seek in seconds.
    pub fn last_seek(&self) -> Option<f64> {
        *self.last_seek.lock()
    }
}

/// Backend producing `synthetic://` sources.
pub struct SyntheticBackend {
    config: SyntheticConfig,
    stats: Arc<SyntheticStats>,
}

impl SyntheticBackend {
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            config,
            stats: Arc::new(SyntheticStats::default()),
        }
    }

    /// Statistics handle, valid for the backend's lifetime and beyond.
    pub fn stats(&self) -> Arc<SyntheticStats> {
        Arc::clone(&self.stats)
    }
}

impl MediaBackend for SyntheticBackend {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn initialize(&self) -> Result<()> {
        self.stats.initializations.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn open_input(&self, uri: &str, interrupt: InterruptFlag) -> Result<Box<dyn ContainerReader>> {
        let Some(rest) = uri.strip_prefix(SCHEME) else {
            return Err(DecodeError::new(
                ErrorKind::FormatOpenInput,
                format!("unsupported uri {uri}"),
            ));
        };
        let mut config = self.config.clone();
        if let Some((_, query)) = rest.split_once('?') {
            config.apply_query(query);
        }

        if interrupt.is_set() {
            return Err(DecodeError::new(ErrorKind::FormatOpenInput, "interrupted"));
        }
        if config.fails(SyntheticFailure::OpenInput) {
            return Err(DecodeError::new(
                ErrorKind::FormatOpenInput,
                format!("cannot open {uri}"),
            ));
        }
        if config.fails(SyntheticFailure::FindStreamInfo) {
            return Err(DecodeError::new(
                ErrorKind::FormatFindStreamInfo,
                "no stream information",
            ));
        }

        self.stats.opens.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Opened synthetic source {}", uri);
        Ok(Box::new(SyntheticReader::new(
            config,
            Arc::clone(&self.stats),
            interrupt,
        )))
    }
}

/// Maps a decode-order frame index to its presentation index.
///
/// With reordering, frames `(1, 2)`, `(3, 4)`, ... of each GOP swap places;
/// keyframes and a trailing unpaired frame stay put.
fn presentation_index(decode_index: u64, gop: u64, total: Option<u64>, reorder: bool) -> u64 {
    if !reorder || gop < 3 {
        return decode_index;
    }
    let local = decode_index % gop;
    let partner = if local == 0 {
        decode_index
    } else if local % 2 == 1 {
        if local + 1 < gop {
            decode_index + 1
        } else {
            decode_index
        }
    } else {
        decode_index - 1
    };
    match total {
        // An odd frame whose partner lies past the end keeps its slot
        Some(total) if partner >= total => decode_index,
        _ => partner,
    }
}

fn payload(index: u64, len: usize) -> Bytes {
    let mut data = vec![0u8; len.max(INDEX_BYTES)];
    data[..INDEX_BYTES].copy_from_slice(&index.to_le_bytes());
    Bytes::from(data)
}

fn payload_index(data: &[u8]) -> Option<u64> {
    let bytes: [u8; INDEX_BYTES] = data.get(..INDEX_BYTES)?.try_into().ok()?;
    Some(u64::from_le_bytes(bytes))
}

struct AudioCursor {
    stream_index: usize,
    sample_rate: u32,
    next_block: u64,
    total_blocks: Option<u64>,
}

impl AudioCursor {
    fn next_time(&self) -> Option<f64> {
        if self.total_blocks.is_some_and(|total| self.next_block >= total) {
            return None;
        }
        Some((self.next_block * AUDIO_BLOCK_FRAMES) as f64 / self.sample_rate as f64)
    }
}

struct SyntheticReader {
    config: SyntheticConfig,
    streams: Vec<StreamInfo>,
    metadata: HashMap<String, String>,
    stats: Arc<SyntheticStats>,
    interrupt: InterruptFlag,
    video_stream: Option<usize>,
    /// Next video frame in decode order
    video_cursor: u64,
    video_frames: Option<u64>,
    audio: Vec<AudioCursor>,
    packets_read: u64,
}

impl SyntheticReader {
    fn new(config: SyntheticConfig, stats: Arc<SyntheticStats>, interrupt: InterruptFlag) -> Self {
        let mut streams = Vec::new();

        if config.attached_picture {
            let mut cover = StreamInfo::new(streams.len(), StreamKind::Video, CodecId::Unknown);
            cover.attached_picture = true;
            cover.width = 16;
            cover.height = 16;
            streams.push(cover);
        }

        let mut video_stream = None;
        let mut video_frames = None;
        if let Some(video) = &config.video {
            let mut info = StreamInfo::new(streams.len(), StreamKind::Video, video.codec);
            info.time_base = (1, VIDEO_CLOCK);
            info.avg_frame_rate = (video.fps as i32, 1);
            info.real_frame_rate = (video.fps as i32, 1);
            info.sample_aspect_ratio = (1, 1);
            info.width = video.width;
            info.height = video.height;
            video_frames = config
                .duration
                .map(|d| (d.max(0.0) * video.fps as f64).ceil() as u64);
            video_stream = Some(info.index);
            streams.push(info);
        }

        // Subtitle streams are skipped by the demuxer; keep one around
        streams.push(StreamInfo::new(
            streams.len(),
            StreamKind::Subtitle,
            CodecId::Unknown,
        ));

        let mut audio = Vec::new();
        for track in &config.audio {
            let mut info = StreamInfo::new(streams.len(), StreamKind::Audio, track.codec);
            info.time_base = (1, track.sample_rate as i32);
            info.sample_rate = track.sample_rate;
            info.channels = track.channels;
            if let Some(language) = &track.language {
                info.metadata.insert("language".to_string(), language.clone());
            }
            audio.push(AudioCursor {
                stream_index: info.index,
                sample_rate: track.sample_rate.max(1),
                next_block: 0,
                total_blocks: config.duration.map(|d| {
                    (d.max(0.0) * track.sample_rate as f64 / AUDIO_BLOCK_FRAMES as f64).ceil()
                        as u64
                }),
            });
            streams.push(info);
        }

        let mut metadata = HashMap::new();
        metadata.insert("title".to_string(), "synthetic".to_string());
        metadata.insert("encoder".to_string(), "cadence".to_string());

        Self {
            config,
            streams,
            metadata,
            stats,
            interrupt,
            video_stream,
            video_cursor: 0,
            video_frames,
            audio,
            packets_read: 0,
        }
    }

    fn video(&self) -> Option<&SyntheticVideo> {
        self.config.video.as_ref()
    }

    fn ticks_per_frame(&self) -> i64 {
        let fps = self.video().map_or(25, |v| v.fps.max(1));
        i64::from(VIDEO_CLOCK) / i64::from(fps)
    }

    fn next_video_time(&self) -> Option<f64> {
        let video = self.video()?;
        if self.video_frames.is_some_and(|total| self.video_cursor >= total) {
            return None;
        }
        Some(self.video_cursor as f64 / video.fps.max(1) as f64)
    }

    fn next_video_packet(&mut self, stream_index: usize) -> Option<CompressedPacket> {
        let (gop, reorder) = self.video().map(|v| (u64::from(v.gop.max(1)), v.reorder))?;
        let ticks = self.ticks_per_frame();
        let decode_index = self.video_cursor;
        let shown = presentation_index(decode_index, gop, self.video_frames, reorder);
        self.video_cursor += 1;
        Some(CompressedPacket {
            stream_index,
            data: payload(shown, self.config.packet_bytes),
            pts: Some(shown as i64 * ticks),
            dts: Some(decode_index as i64 * ticks),
            duration: if self.config.known_packet_durations {
                ticks
            } else {
                0
            },
        })
    }

    fn next_audio_packet(&mut self, track: usize) -> Option<CompressedPacket> {
        let known = self.config.known_packet_durations;
        let cursor = self.audio.get_mut(track)?;
        let block = cursor.next_block;
        cursor.next_block += 1;
        let pts = (block * AUDIO_BLOCK_FRAMES) as i64;
        Some(CompressedPacket {
            stream_index: cursor.stream_index,
            data: payload(block, AUDIO_PACKET_BYTES),
            pts: Some(pts),
            dts: Some(pts),
            duration: if known { AUDIO_BLOCK_FRAMES as i64 } else { 0 },
        })
    }
}

impl ContainerReader for SyntheticReader {
    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn duration(&self) -> Option<f64> {
        self.config.duration
    }

    fn bit_rate(&self) -> u64 {
        let video = self
            .video()
            .map_or(0, |v| (self.config.packet_bytes * 8) as u64 * u64::from(v.fps));
        let audio: u64 = self
            .audio
            .iter()
            .map(|a| (AUDIO_PACKET_BYTES * 8) as u64 * u64::from(a.sample_rate) / AUDIO_BLOCK_FRAMES)
            .sum();
        video + audio
    }

    fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    fn read_packet(&mut self) -> Result<Option<CompressedPacket>> {
        if self.interrupt.is_set() {
            return Ok(None);
        }
        if !self.config.read_delay.is_zero() {
            std::thread::sleep(self.config.read_delay);
        }
        let read_limit = self.config.failure_threshold(|f| match f {
            SyntheticFailure::Read { after_packets } => Some(*after_packets),
            _ => None,
        });
        if read_limit.is_some_and(|limit| self.packets_read >= limit) {
            return Err(DecodeError::new(
                ErrorKind::FormatOpenInput,
                "connection reset while reading",
            ));
        }

        // Interleave by timestamp, video first on ties
        let mut next: Option<(f64, Option<usize>)> =
            self.next_video_time().map(|t| (t, None));
        for (track, cursor) in self.audio.iter().enumerate() {
            if let Some(t) = cursor.next_time() {
                if next.map_or(true, |(best, _)| t < best) {
                    next = Some((t, Some(track)));
                }
            }
        }

        let packet = match next {
            None => return Ok(None),
            Some((_, None)) => {
                let Some(stream_index) = self.video_stream else {
                    return Ok(None);
                };
                self.next_video_packet(stream_index)
            }
            Some((_, Some(track))) => self.next_audio_packet(track),
        };

        if let Some(packet) = &packet {
            self.packets_read += 1;
            self.stats.packets_read.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(
                stream = packet.stream_index,
                pts = packet.pts,
                "synthetic packet"
            );
        }
        Ok(packet)
    }

    fn seek(&mut self, seconds: f64) -> Result<()> {
        self.stats.seeks.fetch_add(1, Ordering::Relaxed);
        *self.stats.last_seek.lock() = Some(seconds);

        let target = seconds.max(0.0);
        let mut resume_at = target;
        if let Some((fps, gop)) = self.video().map(|v| (v.fps.max(1), u64::from(v.gop.max(1)))) {
            let mut frame = (target * fps as f64).floor() as u64;
            if let Some(total) = self.video_frames {
                frame = frame.min(total);
            }
            let keyframe = frame - frame % gop;
            self.video_cursor = keyframe;
            resume_at = keyframe as f64 / fps as f64;
        }
        for cursor in &mut self.audio {
            let mut block =
                (resume_at * cursor.sample_rate as f64 / AUDIO_BLOCK_FRAMES as f64).floor() as u64;
            if let Some(total) = cursor.total_blocks {
                block = block.min(total);
            }
            cursor.next_block = block;
        }
        tracing::debug!("Synthetic seek to {:.3}s resumes at {:.3}s", target, resume_at);
        Ok(())
    }

    fn open_video_codec(&mut self, stream_index: usize) -> Result<Box<dyn VideoCodec>> {
        if self.config.fails(SyntheticFailure::VideoCodecOpen) {
            return Err(DecodeError::new(
                ErrorKind::CodecOpen,
                format!("video decoder for stream {stream_index} failed to open"),
            ));
        }
        let Some(video) = self.video().cloned().filter(|_| Some(stream_index) == self.video_stream)
        else {
            return Err(DecodeError::new(
                ErrorKind::CodecFindDecoder,
                format!("no decoder for stream {stream_index}"),
            ));
        };
        Ok(Box::new(SyntheticVideoCodec::new(video, &self.config)))
    }

    fn open_audio_codec(&mut self, stream_index: usize) -> Result<Box<dyn AudioCodec>> {
        if self.config.fails(SyntheticFailure::AudioCodecOpen) {
            return Err(DecodeError::new(
                ErrorKind::CodecOpen,
                format!("audio decoder for stream {stream_index} failed to open"),
            ));
        }
        let track = self
            .audio
            .iter()
            .position(|c| c.stream_index == stream_index)
            .and_then(|i| self.config.audio.get(i))
            .cloned();
        let Some(track) = track else {
            return Err(DecodeError::new(
                ErrorKind::CodecFindDecoder,
                format!("no decoder for stream {stream_index}"),
            ));
        };
        let limit = self.config.failure_threshold(|f| match f {
            SyntheticFailure::AudioDecode { after_packets } => Some(*after_packets),
            _ => None,
        });
        Ok(Box::new(SyntheticAudioCodec::new(track, limit)))
    }
}

struct PendingPicture {
    index: u64,
    pts: Option<i64>,
    duration: i64,
}

/// Renders a moving diagonal gradient for frame `index`.
struct PictureRenderer {
    width: u32,
    height: u32,
    planes: [Vec<u8>; 3],
    strides: [usize; 3],
}

impl PictureRenderer {
    fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            planes: Default::default(),
            strides: [0; 3],
        }
    }

    fn render(&mut self, index: u64, format: PixelFormat) -> Picture<'_> {
        let (w, h) = (self.width as usize, self.height as usize);
        let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
        let shift = (index * 4) as usize;

        self.strides[0] = w;
        self.planes[0].clear();
        self.planes[0].extend((0..h).flat_map(|y| (0..w).map(move |x| ((x + y + shift) & 0xff) as u8)));

        match format {
            PixelFormat::Nv12 => {
                self.strides[1] = cw * 2;
                self.planes[1].clear();
                self.planes[1].resize(cw * 2 * ch, 128);
                self.planes[2].clear();
            }
            _ => {
                for plane in 1..3 {
                    self.strides[plane] = cw;
                    self.planes[plane].clear();
                    self.planes[plane].resize(cw * ch, 128);
                }
            }
        }

        let planes = self
            .planes
            .iter()
            .zip(self.strides)
            .take(format.num_planes())
            .map(|(data, stride)| PlaneRef {
                data: data.as_slice(),
                stride,
            });
        Picture::new(self.width, self.height, format, planes)
    }
}

struct SyntheticVideoCodec {
    codec: CodecId,
    hardware: bool,
    device_fails: bool,
    hardware_limit: Option<u64>,
    decode_limit: Option<u64>,
    pending: VecDeque<PendingPicture>,
    sent: u64,
    renderer: PictureRenderer,
}

impl SyntheticVideoCodec {
    fn new(video: SyntheticVideo, config: &SyntheticConfig) -> Self {
        Self {
            codec: video.codec,
            hardware: config.hardware,
            device_fails: config.fails(SyntheticFailure::HardwareDevice),
            hardware_limit: config.failure_threshold(|f| match f {
                SyntheticFailure::HardwareDecode { after_packets } => Some(*after_packets),
                _ => None,
            }),
            decode_limit: config.failure_threshold(|f| match f {
                SyntheticFailure::VideoDecode { after_packets } => Some(*after_packets),
                _ => None,
            }),
            pending: VecDeque::new(),
            sent: 0,
            renderer: PictureRenderer::new(video.width, video.height),
        }
    }
}

fn queue_picture(
    pending: &mut VecDeque<PendingPicture>,
    packet: &CompressedPacket,
) -> std::result::Result<(), String> {
    let index = payload_index(&packet.data).ok_or_else(|| "truncated packet".to_string())?;
    pending.push_back(PendingPicture {
        index,
        pts: packet.pts,
        duration: packet.duration,
    });
    Ok(())
}

impl VideoCodec for SyntheticVideoCodec {
    fn codec_id(&self) -> CodecId {
        self.codec
    }

    fn send_packet(&mut self, packet: &CompressedPacket) -> std::result::Result<(), CodecError> {
        if self.decode_limit.is_some_and(|limit| self.sent >= limit) {
            return Err(CodecError::Failed("invalid data found when processing input".into()));
        }
        queue_picture(&mut self.pending, packet).map_err(CodecError::Failed)?;
        self.sent += 1;
        Ok(())
    }

    fn receive_frame(&mut self) -> std::result::Result<Picture<'_>, CodecError> {
        let Some(next) = self.pending.pop_front() else {
            return Err(CodecError::Again);
        };
        Ok(self
            .renderer
            .render(next.index, PixelFormat::Yuv420p)
            .with_timing(next.pts, next.duration))
    }

    fn flush(&mut self) {
        self.pending.clear();
    }

    fn create_hardware_session(
        &mut self,
    ) -> std::result::Result<Box<dyn HardwareSession>, FallbackReason> {
        if !self.hardware || !self.codec.hardware_decodable() {
            return Err(FallbackReason::UnsupportedCodec(self.codec));
        }
        if self.device_fails {
            return Err(FallbackReason::DeviceUnavailable(
                "synthetic accelerator busy".to_string(),
            ));
        }
        Ok(Box::new(SyntheticHardwareSession {
            limit: self.hardware_limit,
            pending: VecDeque::new(),
            sent: 0,
            renderer: PictureRenderer::new(self.renderer.width, self.renderer.height),
        }))
    }
}

struct SyntheticHardwareSession {
    limit: Option<u64>,
    pending: VecDeque<PendingPicture>,
    sent: u64,
    renderer: PictureRenderer,
}

impl HardwareSession for SyntheticHardwareSession {
    fn name(&self) -> &str {
        "synthetic-hw"
    }

    fn send_packet(&mut self, packet: &CompressedPacket) -> Result<()> {
        if self.limit.is_some_and(|limit| self.sent >= limit) {
            return Err(DecodeError::new(ErrorKind::CodecSendPacket, "device lost"));
        }
        queue_picture(&mut self.pending, packet)
            .map_err(|msg| DecodeError::new(ErrorKind::CodecSendPacket, msg))?;
        self.sent += 1;
        Ok(())
    }

    fn receive_frame(&mut self) -> Result<Option<Picture<'_>>> {
        let Some(next) = self.pending.pop_front() else {
            return Ok(None);
        };
        Ok(Some(
            self.renderer
                .render(next.index, PixelFormat::Nv12)
                .with_timing(next.pts, next.duration),
        ))
    }

    fn flush(&mut self) {
        self.pending.clear();
    }
}

struct SyntheticAudioCodec {
    track: SyntheticAudio,
    limit: Option<u64>,
    pending: VecDeque<(u64, i64)>,
    sent: u64,
    samples: Vec<f32>,
}

impl SyntheticAudioCodec {
    fn new(track: SyntheticAudio, limit: Option<u64>) -> Self {
        Self {
            track,
            limit,
            pending: VecDeque::new(),
            sent: 0,
            samples: Vec::new(),
        }
    }
}

impl AudioCodec for SyntheticAudioCodec {
    fn codec_id(&self) -> CodecId {
        self.track.codec
    }

    fn send_packet(&mut self, packet: &CompressedPacket) -> std::result::Result<(), CodecError> {
        if self.limit.is_some_and(|limit| self.sent >= limit) {
            return Err(CodecError::Failed("error while decoding audio frame".into()));
        }
        let block = payload_index(&packet.data)
            .ok_or_else(|| CodecError::Failed("truncated packet".into()))?;
        self.pending.push_back((block, packet.duration));
        self.sent += 1;
        Ok(())
    }

    fn receive_frame(&mut self) -> std::result::Result<SampleBlock<'_>, CodecError> {
        let Some((block, duration)) = self.pending.pop_front() else {
            return Err(CodecError::Again);
        };
        let rate = self.track.sample_rate.max(1) as f32;
        let channels = self.track.channels.max(1) as usize;
        let first = block * AUDIO_BLOCK_FRAMES;
        let step = TAU * self.track.frequency / rate;

        self.samples.clear();
        for n in 0..AUDIO_BLOCK_FRAMES {
            // Reduce the phase per frame so long streams stay precise
            let phase = ((first + n) as f32 * step) % TAU;
            let value = 0.25 * phase.sin();
            self.samples.extend(std::iter::repeat(value).take(channels));
        }

        Ok(SampleBlock {
            best_effort_timestamp: Some(first as i64),
            duration,
            sample_rate: self.track.sample_rate,
            channels: self.track.channels,
            samples: &self.samples,
        })
    }

    fn flush(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(config: SyntheticConfig, uri: &str) -> Box<dyn ContainerReader> {
        let backend = SyntheticBackend::new(config);
        let Ok(reader) = backend.open_input(uri, InterruptFlag::new()) else {
            panic!("Expected {uri} to open");
        };
        reader
    }

    fn drain(reader: &mut dyn ContainerReader) -> Vec<CompressedPacket> {
        let mut packets = Vec::new();
        while let Ok(Some(packet)) = reader.read_packet() {
            packets.push(packet);
        }
        packets
    }

    #[test]
    fn test_presentation_index_swaps_pairs_within_gop() {
        let order: Vec<u64> = (0..10).map(|d| presentation_index(d, 5, None, true)).collect();
        assert_eq!(order, vec![0, 2, 1, 4, 3, 5, 7, 6, 9, 8]);

        let mut sorted = order.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..10).collect::<Vec<_>>());

        // Trailing odd frame whose partner would be past the end
        assert_eq!(presentation_index(7, 5, Some(8), true), 7);
        assert_eq!(presentation_index(3, 5, None, false), 3);
    }

    #[test]
    fn test_packets_interleave_by_time_and_end() {
        let config = SyntheticConfig::default()
            .with_duration(1.0)
            .with_audio(SyntheticAudio::new(48_000, 2));
        let mut reader = open(config, "synthetic://interleave");
        let packets = drain(reader.as_mut());

        let video = packets.iter().filter(|p| p.stream_index == 0).count();
        let audio = packets.iter().filter(|p| p.stream_index == 2).count();
        assert_eq!(video, 25);
        assert_eq!(audio, 47);

        let seconds = |p: &CompressedPacket| {
            let dts = p.dts.unwrap_or(0) as f64;
            if p.stream_index == 0 {
                dts / 90_000.0
            } else {
                dts / 48_000.0
            }
        };
        assert!(packets.windows(2).all(|w| seconds(&w[0]) <= seconds(&w[1])));
    }

    #[test]
    fn test_reorder_emits_decode_order() {
        let video = SyntheticVideo {
            reorder: true,
            gop: 5,
            ..SyntheticVideo::default()
        };
        let config = SyntheticConfig::default().with_duration(0.4).with_video(video);
        let mut reader = open(config, "synthetic://reorder");
        let pts: Vec<i64> = drain(reader.as_mut())
            .iter()
            .filter_map(|p| p.pts)
            .map(|pts| pts / 3600)
            .collect();
        assert_eq!(pts, vec![0, 2, 1, 4, 3, 5, 7, 6, 9, 8]);
    }

    #[test]
    fn test_seek_lands_on_previous_keyframe() {
        let config = SyntheticConfig::default()
            .with_audio(SyntheticAudio::new(44_100, 1));
        let backend = SyntheticBackend::new(config);
        let stats = backend.stats();
        let Ok(mut reader) = backend.open_input("synthetic://seek", InterruptFlag::new()) else {
            panic!("Expected source to open");
        };

        assert!(reader.seek(3.7).is_ok());
        let packets = drain(reader.as_mut());
        let Some(video) = packets.iter().find(|p| p.stream_index == 0) else {
            panic!("Expected a video packet after seek");
        };
        assert_eq!(video.pts, Some(75 * 3600));
        let Some(audio) = packets.iter().find(|p| p.stream_index == 2) else {
            panic!("Expected an audio packet after seek");
        };
        let audio_time = audio.pts.unwrap_or(0) as f64 / 44_100.0;
        assert!(audio_time <= 3.0);
        assert!(audio_time > 2.9);
        assert_eq!(stats.seeks(), 1);
        assert_eq!(stats.last_seek(), Some(3.7));
    }

    #[test]
    fn test_query_overrides_config() {
        let mut reader = open(
            SyntheticConfig::default(),
            "synthetic://q?duration=2&fps=10&audio=8000x1,16000x2&width=32",
        );
        let streams = reader.streams();
        let Some(video) = streams.iter().find(|s| s.kind == StreamKind::Video) else {
            panic!("Expected video stream");
        };
        assert_eq!(video.avg_frame_rate, (10, 1));
        assert_eq!(video.width, 32);
        assert_eq!(streams.iter().filter(|s| s.kind == StreamKind::Audio).count(), 2);
        assert_eq!(reader.duration(), Some(2.0));

        let video_packets = drain(reader.as_mut())
            .iter()
            .filter(|p| p.stream_index == 0)
            .count();
        assert_eq!(video_packets, 20);
    }

    #[test]
    fn test_read_failure_after_packets() {
        let config = SyntheticConfig::default().with_failure(SyntheticFailure::Read {
            after_packets: 3,
        });
        let mut reader = open(config, "synthetic://flaky");
        for _ in 0..3 {
            assert!(matches!(reader.read_packet(), Ok(Some(_))));
        }
        assert!(reader.read_packet().is_err());
    }

    #[test]
    fn test_video_codec_renders_each_packet() {
        let mut reader = open(SyntheticConfig::default(), "synthetic://codec");
        let Ok(mut codec) = reader.open_video_codec(0) else {
            panic!("Expected video codec");
        };
        assert_eq!(codec.receive_frame().err(), Some(CodecError::Again));

        let Ok(Some(packet)) = reader.read_packet() else {
            panic!("Expected packet");
        };
        assert!(codec.send_packet(&packet).is_ok());
        let Ok(picture) = codec.receive_frame() else {
            panic!("Expected picture");
        };
        assert_eq!(picture.format, PixelFormat::Yuv420p);
        assert_eq!(picture.planes().len(), 3);
        assert_eq!(picture.planes()[0].data.len(), 64 * 36);
        assert_eq!(picture.planes()[1].stride, 32);
        assert_eq!(picture.best_effort_timestamp, Some(0));
    }

    #[test]
    fn test_hardware_session_availability() {
        let mut plain = open(SyntheticConfig::default(), "synthetic://sw");
        let Ok(mut codec) = plain.open_video_codec(0) else {
            panic!("Expected video codec");
        };
        assert!(matches!(
            codec.create_hardware_session(),
            Err(FallbackReason::UnsupportedCodec(CodecId::H264))
        ));

        let busy = SyntheticConfig::default()
            .with_hardware()
            .with_failure(SyntheticFailure::HardwareDevice);
        let mut reader = open(busy, "synthetic://busy");
        let Ok(mut codec) = reader.open_video_codec(0) else {
            panic!("Expected video codec");
        };
        assert!(matches!(
            codec.create_hardware_session(),
            Err(FallbackReason::DeviceUnavailable(_))
        ));

        let mut reader = open(SyntheticConfig::default().with_hardware(), "synthetic://hw");
        let Ok(mut codec) = reader.open_video_codec(0) else {
            panic!("Expected video codec");
        };
        let Ok(mut session) = codec.create_hardware_session() else {
            panic!("Expected hardware session");
        };
        let Ok(Some(packet)) = reader.read_packet() else {
            panic!("Expected packet");
        };
        assert!(session.send_packet(&packet).is_ok());
        let Ok(Some(picture)) = session.receive_frame() else {
            panic!("Expected hardware picture");
        };
        assert_eq!(picture.format, PixelFormat::Nv12);
        assert_eq!(picture.planes().len(), 2);
    }

    #[test]
    fn test_audio_codec_produces_tone_blocks() {
        let config = SyntheticConfig::audio_only().with_audio(SyntheticAudio::new(48_000, 2));
        let mut reader = open(config, "synthetic://tone");
        let Ok(mut codec) = reader.open_audio_codec(1) else {
            panic!("Expected audio codec");
        };
        let Ok(Some(packet)) = reader.read_packet() else {
            panic!("Expected packet");
        };
        assert!(codec.send_packet(&packet).is_ok());
        let Ok(block) = codec.receive_frame() else {
            panic!("Expected sample block");
        };
        assert_eq!(block.frame_count(), 1024);
        assert_eq!(block.channels, 2);
        assert!(block.samples.iter().all(|s| s.abs() <= 0.25 + 1e-6));
        assert!(block.samples.iter().any(|s| s.abs() > 0.1));
    }

    #[test]
    fn test_unsupported_scheme_rejected() {
        let backend = SyntheticBackend::new(SyntheticConfig::default());
        let Err(err) = backend.open_input("file:///tmp/x.mp4", InterruptFlag::new()) else {
            panic!("Expected rejection");
        };
        assert_eq!(err.kind(), ErrorKind::FormatOpenInput);
    }
}
