//! Codec abstraction.
//!
//! Decoders talk to a codec library through these traits so that the decode
//! loops, queues and player never depend on a particular library's API. A
//! backend (see [`crate::demux::MediaBackend`]) hands out boxed codecs for
//! the streams it demuxes.
//!
//! Decoded pictures and sample blocks borrow the codec's internal buffers;
//! the decoder copies them into pooled frame buffers before asking for the
//! next one.

use crate::demux::CompressedPacket;
use crate::error::{DecodeError, ErrorKind};
use crate::frame::PixelFormat;

/// Maximum number of planes a [`Picture`] can carry.
pub const MAX_PLANES: usize = 4;

/// Codec identifier for a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecId {
    H264,
    Hevc,
    Vp8,
    Vp9,
    Av1,
    Mpeg4,
    Aac,
    Mp3,
    Opus,
    Flac,
    Pcm,
    Unknown,
}

impl CodecId {
    /// Short codec name.
    pub fn name(&self) -> &'static str {
        match self {
            CodecId::H264 => "h264",
            CodecId::Hevc => "hevc",
            CodecId::Vp8 => "vp8",
            CodecId::Vp9 => "vp9",
            CodecId::Av1 => "av1",
            CodecId::Mpeg4 => "mpeg4",
            CodecId::Aac => "aac",
            CodecId::Mp3 => "mp3",
            CodecId::Opus => "opus",
            CodecId::Flac => "flac",
            CodecId::Pcm => "pcm",
            CodecId::Unknown => "unknown",
        }
    }

    /// Returns true if hardware decode sessions are attempted for this codec.
    pub fn hardware_decodable(&self) -> bool {
        matches!(
            self,
            CodecId::H264 | CodecId::Hevc | CodecId::Vp9 | CodecId::Av1
        )
    }
}

impl std::fmt::Display for CodecId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome of a codec send/receive call that did not produce data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The codec needs more input (receive) or must be drained first (send)
    Again,
    /// The codec is fully drained
    EndOfStream,
    /// Any other failure
    Failed(String),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::Again => write!(f, "resource temporarily unavailable"),
            CodecError::EndOfStream => write!(f, "end of stream"),
            CodecError::Failed(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for CodecError {}

/// Borrowed view of one pixel plane.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaneRef<'a> {
    /// Plane bytes, `stride * rows` long
    pub data: &'a [u8],
    /// Bytes per row
    pub stride: usize,
}

/// A decoded picture borrowed from the codec.
#[derive(Debug, Clone)]
pub struct Picture<'a> {
    /// Best-effort presentation timestamp in stream timebase units
    pub best_effort_timestamp: Option<i64>,
    /// Frame duration in stream timebase units (0 = unknown)
    pub duration: i64,
    /// Extra field repeats signalled by the bitstream
    pub repeat_pict: i32,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    planes: [PlaneRef<'a>; MAX_PLANES],
    plane_count: usize,
}

impl<'a> Picture<'a> {
    /// Creates a picture from up to [`MAX_PLANES`] planes; extra planes are ignored.
    pub fn new(
        width: u32,
        height: u32,
        format: PixelFormat,
        planes: impl IntoIterator<Item = PlaneRef<'a>>,
    ) -> Self {
        let mut stored = [PlaneRef::default(); MAX_PLANES];
        let mut plane_count = 0;
        for (slot, plane) in stored.iter_mut().zip(planes) {
            *slot = plane;
            plane_count += 1;
        }
        Self {
            best_effort_timestamp: None,
            duration: 0,
            repeat_pict: 0,
            width,
            height,
            format,
            planes: stored,
            plane_count,
        }
    }

    /// Sets the timing fields.
    pub fn with_timing(mut self, best_effort_timestamp: Option<i64>, duration: i64) -> Self {
        self.best_effort_timestamp = best_effort_timestamp;
        self.duration = duration;
        self
    }

    /// The picture's planes.
    pub fn planes(&self) -> &[PlaneRef<'a>] {
        &self.planes[..self.plane_count]
    }
}

/// A decoded block of interleaved f32 samples borrowed from the codec.
#[derive(Debug, Clone, Copy)]
pub struct SampleBlock<'a> {
    /// Best-effort presentation timestamp in stream timebase units
    pub best_effort_timestamp: Option<i64>,
    /// Block duration in stream timebase units (0 = unknown)
    pub duration: i64,
    pub sample_rate: u32,
    pub channels: u16,
    /// Interleaved samples at `sample_rate`/`channels`
    pub samples: &'a [f32],
}

impl SampleBlock<'_> {
    /// Number of sample frames in the block.
    pub fn frame_count(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / self.channels as usize
    }
}

/// A software video decoder for one stream.
pub trait VideoCodec: Send {
    /// The codec this decoder handles.
    fn codec_id(&self) -> CodecId;

    /// Feeds one compressed packet.
    fn send_packet(&mut self, packet: &CompressedPacket) -> Result<(), CodecError>;

    /// Pulls the next decoded picture.
    fn receive_frame(&mut self) -> Result<Picture<'_>, CodecError>;

    /// Drops all buffered state (after a seek).
    fn flush(&mut self);

    /// Tries to set up a hardware decode session for this stream.
    ///
    /// Called once when the video decoder is built. Backends without
    /// hardware support keep the default.
    fn create_hardware_session(&mut self) -> Result<Box<dyn HardwareSession>, FallbackReason> {
        Err(FallbackReason::UnsupportedCodec(self.codec_id()))
    }
}

/// An audio decoder for one stream.
pub trait AudioCodec: Send {
    /// The codec this decoder handles.
    fn codec_id(&self) -> CodecId;

    /// Feeds one compressed packet.
    fn send_packet(&mut self, packet: &CompressedPacket) -> Result<(), CodecError>;

    /// Pulls the next decoded sample block as interleaved f32 at the
    /// stream's native rate and channel count.
    fn receive_frame(&mut self) -> Result<SampleBlock<'_>, CodecError>;

    /// Drops all buffered state (after a seek).
    fn flush(&mut self);
}

/// A hardware-accelerated decode path for a video stream.
///
/// Pictures are delivered in CPU memory. Any error makes the video decoder
/// drop the session and continue in software.
pub trait HardwareSession: Send {
    /// Human readable name of the accelerator.
    fn name(&self) -> &str;

    /// Feeds one compressed packet.
    fn send_packet(&mut self, packet: &CompressedPacket) -> Result<(), DecodeError>;

    /// Pulls the next decoded picture, `None` when more input is needed.
    fn receive_frame(&mut self) -> Result<Option<Picture<'_>>, DecodeError>;

    /// Drops all buffered state (after a seek).
    fn flush(&mut self);
}

/// Why a hardware decode session is not used.
#[derive(Debug, Clone, PartialEq)]
pub enum FallbackReason {
    /// Hardware decoding is disabled in the configuration
    Disabled,
    /// No hardware path exists for this codec
    UnsupportedCodec(CodecId),
    /// The accelerator device could not be opened
    DeviceUnavailable(String),
    /// The session failed while decoding
    SessionFailed(String),
}

impl FallbackReason {
    /// Converts into the non-fatal error reported to the application.
    pub fn into_error(self) -> DecodeError {
        DecodeError::new(ErrorKind::HardwareSessionCreate, self.to_string())
    }
}

impl std::fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FallbackReason::Disabled => write!(f, "hardware decoding disabled"),
            FallbackReason::UnsupportedCodec(codec) => {
                write!(f, "no hardware decoder for {codec}")
            }
            FallbackReason::DeviceUnavailable(msg) => write!(f, "device unavailable: {msg}"),
            FallbackReason::SessionFailed(msg) => write!(f, "session failed: {msg}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_picture_keeps_at_most_max_planes() {
        let bytes = [0u8; 8];
        let planes = (0..6).map(|_| PlaneRef {
            data: &bytes,
            stride: 4,
        });
        let picture = Picture::new(4, 2, PixelFormat::Yuv420p, planes).with_timing(Some(9), 3);
        assert_eq!(picture.planes().len(), MAX_PLANES);
        assert_eq!(picture.best_effort_timestamp, Some(9));
        assert_eq!(picture.duration, 3);
    }

    #[test]
    fn test_fallback_reason_is_non_fatal() {
        let err = FallbackReason::UnsupportedCodec(CodecId::Vp8).into_error();
        assert_eq!(err.kind(), ErrorKind::HardwareSessionCreate);
        assert!(!err.is_fatal());
        assert!(err.message().contains("vp8"));
    }

    #[test]
    fn test_sample_block_frame_count() {
        let samples = [0.0f32; 12];
        let block = SampleBlock {
            best_effort_timestamp: None,
            duration: 0,
            sample_rate: 8_000,
            channels: 3,
            samples: &samples,
        };
        assert_eq!(block.frame_count(), 4);
    }
}
