//! FFmpeg container and codec backend (feature `ffmpeg`).
//!
//! Demuxing goes through `ffmpeg-next` with an interrupt callback wired to
//! the player's [`InterruptFlag`]. Video is decoded in software, or through
//! a hardware device context whose frames are transferred back to CPU
//! memory. Pictures in formats other than YUV 4:2:0 and NV12 are converted
//! to YUV 4:2:0 with swscale. Audio goes through swresample to packed f32 at
//! the stream's own rate and channel layout; rate and layout conversion to
//! the sink happens in [`crate::resampler`].
//!
//! # Requirements
//!
//! The FFmpeg 7 development libraries must be installed:
//! - **macOS**: `brew install ffmpeg`
//! - **Linux**: `apt install libavcodec-dev libavformat-dev libswscale-dev libavutil-dev`

use std::collections::HashMap;
use std::ptr;

use bytes::Bytes;
use ffmpeg_next as ffmpeg;
use ffmpeg_next::ffi;
use ffmpeg_next::software::resampling;

use crate::codec::{
    AudioCodec, CodecError, CodecId, FallbackReason, HardwareSession, Picture, PlaneRef,
    SampleBlock, VideoCodec,
};
use crate::demux::{
    CompressedPacket, ContainerReader, InterruptFlag, MediaBackend, StreamInfo, StreamKind,
};
use crate::error::{DecodeError, ErrorKind, Result};
use crate::frame::PixelFormat;

/// Microseconds per second, FFmpeg's `AV_TIME_BASE`.
const AV_TIME_BASE: f64 = 1_000_000.0;

/// The FFmpeg backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct FfmpegBackend;

impl FfmpegBackend {
    pub fn new() -> Self {
        Self
    }
}

impl MediaBackend for FfmpegBackend {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    fn initialize(&self) -> Result<()> {
        ffmpeg::init()
            .map_err(|e| DecodeError::new(ErrorKind::FormatCreate, format!("FFmpeg init failed: {e}")))
    }

    fn open_input(&self, uri: &str, interrupt: InterruptFlag) -> Result<Box<dyn ContainerReader>> {
        let input = ffmpeg::format::input_with_interrupt(&uri, move || interrupt.is_set())
            .map_err(|e| DecodeError::new(ErrorKind::FormatOpenInput, format!("{uri}: {e}")))?;

        let streams: Vec<StreamInfo> = input.streams().map(|s| stream_info(&s)).collect();
        if streams.is_empty() {
            return Err(DecodeError::new(
                ErrorKind::FormatFindStreamInfo,
                format!("{uri}: no streams"),
            ));
        }
        let duration = (input.duration() > 0).then(|| input.duration() as f64 / AV_TIME_BASE);
        let bit_rate = input.bit_rate().max(0) as u64;
        let metadata = dictionary(input.metadata().iter());
        tracing::info!(
            "FFmpeg opened {} ({} streams, duration {:?})",
            uri,
            streams.len(),
            duration
        );

        Ok(Box::new(FfmpegReader {
            input,
            streams,
            duration,
            bit_rate,
            metadata,
        }))
    }
}

fn dictionary<'a>(entries: impl Iterator<Item = (&'a str, &'a str)>) -> HashMap<String, String> {
    entries
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

fn rational(r: ffmpeg::Rational) -> (i32, i32) {
    (r.numerator(), r.denominator())
}

fn codec_id(id: ffmpeg::codec::Id) -> CodecId {
    use ffmpeg::codec::Id;
    match id {
        Id::H264 => CodecId::H264,
        Id::HEVC => CodecId::Hevc,
        Id::VP8 => CodecId::Vp8,
        Id::VP9 => CodecId::Vp9,
        Id::AV1 => CodecId::Av1,
        Id::MPEG4 => CodecId::Mpeg4,
        Id::AAC => CodecId::Aac,
        Id::MP3 => CodecId::Mp3,
        Id::OPUS => CodecId::Opus,
        Id::FLAC => CodecId::Flac,
        Id::PCM_S16LE | Id::PCM_S24LE | Id::PCM_S32LE | Id::PCM_F32LE => CodecId::Pcm,
        _ => CodecId::Unknown,
    }
}

fn stream_info(stream: &ffmpeg::Stream<'_>) -> StreamInfo {
    let parameters = stream.parameters();
    let kind = match parameters.medium() {
        ffmpeg::media::Type::Video => StreamKind::Video,
        ffmpeg::media::Type::Audio => StreamKind::Audio,
        ffmpeg::media::Type::Subtitle => StreamKind::Subtitle,
        _ => StreamKind::Data,
    };
    let mut info = StreamInfo::new(stream.index(), kind, codec_id(parameters.id()));
    info.time_base = rational(stream.time_base());
    info.avg_frame_rate = rational(stream.avg_frame_rate());
    info.real_frame_rate = rational(stream.rate());
    info.attached_picture = stream
        .disposition()
        .contains(ffmpeg::format::stream::Disposition::ATTACHED_PIC);
    info.metadata = dictionary(stream.metadata().iter());

    // SAFETY: the parameters pointer stays valid while `stream` borrows the input
    unsafe {
        let raw = &*parameters.as_ptr();
        info.width = raw.width.max(0) as u32;
        info.height = raw.height.max(0) as u32;
        info.sample_rate = raw.sample_rate.max(0) as u32;
        info.channels = raw.ch_layout.nb_channels.clamp(0, u16::MAX as i32) as u16;
        info.sample_aspect_ratio = (raw.sample_aspect_ratio.num, raw.sample_aspect_ratio.den);
    }
    info
}

fn codec_failure(stage: &str, err: ffmpeg::Error) -> CodecError {
    match err {
        ffmpeg::Error::Eof => CodecError::EndOfStream,
        ffmpeg::Error::Other { errno } if errno == ffmpeg::error::EAGAIN => CodecError::Again,
        other => CodecError::Failed(format!("{stage}: {other}")),
    }
}

fn to_ffmpeg_packet(packet: &CompressedPacket) -> ffmpeg::Packet {
    let mut out = ffmpeg::Packet::copy(&packet.data);
    out.set_pts(packet.pts);
    out.set_dts(packet.dts);
    out.set_duration(packet.duration);
    out
}

struct FfmpegReader {
    input: ffmpeg::format::context::Input,
    streams: Vec<StreamInfo>,
    duration: Option<f64>,
    bit_rate: u64,
    metadata: HashMap<String, String>,
}

// SAFETY: the input context is owned exclusively by the reader and only used
// from the thread currently holding the player's format lock.
unsafe impl Send for FfmpegReader {}

impl FfmpegReader {
    fn opened_decoder(&self, stream_index: usize) -> Result<ffmpeg::decoder::Decoder> {
        let Some(stream) = self.input.stream(stream_index) else {
            return Err(DecodeError::new(
                ErrorKind::StreamNotFound,
                format!("no stream {stream_index}"),
            ));
        };
        let context = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .map_err(|e| DecodeError::new(ErrorKind::CodecContextSetParam, e.to_string()))?;
        Ok(context.decoder())
    }
}

impl ContainerReader for FfmpegReader {
    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn duration(&self) -> Option<f64> {
        self.duration
    }

    fn bit_rate(&self) -> u64 {
        self.bit_rate
    }

    fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    fn read_packet(&mut self) -> Result<Option<CompressedPacket>> {
        let mut packet = ffmpeg::Packet::empty();
        match packet.read(&mut self.input) {
            Ok(()) => Ok(Some(CompressedPacket {
                stream_index: packet.stream(),
                data: Bytes::copy_from_slice(packet.data().unwrap_or(&[])),
                pts: packet.pts(),
                dts: packet.dts(),
                duration: packet.duration(),
            })),
            Err(ffmpeg::Error::Eof) => Ok(None),
            Err(err) => Err(DecodeError::new(ErrorKind::FormatOpenInput, err.to_string())),
        }
    }

    fn seek(&mut self, seconds: f64) -> Result<()> {
        let timestamp = (seconds.max(0.0) * AV_TIME_BASE) as i64;
        tracing::debug!("FFmpeg seek to {} (AV_TIME_BASE)", timestamp);
        self.input
            .seek(timestamp, ..timestamp)
            .map_err(|e| DecodeError::new(ErrorKind::FormatOpenInput, format!("seek failed: {e}")))
    }

    fn open_video_codec(&mut self, stream_index: usize) -> Result<Box<dyn VideoCodec>> {
        let Some(stream) = self.input.stream(stream_index) else {
            return Err(DecodeError::stream_not_found("video"));
        };
        // Owned copy, it outlives the reader
        let parameters = stream.parameters().clone();
        let id = codec_id(parameters.id());
        let decoder = self
            .opened_decoder(stream_index)?
            .video()
            .map_err(|e| DecodeError::new(ErrorKind::CodecOpen, e.to_string()))?;
        Ok(Box::new(FfmpegVideoCodec {
            id,
            parameters,
            decoder,
            frame: ffmpeg::frame::Video::empty(),
            converter: PictureConverter::new(),
        }))
    }

    fn open_audio_codec(&mut self, stream_index: usize) -> Result<Box<dyn AudioCodec>> {
        let Some(stream) = self.input.stream(stream_index) else {
            return Err(DecodeError::stream_not_found("audio"));
        };
        let id = codec_id(stream.parameters().id());
        let decoder = self
            .opened_decoder(stream_index)?
            .audio()
            .map_err(|e| DecodeError::new(ErrorKind::CodecOpen, e.to_string()))?;
        Ok(Box::new(FfmpegAudioCodec {
            id,
            decoder,
            frame: ffmpeg::frame::Audio::empty(),
            resampler: None,
            samples: Vec::new(),
        }))
    }
}

/// Converts decoded pictures into a supported pixel format.
struct PictureConverter {
    scaled: ffmpeg::frame::Video,
    scaler: Option<ffmpeg::software::scaling::Context>,
}

impl PictureConverter {
    fn new() -> Self {
        Self {
            scaled: ffmpeg::frame::Video::empty(),
            scaler: None,
        }
    }

    /// Returns `frame` as a picture, converting to YUV 4:2:0 unless it
    /// already is YUV 4:2:0 or NV12.
    fn picture<'a>(
        &'a mut self,
        frame: &'a ffmpeg::frame::Video,
    ) -> std::result::Result<Picture<'a>, String> {
        let (format, source) = match frame.format() {
            ffmpeg::format::Pixel::YUV420P => (PixelFormat::Yuv420p, frame),
            ffmpeg::format::Pixel::NV12 => (PixelFormat::Nv12, frame),
            other => {
                let (width, height) = (frame.width(), frame.height());
                let stale = self.scaler.as_ref().map_or(true, |s| {
                    let input = s.input();
                    input.format != other || input.width != width || input.height != height
                });
                if stale {
                    tracing::debug!("Converting {:?} {}x{} to YUV420P", other, width, height);
                    let scaler = ffmpeg::software::scaling::Context::get(
                        other,
                        width,
                        height,
                        ffmpeg::format::Pixel::YUV420P,
                        width,
                        height,
                        ffmpeg::software::scaling::Flags::BILINEAR,
                    )
                    .map_err(|e| format!("cannot convert {other:?}: {e}"))?;
                    self.scaler = Some(scaler);
                }
                let Some(scaler) = self.scaler.as_mut() else {
                    return Err("scaler missing".to_string());
                };
                scaler
                    .run(frame, &mut self.scaled)
                    .map_err(|e| format!("scaling failed: {e}"))?;
                (PixelFormat::Yuv420p, &self.scaled)
            }
        };

        let planes = (0..format.num_planes()).map(|i| PlaneRef {
            data: source.data(i),
            stride: source.stride(i),
        });
        // SAFETY: reading plain timing fields of a valid frame
        let (duration, repeat_pict) = unsafe {
            let raw = &*frame.as_ptr();
            (raw.duration, raw.repeat_pict)
        };
        let mut picture = Picture::new(frame.width(), frame.height(), format, planes)
            .with_timing(frame.timestamp(), duration);
        picture.repeat_pict = repeat_pict;
        Ok(picture)
    }
}

/// Copies a hardware surface into CPU memory.
fn transfer_to_cpu(
    frame: &ffmpeg::frame::Video,
    target: &mut ffmpeg::frame::Video,
) -> std::result::Result<(), String> {
    // SAFETY: both frames are valid; FFmpeg allocates the destination buffers
    let ret = unsafe {
        ffi::av_frame_unref(target.as_mut_ptr());
        let ret = ffi::av_hwframe_transfer_data(target.as_mut_ptr(), frame.as_ptr(), 0);
        if ret >= 0 {
            ffi::av_frame_copy_props(target.as_mut_ptr(), frame.as_ptr());
        }
        ret
    };
    if ret < 0 {
        return Err(format!(
            "hardware frame transfer failed: {}",
            ffmpeg::Error::from(ret)
        ));
    }
    tracing::trace!("Transferred hardware frame to CPU");
    Ok(())
}

struct FfmpegVideoCodec {
    id: CodecId,
    parameters: ffmpeg::codec::Parameters,
    decoder: ffmpeg::decoder::Video,
    frame: ffmpeg::frame::Video,
    converter: PictureConverter,
}

// SAFETY: decoder and frames are owned exclusively and only touched from the
// video decode thread while it holds the decoder's codec lock.
unsafe impl Send for FfmpegVideoCodec {}

impl VideoCodec for FfmpegVideoCodec {
    fn codec_id(&self) -> CodecId {
        self.id
    }

    fn send_packet(&mut self, packet: &CompressedPacket) -> std::result::Result<(), CodecError> {
        self.decoder
            .send_packet(&to_ffmpeg_packet(packet))
            .map_err(|e| codec_failure("send packet", e))
    }

    fn receive_frame(&mut self) -> std::result::Result<Picture<'_>, CodecError> {
        self.decoder
            .receive_frame(&mut self.frame)
            .map_err(|e| codec_failure("receive frame", e))?;
        self.converter
            .picture(&self.frame)
            .map_err(CodecError::Failed)
    }

    fn flush(&mut self) {
        self.decoder.flush();
    }

    fn create_hardware_session(
        &mut self,
    ) -> std::result::Result<Box<dyn HardwareSession>, FallbackReason> {
        if !self.id.hardware_decodable() {
            return Err(FallbackReason::UnsupportedCodec(self.id));
        }
        let Some((device_type, name)) = platform_device() else {
            return Err(FallbackReason::UnsupportedCodec(self.id));
        };
        let device = HwDevice::new(device_type)
            .map_err(|ret| FallbackReason::DeviceUnavailable(format!("{name}: error {ret}")))?;

        let mut context = ffmpeg::codec::context::Context::from_parameters(self.parameters.clone())
            .map_err(|e| FallbackReason::DeviceUnavailable(e.to_string()))?;
        // SAFETY: the codec context is not opened yet; it takes its own reference
        unsafe {
            (*context.as_mut_ptr()).hw_device_ctx = ffi::av_buffer_ref(device.ptr);
        }
        let decoder = context
            .decoder()
            .video()
            .map_err(|e| FallbackReason::DeviceUnavailable(format!("{name}: {e}")))?;
        tracing::info!("Created {} hardware decoder for {}", name, self.id);

        Ok(Box::new(FfmpegHardwareSession {
            name,
            _device: device,
            decoder,
            frame: ffmpeg::frame::Video::empty(),
            transferred: ffmpeg::frame::Video::empty(),
            converter: PictureConverter::new(),
        }))
    }
}

fn platform_device() -> Option<(ffi::AVHWDeviceType, &'static str)> {
    if cfg!(target_os = "macos") {
        Some((ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_VIDEOTOOLBOX, "videotoolbox"))
    } else if cfg!(target_os = "linux") {
        Some((ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_VAAPI, "vaapi"))
    } else if cfg!(target_os = "windows") {
        Some((ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_D3D11VA, "d3d11va"))
    } else {
        None
    }
}

/// Owned reference to a hardware device context.
struct HwDevice {
    ptr: *mut ffi::AVBufferRef,
}

impl HwDevice {
    fn new(device_type: ffi::AVHWDeviceType) -> std::result::Result<Self, i32> {
        let mut ptr: *mut ffi::AVBufferRef = ptr::null_mut();
        // SAFETY: FFmpeg writes a new reference into `ptr` on success
        let ret = unsafe {
            ffi::av_hwdevice_ctx_create(&mut ptr, device_type, ptr::null(), ptr::null_mut(), 0)
        };
        if ret < 0 || ptr.is_null() {
            return Err(ret);
        }
        Ok(Self { ptr })
    }
}

impl Drop for HwDevice {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            // SAFETY: the reference is owned by this wrapper
            unsafe { ffi::av_buffer_unref(&mut self.ptr) };
        }
    }
}

struct FfmpegHardwareSession {
    name: &'static str,
    _device: HwDevice,
    decoder: ffmpeg::decoder::Video,
    frame: ffmpeg::frame::Video,
    transferred: ffmpeg::frame::Video,
    converter: PictureConverter,
}

// SAFETY: owned exclusively by the video decoder and used under its codec lock.
unsafe impl Send for FfmpegHardwareSession {}

impl HardwareSession for FfmpegHardwareSession {
    fn name(&self) -> &str {
        self.name
    }

    fn send_packet(&mut self, packet: &CompressedPacket) -> Result<()> {
        match self.decoder.send_packet(&to_ffmpeg_packet(packet)) {
            Ok(()) => Ok(()),
            Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => Ok(()),
            Err(err) => Err(DecodeError::new(ErrorKind::CodecSendPacket, err.to_string())),
        }
    }

    fn receive_frame(&mut self) -> Result<Option<Picture<'_>>> {
        match self.decoder.receive_frame(&mut self.frame) {
            Ok(()) => {}
            Err(ffmpeg::Error::Eof) => return Ok(None),
            Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => {
                return Ok(None)
            }
            Err(err) => {
                return Err(DecodeError::new(ErrorKind::CodecReceiveFrame, err.to_string()))
            }
        }
        // SAFETY: checking a pointer field of a valid frame
        let on_device = unsafe { !(*self.frame.as_ptr()).hw_frames_ctx.is_null() };
        let source = if on_device {
            transfer_to_cpu(&self.frame, &mut self.transferred)
                .map_err(|e| DecodeError::new(ErrorKind::CodecReceiveFrame, e))?;
            &self.transferred
        } else {
            &self.frame
        };
        self.converter
            .picture(source)
            .map(Some)
            .map_err(|e| DecodeError::new(ErrorKind::CodecReceiveFrame, e))
    }

    fn flush(&mut self) {
        self.decoder.flush();
    }
}

struct FfmpegAudioCodec {
    id: CodecId,
    decoder: ffmpeg::decoder::Audio,
    frame: ffmpeg::frame::Audio,
    /// Converts decoded frames to packed f32, keyed on their format
    resampler: Option<resampling::Context>,
    samples: Vec<f32>,
}

// SAFETY: owned exclusively by the audio decoder and used under its codec lock.
unsafe impl Send for FfmpegAudioCodec {}

impl FfmpegAudioCodec {
    /// Builds the converter unless the current one already takes this input.
    fn ensure_resampler(
        &mut self,
        format: ffmpeg::format::Sample,
        layout: ffmpeg::ChannelLayout,
        rate: u32,
    ) -> std::result::Result<(), CodecError> {
        if !needs_resampler(self.resampler.as_ref().map(|r| r.input()), format, layout, rate) {
            return Ok(());
        }
        tracing::debug!(?format, rate, channels = layout.channels(), "building audio converter");
        let resampler = resampling::Context::get(format, layout, rate, PACKED_F32, layout, rate)
            .map_err(|e| CodecError::Failed(format!("create resampler: {e}")))?;
        self.resampler = Some(resampler);
        Ok(())
    }
}

impl AudioCodec for FfmpegAudioCodec {
    fn codec_id(&self) -> CodecId {
        self.id
    }

    fn send_packet(&mut self, packet: &CompressedPacket) -> std::result::Result<(), CodecError> {
        self.decoder
            .send_packet(&to_ffmpeg_packet(packet))
            .map_err(|e| codec_failure("send packet", e))
    }

    fn receive_frame(&mut self) -> std::result::Result<SampleBlock<'_>, CodecError> {
        self.decoder
            .receive_frame(&mut self.frame)
            .map_err(|e| codec_failure("receive frame", e))?;

        // SAFETY: reading plain fields of a valid frame
        let (channels, duration) = unsafe {
            let raw = &*self.frame.as_ptr();
            (raw.ch_layout.nb_channels.max(0) as u16, raw.duration)
        };
        // Streams without a channel order get the default one for their count
        if self.frame.channel_layout().is_empty() {
            self.frame
                .set_channel_layout(ffmpeg::ChannelLayout::default(i32::from(channels)));
        }
        let rate = self.frame.rate();
        self.ensure_resampler(self.frame.format(), self.frame.channel_layout(), rate)?;
        let Some(resampler) = self.resampler.as_mut() else {
            return Err(CodecError::Failed("resampler not initialized".to_string()));
        };

        let mut converted = ffmpeg::frame::Audio::empty();
        resampler
            .run(&self.frame, &mut converted)
            .map_err(|e| CodecError::Failed(format!("resample: {e}")))?;
        copy_packed_f32(converted.data(0), converted.samples() * channels as usize, &mut self.samples);

        Ok(SampleBlock {
            best_effort_timestamp: self.frame.timestamp(),
            duration,
            sample_rate: rate,
            channels,
            samples: &self.samples,
        })
    }

    fn flush(&mut self) {
        self.decoder.flush();
        // Rebuilt on the next frame so no filter history crosses a seek
        self.resampler = None;
    }
}

/// Output format of the audio converter.
const PACKED_F32: ffmpeg::format::Sample =
    ffmpeg::format::Sample::F32(ffmpeg::format::sample::Type::Packed);

/// Whether a converter built for `current` cannot take a frame of this format.
fn needs_resampler(
    current: Option<&resampling::context::Definition>,
    format: ffmpeg::format::Sample,
    layout: ffmpeg::ChannelLayout,
    rate: u32,
) -> bool {
    current.map_or(true, |input| {
        input.format != format || input.channel_layout != layout || input.rate != rate
    })
}

/// Reads `count` native-endian f32 samples out of a converted plane.
fn copy_packed_f32(bytes: &[u8], count: usize, out: &mut Vec<f32>) {
    out.clear();
    out.extend(
        bytes
            .chunks_exact(4)
            .take(count)
            .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]])),
    );
}
