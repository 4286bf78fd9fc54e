//! Video decoding.
//!
//! A [`VideoDecoder`] owns the video stream's packet queue, its decoded frame
//! queue and the pool the frame planes are drawn from. Its [`run`] loop is
//! driven on a dedicated thread by the player:
//!
//! ```text
//! packets ──► [hardware session | software codec] ──► put_sorted ──► frames
//! ```
//!
//! Hardware decoding is attempted once when the decoder is built. Failing to
//! set it up, or the session failing later, is never fatal: the decoder
//! switches to the software codec for the next packet and reports why.
//!
//! [`run`]: VideoDecoder::run

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::codec::{CodecError, FallbackReason, HardwareSession, Picture, VideoCodec};
use crate::demux::CompressedPacket;
use crate::error::{DecodeError, ErrorKind, Result};
use crate::frame::{Plane, VideoFrame};
use crate::frame_pool::{FramePool, VIDEO_POOL_CAPACITY};
use crate::frame_queue::FrameQueue;
use crate::packet_queue::{PacketQueue, QueuedPacket};

/// Poll interval of a paused decode loop.
pub(crate) const PAUSED_POLL: Duration = Duration::from_millis(10);

/// Sleep of a decode loop whose output queue is full.
pub(crate) const FULL_SLEEP: Duration = Duration::from_millis(100);

/// Sleep of a decode loop whose output queue is full while paused.
pub(crate) const FULL_SLEEP_PAUSED: Duration = Duration::from_millis(500);

/// Default cap on decoded-but-not-displayed duration, in seconds.
pub const DEFAULT_MAX_DECODED_DURATION: f64 = 2.0;

/// Configuration for hardware-accelerated decoding.
#[derive(Debug, Clone)]
pub struct HwAccelConfig {
    /// Whether to try a hardware decode session at all
    pub enabled: bool,
    /// Whether to continue in software when the session fails mid-stream
    /// (when false, a session failure is a fatal decode error)
    pub fallback_to_software: bool,
}

impl Default for HwAccelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fallback_to_software: true,
        }
    }
}

impl HwAccelConfig {
    /// Creates a config for software-only decoding.
    pub fn software_only() -> Self {
        Self {
            enabled: false,
            fallback_to_software: true,
        }
    }
}

/// Which decode path produces frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodePath {
    Hardware,
    Software,
}

/// Notifications from the video decode loop.
///
/// Every method has a no-op default; `()` implements the trait for callers
/// that do not care.
pub trait VideoDecodeHooks: Send + Sync {
    /// A fatal decode error was latched. The loop exits right after.
    fn on_error(&self, _error: &DecodeError) {}

    /// The hardware session failed and decoding continues in software.
    fn on_fallback(&self, _reason: &FallbackReason) {}

    /// A packet was consumed after end of file; buffered duration is stale.
    fn on_buffered_duration_stale(&self) {}

    /// The decode loop exited.
    fn on_decode_finished(&self) {}
}

impl VideoDecodeHooks for () {}

struct CodecState {
    codec: Box<dyn VideoCodec>,
    hardware: Option<Box<dyn HardwareSession>>,
}

impl CodecState {
    fn path(&self) -> DecodePath {
        if self.hardware.is_some() {
            DecodePath::Hardware
        } else {
            DecodePath::Software
        }
    }
}

/// Decoder for one video stream.
pub struct VideoDecoder {
    packets: PacketQueue,
    frames: FrameQueue<VideoFrame>,
    pool: FramePool<Vec<Plane>>,
    codec: Mutex<CodecState>,
    hw_config: HwAccelConfig,
    fallback: Mutex<Option<FallbackReason>>,
    /// Seconds per timestamp tick
    time_base: f64,
    fps: f64,
    max_decoded_duration: f64,
    paused: AtomicBool,
    end_of_file: AtomicBool,
    canceled: AtomicBool,
    decoding: AtomicBool,
    /// Bumped by every flush; packets popped under an older value are stale
    flush_generation: AtomicU64,
    error: Mutex<Option<DecodeError>>,
}

impl VideoDecoder {
    /// Creates a decoder around an opened codec.
    ///
    /// When hardware decoding is enabled a session is requested from the
    /// codec; the outcome is available from [`fallback_reason`](Self::fallback_reason).
    pub fn new(
        mut codec: Box<dyn VideoCodec>,
        time_base: f64,
        fps: f64,
        hw_config: HwAccelConfig,
        max_decoded_duration: f64,
    ) -> Self {
        let (hardware, fallback) = if hw_config.enabled {
            match codec.create_hardware_session() {
                Ok(session) => {
                    tracing::info!(
                        "Hardware decoding enabled for {} via {}",
                        codec.codec_id(),
                        session.name()
                    );
                    (Some(session), None)
                }
                Err(reason) => {
                    tracing::info!("Using software decoding for {}: {}", codec.codec_id(), reason);
                    (None, Some(reason))
                }
            }
        } else {
            (None, None)
        };

        Self {
            packets: PacketQueue::new(time_base),
            frames: FrameQueue::new(),
            pool: FramePool::with_capacity(VIDEO_POOL_CAPACITY),
            codec: Mutex::new(CodecState { codec, hardware }),
            hw_config,
            fallback: Mutex::new(fallback),
            time_base,
            fps,
            max_decoded_duration,
            paused: AtomicBool::new(false),
            end_of_file: AtomicBool::new(false),
            canceled: AtomicBool::new(false),
            decoding: AtomicBool::new(false),
            flush_generation: AtomicU64::new(0),
            error: Mutex::new(None),
        }
    }

    /// Queues a compressed packet for decoding.
    ///
    /// Fails with the latched error once decoding has failed.
    pub fn put_packet(&self, packet: CompressedPacket) -> Result<()> {
        if let Some(err) = self.error() {
            return Err(err);
        }
        let fallback_duration = if self.fps > 0.0 { 1.0 / self.fps } else { 0.0 };
        self.packets.put(QueuedPacket::Packet(packet), fallback_duration);
        Ok(())
    }

    /// Drops everything queued and asks the decode loop to reset the codec
    /// before the next packet.
    ///
    /// Waits for a packet being decoded to finish so none of its frames
    /// survive the flush. A packet the loop popped but has not started
    /// decoding is dropped.
    pub fn flush(&self) {
        let _codec = self.codec.lock();
        self.flush_generation.fetch_add(1, Ordering::AcqRel);
        self.packets.flush();
        self.packets.put(QueuedPacket::Flush, 0.0);
        self.frames.flush();
        self.pool.flush();
    }

    /// Cancels decoding and wakes every waiter. Idempotent.
    pub fn destroy(&self) {
        self.canceled.store(true, Ordering::Release);
        self.packets.destroy();
        self.frames.destroy();
        self.pool.flush();
    }

    /// The decode loop. Returns when canceled, on a fatal error, or once end
    /// of file is flagged and every queued packet has been decoded.
    pub fn run(&self, hooks: &dyn VideoDecodeHooks) {
        self.decoding.store(true, Ordering::Release);
        tracing::debug!("Video decode loop started");

        loop {
            if self.canceled.load(Ordering::Acquire) || self.has_error() {
                break;
            }
            if self.is_paused() {
                std::thread::sleep(PAUSED_POLL);
                continue;
            }
            if self.is_end_of_file() && self.packets.is_empty() {
                tracing::debug!("Video decode finished");
                break;
            }
            if self.frames.duration() >= self.max_decoded_duration {
                let interval = if self.is_paused() {
                    FULL_SLEEP_PAUSED
                } else {
                    FULL_SLEEP
                };
                tracing::trace!("Video frame queue full, sleeping {:?}", interval);
                std::thread::sleep(interval);
                continue;
            }

            let Some((packet, generation)) = self.next_packet() else {
                break;
            };
            if self.is_end_of_file() {
                hooks.on_buffered_duration_stale();
            }

            let result = match packet {
                QueuedPacket::Flush => {
                    self.flush_codec();
                    continue;
                }
                QueuedPacket::Packet(packet) => self.decode_packet(&packet, generation, hooks),
            };
            if let Err(err) = result {
                tracing::error!("Video decode failed: {}", err);
                self.latch_error(err.clone());
                hooks.on_error(&err);
                break;
            }
        }

        self.decoding.store(false, Ordering::Release);
        hooks.on_decode_finished();
    }

    /// Pops the next queued packet with the flush generation it belongs to.
    fn next_packet(&self) -> Option<(QueuedPacket, u64)> {
        let generation = self.flush_generation.load(Ordering::Acquire);
        self.packets.get_blocking().map(|packet| (packet, generation))
    }

    fn flush_codec(&self) {
        let mut state = self.codec.lock();
        state.codec.flush();
        if let Some(session) = state.hardware.as_mut() {
            session.flush();
        }
        tracing::debug!("Video codec flushed");
    }

    fn decode_packet(
        &self,
        packet: &CompressedPacket,
        generation: u64,
        hooks: &dyn VideoDecodeHooks,
    ) -> Result<()> {
        let mut state = self.codec.lock();
        if self.flush_generation.load(Ordering::Acquire) != generation {
            tracing::trace!("Dropping video packet popped before a flush");
            return Ok(());
        }

        if let Some(session) = state.hardware.as_mut() {
            let Err(err) = self.decode_hardware(session.as_mut(), packet) else {
                return Ok(());
            };
            if !self.hw_config.fallback_to_software {
                return Err(err);
            }
            let reason = FallbackReason::SessionFailed(err.to_string());
            tracing::warn!("Hardware decoding failed, switching to software: {}", err);
            state.hardware = None;
            *self.fallback.lock() = Some(reason.clone());
            hooks.on_fallback(&reason);
            // The software codec picks up from the next packet
            return Ok(());
        }

        match state.codec.send_packet(packet) {
            Ok(()) | Err(CodecError::Again) | Err(CodecError::EndOfStream) => {}
            Err(CodecError::Failed(msg)) => {
                return Err(DecodeError::new(ErrorKind::CodecSendPacket, msg));
            }
        }
        loop {
            match state.codec.receive_frame() {
                Ok(picture) => {
                    let frame = self.frame_from_picture(&picture, false);
                    self.frames.put_sorted(frame);
                }
                Err(CodecError::Again) | Err(CodecError::EndOfStream) => return Ok(()),
                Err(CodecError::Failed(msg)) => {
                    return Err(DecodeError::new(ErrorKind::CodecReceiveFrame, msg));
                }
            }
        }
    }

    fn decode_hardware(
        &self,
        session: &mut dyn HardwareSession,
        packet: &CompressedPacket,
    ) -> Result<()> {
        session.send_packet(packet)?;
        while let Some(picture) = session.receive_frame()? {
            let frame = self.frame_from_picture(&picture, true);
            self.frames.put_sorted(frame);
        }
        Ok(())
    }

    /// Copies a decoded picture into a pooled frame.
    fn frame_from_picture(&self, picture: &Picture<'_>, hardware: bool) -> VideoFrame {
        let mut planes = self.pool.acquire();
        planes.resize_with(picture.planes().len(), Plane::default);
        for (dst, src) in planes.iter_mut().zip(picture.planes()) {
            dst.data.clear();
            dst.data.extend_from_slice(src.data);
            dst.stride = src.stride;
        }

        let position = picture.best_effort_timestamp.unwrap_or(0) as f64 * self.time_base;
        let duration = if picture.duration != 0 {
            picture.duration as f64 * self.time_base
                + picture.repeat_pict as f64 * self.time_base * 0.5
        } else if self.fps > 0.0 {
            1.0 / self.fps
        } else {
            0.0
        };
        tracing::trace!(position, duration, hardware, "decoded video frame");

        VideoFrame {
            position,
            duration,
            format: picture.format,
            width: picture.width,
            height: picture.height,
            planes,
            hardware,
        }
    }

    fn latch_error(&self, err: DecodeError) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    /// Takes the next frame in presentation order, waiting until one arrives.
    pub fn get_frame_blocking(&self) -> Option<VideoFrame> {
        self.frames.get_blocking()
    }

    /// Takes the next frame, waiting at most `timeout`.
    pub fn get_frame_timeout(&self, timeout: Duration) -> Option<VideoFrame> {
        self.frames.get_timeout(timeout)
    }

    /// Takes the next frame if one is decoded.
    pub fn get_frame_non_blocking(&self) -> Option<VideoFrame> {
        self.frames.get_non_blocking()
    }

    /// Queued duration in seconds: compressed packets plus decoded frames.
    pub fn duration(&self) -> f64 {
        self.packets.duration() + self.frames.duration()
    }

    /// Decoded duration waiting for display, in seconds.
    pub fn frame_duration(&self) -> f64 {
        self.frames.duration()
    }

    /// Bytes of compressed packets waiting to be decoded.
    pub fn packet_size(&self) -> usize {
        self.packets.size()
    }

    /// Returns true once end of file is flagged and every packet was decoded.
    pub fn is_drained(&self) -> bool {
        self.is_end_of_file() && self.packets.is_empty()
    }

    /// Returns true if neither packets nor frames are queued.
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty() && self.frames.is_empty()
    }

    /// Returns true if no decoded frame is waiting.
    pub fn frame_queue_is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    pub fn time_base(&self) -> f64 {
        self.time_base
    }

    /// The path currently producing frames.
    pub fn decode_path(&self) -> DecodePath {
        self.codec.lock().path()
    }

    /// Why hardware decoding is not (or no longer) used, if it was attempted.
    pub fn fallback_reason(&self) -> Option<FallbackReason> {
        self.fallback.lock().clone()
    }

    /// The latched fatal error, if any.
    pub fn error(&self) -> Option<DecodeError> {
        self.error.lock().clone()
    }

    fn has_error(&self) -> bool {
        self.error.lock().is_some()
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn set_end_of_file(&self, end_of_file: bool) {
        self.end_of_file.store(end_of_file, Ordering::Release);
    }

    pub fn is_end_of_file(&self) -> bool {
        self.end_of_file.load(Ordering::Acquire)
    }

    /// Returns true while [`run`](Self::run) is executing.
    pub fn is_decoding(&self) -> bool {
        self.decoding.load(Ordering::Acquire)
    }

    /// Returns true once [`destroy`](Self::destroy) has been called.
    pub fn is_destroyed(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    /// The pool frame planes are drawn from.
    pub fn pool(&self) -> &FramePool<Vec<Plane>> {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demux::{ContainerReader, InterruptFlag, MediaBackend};
    use crate::frame::PixelFormat;
    use crate::synthetic::{SyntheticBackend, SyntheticConfig, SyntheticFailure, SyntheticVideo};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    const TB: f64 = 1.0 / 90_000.0;

    fn source(config: SyntheticConfig) -> (Box<dyn ContainerReader>, Box<dyn VideoCodec>) {
        let backend = SyntheticBackend::new(config);
        let Ok(mut reader) = backend.open_input("synthetic://video", InterruptFlag::new()) else {
            panic!("Expected source to open");
        };
        let Ok(codec) = reader.open_video_codec(0) else {
            panic!("Expected video codec");
        };
        (reader, codec)
    }

    fn feed(reader: &mut dyn ContainerReader, decoder: &VideoDecoder, count: usize) {
        for _ in 0..count {
            let Ok(Some(packet)) = reader.read_packet() else {
                panic!("Expected packet");
            };
            assert!(decoder.put_packet(packet).is_ok());
        }
    }

    #[derive(Default)]
    struct CountingHooks {
        errors: AtomicUsize,
        fallbacks: AtomicUsize,
        finished: AtomicUsize,
    }

    impl VideoDecodeHooks for CountingHooks {
        fn on_error(&self, _error: &DecodeError) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
        fn on_fallback(&self, _reason: &FallbackReason) {
            self.fallbacks.fetch_add(1, Ordering::SeqCst);
        }
        fn on_decode_finished(&self) {
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_decodes_reordered_stream_in_presentation_order() {
        let video = SyntheticVideo {
            reorder: true,
            gop: 6,
            ..SyntheticVideo::default()
        };
        let (mut reader, codec) = source(SyntheticConfig::default().with_video(video));
        let decoder = VideoDecoder::new(codec, TB, 25.0, HwAccelConfig::software_only(), 2.0);
        feed(reader.as_mut(), &decoder, 12);
        decoder.set_end_of_file(true);
        decoder.run(&());

        let mut positions = Vec::new();
        while let Some(frame) = decoder.get_frame_non_blocking() {
            assert_eq!(frame.format, PixelFormat::Yuv420p);
            assert!((frame.duration - 0.04).abs() < 1e-9);
            assert!(!frame.hardware);
            positions.push(frame.position);
        }
        assert_eq!(positions.len(), 12);
        assert!(positions.windows(2).all(|w| w[0] <= w[1]));
        assert!((positions[11] - 0.44).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_duration_falls_back_to_fps() {
        let (mut reader, codec) =
            source(SyntheticConfig::default().with_unknown_packet_durations());
        let decoder = VideoDecoder::new(codec, TB, 25.0, HwAccelConfig::software_only(), 2.0);
        feed(reader.as_mut(), &decoder, 2);
        // Packets without duration are credited one frame period each
        assert!((decoder.duration() - 0.08).abs() < 1e-9);
        decoder.set_end_of_file(true);
        decoder.run(&());

        let Some(frame) = decoder.get_frame_non_blocking() else {
            panic!("Expected frame");
        };
        assert!((frame.duration - 0.04).abs() < 1e-9);
    }

    #[test]
    fn test_flush_marker_resets_codec_and_queues() {
        let (mut reader, codec) = source(SyntheticConfig::default());
        let decoder = VideoDecoder::new(codec, TB, 25.0, HwAccelConfig::software_only(), 2.0);
        feed(reader.as_mut(), &decoder, 5);
        decoder.flush();
        // Only the flush marker remains
        assert_eq!(decoder.packet_size(), 0);
        assert!(!decoder.is_empty());

        feed(reader.as_mut(), &decoder, 1);
        decoder.set_end_of_file(true);
        decoder.run(&());

        let Some(frame) = decoder.get_frame_non_blocking() else {
            panic!("Expected frame");
        };
        assert!((frame.position - 0.2).abs() < 1e-9);
        assert!(decoder.get_frame_non_blocking().is_none());
    }

    #[test]
    fn test_packet_popped_before_flush_is_dropped() {
        let (mut reader, codec) = source(SyntheticConfig::default());
        let decoder = VideoDecoder::new(codec, TB, 25.0, HwAccelConfig::software_only(), 2.0);
        feed(reader.as_mut(), &decoder, 2);

        // The loop took a packet, then a seek flushed before it was decoded
        let Some((QueuedPacket::Packet(stale), generation)) = decoder.next_packet() else {
            panic!("Expected packet");
        };
        decoder.flush();
        assert!(decoder.decode_packet(&stale, generation, &()).is_ok());
        assert!(decoder.frame_queue_is_empty());

        // Packets popped after the flush decode normally
        let Some((QueuedPacket::Flush, _)) = decoder.next_packet() else {
            panic!("Expected flush marker");
        };
        feed(reader.as_mut(), &decoder, 1);
        let Some((QueuedPacket::Packet(fresh), generation)) = decoder.next_packet() else {
            panic!("Expected packet");
        };
        assert!(decoder.decode_packet(&fresh, generation, &()).is_ok());
        let Some(frame) = decoder.get_frame_non_blocking() else {
            panic!("Expected frame");
        };
        assert!((frame.position - 0.08).abs() < 1e-9);
    }

    #[test]
    fn test_hardware_session_produces_frames() {
        let (mut reader, codec) = source(SyntheticConfig::default().with_hardware());
        let decoder = VideoDecoder::new(codec, TB, 25.0, HwAccelConfig::default(), 2.0);
        assert_eq!(decoder.decode_path(), DecodePath::Hardware);
        assert!(decoder.fallback_reason().is_none());

        feed(reader.as_mut(), &decoder, 3);
        decoder.set_end_of_file(true);
        decoder.run(&());
        let Some(frame) = decoder.get_frame_non_blocking() else {
            panic!("Expected frame");
        };
        assert!(frame.hardware);
        assert_eq!(frame.format, PixelFormat::Nv12);
    }

    #[test]
    fn test_unavailable_hardware_uses_software() {
        let config = SyntheticConfig::default()
            .with_hardware()
            .with_failure(SyntheticFailure::HardwareDevice);
        let (_reader, codec) = source(config);
        let decoder = VideoDecoder::new(codec, TB, 25.0, HwAccelConfig::default(), 2.0);
        assert_eq!(decoder.decode_path(), DecodePath::Software);
        let Some(reason) = decoder.fallback_reason() else {
            panic!("Expected a fallback reason");
        };
        assert!(!reason.into_error().is_fatal());
    }

    #[test]
    fn test_hardware_failure_falls_back_on_next_packet() {
        let config = SyntheticConfig::default()
            .with_hardware()
            .with_failure(SyntheticFailure::HardwareDecode { after_packets: 2 });
        let (mut reader, codec) = source(config);
        let decoder = VideoDecoder::new(codec, TB, 25.0, HwAccelConfig::default(), 2.0);
        let hooks = CountingHooks::default();

        feed(reader.as_mut(), &decoder, 6);
        decoder.set_end_of_file(true);
        decoder.run(&hooks);

        assert_eq!(hooks.fallbacks.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.errors.load(Ordering::SeqCst), 0);
        assert_eq!(decoder.decode_path(), DecodePath::Software);
        assert!(decoder.error().is_none());

        let frames: Vec<VideoFrame> = std::iter::from_fn(|| decoder.get_frame_non_blocking()).collect();
        // Two hardware frames, the failing packet dropped, three software frames
        assert_eq!(frames.len(), 5);
        assert!(frames[0].hardware && frames[1].hardware);
        assert!(frames[2..].iter().all(|f| !f.hardware));
    }

    #[test]
    fn test_send_failure_is_latched() {
        let config = SyntheticConfig::default()
            .with_failure(SyntheticFailure::VideoDecode { after_packets: 1 });
        let (mut reader, codec) = source(config);
        let decoder = VideoDecoder::new(codec, TB, 25.0, HwAccelConfig::software_only(), 2.0);
        let hooks = CountingHooks::default();

        feed(reader.as_mut(), &decoder, 3);
        decoder.run(&hooks);

        assert_eq!(hooks.errors.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.finished.load(Ordering::SeqCst), 1);
        let Some(err) = decoder.error() else {
            panic!("Expected a latched error");
        };
        assert_eq!(err.kind(), ErrorKind::CodecSendPacket);

        let Ok(Some(packet)) = reader.read_packet() else {
            panic!("Expected packet");
        };
        assert!(decoder.put_packet(packet).is_err());
    }

    #[test]
    fn test_destroy_stops_blocked_loop() {
        let (_reader, codec) = source(SyntheticConfig::default());
        let decoder = Arc::new(VideoDecoder::new(
            codec,
            TB,
            25.0,
            HwAccelConfig::software_only(),
            2.0,
        ));
        let worker = {
            let decoder = Arc::clone(&decoder);
            std::thread::spawn(move || decoder.run(&()))
        };
        std::thread::sleep(Duration::from_millis(30));
        assert!(decoder.is_decoding());

        decoder.destroy();
        assert!(worker.join().is_ok());
        assert!(!decoder.is_decoding());
        assert!(decoder.is_destroyed());
        assert!(decoder.get_frame_blocking().is_none());
    }

    #[test]
    fn test_frames_return_planes_to_pool() {
        let (mut reader, codec) = source(SyntheticConfig::default());
        let decoder = VideoDecoder::new(codec, TB, 25.0, HwAccelConfig::software_only(), 2.0);
        feed(reader.as_mut(), &decoder, 4);
        decoder.set_end_of_file(true);
        decoder.run(&());

        assert_eq!(decoder.pool().in_use_count(), 4);
        while decoder.get_frame_non_blocking().is_some() {}
        assert_eq!(decoder.pool().in_use_count(), 0);
        assert_eq!(decoder.pool().unused_count(), 4);
    }
}
