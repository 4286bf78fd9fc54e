//! Audio decoding.
//!
//! Mirrors [`crate::video_decoder`]: a packet queue feeds a decode loop that
//! fills a frame queue. Decoded sample blocks are converted to the sink's
//! format before queueing, so the render callback only copies samples. The
//! sink format is asked for on every block and the resampler rebuilt when it
//! changes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::audio::AudioOutput;
use crate::codec::{AudioCodec, CodecError, SampleBlock};
use crate::demux::CompressedPacket;
use crate::error::{DecodeError, ErrorKind, Result};
use crate::frame::AudioFrame;
use crate::frame_pool::{FramePool, AUDIO_POOL_CAPACITY};
use crate::frame_queue::FrameQueue;
use crate::packet_queue::{PacketQueue, QueuedPacket};
use crate::resampler::Resampler;
use crate::video_decoder::{FULL_SLEEP, FULL_SLEEP_PAUSED, PAUSED_POLL};

/// Notifications from the audio decode loop. All methods default to no-ops.
pub trait AudioDecodeHooks: Send + Sync {
    /// A fatal decode error was latched. The loop exits right after.
    fn on_error(&self, _error: &DecodeError) {}

    /// A packet was consumed after end of file; buffered duration is stale.
    fn on_buffered_duration_stale(&self) {}

    /// The decode loop exited.
    fn on_decode_finished(&self) {}
}

impl AudioDecodeHooks for () {}

struct CodecState {
    codec: Box<dyn AudioCodec>,
    resampler: Option<Resampler>,
    converted: Vec<f32>,
}

/// Decoder for one audio stream.
pub struct AudioDecoder {
    packets: PacketQueue,
    frames: FrameQueue<AudioFrame>,
    pool: FramePool<Vec<f32>>,
    codec: Mutex<CodecState>,
    output: Arc<dyn AudioOutput>,
    time_base: f64,
    max_decoded_duration: f64,
    paused: AtomicBool,
    end_of_file: AtomicBool,
    canceled: AtomicBool,
    decoding: AtomicBool,
    flush_generation: AtomicU64,
    error: Mutex<Option<DecodeError>>,
}

impl AudioDecoder {
    pub fn new(
        codec: Box<dyn AudioCodec>,
        time_base: f64,
        output: Arc<dyn AudioOutput>,
        max_decoded_duration: f64,
    ) -> Self {
        tracing::debug!("Audio decoder for {} -> {:?}", codec.codec_id(), output.format());
        Self {
            packets: PacketQueue::new(time_base),
            frames: FrameQueue::new(),
            pool: FramePool::with_capacity(AUDIO_POOL_CAPACITY),
            codec: Mutex::new(CodecState {
                codec,
                resampler: None,
                converted: Vec::new(),
            }),
            output,
            time_base,
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
    pub fn put_packet(&self, packet: CompressedPacket) -> Result<()> {
        if let Some(err) = self.error() {
            return Err(err);
        }
        self.packets.put(QueuedPacket::Packet(packet), 0.0);
        Ok(())
    }

    /// Drops everything queued, including a packet popped but not yet
    /// decoded; the codec resets before the next packet.
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

    /// The decode loop. Same exit rules as the video loop.
    pub fn run(&self, hooks: &dyn AudioDecodeHooks) {
        self.decoding.store(true, Ordering::Release);
        tracing::debug!("Audio decode loop started");

        loop {
            if self.canceled.load(Ordering::Acquire) || self.error.lock().is_some() {
                break;
            }
            if self.is_paused() {
                std::thread::sleep(PAUSED_POLL);
                continue;
            }
            if self.is_end_of_file() && self.packets.is_empty() {
                tracing::debug!("Audio decode finished");
                break;
            }
            if self.frames.duration() >= self.max_decoded_duration {
                std::thread::sleep(if self.is_paused() {
                    FULL_SLEEP_PAUSED
                } else {
                    FULL_SLEEP
                });
                continue;
            }

            let Some((packet, generation)) = self.next_packet() else {
                break;
            };
            if self.is_end_of_file() {
                hooks.on_buffered_duration_stale();
            }

            let packet = match packet {
                QueuedPacket::Flush => {
                    let mut state = self.codec.lock();
                    state.codec.flush();
                    if let Some(resampler) = state.resampler.as_mut() {
                        resampler.reset();
                    }
                    continue;
                }
                QueuedPacket::Packet(packet) => packet,
            };
            if let Err(err) = self.decode_packet(&packet, generation) {
                tracing::error!("Audio decode failed: {}", err);
                let mut slot = self.error.lock();
                if slot.is_none() {
                    *slot = Some(err.clone());
                }
                drop(slot);
                hooks.on_error(&err);
                break;
            }
        }

        self.decoding.store(false, Ordering::Release);
        hooks.on_decode_finished();
    }

    fn next_packet(&self) -> Option<(QueuedPacket, u64)> {
        let generation = self.flush_generation.load(Ordering::Acquire);
        self.packets.get_blocking().map(|packet| (packet, generation))
    }

    fn decode_packet(&self, packet: &CompressedPacket, generation: u64) -> Result<()> {
        let mut guard = self.codec.lock();
        if self.flush_generation.load(Ordering::Acquire) != generation {
            tracing::trace!("Dropping audio packet popped before a flush");
            return Ok(());
        }
        let state = &mut *guard;

        match state.codec.send_packet(packet) {
            Ok(()) | Err(CodecError::Again) | Err(CodecError::EndOfStream) => {}
            Err(CodecError::Failed(msg)) => {
                return Err(DecodeError::new(ErrorKind::CodecSendPacket, msg));
            }
        }
        loop {
            let block = match state.codec.receive_frame() {
                Ok(block) => block,
                Err(CodecError::Again) | Err(CodecError::EndOfStream) => return Ok(()),
                Err(CodecError::Failed(msg)) => {
                    return Err(DecodeError::new(ErrorKind::CodecReceiveFrame, msg));
                }
            };
            let frame = self.convert_block(&block, &mut state.resampler, &mut state.converted)?;
            self.frames.put(frame);
        }
    }

    /// Converts a sample block to the sink format and wraps it in a pooled frame.
    fn convert_block(
        &self,
        block: &SampleBlock<'_>,
        resampler: &mut Option<Resampler>,
        converted: &mut Vec<f32>,
    ) -> Result<AudioFrame> {
        let format = self.output.format();
        let stale = !resampler
            .as_ref()
            .is_some_and(|r| r.matches(block.sample_rate, block.channels, format));
        if stale {
            tracing::debug!(
                "Audio format {}Hz/{}ch -> {}Hz/{}ch",
                block.sample_rate,
                block.channels,
                format.sample_rate,
                format.channels
            );
            *resampler = Some(Resampler::new(block.sample_rate, block.channels, format)?);
        }
        let Some(resampler) = resampler.as_mut() else {
            return Err(DecodeError::new(ErrorKind::ResamplerInit, "no resampler"));
        };
        resampler.convert(block.samples, converted);

        let mut samples = self.pool.acquire();
        samples.clear();
        samples.extend_from_slice(converted);

        let position = block.best_effort_timestamp.unwrap_or(0) as f64 * self.time_base;
        let duration = if block.duration > 0 {
            block.duration as f64 * self.time_base
        } else if block.sample_rate > 0 {
            block.frame_count() as f64 / block.sample_rate as f64
        } else {
            0.0
        };

        Ok(AudioFrame {
            position,
            duration,
            sample_rate: format.sample_rate,
            channels: format.channels,
            samples,
        })
    }

    /// Takes the next decoded frame, waiting until one arrives or the decoder
    /// is destroyed.
    pub fn get_frame_blocking(&self) -> Option<AudioFrame> {
        self.frames.get_blocking()
    }

    /// Takes the next decoded frame if one is ready.
    pub fn get_frame_non_blocking(&self) -> Option<AudioFrame> {
        self.frames.get_non_blocking()
    }

    /// Takes the next decoded frame, waiting at most `timeout`.
    pub fn get_frame_timeout(&self, timeout: Duration) -> Option<AudioFrame> {
        self.frames.get_timeout(timeout)
    }

    /// Queued duration in seconds: compressed packets plus decoded frames.
    pub fn duration(&self) -> f64 {
        self.packets.duration() + self.frames.duration()
    }

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

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty() && self.frames.is_empty()
    }

    pub fn frame_queue_is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn error(&self) -> Option<DecodeError> {
        self.error.lock().clone()
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

    pub fn is_decoding(&self) -> bool {
        self.decoding.load(Ordering::Acquire)
    }

    pub fn is_destroyed(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    pub fn pool(&self) -> &FramePool<Vec<f32>> {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioFormat;
    use crate::demux::{ContainerReader, InterruptFlag, MediaBackend};
    use crate::synthetic::{SyntheticAudio, SyntheticBackend, SyntheticConfig, SyntheticFailure};

    /// A sink whose format can change mid-stream.
    struct SwitchableOutput(Mutex<AudioFormat>);

    impl AudioOutput for SwitchableOutput {
        fn format(&self) -> AudioFormat {
            *self.0.lock()
        }
    }

    fn source(config: SyntheticConfig) -> (Box<dyn ContainerReader>, Box<dyn AudioCodec>) {
        let backend = SyntheticBackend::new(config);
        let Ok(mut reader) = backend.open_input("synthetic://audio", InterruptFlag::new()) else {
            panic!("Expected source to open");
        };
        let Ok(codec) = reader.open_audio_codec(1) else {
            panic!("Expected audio codec");
        };
        (reader, codec)
    }

    fn feed(reader: &mut dyn ContainerReader, decoder: &AudioDecoder, count: usize) {
        for _ in 0..count {
            let Ok(Some(packet)) = reader.read_packet() else {
                panic!("Expected packet");
            };
            assert!(decoder.put_packet(packet).is_ok());
        }
    }

    fn stereo_48k() -> SyntheticConfig {
        SyntheticConfig::audio_only().with_audio(SyntheticAudio::new(48_000, 2))
    }

    #[test]
    fn test_decodes_in_fifo_order_with_packet_timing() {
        let (mut reader, codec) = source(stereo_48k());
        let decoder = AudioDecoder::new(codec, 1.0 / 48_000.0, Arc::new(AudioFormat::default()), 2.0);
        feed(reader.as_mut(), &decoder, 4);
        assert!((decoder.duration() - 4.0 * 1024.0 / 48_000.0).abs() < 1e-9);

        decoder.set_end_of_file(true);
        decoder.run(&());

        let frames: Vec<AudioFrame> = std::iter::from_fn(|| decoder.get_frame_non_blocking()).collect();
        assert_eq!(frames.len(), 4);
        for (i, frame) in frames.iter().enumerate() {
            assert!((frame.position - i as f64 * 1024.0 / 48_000.0).abs() < 1e-9);
            assert_eq!(frame.frame_count(), 1024);
            assert_eq!(frame.channels, 2);
        }
    }

    #[test]
    fn test_packet_popped_before_flush_is_dropped() {
        let (mut reader, codec) = source(stereo_48k());
        let decoder = AudioDecoder::new(codec, 1.0 / 48_000.0, Arc::new(AudioFormat::default()), 2.0);
        feed(reader.as_mut(), &decoder, 2);

        let Some((QueuedPacket::Packet(stale), generation)) = decoder.next_packet() else {
            panic!("Expected packet");
        };
        decoder.flush();
        assert!(decoder.decode_packet(&stale, generation).is_ok());
        assert!(decoder.get_frame_non_blocking().is_none());

        // Whatever arrives after the flush marker decodes
        feed(reader.as_mut(), &decoder, 1);
        decoder.set_end_of_file(true);
        decoder.run(&());
        let Some(frame) = decoder.get_frame_non_blocking() else {
            panic!("Expected frame");
        };
        assert!((frame.position - 2.0 * 1024.0 / 48_000.0).abs() < 1e-9);
        assert!(decoder.get_frame_non_blocking().is_none());
    }

    #[test]
    fn test_converts_to_sink_format() {
        let config = SyntheticConfig::audio_only().with_audio(SyntheticAudio::new(24_000, 1));
        let (mut reader, codec) = source(config);
        let decoder = AudioDecoder::new(codec, 1.0 / 24_000.0, Arc::new(AudioFormat::new(48_000, 2)), 2.0);
        feed(reader.as_mut(), &decoder, 2);
        decoder.set_end_of_file(true);
        decoder.run(&());

        let Some(frame) = decoder.get_frame_non_blocking() else {
            panic!("Expected frame");
        };
        assert_eq!(frame.sample_rate, 48_000);
        assert_eq!(frame.channels, 2);
        // Timing stays in source terms
        assert!((frame.duration - 1024.0 / 24_000.0).abs() < 1e-9);
        assert!(frame.samples.len() >= 2 * 2000);
    }

    #[test]
    fn test_sink_format_change_rebuilds_resampler() {
        let (mut reader, codec) = source(stereo_48k());
        let output = Arc::new(SwitchableOutput(Mutex::new(AudioFormat::new(48_000, 2))));
        let decoder = AudioDecoder::new(codec, 1.0 / 48_000.0, output.clone(), 2.0);

        feed(reader.as_mut(), &decoder, 1);
        decoder.set_end_of_file(true);
        decoder.run(&());
        let Some(before) = decoder.get_frame_non_blocking() else {
            panic!("Expected frame");
        };
        assert_eq!(before.channels, 2);
        assert_eq!(before.samples.len(), 2048);

        *output.0.lock() = AudioFormat::new(48_000, 1);
        feed(reader.as_mut(), &decoder, 1);
        decoder.run(&());
        let Some(after) = decoder.get_frame_non_blocking() else {
            panic!("Expected frame");
        };
        assert_eq!(after.channels, 1);
        assert_eq!(after.samples.len(), 1024);
    }

    #[test]
    fn test_unknown_packet_duration_uses_sample_count() {
        let (mut reader, codec) = source(stereo_48k().with_unknown_packet_durations());
        let decoder = AudioDecoder::new(codec, 1.0 / 48_000.0, Arc::new(AudioFormat::default()), 2.0);
        feed(reader.as_mut(), &decoder, 1);
        decoder.set_end_of_file(true);
        decoder.run(&());

        let Some(frame) = decoder.get_frame_non_blocking() else {
            panic!("Expected frame");
        };
        assert!((frame.duration - 1024.0 / 48_000.0).abs() < 1e-9);
    }

    #[test]
    fn test_flush_discards_queued_audio() {
        let (mut reader, codec) = source(stereo_48k());
        let decoder = AudioDecoder::new(codec, 1.0 / 48_000.0, Arc::new(AudioFormat::default()), 2.0);
        feed(reader.as_mut(), &decoder, 3);
        decoder.flush();
        assert_eq!(decoder.duration(), 0.0);
        decoder.set_end_of_file(true);
        decoder.run(&());
        assert!(decoder.get_frame_non_blocking().is_none());
    }

    #[test]
    fn test_blocking_get_returns_none_once_destroyed() {
        let (mut reader, codec) = source(stereo_48k());
        let decoder = AudioDecoder::new(codec, 1.0 / 48_000.0, Arc::new(AudioFormat::default()), 2.0);
        feed(reader.as_mut(), &decoder, 1);
        decoder.set_end_of_file(true);
        decoder.run(&());

        assert!(decoder.get_frame_blocking().is_some());
        decoder.destroy();
        assert!(decoder.get_frame_blocking().is_none());
    }

    #[test]
    fn test_decode_error_is_latched() {
        let config = stereo_48k().with_failure(SyntheticFailure::AudioDecode { after_packets: 2 });
        let (mut reader, codec) = source(config);
        let decoder = AudioDecoder::new(codec, 1.0 / 48_000.0, Arc::new(AudioFormat::default()), 2.0);
        feed(reader.as_mut(), &decoder, 4);
        decoder.run(&());

        let Some(err) = decoder.error() else {
            panic!("Expected latched error");
        };
        assert_eq!(err.kind(), ErrorKind::CodecSendPacket);
        assert!(!decoder.is_decoding());
        // Frames decoded before the failure stay available
        assert_eq!(std::iter::from_fn(|| decoder.get_frame_non_blocking()).count(), 2);
    }
}
