//! cadence-core: demux, decode and A/V sync core of the cadence media player.
//!
//! This crate turns a media URI into paced video frames and a pull-based
//! audio stream. It contains:
//!
//! - Queues and buffer reuse: [`packet_queue`], [`frame_queue`], [`frame_pool`]
//! - Container access: [`demux`] over the codec seams in [`codec`]
//! - Decoders: [`video_decoder`] (hardware with software fallback) and
//!   [`audio_decoder`] (with [`resampler`] conversion to the sink format)
//! - Playback orchestration: [`player`], paced by the rules in [`sync`]
//! - Backends: [`synthetic`] (always available) and `ffmpeg` (feature `ffmpeg`)
//!
//! Rendering and audio devices are out of scope; the application supplies a
//! [`VideoOutput`] and drives [`Player::render_audio`] from its audio callback.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use cadence_core::{Player, PlayerConfig, PlayerEvent, SyntheticBackend, SyntheticConfig};
//!
//! let backend = Arc::new(SyntheticBackend::new(SyntheticConfig::default()));
//! let player = Player::new(backend, PlayerConfig::default());
//! player.open("synthetic://clip?duration=5").expect("idle player");
//! player.play();
//! for event in player.events().iter() {
//!     if matches!(event, PlayerEvent::PlaybackFinished) {
//!         break;
//!     }
//! }
//! ```

pub mod audio;
pub mod audio_decoder;
pub mod codec;
pub mod demux;
pub mod error;
pub mod frame;
pub mod frame_pool;
pub mod frame_queue;
pub mod packet_queue;
pub mod player;
pub mod resampler;
pub mod sync;
pub mod synthetic;
pub mod video_decoder;

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;

pub use audio::{AudioFormat, AudioHandle, AudioOutput};
pub use codec::{CodecId, FallbackReason};
pub use demux::{FormatContext, MediaBackend, Track, TrackMetadata};
pub use error::{DecodeError, ErrorKind, Result};
pub use frame::{AudioFrame, MediaType, PixelFormat, Plane, VideoFrame};
pub use player::{
    MediaInfo, PlaybackSnapshot, Player, PlayerConfig, PlayerEvent, PlayerState, VideoOutput,
};
pub use sync::{SyncMetrics, SyncMetricsSnapshot, SYNC_DRIFT_THRESHOLD_MS};
pub use synthetic::{SyntheticAudio, SyntheticBackend, SyntheticConfig, SyntheticFailure};
pub use video_decoder::{DecodePath, HwAccelConfig};

#[cfg(feature = "ffmpeg")]
pub use ffmpeg::FfmpegBackend;
