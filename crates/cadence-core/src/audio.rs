//! Audio output contract and shared audio controls.
//!
//! The player does not own an audio device. An external render callback pulls
//! interleaved f32 samples through [`crate::player::Player::render_audio`]; the
//! sink's format is described by an [`AudioOutput`] and queried by the audio
//! decoder on every decode so that a device change takes effect immediately.
//!
//! Audio is the master clock for A/V sync: the position of the most recently
//! fetched audio frame paces video presentation.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Sample format expected by the audio sink: interleaved f32.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of channels (1 = mono, 2 = stereo)
    pub channels: u16,
}

impl AudioFormat {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    /// Seconds covered by `frames` sample frames.
    pub fn frames_to_seconds(&self, frames: usize) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        frames as f64 / self.sample_rate as f64
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 2,
        }
    }
}

/// The audio sink the player renders into.
pub trait AudioOutput: Send + Sync {
    /// Current output format. May change between calls.
    fn format(&self) -> AudioFormat;
}

/// A sink with a fixed format.
impl AudioOutput for AudioFormat {
    fn format(&self) -> AudioFormat {
        *self
    }
}

/// Audio handle for volume and mute control.
///
/// This is a lightweight handle that can be cloned and shared between the
/// player, the render callback and UI controls.
#[derive(Clone)]
pub struct AudioHandle {
    inner: Arc<AudioHandleInner>,
}

struct AudioHandleInner {
    /// Volume level (0-100)
    volume: AtomicU32,
    /// Whether audio is muted
    muted: AtomicBool,
    /// Whether the opened media has a playable audio track
    available: AtomicBool,
    /// Sample frames written by the render callback, silence included
    frames_rendered: AtomicU64,
    /// Render calls that could not be filled completely while playing
    underruns: AtomicU64,
}

impl AudioHandle {
    /// Creates a new audio handle at full volume.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(AudioHandleInner {
                volume: AtomicU32::new(100),
                muted: AtomicBool::new(false),
                available: AtomicBool::new(false),
                frames_rendered: AtomicU64::new(0),
                underruns: AtomicU64::new(0),
            }),
        }
    }

    /// Returns the current volume (0-100).
    pub fn volume(&self) -> u32 {
        self.inner.volume.load(Ordering::Relaxed)
    }

    /// Sets the volume (0-100).
    pub fn set_volume(&self, volume: u32) {
        self.inner.volume.store(volume.min(100), Ordering::Relaxed);
    }

    /// Returns whether audio is muted.
    pub fn is_muted(&self) -> bool {
        self.inner.muted.load(Ordering::Relaxed)
    }

    /// Sets the mute state.
    pub fn set_muted(&self, muted: bool) {
        self.inner.muted.store(muted, Ordering::Relaxed);
    }

    /// Toggles the mute state.
    pub fn toggle_mute(&self) {
        self.inner.muted.fetch_xor(true, Ordering::Relaxed);
    }

    /// Returns the effective volume (0.0-1.0) accounting for mute.
    pub fn effective_volume(&self) -> f32 {
        if self.is_muted() {
            0.0
        } else {
            self.volume() as f32 / 100.0
        }
    }

    /// Scales samples in place by the effective volume.
    pub fn apply_volume(&self, samples: &mut [f32]) {
        let gain = self.effective_volume();
        if gain >= 1.0 {
            return;
        }
        for sample in samples {
            *sample *= gain;
        }
    }

    /// Returns whether the opened media has audio.
    pub fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::Relaxed)
    }

    pub(crate) fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::Relaxed);
    }

    /// Sample frames written by the render callback so far.
    pub fn frames_rendered(&self) -> u64 {
        self.inner.frames_rendered.load(Ordering::Relaxed)
    }

    pub(crate) fn add_frames_rendered(&self, frames: u64) {
        self.inner.frames_rendered.fetch_add(frames, Ordering::Relaxed);
    }

    /// Render calls that ran out of decoded audio while playing.
    pub fn underruns(&self) -> u64 {
        self.inner.underruns.load(Ordering::Relaxed)
    }

    pub(crate) fn record_underrun(&self) {
        self.inner.underruns.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for AudioHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AudioHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioHandle")
            .field("volume", &self.volume())
            .field("muted", &self.is_muted())
            .field("available", &self.is_available())
            .finish()
    }
}
