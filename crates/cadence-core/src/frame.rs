//! Decoded frame types.
//!
//! Frames carry their presentation position and duration in seconds. The
//! pixel and sample payloads live in [`PooledBuffer`]s so that they return to
//! their decoder's pool when the frame is dropped.

use crate::frame_pool::PooledBuffer;

/// Media type of a stream or track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaType {
    /// Video elementary stream
    Video,
    /// Audio elementary stream
    Audio,
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaType::Video => f.write_str("video"),
            MediaType::Audio => f.write_str("audio"),
        }
    }
}

/// Pixel format for decoded video frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUV 4:2:0 planar (most common software decoder output)
    Yuv420p,
    /// NV12 (Y plane + interleaved UV, common for hardware decoders)
    Nv12,
    /// RGBA 32-bit
    Rgba,
}

impl PixelFormat {
    /// Returns the number of planes for this format.
    pub fn num_planes(&self) -> usize {
        match self {
            PixelFormat::Yuv420p => 3,
            PixelFormat::Nv12 => 2,
            PixelFormat::Rgba => 1,
        }
    }
}

/// A single plane of pixel data.
#[derive(Debug, Clone, Default)]
pub struct Plane {
    /// Raw pixel data
    pub data: Vec<u8>,
    /// Stride (bytes per row, may include padding)
    pub stride: usize,
}

/// Common view of a queued frame, used by [`crate::frame_queue::FrameQueue`].
pub trait QueuedFrame: Send {
    /// Presentation position in seconds.
    fn position(&self) -> f64;
    /// Display duration in seconds.
    fn duration(&self) -> f64;
    /// Payload size in bytes.
    fn size(&self) -> usize;
}

/// A decoded video frame.
#[derive(Debug)]
pub struct VideoFrame {
    /// Presentation position in seconds
    pub position: f64,
    /// Display duration in seconds
    pub duration: f64,
    /// Pixel format of `planes`
    pub format: PixelFormat,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Pixel data planes
    pub planes: PooledBuffer<Vec<Plane>>,
    /// True if the frame came from the hardware decode path
    pub hardware: bool,
}

impl VideoFrame {
    /// Returns the frame dimensions.
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Returns the plane at `index`, if present.
    pub fn plane(&self, index: usize) -> Option<&Plane> {
        self.planes.get(index)
    }

    /// End of this frame's display interval.
    pub fn end(&self) -> f64 {
        self.position + self.duration
    }
}

impl QueuedFrame for VideoFrame {
    fn position(&self) -> f64 {
        self.position
    }

    fn duration(&self) -> f64 {
        self.duration
    }

    fn size(&self) -> usize {
        self.planes.iter().map(|p| p.data.len()).sum()
    }
}

/// A decoded, resampled block of interleaved f32 audio.
#[derive(Debug)]
pub struct AudioFrame {
    /// Presentation position in seconds
    pub position: f64,
    /// Playback duration in seconds
    pub duration: f64,
    /// Sample rate of `samples` in Hz
    pub sample_rate: u32,
    /// Channel count of `samples`
    pub channels: u16,
    /// Interleaved samples
    pub samples: PooledBuffer<Vec<f32>>,
}

impl AudioFrame {
    /// Number of sample frames (one sample per channel).
    pub fn frame_count(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / self.channels as usize
    }

    /// Marks this frame's buffer as the one being read by the render callback.
    pub fn start_playing(&self) {
        self.samples.start_playing();
    }

    /// Ends playback of this frame's buffer.
    pub fn stop_playing(&self) {
        self.samples.stop_playing();
    }
}

impl QueuedFrame for AudioFrame {
    fn position(&self) -> f64 {
        self.position
    }

    fn duration(&self) -> f64 {
        self.duration
    }

    fn size(&self) -> usize {
        self.samples.len() * std::mem::size_of::<f32>()
    }
}
