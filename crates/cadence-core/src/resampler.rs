//! Sample rate and channel layout conversion for decoded audio.
//!
//! Codecs deliver interleaved f32 at the stream's native rate and channel
//! count; the sink wants its own. Channels are remixed first (duplicated when
//! upmixing, averaged when downmixing), then the rate is converted by linear
//! interpolation. Interpolation state carries across calls so consecutive
//! blocks join without clicks.

use crate::audio::AudioFormat;
use crate::error::{DecodeError, ErrorKind, Result};

/// Highest channel count accepted on either side.
pub const MAX_CHANNELS: u16 = 8;

/// Converts interleaved f32 audio from one format to another.
pub struct Resampler {
    in_rate: u32,
    in_channels: u16,
    output: AudioFormat,
    /// Input frames advanced per output frame
    step: f64,
    /// Position of the next output frame, in input frames relative to the
    /// first frame of the next block (negative values fall on `previous`)
    position: f64,
    /// Last remixed input frame of the previous block
    previous: Option<Vec<f32>>,
    /// Remixed input of the current block
    remixed: Vec<f32>,
}

impl Resampler {
    /// Creates a converter from `in_rate`/`in_channels` to `output`.
    pub fn new(in_rate: u32, in_channels: u16, output: AudioFormat) -> Result<Self> {
        let valid = |rate: u32, channels: u16| rate > 0 && channels > 0 && channels <= MAX_CHANNELS;
        if !valid(in_rate, in_channels) || !valid(output.sample_rate, output.channels) {
            return Err(DecodeError::new(
                ErrorKind::ResamplerInit,
                format!(
                    "unsupported conversion {}Hz/{}ch -> {}Hz/{}ch",
                    in_rate, in_channels, output.sample_rate, output.channels
                ),
            ));
        }
        tracing::debug!(
            "Resampler {}Hz/{}ch -> {}Hz/{}ch",
            in_rate,
            in_channels,
            output.sample_rate,
            output.channels
        );
        Ok(Self {
            in_rate,
            in_channels,
            output,
            step: in_rate as f64 / output.sample_rate as f64,
            position: 0.0,
            previous: None,
            remixed: Vec::new(),
        })
    }

    /// Returns true if this converter handles exactly this conversion.
    pub fn matches(&self, in_rate: u32, in_channels: u16, output: AudioFormat) -> bool {
        self.in_rate == in_rate && self.in_channels == in_channels && self.output == output
    }

    /// Output format produced by [`convert`](Self::convert).
    pub fn output(&self) -> AudioFormat {
        self.output
    }

    /// Upper bound of output samples for `input_samples` interleaved input samples.
    ///
    /// Scales by the rate and channel ratios (each at least 1) with 2x headroom.
    pub fn output_capacity(&self, input_samples: usize) -> usize {
        let rate_ratio = (self.output.sample_rate as f64 / self.in_rate as f64).max(1.0);
        let channel_ratio = (self.output.channels as f64 / self.in_channels as f64).max(1.0);
        (input_samples as f64 * rate_ratio * channel_ratio * 2.0).ceil() as usize
    }

    /// Drops interpolation state, e.g. after a seek.
    pub fn reset(&mut self) {
        self.position = 0.0;
        self.previous = None;
    }

    /// Converts one block of interleaved input, replacing `out`'s contents.
    pub fn convert(&mut self, input: &[f32], out: &mut Vec<f32>) {
        out.clear();
        let in_ch = self.in_channels as usize;
        let out_ch = self.output.channels as usize;
        let frames = input.len() / in_ch;
        if frames == 0 {
            return;
        }
        out.reserve(self.output_capacity(input.len()));

        self.remixed.clear();
        for frame in input.chunks_exact(in_ch) {
            remix_frame(frame, out_ch, &mut self.remixed);
        }

        if self.in_rate == self.output.sample_rate {
            out.extend_from_slice(&self.remixed);
            return;
        }

        let last = (frames - 1) as f64;
        let mut position = self.position;
        while position < last {
            let index = position.floor();
            let frac = (position - index) as f32;
            let index = index as isize;
            for c in 0..out_ch {
                let a = self.sample_at(index, c);
                let b = self.sample_at(index + 1, c);
                out.push(a + (b - a) * frac);
            }
            position += self.step;
        }
        self.position = position - frames as f64;

        let tail = &self.remixed[(frames - 1) * out_ch..];
        match &mut self.previous {
            Some(previous) => {
                previous.clear();
                previous.extend_from_slice(tail);
            }
            None => self.previous = Some(tail.to_vec()),
        }
    }

    /// Sample of channel `c` at remixed frame `index`; -1 is the previous block's last frame.
    fn sample_at(&self, index: isize, c: usize) -> f32 {
        let out_ch = self.output.channels as usize;
        if index < 0 {
            return self
                .previous
                .as_ref()
                .and_then(|p| p.get(c).copied())
                .unwrap_or_else(|| self.remixed.get(c).copied().unwrap_or(0.0));
        }
        self.remixed
            .get(index as usize * out_ch + c)
            .copied()
            .unwrap_or(0.0)
    }
}

/// Maps one input frame onto `out_channels` channels.
fn remix_frame(frame: &[f32], out_channels: usize, out: &mut Vec<f32>) {
    let in_channels = frame.len();
    if in_channels == out_channels {
        out.extend_from_slice(frame);
    } else if out_channels > in_channels {
        out.extend((0..out_channels).map(|c| frame[c % in_channels]));
    } else {
        for c in 0..out_channels {
            let (sum, count) = frame
                .iter()
                .skip(c)
                .step_by(out_channels)
                .fold((0.0f32, 0u32), |(sum, n), s| (sum + s, n + 1));
            out.push(if count == 0 { 0.0 } else { sum / count as f32 });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn convert_all(resampler: &mut Resampler, input: &[f32]) -> Vec<f32> {
        let mut out = Vec::new();
        resampler.convert(input, &mut out);
        out
    }

    #[test]
    fn test_rejects_invalid_formats() {
        assert!(Resampler::new(0, 2, AudioFormat::default()).is_err());
        assert!(Resampler::new(48_000, 0, AudioFormat::default()).is_err());
        let Err(err) = Resampler::new(48_000, 2, AudioFormat::new(48_000, 12)) else {
            panic!("Expected too many channels to fail");
        };
        assert_eq!(err.kind(), ErrorKind::ResamplerInit);
    }

    #[test]
    fn test_passthrough_keeps_samples() {
        let Ok(mut resampler) = Resampler::new(48_000, 2, AudioFormat::new(48_000, 2)) else {
            panic!("Expected resampler");
        };
        let input = [0.1, 0.2, 0.3, 0.4];
        assert_eq!(convert_all(&mut resampler, &input), input.to_vec());
        assert!(resampler.matches(48_000, 2, AudioFormat::new(48_000, 2)));
        assert!(!resampler.matches(44_100, 2, AudioFormat::new(48_000, 2)));
    }

    #[test]
    fn test_channel_remix() {
        let Ok(mut up) = Resampler::new(8_000, 1, AudioFormat::new(8_000, 2)) else {
            panic!("Expected resampler");
        };
        assert_eq!(convert_all(&mut up, &[0.5, -0.5]), vec![0.5, 0.5, -0.5, -0.5]);

        let Ok(mut down) = Resampler::new(8_000, 2, AudioFormat::new(8_000, 1)) else {
            panic!("Expected resampler");
        };
        assert_eq!(convert_all(&mut down, &[1.0, 0.0, 0.5, 0.5]), vec![0.5, 0.5]);
    }

    #[test]
    fn test_upsampling_doubles_length() {
        let Ok(mut resampler) = Resampler::new(24_000, 1, AudioFormat::new(48_000, 1)) else {
            panic!("Expected resampler");
        };
        let input: Vec<f32> = (0..100).map(|i| i as f32).collect();
        let out = convert_all(&mut resampler, &input);
        assert_eq!(out.len(), 198);
        // Linear input stays linear: output k sits at input position k / 2
        for (k, value) in out.iter().enumerate() {
            assert!((value - k as f32 * 0.5).abs() < 1e-3);
        }
        assert!(out.len() <= resampler.output_capacity(input.len()));
    }

    #[test]
    fn test_blocks_join_seamlessly() {
        let ramp: Vec<f32> = (0..480).map(|i| i as f32 * 0.001).collect();

        let Ok(mut whole) = Resampler::new(48_000, 1, AudioFormat::new(44_100, 1)) else {
            panic!("Expected resampler");
        };
        let expected = convert_all(&mut whole, &ramp);

        let Ok(mut chunked) = Resampler::new(48_000, 1, AudioFormat::new(44_100, 1)) else {
            panic!("Expected resampler");
        };
        let mut joined = Vec::new();
        for block in ramp.chunks(100) {
            joined.extend(convert_all(&mut chunked, block));
        }

        assert_eq!(joined.len(), expected.len());
        for (a, b) in joined.iter().zip(&expected) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn test_reset_forgets_previous_block() {
        let Ok(mut resampler) = Resampler::new(22_050, 1, AudioFormat::new(44_100, 1)) else {
            panic!("Expected resampler");
        };
        let _ = convert_all(&mut resampler, &[1.0; 64]);
        resampler.reset();
        let out = convert_all(&mut resampler, &[0.0; 64]);
        assert!(out.iter().all(|s| *s == 0.0));
    }
}
