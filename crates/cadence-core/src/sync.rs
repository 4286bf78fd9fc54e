//! Pacing rules and A/V synchronization metrics.
//!
//! The player's loops delegate every timing decision to the pure functions in
//! this module so that the policies can be tested without threads:
//!
//! - [`video_sync_delay`] / [`video_frame_delay`]: how long the display loop
//!   waits before presenting the next video frame
//! - [`clamp_seek_target`]: bounds a seek so playback does not land in a
//!   region that would immediately re-buffer
//! - [`should_throttle_read`]: read-loop backpressure on queued packet bytes
//! - [`BufferingPolicy`]: hysteresis between buffering and playing
//!
//! [`SyncMetrics`] records how far presented video drifts from the audio
//! clock.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Threshold for acceptable A/V sync drift.
pub const SYNC_DRIFT_THRESHOLD_MS: i64 = 100;

/// Threshold for warning-level drift.
pub const SYNC_DRIFT_WARNING_MS: i64 = 150;

/// Threshold for severe drift.
pub const SYNC_DRIFT_SEVERE_MS: i64 = 200;

/// Shortest sleep of the display loop while waiting for the audio clock.
pub const MIN_SYNC_SLEEP: Duration = Duration::from_millis(15);

/// Frame durations below this are treated as unknown.
const MIN_FRAME_DURATION: f64 = 0.0001;

/// Seek lookahead kept clear of the end of the stream when audio is present.
pub const SEEK_LOOKAHEAD_WITH_AUDIO: f64 = 8.0;

/// Seek lookahead kept clear of the end of the stream for video only.
pub const SEEK_LOOKAHEAD_VIDEO_ONLY: f64 = 15.0;

/// Buffered duration at or below which playback starts buffering.
pub const BUFFERING_LOW_WATERMARK: f64 = 0.2;

/// Read-loop sleep while over the packet cap and playing.
pub const READ_THROTTLE_PLAYING: Duration = Duration::from_millis(100);

/// Read-loop sleep while over the packet cap and paused.
pub const READ_THROTTLE_PAUSED: Duration = Duration::from_millis(500);

fn frame_period(duration: f64, fps: f64) -> f64 {
    if duration >= MIN_FRAME_DURATION {
        duration
    } else if fps > 0.0 {
        1.0 / fps
    } else {
        0.0
    }
}

/// Audio-master pacing for the frame currently on screen.
///
/// Returns `None` once the audio clock has passed the end of the frame (the
/// next frame is due). Otherwise returns how long to sleep before checking
/// again: half a frame period or the time left until the frame ends,
/// whichever is smaller, but never less than [`MIN_SYNC_SLEEP`].
pub fn video_sync_delay(
    frame_position: f64,
    frame_duration: f64,
    fps: f64,
    audio_clock: f64,
) -> Option<Duration> {
    let period = frame_period(frame_duration, fps);
    let frame_end = frame_position + period;
    if audio_clock >= frame_end {
        return None;
    }
    let wait = (period / 2.0).min(frame_end - audio_clock);
    Some(Duration::from_secs_f64(wait.max(0.0)).max(MIN_SYNC_SLEEP))
}

/// Free-running pacing without audio: hold each frame for its own duration,
/// or `1 / fps` when the duration is unknown.
pub fn video_frame_delay(frame_duration: f64, fps: f64) -> Duration {
    Duration::from_secs_f64(frame_period(frame_duration, fps).max(0.0))
}

/// Clamps a seek request into `[seek_min_time, duration - (min_buffered + lookahead)]`.
///
/// The lookahead is [`SEEK_LOOKAHEAD_WITH_AUDIO`] or
/// [`SEEK_LOOKAHEAD_VIDEO_ONLY`]. When the upper bound falls below
/// `seek_min_time` the target collapses to `seek_min_time`.
pub fn clamp_seek_target(
    target: f64,
    duration: f64,
    min_buffered: f64,
    seek_min_time: f64,
    has_audio: bool,
) -> f64 {
    let lookahead = if has_audio {
        SEEK_LOOKAHEAD_WITH_AUDIO
    } else {
        SEEK_LOOKAHEAD_VIDEO_ONLY
    };
    let max = (duration - (min_buffered + lookahead)).max(seek_min_time);
    if target > max {
        max
    } else if target < seek_min_time || target.is_nan() {
        seek_min_time
    } else {
        target
    }
}

/// Read-loop backpressure.
///
/// Returns the sleep to take when the packet bytes queued across all decoders
/// reach `cap`, `None` when reading may continue.
pub fn should_throttle_read(queued_bytes: usize, cap: usize, paused: bool) -> Option<Duration> {
    if queued_bytes < cap {
        return None;
    }
    Some(if paused {
        READ_THROTTLE_PAUSED
    } else {
        READ_THROTTLE_PLAYING
    })
}

/// Buffering hysteresis.
///
/// Buffering starts once the buffered duration drops to
/// [`BUFFERING_LOW_WATERMARK`] (unless the input is exhausted). It ends once
/// the buffered duration reaches the configured minimum and is above the
/// watermark, or the input hits end of file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferingPolicy {
    /// Buffered seconds required to leave buffering
    pub min_buffered: f64,
}

impl BufferingPolicy {
    pub fn new(min_buffered: f64) -> Self {
        Self {
            min_buffered: min_buffered.max(0.0),
        }
    }

    /// Buffered seconds at or below which buffering starts.
    pub fn low_watermark(&self) -> f64 {
        BUFFERING_LOW_WATERMARK
    }

    /// Next value of the buffering flag.
    pub fn next(&self, buffering: bool, buffered: f64, end_of_file: bool) -> bool {
        if end_of_file {
            return false;
        }
        let low = self.low_watermark();
        if buffering {
            !(buffered >= self.min_buffered && buffered > low)
        } else {
            buffered <= low
        }
    }
}

impl Default for BufferingPolicy {
    fn default() -> Self {
        Self::new(0.0)
    }
}

fn seconds_to_us(seconds: f64) -> i64 {
    (seconds * 1_000_000.0).round() as i64
}

/// A/V synchronization metrics tracker.
///
/// Thread-safe structure updated by the display loop (drift, discards) and
/// the player (underruns). Clones share the same counters.
#[derive(Clone)]
pub struct SyncMetrics {
    inner: Arc<SyncMetricsInner>,
}

struct SyncMetricsInner {
    /// Current drift in microseconds (video position - audio clock, positive = video ahead)
    current_drift_us: AtomicI64,
    /// Maximum positive drift seen (video ahead of audio)
    max_drift_ahead_us: AtomicI64,
    /// Maximum negative drift seen (video behind audio)
    max_drift_behind_us: AtomicI64,
    /// Sum of absolute drift values for average calculation
    total_drift_us: AtomicU64,
    /// Number of frames measured
    sample_count: AtomicU64,
    /// Number of frames where drift exceeded threshold
    out_of_sync_count: AtomicU64,
    /// Frames dropped because their position went backwards
    discarded_count: AtomicU64,
    /// Times buffering started during playback
    underrun_count: AtomicU64,
    last_video_position_us: AtomicI64,
    last_audio_clock_us: AtomicI64,
}

impl SyncMetrics {
    /// Creates a new sync metrics tracker.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SyncMetricsInner {
                current_drift_us: AtomicI64::new(0),
                max_drift_ahead_us: AtomicI64::new(0),
                max_drift_behind_us: AtomicI64::new(0),
                total_drift_us: AtomicU64::new(0),
                sample_count: AtomicU64::new(0),
                out_of_sync_count: AtomicU64::new(0),
                discarded_count: AtomicU64::new(0),
                underrun_count: AtomicU64::new(0),
                last_video_position_us: AtomicI64::new(0),
                last_audio_clock_us: AtomicI64::new(0),
            }),
        }
    }

    /// Records a presented video frame against the audio clock.
    ///
    /// Returns the signed drift in microseconds.
    pub fn record_frame(&self, video_position: f64, audio_clock: f64) -> i64 {
        let video_us = seconds_to_us(video_position);
        let audio_us = seconds_to_us(audio_clock);
        let drift_us = video_us - audio_us;

        self.inner.current_drift_us.store(drift_us, Ordering::Relaxed);
        self.inner
            .last_video_position_us
            .store(video_us, Ordering::Relaxed);
        self.inner
            .last_audio_clock_us
            .store(audio_us, Ordering::Relaxed);

        if drift_us > 0 {
            self.inner
                .max_drift_ahead_us
                .fetch_max(drift_us, Ordering::Relaxed);
        } else {
            self.inner
                .max_drift_behind_us
                .fetch_min(drift_us, Ordering::Relaxed);
        }

        self.inner
            .total_drift_us
            .fetch_add(drift_us.unsigned_abs(), Ordering::Relaxed);
        self.inner.sample_count.fetch_add(1, Ordering::Relaxed);

        let drift_ms = drift_us.abs() / 1000;
        if drift_ms > SYNC_DRIFT_THRESHOLD_MS {
            self.inner.out_of_sync_count.fetch_add(1, Ordering::Relaxed);
            if drift_ms > SYNC_DRIFT_WARNING_MS {
                let direction = if drift_us > 0 { "ahead" } else { "behind" };
                tracing::warn!(
                    "A/V sync: video {}ms {} audio (video={:.3}s, audio={:.3}s)",
                    drift_ms,
                    direction,
                    video_position,
                    audio_clock
                );
            }
        }
        drift_us
    }

    /// Records a frame dropped for arriving behind the one on screen.
    pub fn record_discard(&self) {
        self.inner.discarded_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Records buffering starting while playing.
    pub fn record_underrun(&self) {
        self.inner.underrun_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Resets all metrics.
    pub fn reset(&self) {
        let inner = &self.inner;
        inner.current_drift_us.store(0, Ordering::Relaxed);
        inner.max_drift_ahead_us.store(0, Ordering::Relaxed);
        inner.max_drift_behind_us.store(0, Ordering::Relaxed);
        inner.total_drift_us.store(0, Ordering::Relaxed);
        inner.sample_count.store(0, Ordering::Relaxed);
        inner.out_of_sync_count.store(0, Ordering::Relaxed);
        inner.discarded_count.store(0, Ordering::Relaxed);
        inner.underrun_count.store(0, Ordering::Relaxed);
        inner.last_video_position_us.store(0, Ordering::Relaxed);
        inner.last_audio_clock_us.store(0, Ordering::Relaxed);
    }

    /// Returns a snapshot of current sync metrics.
    pub fn snapshot(&self) -> SyncMetricsSnapshot {
        let sample_count = self.inner.sample_count.load(Ordering::Relaxed);
        let total_drift = self.inner.total_drift_us.load(Ordering::Relaxed);
        let avg_drift_us = if sample_count > 0 {
            (total_drift / sample_count) as i64
        } else {
            0
        };

        SyncMetricsSnapshot {
            current_drift_us: self.inner.current_drift_us.load(Ordering::Relaxed),
            max_drift_ahead_us: self.inner.max_drift_ahead_us.load(Ordering::Relaxed),
            max_drift_behind_us: self.inner.max_drift_behind_us.load(Ordering::Relaxed),
            avg_drift_us,
            sample_count,
            out_of_sync_count: self.inner.out_of_sync_count.load(Ordering::Relaxed),
            discarded_count: self.inner.discarded_count.load(Ordering::Relaxed),
            underrun_count: self.inner.underrun_count.load(Ordering::Relaxed),
            last_video_position: self.inner.last_video_position_us.load(Ordering::Relaxed) as f64
                / 1_000_000.0,
            last_audio_clock: self.inner.last_audio_clock_us.load(Ordering::Relaxed) as f64
                / 1_000_000.0,
        }
    }

    /// Returns true if sync is currently within acceptable threshold.
    pub fn is_in_sync(&self) -> bool {
        let drift_us = self.inner.current_drift_us.load(Ordering::Relaxed);
        drift_us.abs() <= SYNC_DRIFT_THRESHOLD_MS * 1000
    }

    /// Logs current sync status at debug level.
    pub fn log_status(&self) {
        let snap = self.snapshot();
        tracing::debug!(
            "A/V Sync: current={:+}ms, max_ahead={:+}ms, max_behind={:+}ms, avg={}ms, samples={}, out_of_sync={}, discarded={}",
            snap.current_drift_us / 1000,
            snap.max_drift_ahead_us / 1000,
            snap.max_drift_behind_us / 1000,
            snap.avg_drift_us / 1000,
            snap.sample_count,
            snap.out_of_sync_count,
            snap.discarded_count
        );
    }
}

impl Default for SyncMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of sync metrics at a point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncMetricsSnapshot {
    /// Current drift in microseconds (positive = video ahead of audio)
    pub current_drift_us: i64,
    /// Maximum drift where video was ahead of audio (microseconds)
    pub max_drift_ahead_us: i64,
    /// Maximum drift where video was behind audio (microseconds, negative)
    pub max_drift_behind_us: i64,
    /// Average absolute drift in microseconds
    pub avg_drift_us: i64,
    /// Total number of frames measured
    pub sample_count: u64,
    /// Number of frames where drift exceeded threshold
    pub out_of_sync_count: u64,
    /// Frames dropped for regressing position
    pub discarded_count: u64,
    /// Times buffering started during playback
    pub underrun_count: u64,
    /// Position of the last measured frame in seconds
    pub last_video_position: f64,
    /// Audio clock at the last measurement in seconds
    pub last_audio_clock: f64,
}

impl SyncMetricsSnapshot {
    /// Returns the current drift in milliseconds.
    pub fn current_drift_ms(&self) -> i64 {
        self.current_drift_us / 1000
    }

    /// Returns the maximum absolute drift in milliseconds.
    pub fn max_drift_ms(&self) -> i64 {
        self.max_drift_ahead_us
            .abs()
            .max(self.max_drift_behind_us.abs())
            / 1000
    }

    /// Returns the percentage of frames that were out of sync.
    pub fn out_of_sync_percentage(&self) -> f64 {
        if self.sample_count == 0 {
            0.0
        } else {
            (self.out_of_sync_count as f64 / self.sample_count as f64) * 100.0
        }
    }

    /// Returns true if the worst drift stayed below the severe threshold.
    pub fn never_severe(&self) -> bool {
        self.max_drift_ms() <= SYNC_DRIFT_SEVERE_MS
    }
}
