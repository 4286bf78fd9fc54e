//! Frame queue for decoded audio and video.
//!
//! This module provides a thread-safe queue of decoded frames that decouples
//! a decode thread (producer) from the display loop or audio render callback
//! (consumer). Audio frames are queued in decode order; video frames are
//! inserted by position so that decoders emitting slightly out of
//! presentation order still yield a non-decreasing sequence to the consumer.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::frame::QueuedFrame;

struct QueueState<F> {
    frames: VecDeque<F>,
    /// Sum of queued frame durations in seconds
    duration: f64,
    /// Sum of queued frame payload sizes in bytes
    size: usize,
    destroyed: bool,
}

impl<F: QueuedFrame> QueueState<F> {
    fn account_push(&mut self, frame: &F) {
        self.duration += frame.duration();
        self.size += frame.size();
    }

    fn pop_front(&mut self) -> Option<F> {
        let frame = self.frames.pop_front()?;
        self.duration -= frame.duration();
        self.size = self.size.saturating_sub(frame.size());
        if self.duration <= 0.0 || self.frames.is_empty() {
            self.duration = 0.0;
        }
        if self.frames.is_empty() {
            self.size = 0;
        }
        Some(frame)
    }
}

/// A thread-safe queue of decoded frames.
///
/// One mutex and one condition variable guard the queue. The condition
/// variable is signaled on every accepted push and broadcast on
/// [`destroy`](Self::destroy).
pub struct FrameQueue<F> {
    state: Mutex<QueueState<F>>,
    frame_available: Condvar,
}

impl<F: QueuedFrame> FrameQueue<F> {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                frames: VecDeque::new(),
                duration: 0.0,
                size: 0,
                destroyed: false,
            }),
            frame_available: Condvar::new(),
        }
    }

    /// Appends a frame at the tail.
    ///
    /// Silently drops the frame once the queue has been destroyed.
    pub fn put(&self, frame: F) {
        let mut state = self.state.lock();
        if state.destroyed {
            return;
        }
        state.account_push(&frame);
        state.frames.push_back(frame);
        self.frame_available.notify_one();
    }

    /// Inserts a frame after the last queued frame whose position is not
    /// greater than the new frame's, scanning from the tail.
    ///
    /// Frames earlier than everything queued go to the head. Since decoders
    /// emit frames close to presentation order, the scan usually stops at
    /// the tail.
    pub fn put_sorted(&self, frame: F) {
        let mut state = self.state.lock();
        if state.destroyed {
            return;
        }
        let position = frame.position();
        let index = state
            .frames
            .iter()
            .rposition(|queued| queued.position() <= position)
            .map_or(0, |i| i + 1);
        state.account_push(&frame);
        state.frames.insert(index, frame);
        self.frame_available.notify_one();
    }

    /// Takes the head frame, waiting until one is available.
    ///
    /// Returns `None` without blocking further once the queue is destroyed.
    pub fn get_blocking(&self) -> Option<F> {
        let mut state = self.state.lock();
        loop {
            if state.destroyed {
                return None;
            }
            if let Some(frame) = state.pop_front() {
                return Some(frame);
            }
            self.frame_available.wait(&mut state);
        }
    }

    /// Takes the head frame, waiting at most `timeout` for one to arrive.
    pub fn get_timeout(&self, timeout: Duration) -> Option<F> {
        let mut state = self.state.lock();
        if state.destroyed {
            return None;
        }
        if state.frames.is_empty() {
            let result = self.frame_available.wait_for(&mut state, timeout);
            if state.destroyed || (result.timed_out() && state.frames.is_empty()) {
                return None;
            }
        }
        state.pop_front()
    }

    /// Takes the head frame if one is queued.
    pub fn get_non_blocking(&self) -> Option<F> {
        let mut state = self.state.lock();
        if state.destroyed {
            return None;
        }
        state.pop_front()
    }

    /// Drops every queued frame and zeroes the counters.
    pub fn flush(&self) {
        let dropped = {
            let mut state = self.state.lock();
            let count = state.frames.len();
            state.frames.clear();
            state.duration = 0.0;
            state.size = 0;
            count
        };
        tracing::debug!("FrameQueue::flush: dropped {} frames", dropped);
    }

    /// Flushes the queue and permanently wakes every waiter.
    pub fn destroy(&self) {
        let mut state = self.state.lock();
        state.frames.clear();
        state.duration = 0.0;
        state.size = 0;
        state.destroyed = true;
        self.frame_available.notify_all();
    }

    /// Returns true once [`destroy`](Self::destroy) has been called.
    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    /// Sum of queued frame durations in seconds.
    pub fn duration(&self) -> f64 {
        self.state.lock().duration
    }

    /// Sum of queued frame payload sizes in bytes.
    pub fn size(&self) -> usize {
        self.state.lock().size
    }

    /// Returns the number of queued frames.
    pub fn len(&self) -> usize {
        self.state.lock().frames.len()
    }

    /// Returns true if no frame is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<F: QueuedFrame> Default for FrameQueue<F> {
    fn default() -> Self {
        Self::new()
    }
}
