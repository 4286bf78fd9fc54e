//! Compressed packet queue for one elementary stream.
//!
//! The read loop pushes demuxed packets; the stream's decode loop pops them.
//! Besides real packets the queue carries [`QueuedPacket::Flush`], an in-band
//! marker that tells the decode loop to reset codec state at exactly that
//! point in the packet sequence.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

use crate::demux::CompressedPacket;

/// An entry of a [`PacketQueue`].
#[derive(Debug, Clone)]
pub enum QueuedPacket {
    /// A compressed packet to decode
    Packet(CompressedPacket),
    /// Reset the codec before decoding the next packet
    Flush,
}

impl QueuedPacket {
    fn size(&self) -> usize {
        match self {
            QueuedPacket::Packet(packet) => packet.size(),
            QueuedPacket::Flush => 0,
        }
    }
}

struct Entry {
    packet: QueuedPacket,
    /// Duration credited to the queue when this entry was pushed
    duration: f64,
}

struct QueueState {
    entries: VecDeque<Entry>,
    duration: f64,
    size: usize,
    destroyed: bool,
}

/// A thread-safe FIFO of compressed packets.
///
/// Tracks the total queued duration (seconds) and payload size (bytes).
pub struct PacketQueue {
    state: Mutex<QueueState>,
    packet_available: Condvar,
    /// Seconds per timestamp tick of the stream
    time_base: f64,
}

impl PacketQueue {
    /// Creates a queue for a stream with the given timebase (seconds per tick).
    pub fn new(time_base: f64) -> Self {
        Self {
            state: Mutex::new(QueueState {
                entries: VecDeque::new(),
                duration: 0.0,
                size: 0,
                destroyed: false,
            }),
            packet_available: Condvar::new(),
            time_base,
        }
    }

    /// Appends a packet at the tail.
    ///
    /// The packet's own duration is used when it is known, otherwise
    /// `fallback_duration` seconds are credited. Dropped once destroyed.
    pub fn put(&self, packet: QueuedPacket, fallback_duration: f64) {
        let duration = match &packet {
            QueuedPacket::Packet(p) if p.duration > 0 => p.duration as f64 * self.time_base,
            QueuedPacket::Packet(_) => fallback_duration.max(0.0),
            QueuedPacket::Flush => 0.0,
        };

        let mut state = self.state.lock();
        if state.destroyed {
            return;
        }
        state.duration += duration;
        state.size += packet.size();
        state.entries.push_back(Entry { packet, duration });
        self.packet_available.notify_one();
    }

    fn pop(state: &mut QueueState) -> Option<QueuedPacket> {
        let entry = state.entries.pop_front()?;
        state.duration -= entry.duration;
        state.size = state.size.saturating_sub(entry.packet.size());
        if state.duration <= 0.0 || state.entries.is_empty() {
            state.duration = 0.0;
        }
        if state.entries.is_empty() {
            state.size = 0;
        }
        Some(entry.packet)
    }

    /// Takes the head packet, waiting until one is available.
    ///
    /// Returns `None` without blocking further once the queue is destroyed.
    pub fn get_blocking(&self) -> Option<QueuedPacket> {
        let mut state = self.state.lock();
        loop {
            if state.destroyed {
                return None;
            }
            if let Some(packet) = Self::pop(&mut state) {
                return Some(packet);
            }
            self.packet_available.wait(&mut state);
        }
    }

    /// Takes the head packet if one is queued.
    pub fn get_non_blocking(&self) -> Option<QueuedPacket> {
        let mut state = self.state.lock();
        if state.destroyed {
            return None;
        }
        Self::pop(&mut state)
    }

    /// Drops every queued packet and zeroes the counters.
    pub fn flush(&self) {
        let mut state = self.state.lock();
        let dropped = state.entries.len();
        state.entries.clear();
        state.duration = 0.0;
        state.size = 0;
        tracing::trace!("PacketQueue::flush: dropped {} packets", dropped);
    }

    /// Flushes the queue and permanently wakes every waiter.
    pub fn destroy(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.duration = 0.0;
        state.size = 0;
        state.destroyed = true;
        self.packet_available.notify_all();
    }

    /// Returns true once [`destroy`](Self::destroy) has been called.
    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    /// Total queued duration in seconds.
    pub fn duration(&self) -> f64 {
        self.state.lock().duration
    }

    /// Total queued payload in bytes.
    pub fn size(&self) -> usize {
        self.state.lock().size
    }

    /// Number of queued entries, flush markers included.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Seconds per timestamp tick.
    pub fn time_base(&self) -> f64 {
        self.time_base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn packet(bytes: usize, duration: i64) -> QueuedPacket {
        QueuedPacket::Packet(CompressedPacket {
            stream_index: 0,
            data: Bytes::from(vec![0u8; bytes]),
            pts: Some(0),
            dts: Some(0),
            duration,
        })
    }

    #[test]
    fn test_duration_uses_timebase_or_fallback() {
        let queue = PacketQueue::new(1.0 / 1000.0);
        queue.put(packet(10, 40), 0.5);
        assert!((queue.duration() - 0.040).abs() < 1e-9);

        // Unknown packet duration credits the fallback
        queue.put(packet(10, 0), 0.5);
        assert!((queue.duration() - 0.540).abs() < 1e-9);
        assert_eq!(queue.size(), 20);

        let Some(QueuedPacket::Packet(_)) = queue.get_non_blocking() else {
            panic!("Expected packet");
        };
        assert!((queue.duration() - 0.5).abs() < 1e-9);
        let _ = queue.get_non_blocking();
        assert_eq!(queue.duration(), 0.0);
        assert_eq!(queue.size(), 0);
    }

    #[test]
    fn test_flush_marker_is_queued_in_order() {
        let queue = PacketQueue::new(0.001);
        queue.put(packet(4, 10), 0.0);
        queue.put(QueuedPacket::Flush, 0.0);
        queue.put(packet(8, 10), 0.0);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.size(), 12);

        let kinds: Vec<bool> = std::iter::from_fn(|| queue.get_non_blocking())
            .map(|p| matches!(p, QueuedPacket::Flush))
            .collect();
        assert_eq!(kinds, vec![false, true, false]);
    }

    #[test]
    fn test_counters_non_negative_under_rounding() {
        let queue = PacketQueue::new(1.0 / 3.0);
        for d in [1, 2, 7, 11] {
            queue.put(packet(3, d), 0.0);
        }
        for _ in 0..4 {
            let _ = queue.get_non_blocking();
            assert!(queue.duration() >= 0.0);
        }
        assert_eq!(queue.duration(), 0.0);
        assert!(queue.get_non_blocking().is_none());
    }

    #[test]
    fn test_destroy_unblocks_and_drops_puts() {
        let queue = Arc::new(PacketQueue::new(0.001));
        let waiter = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.get_blocking().is_none())
        };
        std::thread::sleep(Duration::from_millis(30));
        let start = Instant::now();
        queue.destroy();

        let Ok(returned_none) = waiter.join() else {
            panic!("waiter thread panicked");
        };
        assert!(returned_none);
        assert!(start.elapsed() < Duration::from_secs(1));

        queue.put(packet(1, 1), 0.0);
        assert!(queue.is_empty());
        assert!(queue.is_destroyed());
    }

    #[test]
    fn test_flush_keeps_queue_usable() {
        let queue = PacketQueue::new(0.001);
        queue.put(packet(100, 5), 0.0);
        queue.flush();
        assert!(queue.is_empty());
        assert_eq!(queue.size(), 0);
        queue.put(packet(1, 5), 0.0);
        assert_eq!(queue.len(), 1);
    }
}
