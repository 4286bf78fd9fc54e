//! Reusable buffer pool for decoded frames.
//!
//! Decoding allocates a plane or sample buffer for every frame. The pool keeps
//! those buffers in an arena of slots so that steady-state playback recycles
//! the same allocations instead of hitting the allocator per frame.
//!
//! Each slot is in exactly one of three states:
//!
//! ```text
//!   acquire()                 mark_playing()
//! Unused ─────────► InUse ─────────────────► Playing
//!   ▲                 │                         │
//!   │   release() /   │       mark_stopped() /  │
//!   │   flush()       │       next mark_playing │
//!   └─────────────────┴─────────────────────────┘
//! ```
//!
//! At most one slot is `Playing` at a time. The buffer itself travels with the
//! [`PooledBuffer`] handle and returns to its slot when the handle drops, so a
//! slot only becomes reusable once it is `Unused` *and* its buffer is home.
//!
//! The arena never grows past its capacity. When every slot is taken,
//! [`FramePool::acquire`] hands out a detached buffer that is freed on drop.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

/// Slots kept for video frame buffers: two seconds of 60 fps plus headroom.
pub const VIDEO_POOL_CAPACITY: usize = 128;

/// Slots kept for audio frame buffers.
pub const AUDIO_POOL_CAPACITY: usize = 500;

/// Identifies one slot of a [`FramePool`].
///
/// The generation guards against stale handles: once a slot is handed out
/// again, operations using an older id are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId {
    index: usize,
    generation: u64,
}

impl SlotId {
    /// Position of the slot in the arena.
    pub fn index(&self) -> usize {
        self.index
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Unused,
    InUse,
    Playing,
}

struct Slot<B> {
    state: SlotState,
    generation: u64,
    /// `None` while a [`PooledBuffer`] holds the buffer
    buffer: Option<B>,
}

struct PoolState<B> {
    slots: Vec<Slot<B>>,
    /// Indices of slots that are `Unused` with their buffer at home
    free: Vec<usize>,
    playing: Option<usize>,
    capacity: usize,
}

impl<B> PoolState<B> {
    fn slot_mut(&mut self, id: SlotId) -> Option<&mut Slot<B>> {
        self.slots
            .get_mut(id.index)
            .filter(|slot| slot.generation == id.generation)
    }

    /// Moves a slot to `Unused`, making it reusable if its buffer is home.
    fn retire(&mut self, index: usize) {
        let Some(slot) = self.slots.get_mut(index) else {
            return;
        };
        if slot.state == SlotState::Unused {
            return;
        }
        slot.state = SlotState::Unused;
        if slot.buffer.is_some() {
            self.free.push(index);
        }
        if self.playing == Some(index) {
            self.playing = None;
        }
    }

    /// Puts a buffer back into its slot. The slot always ends `Unused`.
    fn give_back(&mut self, id: SlotId, buffer: B) {
        let Some(slot) = self.slots.get_mut(id.index) else {
            return;
        };
        if slot.generation != id.generation || slot.buffer.is_some() {
            return;
        }
        slot.buffer = Some(buffer);
        slot.state = SlotState::Unused;
        self.free.push(id.index);
        if self.playing == Some(id.index) {
            self.playing = None;
        }
    }

    fn count(&self, state: SlotState) -> usize {
        self.slots.iter().filter(|s| s.state == state).count()
    }
}

/// A pool of reusable frame buffers.
///
/// Cloning the pool yields another handle to the same arena.
pub struct FramePool<B: Default> {
    inner: Arc<Mutex<PoolState<B>>>,
}

impl<B: Default> Clone for FramePool<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Default> FramePool<B> {
    /// Creates a pool of at most `capacity` slots, allocated on demand.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PoolState {
                slots: Vec::with_capacity(capacity),
                free: Vec::with_capacity(capacity),
                playing: None,
                capacity,
            })),
        }
    }

    /// Takes an unused buffer, allocating a fresh one if none is available.
    ///
    /// The returned buffer keeps whatever contents it had when it was last
    /// used; callers clear it before writing so the allocation is reused.
    /// Once the arena is full and nothing is free the buffer is detached.
    pub fn acquire(&self) -> PooledBuffer<B> {
        let mut state = self.inner.lock();
        let (index, buffer) = match state.free.pop() {
            Some(index) => {
                let slot = &mut state.slots[index];
                let buffer = slot.buffer.take().unwrap_or_default();
                (index, buffer)
            }
            None if state.slots.len() >= state.capacity => {
                tracing::trace!(capacity = state.capacity, "frame pool full, detached buffer");
                return PooledBuffer::detached(B::default());
            }
            None => {
                state.slots.push(Slot {
                    state: SlotState::Unused,
                    generation: 0,
                    buffer: None,
                });
                (state.slots.len() - 1, B::default())
            }
        };

        let slot = &mut state.slots[index];
        slot.state = SlotState::InUse;
        slot.generation = slot.generation.wrapping_add(1);
        let id = SlotId {
            index,
            generation: slot.generation,
        };
        tracing::trace!(slot = index, "frame pool acquire");

        PooledBuffer {
            id: Some(id),
            buffer,
            pool: Arc::downgrade(&self.inner),
        }
    }

    /// Returns a slot to the unused set without waiting for its handle to drop.
    pub fn release(&self, id: SlotId) {
        let mut state = self.inner.lock();
        if state.slot_mut(id).is_some() {
            state.retire(id.index);
        }
    }

    /// Marks a slot as the one currently being played.
    ///
    /// Any previously playing slot goes back to unused. Only in-use slots can
    /// start playing.
    pub fn mark_playing(&self, id: SlotId) {
        let mut state = self.inner.lock();
        let Some(slot) = state.slot_mut(id) else {
            return;
        };
        if slot.state == SlotState::Unused {
            return;
        }
        slot.state = SlotState::Playing;
        if let Some(previous) = state.playing.replace(id.index) {
            if previous != id.index {
                state.retire(previous);
            }
        }
    }

    /// Ends playback of a slot, returning it to unused.
    pub fn mark_stopped(&self, id: SlotId) {
        let mut state = self.inner.lock();
        if state.slot_mut(id).is_some() && state.playing == Some(id.index) {
            state.retire(id.index);
        }
    }

    /// Moves every in-use slot back to unused. The playing slot is untouched.
    pub fn flush(&self) {
        let mut state = self.inner.lock();
        let in_use: Vec<usize> = state
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state == SlotState::InUse)
            .map(|(i, _)| i)
            .collect();
        for index in in_use {
            state.retire(index);
        }
    }

    /// Number of slots in the unused set.
    pub fn unused_count(&self) -> usize {
        self.inner.lock().count(SlotState::Unused)
    }

    /// Number of slots in the in-use set.
    pub fn in_use_count(&self) -> usize {
        self.inner.lock().count(SlotState::InUse)
    }

    /// Index of the slot currently playing, if any.
    pub fn playing_slot(&self) -> Option<usize> {
        self.inner.lock().playing
    }

    /// Total number of slots ever allocated, never more than the capacity.
    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    /// Returns true if no slot was ever allocated.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A buffer borrowed from a [`FramePool`].
///
/// Dereferences to the buffer. Dropping the handle returns the buffer to its
/// slot; if the pool no longer exists the buffer is simply freed.
pub struct PooledBuffer<B: Default> {
    id: Option<SlotId>,
    buffer: B,
    pool: Weak<Mutex<PoolState<B>>>,
}

impl<B: Default> PooledBuffer<B> {
    /// Wraps a buffer that does not belong to any pool.
    pub fn detached(buffer: B) -> Self {
        Self {
            id: None,
            buffer,
            pool: Weak::new(),
        }
    }

    /// The slot this buffer came from, or `None` for detached buffers.
    pub fn slot(&self) -> Option<SlotId> {
        self.id
    }

    /// Marks this buffer's slot as playing.
    pub fn start_playing(&self) {
        let (Some(id), Some(pool)) = (self.id, self.pool.upgrade()) else {
            return;
        };
        FramePool { inner: pool }.mark_playing(id);
    }

    /// Ends playback of this buffer's slot.
    pub fn stop_playing(&self) {
        let (Some(id), Some(pool)) = (self.id, self.pool.upgrade()) else {
            return;
        };
        FramePool { inner: pool }.mark_stopped(id);
    }
}

impl<B: Default> Deref for PooledBuffer<B> {
    type Target = B;

    fn deref(&self) -> &B {
        &self.buffer
    }
}

impl<B: Default> DerefMut for PooledBuffer<B> {
    fn deref_mut(&mut self) -> &mut B {
        &mut self.buffer
    }
}

impl<B: Default> Drop for PooledBuffer<B> {
    fn drop(&mut self) {
        let Some(id) = self.id else {
            return;
        };
        if let Some(pool) = self.pool.upgrade() {
            let buffer = std::mem::take(&mut self.buffer);
            pool.lock().give_back(id, buffer);
        }
    }
}

impl<B: Default + std::fmt::Debug> std::fmt::Debug for PooledBuffer<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("slot", &self.id)
            .field("buffer", &self.buffer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_reuses_returned_buffers() {
        let pool: FramePool<Vec<u8>> = FramePool::with_capacity(4);

        let mut first = pool.acquire();
        first.extend_from_slice(&[1, 2, 3]);
        let first_slot = first.slot();
        drop(first);

        assert_eq!(pool.unused_count(), 1);
        assert_eq!(pool.in_use_count(), 0);

        let second = pool.acquire();
        assert_eq!(second.slot().map(|s| s.index()), first_slot.map(|s| s.index()));
        // Contents survive; callers clear before reuse
        assert_eq!(second.as_slice(), &[1, 2, 3]);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_grows_when_no_unused_slot() {
        let pool: FramePool<Vec<f32>> = FramePool::with_capacity(4);
        let a = pool.acquire();
        let b = pool.acquire();
        let c = pool.acquire();

        assert_eq!(pool.len(), 3);
        assert_eq!(pool.in_use_count(), 3);
        drop((a, b, c));
        assert_eq!(pool.unused_count(), 3);
    }

    #[test]
    fn test_growth_stops_at_capacity() {
        let pool: FramePool<Vec<f32>> = FramePool::with_capacity(2);
        let a = pool.acquire();
        let b = pool.acquire();
        let mut overflow = pool.acquire();
        overflow.push(1.0);

        assert_eq!(pool.len(), 2);
        assert_eq!(overflow.slot(), None);
        // Detached buffers never take the playing slot
        overflow.start_playing();
        assert_eq!(pool.playing_slot(), None);

        drop(overflow);
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.unused_count(), 0);

        // A returned slot is reused before anything is detached
        let Some(freed) = a.slot() else {
            panic!("Expected pooled slot id");
        };
        drop(a);
        let reused = pool.acquire();
        assert_eq!(reused.slot().map(|s| s.index()), Some(freed.index()));
        drop((b, reused));
        assert_eq!(pool.unused_count(), 2);
    }

    #[test]
    fn test_single_playing_slot() {
        let pool: FramePool<Vec<f32>> = FramePool::with_capacity(4);
        let a = pool.acquire();
        let b = pool.acquire();

        a.start_playing();
        let Some(playing) = pool.playing_slot() else {
            panic!("Expected a playing slot");
        };
        assert_eq!(Some(playing), a.slot().map(|s| s.index()));

        // Starting another frame retires the previous one
        b.start_playing();
        assert_eq!(pool.playing_slot(), b.slot().map(|s| s.index()));
        assert_eq!(pool.in_use_count(), 0);
        assert_eq!(pool.unused_count(), 1);

        b.stop_playing();
        assert_eq!(pool.playing_slot(), None);
        assert_eq!(pool.unused_count(), 2);
    }

    #[test]
    fn test_flush_leaves_playing_slot_alone() {
        let pool: FramePool<Vec<u8>> = FramePool::with_capacity(4);
        let playing = pool.acquire();
        let queued_a = pool.acquire();
        let queued_b = pool.acquire();
        playing.start_playing();

        pool.flush();

        assert_eq!(pool.in_use_count(), 0);
        assert_eq!(pool.unused_count(), 2);
        assert_eq!(pool.playing_slot(), playing.slot().map(|s| s.index()));

        // Flushed buffers are only reusable after their handles come home
        drop((queued_a, queued_b));
        let reused = pool.acquire();
        assert_ne!(reused.slot().map(|s| s.index()), playing.slot().map(|s| s.index()));
    }

    #[test]
    fn test_stale_slot_id_is_ignored() {
        let pool: FramePool<Vec<u8>> = FramePool::with_capacity(2);
        let first = pool.acquire();
        let Some(stale) = first.slot() else {
            panic!("Expected pooled slot id");
        };
        drop(first);

        let current = pool.acquire();
        pool.release(stale);
        pool.mark_playing(stale);

        assert_eq!(pool.in_use_count(), 1);
        assert_eq!(pool.playing_slot(), None);
        drop(current);
    }

    #[test]
    fn test_detached_buffer_has_no_slot() {
        let mut buffer = PooledBuffer::detached(vec![0u8; 4]);
        buffer[0] = 7;
        buffer.start_playing();
        assert_eq!(buffer.slot(), None);
        assert_eq!(buffer[0], 7);
    }

    #[test]
    fn test_buffer_outlives_pool() {
        let pool: FramePool<Vec<u8>> = FramePool::with_capacity(1);
        let buffer = pool.acquire();
        drop(pool);
        buffer.start_playing();
        drop(buffer);
    }
}
