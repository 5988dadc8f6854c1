//! LRU page replacement policy for the buffer pool.

use crate::frame::FrameId;
use hashlink::LinkedHashSet;
use parking_lot::Mutex;

/// Strict least-recently-unpinned replacement.
///
/// Tracks the set of eviction-eligible frames in unpin order: the front of
/// the set is the frame whose pin count reached zero longest ago, the back is
/// the most recently unpinned. Pinned frames are not tracked at all; the
/// buffer pool hands frames to the replacer only when their pin count drops
/// to zero and withdraws them on re-pin.
///
/// All operations are O(1) and guarded by a single mutex. The replacer never
/// touches disk.
pub struct LruReplacer {
    /// Maximum number of frames the replacer can track.
    capacity: usize,
    /// Eviction-eligible frames, oldest at the front.
    evictable: Mutex<LinkedHashSet<FrameId>>,
}

impl LruReplacer {
    /// Creates a new replacer bounded by the pool's frame count.
    pub fn new(num_frames: usize) -> Self {
        Self {
            capacity: num_frames,
            evictable: Mutex::new(LinkedHashSet::with_capacity(num_frames)),
        }
    }

    /// Returns the maximum number of trackable frames.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Removes and returns the least-recently-unpinned frame.
    ///
    /// Returns None if no frames are evictable.
    pub fn victim(&self) -> Option<FrameId> {
        self.evictable.lock().pop_front()
    }

    /// Marks a frame as in use: removes it from the eligible set.
    ///
    /// Idempotent; a frame that is not tracked is ignored.
    pub fn pin(&self, frame_id: FrameId) {
        self.evictable.lock().remove(&frame_id);
    }

    /// Marks a frame as eviction-eligible: appends it at the back.
    ///
    /// Idempotent; a frame already tracked keeps its position. Unpinning
    /// beyond capacity is a caller bug and is silently ignored.
    pub fn unpin(&self, frame_id: FrameId) {
        let mut evictable = self.evictable.lock();
        if !evictable.contains(&frame_id) && evictable.len() < self.capacity {
            evictable.insert(frame_id);
        }
    }

    /// Returns the number of evictable frames.
    pub fn size(&self) -> usize {
        self.evictable.lock().len()
    }
}
