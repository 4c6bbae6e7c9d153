//! Replacement policies for the node cache.

use crate::frame::FrameId;
use parking_lot::Mutex;
use std::collections::HashSet;

/// Trait for cache replacement algorithms.
pub trait Replacer: Send + Sync {
    /// Records that the given frame was accessed.
    fn record_access(&self, frame_id: FrameId);

    /// Marks a frame as evictable or pinned.
    fn set_evictable(&self, frame_id: FrameId, evictable: bool);

    /// Selects a victim frame for eviction.
    ///
    /// Returns None if no frames are evictable.
    fn evict(&self) -> Option<FrameId>;

    /// Removes a frame from the replacer.
    fn remove(&self, frame_id: FrameId);

    /// Returns the number of evictable frames.
    fn size(&self) -> usize;
}

/// Clock replacement algorithm implementation.
///
/// The clock algorithm maintains a circular buffer of frames with reference bits.
/// When selecting a victim:
/// 1. Check if current frame's reference bit is 0 and evictable
/// 2. If yes, select it as victim
/// 3. If no, clear reference bit and advance clock hand
/// 4. Repeat until victim found or two full circles completed
///
/// The node cache may temporarily hold more nodes than its configured
/// bound, so the clock grows whenever a frame beyond its size is touched.
pub struct ClockReplacer {
    /// Internal state protected by mutex.
    inner: Mutex<ClockReplacerInner>,
}

struct ClockReplacerInner {
    /// Reference bits for each frame.
    reference_bits: Vec<bool>,
    /// Set of evictable frame IDs.
    evictable: HashSet<FrameId>,
    /// Current clock hand position.
    clock_hand: usize,
}

impl ClockReplacerInner {
    fn ensure_frame(&mut self, frame_id: FrameId) {
        let needed = frame_id.0 as usize + 1;
        if self.reference_bits.len() < needed {
            self.reference_bits.resize(needed, false);
        }
    }
}

impl ClockReplacer {
    /// Creates a new clock replacer sized for the given number of frames.
    pub fn new(num_frames: usize) -> Self {
        Self {
            inner: Mutex::new(ClockReplacerInner {
                reference_bits: vec![false; num_frames],
                evictable: HashSet::new(),
                clock_hand: 0,
            }),
        }
    }

    /// Returns the number of frames the clock currently covers.
    pub fn capacity(&self) -> usize {
        self.inner.lock().reference_bits.len()
    }
}

impl Replacer for ClockReplacer {
    fn record_access(&self, frame_id: FrameId) {
        if !frame_id.is_valid() {
            return;
        }
        let mut inner = self.inner.lock();
        inner.ensure_frame(frame_id);
        inner.reference_bits[frame_id.0 as usize] = true;
    }

    fn set_evictable(&self, frame_id: FrameId, evictable: bool) {
        if !frame_id.is_valid() {
            return;
        }
        let mut inner = self.inner.lock();
        inner.ensure_frame(frame_id);

        if evictable {
            inner.evictable.insert(frame_id);
        } else {
            inner.evictable.remove(&frame_id);
        }
    }

    fn evict(&self) -> Option<FrameId> {
        let mut inner = self.inner.lock();

        if inner.evictable.is_empty() {
            return None;
        }

        let num_frames = inner.reference_bits.len();

        // Make at most 2 full rotations to find a victim
        for _ in 0..(2 * num_frames) {
            let hand = inner.clock_hand;
            let frame_id = FrameId(hand as u32);

            if inner.evictable.contains(&frame_id) {
                if !inner.reference_bits[hand] {
                    inner.evictable.remove(&frame_id);
                    inner.clock_hand = (hand + 1) % num_frames;
                    return Some(frame_id);
                }
                inner.reference_bits[hand] = false;
            }

            inner.clock_hand = (hand + 1) % num_frames;
        }

        // Every candidate was referenced twice in a row; take any of them
        let frame_id = inner.evictable.iter().next().copied()?;
        inner.evictable.remove(&frame_id);
        Some(frame_id)
    }

    fn remove(&self, frame_id: FrameId) {
        let mut inner = self.inner.lock();
        if (frame_id.0 as usize) < inner.reference_bits.len() {
            inner.evictable.remove(&frame_id);
            inner.reference_bits[frame_id.0 as usize] = false;
        }
    }

    fn size(&self) -> usize {
        self.inner.lock().evictable.len()
    }
}
