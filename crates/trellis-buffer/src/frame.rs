//! Frame bookkeeping for cached nodes.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Unique identifier for a frame in the node cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId(pub u32);

impl FrameId {
    /// Invalid frame ID.
    pub const INVALID: FrameId = FrameId(u32::MAX);

    /// Returns true if this is a valid frame ID.
    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl std::fmt::Display for FrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "frame:{}", self.0)
    }
}

/// A tracked object: its key and a non-owning handle to it.
#[derive(Debug)]
pub struct Frame<T> {
    pub key: u64,
    pub handle: Weak<T>,
}

/// Maps keys to frames holding weak handles.
///
/// The table never owns what it tracks. Frames are recycled through a free
/// list and the frame array grows when every frame is taken.
pub struct FrameTable<T> {
    frames: Vec<Option<Frame<T>>>,
    free_list: Vec<FrameId>,
    index: HashMap<u64, FrameId>,
}

impl<T> FrameTable<T> {
    /// Creates a table with room for `capacity` frames before growing.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            frames: Vec::with_capacity(capacity),
            free_list: Vec::new(),
            index: HashMap::with_capacity(capacity),
        }
    }

    /// Tracks `handle` under `key`.
    ///
    /// Returns the frame and whether it was newly assigned. A key that is
    /// already tracked keeps its frame and gets its handle refreshed.
    pub fn register(&mut self, key: u64, handle: &Arc<T>) -> (FrameId, bool) {
        if let Some(&frame_id) = self.index.get(&key) {
            if let Some(frame) = self.frames[frame_id.0 as usize].as_mut() {
                frame.handle = Arc::downgrade(handle);
            }
            return (frame_id, false);
        }

        let frame = Frame {
            key,
            handle: Arc::downgrade(handle),
        };
        let frame_id = match self.free_list.pop() {
            Some(frame_id) => {
                self.frames[frame_id.0 as usize] = Some(frame);
                frame_id
            }
            None => {
                let frame_id = FrameId(self.frames.len() as u32);
                self.frames.push(Some(frame));
                frame_id
            }
        };
        self.index.insert(key, frame_id);
        (frame_id, true)
    }

    /// Returns the frame tracking `key`.
    pub fn frame_of(&self, key: u64) -> Option<FrameId> {
        self.index.get(&key).copied()
    }

    /// Returns the frame contents.
    pub fn get(&self, frame_id: FrameId) -> Option<&Frame<T>> {
        self.frames.get(frame_id.0 as usize)?.as_ref()
    }

    /// Returns a strong handle to whatever `key` tracks, if still alive.
    pub fn lookup(&self, key: u64) -> Option<Arc<T>> {
        let frame_id = self.frame_of(key)?;
        self.get(frame_id)?.handle.upgrade()
    }

    /// Stops tracking the frame and returns it to the free list.
    pub fn remove(&mut self, frame_id: FrameId) -> Option<Frame<T>> {
        let frame = self.frames.get_mut(frame_id.0 as usize)?.take()?;
        if self.index.get(&frame.key) == Some(&frame_id) {
            self.index.remove(&frame.key);
        }
        self.free_list.push(frame_id);
        Some(frame)
    }

    /// Returns strong handles to every tracked object still alive.
    pub fn live_handles(&self) -> Vec<Arc<T>> {
        self.frames
            .iter()
            .flatten()
            .filter_map(|frame| frame.handle.upgrade())
            .collect()
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Number of frames allocated, used or free.
    pub fn num_frames(&self) -> usize {
        self.frames.len()
    }
}
