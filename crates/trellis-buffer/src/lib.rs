//! Memory management for the trellis term tree.
//!
//! This crate provides:
//! - Object pools for coordinate cells and fixed-size arrays
//! - Frame bookkeeping for the node cache (weak, non-owning)
//! - Clock eviction policy for cache management

mod frame;
mod pool;
mod replacer;

pub use frame::{Frame, FrameId, FrameTable};
pub use pool::{ArrayPool, ObjectPool, PoolStats};
pub use replacer::{ClockReplacer, Replacer};
