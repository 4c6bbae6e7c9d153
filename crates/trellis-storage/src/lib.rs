//! Persistent indexing layer of the trellis triple store.
//!
//! [`Root`] is a disk-backed B+tree mapping term ids (or term text) to the
//! coordinates of their postings, paging nodes through a bounded cache.
//! [`BlockLocator`] is the sparse index that finds the block of a table file
//! covering a key.

mod locator;
mod tree;

pub use locator::BlockLocator;
pub use tree::{Root, TreeContext, TreeIter, TreeStats, METADATA_FILE};
