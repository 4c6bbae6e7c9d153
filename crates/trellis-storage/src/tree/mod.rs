//! The term tree: a disk-backed B+tree keyed by term id or term text.

mod cache;
mod context;
mod coordinates;
mod intermediate;
mod iter;
mod keys;
mod leaf;
mod node;
mod root;
mod store;

pub use context::TreeContext;
pub use iter::TreeIter;
pub use root::{Root, TreeStats, METADATA_FILE};
