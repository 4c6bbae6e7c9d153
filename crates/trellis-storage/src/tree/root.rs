//! Entry point of a term tree.

use super::cache::NodeCache;
use super::context::TreeContext;
use super::intermediate::Intermediate;
use super::iter::TreeIter;
use super::keys::KeyRef;
use super::node::{separator, Node, NodeRef, ValueRef};
use super::store::NodeStore;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info};
use trellis_common::encoding::read_u64_le;
use trellis_common::{
    CoordinateSet, NodeId, Result, TermKey, TermValue, TreeConfig, TreeMode, TrellisError,
};

/// Name of the metadata file inside the tree directory.
pub const METADATA_FILE: &str = "tree";
/// Root id and next node id, 8 bytes each.
const METADATA_LEN: usize = 16;

/// Shape of a tree as checked by [`Root::verify`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    /// Levels from the root to the leaves, both included.
    pub height: usize,
    pub leaves: usize,
    pub intermediates: usize,
    /// Keys stored in leaves.
    pub entries: usize,
}

/// A disk-backed B+tree mapping terms to coordinates or 64-bit values.
///
/// Reads take `&self` and may run concurrently. Writes take `&mut self`.
/// Dropping a writable tree flushes it; use [`Root::close`] to observe
/// flush errors.
pub struct Root {
    path: PathBuf,
    context: Arc<TreeContext>,
    cache: NodeCache,
    root: NodeRef,
    closed: bool,
}

impl Root {
    /// Opens the tree stored at `path`, or starts an empty one.
    pub fn open(path: impl AsRef<Path>, config: TreeConfig) -> Result<Self> {
        config.validate()?;
        let path = path.as_ref().to_path_buf();
        let store = NodeStore::open(&path, config.file_max_size, config.read_only)?;
        let context = Arc::new(TreeContext::new(config));
        let cache = NodeCache::new(Arc::clone(&context), store);

        let metadata = path.join(METADATA_FILE);
        let root = if metadata.exists() {
            let raw = fs::read(&metadata)?;
            let (Some(root_id), Some(next_id), METADATA_LEN) =
                (read_u64_le(&raw, 0), read_u64_le(&raw, 8), raw.len())
            else {
                return Err(TrellisError::InvalidMetadata {
                    expected: METADATA_LEN,
                    actual: raw.len(),
                });
            };
            context.set_next_node_id(next_id);
            let root = cache.get_node(root_id)?;
            info!(
                path = %path.display(),
                root_id,
                next_id,
                nodes = cache.store().len(),
                mode = ?context.mode(),
                read_only = context.read_only(),
                "tree opened"
            );
            root
        } else {
            let root = cache.new_leaf();
            info!(path = %path.display(), mode = ?context.mode(), "tree created");
            root
        };
        cache.register(&root);

        Ok(Self {
            path,
            context,
            cache,
            root,
            closed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn context(&self) -> &TreeContext {
        &self.context
    }

    pub fn root_id(&self) -> NodeId {
        self.root.id()
    }

    /// Nodes currently tracked by the node cache.
    pub fn resident_nodes(&self) -> usize {
        self.cache.resident()
    }

    /// Coordinates of term `key`.
    pub fn get(&self, key: u64) -> Result<Option<CoordinateSet>> {
        self.expect_mode(TreeMode::Coordinates, "get")?;
        self.lookup(KeyRef::Numeric(key))?
            .map(into_coordinates)
            .transpose()
    }

    /// Value of `key` in a numeric-value tree.
    pub fn get_number(&self, key: u64) -> Result<Option<u64>> {
        self.expect_mode(TreeMode::NumericValues, "get_number")?;
        self.lookup(KeyRef::Numeric(key))?.map(into_number).transpose()
    }

    /// Value of `key` in a text-key tree.
    pub fn get_text(&self, key: &[u8]) -> Result<Option<u64>> {
        self.expect_mode(TreeMode::TextKeys, "get_text")?;
        self.lookup(KeyRef::Text(key))?.map(into_number).transpose()
    }

    /// Stores `value` under `key`, replacing any previous coordinates.
    pub fn put(&mut self, key: u64, value: &CoordinateSet) -> Result<()> {
        self.mutate("put", TreeMode::Coordinates, |root, cache| {
            Ok((root.put(cache, KeyRef::Numeric(key), ValueRef::Coordinates(value))?, ()))
        })
    }

    pub fn put_number(&mut self, key: u64, value: u64) -> Result<()> {
        self.mutate("put_number", TreeMode::NumericValues, |root, cache| {
            Ok((root.put(cache, KeyRef::Numeric(key), ValueRef::Number(value))?, ()))
        })
    }

    pub fn put_text(&mut self, key: &[u8], value: u64) -> Result<()> {
        self.mutate("put_text", TreeMode::TextKeys, |root, cache| {
            Ok((root.put(cache, KeyRef::Text(key), ValueRef::Number(value))?, ()))
        })
    }

    /// Inserts `key` as the new largest key, for loading sorted input.
    ///
    /// Keys that do not sort after every stored key are inserted as by
    /// [`Root::put`].
    pub fn append(&mut self, key: u64, value: &CoordinateSet) -> Result<()> {
        self.mutate("append", TreeMode::Coordinates, |root, cache| {
            Ok((root.append(cache, KeyRef::Numeric(key), ValueRef::Coordinates(value))?, ()))
        })
    }

    pub fn append_number(&mut self, key: u64, value: u64) -> Result<()> {
        self.mutate("append_number", TreeMode::NumericValues, |root, cache| {
            Ok((root.append(cache, KeyRef::Numeric(key), ValueRef::Number(value))?, ()))
        })
    }

    pub fn append_text(&mut self, key: &[u8], value: u64) -> Result<()> {
        self.mutate("append_text", TreeMode::TextKeys, |root, cache| {
            Ok((root.append(cache, KeyRef::Text(key), ValueRef::Number(value))?, ()))
        })
    }

    /// Stores `value` under `key` unless the key exists.
    ///
    /// Returns the stored value and whether it was inserted by this call.
    pub fn insert_if_not_exists(&mut self, key: &[u8], value: u64) -> Result<(u64, bool)> {
        self.mutate("insert_if_not_exists", TreeMode::TextKeys, |root, cache| {
            let outcome = root.put_or_get(cache, KeyRef::Text(key), ValueRef::Number(value))?;
            Ok((outcome.split, (into_number(outcome.value)?, outcome.inserted)))
        })
    }

    pub fn insert_number_if_not_exists(&mut self, key: u64, value: u64) -> Result<(u64, bool)> {
        self.mutate("insert_number_if_not_exists", TreeMode::NumericValues, |root, cache| {
            let outcome = root.put_or_get(cache, KeyRef::Numeric(key), ValueRef::Number(value))?;
            Ok((outcome.split, (into_number(outcome.value)?, outcome.inserted)))
        })
    }

    pub fn insert_coordinates_if_not_exists(
        &mut self,
        key: u64,
        value: &CoordinateSet,
    ) -> Result<(CoordinateSet, bool)> {
        self.mutate("insert_coordinates_if_not_exists", TreeMode::Coordinates, |root, cache| {
            let outcome = root.put_or_get(cache, KeyRef::Numeric(key), ValueRef::Coordinates(value))?;
            Ok((outcome.split, (into_coordinates(outcome.value)?, outcome.inserted)))
        })
    }

    /// Iterates every entry in ascending key order.
    pub fn iter(&self) -> Result<TreeIter<'_>> {
        let leaf = self.root.leftmost_leaf(&self.cache)?;
        Ok(TreeIter::new(&self.cache, leaf))
    }

    /// Number of levels, counting the root and the leaves.
    pub fn height(&self) -> Result<usize> {
        let height = self.root.height(&self.cache)?;
        self.cache.evict_overflow()?;
        Ok(height)
    }

    /// Walks the whole tree checking occupancy bounds, key order against
    /// the separators, child counts, parent links and leaf depth.
    pub fn verify(&self) -> Result<TreeStats> {
        let mut stats = TreeStats::default();
        let mut leaf_depth = None;
        self.verify_node(&self.root, 1, None, None, &mut leaf_depth, &mut stats)?;
        stats.height = leaf_depth.unwrap_or(1);
        self.cache.evict_overflow()?;
        Ok(stats)
    }

    /// Writes the metadata and every dirty node, then syncs the store.
    /// Does nothing on a read-only tree.
    pub fn flush(&mut self) -> Result<()> {
        if self.context.read_only() {
            return Ok(());
        }

        let mut metadata = [0u8; METADATA_LEN];
        metadata[..8].copy_from_slice(&self.root.id().to_le_bytes());
        metadata[8..].copy_from_slice(&self.context.next_node_id().to_le_bytes());
        fs::write(self.path.join(METADATA_FILE), metadata)?;

        let written = self.cache.flush_all()? + self.flush_children()?;
        self.cache.sync()?;
        info!(
            path = %self.path.display(),
            root_id = self.root.id(),
            written,
            nodes = self.cache.store().len(),
            data_file = self.cache.store().current_file(),
            "tree flushed"
        );
        Ok(())
    }

    /// Flushes and closes the tree.
    pub fn close(mut self) -> Result<()> {
        let result = self.flush();
        self.closed = true;
        result
    }

    fn lookup(&self, key: KeyRef<'_>) -> Result<Option<TermValue>> {
        let value = self.root.lookup(&self.cache, key)?;
        self.cache.evict_overflow()?;
        Ok(value)
    }

    /// Runs a write against the root, growing the tree when the root splits.
    fn mutate<T, F>(&mut self, op: &'static str, mode: TreeMode, f: F) -> Result<T>
    where
        F: FnOnce(&NodeRef, &NodeCache) -> Result<(Option<NodeRef>, T)>,
    {
        if self.context.read_only() {
            error!(op, path = %self.path.display(), "write requested on a read-only tree");
            return Err(TrellisError::ReadOnly);
        }
        self.expect_mode(mode, op)?;

        let (split, outcome) = f(&self.root, &self.cache)?;
        if let Some(split) = split {
            self.grow(split)?;
        }
        self.cache.evict_overflow()?;
        Ok(outcome)
    }

    fn expect_mode(&self, mode: TreeMode, op: &str) -> Result<()> {
        if self.context.mode() == mode {
            Ok(())
        } else {
            Err(TrellisError::Unsupported(format!(
                "{op} needs a {mode:?} tree, this tree is {:?}",
                self.context.mode()
            )))
        }
    }

    /// Replaces the root by a new intermediate over the old root and `split`.
    fn grow(&mut self, split: NodeRef) -> Result<()> {
        let key = separator(&self.root, &split, &self.cache)?;
        let inner = Intermediate::with_children(Arc::clone(&self.root), Arc::clone(&split), key, &self.context)?;
        let root = self.cache.new_node(Node::Intermediate(inner));
        self.root.set_parent(Some(&root));
        split.set_parent(Some(&root));
        self.cache.register(&split);
        self.cache.register(&self.root);
        self.cache.register(&root);
        self.root = root;
        debug!(root_id = self.root.id(), height = self.root.height(&self.cache)?, "tree grew a level");
        Ok(())
    }

    /// Writes dirty nodes reachable from the root that the cache no longer
    /// tracks.
    fn flush_children(&self) -> Result<usize> {
        let mut written = 0;
        let mut stack = vec![Arc::clone(&self.root)];
        while let Some(node) = stack.pop() {
            if self.cache.flush_node(&node)? {
                written += 1;
            }
            if let Node::Intermediate(inner) = &*node.read() {
                stack.extend(inner.loaded_children());
            }
        }
        Ok(written)
    }

    fn verify_node(
        &self,
        node: &NodeRef,
        depth: usize,
        lower: Option<&TermKey>,
        upper: Option<&TermKey>,
        leaf_depth: &mut Option<usize>,
        stats: &mut TreeStats,
    ) -> Result<()> {
        let id = node.id();
        let (separators, children) = {
            let guard = node.read();
            let keys: Vec<TermKey> = (0..guard.len())
                .filter_map(|i| guard.keys().key_at(i).map(KeyRef::to_owned_key))
                .collect();

            let (min, max) = (self.context.min_elements(), self.context.max_elements());
            let is_root = Arc::ptr_eq(node, &self.root);
            if keys.len() > max || (!is_root && keys.len() < min) {
                return Err(TrellisError::corrupted(
                    id,
                    format!("occupancy {} outside [{min}, {max}]", keys.len()),
                ));
            }
            if keys.windows(2).any(|pair| pair[0] >= pair[1]) {
                return Err(TrellisError::corrupted(id, "keys out of order"));
            }
            let in_range = |key: &TermKey| lower.map_or(true, |l| key > l) && upper.map_or(true, |u| key <= u);
            if !keys.iter().all(in_range) {
                return Err(TrellisError::corrupted(id, "key outside its separator range"));
            }

            match &*guard {
                Node::Leaf(_) => {
                    stats.leaves += 1;
                    stats.entries += keys.len();
                    match *leaf_depth {
                        None => *leaf_depth = Some(depth),
                        Some(expected) if expected != depth => {
                            return Err(TrellisError::corrupted(
                                id,
                                format!("leaf at depth {depth}, expected {expected}"),
                            ))
                        }
                        Some(_) => {}
                    }
                    return Ok(());
                }
                Node::Intermediate(inner) => {
                    stats.intermediates += 1;
                    if inner.children_len() != keys.len() + 1 {
                        return Err(TrellisError::corrupted(
                            id,
                            format!("{} children for {} keys", inner.children_len(), keys.len()),
                        ));
                    }
                    let children = (0..inner.children_len())
                        .map(|p| inner.child_at(node, &self.cache, p))
                        .collect::<Result<Vec<_>>>()?;
                    (keys, children)
                }
            }
        };

        for (p, child) in children.into_iter().enumerate() {
            let linked = child.parent().is_some_and(|parent| Arc::ptr_eq(&parent, node));
            if !linked {
                return Err(TrellisError::corrupted(child.id(), "parent link does not match"));
            }
            let child_lower = if p == 0 { lower } else { separators.get(p - 1) };
            let child_upper = if p < separators.len() { separators.get(p) } else { upper };
            self.verify_node(&child, depth + 1, child_lower, child_upper, leaf_depth, stats)?;
            drop(child);
            self.cache.evict_overflow()?;
        }
        Ok(())
    }
}

impl Drop for Root {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.flush() {
            error!(path = %self.path.display(), error = %e, "failed to flush tree on drop");
        }
    }
}

fn into_coordinates(value: TermValue) -> Result<CoordinateSet> {
    match value {
        TermValue::Coordinates(set) => Ok(set),
        TermValue::Number(_) => Err(TrellisError::Unsupported(
            "numeric value found in a coordinate tree".to_string(),
        )),
    }
}

fn into_number(value: TermValue) -> Result<u64> {
    match value {
        TermValue::Number(number) => Ok(number),
        TermValue::Coordinates(_) => Err(TrellisError::Unsupported(
            "coordinate value found in a numeric tree".to_string(),
        )),
    }
}
