//! Bounded cache of resident nodes.
//!
//! The cache tracks nodes, it does not own them: a node lives as long as its
//! parent's slot (or the root) holds it. Frames keep weak handles and a clock
//! replacer picks victims. Eviction only runs at points where the caller
//! holds no node guards, so the resident count may exceed the bound while an
//! operation is in flight.

use super::context::TreeContext;
use super::intermediate::Child;
use super::leaf::Leaf;
use super::node::{Node, NodeCell, NodeRef};
use super::store::NodeStore;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, trace};
use trellis_buffer::{ClockReplacer, FrameId, FrameTable, Replacer};
use trellis_common::{NodeId, Result};

pub(crate) struct NodeCache {
    context: Arc<TreeContext>,
    store: NodeStore,
    frames: Mutex<FrameTable<NodeCell>>,
    replacer: ClockReplacer,
    capacity: usize,
}

impl NodeCache {
    pub(crate) fn new(context: Arc<TreeContext>, store: NodeStore) -> Self {
        let capacity = context.config().max_nodes_in_cache;
        Self {
            context,
            store,
            frames: Mutex::new(FrameTable::with_capacity(capacity)),
            replacer: ClockReplacer::new(capacity),
            capacity,
        }
    }

    #[inline]
    pub(crate) fn context(&self) -> &TreeContext {
        &self.context
    }

    pub(crate) fn store(&self) -> &NodeStore {
        &self.store
    }

    /// Wraps a freshly built node under a new id.
    pub(crate) fn new_node(&self, node: Node) -> NodeRef {
        NodeCell::new(self.context.allocate_node_id(), node)
    }

    pub(crate) fn new_leaf(&self) -> NodeRef {
        self.new_node(Node::Leaf(Leaf::new(&self.context)))
    }

    /// Returns the resident node `id`, or loads it from the store.
    ///
    /// A loaded node is not registered here; whoever links it registers it.
    pub(crate) fn get_node(&self, id: NodeId) -> Result<NodeRef> {
        if let Some(node) = self.frames.lock().lookup(id) {
            return Ok(node);
        }
        let payload = self.store.read(id)?;
        let node = Node::decode(id, payload, &self.context)?;
        trace!(node_id = id, "node loaded");
        Ok(NodeCell::new(id, node))
    }

    /// Starts tracking `node` and marks it recently used.
    pub(crate) fn register(&self, node: &NodeRef) {
        let (frame_id, _) = self.frames.lock().register(node.id(), node);
        self.replacer.set_evictable(frame_id, true);
        self.replacer.record_access(frame_id);
    }

    /// Marks a tracked node recently used.
    pub(crate) fn touch(&self, node: &NodeRef) {
        let frame_id = self.frames.lock().frame_of(node.id());
        if let Some(frame_id) = frame_id {
            self.replacer.record_access(frame_id);
        }
    }

    /// Number of tracked nodes.
    pub(crate) fn resident(&self) -> usize {
        self.frames.lock().len()
    }

    /// Evicts nodes until the cache is back under its bound or no victim
    /// can be found. Must be called without holding any node guard.
    pub(crate) fn evict_overflow(&self) -> Result<usize> {
        let (resident, frames) = {
            let table = self.frames.lock();
            (table.len(), table.num_frames())
        };
        if resident <= self.capacity {
            return Ok(0);
        }

        let mut evicted = 0;
        for _ in 0..frames * 2 {
            if self.resident() <= self.capacity {
                break;
            }
            let Some(frame_id) = self.replacer.evict() else {
                break;
            };
            let handle = self.frames.lock().get(frame_id).map(|frame| frame.handle.clone());
            let Some(node) = handle.and_then(|handle| handle.upgrade()) else {
                // Dropped along with its parent
                self.frames.lock().remove(frame_id);
                continue;
            };
            if self.try_evict(frame_id, node)? {
                evicted += 1;
            } else {
                self.replacer.set_evictable(frame_id, true);
                self.replacer.record_access(frame_id);
            }
        }

        if evicted > 0 {
            debug!(evicted, resident = self.resident(), capacity = self.capacity, "evicted nodes");
        }
        Ok(evicted)
    }

    /// Unloads `node` from its parent slot, writing it first if dirty.
    ///
    /// Fails softly (returns false) for the root, for intermediates with
    /// loaded children and for nodes referenced by an in-flight caller.
    fn try_evict(&self, frame_id: FrameId, node: NodeRef) -> Result<bool> {
        let Some(parent) = node.parent() else {
            return Ok(false);
        };
        let parent_guard = parent.read();
        let Node::Intermediate(inner) = &*parent_guard else {
            return Ok(false);
        };
        let Some(slot) = inner.position_of_child(&node).and_then(|p| inner.slot(p)) else {
            return Ok(false);
        };
        let mut child = slot.lock();

        // One reference in the slot, one here
        if Arc::strong_count(&node) > 2 {
            return Ok(false);
        }
        {
            let mut guard = node.write();
            if !guard.is_evictable() {
                return Ok(false);
            }
            if guard.is_dirty() {
                self.write_node(node.id(), &mut guard)?;
            }
        }

        *child = Child::Unloaded(node.id());
        self.frames.lock().remove(frame_id);
        self.replacer.remove(frame_id);
        drop(child);
        drop(parent_guard);

        trace!(node_id = node.id(), "node evicted");
        if let Ok(cell) = Arc::try_unwrap(node) {
            cell.into_node().release(&self.context);
        }
        Ok(true)
    }

    fn write_node(&self, id: NodeId, node: &mut Node) -> Result<()> {
        let payload = node.encode(id, &self.context)?;
        self.store.write(id, &payload)?;
        node.mark_clean();
        trace!(node_id = id, bytes = payload.len(), "node written");
        Ok(())
    }

    /// Writes `node` if it is dirty. Returns whether anything was written.
    pub(crate) fn flush_node(&self, node: &NodeCell) -> Result<bool> {
        if self.context.read_only() {
            return Ok(false);
        }
        let mut guard = node.write();
        if !guard.is_dirty() {
            return Ok(false);
        }
        self.write_node(node.id(), &mut guard)?;
        Ok(true)
    }

    /// Writes every dirty tracked node.
    pub(crate) fn flush_all(&self) -> Result<usize> {
        let nodes = {
            let table = self.frames.lock();
            if table.is_empty() {
                return Ok(0);
            }
            table.live_handles()
        };
        let mut written = 0;
        for node in nodes {
            if self.flush_node(&node)? {
                written += 1;
            }
        }
        Ok(written)
    }

    pub(crate) fn sync(&self) -> Result<()> {
        self.store.sync()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::tree::keys::KeyRef;
    use crate::tree::node::ValueRef;
    use tempfile::{tempdir, TempDir};
    use trellis_common::{TermValue, TreeConfig};

    pub(crate) fn test_cache(config: TreeConfig) -> (TempDir, NodeCache) {
        let dir = tempdir().unwrap();
        let store = NodeStore::open(dir.path(), config.file_max_size, config.read_only).unwrap();
        let cache = NodeCache::new(Arc::new(TreeContext::new(config)), store);
        (dir, cache)
    }

    fn numeric_config(max_nodes_in_cache: usize) -> TreeConfig {
        TreeConfig {
            max_elements_per_node: 4,
            text_values: true,
            max_nodes_in_cache,
            ..TreeConfig::default()
        }
    }

    #[test]
    fn test_get_node_reads_store() {
        let (_dir, cache) = test_cache(numeric_config(8));
        let leaf = cache.new_leaf();
        leaf.put(&cache, KeyRef::Numeric(4), ValueRef::Number(40)).unwrap();
        assert!(cache.flush_node(&leaf).unwrap());
        assert!(!cache.flush_node(&leaf).unwrap());

        let loaded = cache.get_node(leaf.id()).unwrap();
        assert!(!Arc::ptr_eq(&loaded, &leaf));
        assert_eq!(
            loaded.lookup(&cache, KeyRef::Numeric(4)).unwrap(),
            Some(TermValue::Number(40))
        );
    }

    #[test]
    fn test_get_node_prefers_resident() {
        let (_dir, cache) = test_cache(numeric_config(8));
        let leaf = cache.new_leaf();
        cache.register(&leaf);
        let found = cache.get_node(leaf.id()).unwrap();
        assert!(Arc::ptr_eq(&found, &leaf));
    }

    #[test]
    fn test_root_is_never_evicted() {
        let (_dir, cache) = test_cache(numeric_config(1));
        let a = cache.new_leaf();
        let b = cache.new_leaf();
        cache.register(&a);
        cache.register(&b);
        assert_eq!(cache.resident(), 2);

        // Neither node has a parent slot to be unloaded from
        assert_eq!(cache.evict_overflow().unwrap(), 0);
        assert_eq!(cache.resident(), 2);
    }

    #[test]
    fn test_dropped_nodes_leave_the_table() {
        let (_dir, cache) = test_cache(numeric_config(1));
        let keep = cache.new_leaf();
        cache.register(&keep);
        {
            let gone = cache.new_leaf();
            cache.register(&gone);
        }
        cache.evict_overflow().unwrap();
        assert_eq!(cache.resident(), 1);
    }

    #[test]
    fn test_flush_all_writes_dirty_nodes() {
        let (_dir, cache) = test_cache(numeric_config(8));
        let a = cache.new_leaf();
        let b = cache.new_leaf();
        cache.register(&a);
        cache.register(&b);
        assert_eq!(cache.flush_all().unwrap(), 2);
        assert_eq!(cache.flush_all().unwrap(), 0);
        assert!(cache.store().contains(a.id()));
        assert!(cache.store().contains(b.id()));
    }
}
