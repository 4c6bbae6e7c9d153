//! Per-tree state shared by every node: configuration, id allocation and pools.

use super::coordinates::{CoordinateCell, Line};
use std::sync::atomic::{AtomicU64, Ordering};
use trellis_buffer::{ArrayPool, ObjectPool, PoolStats};
use trellis_common::{NodeId, TreeConfig, TreeMode};

/// Number of lazily parsed lines after which a leaf parses the rest at once.
pub(crate) const MAX_LAZY_LINES: usize = 32;

/// Configuration and allocators of one open tree.
pub struct TreeContext {
    config: TreeConfig,
    mode: TreeMode,
    max_elements: usize,
    min_elements: usize,
    /// Next id handed to a newly created node.
    next_node_id: AtomicU64,
    cells: ObjectPool<CoordinateCell>,
    /// Key and numeric value arrays, `max + 1` slots each.
    words: ArrayPool<u64>,
    /// Half-arrays of coordinate lines, `min` slots each.
    lines: ArrayPool<Line>,
}

impl TreeContext {
    /// Builds the context of a tree. The configuration must be validated.
    pub(crate) fn new(config: TreeConfig) -> Self {
        let max_elements = config.max_elements_per_node;
        let min_elements = config.min_elements_per_node();
        Self {
            mode: config.mode(),
            max_elements,
            min_elements,
            next_node_id: AtomicU64::new(0),
            cells: ObjectPool::new(config.coordinate_pool_batch, config.coordinate_pool_retain),
            words: ArrayPool::new(max_elements + 1, config.array_pool_retain),
            lines: ArrayPool::new(min_elements, config.array_pool_retain),
            config,
        }
    }

    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    pub fn mode(&self) -> TreeMode {
        self.mode
    }

    /// Maximum number of keys in a node.
    pub fn max_elements(&self) -> usize {
        self.max_elements
    }

    /// Minimum number of keys in a non-root node.
    pub fn min_elements(&self) -> usize {
        self.min_elements
    }

    pub fn read_only(&self) -> bool {
        self.config.read_only
    }

    #[inline]
    pub(crate) fn text_keys(&self) -> bool {
        self.mode == TreeMode::TextKeys
    }

    /// Allocates the id of a new node.
    pub(crate) fn allocate_node_id(&self) -> NodeId {
        self.next_node_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Id the next allocated node will get.
    pub fn next_node_id(&self) -> NodeId {
        self.next_node_id.load(Ordering::Relaxed)
    }

    pub(crate) fn set_next_node_id(&self, id: NodeId) {
        self.next_node_id.store(id, Ordering::Relaxed);
    }

    pub(crate) fn cells(&self) -> &ObjectPool<CoordinateCell> {
        &self.cells
    }

    pub(crate) fn words(&self) -> &ArrayPool<u64> {
        &self.words
    }

    pub(crate) fn lines(&self) -> &ArrayPool<Line> {
        &self.lines
    }

    /// Counters of the coordinate cell pool.
    pub fn cell_pool_stats(&self) -> PoolStats {
        self.cells.stats()
    }

    /// Counters of the key and numeric value array pool.
    pub fn array_pool_stats(&self) -> PoolStats {
        self.words.stats()
    }
}
