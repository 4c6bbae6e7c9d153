//! Tree nodes and the descent operations shared by both node kinds.
//!
//! Nodes are shared as `Arc<NodeCell>`. A parent owns its loaded children
//! through its child slots; the back reference from a child to its parent
//! is a `Weak` and never keeps the parent alive. The node cache only holds
//! weak handles as well.

use super::cache::NodeCache;
use super::context::TreeContext;
use super::intermediate::Intermediate;
use super::keys::{KeyRef, Keys};
use super::leaf::Leaf;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::{Arc, Weak};
use trellis_common::encoding::{decode_varint, encode_varint};
use trellis_common::{CoordinateSet, NodeId, Result, TermKey, TermValue, TreeMode, TrellisError};

pub(crate) type NodeRef = Arc<NodeCell>;

const KIND_LEAF: u8 = 0;
const KIND_INTERMEDIATE: u8 = 1;

/// Borrowed value passed down to the leaves.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ValueRef<'a> {
    Number(u64),
    Coordinates(&'a CoordinateSet),
}

impl ValueRef<'_> {
    pub(crate) fn to_owned_value(self) -> TermValue {
        match self {
            ValueRef::Number(value) => TermValue::Number(value),
            ValueRef::Coordinates(set) => TermValue::Coordinates(*set),
        }
    }
}

/// Outcome of an insert-if-absent.
pub(crate) struct PutOrGet {
    /// Sibling created by a split, for the caller to link.
    pub(crate) split: Option<NodeRef>,
    /// Stored value: the existing one, or the one just inserted.
    pub(crate) value: TermValue,
    pub(crate) inserted: bool,
}

pub(crate) enum Node {
    Leaf(Leaf),
    Intermediate(Intermediate),
}

impl Node {
    pub(crate) fn keys(&self) -> &Keys {
        match self {
            Node::Leaf(leaf) => &leaf.keys,
            Node::Intermediate(inner) => &inner.keys,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.keys().len()
    }

    pub(crate) fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf(_))
    }

    pub(crate) fn is_dirty(&self) -> bool {
        match self {
            Node::Leaf(leaf) => leaf.is_dirty(),
            Node::Intermediate(inner) => inner.is_dirty(),
        }
    }

    pub(crate) fn mark_clean(&mut self) {
        match self {
            Node::Leaf(leaf) => leaf.mark_clean(),
            Node::Intermediate(inner) => inner.mark_clean(),
        }
    }

    /// A node can leave memory once none of its children are loaded.
    pub(crate) fn is_evictable(&self) -> bool {
        match self {
            Node::Leaf(_) => true,
            Node::Intermediate(inner) => !inner.has_loaded_children(),
        }
    }

    /// Serializes the node: kind byte, occupancy, keys, then the
    /// kind-specific payload.
    pub(crate) fn encode(&self, id: NodeId, ctx: &TreeContext) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(64 + self.len() * 16);
        buf.push(if self.is_leaf() { KIND_LEAF } else { KIND_INTERMEDIATE });
        encode_varint(self.len() as u64, &mut buf);
        self.keys().encode(&mut buf);
        match self {
            Node::Leaf(leaf) => leaf.encode_values(id, ctx, &mut buf)?,
            Node::Intermediate(inner) => inner.encode_children(&mut buf),
        }
        Ok(buf)
    }

    pub(crate) fn decode(id: NodeId, payload: Bytes, ctx: &TreeContext) -> Result<Node> {
        let kind = *payload
            .first()
            .ok_or_else(|| TrellisError::corrupted(id, "empty node payload"))?;
        let mut pos = 1;
        let count = decode_varint(&payload, &mut pos)
            .ok_or_else(|| TrellisError::corrupted(id, "truncated occupancy"))? as usize;
        if count > ctx.max_elements() {
            return Err(TrellisError::corrupted(
                id,
                format!("occupancy {count} exceeds node capacity {}", ctx.max_elements()),
            ));
        }
        let keys = Keys::decode(&payload, &mut pos, count, ctx)
            .ok_or_else(|| TrellisError::corrupted(id, "truncated key section"))?;

        match kind {
            KIND_LEAF => Ok(Node::Leaf(Leaf::decode(id, keys, &payload, pos, ctx)?)),
            KIND_INTERMEDIATE => Ok(Node::Intermediate(Intermediate::decode(id, keys, &payload, pos)?)),
            other => {
                keys.release(ctx);
                Err(TrellisError::corrupted(id, format!("unknown node kind {other}")))
            }
        }
    }

    /// Returns pooled storage. Loaded children are dropped with their slots.
    pub(crate) fn release(self, ctx: &TreeContext) {
        match self {
            Node::Leaf(leaf) => leaf.release(ctx),
            Node::Intermediate(inner) => inner.release(ctx),
        }
    }
}

/// A node together with its identity and parent link.
pub(crate) struct NodeCell {
    id: NodeId,
    parent: Mutex<Weak<NodeCell>>,
    node: RwLock<Node>,
}

impl NodeCell {
    pub(crate) fn new(id: NodeId, node: Node) -> NodeRef {
        Arc::new(Self {
            id,
            parent: Mutex::new(Weak::new()),
            node: RwLock::new(node),
        })
    }

    #[inline]
    pub(crate) fn id(&self) -> NodeId {
        self.id
    }

    pub(crate) fn parent(&self) -> Option<NodeRef> {
        self.parent.lock().upgrade()
    }

    pub(crate) fn set_parent(&self, parent: Option<&NodeRef>) {
        *self.parent.lock() = parent.map(Arc::downgrade).unwrap_or_default();
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Node> {
        self.node.read()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Node> {
        self.node.write()
    }

    pub(crate) fn into_node(self) -> Node {
        self.node.into_inner()
    }

    /// Point lookup. Descends one guard at a time.
    pub(crate) fn lookup(self: &Arc<Self>, cache: &NodeCache, key: KeyRef<'_>) -> Result<Option<TermValue>> {
        let mut current = Arc::clone(self);
        loop {
            let next = {
                let guard = current.read();
                match &*guard {
                    Node::Leaf(leaf) => return leaf.get(current.id, cache.context(), key),
                    Node::Intermediate(inner) => inner.child_for_key(&current, cache, key)?,
                }
            };
            current = next;
        }
    }

    pub(crate) fn put(self: &Arc<Self>, cache: &NodeCache, key: KeyRef<'_>, value: ValueRef<'_>) -> Result<Option<NodeRef>> {
        let mut guard = self.write();
        match &mut *guard {
            Node::Leaf(leaf) => leaf.put(self, cache, key, value),
            Node::Intermediate(inner) => inner.put(self, cache, key, value),
        }
    }

    pub(crate) fn append(self: &Arc<Self>, cache: &NodeCache, key: KeyRef<'_>, value: ValueRef<'_>) -> Result<Option<NodeRef>> {
        let mut guard = self.write();
        match &mut *guard {
            Node::Leaf(leaf) => leaf.append(self, cache, key, value),
            Node::Intermediate(inner) => inner.append(self, cache, key, value),
        }
    }

    pub(crate) fn put_or_get(self: &Arc<Self>, cache: &NodeCache, key: KeyRef<'_>, value: ValueRef<'_>) -> Result<PutOrGet> {
        let mut guard = self.write();
        match &mut *guard {
            Node::Leaf(leaf) => leaf.put_or_get(self, cache, key, value),
            Node::Intermediate(inner) => inner.put_or_get(self, cache, key, value),
        }
    }

    /// Follows the first or last child down to a leaf.
    fn edge_leaf(self: &Arc<Self>, cache: &NodeCache, rightmost: bool) -> Result<NodeRef> {
        let mut current = Arc::clone(self);
        loop {
            let next = {
                let guard = current.read();
                match &*guard {
                    Node::Leaf(_) => break,
                    Node::Intermediate(inner) => {
                        let p = if rightmost { inner.children_len().saturating_sub(1) } else { 0 };
                        inner.child_at(&current, cache, p)?
                    }
                }
            };
            current = next;
        }
        Ok(current)
    }

    pub(crate) fn leftmost_leaf(self: &Arc<Self>, cache: &NodeCache) -> Result<NodeRef> {
        self.edge_leaf(cache, false)
    }

    pub(crate) fn smallest_key(self: &Arc<Self>, cache: &NodeCache) -> Result<Option<TermKey>> {
        Ok(self.edge_leaf(cache, false)?.read().keys().first())
    }

    pub(crate) fn largest_key(self: &Arc<Self>, cache: &NodeCache) -> Result<Option<TermKey>> {
        Ok(self.edge_leaf(cache, true)?.read().keys().last())
    }

    /// Number of levels from this node down to the leaves, counting both.
    pub(crate) fn height(self: &Arc<Self>, cache: &NodeCache) -> Result<usize> {
        let mut height = 1;
        let mut current = Arc::clone(self);
        loop {
            let next = {
                let guard = current.read();
                match &*guard {
                    Node::Leaf(_) => return Ok(height),
                    Node::Intermediate(inner) => inner.child_at(&current, cache, 0)?,
                }
            };
            height += 1;
            current = next;
        }
    }

    /// Next leaf in key order, or this leaf when it is the last one.
    pub(crate) fn right_sibling(self: &Arc<Self>, cache: &NodeCache) -> Result<NodeRef> {
        let mut child = Arc::clone(self);
        loop {
            let Some(parent) = child.parent() else {
                return Ok(Arc::clone(self));
            };
            let next = {
                let guard = parent.read();
                let Node::Intermediate(inner) = &*guard else {
                    return Err(TrellisError::corrupted(parent.id, "parent is not an intermediate node"));
                };
                let p = inner.position_of_child(&child).ok_or_else(|| {
                    TrellisError::corrupted(parent.id, format!("node {} is not linked to its parent", child.id))
                })?;
                if p + 1 < inner.children_len() {
                    Some(inner.child_at(&parent, cache, p + 1)?)
                } else {
                    None
                }
            };
            match next {
                Some(next) => return next.leftmost_leaf(cache),
                None => child = parent,
            }
        }
    }
}

/// Floor of the mean of `a` and `b`, without overflow.
#[inline]
pub(crate) fn midpoint(a: u64, b: u64) -> u64 {
    a / 2 + b / 2 + (a & b & 1)
}

/// Separator key between `left` and the new sibling `right`.
///
/// Numeric trees use the midpoint of the two boundary keys, text trees the
/// largest key of `left`. Keys equal to the separator belong on the left.
pub(crate) fn separator(left: &NodeRef, right: &NodeRef, cache: &NodeCache) -> Result<TermKey> {
    let largest = left
        .largest_key(cache)?
        .ok_or_else(|| TrellisError::corrupted(left.id(), "split produced an empty node"))?;
    if cache.context().mode() == TreeMode::TextKeys {
        return Ok(largest);
    }
    let smallest = right
        .smallest_key(cache)?
        .ok_or_else(|| TrellisError::corrupted(right.id(), "split produced an empty node"))?;
    match (largest, smallest) {
        (TermKey::Numeric(a), TermKey::Numeric(b)) => Ok(TermKey::Numeric(midpoint(a, b))),
        _ => Err(TrellisError::corrupted(left.id(), "text key in a numeric tree")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::cache::tests::test_cache;
    use trellis_common::{Coordinate, Permutation, Strategy, TreeConfig};

    #[test]
    fn test_midpoint() {
        assert_eq!(midpoint(10, 20), 15);
        assert_eq!(midpoint(10, 11), 10);
        assert_eq!(midpoint(3, 5), 4);
        assert_eq!(midpoint(u64::MAX - 1, u64::MAX), u64::MAX - 1);
        assert_eq!(midpoint(u64::MAX, u64::MAX), u64::MAX);
    }

    #[test]
    fn test_node_encode_decode_intermediate() {
        let (_dir, cache) = test_cache(TreeConfig {
            max_elements_per_node: 4,
            ..TreeConfig::default()
        });
        let ctx = cache.context();
        let left = cache.new_node(Node::Leaf(Leaf::new(ctx)));
        let right = cache.new_node(Node::Leaf(Leaf::new(ctx)));
        let inner = Intermediate::with_children(left.clone(), right.clone(), TermKey::Numeric(77), ctx).unwrap();
        let node = Node::Intermediate(inner);

        let payload = node.encode(9, ctx).unwrap();
        assert_eq!(payload[0], KIND_INTERMEDIATE);
        let decoded = Node::decode(9, Bytes::from(payload), ctx).unwrap();
        let Node::Intermediate(decoded) = decoded else {
            panic!("intermediate expected");
        };
        assert_eq!(decoded.keys.first(), Some(TermKey::Numeric(77)));
        assert_eq!(decoded.child_ids(), vec![left.id(), right.id()]);
        assert!(!decoded.has_loaded_children());
    }

    #[test]
    fn test_node_decode_rejects_unknown_kind() {
        let (_dir, cache) = test_cache(TreeConfig::default());
        let payload = Bytes::from_static(&[7, 0]);
        assert!(matches!(
            Node::decode(3, payload, cache.context()),
            Err(TrellisError::Corrupted { node_id: 3, .. })
        ));
    }

    #[test]
    fn test_node_decode_rejects_oversized_occupancy() {
        let (_dir, cache) = test_cache(TreeConfig {
            max_elements_per_node: 4,
            ..TreeConfig::default()
        });
        let payload = Bytes::from_static(&[KIND_LEAF, 9]);
        assert!(Node::decode(3, payload, cache.context()).is_err());
    }

    #[test]
    fn test_leaf_split_links_sibling() {
        let (_dir, cache) = test_cache(TreeConfig {
            max_elements_per_node: 4,
            ..TreeConfig::default()
        });
        let leaf = cache.new_node(Node::Leaf(Leaf::new(cache.context())));
        let set: CoordinateSet = [Coordinate::new(Permutation::Pos, 0, 1, 1, Strategy(0))]
            .into_iter()
            .collect();

        for key in [10u64, 20, 30, 40] {
            assert!(leaf.put(&cache, KeyRef::Numeric(key), ValueRef::Coordinates(&set)).unwrap().is_none());
        }
        let sibling = leaf
            .put(&cache, KeyRef::Numeric(50), ValueRef::Coordinates(&set))
            .unwrap()
            .expect("full leaf splits");

        assert_eq!(leaf.read().len(), 2);
        assert_eq!(sibling.read().len(), 3);
        assert_eq!(sibling.smallest_key(&cache).unwrap(), Some(TermKey::Numeric(30)));
        assert_eq!(separator(&leaf, &sibling, &cache).unwrap(), TermKey::Numeric(25));
    }

    #[test]
    fn test_text_separator_is_largest_left_key() {
        let (_dir, cache) = test_cache(TreeConfig {
            max_elements_per_node: 4,
            text_keys: true,
            ..TreeConfig::default()
        });
        let leaf = cache.new_node(Node::Leaf(Leaf::new(cache.context())));
        let mut split = None;
        for (i, word) in ["a", "b", "c", "d", "e"].iter().enumerate() {
            split = leaf.put(&cache, KeyRef::Text(word.as_bytes()), ValueRef::Number(i as u64)).unwrap();
        }
        let sibling = split.expect("fifth key splits");
        assert_eq!(
            separator(&leaf, &sibling, &cache).unwrap(),
            TermKey::Text(b"b".to_vec().into_boxed_slice())
        );
    }
}
