//! Intermediate nodes: separator keys and lazily loaded child slots.

use super::cache::NodeCache;
use super::context::TreeContext;
use super::keys::{KeyRef, Keys};
use super::node::{separator, Node, NodeRef, PutOrGet, ValueRef};
use bytes::Bytes;
use parking_lot::{RwLock, RwLockWriteGuard};
use std::cmp::Ordering;
use std::sync::Arc;
use trellis_common::encoding::read_u64_le;
use trellis_common::{NodeId, Result, TermKey, TrellisError};

/// Size of one stored child id.
const CHILD_ID_SIZE: usize = 8;

/// State of a child slot.
pub(crate) enum Child {
    /// Only the id is known; the node is on disk.
    Unloaded(NodeId),
    Loaded(NodeRef),
}

/// One child pointer, loaded on first use.
pub(crate) struct ChildSlot(RwLock<Child>);

impl ChildSlot {
    pub(crate) fn loaded(node: NodeRef) -> Self {
        Self(RwLock::new(Child::Loaded(node)))
    }

    pub(crate) fn unloaded(id: NodeId) -> Self {
        Self(RwLock::new(Child::Unloaded(id)))
    }

    pub(crate) fn id(&self) -> NodeId {
        match &*self.0.read() {
            Child::Unloaded(id) => *id,
            Child::Loaded(node) => node.id(),
        }
    }

    /// Returns the child if it is in memory, without loading it.
    pub(crate) fn peek(&self) -> Option<NodeRef> {
        match &*self.0.read() {
            Child::Loaded(node) => Some(Arc::clone(node)),
            Child::Unloaded(_) => None,
        }
    }

    pub(crate) fn is_loaded(&self) -> bool {
        matches!(&*self.0.read(), Child::Loaded(_))
    }

    /// Exclusive access to the slot, used to unload the child.
    pub(crate) fn lock(&self) -> RwLockWriteGuard<'_, Child> {
        self.0.write()
    }

    /// Returns the child, loading it through the cache if needed.
    ///
    /// The slot is checked under the read lock first and again under the
    /// write lock, so concurrent readers load a child only once.
    pub(crate) fn resolve(&self, parent: &NodeRef, cache: &NodeCache) -> Result<NodeRef> {
        if let Child::Loaded(node) = &*self.0.read() {
            cache.touch(node);
            return Ok(Arc::clone(node));
        }

        let mut slot = self.0.write();
        let id = match &*slot {
            Child::Loaded(node) => return Ok(Arc::clone(node)),
            Child::Unloaded(id) => *id,
        };
        let node = cache.get_node(id)?;
        node.set_parent(Some(parent));
        cache.register(&node);
        *slot = Child::Loaded(Arc::clone(&node));
        Ok(node)
    }
}

pub(crate) struct Intermediate {
    pub(crate) keys: Keys,
    /// Always one more than `keys`.
    children: Vec<ChildSlot>,
    dirty: bool,
}

impl Intermediate {
    /// Builds a node with exactly two children, as needed for a new root.
    pub(crate) fn with_children(
        left: NodeRef,
        right: NodeRef,
        separator: TermKey,
        ctx: &TreeContext,
    ) -> Result<Self> {
        let mut keys = Keys::new(ctx);
        keys.insert(0, KeyRef::from(&separator))?;
        let mut children = Vec::with_capacity(ctx.max_elements() + 2);
        children.push(ChildSlot::loaded(left));
        children.push(ChildSlot::loaded(right));
        Ok(Self {
            keys,
            children,
            dirty: true,
        })
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub(crate) fn children_len(&self) -> usize {
        self.children.len()
    }

    pub(crate) fn has_loaded_children(&self) -> bool {
        self.children.iter().any(ChildSlot::is_loaded)
    }

    pub(crate) fn loaded_children(&self) -> Vec<NodeRef> {
        self.children.iter().filter_map(ChildSlot::peek).collect()
    }

    #[cfg(test)]
    pub(crate) fn child_ids(&self) -> Vec<NodeId> {
        self.children.iter().map(ChildSlot::id).collect()
    }

    pub(crate) fn slot(&self, p: usize) -> Option<&ChildSlot> {
        self.children.get(p)
    }

    /// Index of the child covering `key`. Keys equal to a separator go left.
    #[inline]
    fn slot_for(&self, key: KeyRef<'_>) -> usize {
        match self.keys.position_of(key) {
            Ok(p) | Err(p) => p,
        }
    }

    pub(crate) fn child_at(&self, this: &NodeRef, cache: &NodeCache, p: usize) -> Result<NodeRef> {
        self.children
            .get(p)
            .ok_or_else(|| TrellisError::corrupted(this.id(), format!("no child at index {p}")))?
            .resolve(this, cache)
    }

    pub(crate) fn child_for_key(&self, this: &NodeRef, cache: &NodeCache, key: KeyRef<'_>) -> Result<NodeRef> {
        self.child_at(this, cache, self.slot_for(key))
    }

    /// Finds the slot holding `child`, trying the slot its first key maps
    /// to before scanning.
    pub(crate) fn position_of_child(&self, child: &NodeRef) -> Option<usize> {
        let holds = |p: usize| {
            self.children
                .get(p)
                .and_then(ChildSlot::peek)
                .is_some_and(|node| Arc::ptr_eq(&node, child))
        };
        let first = child.read().keys().first();
        if let Some(first) = first {
            let p = self.slot_for(KeyRef::from(&first));
            if holds(p) {
                return Some(p);
            }
        }
        (0..self.children.len()).find(|p| holds(*p))
    }

    pub(crate) fn put(
        &mut self,
        this: &NodeRef,
        cache: &NodeCache,
        key: KeyRef<'_>,
        value: ValueRef<'_>,
    ) -> Result<Option<NodeRef>> {
        let p = self.slot_for(key);
        let child = self.child_at(this, cache, p)?;
        match child.put(cache, key, value)? {
            Some(split) => self.update_children(this, cache, &child, split, p),
            None => Ok(None),
        }
    }

    /// Sends `key` to the last child. A key not above the last separator
    /// takes the regular `put` path.
    pub(crate) fn append(
        &mut self,
        this: &NodeRef,
        cache: &NodeCache,
        key: KeyRef<'_>,
        value: ValueRef<'_>,
    ) -> Result<Option<NodeRef>> {
        let last = self.keys.len();
        if last > 0 && self.keys.compare_at(last - 1, key) != Some(Ordering::Less) {
            return self.put(this, cache, key, value);
        }
        let child = self.child_at(this, cache, last)?;
        match child.append(cache, key, value)? {
            Some(split) => self.update_children(this, cache, &child, split, last),
            None => Ok(None),
        }
    }

    pub(crate) fn put_or_get(
        &mut self,
        this: &NodeRef,
        cache: &NodeCache,
        key: KeyRef<'_>,
        value: ValueRef<'_>,
    ) -> Result<PutOrGet> {
        let p = self.slot_for(key);
        let child = self.child_at(this, cache, p)?;
        let mut outcome = child.put_or_get(cache, key, value)?;
        if let Some(split) = outcome.split.take() {
            outcome.split = self.update_children(this, cache, &child, split, p)?;
        }
        Ok(outcome)
    }

    /// Links `split`, the new right sibling of child `p`, into this node.
    ///
    /// A full node splits first: the upper children move to a new sibling
    /// and the split child lands on whichever side `p` falls. Returns the
    /// new sibling, if any, for the caller to link one level up.
    fn update_children(
        &mut self,
        this: &NodeRef,
        cache: &NodeCache,
        left: &NodeRef,
        split: NodeRef,
        p: usize,
    ) -> Result<Option<NodeRef>> {
        let ctx = cache.context();
        let min = ctx.min_elements();
        self.dirty = true;

        if self.keys.len() < ctx.max_elements() {
            let key = separator(left, &split, cache)?;
            self.keys.insert(p, KeyRef::from(&key))?;
            split.set_parent(Some(this));
            self.children.insert(p + 1, ChildSlot::loaded(Arc::clone(&split)));
            cache.register(&split);
            return Ok(None);
        }

        let (keys, children) = if p < min {
            let key = separator(left, &split, cache)?;
            let children = self.children.split_off(min);
            let keys = self.keys.split_off(min, ctx);
            // The old boundary key is replaced by the parent's separator
            self.keys.remove_last();
            self.keys.insert(p, KeyRef::from(&key))?;
            split.set_parent(Some(this));
            self.children.insert(p + 1, ChildSlot::loaded(Arc::clone(&split)));
            (keys, children)
        } else {
            let mut children = self.children.split_off(min + 1);
            let mut keys = self.keys.split_off(min, ctx);
            if p > min {
                let key = separator(left, &split, cache)?;
                keys.remove_first();
                let q = p - (min + 1);
                keys.insert(q, KeyRef::from(&key))?;
                children.insert(q + 1, ChildSlot::loaded(Arc::clone(&split)));
            } else {
                children.insert(0, ChildSlot::loaded(Arc::clone(&split)));
            }
            (keys, children)
        };

        let sibling = cache.new_node(Node::Intermediate(Intermediate {
            keys,
            children,
            dirty: true,
        }));
        if let Node::Intermediate(moved) = &*sibling.read() {
            for child in moved.loaded_children() {
                child.set_parent(Some(&sibling));
            }
        }
        sibling.set_parent(this.parent().as_ref());
        cache.register(&split);
        Ok(Some(sibling))
    }

    /// Appends the child ids, one little-endian u64 each.
    pub(crate) fn encode_children(&self, buf: &mut Vec<u8>) {
        buf.reserve(self.children.len() * CHILD_ID_SIZE);
        for slot in &self.children {
            buf.extend_from_slice(&slot.id().to_le_bytes());
        }
    }

    pub(crate) fn decode(id: NodeId, keys: Keys, payload: &Bytes, pos: usize) -> Result<Self> {
        let count = keys.len() + 1;
        let expected = pos + count * CHILD_ID_SIZE;
        if payload.len() != expected {
            return Err(TrellisError::corrupted(
                id,
                format!("child table of {} bytes, expected {}", payload.len().saturating_sub(pos), count * CHILD_ID_SIZE),
            ));
        }
        let mut children = Vec::with_capacity(count + 1);
        for i in 0..count {
            let child = read_u64_le(payload, pos + i * CHILD_ID_SIZE)
                .ok_or_else(|| TrellisError::corrupted(id, "truncated child table"))?;
            children.push(ChildSlot::unloaded(child));
        }
        Ok(Self {
            keys,
            children,
            dirty: false,
        })
    }

    pub(crate) fn release(self, ctx: &TreeContext) {
        self.keys.release(ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::cache::tests::test_cache;
    use crate::tree::leaf::Leaf;
    use trellis_common::{TermValue, TreeConfig};

    fn config() -> TreeConfig {
        TreeConfig {
            max_elements_per_node: 4,
            text_values: true,
            ..TreeConfig::default()
        }
    }

    /// Inserts through a root that is grown by hand, like the tree root does.
    fn insert_all(cache: &NodeCache, keys: &[u64]) -> NodeRef {
        let mut root = cache.new_node(Node::Leaf(Leaf::new(cache.context())));
        for key in keys {
            if let Some(split) = root.put(cache, KeyRef::Numeric(*key), ValueRef::Number(key * 3)).unwrap() {
                let key = separator(&root, &split, cache).unwrap();
                let inner = Intermediate::with_children(root.clone(), split.clone(), key, cache.context()).unwrap();
                let grown = cache.new_node(Node::Intermediate(inner));
                root.set_parent(Some(&grown));
                split.set_parent(Some(&grown));
                root = grown;
            }
        }
        root
    }

    #[test]
    fn test_children_track_keys() {
        let (_dir, cache) = test_cache(config());
        let root = insert_all(&cache, &(1..=40).collect::<Vec<_>>());
        let guard = root.read();
        let Node::Intermediate(inner) = &*guard else {
            panic!("root should have grown");
        };
        assert_eq!(inner.children_len(), inner.keys.len() + 1);
    }

    #[test]
    fn test_lookup_after_splits() {
        let (_dir, cache) = test_cache(config());
        let keys: Vec<u64> = (1..=60).map(|k| (k * 7919) % 97).collect();
        let root = insert_all(&cache, &keys);
        for key in keys {
            assert_eq!(
                root.lookup(&cache, KeyRef::Numeric(key)).unwrap(),
                Some(TermValue::Number(key * 3))
            );
        }
        assert_eq!(root.lookup(&cache, KeyRef::Numeric(1000)).unwrap(), None);
    }

    #[test]
    fn test_split_children_point_to_new_parent() {
        let (_dir, cache) = test_cache(config());
        let root = insert_all(&cache, &(1..=30).collect::<Vec<_>>());
        let guard = root.read();
        let Node::Intermediate(inner) = &*guard else {
            panic!("root should have grown");
        };
        for child in inner.loaded_children() {
            let parent = child.parent().expect("child has a parent");
            assert!(Arc::ptr_eq(&parent, &root));
            let child_guard = child.read();
            if let Node::Intermediate(grand) = &*child_guard {
                for leaf in grand.loaded_children() {
                    assert!(Arc::ptr_eq(&leaf.parent().unwrap(), &child));
                }
            }
        }
    }

    #[test]
    fn test_right_sibling_walk_visits_keys_in_order() {
        let (_dir, cache) = test_cache(config());
        let root = insert_all(&cache, &(1..=50).rev().collect::<Vec<_>>());
        let mut leaf = root.leftmost_leaf(&cache).unwrap();
        let mut seen = Vec::new();
        loop {
            if let Node::Leaf(l) = &*leaf.read() {
                for i in 0..l.len() {
                    let (key, _) = l.entry_at(leaf.id(), cache.context(), i).unwrap();
                    seen.push(key);
                }
            }
            let next = leaf.right_sibling(&cache).unwrap();
            if Arc::ptr_eq(&next, &leaf) {
                break;
            }
            leaf = next;
        }
        let expected: Vec<TermKey> = (1..=50).map(TermKey::Numeric).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_decode_rejects_short_child_table() {
        let (_dir, cache) = test_cache(config());
        let ctx = cache.context();
        let mut keys = Keys::new(ctx);
        keys.insert(0, KeyRef::Numeric(5)).unwrap();
        let payload = Bytes::from(vec![0u8; 8]);
        assert!(Intermediate::decode(1, keys, &payload, 0).is_err());
    }
}
