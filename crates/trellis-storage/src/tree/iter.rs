//! Ordered iteration over the leaves.

use super::cache::NodeCache;
use super::node::{Node, NodeRef};
use std::sync::Arc;
use trellis_common::{Result, TermKey, TermValue, TrellisError};

/// Iterator over every `(key, value)` of a tree in ascending key order.
///
/// Holds one leaf at a time and moves right through the parent links; the
/// node cache may evict leaves already visited.
pub struct TreeIter<'a> {
    cache: &'a NodeCache,
    leaf: Option<NodeRef>,
    index: usize,
}

impl<'a> TreeIter<'a> {
    pub(crate) fn new(cache: &'a NodeCache, leaf: NodeRef) -> Self {
        Self {
            cache,
            leaf: Some(leaf),
            index: 0,
        }
    }

    fn fail(&mut self, err: TrellisError) -> Option<Result<(TermKey, TermValue)>> {
        self.leaf = None;
        Some(Err(err))
    }
}

impl Iterator for TreeIter<'_> {
    type Item = Result<(TermKey, TermValue)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let leaf = self.leaf.clone()?;
            let entry = match &*leaf.read() {
                Node::Leaf(inner) if self.index < inner.len() => {
                    Some(inner.entry_at(leaf.id(), self.cache.context(), self.index))
                }
                Node::Leaf(_) => None,
                Node::Intermediate(_) => Some(Err(TrellisError::corrupted(
                    leaf.id(),
                    "iterator reached an intermediate node",
                ))),
            };
            if let Some(entry) = entry {
                self.index += 1;
                return match entry {
                    Ok(pair) => Some(Ok(pair)),
                    Err(err) => self.fail(err),
                };
            }

            let next = match leaf.right_sibling(self.cache) {
                Ok(next) => next,
                Err(err) => return self.fail(err),
            };
            if Arc::ptr_eq(&next, &leaf) {
                self.leaf = None;
                return None;
            }
            self.leaf = Some(next);
            self.index = 0;
            drop(leaf);
            if let Err(err) = self.cache.evict_overflow() {
                return self.fail(err);
            }
        }
    }
}
