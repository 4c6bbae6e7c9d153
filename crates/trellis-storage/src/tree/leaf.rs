//! Leaf nodes: sorted keys and their values.
//!
//! Numeric values live in one pooled array. Coordinate values live in two
//! half-arrays of lines split at `min_elements`, so a split hands the upper
//! half to the new sibling without copying. Lines of a read-only leaf stay
//! encoded until first touched; after `MAX_LAZY_LINES` lazy parses the leaf
//! parses everything that is left.

use super::cache::NodeCache;
use super::context::{TreeContext, MAX_LAZY_LINES};
use super::coordinates::{CoordinateList, Line};
use super::keys::{KeyRef, Keys};
use super::node::{Node, NodeRef, PutOrGet, ValueRef};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::OnceLock;
use tracing::debug;
use trellis_common::encoding::{decode_varint, encode_varint, read_u16_le, read_u32_le, varint_len};
use trellis_common::{
    Coordinate, CoordinateSet, NodeId, Permutation, Result, Strategy, TermKey, TermValue, TreeMode,
    TrellisError, N_PERMUTATIONS,
};

/// Size of the total-length field that opens the value block.
const VALUE_BLOCK_HEADER: usize = 4;

/// Largest line offset the u16 offset table can hold.
const MAX_LINE_OFFSET: usize = u16::MAX as usize;

/// Encoded size of a line holding every permutation at maximum width.
const MAX_LINE_LEN: usize = N_PERMUTATIONS * (10 + 3 + 10 + 1);

/// How a write changes the lines of a coordinate leaf.
#[derive(Clone, Copy)]
enum LineChange {
    Overwrite,
    Insert,
    /// Insert into a full leaf, which splits at `min` first.
    InsertAndSplit,
}

/// Encoded size of one line.
fn line_len<'a>(coordinates: impl Iterator<Item = &'a Coordinate>) -> usize {
    coordinates
        .map(|c| varint_len(c.n_elements) + varint_len(c.file as u64) + varint_len(c.pos_in_file) + 1)
        .sum()
}

/// Offset of the last line when lines of the given sizes are encoded.
fn last_line_offset(lens: &[usize]) -> usize {
    let before_last = lens.len().saturating_sub(1);
    VALUE_BLOCK_HEADER + lens[..before_last].iter().sum::<usize>()
}

pub(crate) struct Leaf {
    pub(crate) keys: Keys,
    values: LeafValues,
    dirty: bool,
}

enum LeafValues {
    Numbers(Vec<u64>),
    Lines(Lines),
}

impl LeafValues {
    fn new(ctx: &TreeContext) -> Self {
        match ctx.mode() {
            TreeMode::Coordinates => LeafValues::Lines(Lines::new(ctx)),
            TreeMode::NumericValues | TreeMode::TextKeys => LeafValues::Numbers(ctx.words().get()),
        }
    }

    fn accepts(&self, value: ValueRef<'_>) -> bool {
        matches!(
            (self, value),
            (LeafValues::Numbers(_), ValueRef::Number(_))
                | (LeafValues::Lines(_), ValueRef::Coordinates(_))
        )
    }

    fn split_off(&mut self, id: NodeId, at: usize, ctx: &TreeContext) -> Result<LeafValues> {
        Ok(match self {
            LeafValues::Numbers(values) => {
                let mut tail = ctx.words().get();
                tail.extend(values.drain(at..));
                LeafValues::Numbers(tail)
            }
            LeafValues::Lines(lines) => LeafValues::Lines(lines.split_off(id, ctx)?),
        })
    }

    fn release(self, ctx: &TreeContext) {
        match self {
            LeafValues::Numbers(values) => ctx.words().release(values),
            LeafValues::Lines(lines) => lines.release(ctx),
        }
    }
}

impl Leaf {
    pub(crate) fn new(ctx: &TreeContext) -> Self {
        Self {
            keys: Keys::new(ctx),
            values: LeafValues::new(ctx),
            dirty: true,
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.keys.len()
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn mark_clean(&mut self) {
        self.dirty = false;
    }

    fn check(&self, key: KeyRef<'_>, value: ValueRef<'_>) -> Result<()> {
        if self.keys.accepts(key) && self.values.accepts(value) {
            Ok(())
        } else {
            Err(TrellisError::Unsupported(
                "key or value kind does not match the tree mode".to_string(),
            ))
        }
    }

    pub(crate) fn get(&self, id: NodeId, ctx: &TreeContext, key: KeyRef<'_>) -> Result<Option<TermValue>> {
        match self.keys.position_of(key) {
            Ok(p) => self.value_at(id, ctx, p).map(Some),
            Err(_) => Ok(None),
        }
    }

    pub(crate) fn value_at(&self, id: NodeId, ctx: &TreeContext, p: usize) -> Result<TermValue> {
        match &self.values {
            LeafValues::Numbers(values) => values
                .get(p)
                .map(|value| TermValue::Number(*value))
                .ok_or_else(|| TrellisError::corrupted(id, format!("no value at index {p}"))),
            LeafValues::Lines(lines) => Ok(TermValue::Coordinates(lines.list_at(id, p, ctx)?.to_set())),
        }
    }

    pub(crate) fn entry_at(&self, id: NodeId, ctx: &TreeContext, p: usize) -> Result<(TermKey, TermValue)> {
        let key = self
            .keys
            .key_at(p)
            .ok_or_else(|| TrellisError::corrupted(id, format!("no key at index {p}")))?;
        Ok((key.to_owned_key(), self.value_at(id, ctx, p)?))
    }

    pub(crate) fn put(
        &mut self,
        this: &NodeRef,
        cache: &NodeCache,
        key: KeyRef<'_>,
        value: ValueRef<'_>,
    ) -> Result<Option<NodeRef>> {
        self.check(key, value)?;
        match self.keys.position_of(key) {
            Ok(p) => {
                self.overwrite(this.id(), cache.context(), p, value)?;
                Ok(None)
            }
            Err(p) => self.insert_at(this, cache, p, key, value),
        }
    }

    /// Inserts `key` as the new largest key of the leaf. A key that does not
    /// sort after the current last key takes the regular `put` path.
    pub(crate) fn append(
        &mut self,
        this: &NodeRef,
        cache: &NodeCache,
        key: KeyRef<'_>,
        value: ValueRef<'_>,
    ) -> Result<Option<NodeRef>> {
        self.check(key, value)?;
        let len = self.keys.len();
        if len > 0 && self.keys.compare_at(len - 1, key) != Some(std::cmp::Ordering::Less) {
            return self.put(this, cache, key, value);
        }
        self.insert_at(this, cache, len, key, value)
    }

    pub(crate) fn put_or_get(
        &mut self,
        this: &NodeRef,
        cache: &NodeCache,
        key: KeyRef<'_>,
        value: ValueRef<'_>,
    ) -> Result<PutOrGet> {
        self.check(key, value)?;
        match self.keys.position_of(key) {
            Ok(p) => Ok(PutOrGet {
                split: None,
                value: self.value_at(this.id(), cache.context(), p)?,
                inserted: false,
            }),
            Err(p) => {
                let split = self.insert_at(this, cache, p, key, value)?;
                Ok(PutOrGet {
                    split,
                    value: value.to_owned_value(),
                    inserted: true,
                })
            }
        }
    }

    fn overwrite(&mut self, id: NodeId, ctx: &TreeContext, p: usize, value: ValueRef<'_>) -> Result<()> {
        match (&mut self.values, value) {
            (LeafValues::Numbers(values), ValueRef::Number(number)) => {
                let slot = values
                    .get_mut(p)
                    .ok_or_else(|| TrellisError::corrupted(id, format!("no value at index {p}")))?;
                *slot = number;
            }
            (LeafValues::Lines(lines), ValueRef::Coordinates(set)) => {
                lines.check_capacity(id, ctx, p, set, LineChange::Overwrite)?;
                lines.list_mut(id, p, ctx)?.add_coordinates(set, ctx.cells());
            }
            _ => {
                return Err(TrellisError::Unsupported(
                    "value kind does not match the tree mode".to_string(),
                ))
            }
        }
        self.dirty = true;
        Ok(())
    }

    /// Inserts without regard to capacity. Kind checks happened in the caller.
    fn insert_in_place(&mut self, ctx: &TreeContext, p: usize, key: KeyRef<'_>, value: ValueRef<'_>) -> Result<()> {
        self.keys.insert(p, key)?;
        match (&mut self.values, value) {
            (LeafValues::Numbers(values), ValueRef::Number(number)) => values.insert(p, number),
            (LeafValues::Lines(lines), ValueRef::Coordinates(set)) => {
                let line = Line::from(CoordinateList::from_set(set, ctx.cells()));
                lines.insert(p, line, ctx.min_elements());
            }
            _ => {
                return Err(TrellisError::Unsupported(
                    "value kind does not match the tree mode".to_string(),
                ))
            }
        }
        self.dirty = true;
        Ok(())
    }

    /// Inserts at `p`, splitting first when the leaf is full.
    ///
    /// Entries from `min_elements` on move to the new sibling, which is
    /// returned for the parent to link.
    fn insert_at(
        &mut self,
        this: &NodeRef,
        cache: &NodeCache,
        p: usize,
        key: KeyRef<'_>,
        value: ValueRef<'_>,
    ) -> Result<Option<NodeRef>> {
        let ctx = cache.context();
        let full = self.keys.len() >= ctx.max_elements();
        if let (LeafValues::Lines(lines), ValueRef::Coordinates(set)) = (&self.values, value) {
            let change = if full { LineChange::InsertAndSplit } else { LineChange::Insert };
            lines.check_capacity(this.id(), ctx, p, set, change)?;
        }
        if !full {
            self.insert_in_place(ctx, p, key, value)?;
            return Ok(None);
        }

        let min = ctx.min_elements();
        let mut right = Leaf {
            keys: self.keys.split_off(min, ctx),
            values: self.values.split_off(this.id(), min, ctx)?,
            dirty: true,
        };
        self.dirty = true;
        if p < min {
            self.insert_in_place(ctx, p, key, value)?;
        } else {
            right.insert_in_place(ctx, p - min, key, value)?;
        }

        let sibling = cache.new_node(Node::Leaf(right));
        sibling.set_parent(this.parent().as_ref());
        Ok(Some(sibling))
    }

    pub(crate) fn encode_values(&self, id: NodeId, ctx: &TreeContext, buf: &mut Vec<u8>) -> Result<()> {
        match &self.values {
            LeafValues::Numbers(values) => {
                for value in values {
                    encode_varint(*value, buf);
                }
                Ok(())
            }
            LeafValues::Lines(lines) => lines.encode(id, ctx, buf),
        }
    }

    /// Decodes the value section at `payload[pos..]`; `keys` were decoded
    /// from the node header. The section must run to the end of `payload`.
    pub(crate) fn decode(id: NodeId, keys: Keys, payload: &Bytes, mut pos: usize, ctx: &TreeContext) -> Result<Leaf> {
        let count = keys.len();
        let values = match ctx.mode() {
            TreeMode::Coordinates => {
                let (lines, consumed) = Lines::decode(id, count, payload.slice(pos..), ctx)?;
                pos += consumed;
                LeafValues::Lines(lines)
            }
            TreeMode::NumericValues | TreeMode::TextKeys => {
                let mut values = ctx.words().get();
                for _ in 0..count {
                    match decode_varint(payload, &mut pos) {
                        Some(value) => values.push(value),
                        None => {
                            ctx.words().release(values);
                            keys.release(ctx);
                            return Err(TrellisError::corrupted(id, "truncated numeric values"));
                        }
                    }
                }
                LeafValues::Numbers(values)
            }
        };
        let leaf = Leaf {
            keys,
            values,
            dirty: false,
        };
        if pos != payload.len() {
            leaf.release(ctx);
            return Err(TrellisError::corrupted(
                id,
                format!("{} trailing bytes after leaf values", payload.len().saturating_sub(pos)),
            ));
        }
        Ok(leaf)
    }

    pub(crate) fn release(self, ctx: &TreeContext) {
        self.keys.release(ctx);
        self.values.release(ctx);
    }
}

/// Coordinate values of a leaf.
struct Lines {
    /// Lines `0..min`.
    first: Vec<Line>,
    /// Lines `min..`; non-empty only while `first` is full.
    second: Vec<Line>,
    /// Encoded payload backing the lines not parsed yet.
    raw: Option<RawLines>,
    /// Lines parsed lazily so far.
    parsed: AtomicUsize,
    /// Set once the whole payload has been parsed.
    eager: AtomicBool,
}

struct RawLines {
    /// Bitmask bytes, offset table and value block.
    bytes: Bytes,
    count: usize,
}

impl Lines {
    fn new(ctx: &TreeContext) -> Self {
        Self {
            first: ctx.lines().get(),
            second: ctx.lines().get(),
            raw: None,
            parsed: AtomicUsize::new(0),
            eager: AtomicBool::new(false),
        }
    }

    fn len(&self) -> usize {
        self.first.len() + self.second.len()
    }

    fn slot(&self, p: usize, min: usize) -> Option<&Line> {
        if p < min {
            self.first.get(p)
        } else {
            self.second.get(p - min)
        }
    }

    fn slot_mut(&mut self, p: usize, min: usize) -> Option<&mut Line> {
        if p < min {
            self.first.get_mut(p)
        } else {
            self.second.get_mut(p - min)
        }
    }

    fn push(&mut self, line: Line, min: usize) {
        if self.first.len() < min {
            self.first.push(line);
        } else {
            self.second.push(line);
        }
    }

    fn insert(&mut self, p: usize, line: Line, min: usize) {
        if p < min {
            if self.first.len() == min {
                if let Some(last) = self.first.pop() {
                    self.second.insert(0, last);
                }
            }
            self.first.insert(p, line);
        } else {
            self.second.insert(p - min, line);
        }
    }

    /// Hands the upper half to a new line set. The lines must be parsed
    /// first since the encoded payload cannot be shared.
    fn split_off(&mut self, id: NodeId, ctx: &TreeContext) -> Result<Lines> {
        self.materialize_all(id, ctx)?;
        self.raw = None;
        let moved = std::mem::replace(&mut self.second, ctx.lines().get());
        let mut right = Lines::new(ctx);
        let empty = std::mem::replace(&mut right.first, moved);
        ctx.lines().release(empty);
        Ok(right)
    }

    fn list_at(&self, id: NodeId, p: usize, ctx: &TreeContext) -> Result<&CoordinateList> {
        let line = self
            .slot(p, ctx.min_elements())
            .ok_or_else(|| TrellisError::corrupted(id, format!("no line at index {p}")))?;
        if let Some(list) = line.get() {
            return Ok(list);
        }

        let list = self.parse(id, p, ctx)?;
        if let Err(lost) = line.set(list) {
            lost.release(ctx.cells());
        }

        let parsed = self.parsed.fetch_add(1, Ordering::Relaxed) + 1;
        if parsed > MAX_LAZY_LINES && !self.eager.swap(true, Ordering::AcqRel) {
            debug!(node_id = id, parsed, "leaf switched to eager parsing");
            self.materialize_all(id, ctx)?;
        }

        line.get()
            .ok_or_else(|| TrellisError::corrupted(id, format!("line {p} not materialized")))
    }

    fn list_mut(&mut self, id: NodeId, p: usize, ctx: &TreeContext) -> Result<&mut CoordinateList> {
        self.list_at(id, p, ctx)?;
        self.slot_mut(p, ctx.min_elements())
            .and_then(OnceLock::get_mut)
            .ok_or_else(|| TrellisError::corrupted(id, format!("line {p} not materialized")))
    }

    fn materialize_all(&self, id: NodeId, ctx: &TreeContext) -> Result<()> {
        if self.raw.is_none() {
            return Ok(());
        }
        let min = ctx.min_elements();
        for p in 0..self.len() {
            let Some(line) = self.slot(p, min) else { continue };
            if line.get().is_some() {
                continue;
            }
            if let Err(lost) = line.set(self.parse(id, p, ctx)?) {
                lost.release(ctx.cells());
            }
        }
        Ok(())
    }

    /// Fails with `CapacityExceeded` when writing `set` at `p` would leave a
    /// leaf whose line offsets no longer fit the offset table. Nothing is
    /// changed either way.
    fn check_capacity(
        &self,
        id: NodeId,
        ctx: &TreeContext,
        p: usize,
        set: &CoordinateSet,
        change: LineChange,
    ) -> Result<()> {
        let n = self.len();
        if VALUE_BLOCK_HEADER + (n + 1) * MAX_LINE_LEN <= MAX_LINE_OFFSET {
            return Ok(());
        }

        let mut lens = Vec::with_capacity(n + 1);
        for q in 0..n {
            lens.push(line_len(self.list_at(id, q, ctx)?.iter()));
        }
        let len = line_len(set.iter());
        let offset = match change {
            LineChange::Overwrite => {
                let slot = lens
                    .get_mut(p)
                    .ok_or_else(|| TrellisError::corrupted(id, format!("no line at index {p}")))?;
                *slot = len;
                last_line_offset(&lens)
            }
            LineChange::Insert => {
                lens.insert(p.min(n), len);
                last_line_offset(&lens)
            }
            LineChange::InsertAndSplit => {
                let min = ctx.min_elements();
                lens.insert(p.min(n), len);
                let at = (if p < min { min + 1 } else { min }).min(lens.len());
                let (left, right) = lens.split_at(at);
                last_line_offset(left).max(last_line_offset(right))
            }
        };
        if offset > MAX_LINE_OFFSET {
            debug!(node_id = id, offset, "coordinate write rejected, leaf offsets would overflow");
            return Err(TrellisError::CapacityExceeded {
                offset,
                max: MAX_LINE_OFFSET,
            });
        }
        Ok(())
    }

    /// Parses line `p` from the encoded payload.
    fn parse(&self, id: NodeId, p: usize, ctx: &TreeContext) -> Result<CoordinateList> {
        let raw = self
            .raw
            .as_ref()
            .ok_or_else(|| TrellisError::corrupted(id, format!("line {p} has no encoded form")))?;
        let bytes = &raw.bytes[..];
        let n = raw.count;

        let mask = *bytes
            .get(p)
            .ok_or_else(|| TrellisError::corrupted(id, "truncated bitmask table"))?;
        if mask as usize >= 1 << N_PERMUTATIONS {
            return Err(TrellisError::corrupted(
                id,
                format!("bitmask {mask:#04x} names unknown permutations"),
            ));
        }
        let offset = read_u16_le(bytes, n + 2 * p)
            .ok_or_else(|| TrellisError::corrupted(id, "truncated offset table"))? as usize;
        let mut pos = 3 * n + offset;
        if offset < VALUE_BLOCK_HEADER || pos > bytes.len() {
            return Err(TrellisError::corrupted(
                id,
                format!("offset {offset} of line {p} points outside the payload"),
            ));
        }

        let truncated = || TrellisError::corrupted(id, format!("truncated coordinates in line {p}"));
        let mut coordinates = Vec::with_capacity(mask.count_ones() as usize);
        for index in (0..N_PERMUTATIONS).filter(|i| mask & (1 << i) != 0) {
            let permutation = Permutation::from_index(index)
                .ok_or_else(|| TrellisError::corrupted(id, format!("unknown permutation {index}")))?;
            let n_elements = decode_varint(bytes, &mut pos).ok_or_else(truncated)?;
            let file = decode_varint(bytes, &mut pos).ok_or_else(truncated)?;
            let file = u16::try_from(file)
                .map_err(|_| TrellisError::corrupted(id, format!("file index {file} out of range")))?;
            let pos_in_file = decode_varint(bytes, &mut pos).ok_or_else(truncated)?;
            let strategy = *bytes.get(pos).ok_or_else(truncated)?;
            pos += 1;
            coordinates.push(Coordinate::new(
                permutation,
                file,
                pos_in_file,
                n_elements,
                Strategy(strategy),
            ));
        }
        Ok(CoordinateList::from_sorted(coordinates, ctx.cells()))
    }

    /// Appends the bitmask table, the offset table and the value block.
    fn encode(&self, id: NodeId, ctx: &TreeContext, buf: &mut Vec<u8>) -> Result<()> {
        let n = self.len();
        let base = buf.len();
        let block = base + 3 * n;
        buf.resize(block + VALUE_BLOCK_HEADER, 0);

        for p in 0..n {
            let offset = buf.len() - block;
            let offset = u16::try_from(offset).map_err(|_| TrellisError::CapacityExceeded {
                offset,
                max: MAX_LINE_OFFSET,
            })?;
            let entry = base + n + 2 * p;
            buf[entry..entry + 2].copy_from_slice(&offset.to_le_bytes());

            let mut mask = 0u8;
            for coordinate in self.list_at(id, p, ctx)?.iter() {
                encode_varint(coordinate.n_elements, buf);
                encode_varint(coordinate.file as u64, buf);
                encode_varint(coordinate.pos_in_file, buf);
                buf.push(coordinate.strategy.0);
                mask |= 1 << coordinate.permutation.index();
            }
            buf[base + p] = mask;
        }

        let total = buf.len() - block;
        let total = u32::try_from(total).map_err(|_| TrellisError::CapacityExceeded {
            offset: total,
            max: u32::MAX as usize,
        })?;
        buf[block..block + VALUE_BLOCK_HEADER].copy_from_slice(&total.to_le_bytes());
        Ok(())
    }

    /// Decodes `count` lines from the start of `payload`. Returns the lines
    /// and the number of bytes they occupy.
    fn decode(id: NodeId, count: usize, payload: Bytes, ctx: &TreeContext) -> Result<(Lines, usize)> {
        let table = 3 * count;
        let total = read_u32_le(&payload, table)
            .ok_or_else(|| TrellisError::corrupted(id, "truncated value block header"))? as usize;
        let end = table + total;
        if total < VALUE_BLOCK_HEADER || end > payload.len() {
            return Err(TrellisError::corrupted(
                id,
                format!("value block of {total} bytes does not fit the payload"),
            ));
        }

        let min = ctx.min_elements();
        let mut lines = Lines::new(ctx);
        for _ in 0..count {
            lines.push(OnceLock::new(), min);
        }
        lines.raw = Some(RawLines {
            bytes: payload.slice(..end),
            count,
        });

        if !ctx.read_only() {
            if let Err(e) = lines.materialize_all(id, ctx) {
                lines.release(ctx);
                return Err(e);
            }
            lines.raw = None;
            lines.eager.store(true, Ordering::Relaxed);
        }
        Ok((lines, end))
    }

    fn release(self, ctx: &TreeContext) {
        let Lines {
            mut first,
            mut second,
            ..
        } = self;
        for line in first.drain(..).chain(second.drain(..)) {
            if let Some(list) = line.into_inner() {
                list.release(ctx.cells());
            }
        }
        ctx.lines().release(first);
        ctx.lines().release(second);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_common::TreeConfig;

    fn context(read_only: bool) -> TreeContext {
        TreeContext::new(TreeConfig {
            max_elements_per_node: 8,
            read_only,
            ..TreeConfig::default()
        })
    }

    fn sized_context(max_elements_per_node: usize, text_values: bool, text_keys: bool, read_only: bool) -> TreeContext {
        TreeContext::new(TreeConfig {
            max_elements_per_node,
            text_values,
            text_keys,
            read_only,
            ..TreeConfig::default()
        })
    }

    /// Every permutation at maximum width, `MAX_LINE_LEN` bytes encoded.
    fn widest_set() -> CoordinateSet {
        Permutation::ALL
            .iter()
            .map(|p| Coordinate::new(*p, u16::MAX, u64::MAX, u64::MAX, Strategy(9)))
            .collect()
    }

    fn entries(leaf: &Leaf, ctx: &TreeContext) -> Vec<(TermKey, TermValue)> {
        (0..leaf.len()).map(|p| leaf.entry_at(1, ctx, p).unwrap()).collect()
    }

    fn lines(leaf: &Leaf) -> &Lines {
        match &leaf.values {
            LeafValues::Lines(lines) => lines,
            LeafValues::Numbers(_) => panic!("coordinate leaf expected"),
        }
    }

    fn set_for(key: u64) -> CoordinateSet {
        [
            Coordinate::new(Permutation::Spo, 0, key * 100, key + 1, Strategy(2)),
            Coordinate::new(Permutation::Osp, (key % 3) as u16, key * 7, 1, Strategy(0)),
        ]
        .into_iter()
        .collect()
    }

    fn filled_leaf(ctx: &TreeContext, count: u64) -> Leaf {
        let mut leaf = Leaf::new(ctx);
        for key in 0..count {
            let set = set_for(key);
            leaf.insert_in_place(ctx, key as usize, KeyRef::Numeric(key * 10), ValueRef::Coordinates(&set))
                .unwrap();
        }
        leaf
    }

    fn encode(leaf: &Leaf, ctx: &TreeContext) -> Bytes {
        let mut buf = Vec::new();
        leaf.keys.encode(&mut buf);
        leaf.encode_values(1, ctx, &mut buf).unwrap();
        Bytes::from(buf)
    }

    fn decode(payload: &Bytes, count: usize, ctx: &TreeContext) -> Result<Leaf> {
        let mut pos = 0;
        let keys = Keys::decode(payload, &mut pos, count, ctx).unwrap();
        Leaf::decode(1, keys, payload, pos, ctx)
    }

    #[test]
    fn test_lines_split_across_halves() {
        let ctx = context(false);
        let leaf = filled_leaf(&ctx, 7);
        let LeafValues::Lines(lines) = &leaf.values else {
            panic!("coordinate leaf expected");
        };
        assert_eq!(lines.first.len(), 4);
        assert_eq!(lines.second.len(), 3);
        for key in 0..7 {
            assert_eq!(
                leaf.value_at(1, &ctx, key).unwrap(),
                TermValue::Coordinates(set_for(key as u64))
            );
        }
    }

    #[test]
    fn test_insert_front_shifts_between_halves() {
        let ctx = context(false);
        let mut leaf = Leaf::new(&ctx);
        for key in (0..6u64).rev() {
            let set = set_for(key);
            leaf.insert_in_place(&ctx, 0, KeyRef::Numeric(key), ValueRef::Coordinates(&set))
                .unwrap();
        }
        for key in 0..6 {
            assert_eq!(
                leaf.get(1, &ctx, KeyRef::Numeric(key)).unwrap(),
                Some(TermValue::Coordinates(set_for(key)))
            );
        }
    }

    #[test]
    fn test_coordinate_payload_layout() {
        let ctx = context(false);
        let leaf = filled_leaf(&ctx, 2);
        let mut buf = Vec::new();
        leaf.encode_values(1, &ctx, &mut buf).unwrap();

        // Two bitmask bytes, both with Spo and Osp set
        assert_eq!(buf[0], 0b0001_0001);
        assert_eq!(buf[1], 0b0001_0001);
        // First offset sits right after the block length
        assert_eq!(read_u16_le(&buf, 2), Some(4));
        let total = read_u32_le(&buf, 6).unwrap() as usize;
        assert_eq!(6 + total, buf.len());
    }

    #[test]
    fn test_read_only_decode_is_lazy() {
        let writer = context(false);
        let leaf = filled_leaf(&writer, 8);
        let payload = encode(&leaf, &writer);

        let reader = context(true);
        let loaded = decode(&payload, 8, &reader).unwrap();
        let LeafValues::Lines(lines) = &loaded.values else {
            panic!("coordinate leaf expected");
        };
        assert!(lines.raw.is_some());
        assert!(lines.first.iter().all(|line| line.get().is_none()));

        assert_eq!(
            loaded.value_at(1, &reader, 5).unwrap(),
            TermValue::Coordinates(set_for(5))
        );
        assert!(lines.slot(5, 4).and_then(OnceLock::get).is_some());
        assert!(lines.slot(0, 4).and_then(OnceLock::get).is_none());
    }

    #[test]
    fn test_writable_decode_is_eager() {
        let ctx = context(false);
        let leaf = filled_leaf(&ctx, 5);
        let payload = encode(&leaf, &ctx);
        let loaded = decode(&payload, 5, &ctx).unwrap();
        let LeafValues::Lines(lines) = &loaded.values else {
            panic!("coordinate leaf expected");
        };
        assert!(lines.raw.is_none());
        for p in 0..5 {
            assert!(lines.slot(p, 4).and_then(OnceLock::get).is_some());
        }
    }

    #[test]
    fn test_offset_outside_payload_is_corruption() {
        let ctx = context(true);
        let leaf = filled_leaf(&ctx, 2);
        let payload = encode(&leaf, &ctx);

        let mut bad = payload.to_vec();
        // Keys take two bytes, the second offset entry follows the bitmasks
        let entry = 2 + 2 + 2;
        bad[entry..entry + 2].copy_from_slice(&0xFFF0u16.to_le_bytes());
        let loaded = decode(&Bytes::from(bad), 2, &ctx).unwrap();
        let err = loaded.value_at(1, &ctx, 1).unwrap_err();
        assert!(matches!(err, TrellisError::Corrupted { .. }));
    }

    #[test]
    fn test_bad_bitmask_is_corruption() {
        let ctx = context(true);
        let leaf = filled_leaf(&ctx, 1);
        let payload = encode(&leaf, &ctx);

        let mut bad = payload.to_vec();
        // One key byte, then the bitmask
        bad[1] = 0xC0;
        let loaded = decode(&Bytes::from(bad), 1, &ctx).unwrap();
        assert!(matches!(
            loaded.value_at(1, &ctx, 0),
            Err(TrellisError::Corrupted { .. })
        ));
    }

    #[test]
    fn test_value_block_overflow_is_capacity_error() {
        let ctx = TreeContext::new(TreeConfig {
            max_elements_per_node: 4096,
            ..TreeConfig::default()
        });
        let mut leaf = Leaf::new(&ctx);
        let full = widest_set();
        // Each line takes 144 bytes, so a thousand of them overflow 64 KiB
        for key in 0..1000u64 {
            leaf.insert_in_place(&ctx, key as usize, KeyRef::Numeric(key), ValueRef::Coordinates(&full))
                .unwrap();
        }
        let mut buf = Vec::new();
        let err = leaf.encode_values(1, &ctx, &mut buf).unwrap_err();
        assert!(matches!(err, TrellisError::CapacityExceeded { max: 65535, .. }));
    }

    #[test]
    fn test_numeric_values_roundtrip() {
        let ctx = TreeContext::new(TreeConfig {
            max_elements_per_node: 8,
            text_values: true,
            ..TreeConfig::default()
        });
        let mut leaf = Leaf::new(&ctx);
        for key in 0..6u64 {
            leaf.insert_in_place(&ctx, key as usize, KeyRef::Numeric(key), ValueRef::Number(key << 33))
                .unwrap();
        }
        let payload = encode(&leaf, &ctx);
        let loaded = decode(&payload, 6, &ctx).unwrap();
        assert_eq!(
            loaded.get(1, &ctx, KeyRef::Numeric(4)).unwrap(),
            Some(TermValue::Number(4 << 33))
        );
        assert!(!loaded.is_dirty());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let ctx = TreeContext::new(TreeConfig {
            max_elements_per_node: 8,
            text_values: true,
            ..TreeConfig::default()
        });
        let mut leaf = Leaf::new(&ctx);
        leaf.insert_in_place(&ctx, 0, KeyRef::Numeric(3), ValueRef::Number(9))
            .unwrap();
        let mut bytes = encode(&leaf, &ctx).to_vec();
        bytes.push(0);
        assert!(decode(&Bytes::from(bytes), 1, &ctx).is_err());
    }

    #[test]
    fn test_line_len_matches_encoding() {
        let ctx = context(false);
        let mut leaf = Leaf::new(&ctx);
        let full = widest_set();
        leaf.insert_in_place(&ctx, 0, KeyRef::Numeric(1), ValueRef::Coordinates(&full))
            .unwrap();
        let mut buf = Vec::new();
        leaf.encode_values(1, &ctx, &mut buf).unwrap();
        assert_eq!(line_len(full.iter()), MAX_LINE_LEN);
        // One bitmask byte, one offset and the block length precede the line
        assert_eq!(buf.len(), 3 + VALUE_BLOCK_HEADER + MAX_LINE_LEN);
    }

    #[test]
    fn test_capacity_check_rejects_unencodable_writes() {
        let ctx = sized_context(4096, false, false, false);
        let mut leaf = Leaf::new(&ctx);
        let full = widest_set();
        let empty = CoordinateSet::new();
        leaf.insert_in_place(&ctx, 0, KeyRef::Numeric(0), ValueRef::Coordinates(&empty))
            .unwrap();
        for key in 1..=456u64 {
            leaf.insert_in_place(&ctx, key as usize, KeyRef::Numeric(key), ValueRef::Coordinates(&full))
                .unwrap();
        }
        let mut buf = Vec::new();
        leaf.encode_values(1, &ctx, &mut buf).unwrap();

        let lines = lines(&leaf);
        assert!(lines.check_capacity(1, &ctx, 0, &empty, LineChange::Overwrite).is_ok());
        assert!(lines.check_capacity(1, &ctx, 0, &empty, LineChange::Insert).is_ok());
        assert!(matches!(
            lines.check_capacity(1, &ctx, 0, &full, LineChange::Overwrite),
            Err(TrellisError::CapacityExceeded {
                offset: 65668,
                max: 65535
            })
        ));
        assert!(matches!(
            lines.check_capacity(1, &ctx, 457, &full, LineChange::Insert),
            Err(TrellisError::CapacityExceeded { .. })
        ));
    }

    #[test]
    fn test_capacity_check_accounts_for_split() {
        // Halves of 455 full lines each encode, the unsplit leaf does not
        let ctx = sized_context(910, false, false, false);
        let mut leaf = Leaf::new(&ctx);
        let full = widest_set();
        for key in 0..910u64 {
            leaf.insert_in_place(&ctx, key as usize, KeyRef::Numeric(key), ValueRef::Coordinates(&full))
                .unwrap();
        }
        let lines = lines(&leaf);
        assert!(lines.check_capacity(1, &ctx, 0, &full, LineChange::InsertAndSplit).is_ok());
        assert!(lines.check_capacity(1, &ctx, 910, &full, LineChange::InsertAndSplit).is_ok());
        assert!(matches!(
            lines.check_capacity(1, &ctx, 910, &full, LineChange::Insert),
            Err(TrellisError::CapacityExceeded { .. })
        ));
    }

    #[test]
    fn test_coordinate_leaf_roundtrip_all_entries() {
        let ctx = context(false);
        let leaf = filled_leaf(&ctx, 8);
        let expected = entries(&leaf, &ctx);
        let payload = encode(&leaf, &ctx);

        let loaded = decode(&payload, 8, &ctx).unwrap();
        assert_eq!(entries(&loaded, &ctx), expected);
        assert_eq!(
            expected[3],
            (TermKey::Numeric(30), TermValue::Coordinates(set_for(3)))
        );
    }

    #[test]
    fn test_lazy_and_eager_decode_agree() {
        let writer = sized_context(64, false, false, false);
        let mut leaf = Leaf::new(&writer);
        for key in 0..48u64 {
            let set: CoordinateSet = Permutation::ALL
                .iter()
                .filter(|p| (key >> p.index()) & 1 == 1)
                .map(|p| Coordinate::new(*p, key as u16, key << 20, key * 3 + 1, Strategy(p.index() as u8)))
                .collect();
            leaf.insert_in_place(&writer, key as usize, KeyRef::Numeric(key * key), ValueRef::Coordinates(&set))
                .unwrap();
        }
        let expected = entries(&leaf, &writer);
        let payload = encode(&leaf, &writer);

        let eager = decode(&payload, 48, &writer).unwrap();
        assert_eq!(entries(&eager, &writer), expected);

        // More lines than the lazy limit, so the reader switches to eager parsing midway
        let reader = sized_context(64, false, false, true);
        let lazy = decode(&payload, 48, &reader).unwrap();
        assert!(lines(&lazy).raw.is_some());
        assert_eq!(entries(&lazy, &reader), expected);
    }

    #[test]
    fn test_numeric_leaf_roundtrip_all_entries() {
        let ctx = sized_context(16, true, false, false);
        let mut leaf = Leaf::new(&ctx);
        let values = [0, 1, 127, 128, u32::MAX as u64, u64::MAX - 1, u64::MAX];
        for (p, value) in values.iter().enumerate() {
            let key = (p as u64) * 1_000_003;
            leaf.insert_in_place(&ctx, p, KeyRef::Numeric(key), ValueRef::Number(*value))
                .unwrap();
        }
        let expected = entries(&leaf, &ctx);
        let payload = encode(&leaf, &ctx);

        let loaded = decode(&payload, values.len(), &ctx).unwrap();
        assert_eq!(entries(&loaded, &ctx), expected);
        assert_eq!(expected[5], (TermKey::Numeric(5_000_015), TermValue::Number(u64::MAX - 1)));
    }

    #[test]
    fn test_text_leaf_roundtrip_all_entries() {
        let ctx = sized_context(16, false, true, false);
        let mut leaf = Leaf::new(&ctx);
        let keys: [&[u8]; 6] = [b"", b"http://a", b"http://a/b", b"http://ab", b"urn:x", b"\xff"];
        for (p, key) in keys.iter().enumerate() {
            leaf.insert_in_place(&ctx, p, KeyRef::Text(key), ValueRef::Number(p as u64 * 31))
                .unwrap();
        }
        let expected = entries(&leaf, &ctx);
        let payload = encode(&leaf, &ctx);

        let loaded = decode(&payload, keys.len(), &ctx).unwrap();
        assert_eq!(entries(&loaded, &ctx), expected);
        assert_eq!(
            expected[2],
            (TermKey::Text(b"http://a/b".to_vec().into_boxed_slice()), TermValue::Number(62))
        );
    }
}
