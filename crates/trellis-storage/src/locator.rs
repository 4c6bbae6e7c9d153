//! Sparse index locating the block of a table file that covers a key.
//!
//! Entries `(key, file, pos)` are appended in non-decreasing key order while
//! a table is written. A key whose block needs finer resolution can carry a
//! nested locator of its own.

use tracing::trace;
use trellis_common::encoding::{decode_varint, encode_varint, read_u16_le};
use trellis_common::{Result, TrellisError};

/// Smallest number of entries reserved when the arrays grow.
const MIN_GROWTH: usize = 128;

/// Deepest nesting accepted when decoding.
const MAX_NESTING: usize = 16;

/// Slots to reserve when full arrays of `len` entries grow. Capacity at
/// least doubles and never drops under `MIN_GROWTH`.
fn growth(len: usize) -> usize {
    (2 * (len + 1)).max(MIN_GROWTH) - len
}

/// Sorted `(key, file, pos)` entries plus optional nested locators.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockLocator {
    keys: Vec<u64>,
    files: Vec<u16>,
    positions: Vec<u64>,
    nested_keys: Vec<u64>,
    nested: Vec<BlockLocator>,
}

impl BlockLocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry. `key` must not be smaller than the last key added.
    pub fn add(&mut self, key: u64, file: u16, pos: u64) {
        let len = self.keys.len();
        if len == self.keys.capacity() {
            let additional = growth(len);
            self.keys.reserve_exact(additional);
            self.files.reserve_exact(additional);
            self.positions.reserve_exact(additional);
        }
        self.keys.push(key);
        self.files.push(file);
        self.positions.push(pos);
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Entries the arrays can hold before growing again.
    pub fn capacity(&self) -> usize {
        self.keys.capacity()
    }

    pub fn key(&self, index: usize) -> Option<u64> {
        self.keys.get(index).copied()
    }

    pub fn file(&self, index: usize) -> Option<u16> {
        self.files.get(index).copied()
    }

    pub fn pos(&self, index: usize) -> Option<u64> {
        self.positions.get(index).copied()
    }

    /// Index of the entry whose block covers `key`: the first entry equal to
    /// `key`, else the last entry below it. Keys before the first entry map
    /// to 0, as does any key of an empty locator.
    pub fn lookup(&self, key: u64) -> usize {
        self.lookup_from(0, key)
    }

    /// Like [`BlockLocator::lookup`], with `start` a known lower bound for
    /// the answer.
    pub fn lookup_from(&self, start: usize, key: u64) -> usize {
        let len = self.keys.len();
        if len == 0 {
            return 0;
        }
        let start = start.min(len - 1);
        if key <= self.keys[start] {
            return start;
        }
        if start + 1 < len && key < self.keys[start + 1] {
            return start;
        }

        let i = start + self.keys[start..].partition_point(|k| *k < key);
        if i < len && self.keys[i] == key {
            i
        } else {
            i - 1
        }
    }

    /// Attaches a finer locator to `key`. Keys must be added in
    /// non-decreasing order.
    pub fn add_nested_index(&mut self, key: u64, locator: BlockLocator) {
        let len = self.nested_keys.len();
        if len == self.nested_keys.capacity() {
            let additional = growth(len);
            self.nested_keys.reserve_exact(additional);
            self.nested.reserve_exact(additional);
        }
        self.nested_keys.push(key);
        self.nested.push(locator);
    }

    /// Nested locator attached to exactly `key`.
    pub fn nested_lookup(&self, key: u64) -> Option<&BlockLocator> {
        let i = self.nested_keys.binary_search(&key).ok()?;
        self.nested.get(i)
    }

    pub fn nested_len(&self) -> usize {
        self.nested.len()
    }

    /// Appends the encoded locator to `buf`.
    ///
    /// Layout: varint entry count; per entry a varint key delta, a varint
    /// position delta and the file as u16 LE, deltas restarting from zero
    /// whenever the file changes; a flag byte for nested locators, then the
    /// nested count and per nested locator a varint key delta followed by
    /// the locator itself.
    pub fn serialize(&self, buf: &mut Vec<u8>) {
        encode_varint(self.keys.len() as u64, buf);
        let mut prev: Option<(u16, u64, u64)> = None;
        for i in 0..self.keys.len() {
            let (file, key, pos) = (self.files[i], self.keys[i], self.positions[i]);
            let (base_key, base_pos) = match prev {
                Some((prev_file, prev_key, prev_pos)) if prev_file == file => (prev_key, prev_pos),
                _ => (0, 0),
            };
            encode_varint(key.wrapping_sub(base_key), buf);
            encode_varint(pos.wrapping_sub(base_pos), buf);
            buf.extend_from_slice(&file.to_le_bytes());
            prev = Some((file, key, pos));
        }

        if self.nested.is_empty() {
            buf.push(0);
            return;
        }
        buf.push(1);
        encode_varint(self.nested.len() as u64, buf);
        let mut prev_key = 0u64;
        for (key, locator) in self.nested_keys.iter().zip(&self.nested) {
            encode_varint(key.wrapping_sub(prev_key), buf);
            locator.serialize(buf);
            prev_key = *key;
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + self.keys.len() * 6);
        self.serialize(&mut buf);
        buf
    }

    /// Decodes a locator that occupies all of `buf`.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let (locator, used) = Self::deserialize(buf)?;
        if used != buf.len() {
            return Err(TrellisError::LocatorCorrupted(format!(
                "{} trailing bytes",
                buf.len() - used
            )));
        }
        Ok(locator)
    }

    /// Decodes a locator from the start of `buf`. Returns it with the
    /// number of bytes read.
    pub fn deserialize(buf: &[u8]) -> Result<(Self, usize)> {
        let mut pos = 0;
        let locator = Self::decode_at(buf, &mut pos, 0)?;
        trace!(
            entries = locator.len(),
            nested = locator.nested_len(),
            bytes = pos,
            "block locator decoded"
        );
        Ok((locator, pos))
    }

    fn decode_at(buf: &[u8], pos: &mut usize, depth: usize) -> Result<Self> {
        if depth > MAX_NESTING {
            return Err(TrellisError::LocatorCorrupted(format!(
                "nesting deeper than {MAX_NESTING}"
            )));
        }
        let truncated = || TrellisError::LocatorCorrupted(format!("truncated at byte {}", buf.len()));

        let count = decode_varint(buf, pos).ok_or_else(truncated)? as usize;
        // Every entry takes at least four bytes
        if count > buf.len().saturating_sub(*pos) / 4 {
            return Err(TrellisError::LocatorCorrupted(format!(
                "{count} entries cannot fit in {} bytes",
                buf.len() - *pos
            )));
        }

        let mut locator = BlockLocator {
            keys: Vec::with_capacity(count),
            files: Vec::with_capacity(count),
            positions: Vec::with_capacity(count),
            ..Self::default()
        };
        let mut prev: Option<(u16, u64, u64)> = None;
        for _ in 0..count {
            let key_delta = decode_varint(buf, pos).ok_or_else(truncated)?;
            let pos_delta = decode_varint(buf, pos).ok_or_else(truncated)?;
            let file = read_u16_le(buf, *pos).ok_or_else(truncated)?;
            *pos += 2;

            let (key, offset) = match prev {
                Some((prev_file, prev_key, prev_pos)) if prev_file == file => {
                    (prev_key.wrapping_add(key_delta), prev_pos.wrapping_add(pos_delta))
                }
                _ => (key_delta, pos_delta),
            };
            locator.keys.push(key);
            locator.files.push(file);
            locator.positions.push(offset);
            prev = Some((file, key, offset));
        }

        let flag = *buf.get(*pos).ok_or_else(truncated)?;
        *pos += 1;
        match flag {
            0 => {}
            1 => {
                let nested = decode_varint(buf, pos).ok_or_else(truncated)? as usize;
                if nested > buf.len().saturating_sub(*pos) / 2 {
                    return Err(TrellisError::LocatorCorrupted(format!(
                        "{nested} nested locators cannot fit in {} bytes",
                        buf.len() - *pos
                    )));
                }
                locator.nested_keys.reserve_exact(nested);
                locator.nested.reserve_exact(nested);
                let mut key = 0u64;
                for _ in 0..nested {
                    key = key.wrapping_add(decode_varint(buf, pos).ok_or_else(truncated)?);
                    let child = Self::decode_at(buf, pos, depth + 1)?;
                    locator.nested_keys.push(key);
                    locator.nested.push(child);
                }
            }
            other => {
                return Err(TrellisError::LocatorCorrupted(format!(
                    "invalid nested flag {other}"
                )))
            }
        }
        Ok(locator)
    }
}
