//! Sorted key arrays of tree nodes.

use super::context::TreeContext;
use std::cmp::Ordering;
use trellis_common::encoding::{decode_varint, encode_varint};
use trellis_common::{Result, TermKey, TrellisError};

/// Borrowed form of a key, used for lookups and inserts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeyRef<'a> {
    Numeric(u64),
    Text(&'a [u8]),
}

impl KeyRef<'_> {
    pub(crate) fn to_owned_key(self) -> TermKey {
        match self {
            KeyRef::Numeric(key) => TermKey::Numeric(key),
            KeyRef::Text(key) => TermKey::Text(key.into()),
        }
    }
}

impl<'a> From<&'a TermKey> for KeyRef<'a> {
    fn from(key: &'a TermKey) -> Self {
        match key {
            TermKey::Numeric(key) => KeyRef::Numeric(*key),
            TermKey::Text(key) => KeyRef::Text(key),
        }
    }
}

/// Keys of one node in ascending order.
///
/// Numeric arrays come from the tree's array pool and go back to it when the
/// node is released.
#[derive(Debug)]
pub(crate) enum Keys {
    Numeric(Vec<u64>),
    Text(Vec<Box<[u8]>>),
}

impl Keys {
    pub(crate) fn new(ctx: &TreeContext) -> Self {
        if ctx.text_keys() {
            Keys::Text(Vec::with_capacity(ctx.max_elements() + 1))
        } else {
            Keys::Numeric(ctx.words().get())
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        match self {
            Keys::Numeric(keys) => keys.len(),
            Keys::Text(keys) => keys.len(),
        }
    }

    pub(crate) fn key_at(&self, index: usize) -> Option<KeyRef<'_>> {
        match self {
            Keys::Numeric(keys) => keys.get(index).map(|k| KeyRef::Numeric(*k)),
            Keys::Text(keys) => keys.get(index).map(|k| KeyRef::Text(k)),
        }
    }

    pub(crate) fn first(&self) -> Option<TermKey> {
        self.key_at(0).map(KeyRef::to_owned_key)
    }

    pub(crate) fn last(&self) -> Option<TermKey> {
        self.len()
            .checked_sub(1)
            .and_then(|i| self.key_at(i))
            .map(KeyRef::to_owned_key)
    }

    /// Binary search for `key`: `Ok(p)` on an exact match, `Err(p)` with the
    /// insertion point otherwise. Numeric keys order before text keys.
    pub(crate) fn position_of(&self, key: KeyRef<'_>) -> std::result::Result<usize, usize> {
        match (self, key) {
            (Keys::Numeric(keys), KeyRef::Numeric(key)) => keys.binary_search(&key),
            (Keys::Text(keys), KeyRef::Text(key)) => {
                keys.binary_search_by(|probe| probe[..].cmp(key))
            }
            (Keys::Numeric(keys), KeyRef::Text(_)) => Err(keys.len()),
            (Keys::Text(_), KeyRef::Numeric(_)) => Err(0),
        }
    }

    /// Compares the key at `index` with `key`.
    pub(crate) fn compare_at(&self, index: usize, key: KeyRef<'_>) -> Option<Ordering> {
        let probe = self.key_at(index)?;
        Some(match (probe, key) {
            (KeyRef::Numeric(a), KeyRef::Numeric(b)) => a.cmp(&b),
            (KeyRef::Text(a), KeyRef::Text(b)) => a.cmp(b),
            (KeyRef::Numeric(_), KeyRef::Text(_)) => Ordering::Less,
            (KeyRef::Text(_), KeyRef::Numeric(_)) => Ordering::Greater,
        })
    }

    pub(crate) fn accepts(&self, key: KeyRef<'_>) -> bool {
        matches!(
            (self, key),
            (Keys::Numeric(_), KeyRef::Numeric(_)) | (Keys::Text(_), KeyRef::Text(_))
        )
    }

    pub(crate) fn insert(&mut self, index: usize, key: KeyRef<'_>) -> Result<()> {
        match (self, key) {
            (Keys::Numeric(keys), KeyRef::Numeric(key)) => keys.insert(index, key),
            (Keys::Text(keys), KeyRef::Text(key)) => keys.insert(index, key.into()),
            _ => {
                return Err(TrellisError::Unsupported(
                    "key kind does not match the tree mode".to_string(),
                ))
            }
        }
        Ok(())
    }

    /// Moves keys `at..` into a new array.
    pub(crate) fn split_off(&mut self, at: usize, ctx: &TreeContext) -> Keys {
        match self {
            Keys::Numeric(keys) => {
                let mut tail = ctx.words().get();
                tail.extend(keys.drain(at..));
                Keys::Numeric(tail)
            }
            Keys::Text(keys) => {
                let mut tail = Vec::with_capacity(ctx.max_elements() + 1);
                tail.extend(keys.drain(at..));
                Keys::Text(tail)
            }
        }
    }

    pub(crate) fn remove_first(&mut self) {
        match self {
            Keys::Numeric(keys) if !keys.is_empty() => {
                keys.remove(0);
            }
            Keys::Text(keys) if !keys.is_empty() => {
                keys.remove(0);
            }
            _ => {}
        }
    }

    pub(crate) fn remove_last(&mut self) {
        match self {
            Keys::Numeric(keys) => {
                keys.pop();
            }
            Keys::Text(keys) => {
                keys.pop();
            }
        }
    }

    /// Appends the encoded keys to `buf`.
    ///
    /// Numeric keys are stored as the first key followed by deltas, text keys
    /// as the length of the prefix shared with the previous key plus the
    /// remaining suffix.
    pub(crate) fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Keys::Numeric(keys) => {
                let mut prev = 0u64;
                for key in keys {
                    encode_varint(key.wrapping_sub(prev), buf);
                    prev = *key;
                }
            }
            Keys::Text(keys) => {
                let mut prev: &[u8] = &[];
                for key in keys {
                    let shared = prev
                        .iter()
                        .zip(key.iter())
                        .take_while(|(a, b)| a == b)
                        .count();
                    encode_varint(shared as u64, buf);
                    encode_varint((key.len() - shared) as u64, buf);
                    buf.extend_from_slice(&key[shared..]);
                    prev = &key[..];
                }
            }
        }
    }

    /// Decodes `count` keys starting at `*pos`.
    pub(crate) fn decode(
        buf: &[u8],
        pos: &mut usize,
        count: usize,
        ctx: &TreeContext,
    ) -> Option<Keys> {
        if ctx.text_keys() {
            let mut keys: Vec<Box<[u8]>> = Vec::with_capacity(count.max(ctx.max_elements() + 1));
            for _ in 0..count {
                let shared = decode_varint(buf, pos)? as usize;
                let suffix_len = decode_varint(buf, pos)? as usize;
                let suffix = buf.get(*pos..pos.checked_add(suffix_len)?)?;
                *pos += suffix_len;

                let prefix = match keys.last() {
                    Some(prev) => prev.get(..shared)?,
                    None if shared == 0 => &[],
                    None => return None,
                };
                let mut key = Vec::with_capacity(shared + suffix_len);
                key.extend_from_slice(prefix);
                key.extend_from_slice(suffix);
                keys.push(key.into_boxed_slice());
            }
            Some(Keys::Text(keys))
        } else {
            let mut keys = ctx.words().get();
            let mut prev = 0u64;
            for _ in 0..count {
                let Some(delta) = decode_varint(buf, pos) else {
                    ctx.words().release(keys);
                    return None;
                };
                prev = prev.wrapping_add(delta);
                keys.push(prev);
            }
            Some(Keys::Numeric(keys))
        }
    }

    pub(crate) fn release(self, ctx: &TreeContext) {
        if let Keys::Numeric(keys) = self {
            ctx.words().release(keys);
        }
    }
}
