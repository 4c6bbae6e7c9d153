//! Variable-length and fixed-width integer encoding for on-disk formats.
//!
//! Variable-length integers are LEB128: seven payload bits per byte, high
//! bit set on every byte but the last. Fixed-width integers are little-endian.
//! Decoders return `None` on truncated or overlong input so callers can map
//! the failure to their own corruption error.

/// Appends `value` to `buf` as LEB128.
#[inline]
pub fn encode_varint(mut value: u64, buf: &mut Vec<u8>) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Decodes a LEB128 value from `buf` at `*pos`, advancing `*pos` past it.
#[inline]
pub fn decode_varint(buf: &[u8], pos: &mut usize) -> Option<u64> {
    let mut result: u64 = 0;
    let mut shift: u32 = 0;
    loop {
        let byte = *buf.get(*pos)?;
        *pos += 1;

        let payload = (byte & 0x7F) as u64;
        // The tenth byte may only carry the top bit and must end the value
        if shift == 63 && (payload > 1 || byte & 0x80 != 0) {
            return None;
        }
        result |= payload << shift;
        if byte & 0x80 == 0 {
            return Some(result);
        }
        shift += 7;
    }
}

/// Number of bytes `encode_varint` emits for `value`.
#[inline]
pub fn varint_len(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.max(1).div_ceil(7)
}

/// Reads a little-endian u16 at `pos`.
#[inline]
pub fn read_u16_le(buf: &[u8], pos: usize) -> Option<u16> {
    let bytes = buf.get(pos..pos.checked_add(2)?)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

/// Reads a little-endian u32 at `pos`.
#[inline]
pub fn read_u32_le(buf: &[u8], pos: usize) -> Option<u32> {
    let bytes = buf.get(pos..pos.checked_add(4)?)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Reads a little-endian u64 at `pos`.
#[inline]
pub fn read_u64_le(buf: &[u8], pos: usize) -> Option<u64> {
    let bytes = buf.get(pos..pos.checked_add(8)?)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    Some(u64::from_le_bytes(raw))
}
