//! Deterministic integer framing shared by every on-disk structure.
//!
//! Two encodings are provided:
//!
//! - **Varint** — unsigned LEB128 for 32/64-bit integers. Seven data bits
//!   per byte, most-significant bit set while more bytes follow. Used
//!   wherever lengths and offsets are usually small (block entries, block
//!   handles, version edits).
//! - **Fixed** — little-endian 32/64-bit integers. Used where the reader
//!   must know the width up front (restart arrays, record headers, the
//!   sstable footer magic).
//!
//! The crate owns this format outright: the on-disk representation never
//! changes because of a dependency upgrade.
//!
//! # Wire format
//!
//! | Helper                        | Encoding                          |
//! |-------------------------------|-----------------------------------|
//! | `put_varint32` / `put_varint64` | LEB128, 1–5 / 1–10 bytes        |
//! | `put_fixed32` / `put_fixed64`   | little-endian, 4 / 8 bytes      |
//! | `put_length_prefixed_slice`     | `varint32 len` then raw bytes   |
//!
//! Decoders take a slice and return `(value, bytes_consumed)` so callers
//! can walk a buffer cursor-style. Reaching the end of the slice mid-value
//! yields [`CodecError::Truncated`].


use thiserror::Error;

/// Maximum encoded size of a 32-bit varint.
pub const MAX_VARINT32_LEN: usize = 5;

/// Maximum encoded size of a 64-bit varint.
pub const MAX_VARINT64_LEN: usize = 10;

/// Errors produced while decoding framed integers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// The input ended before the value was complete.
    #[error("truncated input (need {needed} more bytes)")]
    Truncated {
        /// Lower bound on the bytes still required.
        needed: usize,
    },

    /// A varint ran past the maximum width for its type.
    #[error("varint overflows {type_name}")]
    Overflow {
        /// The integer type being decoded.
        type_name: &'static str,
    },
}

// ------------------------------------------------------------------------------------------------
// Varint encoding
// ------------------------------------------------------------------------------------------------

/// Append `v` to `buf` as an unsigned LEB128 varint.
pub fn put_varint32(buf: &mut Vec<u8>, v: u32) {
    put_varint64(buf, u64::from(v));
}

/// Append `v` to `buf` as an unsigned LEB128 varint.
pub fn put_varint64(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push((v as u8) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

/// Number of bytes [`put_varint64`] would emit for `v`.
pub fn varint_length(mut v: u64) -> usize {
    let mut len = 1;
    while v >= 0x80 {
        v >>= 7;
        len += 1;
    }
    len
}

/// Decode a 32-bit varint from the front of `buf`.
///
/// Returns `(value, bytes_consumed)`.
pub fn decode_varint32(buf: &[u8]) -> Result<(u32, usize), CodecError> {
    let (v, n) = decode_varint_raw(buf, MAX_VARINT32_LEN, "u32")?;
    if v > u64::from(u32::MAX) {
        return Err(CodecError::Overflow { type_name: "u32" });
    }
    Ok((v as u32, n))
}

/// Decode a 64-bit varint from the front of `buf`.
///
/// Returns `(value, bytes_consumed)`.
pub fn decode_varint64(buf: &[u8]) -> Result<(u64, usize), CodecError> {
    decode_varint_raw(buf, MAX_VARINT64_LEN, "u64")
}

fn decode_varint_raw(
    buf: &[u8],
    max_len: usize,
    type_name: &'static str,
) -> Result<(u64, usize), CodecError> {
    let mut result: u64 = 0;
    let mut shift = 0u32;
    for (i, &byte) in buf.iter().enumerate() {
        if i >= max_len {
            return Err(CodecError::Overflow { type_name });
        }
        if byte < 0x80 {
            // Final byte; reject bits that fall outside the target width.
            if shift >= 63 && byte > 1 {
                return Err(CodecError::Overflow { type_name });
            }
            result |= u64::from(byte) << shift;
            return Ok((result, i + 1));
        }
        result |= u64::from(byte & 0x7f) << shift;
        shift += 7;
    }
    Err(CodecError::Truncated { needed: 1 })
}

// ------------------------------------------------------------------------------------------------
// Fixed-width encoding
// ------------------------------------------------------------------------------------------------

/// Append `v` little-endian.
pub fn put_fixed32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

/// Append `v` little-endian.
pub fn put_fixed64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

/// Decode a little-endian `u32` from the front of `buf`.
pub fn decode_fixed32(buf: &[u8]) -> Result<u32, CodecError> {
    let bytes: [u8; 4] = buf
        .get(..4)
        .and_then(|s| s.try_into().ok())
        .ok_or(CodecError::Truncated {
            needed: 4usize.saturating_sub(buf.len()),
        })?;
    Ok(u32::from_le_bytes(bytes))
}

/// Decode a little-endian `u64` from the front of `buf`.
pub fn decode_fixed64(buf: &[u8]) -> Result<u64, CodecError> {
    let bytes: [u8; 8] = buf
        .get(..8)
        .and_then(|s| s.try_into().ok())
        .ok_or(CodecError::Truncated {
            needed: 8usize.saturating_sub(buf.len()),
        })?;
    Ok(u64::from_le_bytes(bytes))
}

// ------------------------------------------------------------------------------------------------
// Length-prefixed slices
// ------------------------------------------------------------------------------------------------

/// Append `data` as `varint32 len` followed by the raw bytes.
pub fn put_length_prefixed_slice(buf: &mut Vec<u8>, data: &[u8]) {
    put_varint32(buf, data.len() as u32);
    buf.extend_from_slice(data);
}

/// Decode a length-prefixed slice from the front of `buf`.
///
/// Returns `(slice, bytes_consumed)` borrowing from `buf`.
pub fn get_length_prefixed_slice(buf: &[u8]) -> Result<(&[u8], usize), CodecError> {
    let (len, n) = decode_varint32(buf)?;
    let len = len as usize;
    let end = n + len;
    if buf.len() < end {
        return Err(CodecError::Truncated {
            needed: end - buf.len(),
        });
    }
    Ok((&buf[n..end], end))
}
