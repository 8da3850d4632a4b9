//! Internal key encoding.
//!
//! Every mutation is keyed on disk and in the memtable by an *internal
//! key*: the user key bytes followed by an 8-byte little-endian tag
//! packing a 56-bit sequence number and a one-byte value type:
//!
//! ```text
//! | user_key bytes ... | (sequence << 8 | value_type) as u64 le |
//! ```
//!
//! Ordering: user keys ascending, and for equal user keys the *larger*
//! tag first. Sequence numbers occupy the high bits of the tag, so newer
//! mutations of a key sort before older ones.

use std::cmp::Ordering;

use thiserror::Error;

use crate::codec;

/// Monotonic per-shard mutation counter.
pub type SequenceNumber = u64;

/// Largest representable sequence number (56 bits).
pub const MAX_SEQUENCE: SequenceNumber = (1 << 56) - 1;

/// Width of the trailing tag.
pub const TAG_LEN: usize = 8;

/// The kind of mutation an internal key carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ValueType {
    /// Tombstone: the key is deleted as of this sequence.
    Deletion = 0,
    /// Ordinary value.
    Value = 1,
}

impl TryFrom<u8> for ValueType {
    type Error = KeyError;

    fn try_from(byte: u8) -> Result<Self, KeyError> {
        match byte {
            0 => Ok(ValueType::Deletion),
            1 => Ok(ValueType::Value),
            other => Err(KeyError::BadValueType(other)),
        }
    }
}

/// Errors produced while parsing internal keys.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    /// The encoded key is shorter than the 8-byte tag.
    #[error("internal key too short ({0} bytes)")]
    TooShort(usize),

    /// The tag's low byte is not a known value type.
    #[error("unknown value type byte 0x{0:02x}")]
    BadValueType(u8),
}

/// Pack a sequence number and value type into a tag.
pub fn pack_tag(sequence: SequenceNumber, value_type: ValueType) -> u64 {
    debug_assert!(sequence <= MAX_SEQUENCE);
    (sequence << 8) | value_type as u64
}

/// Split a tag back into `(sequence, value_type)`.
pub fn unpack_tag(tag: u64) -> Result<(SequenceNumber, ValueType), KeyError> {
    let value_type = ValueType::try_from(tag as u8)?;
    Ok((tag >> 8, value_type))
}

/// Append the encoded form of `(user_key, sequence, value_type)` to `buf`.
pub fn append_internal_key(
    buf: &mut Vec<u8>,
    user_key: &[u8],
    sequence: SequenceNumber,
    value_type: ValueType,
) {
    buf.extend_from_slice(user_key);
    codec::put_fixed64(buf, pack_tag(sequence, value_type));
}

/// The user-key portion of an encoded internal key.
///
/// Callers must have validated the key length; a short slice panics in
/// debug builds and yields an empty key otherwise.
pub fn extract_user_key(encoded: &[u8]) -> &[u8] {
    debug_assert!(encoded.len() >= TAG_LEN);
    &encoded[..encoded.len().saturating_sub(TAG_LEN)]
}

/// The raw tag of an encoded internal key.
pub fn extract_tag(encoded: &[u8]) -> Result<u64, KeyError> {
    if encoded.len() < TAG_LEN {
        return Err(KeyError::TooShort(encoded.len()));
    }
    let tag_bytes = &encoded[encoded.len() - TAG_LEN..];
    codec::decode_fixed64(tag_bytes).map_err(|_| KeyError::TooShort(encoded.len()))
}

/// A decoded view of an internal key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedInternalKey<'a> {
    /// Borrowed user-key bytes.
    pub user_key: &'a [u8],
    /// Sequence number assigned by the engine.
    pub sequence: SequenceNumber,
    /// Mutation kind.
    pub value_type: ValueType,
}

/// Parse an encoded internal key.
pub fn parse_internal_key(encoded: &[u8]) -> Result<ParsedInternalKey<'_>, KeyError> {
    let tag = extract_tag(encoded)?;
    let (sequence, value_type) = unpack_tag(tag)?;
    Ok(ParsedInternalKey {
        user_key: extract_user_key(encoded),
        sequence,
        value_type,
    })
}

/// Compare two encoded internal keys: user key ascending, tag descending.
///
/// Keys missing a full tag compare by raw bytes; they only arise from
/// corrupted input and the caller will reject them when parsing.
pub fn internal_key_cmp(a: &[u8], b: &[u8]) -> Ordering {
    if a.len() < TAG_LEN || b.len() < TAG_LEN {
        return a.cmp(b);
    }
    let user_cmp = extract_user_key(a).cmp(extract_user_key(b));
    if user_cmp != Ordering::Equal {
        return user_cmp;
    }
    let tag_a = extract_tag(a).unwrap_or(0);
    let tag_b = extract_tag(b).unwrap_or(0);
    // Larger tag (newer sequence) sorts first.
    tag_b.cmp(&tag_a)
}

/// An owned, encoded internal key ordered by [`internal_key_cmp`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalKey(Vec<u8>);

impl InternalKey {
    /// Build from parts.
    pub fn new(user_key: &[u8], sequence: SequenceNumber, value_type: ValueType) -> Self {
        let mut buf = Vec::with_capacity(user_key.len() + TAG_LEN);
        append_internal_key(&mut buf, user_key, sequence, value_type);
        InternalKey(buf)
    }

    /// Wrap already-encoded bytes.
    pub fn from_encoded(encoded: Vec<u8>) -> Self {
        InternalKey(encoded)
    }

    /// The encoded byte form.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The user-key portion.
    pub fn user_key(&self) -> &[u8] {
        extract_user_key(&self.0)
    }

    /// The sequence number, or 0 for a malformed key.
    pub fn sequence(&self) -> SequenceNumber {
        extract_tag(&self.0).map(|t| t >> 8).unwrap_or(0)
    }

    /// Consume into the encoded bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl Ord for InternalKey {
    fn cmp(&self, other: &Self) -> Ordering {
        internal_key_cmp(&self.0, &other.0)
    }
}

impl PartialOrd for InternalKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A key positioned *before* every real entry for `user_key` at or below
/// `sequence`, used to seek point lookups.
///
/// The tag uses [`ValueType::Value`] (the larger type byte) so that at the
/// same sequence the lookup key still sorts first.
pub fn lookup_key(user_key: &[u8], sequence: SequenceNumber) -> InternalKey {
    InternalKey::new(user_key, sequence, ValueType::Value)
}

// ------------------------------------------------------------------------------------------------
// Index-key shortening
// ------------------------------------------------------------------------------------------------

/// Shortest internal key `k` with `start ≤ k < limit` (by user key).
///
/// Used for index-block separators: a shorter separator keeps the index
/// small while still sitting between two adjacent data blocks. Falls back
/// to `start` when no shortening is possible.
pub fn shortest_separator(start: &[u8], limit: &[u8]) -> Vec<u8> {
    let user_start = extract_user_key(start);
    let user_limit = extract_user_key(limit);
    let common = user_start
        .iter()
        .zip(user_limit)
        .take_while(|(a, b)| a == b)
        .count();

    if common < user_start.len() && common < user_limit.len() {
        let byte = user_start[common];
        if byte < 0xff && byte + 1 < user_limit[common] {
            let mut short = user_start[..=common].to_vec();
            *short.last_mut().expect("non-empty by construction") = byte + 1;
            let mut out = short;
            codec::put_fixed64(&mut out, pack_tag(MAX_SEQUENCE, ValueType::Value));
            debug_assert!(internal_key_cmp(start, &out) == Ordering::Less);
            return out;
        }
    }
    start.to_vec()
}

/// Shortest internal key ≥ every key with user key `key`'s prefix.
///
/// Used for the final index entry of a table.
pub fn shortest_successor(key: &[u8]) -> Vec<u8> {
    let user = extract_user_key(key);
    for (i, &byte) in user.iter().enumerate() {
        if byte != 0xff {
            let mut out = user[..=i].to_vec();
            *out.last_mut().expect("non-empty by construction") = byte + 1;
            codec::put_fixed64(&mut out, pack_tag(MAX_SEQUENCE, ValueType::Value));
            return out;
        }
    }
    // All 0xff: leave the key as-is.
    key.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_round_trip() {
        for (seq, ty) in [
            (0, ValueType::Deletion),
            (1, ValueType::Value),
            (MAX_SEQUENCE, ValueType::Value),
        ] {
            let (s, t) = unpack_tag(pack_tag(seq, ty)).unwrap();
            assert_eq!((s, t), (seq, ty));
        }
    }

    #[test]
    fn parse_round_trip() {
        let key = InternalKey::new(b"user-key", 42, ValueType::Value);
        let parsed = parse_internal_key(key.as_bytes()).unwrap();
        assert_eq!(parsed.user_key, b"user-key");
        assert_eq!(parsed.sequence, 42);
        assert_eq!(parsed.value_type, ValueType::Value);
    }

    #[test]
    fn empty_user_key_is_legal() {
        let key = InternalKey::new(b"", 7, ValueType::Deletion);
        let parsed = parse_internal_key(key.as_bytes()).unwrap();
        assert_eq!(parsed.user_key, b"");
        assert_eq!(parsed.sequence, 7);
    }

    #[test]
    fn bad_type_byte_rejected() {
        let mut encoded = b"k".to_vec();
        codec::put_fixed64(&mut encoded, (5 << 8) | 0x7f);
        assert!(matches!(
            parse_internal_key(&encoded),
            Err(KeyError::BadValueType(0x7f))
        ));
    }

    #[test]
    fn ordering_user_key_ascending() {
        let a = InternalKey::new(b"aaa", 100, ValueType::Value);
        let b = InternalKey::new(b"bbb", 1, ValueType::Value);
        assert!(a < b);
    }

    #[test]
    fn ordering_newer_sequence_first() {
        let newer = InternalKey::new(b"same", 9, ValueType::Value);
        let older = InternalKey::new(b"same", 3, ValueType::Value);
        assert!(newer < older);
    }

    #[test]
    fn lookup_key_sorts_before_equal_sequence_entries() {
        let probe = lookup_key(b"k", 5);
        let deletion_at_5 = InternalKey::new(b"k", 5, ValueType::Deletion);
        assert!(probe < deletion_at_5);
    }

    #[test]
    fn separator_shortens_between_distant_keys() {
        let start = InternalKey::new(b"banana", 10, ValueType::Value);
        let limit = InternalKey::new(b"orange", 10, ValueType::Value);
        let sep = shortest_separator(start.as_bytes(), limit.as_bytes());
        assert!(internal_key_cmp(start.as_bytes(), &sep) == Ordering::Less);
        assert!(internal_key_cmp(&sep, limit.as_bytes()) == Ordering::Less);
        assert!(sep.len() < start.as_bytes().len());
        assert_eq!(extract_user_key(&sep), b"c");
    }

    #[test]
    fn separator_degrades_to_start_for_adjacent_keys() {
        let start = InternalKey::new(b"abc1", 10, ValueType::Value);
        let limit = InternalKey::new(b"abc2", 10, ValueType::Value);
        let sep = shortest_separator(start.as_bytes(), limit.as_bytes());
        assert_eq!(sep, start.as_bytes());
    }

    #[test]
    fn successor_increments_first_possible_byte() {
        let key = InternalKey::new(b"abc", 10, ValueType::Value);
        let succ = shortest_successor(key.as_bytes());
        assert_eq!(extract_user_key(&succ), b"b");
        assert!(internal_key_cmp(key.as_bytes(), &succ) == Ordering::Less);
    }
}
