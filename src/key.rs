//! Internal key format and ordering.
//!
//! Every key stored by the engine is an internal key: the user key followed
//! by an 8-byte trailer packing a 56-bit sequence number and a one-byte
//! value type. Entries order by `(user_key ASC, sequence DESC, type DESC)`,
//! so a seek lands on the newest entry visible at a snapshot.

use std::cmp::Ordering;

use bytes::Bytes;

use crate::coding::{decode_fixed64, put_fixed64};
use crate::error::{Error, Result};

/// Sequence numbers use 56 bits; the low byte of the trailer is the type.
pub const MAX_SEQUENCE: u64 = (1 << 56) - 1;

pub(crate) const TRAILER_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValueType {
    /// A tombstone for a user key.
    Deletion = 0,
    /// A stored value.
    Value = 1,
}

/// The highest type tag, so a lookup key sorts before every entry of the
/// same user key and sequence.
pub(crate) const VALUE_TYPE_FOR_SEEK: ValueType = ValueType::Value;

impl ValueType {
    pub(crate) fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ValueType::Deletion),
            1 => Ok(ValueType::Value),
            other => Err(Error::corruption(format!("unknown value type: {other}"))),
        }
    }
}

/// Internal key `(user_key, sequence, type)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InternalKey {
    user_key: Bytes,
    sequence: u64,
    kind: ValueType,
}

impl InternalKey {
    pub fn new(user_key: impl Into<Bytes>, sequence: u64, kind: ValueType) -> Self {
        Self {
            user_key: user_key.into(),
            sequence,
            kind,
        }
    }

    /// Key used to position a read at `user_key` as of `sequence`.
    pub(crate) fn for_lookup(user_key: impl Into<Bytes>, sequence: u64) -> Self {
        Self::new(user_key, sequence, VALUE_TYPE_FOR_SEEK)
    }

    pub fn user_key(&self) -> &Bytes {
        &self.user_key
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn value_type(&self) -> ValueType {
        self.kind
    }

    fn trailer(&self) -> u64 {
        (self.sequence << 8) | self.kind as u64
    }

    pub fn encoded_len(&self) -> usize {
        self.user_key.len() + TRAILER_SIZE
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.user_key.as_ref());
        put_fixed64(buf, self.trailer());
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf
    }

    pub fn decode(input: &[u8]) -> Result<Self> {
        if input.len() < TRAILER_SIZE {
            return Err(Error::corruption("internal key too short"));
        }
        let split = input.len() - TRAILER_SIZE;
        let trailer = decode_fixed64(&input[split..]);
        let kind = ValueType::from_u8((trailer & 0xff) as u8)?;
        Ok(Self {
            user_key: Bytes::copy_from_slice(&input[..split]),
            sequence: trailer >> 8,
            kind,
        })
    }
}

impl PartialOrd for InternalKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for InternalKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.user_key.cmp(&other.user_key) {
            // Larger trailer (newer sequence) sorts first.
            Ordering::Equal => other.trailer().cmp(&self.trailer()),
            ordering => ordering,
        }
    }
}

/// User-key ordering seam.
///
/// The engine is wired to [`BytewiseComparator`]; the manifest records the
/// comparator name and open fails on a mismatch.
pub trait Comparator: Send + Sync {
    fn name(&self) -> &'static str;

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;

    /// Returns a key `k` with `start <= k < limit` that may be shorter than
    /// `start`. Used to shrink index-block separators.
    fn find_shortest_separator(&self, start: &[u8], limit: &[u8]) -> Vec<u8>;

    /// Returns a key `k >= key` that may be shorter than `key`.
    fn find_short_successor(&self, key: &[u8]) -> Vec<u8>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BytewiseComparator;

impl Comparator for BytewiseComparator {
    fn name(&self) -> &'static str {
        "stratadb.BytewiseComparator"
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn find_shortest_separator(&self, start: &[u8], limit: &[u8]) -> Vec<u8> {
        let shared = start
            .iter()
            .zip(limit.iter())
            .take_while(|(a, b)| a == b)
            .count();
        if shared < start.len() && shared < limit.len() {
            let byte = start[shared];
            if byte < 0xff && byte + 1 < limit[shared] {
                let mut out = start[..=shared].to_vec();
                out[shared] += 1;
                return out;
            }
        }
        start.to_vec()
    }

    fn find_short_successor(&self, key: &[u8]) -> Vec<u8> {
        for (idx, &byte) in key.iter().enumerate() {
            if byte != 0xff {
                let mut out = key[..=idx].to_vec();
                out[idx] += 1;
                return out;
            }
        }
        // Run of 0xff bytes; leave unchanged.
        key.to_vec()
    }
}

/// Shortest internal key `k` with `a <= k < b` under internal ordering.
pub(crate) fn internal_separator(
    cmp: &dyn Comparator,
    a: &InternalKey,
    b: &InternalKey,
) -> InternalKey {
    let short = cmp.find_shortest_separator(a.user_key(), b.user_key());
    if short.len() < a.user_key().len() && cmp.compare(a.user_key(), &short) == Ordering::Less {
        // A shorter user key with the maximal trailer still sorts after
        // every entry of `a`'s user key and before `b`.
        InternalKey::new(short, MAX_SEQUENCE, VALUE_TYPE_FOR_SEEK)
    } else {
        a.clone()
    }
}

/// Short internal key `k >= a` under internal ordering.
pub(crate) fn internal_successor(cmp: &dyn Comparator, a: &InternalKey) -> InternalKey {
    let short = cmp.find_short_successor(a.user_key());
    if short.len() < a.user_key().len() && cmp.compare(a.user_key(), &short) == Ordering::Less {
        InternalKey::new(short, MAX_SEQUENCE, VALUE_TYPE_FOR_SEEK)
    } else {
        a.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(user: &'static [u8], seq: u64, kind: ValueType) -> InternalKey {
        InternalKey::new(Bytes::from_static(user), seq, kind)
    }

    #[test]
    fn orders_by_user_key_then_sequence_descending() {
        let a10 = key(b"a", 10, ValueType::Value);
        let a9 = key(b"a", 9, ValueType::Value);
        let b1 = key(b"b", 1, ValueType::Value);

        assert!(a10 < a9);
        assert!(a9 < b1);
    }

    #[test]
    fn deletion_sorts_after_value_at_same_sequence() {
        let put = key(b"a", 7, ValueType::Value);
        let del = key(b"a", 7, ValueType::Deletion);
        assert!(put < del);
    }

    #[test]
    fn encode_roundtrip() {
        let k = key(b"hello", 42, ValueType::Deletion);
        let enc = k.encode();
        assert_eq!(enc.len(), k.encoded_len());
        assert_eq!(InternalKey::decode(&enc).unwrap(), k);
    }

    #[test]
    fn decode_rejects_bad_tag() {
        let mut enc = key(b"x", 1, ValueType::Value).encode();
        let last = enc.len() - TRAILER_SIZE;
        enc[last] = 0x7e;
        assert!(InternalKey::decode(&enc).is_err());
    }

    #[test]
    fn separator_shortens_between_distant_keys() {
        let cmp = BytewiseComparator;
        let a = key(b"abcdefghij", 5, ValueType::Value);
        let b = key(b"abzzz", 5, ValueType::Value);
        let sep = internal_separator(&cmp, &a, &b);
        assert!(sep >= a || sep.user_key() == a.user_key());
        assert!(sep.user_key().as_ref() < b.user_key().as_ref());
        assert!(sep.user_key().len() <= a.user_key().len());
        assert_eq!(sep.user_key().as_ref(), b"abd");
    }

    #[test]
    fn separator_keeps_key_when_prefixed() {
        let cmp = BytewiseComparator;
        let a = key(b"abc", 5, ValueType::Value);
        let b = key(b"abcd", 5, ValueType::Value);
        assert_eq!(internal_separator(&cmp, &a, &b), a);
    }

    #[test]
    fn successor_increments_first_non_ff() {
        let cmp = BytewiseComparator;
        let a = key(b"\xff\xff7abc", 5, ValueType::Value);
        let succ = internal_successor(&cmp, &a);
        assert_eq!(succ.user_key().as_ref(), b"\xff\xff8");
    }
}
