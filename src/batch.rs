//! Atomic batches of write operations.
//!
//! A batch owns its wire representation directly:
//!
//! ```text
//! sequence: u64 LE | count: u32 LE | record*
//! record   := tag:u8 (1=value, 0=deletion) | varstring key [| varstring value]
//! varstring:= varint32 len | len bytes
//! ```
//!
//! The header sequence is the sequence of the first record; record `i` takes
//! `sequence + i`. The same bytes are appended verbatim to the WAL, so
//! encode/decode round-trips are exercised on every write and every replay.

use crate::coding::{
    decode_fixed32, decode_fixed64, get_length_prefixed_slice, put_length_prefixed_slice,
};
use crate::error::{Error, Result};
use crate::key::ValueType;
use crate::memtable::MemTable;

const HEADER_SIZE: usize = 12;

#[derive(Debug, Clone)]
pub struct WriteBatch {
    rep: Vec<u8>,
}

impl Default for WriteBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteBatch {
    pub fn new() -> Self {
        Self {
            rep: vec![0; HEADER_SIZE],
        }
    }

    pub fn put(&mut self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) {
        self.set_count(self.count() + 1);
        self.rep.push(ValueType::Value as u8);
        put_length_prefixed_slice(&mut self.rep, key.as_ref());
        put_length_prefixed_slice(&mut self.rep, value.as_ref());
    }

    pub fn delete(&mut self, key: impl AsRef<[u8]>) {
        self.set_count(self.count() + 1);
        self.rep.push(ValueType::Deletion as u8);
        put_length_prefixed_slice(&mut self.rep, key.as_ref());
    }

    pub fn clear(&mut self) {
        self.rep.clear();
        self.rep.resize(HEADER_SIZE, 0);
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn approximate_size(&self) -> usize {
        self.rep.len()
    }

    pub(crate) fn count(&self) -> u32 {
        decode_fixed32(&self.rep[8..])
    }

    fn set_count(&mut self, count: u32) {
        self.rep[8..12].copy_from_slice(&count.to_le_bytes());
    }

    pub(crate) fn sequence(&self) -> u64 {
        decode_fixed64(&self.rep)
    }

    pub(crate) fn set_sequence(&mut self, sequence: u64) {
        self.rep[..8].copy_from_slice(&sequence.to_le_bytes());
    }

    pub(crate) fn contents(&self) -> &[u8] {
        &self.rep
    }

    /// Rebuilds a batch from bytes recovered out of the WAL.
    pub(crate) fn from_contents(contents: &[u8]) -> Result<Self> {
        if contents.len() < HEADER_SIZE {
            return Err(Error::corruption("write batch too small"));
        }
        Ok(Self {
            rep: contents.to_vec(),
        })
    }

    /// Appends `other`'s records to `self`, keeping `self`'s sequence.
    pub(crate) fn append(&mut self, other: &WriteBatch) {
        self.set_count(self.count() + other.count());
        self.rep.extend_from_slice(&other.rep[HEADER_SIZE..]);
    }

    pub(crate) fn iter(&self) -> BatchIter<'_> {
        BatchIter {
            input: &self.rep[HEADER_SIZE.min(self.rep.len())..],
            expected: self.count(),
            yielded: 0,
        }
    }

    /// Applies every record to `mem`, assigning sequences from the header.
    pub(crate) fn insert_into(&self, mem: &MemTable) -> Result<()> {
        let mut sequence = self.sequence();
        for entry in self.iter() {
            match entry? {
                BatchEntry::Put { key, value } => {
                    mem.add(sequence, ValueType::Value, key, value);
                }
                BatchEntry::Delete { key } => {
                    mem.add(sequence, ValueType::Deletion, key, b"");
                }
            }
            sequence += 1;
        }
        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum BatchEntry<'a> {
    Put { key: &'a [u8], value: &'a [u8] },
    Delete { key: &'a [u8] },
}

pub(crate) struct BatchIter<'a> {
    input: &'a [u8],
    expected: u32,
    yielded: u32,
}

impl<'a> Iterator for BatchIter<'a> {
    type Item = Result<BatchEntry<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.input.is_empty() {
            if self.yielded != self.expected {
                self.yielded = self.expected;
                return Some(Err(Error::corruption("write batch has wrong count")));
            }
            return None;
        }

        let tag = self.input[0];
        self.input = &self.input[1..];
        self.yielded += 1;

        let entry = match ValueType::from_u8(tag) {
            Ok(ValueType::Value) => {
                let key = match get_length_prefixed_slice(&mut self.input) {
                    Ok(k) => k,
                    Err(e) => return Some(Err(e)),
                };
                let value = match get_length_prefixed_slice(&mut self.input) {
                    Ok(v) => v,
                    Err(e) => return Some(Err(e)),
                };
                BatchEntry::Put { key, value }
            }
            Ok(ValueType::Deletion) => {
                let key = match get_length_prefixed_slice(&mut self.input) {
                    Ok(k) => k,
                    Err(e) => return Some(Err(e)),
                };
                BatchEntry::Delete { key }
            }
            Err(_) => return Some(Err(Error::corruption("unknown write batch tag"))),
        };
        Some(Ok(entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(batch: &WriteBatch) -> Vec<(u8, Vec<u8>, Vec<u8>)> {
        batch
            .iter()
            .map(|entry| match entry.unwrap() {
                BatchEntry::Put { key, value } => (1, key.to_vec(), value.to_vec()),
                BatchEntry::Delete { key } => (0, key.to_vec(), Vec::new()),
            })
            .collect()
    }

    #[test]
    fn empty_batch() {
        let batch = WriteBatch::new();
        assert!(batch.is_empty());
        assert_eq!(batch.count(), 0);
        assert_eq!(batch.approximate_size(), HEADER_SIZE);
        assert!(collect(&batch).is_empty());
    }

    #[test]
    fn records_roundtrip_through_contents() {
        let mut batch = WriteBatch::new();
        batch.put(b"a", b"1");
        batch.delete(b"b");
        batch.put(b"c", b"");
        batch.set_sequence(100);

        let decoded = WriteBatch::from_contents(batch.contents()).unwrap();
        assert_eq!(decoded.sequence(), 100);
        assert_eq!(decoded.count(), 3);
        assert_eq!(
            collect(&decoded),
            vec![
                (1, b"a".to_vec(), b"1".to_vec()),
                (0, b"b".to_vec(), Vec::new()),
                (1, b"c".to_vec(), Vec::new()),
            ]
        );
    }

    #[test]
    fn append_merges_counts_and_records() {
        let mut leader = WriteBatch::new();
        leader.put(b"a", b"1");
        let mut follower = WriteBatch::new();
        follower.delete(b"a");
        follower.put(b"b", b"2");

        leader.append(&follower);
        assert_eq!(leader.count(), 3);
        assert_eq!(collect(&leader).len(), 3);
    }

    #[test]
    fn wrong_count_is_corruption() {
        let mut batch = WriteBatch::new();
        batch.put(b"a", b"1");
        batch.set_count(2);
        let err = batch.iter().last().unwrap();
        assert!(err.is_err());
    }

    #[test]
    fn clear_resets_to_header() {
        let mut batch = WriteBatch::new();
        batch.put(b"a", b"1");
        batch.clear();
        assert!(batch.is_empty());
        assert_eq!(batch.approximate_size(), HEADER_SIZE);
    }
}
