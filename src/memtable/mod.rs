//! In-memory sorted buffer of recent writes.
//!
//! Backed by a lock-free skip list keyed by internal key. Inserts never
//! replace or mutate existing entries (every internal key carries a unique
//! sequence number), so concurrent readers always observe either the old
//! chain or a fully linked node. Memtables are shared by `Arc`; the map is
//! freed when the last reference drops.

use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use crossbeam_skiplist::SkipMap;

use crate::error::Result;
use crate::iterator::InternalIterator;
use crate::key::{InternalKey, ValueType};

#[derive(Debug)]
pub(crate) struct MemTable {
    map: SkipMap<InternalKey, Bytes>,
    approximate_bytes: AtomicU64,
}

impl MemTable {
    pub(crate) fn new() -> Self {
        Self {
            map: SkipMap::new(),
            approximate_bytes: AtomicU64::new(0),
        }
    }

    pub(crate) fn approximate_memory_usage(&self) -> u64 {
        self.approximate_bytes.load(Ordering::Relaxed)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Inserts one entry. Callers serialize writers (the group-commit
    /// leader is the only thread inserting at any moment); readers need no
    /// coordination.
    pub(crate) fn add(&self, sequence: u64, kind: ValueType, key: &[u8], value: &[u8]) {
        let internal_key = InternalKey::new(Bytes::copy_from_slice(key), sequence, kind);
        let value = Bytes::copy_from_slice(value);
        let charged = (internal_key.encoded_len() + value.len() + 16) as u64;
        self.map.insert(internal_key, value);
        self.approximate_bytes.fetch_add(charged, Ordering::Relaxed);
    }

    /// Looks up `user_key` as of `sequence`.
    ///
    /// Returns:
    /// - `None` if the key has no entry visible at `sequence`
    /// - `Some(None)` if the newest visible entry is a tombstone
    /// - `Some(Some(value))` otherwise
    pub(crate) fn get(&self, user_key: &[u8], sequence: u64) -> Option<Option<Bytes>> {
        let lookup = InternalKey::for_lookup(Bytes::copy_from_slice(user_key), sequence);
        let entry = self.map.lower_bound(Bound::Included(&lookup))?;
        if entry.key().user_key().as_ref() != user_key {
            return None;
        }
        match entry.key().value_type() {
            ValueType::Value => Some(Some(entry.value().clone())),
            ValueType::Deletion => Some(None),
        }
    }

    /// Iterator over a point-in-time copy of the entries.
    pub(crate) fn iter(&self) -> MemTableIterator {
        let entries: Vec<(InternalKey, Bytes)> = self
            .map
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        MemTableIterator {
            index: entries.len(),
            entries,
        }
    }
}

pub(crate) struct MemTableIterator {
    entries: Vec<(InternalKey, Bytes)>,
    /// `entries.len()` when not positioned.
    index: usize,
}

impl InternalIterator for MemTableIterator {
    fn valid(&self) -> bool {
        self.index < self.entries.len()
    }

    fn seek_to_first(&mut self) {
        self.index = 0;
    }

    fn seek(&mut self, target: &InternalKey) {
        self.index = match self.entries.binary_search_by(|(key, _)| key.cmp(target)) {
            Ok(index) | Err(index) => index,
        };
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        self.index += 1;
    }

    fn key(&self) -> &InternalKey {
        &self.entries[self.index].0
    }

    fn value(&self) -> &Bytes {
        &self.entries[self.index].1
    }

    fn status(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newest_visible_entry_wins() {
        let mem = MemTable::new();
        mem.add(1, ValueType::Value, b"k", b"v1");
        mem.add(2, ValueType::Value, b"k", b"v2");

        assert_eq!(mem.get(b"k", 2), Some(Some(Bytes::from("v2"))));
        assert_eq!(mem.get(b"k", 1), Some(Some(Bytes::from("v1"))));
        assert_eq!(mem.get(b"missing", 2), None);
    }

    #[test]
    fn tombstone_reports_deleted() {
        let mem = MemTable::new();
        mem.add(1, ValueType::Value, b"k", b"v");
        mem.add(2, ValueType::Deletion, b"k", b"");

        assert_eq!(mem.get(b"k", 2), Some(None));
        assert_eq!(mem.get(b"k", 1), Some(Some(Bytes::from("v"))));
    }

    #[test]
    fn entries_too_new_are_invisible() {
        let mem = MemTable::new();
        mem.add(5, ValueType::Value, b"k", b"v");
        assert_eq!(mem.get(b"k", 4), None);
    }

    #[test]
    fn iterator_walks_internal_order() {
        let mem = MemTable::new();
        mem.add(1, ValueType::Value, b"b", b"1");
        mem.add(2, ValueType::Value, b"a", b"2");
        mem.add(3, ValueType::Value, b"a", b"3");

        let mut iter = mem.iter();
        iter.seek_to_first();
        let mut seen = Vec::new();
        while iter.valid() {
            seen.push((iter.key().user_key().clone(), iter.key().sequence()));
            iter.next();
        }
        assert_eq!(
            seen,
            vec![
                (Bytes::from("a"), 3),
                (Bytes::from("a"), 2),
                (Bytes::from("b"), 1),
            ]
        );
    }

    #[test]
    fn memory_usage_grows() {
        let mem = MemTable::new();
        assert_eq!(mem.approximate_memory_usage(), 0);
        mem.add(1, ValueType::Value, b"key", b"value");
        assert!(mem.approximate_memory_usage() > 0);
    }
}
