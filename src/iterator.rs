//! Internal iterator seam and the composed iterators built on it.
//!
//! Internal iterators are positioned cursors over internal keys. They only
//! move forward; `seek` positions at the first entry at or after the
//! target. Errors are sticky and surfaced through `status()`.

use std::sync::Arc;

use bytes::Bytes;

use crate::cache::TableCache;
use crate::db::options::ReadOptions;
use crate::error::{Error, Result};
use crate::key::InternalKey;
use crate::sst::TableIterator;
use crate::version::FileMetaData;

pub(crate) trait InternalIterator {
    fn valid(&self) -> bool;

    fn seek_to_first(&mut self);

    /// Positions at the first entry with key >= `target`.
    fn seek(&mut self, target: &InternalKey);

    /// REQUIRES: `valid()`.
    fn next(&mut self);

    /// REQUIRES: `valid()`.
    fn key(&self) -> &InternalKey;

    /// REQUIRES: `valid()`.
    fn value(&self) -> &Bytes;

    fn status(&self) -> Result<()>;
}

/// Merges children into one sorted stream. On equal keys the
/// earliest child wins, so callers order children newest-first.
pub(crate) struct MergingIterator {
    children: Vec<Box<dyn InternalIterator>>,
    current: Option<usize>,
}

impl MergingIterator {
    pub(crate) fn new(children: Vec<Box<dyn InternalIterator>>) -> Self {
        Self {
            children,
            current: None,
        }
    }

    fn find_smallest(&mut self) {
        let mut smallest: Option<usize> = None;
        for (index, child) in self.children.iter().enumerate() {
            if !child.valid() {
                continue;
            }
            smallest = match smallest {
                Some(best) if self.children[best].key() <= child.key() => Some(best),
                _ => Some(index),
            };
        }
        self.current = smallest;
    }
}

impl InternalIterator for MergingIterator {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn seek_to_first(&mut self) {
        for child in &mut self.children {
            child.seek_to_first();
        }
        self.find_smallest();
    }

    fn seek(&mut self, target: &InternalKey) {
        for child in &mut self.children {
            child.seek(target);
        }
        self.find_smallest();
    }

    fn next(&mut self) {
        let current = self.current.expect("iterator not positioned");
        self.children[current].next();
        self.find_smallest();
    }

    fn key(&self) -> &InternalKey {
        self.children[self.current.expect("iterator not positioned")].key()
    }

    fn value(&self) -> &Bytes {
        self.children[self.current.expect("iterator not positioned")].value()
    }

    fn status(&self) -> Result<()> {
        for child in &self.children {
            child.status()?;
        }
        Ok(())
    }
}

/// Walks a level's disjoint, sorted file list: picks the file by key range,
/// then iterates entries within it, rolling over to the next file.
pub(crate) struct LevelConcatIterator {
    table_cache: Arc<TableCache>,
    options: ReadOptions,
    files: Vec<Arc<FileMetaData>>,
    /// Next file to open once the current iterator is exhausted.
    file_index: usize,
    table_iter: Option<TableIterator>,
    error: Option<Error>,
}

impl LevelConcatIterator {
    pub(crate) fn new(
        table_cache: Arc<TableCache>,
        options: &ReadOptions,
        files: Vec<Arc<FileMetaData>>,
    ) -> Self {
        Self {
            table_cache,
            options: options.clone(),
            files,
            file_index: 0,
            table_iter: None,
            error: None,
        }
    }

    fn open_file(&mut self, file_index: usize) -> bool {
        if file_index >= self.files.len() {
            self.table_iter = None;
            return false;
        }
        match self
            .table_cache
            .iter(&self.options, self.files[file_index].number)
        {
            Ok(iter) => {
                self.file_index = file_index + 1;
                self.table_iter = Some(iter);
                true
            }
            Err(err) => {
                self.error = Some(err);
                self.table_iter = None;
                false
            }
        }
    }

    /// Rolls into following files until the inner iterator is valid.
    fn settle(&mut self) {
        loop {
            let inner_status = match &self.table_iter {
                None => return,
                Some(iter) if iter.valid() => return,
                Some(iter) => iter.status(),
            };
            if let Err(err) = inner_status {
                self.error = Some(err);
                self.table_iter = None;
                return;
            }
            if !self.open_file(self.file_index) {
                return;
            }
            if let Some(iter) = &mut self.table_iter {
                iter.seek_to_first();
            }
        }
    }
}

impl InternalIterator for LevelConcatIterator {
    fn valid(&self) -> bool {
        self.table_iter.as_ref().is_some_and(|iter| iter.valid())
    }

    fn seek_to_first(&mut self) {
        self.error = None;
        if self.open_file(0) {
            if let Some(iter) = &mut self.table_iter {
                iter.seek_to_first();
            }
        }
        self.settle();
    }

    fn seek(&mut self, target: &InternalKey) {
        self.error = None;
        // First file whose largest key can cover the target.
        let file_index = self
            .files
            .partition_point(|file| file.largest < *target);
        if self.open_file(file_index) {
            if let Some(iter) = &mut self.table_iter {
                iter.seek(target);
            }
        }
        self.settle();
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        if let Some(iter) = &mut self.table_iter {
            iter.next();
        }
        self.settle();
    }

    fn key(&self) -> &InternalKey {
        self.table_iter
            .as_ref()
            .expect("iterator not positioned")
            .key()
    }

    fn value(&self) -> &Bytes {
        self.table_iter
            .as_ref()
            .expect("iterator not positioned")
            .value()
    }

    fn status(&self) -> Result<()> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        match &self.table_iter {
            Some(iter) => iter.status(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::ValueType;

    struct VecIterator {
        entries: Vec<(InternalKey, Bytes)>,
        index: usize,
    }

    impl VecIterator {
        fn new(mut entries: Vec<(InternalKey, Bytes)>) -> Self {
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Self {
                index: entries.len(),
                entries,
            }
        }
    }

    impl InternalIterator for VecIterator {
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

    fn entry(user: &str, seq: u64) -> (InternalKey, Bytes) {
        (
            InternalKey::new(Bytes::from(user.to_owned()), seq, ValueType::Value),
            Bytes::from(format!("{user}@{seq}")),
        )
    }

    #[test]
    fn merge_interleaves_sources() {
        let a = VecIterator::new(vec![entry("a", 9), entry("c", 5), entry("e", 1)]);
        let b = VecIterator::new(vec![entry("b", 8), entry("c", 7), entry("d", 2)]);

        let mut merged = MergingIterator::new(vec![Box::new(a), Box::new(b)]);
        merged.seek_to_first();

        let mut seen = Vec::new();
        while merged.valid() {
            seen.push((merged.key().user_key().clone(), merged.key().sequence()));
            merged.next();
        }
        // "c"@7 (newer) sorts before "c"@5.
        assert_eq!(
            seen,
            vec![
                (Bytes::from("a"), 9),
                (Bytes::from("b"), 8),
                (Bytes::from("c"), 7),
                (Bytes::from("c"), 5),
                (Bytes::from("d"), 2),
                (Bytes::from("e"), 1),
            ]
        );
        merged.status().unwrap();
    }

    #[test]
    fn merge_seek_positions_every_child() {
        let a = VecIterator::new(vec![entry("a", 3), entry("d", 3)]);
        let b = VecIterator::new(vec![entry("b", 2), entry("e", 2)]);

        let mut merged = MergingIterator::new(vec![Box::new(a), Box::new(b)]);
        merged.seek(&InternalKey::for_lookup(Bytes::from("c"), u64::MAX >> 8));
        assert!(merged.valid());
        assert_eq!(merged.key().user_key().as_ref(), b"d");
    }

    #[test]
    fn merge_of_empty_children_is_exhausted() {
        let a = VecIterator::new(Vec::new());
        let mut merged = MergingIterator::new(vec![Box::new(a) as Box<dyn InternalIterator>]);
        merged.seek_to_first();
        assert!(!merged.valid());
    }
}
