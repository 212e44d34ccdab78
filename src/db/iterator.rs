//! User-facing iterator.
//!
//! Wraps a merging iterator over the memtables and every level, resolving
//! MVCC at a fixed sequence: entries newer than the snapshot are invisible,
//! tombstones hide older versions, and only the newest visible version of
//! each user key is yielded. The iterator pins the memtables and version it
//! was created from, so compactions cannot pull files out from under it.

use std::sync::Arc;

use bytes::Bytes;

use crate::error::Result;
use crate::iterator::{InternalIterator, MergingIterator};
use crate::key::{InternalKey, ValueType};
use crate::memtable::MemTable;
use crate::version::{Version, READ_BYTES_PERIOD};

use super::DbInner;

pub struct DbIterator {
    db: Arc<DbInner>,
    version: Arc<Version>,
    _mem: Arc<MemTable>,
    _imm: Option<Arc<MemTable>>,
    iter: MergingIterator,
    sequence: u64,

    /// Newest visible version of this user key was already yielded (or
    /// deleted); older entries for it are shadowed.
    skip_user_key: Option<Bytes>,
    bytes_until_read_sampling: i64,
    reported_error: bool,
}

impl DbIterator {
    pub(crate) fn new(
        db: Arc<DbInner>,
        version: Arc<Version>,
        mem: Arc<MemTable>,
        imm: Option<Arc<MemTable>>,
        iter: MergingIterator,
        sequence: u64,
    ) -> Self {
        Self {
            db,
            version,
            _mem: mem,
            _imm: imm,
            iter,
            sequence,
            skip_user_key: None,
            bytes_until_read_sampling: READ_BYTES_PERIOD as i64,
            reported_error: false,
        }
    }

    pub fn seek_to_first(&mut self) {
        self.skip_user_key = None;
        self.reported_error = false;
        self.iter.seek_to_first();
    }

    /// Positions at the first user key at or after `user_key`.
    pub fn seek(&mut self, user_key: impl AsRef<[u8]>) {
        self.skip_user_key = None;
        self.reported_error = false;
        let target = InternalKey::for_lookup(
            Bytes::copy_from_slice(user_key.as_ref()),
            self.sequence,
        );
        self.iter.seek(&target);
    }

    /// Yields the next visible `(key, value)` pair in ascending user-key
    /// order. Returns `None` once exhausted; an underlying read error is
    /// reported once and ends iteration.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<Result<(Bytes, Bytes)>> {
        loop {
            if !self.iter.valid() {
                if self.reported_error {
                    return None;
                }
                return match self.iter.status() {
                    Ok(()) => None,
                    Err(err) => {
                        self.reported_error = true;
                        Some(Err(err))
                    }
                };
            }

            let key = self.iter.key().clone();
            self.sample_bytes_read(&key, self.iter.value().len());

            if key.sequence() > self.sequence {
                self.iter.next();
                continue;
            }

            if self
                .skip_user_key
                .as_ref()
                .is_some_and(|skip| skip == key.user_key())
            {
                self.iter.next();
                continue;
            }

            match key.value_type() {
                ValueType::Deletion => {
                    self.skip_user_key = Some(key.user_key().clone());
                    self.iter.next();
                }
                ValueType::Value => {
                    self.skip_user_key = Some(key.user_key().clone());
                    let value = self.iter.value().clone();
                    self.iter.next();
                    return Some(Ok((key.user_key().clone(), value)));
                }
            }
        }
    }

    /// Roughly once per megabyte scanned, charge a seek credit against the
    /// first file that overlaps the sampled key.
    fn sample_bytes_read(&mut self, key: &InternalKey, value_len: usize) {
        self.bytes_until_read_sampling -= (key.encoded_len() + value_len) as i64;
        while self.bytes_until_read_sampling <= 0 {
            self.bytes_until_read_sampling += READ_BYTES_PERIOD as i64;
            if self.version.record_read_sample(key) {
                self.db.schedule_compaction_from_read_path();
            }
        }
    }
}
