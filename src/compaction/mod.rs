//! A planned compaction: inputs from a level and the level below, plus the
//! state needed while merging them.

use std::sync::Arc;

use crate::db::options::DbOptions;
use crate::key::InternalKey;
use crate::version::edit::VersionEdit;
use crate::version::{
    max_grandparent_overlap_bytes, total_file_size, FileMetaData, Version, NUM_LEVELS,
};

pub(crate) struct Compaction {
    level: usize,
    max_output_file_size: u64,
    max_grandparent_overlap: u64,
    /// Version the inputs were chosen from; held so the files outlive the
    /// merge even if newer versions are installed meanwhile.
    input_version: Arc<Version>,
    pub(crate) edit: VersionEdit,

    /// `inputs[0]` is from `level`, `inputs[1]` from `level + 1`.
    pub(crate) inputs: [Vec<Arc<FileMetaData>>; 2],
    /// Files at `level + 2` overlapping the compaction range.
    pub(crate) grandparents: Vec<Arc<FileMetaData>>,

    // Cursor state for should_stop_before.
    grandparent_index: usize,
    seen_key: bool,
    overlapped_bytes: u64,

    // Per-level cursors for is_base_level_for_key; valid because keys are
    // visited in ascending user-key order.
    level_ptrs: [usize; NUM_LEVELS],
}

impl Compaction {
    pub(crate) fn new(options: &DbOptions, level: usize, input_version: Arc<Version>) -> Self {
        Self {
            level,
            max_output_file_size: options.max_file_size,
            max_grandparent_overlap: max_grandparent_overlap_bytes(options),
            input_version,
            edit: VersionEdit::default(),
            inputs: [Vec::new(), Vec::new()],
            grandparents: Vec::new(),
            grandparent_index: 0,
            seen_key: false,
            overlapped_bytes: 0,
            level_ptrs: [0; NUM_LEVELS],
        }
    }

    pub(crate) fn level(&self) -> usize {
        self.level
    }

    pub(crate) fn output_level(&self) -> usize {
        self.level + 1
    }

    pub(crate) fn max_output_file_size(&self) -> u64 {
        self.max_output_file_size
    }

    pub(crate) fn input_version(&self) -> &Arc<Version> {
        &self.input_version
    }

    pub(crate) fn num_input_files(&self, which: usize) -> usize {
        self.inputs[which].len()
    }

    pub(crate) fn input(&self, which: usize, index: usize) -> &Arc<FileMetaData> {
        &self.inputs[which][index]
    }

    pub(crate) fn total_input_bytes(&self) -> u64 {
        total_file_size(&self.inputs[0]) + total_file_size(&self.inputs[1])
    }

    /// A single input file with nothing to merge below can simply move down
    /// a level, provided it would not create expensive grandparent overlap.
    pub(crate) fn is_trivial_move(&self) -> bool {
        self.num_input_files(0) == 1
            && self.num_input_files(1) == 0
            && total_file_size(&self.grandparents) <= self.max_grandparent_overlap
    }

    /// Records every input file as deleted in the edit.
    pub(crate) fn add_input_deletions(&mut self) {
        for (which, level) in [(0, self.level), (1, self.level + 1)] {
            for file in &self.inputs[which] {
                self.edit.delete_file(level, file.number);
            }
        }
    }

    /// True when no level deeper than the output can contain `user_key`, so
    /// an obsolete tombstone for it may be dropped.
    pub(crate) fn is_base_level_for_key(&mut self, user_key: &[u8]) -> bool {
        for level in (self.level + 2)..NUM_LEVELS {
            let files = self.input_version.files(level);
            while self.level_ptrs[level] < files.len() {
                let file = &files[self.level_ptrs[level]];
                if user_key <= file.largest.user_key().as_ref() {
                    if user_key >= file.smallest.user_key().as_ref() {
                        return false;
                    }
                    break;
                }
                self.level_ptrs[level] += 1;
            }
        }
        true
    }

    /// True when the current output should be cut before `key` to bound how
    /// much of level+2 a future compaction of the output must merge.
    pub(crate) fn should_stop_before(&mut self, key: &InternalKey) -> bool {
        while self.grandparent_index < self.grandparents.len()
            && *key > self.grandparents[self.grandparent_index].largest
        {
            if self.seen_key {
                self.overlapped_bytes += self.grandparents[self.grandparent_index].file_size;
            }
            self.grandparent_index += 1;
        }
        self.seen_key = true;

        if self.overlapped_bytes > self.max_grandparent_overlap {
            self.overlapped_bytes = 0;
            true
        } else {
            false
        }
    }
}
