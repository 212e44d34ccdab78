//! Versions and the version set.
//!
//! A `Version` is an immutable snapshot of the table files at every level.
//! Level 0 files may overlap and are searched newest-first; deeper levels
//! hold disjoint, sorted files. Versions are shared with `Arc`: iterators
//! and compactions pin the version they started from, and the version set
//! tracks the live set through downgraded references so obsolete files are
//! only deleted once nothing can read them.
//!
//! Every durable transition is a `VersionEdit` appended to the manifest log
//! and then installed as the new current version; the first append to a
//! fresh manifest writes a full snapshot of the current state and pivots
//! `CURRENT` to it.

pub(crate) mod edit;

use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::cache::TableCache;
use crate::compaction::Compaction;
use crate::db::options::{DbOptions, ReadOptions};
use crate::error::{Error, Result};
use crate::filename::{current_file_name, manifest_file_name, set_current_file};
use crate::key::{BytewiseComparator, Comparator, InternalKey, ValueType, MAX_SEQUENCE};
use crate::log::{LogReader, LogWriter};
use edit::{NewFileEntry, VersionEdit};

pub(crate) const NUM_LEVELS: usize = 7;

/// Level-0 file count that triggers a compaction.
pub(crate) const L0_COMPACTION_TRIGGER: usize = 4;
/// Level-0 file count at which writes are delayed by a millisecond.
pub(crate) const L0_SLOWDOWN_WRITES_TRIGGER: usize = 8;
/// Level-0 file count at which writes stall until compaction catches up.
pub(crate) const L0_STOP_WRITES_TRIGGER: usize = 12;

/// Bytes of iterator progress between read samples.
pub(crate) const READ_BYTES_PERIOD: u64 = 1024 * 1024;

fn max_bytes_for_level(mut level: usize) -> f64 {
    // 10 MiB at level 1, a decade more per level below.
    let mut result = 10.0 * 1024.0 * 1024.0;
    while level > 1 {
        result *= 10.0;
        level -= 1;
    }
    result
}

pub(crate) fn max_grandparent_overlap_bytes(options: &DbOptions) -> u64 {
    10 * options.max_file_size
}

fn expanded_compaction_byte_size_limit(options: &DbOptions) -> u64 {
    25 * options.max_file_size
}

pub(crate) fn total_file_size(files: &[Arc<FileMetaData>]) -> u64 {
    files.iter().map(|file| file.file_size).sum()
}

#[derive(Debug)]
pub(crate) struct FileMetaData {
    pub number: u64,
    pub file_size: u64,
    pub smallest: InternalKey,
    pub largest: InternalKey,
    /// Seeks this file may absorb before becoming a compaction candidate.
    pub allowed_seeks: AtomicI64,
}

impl FileMetaData {
    fn from_entry(entry: &NewFileEntry) -> Self {
        // One seek costs about as much as compacting 16 KiB of data.
        let allowed = ((entry.file_size / 16384) as i64).max(100);
        Self {
            number: entry.number,
            file_size: entry.file_size,
            smallest: entry.smallest.clone(),
            largest: entry.largest.clone(),
            allowed_seeks: AtomicI64::new(allowed),
        }
    }

    #[cfg(test)]
    pub(crate) fn for_test(
        number: u64,
        file_size: u64,
        smallest: InternalKey,
        largest: InternalKey,
    ) -> Self {
        Self {
            number,
            file_size,
            smallest,
            largest,
            allowed_seeks: AtomicI64::new(100),
        }
    }
}

/// A file charged by the seek bookkeeping, remembered as the next
/// seek-triggered compaction input.
#[derive(Debug, Clone)]
pub(crate) struct SeekCharge {
    pub level: usize,
    pub file: Arc<FileMetaData>,
}

#[derive(Debug)]
pub(crate) struct Version {
    files: Vec<Vec<Arc<FileMetaData>>>,
    /// Best size-compaction candidate, filled in by `finalize`.
    compaction_level: usize,
    compaction_score: f64,
    /// Seek-triggered compaction candidate, set by read stats.
    seek_compact: Mutex<Option<SeekCharge>>,
}

impl Version {
    pub(crate) fn empty() -> Self {
        Self {
            files: vec![Vec::new(); NUM_LEVELS],
            compaction_level: 0,
            compaction_score: -1.0,
            seek_compact: Mutex::new(None),
        }
    }

    pub(crate) fn files(&self, level: usize) -> &[Arc<FileMetaData>] {
        &self.files[level]
    }

    pub(crate) fn num_files(&self, level: usize) -> usize {
        self.files[level].len()
    }

    pub(crate) fn needs_compaction(&self) -> bool {
        self.compaction_score >= 1.0 || self.seek_compact.lock().is_some()
    }

    /// Files a point lookup for `user_key` would have to consult, in search
    /// order: overlapping level-0 files newest first, then at most one file
    /// per deeper level.
    fn search_path(&self, user_key: &[u8]) -> Vec<(usize, Arc<FileMetaData>)> {
        let mut path = Vec::new();

        let mut level0: Vec<&Arc<FileMetaData>> = self.files[0]
            .iter()
            .filter(|file| {
                user_key >= file.smallest.user_key().as_ref()
                    && user_key <= file.largest.user_key().as_ref()
            })
            .collect();
        level0.sort_by(|a, b| b.number.cmp(&a.number));
        path.extend(level0.into_iter().map(|file| (0, file.clone())));

        let lookup = InternalKey::for_lookup(Bytes::copy_from_slice(user_key), MAX_SEQUENCE);
        for level in 1..NUM_LEVELS {
            let files = &self.files[level];
            if files.is_empty() {
                continue;
            }
            let index = find_file(files, &lookup);
            if index < files.len() && user_key >= files[index].smallest.user_key().as_ref() {
                path.push((level, files[index].clone()));
            }
        }
        path
    }

    /// Point lookup across the version's levels.
    ///
    /// Returns the lookup outcome plus, when the search touched more than
    /// one file, a seek charge against the first file on the path.
    pub(crate) fn get(
        &self,
        options: &ReadOptions,
        lookup: &InternalKey,
        table_cache: &TableCache,
    ) -> Result<(Option<Option<Bytes>>, Option<SeekCharge>)> {
        let user_key = lookup.user_key().clone();
        let path = self.search_path(user_key.as_ref());

        let mut charge = None;
        let mut first: Option<SeekCharge> = None;
        for (visited, (level, file)) in path.into_iter().enumerate() {
            if visited == 0 {
                first = Some(SeekCharge {
                    level,
                    file: file.clone(),
                });
            } else if visited == 1 {
                charge = first.take();
            }

            if let Some((found, value)) = table_cache.get(options, file.number, lookup)? {
                if found.user_key() == &user_key {
                    let outcome = match found.value_type() {
                        ValueType::Value => Some(value),
                        ValueType::Deletion => None,
                    };
                    return Ok((Some(outcome), charge));
                }
            }
        }
        Ok((None, charge))
    }

    /// Applies a seek charge; returns true when the version now has a
    /// seek-triggered compaction candidate.
    pub(crate) fn update_stats(&self, charge: SeekCharge) -> bool {
        let remaining = charge.file.allowed_seeks.fetch_sub(1, Ordering::Relaxed) - 1;
        if remaining <= 0 {
            let mut seek = self.seek_compact.lock();
            if seek.is_none() {
                *seek = Some(charge);
                return true;
            }
        }
        false
    }

    /// Charges a sampled key scanned by an iterator. Returns true when a
    /// compaction should be scheduled.
    pub(crate) fn record_read_sample(&self, key: &InternalKey) -> bool {
        let path = self.search_path(key.user_key().as_ref());
        if path.len() >= 2 {
            let (level, file) = path[0].clone();
            return self.update_stats(SeekCharge { level, file });
        }
        false
    }

    /// True when any file at `level` overlaps `[smallest_user, largest_user]`
    /// (`None` bounds extend past the ends of the key space).
    pub(crate) fn overlap_in_level(
        &self,
        level: usize,
        smallest_user: Option<&[u8]>,
        largest_user: Option<&[u8]>,
    ) -> bool {
        let files = &self.files[level];
        if level == 0 {
            return files.iter().any(|file| {
                !(smallest_user
                    .map(|bound| file.largest.user_key().as_ref() < bound)
                    .unwrap_or(false)
                    || largest_user
                        .map(|bound| file.smallest.user_key().as_ref() > bound)
                        .unwrap_or(false))
            });
        }

        // Disjoint sorted files: binary search the only candidate.
        let index = match smallest_user {
            Some(bound) => {
                let lookup = InternalKey::for_lookup(Bytes::copy_from_slice(bound), MAX_SEQUENCE);
                find_file(files, &lookup)
            }
            None => 0,
        };
        match files.get(index) {
            None => false,
            Some(file) => !largest_user
                .map(|bound| file.smallest.user_key().as_ref() > bound)
                .unwrap_or(false),
        }
    }

    /// All files at `level` overlapping `[begin, end]` in user-key space.
    /// For level 0 the range grows until it covers every transitively
    /// overlapping file, because level-0 files overlap each other.
    pub(crate) fn overlapping_inputs(
        &self,
        level: usize,
        begin: Option<&InternalKey>,
        end: Option<&InternalKey>,
    ) -> Vec<Arc<FileMetaData>> {
        let mut user_begin = begin.map(|key| key.user_key().clone());
        let mut user_end = end.map(|key| key.user_key().clone());

        let mut inputs = Vec::new();
        let mut index = 0;
        while index < self.files[level].len() {
            let file = self.files[level][index].clone();
            index += 1;

            let before = user_begin
                .as_ref()
                .map(|bound| file.largest.user_key() < bound)
                .unwrap_or(false);
            let after = user_end
                .as_ref()
                .map(|bound| file.smallest.user_key() > bound)
                .unwrap_or(false);
            if before || after {
                continue;
            }

            if level == 0 {
                let mut restart = false;
                if let Some(bound) = &user_begin {
                    if file.smallest.user_key() < bound {
                        user_begin = Some(file.smallest.user_key().clone());
                        restart = true;
                    }
                }
                if let Some(bound) = &user_end {
                    if file.largest.user_key() > bound {
                        user_end = Some(file.largest.user_key().clone());
                        restart = true;
                    }
                }
                if restart {
                    inputs.clear();
                    index = 0;
                    continue;
                }
            }
            inputs.push(file);
        }
        inputs
    }

    /// Debug listing used by the `sstables` property.
    pub(crate) fn debug_string(&self) -> String {
        use std::fmt::Write;

        let mut out = String::new();
        for (level, files) in self.files.iter().enumerate() {
            let _ = writeln!(out, "--- level {level} ---");
            for file in files {
                let _ = writeln!(
                    out,
                    "{}:{}[{:?} @{} .. {:?} @{}]",
                    file.number,
                    file.file_size,
                    String::from_utf8_lossy(file.smallest.user_key()),
                    file.smallest.sequence(),
                    String::from_utf8_lossy(file.largest.user_key()),
                    file.largest.sequence(),
                );
            }
        }
        out
    }
}

/// Index of the first file whose largest key is at or after `key`.
/// REQUIRES: `files` disjoint and sorted by smallest key.
fn find_file(files: &[Arc<FileMetaData>], key: &InternalKey) -> usize {
    files.partition_point(|file| file.largest < *key)
}

/// Smallest and largest internal keys across `files` (must be non-empty).
fn key_range(files: &[Arc<FileMetaData>]) -> (InternalKey, InternalKey) {
    debug_assert!(!files.is_empty());
    let mut smallest = files[0].smallest.clone();
    let mut largest = files[0].largest.clone();
    for file in &files[1..] {
        if file.smallest < smallest {
            smallest = file.smallest.clone();
        }
        if file.largest > largest {
            largest = file.largest.clone();
        }
    }
    (smallest, largest)
}

fn key_range_2(
    a: &[Arc<FileMetaData>],
    b: &[Arc<FileMetaData>],
) -> (InternalKey, InternalKey) {
    let all: Vec<Arc<FileMetaData>> = a.iter().chain(b.iter()).cloned().collect();
    key_range(&all)
}

/// Extends `inputs` with same-level files whose smallest user key equals the
/// current largest user key of the inputs. A user key split across file
/// boundaries must compact as a unit or newer entries would sink below
/// older ones.
fn add_boundary_inputs(level_files: &[Arc<FileMetaData>], inputs: &mut Vec<Arc<FileMetaData>>) {
    loop {
        let Some(largest) = inputs.iter().map(|file| file.largest.clone()).max() else {
            return;
        };

        let mut boundary: Option<Arc<FileMetaData>> = None;
        for file in level_files {
            if file.smallest > largest && file.smallest.user_key() == largest.user_key() {
                let better = match &boundary {
                    Some(candidate) => file.smallest < candidate.smallest,
                    None => true,
                };
                if better && !inputs.iter().any(|input| input.number == file.number) {
                    boundary = Some(file.clone());
                }
            }
        }

        match boundary {
            Some(file) => inputs.push(file),
            None => return,
        }
    }
}

/// Computes the next size-compaction candidate for a freshly built version.
fn finalize(version: &mut Version) {
    let mut best_level = 0;
    let mut best_score = -1.0f64;
    for level in 0..NUM_LEVELS - 1 {
        let score = if level == 0 {
            // File count, not bytes: level 0 is searched file-by-file, and
            // small write buffers must not trigger endless tiny merges.
            version.files[0].len() as f64 / L0_COMPACTION_TRIGGER as f64
        } else {
            total_file_size(&version.files[level]) as f64 / max_bytes_for_level(level)
        };
        if score > best_score {
            best_level = level;
            best_score = score;
        }
    }
    version.compaction_level = best_level;
    version.compaction_score = best_score;
}

/// Accumulates edits against a base version and emits the merged result.
struct Builder {
    base: Arc<Version>,
    deleted: Vec<HashSet<u64>>,
    added: Vec<Vec<Arc<FileMetaData>>>,
}

impl Builder {
    fn new(base: Arc<Version>) -> Self {
        Self {
            base,
            deleted: vec![HashSet::new(); NUM_LEVELS],
            added: vec![Vec::new(); NUM_LEVELS],
        }
    }

    fn apply(&mut self, edit: &VersionEdit) {
        for (level, number) in &edit.deleted_files {
            self.deleted[*level].insert(*number);
        }
        for (level, entry) in &edit.new_files {
            self.deleted[*level].remove(&entry.number);
            self.added[*level].push(Arc::new(FileMetaData::from_entry(entry)));
        }
    }

    fn save(mut self) -> Result<Version> {
        let mut version = Version::empty();
        for level in 0..NUM_LEVELS {
            let mut files: Vec<Arc<FileMetaData>> = self.base.files[level]
                .iter()
                .chain(self.added[level].iter())
                .filter(|file| !self.deleted[level].contains(&file.number))
                .cloned()
                .collect();
            files.sort_by(|a, b| {
                a.smallest
                    .cmp(&b.smallest)
                    .then_with(|| a.number.cmp(&b.number))
            });

            if level > 0 {
                for pair in files.windows(2) {
                    if pair[0].largest.user_key() >= pair[1].smallest.user_key() {
                        return Err(Error::corruption(format!(
                            "overlapping files {} and {} at level {level}",
                            pair[0].number, pair[1].number
                        )));
                    }
                }
            }
            version.files[level] = files;
            self.added[level].clear();
        }
        Ok(version)
    }
}

struct ManifestWriter {
    log: LogWriter,
    number: u64,
}

struct VersionSetInner {
    current: Arc<Version>,
    /// Downgraded handles to every version handed out; pruned on access.
    live: Vec<Weak<Version>>,
    log_number: u64,
    prev_log_number: u64,
    manifest_file_number: u64,
    /// Per-level key at which the next size compaction should start.
    compact_pointer: [Option<InternalKey>; NUM_LEVELS],
}

pub(crate) struct VersionSet {
    dir: PathBuf,
    options: DbOptions,
    next_file_number: AtomicU64,
    last_sequence: AtomicU64,
    inner: Mutex<VersionSetInner>,
    /// Also serializes `log_and_apply`: whoever holds this appends.
    manifest: Mutex<Option<ManifestWriter>>,
}

/// Creates the descriptor for a brand new database: a one-edit manifest and
/// a `CURRENT` pointing at it.
pub(crate) fn bootstrap_db(dir: &Path) -> Result<()> {
    let edit = VersionEdit {
        comparator_name: Some(BytewiseComparator.name().to_owned()),
        log_number: Some(0),
        next_file_number: Some(2),
        last_sequence: Some(0),
        ..VersionEdit::default()
    };

    let path = manifest_file_name(dir, 1);
    let result = (|| -> Result<()> {
        let file = File::create(&path)?;
        let mut log = LogWriter::new(file);
        log.add_record(&edit.encode())?;
        log.sync()?;
        set_current_file(dir, 1)
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&path);
    }
    result
}

impl VersionSet {
    /// Rebuilds the version set from `CURRENT` and the manifest it names.
    pub(crate) fn recover(dir: &Path, options: &DbOptions) -> Result<VersionSet> {
        let current_contents = std::fs::read_to_string(current_file_name(dir))?;
        if !current_contents.ends_with('\n') || current_contents.len() <= 1 {
            return Err(Error::corruption("CURRENT file is malformed"));
        }
        let manifest_name = current_contents.trim_end();
        let manifest_path = dir.join(manifest_name);

        let mut builder = Builder::new(Arc::new(Version::empty()));
        let mut log_number = None;
        let mut prev_log_number = None;
        let mut next_file_number = None;
        let mut last_sequence = None;
        let mut compact_pointer: [Option<InternalKey>; NUM_LEVELS] =
            std::array::from_fn(|_| None);

        let mut reader = LogReader::new(File::open(&manifest_path)?, true);
        loop {
            let record = match reader.read_record() {
                Ok(Some(record)) => record,
                Ok(None) => break,
                Err(err) if options.paranoid_checks => return Err(err),
                // Tail damage with paranoid checks off: recover the prefix.
                Err(_) => break,
            };

            let edit = VersionEdit::decode(&record)?;
            if let Some(name) = &edit.comparator_name {
                if name != BytewiseComparator.name() {
                    return Err(Error::invalid_argument(format!(
                        "comparator mismatch: manifest uses {name}"
                    )));
                }
            }
            builder.apply(&edit);
            for (level, key) in &edit.compact_pointers {
                compact_pointer[*level] = Some(key.clone());
            }
            if edit.log_number.is_some() {
                log_number = edit.log_number;
            }
            if edit.prev_log_number.is_some() {
                prev_log_number = edit.prev_log_number;
            }
            if edit.next_file_number.is_some() {
                next_file_number = edit.next_file_number;
            }
            if edit.last_sequence.is_some() {
                last_sequence = edit.last_sequence;
            }
        }

        let Some(mut next_file_number) = next_file_number else {
            return Err(Error::corruption("manifest has no next-file entry"));
        };
        let Some(log_number) = log_number else {
            return Err(Error::corruption("manifest has no log-number entry"));
        };
        let Some(last_sequence) = last_sequence else {
            return Err(Error::corruption("manifest has no last-sequence entry"));
        };
        let prev_log_number = prev_log_number.unwrap_or(0);
        next_file_number = next_file_number
            .max(log_number + 1)
            .max(prev_log_number + 1);

        let mut version = builder.save()?;
        finalize(&mut version);

        let manifest_file_number = next_file_number;
        let current = Arc::new(version);
        Ok(VersionSet {
            dir: dir.to_path_buf(),
            options: options.clone(),
            next_file_number: AtomicU64::new(next_file_number + 1),
            last_sequence: AtomicU64::new(last_sequence),
            inner: Mutex::new(VersionSetInner {
                live: vec![Arc::downgrade(&current)],
                current,
                log_number,
                prev_log_number,
                manifest_file_number,
                compact_pointer,
            }),
            manifest: Mutex::new(None),
        })
    }

    pub(crate) fn current(&self) -> Arc<Version> {
        self.inner.lock().current.clone()
    }

    pub(crate) fn last_sequence(&self) -> u64 {
        self.last_sequence.load(Ordering::Acquire)
    }

    pub(crate) fn set_last_sequence(&self, sequence: u64) {
        debug_assert!(sequence >= self.last_sequence());
        self.last_sequence.store(sequence, Ordering::Release);
    }

    pub(crate) fn new_file_number(&self) -> u64 {
        self.next_file_number.fetch_add(1, Ordering::Relaxed)
    }

    /// Keeps the counter ahead of numbers observed in recovered logs.
    pub(crate) fn mark_file_number_used(&self, number: u64) {
        let mut current = self.next_file_number.load(Ordering::Relaxed);
        while current <= number {
            match self.next_file_number.compare_exchange_weak(
                current,
                number + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    pub(crate) fn log_number(&self) -> u64 {
        self.inner.lock().log_number
    }

    pub(crate) fn prev_log_number(&self) -> u64 {
        self.inner.lock().prev_log_number
    }

    pub(crate) fn manifest_file_number(&self) -> u64 {
        self.inner.lock().manifest_file_number
    }

    pub(crate) fn num_level_files(&self, level: usize) -> usize {
        self.inner.lock().current.num_files(level)
    }

    pub(crate) fn num_level_bytes(&self, level: usize) -> u64 {
        total_file_size(self.inner.lock().current.files(level))
    }

    pub(crate) fn needs_compaction(&self) -> bool {
        self.inner.lock().current.needs_compaction()
    }

    /// Table files referenced by any version still reachable from an
    /// iterator, a compaction, or the current pointer.
    pub(crate) fn live_files(&self) -> HashSet<u64> {
        let mut inner = self.inner.lock();
        inner.live.retain(|weak| weak.strong_count() > 0);

        let mut live = HashSet::new();
        let versions: Vec<Arc<Version>> = inner
            .live
            .iter()
            .filter_map(Weak::upgrade)
            .chain(std::iter::once(inner.current.clone()))
            .collect();
        for version in versions {
            for level in 0..NUM_LEVELS {
                for file in version.files(level) {
                    live.insert(file.number);
                }
            }
        }
        live
    }

    /// Applies `edit` to the current version, persists it to the manifest,
    /// and installs the result. The engine mutex is never held here; the
    /// manifest mutex serializes concurrent callers.
    pub(crate) fn log_and_apply(&self, edit: &mut VersionEdit) -> Result<()> {
        let mut manifest = self.manifest.lock();

        let (new_version, log_number, prev_log_number, manifest_number, snapshot) = {
            let inner = self.inner.lock();
            let log_number = edit.log_number.unwrap_or(inner.log_number);
            debug_assert!(log_number >= inner.log_number);
            let prev_log_number = edit.prev_log_number.unwrap_or(inner.prev_log_number);
            edit.log_number = Some(log_number);
            edit.prev_log_number = Some(prev_log_number);
            edit.next_file_number = Some(self.next_file_number.load(Ordering::Relaxed));
            edit.last_sequence = Some(self.last_sequence());

            let mut builder = Builder::new(inner.current.clone());
            builder.apply(edit);
            let mut version = builder.save()?;
            finalize(&mut version);

            let snapshot = if manifest.is_none() {
                Some(self.snapshot_edit(&inner).encode())
            } else {
                None
            };
            (
                version,
                log_number,
                prev_log_number,
                inner.manifest_file_number,
                snapshot,
            )
        };

        // Manifest I/O happens with only the manifest lock held.
        let mut created = false;
        if manifest.is_none() {
            let snapshot = snapshot.unwrap_or_default();
            let path = manifest_file_name(&self.dir, manifest_number);
            let opened = (|| -> Result<ManifestWriter> {
                let file = File::create(&path)?;
                let mut log = LogWriter::new(file);
                log.add_record(&snapshot)?;
                Ok(ManifestWriter {
                    log,
                    number: manifest_number,
                })
            })();
            match opened {
                Ok(writer) => {
                    *manifest = Some(writer);
                    created = true;
                }
                Err(err) => {
                    let _ = std::fs::remove_file(&path);
                    return Err(err);
                }
            }
        }

        let result = {
            let writer = manifest.as_mut().expect("manifest writer present");
            let mut result = writer.log.add_record(&edit.encode());
            if result.is_ok() {
                result = writer.log.sync();
            }
            if result.is_ok() && created {
                result = set_current_file(&self.dir, writer.number);
            }
            result
        };

        match result {
            Ok(()) => {
                let mut inner = self.inner.lock();
                let installed = Arc::new(new_version);
                inner.live.push(Arc::downgrade(&installed));
                inner.current = installed;
                inner.log_number = log_number;
                inner.prev_log_number = prev_log_number;
                for (level, key) in &edit.compact_pointers {
                    inner.compact_pointer[*level] = Some(key.clone());
                }
                Ok(())
            }
            Err(err) => {
                // The new version is discarded; a fresh manifest that failed
                // mid-write is abandoned so the old CURRENT stays the truth.
                if created {
                    if let Some(writer) = manifest.take() {
                        let _ = std::fs::remove_file(manifest_file_name(&self.dir, writer.number));
                    }
                }
                Err(err)
            }
        }
    }

    /// Full state of the current version as a single edit, written as the
    /// first record of a fresh manifest.
    fn snapshot_edit(&self, inner: &VersionSetInner) -> VersionEdit {
        let mut edit = VersionEdit {
            comparator_name: Some(BytewiseComparator.name().to_owned()),
            ..VersionEdit::default()
        };
        for (level, pointer) in inner.compact_pointer.iter().enumerate() {
            if let Some(key) = pointer {
                edit.set_compact_pointer(level, key.clone());
            }
        }
        for level in 0..NUM_LEVELS {
            for file in inner.current.files(level) {
                edit.add_file(
                    level,
                    file.number,
                    file.file_size,
                    file.smallest.clone(),
                    file.largest.clone(),
                );
            }
        }
        edit
    }

    /// Chooses the next compaction: size-triggered first, then
    /// seek-triggered. Returns `None` when the tree is healthy.
    pub(crate) fn pick_compaction(&self) -> Option<Compaction> {
        let mut inner = self.inner.lock();
        let current = inner.current.clone();

        let mut compaction = if current.compaction_score >= 1.0 {
            let level = current.compaction_level;
            debug_assert!(level + 1 < NUM_LEVELS);
            let mut compaction = Compaction::new(&self.options, level, current.clone());

            // Resume after the key where the previous compaction at this
            // level stopped; wrap to the first file.
            let pointer = inner.compact_pointer[level].clone();
            let files = current.files(level);
            let chosen = files
                .iter()
                .find(|file| match &pointer {
                    Some(pointer) => file.largest > *pointer,
                    None => true,
                })
                .or_else(|| files.first())?
                .clone();
            compaction.inputs[0].push(chosen);
            compaction
        } else {
            let charge = current.seek_compact.lock().clone()?;
            let mut compaction = Compaction::new(&self.options, charge.level, current.clone());
            compaction.inputs[0].push(charge.file);
            compaction
        };

        // Level-0 files overlap each other, so any level-0 compaction must
        // absorb every file the chosen range touches.
        if compaction.level() == 0 {
            let (smallest, largest) = key_range(&compaction.inputs[0]);
            compaction.inputs[0] = current.overlapping_inputs(0, Some(&smallest), Some(&largest));
            debug_assert!(!compaction.inputs[0].is_empty());
        }

        self.setup_other_inputs(&mut inner, &mut compaction);
        Some(compaction)
    }

    /// Manual compaction of every file at `level` overlapping `[begin, end]`.
    pub(crate) fn compact_range(
        &self,
        level: usize,
        begin: Option<&InternalKey>,
        end: Option<&InternalKey>,
    ) -> Option<Compaction> {
        let mut inner = self.inner.lock();
        let current = inner.current.clone();

        let mut inputs = current.overlapping_inputs(level, begin, end);
        if inputs.is_empty() {
            return None;
        }

        // Avoid one huge manual compaction for levels with disjoint files;
        // the caller loops over the remaining range.
        if level > 0 {
            let limit = expanded_compaction_byte_size_limit(&self.options);
            let mut total = 0;
            for (index, file) in inputs.iter().enumerate() {
                total += file.file_size;
                if total >= limit {
                    inputs.truncate(index + 1);
                    break;
                }
            }
        }

        let mut compaction = Compaction::new(&self.options, level, current);
        compaction.inputs[0] = inputs;
        self.setup_other_inputs(&mut inner, &mut compaction);
        Some(compaction)
    }

    fn setup_other_inputs(&self, inner: &mut VersionSetInner, compaction: &mut Compaction) {
        let current = compaction.input_version().clone();
        let level = compaction.level();

        let mut inputs0 = std::mem::take(&mut compaction.inputs[0]);
        add_boundary_inputs(current.files(level), &mut inputs0);
        let (smallest, largest) = key_range(&inputs0);

        let mut inputs1 =
            current.overlapping_inputs(level + 1, Some(&smallest), Some(&largest));
        add_boundary_inputs(current.files(level + 1), &mut inputs1);

        let (mut all_start, mut all_limit) = key_range_2(&inputs0, &inputs1);

        // Try to grow the level-L side with files already inside the
        // combined range, as long as that does not pull in more of L+1 and
        // stays under the expansion budget.
        if !inputs1.is_empty() {
            let mut expanded0 =
                current.overlapping_inputs(level, Some(&all_start), Some(&all_limit));
            add_boundary_inputs(current.files(level), &mut expanded0);
            let inputs1_size = total_file_size(&inputs1);
            let expanded0_size = total_file_size(&expanded0);
            if expanded0.len() > inputs0.len()
                && inputs1_size + expanded0_size < expanded_compaction_byte_size_limit(&self.options)
            {
                let (new_start, new_limit) = key_range(&expanded0);
                let mut expanded1 =
                    current.overlapping_inputs(level + 1, Some(&new_start), Some(&new_limit));
                add_boundary_inputs(current.files(level + 1), &mut expanded1);
                if expanded1.len() == inputs1.len() {
                    inputs0 = expanded0;
                    inputs1 = expanded1;
                    (all_start, all_limit) = key_range_2(&inputs0, &inputs1);
                }
            }
        }

        if level + 2 < NUM_LEVELS {
            compaction.grandparents =
                current.overlapping_inputs(level + 2, Some(&all_start), Some(&all_limit));
        }

        let (_, largest) = key_range(&inputs0);
        compaction.inputs[0] = inputs0;
        compaction.inputs[1] = inputs1;

        // The next size compaction at this level resumes past these inputs.
        inner.compact_pointer[level] = Some(largest.clone());
        compaction.edit.set_compact_pointer(level, largest);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ikey(user: &str, seq: u64) -> InternalKey {
        InternalKey::new(Bytes::from(user.to_owned()), seq, ValueType::Value)
    }

    fn file(number: u64, size: u64, smallest: &str, largest: &str) -> Arc<FileMetaData> {
        Arc::new(FileMetaData::for_test(
            number,
            size,
            ikey(smallest, 5),
            ikey(largest, 1),
        ))
    }

    fn version_with(levels: Vec<(usize, Vec<Arc<FileMetaData>>)>) -> Version {
        let mut version = Version::empty();
        for (level, files) in levels {
            version.files[level] = files;
        }
        version
    }

    #[test]
    fn find_file_binary_search() {
        let files = vec![file(1, 10, "b", "d"), file(2, 10, "f", "h")];
        assert_eq!(find_file(&files, &ikey("a", MAX_SEQUENCE)), 0);
        assert_eq!(find_file(&files, &ikey("c", MAX_SEQUENCE)), 0);
        assert_eq!(find_file(&files, &ikey("e", MAX_SEQUENCE)), 1);
        assert_eq!(find_file(&files, &ikey("z", MAX_SEQUENCE)), 2);
    }

    #[test]
    fn finalize_scores_level0_by_file_count() {
        let mut version = version_with(vec![(
            0,
            vec![
                file(1, 10, "a", "b"),
                file(2, 10, "c", "d"),
                file(3, 10, "e", "f"),
                file(4, 10, "g", "h"),
            ],
        )]);
        finalize(&mut version);
        assert_eq!(version.compaction_level, 0);
        assert!(version.compaction_score >= 1.0);
        assert!(version.needs_compaction());
    }

    #[test]
    fn finalize_scores_deeper_levels_by_bytes() {
        let mut version = version_with(vec![(
            1,
            vec![file(1, 11 * 1024 * 1024, "a", "m")],
        )]);
        finalize(&mut version);
        assert_eq!(version.compaction_level, 1);
        assert!(version.compaction_score > 1.0);
    }

    #[test]
    fn overlapping_inputs_expands_at_level0() {
        // 1 overlaps 2 which overlaps 3; asking for 1's range pulls all.
        let version = version_with(vec![(
            0,
            vec![
                file(1, 10, "a", "c"),
                file(2, 10, "b", "f"),
                file(3, 10, "e", "h"),
            ],
        )]);
        let inputs = version.overlapping_inputs(0, Some(&ikey("a", 9)), Some(&ikey("c", 9)));
        let numbers: Vec<u64> = inputs.iter().map(|f| f.number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[test]
    fn overlapping_inputs_is_tight_at_deeper_levels() {
        let version = version_with(vec![(
            2,
            vec![
                file(1, 10, "a", "c"),
                file(2, 10, "d", "f"),
                file(3, 10, "g", "i"),
            ],
        )]);
        let inputs = version.overlapping_inputs(2, Some(&ikey("e", 9)), Some(&ikey("h", 9)));
        let numbers: Vec<u64> = inputs.iter().map(|f| f.number).collect();
        assert_eq!(numbers, vec![2, 3]);

        let unbounded = version.overlapping_inputs(2, None, None);
        assert_eq!(unbounded.len(), 3);
    }

    #[test]
    fn boundary_inputs_pull_split_user_keys() {
        // File 2 starts with the same user key that file 1 ends with, at a
        // lower sequence; compacting file 1 alone would strand it.
        let f1 = Arc::new(FileMetaData::for_test(1, 10, ikey("a", 9), ikey("k", 9)));
        let f2 = Arc::new(FileMetaData::for_test(2, 10, ikey("k", 5), ikey("p", 2)));
        let f3 = Arc::new(FileMetaData::for_test(3, 10, ikey("q", 5), ikey("z", 2)));
        let level_files = vec![f1.clone(), f2.clone(), f3];

        let mut inputs = vec![f1];
        add_boundary_inputs(&level_files, &mut inputs);
        let numbers: Vec<u64> = inputs.iter().map(|f| f.number).collect();
        assert_eq!(numbers, vec![1, 2]);
    }

    #[test]
    fn builder_applies_adds_and_deletes() {
        let mut base = Version::empty();
        base.files[1] = vec![file(1, 10, "a", "c"), file(2, 10, "d", "f")];

        let mut edit = VersionEdit::default();
        edit.delete_file(1, 1);
        edit.add_file(1, 3, 10, ikey("g", 9), ikey("i", 1));

        let mut builder = Builder::new(Arc::new(base));
        builder.apply(&edit);
        let version = builder.save().unwrap();
        let numbers: Vec<u64> = version.files(1).iter().map(|f| f.number).collect();
        assert_eq!(numbers, vec![2, 3]);
    }

    #[test]
    fn builder_rejects_overlap_below_level0() {
        let mut edit = VersionEdit::default();
        edit.add_file(1, 1, 10, ikey("a", 9), ikey("m", 1));
        edit.add_file(1, 2, 10, ikey("m", 9), ikey("z", 1));

        let mut builder = Builder::new(Arc::new(Version::empty()));
        builder.apply(&edit);
        assert!(builder.save().is_err());
    }

    #[test]
    fn update_stats_arms_seek_compaction_once_credits_run_out() {
        let target = file(1, 10, "a", "c");
        let version = version_with(vec![(1, vec![target.clone()])]);
        target.allowed_seeks.store(2, Ordering::Relaxed);

        let charge = || SeekCharge {
            level: 1,
            file: target.clone(),
        };
        assert!(!version.update_stats(charge()));
        assert!(!version.needs_compaction());
        assert!(version.update_stats(charge()));
        assert!(version.needs_compaction());
        // Already armed; no re-trigger.
        assert!(!version.update_stats(charge()));
    }
}
