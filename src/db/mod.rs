//! The database engine.
//!
//! One coarse mutex guards the writer queue, memtable pointers, snapshot
//! list, pending compaction outputs, and background flags. WAL appends and
//! manifest appends happen with that mutex released, behind their own
//! uncontended locks. Writers group-commit: the queue front becomes the
//! leader, absorbs compatible followers, assigns sequence numbers, writes
//! the WAL and the memtable, then signals everyone it carried.
//!
//! A single background thread serves, in priority order: flushing the
//! immutable memtable to a level-0 table, then at most one table compaction
//! at a time. Background failures are sticky: writes fail from then on,
//! reads keep serving from consistent state.

pub(crate) mod iterator;
pub mod options;
pub(crate) mod snapshot;

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::batch::WriteBatch;
use crate::cache::{BlockCache, TableCache};
use crate::compaction::Compaction;
use crate::error::{Error, Result};
use crate::filename::{
    current_file_name, lock_file_name, parse_file_name, sync_dir, table_file_name, wal_file_name,
    FileType,
};
use crate::flock::FileLock;
use crate::infolog::InfoLog;
use crate::iterator::{InternalIterator, LevelConcatIterator, MergingIterator};
use crate::key::{InternalKey, ValueType, MAX_SEQUENCE};
use crate::log::{LogReader, LogWriter};
use crate::memtable::MemTable;
use crate::sst::TableBuilder;
use crate::version::edit::VersionEdit;
use crate::version::{
    bootstrap_db, VersionSet, L0_SLOWDOWN_WRITES_TRIGGER, L0_STOP_WRITES_TRIGGER, NUM_LEVELS,
};

pub use iterator::DbIterator;
pub use options::{DbOptions, ReadOptions, WriteOptions};
pub use snapshot::SnapshotId;

use snapshot::SnapshotList;

pub type Value = Bytes;

const PROPERTY_PREFIX: &str = "stratadb.";

/// Caps on how much a leader may absorb; small writes keep small latency.
const MAX_WRITE_GROUP_BYTES: usize = 1 << 20;
const SMALL_WRITE_BYTES: usize = 128 << 10;

struct WriterInner {
    batch: Option<WriteBatch>,
    done: bool,
    result: Option<Result<()>>,
}

/// One queued write. The condvar is bound to the engine mutex: a follower
/// sleeps until it is signalled done or it reaches the queue front.
struct Writer {
    sync: bool,
    cv: Condvar,
    inner: Mutex<WriterInner>,
}

impl Writer {
    fn new(batch: Option<WriteBatch>, sync: bool) -> Self {
        Self {
            sync,
            cv: Condvar::new(),
            inner: Mutex::new(WriterInner {
                batch,
                done: false,
                result: None,
            }),
        }
    }

    fn is_done(&self) -> bool {
        self.inner.lock().done
    }

    fn finished_result(&self) -> Option<Result<()>> {
        let inner = self.inner.lock();
        if inner.done {
            Some(inner.result.clone().unwrap_or(Ok(())))
        } else {
            None
        }
    }

    fn has_batch(&self) -> bool {
        self.inner.lock().batch.is_some()
    }

    fn batch_size(&self) -> Option<usize> {
        self.inner.lock().batch.as_ref().map(WriteBatch::approximate_size)
    }

    fn take_batch(&self) -> Option<WriteBatch> {
        self.inner.lock().batch.take()
    }

    fn complete(&self, result: Result<()>) {
        let mut inner = self.inner.lock();
        inner.done = true;
        inner.result = Some(result);
    }
}

#[derive(Clone)]
struct ManualCompaction {
    token: u64,
    level: usize,
    done: bool,
    begin: Option<InternalKey>,
    end: Option<InternalKey>,
}

#[derive(Debug, Default, Clone, Copy)]
struct CompactionStats {
    micros: u64,
    bytes_read: u64,
    bytes_written: u64,
}

impl CompactionStats {
    fn add(&mut self, elapsed: Duration, bytes_read: u64, bytes_written: u64) {
        self.micros += elapsed.as_micros() as u64;
        self.bytes_read += bytes_read;
        self.bytes_written += bytes_written;
    }
}

/// State guarded by the engine mutex.
struct DbState {
    mem: Arc<MemTable>,
    imm: Option<Arc<MemTable>>,
    /// Number of the WAL backing `mem`.
    log_number: u64,
    writers: VecDeque<Arc<Writer>>,
    snapshots: SnapshotList,
    /// Table files being written by an in-flight flush or compaction;
    /// protected from deletion until installed or abandoned.
    pending_outputs: HashSet<u64>,
    /// First background failure; sticky until reopen.
    bg_error: Option<Error>,
    bg_compaction_scheduled: bool,
    manual_compaction: Option<ManualCompaction>,
    stats: [CompactionStats; NUM_LEVELS],
}

pub(crate) struct DbInner {
    dir: PathBuf,
    options: DbOptions,
    info_log: InfoLog,
    table_cache: Arc<TableCache>,
    versions: VersionSet,
    /// Only the group-commit leader appends; rotation swaps the writer.
    wal: Mutex<LogWriter>,
    state: Mutex<DbState>,
    /// Signalled after every background cycle (flush done, compaction done,
    /// background error recorded).
    background_work_finished: Condvar,
    background_work_available: Condvar,
    /// Mirror of `state.imm.is_some()` for the compaction inner loop.
    has_imm: AtomicBool,
    shutting_down: AtomicBool,
    manual_tokens: AtomicU64,
    _lock: FileLock,
}

/// Handle to an open database. Dropping it drains background work and
/// releases the directory lock.
pub struct Db {
    inner: Arc<DbInner>,
    background: Option<JoinHandle<()>>,
}

impl Db {
    pub fn open(path: impl AsRef<Path>, options: DbOptions) -> Result<Db> {
        let dir = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let info_log = InfoLog::open(&dir)?;
        let lock = FileLock::acquire(&lock_file_name(&dir))?;

        if current_file_name(&dir).exists() {
            if options.error_if_exists {
                return Err(Error::invalid_argument(format!(
                    "{}: already exists",
                    dir.display()
                )));
            }
        } else {
            if !options.create_if_missing {
                return Err(Error::invalid_argument(format!(
                    "{}: does not exist",
                    dir.display()
                )));
            }
            info_log.log("creating new database");
            bootstrap_db(&dir)?;
        }

        let block_cache = (options.block_cache_bytes > 0).then(|| {
            let blocks = (options.block_cache_bytes / options.block_size.max(1)).max(16);
            Arc::new(BlockCache::new(blocks))
        });
        let table_cache = Arc::new(TableCache::new(
            &dir,
            options.max_open_files.saturating_sub(10).max(16),
            block_cache,
        ));
        let versions = VersionSet::recover(&dir, &options)?;

        // Directory audit: every table the manifest references must exist,
        // and WALs newer than the manifest's log number must be replayed.
        let min_log = versions.log_number();
        let prev_log = versions.prev_log_number();
        let mut present_tables = HashSet::new();
        let mut wal_numbers = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            match parse_file_name(name) {
                Some((FileType::Table, number)) => {
                    present_tables.insert(number);
                }
                Some((FileType::WalFile, number)) => {
                    if number >= min_log || number == prev_log {
                        wal_numbers.push(number);
                    }
                }
                _ => {}
            }
        }
        for number in versions.live_files() {
            if !present_tables.contains(&number) {
                return Err(Error::corruption(format!(
                    "missing table file {number:06}.ldb"
                )));
            }
        }

        wal_numbers.sort_unstable();
        let mut edit = VersionEdit::default();
        let mut max_sequence = 0;
        for number in &wal_numbers {
            versions.mark_file_number_used(*number);
            replay_wal(
                &dir,
                &options,
                &info_log,
                &versions,
                &table_cache,
                *number,
                &mut edit,
                &mut max_sequence,
            )?;
        }
        if max_sequence > versions.last_sequence() {
            versions.set_last_sequence(max_sequence);
        }

        // Fresh WAL for this incarnation; the recovered ones become
        // obsolete once the manifest records the new log number.
        let log_number = versions.new_file_number();
        let wal_file = std::fs::File::create(wal_file_name(&dir, log_number))?;
        sync_dir(&dir)?;
        edit.log_number = Some(log_number);
        edit.prev_log_number = Some(0);
        versions.log_and_apply(&mut edit)?;

        let inner = Arc::new(DbInner {
            dir,
            options,
            info_log,
            table_cache,
            versions,
            wal: Mutex::new(LogWriter::new(wal_file)),
            state: Mutex::new(DbState {
                mem: Arc::new(MemTable::new()),
                imm: None,
                log_number,
                writers: VecDeque::new(),
                snapshots: SnapshotList::new(),
                pending_outputs: HashSet::new(),
                bg_error: None,
                bg_compaction_scheduled: false,
                manual_compaction: None,
                stats: [CompactionStats::default(); NUM_LEVELS],
            }),
            background_work_finished: Condvar::new(),
            background_work_available: Condvar::new(),
            has_imm: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            manual_tokens: AtomicU64::new(1),
            _lock: lock,
        });

        {
            let mut state = inner.state.lock();
            inner.remove_obsolete_files(&mut state);
            inner.maybe_schedule_compaction(&mut state);
        }

        let background = {
            let inner = inner.clone();
            std::thread::Builder::new()
                .name("stratadb-background".to_owned())
                .spawn(move || background_main(&inner))?
        };

        Ok(Db {
            inner,
            background: Some(background),
        })
    }

    pub fn put(
        &self,
        options: WriteOptions,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
    ) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(options, batch)
    }

    pub fn delete(&self, options: WriteOptions, key: impl AsRef<[u8]>) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(options, batch)
    }

    pub fn write(&self, options: WriteOptions, batch: WriteBatch) -> Result<()> {
        self.inner.write(options, Some(batch))
    }

    pub fn get(&self, options: ReadOptions, key: impl AsRef<[u8]>) -> Result<Option<Value>> {
        self.inner.get(&options, key.as_ref())
    }

    /// Iterator over a consistent view of the whole database.
    pub fn iter(&self, options: ReadOptions) -> Result<DbIterator> {
        self.inner.new_iterator(&options)
    }

    /// Pins the current sequence for repeatable reads until released.
    pub fn create_snapshot(&self) -> SnapshotId {
        let mut state = self.inner.state.lock();
        let sequence = self.inner.versions.last_sequence();
        state.snapshots.create(sequence)
    }

    pub fn release_snapshot(&self, snapshot: SnapshotId) {
        self.inner.state.lock().snapshots.release(snapshot);
    }

    /// Compacts every level overlapping `[begin, end]` (`None` bounds cover
    /// the whole key space) down the tree, flushing the memtable first.
    pub fn compact_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<()> {
        let mut max_level_with_files = 1;
        {
            let _state = self.inner.state.lock();
            let version = self.inner.versions.current();
            for level in 1..NUM_LEVELS {
                if version.overlap_in_level(level, begin, end) {
                    max_level_with_files = level;
                }
            }
        }

        self.inner.force_flush_memtable()?;
        for level in 0..max_level_with_files {
            self.inner.compact_range_level(level, begin, end)?;
        }
        Ok(())
    }

    /// Engine introspection: `num-files-at-level<N>`, `stats`, `sstables`
    /// under the `stratadb.` prefix.
    pub fn property(&self, name: &str) -> Option<String> {
        let name = name.strip_prefix(PROPERTY_PREFIX)?;

        if let Some(level) = name.strip_prefix("num-files-at-level") {
            let level: usize = level.parse().ok()?;
            if level >= NUM_LEVELS {
                return None;
            }
            return Some(self.inner.versions.num_level_files(level).to_string());
        }

        match name {
            "stats" => {
                use std::fmt::Write;

                let state = self.inner.state.lock();
                let mut out = String::from(
                    "Level  Files Size(MB) Time(sec) Read(MB) Write(MB)\n\
                     --------------------------------------------------\n",
                );
                for level in 0..NUM_LEVELS {
                    let files = self.inner.versions.num_level_files(level);
                    let bytes = self.inner.versions.num_level_bytes(level);
                    let stats = &state.stats[level];
                    if files == 0 && stats.micros == 0 {
                        continue;
                    }
                    let _ = writeln!(
                        out,
                        "{:>5} {:>6} {:>8.0} {:>9.3} {:>8.3} {:>9.3}",
                        level,
                        files,
                        bytes as f64 / 1048576.0,
                        stats.micros as f64 / 1e6,
                        stats.bytes_read as f64 / 1048576.0,
                        stats.bytes_written as f64 / 1048576.0,
                    );
                }
                Some(out)
            }
            "sstables" => Some(self.inner.versions.current().debug_string()),
            _ => None,
        }
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        self.inner.shutting_down.store(true, Ordering::Release);
        {
            let _state = self.inner.state.lock();
            self.inner.background_work_available.notify_all();
        }
        if let Some(handle) = self.background.take() {
            let _ = handle.join();
        }
    }
}

impl DbInner {
    // ---- write path ----

    fn write(&self, options: WriteOptions, batch: Option<WriteBatch>) -> Result<()> {
        let writer = Arc::new(Writer::new(batch, options.sync));

        let mut state = self.state.lock();
        state.writers.push_back(writer.clone());
        while !writer.is_done() && !queue_front_is(&state, &writer) {
            writer.cv.wait(&mut state);
        }
        if let Some(result) = writer.finished_result() {
            return result;
        }

        // This writer leads the group.
        let force_rotation = !writer.has_batch();
        let mut group: Vec<Arc<Writer>> = vec![writer.clone()];
        let mut status = self.make_room_for_write(&mut state, force_rotation);

        if status.is_ok() && !force_rotation {
            let (mut group_batch, grouped) = self.build_batch_group(&mut state);
            group = grouped;

            let sequence = self.versions.last_sequence() + 1;
            group_batch.set_sequence(sequence);
            let count = u64::from(group_batch.count());
            let mem = state.mem.clone();

            // The queue front stays put, so no other leader can exist while
            // the mutex is released for the WAL and memtable writes.
            let result = MutexGuard::unlocked(&mut state, || {
                let mut wal = self.wal.lock();
                let mut result = wal.add_record(group_batch.contents());
                if result.is_ok() && options.sync {
                    result = wal.sync();
                }
                drop(wal);
                if result.is_ok() {
                    result = group_batch.insert_into(&mem);
                }
                result
            });

            if let Err(err) = &result {
                // A failed or half-synced WAL append leaves the log tail in
                // an unknown state; no further write may be acknowledged
                // against it.
                self.record_background_error(&mut state, err.clone());
            }
            if result.is_ok() {
                self.versions.set_last_sequence(sequence + count - 1);
            }
            status = result;
        }

        for member in &group {
            let _popped = state.writers.pop_front();
            debug_assert!(_popped.as_ref().is_some_and(|front| Arc::ptr_eq(front, member)));
            if !Arc::ptr_eq(member, &writer) {
                member.complete(status.clone());
                member.cv.notify_one();
            }
        }
        if let Some(front) = state.writers.front() {
            front.cv.notify_one();
        }
        status
    }

    /// Merges the leader's batch with a bounded prefix of compatible
    /// followers. Returns the combined batch and every writer it covers.
    fn build_batch_group(
        &self,
        state: &mut MutexGuard<'_, DbState>,
    ) -> (WriteBatch, Vec<Arc<Writer>>) {
        let leader = state.writers.front().expect("leader at queue front").clone();
        let mut result = leader.take_batch().expect("leader has a batch");

        let mut size = result.approximate_size();
        let max_size = if size <= SMALL_WRITE_BYTES {
            size + SMALL_WRITE_BYTES
        } else {
            MAX_WRITE_GROUP_BYTES
        };

        let mut group = vec![leader.clone()];
        let mut merged = false;
        let followers: Vec<Arc<Writer>> = state.writers.iter().skip(1).cloned().collect();
        for follower in followers {
            // Never promote a sync write into a non-sync group.
            if follower.sync && !leader.sync {
                break;
            }
            if let Some(batch_size) = follower.batch_size() {
                if size + batch_size > max_size {
                    break;
                }
                size += batch_size;
                let batch = follower.take_batch().expect("follower batch present");
                if !merged {
                    // Switch to a scratch batch so the leader's own batch
                    // stays as submitted.
                    let mut scratch = WriteBatch::new();
                    scratch.append(&result);
                    result = scratch;
                    merged = true;
                }
                result.append(&batch);
            }
            group.push(follower);
        }
        (result, group)
    }

    /// The rotation ladder run by the leader before it writes.
    fn make_room_for_write(
        &self,
        state: &mut MutexGuard<'_, DbState>,
        mut force: bool,
    ) -> Result<()> {
        let mut allow_delay = !force;
        loop {
            if let Some(err) = &state.bg_error {
                return Err(err.clone());
            }

            if allow_delay
                && self.versions.num_level_files(0) >= L0_SLOWDOWN_WRITES_TRIGGER
            {
                // Soft backpressure: give the compactor one millisecond,
                // once, instead of stalling this write outright.
                MutexGuard::unlocked(state, || {
                    std::thread::sleep(Duration::from_millis(1));
                });
                allow_delay = false;
                continue;
            }

            if !force
                && (state.mem.approximate_memory_usage() as usize)
                    <= self.options.write_buffer_size
            {
                return Ok(());
            }

            if state.imm.is_some() {
                self.info_log.log("current memtable full; waiting");
                self.background_work_finished.wait(state);
                continue;
            }

            if self.versions.num_level_files(0) >= L0_STOP_WRITES_TRIGGER {
                self.info_log.log("too many L0 files; waiting");
                self.background_work_finished.wait(state);
                continue;
            }

            // Rotate: new WAL, current memtable becomes immutable.
            let new_log_number = self.versions.new_file_number();
            let file = std::fs::File::create(wal_file_name(&self.dir, new_log_number))?;
            sync_dir(&self.dir)?;
            *self.wal.lock() = LogWriter::new(file);
            state.log_number = new_log_number;

            let full = std::mem::replace(&mut state.mem, Arc::new(MemTable::new()));
            state.imm = Some(full);
            self.has_imm.store(true, Ordering::Release);
            force = false;
            self.maybe_schedule_compaction(state);
        }
    }

    // ---- read path ----

    fn get(&self, options: &ReadOptions, user_key: &[u8]) -> Result<Option<Value>> {
        let (sequence, mem, imm, version) = {
            let state = self.state.lock();
            let sequence = match options.snapshot {
                Some(id) => state
                    .snapshots
                    .sequence_of(id)
                    .ok_or_else(|| Error::invalid_argument("unknown snapshot"))?,
                None => self.versions.last_sequence(),
            };
            (
                sequence,
                state.mem.clone(),
                state.imm.clone(),
                self.versions.current(),
            )
        };

        let mut charge = None;
        let outcome = if let Some(outcome) = mem.get(user_key, sequence) {
            outcome
        } else if let Some(outcome) = imm.as_ref().and_then(|imm| imm.get(user_key, sequence)) {
            outcome
        } else {
            let lookup = InternalKey::for_lookup(Bytes::copy_from_slice(user_key), sequence);
            let (outcome, seek_charge) = version.get(options, &lookup, &self.table_cache)?;
            charge = seek_charge;
            outcome.flatten()
        };

        if let Some(charge) = charge {
            if version.update_stats(charge) {
                let mut state = self.state.lock();
                self.maybe_schedule_compaction(&mut state);
            }
        }
        Ok(outcome)
    }

    fn new_iterator(self: &Arc<Self>, options: &ReadOptions) -> Result<DbIterator> {
        let (sequence, mem, imm, version) = {
            let state = self.state.lock();
            let sequence = match options.snapshot {
                Some(id) => state
                    .snapshots
                    .sequence_of(id)
                    .ok_or_else(|| Error::invalid_argument("unknown snapshot"))?,
                None => self.versions.last_sequence(),
            };
            (
                sequence,
                state.mem.clone(),
                state.imm.clone(),
                self.versions.current(),
            )
        };

        let mut children: Vec<Box<dyn InternalIterator>> = Vec::new();
        children.push(Box::new(mem.iter()));
        if let Some(imm) = &imm {
            children.push(Box::new(imm.iter()));
        }
        for file in version.files(0) {
            children.push(Box::new(self.table_cache.iter(options, file.number)?));
        }
        for level in 1..NUM_LEVELS {
            if !version.files(level).is_empty() {
                children.push(Box::new(LevelConcatIterator::new(
                    self.table_cache.clone(),
                    options,
                    version.files(level).to_vec(),
                )));
            }
        }

        Ok(DbIterator::new(
            self.clone(),
            version,
            mem,
            imm,
            MergingIterator::new(children),
            sequence,
        ))
    }

    pub(crate) fn schedule_compaction_from_read_path(&self) {
        let mut state = self.state.lock();
        self.maybe_schedule_compaction(&mut state);
    }

    // ---- background scheduling ----

    fn maybe_schedule_compaction(&self, state: &mut MutexGuard<'_, DbState>) {
        if state.bg_compaction_scheduled
            || self.shutting_down.load(Ordering::Acquire)
            || state.bg_error.is_some()
        {
            return;
        }
        let has_work = state.imm.is_some()
            || state.manual_compaction.is_some()
            || self.versions.needs_compaction();
        if has_work {
            state.bg_compaction_scheduled = true;
            self.background_work_available.notify_one();
        }
    }

    fn record_background_error(&self, state: &mut MutexGuard<'_, DbState>, err: Error) {
        if state.bg_error.is_none() {
            self.info_log.log(&format!("background error: {err}"));
            state.bg_error = Some(err);
            self.background_work_finished.notify_all();
        }
    }

    fn background_compaction(&self, state: &mut MutexGuard<'_, DbState>) {
        if state.imm.is_some() {
            self.compact_mem_table(state);
            return;
        }

        let is_manual = state.manual_compaction.is_some();
        let mut manual_done = false;
        let mut manual_end: Option<InternalKey> = None;
        let compaction = if let Some(manual) = state.manual_compaction.as_ref() {
            let compaction =
                self.versions
                    .compact_range(manual.level, manual.begin.as_ref(), manual.end.as_ref());
            manual_done = compaction.is_none();
            if let Some(compaction) = &compaction {
                manual_end = Some(
                    compaction
                        .input(0, compaction.num_input_files(0) - 1)
                        .largest
                        .clone(),
                );
            }
            compaction
        } else {
            self.versions.pick_compaction()
        };

        let mut status = Ok(());
        match compaction {
            None => {}
            Some(mut compaction) if !is_manual && compaction.is_trivial_move() => {
                // Move the file down a level without rewriting it.
                let file = compaction.input(0, 0).clone();
                let level = compaction.level();
                compaction.edit.delete_file(level, file.number);
                compaction.edit.add_file(
                    level + 1,
                    file.number,
                    file.file_size,
                    file.smallest.clone(),
                    file.largest.clone(),
                );
                let mut edit = std::mem::take(&mut compaction.edit);
                status =
                    MutexGuard::unlocked(state, || self.versions.log_and_apply(&mut edit));
                if let Err(err) = &status {
                    self.record_background_error(state, err.clone());
                }
                self.info_log.log(&format!(
                    "moved #{} ({} bytes) to level {}",
                    file.number,
                    file.file_size,
                    level + 1
                ));
            }
            Some(compaction) => {
                let smallest_snapshot =
                    state.snapshots.oldest(self.versions.last_sequence());
                let mut work = CompactionWork::new(compaction, smallest_snapshot);
                status = MutexGuard::unlocked(state, || self.do_compaction_work(&mut work));
                if let Err(err) = &status {
                    if !matches!(err, Error::ShuttingDown) {
                        self.record_background_error(state, err.clone());
                    }
                }
                self.cleanup_compaction(state, work, status.is_ok());
                self.remove_obsolete_files(state);
            }
        }

        if is_manual {
            if let Some(manual) = state.manual_compaction.as_mut() {
                if status.is_err() {
                    manual_done = true;
                }
                if manual_done {
                    manual.done = true;
                } else {
                    // Only part of the range was compacted; resume after the
                    // last key these inputs covered.
                    manual.begin = manual_end;
                }
            }
        }
    }

    // ---- memtable flush ----

    fn compact_mem_table(&self, state: &mut MutexGuard<'_, DbState>) {
        let Some(imm) = state.imm.clone() else { return };

        let mut edit = VersionEdit::default();
        if let Err(err) = self.write_level0_table(state, &imm, &mut edit) {
            self.record_background_error(state, err);
            return;
        }
        if self.shutting_down.load(Ordering::Acquire) {
            self.record_background_error(state, Error::ShuttingDown);
            return;
        }

        // The rotated WAL (and anything older) is no longer needed.
        edit.prev_log_number = Some(0);
        edit.log_number = Some(state.log_number);
        let result = MutexGuard::unlocked(state, || self.versions.log_and_apply(&mut edit));
        match result {
            Ok(()) => {
                state.imm = None;
                self.has_imm.store(false, Ordering::Release);
                self.remove_obsolete_files(state);
            }
            Err(err) => {
                self.record_background_error(state, err);
            }
        }
    }

    fn write_level0_table(
        &self,
        state: &mut MutexGuard<'_, DbState>,
        mem: &MemTable,
        edit: &mut VersionEdit,
    ) -> Result<()> {
        let start = Instant::now();
        let file_number = self.versions.new_file_number();
        state.pending_outputs.insert(file_number);
        self.info_log
            .log(&format!("level-0 table #{file_number}: started"));

        let mut iter = mem.iter();
        let built = MutexGuard::unlocked(state, || {
            build_table(
                &self.dir,
                &self.options,
                &self.table_cache,
                file_number,
                &mut iter,
            )
        });

        state.pending_outputs.remove(&file_number);
        match built? {
            Some(built) => {
                self.info_log.log(&format!(
                    "level-0 table #{file_number}: {} bytes",
                    built.file_size
                ));
                edit.add_file(
                    0,
                    file_number,
                    built.file_size,
                    built.smallest,
                    built.largest,
                );
                state.stats[0].add(start.elapsed(), 0, built.file_size);
            }
            None => {
                self.info_log
                    .log(&format!("level-0 table #{file_number}: empty memtable"));
            }
        }
        Ok(())
    }

    fn force_flush_memtable(&self) -> Result<()> {
        // An empty write forces rotation, then the background thread owns
        // the flush.
        self.write(WriteOptions::default(), None)?;

        let mut state = self.state.lock();
        while state.imm.is_some() && state.bg_error.is_none() {
            self.background_work_finished.wait(&mut state);
        }
        match &state.bg_error {
            Some(err) if state.imm.is_some() => Err(err.clone()),
            _ => Ok(()),
        }
    }

    // ---- table compaction ----

    fn compact_range_level(
        &self,
        level: usize,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<()> {
        let token = self.manual_tokens.fetch_add(1, Ordering::Relaxed);
        let manual = ManualCompaction {
            token,
            level,
            done: false,
            begin: begin
                .map(|key| InternalKey::for_lookup(Bytes::copy_from_slice(key), MAX_SEQUENCE)),
            // Sorts after every entry of the end key.
            end: end.map(|key| {
                InternalKey::new(Bytes::copy_from_slice(key), 0, ValueType::Deletion)
            }),
        };

        let mut state = self.state.lock();
        loop {
            if self.shutting_down.load(Ordering::Acquire) {
                self.release_manual(&mut state, token);
                return Err(Error::ShuttingDown);
            }
            if let Some(err) = state.bg_error.clone() {
                self.release_manual(&mut state, token);
                return Err(err);
            }

            match &state.manual_compaction {
                Some(current) if current.token == token => {
                    if current.done {
                        state.manual_compaction = None;
                        // Wake any compact_range call queued behind this one.
                        self.background_work_finished.notify_all();
                        return Ok(());
                    }
                    self.background_work_finished.wait(&mut state);
                }
                Some(_) => {
                    // Another manual compaction is running; queue behind it.
                    self.background_work_finished.wait(&mut state);
                }
                None => {
                    state.manual_compaction = Some(manual.clone());
                    self.maybe_schedule_compaction(&mut state);
                }
            }
        }
    }

    fn release_manual(&self, state: &mut MutexGuard<'_, DbState>, token: u64) {
        if state
            .manual_compaction
            .as_ref()
            .is_some_and(|manual| manual.token == token)
        {
            state.manual_compaction = None;
            self.background_work_finished.notify_all();
        }
    }

    fn make_input_iterator(&self, compaction: &Compaction) -> Result<MergingIterator> {
        let options = ReadOptions {
            verify_checksums: self.options.paranoid_checks,
            fill_cache: false,
            snapshot: None,
        };

        let mut children: Vec<Box<dyn InternalIterator>> = Vec::new();
        for which in 0..2 {
            if compaction.inputs[which].is_empty() {
                continue;
            }
            if compaction.level() + which == 0 {
                for file in &compaction.inputs[which] {
                    children.push(Box::new(self.table_cache.iter(&options, file.number)?));
                }
            } else {
                children.push(Box::new(LevelConcatIterator::new(
                    self.table_cache.clone(),
                    &options,
                    compaction.inputs[which].clone(),
                )));
            }
        }
        Ok(MergingIterator::new(children))
    }

    /// The merge loop. Runs without the engine mutex; takes it briefly to
    /// allocate output files and to flush the immutable memtable when one
    /// appears mid-compaction.
    fn do_compaction_work(&self, work: &mut CompactionWork) -> Result<()> {
        let start = Instant::now();
        self.info_log.log(&format!(
            "compacting {}@{} + {}@{} files",
            work.compaction.num_input_files(0),
            work.compaction.level(),
            work.compaction.num_input_files(1),
            work.compaction.output_level(),
        ));
        debug_assert!(work.compaction.num_input_files(0) > 0);

        let mut input = self.make_input_iterator(&work.compaction)?;
        input.seek_to_first();

        let mut current_user_key: Option<Bytes> = None;
        // Sentinel above every real sequence: the first entry of each user
        // key is never dropped by the shadowing rule.
        let mut last_sequence_for_key = MAX_SEQUENCE;

        while input.valid() {
            // Flushing the memtable takes priority over the merge.
            if self.has_imm.load(Ordering::Acquire) {
                let mut state = self.state.lock();
                if state.imm.is_some() {
                    self.compact_mem_table(&mut state);
                    self.background_work_finished.notify_all();
                }
            }
            if self.shutting_down.load(Ordering::Acquire) {
                return Err(Error::ShuttingDown);
            }

            let key = input.key().clone();
            if work.builder.is_some() && work.compaction.should_stop_before(&key) {
                self.finish_compaction_output(work)?;
            }

            let same_user_key = current_user_key
                .as_ref()
                .is_some_and(|current| current == key.user_key());
            if !same_user_key {
                current_user_key = Some(key.user_key().clone());
                last_sequence_for_key = MAX_SEQUENCE;
            }

            let drop_entry = if last_sequence_for_key <= work.smallest_snapshot {
                // A newer entry for this user key is already visible at the
                // oldest snapshot; this one is shadowed everywhere.
                true
            } else {
                key.value_type() == ValueType::Deletion
                    && key.sequence() <= work.smallest_snapshot
                    && work.compaction.is_base_level_for_key(key.user_key())
            };
            last_sequence_for_key = key.sequence();

            if !drop_entry {
                if work.builder.is_none() {
                    self.open_compaction_output(work)?;
                }
                let output = work.outputs.last_mut().expect("open output present");
                if output.smallest.is_none() {
                    output.smallest = Some(key.clone());
                }
                output.largest = Some(key.clone());

                let builder = work.builder.as_mut().expect("open builder present");
                builder.add(&key, input.value())?;
                if builder.estimated_size() >= work.compaction.max_output_file_size() {
                    self.finish_compaction_output(work)?;
                }
            }

            input.next();
        }

        if self.shutting_down.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }
        if work.builder.is_some() {
            self.finish_compaction_output(work)?;
        }
        input.status()?;
        drop(input);

        self.install_compaction_results(work, start.elapsed())
    }

    fn open_compaction_output(&self, work: &mut CompactionWork) -> Result<()> {
        let file_number = {
            let mut state = self.state.lock();
            let number = self.versions.new_file_number();
            state.pending_outputs.insert(number);
            number
        };
        // Record the output before touching the filesystem so cleanup can
        // release the number and remove the file on any failure.
        work.outputs.push(CompactionOutput {
            number: file_number,
            file_size: 0,
            smallest: None,
            largest: None,
        });
        let builder = TableBuilder::create(
            table_file_name(&self.dir, file_number),
            self.options.block_size,
            self.options.bloom_bits_per_key,
        )?;
        work.builder = Some(builder);
        Ok(())
    }

    fn finish_compaction_output(&self, work: &mut CompactionWork) -> Result<()> {
        let builder = work.builder.take().expect("open builder present");
        let output = work.outputs.last_mut().expect("open output present");

        let entries = builder.num_entries();
        let built = builder.finish()?;
        output.file_size = built.file_size;
        output.smallest = Some(built.smallest);
        output.largest = Some(built.largest);
        work.total_bytes += built.file_size;

        // Verify the table is usable before committing to it.
        self.table_cache.find_table(output.number)?;
        self.info_log.log(&format!(
            "generated table #{}: {} keys, {} bytes",
            output.number, entries, built.file_size
        ));
        Ok(())
    }

    fn install_compaction_results(
        &self,
        work: &mut CompactionWork,
        elapsed: Duration,
    ) -> Result<()> {
        self.info_log.log(&format!(
            "compacted {}@{} + {}@{} files => {} bytes",
            work.compaction.num_input_files(0),
            work.compaction.level(),
            work.compaction.num_input_files(1),
            work.compaction.output_level(),
            work.total_bytes,
        ));

        let bytes_read = work.compaction.total_input_bytes();
        let level = work.compaction.level();
        work.compaction.add_input_deletions();
        for output in &work.outputs {
            let (Some(smallest), Some(largest)) =
                (output.smallest.clone(), output.largest.clone())
            else {
                continue;
            };
            work.compaction
                .edit
                .add_file(level + 1, output.number, output.file_size, smallest, largest);
        }

        let mut edit = std::mem::take(&mut work.compaction.edit);
        let result = self.versions.log_and_apply(&mut edit);

        let mut state = self.state.lock();
        state.stats[level + 1].add(elapsed, bytes_read, work.total_bytes);
        result
    }

    fn cleanup_compaction(
        &self,
        state: &mut MutexGuard<'_, DbState>,
        mut work: CompactionWork,
        installed: bool,
    ) {
        // An unfinished builder means the last output is a partial file.
        work.builder.take();
        for output in &work.outputs {
            state.pending_outputs.remove(&output.number);
        }
        if !installed {
            // Nothing references the outputs; delete them now rather than
            // waiting for a GC pass that a sticky error would suppress.
            MutexGuard::unlocked(state, || {
                for output in &work.outputs {
                    self.table_cache.evict(output.number);
                    let _ = std::fs::remove_file(table_file_name(&self.dir, output.number));
                }
            });
        }
    }

    // ---- file GC ----

    /// Deletes files no live version references: old WALs and manifests,
    /// tables dropped by compactions, stale temp files.
    fn remove_obsolete_files(&self, state: &mut MutexGuard<'_, DbState>) {
        if state.bg_error.is_some() {
            // After a failed install the reachable file set is uncertain.
            return;
        }

        let mut live = self.versions.live_files();
        live.extend(state.pending_outputs.iter().copied());
        let log_number = self.versions.log_number();
        let prev_log_number = self.versions.prev_log_number();
        let manifest_number = self.versions.manifest_file_number();

        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return;
        };
        let mut to_delete: Vec<(String, FileType, u64)> = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some((kind, number)) = parse_file_name(name) else {
                continue;
            };
            let keep = match kind {
                FileType::WalFile => number >= log_number || number == prev_log_number,
                FileType::Manifest => number >= manifest_number,
                FileType::Table => live.contains(&number),
                FileType::Temp => live.contains(&number),
                FileType::Current | FileType::Lock | FileType::InfoLog => true,
            };
            if !keep {
                to_delete.push((name.to_owned(), kind, number));
            }
        }

        // The deletions themselves do not need the engine mutex.
        MutexGuard::unlocked(state, || {
            for (name, kind, number) in to_delete {
                if kind == FileType::Table {
                    self.table_cache.evict(number);
                }
                self.info_log.log(&format!("deleting {name}"));
                let _ = std::fs::remove_file(self.dir.join(&name));
            }
        });
    }
}

fn queue_front_is(state: &DbState, writer: &Arc<Writer>) -> bool {
    state
        .writers
        .front()
        .is_some_and(|front| Arc::ptr_eq(front, writer))
}

fn background_main(inner: &DbInner) {
    let mut state = inner.state.lock();
    loop {
        while !state.bg_compaction_scheduled && !inner.shutting_down.load(Ordering::Acquire) {
            inner.background_work_available.wait(&mut state);
        }
        if inner.shutting_down.load(Ordering::Acquire) {
            break;
        }

        inner.background_compaction(&mut state);
        state.bg_compaction_scheduled = false;

        // The previous cycle may have produced more work (for instance a
        // flush that pushed level 0 over its trigger).
        inner.maybe_schedule_compaction(&mut state);
        inner.background_work_finished.notify_all();
    }
    state.bg_compaction_scheduled = false;
    drop(state);
    inner.background_work_finished.notify_all();
}

struct CompactionOutput {
    number: u64,
    file_size: u64,
    smallest: Option<InternalKey>,
    largest: Option<InternalKey>,
}

struct CompactionWork {
    compaction: Compaction,
    /// Entries at or below this sequence and shadowed by a newer visible
    /// entry can be dropped; nothing can ever read them again.
    smallest_snapshot: u64,
    outputs: Vec<CompactionOutput>,
    builder: Option<TableBuilder>,
    total_bytes: u64,
}

impl CompactionWork {
    fn new(compaction: Compaction, smallest_snapshot: u64) -> Self {
        Self {
            compaction,
            smallest_snapshot,
            outputs: Vec::new(),
            builder: None,
            total_bytes: 0,
        }
    }
}

/// Replays one recovered WAL into fresh level-0 tables, spilling whenever
/// the reconstruction memtable exceeds the write buffer. Damaged records
/// abort recovery under `paranoid_checks` and are logged and skipped
/// otherwise.
#[allow(clippy::too_many_arguments)]
fn replay_wal(
    dir: &Path,
    options: &DbOptions,
    info_log: &InfoLog,
    versions: &VersionSet,
    table_cache: &TableCache,
    number: u64,
    edit: &mut VersionEdit,
    max_sequence: &mut u64,
) -> Result<()> {
    info_log.log(&format!("recovering log #{number}"));
    let file = std::fs::File::open(wal_file_name(dir, number))?;
    let mut reader = LogReader::new(file, true);
    let mut mem = MemTable::new();

    let spill = |mem: &MemTable, edit: &mut VersionEdit| -> Result<()> {
        let file_number = versions.new_file_number();
        let mut iter = mem.iter();
        if let Some(built) = build_table(dir, options, table_cache, file_number, &mut iter)? {
            edit.add_file(0, file_number, built.file_size, built.smallest, built.largest);
        }
        Ok(())
    };

    loop {
        let record = match reader.read_record() {
            Ok(Some(record)) => record,
            Ok(None) => break,
            Err(err) => {
                if options.paranoid_checks {
                    return Err(err);
                }
                info_log.log(&format!("log #{number}: dropping damaged record: {err}"));
                continue;
            }
        };
        if record.len() < 12 {
            let err = Error::corruption("log record too small");
            if options.paranoid_checks {
                return Err(err);
            }
            info_log.log(&format!("log #{number}: {err}"));
            continue;
        }

        let batch = WriteBatch::from_contents(&record)?;
        batch.insert_into(&mem)?;
        let last_sequence = (batch.sequence() + u64::from(batch.count())).saturating_sub(1);
        if last_sequence > *max_sequence {
            *max_sequence = last_sequence;
        }

        if mem.approximate_memory_usage() > options.write_buffer_size as u64 {
            spill(&mem, edit)?;
            mem = MemTable::new();
        }
    }

    // Final contents become a level-0 table too: every open starts from a
    // fresh WAL and an empty memtable.
    if !mem.is_empty() {
        spill(&mem, edit)?;
    }
    Ok(())
}

/// Builds a table file from `iter`'s contents. Returns `None` (and writes
/// nothing durable) for an empty iterator. On error the partial file is
/// removed.
fn build_table(
    dir: &Path,
    options: &DbOptions,
    table_cache: &TableCache,
    file_number: u64,
    iter: &mut dyn InternalIterator,
) -> Result<Option<crate::sst::BuiltTable>> {
    iter.seek_to_first();
    if !iter.valid() {
        return Ok(None);
    }

    let path = table_file_name(dir, file_number);
    let result = (|| {
        let mut builder =
            TableBuilder::create(&path, options.block_size, options.bloom_bits_per_key)?;
        while iter.valid() {
            builder.add(iter.key(), iter.value())?;
            iter.next();
        }
        iter.status()?;
        let built = builder.finish()?;
        sync_dir(dir)?;
        // Confirm the freshly written table opens and agrees about its
        // contents before anything references it.
        let table = table_cache.find_table(file_number)?;
        if table.properties().num_entries != built.num_entries {
            return Err(Error::corruption(format!(
                "table {file_number:06} entry count mismatch after build"
            )));
        }
        Ok(Some(built))
    })();

    if result.is_err() {
        table_cache.evict(file_number);
        let _ = std::fs::remove_file(&path);
    }
    result
}
