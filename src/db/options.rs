use crate::db::snapshot::SnapshotId;

#[derive(Debug, Clone)]
pub struct DbOptions {
    /// Create the database directory and descriptor when missing.
    pub create_if_missing: bool,
    /// Fail `open` when a database already exists at the path.
    pub error_if_exists: bool,
    /// Treat recoverable log-tail corruption as fatal instead of truncating.
    pub paranoid_checks: bool,
    /// Bytes buffered in the mutable memtable before rotation.
    pub write_buffer_size: usize,
    /// Upper bound on cached open table files.
    pub max_open_files: usize,
    /// Uncompressed payload size at which a table block is cut.
    pub block_size: usize,
    /// Budget for the shared decoded-block cache.
    pub block_cache_bytes: usize,
    /// Size at which compaction output files are split.
    pub max_file_size: u64,
    /// Bloom bits per key in table filter blocks; `None` disables filters.
    pub bloom_bits_per_key: Option<usize>,
}

impl Default for DbOptions {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            error_if_exists: false,
            paranoid_checks: false,
            write_buffer_size: 4 * 1024 * 1024,
            max_open_files: 1000,
            block_size: 4 * 1024,
            block_cache_bytes: 8 * 1024 * 1024,
            max_file_size: 2 * 1024 * 1024,
            bloom_bits_per_key: Some(10),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// Fsync the WAL before acknowledging the write.
    pub sync: bool,
}

#[derive(Debug, Clone)]
pub struct ReadOptions {
    /// Verify table block checksums on every read.
    pub verify_checksums: bool,
    /// Admit blocks read on behalf of this operation into the block cache.
    pub fill_cache: bool,
    /// Read as of this snapshot instead of the latest sequence.
    pub snapshot: Option<SnapshotId>,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            verify_checksums: false,
            fill_cache: true,
            snapshot: None,
        }
    }
}
