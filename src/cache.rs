//! Shared caches for open tables and decoded data blocks.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;

use crate::db::options::ReadOptions;
use crate::error::Result;
use crate::filename::{legacy_table_file_name, table_file_name};
use crate::key::InternalKey;
use crate::sst::{Block, Table, TableIterator};

/// LRU of decoded data blocks keyed by `(file number, block offset)`.
///
/// File numbers are never reused, so stale entries for deleted tables age
/// out naturally.
pub(crate) struct BlockCache {
    blocks: Mutex<LruCache<(u64, u64), Arc<Block>>>,
}

impl BlockCache {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("nonzero cache capacity");
        Self {
            blocks: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub(crate) fn get(&self, file_number: u64, offset: u64) -> Option<Arc<Block>> {
        self.blocks.lock().get(&(file_number, offset)).cloned()
    }

    pub(crate) fn insert(&self, file_number: u64, offset: u64, block: Arc<Block>) {
        self.blocks.lock().put((file_number, offset), block);
    }
}

/// LRU of open tables keyed by file number; sized by `max_open_files`.
pub(crate) struct TableCache {
    dir: PathBuf,
    block_cache: Option<Arc<BlockCache>>,
    tables: Mutex<LruCache<u64, Arc<Table>>>,
}

impl TableCache {
    pub(crate) fn new(
        dir: impl AsRef<Path>,
        max_open_files: usize,
        block_cache: Option<Arc<BlockCache>>,
    ) -> Self {
        let capacity = NonZeroUsize::new(max_open_files.max(1)).expect("nonzero cache capacity");
        Self {
            dir: dir.as_ref().to_path_buf(),
            block_cache,
            tables: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub(crate) fn find_table(&self, file_number: u64) -> Result<Arc<Table>> {
        if let Some(table) = self.tables.lock().get(&file_number).cloned() {
            return Ok(table);
        }

        // Open outside the lock; a racing duplicate open is harmless.
        let path = table_file_name(&self.dir, file_number);
        let opened = match Table::open(&path, file_number, self.block_cache.clone()) {
            Ok(table) => table,
            Err(err) if !legacy_table_file_name(&self.dir, file_number).exists() => {
                return Err(err)
            }
            Err(_) => Table::open(
                legacy_table_file_name(&self.dir, file_number),
                file_number,
                self.block_cache.clone(),
            )?,
        };
        let table = Arc::new(opened);
        self.tables.lock().put(file_number, table.clone());
        Ok(table)
    }

    pub(crate) fn get(
        &self,
        options: &ReadOptions,
        file_number: u64,
        key: &InternalKey,
    ) -> Result<Option<(InternalKey, Bytes)>> {
        self.find_table(file_number)?.internal_get(options, key)
    }

    pub(crate) fn iter(&self, options: &ReadOptions, file_number: u64) -> Result<TableIterator> {
        Ok(TableIterator::new(self.find_table(file_number)?, options))
    }

    /// Drops the cached handle when a table file is deleted.
    pub(crate) fn evict(&self, file_number: u64) {
        self.tables.lock().pop(&file_number);
    }
}
