use std::sync::Arc;

use bytes::Bytes;

use crate::db::options::ReadOptions;
use crate::error::{Error, Result};
use crate::iterator::InternalIterator;
use crate::key::InternalKey;

use super::{Block, Table};

/// Forward iterator over one table, streaming block by block.
pub(crate) struct TableIterator {
    table: Arc<Table>,
    options: ReadOptions,
    /// Next block to load once the current one is exhausted.
    block_index: usize,
    block: Option<Arc<Block>>,
    entry_index: usize,
    current: Option<(InternalKey, Bytes)>,
    error: Option<Error>,
}

impl TableIterator {
    pub(crate) fn new(table: Arc<Table>, options: &ReadOptions) -> Self {
        Self {
            table,
            options: options.clone(),
            block_index: 0,
            block: None,
            entry_index: 0,
            current: None,
            error: None,
        }
    }

    fn load_block(&mut self, block_index: usize) -> bool {
        if block_index >= self.table.num_blocks() {
            self.block = None;
            self.current = None;
            return false;
        }
        match self.table.read_block(block_index, &self.options) {
            Ok(block) => {
                self.block_index = block_index + 1;
                self.block = Some(block);
                self.entry_index = 0;
                true
            }
            Err(err) => {
                self.error = Some(err);
                self.block = None;
                self.current = None;
                false
            }
        }
    }

    /// Refreshes `current` from the block cursor, walking into following
    /// blocks as needed.
    fn settle(&mut self) {
        loop {
            match &self.block {
                None => {
                    self.current = None;
                    return;
                }
                Some(block) => {
                    if let Some((key, value)) = block.get(self.entry_index) {
                        self.current = Some((key.clone(), value.clone()));
                        return;
                    }
                }
            }
            if !self.load_block(self.block_index) {
                return;
            }
        }
    }
}

impl InternalIterator for TableIterator {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn seek_to_first(&mut self) {
        self.error = None;
        if self.load_block(0) {
            self.settle();
        }
    }

    fn seek(&mut self, target: &InternalKey) {
        self.error = None;
        let Some(block_index) = self.table.find_block(target) else {
            self.block = None;
            self.current = None;
            return;
        };
        if !self.load_block(block_index) {
            return;
        }
        if let Some(block) = &self.block {
            self.entry_index = match block.binary_search_by(|(key, _)| key.cmp(target)) {
                Ok(index) | Err(index) => index,
            };
        }
        self.settle();
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        self.entry_index += 1;
        self.settle();
    }

    fn key(&self) -> &InternalKey {
        &self.current.as_ref().expect("iterator not positioned").0
    }

    fn value(&self) -> &Bytes {
        &self.current.as_ref().expect("iterator not positioned").1
    }

    fn status(&self) -> Result<()> {
        match &self.error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}
