//! Immutable sorted table files.
//!
//! File layout:
//! ```text
//! [data blocks...]
//! [filter block]      optional whole-file bloom filter
//! [index block]       bincode separators -> block handles
//! [properties block]  bincode table properties
//! [footer | magic]
//! ```
//!
//! Data block format:
//! ```text
//! [count u32]
//! repeated count times:
//!   [varint32 key_len][internal key][varint32 val_len][value]
//! [crc32c u32]
//! ```
//!
//! Index entries map a shortened separator key (>= every key in the block,
//! < every key in the next) to the block's handle.

pub(crate) mod bloom;
mod iter;

pub(crate) use iter::TableIterator;

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use memmap2::Mmap;
use serde::{Deserialize, Serialize};

use crate::cache::BlockCache;
use crate::coding::{get_length_prefixed_slice, put_length_prefixed_slice};
use crate::db::options::ReadOptions;
use crate::error::{Error, Result};
use crate::key::{internal_separator, internal_successor, BytewiseComparator, InternalKey};
use bloom::BloomPolicy;

const MAGIC: &[u8; 8] = b"STRATDB1";
const FOOTER_SIZE: usize = 3 * (8 + 4);
const BLOCK_TRAILER_SIZE: usize = 4;

/// Decoded data block, shared through the block cache.
pub(crate) type Block = Vec<(InternalKey, Bytes)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct BlockHandle {
    offset: u64,
    len: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawIndexEntry {
    key: Vec<u8>,
    handle: BlockHandle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct TableProperties {
    pub num_entries: u64,
    pub data_bytes: u64,
}

struct Footer {
    filter: BlockHandle,
    index: BlockHandle,
    props: BlockHandle,
}

/// Streaming builder; keys must arrive in internal-key order.
pub(crate) struct TableBuilder {
    file: File,
    path: PathBuf,
    block_size: usize,
    cmp: BytewiseComparator,
    bloom: Option<BloomPolicy>,

    buf: Vec<u8>,
    entries_in_block: u32,
    offset: u64,
    index: Vec<RawIndexEntry>,
    /// Handle of the last flushed block, waiting for the next key so its
    /// index separator can be shortened.
    pending_index: Option<(InternalKey, BlockHandle)>,
    filter_keys: Vec<Bytes>,

    smallest: Option<InternalKey>,
    last_key: Option<InternalKey>,
    num_entries: u64,
    data_bytes: u64,
}

/// Metadata of a finished table, consumed by the version machinery.
#[derive(Debug, Clone)]
pub(crate) struct BuiltTable {
    pub file_size: u64,
    pub smallest: InternalKey,
    pub largest: InternalKey,
    pub num_entries: u64,
}

impl TableBuilder {
    pub(crate) fn create(
        path: impl AsRef<Path>,
        block_size: usize,
        bloom_bits_per_key: Option<usize>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&path)?;
        Ok(Self {
            file,
            path,
            block_size,
            cmp: BytewiseComparator,
            bloom: bloom_bits_per_key.map(BloomPolicy::new),
            buf: Vec::with_capacity(block_size + 256),
            entries_in_block: 0,
            offset: 0,
            index: Vec::new(),
            pending_index: None,
            filter_keys: Vec::new(),
            smallest: None,
            last_key: None,
            num_entries: 0,
            data_bytes: 0,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn add(&mut self, key: &InternalKey, value: &[u8]) -> Result<()> {
        if let Some(last) = &self.last_key {
            if key <= last {
                return Err(Error::corruption("table keys added out of order"));
            }
        }

        if let Some((block_last, handle)) = self.pending_index.take() {
            let separator = internal_separator(&self.cmp, &block_last, key);
            self.index.push(RawIndexEntry {
                key: separator.encode(),
                handle,
            });
        }

        if self.smallest.is_none() {
            self.smallest = Some(key.clone());
        }
        self.last_key = Some(key.clone());
        self.num_entries += 1;
        if self.bloom.is_some() {
            self.filter_keys.push(key.user_key().clone());
        }

        if self.entries_in_block == 0 {
            self.buf.extend_from_slice(&0u32.to_le_bytes());
        }
        put_length_prefixed_slice(&mut self.buf, &key.encode());
        put_length_prefixed_slice(&mut self.buf, value);
        self.entries_in_block += 1;
        let count = self.entries_in_block;
        self.buf[0..4].copy_from_slice(&count.to_le_bytes());

        if self.buf.len() >= self.block_size {
            self.flush_block()?;
        }
        Ok(())
    }

    pub(crate) fn num_entries(&self) -> u64 {
        self.num_entries
    }

    /// Bytes this table will occupy if finished now; used to split
    /// compaction outputs.
    pub(crate) fn estimated_size(&self) -> u64 {
        self.offset + self.buf.len() as u64
    }

    pub(crate) fn finish(mut self) -> Result<BuiltTable> {
        if self.entries_in_block > 0 {
            self.flush_block()?;
        }
        let (smallest, last_key) = match (self.smallest.clone(), self.last_key.clone()) {
            (Some(s), Some(l)) => (s, l),
            _ => return Err(Error::corruption("cannot finish an empty table")),
        };
        if let Some((block_last, handle)) = self.pending_index.take() {
            let successor = internal_successor(&self.cmp, &block_last);
            self.index.push(RawIndexEntry {
                key: successor.encode(),
                handle,
            });
        }

        let filter = match &self.bloom {
            Some(policy) => {
                let bits = policy.create_filter(&self.filter_keys);
                self.write_raw(&bits)?
            }
            None => BlockHandle {
                offset: self.offset,
                len: 0,
            },
        };

        let index_bytes = bincode::serialize(&self.index)
            .map_err(|_| Error::corruption("serialize table index"))?;
        let index = self.write_raw(&index_bytes)?;

        let props = TableProperties {
            num_entries: self.num_entries,
            data_bytes: self.data_bytes,
        };
        let props_bytes = bincode::serialize(&props)
            .map_err(|_| Error::corruption("serialize table properties"))?;
        let props = self.write_raw(&props_bytes)?;

        let footer = Footer {
            filter,
            index,
            props,
        };
        let mut tail = Vec::with_capacity(FOOTER_SIZE + MAGIC.len());
        footer.encode_into(&mut tail);
        tail.extend_from_slice(MAGIC);
        self.file.write_all(&tail)?;
        self.offset += tail.len() as u64;

        self.file.sync_data()?;
        Ok(BuiltTable {
            file_size: self.offset,
            smallest,
            largest: last_key,
            num_entries: self.num_entries,
        })
    }

    fn flush_block(&mut self) -> Result<()> {
        let crc = crc32c::crc32c(&self.buf);
        self.buf.extend_from_slice(&crc.to_le_bytes());

        let handle = BlockHandle {
            offset: self.offset,
            len: self.buf.len() as u32,
        };
        self.file.write_all(&self.buf)?;
        self.offset += self.buf.len() as u64;
        self.data_bytes += self.buf.len() as u64;

        let last = self
            .last_key
            .clone()
            .ok_or_else(|| Error::corruption("flushed block without keys"))?;
        self.pending_index = Some((last, handle));

        self.buf.clear();
        self.entries_in_block = 0;
        Ok(())
    }

    fn write_raw(&mut self, data: &[u8]) -> Result<BlockHandle> {
        let handle = BlockHandle {
            offset: self.offset,
            len: data.len() as u32,
        };
        self.file.write_all(data)?;
        self.offset += data.len() as u64;
        Ok(handle)
    }
}

impl Footer {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        for handle in [self.filter, self.index, self.props] {
            buf.extend_from_slice(&handle.offset.to_le_bytes());
            buf.extend_from_slice(&handle.len.to_le_bytes());
        }
    }

    fn decode(input: &[u8]) -> Result<Self> {
        if input.len() != FOOTER_SIZE {
            return Err(Error::corruption("bad table footer size"));
        }
        let mut handles = [BlockHandle { offset: 0, len: 0 }; 3];
        for (idx, handle) in handles.iter_mut().enumerate() {
            let base = idx * 12;
            handle.offset = u64::from_le_bytes(input[base..base + 8].try_into().unwrap());
            handle.len = u32::from_le_bytes(input[base + 8..base + 12].try_into().unwrap());
        }
        Ok(Self {
            filter: handles[0],
            index: handles[1],
            props: handles[2],
        })
    }
}

/// Open table backed by a memory map.
pub(crate) struct Table {
    file_number: u64,
    mmap: Mmap,
    index: Vec<(InternalKey, BlockHandle)>,
    filter: Option<Vec<u8>>,
    props: TableProperties,
    block_cache: Option<Arc<BlockCache>>,
}

impl Table {
    pub(crate) fn open(
        path: impl AsRef<Path>,
        file_number: u64,
        block_cache: Option<Arc<BlockCache>>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        if mmap.len() < FOOTER_SIZE + MAGIC.len() {
            return Err(Error::corruption("table file too small"));
        }
        if &mmap[mmap.len() - MAGIC.len()..] != MAGIC {
            return Err(Error::corruption("bad table magic"));
        }

        let footer_offset = mmap.len() - MAGIC.len() - FOOTER_SIZE;
        let footer = Footer::decode(&mmap[footer_offset..footer_offset + FOOTER_SIZE])?;

        let index_raw = slice_for(&mmap, footer.index)?;
        let raw_entries: Vec<RawIndexEntry> =
            bincode::deserialize(index_raw).map_err(|_| Error::corruption("table index decode"))?;
        let mut index = Vec::with_capacity(raw_entries.len());
        for entry in raw_entries {
            index.push((InternalKey::decode(&entry.key)?, entry.handle));
        }

        let filter = if footer.filter.len > 0 {
            Some(slice_for(&mmap, footer.filter)?.to_vec())
        } else {
            None
        };

        let props_raw = slice_for(&mmap, footer.props)?;
        let props: TableProperties = bincode::deserialize(props_raw)
            .map_err(|_| Error::corruption("table properties decode"))?;

        Ok(Self {
            file_number,
            mmap,
            index,
            filter,
            props,
            block_cache,
        })
    }

    pub(crate) fn properties(&self) -> &TableProperties {
        &self.props
    }

    /// Returns the first entry at or after `key` within the candidate
    /// block, or `None` when the table cannot contain the key. The caller
    /// decides user-key equality and visibility.
    pub(crate) fn internal_get(
        &self,
        options: &ReadOptions,
        key: &InternalKey,
    ) -> Result<Option<(InternalKey, Bytes)>> {
        if let Some(filter) = &self.filter {
            if !BloomPolicy::key_may_match(filter, key.user_key()) {
                return Ok(None);
            }
        }

        let Some(block_index) = self.find_block(key) else {
            return Ok(None);
        };
        let block = self.read_block(block_index, options)?;
        let pos = match block.binary_search_by(|(entry_key, _)| entry_key.cmp(key)) {
            Ok(pos) | Err(pos) => pos,
        };
        match block.get(pos) {
            Some((entry_key, value)) => Ok(Some((entry_key.clone(), value.clone()))),
            // The separator may overshoot the block's last key; the next
            // block cannot contain `key.user_key` either, or the index
            // would have pointed there.
            None => Ok(None),
        }
    }

    /// Index position of the first block whose separator is >= `key`.
    fn find_block(&self, key: &InternalKey) -> Option<usize> {
        let pos = self
            .index
            .partition_point(|(separator, _)| separator < key);
        (pos < self.index.len()).then_some(pos)
    }

    fn read_block(&self, block_index: usize, options: &ReadOptions) -> Result<Arc<Block>> {
        let handle = self.index[block_index].1;

        if let Some(cache) = &self.block_cache {
            if let Some(block) = cache.get(self.file_number, handle.offset) {
                return Ok(block);
            }
        }

        let block = Arc::new(self.decode_block(handle, options.verify_checksums)?);
        if options.fill_cache {
            if let Some(cache) = &self.block_cache {
                cache.insert(self.file_number, handle.offset, block.clone());
            }
        }
        Ok(block)
    }

    fn decode_block(&self, handle: BlockHandle, verify: bool) -> Result<Block> {
        let raw = slice_for(&self.mmap, handle)?;
        if raw.len() < 4 + BLOCK_TRAILER_SIZE {
            return Err(Error::corruption("table block too small"));
        }

        let payload = &raw[..raw.len() - BLOCK_TRAILER_SIZE];
        if verify {
            let stored = u32::from_le_bytes(raw[raw.len() - 4..].try_into().unwrap());
            if crc32c::crc32c(payload) != stored {
                return Err(Error::corruption("table block checksum mismatch"));
            }
        }

        let count = u32::from_le_bytes(payload[..4].try_into().unwrap()) as usize;
        let mut input = &payload[4..];
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let key_raw = get_length_prefixed_slice(&mut input)?;
            let value_raw = get_length_prefixed_slice(&mut input)?;
            entries.push((
                InternalKey::decode(key_raw)?,
                Bytes::copy_from_slice(value_raw),
            ));
        }
        if !input.is_empty() {
            return Err(Error::corruption("trailing bytes in table block"));
        }
        Ok(entries)
    }

    fn num_blocks(&self) -> usize {
        self.index.len()
    }
}

fn slice_for(mmap: &Mmap, handle: BlockHandle) -> Result<&[u8]> {
    let start = handle.offset as usize;
    let end = start + handle.len as usize;
    if end > mmap.len() {
        return Err(Error::corruption("table handle out of bounds"));
    }
    Ok(&mmap[start..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iterator::InternalIterator;
    use crate::key::ValueType;

    fn build_table(
        dir: &Path,
        entries: &[(&[u8], u64, ValueType, &[u8])],
        block_size: usize,
        bloom: Option<usize>,
    ) -> (PathBuf, BuiltTable) {
        let path = dir.join("000007.ldb");
        let mut builder = TableBuilder::create(&path, block_size, bloom).unwrap();
        for (user, seq, kind, value) in entries {
            let key = InternalKey::new(Bytes::copy_from_slice(user), *seq, *kind);
            builder.add(&key, value).unwrap();
        }
        let built = builder.finish().unwrap();
        (path, built)
    }

    fn sample_entries() -> Vec<(Vec<u8>, u64, ValueType, Vec<u8>)> {
        (0..500u32)
            .map(|i| {
                let key = format!("key{i:05}").into_bytes();
                let value = format!("value{i}").into_bytes();
                (key, 1000 + u64::from(i), ValueType::Value, value)
            })
            .collect()
    }

    #[test]
    fn build_and_get_across_blocks() {
        let dir = tempfile::TempDir::new().unwrap();
        let entries = sample_entries();
        let borrowed: Vec<(&[u8], u64, ValueType, &[u8])> = entries
            .iter()
            .map(|(k, s, t, v)| (k.as_slice(), *s, *t, v.as_slice()))
            .collect();
        let (path, built) = build_table(dir.path(), &borrowed, 512, Some(10));
        assert_eq!(built.num_entries, 500);
        assert_eq!(built.smallest.user_key().as_ref(), b"key00000");
        assert_eq!(built.largest.user_key().as_ref(), b"key00499");

        let table = Table::open(&path, 7, None).unwrap();
        assert!(table.num_blocks() > 1);
        let options = ReadOptions::default();

        for (user, seq, _, value) in &borrowed {
            let lookup = InternalKey::for_lookup(Bytes::copy_from_slice(user), u64::MAX >> 8);
            let (found_key, found_value) = table
                .internal_get(&options, &lookup)
                .unwrap()
                .expect("present");
            assert_eq!(found_key.user_key().as_ref(), *user);
            assert_eq!(found_key.sequence(), *seq);
            assert_eq!(found_value.as_ref(), *value);
        }

        let missing = InternalKey::for_lookup(Bytes::from_static(b"zzz"), u64::MAX >> 8);
        assert!(table.internal_get(&options, &missing).unwrap().is_none());
    }

    #[test]
    fn out_of_order_add_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("000001.ldb");
        let mut builder = TableBuilder::create(&path, 4096, None).unwrap();
        builder
            .add(
                &InternalKey::new(Bytes::from_static(b"b"), 2, ValueType::Value),
                b"x",
            )
            .unwrap();
        let err = builder.add(
            &InternalKey::new(Bytes::from_static(b"a"), 1, ValueType::Value),
            b"y",
        );
        assert!(err.is_err());
    }

    #[test]
    fn iterator_scans_in_order() {
        let dir = tempfile::TempDir::new().unwrap();
        let entries = sample_entries();
        let borrowed: Vec<(&[u8], u64, ValueType, &[u8])> = entries
            .iter()
            .map(|(k, s, t, v)| (k.as_slice(), *s, *t, v.as_slice()))
            .collect();
        let (path, _) = build_table(dir.path(), &borrowed, 256, None);
        let table = Arc::new(Table::open(&path, 7, None).unwrap());

        let mut iter = TableIterator::new(table.clone(), &ReadOptions::default());
        iter.seek_to_first();
        let mut count = 0;
        let mut last: Option<InternalKey> = None;
        while iter.valid() {
            if let Some(prev) = &last {
                assert!(prev < iter.key());
            }
            last = Some(iter.key().clone());
            count += 1;
            iter.next();
        }
        iter.status().unwrap();
        assert_eq!(count, 500);

        // Seek lands on the first key at or after the target.
        let mut iter = TableIterator::new(table, &ReadOptions::default());
        iter.seek(&InternalKey::for_lookup(
            Bytes::from_static(b"key00123"),
            u64::MAX >> 8,
        ));
        assert!(iter.valid());
        assert_eq!(iter.key().user_key().as_ref(), b"key00123");
    }

    #[test]
    fn corrupt_block_fails_verified_read() {
        let dir = tempfile::TempDir::new().unwrap();
        let entries = sample_entries();
        let borrowed: Vec<(&[u8], u64, ValueType, &[u8])> = entries
            .iter()
            .map(|(k, s, t, v)| (k.as_slice(), *s, *t, v.as_slice()))
            .collect();
        let (path, _) = build_table(dir.path(), &borrowed, 512, None);

        // Flip one byte early in the first data block.
        let mut raw = std::fs::read(&path).unwrap();
        raw[10] ^= 0xff;
        std::fs::write(&path, raw).unwrap();

        let table = Table::open(&path, 7, None).unwrap();
        let options = ReadOptions {
            verify_checksums: true,
            ..ReadOptions::default()
        };
        let lookup = InternalKey::for_lookup(Bytes::from_static(b"key00000"), u64::MAX >> 8);
        assert!(table.internal_get(&options, &lookup).is_err());
    }
}
