//! Version edits: structured deltas applied to the current version and
//! persisted to the manifest.
//!
//! The encoding is a concatenation of tagged fields, each introduced by a
//! varint tag. Unknown tags are a corruption error so that older builds
//! refuse manifests they cannot honor.

use crate::coding::{
    get_length_prefixed_slice, get_varint32, get_varint64, put_length_prefixed_slice, put_varint32,
    put_varint64,
};
use crate::error::{Error, Result};
use crate::key::InternalKey;

use super::NUM_LEVELS;

const TAG_COMPARATOR: u32 = 1;
const TAG_LOG_NUMBER: u32 = 2;
const TAG_NEXT_FILE_NUMBER: u32 = 3;
const TAG_LAST_SEQUENCE: u32 = 4;
const TAG_COMPACT_POINTER: u32 = 5;
const TAG_DELETED_FILE: u32 = 6;
const TAG_NEW_FILE: u32 = 7;
const TAG_PREV_LOG_NUMBER: u32 = 9;

/// File addition carried by an edit; becomes a `FileMetaData` on install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct NewFileEntry {
    pub number: u64,
    pub file_size: u64,
    pub smallest: InternalKey,
    pub largest: InternalKey,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct VersionEdit {
    pub comparator_name: Option<String>,
    pub log_number: Option<u64>,
    pub prev_log_number: Option<u64>,
    pub next_file_number: Option<u64>,
    pub last_sequence: Option<u64>,
    pub compact_pointers: Vec<(usize, InternalKey)>,
    pub deleted_files: Vec<(usize, u64)>,
    pub new_files: Vec<(usize, NewFileEntry)>,
}

impl VersionEdit {
    pub(crate) fn add_file(
        &mut self,
        level: usize,
        number: u64,
        file_size: u64,
        smallest: InternalKey,
        largest: InternalKey,
    ) {
        self.new_files.push((
            level,
            NewFileEntry {
                number,
                file_size,
                smallest,
                largest,
            },
        ));
    }

    pub(crate) fn delete_file(&mut self, level: usize, number: u64) {
        self.deleted_files.push((level, number));
    }

    pub(crate) fn set_compact_pointer(&mut self, level: usize, key: InternalKey) {
        self.compact_pointers.push((level, key));
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        if let Some(name) = &self.comparator_name {
            put_varint32(&mut buf, TAG_COMPARATOR);
            put_length_prefixed_slice(&mut buf, name.as_bytes());
        }
        if let Some(number) = self.log_number {
            put_varint32(&mut buf, TAG_LOG_NUMBER);
            put_varint64(&mut buf, number);
        }
        if let Some(number) = self.prev_log_number {
            put_varint32(&mut buf, TAG_PREV_LOG_NUMBER);
            put_varint64(&mut buf, number);
        }
        if let Some(number) = self.next_file_number {
            put_varint32(&mut buf, TAG_NEXT_FILE_NUMBER);
            put_varint64(&mut buf, number);
        }
        if let Some(sequence) = self.last_sequence {
            put_varint32(&mut buf, TAG_LAST_SEQUENCE);
            put_varint64(&mut buf, sequence);
        }
        for (level, key) in &self.compact_pointers {
            put_varint32(&mut buf, TAG_COMPACT_POINTER);
            put_varint32(&mut buf, *level as u32);
            put_length_prefixed_slice(&mut buf, &key.encode());
        }
        for (level, number) in &self.deleted_files {
            put_varint32(&mut buf, TAG_DELETED_FILE);
            put_varint32(&mut buf, *level as u32);
            put_varint64(&mut buf, *number);
        }
        for (level, file) in &self.new_files {
            put_varint32(&mut buf, TAG_NEW_FILE);
            put_varint32(&mut buf, *level as u32);
            put_varint64(&mut buf, file.number);
            put_varint64(&mut buf, file.file_size);
            put_length_prefixed_slice(&mut buf, &file.smallest.encode());
            put_length_prefixed_slice(&mut buf, &file.largest.encode());
        }
        buf
    }

    pub(crate) fn decode(mut input: &[u8]) -> Result<Self> {
        let mut edit = VersionEdit::default();
        while !input.is_empty() {
            let tag = get_varint32(&mut input)?;
            match tag {
                TAG_COMPARATOR => {
                    let name = get_length_prefixed_slice(&mut input)?;
                    let name = std::str::from_utf8(name)
                        .map_err(|_| Error::corruption("comparator name not utf-8"))?;
                    edit.comparator_name = Some(name.to_owned());
                }
                TAG_LOG_NUMBER => edit.log_number = Some(get_varint64(&mut input)?),
                TAG_PREV_LOG_NUMBER => edit.prev_log_number = Some(get_varint64(&mut input)?),
                TAG_NEXT_FILE_NUMBER => edit.next_file_number = Some(get_varint64(&mut input)?),
                TAG_LAST_SEQUENCE => edit.last_sequence = Some(get_varint64(&mut input)?),
                TAG_COMPACT_POINTER => {
                    let level = decode_level(&mut input)?;
                    let key = InternalKey::decode(get_length_prefixed_slice(&mut input)?)?;
                    edit.compact_pointers.push((level, key));
                }
                TAG_DELETED_FILE => {
                    let level = decode_level(&mut input)?;
                    let number = get_varint64(&mut input)?;
                    edit.deleted_files.push((level, number));
                }
                TAG_NEW_FILE => {
                    let level = decode_level(&mut input)?;
                    let number = get_varint64(&mut input)?;
                    let file_size = get_varint64(&mut input)?;
                    let smallest = InternalKey::decode(get_length_prefixed_slice(&mut input)?)?;
                    let largest = InternalKey::decode(get_length_prefixed_slice(&mut input)?)?;
                    edit.new_files.push((
                        level,
                        NewFileEntry {
                            number,
                            file_size,
                            smallest,
                            largest,
                        },
                    ));
                }
                other => {
                    return Err(Error::corruption(format!(
                        "unknown version edit tag: {other}"
                    )))
                }
            }
        }
        Ok(edit)
    }
}

fn decode_level(input: &mut &[u8]) -> Result<usize> {
    let level = get_varint32(input)? as usize;
    if level >= NUM_LEVELS {
        return Err(Error::corruption(format!("level out of range: {level}")));
    }
    Ok(level)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::ValueType;
    use bytes::Bytes;

    fn key(user: &str, seq: u64) -> InternalKey {
        InternalKey::new(Bytes::from(user.to_owned()), seq, ValueType::Value)
    }

    #[test]
    fn encode_decode_roundtrip() {
        let mut edit = VersionEdit {
            comparator_name: Some("stratadb.BytewiseComparator".to_owned()),
            log_number: Some(12),
            prev_log_number: Some(0),
            next_file_number: Some(42),
            last_sequence: Some(99_999),
            ..VersionEdit::default()
        };
        edit.set_compact_pointer(2, key("cursor", 7));
        edit.delete_file(1, 8);
        edit.delete_file(2, 9);
        edit.add_file(1, 40, 2048, key("a", 10), key("m", 3));
        edit.add_file(2, 41, 4096, key("n", 20), key("z", 1));

        let decoded = VersionEdit::decode(&edit.encode()).unwrap();
        assert_eq!(decoded, edit);
    }

    #[test]
    fn empty_edit_roundtrip() {
        let edit = VersionEdit::default();
        assert!(edit.encode().is_empty());
        assert_eq!(VersionEdit::decode(&[]).unwrap(), edit);
    }

    #[test]
    fn unknown_tag_is_corruption() {
        let mut buf = Vec::new();
        crate::coding::put_varint32(&mut buf, 8);
        assert!(VersionEdit::decode(&buf).is_err());
    }

    #[test]
    fn out_of_range_level_is_corruption() {
        let mut edit = VersionEdit::default();
        edit.delete_file(3, 8);
        let mut encoded = edit.encode();
        // Patch the level varint to an invalid value.
        let pos = encoded.len() - 2;
        encoded[pos] = 200;
        assert!(VersionEdit::decode(&encoded).is_err());
    }
}
