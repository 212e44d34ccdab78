use std::fs::File;
use std::io::Read;

use crate::error::{Error, Result};

use super::{record_crc, unmask_crc, RecordType, BLOCK_SIZE, HEADER_SIZE, MAX_RECORD_TYPE};

/// Reads back logical records written by [`super::LogWriter`].
///
/// On a damaged physical record the reader drops the remainder of the
/// current block and returns `Err(Corruption)`; a subsequent call continues
/// at the next block, so callers choose between aborting and skipping.
/// A partial record at the tail of the file (crash mid-append) reads as a
/// clean end of log.
pub(crate) struct LogReader {
    file: File,
    checksum: bool,
    buffer: Vec<u8>,
    /// Read position within `buffer`.
    pos: usize,
    eof: bool,
}

enum Physical {
    Record(RecordType, Vec<u8>),
    Eof,
}

impl LogReader {
    pub(crate) fn new(file: File, checksum: bool) -> Self {
        Self {
            file,
            checksum,
            buffer: Vec::new(),
            pos: 0,
            eof: false,
        }
    }

    /// Returns the next logical record, `None` at end of log.
    pub(crate) fn read_record(&mut self) -> Result<Option<Vec<u8>>> {
        let mut assembled: Option<Vec<u8>> = None;

        loop {
            match self.read_physical_record()? {
                Physical::Eof => {
                    // A dangling First/Middle prefix means the writer died
                    // mid-record; the prefix is unreachable data.
                    return Ok(None);
                }
                Physical::Record(RecordType::Full, data) => {
                    if assembled.is_some() {
                        return Err(Error::corruption("partial record without end"));
                    }
                    return Ok(Some(data));
                }
                Physical::Record(RecordType::First, data) => {
                    if assembled.is_some() {
                        return Err(Error::corruption("partial record without end"));
                    }
                    assembled = Some(data);
                }
                Physical::Record(RecordType::Middle, data) => match assembled.as_mut() {
                    Some(record) => record.extend_from_slice(&data),
                    None => return Err(Error::corruption("middle record without start")),
                },
                Physical::Record(RecordType::Last, data) => match assembled.take() {
                    Some(mut record) => {
                        record.extend_from_slice(&data);
                        return Ok(Some(record));
                    }
                    None => return Err(Error::corruption("last record without start")),
                },
            }
        }
    }

    fn read_physical_record(&mut self) -> Result<Physical> {
        loop {
            if self.buffer.len() - self.pos < HEADER_SIZE {
                if self.eof {
                    // Zero-padded tail or truncated header.
                    return Ok(Physical::Eof);
                }
                self.read_block()?;
                continue;
            }

            let header = &self.buffer[self.pos..self.pos + HEADER_SIZE];
            let masked_crc = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
            let length = u16::from_le_bytes([header[4], header[5]]) as usize;
            let kind = header[6];

            if masked_crc == 0 && length == 0 && kind == 0 {
                // Preallocated zero region; nothing further in this log.
                return Ok(Physical::Eof);
            }

            if self.buffer.len() - self.pos < HEADER_SIZE + length {
                if self.eof {
                    // Crash mid-append; drop the fragment silently.
                    self.pos = self.buffer.len();
                    return Ok(Physical::Eof);
                }
                self.pos = self.buffer.len();
                return Err(Error::corruption("bad record length"));
            }

            if kind == 0 || kind > MAX_RECORD_TYPE {
                self.pos = self.buffer.len();
                return Err(Error::corruption(format!("unknown record type: {kind}")));
            }

            let payload_start = self.pos + HEADER_SIZE;
            let payload = &self.buffer[payload_start..payload_start + length];

            if self.checksum && unmask_crc(masked_crc) != record_crc(kind, payload) {
                self.pos = self.buffer.len();
                return Err(Error::corruption("checksum mismatch"));
            }

            let data = payload.to_vec();
            self.pos = payload_start + length;

            let kind = match kind {
                1 => RecordType::Full,
                2 => RecordType::First,
                3 => RecordType::Middle,
                _ => RecordType::Last,
            };
            return Ok(Physical::Record(kind, data));
        }
    }

    fn read_block(&mut self) -> Result<()> {
        self.buffer.clear();
        self.buffer.resize(BLOCK_SIZE, 0);
        self.pos = 0;

        let mut filled = 0;
        while filled < BLOCK_SIZE {
            let n = self.file.read(&mut self.buffer[filled..])?;
            if n == 0 {
                self.eof = true;
                break;
            }
            filled += n;
        }
        self.buffer.truncate(filled);
        Ok(())
    }
}
