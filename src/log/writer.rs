use std::fs::File;
use std::io::Write;

use crate::error::Result;

use super::{mask_crc, record_crc, RecordType, BLOCK_SIZE, HEADER_SIZE};

pub(crate) struct LogWriter {
    file: File,
    /// Offset within the current block.
    block_offset: usize,
}

impl LogWriter {
    pub(crate) fn new(file: File) -> Self {
        Self {
            file,
            block_offset: 0,
        }
    }

    pub(crate) fn add_record(&mut self, data: &[u8]) -> Result<()> {
        let mut left = data;
        let mut begin = true;

        // An empty record still emits a single zero-length fragment.
        loop {
            let leftover = BLOCK_SIZE - self.block_offset;
            if leftover < HEADER_SIZE {
                if leftover > 0 {
                    const ZEROES: [u8; HEADER_SIZE - 1] = [0; HEADER_SIZE - 1];
                    self.file.write_all(&ZEROES[..leftover])?;
                }
                self.block_offset = 0;
            }

            let avail = BLOCK_SIZE - self.block_offset - HEADER_SIZE;
            let fragment_length = left.len().min(avail);
            let end = fragment_length == left.len();

            let kind = match (begin, end) {
                (true, true) => RecordType::Full,
                (true, false) => RecordType::First,
                (false, true) => RecordType::Last,
                (false, false) => RecordType::Middle,
            };

            self.emit_physical_record(kind, &left[..fragment_length])?;
            left = &left[fragment_length..];
            begin = false;
            if left.is_empty() && end {
                return Ok(());
            }
        }
    }

    pub(crate) fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    fn emit_physical_record(&mut self, kind: RecordType, payload: &[u8]) -> Result<()> {
        debug_assert!(payload.len() <= 0xffff);
        debug_assert!(self.block_offset + HEADER_SIZE + payload.len() <= BLOCK_SIZE);

        let crc = mask_crc(record_crc(kind as u8, payload));
        let mut header = [0u8; HEADER_SIZE];
        header[..4].copy_from_slice(&crc.to_le_bytes());
        header[4..6].copy_from_slice(&(payload.len() as u16).to_le_bytes());
        header[6] = kind as u8;

        self.file.write_all(&header)?;
        self.file.write_all(payload)?;
        self.block_offset += HEADER_SIZE + payload.len();
        Ok(())
    }
}
