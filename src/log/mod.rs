//! Checksummed, block-aligned record framing shared by the WAL and the
//! manifest.
//!
//! A log is a sequence of 32 KiB blocks. Each physical record carries a
//! 7-byte header `masked crc32c:u32 LE | length:u16 LE | type:u8`; a logical
//! record that does not fit the current block is split into
//! First/Middle*/Last fragments. Block tails shorter than a header are
//! zero-padded.

mod reader;
mod writer;

pub(crate) use reader::LogReader;
pub(crate) use writer::LogWriter;

pub(crate) const BLOCK_SIZE: usize = 32 * 1024;
pub(crate) const HEADER_SIZE: usize = 4 + 2 + 1;

pub(crate) const MAX_RECORD_TYPE: u8 = RecordType::Last as u8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum RecordType {
    Full = 1,
    First = 2,
    Middle = 3,
    Last = 4,
}

const MASK_DELTA: u32 = 0xa282_ead8;

/// Masks a CRC so that logs containing embedded CRCs do not produce
/// accidental matches.
pub(crate) fn mask_crc(crc: u32) -> u32 {
    ((crc >> 15) | (crc << 17)).wrapping_add(MASK_DELTA)
}

pub(crate) fn unmask_crc(masked: u32) -> u32 {
    let rot = masked.wrapping_sub(MASK_DELTA);
    (rot >> 17) | (rot << 15)
}

/// CRC of a physical record: the type byte followed by the payload.
pub(crate) fn record_crc(kind: u8, payload: &[u8]) -> u32 {
    crc32c::crc32c_append(crc32c::crc32c(&[kind]), payload)
}
