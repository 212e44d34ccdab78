//! Database directory layout and the atomic `CURRENT` pivot.
//!
//! ```text
//! <dir>/CURRENT            name of the active manifest, newline-terminated
//! <dir>/LOCK               exclusive file lock
//! <dir>/LOG, LOG.old       info log and its rotated predecessor
//! <dir>/MANIFEST-%06u      version-edit log
//! <dir>/%06u.log           write-ahead logs
//! <dir>/%06u.ldb           tables (legacy `.sst` accepted on read)
//! <dir>/%06u.dbtmp         staging file for the CURRENT rename
//! ```
//!
//! All numbered files draw from a single monotonic counter.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FileType {
    Current,
    Lock,
    InfoLog,
    Manifest,
    WalFile,
    Table,
    Temp,
}

pub(crate) fn current_file_name(dir: &Path) -> PathBuf {
    dir.join("CURRENT")
}

pub(crate) fn lock_file_name(dir: &Path) -> PathBuf {
    dir.join("LOCK")
}

pub(crate) fn info_log_file_name(dir: &Path) -> PathBuf {
    dir.join("LOG")
}

pub(crate) fn old_info_log_file_name(dir: &Path) -> PathBuf {
    dir.join("LOG.old")
}

pub(crate) fn manifest_file_name(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("MANIFEST-{number:06}"))
}

pub(crate) fn wal_file_name(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{number:06}.log"))
}

pub(crate) fn table_file_name(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{number:06}.ldb"))
}

pub(crate) fn legacy_table_file_name(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{number:06}.sst"))
}

pub(crate) fn temp_file_name(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{number:06}.dbtmp"))
}

/// Parses a directory entry name. Returns `None` for foreign files.
pub(crate) fn parse_file_name(name: &str) -> Option<(FileType, u64)> {
    match name {
        "CURRENT" => return Some((FileType::Current, 0)),
        "LOCK" => return Some((FileType::Lock, 0)),
        "LOG" | "LOG.old" => return Some((FileType::InfoLog, 0)),
        _ => {}
    }

    if let Some(rest) = name.strip_prefix("MANIFEST-") {
        let number = parse_decimal(rest)?;
        return Some((FileType::Manifest, number));
    }

    let dot = name.find('.')?;
    let number = parse_decimal(&name[..dot])?;
    match &name[dot..] {
        ".log" => Some((FileType::WalFile, number)),
        ".ldb" | ".sst" => Some((FileType::Table, number)),
        ".dbtmp" => Some((FileType::Temp, number)),
        _ => None,
    }
}

fn parse_decimal(input: &str) -> Option<u64> {
    if input.is_empty() || !input.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    input.parse().ok()
}

/// Points `CURRENT` at `MANIFEST-<number>` via a synced temp file and an
/// atomic rename. A crash at any point leaves the previous manifest as the
/// truth.
pub(crate) fn set_current_file(dir: &Path, manifest_number: u64) -> Result<()> {
    let contents = format!("MANIFEST-{manifest_number:06}\n");
    let tmp = temp_file_name(dir, manifest_number);

    let result = (|| -> Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(contents.as_bytes())?;
        file.sync_data()?;
        drop(file);
        std::fs::rename(&tmp, current_file_name(dir))?;
        sync_dir(dir)
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}

pub(crate) fn sync_dir(dir: &Path) -> Result<()> {
    let handle = File::open(dir)?;
    handle.sync_all()?;
    Ok(())
}
