//! Human-readable info log (`LOG`, rotated to `LOG.old` on open).

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::error::Result;
use crate::filename::{info_log_file_name, old_info_log_file_name};

#[derive(Debug)]
pub(crate) struct InfoLog {
    file: Mutex<File>,
}

impl InfoLog {
    pub(crate) fn open(dir: &Path) -> Result<Self> {
        let path = info_log_file_name(dir);
        if path.exists() {
            let _ = std::fs::rename(&path, old_info_log_file_name(dir));
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    pub(crate) fn log(&self, message: &str) {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let mut file = self.file.lock();
        // Info logging is best effort; a full disk must not fail the write
        // path that asked to log.
        let _ = writeln!(
            file,
            "{}.{:06} {}",
            timestamp.as_secs(),
            timestamp.subsec_micros(),
            message
        );
    }
}
