//! Exclusive advisory lock on the database directory.

use std::fs::{File, OpenOptions};
use std::path::Path;

use crate::error::{Error, Result};

/// Held for the lifetime of an open database; the OS releases the lock when
/// the file handle drops.
#[derive(Debug)]
pub(crate) struct FileLock {
    _file: File,
}

impl FileLock {
    pub(crate) fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        try_lock(&file).map_err(|err| {
            Error::Io(std::sync::Arc::new(std::io::Error::new(
                err.kind(),
                format!("lock {}: {err}", path.display()),
            )))
        })?;
        Ok(Self { _file: file })
    }
}

#[cfg(unix)]
fn try_lock(file: &File) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
fn try_lock(_file: &File) -> std::io::Result<()> {
    // Single-process exclusion is not enforced on this platform.
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn second_lock_on_same_path_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("LOCK");

        let held = FileLock::acquire(&path).unwrap();
        assert!(FileLock::acquire(&path).is_err());
        drop(held);
        assert!(FileLock::acquire(&path).is_ok());
    }
}
