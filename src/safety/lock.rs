//! Advisory file locking.

use crate::config::types::{EnvError, Result};
use libc::{flock, LOCK_EX};
use std::fs::{self, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::Path;

/// Run `operation` while holding an exclusive `flock` on `lock_path`.
///
/// The lock file is created on demand and never removed while in use, so
/// every holder locks the same inode.
pub fn with_file_lock<T, F>(lock_path: &Path, operation: F) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    if let Some(parent) = lock_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let lock_file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(lock_path)?;

    // Blocks until the lock is free
    let flock_result = unsafe { flock(lock_file.as_raw_fd(), LOCK_EX) };
    if flock_result != 0 {
        return Err(EnvError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!(
                "Failed to lock file {}: {}",
                lock_path.display(),
                std::io::Error::last_os_error()
            ),
        )));
    }

    // Released when lock_file is closed
    operation()
}
