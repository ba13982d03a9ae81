//! Single-instance sentinel lock (`spec.md §6`: "A sentinel file prevents
//! double-run; start aborts with non-zero exit if another instance is
//! detected").
//!
//! An advisory `flock(2)` on a fixed path is the whole mechanism: the lock
//! is released automatically when the holding process exits or the fd is
//! closed, so there is nothing to clean up on a crash.

use std::fs::OpenOptions;
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

/// An open, locked sentinel file. Dropping this releases the lock.
pub struct Sentinel {
    _file: std::fs::File,
}

#[derive(Debug, thiserror::Error)]
pub enum SentinelError {
    #[error("could not open sentinel file {0}: {1}")]
    Open(PathBuf, io::Error),

    #[error("another jiufengd instance is already running (sentinel {0} is locked)")]
    AlreadyRunning(PathBuf),
}

/// Acquire the sentinel lock at `path`, creating the file if needed.
/// Returns [`SentinelError::AlreadyRunning`] if another live process holds
/// it.
pub fn acquire(path: &Path) -> Result<Sentinel, SentinelError> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .open(path)
        .map_err(|e| SentinelError::Open(path.to_path_buf(), e))?;

    // SAFETY: `fd` is a valid, open file descriptor owned by `file` for the
    // duration of this call; `flock` does not retain it beyond the call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        return match err.raw_os_error() {
            Some(libc::EWOULDBLOCK) => Err(SentinelError::AlreadyRunning(path.to_path_buf())),
            _ => Err(SentinelError::Open(path.to_path_buf(), err)),
        };
    }

    Ok(Sentinel { _file: file })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_on_the_same_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jiufengd.lock");

        let first = acquire(&path).unwrap();
        let second = acquire(&path);
        assert!(matches!(second, Err(SentinelError::AlreadyRunning(_))));
        drop(first);
    }

    #[test]
    fn lock_is_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jiufengd.lock");

        let first = acquire(&path).unwrap();
        drop(first);
        acquire(&path).unwrap();
    }
}
