//! Exclusive ownership of a data directory.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

const LOCK_FILE: &str = "emberdb.lock";

/// `flock(2)`-backed exclusive claim on a store's data directory, held for
/// the lifetime of the store. The lock belongs to the open file handle, so
/// a crashed process never leaves a stale lock behind: closing the handle
/// (or dying) releases it. The lock file's content is the owning pid, for
/// operators wondering who holds a directory.
pub struct DirLock {
    // Keeps the flock alive; never read back.
    _file: File,
    path: PathBuf,
}

impl DirLock {
    /// Claims `dir` for this process. Fails when another store instance
    /// (or another handle in this process) already owns it.
    pub fn acquire(dir: &Path) -> Result<DirLock> {
        let path = dir.join(LOCK_FILE);
        let mut file = File::options()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        if !try_flock(&file) {
            return Err(Error::IO(format!(
                "data directory {} is locked by another store instance",
                dir.display()
            )));
        }

        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(DirLock { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
fn try_flock(file: &File) -> bool {
    use std::os::unix::io::AsRawFd;
    unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) == 0 }
}

#[cfg(not(unix))]
fn try_flock(_file: &File) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    #[test]
    fn test_acquire_records_pid() {
        let dir = TempDir::new().expect("tempdir");
        let lock = DirLock::acquire(dir.path()).expect("acquire failed");

        let content = std::fs::read_to_string(lock.path()).expect("lock file unreadable");
        assert_eq!(content.trim(), std::process::id().to_string());
    }

    #[test]
    fn test_second_acquire_fails() {
        let dir = TempDir::new().expect("tempdir");
        let _held = DirLock::acquire(dir.path()).expect("first acquire failed");

        match DirLock::acquire(dir.path()) {
            Err(Error::IO(msg)) => assert!(msg.contains("locked")),
            Err(other) => panic!("expected IO error, got {other:?}"),
            Ok(_) => panic!("second acquire should have failed"),
        }
    }

    #[test]
    fn test_reacquire_after_release() {
        let dir = TempDir::new().expect("tempdir");
        {
            let _lock = DirLock::acquire(dir.path()).expect("first acquire failed");
        }
        // Dropping the handle released the flock even though the lock file
        // is still on disk.
        assert!(dir.path().join("emberdb.lock").exists());
        DirLock::acquire(dir.path()).expect("reacquire after drop failed");
    }
}
