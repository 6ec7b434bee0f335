//! Disposable data directories for tests.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

const BASE_DIR: &str = "/tmp/emberdb_tests";

static NEXT_DIR_ID: AtomicU64 = AtomicU64::new(0);

/// A throwaway directory under `/tmp/emberdb_tests`, unique per process and
/// per call via a process-wide counter, removed again on drop.
pub struct TempDir {
    path: PathBuf,
}

impl TempDir {
    pub fn new() -> std::io::Result<Self> {
        let id = NEXT_DIR_ID.fetch_add(1, Ordering::Relaxed);
        let path = PathBuf::from(BASE_DIR).join(format!("{}_{}", std::process::id(), id));

        if path.exists() {
            fs::remove_dir_all(&path)?;
        }
        fs::create_dir_all(&path)?;

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}
