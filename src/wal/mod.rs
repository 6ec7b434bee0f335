//! Write-ahead log with segment rotation and a background cleaner.
//!
//! Records buffer in memory until the buffer holds `buffer_size` records or
//! an append forces a flush; the buffered batch is then encoded, appended
//! to the active `wal.<seq>` segment and fsynced, so a forced append is
//! durable when it returns. A segment growing past `file_size_limit` rotates
//! to `wal.<seq+1>`.
//!
//! A dedicated cleaner thread wakes every `clean_interval` and deletes
//! non-active segments whose records all sit at or below the checkpoint txn
//! id. Dropping the WAL closes the shutdown channel; the cleaner observes
//! the disconnect and exits, and drop joins it after flushing the buffer.

pub mod record;

pub use record::{OpType, Record};

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::Result;

struct WalInner {
    dir: PathBuf,
    seq: u64,
    file: File,
    buffer: Vec<Record>,
}

pub struct Wal {
    inner: Mutex<WalInner>,
    buffer_size: usize,
    file_size_limit: u64,
    checkpoint_txn_id: Arc<AtomicU64>,
    shutdown: Option<mpsc::Sender<()>>,
    cleaner: Option<JoinHandle<()>>,
}

fn segment_path(dir: &Path, seq: u64) -> PathBuf {
    dir.join(format!("wal.{}", seq))
}

fn open_segment(path: &Path) -> Result<File> {
    Ok(OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?)
}

/// Lists `wal.<seq>` segments in a directory, sorted ascending by seq.
fn list_segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut segments = Vec::new();
    if !dir.exists() {
        return Ok(segments);
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(seq_str) = name.strip_prefix("wal.") else {
            continue;
        };
        let Ok(seq) = seq_str.parse::<u64>() else {
            continue;
        };
        segments.push((seq, entry.path()));
    }
    segments.sort_by_key(|(seq, _)| *seq);
    Ok(segments)
}

impl Wal {
    pub fn new(
        dir: impl Into<PathBuf>,
        buffer_size: usize,
        checkpoint_txn_id: u64,
        clean_interval: Duration,
        file_size_limit: u64,
    ) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let file = open_segment(&segment_path(&dir, 0))?;

        let checkpoint = Arc::new(AtomicU64::new(checkpoint_txn_id));
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let cleaner_dir = dir.clone();
        let cleaner_checkpoint = Arc::clone(&checkpoint);
        let cleaner = std::thread::spawn(move || loop {
            match shutdown_rx.recv_timeout(clean_interval) {
                Err(RecvTimeoutError::Timeout) => {
                    let checkpoint = cleaner_checkpoint.load(Ordering::SeqCst);
                    if let Err(e) = clean_segments(&cleaner_dir, checkpoint) {
                        tracing::warn!(error = %e, "wal cleaner pass failed, will retry");
                    }
                }
                // Sender dropped or explicit stop: shut down.
                _ => break,
            }
        });

        Ok(Self {
            inner: Mutex::new(WalInner {
                dir,
                seq: 0,
                file,
                buffer: Vec::new(),
            }),
            buffer_size,
            file_size_limit,
            checkpoint_txn_id: checkpoint,
            shutdown: Some(shutdown_tx),
            cleaner: Some(cleaner),
        })
    }

    /// Buffers `records`; encodes, appends and fsyncs the whole buffer once
    /// it reaches the configured size or `force_flush` is set. Rotates to a
    /// fresh segment when the active one outgrows its limit.
    pub fn append(&self, records: &[Record], force_flush: bool) -> Result<()> {
        let mut inner = self.inner.lock()?;
        inner.buffer.extend_from_slice(records);

        if inner.buffer.len() < self.buffer_size && !force_flush {
            return Ok(());
        }
        if inner.buffer.is_empty() {
            return Ok(());
        }

        let batch = std::mem::take(&mut inner.buffer);
        let mut encoded = Vec::new();
        for record in &batch {
            encoded.extend_from_slice(&record.encode());
        }
        inner.file.write_all(&encoded)?;
        inner.file.sync_all()?;

        if inner.file.metadata()?.len() > self.file_size_limit {
            inner.seq += 1;
            let path = segment_path(&inner.dir, inner.seq);
            inner.file = open_segment(&path)?;
            tracing::debug!(seq = inner.seq, "rotated wal segment");
        }
        Ok(())
    }

    /// Forces the buffered records onto disk.
    pub fn flush(&self) -> Result<()> {
        self.append(&[], true)
    }

    /// Raises the checkpoint below which segments become reclaimable.
    pub fn set_checkpoint_txn_id(&self, txn_id: u64) {
        self.checkpoint_txn_id.store(txn_id, Ordering::SeqCst);
    }

    /// Replays every segment in seq order and groups records by txn id,
    /// keeping only transactions above the checkpoint.
    pub fn recover(dir: &Path, checkpoint_txn_id: u64) -> Result<BTreeMap<u64, Vec<Record>>> {
        let mut groups: BTreeMap<u64, Vec<Record>> = BTreeMap::new();
        for (_, path) in list_segments(dir)? {
            let data = std::fs::read(&path)?;
            for record in Record::decode_all(&data)? {
                if record.txn_id > checkpoint_txn_id {
                    groups.entry(record.txn_id).or_default().push(record);
                }
            }
        }
        Ok(groups)
    }

    /// Removes every `wal.*` segment in `dir`. Used when a fresh log is
    /// started after recovery.
    pub fn remove_segments(dir: &Path) -> Result<()> {
        for (_, path) in list_segments(dir)? {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }
}

/// One cleaner pass: delete each non-active segment whose records are all
/// at or below the checkpoint.
fn clean_segments(dir: &Path, checkpoint_txn_id: u64) -> Result<()> {
    let segments = list_segments(dir)?;
    if segments.len() < 2 {
        return Ok(());
    }

    // The highest seq is the active segment; never touch it.
    for (seq, path) in &segments[..segments.len() - 1] {
        let data = std::fs::read(path)?;
        let records = match Record::decode_all(&data) {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(seq, error = %e, "skipping undecodable wal segment");
                continue;
            }
        };
        if records.iter().all(|r| r.txn_id <= checkpoint_txn_id) {
            std::fs::remove_file(path)?;
            tracing::info!(seq, "removed reclaimable wal segment");
        }
    }
    Ok(())
}

impl Drop for Wal {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            tracing::warn!(error = %e, "failed to flush wal buffer on shutdown");
        }
        // Closing the channel wakes the cleaner out of its sleep.
        drop(self.shutdown.take());
        if let Some(cleaner) = self.cleaner.take() {
            let _ = cleaner.join();
        }
    }
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal")
            .field("buffer_size", &self.buffer_size)
            .field("file_size_limit", &self.file_size_limit)
            .finish()
    }
}
