//! Transaction ids, contexts, and the durability bookkeeping around them.
//!
//! Every operation in the store happens under a transaction id, allocated
//! monotonically by the [`TxnManager`]. Explicit transactions get a
//! [`TxnContext`] with one of four isolation levels; auto-commit operations
//! simply burn one id per call.
//!
//! The manager tracks which transactions are ready to flush (committed or
//! aborted, awaiting their writes landing in an SST) and which are durably
//! flushed. The smallest flushed id is the checkpoint: WAL segments whose
//! records all sit at or below it are reclaimable. The manager's state is
//! persisted in the `tranc_id` file as
//! `next_txn_id(u64) | flushed_count(u64) | flushed(u64)*`.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};

use crate::config::LsmConfig;
use crate::engine::LsmEngine;
use crate::errdata;
use crate::errinput;
use crate::error::{Error, Result};
use crate::wal::{OpType, Record, Wal};

const TXN_ID_FILE: &str = "tranc_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl std::fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            IsolationLevel::ReadUncommitted => "read-uncommitted",
            IsolationLevel::ReadCommitted => "read-committed",
            IsolationLevel::RepeatableRead => "repeatable-read",
            IsolationLevel::Serializable => "serializable",
        };
        write!(f, "{name}")
    }
}

impl IsolationLevel {
    /// Levels other than read-uncommitted buffer their writes until commit.
    fn buffers_writes(&self) -> bool {
        !matches!(self, IsolationLevel::ReadUncommitted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Committed,
    Aborted,
}

struct TxnInner {
    /// Terminated transactions whose effects still await a flush.
    ready_to_flush: BTreeMap<u64, TxnState>,
    /// Transactions whose effects are durably in some SST. Never empty; the
    /// smallest element is the checkpoint.
    flushed: BTreeSet<u64>,
    /// Ids of transactions currently holding a context.
    active: BTreeSet<u64>,
}

pub struct TxnManager {
    data_dir: PathBuf,
    next_txn_id: AtomicU64,
    inner: Mutex<TxnInner>,
    wal: RwLock<Option<Arc<Wal>>>,
}

impl TxnManager {
    /// Loads the persisted id state from `tranc_id`, or initializes a fresh
    /// manager when the file does not exist yet.
    pub fn new(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.into();
        let path = data_dir.join(TXN_ID_FILE);

        let (next_txn_id, flushed) = if path.exists() {
            Self::load_txn_id_file(&path)?
        } else {
            (1, BTreeSet::from([0]))
        };

        Ok(Self {
            data_dir,
            next_txn_id: AtomicU64::new(next_txn_id),
            inner: Mutex::new(TxnInner {
                ready_to_flush: BTreeMap::new(),
                flushed,
                active: BTreeSet::new(),
            }),
            wal: RwLock::new(None),
        })
    }

    fn load_txn_id_file(path: &Path) -> Result<(u64, BTreeSet<u64>)> {
        let mut data = Vec::new();
        File::open(path)?.read_to_end(&mut data)?;
        if data.len() < 16 {
            return Err(errdata!(
                "txn id file too small: {} bytes at {}",
                data.len(),
                path.display()
            ));
        }

        let next_txn_id = BigEndian::read_u64(&data[0..8]);
        let count = BigEndian::read_u64(&data[8..16]) as usize;
        if data.len() < 16 + count * 8 {
            return Err(errdata!(
                "txn id file truncated: {count} flushed ids declared, {} bytes left",
                data.len() - 16
            ));
        }

        let mut flushed = BTreeSet::new();
        for i in 0..count {
            flushed.insert(BigEndian::read_u64(&data[16 + i * 8..]));
        }
        if flushed.is_empty() {
            flushed.insert(0);
        }
        Ok((next_txn_id, flushed))
    }

    /// Persists `next_txn_id` and the flushed set to the `tranc_id` file.
    pub fn persist(&self) -> Result<()> {
        let inner = self.inner.lock()?;
        let mut buf = Vec::with_capacity(16 + inner.flushed.len() * 8);
        buf.write_u64::<BigEndian>(self.next_txn_id.load(Ordering::SeqCst))
            .expect("write to vec");
        buf.write_u64::<BigEndian>(inner.flushed.len() as u64)
            .expect("write to vec");
        for txn_id in &inner.flushed {
            buf.write_u64::<BigEndian>(*txn_id).expect("write to vec");
        }
        drop(inner);

        let mut file = File::create(self.data_dir.join(TXN_ID_FILE))?;
        file.write_all(&buf)?;
        file.sync_all()?;
        Ok(())
    }

    /// Allocates the next transaction id.
    pub fn next_txn_id(&self) -> u64 {
        self.next_txn_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Ensures future allocations start at or above `min_next`. Used after
    /// recovery so replayed ids are never handed out again.
    pub fn bump_next_txn_id(&self, min_next: u64) {
        self.next_txn_id.fetch_max(min_next, Ordering::SeqCst);
    }

    pub fn register_active(&self, txn_id: u64) -> Result<()> {
        self.inner.lock()?.active.insert(txn_id);
        Ok(())
    }

    fn finish_active(&self, txn_id: u64) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.active.remove(&txn_id);
        }
    }

    /// Records a terminated transaction awaiting flush.
    pub fn add_ready_to_flush(&self, txn_id: u64, state: TxnState) -> Result<()> {
        self.inner.lock()?.ready_to_flush.insert(txn_id, state);
        Ok(())
    }

    /// Promotion on flush: every ready id up to `txn_id` is drained, with
    /// committed ids entering the flushed set and aborted ids discarded.
    /// Afterwards the WAL checkpoint advances to the new minimum flushed id.
    pub fn add_flushed_txn_id(&self, txn_id: u64) -> Result<()> {
        let checkpoint = {
            let mut inner = self.inner.lock()?;
            let drained: Vec<(u64, TxnState)> = inner
                .ready_to_flush
                .range(..=txn_id)
                .map(|(id, state)| (*id, *state))
                .collect();
            for (id, state) in drained {
                inner.ready_to_flush.remove(&id);
                if state == TxnState::Committed {
                    inner.flushed.insert(id);
                }
            }
            inner.flushed.iter().next().copied().unwrap_or(0)
        };

        if let Some(wal) = self.wal.read()?.as_ref() {
            wal.set_checkpoint_txn_id(checkpoint);
        }
        Ok(())
    }

    pub fn is_flushed(&self, txn_id: u64) -> Result<bool> {
        Ok(self.inner.lock()?.flushed.contains(&txn_id))
    }

    /// Largest txn id whose effects are known durable.
    pub fn max_flushed_txn_id(&self) -> Result<u64> {
        Ok(self
            .inner
            .lock()?
            .flushed
            .iter()
            .next_back()
            .copied()
            .unwrap_or(0))
    }

    /// Smallest flushed id; WAL segments entirely at or below it are dead.
    pub fn checkpoint_txn_id(&self) -> Result<u64> {
        Ok(self.inner.lock()?.flushed.iter().next().copied().unwrap_or(0))
    }

    /// Groups of WAL records above the checkpoint, keyed by txn id.
    pub fn check_recover(&self) -> Result<BTreeMap<u64, Vec<Record>>> {
        Wal::recover(&self.data_dir, self.checkpoint_txn_id()?)
    }

    /// Discards old WAL segments and opens a fresh log. The flushed set
    /// collapses to `next_txn_id - 1`: after recovery has replayed and
    /// flushed everything worth keeping, all earlier ids count as settled.
    pub fn init_new_wal(&self, config: &LsmConfig) -> Result<()> {
        Wal::remove_segments(&self.data_dir)?;

        let next = self.next_txn_id.load(Ordering::SeqCst);
        let checkpoint = next.saturating_sub(1);
        {
            let mut inner = self.inner.lock()?;
            inner.flushed.clear();
            inner.flushed.insert(checkpoint);
        }

        let wal = Wal::new(
            &self.data_dir,
            config.wal_buffer_size,
            checkpoint,
            config.wal_clean_interval,
            config.wal_file_size_limit,
        )?;
        *self.wal.write()? = Some(Arc::new(wal));
        self.persist()
    }

    /// Force-appends `records`; the batch is durable when this returns.
    pub fn write_to_wal(&self, records: &[Record]) -> Result<()> {
        match self.wal.read()?.as_ref() {
            Some(wal) => wal.append(records, true),
            None => Err(errinput!("wal not initialized")),
        }
    }

    /// Drops the WAL handle, stopping the cleaner thread.
    pub fn shutdown_wal(&self) {
        if let Ok(mut wal) = self.wal.write() {
            *wal = None;
        }
    }
}

/// An explicit transaction handle.
///
/// Read-uncommitted applies writes to the engine immediately, remembering
/// prior values for abort-time undo. The buffered levels stage writes in a
/// private map until commit, where a write-write conflict check either
/// applies them atomically or aborts with [`Error::Serialization`].
/// Repeatable-read additionally pins the first read of each key.
pub struct TxnContext {
    txn_id: u64,
    isolation: IsolationLevel,
    engine: Arc<LsmEngine>,
    manager: Arc<TxnManager>,
    state: TxnState,
    /// Every operation of this transaction, logged to the WAL at commit.
    operations: Vec<Record>,
    /// Staged writes for the buffered isolation levels; empty value is a
    /// staged delete.
    write_buffer: BTreeMap<Vec<u8>, Vec<u8>>,
    /// First-read memo for repeatable-read and serializable.
    read_cache: BTreeMap<Vec<u8>, Option<(Vec<u8>, u64)>>,
    /// Prior versions for read-uncommitted undo.
    undo_log: BTreeMap<Vec<u8>, Option<(Vec<u8>, u64)>>,
}

impl TxnContext {
    pub(crate) fn begin(
        engine: Arc<LsmEngine>,
        manager: Arc<TxnManager>,
        isolation: IsolationLevel,
    ) -> Result<Self> {
        let txn_id = manager.next_txn_id();
        manager.register_active(txn_id)?;
        tracing::debug!(txn_id, %isolation, "transaction started");
        Ok(Self {
            txn_id,
            isolation,
            engine,
            manager,
            state: TxnState::Active,
            operations: vec![Record::create(txn_id)],
            write_buffer: BTreeMap::new(),
            read_cache: BTreeMap::new(),
            undo_log: BTreeMap::new(),
        })
    }

    pub fn txn_id(&self) -> u64 {
        self.txn_id
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    fn check_active(&self) -> Result<()> {
        if self.state != TxnState::Active {
            return Err(errinput!(
                "transaction {} is no longer active ({:?})",
                self.txn_id,
                self.state
            ));
        }
        Ok(())
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_active()?;
        self.operations
            .push(Record::put(self.txn_id, key.to_vec(), value.to_vec()));

        if self.isolation.buffers_writes() {
            self.write_buffer.insert(key.to_vec(), value.to_vec());
            return Ok(());
        }

        // Read-uncommitted: apply immediately, remember the displaced value.
        let prior = self.engine.get(key, 0)?;
        self.undo_log.entry(key.to_vec()).or_insert(prior);
        self.engine.put(key.to_vec(), value.to_vec(), self.txn_id)?;
        Ok(())
    }

    pub fn remove(&mut self, key: &[u8]) -> Result<()> {
        self.check_active()?;
        self.operations.push(Record::delete(self.txn_id, key.to_vec()));

        if self.isolation.buffers_writes() {
            self.write_buffer.insert(key.to_vec(), Vec::new());
            return Ok(());
        }

        let prior = self.engine.get(key, 0)?;
        self.undo_log.entry(key.to_vec()).or_insert(prior);
        self.engine.remove(key.to_vec(), self.txn_id)?;
        Ok(())
    }

    pub fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_active()?;

        // Own writes first.
        if let Some(value) = self.write_buffer.get(key) {
            if value.is_empty() {
                return Ok(None);
            }
            return Ok(Some(value.clone()));
        }

        let found = match self.isolation {
            IsolationLevel::ReadUncommitted => self.engine.get(key, 0)?,
            IsolationLevel::ReadCommitted => self.engine.get(key, self.txn_id)?,
            IsolationLevel::RepeatableRead | IsolationLevel::Serializable => {
                if let Some(memoized) = self.read_cache.get(key) {
                    memoized.clone()
                } else {
                    let found = self.engine.get(key, self.txn_id)?;
                    self.read_cache.insert(key.to_vec(), found.clone());
                    found
                }
            }
        };
        Ok(found.map(|(value, _)| value))
    }

    /// Commits the transaction. For buffered isolation levels a write-write
    /// conflict aborts with [`Error::Serialization`]; otherwise the staged
    /// writes apply atomically at this txn id. The commit record is durable
    /// in the WAL before this returns.
    pub fn commit(&mut self) -> Result<()> {
        self.check_active()?;

        if !self.isolation.buffers_writes() {
            self.operations.push(Record::commit(self.txn_id));
            self.manager.write_to_wal(&self.operations)?;
            // Plant the commit marker so the flush path reports this id.
            self.engine.put_commit_marker(self.txn_id)?;
            self.state = TxnState::Committed;
            self.manager
                .add_ready_to_flush(self.txn_id, TxnState::Committed)?;
            self.manager.finish_active(self.txn_id);
            return Ok(());
        }

        let max_flushed = self.manager.max_flushed_txn_id()?;
        let mut handle = self.engine.begin_commit()?;

        for key in self.write_buffer.keys() {
            if handle.conflicts(key, self.txn_id, max_flushed)? {
                drop(handle);
                tracing::debug!(txn_id = self.txn_id, "write-write conflict, aborting");
                self.state = TxnState::Aborted;
                self.manager
                    .add_ready_to_flush(self.txn_id, TxnState::Aborted)?;
                self.manager.finish_active(self.txn_id);
                return Err(Error::Serialization);
            }
        }

        // Log before applying: a failed append must leave no trace in the
        // memtable.
        self.operations.push(Record::commit(self.txn_id));
        self.manager.write_to_wal(&self.operations)?;

        for (key, value) in std::mem::take(&mut self.write_buffer) {
            handle.apply(key, value, self.txn_id);
        }
        handle.apply(Vec::new(), Vec::new(), self.txn_id);
        drop(handle);

        self.state = TxnState::Committed;
        self.manager
            .add_ready_to_flush(self.txn_id, TxnState::Committed)?;
        self.manager.finish_active(self.txn_id);
        tracing::debug!(txn_id = self.txn_id, "transaction committed");
        Ok(())
    }

    /// Aborts the transaction, undoing read-uncommitted writes and
    /// discarding staged ones.
    pub fn abort(&mut self) -> Result<()> {
        self.check_active()?;

        if !self.isolation.buffers_writes() {
            // Undo by re-writing the displaced value at this txn id; the
            // restored version is inserted ahead of the dirty one and
            // shadows it for every reader.
            for (key, prior) in std::mem::take(&mut self.undo_log) {
                match prior {
                    Some((value, _)) => self.engine.put(key, value, self.txn_id)?,
                    None => self.engine.remove(key, self.txn_id)?,
                };
            }
        }
        self.write_buffer.clear();

        self.state = TxnState::Aborted;
        self.manager
            .add_ready_to_flush(self.txn_id, TxnState::Aborted)?;
        self.manager.finish_active(self.txn_id);
        tracing::debug!(txn_id = self.txn_id, "transaction aborted");
        Ok(())
    }
}

/// Replays committed transactions recovered from the WAL into the engine.
/// Groups without a COMMIT record were in flight at the crash and are
/// discarded. Returns the largest replayed txn id, if any.
pub fn replay_recovered(
    engine: &LsmEngine,
    manager: &TxnManager,
    groups: BTreeMap<u64, Vec<Record>>,
) -> Result<Option<u64>> {
    let mut max_replayed = None;
    for (txn_id, records) in groups {
        if manager.is_flushed(txn_id)? {
            continue;
        }
        if !records.iter().any(|r| r.op == OpType::Commit) {
            tracing::debug!(txn_id, "discarding uncommitted transaction from wal");
            continue;
        }
        for record in records {
            match record.op {
                OpType::Put => {
                    engine.put(record.key, record.value, txn_id)?;
                }
                OpType::Delete => {
                    engine.remove(record.key, txn_id)?;
                }
                _ => {}
            }
        }
        tracing::info!(txn_id, "replayed committed transaction from wal");
        max_replayed = Some(txn_id);
    }
    Ok(max_replayed)
}
