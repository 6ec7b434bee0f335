//! LSM engine: the coordinator that ties the memtable, the on-disk levels,
//! the block cache and the transaction manager together.
//!
//! ## Read path
//!
//! Memtable first (active, then frozen newest to oldest), then L0 SSTs
//! newest to oldest, then one binary-searched candidate per deeper level.
//! The first version found wins; an empty value is a tombstone and resolves
//! to absence.
//!
//! ## Write path
//!
//! Writes land in the memtable. When the aggregate memtable footprint
//! crosses the configured budget the oldest frozen table flushes to a new
//! L0 SST; when L0 holds `level_ratio` tables a full compaction cascades
//! the overflow down the levels first.
//!
//! ## Locking
//!
//! The level map sits behind one reader-writer lock: reads and iterator
//! construction take it shared, flush and compaction take it exclusive.
//! Where the level lock and the memtable locks are both needed the level
//! lock is acquired first.

pub mod compaction;
pub mod recovery;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, Weak};

use crate::cache::BlockCache;
use crate::config::LsmConfig;
use crate::errdata;
use crate::error::Result;
use crate::flock::DirLock;
use crate::iterator::{
    stream_from_vec, ConcatIterator, Entry, EntryStream, HeapIterator, LevelIterator,
    TwoMergeIterator,
};
use crate::memtable::{CommitGuard, MemTable};
use crate::sst::{sst_path, SstBuilder, SstIterator};
use crate::txn::{replay_recovered, IsolationLevel, TxnContext, TxnManager};

/// On-disk tiers: `level -> ordered sst ids` plus the shared handle map.
/// L0 ids are ordered newest first and may overlap; deeper levels hold
/// disjoint ranges ordered ascending by first key.
pub(crate) struct Levels {
    pub sst_ids: BTreeMap<usize, VecDeque<u64>>,
    pub ssts: HashMap<u64, Arc<crate::sst::Sst>>,
    pub max_level: usize,
}

pub struct LsmEngine {
    pub(crate) config: LsmConfig,
    memtable: MemTable,
    levels: RwLock<Levels>,
    pub(crate) cache: Arc<BlockCache>,
    pub(crate) next_sst_id: AtomicU64,
    txn_manager: RwLock<Weak<TxnManager>>,
}

impl LsmEngine {
    /// Opens the engine over `config.dir`, loading any existing SSTs.
    pub fn open(config: LsmConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.dir)?;
        let cache = Arc::new(BlockCache::new(
            config.block_cache_capacity,
            config.block_cache_k,
        ));
        let (levels, next_sst_id) = recovery::load_levels(&config.dir, &cache)?;

        Ok(Self {
            memtable: MemTable::new(config.per_mem_size_limit),
            levels: RwLock::new(levels),
            cache,
            next_sst_id: AtomicU64::new(next_sst_id),
            txn_manager: RwLock::new(Weak::new()),
            config,
        })
    }

    pub fn set_txn_manager(&self, manager: Weak<TxnManager>) {
        if let Ok(mut slot) = self.txn_manager.write() {
            *slot = manager;
        }
    }

    pub(crate) fn new_sst_builder(&self) -> SstBuilder {
        SstBuilder::new(
            self.config.block_size,
            self.config.bloom_expected_size,
            self.config.bloom_error_rate,
        )
    }

    /// Target SST size when compacting into `level`.
    pub(crate) fn sst_size_for_level(&self, level: usize) -> usize {
        let mut size = self.config.per_mem_size_limit;
        for _ in 0..level {
            size = size.saturating_mul(self.config.level_ratio);
        }
        size
    }

    /// Point read at `snapshot`; tombstones resolve to `None`.
    pub fn get(&self, key: &[u8], snapshot: u64) -> Result<Option<(Vec<u8>, u64)>> {
        if let Some((value, txn_id)) = self.memtable.get(key, snapshot)? {
            if value.is_empty() {
                return Ok(None);
            }
            return Ok(Some((value, txn_id)));
        }

        let levels = self.levels.read()?;
        match Self::search_ssts(&levels, key, snapshot)? {
            Some(entry) if !entry.value.is_empty() => Ok(Some((entry.value, entry.txn_id))),
            _ => Ok(None),
        }
    }

    pub fn get_batch(
        &self,
        keys: &[Vec<u8>],
        snapshot: u64,
    ) -> Result<Vec<Option<(Vec<u8>, u64)>>> {
        let from_memtable = self.memtable.get_batch(keys, snapshot)?;

        let mut results = Vec::with_capacity(keys.len());
        let mut unresolved = Vec::new();
        for (i, found) in from_memtable.into_iter().enumerate() {
            match found {
                Some((value, txn_id)) => {
                    results.push(if value.is_empty() {
                        None
                    } else {
                        Some((value, txn_id))
                    });
                }
                None => {
                    results.push(None);
                    unresolved.push(i);
                }
            }
        }
        if unresolved.is_empty() {
            return Ok(results);
        }

        let levels = self.levels.read()?;
        for i in unresolved {
            if let Some(entry) = Self::search_ssts(&levels, &keys[i], snapshot)? {
                if !entry.value.is_empty() {
                    results[i] = Some((entry.value, entry.txn_id));
                }
            }
        }
        Ok(results)
    }

    /// Raw SST lookup across the level hierarchy, tombstones included.
    pub(crate) fn search_ssts(
        levels: &Levels,
        key: &[u8],
        snapshot: u64,
    ) -> Result<Option<Entry>> {
        if let Some(l0) = levels.sst_ids.get(&0) {
            for id in l0 {
                let sst = levels
                    .ssts
                    .get(id)
                    .ok_or_else(|| errdata!("sst {id} missing from handle map"))?;
                if let Some(entry) = sst.get(key, snapshot)? {
                    return Ok(Some(entry));
                }
            }
        }

        for ids in levels.sst_ids.range(1..).map(|(_, ids)| ids) {
            // Disjoint ranges: binary-search the unique candidate.
            let mut left = 0;
            let mut right = ids.len();
            while left < right {
                let mid = (left + right) / 2;
                let sst = levels
                    .ssts
                    .get(&ids[mid])
                    .ok_or_else(|| errdata!("sst {} missing from handle map", ids[mid]))?;
                if key < sst.first_key() {
                    right = mid;
                } else if key > sst.last_key() {
                    left = mid + 1;
                } else {
                    if let Some(entry) = sst.get(key, snapshot)? {
                        return Ok(Some(entry));
                    }
                    break;
                }
            }
        }
        Ok(None)
    }

    /// Writes one version. Returns the largest txn id flushed to disk when
    /// the write pushed the memtable over its budget, otherwise 0.
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>, txn_id: u64) -> Result<u64> {
        self.memtable.put(key, value, txn_id)?;
        self.maybe_flush()
    }

    pub fn put_batch(&self, entries: Vec<(Vec<u8>, Vec<u8>)>, txn_id: u64) -> Result<u64> {
        self.memtable.put_batch(entries, txn_id)?;
        self.maybe_flush()
    }

    /// Deletion is a tombstone put.
    pub fn remove(&self, key: Vec<u8>, txn_id: u64) -> Result<u64> {
        self.memtable.remove(key, txn_id)?;
        self.maybe_flush()
    }

    pub fn remove_batch(&self, keys: Vec<Vec<u8>>, txn_id: u64) -> Result<u64> {
        self.memtable.remove_batch(keys, txn_id)?;
        self.maybe_flush()
    }

    /// Plants the `("","")` commit marker carrying `txn_id` through the
    /// flush path, so the transaction manager learns when it became durable.
    pub fn put_commit_marker(&self, txn_id: u64) -> Result<()> {
        self.memtable.put(Vec::new(), Vec::new(), txn_id)
    }

    fn maybe_flush(&self) -> Result<u64> {
        if self.memtable.total_size() >= self.config.total_mem_size_limit {
            return self.flush();
        }
        Ok(0)
    }

    /// Flushes the oldest frozen memtable into a new L0 SST. Compacts L0
    /// downward first when it is already at the ratio threshold. Returns the
    /// largest txn id in the flushed SST, or 0 when nothing flushed.
    pub fn flush(&self) -> Result<u64> {
        if self.memtable.total_size() == 0 {
            return Ok(0);
        }

        let mut levels = self.levels.write()?;
        if levels.sst_ids.get(&0).map_or(0, |ids| ids.len()) >= self.config.level_ratio {
            compaction::full_compact(self, &mut levels, 0)?;
        }

        let mut builder = self.new_sst_builder();
        let mut marker_txn_ids = Vec::new();
        if !self.memtable.flush_oldest(&mut builder, &mut marker_txn_ids)? {
            return Ok(0);
        }
        if builder.is_empty() {
            return Ok(0);
        }

        let sst_id = self.next_sst_id.fetch_add(1, Ordering::SeqCst);
        let sst = builder.build(
            sst_id,
            sst_path(&self.config.dir, sst_id, 0),
            Arc::clone(&self.cache),
        )?;
        let max_txn_id = sst.txn_id_range().1;

        levels.sst_ids.entry(0).or_default().push_front(sst_id);
        levels.ssts.insert(sst_id, sst);
        drop(levels);

        tracing::info!(sst_id, max_txn_id, "flushed memtable to level 0");

        if let Some(manager) = self.txn_manager.read()?.upgrade() {
            for txn_id in marker_txn_ids {
                manager.add_flushed_txn_id(txn_id)?;
            }
        }
        Ok(max_txn_id)
    }

    /// Flushes until the memtable is empty.
    pub fn flush_all(&self) -> Result<()> {
        while self.memtable.total_size() > 0 {
            self.flush()?;
        }
        Ok(())
    }

    /// Drops all in-memory state and deletes every SST file.
    pub fn clear(&self) -> Result<()> {
        self.memtable.clear()?;
        let mut levels = self.levels.write()?;
        for (_, sst) in levels.ssts.drain() {
            if let Err(e) = sst.remove_file() {
                tracing::warn!(sst_id = sst.id(), error = %e, "failed to delete sst file");
            }
        }
        levels.sst_ids.clear();
        levels.max_level = 0;
        Ok(())
    }

    /// Ordered scan of the whole store at `snapshot`.
    pub fn iter(&self, snapshot: u64) -> Result<LevelIterator> {
        let levels = self.levels.read()?;

        let mut sources: Vec<EntryStream> = Vec::new();
        sources.push(Box::new(self.memtable.iter(snapshot)?));

        let mut l0_sources: Vec<EntryStream> = Vec::new();
        if let Some(ids) = levels.sst_ids.get(&0) {
            for id in ids {
                let sst = levels
                    .ssts
                    .get(id)
                    .ok_or_else(|| errdata!("sst {id} missing from handle map"))?;
                l0_sources.push(Box::new(SstIterator::new(Arc::clone(sst), snapshot)));
            }
        }
        sources.push(Box::new(HeapIterator::new(l0_sources, false)));

        for ids in levels.sst_ids.range(1..).map(|(_, ids)| ids) {
            let mut ssts = Vec::with_capacity(ids.len());
            for id in ids {
                ssts.push(
                    levels
                        .ssts
                        .get(id)
                        .cloned()
                        .ok_or_else(|| errdata!("sst {id} missing from handle map"))?,
                );
            }
            sources.push(Box::new(ConcatIterator::new(ssts, snapshot)));
        }

        Ok(LevelIterator::new(sources))
    }

    /// Bounded scan over the contiguous key range matching a monotone
    /// predicate: a two-merge of the memtable sources over the SST sources.
    pub fn predicate_range(
        &self,
        snapshot: u64,
        predicate: &dyn Fn(&[u8]) -> std::cmp::Ordering,
    ) -> Result<TwoMergeIterator> {
        let levels = self.levels.read()?;
        let mem_heap = self.memtable.predicate_iter(snapshot, predicate)?;

        let mut sst_sources: Vec<EntryStream> = Vec::new();
        if let Some(ids) = levels.sst_ids.get(&0) {
            for id in ids {
                let sst = levels
                    .ssts
                    .get(id)
                    .ok_or_else(|| errdata!("sst {id} missing from handle map"))?;
                let entries = sst.predicate_entries(snapshot, predicate)?;
                if !entries.is_empty() {
                    sst_sources.push(stream_from_vec(entries));
                }
            }
        }
        for ids in levels.sst_ids.range(1..).map(|(_, ids)| ids) {
            for id in ids {
                let sst = levels
                    .ssts
                    .get(id)
                    .ok_or_else(|| errdata!("sst {id} missing from handle map"))?;
                let entries = sst.predicate_entries(snapshot, predicate)?;
                if !entries.is_empty() {
                    sst_sources.push(stream_from_vec(entries));
                }
            }
        }
        let sst_heap = HeapIterator::new(sst_sources, false);

        Ok(TwoMergeIterator::new(
            Box::new(mem_heap),
            Box::new(sst_heap),
            true,
        ))
    }

    /// Takes the level lock (shared) and both memtable locks (exclusive)
    /// for a transaction commit.
    pub fn begin_commit(&self) -> Result<CommitHandle<'_>> {
        let levels = self.levels.read()?;
        let guard = self.memtable.lock_for_commit()?;
        Ok(CommitHandle { levels, guard })
    }

    #[cfg(test)]
    pub(crate) fn level_layout(&self) -> Vec<(usize, Vec<(u64, Vec<u8>, Vec<u8>)>)> {
        let levels = self.levels.read().expect("levels lock poisoned");
        levels
            .sst_ids
            .iter()
            .map(|(level, ids)| {
                let tables = ids
                    .iter()
                    .map(|id| {
                        let sst = &levels.ssts[id];
                        (*id, sst.first_key().to_vec(), sst.last_key().to_vec())
                    })
                    .collect();
                (*level, tables)
            })
            .collect()
    }
}

/// Exclusive commit view: conflict checks and buffered-write application
/// happen atomically w.r.t. every other reader and writer.
pub struct CommitHandle<'a> {
    levels: RwLockReadGuard<'a, Levels>,
    guard: CommitGuard<'a>,
}

impl CommitHandle<'_> {
    /// True when any version of `key` newer than `txn_id` exists. The SST
    /// hierarchy is only consulted when something newer than this
    /// transaction has been flushed at all.
    pub fn conflicts(&self, key: &[u8], txn_id: u64, max_flushed: u64) -> Result<bool> {
        if let Some(newest) = self.guard.newest_txn_id(key) {
            if newest > txn_id {
                return Ok(true);
            }
        }
        if max_flushed > txn_id {
            if let Some(entry) = LsmEngine::search_ssts(&self.levels, key, 0)? {
                if entry.txn_id > txn_id {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    pub fn apply(&mut self, key: Vec<u8>, value: Vec<u8>, txn_id: u64) {
        self.guard.put(key, value, txn_id);
    }
}

/// Monotone predicate matching keys that start with `prefix`.
pub fn prefix_predicate(prefix: Vec<u8>) -> impl Fn(&[u8]) -> std::cmp::Ordering {
    move |key: &[u8]| {
        if key.starts_with(&prefix) {
            std::cmp::Ordering::Equal
        } else {
            key.cmp(prefix.as_slice())
        }
    }
}

/// The public store: an [`LsmEngine`] paired with its [`TxnManager`] and
/// an exclusive lock on the data directory.
///
/// Every auto-commit operation stamps a fresh transaction id. Opening
/// replays committed WAL transactions left over from a crash, flushes
/// them, and starts a fresh log. Dropping the store flushes all memtables
/// and persists the transaction-id checkpoint file.
pub struct Lsm {
    engine: Arc<LsmEngine>,
    txn_manager: Arc<TxnManager>,
    lock: Option<DirLock>,
}

impl Lsm {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_config(LsmConfig::new(dir))
    }

    pub fn open_with_config(config: LsmConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.dir)?;
        let lock = DirLock::acquire(&config.dir)?;

        let engine = Arc::new(LsmEngine::open(config.clone())?);
        let txn_manager = Arc::new(TxnManager::new(&config.dir)?);
        engine.set_txn_manager(Arc::downgrade(&txn_manager));

        // Crash recovery: replay committed transactions above the
        // checkpoint, make them durable, then start a fresh log.
        let recovered = txn_manager.check_recover()?;
        if let Some(max_replayed) = replay_recovered(&engine, &txn_manager, recovered)? {
            txn_manager.bump_next_txn_id(max_replayed + 1);
            engine.flush_all()?;
        }
        txn_manager.init_new_wal(&config)?;

        Ok(Self {
            engine,
            txn_manager,
            lock: Some(lock),
        })
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let snapshot = self.txn_manager.next_txn_id();
        Ok(self.engine.get(key, snapshot)?.map(|(value, _)| value))
    }

    pub fn get_batch(&self, keys: &[Vec<u8>]) -> Result<Vec<Option<Vec<u8>>>> {
        let snapshot = self.txn_manager.next_txn_id();
        Ok(self
            .engine
            .get_batch(keys, snapshot)?
            .into_iter()
            .map(|found| found.map(|(value, _)| value))
            .collect())
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let txn_id = self.txn_manager.next_txn_id();
        self.engine.put(key.to_vec(), value.to_vec(), txn_id)?;
        Ok(())
    }

    pub fn put_batch(&self, entries: Vec<(Vec<u8>, Vec<u8>)>) -> Result<()> {
        let txn_id = self.txn_manager.next_txn_id();
        self.engine.put_batch(entries, txn_id)?;
        Ok(())
    }

    pub fn remove(&self, key: &[u8]) -> Result<()> {
        let txn_id = self.txn_manager.next_txn_id();
        self.engine.remove(key.to_vec(), txn_id)?;
        Ok(())
    }

    pub fn remove_batch(&self, keys: Vec<Vec<u8>>) -> Result<()> {
        let txn_id = self.txn_manager.next_txn_id();
        self.engine.remove_batch(keys, txn_id)?;
        Ok(())
    }

    /// Ordered scan at `snapshot` (0 scans the newest state).
    pub fn iter(&self, snapshot: u64) -> Result<LevelIterator> {
        self.engine.iter(snapshot)
    }

    /// Scan over the contiguous range matching a monotone predicate.
    pub fn predicate_range<F>(&self, snapshot: u64, predicate: F) -> Result<TwoMergeIterator>
    where
        F: Fn(&[u8]) -> std::cmp::Ordering,
    {
        self.engine.predicate_range(snapshot, &predicate)
    }

    /// Scan over every key starting with `prefix`.
    pub fn prefix_scan(&self, prefix: &[u8], snapshot: u64) -> Result<TwoMergeIterator> {
        self.engine
            .predicate_range(snapshot, &prefix_predicate(prefix.to_vec()))
    }

    /// Starts an explicit transaction at the given isolation level.
    pub fn begin_txn(&self, isolation: IsolationLevel) -> Result<TxnContext> {
        TxnContext::begin(
            Arc::clone(&self.engine),
            Arc::clone(&self.txn_manager),
            isolation,
        )
    }

    pub fn flush(&self) -> Result<()> {
        self.engine.flush()?;
        Ok(())
    }

    pub fn flush_all(&self) -> Result<()> {
        self.engine.flush_all()
    }

    pub fn clear(&self) -> Result<()> {
        self.engine.clear()
    }

    #[cfg(test)]
    pub(crate) fn engine(&self) -> &Arc<LsmEngine> {
        &self.engine
    }

    /// Test-only crash simulation: release the directory lock but skip the
    /// graceful-shutdown flush and checkpoint persistence in Drop.
    #[cfg(test)]
    pub(crate) fn simulate_crash(mut self) {
        self.lock = None;
        std::mem::forget(self);
    }
}

impl Drop for Lsm {
    fn drop(&mut self) {
        if let Err(e) = self.engine.flush_all() {
            tracing::error!(error = %e, "failed to flush memtables on shutdown");
        }
        if let Err(e) = self.txn_manager.persist() {
            tracing::error!(error = %e, "failed to persist txn id file on shutdown");
        }
        self.txn_manager.shutdown_wal();
        // Dropping the DirLock handle releases the directory.
        self.lock.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::tmpfs::TempDir;
    use std::time::Duration;

    fn small_config(dir: &TempDir) -> LsmConfig {
        LsmConfig::new(dir.path())
            .per_mem_size_limit(1024)
            .total_mem_size_limit(4096)
            .block_size(256)
            .level_ratio(4)
            .wal_clean_interval(Duration::from_secs(3600))
    }

    #[test]
    fn test_point_reads_across_versions() {
        let dir = TempDir::new().expect("tempdir");
        let config = LsmConfig::new(dir.path()).wal_clean_interval(Duration::from_secs(3600));
        let lsm = Lsm::open_with_config(config).expect("open failed");
        let engine = Arc::clone(lsm.engine());

        engine.put(b"a".to_vec(), b"1".to_vec(), 10).expect("put");
        engine.put(b"b".to_vec(), b"2".to_vec(), 11).expect("put");
        engine.put(b"a".to_vec(), b"3".to_vec(), 12).expect("put");

        let newest = engine.get(b"a", 0).expect("get").expect("missing");
        assert_eq!(newest.0, b"3");

        let at11 = engine.get(b"a", 11).expect("get").expect("missing");
        assert_eq!(at11.0, b"1");

        assert!(engine.get(b"a", 5).expect("get").is_none());
    }

    #[test]
    fn test_scan_after_bulk_insert_and_remove() {
        let dir = TempDir::new().expect("tempdir");
        let config = LsmConfig::new(dir.path()).wal_clean_interval(Duration::from_secs(3600));
        let lsm = Lsm::open_with_config(config).expect("open failed");
        let engine = Arc::clone(lsm.engine());

        let entries: Vec<(Vec<u8>, Vec<u8>)> = (0..5000)
            .map(|i| {
                (
                    format!("key{}", i).into_bytes(),
                    format!("value{}", i).into_bytes(),
                )
            })
            .collect();
        engine.put_batch(entries, 10).expect("put_batch");

        let removals: Vec<Vec<u8>> = (0..1000).map(|i| format!("key{}", i).into_bytes()).collect();
        engine.remove_batch(removals, 11).expect("remove_batch");

        let mut expected: Vec<Vec<u8>> =
            (1000..5000).map(|i| format!("key{}", i).into_bytes()).collect();
        expected.sort();

        let scanned: Vec<Vec<u8>> = engine
            .iter(15)
            .expect("iter")
            .map(|r| r.expect("scan failed").0)
            .collect();
        assert_eq!(scanned.len(), 4000);
        assert_eq!(scanned, expected);

        // Removed keys resolve to absence, and their old values are still
        // visible below the tombstones.
        assert!(engine.get(b"key0", 15).expect("get").is_none());
        assert!(engine.get(b"key0", 10).expect("get").is_some());
    }

    #[test]
    fn test_prefix_scan() {
        let dir = TempDir::new().expect("tempdir");
        let config = LsmConfig::new(dir.path()).wal_clean_interval(Duration::from_secs(3600));
        let lsm = Lsm::open_with_config(config).expect("open failed");

        for key in ["apple", "apple2", "apricot", "banana", "berry", "cherry", "cherry2"] {
            lsm.put(key.as_bytes(), b"v").expect("put");
        }

        let matched: Vec<Vec<u8>> = lsm
            .prefix_scan(b"ap", 0)
            .expect("prefix scan")
            .map(|r| r.expect("scan failed").key)
            .collect();
        assert_eq!(
            matched,
            vec![b"apple".to_vec(), b"apple2".to_vec(), b"apricot".to_vec()]
        );
    }

    #[test]
    fn test_prefix_scan_spans_memtable_and_sst() {
        let dir = TempDir::new().expect("tempdir");
        let lsm = Lsm::open_with_config(small_config(&dir)).expect("open failed");

        lsm.put(b"apple", b"on_disk").expect("put");
        lsm.flush_all().expect("flush");
        lsm.put(b"apricot", b"in_memory").expect("put");
        lsm.put(b"apple", b"updated").expect("put");

        let matched: Vec<(Vec<u8>, Vec<u8>)> = lsm
            .prefix_scan(b"ap", 0)
            .expect("prefix scan")
            .map(|r| {
                let e = r.expect("scan failed");
                (e.key, e.value)
            })
            .collect();
        assert_eq!(
            matched,
            vec![
                (b"apple".to_vec(), b"updated".to_vec()),
                (b"apricot".to_vec(), b"in_memory".to_vec())
            ]
        );
    }

    #[test]
    fn test_compaction_produces_disjoint_l1() {
        let dir = TempDir::new().expect("tempdir");
        let lsm = Lsm::open_with_config(small_config(&dir)).expect("open failed");
        let engine = Arc::clone(lsm.engine());

        // Enough data to force several flushes and at least one L0 -> L1
        // compaction (per_mem = 1KB, level_ratio = 4).
        let mut last_value = std::collections::HashMap::new();
        for round in 0..4 {
            for i in 0..120 {
                let key = format!("key{:04}", i);
                let value = format!("round{}_value{:04}", round, i);
                lsm.put(key.as_bytes(), value.as_bytes()).expect("put");
                last_value.insert(key, value);
            }
            lsm.flush_all().expect("flush");
        }

        let layout = engine.level_layout();
        let deep_tables: usize = layout
            .iter()
            .filter(|(level, _)| *level >= 1)
            .map(|(_, tables)| tables.len())
            .sum();
        assert!(deep_tables > 0, "no compaction happened: {layout:?}");

        // Levels >= 1 hold disjoint, sorted ranges.
        for (level, tables) in &layout {
            if *level == 0 {
                continue;
            }
            for pair in tables.windows(2) {
                assert!(
                    pair[0].2 < pair[1].1,
                    "overlapping tables at level {level}: {pair:?}"
                );
            }
        }

        // Every key still reads its last value.
        for (key, value) in &last_value {
            let found = lsm.get(key.as_bytes()).expect("get").expect("key lost");
            assert_eq!(found, value.as_bytes(), "wrong value for {key}");
        }
    }

    #[test]
    fn test_reopen_reads_persisted_data() {
        let dir = TempDir::new().expect("tempdir");
        {
            let lsm = Lsm::open_with_config(small_config(&dir)).expect("open failed");
            for i in 0..50 {
                lsm.put(format!("key{}", i).as_bytes(), format!("value{}", i).as_bytes())
                    .expect("put");
            }
        }

        let lsm = Lsm::open_with_config(small_config(&dir)).expect("reopen failed");
        for i in 0..50 {
            assert_eq!(
                lsm.get(format!("key{}", i).as_bytes()).expect("get"),
                Some(format!("value{}", i).into_bytes())
            );
        }
    }

    #[test]
    fn test_crash_recovery_replays_wal() {
        let dir = TempDir::new().expect("tempdir");
        let committed_txn_id;
        {
            let lsm = Lsm::open_with_config(small_config(&dir)).expect("open failed");
            let mut txn = lsm
                .begin_txn(IsolationLevel::RepeatableRead)
                .expect("begin txn");
            txn.put(b"durable_key", b"durable_value").expect("txn put");
            txn.commit().expect("commit failed");
            committed_txn_id = txn.txn_id();

            // Simulate a crash: no flush, no checkpoint persistence, no
            // clean shutdown.
            lsm.simulate_crash();
        }

        let lsm = Lsm::open_with_config(small_config(&dir)).expect("recovery open failed");
        assert_eq!(
            lsm.get(b"durable_key").expect("get"),
            Some(b"durable_value".to_vec())
        );

        // The persisted next txn id moved past the committed transaction.
        let tranc_id_file = std::fs::read(dir.path().join("tranc_id")).expect("tranc_id missing");
        let next_txn_id = u64::from_be_bytes(tranc_id_file[0..8].try_into().expect("u64"));
        assert!(
            next_txn_id > committed_txn_id,
            "next txn id {next_txn_id} not past committed {committed_txn_id}"
        );
    }

    #[test]
    fn test_uncommitted_txn_not_recovered() {
        let dir = TempDir::new().expect("tempdir");
        {
            let lsm = Lsm::open_with_config(small_config(&dir)).expect("open failed");
            let mut txn = lsm
                .begin_txn(IsolationLevel::RepeatableRead)
                .expect("begin txn");
            txn.put(b"ghost", b"value").expect("txn put");
            // No commit: the buffered write never reached the engine, and
            // the WAL holds no commit record for it.
            drop(txn);
            lsm.simulate_crash();
        }

        let lsm = Lsm::open_with_config(small_config(&dir)).expect("recovery open failed");
        assert_eq!(lsm.get(b"ghost").expect("get"), None);
    }

    #[test]
    fn test_repeatable_read_conflict_aborts() {
        let dir = TempDir::new().expect("tempdir");
        let lsm = Lsm::open_with_config(small_config(&dir)).expect("open failed");

        lsm.put(b"k", b"base").expect("put");

        let mut t1 = lsm
            .begin_txn(IsolationLevel::RepeatableRead)
            .expect("begin t1");
        assert_eq!(t1.get(b"k").expect("t1 read"), Some(b"base".to_vec()));

        let mut t2 = lsm
            .begin_txn(IsolationLevel::RepeatableRead)
            .expect("begin t2");
        t2.put(b"k", b"from_t2").expect("t2 put");
        t2.commit().expect("t2 commit");

        t1.put(b"k", b"from_t1").expect("t1 put");
        match t1.commit() {
            Err(Error::Serialization) => {}
            other => panic!("expected serialization failure, got {other:?}"),
        }
        assert_eq!(t1.state(), crate::txn::TxnState::Aborted);

        // The winner's write is the visible one.
        assert_eq!(lsm.get(b"k").expect("get"), Some(b"from_t2".to_vec()));
    }

    #[test]
    fn test_txn_read_your_writes() {
        let dir = TempDir::new().expect("tempdir");
        let lsm = Lsm::open_with_config(small_config(&dir)).expect("open failed");

        for isolation in [
            IsolationLevel::ReadUncommitted,
            IsolationLevel::ReadCommitted,
            IsolationLevel::RepeatableRead,
            IsolationLevel::Serializable,
        ] {
            let key = format!("key_{}", isolation);
            let mut txn = lsm.begin_txn(isolation).expect("begin txn");
            txn.put(key.as_bytes(), b"own_write").expect("txn put");
            assert_eq!(
                txn.get(key.as_bytes()).expect("txn get"),
                Some(b"own_write".to_vec()),
                "read-your-write failed under {isolation}"
            );
            txn.commit().expect("commit");
        }
    }

    #[test]
    fn test_repeatable_read_pins_first_read() {
        let dir = TempDir::new().expect("tempdir");
        let lsm = Lsm::open_with_config(small_config(&dir)).expect("open failed");
        lsm.put(b"k", b"initial").expect("put");

        let mut t1 = lsm
            .begin_txn(IsolationLevel::RepeatableRead)
            .expect("begin t1");
        assert_eq!(t1.get(b"k").expect("read"), Some(b"initial".to_vec()));

        let mut t2 = lsm
            .begin_txn(IsolationLevel::RepeatableRead)
            .expect("begin t2");
        t2.put(b"k", b"changed").expect("t2 put");
        t2.commit().expect("t2 commit");

        // Still the pinned value.
        assert_eq!(t1.get(b"k").expect("read"), Some(b"initial".to_vec()));
        t1.abort().expect("abort");
    }

    #[test]
    fn test_read_uncommitted_abort_rolls_back() {
        let dir = TempDir::new().expect("tempdir");
        let lsm = Lsm::open_with_config(small_config(&dir)).expect("open failed");
        lsm.put(b"k", b"original").expect("put");

        let mut txn = lsm
            .begin_txn(IsolationLevel::ReadUncommitted)
            .expect("begin txn");
        txn.put(b"k", b"dirty").expect("txn put");
        // Dirty write is immediately visible outside the transaction.
        assert_eq!(lsm.get(b"k").expect("get"), Some(b"dirty".to_vec()));

        txn.abort().expect("abort");
        assert_eq!(lsm.get(b"k").expect("get"), Some(b"original".to_vec()));
    }

    #[test]
    fn test_tombstone_masking_until_new_put() {
        let dir = TempDir::new().expect("tempdir");
        let lsm = Lsm::open_with_config(small_config(&dir)).expect("open failed");

        lsm.put(b"k", b"v1").expect("put");
        lsm.remove(b"k").expect("remove");
        assert_eq!(lsm.get(b"k").expect("get"), None);

        // Masked through a flush as well.
        lsm.flush_all().expect("flush");
        assert_eq!(lsm.get(b"k").expect("get"), None);

        lsm.put(b"k", b"v2").expect("put");
        assert_eq!(lsm.get(b"k").expect("get"), Some(b"v2".to_vec()));
    }

    #[test]
    fn test_get_batch() {
        let dir = TempDir::new().expect("tempdir");
        let lsm = Lsm::open_with_config(small_config(&dir)).expect("open failed");

        lsm.put(b"a", b"1").expect("put");
        lsm.put(b"b", b"2").expect("put");
        lsm.flush_all().expect("flush");
        lsm.put(b"c", b"3").expect("put");
        lsm.remove(b"b").expect("remove");

        let results = lsm
            .get_batch(&[b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()])
            .expect("get_batch");
        assert_eq!(
            results,
            vec![Some(b"1".to_vec()), None, Some(b"3".to_vec()), None]
        );
    }

    #[test]
    fn test_clear() {
        let dir = TempDir::new().expect("tempdir");
        let lsm = Lsm::open_with_config(small_config(&dir)).expect("open failed");

        for i in 0..100 {
            lsm.put(format!("key{}", i).as_bytes(), b"v").expect("put");
        }
        lsm.flush_all().expect("flush");
        lsm.clear().expect("clear");

        assert_eq!(lsm.get(b"key0").expect("get"), None);
        assert_eq!(lsm.iter(0).expect("iter").count(), 0);
    }

    #[test]
    fn test_exclusive_directory_access() {
        let dir = TempDir::new().expect("tempdir");
        let _lsm = Lsm::open_with_config(small_config(&dir)).expect("open failed");
        assert!(
            Lsm::open_with_config(small_config(&dir)).is_err(),
            "second open of the same directory must fail"
        );
    }

    #[test]
    fn test_compaction_preserves_reads() {
        let dir = TempDir::new().expect("tempdir");
        let config = small_config(&dir).level_ratio(2);
        let lsm = Lsm::open_with_config(config).expect("open failed");
        let engine = Arc::clone(lsm.engine());

        // Interleave overwrites with flushes so compaction has version
        // shadows to resolve.
        for round in 0..6 {
            for i in 0..40 {
                let key = format!("key{:02}", i);
                let value = format!("r{}v{}", round, i);
                lsm.put(key.as_bytes(), value.as_bytes()).expect("put");
            }
            lsm.flush_all().expect("flush");
        }

        for i in 0..40 {
            let key = format!("key{:02}", i);
            let expected = format!("r5v{}", i);
            let found = engine
                .get(key.as_bytes(), 0)
                .expect("get")
                .expect("key lost after compaction");
            assert_eq!(found.0, expected.as_bytes());
        }
    }
}
