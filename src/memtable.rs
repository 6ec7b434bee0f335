//! The in-memory mutable tier: one active skip list plus a queue of frozen
//! skip lists awaiting flush.
//!
//! Mutations land in the active list under its write lock. Whenever a
//! mutation pushes the active list past the per-table byte threshold, the
//! list is frozen: moved to the front of the frozen deque (newest first)
//! and replaced with a fresh one. Reads check the active list, then frozen
//! lists newest to oldest, so the first hit is always the most recent
//! version.
//!
//! Lock order is frozen before active wherever both are held; read paths
//! take the locks one at a time and never nest them.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockWriteGuard};

use crate::error::Result;
use crate::iterator::{stream_from_vec, Entry, EntryStream, HeapIterator};
use crate::skiplist::SkipList;
use crate::sst::SstBuilder;

pub struct MemTable {
    active: RwLock<SkipList>,
    frozen: RwLock<VecDeque<Arc<SkipList>>>,
    frozen_bytes: AtomicUsize,
    per_table_limit: usize,
}

impl MemTable {
    pub fn new(per_table_limit: usize) -> Self {
        Self {
            active: RwLock::new(SkipList::new()),
            frozen: RwLock::new(VecDeque::new()),
            frozen_bytes: AtomicUsize::new(0),
            per_table_limit,
        }
    }

    pub fn put(&self, key: Vec<u8>, value: Vec<u8>, txn_id: u64) -> Result<()> {
        let needs_freeze = {
            let mut active = self.active.write()?;
            active.put(key, value, txn_id);
            active.size_bytes() >= self.per_table_limit
        };
        if needs_freeze {
            self.freeze_active()?;
        }
        Ok(())
    }

    pub fn put_batch(&self, entries: Vec<(Vec<u8>, Vec<u8>)>, txn_id: u64) -> Result<()> {
        let needs_freeze = {
            let mut active = self.active.write()?;
            for (key, value) in entries {
                active.put(key, value, txn_id);
            }
            active.size_bytes() >= self.per_table_limit
        };
        if needs_freeze {
            self.freeze_active()?;
        }
        Ok(())
    }

    /// Deletion is a tombstone put: an empty value masks older versions.
    pub fn remove(&self, key: Vec<u8>, txn_id: u64) -> Result<()> {
        self.put(key, Vec::new(), txn_id)
    }

    pub fn remove_batch(&self, keys: Vec<Vec<u8>>, txn_id: u64) -> Result<()> {
        self.put_batch(keys.into_iter().map(|k| (k, Vec::new())).collect(), txn_id)
    }

    /// Resolves `key` at `snapshot`. A hit with an empty value is a
    /// tombstone; projecting it to absence is the caller's concern.
    pub fn get(&self, key: &[u8], snapshot: u64) -> Result<Option<(Vec<u8>, u64)>> {
        {
            let active = self.active.read()?;
            if let Some(found) = active.get(key, snapshot) {
                return Ok(Some(found));
            }
        }
        let frozen = self.frozen.read()?;
        for table in frozen.iter() {
            if let Some(found) = table.get(key, snapshot) {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    /// Sweeps all tables once per tier, short-circuiting when every key has
    /// been resolved.
    pub fn get_batch(
        &self,
        keys: &[Vec<u8>],
        snapshot: u64,
    ) -> Result<Vec<Option<(Vec<u8>, u64)>>> {
        let mut results: Vec<Option<(Vec<u8>, u64)>> = vec![None; keys.len()];
        let mut unresolved = keys.len();

        {
            let active = self.active.read()?;
            for (i, key) in keys.iter().enumerate() {
                if let Some(found) = active.get(key, snapshot) {
                    results[i] = Some(found);
                    unresolved -= 1;
                }
            }
        }
        if unresolved == 0 {
            return Ok(results);
        }

        let frozen = self.frozen.read()?;
        for table in frozen.iter() {
            for (i, key) in keys.iter().enumerate() {
                if results[i].is_none() {
                    if let Some(found) = table.get(key, snapshot) {
                        results[i] = Some(found);
                        unresolved -= 1;
                    }
                }
            }
            if unresolved == 0 {
                break;
            }
        }
        Ok(results)
    }

    /// Moves the active list to the front of the frozen queue and installs
    /// a fresh active list.
    pub fn freeze_active(&self) -> Result<()> {
        let mut frozen = self.frozen.write()?;
        let mut active = self.active.write()?;
        if active.size_bytes() == 0 {
            return Ok(());
        }
        let old = std::mem::take(&mut *active);
        self.frozen_bytes.fetch_add(old.size_bytes(), Ordering::SeqCst);
        frozen.push_front(Arc::new(old));
        Ok(())
    }

    /// Drains the oldest frozen list into `builder`, collecting the txn ids
    /// of commit-marker entries into `marker_txn_ids`. Freezes the active
    /// list first when nothing is frozen yet. Returns false when there is
    /// nothing to flush.
    pub fn flush_oldest(
        &self,
        builder: &mut SstBuilder,
        marker_txn_ids: &mut Vec<u64>,
    ) -> Result<bool> {
        let mut frozen = self.frozen.write()?;
        if frozen.is_empty() {
            let mut active = self.active.write()?;
            if active.size_bytes() == 0 {
                return Ok(false);
            }
            let old = std::mem::take(&mut *active);
            self.frozen_bytes.fetch_add(old.size_bytes(), Ordering::SeqCst);
            frozen.push_front(Arc::new(old));
        }

        let Some(oldest) = frozen.pop_back() else {
            return Ok(false);
        };
        self.frozen_bytes
            .fetch_sub(oldest.size_bytes(), Ordering::SeqCst);

        for (key, value, txn_id) in oldest.iter() {
            if key.is_empty() && value.is_empty() {
                marker_txn_ids.push(txn_id);
            }
            builder.add(key, value, txn_id);
        }
        Ok(true)
    }

    pub fn active_size(&self) -> usize {
        self.active.read().map(|a| a.size_bytes()).unwrap_or(0)
    }

    pub fn frozen_size(&self) -> usize {
        self.frozen_bytes.load(Ordering::SeqCst)
    }

    pub fn total_size(&self) -> usize {
        self.active_size() + self.frozen_size()
    }

    pub fn frozen_count(&self) -> usize {
        self.frozen.read().map(|f| f.len()).unwrap_or(0)
    }

    pub fn clear(&self) -> Result<()> {
        let mut frozen = self.frozen.write()?;
        let mut active = self.active.write()?;
        active.clear();
        frozen.clear();
        self.frozen_bytes.store(0, Ordering::SeqCst);
        Ok(())
    }

    /// Snapshot-filtered merge iterator over all tables, newest first so the
    /// heap resolves key collisions toward recent writes.
    pub fn iter(&self, snapshot: u64) -> Result<HeapIterator> {
        let sources = self.collect_sources(|table| table.visible_entries(snapshot))?;
        Ok(HeapIterator::new(sources, false))
    }

    /// Same merge shape for monotone-predicate scans.
    pub fn predicate_iter(
        &self,
        snapshot: u64,
        predicate: &dyn Fn(&[u8]) -> std::cmp::Ordering,
    ) -> Result<HeapIterator> {
        let sources =
            self.collect_sources(|table| table.predicate_entries(snapshot, predicate))?;
        Ok(HeapIterator::new(sources, false))
    }

    fn collect_sources(
        &self,
        collect: impl Fn(&SkipList) -> Vec<Entry>,
    ) -> Result<Vec<EntryStream>> {
        let frozen = self.frozen.read()?;
        let active = self.active.read()?;

        let mut sources = Vec::with_capacity(1 + frozen.len());
        sources.push(stream_from_vec(collect(&active)));
        for table in frozen.iter() {
            sources.push(stream_from_vec(collect(table)));
        }
        Ok(sources)
    }

    /// Takes both write locks for a transaction commit, so the conflict
    /// check and the buffered writes apply atomically w.r.t. other readers
    /// and writers.
    pub fn lock_for_commit(&self) -> Result<CommitGuard<'_>> {
        let frozen = self.frozen.write()?;
        let active = self.active.write()?;
        Ok(CommitGuard { frozen, active })
    }
}

/// Exclusive view of both memtable tiers during a commit.
pub struct CommitGuard<'a> {
    frozen: RwLockWriteGuard<'a, VecDeque<Arc<SkipList>>>,
    active: RwLockWriteGuard<'a, SkipList>,
}

impl CommitGuard<'_> {
    /// Txn id of the newest in-memory version of `key`, if any.
    pub fn newest_txn_id(&self, key: &[u8]) -> Option<u64> {
        if let Some((_, txn_id)) = self.active.get(key, 0) {
            return Some(txn_id);
        }
        self.frozen
            .iter()
            .find_map(|table| table.get(key, 0).map(|(_, txn_id)| txn_id))
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>, txn_id: u64) {
        self.active.put(key, value, txn_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_remove() {
        let memtable = MemTable::new(1024 * 1024);
        memtable
            .put(b"key1".to_vec(), b"value1".to_vec(), 1)
            .expect("put failed");

        assert_eq!(
            memtable.get(b"key1", 0).expect("get failed"),
            Some((b"value1".to_vec(), 1))
        );
        assert_eq!(memtable.get(b"key2", 0).expect("get failed"), None);

        memtable.remove(b"key1".to_vec(), 2).expect("remove failed");
        // The tombstone is the newest version.
        assert_eq!(
            memtable.get(b"key1", 0).expect("get failed"),
            Some((Vec::new(), 2))
        );
        // The old version is still visible below the tombstone.
        assert_eq!(
            memtable.get(b"key1", 1).expect("get failed"),
            Some((b"value1".to_vec(), 1))
        );
    }

    #[test]
    fn test_freeze_on_threshold() {
        let memtable = MemTable::new(64);
        for i in 0..16 {
            memtable
                .put(format!("key{:02}", i).into_bytes(), b"value".to_vec(), i)
                .expect("put failed");
        }
        assert!(memtable.frozen_count() > 0, "threshold should freeze");

        // Keys in frozen tables stay visible.
        assert_eq!(
            memtable.get(b"key00", 0).expect("get failed"),
            Some((b"value".to_vec(), 0))
        );
    }

    #[test]
    fn test_newest_frozen_wins() {
        let memtable = MemTable::new(1024 * 1024);
        memtable.put(b"k".to_vec(), b"old".to_vec(), 1).expect("put");
        memtable.freeze_active().expect("freeze");
        memtable.put(b"k".to_vec(), b"new".to_vec(), 2).expect("put");
        memtable.freeze_active().expect("freeze");

        assert_eq!(
            memtable.get(b"k", 0).expect("get"),
            Some((b"new".to_vec(), 2))
        );
    }

    #[test]
    fn test_get_batch() {
        let memtable = MemTable::new(1024 * 1024);
        memtable.put(b"a".to_vec(), b"1".to_vec(), 1).expect("put");
        memtable.freeze_active().expect("freeze");
        memtable.put(b"b".to_vec(), b"2".to_vec(), 2).expect("put");

        let results = memtable
            .get_batch(&[b"a".to_vec(), b"b".to_vec(), b"c".to_vec()], 0)
            .expect("get_batch failed");
        assert_eq!(results[0], Some((b"1".to_vec(), 1)));
        assert_eq!(results[1], Some((b"2".to_vec(), 2)));
        assert_eq!(results[2], None);
    }

    #[test]
    fn test_flush_oldest_collects_markers() {
        let memtable = MemTable::new(1024 * 1024);
        memtable.put(b"a".to_vec(), b"1".to_vec(), 5).expect("put");
        memtable.put(Vec::new(), Vec::new(), 6).expect("put marker");
        memtable.freeze_active().expect("freeze");

        let mut builder = SstBuilder::new(4096, 64, 0.1);
        let mut markers = Vec::new();
        let flushed = memtable
            .flush_oldest(&mut builder, &mut markers)
            .expect("flush failed");
        assert!(flushed);
        assert_eq!(markers, vec![6]);
        assert_eq!(memtable.frozen_count(), 0);
        assert_eq!(memtable.total_size(), 0);
    }

    #[test]
    fn test_flush_oldest_freezes_active_when_needed() {
        let memtable = MemTable::new(1024 * 1024);
        memtable.put(b"a".to_vec(), b"1".to_vec(), 1).expect("put");

        let mut builder = SstBuilder::new(4096, 64, 0.1);
        let mut markers = Vec::new();
        assert!(memtable
            .flush_oldest(&mut builder, &mut markers)
            .expect("flush failed"));
        assert_eq!(memtable.total_size(), 0);

        // Nothing left to flush.
        let mut builder = SstBuilder::new(4096, 64, 0.1);
        assert!(!memtable
            .flush_oldest(&mut builder, &mut markers)
            .expect("flush failed"));
    }

    #[test]
    fn test_iter_merges_tiers() {
        let memtable = MemTable::new(1024 * 1024);
        memtable.put(b"k".to_vec(), b"old".to_vec(), 1).expect("put");
        memtable.freeze_active().expect("freeze");
        memtable.put(b"k".to_vec(), b"new".to_vec(), 2).expect("put");
        memtable.put(b"z".to_vec(), b"zz".to_vec(), 3).expect("put");

        let entries: Vec<Entry> = memtable
            .iter(0)
            .expect("iter failed")
            .map(|r| r.expect("merge failed"))
            .collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].value, b"new");
        assert_eq!(entries[1].key, b"z");
    }

    #[test]
    fn test_commit_guard_conflict_view() {
        let memtable = MemTable::new(1024 * 1024);
        memtable.put(b"k".to_vec(), b"v".to_vec(), 7).expect("put");

        let mut guard = memtable.lock_for_commit().expect("lock failed");
        assert_eq!(guard.newest_txn_id(b"k"), Some(7));
        assert_eq!(guard.newest_txn_id(b"other"), None);

        guard.put(b"k".to_vec(), b"v2".to_vec(), 9);
        drop(guard);

        assert_eq!(
            memtable.get(b"k", 0).expect("get"),
            Some((b"v2".to_vec(), 9))
        );
    }
}
