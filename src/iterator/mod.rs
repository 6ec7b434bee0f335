//! Merge iterators for LSM scan operations.
//!
//! Every data source (skip list, block, SST, level) feeds the mergers as a
//! stream of [`Entry`] values ordered ascending by key and, within one key,
//! descending by transaction id. Snapshot filtering happens at the source:
//! a stream built for snapshot `T != 0` never yields a version with
//! `txn_id > T`, and yields at most one version per key.
//!
//! The mergers compose:
//!
//! - [`HeapIterator`] folds N streams into one, resolving key collisions
//!   toward the newest visible version (then toward the newer source).
//! - [`TwoMergeIterator`] merges two streams with the first taking
//!   precedence on equal keys.
//! - [`ConcatIterator`] chains disjoint-range SSTs.
//! - [`LevelIterator`] is the engine-wide scan: one memtable source, one L0
//!   source, one source per deeper level, with tombstones filtered.
//!
//! Exhausted iterators simply stop yielding; two finished iterators are
//! indistinguishable.

pub mod concat;
pub mod heap;
pub mod level;
pub mod merge;

pub use concat::ConcatIterator;
pub use heap::HeapIterator;
pub use level::LevelIterator;
pub use merge::TwoMergeIterator;

use crate::error::Result;

/// One key version. An empty value marks a tombstone; the pair of empty key
/// and empty value is a transaction commit marker riding the flush path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub txn_id: u64,
}

impl Entry {
    pub fn new(key: Vec<u8>, value: Vec<u8>, txn_id: u64) -> Self {
        Self { key, value, txn_id }
    }

    /// Tombstones (and commit markers) carry an empty value.
    pub fn is_tombstone(&self) -> bool {
        self.value.is_empty()
    }
}

/// A boxed source stream feeding the merge iterators.
pub type EntryStream = Box<dyn Iterator<Item = Result<Entry>> + Send>;

/// Wraps an already-materialized entry list as a stream.
pub fn stream_from_vec(entries: Vec<Entry>) -> EntryStream {
    Box::new(entries.into_iter().map(Ok))
}
