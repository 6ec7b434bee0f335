//! Engine-wide ordered scan across all tiers.

use super::heap::HeapIterator;
use super::EntryStream;
use crate::error::Result;

/// Merges one sub-iterator per logical tier: the memtable heap, the L0
/// heap, and one concat iterator per deeper level, registered in that order
/// so newer tiers win ties at equal key and txn id. On each step the
/// globally smallest key is emitted (ties to the largest visible txn id)
/// and every other version of that key is consumed. Tombstones and commit
/// markers are filtered out, so consumers see each live key exactly once,
/// in strictly ascending order.
pub struct LevelIterator {
    inner: HeapIterator,
}

impl LevelIterator {
    /// `sources` must be ordered newest tier first.
    pub(crate) fn new(sources: Vec<EntryStream>) -> Self {
        Self {
            inner: HeapIterator::new(sources, true),
        }
    }
}

impl Iterator for LevelIterator {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.inner.next()? {
            Ok(entry) => Some(Ok((entry.key, entry.value))),
            Err(e) => Some(Err(e)),
        }
    }
}
