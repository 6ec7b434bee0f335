//! K-way merge over sorted entry streams.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use super::{Entry, EntryStream};
use crate::error::{Error, Result};

/// One buffered head-of-stream inside the heap. Pop order is key ascending;
/// among equal keys the larger txn id wins, then the smaller source index
/// (sources are registered newest-first, so index order encodes recency
/// across tiers and tables).
struct HeapEntry {
    key: Vec<u8>,
    value: Vec<u8>,
    txn_id: u64,
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap pops the greatest element, so "greater" means
        // "should be emitted first".
        other
            .key
            .cmp(&self.key)
            .then(self.txn_id.cmp(&other.txn_id))
            .then(other.source.cmp(&self.source))
    }
}

/// Folds N sorted streams into one ordered stream, emitting each logical key
/// exactly once: the winning version is the newest visible one, and every
/// other queued version of that key is consumed silently.
pub struct HeapIterator {
    sources: Vec<EntryStream>,
    heap: BinaryHeap<HeapEntry>,
    last_key: Option<Vec<u8>>,
    skip_tombstones: bool,
    pending_error: Option<Error>,
}

impl HeapIterator {
    pub fn new(sources: Vec<EntryStream>, skip_tombstones: bool) -> Self {
        let mut iter = Self {
            sources,
            heap: BinaryHeap::new(),
            last_key: None,
            skip_tombstones,
            pending_error: None,
        };
        for source in 0..iter.sources.len() {
            iter.refill(source);
        }
        iter
    }

    /// Pulls the next entry of `source` into the heap, stashing any error
    /// for the next `next()` call.
    fn refill(&mut self, source: usize) {
        match self.sources[source].next() {
            Some(Ok(entry)) => self.heap.push(HeapEntry {
                key: entry.key,
                value: entry.value,
                txn_id: entry.txn_id,
                source,
            }),
            Some(Err(e)) => {
                if self.pending_error.is_none() {
                    self.pending_error = Some(e);
                }
            }
            None => {}
        }
    }
}

impl Iterator for HeapIterator {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(e) = self.pending_error.take() {
            return Some(Err(e));
        }

        while let Some(top) = self.heap.pop() {
            self.refill(top.source);

            // Consume every further version of an already-emitted key.
            if self.last_key.as_deref() == Some(top.key.as_slice()) {
                continue;
            }
            self.last_key = Some(top.key.clone());

            if self.skip_tombstones && top.value.is_empty() {
                continue;
            }
            return Some(Ok(Entry::new(top.key, top.value, top.txn_id)));
        }

        self.pending_error.take().map(Err)
    }
}
