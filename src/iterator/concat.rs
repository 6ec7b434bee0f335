//! Sequential iteration over disjoint-range SSTs.

use std::sync::Arc;

use super::Entry;
use crate::error::Result;
use crate::sst::{Sst, SstIterator};

/// Chains SSTs whose key ranges are disjoint and sorted (a level at depth
/// >= 1), advancing to the next table when the current one ends. The
/// combined stream is therefore globally ordered.
pub struct ConcatIterator {
    ssts: Vec<Arc<Sst>>,
    snapshot: u64,
    next_sst: usize,
    current: Option<SstIterator>,
}

impl ConcatIterator {
    pub fn new(ssts: Vec<Arc<Sst>>, snapshot: u64) -> Self {
        Self {
            ssts,
            snapshot,
            next_sst: 0,
            current: None,
        }
    }
}

impl Iterator for ConcatIterator {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(iter) = &mut self.current {
                if let Some(item) = iter.next() {
                    return Some(item);
                }
                self.current = None;
            }

            if self.next_sst >= self.ssts.len() {
                return None;
            }
            self.current = Some(SstIterator::new(
                Arc::clone(&self.ssts[self.next_sst]),
                self.snapshot,
            ));
            self.next_sst += 1;
        }
    }
}
