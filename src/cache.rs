//! Concurrency-safe block cache with an LRU-K eviction policy.
//!
//! Entries are keyed by `(sst_id, block_idx)`. Two FIFO-ordered residency
//! queues split the population by access count: a *young* queue for entries
//! accessed fewer than K times and a *hot* queue for the rest. A hit
//! increments the count and moves the entry to the front of its queue,
//! promoting young entries into hot exactly when they reach K accesses.
//! Under capacity pressure the young queue's tail is evicted first; the hot
//! tail only goes once young is empty, so scan traffic cannot flush the
//! working set.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::block::Block;

type CacheKey = (u64, usize);

struct CacheSlot {
    block: Arc<Block>,
    access_count: u64,
}

struct CacheInner {
    slots: HashMap<CacheKey, CacheSlot>,
    /// Entries with access count < K, most recently used at the front.
    young: VecDeque<CacheKey>,
    /// Entries with access count >= K, most recently used at the front.
    hot: VecDeque<CacheKey>,
    hits: u64,
    total: u64,
}

pub struct BlockCache {
    capacity: usize,
    k: u64,
    inner: Mutex<CacheInner>,
}

impl BlockCache {
    pub fn new(capacity: usize, k: usize) -> Self {
        Self {
            capacity,
            k: k.max(1) as u64,
            inner: Mutex::new(CacheInner {
                slots: HashMap::new(),
                young: VecDeque::new(),
                hot: VecDeque::new(),
                hits: 0,
                total: 0,
            }),
        }
    }

    pub fn get(&self, sst_id: u64, block_idx: usize) -> Option<Arc<Block>> {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.total += 1;

        let key = (sst_id, block_idx);
        if !inner.slots.contains_key(&key) {
            return None;
        }
        inner.hits += 1;
        self.touch(&mut inner, key);
        inner.slots.get(&key).map(|slot| Arc::clone(&slot.block))
    }

    pub fn put(&self, sst_id: u64, block_idx: usize, block: Arc<Block>) {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        let key = (sst_id, block_idx);

        if let Some(slot) = inner.slots.get_mut(&key) {
            slot.block = block;
            self.touch(&mut inner, key);
            return;
        }

        if inner.slots.len() >= self.capacity {
            let victim = match inner.young.pop_back() {
                Some(victim) => Some(victim),
                None => inner.hot.pop_back(),
            };
            if let Some(victim) = victim {
                inner.slots.remove(&victim);
            }
        }

        inner.slots.insert(
            key,
            CacheSlot {
                block,
                access_count: 1,
            },
        );
        inner.young.push_front(key);
    }

    /// Fraction of lookups served from the cache.
    pub fn hit_rate(&self) -> f64 {
        let inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        if inner.total == 0 {
            0.0
        } else {
            inner.hits as f64 / inner.total as f64
        }
    }

    fn touch(&self, inner: &mut CacheInner, key: CacheKey) {
        let count = match inner.slots.get_mut(&key) {
            Some(slot) => {
                slot.access_count += 1;
                slot.access_count
            }
            None => return,
        };

        if count < self.k {
            Self::move_to_front(&mut inner.young, key);
        } else if count == self.k {
            Self::remove_key(&mut inner.young, key);
            inner.hot.push_front(key);
        } else {
            Self::move_to_front(&mut inner.hot, key);
        }
    }

    fn move_to_front(queue: &mut VecDeque<CacheKey>, key: CacheKey) {
        Self::remove_key(queue, key);
        queue.push_front(key);
    }

    fn remove_key(queue: &mut VecDeque<CacheKey>, key: CacheKey) {
        if let Some(pos) = queue.iter().position(|&k| k == key) {
            queue.remove(pos);
        }
    }
}
