//! Lazy block-by-block iteration over one SST.

use std::sync::Arc;

use super::Sst;
use crate::block::BlockIterator;
use crate::error::Result;
use crate::iterator::Entry;

/// Walks an SST's data blocks in order, loading each through the block
/// cache on demand. Snapshot filtering happens inside the block iterators,
/// so at most one version per key is yielded.
pub struct SstIterator {
    sst: Arc<Sst>,
    snapshot: u64,
    next_block: usize,
    current: Option<BlockIterator>,
    failed: bool,
}

impl SstIterator {
    pub fn new(sst: Arc<Sst>, snapshot: u64) -> Self {
        Self {
            sst,
            snapshot,
            next_block: 0,
            current: None,
            failed: false,
        }
    }
}

impl Iterator for SstIterator {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(block_iter) = &mut self.current {
                if let Some(entry) = block_iter.next() {
                    return Some(Ok(entry));
                }
                self.current = None;
            }

            if self.next_block >= self.sst.num_blocks() {
                return None;
            }

            match self.sst.read_block(self.next_block) {
                Ok(block) => {
                    self.current = Some(BlockIterator::new(block, self.snapshot));
                    self.next_block += 1;
                }
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::BlockCache;
    use crate::sst::{sst_path, SstBuilder};
    use crate::tmpfs::TempDir;

    #[test]
    fn test_crosses_block_boundaries() {
        let dir = TempDir::new().expect("tempdir");
        let mut builder = SstBuilder::new(128, 256, 0.1);
        for i in 0..64 {
            builder.add(
                format!("key{:02}", i).as_bytes(),
                format!("value{}", i).as_bytes(),
                5,
            );
        }
        let cache = Arc::new(BlockCache::new(64, 2));
        let sst = builder
            .build(1, sst_path(dir.path(), 1, 0), cache)
            .expect("build failed");
        assert!(sst.num_blocks() > 1);

        let keys: Vec<Vec<u8>> = SstIterator::new(Arc::clone(&sst), 0)
            .map(|r| r.expect("iteration failed").key)
            .collect();
        assert_eq!(keys.len(), 64);
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn test_snapshot_hides_new_versions() {
        let dir = TempDir::new().expect("tempdir");
        let mut builder = SstBuilder::new(256, 16, 0.1);
        builder.add(b"a", b"new", 20);
        builder.add(b"a", b"old", 10);
        builder.add(b"b", b"only_new", 20);
        let cache = Arc::new(BlockCache::new(16, 2));
        let sst = builder
            .build(1, sst_path(dir.path(), 1, 0), cache)
            .expect("build failed");

        let visible: Vec<Entry> = SstIterator::new(Arc::clone(&sst), 15)
            .map(|r| r.expect("iteration failed"))
            .collect();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].key, b"a");
        assert_eq!(visible[0].value, b"old");
    }
}
