//! Immutable on-disk sorted tables.
//!
//! ## File layout
//!
//! ```text
//! +-------------------+
//! | Data Block 1      |
//! +-------------------+
//! | ...               |
//! +-------------------+
//! | Data Block N      |
//! +-------------------+
//! | Meta Block        |
//! +-------------------+
//! | Bloom Filter      |
//! +-------------------+
//! | meta_offset (u32) |
//! | bloom_offset(u32) |
//! | min_txn     (u64) |
//! | max_txn     (u64) |
//! +-------------------+
//! ```
//!
//! The 24-byte trailer locates the meta block and the Bloom segment and
//! records the file-wide transaction-id range. Files are named
//! `sst_<32-digit-zero-padded-id>.<level>` inside the data directory.

pub mod builder;
pub mod iterator;

pub use builder::SstBuilder;
pub use iterator::SstIterator;

use std::cmp::Ordering;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};

use crate::block::{Block, BlockMeta};
use crate::bloom::BloomFilter;
use crate::cache::BlockCache;
use crate::errdata;
use crate::error::Result;
use crate::iterator::Entry;

/// Byte size of the fixed trailer: two u32 offsets plus the txn-id range.
pub const TRAILER_SIZE: u64 = 4 + 4 + 8 + 8;

/// Formats the on-disk path of an SST.
pub fn sst_path(dir: &Path, sst_id: u64, level: usize) -> PathBuf {
    dir.join(format!("sst_{:032}.{}", sst_id, level))
}

pub struct Sst {
    file: File,
    path: PathBuf,
    id: u64,
    metas: Vec<BlockMeta>,
    meta_offset: u32,
    first_key: Vec<u8>,
    last_key: Vec<u8>,
    bloom: Option<BloomFilter>,
    cache: Arc<BlockCache>,
    min_txn_id: u64,
    max_txn_id: u64,
}

impl Sst {
    /// Opens an SST file: reads the trailer, the Bloom segment (when one was
    /// written) and the meta block, and records the key range.
    pub fn open(id: u64, path: impl Into<PathBuf>, cache: Arc<BlockCache>) -> Result<Arc<Sst>> {
        let path = path.into();
        let file = File::open(&path)?;
        let file_size = file.metadata()?.len();

        if file_size < TRAILER_SIZE {
            return Err(errdata!(
                "sst {} too small: {file_size} bytes",
                path.display()
            ));
        }

        let mut trailer = [0u8; TRAILER_SIZE as usize];
        file.read_exact_at(&mut trailer, file_size - TRAILER_SIZE)?;
        let meta_offset = BigEndian::read_u32(&trailer[0..4]);
        let bloom_offset = BigEndian::read_u32(&trailer[4..8]);
        let min_txn_id = BigEndian::read_u64(&trailer[8..16]);
        let max_txn_id = BigEndian::read_u64(&trailer[16..24]);

        let bloom_end = file_size - TRAILER_SIZE;
        if u64::from(meta_offset) > u64::from(bloom_offset) || u64::from(bloom_offset) > bloom_end {
            return Err(errdata!(
                "sst {} trailer offsets out of bounds: meta {meta_offset}, bloom {bloom_offset}",
                path.display()
            ));
        }

        let bloom = if u64::from(bloom_offset) < bloom_end {
            let mut buf = vec![0u8; (bloom_end - u64::from(bloom_offset)) as usize];
            file.read_exact_at(&mut buf, u64::from(bloom_offset))?;
            Some(BloomFilter::decode(&buf)?)
        } else {
            None
        };

        let mut meta_buf = vec![0u8; (bloom_offset - meta_offset) as usize];
        file.read_exact_at(&mut meta_buf, u64::from(meta_offset))?;
        let metas = BlockMeta::decode_list(&meta_buf)?;

        let first_key = metas.first().map(|m| m.first_key.clone()).unwrap_or_default();
        let last_key = metas.last().map(|m| m.last_key.clone()).unwrap_or_default();

        Ok(Arc::new(Sst {
            file,
            path,
            id,
            metas,
            meta_offset,
            first_key,
            last_key,
            bloom,
            cache,
            min_txn_id,
            max_txn_id,
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn num_blocks(&self) -> usize {
        self.metas.len()
    }

    pub fn first_key(&self) -> &[u8] {
        &self.first_key
    }

    pub fn last_key(&self) -> &[u8] {
        &self.last_key
    }

    pub fn txn_id_range(&self) -> (u64, u64) {
        (self.min_txn_id, self.max_txn_id)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Deletes the backing file. In-memory readers holding this handle keep
    /// working; the inode lives until the last reference drops.
    pub fn remove_file(&self) -> Result<()> {
        std::fs::remove_file(&self.path)?;
        Ok(())
    }

    /// Loads a data block, consulting the shared cache first.
    pub fn read_block(&self, block_idx: usize) -> Result<Arc<Block>> {
        if let Some(block) = self.cache.get(self.id, block_idx) {
            return Ok(block);
        }

        let meta = self.metas.get(block_idx).ok_or_else(|| {
            crate::errinput!(
                "block index {block_idx} out of range ({} blocks)",
                self.metas.len()
            )
        })?;

        let block_end = match self.metas.get(block_idx + 1) {
            Some(next) => next.offset,
            None => self.meta_offset,
        };
        let mut buf = vec![0u8; (block_end - meta.offset) as usize];
        self.file.read_exact_at(&mut buf, u64::from(meta.offset))?;

        let block = Arc::new(Block::decode(&buf, true)?);
        self.cache.put(self.id, block_idx, Arc::clone(&block));
        Ok(block)
    }

    /// Index of the block whose key range may contain `key`.
    fn find_block_idx(&self, key: &[u8]) -> Option<usize> {
        let mut left = 0;
        let mut right = self.metas.len();
        while left < right {
            let mid = (left + right) / 2;
            let meta = &self.metas[mid];
            if key < meta.first_key.as_slice() {
                right = mid;
            } else if key > meta.last_key.as_slice() {
                left = mid + 1;
            } else {
                return Some(mid);
            }
        }
        None
    }

    /// Point lookup at `snapshot`. Tombstones are returned as entries with
    /// empty values; projecting them to absence is the engine's concern.
    pub fn get(&self, key: &[u8], snapshot: u64) -> Result<Option<Entry>> {
        if key < self.first_key.as_slice() || key > self.last_key.as_slice() {
            return Ok(None);
        }
        if let Some(bloom) = &self.bloom {
            if !bloom.may_contain(key) {
                return Ok(None);
            }
        }
        let Some(idx) = self.find_block_idx(key) else {
            return Ok(None);
        };
        let block = self.read_block(idx)?;
        Ok(block.get_entry(key, snapshot))
    }

    /// Collects the visible entries matching a monotone predicate, walking
    /// only the blocks whose key ranges can intersect the match region.
    pub fn predicate_entries(
        &self,
        snapshot: u64,
        predicate: &dyn Fn(&[u8]) -> Ordering,
    ) -> Result<Vec<Entry>> {
        let mut out = Vec::new();
        for idx in 0..self.metas.len() {
            let meta = &self.metas[idx];
            if predicate(&meta.last_key) == Ordering::Less {
                // Whole block precedes the match region.
                continue;
            }
            if predicate(&meta.first_key) == Ordering::Greater {
                // Whole block is past the region; later blocks are too.
                break;
            }
            let block = self.read_block(idx)?;
            out.extend(block.predicate_entries(snapshot, predicate));
        }
        Ok(out)
    }
}

impl std::fmt::Debug for Sst {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sst")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("blocks", &self.metas.len())
            .field("txn_range", &(self.min_txn_id, self.max_txn_id))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    fn test_cache() -> Arc<BlockCache> {
        Arc::new(BlockCache::new(64, 2))
    }

    fn build_sst(dir: &TempDir, entries: &[(&[u8], &[u8], u64)]) -> Arc<Sst> {
        let mut builder = SstBuilder::new(256, 1024, 0.01);
        for (key, value, txn) in entries {
            builder.add(key, value, *txn);
        }
        builder
            .build(1, sst_path(dir.path(), 1, 0), test_cache())
            .expect("build failed")
    }

    #[test]
    fn test_build_open_get() {
        let dir = TempDir::new().expect("tempdir");
        let entries: Vec<(Vec<u8>, Vec<u8>, u64)> = (0..100)
            .map(|i| {
                (
                    format!("key{:03}", i).into_bytes(),
                    format!("value{}", i).into_bytes(),
                    10,
                )
            })
            .collect();
        let borrowed: Vec<(&[u8], &[u8], u64)> = entries
            .iter()
            .map(|(k, v, t)| (k.as_slice(), v.as_slice(), *t))
            .collect();
        let sst = build_sst(&dir, &borrowed);
        assert!(sst.num_blocks() > 1, "data should span multiple blocks");

        let reopened = Sst::open(1, sst.path().to_path_buf(), test_cache()).expect("open failed");
        assert_eq!(reopened.first_key(), b"key000");
        assert_eq!(reopened.last_key(), b"key099");
        assert_eq!(reopened.txn_id_range(), (10, 10));

        for (key, value, _) in &borrowed {
            let entry = reopened
                .get(key, 0)
                .expect("get failed")
                .expect("key missing");
            assert_eq!(&entry.value, value);
            assert_eq!(entry.txn_id, 10);
        }
        assert!(reopened.get(b"missing", 0).expect("get failed").is_none());
    }

    #[test]
    fn test_out_of_range_rejected_without_io() {
        let dir = TempDir::new().expect("tempdir");
        let sst = build_sst(&dir, &[(b"b", b"1", 1), (b"c", b"2", 1)]);

        assert!(sst.get(b"a", 0).expect("get failed").is_none());
        assert!(sst.get(b"d", 0).expect("get failed").is_none());
    }

    #[test]
    fn test_snapshot_visibility() {
        let dir = TempDir::new().expect("tempdir");
        let sst = build_sst(&dir, &[(b"k", b"new", 12), (b"k", b"old", 10)]);

        assert_eq!(sst.get(b"k", 0).expect("get").expect("missing").value, b"new");
        assert_eq!(
            sst.get(b"k", 11).expect("get").expect("missing").value,
            b"old"
        );
        assert!(sst.get(b"k", 5).expect("get").is_none());
    }

    #[test]
    fn test_iterate_in_order() {
        let dir = TempDir::new().expect("tempdir");
        let sst = build_sst(
            &dir,
            &[(b"a", b"1", 1), (b"b", b"2", 2), (b"c", b"3", 3)],
        );

        let keys: Vec<Vec<u8>> = SstIterator::new(Arc::clone(&sst), 0)
            .map(|r| r.expect("iteration failed").key)
            .collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn test_predicate_entries() {
        let dir = TempDir::new().expect("tempdir");
        let sst = build_sst(
            &dir,
            &[
                (b"apple", b"1", 1),
                (b"apricot", b"2", 1),
                (b"banana", b"3", 1),
            ],
        );

        let pred = |key: &[u8]| -> Ordering {
            if key.starts_with(b"ap") {
                Ordering::Equal
            } else if key < &b"ap"[..] {
                Ordering::Less
            } else {
                Ordering::Greater
            }
        };
        let matched: Vec<Vec<u8>> = sst
            .predicate_entries(0, &pred)
            .expect("predicate scan failed")
            .into_iter()
            .map(|e| e.key)
            .collect();
        assert_eq!(matched, vec![b"apple".to_vec(), b"apricot".to_vec()]);
    }

    #[test]
    fn test_remove_file() {
        let dir = TempDir::new().expect("tempdir");
        let sst = build_sst(&dir, &[(b"k", b"v", 1)]);
        let path = sst.path().to_path_buf();
        assert!(path.exists());
        sst.remove_file().expect("remove failed");
        assert!(!path.exists());
    }
}
