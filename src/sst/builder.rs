//! Streaming SST construction.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use byteorder::{BigEndian, WriteBytesExt};

use super::Sst;
use crate::block::{Block, BlockMeta};
use crate::bloom::BloomFilter;
use crate::cache::BlockCache;
use crate::errinput;
use crate::error::Result;

/// Accumulates sorted entries into data blocks and finalizes the meta block,
/// Bloom filter and trailer. When an entry would overflow the current block
/// it either forces the write (same key as the previous entry, so a key's
/// versions never split across blocks) or seals the block and starts a new
/// one.
pub struct SstBuilder {
    block: Block,
    block_size: usize,
    data: Vec<u8>,
    metas: Vec<BlockMeta>,
    bloom: Option<BloomFilter>,
    last_key: Vec<u8>,
    min_txn_id: u64,
    max_txn_id: u64,
}

impl SstBuilder {
    pub fn new(block_size: usize, bloom_expected: usize, bloom_error_rate: f64) -> Self {
        Self {
            block: Block::new(block_size),
            block_size,
            data: Vec::new(),
            metas: Vec::new(),
            bloom: Some(BloomFilter::new(bloom_expected, bloom_error_rate)),
            last_key: Vec::new(),
            min_txn_id: u64::MAX,
            max_txn_id: 0,
        }
    }

    /// Builds without a Bloom filter segment.
    pub fn without_bloom(block_size: usize) -> Self {
        Self {
            bloom: None,
            ..Self::new(block_size, 1, 0.1)
        }
    }

    /// Appends an entry. Keys must arrive in non-decreasing order with
    /// versions of one key in descending txn-id order.
    pub fn add(&mut self, key: &[u8], value: &[u8], txn_id: u64) {
        self.min_txn_id = self.min_txn_id.min(txn_id);
        self.max_txn_id = self.max_txn_id.max(txn_id);
        if let Some(bloom) = &mut self.bloom {
            bloom.add(key);
        }

        if self.block.add_entry(key, value, txn_id, false) {
            self.last_key = key.to_vec();
            return;
        }

        if key == self.last_key.as_slice() {
            // Never split one key's versions across two blocks.
            self.block.add_entry(key, value, txn_id, true);
            return;
        }

        self.finish_block();
        self.block.add_entry(key, value, txn_id, false);
        self.last_key = key.to_vec();
    }

    /// Seals the current block into the data section and records its meta.
    fn finish_block(&mut self) {
        if self.block.is_empty() {
            return;
        }
        let block = std::mem::replace(&mut self.block, Block::new(self.block_size));
        let meta = BlockMeta::new(
            self.data.len() as u32,
            block.first_key().to_vec(),
            block.last_key().to_vec(),
        );
        self.data.extend_from_slice(&block.encode(true));
        self.metas.push(meta);
    }

    /// Estimated size of the finished file so far.
    pub fn estimated_size(&self) -> usize {
        self.data.len() + self.block.cur_size()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.block.is_empty()
    }

    /// Finalizes the file at `path` and opens it for reading.
    pub fn build(
        mut self,
        sst_id: u64,
        path: impl Into<PathBuf>,
        cache: Arc<BlockCache>,
    ) -> Result<Arc<Sst>> {
        self.finish_block();
        if self.metas.is_empty() {
            return Err(errinput!("cannot build an empty sst"));
        }

        let mut buf = self.data;
        let meta_offset = buf.len() as u32;
        buf.extend_from_slice(&BlockMeta::encode_list(&self.metas));

        let bloom_offset = buf.len() as u32;
        if let Some(bloom) = &self.bloom {
            buf.extend_from_slice(&bloom.encode());
        }

        buf.write_u32::<BigEndian>(meta_offset).expect("write to vec");
        buf.write_u32::<BigEndian>(bloom_offset)
            .expect("write to vec");
        buf.write_u64::<BigEndian>(self.min_txn_id)
            .expect("write to vec");
        buf.write_u64::<BigEndian>(self.max_txn_id)
            .expect("write to vec");

        let path = path.into();
        let mut file = File::create(&path)?;
        file.write_all(&buf)?;
        file.sync_all()?;
        drop(file);

        Sst::open(sst_id, path, cache)
    }
}
