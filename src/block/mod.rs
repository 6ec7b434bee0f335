//! Sorted entry blocks, the unit of SST storage and caching.
//!
//! A block is a capacity-bounded, append-only builder for sorted
//! `(key, value, txn_id)` entries and a reader for a decoded byte slice.
//!
//! ## Encoding
//!
//! ```text
//! +---------+--------------------+------------------+--------------------+
//! | payload | offset table (u16) | entry_count(u16) | hash(u32, optional)|
//! +---------+--------------------+------------------+--------------------+
//! ```
//!
//! Each payload entry is `key_len(u16) | key | val_len(u16) | val |
//! txn_id(u64)`. The offset table stores the starting byte offset of each
//! entry within the payload. The trailing hash is a CRC32 over everything
//! preceding it and is verified at decode.
//!
//! Entries must be appended in non-decreasing key order; equal keys must
//! arrive in descending txn-id order (newest first), so one key's versions
//! form a contiguous run.

pub mod iterator;
pub mod meta;

pub use iterator::BlockIterator;
pub use meta::BlockMeta;

use std::cmp::Ordering;

use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::errdata;
use crate::errinput;
use crate::error::Result;
use crate::iterator::Entry;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Fixed per-entry overhead: key_len + val_len + the offset-table slot.
const ENTRY_OVERHEAD: usize = 3 * 2;
/// Size of the txn id trailing each entry.
const TXN_ID_SIZE: usize = 8;

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    data: Vec<u8>,
    offsets: Vec<u16>,
    capacity: usize,
}

impl Block {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: Vec::new(),
            offsets: Vec::new(),
            capacity,
        }
    }

    /// Appends an entry. Fails (returns false) if the resulting encoded size
    /// would exceed capacity, unless the block is still empty or the caller
    /// forces the write to keep all versions of one key in a single block.
    pub fn add_entry(&mut self, key: &[u8], value: &[u8], txn_id: u64, force: bool) -> bool {
        let entry_size = key.len() + value.len() + ENTRY_OVERHEAD + TXN_ID_SIZE;
        if !force && !self.offsets.is_empty() && self.cur_size() + entry_size > self.capacity {
            return false;
        }

        let offset = self.data.len();
        self.data
            .write_u16::<BigEndian>(key.len() as u16)
            .expect("write to vec");
        self.data.extend_from_slice(key);
        self.data
            .write_u16::<BigEndian>(value.len() as u16)
            .expect("write to vec");
        self.data.extend_from_slice(value);
        self.data
            .write_u64::<BigEndian>(txn_id)
            .expect("write to vec");
        self.offsets.push(offset as u16);
        true
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Current encoded size excluding the optional hash.
    pub fn cur_size(&self) -> usize {
        self.data.len() + self.offsets.len() * 2 + 2
    }

    pub fn first_key(&self) -> &[u8] {
        if self.offsets.is_empty() {
            return &[];
        }
        self.key_at(self.offsets[0] as usize)
    }

    pub fn last_key(&self) -> &[u8] {
        match self.offsets.last() {
            Some(&offset) => self.key_at(offset as usize),
            None => &[],
        }
    }

    /// Byte offset of the entry at `idx` within the payload.
    pub fn offset_at(&self, idx: usize) -> Result<usize> {
        self.offsets
            .get(idx)
            .map(|&o| o as usize)
            .ok_or_else(|| errinput!("entry index {idx} out of range ({} entries)", self.len()))
    }

    pub fn encode(&self, with_hash: bool) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.cur_size() + 4);
        buf.extend_from_slice(&self.data);
        for &offset in &self.offsets {
            buf.write_u16::<BigEndian>(offset).expect("write to vec");
        }
        buf.write_u16::<BigEndian>(self.offsets.len() as u16)
            .expect("write to vec");
        if with_hash {
            let hash = CRC32.checksum(&buf);
            buf.write_u32::<BigEndian>(hash).expect("write to vec");
        }
        buf
    }

    pub fn decode(encoded: &[u8], with_hash: bool) -> Result<Block> {
        let min_size = if with_hash { 6 } else { 2 };
        if encoded.len() < min_size {
            return Err(errdata!("block too small: {} bytes", encoded.len()));
        }

        let mut count_pos = encoded.len() - 2;
        if with_hash {
            let hash_pos = encoded.len() - 4;
            let stored_hash = BigEndian::read_u32(&encoded[hash_pos..]);
            let computed_hash = CRC32.checksum(&encoded[..hash_pos]);
            if stored_hash != computed_hash {
                return Err(errdata!(
                    "block hash mismatch: stored {stored_hash:#x}, computed {computed_hash:#x}"
                ));
            }
            count_pos -= 4;
        }

        let num_entries = BigEndian::read_u16(&encoded[count_pos..]) as usize;
        let offsets_start = count_pos
            .checked_sub(num_entries * 2)
            .ok_or_else(|| errdata!("block offset table larger than block"))?;

        let mut offsets = Vec::with_capacity(num_entries);
        let mut cursor = std::io::Cursor::new(&encoded[offsets_start..count_pos]);
        for _ in 0..num_entries {
            offsets.push(cursor.read_u16::<BigEndian>()?);
        }

        Ok(Block {
            data: encoded[..offsets_start].to_vec(),
            offsets,
            capacity: encoded.len(),
        })
    }

    /// Binary-searches the offset table for `key` and resolves the highest
    /// version with `txn_id <= snapshot` (any version when snapshot is 0).
    pub fn get_index(&self, key: &[u8], snapshot: u64) -> Option<usize> {
        if self.offsets.is_empty() {
            return None;
        }

        let mut left = 0i64;
        let mut right = self.offsets.len() as i64 - 1;
        while left <= right {
            let mid = ((left + right) / 2) as usize;
            match self.key_at(self.offsets[mid] as usize).cmp(key) {
                Ordering::Equal => return self.adjust_index(mid, snapshot),
                Ordering::Less => left = mid as i64 + 1,
                Ordering::Greater => right = mid as i64 - 1,
            }
        }
        None
    }

    pub fn get_value(&self, key: &[u8], snapshot: u64) -> Option<Vec<u8>> {
        self.get_index(key, snapshot)
            .map(|idx| self.value_at(self.offsets[idx] as usize).to_vec())
    }

    pub fn get_entry(&self, key: &[u8], snapshot: u64) -> Option<Entry> {
        self.get_index(key, snapshot).map(|idx| self.entry_at(idx))
    }

    /// Moves from an arbitrary hit within a key's version run to the highest
    /// version visible under `snapshot`: backward while the previous version
    /// is still visible, forward while the current one is too new.
    fn adjust_index(&self, idx: usize, snapshot: u64) -> Option<usize> {
        let key = self.key_at(self.offsets[idx] as usize).to_vec();

        if snapshot == 0 {
            let mut prev = idx;
            while prev > 0 && self.is_same_key(prev - 1, &key) {
                prev -= 1;
            }
            return Some(prev);
        }

        if self.txn_id_at(self.offsets[idx] as usize) <= snapshot {
            let mut prev = idx;
            while prev > 0 && self.is_same_key(prev - 1, &key) {
                prev -= 1;
                if self.txn_id_at(self.offsets[prev] as usize) > snapshot {
                    return Some(prev + 1);
                }
            }
            Some(prev)
        } else {
            let mut next = idx + 1;
            while next < self.offsets.len() && self.is_same_key(next, &key) {
                if self.txn_id_at(self.offsets[next] as usize) <= snapshot {
                    return Some(next);
                }
                next += 1;
            }
            None
        }
    }

    /// Locates the contiguous index range `[first, end)` of keys matching a
    /// monotone predicate via two binary searches. The predicate reports
    /// where a key sits relative to the match region: `Less` before it,
    /// `Equal` inside it, `Greater` past it.
    pub fn predicate_range(&self, predicate: &dyn Fn(&[u8]) -> Ordering) -> Option<(usize, usize)> {
        if self.offsets.is_empty() {
            return None;
        }

        // First index not before the region.
        let mut left = 0;
        let mut right = self.offsets.len();
        while left < right {
            let mid = (left + right) / 2;
            if predicate(self.key_at(self.offsets[mid] as usize)) == Ordering::Less {
                left = mid + 1;
            } else {
                right = mid;
            }
        }
        if left >= self.offsets.len()
            || predicate(self.key_at(self.offsets[left] as usize)) != Ordering::Equal
        {
            return None;
        }
        let first = left;

        // First index past the region.
        let mut right = self.offsets.len();
        while left < right {
            let mid = (left + right) / 2;
            if predicate(self.key_at(self.offsets[mid] as usize)) == Ordering::Greater {
                right = mid;
            } else {
                left = mid + 1;
            }
        }

        Some((first, left))
    }

    /// Visible entries of the predicate-matching range, one version per key.
    pub fn predicate_entries(
        &self,
        snapshot: u64,
        predicate: &dyn Fn(&[u8]) -> Ordering,
    ) -> Vec<Entry> {
        let Some((first, end)) = self.predicate_range(predicate) else {
            return Vec::new();
        };

        let mut out = Vec::new();
        let mut idx = first;
        while idx < end {
            let entry = self.entry_at(idx);
            if snapshot != 0 && entry.txn_id > snapshot {
                idx += 1;
                continue;
            }
            idx += 1;
            while idx < end && self.key_at_index(idx) == entry.key {
                idx += 1;
            }
            out.push(entry);
        }
        out
    }

    pub(crate) fn entry_at(&self, idx: usize) -> Entry {
        let offset = self.offsets[idx] as usize;
        Entry::new(
            self.key_at(offset).to_vec(),
            self.value_at(offset).to_vec(),
            self.txn_id_at(offset),
        )
    }

    pub(crate) fn key_at_index(&self, idx: usize) -> &[u8] {
        self.key_at(self.offsets[idx] as usize)
    }

    fn key_at(&self, offset: usize) -> &[u8] {
        let key_len = BigEndian::read_u16(&self.data[offset..]) as usize;
        &self.data[offset + 2..offset + 2 + key_len]
    }

    fn value_at(&self, offset: usize) -> &[u8] {
        let key_len = BigEndian::read_u16(&self.data[offset..]) as usize;
        let val_len_pos = offset + 2 + key_len;
        let val_len = BigEndian::read_u16(&self.data[val_len_pos..]) as usize;
        &self.data[val_len_pos + 2..val_len_pos + 2 + val_len]
    }

    fn txn_id_at(&self, offset: usize) -> u64 {
        let key_len = BigEndian::read_u16(&self.data[offset..]) as usize;
        let val_len_pos = offset + 2 + key_len;
        let val_len = BigEndian::read_u16(&self.data[val_len_pos..]) as usize;
        BigEndian::read_u64(&self.data[val_len_pos + 2 + val_len..])
    }

    fn is_same_key(&self, idx: usize, key: &[u8]) -> bool {
        idx < self.offsets.len() && self.key_at(self.offsets[idx] as usize) == key
    }
}
