//! Per-block metadata entries stored in the SST's meta block.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::errdata;
use crate::error::Result;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Describes one data block: its byte offset within the SST's data section
/// and the first and last keys it holds. Metas are sorted and
/// non-overlapping: `meta[i].last_key < meta[i+1].first_key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMeta {
    pub offset: u32,
    pub first_key: Vec<u8>,
    pub last_key: Vec<u8>,
}

impl BlockMeta {
    pub fn new(offset: u32, first_key: Vec<u8>, last_key: Vec<u8>) -> Self {
        Self {
            offset,
            first_key,
            last_key,
        }
    }

    /// Encodes a meta list as
    /// `count(u32) || (offset(u32) | fk_len(u16) | fk | lk_len(u16) | lk)* || hash(u32)`
    /// where the hash covers the entry bytes between count and hash.
    pub fn encode_list(metas: &[BlockMeta]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write_u32::<BigEndian>(metas.len() as u32)
            .expect("write to vec");

        for meta in metas {
            buf.write_u32::<BigEndian>(meta.offset).expect("write to vec");
            buf.write_u16::<BigEndian>(meta.first_key.len() as u16)
                .expect("write to vec");
            buf.extend_from_slice(&meta.first_key);
            buf.write_u16::<BigEndian>(meta.last_key.len() as u16)
                .expect("write to vec");
            buf.extend_from_slice(&meta.last_key);
        }

        let hash = CRC32.checksum(&buf[4..]);
        buf.write_u32::<BigEndian>(hash).expect("write to vec");
        buf
    }

    pub fn decode_list(data: &[u8]) -> Result<Vec<BlockMeta>> {
        if data.len() < 8 {
            return Err(errdata!("meta block too small: {} bytes", data.len()));
        }

        let mut cursor = std::io::Cursor::new(data);
        let count = cursor.read_u32::<BigEndian>()?;

        let mut metas = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let offset = cursor.read_u32::<BigEndian>()?;

            let first_key_len = cursor.read_u16::<BigEndian>()? as usize;
            let mut first_key = vec![0u8; first_key_len];
            std::io::Read::read_exact(&mut cursor, &mut first_key)?;

            let last_key_len = cursor.read_u16::<BigEndian>()? as usize;
            let mut last_key = vec![0u8; last_key_len];
            std::io::Read::read_exact(&mut cursor, &mut last_key)?;

            metas.push(BlockMeta {
                offset,
                first_key,
                last_key,
            });
        }

        let entries_end = cursor.position() as usize;
        let stored_hash = cursor.read_u32::<BigEndian>()?;
        let computed_hash = CRC32.checksum(&data[4..entries_end]);
        if stored_hash != computed_hash {
            return Err(errdata!(
                "meta block hash mismatch: stored {stored_hash:#x}, computed {computed_hash:#x}"
            ));
        }

        Ok(metas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_metas() -> Vec<BlockMeta> {
        vec![
            BlockMeta::new(0, b"apple".to_vec(), b"banana".to_vec()),
            BlockMeta::new(128, b"cherry".to_vec(), b"fig".to_vec()),
            BlockMeta::new(512, b"grape".to_vec(), b"melon".to_vec()),
        ]
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let metas = sample_metas();
        let encoded = BlockMeta::encode_list(&metas);
        let decoded = BlockMeta::decode_list(&encoded).expect("decode failed");
        assert_eq!(metas, decoded);
    }

    #[test]
    fn test_empty_list() {
        let encoded = BlockMeta::encode_list(&[]);
        let decoded = BlockMeta::decode_list(&encoded).expect("decode failed");
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_corrupted_hash() {
        let metas = sample_metas();
        let mut encoded = BlockMeta::encode_list(&metas);
        let mid = encoded.len() / 2;
        encoded[mid] ^= 0xff;
        assert!(BlockMeta::decode_list(&encoded).is_err());
    }
}
