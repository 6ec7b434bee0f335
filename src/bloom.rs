//! Compact probabilistic membership structure attached to each SST.
//!
//! Standard double-hashing construction: the i-th probe position is
//! `h1(key) + i * h2(key)` modulo the bit count. A negative answer is
//! authoritative; a positive answer may be a false positive at the
//! configured rate.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI, CRC_64_ECMA_182};

use crate::error::Result;
use crate::errdata;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);
const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

#[derive(Debug, Clone, PartialEq)]
pub struct BloomFilter {
    expected_elements: u64,
    false_positive_rate: f64,
    num_bits: u64,
    num_hashes: u64,
    bits: Vec<u8>,
}

impl BloomFilter {
    /// Sizes the filter for `expected_elements` insertions at the given
    /// false-positive rate: `m = -n*ln(p) / ln(2)^2` bits and
    /// `k = (m/n)*ln(2)` hash probes, both rounded up.
    pub fn new(expected_elements: usize, false_positive_rate: f64) -> Self {
        let n = expected_elements.max(1) as f64;
        let ln2 = std::f64::consts::LN_2;
        let m = (-n * false_positive_rate.ln() / (ln2 * ln2)).ceil();
        let num_bits = (m as u64).max(1);
        let num_hashes = ((m / n) * ln2).ceil().max(1.0) as u64;

        Self {
            expected_elements: expected_elements as u64,
            false_positive_rate,
            num_bits,
            num_hashes,
            bits: vec![0u8; (num_bits as usize + 7) / 8],
        }
    }

    pub fn add(&mut self, key: &[u8]) {
        for i in 0..self.num_hashes {
            let bit = self.probe(key, i);
            self.bits[(bit / 8) as usize] |= 1 << (bit % 8);
        }
    }

    /// Returns false only when the key is definitely absent.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        for i in 0..self.num_hashes {
            let bit = self.probe(key, i);
            if self.bits[(bit / 8) as usize] & (1 << (bit % 8)) == 0 {
                return false;
            }
        }
        true
    }

    fn probe(&self, key: &[u8], i: u64) -> u64 {
        let h1 = CRC32.checksum(key) as u64;
        let h2 = CRC64.checksum(key);
        h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits
    }

    pub fn clear(&mut self) {
        self.bits.iter_mut().for_each(|b| *b = 0);
    }

    /// Serialized form: expected-elements, false-positive-rate, num-bits,
    /// num-hashes, then the packed bit vector (LSB-first within each byte).
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32 + self.bits.len());
        buf.write_u64::<BigEndian>(self.expected_elements)
            .expect("write to vec");
        buf.write_f64::<BigEndian>(self.false_positive_rate)
            .expect("write to vec");
        buf.write_u64::<BigEndian>(self.num_bits).expect("write to vec");
        buf.write_u64::<BigEndian>(self.num_hashes)
            .expect("write to vec");
        buf.extend_from_slice(&self.bits);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = std::io::Cursor::new(data);
        let expected_elements = cursor.read_u64::<BigEndian>()?;
        let false_positive_rate = cursor.read_f64::<BigEndian>()?;
        let num_bits = cursor.read_u64::<BigEndian>()?;
        let num_hashes = cursor.read_u64::<BigEndian>()?;

        let num_bytes = (num_bits as usize + 7) / 8;
        let rest = &data[cursor.position() as usize..];
        if rest.len() < num_bytes {
            return Err(errdata!(
                "bloom filter truncated: want {num_bytes} bit-vector bytes, have {}",
                rest.len()
            ));
        }

        Ok(Self {
            expected_elements,
            false_positive_rate,
            num_bits,
            num_hashes,
            bits: rest[..num_bytes].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_membership() {
        let mut bloom = BloomFilter::new(100, 0.01);

        for i in 0..100 {
            bloom.add(format!("key{}", i).as_bytes());
        }

        for i in 0..100 {
            assert!(bloom.may_contain(format!("key{}", i).as_bytes()));
        }
    }

    #[test]
    fn test_false_positive_rate() {
        let mut bloom = BloomFilter::new(1000, 0.01);
        for i in 0..1000 {
            bloom.add(format!("present{}", i).as_bytes());
        }

        let mut false_positives = 0;
        for i in 0..1000 {
            if bloom.may_contain(format!("absent{}", i).as_bytes()) {
                false_positives += 1;
            }
        }
        // Allow generous slack over the 1% target.
        assert!(false_positives < 50, "false positives: {false_positives}");
    }

    #[test]
    fn test_encode_decode() {
        let mut bloom = BloomFilter::new(64, 0.05);
        bloom.add(b"apple");
        bloom.add(b"banana");

        let encoded = bloom.encode();
        let decoded = BloomFilter::decode(&encoded).expect("decode failed");

        assert_eq!(bloom, decoded);
        assert!(decoded.may_contain(b"apple"));
        assert!(decoded.may_contain(b"banana"));
    }

    #[test]
    fn test_clear() {
        let mut bloom = BloomFilter::new(16, 0.1);
        bloom.add(b"key");
        assert!(bloom.may_contain(b"key"));
        bloom.clear();
        assert!(!bloom.may_contain(b"key"));
    }

    #[test]
    fn test_truncated_decode_fails() {
        let bloom = BloomFilter::new(64, 0.05);
        let encoded = bloom.encode();
        assert!(BloomFilter::decode(&encoded[..encoded.len() - 1]).is_err());
    }
}
