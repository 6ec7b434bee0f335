//! Operation records appended to the write-ahead log.
//!
//! Encoding: `total_len(u16) | txn_id(u64) | op(u8)`, followed for PUT by
//! `key_len(u16) | key | val_len(u16) | val` and for DELETE by
//! `key_len(u16) | key`. CREATE, COMMIT and ROLLBACK are bare markers.

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};

use crate::errdata;
use crate::error::Result;

/// Fixed header: total_len + txn_id + op.
const HEADER_SIZE: usize = 2 + 8 + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
    Create = 0,
    Commit = 1,
    Rollback = 2,
    Put = 3,
    Delete = 4,
}

impl OpType {
    fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(OpType::Create),
            1 => Ok(OpType::Commit),
            2 => Ok(OpType::Rollback),
            3 => Ok(OpType::Put),
            4 => Ok(OpType::Delete),
            other => Err(errdata!("unknown wal operation type {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub txn_id: u64,
    pub op: OpType,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Record {
    pub fn create(txn_id: u64) -> Self {
        Self {
            txn_id,
            op: OpType::Create,
            key: Vec::new(),
            value: Vec::new(),
        }
    }

    pub fn commit(txn_id: u64) -> Self {
        Self {
            txn_id,
            op: OpType::Commit,
            key: Vec::new(),
            value: Vec::new(),
        }
    }

    pub fn rollback(txn_id: u64) -> Self {
        Self {
            txn_id,
            op: OpType::Rollback,
            key: Vec::new(),
            value: Vec::new(),
        }
    }

    pub fn put(txn_id: u64, key: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            txn_id,
            op: OpType::Put,
            key,
            value,
        }
    }

    pub fn delete(txn_id: u64, key: Vec<u8>) -> Self {
        Self {
            txn_id,
            op: OpType::Delete,
            key,
            value: Vec::new(),
        }
    }

    /// Encoded length of this record.
    pub fn record_len(&self) -> usize {
        match self.op {
            OpType::Create | OpType::Commit | OpType::Rollback => HEADER_SIZE,
            OpType::Put => HEADER_SIZE + 2 + self.key.len() + 2 + self.value.len(),
            OpType::Delete => HEADER_SIZE + 2 + self.key.len(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.record_len());
        buf.write_u16::<BigEndian>(self.record_len() as u16)
            .expect("write to vec");
        buf.write_u64::<BigEndian>(self.txn_id).expect("write to vec");
        buf.write_u8(self.op as u8).expect("write to vec");

        match self.op {
            OpType::Put => {
                buf.write_u16::<BigEndian>(self.key.len() as u16)
                    .expect("write to vec");
                buf.extend_from_slice(&self.key);
                buf.write_u16::<BigEndian>(self.value.len() as u16)
                    .expect("write to vec");
                buf.extend_from_slice(&self.value);
            }
            OpType::Delete => {
                buf.write_u16::<BigEndian>(self.key.len() as u16)
                    .expect("write to vec");
                buf.extend_from_slice(&self.key);
            }
            _ => {}
        }
        buf
    }

    /// Decodes a whole segment into its record sequence. A record length
    /// disagreeing with its payload is corruption.
    pub fn decode_all(data: &[u8]) -> Result<Vec<Record>> {
        let mut records = Vec::new();
        let mut pos = 0;

        while pos < data.len() {
            if data.len() - pos < HEADER_SIZE {
                return Err(errdata!(
                    "truncated wal record header at offset {pos}: {} bytes left",
                    data.len() - pos
                ));
            }

            let record_len = BigEndian::read_u16(&data[pos..]) as usize;
            if record_len < HEADER_SIZE || pos + record_len > data.len() {
                return Err(errdata!(
                    "wal record length {record_len} at offset {pos} does not fit segment"
                ));
            }
            let body = &data[pos..pos + record_len];

            let txn_id = BigEndian::read_u64(&body[2..]);
            let op = OpType::from_u8(body[10])?;

            let record = match op {
                OpType::Put => {
                    let key_len = BigEndian::read_u16(&body[HEADER_SIZE..]) as usize;
                    let key_start = HEADER_SIZE + 2;
                    if key_start + key_len + 2 > record_len {
                        return Err(errdata!("wal put record key overruns record length"));
                    }
                    let key = body[key_start..key_start + key_len].to_vec();
                    let val_len =
                        BigEndian::read_u16(&body[key_start + key_len..]) as usize;
                    let val_start = key_start + key_len + 2;
                    if val_start + val_len != record_len {
                        return Err(errdata!("wal put record value overruns record length"));
                    }
                    let value = body[val_start..val_start + val_len].to_vec();
                    Record::put(txn_id, key, value)
                }
                OpType::Delete => {
                    let key_len = BigEndian::read_u16(&body[HEADER_SIZE..]) as usize;
                    let key_start = HEADER_SIZE + 2;
                    if key_start + key_len != record_len {
                        return Err(errdata!("wal delete record key overruns record length"));
                    }
                    let key = body[key_start..key_start + key_len].to_vec();
                    Record::delete(txn_id, key)
                }
                OpType::Create => Record::create(txn_id),
                OpType::Commit => Record::commit(txn_id),
                OpType::Rollback => Record::rollback(txn_id),
            };

            records.push(record);
            pos += record_len;
        }

        Ok(records)
    }
}
