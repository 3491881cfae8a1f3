//! Record value codec
//!
//! ## Value Format
//! ```text
//! ┌─────────────┬──────────────────────────────┐
//! │ CRC32 (4)   │ bincode payload              │
//! └─────────────┴──────────────────────────────┘
//! ```
//! The CRC covers the payload and is stored big-endian. MaxIndex values are
//! not framed: they are a raw 8-byte big-endian integer.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, ShardLogError};

/// CRC32 header size
pub const CRC_SIZE: usize = 4;

/// MaxIndex value size
pub const MAX_INDEX_VALUE_SIZE: usize = 8;

/// Encode `value` into `buf`, replacing its contents
pub fn encode_record_into<T: Serialize>(value: &T, buf: &mut Vec<u8>) -> Result<()> {
    buf.clear();
    buf.extend_from_slice(&[0u8; CRC_SIZE]);
    bincode::serialize_into(&mut *buf, value)
        .map_err(|e| ShardLogError::CorruptRecord(format!("encode failed: {}", e)))?;

    let crc = crc32fast::hash(&buf[CRC_SIZE..]);
    buf[..CRC_SIZE].copy_from_slice(&crc.to_be_bytes());
    Ok(())
}

/// Framed size of `value` in bytes
pub fn encoded_size<T: Serialize>(value: &T) -> Result<usize> {
    let payload = bincode::serialized_size(value)
        .map_err(|e| ShardLogError::CorruptRecord(format!("size failed: {}", e)))?;
    Ok(CRC_SIZE + payload as usize)
}

/// Encode `value` into a fresh buffer
pub fn encode_record<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    encode_record_into(value, &mut buf)?;
    Ok(buf)
}

/// Decode a framed value, verifying its checksum
pub fn decode_record<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    if data.len() < CRC_SIZE {
        return Err(ShardLogError::CorruptRecord(format!(
            "record too short: {} bytes",
            data.len()
        )));
    }

    let stored = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    let payload = &data[CRC_SIZE..];
    let computed = crc32fast::hash(payload);
    if stored != computed {
        return Err(ShardLogError::CorruptRecord(format!(
            "checksum mismatch: stored {:08x}, computed {:08x}",
            stored, computed
        )));
    }

    bincode::deserialize(payload)
        .map_err(|e| ShardLogError::CorruptRecord(format!("decode failed: {}", e)))
}

pub fn encode_max_index(index: u64, buf: &mut Vec<u8>) {
    buf.clear();
    buf.extend_from_slice(&index.to_be_bytes());
}

pub fn decode_max_index(data: &[u8]) -> Result<u64> {
    let bytes: [u8; MAX_INDEX_VALUE_SIZE] = data.try_into().map_err(|_| {
        ShardLogError::CorruptRecord(format!(
            "max index value must be {} bytes, got {}",
            MAX_INDEX_VALUE_SIZE,
            data.len()
        ))
    })?;
    Ok(u64::from_be_bytes(bytes))
}
