//! Object identifiers.
//!
//! A fixed-size `#[repr(transparent)]` byte array with hex
//! `Debug`/`Display`, structured rather than opaque since the leading
//! bytes must decode back to a storage-id.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::codec::{decode_uvarint, encode_uvarint, Reader};
use crate::error::{Error, Result};

/// 8-byte object identifier. The leading bytes are a variable-length
/// unsigned integer naming the object's type (its storage-id); the
/// remaining bytes uniquely distinguish objects of that type.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ObjId([u8; 8]);

impl ObjId {
    /// Build an id from a storage-id and a per-type uniquifying
    /// counter. Fails if the storage-id's varint encoding leaves no
    /// room for a counter byte.
    pub fn new(storage_id: u64, counter: u64) -> Result<Self> {
        let mut sid_bytes = Vec::new();
        encode_uvarint(storage_id, &mut sid_bytes);
        if sid_bytes.len() >= 8 {
            return Err(Error::invalid_schema(format!(
                "storage-id {storage_id} is too large to fit in an 8-byte ObjId"
            )));
        }
        let counter_width = 8 - sid_bytes.len();
        let max_counter = if counter_width >= 8 { u64::MAX } else { (1u64 << (counter_width * 8)) - 1 };
        if counter > max_counter {
            return Err(Error::invalid_schema(format!(
                "counter {counter} overflows the {counter_width} bytes available for storage-id {storage_id}"
            )));
        }
        let mut bytes = [0u8; 8];
        bytes[..sid_bytes.len()].copy_from_slice(&sid_bytes);
        let counter_bytes = counter.to_be_bytes();
        bytes[sid_bytes.len()..].copy_from_slice(&counter_bytes[8 - counter_width..]);
        Ok(Self(bytes))
    }

    /// Wrap a raw 8-byte id, trusting the caller that it was produced
    /// by [`ObjId::new`] or read back from the KV store.
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// Parse an id from a byte slice of exactly 8 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 8 {
            return Err(Error::codec(format!("ObjId must be 8 bytes, got {}", bytes.len())));
        }
        let mut arr = [0u8; 8];
        arr.copy_from_slice(bytes);
        Ok(Self(arr))
    }

    /// Raw bytes, in the order they sort: ObjIds are ordered by their
    /// raw big-endian bytes.
    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// Decode the storage-id prefix.
    pub fn storage_id(&self) -> Result<u64> {
        let mut r = Reader::new(&self.0);
        decode_uvarint(&mut r)
    }

    /// Hex string form, e.g. for logging.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ObjId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjId({})", hex::encode(self.0))
    }
}

impl fmt::Display for ObjId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_storage_id() {
        let id = ObjId::new(100, 7).unwrap();
        assert_eq!(id.storage_id().unwrap(), 100);
    }

    #[test]
    fn orders_by_raw_bytes() {
        let a = ObjId::new(100, 1).unwrap();
        let b = ObjId::new(100, 2).unwrap();
        assert!(a < b);
        assert!(a.as_bytes() < b.as_bytes());
    }

    #[test]
    fn rejects_oversized_counter() {
        // storage-id 100 fits in one byte, leaving 7 counter bytes:
        // up to 2^56-1 fits, one more does not.
        assert!(ObjId::new(100, (1u64 << 56) - 1).is_ok());
        assert!(ObjId::new(100, 1u64 << 56).is_err());
        // a storage-id requiring 7 of the 8 varint-length bytes leaves
        // a single counter byte.
        assert!(ObjId::new(u64::MAX, 2).is_err());
    }
}
