//! Key-layout builders.
//!
//! Every key written to the underlying store begins with a one-byte
//! namespace marker so the four concerns below never collide and a
//! prefix scan over one namespace never touches another:
//!
//! - [`NS_CONTENT`]: object field data, keyed by object id.
//! - [`NS_INDEX`]: simple- and composite-index entries.
//! - [`NS_CATALOG`]: recorded schema versions.
//! - [`NS_META`]: per-object schema-version bookkeeping used by
//!   lazy migration.

use crate::codec::{encode_uvarint, key_after_prefix};
use crate::objid::ObjId;

/// Object content: `field`/`sub-field` values.
pub const NS_CONTENT: u8 = 0x01;
/// Index entries.
pub const NS_INDEX: u8 = 0x02;
/// Recorded schema versions.
pub const NS_CATALOG: u8 = 0x03;
/// Per-object schema-version metadata.
pub const NS_META: u8 = 0x04;

/// `NS_CONTENT | object-id | storage-id [| sub-key]`: one simple
/// field, or one element of a collection field, of one object.
pub fn content_key(id: ObjId, storage_id: u64, sub_key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 8 + 9 + sub_key.len());
    out.push(NS_CONTENT);
    out.extend_from_slice(id.as_bytes());
    encode_uvarint(storage_id, &mut out);
    out.extend_from_slice(sub_key);
    out
}

/// Prefix covering every key belonging to one object, so deleting an
/// object removes everything it owns in a single prefix-bounded
/// sweep.
pub fn content_object_prefix(id: ObjId) -> Vec<u8> {
    let mut out = Vec::with_capacity(9);
    out.push(NS_CONTENT);
    out.extend_from_slice(id.as_bytes());
    out
}

/// Prefix covering every stored value of a single field/sub-field on
/// one object, used to clear or re-enumerate a collection.
pub fn content_field_prefix(id: ObjId, storage_id: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(9 + 9);
    out.push(NS_CONTENT);
    out.extend_from_slice(id.as_bytes());
    encode_uvarint(storage_id, &mut out);
    out
}

/// `NS_INDEX | storage-id | encoded-value | object-id`: one simple
/// index entry.
pub fn simple_index_key(storage_id: u64, encoded_value: &[u8], id: ObjId) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 9 + encoded_value.len() + 8);
    out.push(NS_INDEX);
    encode_uvarint(storage_id, &mut out);
    out.extend_from_slice(encoded_value);
    out.extend_from_slice(id.as_bytes());
    out
}

/// Prefix covering every index entry for one field/sub-field,
/// regardless of value. Used to fully remove an index when a field
/// is un-indexed.
pub fn simple_index_field_prefix(storage_id: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(9);
    out.push(NS_INDEX);
    encode_uvarint(storage_id, &mut out);
    out
}

/// `NS_INDEX | composite-index-storage-id | encoded-tuple | object-id`.
pub fn composite_index_key(storage_id: u64, encoded_tuple: &[u8], id: ObjId) -> Vec<u8> {
    simple_index_key(storage_id, encoded_tuple, id)
}

/// Prefix covering every entry of one composite index.
pub fn composite_index_field_prefix(storage_id: u64) -> Vec<u8> {
    simple_index_field_prefix(storage_id)
}

/// `NS_CATALOG | version`: one recorded schema's canonical bytes.
pub fn catalog_key(version: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(9);
    out.push(NS_CATALOG);
    encode_uvarint(version, &mut out);
    out
}

/// `[lower, upper)` bounding every catalog entry, for a full scan.
/// Used to enumerate recorded versions during compatibility checks.
pub fn catalog_range() -> (Vec<u8>, Vec<u8>) {
    let lo = vec![NS_CATALOG];
    let hi = key_after_prefix(&lo);
    (lo, hi)
}

/// Sub-marker distinguishing the two kinds of `NS_META` entry so an
/// all-zero storage-id can never collide with an all-zero ObjId byte.
const META_VERSION: u8 = 0x01;
const META_COUNTER: u8 = 0x02;

/// `NS_META | 0x01 | object-id`: the schema version an object was last
/// written under. Consulted on every access to decide whether
/// migration is needed.
pub fn meta_version_key(id: ObjId) -> Vec<u8> {
    let mut out = Vec::with_capacity(10);
    out.push(NS_META);
    out.push(META_VERSION);
    out.extend_from_slice(id.as_bytes());
    out
}

/// `NS_META | 0x02 | storage-id`: the next unused counter value for
/// ObjIds of this storage-id. Objects are identified by a storage-id
/// and a per-type counter.
pub fn counter_key(storage_id: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(10);
    out.push(NS_META);
    out.push(META_COUNTER);
    encode_uvarint(storage_id, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_prefix_is_a_prefix_of_field_key() {
        let id = ObjId::new(7, 1).unwrap();
        let prefix = content_object_prefix(id);
        let key = content_key(id, 3, &[]);
        assert!(key.starts_with(&prefix));
    }

    #[test]
    fn catalog_range_brackets_several_versions() {
        let (lo, hi) = catalog_range();
        for v in [0u64, 1, 1000, u64::MAX] {
            let k = catalog_key(v);
            assert!(k >= lo && k < hi, "version {v} key out of range");
        }
    }

    #[test]
    fn different_namespaces_never_collide() {
        let id = ObjId::new(1, 1).unwrap();
        let content = content_object_prefix(id);
        let meta = meta_version_key(id);
        assert_ne!(content[0], meta[0]);
    }
}
