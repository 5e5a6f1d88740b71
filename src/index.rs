//! Secondary index engine: simple per-field indexes and composite
//! multi-field indexes, maintained synchronously with content writes.

use crate::error::Result;
use crate::keys::{composite_index_key, simple_index_field_prefix, simple_index_key};
use crate::kv::KvStore;
use crate::objid::ObjId;

/// One `(value, id)` pair read back from a simple or composite index.
pub struct IndexEntry {
    /// The encoded indexed value (or tuple, for a composite index).
    pub encoded_value: Vec<u8>,
    /// The indexed object.
    pub id: ObjId,
}

/// Record that `id` now carries `encoded_value` under `storage_id`'s
/// index: one entry per indexed value per referencing object.
pub fn add_entry(kv: &mut dyn KvStore, storage_id: u64, encoded_value: &[u8], id: ObjId) -> Result<()> {
    let key = simple_index_key(storage_id, encoded_value, id);
    kv.put(&key, &[])
}

/// Remove the entry recorded by a prior [`add_entry`] call with the
/// same arguments. Removing an absent entry is not an error.
pub fn remove_entry(kv: &mut dyn KvStore, storage_id: u64, encoded_value: &[u8], id: ObjId) -> Result<()> {
    let key = simple_index_key(storage_id, encoded_value, id);
    kv.delete(&key)
}

/// Update one index entry from an old encoded value to a new one,
/// skipping the write when nothing changed.
pub fn update_entry(
    kv: &mut dyn KvStore,
    storage_id: u64,
    old: Option<&[u8]>,
    new: Option<&[u8]>,
    id: ObjId,
) -> Result<()> {
    if old == new {
        return Ok(());
    }
    if let Some(old) = old {
        remove_entry(kv, storage_id, old, id)?;
    }
    if let Some(new) = new {
        add_entry(kv, storage_id, new, id)?;
    }
    Ok(())
}

/// Every `(value, id)` pair recorded under `storage_id`, in value
/// order.
pub fn query_index<'a>(kv: &'a dyn KvStore, storage_id: u64) -> Result<Box<dyn Iterator<Item = Result<IndexEntry>> + 'a>> {
    let prefix = simple_index_field_prefix(storage_id);
    let prefix_len = prefix.len();
    let iter = kv.scan_prefix(&prefix)?.map(move |entry| {
        entry.map(|(key, _)| {
            let id = ObjId::from_slice(&key[key.len() - 8..]).expect("index key carries a full object id");
            let encoded_value = key[prefix_len..key.len() - 8].to_vec();
            IndexEntry { encoded_value, id }
        })
    });
    Ok(Box::new(iter))
}

/// Every id recorded under `storage_id` with exactly `encoded_value`.
/// This is how a reverse lookup is performed via the reference
/// field's index.
pub fn query_exact(kv: &dyn KvStore, storage_id: u64, encoded_value: &[u8]) -> Result<Vec<ObjId>> {
    let mut prefix = simple_index_field_prefix(storage_id);
    prefix.extend_from_slice(encoded_value);
    let hi = crate::codec::key_after_prefix(&prefix);
    let mut out = Vec::new();
    for entry in kv.scan_range(&prefix, &hi, false)? {
        let (key, _) = entry?;
        out.push(ObjId::from_slice(&key[key.len() - 8..])?);
    }
    Ok(out)
}

/// A composite index entry is laid out identically to a simple one;
/// the "value" is simply the concatenation of each participating
/// field's encoded value, an ordered tuple of simple fields.
pub fn add_composite_entry(kv: &mut dyn KvStore, storage_id: u64, encoded_tuple: &[u8], id: ObjId) -> Result<()> {
    let key = composite_index_key(storage_id, encoded_tuple, id);
    kv.put(&key, &[])
}

/// Remove a composite index entry.
pub fn remove_composite_entry(kv: &mut dyn KvStore, storage_id: u64, encoded_tuple: &[u8], id: ObjId) -> Result<()> {
    let key = composite_index_key(storage_id, encoded_tuple, id);
    kv.delete(&key)
}

/// Every `(tuple, id)` pair recorded under a composite index's
/// storage-id.
pub fn query_composite<'a>(kv: &'a dyn KvStore, storage_id: u64) -> Result<Box<dyn Iterator<Item = Result<IndexEntry>> + 'a>> {
    query_index(kv, storage_id)
}
