//! Complex-field engine: key-range layouts for list, set, and map
//! fields, per-element iteration, and reference sub-field
//! unreferencing.

use crate::codec::Reader;
use crate::error::{Error, Result};
use crate::index;
use crate::keys::{content_field_prefix, content_key};
use crate::kv::KvStore;
use crate::objid::ObjId;
use crate::registry::TypeRegistry;
use crate::schema::{CollectionKind, ComplexField, SubField};
use crate::value::{decode_value, encode_value, FieldType, Value};

/// The largest list index before the engine compacts by renumbering
/// from zero. Indices are 32-bit; if the list would grow past
/// 2^31-1, compact by renumbering from 0.
pub const MAX_LIST_INDEX: u32 = i32::MAX as u32;

/// One stored element of a list, set, or map, as read back from the
/// content range.
pub struct Element {
    /// The element's position: a list index, a set member's own
    /// encoded value, or a map key.
    pub sub_key: Vec<u8>,
    /// The element/value payload (for sets, a 1:1 echo of `sub_key`
    /// decoded back to a [`Value`]; for lists and maps, the stored
    /// value).
    pub value: Value,
}

/// Content sub-key for a list element at `index`: a fixed 4-byte
/// big-endian index suffix, so key order is index order.
fn list_sub_key(index: u32) -> Vec<u8> {
    index.to_be_bytes().to_vec()
}

fn decode_list_index(sub_key: &[u8]) -> Result<u32> {
    let bytes: [u8; 4] = sub_key.try_into().map_err(|_| Error::codec("list sub-key must be 4 bytes"))?;
    Ok(u32::from_be_bytes(bytes))
}

/// Content sub-key for a set element or map key: the element's own
/// encoded (memcomparable) bytes, so iteration order matches value
/// order without a separate index.
fn keyed_sub_key(ty: &FieldType, value: &Value, registry: &TypeRegistry) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    encode_value(ty, value, registry, &mut out)?;
    Ok(out)
}

/// A list sub-field's index key additionally carries the list index,
/// so two positions holding the same value both get their own entry
/// instead of colliding on one key.
fn positional_index_value(encoded_value: &[u8], sub_key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(encoded_value.len() + sub_key.len());
    out.extend_from_slice(encoded_value);
    out.extend_from_slice(sub_key);
    out
}

/// Read every element of a collection field, in sub-key order (spec
/// §4.5 "per-element iteration").
pub fn iter_elements<'a>(
    kv: &'a dyn KvStore,
    id: ObjId,
    field: &'a ComplexField,
    registry: &'a TypeRegistry,
) -> Result<Box<dyn Iterator<Item = Result<Element>> + 'a>> {
    let prefix = content_field_prefix(id, field.storage_id);
    let prefix_len = prefix.len();
    let element_sub_field = field.element_sub_field();
    let iter = kv.scan_prefix(&prefix)?.map(move |entry| {
        let (key, raw) = entry?;
        let sub_key = key[prefix_len..].to_vec();
        let mut r = Reader::new(&raw);
        let value = decode_value(&element_sub_field.element_type, &mut r, registry)?;
        Ok(Element { sub_key, value })
    });
    Ok(Box::new(iter))
}

/// Number of elements currently stored.
pub fn len(kv: &dyn KvStore, id: ObjId, field: &ComplexField, registry: &TypeRegistry) -> Result<usize> {
    Ok(iter_elements(kv, id, field, registry)?.count())
}

/// List: read the element at `index`.
pub fn list_get(kv: &dyn KvStore, id: ObjId, field: &ComplexField, index: u32, registry: &TypeRegistry) -> Result<Option<Value>> {
    let key = content_key(id, field.storage_id, &list_sub_key(index));
    match kv.get(&key)? {
        Some(raw) => {
            let mut r = Reader::new(&raw);
            Ok(Some(decode_value(&field.element_sub_field().element_type, &mut r, registry)?))
        }
        None => Ok(None),
    }
}

fn list_write_raw(kv: &mut dyn KvStore, id: ObjId, field: &ComplexField, index: u32, encoded: &[u8]) -> Result<()> {
    let sub_field = field.element_sub_field();
    let sub_key = list_sub_key(index);
    let key = content_key(id, field.storage_id, &sub_key);
    let old = kv.get(&key)?;
    kv.put(&key, encoded)?;
    if sub_field.indexed {
        let old_positional = old.map(|o| positional_index_value(&o, &sub_key));
        let new_positional = positional_index_value(encoded, &sub_key);
        index::update_entry(kv, sub_field.storage_id, old_positional.as_deref(), Some(&new_positional), id)?;
    }
    Ok(())
}

fn list_clear_raw(kv: &mut dyn KvStore, id: ObjId, field: &ComplexField, index: u32) -> Result<Option<Vec<u8>>> {
    let sub_field = field.element_sub_field();
    let sub_key = list_sub_key(index);
    let key = content_key(id, field.storage_id, &sub_key);
    let Some(old) = kv.get(&key)? else { return Ok(None) };
    if sub_field.indexed {
        let positional = positional_index_value(&old, &sub_key);
        index::remove_entry(kv, sub_field.storage_id, &positional, id)?;
    }
    kv.delete(&key)?;
    Ok(Some(old))
}

/// List: overwrite the element at `index` in place (no shift).
pub fn list_set(
    kv: &mut dyn KvStore,
    id: ObjId,
    field: &ComplexField,
    index: u32,
    value: &Value,
    registry: &TypeRegistry,
) -> Result<()> {
    let mut encoded = Vec::new();
    encode_value(&field.element_sub_field().element_type, value, registry, &mut encoded)?;
    list_write_raw(kv, id, field, index, &encoded)
}

fn highest_index(kv: &dyn KvStore, id: ObjId, field: &ComplexField, registry: &TypeRegistry) -> Result<Option<u32>> {
    iter_elements(kv, id, field, registry)?
        .map(|e| e.and_then(|el| decode_list_index(&el.sub_key)))
        .collect::<Result<Vec<_>>>()
        .map(|v| v.into_iter().max())
}

/// List: append at the next unused index.
pub fn list_append(
    kv: &mut dyn KvStore,
    id: ObjId,
    field: &ComplexField,
    value: &Value,
    registry: &TypeRegistry,
) -> Result<u32> {
    let next_index = highest_index(kv, id, field, registry)?.map(|i| i + 1).unwrap_or(0);
    if next_index > MAX_LIST_INDEX {
        compact_list(kv, id, field, registry)?;
        return list_append(kv, id, field, value, registry);
    }
    list_set(kv, id, field, next_index, value, registry)?;
    Ok(next_index)
}

/// List: insert at `index`, shifting every later element up by one.
/// On insert/remove, only the suffix range is rewritten for shifted
/// positions.
pub fn list_insert(
    kv: &mut dyn KvStore,
    id: ObjId,
    field: &ComplexField,
    index: u32,
    value: &Value,
    registry: &TypeRegistry,
) -> Result<()> {
    let Some(highest) = highest_index(kv, id, field, registry)? else {
        return list_set(kv, id, field, index, value, registry);
    };
    if highest == MAX_LIST_INDEX {
        compact_list(kv, id, field, registry)?;
    }
    let highest = highest_index(kv, id, field, registry)?.unwrap_or(index);
    let mut pos = highest;
    while pos >= index {
        if let Some(raw) = list_clear_raw(kv, id, field, pos)? {
            list_write_raw(kv, id, field, pos + 1, &raw)?;
        }
        if pos == 0 {
            break;
        }
        pos -= 1;
    }
    list_set(kv, id, field, index, value, registry)
}

/// List: remove the element at `index`, shifting every later element
/// down by one.
pub fn list_remove(kv: &mut dyn KvStore, id: ObjId, field: &ComplexField, index: u32, registry: &TypeRegistry) -> Result<bool> {
    let Some(removed) = list_clear_raw(kv, id, field, index)? else { return Ok(false) };
    let _ = removed;
    let Some(highest) = highest_index(kv, id, field, registry)? else { return Ok(true) };
    let mut pos = index + 1;
    while pos <= highest + 1 {
        if pos > highest {
            break;
        }
        if let Some(raw) = list_clear_raw(kv, id, field, pos)? {
            list_write_raw(kv, id, field, pos - 1, &raw)?;
        }
        pos += 1;
    }
    Ok(true)
}

fn compact_list(kv: &mut dyn KvStore, id: ObjId, field: &ComplexField, registry: &TypeRegistry) -> Result<()> {
    let elements: Vec<(u32, Vec<u8>)> = iter_elements(kv, id, field, registry)?
        .map(|e| {
            let el = e?;
            let mut buf = Vec::new();
            encode_value(&field.element_sub_field().element_type, &el.value, registry, &mut buf)?;
            Ok((decode_list_index(&el.sub_key)?, buf))
        })
        .collect::<Result<Vec<_>>>()?;
    for (old_index, _) in &elements {
        list_clear_raw(kv, id, field, *old_index)?;
    }
    for (new_index, (_, raw)) in elements.into_iter().enumerate() {
        list_write_raw(kv, id, field, new_index as u32, &raw)?;
    }
    Ok(())
}

/// Set: does `value` currently belong to the set?
pub fn set_contains(kv: &dyn KvStore, id: ObjId, field: &ComplexField, value: &Value, registry: &TypeRegistry) -> Result<bool> {
    let sub_field = field.element_sub_field();
    let sub_key = keyed_sub_key(&sub_field.element_type, value, registry)?;
    let key = content_key(id, field.storage_id, &sub_key);
    Ok(kv.get(&key)?.is_some())
}

/// Set: add `value`, a no-op if already present.
pub fn set_add(kv: &mut dyn KvStore, id: ObjId, field: &ComplexField, value: &Value, registry: &TypeRegistry) -> Result<bool> {
    let sub_field = field.element_sub_field();
    let sub_key = keyed_sub_key(&sub_field.element_type, value, registry)?;
    let key = content_key(id, field.storage_id, &sub_key);
    if kv.get(&key)?.is_some() {
        return Ok(false);
    }
    let mut encoded = Vec::new();
    encode_value(&sub_field.element_type, value, registry, &mut encoded)?;
    kv.put(&key, &encoded)?;
    if sub_field.indexed {
        index::add_entry(kv, sub_field.storage_id, &encoded, id)?;
    }
    Ok(true)
}

/// Set: remove `value`.
pub fn set_remove(kv: &mut dyn KvStore, id: ObjId, field: &ComplexField, value: &Value, registry: &TypeRegistry) -> Result<bool> {
    let sub_field = field.element_sub_field();
    let sub_key = keyed_sub_key(&sub_field.element_type, value, registry)?;
    let key = content_key(id, field.storage_id, &sub_key);
    let Some(old) = kv.get(&key)? else { return Ok(false) };
    if sub_field.indexed {
        index::remove_entry(kv, sub_field.storage_id, &old, id)?;
    }
    kv.delete(&key)?;
    Ok(true)
}

/// Map: read the value stored under `key_value`.
pub fn map_get(kv: &dyn KvStore, id: ObjId, field: &ComplexField, key_value: &Value, registry: &TypeRegistry) -> Result<Option<Value>> {
    let key_field = field.key_sub_field().ok_or_else(|| Error::invalid_schema("map field has no key sub-field"))?;
    let sub_key = keyed_sub_key(&key_field.element_type, key_value, registry)?;
    let key = content_key(id, field.storage_id, &sub_key);
    match kv.get(&key)? {
        Some(raw) => {
            let mut r = Reader::new(&raw);
            Ok(Some(decode_value(&field.element_sub_field().element_type, &mut r, registry)?))
        }
        None => Ok(None),
    }
}

/// Map: set `key_value -> value`. Both the key sub-field and the
/// value sub-field are indexed independently when declared indexed;
/// the key is implicit in the content sub-key, so only
/// the value sub-field needs an explicit index entry here — a
/// separately-indexed key sub-field is maintained the same way a set
/// element is, via [`set_add`]-style bookkeeping the caller performs
/// against the key's own simple index when the schema marks it so.
pub fn map_put(
    kv: &mut dyn KvStore,
    id: ObjId,
    field: &ComplexField,
    key_value: &Value,
    value: &Value,
    registry: &TypeRegistry,
) -> Result<()> {
    let key_field = field.key_sub_field().ok_or_else(|| Error::invalid_schema("map field has no key sub-field"))?;
    let value_field = field.element_sub_field();
    let sub_key = keyed_sub_key(&key_field.element_type, key_value, registry)?;
    let key = content_key(id, field.storage_id, &sub_key);
    let old = kv.get(&key)?;
    let mut encoded = Vec::new();
    encode_value(&value_field.element_type, value, registry, &mut encoded)?;
    kv.put(&key, &encoded)?;
    if value_field.indexed {
        index::update_entry(kv, value_field.storage_id, old.as_deref(), Some(&encoded), id)?;
    }
    if old.is_none() && key_field.indexed {
        let mut key_encoded = Vec::new();
        encode_value(&key_field.element_type, key_value, registry, &mut key_encoded)?;
        index::add_entry(kv, key_field.storage_id, &key_encoded, id)?;
    }
    Ok(())
}

/// Map: remove `key_value`.
pub fn map_remove(kv: &mut dyn KvStore, id: ObjId, field: &ComplexField, key_value: &Value, registry: &TypeRegistry) -> Result<bool> {
    let key_field = field.key_sub_field().ok_or_else(|| Error::invalid_schema("map field has no key sub-field"))?;
    let value_field = field.element_sub_field();
    let sub_key = keyed_sub_key(&key_field.element_type, key_value, registry)?;
    let key = content_key(id, field.storage_id, &sub_key);
    let Some(old) = kv.get(&key)? else { return Ok(false) };
    if value_field.indexed {
        index::remove_entry(kv, value_field.storage_id, &old, id)?;
    }
    if key_field.indexed {
        let mut key_encoded = Vec::new();
        encode_value(&key_field.element_type, key_value, registry, &mut key_encoded)?;
        index::remove_entry(kv, key_field.storage_id, &key_encoded, id)?;
    }
    kv.delete(&key)?;
    Ok(true)
}

/// Remove every element whose reference sub-field value is `target`.
/// Used both for UNREFERENCE applied to a collection element and for
/// clearing elements whose type was excluded during migration. Works
/// uniformly across list/set/
/// map since the sub-key layout differs but the content key always
/// decodes back to a [`Value`] via the element/value sub-field.
pub fn unreference_matching(
    kv: &mut dyn KvStore,
    id: ObjId,
    field: &ComplexField,
    target: ObjId,
    registry: &TypeRegistry,
) -> Result<usize> {
    let matching_sub_keys: Vec<Vec<u8>> = iter_elements(kv, id, field, registry)?
        .filter_map(|e| match e {
            Ok(el) if matches!(&el.value, Value::Reference(r) if *r == target) => Some(Ok(el.sub_key)),
            Ok(_) => None,
            Err(e) => Some(Err(e)),
        })
        .collect::<Result<Vec<_>>>()?;

    let sub_field = field.element_sub_field();
    let is_list = matches!(field.kind, CollectionKind::List);
    let mut removed = 0;
    for sub_key in matching_sub_keys {
        let content = content_key(id, field.storage_id, &sub_key);
        if let Some(old) = kv.get(&content)? {
            if sub_field.indexed {
                if is_list {
                    let positional = positional_index_value(&old, &sub_key);
                    index::remove_entry(kv, sub_field.storage_id, &positional, id)?;
                } else {
                    index::remove_entry(kv, sub_field.storage_id, &old, id)?;
                }
            }
            kv.delete(&content)?;
            removed += 1;
        }
    }

    if let (CollectionKind::Map, Some(key_field)) = (field.kind, field.key_sub_field()) {
        if matches!(key_field.element_type, FieldType::Reference) {
            removed += unreference_map_keys(kv, id, field, key_field, target, registry)?;
        }
    }
    Ok(removed)
}

fn unreference_map_keys(
    kv: &mut dyn KvStore,
    id: ObjId,
    field: &ComplexField,
    key_field: &SubField,
    target: ObjId,
    registry: &TypeRegistry,
) -> Result<usize> {
    let prefix = content_field_prefix(id, field.storage_id);
    let matches: Vec<Vec<u8>> = kv
        .scan_prefix(&prefix)?
        .filter_map(|entry| {
            let (key, _) = entry.ok()?;
            let sub_key = &key[prefix.len()..];
            let mut r = Reader::new(sub_key);
            match decode_value(&key_field.element_type, &mut r, registry) {
                Ok(Value::Reference(r)) if r == target => Some(key),
                _ => None,
            }
        })
        .collect();
    let value_field = field.element_sub_field();
    let mut removed = 0;
    for key in matches {
        if let Some(old) = kv.get(&key)? {
            if value_field.indexed {
                index::remove_entry(kv, value_field.storage_id, &old, id)?;
            }
            kv.delete(&key)?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::mem::MemKv;
    use crate::kv::KvDatabase;
    use crate::schema::SubFieldRole;

    fn list_field() -> ComplexField {
        ComplexField {
            storage_id: 50,
            name: "items".into(),
            kind: CollectionKind::List,
            sub_fields: vec![SubField {
                storage_id: 51,
                role: SubFieldRole::Element,
                element_type: FieldType::Int32,
                indexed: false,
                reference: None,
            }],
        }
    }

    fn set_field() -> ComplexField {
        ComplexField {
            storage_id: 60,
            name: "tags".into(),
            kind: CollectionKind::Set,
            sub_fields: vec![SubField {
                storage_id: 61,
                role: SubFieldRole::Element,
                element_type: FieldType::Str,
                indexed: false,
                reference: None,
            }],
        }
    }

    #[test]
    fn list_append_and_iterate() {
        let db = MemKv::new();
        let mut txn = db.begin();
        let registry = TypeRegistry::new();
        let id = ObjId::new(1, 1).unwrap();
        let field = list_field();
        list_append(&mut txn, id, &field, &Value::Int32(10), &registry).unwrap();
        list_append(&mut txn, id, &field, &Value::Int32(20), &registry).unwrap();
        let values: Vec<Value> = iter_elements(&txn, id, &field, &registry).unwrap().map(|e| e.unwrap().value).collect();
        assert_eq!(values, vec![Value::Int32(10), Value::Int32(20)]);
    }

    #[test]
    fn list_insert_shifts_later_elements() {
        let db = MemKv::new();
        let mut txn = db.begin();
        let registry = TypeRegistry::new();
        let id = ObjId::new(1, 1).unwrap();
        let field = list_field();
        list_append(&mut txn, id, &field, &Value::Int32(1), &registry).unwrap();
        list_append(&mut txn, id, &field, &Value::Int32(3), &registry).unwrap();
        list_insert(&mut txn, id, &field, 1, &Value::Int32(2), &registry).unwrap();
        let values: Vec<Value> = iter_elements(&txn, id, &field, &registry).unwrap().map(|e| e.unwrap().value).collect();
        assert_eq!(values, vec![Value::Int32(1), Value::Int32(2), Value::Int32(3)]);
    }

    #[test]
    fn list_remove_shifts_later_elements_down() {
        let db = MemKv::new();
        let mut txn = db.begin();
        let registry = TypeRegistry::new();
        let id = ObjId::new(1, 1).unwrap();
        let field = list_field();
        for v in [1, 2, 3] {
            list_append(&mut txn, id, &field, &Value::Int32(v), &registry).unwrap();
        }
        assert!(list_remove(&mut txn, id, &field, 0, &registry).unwrap());
        let values: Vec<Value> = iter_elements(&txn, id, &field, &registry).unwrap().map(|e| e.unwrap().value).collect();
        assert_eq!(values, vec![Value::Int32(2), Value::Int32(3)]);
    }

    #[test]
    fn set_add_is_idempotent() {
        let db = MemKv::new();
        let mut txn = db.begin();
        let registry = TypeRegistry::new();
        let id = ObjId::new(1, 1).unwrap();
        let field = set_field();
        let v = Value::Str(std::sync::Arc::from("x"));
        assert!(set_add(&mut txn, id, &field, &v, &registry).unwrap());
        assert!(!set_add(&mut txn, id, &field, &v, &registry).unwrap());
        assert_eq!(len(&txn, id, &field, &registry).unwrap(), 1);
    }
}
