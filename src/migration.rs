//! Incremental lazy schema migration.
//!
//! Migration runs once per object, on first access after a schema
//! upgrade, entirely inside the caller's transaction. It never scans
//! the whole database: an object left untouched simply stays at its
//! old recorded version indefinitely.

use std::collections::HashMap;

use crate::codec::Reader;
use crate::collection;
use crate::error::Result;
use crate::index;
use crate::keys::{content_field_prefix, content_key, meta_version_key};
use crate::kv::KvStore;
use crate::objid::ObjId;
use crate::registry::TypeRegistry;
use crate::schema::{FieldKind, ObjectType, Schema};
use crate::value::{decode_value, encode_value, Value};

/// The object's field values immediately before migration, keyed by
/// field name, handed to listeners as the schema-changed
/// notification payload.
pub type OldValues = HashMap<String, Value>;

/// Migrate `id` from `old_ty`/`old_schema` to `new_ty` at
/// `new_schema.version`: remove dropped fields, initialize new ones,
/// reconcile shared ones. Returns the pre-migration values of every
/// field present in the old schema, for the caller to pass to
/// `onSchemaChange` listeners.
pub fn migrate_object(
    kv: &mut dyn KvStore,
    id: ObjId,
    old_ty: &ObjectType,
    new_ty: &ObjectType,
    new_schema: &Schema,
    registry: &TypeRegistry,
) -> Result<OldValues> {
    let mut old_values = OldValues::new();

    for (field_id, old_field) in &old_ty.fields {
        let old_values_for_field = read_old_field(kv, id, old_field, registry)?;
        if let Some(v) = &old_values_for_field {
            old_values.insert(old_field.name().to_string(), v.clone());
        }

        match new_ty.fields.get(field_id) {
            None => remove_field(kv, id, old_field, registry)?,
            Some(new_field) => migrate_shared_field(kv, id, old_field, new_field, registry)?,
        }
    }

    for (field_id, new_field) in &new_ty.fields {
        if !old_ty.fields.contains_key(field_id) {
            initialize_new_field(kv, id, new_field, registry)?;
        }
    }

    kv.put(&meta_version_key(id), &new_schema.version.to_be_bytes())?;
    Ok(old_values)
}

fn read_old_field(kv: &dyn KvStore, id: ObjId, field: &FieldKind, registry: &TypeRegistry) -> Result<Option<Value>> {
    match field {
        FieldKind::Simple(f) => {
            let key = content_key(id, f.storage_id, &[]);
            match kv.get(&key)? {
                Some(raw) => {
                    let mut r = Reader::new(&raw);
                    Ok(Some(decode_value(&f.element_type, &mut r, registry)?))
                }
                None => Ok(None),
            }
        }
        FieldKind::Complex(_) | FieldKind::Counter(_) => Ok(None),
    }
}

/// Collect (already done by the caller via `read_old_field`) then
/// delete content and index entries for a field the new schema no
/// longer declares.
fn remove_field(kv: &mut dyn KvStore, id: ObjId, field: &FieldKind, registry: &TypeRegistry) -> Result<()> {
    match field {
        FieldKind::Simple(f) => {
            let key = content_key(id, f.storage_id, &[]);
            if let Some(old) = kv.get(&key)? {
                if f.indexed {
                    index::remove_entry(kv, f.storage_id, &old, id)?;
                }
                kv.delete(&key)?;
            }
        }
        FieldKind::Complex(f) => {
            let _ = registry;
            let sub_field = f.element_sub_field();
            let is_list = matches!(f.kind, crate::schema::CollectionKind::List);
            let prefix = content_field_prefix(id, f.storage_id);
            let entries: Vec<(Vec<u8>, Vec<u8>)> = kv.scan_prefix(&prefix)?.collect::<Result<Vec<_>>>()?;
            for (key, raw) in entries {
                if sub_field.indexed {
                    let sub_key = &key[prefix.len()..];
                    let index_value = if is_list {
                        let mut v = raw.clone();
                        v.extend_from_slice(sub_key);
                        v
                    } else {
                        raw
                    };
                    index::remove_entry(kv, sub_field.storage_id, &index_value, id)?;
                }
                kv.delete(&key)?;
            }
        }
        FieldKind::Counter(f) => {
            let key = content_key(id, f.storage_id, &[]);
            kv.delete(&key)?;
        }
    }
    Ok(())
}

/// A field new to this object type starts at its
/// declared default and, if indexed, gets an index entry for that
/// default (simple fields only; a freshly-added collection field
/// starts empty so there is nothing to index yet).
fn initialize_new_field(kv: &mut dyn KvStore, id: ObjId, field: &FieldKind, registry: &TypeRegistry) -> Result<()> {
    if let FieldKind::Simple(f) = field {
        let default = f.element_type.default_value(registry);
        let key = content_key(id, f.storage_id, &[]);
        let mut encoded = Vec::new();
        encode_value(&f.element_type, &default, registry, &mut encoded)?;
        kv.put(&key, &encoded)?;
        if f.indexed && !default.is_null() {
            index::add_entry(kv, f.storage_id, &encoded, id)?;
        }
    }
    Ok(())
}

/// A field present in both schemas. Re-encodes a recognized numeric
/// widening in place, reconciles the indexed flag,
/// and scrubs referents excluded by a narrowed allowed-types set.
fn migrate_shared_field(
    kv: &mut dyn KvStore,
    id: ObjId,
    old_field: &FieldKind,
    new_field: &FieldKind,
    registry: &TypeRegistry,
) -> Result<()> {
    match (old_field, new_field) {
        (FieldKind::Simple(old), FieldKind::Simple(new)) => migrate_simple_field(kv, id, old, new, registry),
        (FieldKind::Complex(old), FieldKind::Complex(new)) => migrate_complex_field(kv, id, old, new, registry),
        (FieldKind::Counter(_), FieldKind::Counter(_)) => Ok(()),
        _ => Ok(()),
    }
}

fn migrate_simple_field(
    kv: &mut dyn KvStore,
    id: ObjId,
    old: &crate::schema::SimpleField,
    new: &crate::schema::SimpleField,
    registry: &TypeRegistry,
) -> Result<()> {
    let key = content_key(id, new.storage_id, &[]);
    let Some(raw) = kv.get(&key)? else { return Ok(()) };

    let (value, old_encoded) = {
        let mut r = Reader::new(&raw);
        (decode_value(&old.element_type, &mut r, registry)?, raw.clone())
    };

    let mut new_encoded = Vec::new();
    if new.element_type.is_migration_promotion_of(&old.element_type) {
        let promoted = promote(&value, &new.element_type);
        encode_value(&new.element_type, &promoted, registry, &mut new_encoded)?;
        kv.put(&key, &new_encoded)?;
    } else {
        new_encoded = old_encoded.clone();
    }

    if old.indexed != new.indexed {
        if new.indexed {
            index::add_entry(kv, new.storage_id, &new_encoded, id)?;
        } else {
            index::remove_entry(kv, old.storage_id, &old_encoded, id)?;
        }
    } else if old.indexed && new_encoded != old_encoded {
        index::update_entry(kv, new.storage_id, Some(&old_encoded), Some(&new_encoded), id)?;
    }

    if let (Some(old_ref), Some(new_ref)) = (&old.reference, &new.reference) {
        if let (Some(old_allowed), Some(new_allowed)) = (&old_ref.allowed_types, &new_ref.allowed_types) {
            if new_allowed.len() < old_allowed.len() {
                if let Value::Reference(r) = decode_value(&new.element_type, &mut Reader::new(&new_encoded), registry)? {
                    if let Ok(sid) = r.storage_id() {
                        if !new_allowed.contains(&sid) {
                            // Simple reference fields reset to null rather than
                            // disappearing entirely, unlike collection elements.
                            if new.indexed {
                                index::remove_entry(kv, new.storage_id, &new_encoded, id)?;
                            }
                            let mut null_encoded = Vec::new();
                            encode_value(&new.element_type, &Value::Null, registry, &mut null_encoded)?;
                            kv.put(&key, &null_encoded)?;
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

fn promote(value: &Value, target: &crate::value::FieldType) -> Value {
    use crate::value::FieldType::*;
    match (value, target) {
        (Value::Int32(v), Int64) => Value::Int64(*v as i64),
        (Value::Int32(v), Float64) => Value::Float64(*v as f64),
        (Value::Int64(v), Float64) => Value::Float64(*v as f64),
        _ => value.clone(),
    }
}

fn migrate_complex_field(
    kv: &mut dyn KvStore,
    id: ObjId,
    old: &crate::schema::ComplexField,
    new: &crate::schema::ComplexField,
    registry: &TypeRegistry,
) -> Result<()> {
    let old_sub = old.element_sub_field();
    let new_sub = new.element_sub_field();
    if old_sub.indexed == new_sub.indexed {
        return scrub_narrowed_references(kv, id, new, registry);
    }

    let is_list = matches!(new.kind, crate::schema::CollectionKind::List);
    let prefix = content_field_prefix(id, new.storage_id);
    let entries: Vec<(Vec<u8>, Vec<u8>)> = kv.scan_prefix(&prefix)?.collect::<Result<Vec<_>>>()?;
    for (key, raw) in entries {
        let sub_key = &key[prefix.len()..];
        let index_value = if is_list {
            let mut v = raw.clone();
            v.extend_from_slice(sub_key);
            v
        } else {
            raw
        };
        if new_sub.indexed {
            index::add_entry(kv, new_sub.storage_id, &index_value, id)?;
        } else {
            index::remove_entry(kv, old_sub.storage_id, &index_value, id)?;
        }
    }
    scrub_narrowed_references(kv, id, new, registry)
}

fn scrub_narrowed_references(kv: &mut dyn KvStore, id: ObjId, field: &crate::schema::ComplexField, registry: &TypeRegistry) -> Result<()> {
    let Some(spec) = &field.element_sub_field().reference else { return Ok(()) };
    let Some(allowed) = &spec.allowed_types else { return Ok(()) };

    let prefix = content_field_prefix(id, field.storage_id);
    let targets: Vec<ObjId> = kv
        .scan_prefix(&prefix)?
        .filter_map(|e| {
            let (_, raw) = e.ok()?;
            let mut r = Reader::new(&raw);
            match decode_value(&field.element_sub_field().element_type, &mut r, registry).ok()? {
                Value::Reference(r) if !allowed.contains(&r.storage_id().ok()?) => Some(r),
                _ => None,
            }
        })
        .collect();
    for target in targets {
        collection::unreference_matching(kv, id, field, target, registry)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::mem::MemKv;
    use crate::kv::KvDatabase;
    use crate::schema::{FieldKind, ObjectType, SimpleField};
    use crate::value::FieldType;
    use std::collections::BTreeMap;

    fn ty_with(field_id: u64, ty: FieldType, indexed: bool) -> ObjectType {
        let mut fields = BTreeMap::new();
        fields.insert(
            field_id,
            FieldKind::Simple(SimpleField { storage_id: field_id, name: "f".into(), element_type: ty, indexed, reference: None }),
        );
        ObjectType { storage_id: 1, name: "T".into(), fields, composite_indexes: BTreeMap::new() }
    }

    #[test]
    fn promotes_int32_to_int64_in_place() {
        let db = MemKv::new();
        let mut txn = db.begin();
        let registry = TypeRegistry::new();
        let id = ObjId::new(1, 1).unwrap();
        let old_ty = ty_with(10, FieldType::Int32, false);
        let new_ty = ty_with(10, FieldType::Int64, false);

        let mut encoded = Vec::new();
        encode_value(&FieldType::Int32, &Value::Int32(7), &registry, &mut encoded).unwrap();
        txn.put(&content_key(id, 10, &[]), &encoded).unwrap();

        let new_schema = Schema { version: 2, object_types: BTreeMap::from([(1, new_ty.clone())]) };
        migrate_object(&mut txn, id, &old_ty, &new_ty, &new_schema, &registry).unwrap();

        let raw = txn.get(&content_key(id, 10, &[])).unwrap().unwrap();
        let mut r = Reader::new(&raw);
        assert_eq!(decode_value(&FieldType::Int64, &mut r, &registry).unwrap(), Value::Int64(7));
    }

    #[test]
    fn dropped_field_is_removed() {
        let db = MemKv::new();
        let mut txn = db.begin();
        let registry = TypeRegistry::new();
        let id = ObjId::new(1, 1).unwrap();
        let old_ty = ty_with(10, FieldType::Int32, false);
        let new_ty = ObjectType { storage_id: 1, name: "T".into(), fields: BTreeMap::new(), composite_indexes: BTreeMap::new() };

        let mut encoded = Vec::new();
        encode_value(&FieldType::Int32, &Value::Int32(7), &registry, &mut encoded).unwrap();
        txn.put(&content_key(id, 10, &[]), &encoded).unwrap();

        let new_schema = Schema { version: 2, object_types: BTreeMap::from([(1, new_ty.clone())]) };
        let old_values = migrate_object(&mut txn, id, &old_ty, &new_ty, &new_schema, &registry).unwrap();

        assert_eq!(old_values.get("f"), Some(&Value::Int32(7)));
        assert!(txn.get(&content_key(id, 10, &[])).unwrap().is_none());
    }
}
