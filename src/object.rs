//! Object layer: creation, deletion, field access, and per-object
//! schema-version tracking, built on the content, index, and
//! migration layers below it.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use crate::codec::Reader;
use crate::collection;
use crate::error::{Error, Result};
use crate::index;
use crate::keys::{content_key, content_object_prefix, content_field_prefix, counter_key, meta_version_key};
use crate::kv::KvStore;
use crate::listener::ListenerSet;
use crate::migration;
use crate::objid::ObjId;
use crate::registry::TypeRegistry;
use crate::schema::catalog::SchemaCatalog;
use crate::schema::{CollectionKind, ComplexField, FieldKind, ObjectType, OnDelete, Schema, SimpleField};
use crate::value::{decode_value, encode_value, FieldType, Value};

/// One unit of work against a [`KvStore`], bound to a target schema
/// version. All reads and writes in this module go through a
/// `Transaction`; nothing touches the store directly.
pub struct Transaction<S: KvStore> {
    kv: S,
    schema: Arc<Schema>,
    catalog: Arc<SchemaCatalog>,
    registry: Arc<TypeRegistry>,
    listeners: ListenerSet,
}

impl<S: KvStore> Transaction<S> {
    /// Open a transaction targeting `schema`, registering it with
    /// `catalog` first if this is the first time this version has
    /// been seen: an unrecognized version is atomically added rather
    /// than rejected.
    pub fn new(mut kv: S, schema: Schema, catalog: Arc<SchemaCatalog>, registry: Arc<TypeRegistry>) -> Result<Self> {
        let version = schema.version;
        let schema = catalog.get_or_register(&mut kv, version, move || schema)?;
        Ok(Self { kv, schema, catalog, registry, listeners: ListenerSet::new() })
    }

    /// The schema version this transaction targets.
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Mutable access to this transaction's registered listeners.
    pub fn listeners_mut(&mut self) -> &mut ListenerSet {
        &mut self.listeners
    }

    /// Direct access to the underlying store, for callers building
    /// their own key ranges (e.g. index range queries).
    pub fn kv(&self) -> &S {
        &self.kv
    }

    /// Mutable access to the underlying store, for callers that need
    /// to perform bulk operations this transaction has no dedicated
    /// method for (e.g. a snapshot's `reset`).
    pub fn kv_mut(&mut self) -> &mut S {
        &mut self.kv
    }

    fn allocate_counter(&mut self, storage_id: u64) -> Result<u64> {
        let key = counter_key(storage_id);
        let next = match self.kv.get(&key)? {
            Some(raw) => {
                let bytes: [u8; 8] = raw.try_into().map_err(|_| Error::codec("corrupt counter key"))?;
                u64::from_be_bytes(bytes)
            }
            None => 0,
        };
        self.kv.put(&key, &(next + 1).to_be_bytes())?;
        Ok(next)
    }

    /// Create a new object of `storage_id`'s type, with every simple
    /// field initialized to its type's default.
    pub fn create(&mut self, storage_id: u64) -> Result<ObjId> {
        let ty = self.schema.object_type(storage_id)?.clone();
        let counter = self.allocate_counter(storage_id)?;
        let id = ObjId::new(storage_id, counter)?;

        for field in ty.fields.values() {
            if let FieldKind::Simple(f) = field {
                let default = f.element_type.default_value(&self.registry);
                let mut encoded = Vec::new();
                encode_value(&f.element_type, &default, &self.registry, &mut encoded)?;
                self.kv.put(&content_key(id, f.storage_id, &[]), &encoded)?;
                if f.indexed && !default.is_null() {
                    index::add_entry(&mut self.kv, f.storage_id, &encoded, id)?;
                }
            }
        }
        for ci in ty.composite_indexes.values() {
            let mut tuple = Vec::new();
            for fid in &ci.field_ids {
                let raw = self.kv.get(&content_key(id, *fid, &[]))?.unwrap_or_else(|| vec![0x00]);
                tuple.extend_from_slice(&raw);
            }
            index::add_composite_entry(&mut self.kv, ci.storage_id, &tuple, id)?;
        }
        self.kv.put(&meta_version_key(id), &self.schema.version.to_be_bytes())?;
        self.listeners.dispatch_create(id, &self.kv, &self.registry)?;
        Ok(id)
    }

    /// Whether `id` currently denotes a live object.
    pub fn exists(&self, id: ObjId) -> Result<bool> {
        Ok(self.kv.get(&meta_version_key(id))?.is_some())
    }

    /// The schema version `id` was last written under, or `None` if
    /// it does not exist.
    pub fn get_version(&self, id: ObjId) -> Result<Option<u64>> {
        match self.kv.get(&meta_version_key(id))? {
            Some(raw) => {
                let bytes: [u8; 8] = raw.try_into().map_err(|_| Error::codec("corrupt version key"))?;
                Ok(Some(u64::from_be_bytes(bytes)))
            }
            None => Ok(None),
        }
    }

    /// Migrate `id` to this transaction's schema version if it is not
    /// already there: any field access compares the object's recorded
    /// version to the transaction's target version first. A no-op for
    /// an already-current object; every field accessor calls this
    /// first.
    pub fn upgrade(&mut self, id: ObjId) -> Result<()> {
        let Some(old_version) = self.get_version(id)? else { return Err(Error::DeletedObject) };
        if old_version == self.schema.version {
            return Ok(());
        }
        let old_schema = self
            .catalog
            .get(&self.kv, old_version)?
            .ok_or_else(|| Error::invalid_schema(format!("schema version {old_version} is not recorded")))?;
        let storage_id = id.storage_id()?;
        let old_ty = old_schema.object_type(storage_id)?.clone();
        let new_ty = self.schema.object_type(storage_id)?.clone();
        let old_values = migration::migrate_object(&mut self.kv, id, &old_ty, &new_ty, &self.schema, &self.registry)?;
        if !self.listeners.is_empty() {
            self.listeners.dispatch_schema_change(id, old_version, self.schema.version, &old_values, &self.kv, &self.registry)?;
        }
        Ok(())
    }

    fn simple_field(&self, id: ObjId, field_id: u64) -> Result<SimpleField> {
        let storage_id = id.storage_id()?;
        let ty = self.schema.object_type(storage_id)?;
        ty.field(field_id)?
            .as_simple()
            .cloned()
            .ok_or_else(|| Error::type_mismatch("simple field".to_string(), "non-simple field".to_string()))
    }

    fn complex_field(&self, id: ObjId, field_id: u64) -> Result<ComplexField> {
        let storage_id = id.storage_id()?;
        let ty = self.schema.object_type(storage_id)?;
        ty.field(field_id)?
            .as_complex()
            .cloned()
            .ok_or_else(|| Error::type_mismatch("complex field".to_string(), "non-complex field".to_string()))
    }

    /// Read a simple field.
    pub fn read_simple(&mut self, id: ObjId, field_id: u64) -> Result<Value> {
        self.upgrade(id)?;
        let field = self.simple_field(id, field_id)?;
        match self.kv.get(&content_key(id, field.storage_id, &[]))? {
            Some(raw) => {
                let mut r = Reader::new(&raw);
                decode_value(&field.element_type, &mut r, &self.registry)
            }
            None => Ok(Value::Null),
        }
    }

    fn composite_tuples(
        &self,
        id: ObjId,
        ty: &ObjectType,
        field_storage_id: u64,
        old_encoded: Option<&[u8]>,
        new_encoded: &[u8],
    ) -> Result<Vec<(u64, Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        for ci in ty.composite_indexes.values() {
            if !ci.field_ids.contains(&field_storage_id) {
                continue;
            }
            let mut old_tuple = Vec::new();
            let mut new_tuple = Vec::new();
            for fid in &ci.field_ids {
                if *fid == field_storage_id {
                    old_tuple.extend_from_slice(old_encoded.unwrap_or(&[0x00]));
                    new_tuple.extend_from_slice(new_encoded);
                } else {
                    let raw = self.kv.get(&content_key(id, *fid, &[]))?.unwrap_or_else(|| vec![0x00]);
                    old_tuple.extend_from_slice(&raw);
                    new_tuple.extend_from_slice(&raw);
                }
            }
            out.push((ci.storage_id, old_tuple, new_tuple));
        }
        Ok(out)
    }

    /// Write a simple field: validates a reference's allowed-types
    /// set, maintains the field's own index
    /// and every composite index it participates in, and notifies
    /// listeners when the value actually changed.
    pub fn write_simple(&mut self, id: ObjId, field_id: u64, value: Value) -> Result<()> {
        if !self.exists(id)? {
            return Err(Error::DeletedObject);
        }
        self.upgrade(id)?;
        let storage_id = id.storage_id()?;
        let ty = self.schema.object_type(storage_id)?.clone();
        let field = self.simple_field(id, field_id)?;

        if let (Value::Reference(target), Some(spec)) = (&value, &field.reference) {
            if let Some(allowed) = &spec.allowed_types {
                let target_sid = target.storage_id()?;
                if !allowed.contains(&target_sid) {
                    return Err(Error::type_mismatch(
                        format!("reference to one of {allowed:?}"),
                        format!("reference to storage-id {target_sid}"),
                    ));
                }
            }
        }

        let key = content_key(id, field.storage_id, &[]);
        let old_raw = self.kv.get(&key)?;
        let old_value = match &old_raw {
            Some(raw) => {
                let mut r = Reader::new(raw);
                decode_value(&field.element_type, &mut r, &self.registry)?
            }
            None => Value::Null,
        };

        let mut new_encoded = Vec::new();
        encode_value(&field.element_type, &value, &self.registry, &mut new_encoded)?;

        let composite_updates = self.composite_tuples(id, &ty, field.storage_id, old_raw.as_deref(), &new_encoded)?;

        self.kv.put(&key, &new_encoded)?;
        if field.indexed {
            let old_indexed = if old_value.is_null() { None } else { old_raw.as_deref() };
            let new_indexed = if value.is_null() { None } else { Some(new_encoded.as_slice()) };
            index::update_entry(&mut self.kv, field.storage_id, old_indexed, new_indexed, id)?;
        }
        for (ci_storage_id, old_tuple, new_tuple) in composite_updates {
            if old_tuple != new_tuple {
                index::remove_composite_entry(&mut self.kv, ci_storage_id, &old_tuple, id)?;
                index::add_composite_entry(&mut self.kv, ci_storage_id, &new_tuple, id)?;
            }
        }

        if !self.listeners.is_empty() && old_value != value {
            self.listeners.dispatch_change(id, field_id, &old_value, &value, &self.kv, &self.registry)?;
        }
        Ok(())
    }

    /// List: read the element at `index`.
    pub fn list_get(&mut self, id: ObjId, field_id: u64, index: u32) -> Result<Option<Value>> {
        self.upgrade(id)?;
        let field = self.complex_field(id, field_id)?;
        collection::list_get(&self.kv, id, &field, index, &self.registry)
    }

    /// List: overwrite the element at `index`.
    pub fn list_set(&mut self, id: ObjId, field_id: u64, index: u32, value: Value) -> Result<()> {
        self.upgrade(id)?;
        let field = self.complex_field(id, field_id)?;
        collection::list_set(&mut self.kv, id, &field, index, &value, &self.registry)
    }

    /// List: insert at `index`, shifting later elements up.
    pub fn list_insert(&mut self, id: ObjId, field_id: u64, index: u32, value: Value) -> Result<()> {
        self.upgrade(id)?;
        let field = self.complex_field(id, field_id)?;
        collection::list_insert(&mut self.kv, id, &field, index, &value, &self.registry)
    }

    /// List: append at the next unused index.
    pub fn list_append(&mut self, id: ObjId, field_id: u64, value: Value) -> Result<u32> {
        self.upgrade(id)?;
        let field = self.complex_field(id, field_id)?;
        collection::list_append(&mut self.kv, id, &field, &value, &self.registry)
    }

    /// List: remove the element at `index`, shifting later elements
    /// down.
    pub fn list_remove(&mut self, id: ObjId, field_id: u64, index: u32) -> Result<bool> {
        self.upgrade(id)?;
        let field = self.complex_field(id, field_id)?;
        collection::list_remove(&mut self.kv, id, &field, index, &self.registry)
    }

    /// Set: does `value` belong to the set?
    pub fn set_contains(&mut self, id: ObjId, field_id: u64, value: &Value) -> Result<bool> {
        self.upgrade(id)?;
        let field = self.complex_field(id, field_id)?;
        collection::set_contains(&self.kv, id, &field, value, &self.registry)
    }

    /// Set: add `value`.
    pub fn set_add(&mut self, id: ObjId, field_id: u64, value: Value) -> Result<bool> {
        self.upgrade(id)?;
        let field = self.complex_field(id, field_id)?;
        collection::set_add(&mut self.kv, id, &field, &value, &self.registry)
    }

    /// Set: remove `value`.
    pub fn set_remove(&mut self, id: ObjId, field_id: u64, value: &Value) -> Result<bool> {
        self.upgrade(id)?;
        let field = self.complex_field(id, field_id)?;
        collection::set_remove(&mut self.kv, id, &field, value, &self.registry)
    }

    /// Map: read the value for `key_value`.
    pub fn map_get(&mut self, id: ObjId, field_id: u64, key_value: &Value) -> Result<Option<Value>> {
        self.upgrade(id)?;
        let field = self.complex_field(id, field_id)?;
        collection::map_get(&self.kv, id, &field, key_value, &self.registry)
    }

    /// Map: set `key_value -> value`.
    pub fn map_put(&mut self, id: ObjId, field_id: u64, key_value: Value, value: Value) -> Result<()> {
        self.upgrade(id)?;
        let field = self.complex_field(id, field_id)?;
        collection::map_put(&mut self.kv, id, &field, &key_value, &value, &self.registry)
    }

    /// Map: remove `key_value`.
    pub fn map_remove(&mut self, id: ObjId, field_id: u64, key_value: &Value) -> Result<bool> {
        self.upgrade(id)?;
        let field = self.complex_field(id, field_id)?;
        collection::map_remove(&mut self.kv, id, &field, key_value, &self.registry)
    }

    /// Every `(field-storage-id, holder-id, disposition, is-collection)`
    /// quadruple for references into `target`, found via the
    /// reference field's index.
    fn reverse_references(&self, target: ObjId) -> Result<Vec<(u64, ObjId, OnDelete, bool)>> {
        let mut out = Vec::new();
        let mut target_encoded = Vec::new();
        encode_value(&FieldType::Reference, &Value::Reference(target), &self.registry, &mut target_encoded)?;

        for ty in self.schema.object_types.values() {
            for field in ty.fields.values() {
                match field {
                    FieldKind::Simple(f) => {
                        if let Some(spec) = &f.reference {
                            if spec.on_delete != OnDelete::Nothing {
                                if !f.indexed {
                                    return Err(Error::invalid_schema(format!(
                                        "reference field {} has a non-NOTHING disposition but is not indexed",
                                        f.storage_id
                                    )));
                                }
                                for holder in index::query_exact(&self.kv, f.storage_id, &target_encoded)? {
                                    out.push((f.storage_id, holder, spec.on_delete, false));
                                }
                            }
                        }
                    }
                    FieldKind::Complex(f) => {
                        for sf in &f.sub_fields {
                            if let Some(spec) = &sf.reference {
                                if spec.on_delete != OnDelete::Nothing {
                                    if !sf.indexed {
                                        return Err(Error::invalid_schema(format!(
                                            "reference sub-field {} has a non-NOTHING disposition but is not indexed",
                                            sf.storage_id
                                        )));
                                    }
                                    for holder in index::query_exact(&self.kv, sf.storage_id, &target_encoded)? {
                                        out.push((sf.storage_id, holder, spec.on_delete, true));
                                    }
                                }
                            }
                        }
                    }
                    FieldKind::Counter(_) => {}
                }
            }
        }
        Ok(out)
    }

    fn find_field_owner(&self, field_storage_id: u64) -> Option<FieldKind> {
        for ty in self.schema.object_types.values() {
            for field in ty.fields.values() {
                match field {
                    FieldKind::Simple(f) if f.storage_id == field_storage_id => return Some(field.clone()),
                    FieldKind::Complex(f) if f.sub_fields.iter().any(|sf| sf.storage_id == field_storage_id) => {
                        return Some(field.clone())
                    }
                    _ => {}
                }
            }
        }
        None
    }

    /// Delete `id`, applying on-delete dispositions for every reverse
    /// reference and cascading DELETE-dispositioned holders in FIFO
    /// order. Returns `false` if `id` did not exist. Validates the
    /// entire cascade closure before mutating anything, so an
    /// EXCEPTION anywhere in the closure leaves all keys unchanged.
    pub fn delete(&mut self, id: ObjId) -> Result<bool> {
        if !self.exists(id)? {
            return Ok(false);
        }

        let mut order = Vec::new();
        let mut queued: HashSet<ObjId> = HashSet::new();
        let mut worklist: VecDeque<ObjId> = VecDeque::new();
        worklist.push_back(id);
        queued.insert(id);

        while let Some(current) = worklist.pop_front() {
            order.push(current);
            for (_, holder, disposition, _) in self.reverse_references(current)? {
                match disposition {
                    OnDelete::Nothing | OnDelete::Unreference => {}
                    OnDelete::Exception => return Err(Error::ReferencedObject),
                    OnDelete::Delete => {
                        if queued.insert(holder) {
                            worklist.push_back(holder);
                        }
                    }
                }
            }
        }

        for current in order {
            self.delete_one(current)?;
        }
        Ok(true)
    }

    fn delete_one(&mut self, id: ObjId) -> Result<()> {
        let storage_id = id.storage_id()?;
        let ty = self.schema.object_type(storage_id)?.clone();

        for (field_storage_id, holder_id, disposition, is_collection) in self.reverse_references(id)? {
            if disposition != OnDelete::Unreference {
                continue;
            }
            let Some(owner_field) = self.find_field_owner(field_storage_id) else { continue };
            match (is_collection, owner_field) {
                (false, FieldKind::Simple(f)) => {
                    self.write_simple(holder_id, f.storage_id, Value::Null)?;
                }
                (true, FieldKind::Complex(f)) => {
                    collection::unreference_matching(&mut self.kv, holder_id, &f, id, &self.registry)?;
                }
                _ => {}
            }
        }

        for field in ty.fields.values() {
            match field {
                FieldKind::Simple(f) => {
                    let key = content_key(id, f.storage_id, &[]);
                    if let Some(old) = self.kv.get(&key)? {
                        if f.indexed {
                            index::remove_entry(&mut self.kv, f.storage_id, &old, id)?;
                        }
                    }
                }
                FieldKind::Complex(f) => {
                    let sub_field = f.element_sub_field();
                    if sub_field.indexed {
                        let prefix = content_field_prefix(id, f.storage_id);
                        let is_list = matches!(f.kind, CollectionKind::List);
                        for entry in self.kv.scan_prefix(&prefix)?.collect::<Result<Vec<_>>>()? {
                            let (key, raw) = entry;
                            let sub_key = &key[prefix.len()..];
                            let index_value = if is_list {
                                let mut v = raw.clone();
                                v.extend_from_slice(sub_key);
                                v
                            } else {
                                raw
                            };
                            index::remove_entry(&mut self.kv, sub_field.storage_id, &index_value, id)?;
                        }
                    }
                }
                FieldKind::Counter(_) => {}
            }
        }

        for ci in ty.composite_indexes.values() {
            let mut tuple = Vec::new();
            for fid in &ci.field_ids {
                let raw = self.kv.get(&content_key(id, *fid, &[]))?.unwrap_or_else(|| vec![0x00]);
                tuple.extend_from_slice(&raw);
            }
            index::remove_composite_entry(&mut self.kv, ci.storage_id, &tuple, id)?;
        }

        let prefix = content_object_prefix(id);
        let keys: Vec<Vec<u8>> = self.kv.scan_prefix(&prefix)?.map(|e| e.map(|(k, _)| k)).collect::<Result<Vec<_>>>()?;
        for key in keys {
            self.kv.delete(&key)?;
        }
        self.kv.delete(&meta_version_key(id))?;

        self.listeners.dispatch_delete(id, &self.kv, &self.registry)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::mem::MemKv;
    use crate::kv::KvDatabase;
    use crate::schema::{ReferenceSpec, SimpleField};
    use std::collections::BTreeMap;

    fn two_type_schema(on_delete: OnDelete) -> Schema {
        let mut a_fields = BTreeMap::new();
        a_fields.insert(
            100,
            FieldKind::Simple(SimpleField {
                storage_id: 100,
                name: "r".into(),
                element_type: FieldType::Reference,
                indexed: true,
                reference: Some(ReferenceSpec { allowed_types: None, on_delete }),
            }),
        );
        let a = ObjectType { storage_id: 1, name: "A".into(), fields: a_fields, composite_indexes: BTreeMap::new() };
        let b = ObjectType { storage_id: 2, name: "B".into(), fields: BTreeMap::new(), composite_indexes: BTreeMap::new() };
        let mut object_types = BTreeMap::new();
        object_types.insert(1, a);
        object_types.insert(2, b);
        Schema { version: 1, object_types }
    }

    #[test]
    fn create_then_read_default() {
        let db = MemKv::new();
        let catalog = Arc::new(SchemaCatalog::new());
        let registry = Arc::new(TypeRegistry::new());
        let schema = two_type_schema(OnDelete::Nothing);
        let mut txn = Transaction::new(db.begin(), schema, catalog, registry).unwrap();
        let a = txn.create(1).unwrap();
        assert_eq!(txn.read_simple(a, 100).unwrap(), Value::Null);
    }

    #[test]
    fn unreference_on_delete_clears_holder() {
        let db = MemKv::new();
        let catalog = Arc::new(SchemaCatalog::new());
        let registry = Arc::new(TypeRegistry::new());
        let schema = two_type_schema(OnDelete::Unreference);
        let mut txn = Transaction::new(db.begin(), schema, catalog, registry).unwrap();
        let a = txn.create(1).unwrap();
        let b = txn.create(2).unwrap();
        txn.write_simple(a, 100, Value::Reference(b)).unwrap();
        assert!(txn.delete(b).unwrap());
        assert_eq!(txn.read_simple(a, 100).unwrap(), Value::Null);
    }

    #[test]
    fn exception_on_delete_blocks_deletion() {
        let db = MemKv::new();
        let catalog = Arc::new(SchemaCatalog::new());
        let registry = Arc::new(TypeRegistry::new());
        let schema = two_type_schema(OnDelete::Exception);
        let mut txn = Transaction::new(db.begin(), schema, catalog, registry).unwrap();
        let a = txn.create(1).unwrap();
        let b = txn.create(2).unwrap();
        txn.write_simple(a, 100, Value::Reference(b)).unwrap();
        assert!(txn.delete(b).is_err());
        assert!(txn.exists(b).unwrap());
    }

    #[test]
    fn delete_is_idempotent_on_absent_object() {
        let db = MemKv::new();
        let catalog = Arc::new(SchemaCatalog::new());
        let registry = Arc::new(TypeRegistry::new());
        let schema = two_type_schema(OnDelete::Nothing);
        let mut txn = Transaction::new(db.begin(), schema, catalog, registry).unwrap();
        let a = txn.create(1).unwrap();
        assert!(txn.delete(a).unwrap());
        assert!(!txn.delete(a).unwrap());
    }
}
