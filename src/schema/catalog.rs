//! Schema catalog: the set of recorded schema versions, stored in the
//! KV store under a dedicated key range.

use std::sync::Arc;

use dashmap::DashMap;

use super::Schema;
use crate::error::{Error, Result};
use crate::keys;
use crate::kv::KvStore;

/// Reads and atomically registers [`Schema`] versions against a
/// [`KvStore`] handle.
///
/// Registration logic lives here rather than on `Schema` itself
/// because it must consult every other version already recorded in
/// the same store, checking compatibility for every shared storage-id.
pub struct SchemaCatalog {
    cache: DashMap<u64, Arc<Schema>>,
    validate_on_register: bool,
}

impl Default for SchemaCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaCatalog {
    /// A fresh, empty-cache catalog view that validates every
    /// registration against every other recorded version.
    pub fn new() -> Self {
        Self { cache: DashMap::new(), validate_on_register: true }
    }

    /// A fresh, empty-cache catalog view with compatibility checking
    /// on registration controlled by `validate_on_register`. Meant for
    /// [`crate::config::SchemaConfig::validate_on_register`]; disabling
    /// it is only meant for trusted bulk loads that have already
    /// validated compatibility out of band.
    pub fn with_validation(validate_on_register: bool) -> Self {
        Self { cache: DashMap::new(), validate_on_register }
    }

    /// Fetch a recorded schema version, consulting the cache first.
    pub fn get(&self, kv: &dyn KvStore, version: u64) -> Result<Option<Arc<Schema>>> {
        if let Some(cached) = self.cache.get(&version) {
            return Ok(Some(cached.clone()));
        }
        let key = keys::catalog_key(version);
        match kv.get(&key)? {
            Some(bytes) => {
                let schema = Arc::new(Schema::from_canonical_bytes(&bytes)?);
                self.cache.insert(version, schema.clone());
                Ok(Some(schema))
            }
            None => Ok(None),
        }
    }

    /// All versions currently recorded, decoded.
    pub fn all_versions(&self, kv: &dyn KvStore) -> Result<Vec<Arc<Schema>>> {
        let (lo, hi) = keys::catalog_range();
        let mut out = Vec::new();
        for entry in kv.scan_range(&lo, &hi, false)? {
            let (_, value) = entry?;
            out.push(Arc::new(Schema::from_canonical_bytes(&value)?));
        }
        Ok(out)
    }

    /// Ensure `schema` is recorded in the catalog, validating it
    /// against every other recorded version first. A byte-identical
    /// re-registration of the same version is a no-op; registering a
    /// different definition under a version number already in use is
    /// rejected, since versions are monotonic and never reused.
    pub fn register(&self, kv: &mut dyn KvStore, schema: Schema) -> Result<Arc<Schema>> {
        let key = keys::catalog_key(schema.version);
        let canonical = schema.canonical_bytes()?;

        if let Some(existing) = kv.get(&key)? {
            return if existing == canonical {
                Ok(Arc::new(schema))
            } else {
                Err(Error::invalid_schema(format!(
                    "version {} is already registered with a different definition",
                    schema.version
                )))
            };
        }

        if self.validate_on_register {
            for other in self.all_versions(kv)? {
                if other.version == schema.version {
                    continue;
                }
                schema.check_compatible(&other)?;
            }
        }

        kv.put(&key, &canonical)?;
        let schema = Arc::new(schema);
        self.cache.insert(schema.version, schema.clone());
        Ok(schema)
    }

    /// Fetch `version`, registering `fallback` if it is not yet
    /// recorded.
    pub fn get_or_register(&self, kv: &mut dyn KvStore, version: u64, fallback: impl FnOnce() -> Schema) -> Result<Arc<Schema>> {
        if let Some(schema) = self.get(kv, version)? {
            return Ok(schema);
        }
        self.register(kv, fallback())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::mem::MemKv;
    use crate::schema::{FieldKind, ObjectType, SimpleField};
    use crate::value::FieldType;
    use std::collections::BTreeMap;

    fn schema(version: u64) -> Schema {
        let mut fields = BTreeMap::new();
        fields.insert(
            10,
            FieldKind::Simple(SimpleField {
                storage_id: 10,
                name: "f".into(),
                element_type: FieldType::Int32,
                indexed: false,
                reference: None,
            }),
        );
        let ty = ObjectType { storage_id: 1, name: "T".into(), fields, composite_indexes: BTreeMap::new() };
        let mut object_types = BTreeMap::new();
        object_types.insert(1, ty);
        Schema { version, object_types }
    }

    #[test]
    fn register_then_fetch() {
        let db = MemKv::new();
        let mut txn = db.begin();
        let catalog = SchemaCatalog::new();
        catalog.register(&mut txn, schema(1)).unwrap();
        let fetched = catalog.get(&txn, 1).unwrap().unwrap();
        assert_eq!(fetched.version, 1);
    }

    #[test]
    fn duplicate_identical_registration_is_noop() {
        let db = MemKv::new();
        let mut txn = db.begin();
        let catalog = SchemaCatalog::new();
        catalog.register(&mut txn, schema(1)).unwrap();
        assert!(catalog.register(&mut txn, schema(1)).is_ok());
    }

    #[test]
    fn incompatible_version_reuse_rejected() {
        let db = MemKv::new();
        let mut txn = db.begin();
        let catalog = SchemaCatalog::new();
        catalog.register(&mut txn, schema(1)).unwrap();
        let mut other = schema(1);
        other.object_types.get_mut(&1).unwrap().name = "Other".into();
        assert!(catalog.register(&mut txn, other).is_err());
    }

    #[test]
    fn incompatible_storage_id_across_versions_rejected() {
        let db = MemKv::new();
        let mut txn = db.begin();
        let catalog = SchemaCatalog::new();
        catalog.register(&mut txn, schema(1)).unwrap();
        let mut v2 = schema(2);
        if let FieldKind::Simple(f) = v2.object_types.get_mut(&1).unwrap().fields.get_mut(&10).unwrap() {
            f.element_type = FieldType::Str;
        }
        assert!(catalog.register(&mut txn, v2).is_err());
    }

    #[test]
    fn validation_disabled_allows_incompatible_storage_id() {
        let db = MemKv::new();
        let mut txn = db.begin();
        let catalog = SchemaCatalog::with_validation(false);
        catalog.register(&mut txn, schema(1)).unwrap();
        let mut v2 = schema(2);
        if let FieldKind::Simple(f) = v2.object_types.get_mut(&1).unwrap().fields.get_mut(&10).unwrap() {
            f.element_type = FieldType::Str;
        }
        assert!(catalog.register(&mut txn, v2).is_ok());
    }
}
