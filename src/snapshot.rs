//! In-memory snapshot transaction: a fully-functional transaction over
//! its own private [`MemKv`], used to detach object state from
//! whatever transaction produced it. Its `commit`/`rollback`
//! are permanently unsupported — the entire point of a snapshot is a
//! copy that is never written back.

use std::sync::{Arc, Weak};

use dashmap::DashMap;

use crate::codec::key_after_prefix;
use crate::error::{Error, Result};
use crate::keys::{NS_CONTENT, NS_INDEX, NS_META};
use crate::kv::mem::{MemKv, MemKvHandle};
use crate::kv::KvDatabase;
use crate::object::Transaction;
use crate::objid::ObjId;
use crate::registry::TypeRegistry;
use crate::schema::catalog::SchemaCatalog;
use crate::schema::Schema;

/// A cheap per-object identity handle inside a snapshot, cached weakly
/// so unreferenced handles don't accumulate: the table maps an ObjId
/// to a handle object created on demand and cached with weak
/// semantics so unreferenced handles may be collected.
pub struct ObjHandle {
    /// The object this handle identifies.
    pub id: ObjId,
}

/// An in-memory transaction that mirrors [`Transaction`]'s field-access
/// semantics but can never commit or roll back.
pub struct SnapshotTransaction {
    inner: Transaction<MemKvHandle>,
    handles: DashMap<ObjId, Weak<ObjHandle>>,
}

impl SnapshotTransaction {
    /// Open a snapshot targeting `schema`, backed by a fresh, private
    /// `MemKv`. A snapshot's listener set is always empty by
    /// construction — see DESIGN.md for why this engine resolves the
    /// source's unspecified snapshot/main dispatch ordering by never
    /// dispatching from a snapshot at all.
    pub fn new(schema: Schema, registry: Arc<TypeRegistry>) -> Result<Self> {
        let db = MemKv::new();
        let catalog = Arc::new(SchemaCatalog::new());
        let inner = Transaction::new(db.begin(), schema, catalog, registry)?;
        Ok(Self { inner, handles: DashMap::new() })
    }

    /// Field access identical to the main engine's, scoped to this
    /// snapshot's private store.
    pub fn transaction(&mut self) -> &mut Transaction<MemKvHandle> {
        &mut self.inner
    }

    /// Read-only access to the underlying transaction.
    pub fn transaction_ref(&self) -> &Transaction<MemKvHandle> {
        &self.inner
    }

    /// The interned handle for `id`, creating and weakly caching one on
    /// first access; later calls for the same `id` return the same
    /// handle as long as some caller still holds it.
    pub fn handle(&self, id: ObjId) -> Arc<ObjHandle> {
        if let Some(weak) = self.handles.get(&id) {
            if let Some(strong) = weak.upgrade() {
                return strong;
            }
        }
        let handle = Arc::new(ObjHandle { id });
        self.handles.insert(id, Arc::downgrade(&handle));
        handle
    }

    /// Always fails: under snapshot isolation, `commit` and `rollback`
    /// of a snapshot transaction always fail.
    pub fn commit(self) -> Result<()> {
        Err(Error::unsupported("a snapshot transaction can never commit"))
    }

    /// Always fails.
    pub fn rollback(self) -> Result<()> {
        Err(Error::unsupported("a snapshot transaction can never roll back"))
    }

    /// Clear every content, index, and per-object version entry while
    /// leaving the recorded schema catalog untouched: `reset()` clears
    /// content and index keys but preserves the catalog. Per-object
    /// version metadata is cleared alongside content since, with the
    /// content gone, the objects it described
    /// no longer exist.
    pub fn reset(&mut self) -> Result<()> {
        let kv = self.inner.kv_mut();
        for (lo_byte, hi_byte) in [(NS_CONTENT, NS_INDEX), (NS_META, NS_META)] {
            let lo = vec![lo_byte];
            let hi = key_after_prefix(&[hi_byte]);
            let keys: Vec<Vec<u8>> =
                kv.scan_range(&lo, &hi, false)?.map(|e| e.map(|(k, _)| k)).collect::<Result<Vec<_>>>()?;
            for key in keys {
                kv.delete(&key)?;
            }
        }
        self.handles.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldKind, ObjectType, SimpleField};
    use crate::value::{FieldType, Value};
    use std::collections::BTreeMap;

    fn schema() -> Schema {
        let mut fields = BTreeMap::new();
        fields.insert(
            10,
            FieldKind::Simple(SimpleField { storage_id: 10, name: "f".into(), element_type: FieldType::Int32, indexed: false, reference: None }),
        );
        let ty = ObjectType { storage_id: 1, name: "T".into(), fields, composite_indexes: BTreeMap::new() };
        Schema { version: 1, object_types: BTreeMap::from([(1, ty)]) }
    }

    #[test]
    fn commit_and_rollback_always_fail() {
        let snap = SnapshotTransaction::new(schema(), Arc::new(TypeRegistry::new())).unwrap();
        assert!(snap.commit().is_err());
        let snap = SnapshotTransaction::new(schema(), Arc::new(TypeRegistry::new())).unwrap();
        assert!(snap.rollback().is_err());
    }

    #[test]
    fn reset_clears_objects_but_keeps_catalog_usable() {
        let mut snap = SnapshotTransaction::new(schema(), Arc::new(TypeRegistry::new())).unwrap();
        let id = snap.transaction().create(1).unwrap();
        snap.transaction().write_simple(id, 10, Value::Int32(42)).unwrap();
        snap.reset().unwrap();
        assert!(!snap.transaction().exists(id).unwrap());
        let id2 = snap.transaction().create(1).unwrap();
        assert_eq!(snap.transaction().read_simple(id2, 10).unwrap(), Value::Int32(0));
    }

    #[test]
    fn handle_is_stable_while_held() {
        let snap = SnapshotTransaction::new(schema(), Arc::new(TypeRegistry::new())).unwrap();
        let id = ObjId::new(1, 1).unwrap();
        let a = snap.handle(id);
        let b = snap.handle(id);
        assert!(Arc::ptr_eq(&a, &b));
    }
}
