//! Change notification.
//!
//! Listeners are registered per transaction or per database, with an
//! optional object-path filter: a sequence of reference-field hops
//! that must resolve, starting from a given root object, to the
//! object whose field changed.

use crate::codec::Reader;
use crate::error::Result;
use crate::kv::KvStore;
use crate::migration::OldValues;
use crate::objid::ObjId;
use crate::registry::TypeRegistry;
use crate::value::{decode_value, FieldType, Value};

/// Callbacks fired as a transaction mutates objects.
pub trait Listener: Send + Sync {
    /// An object was created.
    fn on_create(&self, _id: ObjId) {}

    /// An object was deleted.
    fn on_delete(&self, _id: ObjId) {}

    /// A field's value changed.
    fn on_change(&self, _id: ObjId, _field_id: u64, _old: &Value, _new: &Value) {}

    /// An object was lazily migrated to a new schema version.
    fn on_schema_change(&self, _id: ObjId, _old_version: u64, _new_version: u64, _old_values: &OldValues) {}
}

/// A sequence of reference-field hops anchoring a listener
/// registration to objects reachable from `root`: an object path
/// filter that the change must propagate through.
#[derive(Clone)]
pub struct PathFilter {
    /// The object the path starts from.
    pub root: ObjId,
    /// Reference-field storage-ids to follow, in order.
    pub hops: Vec<u64>,
}

impl PathFilter {
    /// Resolve the path starting at `root`, returning the final
    /// object reached (or `None` if any hop is unset or dangling).
    pub fn resolve(&self, kv: &dyn KvStore, registry: &TypeRegistry) -> Result<Option<ObjId>> {
        let mut current = self.root;
        for &field_id in &self.hops {
            let key = crate::keys::content_key(current, field_id, &[]);
            let Some(raw) = kv.get(&key)? else { return Ok(None) };
            let mut r = Reader::new(&raw);
            match decode_value(&FieldType::Reference, &mut r, registry)? {
                Value::Reference(next) => current = next,
                _ => return Ok(None),
            }
        }
        Ok(Some(current))
    }
}

struct Registration {
    listener: std::sync::Arc<dyn Listener>,
    filter: Option<PathFilter>,
}

/// A collection of registered listeners, dispatched together (spec
/// §5: registered "per transaction or per database").
#[derive(Default)]
pub struct ListenerSet {
    registrations: Vec<Registration>,
}

impl ListenerSet {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener that fires unconditionally.
    pub fn register(&mut self, listener: std::sync::Arc<dyn Listener>) {
        self.registrations.push(Registration { listener, filter: None });
    }

    /// Register a listener that only fires for changes to the object
    /// reached by `filter`.
    pub fn register_filtered(&mut self, listener: std::sync::Arc<dyn Listener>, filter: PathFilter) {
        self.registrations.push(Registration { listener, filter: Some(filter) });
    }

    fn applies_to(&self, reg: &Registration, id: ObjId, kv: &dyn KvStore, registry: &TypeRegistry) -> Result<bool> {
        match &reg.filter {
            None => Ok(true),
            Some(f) => Ok(f.resolve(kv, registry)? == Some(id)),
        }
    }

    /// Dispatch `onCreate` to every applicable listener.
    pub fn dispatch_create(&self, id: ObjId, kv: &dyn KvStore, registry: &TypeRegistry) -> Result<()> {
        for reg in &self.registrations {
            if self.applies_to(reg, id, kv, registry)? {
                reg.listener.on_create(id);
            }
        }
        Ok(())
    }

    /// Dispatch `onDelete` to every applicable listener.
    pub fn dispatch_delete(&self, id: ObjId, kv: &dyn KvStore, registry: &TypeRegistry) -> Result<()> {
        for reg in &self.registrations {
            if self.applies_to(reg, id, kv, registry)? {
                reg.listener.on_delete(id);
            }
        }
        Ok(())
    }

    /// Dispatch `onChange` to every applicable listener.
    pub fn dispatch_change(&self, id: ObjId, field_id: u64, old: &Value, new: &Value, kv: &dyn KvStore, registry: &TypeRegistry) -> Result<()> {
        for reg in &self.registrations {
            if self.applies_to(reg, id, kv, registry)? {
                reg.listener.on_change(id, field_id, old, new);
            }
        }
        Ok(())
    }

    /// Dispatch `onSchemaChange` to every applicable listener.
    pub fn dispatch_schema_change(
        &self,
        id: ObjId,
        old_version: u64,
        new_version: u64,
        old_values: &OldValues,
        kv: &dyn KvStore,
        registry: &TypeRegistry,
    ) -> Result<()> {
        for reg in &self.registrations {
            if self.applies_to(reg, id, kv, registry)? {
                reg.listener.on_schema_change(id, old_version, new_version, old_values);
            }
        }
        Ok(())
    }

    /// True when nothing is registered — lets callers skip building
    /// change payloads entirely. A snapshot transaction's listener set
    /// is always empty by construction.
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::mem::MemKv;
    use crate::kv::KvDatabase;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counter(AtomicUsize);

    impl Listener for Counter {
        fn on_create(&self, _id: ObjId) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn unconditional_listener_always_fires() {
        let db = MemKv::new();
        let txn = db.begin();
        let registry = TypeRegistry::new();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let mut set = ListenerSet::new();
        set.register(counter.clone());
        let id = ObjId::new(1, 1).unwrap();
        set.dispatch_create(id, &txn, &registry).unwrap();
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn empty_set_reports_empty() {
        let set = ListenerSet::new();
        assert!(set.is_empty());
    }
}
