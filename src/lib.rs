//! Typed, versioned object persistence atop an ordered key/value store:
//! a schema catalog with lazy per-object migration, encoded simple and
//! collection fields, referential integrity with configurable cascade
//! dispositions, and simple/composite secondary indexes.
#![warn(missing_docs)]

pub mod codec;
pub mod collection;
pub mod config;
pub mod error;
pub mod index;
pub mod keys;
pub mod kv;
pub mod listener;
pub mod migration;
pub mod object;
pub mod objid;
pub mod registry;
pub mod schema;
pub mod snapshot;
pub mod value;

use std::sync::Arc;

pub use config::Config;
pub use error::{Error, Result};
pub use object::Transaction;
pub use objid::ObjId;
pub use schema::Schema;
pub use snapshot::SnapshotTransaction;
pub use value::Value;

use kv::KvDatabase;
use registry::TypeRegistry;
use schema::catalog::SchemaCatalog;

/// Crate version, for diagnostics.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Crate name, for diagnostics.
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Install a `tracing_subscriber` layer driven by `RUST_LOG` (falling
/// back to `config.logging.level` when unset), then log a startup
/// event.
pub fn init(config: &Config) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.logging.level.clone()));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    tracing::info!(version = VERSION, "{} initialized", NAME);
    Ok(())
}

/// Ties a [`KvDatabase`] implementation to a [`Config`] and is the
/// single entry point for opening transactions and snapshots against
/// it.
pub struct Database<D: KvDatabase> {
    db: D,
    config: Config,
    registry: Arc<TypeRegistry>,
    catalog: Arc<SchemaCatalog>,
}

impl<D: KvDatabase> Database<D> {
    /// Open a database over `db`, validating `config` first.
    pub fn open(db: D, config: Config) -> Result<Self> {
        config.validate()?;
        let catalog = Arc::new(SchemaCatalog::with_validation(config.schema.validate_on_register));
        Ok(Self { db, config, registry: Arc::new(TypeRegistry::new()), catalog })
    }

    /// The validated configuration this database was opened with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The process-wide type registry backing this database's values.
    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    /// Open a transaction targeting `schema`, registering it with the
    /// catalog first if this version hasn't been seen before.
    pub fn transaction(&self, schema: Schema) -> Result<Transaction<D::Handle>> {
        tracing::debug!(version = schema.version, "opening transaction");
        Transaction::new(self.db.begin(), schema, self.catalog.clone(), self.registry.clone())
    }

    /// Open a detached, never-committing snapshot transaction
    /// targeting `schema`.
    pub fn snapshot(&self, schema: Schema) -> Result<SnapshotTransaction> {
        SnapshotTransaction::new(schema, self.registry.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::mem::MemKv;
    use crate::schema::ObjectType;
    use std::collections::BTreeMap;

    fn schema() -> Schema {
        let ty = ObjectType { storage_id: 1, name: "T".into(), fields: BTreeMap::new(), composite_indexes: BTreeMap::new() };
        Schema { version: 1, object_types: BTreeMap::from([(1, ty)]) }
    }

    #[test]
    fn open_then_create_object() {
        let db = Database::open(MemKv::new(), Config::default()).unwrap();
        let mut txn = db.transaction(schema()).unwrap();
        let id = txn.create(1).unwrap();
        assert!(txn.exists(id).unwrap());
    }

    #[test]
    fn snapshot_never_commits() {
        let db = Database::open(MemKv::new(), Config::default()).unwrap();
        let snap = db.snapshot(schema()).unwrap();
        assert!(snap.commit().is_err());
    }
}
