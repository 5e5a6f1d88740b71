//! Stable, distinguishable error kinds for the storage engine.
//!
//! One broad `Error` type with `#[from]` conversions, scoped to the
//! error taxonomy the object-persistence core actually raises.

use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Stable error kinds, distinguishable by callers.
#[derive(Error, Debug)]
pub enum Error {
    /// Two schemas disagree on a shared storage-id.
    #[error("schema mismatch for storage-id {storage_id}: {reason}")]
    SchemaMismatch {
        /// The storage-id both schemas attempted to claim.
        storage_id: u64,
        /// Human-readable reason for the mismatch.
        reason: String,
    },

    /// An `ObjId`'s storage-id has no `ObjectType` in the current schema.
    #[error("unknown type for storage-id {0}")]
    UnknownType(u64),

    /// A read/write targets a nonexistent object.
    #[error("object does not exist or was deleted")]
    DeletedObject,

    /// A field id is not present on the object's type.
    #[error("unknown field {field_id} on storage-id {storage_id}")]
    UnknownField {
        /// The object type's storage-id.
        storage_id: u64,
        /// The field storage-id that was not found.
        field_id: u64,
    },

    /// A value does not match the declared element type.
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        /// Name of the expected element type.
        expected: String,
        /// Name of the type actually supplied.
        found: String,
    },

    /// Deletion blocked by an EXCEPTION-dispositioned reverse reference.
    #[error("object is referenced and cannot be deleted")]
    ReferencedObject,

    /// The underlying KV store rejected the operation.
    #[error("stale transaction")]
    StaleTransaction,

    /// The catalog rejected a proposed schema.
    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    /// Write attempted against a read-only transaction.
    #[error("transaction is read-only")]
    ReadOnly,

    /// Configuration failed to load or validate.
    #[error("configuration error: {0}")]
    Config(String),

    /// Canonical schema (de)serialization failed.
    #[error("schema codec error: {0}")]
    SchemaCodec(#[from] Box<bincode::ErrorKind>),

    /// A codec cursor ran out of bytes, or bytes were structurally invalid.
    #[error("codec error: {0}")]
    Codec(String),

    /// The operation is unsupported on this transaction, e.g.
    /// `commit` or `rollback` on a
    /// [`crate::snapshot::SnapshotTransaction`], whose commit/rollback
    /// are unsupported and always fail.
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

impl Error {
    /// Build a [`Error::SchemaMismatch`].
    pub fn schema_mismatch(storage_id: u64, reason: impl Into<String>) -> Self {
        Self::SchemaMismatch { storage_id, reason: reason.into() }
    }

    /// Build a [`Error::UnknownField`].
    pub fn unknown_field(storage_id: u64, field_id: u64) -> Self {
        Self::UnknownField { storage_id, field_id }
    }

    /// Build a [`Error::TypeMismatch`].
    pub fn type_mismatch(expected: impl Into<String>, found: impl Into<String>) -> Self {
        Self::TypeMismatch { expected: expected.into(), found: found.into() }
    }

    /// Build a [`Error::InvalidSchema`].
    pub fn invalid_schema(msg: impl Into<String>) -> Self {
        Self::InvalidSchema(msg.into())
    }

    /// Build a [`Error::Config`].
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Build a [`Error::Codec`].
    pub fn codec(msg: impl Into<String>) -> Self {
        Self::Codec(msg.into())
    }

    /// True if this error came from the KV layer reporting a poisoned
    /// transaction: the core makes no further KV calls on that
    /// handle.
    pub fn is_stale(&self) -> bool {
        matches!(self, Error::StaleTransaction)
    }

    /// Build a [`Error::Unsupported`].
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }
}
