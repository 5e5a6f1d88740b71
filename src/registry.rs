//! Process-wide type registry.
//!
//! Holds codecs for user-defined element types. Built-in kinds
//! (`bool`, `int32`, `int64`, `float64`, `str`, `bytes`, `enum`,
//! `reference`) never go through here — [`crate::value::encode_value`]
//! handles them directly. The registry exists purely for the
//! `UserDefined` case, and is a process-wide singleton initialized once
//! at startup: after that it is immutable.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::codec::{decode_bytes, encode_bytes, Reader};
use crate::error::Result;

/// A codec for one user-defined element type.
///
/// `encode`/`decode` frame an already-serialized opaque payload (the
/// caller is responsible for turning their own Rust type into bytes,
/// e.g. with `bincode`) into the memcomparable, self-delimiting form
/// used inside keys. [`OpaqueBytesCodec`] below provides a ready-made
/// framing; most user-defined types can use it unmodified and only
/// need to supply [`UserCodec::default_value`].
pub trait UserCodec: Send + Sync {
    /// Frame an opaque, already-serialized payload for embedding in a
    /// key.
    fn encode(&self, payload: &[u8], out: &mut Vec<u8>) -> Result<()>;

    /// Decode a payload written by [`UserCodec::encode`].
    fn decode(&self, r: &mut Reader<'_>) -> Result<Vec<u8>>;

    /// The default opaque payload for a freshly-initialized field of
    /// this type.
    fn default_value(&self) -> Vec<u8>;
}

/// The standard framing: identical to [`crate::codec::encode_bytes`].
/// Covers the common case of a user type that serializes to bytes via
/// some external mechanism and has no meaningful default beyond empty.
pub struct OpaqueBytesCodec;

impl UserCodec for OpaqueBytesCodec {
    fn encode(&self, payload: &[u8], out: &mut Vec<u8>) -> Result<()> {
        encode_bytes(payload, out);
        Ok(())
    }

    fn decode(&self, r: &mut Reader<'_>) -> Result<Vec<u8>> {
        decode_bytes(r)
    }

    fn default_value(&self) -> Vec<u8> {
        Vec::new()
    }
}

/// Catalog of user-defined element type codecs.
///
/// Lookups are deterministic: once a name is registered it always
/// resolves to the same codec instance for the life of the process.
#[derive(Default)]
pub struct TypeRegistry {
    codecs: RwLock<HashMap<String, std::sync::Arc<dyn UserCodec>>>,
}

impl TypeRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self { codecs: RwLock::new(HashMap::new()) }
    }

    /// Register a codec under `type_name`. Re-registering the same
    /// name replaces the codec; a later schema revision can introduce
    /// a new name without disturbing older data, so callers should
    /// pick a fresh name rather than mutate an in-use one.
    pub fn register(&self, type_name: impl Into<String>, codec: std::sync::Arc<dyn UserCodec>) {
        self.codecs.write().insert(type_name.into(), codec);
    }

    /// Look up a previously registered codec.
    pub fn lookup(&self, type_name: &str) -> Option<std::sync::Arc<dyn UserCodec>> {
        self.codecs.read().get(type_name).cloned()
    }
}

/// The process-wide registry singleton, initialized once at startup.
pub static GLOBAL_REGISTRY: once_cell::sync::Lazy<TypeRegistry> = once_cell::sync::Lazy::new(TypeRegistry::new);
