//! Runtime value representation and the declared element types that
//! constrain it.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::codec::{
    decode_bool, decode_bytes, decode_enum_ordinal, decode_f64, decode_i32, decode_i64,
    decode_string, encode_bool, encode_bytes, encode_enum_ordinal, encode_f64, encode_i32,
    encode_i64, encode_str, Reader,
};
use crate::error::{Error, Result};
use crate::objid::ObjId;
use crate::registry::TypeRegistry;

/// A field's declared element type. Built-in kinds are interpreted
/// directly by [`encode_value`]/[`decode_value`]; `UserDefined` kinds
/// defer to whatever codec was registered under that name in the
/// [`TypeRegistry`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    /// `true`/`false`.
    Bool,
    /// Signed 32-bit integer.
    Int32,
    /// Signed 64-bit integer.
    Int64,
    /// IEEE-754 double.
    Float64,
    /// UTF-8 string.
    Str,
    /// Opaque byte blob.
    Bytes,
    /// Ordinal-encoded enumeration; `variants` names the ordinals in
    /// declaration order so schema compatibility checks can compare
    /// enums structurally.
    Enum {
        /// Variant names in ordinal order.
        variants: Vec<String>,
    },
    /// A reference to another object, constrained by the owning
    /// field's `ReferenceSpec` rather than by the type itself.
    Reference,
    /// A type registered with the process-wide [`TypeRegistry`].
    UserDefined {
        /// The name under which the codec was registered.
        type_name: String,
    },
}

impl FieldType {
    /// Human-readable name, used in `TypeMismatch` errors.
    pub fn type_name(&self) -> String {
        match self {
            FieldType::Bool => "bool".to_string(),
            FieldType::Int32 => "int32".to_string(),
            FieldType::Int64 => "int64".to_string(),
            FieldType::Float64 => "float64".to_string(),
            FieldType::Str => "str".to_string(),
            FieldType::Bytes => "bytes".to_string(),
            FieldType::Enum { .. } => "enum".to_string(),
            FieldType::Reference => "reference".to_string(),
            FieldType::UserDefined { type_name } => type_name.clone(),
        }
    }

    /// The type-intrinsic default value, used to initialize a freshly
    /// created field.
    pub fn default_value(&self, registry: &TypeRegistry) -> Value {
        match self {
            FieldType::Bool => Value::Bool(false),
            FieldType::Int32 => Value::Int32(0),
            FieldType::Int64 => Value::Int64(0),
            FieldType::Float64 => Value::Float64(0.0),
            FieldType::Str => Value::Str(Arc::from("")),
            FieldType::Bytes => Value::Bytes(Bytes::new()),
            FieldType::Enum { .. } => Value::Enum(0),
            FieldType::Reference => Value::Null,
            FieldType::UserDefined { type_name } => registry
                .lookup(type_name)
                .map(|codec| Value::Opaque {
                    type_name: Arc::from(type_name.as_str()),
                    bytes: Bytes::from(codec.default_value()),
                })
                .unwrap_or(Value::Null),
        }
    }

    /// Two types are compatible for schema-catalog purposes (spec
    /// §4.3: "must have the same element type") when they are
    /// identical, the same named user-defined type, or an enum whose
    /// shorter variant list is a prefix of the longer one (appending
    /// variants is allowed; reordering is not, since ordinals are
    /// persisted). This is intentionally stricter than
    /// [`FieldType::is_migration_promotion_of`]: the catalog records
    /// what a storage-id *is*, while migration governs what a stored
    /// value may be *reinterpreted as* when an object crosses schema
    /// versions.
    pub fn is_compatible_with(&self, other: &FieldType) -> bool {
        if self == other {
            return true;
        }
        match (self, other) {
            (FieldType::Enum { variants: a }, FieldType::Enum { variants: b }) => {
                let (shorter, longer) = if a.len() <= b.len() { (a, b) } else { (b, a) };
                shorter.iter().zip(longer.iter()).all(|(x, y)| x == y)
            }
            (FieldType::UserDefined { type_name: a }, FieldType::UserDefined { type_name: b }) => a == b,
            _ => false,
        }
    }

    /// True when a value stored under `self` in an older schema
    /// version can be re-encoded as `other` during lazy migration: a
    /// field whose declared type changed to a recognized wider
    /// numeric type is re-encoded in place. This is a one-directional
    /// widening relation, unlike [`FieldType::is_compatible_with`].
    pub fn is_migration_promotion_of(&self, other: &FieldType) -> bool {
        use FieldType::*;
        matches!(
            (other, self),
            (Int32, Int64) | (Int32, Float64) | (Int64, Float64)
        )
    }
}

/// A runtime field value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// Absence of a value: an unset reference, or a narrowed-out
    /// reference under a NOTHING disposition, where reads return a
    /// null-like sentinel.
    Null,
    /// `true`/`false`.
    Bool(bool),
    /// Signed 32-bit integer.
    Int32(i32),
    /// Signed 64-bit integer.
    Int64(i64),
    /// IEEE-754 double.
    Float64(f64),
    /// UTF-8 string, interned for cheap cloning.
    Str(Arc<str>),
    /// Opaque byte blob.
    Bytes(Bytes),
    /// An enum ordinal.
    Enum(u64),
    /// A reference to another object.
    Reference(ObjId),
    /// A value produced by a registered user-defined codec.
    Opaque {
        /// The codec's registration name.
        type_name: Arc<str>,
        /// The codec's canonical encoded form.
        bytes: Bytes,
    },
}

impl Value {
    /// True for [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int32(v) => write!(f, "{v}"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::Float64(v) => write!(f, "{v}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Bytes(b) => write!(f, "bytes[{}]", b.len()),
            Value::Enum(ord) => write!(f, "enum#{ord}"),
            Value::Reference(id) => write!(f, "ref({id})"),
            Value::Opaque { type_name, .. } => write!(f, "{type_name}(..)"),
        }
    }
}

/// Encode `value` under its declared type `ty`, with a leading
/// presence tag so that `Value::Null` sorts before every non-null
/// value of the same type.
pub fn encode_value(ty: &FieldType, value: &Value, registry: &TypeRegistry, out: &mut Vec<u8>) -> Result<()> {
    if value.is_null() {
        out.push(0x00);
        return Ok(());
    }
    out.push(0x01);
    match (ty, value) {
        (FieldType::Bool, Value::Bool(v)) => encode_bool(*v, out),
        (FieldType::Int32, Value::Int32(v)) => encode_i32(*v, out),
        (FieldType::Int64, Value::Int64(v)) => encode_i64(*v, out),
        (FieldType::Float64, Value::Float64(v)) => encode_f64(*v, out),
        (FieldType::Str, Value::Str(v)) => encode_str(v, out),
        (FieldType::Bytes, Value::Bytes(v)) => encode_bytes(v, out),
        (FieldType::Enum { .. }, Value::Enum(ord)) => encode_enum_ordinal(*ord, out),
        (FieldType::Reference, Value::Reference(id)) => out.extend_from_slice(id.as_bytes()),
        (FieldType::UserDefined { type_name }, Value::Opaque { type_name: vt, bytes }) => {
            if type_name.as_str() != vt.as_ref() {
                return Err(Error::type_mismatch(type_name.clone(), vt.to_string()));
            }
            let codec = registry
                .lookup(type_name)
                .ok_or_else(|| Error::invalid_schema(format!("unregistered type {type_name}")))?;
            codec.encode(bytes.as_ref(), out)?;
        }
        _ => return Err(Error::type_mismatch(ty.type_name(), value.to_string())),
    }
    Ok(())
}

/// Decode a value written by [`encode_value`].
pub fn decode_value(ty: &FieldType, r: &mut Reader<'_>, registry: &TypeRegistry) -> Result<Value> {
    let tag = r.read_u8()?;
    if tag == 0x00 {
        return Ok(Value::Null);
    }
    let value = match ty {
        FieldType::Bool => Value::Bool(decode_bool(r)?),
        FieldType::Int32 => Value::Int32(decode_i32(r)?),
        FieldType::Int64 => Value::Int64(decode_i64(r)?),
        FieldType::Float64 => Value::Float64(decode_f64(r)?),
        FieldType::Str => Value::Str(Arc::from(decode_string(r)?)),
        FieldType::Bytes => Value::Bytes(Bytes::from(decode_bytes(r)?)),
        FieldType::Enum { .. } => Value::Enum(decode_enum_ordinal(r)?),
        FieldType::Reference => {
            let bytes = r.read_bytes(8)?;
            Value::Reference(ObjId::from_slice(bytes)?)
        }
        FieldType::UserDefined { type_name } => {
            let codec = registry
                .lookup(type_name)
                .ok_or_else(|| Error::invalid_schema(format!("unregistered type {type_name}")))?;
            let decoded = codec.decode(r)?;
            Value::Opaque { type_name: Arc::from(type_name.as_str()), bytes: Bytes::from(decoded) }
        }
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TypeRegistry;

    #[test]
    fn null_sorts_before_present() {
        let registry = TypeRegistry::new();
        let mut null_bytes = Vec::new();
        encode_value(&FieldType::Int32, &Value::Null, &registry, &mut null_bytes).unwrap();
        let mut present_bytes = Vec::new();
        encode_value(&FieldType::Int32, &Value::Int32(i32::MIN), &registry, &mut present_bytes).unwrap();
        assert!(null_bytes < present_bytes);
    }

    #[test]
    fn round_trips_int32() {
        let registry = TypeRegistry::new();
        let mut buf = Vec::new();
        encode_value(&FieldType::Int32, &Value::Int32(-42), &registry, &mut buf).unwrap();
        let mut r = Reader::new(&buf);
        let v = decode_value(&FieldType::Int32, &mut r, &registry).unwrap();
        assert_eq!(v, Value::Int32(-42));
        assert!(r.is_empty());
    }

    #[test]
    fn round_trips_reference() {
        let registry = TypeRegistry::new();
        let id = ObjId::new(5, 9).unwrap();
        let mut buf = Vec::new();
        encode_value(&FieldType::Reference, &Value::Reference(id), &registry, &mut buf).unwrap();
        let mut r = Reader::new(&buf);
        let v = decode_value(&FieldType::Reference, &mut r, &registry).unwrap();
        assert_eq!(v, Value::Reference(id));
    }
}
