//! Schema model — an immutable description of one schema version.

pub mod catalog;

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::value::FieldType;

/// What happens to a reference-holding field or collection element
/// when the referent is deleted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OnDelete {
    /// Holder unchanged; the reference becomes dangling.
    Nothing,
    /// Deletion of the referent fails with `ReferencedObject`.
    Exception,
    /// The field or collection element is cleared/removed.
    Unreference,
    /// The holder is enqueued for cascading delete.
    Delete,
}

/// Constraints on a reference-typed field or sub-field.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReferenceSpec {
    /// Allowed referent object-type storage-ids; `None` means any
    /// type is allowed.
    pub allowed_types: Option<Vec<u64>>,
    /// Disposition applied to this holder when the referent is
    /// deleted.
    pub on_delete: OnDelete,
}

/// A scalar field directly on an object.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SimpleField {
    /// Process-wide storage-id.
    pub storage_id: u64,
    /// Field name.
    pub name: String,
    /// Declared element type.
    pub element_type: FieldType,
    /// Whether a simple index is maintained for this field.
    pub indexed: bool,
    /// Present when `element_type` is [`FieldType::Reference`].
    pub reference: Option<ReferenceSpec>,
}

/// Which role a [`SubField`] plays within its owning [`ComplexField`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubFieldRole {
    /// The sole sub-field of a list or set.
    Element,
    /// A map's key sub-field.
    Key,
    /// A map's value sub-field.
    Value,
}

/// One of the one or two simple sub-fields owned by a [`ComplexField`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubField {
    /// Process-wide storage-id, distinct from the owning field's.
    pub storage_id: u64,
    /// Role within the collection.
    pub role: SubFieldRole,
    /// Declared element type.
    pub element_type: FieldType,
    /// Whether a sub-field index is maintained.
    pub indexed: bool,
    /// Present when `element_type` is [`FieldType::Reference`].
    pub reference: Option<ReferenceSpec>,
}

/// The collection shape of a [`ComplexField`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollectionKind {
    /// Ordered, index-addressed sequence.
    List,
    /// Unordered collection of distinct elements.
    Set,
    /// Key-to-value mapping.
    Map,
}

/// A field whose value is a collection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ComplexField {
    /// Process-wide storage-id.
    pub storage_id: u64,
    /// Field name.
    pub name: String,
    /// List, set, or map.
    pub kind: CollectionKind,
    /// One sub-field for list/set (`Element`); two for map
    /// (`Key`, `Value`).
    pub sub_fields: Vec<SubField>,
}

impl ComplexField {
    /// The element/value sub-field (always present).
    pub fn element_sub_field(&self) -> &SubField {
        self.sub_fields
            .iter()
            .find(|sf| matches!(sf.role, SubFieldRole::Element | SubFieldRole::Value))
            .expect("complex field must have an element or value sub-field")
    }

    /// The key sub-field, present only for maps.
    pub fn key_sub_field(&self) -> Option<&SubField> {
        self.sub_fields.iter().find(|sf| matches!(sf.role, SubFieldRole::Key))
    }
}

/// A monotonically-incrementing scalar field.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CounterField {
    /// Process-wide storage-id.
    pub storage_id: u64,
    /// Field name.
    pub name: String,
}

/// Any of the three field shapes an [`ObjectType`] can declare.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum FieldKind {
    /// A scalar field.
    Simple(SimpleField),
    /// A collection field.
    Complex(ComplexField),
    /// A counter field.
    Counter(CounterField),
}

impl FieldKind {
    /// The field's storage-id, regardless of kind.
    pub fn storage_id(&self) -> u64 {
        match self {
            FieldKind::Simple(f) => f.storage_id,
            FieldKind::Complex(f) => f.storage_id,
            FieldKind::Counter(f) => f.storage_id,
        }
    }

    /// The field's name, regardless of kind.
    pub fn name(&self) -> &str {
        match self {
            FieldKind::Simple(f) => &f.name,
            FieldKind::Complex(f) => &f.name,
            FieldKind::Counter(f) => &f.name,
        }
    }

    /// View as a [`SimpleField`], if that's what this is.
    pub fn as_simple(&self) -> Option<&SimpleField> {
        match self {
            FieldKind::Simple(f) => Some(f),
            _ => None,
        }
    }

    /// View as a [`ComplexField`], if that's what this is.
    pub fn as_complex(&self) -> Option<&ComplexField> {
        match self {
            FieldKind::Complex(f) => Some(f),
            _ => None,
        }
    }

    /// View as a [`CounterField`], if that's what this is.
    pub fn as_counter(&self) -> Option<&CounterField> {
        match self {
            FieldKind::Counter(f) => Some(f),
            _ => None,
        }
    }
}

/// An index over an ordered tuple of simple fields on the same object
/// type.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompositeIndex {
    /// Process-wide storage-id.
    pub storage_id: u64,
    /// Index name.
    pub name: String,
    /// Ordered participating simple-field storage-ids.
    pub field_ids: Vec<u64>,
}

/// A type of persisted object: its storage-id, fields, and composite
/// indexes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ObjectType {
    /// Process-wide storage-id.
    pub storage_id: u64,
    /// Type name.
    pub name: String,
    /// Declared fields, keyed by storage-id.
    pub fields: BTreeMap<u64, FieldKind>,
    /// Declared composite indexes, keyed by storage-id.
    pub composite_indexes: BTreeMap<u64, CompositeIndex>,
}

impl ObjectType {
    /// Look up a field by storage-id.
    pub fn field(&self, field_id: u64) -> Result<&FieldKind> {
        self.fields
            .get(&field_id)
            .ok_or_else(|| Error::unknown_field(self.storage_id, field_id))
    }

    /// Resolve a field name to its declaration.
    pub fn field_by_name(&self, name: &str) -> Option<&FieldKind> {
        self.fields.values().find(|f| f.name() == name)
    }
}

/// An immutable, versioned set of object types.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Schema {
    /// Monotonic version number, >= 1.
    pub version: u64,
    /// Declared object types, keyed by storage-id.
    pub object_types: BTreeMap<u64, ObjectType>,
}

impl Schema {
    /// Look up an object type by storage-id.
    pub fn object_type(&self, storage_id: u64) -> Result<&ObjectType> {
        self.object_types
            .get(&storage_id)
            .ok_or(Error::UnknownType(storage_id))
    }

    /// Look up an object type by name.
    pub fn object_type_by_name(&self, name: &str) -> Option<&ObjectType> {
        self.object_types.values().find(|t| t.name == name)
    }

    /// Canonical, stable byte serialization, such that equality
    /// between two schemas reduces to a byte comparison.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(Error::from)
    }

    /// Parse a schema from its canonical byte form.
    pub fn from_canonical_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(Error::from)
    }

    /// Build the process-wide map from storage-id to structural
    /// definition, used to check compatibility against another
    /// schema.
    fn storage_catalog(&self) -> Result<HashMap<u64, StorageDef>> {
        let mut map = HashMap::new();
        for ty in self.object_types.values() {
            map.insert(ty.storage_id, StorageDef::ObjectType);
            for field in ty.fields.values() {
                match field {
                    FieldKind::Simple(f) => {
                        map.insert(f.storage_id, StorageDef::SimpleField { element_type: f.element_type.clone() });
                    }
                    FieldKind::Complex(f) => {
                        map.insert(
                            f.storage_id,
                            StorageDef::ComplexField {
                                kind: f.kind,
                                sub_field_types: f.sub_fields.iter().map(|sf| sf.element_type.clone()).collect(),
                            },
                        );
                        for sf in &f.sub_fields {
                            map.insert(sf.storage_id, StorageDef::SubField { element_type: sf.element_type.clone() });
                        }
                    }
                    FieldKind::Counter(f) => {
                        map.insert(f.storage_id, StorageDef::Counter);
                    }
                }
            }
            for ci in ty.composite_indexes.values() {
                let mut element_types = Vec::with_capacity(ci.field_ids.len());
                for fid in &ci.field_ids {
                    let simple = ty
                        .field(*fid)?
                        .as_simple()
                        .ok_or_else(|| Error::invalid_schema(format!("composite index {} references non-simple field {}", ci.storage_id, fid)))?;
                    element_types.push(simple.element_type.clone());
                }
                map.insert(ci.storage_id, StorageDef::CompositeIndex { arity: ci.field_ids.len(), element_types });
            }
        }
        Ok(map)
    }

    /// Validate that `self` can coexist with `other` in the same
    /// catalog. Storage-ids unique to either schema are unconstrained;
    /// storage-ids shared by both
    /// must agree on kind and on the rules spelled out per kind.
    pub fn check_compatible(&self, other: &Schema) -> Result<()> {
        let ours = self.storage_catalog()?;
        let theirs = other.storage_catalog()?;
        for (id, def) in &ours {
            let Some(other_def) = theirs.get(id) else { continue };
            def.check_compatible(*id, other_def)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum StorageDef {
    ObjectType,
    SimpleField { element_type: FieldType },
    ComplexField { kind: CollectionKind, sub_field_types: Vec<FieldType> },
    SubField { element_type: FieldType },
    CompositeIndex { arity: usize, element_types: Vec<FieldType> },
    Counter,
}

impl StorageDef {
    fn kind_name(&self) -> &'static str {
        match self {
            StorageDef::ObjectType => "object type",
            StorageDef::SimpleField { .. } => "simple field",
            StorageDef::ComplexField { .. } => "complex field",
            StorageDef::SubField { .. } => "sub-field",
            StorageDef::CompositeIndex { .. } => "composite index",
            StorageDef::Counter => "counter field",
        }
    }

    fn check_compatible(&self, storage_id: u64, other: &StorageDef) -> Result<()> {
        match (self, other) {
            (StorageDef::ObjectType, StorageDef::ObjectType) => Ok(()),
            (StorageDef::Counter, StorageDef::Counter) => Ok(()),
            (StorageDef::SimpleField { element_type: a }, StorageDef::SimpleField { element_type: b })
            | (StorageDef::SubField { element_type: a }, StorageDef::SubField { element_type: b }) => {
                if a.is_compatible_with(b) {
                    Ok(())
                } else {
                    Err(Error::schema_mismatch(
                        storage_id,
                        format!("element type changed from {} to {}", a.type_name(), b.type_name()),
                    ))
                }
            }
            (
                StorageDef::ComplexField { kind: ka, sub_field_types: ta },
                StorageDef::ComplexField { kind: kb, sub_field_types: tb },
            ) => {
                if ka != kb {
                    return Err(Error::schema_mismatch(storage_id, "collection kind changed"));
                }
                if ta.len() != tb.len() || !ta.iter().zip(tb.iter()).all(|(x, y)| x.is_compatible_with(y)) {
                    return Err(Error::schema_mismatch(storage_id, "sub-field types are not pairwise compatible"));
                }
                Ok(())
            }
            (
                StorageDef::CompositeIndex { arity: aa, element_types: ta },
                StorageDef::CompositeIndex { arity: ab, element_types: tb },
            ) => {
                if aa != ab {
                    return Err(Error::schema_mismatch(storage_id, "composite index arity changed"));
                }
                if !ta.iter().zip(tb.iter()).all(|(x, y)| x.is_compatible_with(y)) {
                    return Err(Error::schema_mismatch(storage_id, "composite index element types changed"));
                }
                Ok(())
            }
            (a, b) => Err(Error::schema_mismatch(
                storage_id,
                format!("storage-id denotes a {} in one schema and a {} in the other", a.kind_name(), b.kind_name()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_field(id: u64, indexed: bool) -> FieldKind {
        FieldKind::Simple(SimpleField {
            storage_id: id,
            name: "f".into(),
            element_type: FieldType::Int32,
            indexed,
            reference: None,
        })
    }

    fn schema_with(id: u64, field: FieldKind) -> Schema {
        let mut fields = BTreeMap::new();
        fields.insert(id, field);
        let ty = ObjectType { storage_id: 1, name: "T".into(), fields, composite_indexes: BTreeMap::new() };
        let mut object_types = BTreeMap::new();
        object_types.insert(1, ty);
        Schema { version: 1, object_types }
    }

    #[test]
    fn compatible_when_indexed_flag_differs() {
        let a = schema_with(10, int_field(10, false));
        let b = schema_with(10, int_field(10, true));
        assert!(a.check_compatible(&b).is_ok());
    }

    #[test]
    fn incompatible_when_element_type_changes() {
        let a = schema_with(10, int_field(10, false));
        let mut b_field = int_field(10, false);
        if let FieldKind::Simple(ref mut f) = b_field {
            f.element_type = FieldType::Int64;
        }
        let b = schema_with(10, b_field);
        assert!(a.check_compatible(&b).is_err());
    }

    #[test]
    fn canonical_bytes_round_trip() {
        let a = schema_with(10, int_field(10, false));
        let bytes = a.canonical_bytes().unwrap();
        let back = Schema::from_canonical_bytes(&bytes).unwrap();
        assert_eq!(a.canonical_bytes().unwrap(), back.canonical_bytes().unwrap());
    }
}
