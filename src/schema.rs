//! Entity schemas and field declarations
//!
//! Each entity type is described once by an [`EntitySchema`]: the ordered list
//! of declared fields and, per field, its [`ValueKind`]. The graph builder and
//! version engine consult this table to tell entity-valued fields apart from
//! plain data instead of guessing from runtime values.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::entity::{FieldValue, Scalar};
use crate::error::{EntityError, Result, StructuralFault};

/// Declared kind of a field's value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    /// Null, bool, integer, float or string
    Scalar,
    /// A single inline entity owned by the containing entity
    Entity,
    /// An ordered sequence of inline entities
    EntitySequence,
    /// A keyed mapping of inline entities
    EntityMapping,
    /// Identity-only pointer to an entity owned elsewhere
    Reference,
    /// Arbitrary non-entity data
    Plain,
}

impl ValueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::Scalar => "scalar",
            ValueKind::Entity => "entity",
            ValueKind::EntitySequence => "entity_sequence",
            ValueKind::EntityMapping => "entity_mapping",
            ValueKind::Reference => "reference",
            ValueKind::Plain => "plain",
        }
    }

    /// Whether values of this kind embed entities inline
    pub fn is_inline_entity(&self) -> bool {
        matches!(
            self,
            ValueKind::Entity | ValueKind::EntitySequence | ValueKind::EntityMapping
        )
    }

    /// Whether values of this kind connect to other entities at all
    pub fn is_entity_valued(&self) -> bool {
        self.is_inline_entity() || *self == ValueKind::Reference
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single declared field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDecl {
    pub name: String,
    pub kind: ValueKind,
    /// Entity and reference fields may hold null only when optional
    #[serde(default)]
    pub optional: bool,
}

impl FieldDecl {
    pub fn new(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind,
            optional: false,
        }
    }

    /// Value a freshly constructed entity starts with
    pub fn default_value(&self) -> FieldValue {
        match self.kind {
            ValueKind::Scalar | ValueKind::Entity | ValueKind::Reference => {
                FieldValue::Scalar(Scalar::Null)
            }
            ValueKind::EntitySequence => FieldValue::EntitySequence(Vec::new()),
            ValueKind::EntityMapping => FieldValue::EntityMapping(Default::default()),
            ValueKind::Plain => FieldValue::Plain(serde_json::Value::Null),
        }
    }

    /// Check a value against the declaration without converting it
    pub fn check(&self, value: &FieldValue) -> std::result::Result<(), StructuralFault> {
        if let FieldValue::Scalar(Scalar::Float(f)) = value {
            if !f.is_finite() {
                return Err(StructuralFault::NonFiniteFloat {
                    field: self.name.clone(),
                });
            }
        }
        let ok = match (self.kind, value) {
            (ValueKind::Scalar, FieldValue::Scalar(_)) => true,
            (ValueKind::Plain, FieldValue::Plain(_)) => true,
            (ValueKind::Entity, FieldValue::Entity(_)) => true,
            (ValueKind::EntitySequence, FieldValue::EntitySequence(_)) => true,
            (ValueKind::EntityMapping, FieldValue::EntityMapping(_)) => true,
            (ValueKind::Reference, FieldValue::Reference(_)) => true,
            (ValueKind::Entity | ValueKind::Reference, FieldValue::Scalar(Scalar::Null)) => {
                self.optional
            }
            _ => false,
        };
        if ok {
            Ok(())
        } else {
            Err(self.mismatch(value))
        }
    }

    /// Convert a caller-supplied value into the declared kind
    pub fn coerce(&self, value: FieldValue) -> std::result::Result<FieldValue, StructuralFault> {
        // NaN and infinities have no JSON form; catch them before conversion
        if let FieldValue::Scalar(Scalar::Float(f)) = &value {
            if !f.is_finite() {
                return Err(StructuralFault::NonFiniteFloat {
                    field: self.name.clone(),
                });
            }
        }
        let value = match (self.kind, value) {
            (ValueKind::Plain, FieldValue::Scalar(scalar)) => FieldValue::Plain(scalar.into_json()),
            (ValueKind::Scalar, FieldValue::Plain(json)) => match Scalar::from_json(&json) {
                Some(scalar) => FieldValue::Scalar(scalar),
                None => FieldValue::Plain(json),
            },
            (ValueKind::Reference, FieldValue::Entity(entity)) => {
                FieldValue::Reference(entity.reference())
            }
            (_, value) => value,
        };
        self.check(&value)?;
        Ok(value)
    }

    fn mismatch(&self, value: &FieldValue) -> StructuralFault {
        let found = match value {
            FieldValue::Scalar(Scalar::Null) => "null",
            other => other.kind().as_str(),
        };
        StructuralFault::KindMismatch {
            field: self.name.clone(),
            expected: self.kind,
            found,
        }
    }
}

/// Capability table for one entity type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySchema {
    /// Type name (e.g., "Order", "LineItem")
    #[serde(rename = "type")]
    pub type_name: String,
    /// Declared fields in declaration order
    #[serde(default)]
    pub fields: Vec<FieldDecl>,
}

impl EntitySchema {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            fields: Vec::new(),
        }
    }

    /// Declare a required field. Redeclaring a name replaces it in place.
    pub fn field(self, name: impl Into<String>, kind: ValueKind) -> Self {
        self.declare(FieldDecl::new(name, kind))
    }

    /// Declare an optional field. Redeclaring a name replaces it in place.
    pub fn optional(self, name: impl Into<String>, kind: ValueKind) -> Self {
        let mut decl = FieldDecl::new(name, kind);
        decl.optional = true;
        self.declare(decl)
    }

    fn declare(mut self, decl: FieldDecl) -> Self {
        match self.fields.iter_mut().find(|f| f.name == decl.name) {
            Some(existing) => *existing = decl,
            None => self.fields.push(decl),
        }
        self
    }

    /// First field name declared more than once, if any
    pub fn duplicate_field(&self) -> Option<&str> {
        self.fields
            .iter()
            .enumerate()
            .find(|(i, f)| self.fields[..*i].iter().any(|g| g.name == f.name))
            .map(|(_, f)| f.name.as_str())
    }

    /// Freeze the schema for sharing between entities
    pub fn build(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn get(&self, name: &str) -> Option<&FieldDecl> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Fields that connect to other entities
    pub fn entity_fields(&self) -> impl Iterator<Item = &FieldDecl> {
        self.fields.iter().filter(|f| f.kind.is_entity_valued())
    }
}

/// All schemas known to a decoder or tool, keyed by type name
#[derive(Debug, Clone, Default)]
pub struct SchemaCatalog {
    schemas: HashMap<String, Arc<EntitySchema>>,
}

impl SchemaCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a schema, replacing any previous one with the same type name
    pub fn register(&mut self, schema: Arc<EntitySchema>) -> Arc<EntitySchema> {
        self.schemas
            .insert(schema.type_name.clone(), Arc::clone(&schema));
        schema
    }

    pub fn get(&self, type_name: &str) -> Option<Arc<EntitySchema>> {
        self.schemas.get(type_name).cloned()
    }

    pub fn require(&self, type_name: &str) -> Result<Arc<EntitySchema>> {
        self.get(type_name).ok_or_else(|| EntityError::UnknownType {
            type_name: type_name.to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    /// Load a catalog from a JSON array of schemas
    pub fn from_json_str(content: &str) -> Result<Self> {
        let schemas: Vec<EntitySchema> = serde_json::from_str(content)?;
        let mut catalog = Self::new();
        for schema in schemas {
            if let Some(field) = schema.duplicate_field() {
                return Err(EntityError::InvalidSchema {
                    type_name: schema.type_name.clone(),
                    reason: format!("field '{}' is declared more than once", field),
                });
            }
            catalog.register(Arc::new(schema));
        }
        Ok(catalog)
    }
}

impl FromIterator<Arc<EntitySchema>> for SchemaCatalog {
    fn from_iter<I: IntoIterator<Item = Arc<EntitySchema>>>(iter: I) -> Self {
        let mut catalog = Self::new();
        for schema in iter {
            catalog.register(schema);
        }
        catalog
    }
}
