//! Entity model
//!
//! An [`Entity`] is a versioned record: a per-version `entity_id`, the
//! `root_id` of the graph it currently belongs to, a `lineage_id` shared by
//! all of its versions, and a map of declared fields.
//!
//! Equality on entities and field values is *structural*: identity fields and
//! timestamps never take part, only field content does. Compare ids directly
//! when identity matters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{EntityError, Result, StructuralFault};
use crate::ids::{EntityId, LineageId};
use crate::schema::{EntitySchema, FieldDecl, ValueKind};

// =============================================================================
// Scalars
// =============================================================================

/// A scalar field value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Scalar {
    pub fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Scalar::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn into_json(self) -> serde_json::Value {
        match self {
            Scalar::Null => serde_json::Value::Null,
            Scalar::Bool(b) => serde_json::Value::Bool(b),
            Scalar::Int(i) => serde_json::Value::from(i),
            Scalar::Float(f) => serde_json::Value::from(f),
            Scalar::Text(s) => serde_json::Value::String(s),
        }
    }

    /// Convert scalar-shaped JSON; arrays and objects yield `None`
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Null => Some(Scalar::Null),
            serde_json::Value::Bool(b) => Some(Scalar::Bool(*b)),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(Scalar::Int)
                .or_else(|| n.as_f64().map(Scalar::Float)),
            serde_json::Value::String(s) => Some(Scalar::Text(s.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Null => f.write_str("null"),
            Scalar::Bool(b) => write!(f, "{}", b),
            Scalar::Int(i) => write!(f, "{}", i),
            Scalar::Float(x) => write!(f, "{}", x),
            Scalar::Text(s) => write!(f, "{}", s),
        }
    }
}

// =============================================================================
// References and slots
// =============================================================================

/// Identity-only pointer to an entity owned by some other entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_id: EntityId,
    pub lineage_id: LineageId,
    pub root_id: EntityId,
}

/// Position of an entity inside the field that holds it
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Slot {
    /// The field holds the entity directly
    Direct,
    /// Index into an entity sequence
    Index(usize),
    /// Key into an entity mapping
    Key(String),
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Direct => Ok(()),
            Slot::Index(i) => write!(f, "[{}]", i),
            Slot::Key(k) => write!(f, "[{:?}]", k),
        }
    }
}

// =============================================================================
// Field values
// =============================================================================

/// Value held by a declared field
#[derive(Debug, Clone)]
pub enum FieldValue {
    Scalar(Scalar),
    Entity(Box<Entity>),
    EntitySequence(Vec<Entity>),
    EntityMapping(BTreeMap<String, Entity>),
    Reference(EntityRef),
    Plain(serde_json::Value),
}

impl FieldValue {
    /// The kind this value would satisfy
    pub fn kind(&self) -> ValueKind {
        match self {
            FieldValue::Scalar(_) => ValueKind::Scalar,
            FieldValue::Entity(_) => ValueKind::Entity,
            FieldValue::EntitySequence(_) => ValueKind::EntitySequence,
            FieldValue::EntityMapping(_) => ValueKind::EntityMapping,
            FieldValue::Reference(_) => ValueKind::Reference,
            FieldValue::Plain(_) => ValueKind::Plain,
        }
    }

    pub fn is_null(&self) -> bool {
        match self {
            FieldValue::Scalar(s) => s.is_null(),
            FieldValue::Plain(v) => v.is_null(),
            _ => false,
        }
    }

    pub fn as_scalar(&self) -> Option<&Scalar> {
        match self {
            FieldValue::Scalar(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<&EntityRef> {
        match self {
            FieldValue::Reference(r) => Some(r),
            _ => None,
        }
    }

    /// Inline entities held by this value, in traversal order
    pub fn inline_entities(&self) -> Vec<(Slot, &Entity)> {
        match self {
            FieldValue::Entity(e) => vec![(Slot::Direct, e.as_ref())],
            FieldValue::EntitySequence(items) => items
                .iter()
                .enumerate()
                .map(|(i, e)| (Slot::Index(i), e))
                .collect(),
            FieldValue::EntityMapping(entries) => entries
                .iter()
                .map(|(k, e)| (Slot::Key(k.clone()), e))
                .collect(),
            _ => Vec::new(),
        }
    }

    pub(crate) fn inline_entities_mut(&mut self) -> Vec<(Slot, &mut Entity)> {
        match self {
            FieldValue::Entity(e) => vec![(Slot::Direct, e.as_mut())],
            FieldValue::EntitySequence(items) => items
                .iter_mut()
                .enumerate()
                .map(|(i, e)| (Slot::Index(i), e))
                .collect(),
            FieldValue::EntityMapping(entries) => entries
                .iter_mut()
                .map(|(k, e)| (Slot::Key(k.clone()), e))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Content comparison ignoring every identity field
    pub fn structurally_eq(&self, other: &FieldValue) -> bool {
        match (self, other) {
            (FieldValue::Scalar(a), FieldValue::Scalar(b)) => a == b,
            (FieldValue::Plain(a), FieldValue::Plain(b)) => a == b,
            (FieldValue::Entity(a), FieldValue::Entity(b)) => a.structurally_eq(b),
            (FieldValue::EntitySequence(a), FieldValue::EntitySequence(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.structurally_eq(y))
            }
            (FieldValue::EntityMapping(a), FieldValue::EntityMapping(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b)
                        .all(|((ka, x), (kb, y))| ka == kb && x.structurally_eq(y))
            }
            (FieldValue::Reference(a), FieldValue::Reference(b)) => a.lineage_id == b.lineage_id,
            _ => false,
        }
    }
}

impl PartialEq for FieldValue {
    fn eq(&self, other: &Self) -> bool {
        self.structurally_eq(other)
    }
}

impl From<Scalar> for FieldValue {
    fn from(value: Scalar) -> Self {
        FieldValue::Scalar(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Scalar(Scalar::Text(value.to_string()))
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Scalar(Scalar::Text(value))
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Scalar(Scalar::Int(value))
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        FieldValue::Scalar(Scalar::Int(i64::from(value)))
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Scalar(Scalar::Float(value))
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Scalar(Scalar::Bool(value))
    }
}

impl From<Entity> for FieldValue {
    fn from(value: Entity) -> Self {
        FieldValue::Entity(Box::new(value))
    }
}

impl From<Vec<Entity>> for FieldValue {
    fn from(value: Vec<Entity>) -> Self {
        FieldValue::EntitySequence(value)
    }
}

impl From<BTreeMap<String, Entity>> for FieldValue {
    fn from(value: BTreeMap<String, Entity>) -> Self {
        FieldValue::EntityMapping(value)
    }
}

impl From<EntityRef> for FieldValue {
    fn from(value: EntityRef) -> Self {
        FieldValue::Reference(value)
    }
}

impl From<serde_json::Value> for FieldValue {
    fn from(value: serde_json::Value) -> Self {
        FieldValue::Plain(value)
    }
}

// =============================================================================
// Entity
// =============================================================================

/// A versioned structured record
#[derive(Debug, Clone)]
pub struct Entity {
    pub(crate) entity_id: EntityId,
    pub(crate) root_id: EntityId,
    pub(crate) lineage_id: LineageId,
    pub(crate) previous_id: Option<EntityId>,
    pub(crate) prior_ids: Vec<EntityId>,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) forked_at: Option<DateTime<Utc>>,
    pub(crate) schema: Arc<EntitySchema>,
    pub(crate) fields: BTreeMap<String, FieldValue>,
}

impl Entity {
    /// Create a standalone root entity with every declared field at its default
    pub fn new(schema: Arc<EntitySchema>) -> Self {
        let entity_id = EntityId::new();
        let fields = schema
            .fields
            .iter()
            .map(|decl| (decl.name.clone(), decl.default_value()))
            .collect();
        Self {
            entity_id,
            root_id: entity_id,
            lineage_id: LineageId::new(),
            previous_id: None,
            prior_ids: Vec::new(),
            created_at: Utc::now(),
            forked_at: None,
            schema,
            fields,
        }
    }

    /// Override the lineage assigned at construction
    pub fn with_lineage(mut self, lineage_id: LineageId) -> Self {
        self.lineage_id = lineage_id;
        self
    }

    /// Set a field, consuming and returning the entity
    pub fn with(mut self, name: &str, value: impl Into<FieldValue>) -> Result<Self> {
        self.set(name, value)?;
        Ok(self)
    }

    pub fn entity_id(&self) -> EntityId {
        self.entity_id
    }

    pub fn root_id(&self) -> EntityId {
        self.root_id
    }

    pub fn lineage_id(&self) -> LineageId {
        self.lineage_id
    }

    /// The version this one was minted from
    pub fn previous_id(&self) -> Option<EntityId> {
        self.previous_id
    }

    /// Every earlier identity of this value, oldest first
    pub fn prior_ids(&self) -> &[EntityId] {
        &self.prior_ids
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn forked_at(&self) -> Option<DateTime<Utc>> {
        self.forked_at
    }

    pub fn schema(&self) -> &Arc<EntitySchema> {
        &self.schema
    }

    pub fn type_name(&self) -> &str {
        &self.schema.type_name
    }

    pub fn is_root(&self) -> bool {
        self.root_id == self.entity_id
    }

    /// Identity-only pointer to this version
    pub fn reference(&self) -> EntityRef {
        EntityRef {
            entity_id: self.entity_id,
            lineage_id: self.lineage_id,
            root_id: self.root_id,
        }
    }

    // ========== Field access ==========

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Raw mutable access. Values are not coerced here; the graph builder
    /// rejects anything that no longer matches the declared kind.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut FieldValue> {
        self.fields.get_mut(name)
    }

    /// Set a declared field, coercing the value to the declared kind
    pub fn set(&mut self, name: &str, value: impl Into<FieldValue>) -> Result<()> {
        let decl = self.decl(name)?.clone();
        let value = decl
            .coerce(value.into())
            .map_err(|fault| self.fault(fault))?;
        self.fields.insert(decl.name, value);
        Ok(())
    }

    /// Remove a field's value, leaving the declared default in its place
    pub fn take(&mut self, name: &str) -> Option<FieldValue> {
        let default = self.schema.get(name)?.default_value();
        self.fields.insert(name.to_string(), default)
    }

    pub fn scalar(&self, name: &str) -> Option<&Scalar> {
        self.get(name)?.as_scalar()
    }

    pub fn child(&self, name: &str) -> Option<&Entity> {
        match self.get(name)? {
            FieldValue::Entity(e) => Some(e),
            _ => None,
        }
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut Entity> {
        match self.get_mut(name)? {
            FieldValue::Entity(e) => Some(e),
            _ => None,
        }
    }

    pub fn items(&self, name: &str) -> Option<&Vec<Entity>> {
        match self.get(name)? {
            FieldValue::EntitySequence(items) => Some(items),
            _ => None,
        }
    }

    pub fn items_mut(&mut self, name: &str) -> Option<&mut Vec<Entity>> {
        match self.get_mut(name)? {
            FieldValue::EntitySequence(items) => Some(items),
            _ => None,
        }
    }

    pub fn entries(&self, name: &str) -> Option<&BTreeMap<String, Entity>> {
        match self.get(name)? {
            FieldValue::EntityMapping(entries) => Some(entries),
            _ => None,
        }
    }

    pub fn entries_mut(&mut self, name: &str) -> Option<&mut BTreeMap<String, Entity>> {
        match self.get_mut(name)? {
            FieldValue::EntityMapping(entries) => Some(entries),
            _ => None,
        }
    }

    /// Present fields in declaration order
    pub fn fields(&self) -> impl Iterator<Item = (&FieldDecl, &FieldValue)> {
        self.schema
            .fields
            .iter()
            .filter_map(move |decl| self.fields.get(&decl.name).map(|v| (decl, v)))
    }

    /// Declared field names with their value kinds
    pub fn field_kinds(&self) -> Vec<(&str, ValueKind)> {
        self.schema
            .fields
            .iter()
            .map(|decl| (decl.name.as_str(), decl.kind))
            .collect()
    }

    /// Content-only comparison; ids, lineage and timestamps are ignored
    pub fn structurally_eq(&self, other: &Entity) -> bool {
        self.schema.type_name == other.schema.type_name
            && self.fields.len() == other.fields.len()
            && self
                .fields
                .iter()
                .all(|(name, value)| other.fields.get(name).is_some_and(|o| value.structurally_eq(o)))
    }

    // ========== Identity bookkeeping ==========

    /// Replace this version's identity with a freshly minted one
    pub(crate) fn mint(&mut self) -> EntityId {
        self.mint_as(EntityId::new())
    }

    /// Move to the next version under an id minted elsewhere
    pub(crate) fn mint_as(&mut self, new_id: EntityId) -> EntityId {
        let was_root = self.is_root();
        let old = self.entity_id;
        self.entity_id = new_id;
        self.previous_id = Some(old);
        self.prior_ids.push(old);
        self.forked_at = Some(Utc::now());
        if was_root {
            self.root_id = new_id;
        }
        new_id
    }

    pub(crate) fn set_root_id(&mut self, root_id: EntityId) {
        self.root_id = root_id;
    }

    /// Visit this entity and every inline descendant, parents first
    pub(crate) fn walk_mut(&mut self, f: &mut dyn FnMut(&mut Entity)) {
        f(self);
        for value in self.fields.values_mut() {
            for (_, child) in value.inline_entities_mut() {
                child.walk_mut(f);
            }
        }
    }

    fn decl(&self, name: &str) -> Result<&FieldDecl> {
        self.schema.get(name).ok_or_else(|| {
            self.fault(StructuralFault::UndeclaredField {
                field: name.to_string(),
                type_name: self.schema.type_name.clone(),
            })
        })
    }

    pub(crate) fn fault(&self, fault: StructuralFault) -> EntityError {
        EntityError::structural(self.entity_id, self.lineage_id, fault)
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        self.structurally_eq(other)
    }
}
