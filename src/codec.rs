//! Transport documents for entities and graphs
//!
//! Field values are adjacently tagged (`{"kind": ..., "value": ...}`), so an
//! inline embedding (`entity`, `entity_sequence`, `entity_mapping`) stays
//! distinguishable from an identity-only back-reference (`reference`) after a
//! round trip.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::entity::{Entity, EntityRef, FieldValue, Scalar};
use crate::error::{EntityError, Result, StructuralFault};
use crate::graph::{EntityEdge, EntityGraph, GraphBuilder};
use crate::ids::{EntityId, LineageId};
use crate::schema::SchemaCatalog;

/// Serialized form of an entity and everything it owns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDocument {
    #[serde(rename = "type")]
    pub type_name: String,
    pub entity_id: EntityId,
    pub root_id: EntityId,
    pub lineage_id: LineageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_id: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prior_ids: Vec<EntityId>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldDocument>,
}

/// Serialized field value, tagged with its kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldDocument {
    Scalar(Scalar),
    Entity(Box<EntityDocument>),
    EntitySequence(Vec<EntityDocument>),
    EntityMapping(BTreeMap<String, EntityDocument>),
    Reference(EntityRef),
    Plain(serde_json::Value),
}

/// Serialized graph: the root tree plus the edges it is expected to produce
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphDocument {
    pub root: EntityDocument,
    #[serde(default)]
    pub edges: Vec<EntityEdge>,
}

// =============================================================================
// Entities
// =============================================================================

pub fn encode(entity: &Entity) -> EntityDocument {
    let fields = entity
        .fields()
        .map(|(decl, value)| (decl.name.clone(), encode_value(value)))
        .collect();
    EntityDocument {
        type_name: entity.type_name().to_string(),
        entity_id: entity.entity_id(),
        root_id: entity.root_id(),
        lineage_id: entity.lineage_id(),
        previous_id: entity.previous_id(),
        prior_ids: entity.prior_ids().to_vec(),
        created_at: entity.created_at(),
        forked_at: entity.forked_at(),
        fields,
    }
}

fn encode_value(value: &FieldValue) -> FieldDocument {
    match value {
        FieldValue::Scalar(s) => FieldDocument::Scalar(s.clone()),
        FieldValue::Plain(v) => FieldDocument::Plain(v.clone()),
        FieldValue::Reference(r) => FieldDocument::Reference(*r),
        FieldValue::Entity(e) => FieldDocument::Entity(Box::new(encode(e))),
        FieldValue::EntitySequence(items) => {
            FieldDocument::EntitySequence(items.iter().map(encode).collect())
        }
        FieldValue::EntityMapping(entries) => FieldDocument::EntityMapping(
            entries.iter().map(|(k, e)| (k.clone(), encode(e))).collect(),
        ),
    }
}

/// Rebuild an entity, resolving types through `catalog`.
///
/// Declared fields absent from the document take their defaults.
pub fn decode(doc: &EntityDocument, catalog: &SchemaCatalog) -> Result<Entity> {
    let schema = catalog.require(&doc.type_name)?;
    let fault =
        |fault: StructuralFault| EntityError::structural(doc.entity_id, doc.lineage_id, fault);

    let mut fields = BTreeMap::new();
    for (name, field) in &doc.fields {
        let decl = schema.get(name).ok_or_else(|| {
            fault(StructuralFault::UndeclaredField {
                field: name.clone(),
                type_name: schema.type_name.clone(),
            })
        })?;
        let value = decode_value(field, catalog)?;
        decl.check(&value).map_err(fault)?;
        fields.insert(name.clone(), value);
    }
    for decl in &schema.fields {
        fields
            .entry(decl.name.clone())
            .or_insert_with(|| decl.default_value());
    }

    Ok(Entity {
        entity_id: doc.entity_id,
        root_id: doc.root_id,
        lineage_id: doc.lineage_id,
        previous_id: doc.previous_id,
        prior_ids: doc.prior_ids.clone(),
        created_at: doc.created_at,
        forked_at: doc.forked_at,
        schema,
        fields,
    })
}

fn decode_value(field: &FieldDocument, catalog: &SchemaCatalog) -> Result<FieldValue> {
    Ok(match field {
        FieldDocument::Scalar(s) => FieldValue::Scalar(s.clone()),
        FieldDocument::Plain(v) => FieldValue::Plain(v.clone()),
        FieldDocument::Reference(r) => FieldValue::Reference(*r),
        FieldDocument::Entity(doc) => FieldValue::Entity(Box::new(decode(doc, catalog)?)),
        FieldDocument::EntitySequence(docs) => FieldValue::EntitySequence(
            docs.iter()
                .map(|d| decode(d, catalog))
                .collect::<Result<Vec<_>>>()?,
        ),
        FieldDocument::EntityMapping(docs) => FieldValue::EntityMapping(
            docs.iter()
                .map(|(k, d)| Ok((k.clone(), decode(d, catalog)?)))
                .collect::<Result<BTreeMap<_, _>>>()?,
        ),
    })
}

// =============================================================================
// Graphs
// =============================================================================

pub fn encode_graph(graph: &EntityGraph) -> Result<GraphDocument> {
    let root = graph.root_entity().ok_or(EntityError::GraphNotFound {
        root_id: graph.root_id(),
    })?;
    Ok(GraphDocument {
        root: encode(&root),
        edges: graph
            .edges()
            .chain(graph.external_references())
            .cloned()
            .collect(),
    })
}

/// Decode the root tree, rebuild its graph and check the edges agree
pub fn decode_graph(doc: &GraphDocument, catalog: &SchemaCatalog) -> Result<EntityGraph> {
    decode_graph_with(doc, catalog, &GraphBuilder::new())
}

/// [`decode_graph`] with explicit builder limits
pub fn decode_graph_with(
    doc: &GraphDocument,
    catalog: &SchemaCatalog,
    builder: &GraphBuilder,
) -> Result<EntityGraph> {
    let mut root = decode(&doc.root, catalog)?;
    let graph = builder.build(&mut root)?;
    let rebuilt: Vec<&EntityEdge> = graph
        .edges()
        .chain(graph.external_references())
        .collect();
    let expected: Vec<&EntityEdge> = doc.edges.iter().collect();
    if rebuilt != expected {
        return Err(EntityError::structural(
            root.entity_id(),
            root.lineage_id(),
            StructuralFault::EdgeMismatch(format!(
                "document lists {} edges, rebuilt graph has {}",
                expected.len(),
                rebuilt.len()
            )),
        ));
    }
    Ok(graph)
}

// =============================================================================
// JSON helpers
// =============================================================================

pub fn to_json_string(entity: &Entity) -> Result<String> {
    Ok(serde_json::to_string_pretty(&encode(entity))?)
}

pub fn from_json_str(content: &str, catalog: &SchemaCatalog) -> Result<Entity> {
    let doc: EntityDocument = serde_json::from_str(content)?;
    decode(&doc, catalog)
}
