//! Entity Graph
//!
//! A derived, read-only view of everything reachable from one root entity:
//! an arena of shallow [`NodeRecord`]s indexed by `entity_id`, plus a petgraph
//! `DiGraph` carrying ownership and reference edges.
//!
//! Records never embed their children; inline entities are stored as child
//! ids. That keeps each record independent of the snapshot it belongs to, so
//! an unchanged node is shared by `Arc` between successive versions of a graph.
//! `root_id` is deliberately not part of a record: it is supplied by the graph
//! when an entity is materialized.

pub mod analysis;
pub mod builder;
pub mod render;

pub use analysis::{reference_cycles, validate, ReferenceCycle};
pub use builder::{build_entity_graph, GraphBuilder, DEFAULT_MAX_DEPTH};
pub use render::ExportFormat;

use chrono::{DateTime, Utc};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::checksum::Checksum;
use crate::entity::{Entity, EntityRef, FieldValue, Scalar, Slot};
use crate::error::{EntityError, Result};
use crate::ids::{EntityId, LineageId};
use crate::schema::EntitySchema;

// =============================================================================
// Edges
// =============================================================================

/// Kind of connection between two entities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// Exclusive containment; the target belongs to the source's tree
    Ownership,
    /// Non-owning pointer to an entity owned elsewhere
    Reference,
}

/// A single edge, labelled with the field and slot that produced it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityEdge {
    pub source: EntityId,
    pub target: EntityId,
    pub kind: EdgeKind,
    pub field: String,
    pub slot: Slot,
    /// Set when the target was found inline a second time rather than
    /// through a `reference` field
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub embedded: bool,
}

impl EntityEdge {
    /// Field label with its slot, e.g. `items[2]`
    pub fn label(&self) -> String {
        format!("{}{}", self.field, self.slot)
    }
}

// =============================================================================
// Node records
// =============================================================================

/// Shallow field value: inline entities replaced by their ids
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StoredValue {
    Scalar(Scalar),
    Inline(EntityId),
    InlineSequence(Vec<EntityId>),
    InlineMapping(BTreeMap<String, EntityId>),
    Reference(EntityRef),
    Plain(serde_json::Value),
}

impl StoredValue {
    /// Ids of inline children in slot order
    pub fn inline_ids(&self) -> Vec<(Slot, EntityId)> {
        match self {
            StoredValue::Inline(id) => vec![(Slot::Direct, *id)],
            StoredValue::InlineSequence(ids) => ids
                .iter()
                .enumerate()
                .map(|(i, id)| (Slot::Index(i), *id))
                .collect(),
            StoredValue::InlineMapping(ids) => ids
                .iter()
                .map(|(k, id)| (Slot::Key(k.clone()), *id))
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Immutable stored form of one entity version
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub entity_id: EntityId,
    pub lineage_id: LineageId,
    pub previous_id: Option<EntityId>,
    pub prior_ids: Vec<EntityId>,
    pub created_at: DateTime<Utc>,
    pub forked_at: Option<DateTime<Utc>>,
    pub schema: Arc<EntitySchema>,
    /// Fields in declaration order
    pub fields: Vec<(String, StoredValue)>,
    checksum: Checksum,
}

/// The hashed part of a record
#[derive(Serialize)]
struct RecordContent<'a> {
    entity_id: &'a EntityId,
    lineage_id: &'a LineageId,
    type_name: &'a str,
    fields: &'a [(String, StoredValue)],
}

impl NodeRecord {
    pub(crate) fn new(entity: &Entity, fields: Vec<(String, StoredValue)>) -> Result<Self> {
        let mut record = Self {
            entity_id: entity.entity_id,
            lineage_id: entity.lineage_id,
            previous_id: entity.previous_id,
            prior_ids: entity.prior_ids.clone(),
            created_at: entity.created_at,
            forked_at: entity.forked_at,
            schema: Arc::clone(&entity.schema),
            fields,
            checksum: Checksum::from(String::new()),
        };
        record.checksum = record.compute_checksum()?;
        Ok(record)
    }

    pub fn type_name(&self) -> &str {
        &self.schema.type_name
    }

    pub fn checksum(&self) -> &Checksum {
        &self.checksum
    }

    pub fn field(&self, name: &str) -> Option<&StoredValue> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn compute_checksum(&self) -> Result<Checksum> {
        Checksum::of(&RecordContent {
            entity_id: &self.entity_id,
            lineage_id: &self.lineage_id,
            type_name: &self.schema.type_name,
            fields: &self.fields,
        })
    }

    /// Recompute the checksum and compare it with the one taken at creation
    pub fn verify(&self) -> Result<()> {
        let actual = self.compute_checksum()?;
        if actual != self.checksum {
            return Err(EntityError::ChecksumMismatch {
                entity_id: self.entity_id,
                expected: self.checksum.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(())
    }
}

// =============================================================================
// Entity graph
// =============================================================================

/// All entities reachable from one root, with ownership and reference edges
#[derive(Debug, Clone)]
pub struct EntityGraph {
    pub(crate) root_id: EntityId,
    /// Primary graph structure; node weights are entity ids
    pub(crate) graph: DiGraph<EntityId, EntityEdge>,
    /// Node index lookup: entity_id -> NodeIndex
    pub(crate) node_indices: HashMap<EntityId, NodeIndex>,
    pub(crate) records: HashMap<EntityId, Arc<NodeRecord>>,
    pub(crate) by_lineage: HashMap<LineageId, EntityId>,
    /// Owning path from the root to each node, root first, node excluded
    pub(crate) ancestry: HashMap<EntityId, Vec<EntityId>>,
    /// Discovery order of the builder
    pub(crate) order: Vec<EntityId>,
    /// References whose targets live outside this graph
    pub(crate) external_references: Vec<EntityEdge>,
}

impl EntityGraph {
    pub(crate) fn empty(root_id: EntityId) -> Self {
        Self {
            root_id,
            graph: DiGraph::new(),
            node_indices: HashMap::new(),
            records: HashMap::new(),
            by_lineage: HashMap::new(),
            ancestry: HashMap::new(),
            order: Vec::new(),
            external_references: Vec::new(),
        }
    }

    pub(crate) fn insert_node(&mut self, record: Arc<NodeRecord>, ancestry: Vec<EntityId>) {
        let id = record.entity_id;
        let idx = self.graph.add_node(id);
        self.node_indices.insert(id, idx);
        self.by_lineage.insert(record.lineage_id, id);
        self.ancestry.insert(id, ancestry);
        self.records.insert(id, record);
        self.order.push(id);
    }

    pub(crate) fn insert_edge(&mut self, edge: EntityEdge) {
        if let (Some(&s), Some(&t)) = (
            self.node_indices.get(&edge.source),
            self.node_indices.get(&edge.target),
        ) {
            self.graph.add_edge(s, t, edge);
        } else {
            self.external_references.push(edge);
        }
    }

    // ========== Public API ==========

    pub fn root_id(&self) -> EntityId {
        self.root_id
    }

    /// Lineage of the root entity
    pub fn lineage_id(&self) -> LineageId {
        self.records
            .get(&self.root_id)
            .map(|r| r.lineage_id)
            .unwrap_or_default()
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn contains(&self, entity_id: EntityId) -> bool {
        self.node_indices.contains_key(&entity_id)
    }

    /// Entity ids in discovery order, root first
    pub fn entity_ids(&self) -> &[EntityId] {
        &self.order
    }

    pub fn record(&self, entity_id: EntityId) -> Option<&Arc<NodeRecord>> {
        self.records.get(&entity_id)
    }

    pub fn root_record(&self) -> Option<&Arc<NodeRecord>> {
        self.records.get(&self.root_id)
    }

    /// Records in discovery order
    pub fn records(&self) -> impl Iterator<Item = &Arc<NodeRecord>> {
        self.order.iter().filter_map(|id| self.records.get(id))
    }

    /// Current version of a lineage within this graph
    pub fn by_lineage(&self, lineage_id: LineageId) -> Option<EntityId> {
        self.by_lineage.get(&lineage_id).copied()
    }

    pub fn lineages(&self) -> impl Iterator<Item = LineageId> + '_ {
        self.records().map(|r| r.lineage_id)
    }

    /// Owning path from the root, root first, excluding the node itself
    pub fn ancestry_path(&self, entity_id: EntityId) -> Option<&[EntityId]> {
        self.ancestry.get(&entity_id).map(|p| p.as_slice())
    }

    /// Direct owner of a node; `None` for the root or unknown ids
    pub fn owner(&self, entity_id: EntityId) -> Option<EntityId> {
        self.ancestry.get(&entity_id)?.last().copied()
    }

    /// Depth along ownership edges; the root is 0
    pub fn depth(&self, entity_id: EntityId) -> Option<usize> {
        self.ancestry.get(&entity_id).map(|p| p.len())
    }

    pub fn edges(&self) -> impl Iterator<Item = &EntityEdge> {
        self.graph.edge_references().map(|e| e.weight())
    }

    pub fn ownership_edges(&self) -> impl Iterator<Item = &EntityEdge> {
        self.edges().filter(|e| e.kind == EdgeKind::Ownership)
    }

    pub fn reference_edges(&self) -> impl Iterator<Item = &EntityEdge> {
        self.edges().filter(|e| e.kind == EdgeKind::Reference)
    }

    pub fn external_references(&self) -> &[EntityEdge] {
        &self.external_references
    }

    /// Entities owned directly by `entity_id`
    pub fn children(&self, entity_id: EntityId) -> Vec<EntityId> {
        self.neighbors(entity_id, Direction::Outgoing, EdgeKind::Ownership)
    }

    /// Entities holding a reference edge to `entity_id`
    pub fn referrers(&self, entity_id: EntityId) -> Vec<EntityId> {
        self.neighbors(entity_id, Direction::Incoming, EdgeKind::Reference)
    }

    /// Entities holding a second inline copy of `entity_id`
    pub fn embedding_holders(&self, entity_id: EntityId) -> Vec<EntityId> {
        let Some(&idx) = self.node_indices.get(&entity_id) else {
            return Vec::new();
        };
        self.graph
            .edges_directed(idx, Direction::Incoming)
            .filter(|e| e.weight().embedded)
            .map(|e| e.weight().source)
            .collect()
    }

    /// Targets of edges of `kind` leaving `source`
    pub fn find_entities_by_edge(&self, source: EntityId, kind: EdgeKind) -> Vec<EntityId> {
        self.neighbors(source, Direction::Outgoing, kind)
    }

    /// Entities whose type declares a field called `name`
    pub fn find_entities_with_field(&self, name: &str) -> Vec<EntityId> {
        self.records()
            .filter(|r| r.schema.get(name).is_some())
            .map(|r| r.entity_id)
            .collect()
    }

    /// Entities of the given type, in discovery order
    pub fn find_entities_of_type(&self, type_name: &str) -> Vec<EntityId> {
        self.records()
            .filter(|r| r.type_name() == type_name)
            .map(|r| r.entity_id)
            .collect()
    }

    fn neighbors(&self, entity_id: EntityId, dir: Direction, kind: EdgeKind) -> Vec<EntityId> {
        let Some(&idx) = self.node_indices.get(&entity_id) else {
            return Vec::new();
        };
        let mut edges: Vec<_> = self
            .graph
            .edges_directed(idx, dir)
            .filter(|e| e.weight().kind == kind)
            .collect();
        // petgraph walks edges newest first
        edges.reverse();
        edges
            .into_iter()
            .map(|e| match dir {
                Direction::Outgoing => e.weight().target,
                Direction::Incoming => e.weight().source,
            })
            .collect()
    }

    /// Checksum over the root id and every record, in discovery order
    pub fn manifest_checksum(&self) -> Checksum {
        let root = Checksum::from_bytes(self.root_id.as_uuid().as_bytes());
        Checksum::combine(std::iter::once(&root).chain(self.records().map(|r| r.checksum())))
    }

    // ========== Materialization ==========

    /// Independent deep copy of an entity, with `root_id` set to this graph's root
    pub fn entity(&self, entity_id: EntityId) -> Option<Entity> {
        self.materialize(entity_id)
    }

    /// Independent deep copy of the whole tree
    pub fn root_entity(&self) -> Option<Entity> {
        self.materialize(self.root_id)
    }

    fn materialize(&self, entity_id: EntityId) -> Option<Entity> {
        let record = self.records.get(&entity_id)?;
        let mut fields = BTreeMap::new();
        for (name, stored) in &record.fields {
            let value = match stored {
                StoredValue::Scalar(s) => FieldValue::Scalar(s.clone()),
                StoredValue::Plain(v) => FieldValue::Plain(v.clone()),
                StoredValue::Reference(r) => FieldValue::Reference(*r),
                StoredValue::Inline(id) => FieldValue::Entity(Box::new(self.materialize(*id)?)),
                StoredValue::InlineSequence(ids) => FieldValue::EntitySequence(
                    ids.iter()
                        .map(|id| self.materialize(*id))
                        .collect::<Option<Vec<_>>>()?,
                ),
                StoredValue::InlineMapping(ids) => FieldValue::EntityMapping(
                    ids.iter()
                        .map(|(k, id)| Some((k.clone(), self.materialize(*id)?)))
                        .collect::<Option<BTreeMap<_, _>>>()?,
                ),
            };
            fields.insert(name.clone(), value);
        }
        Some(Entity {
            entity_id: record.entity_id,
            root_id: self.root_id,
            lineage_id: record.lineage_id,
            previous_id: record.previous_id,
            prior_ids: record.prior_ids.clone(),
            created_at: record.created_at,
            forked_at: record.forked_at,
            schema: Arc::clone(&record.schema),
            fields,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ValueKind;

    fn leaf() -> Arc<EntitySchema> {
        EntitySchema::new("Leaf").field("name", ValueKind::Scalar).build()
    }

    fn node() -> Arc<EntitySchema> {
        EntitySchema::new("Node")
            .field("name", ValueKind::Scalar)
            .field("children", ValueKind::EntitySequence)
            .optional("watch", ValueKind::Reference)
            .build()
    }

    fn sample() -> (Entity, EntityGraph) {
        let mut root = Entity::new(node()).with("name", "root").unwrap();
        let a = Entity::new(leaf()).with("name", "a").unwrap();
        let b = Entity::new(leaf()).with("name", "b").unwrap();
        let b_ref = b.reference();
        root.set("children", vec![a, b]).unwrap();
        root.set("watch", b_ref).unwrap();
        let graph = build_entity_graph(&mut root).unwrap();
        (root, graph)
    }

    #[test]
    fn test_graph_counts_and_order() {
        let (root, graph) = sample();
        let kids = root.items("children").unwrap();
        assert_eq!(graph.node_count(), 3);
        assert_eq!(graph.ownership_edges().count(), 2);
        assert_eq!(graph.reference_edges().count(), 1);
        assert_eq!(
            graph.entity_ids(),
            &[root.entity_id(), kids[0].entity_id(), kids[1].entity_id()]
        );
    }

    #[test]
    fn test_children_referrers_and_owner() {
        let (root, graph) = sample();
        let kids = root.items("children").unwrap();
        let (a, b) = (kids[0].entity_id(), kids[1].entity_id());
        assert_eq!(graph.children(root.entity_id()), vec![a, b]);
        assert_eq!(graph.referrers(b), vec![root.entity_id()]);
        assert!(graph.referrers(a).is_empty());
        assert_eq!(graph.owner(a), Some(root.entity_id()));
        assert_eq!(graph.owner(root.entity_id()), None);
        assert_eq!(graph.ancestry_path(b), Some(&[root.entity_id()][..]));
        assert_eq!(graph.depth(b), Some(1));
    }

    #[test]
    fn test_queries() {
        let (root, graph) = sample();
        assert_eq!(graph.find_entities_with_field("watch"), vec![root.entity_id()]);
        assert_eq!(graph.find_entities_with_field("name").len(), 3);
        assert_eq!(graph.find_entities_of_type("Leaf").len(), 2);
        assert_eq!(
            graph.find_entities_by_edge(root.entity_id(), EdgeKind::Reference),
            vec![root.items("children").unwrap()[1].entity_id()]
        );
    }

    #[test]
    fn test_materialized_entity_is_independent_copy() {
        let (root, graph) = sample();
        let mut copy = graph.root_entity().unwrap();
        assert_eq!(copy.entity_id(), root.entity_id());
        assert!(copy.structurally_eq(&root));

        copy.items_mut("children").unwrap()[0].set("name", "changed").unwrap();
        let again = graph.root_entity().unwrap();
        assert!(again.structurally_eq(&root));
    }

    #[test]
    fn test_materialized_child_carries_graph_root() {
        let (root, graph) = sample();
        let child_id = root.items("children").unwrap()[0].entity_id();
        let child = graph.entity(child_id).unwrap();
        assert_eq!(child.root_id(), root.entity_id());
        assert!(!child.is_root());
    }

    #[test]
    fn test_record_checksum_verifies() {
        let (_, graph) = sample();
        for record in graph.records() {
            record.verify().unwrap();
        }
        let (_, other) = sample();
        assert_ne!(graph.manifest_checksum(), other.manifest_checksum());
    }
}
