//! Graph Builder
//!
//! Walks a live entity tree depth-first, pre-order, in schema-declared field
//! order. The first inline occurrence of an `entity_id` becomes an ownership
//! edge and is recursed into; any later occurrence becomes a reference edge and
//! is not. `reference` fields are resolved once the whole tree is known.

use std::sync::Arc;

use tracing::{debug, trace};

use super::{EdgeKind, EntityEdge, EntityGraph, NodeRecord, StoredValue};
use crate::entity::{Entity, FieldValue, Slot};
use crate::error::{Result, StructuralFault};
use crate::ids::EntityId;

/// Ownership depth allowed unless configured otherwise
pub const DEFAULT_MAX_DEPTH: usize = 512;

/// Build the graph rooted at `root` with default limits.
///
/// `root` becomes the traversal root: its own `root_id` and that of every
/// owned descendant are normalized to `root.entity_id()`.
pub fn build_entity_graph(root: &mut Entity) -> Result<EntityGraph> {
    GraphBuilder::new().build(root)
}

/// Configurable graph builder
#[derive(Debug, Clone)]
pub struct GraphBuilder {
    max_depth: usize,
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    pub fn max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn build(&self, root: &mut Entity) -> Result<EntityGraph> {
        let root_id = root.entity_id();
        let mut walk = Walk {
            graph: EntityGraph::empty(root_id),
            path: Vec::new(),
            references: Vec::new(),
            max_depth: self.max_depth,
        };
        walk.visit(root, None)?;
        walk.resolve_references();

        debug!(
            root_id = %root_id,
            nodes = walk.graph.node_count(),
            edges = walk.graph.edge_count(),
            external = walk.graph.external_references.len(),
            "Built entity graph"
        );
        Ok(walk.graph)
    }
}

struct Walk {
    graph: EntityGraph,
    /// Current ownership path, root first
    path: Vec<EntityId>,
    /// `reference` field edges, resolved after traversal
    references: Vec<EntityEdge>,
    max_depth: usize,
}

impl Walk {
    /// `incoming` is the ownership edge from the owner, added once the node exists
    fn visit(&mut self, entity: &mut Entity, incoming: Option<EntityEdge>) -> Result<()> {
        if self.path.len() > self.max_depth {
            return Err(entity.fault(StructuralFault::DepthExceeded(self.max_depth)));
        }
        entity.set_root_id(self.graph.root_id);

        let id = entity.entity_id();
        if let Some(first) = self.graph.by_lineage(entity.lineage_id()) {
            return Err(entity.fault(StructuralFault::DuplicateLineage { first, second: id }));
        }

        let record = shallow_record(entity)?;
        trace!(entity_id = %id, type_name = %record.type_name(), "Visiting entity");
        self.graph.insert_node(Arc::new(record), self.path.clone());
        if let Some(edge) = incoming {
            self.graph.insert_edge(edge);
        }

        self.path.push(id);
        let schema = Arc::clone(entity.schema());
        for decl in &schema.fields {
            let Some(value) = entity.fields.get_mut(&decl.name) else {
                continue;
            };
            if let FieldValue::Reference(r) = value {
                self.references.push(EntityEdge {
                    source: id,
                    target: r.entity_id,
                    kind: EdgeKind::Reference,
                    field: decl.name.clone(),
                    slot: Slot::Direct,
                    embedded: false,
                });
                continue;
            }
            for (slot, child) in value.inline_entities_mut() {
                self.visit_inline(id, &decl.name, slot, child)?;
            }
        }
        self.path.pop();
        Ok(())
    }

    fn visit_inline(
        &mut self,
        owner: EntityId,
        field: &str,
        slot: Slot,
        child: &mut Entity,
    ) -> Result<()> {
        let child_id = child.entity_id();
        if !self.graph.contains(child_id) {
            let edge = EntityEdge {
                source: owner,
                target: child_id,
                kind: EdgeKind::Ownership,
                field: field.to_string(),
                slot,
                embedded: false,
            };
            return self.visit(child, Some(edge));
        }

        // Seen before: a second inline copy of the same version
        if self.path.contains(&child_id) {
            return Err(child.fault(StructuralFault::OwnershipCycle(child_id)));
        }
        let copy = shallow_record(child)?;
        let same = self
            .graph
            .record(child_id)
            .is_some_and(|first| first.checksum() == copy.checksum());
        if !same {
            return Err(child.fault(StructuralFault::ConflictingCopies(child_id)));
        }
        let root_id = self.graph.root_id;
        child.walk_mut(&mut |e| e.set_root_id(root_id));
        self.graph.insert_edge(EntityEdge {
            source: owner,
            target: child_id,
            kind: EdgeKind::Reference,
            field: field.to_string(),
            slot,
            embedded: true,
        });
        Ok(())
    }

    /// Attach `reference` edges by exact id, falling back to the current
    /// version of the same lineage; anything else is external
    fn resolve_references(&mut self) {
        for mut edge in std::mem::take(&mut self.references) {
            if !self.graph.contains(edge.target) {
                let lineage = self
                    .graph
                    .record(edge.source)
                    .and_then(|r| r.field(&edge.field))
                    .and_then(|v| match v {
                        StoredValue::Reference(r) => Some(r.lineage_id),
                        _ => None,
                    });
                if let Some(current) = lineage.and_then(|l| self.graph.by_lineage(l)) {
                    edge.target = current;
                }
            }
            self.graph.insert_edge(edge);
        }
    }
}

/// Check an entity's fields against its schema and build its shallow record
pub(crate) fn shallow_record(entity: &Entity) -> Result<NodeRecord> {
    let schema = entity.schema();
    if let Some(field) = schema.duplicate_field() {
        return Err(entity.fault(StructuralFault::DuplicateField {
            field: field.to_string(),
            type_name: schema.type_name.clone(),
        }));
    }
    if let Some(name) = entity.fields.keys().find(|n| schema.get(n).is_none()) {
        return Err(entity.fault(StructuralFault::UndeclaredField {
            field: name.clone(),
            type_name: schema.type_name.clone(),
        }));
    }

    let mut fields = Vec::with_capacity(schema.fields.len());
    for decl in &schema.fields {
        let value = entity.get(&decl.name).ok_or_else(|| {
            entity.fault(StructuralFault::MissingField {
                field: decl.name.clone(),
            })
        })?;
        decl.check(value).map_err(|fault| entity.fault(fault))?;
        let stored = match value {
            FieldValue::Scalar(s) => StoredValue::Scalar(s.clone()),
            FieldValue::Plain(v) => StoredValue::Plain(v.clone()),
            FieldValue::Reference(r) => StoredValue::Reference(*r),
            FieldValue::Entity(e) => StoredValue::Inline(e.entity_id()),
            FieldValue::EntitySequence(items) => {
                StoredValue::InlineSequence(items.iter().map(Entity::entity_id).collect())
            }
            FieldValue::EntityMapping(entries) => StoredValue::InlineMapping(
                entries
                    .iter()
                    .map(|(k, e)| (k.clone(), e.entity_id()))
                    .collect(),
            ),
        };
        fields.push((decl.name.clone(), stored));
    }
    NodeRecord::new(entity, fields)
}
