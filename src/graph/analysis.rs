//! Entity Graph Analysis
//!
//! Invariant validation for graphs about to be stored, and strongly connected
//! component detection for cycles that run through reference edges.

use petgraph::algo::{kosaraju_scc, toposort};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::{EdgeKind, EntityGraph};
use crate::error::{EntityError, Result, StructuralFault};
use crate::ids::{EntityId, LineageId};

// =============================================================================
// Validation
// =============================================================================

/// Check the ownership invariants of a graph.
///
/// - the root is present and owned by nobody
/// - every other node has exactly one owner, matching its ancestry path
/// - ownership (including repeated inline copies) is acyclic
/// - no lineage appears under two different ids
pub fn validate(graph: &EntityGraph) -> Result<()> {
    let root = graph
        .root_record()
        .ok_or(EntityError::GraphNotFound { root_id: graph.root_id })?;
    let root_fault = |fault| EntityError::structural(root.entity_id, root.lineage_id, fault);

    // Inline containment only; reference fields may legitimately form cycles
    let containment = graph.graph.filter_map(
        |_, id| Some(*id),
        |_, edge| (edge.kind == EdgeKind::Ownership || edge.embedded).then_some(()),
    );
    if let Err(cycle) = toposort(&containment, None) {
        let id = containment[cycle.node_id()];
        return Err(fault_for(graph, id, StructuralFault::OwnershipCycle(id)));
    }

    let mut lineages: HashMap<LineageId, EntityId> = HashMap::new();
    for record in graph.records() {
        let id = record.entity_id;
        if let Some(&first) = lineages.get(&record.lineage_id) {
            return Err(fault_for(
                graph,
                id,
                StructuralFault::DuplicateLineage { first, second: id },
            ));
        }
        lineages.insert(record.lineage_id, id);

        let Some(&idx) = graph.node_indices.get(&id) else {
            return Err(root_fault(StructuralFault::EdgeMismatch(format!(
                "entity {} has no graph node",
                id
            ))));
        };
        let owners: Vec<EntityId> = graph
            .graph
            .edges_directed(idx, Direction::Incoming)
            .filter(|e| e.weight().kind == EdgeKind::Ownership)
            .map(|e| graph.graph[e.source()])
            .collect();

        match (id == graph.root_id, owners.as_slice()) {
            (true, []) => {}
            (true, [_, ..]) => {
                return Err(root_fault(StructuralFault::NotARoot { root_id: graph.root_id }));
            }
            (false, [owner]) => {
                if graph.owner(id) != Some(*owner) {
                    return Err(fault_for(
                        graph,
                        id,
                        StructuralFault::EdgeMismatch(format!(
                            "ancestry of {} does not end at its owner {}",
                            id, owner
                        )),
                    ));
                }
            }
            (false, []) => {
                return Err(fault_for(
                    graph,
                    id,
                    StructuralFault::RootMismatch {
                        expected: graph.root_id,
                        found: id,
                    },
                ));
            }
            (false, _) => {
                return Err(fault_for(graph, id, StructuralFault::MultipleOwners(id)));
            }
        }
    }
    Ok(())
}

fn fault_for(graph: &EntityGraph, entity_id: EntityId, fault: StructuralFault) -> EntityError {
    let lineage_id = graph
        .record(entity_id)
        .map(|r| r.lineage_id)
        .unwrap_or_else(|| graph.lineage_id());
    EntityError::structural(entity_id, lineage_id, fault)
}

// =============================================================================
// Reference cycles
// =============================================================================

/// A group of entities that reach each other through reference edges
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceCycle {
    pub members: Vec<EntityId>,
    /// Single entity referring to itself
    pub is_self_referential: bool,
}

/// Strongly connected components of size > 1, plus self-referencing nodes
pub fn reference_cycles(graph: &EntityGraph) -> Vec<ReferenceCycle> {
    let mut cycles = Vec::new();
    for scc in kosaraju_scc(&graph.graph) {
        if scc.len() == 1 {
            let idx = scc[0];
            let has_self_ref = graph
                .graph
                .edges_directed(idx, Direction::Outgoing)
                .any(|e| e.target() == idx);
            if has_self_ref {
                cycles.push(ReferenceCycle {
                    members: vec![graph.graph[idx]],
                    is_self_referential: true,
                });
            }
        } else {
            let mut members: Vec<EntityId> = scc.iter().map(|idx| graph.graph[*idx]).collect();
            members.sort_by_key(|id| graph.order.iter().position(|o| o == id));
            cycles.push(ReferenceCycle {
                members,
                is_self_referential: false,
            });
        }
    }
    cycles
}
