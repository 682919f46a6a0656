//! Version Engine
//!
//! Compares a freshly built graph with the stored graph of the same root,
//! node by node matched on `lineage_id`, and decides which entities need new
//! identities. Changed nodes and every owner on their path to the root are
//! minted; everything else keeps its `entity_id` and its stored record.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::entity::{Entity, Slot};
use crate::error::Result;
use crate::graph::{EdgeKind, EntityEdge, EntityGraph, GraphBuilder, NodeRecord, StoredValue};
use crate::ids::{EntityId, LineageId};

/// Knobs for one revision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionOptions {
    /// Re-version every node even when nothing changed
    pub force: bool,
    /// Treat a change of owning parent as a change of the moved node
    pub track_moves: bool,
}

impl Default for VersionOptions {
    fn default() -> Self {
        Self {
            force: false,
            track_moves: true,
        }
    }
}

impl VersionOptions {
    pub fn forced() -> Self {
        Self {
            force: true,
            ..Self::default()
        }
    }
}

// =============================================================================
// Change sets
// =============================================================================

/// Lineages affected by a revision, each list in new-graph discovery order
/// (`removed` in old-graph order)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    /// Present only in the new graph
    pub added: Vec<LineageId>,
    /// Present only in the old graph
    pub removed: Vec<LineageId>,
    /// Content differs from the stored version
    pub modified: Vec<LineageId>,
    /// Content unchanged but owned by a different parent
    pub moved: Vec<LineageId>,
    /// Unchanged themselves, but own (or hold a copy of) a changed node
    pub propagated: Vec<LineageId>,
    /// Edge-level view of the same revision
    #[serde(default)]
    pub edges: EdgeChanges,
}

/// One edge, identified by lineages so it can be matched across versions
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EdgeChange {
    pub source: LineageId,
    pub target: LineageId,
    pub field: String,
    pub slot: Slot,
    pub kind: EdgeKind,
}

/// An edge present in both graphs whose kind differs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeKindChange {
    pub edge: EdgeChange,
    /// Kind in the old graph; `edge.kind` holds the new one
    pub previous: EdgeKind,
}

/// Edges matched on (source lineage, target lineage, field, slot).
///
/// Only edges between nodes of the graph are compared; external
/// references have no lineage to match on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeChanges {
    pub added: Vec<EdgeChange>,
    pub removed: Vec<EdgeChange>,
    /// e.g. an ownership edge that became an embedded reference
    pub kind_changed: Vec<EdgeKindChange>,
}

impl EdgeChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.kind_changed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.removed.len() + self.kind_changed.len()
    }
}

impl ChangeSet {
    /// True when neither nodes nor edges changed
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.modified.is_empty()
            && self.moved.is_empty()
            && self.propagated.is_empty()
            && self.edges.is_empty()
    }

    /// Existing lineages that need a new version
    pub fn reversioned(&self) -> impl Iterator<Item = &LineageId> {
        self.modified
            .iter()
            .chain(self.moved.iter())
            .chain(self.propagated.iter())
    }

    pub fn is_reversioned(&self, lineage_id: LineageId) -> bool {
        self.reversioned().any(|l| *l == lineage_id)
    }

    /// Total number of lineages touched; edge changes are counted separately
    pub fn len(&self) -> usize {
        self.added.len()
            + self.removed.len()
            + self.modified.len()
            + self.moved.len()
            + self.propagated.len()
    }
}

/// Changes of a graph registered as the first version of its root
pub fn initial_changes(graph: &EntityGraph) -> ChangeSet {
    diff_graphs(&EntityGraph::empty(graph.root_id()), graph)
}

/// Diff two graphs with default options
pub fn diff_graphs(old: &EntityGraph, new: &EntityGraph) -> ChangeSet {
    diff_graphs_with(old, new, &VersionOptions::default())
}

/// Diff two graphs of the same logical root, matching nodes by lineage
pub fn diff_graphs_with(old: &EntityGraph, new: &EntityGraph, options: &VersionOptions) -> ChangeSet {
    let mut changes = ChangeSet::default();
    let mut changed: HashSet<EntityId> = HashSet::new();

    for record in new.records() {
        let lineage = record.lineage_id;
        let Some(before) = old.by_lineage(lineage).and_then(|id| old.record(id)) else {
            changes.added.push(lineage);
            changed.insert(record.entity_id);
            continue;
        };

        if before.entity_id != record.entity_id || !content_eq(old, before, new, record) {
            changes.modified.push(lineage);
            changed.insert(record.entity_id);
        } else if options.track_moves && owner_lineage(old, before) != owner_lineage(new, record) {
            changes.moved.push(lineage);
            changed.insert(record.entity_id);
        }
    }

    for record in old.records() {
        if new.by_lineage(record.lineage_id).is_none() {
            changes.removed.push(record.lineage_id);
        }
    }

    // Every owner of a changed node changes with it, and so does every holder
    // of an embedded copy: its record pins the copy's id
    let mut propagated: HashSet<EntityId> = HashSet::new();
    let mut pending: Vec<EntityId> = changed.iter().copied().collect();
    while let Some(id) = pending.pop() {
        let owners = new.ancestry_path(id).unwrap_or_default().iter().copied();
        let holders = new.embedding_holders(id);
        for holder in owners.chain(holders) {
            if !changed.contains(&holder) && propagated.insert(holder) {
                pending.push(holder);
            }
        }
    }
    changes.propagated = new
        .records()
        .filter(|r| propagated.contains(&r.entity_id))
        .map(|r| r.lineage_id)
        .collect();
    changes.edges = diff_edges(old, new);

    debug!(
        root_id = %new.root_id(),
        added = changes.added.len(),
        removed = changes.removed.len(),
        modified = changes.modified.len(),
        moved = changes.moved.len(),
        propagated = changes.propagated.len(),
        edges = changes.edges.len(),
        "Diffed entity graphs"
    );
    changes
}

fn edge_change(graph: &EntityGraph, edge: &EntityEdge) -> Option<EdgeChange> {
    Some(EdgeChange {
        source: lineage_of(graph, edge.source)?,
        target: lineage_of(graph, edge.target)?,
        field: edge.field.clone(),
        slot: edge.slot.clone(),
        kind: edge.kind,
    })
}

type EdgeKey = (LineageId, LineageId, String, Slot);

fn edge_key(change: &EdgeChange) -> EdgeKey {
    (change.source, change.target, change.field.clone(), change.slot.clone())
}

fn diff_edges(old: &EntityGraph, new: &EntityGraph) -> EdgeChanges {
    let before: Vec<EdgeChange> = old.edges().filter_map(|e| edge_change(old, e)).collect();
    let after: Vec<EdgeChange> = new.edges().filter_map(|e| edge_change(new, e)).collect();
    let old_kinds: HashMap<EdgeKey, EdgeKind> =
        before.iter().map(|c| (edge_key(c), c.kind)).collect();
    let new_keys: HashSet<EdgeKey> = after.iter().map(edge_key).collect();

    let mut changes = EdgeChanges::default();
    for change in after {
        match old_kinds.get(&edge_key(&change)) {
            None => changes.added.push(change),
            Some(&previous) if previous != change.kind => {
                changes.kind_changed.push(EdgeKindChange {
                    edge: change,
                    previous,
                })
            }
            Some(_) => {}
        }
    }
    changes.removed = before
        .into_iter()
        .filter(|c| !new_keys.contains(&edge_key(c)))
        .collect();
    changes
}

fn owner_lineage(graph: &EntityGraph, record: &NodeRecord) -> Option<LineageId> {
    let owner = graph.owner(record.entity_id)?;
    graph.record(owner).map(|r| r.lineage_id)
}

fn lineage_of(graph: &EntityGraph, id: EntityId) -> Option<LineageId> {
    graph.record(id).map(|r| r.lineage_id)
}

/// Node-local content comparison; inline children and references are
/// compared by lineage, so identity churn below never counts here
fn content_eq(old: &EntityGraph, a: &NodeRecord, new: &EntityGraph, b: &NodeRecord) -> bool {
    if a.type_name() != b.type_name() || a.fields.len() != b.fields.len() {
        return false;
    }
    a.fields
        .iter()
        .zip(&b.fields)
        .all(|((name_a, va), (name_b, vb))| {
            name_a == name_b
                && match (va, vb) {
                    (StoredValue::Scalar(x), StoredValue::Scalar(y)) => x == y,
                    (StoredValue::Plain(x), StoredValue::Plain(y)) => x == y,
                    (StoredValue::Reference(x), StoredValue::Reference(y)) => {
                        x.lineage_id == y.lineage_id
                    }
                    (StoredValue::Inline(x), StoredValue::Inline(y)) => {
                        lineage_of(old, *x) == lineage_of(new, *y)
                    }
                    (StoredValue::InlineSequence(xs), StoredValue::InlineSequence(ys)) => {
                        xs.len() == ys.len()
                            && xs
                                .iter()
                                .zip(ys)
                                .all(|(x, y)| lineage_of(old, *x) == lineage_of(new, *y))
                    }
                    (StoredValue::InlineMapping(xs), StoredValue::InlineMapping(ys)) => {
                        xs.len() == ys.len()
                            && xs.iter().zip(ys).all(|((kx, x), (ky, y))| {
                                kx == ky && lineage_of(old, *x) == lineage_of(new, *y)
                            })
                    }
                    _ => false,
                }
        })
}

// =============================================================================
// Revisions
// =============================================================================

/// Result of versioning a graph
#[derive(Debug, Clone)]
pub struct Revision {
    /// The newly built graph
    pub graph: EntityGraph,
    /// Root id of the graph this revision supersedes
    pub previous_root: Option<EntityId>,
    pub changes: ChangeSet,
    /// Old id -> newly minted id
    pub minted: HashMap<EntityId, EntityId>,
}

impl Revision {
    pub fn root_id(&self) -> EntityId {
        self.graph.root_id()
    }

    /// True when no identity was minted
    pub fn is_noop(&self) -> bool {
        self.minted.is_empty() && self.changes.is_empty()
    }
}

/// Which ids of a freshly built graph have to be minted
#[derive(Debug, Clone, Default)]
pub struct RevisionPlan {
    pub changes: ChangeSet,
    pub to_mint: HashSet<EntityId>,
}

impl RevisionPlan {
    /// Nothing to mint means the root keeps its id, so there is no new
    /// version to register even if edges were reshuffled
    pub fn is_noop(&self) -> bool {
        self.to_mint.is_empty()
    }
}

/// Decide which nodes of `new` need new identities.
///
/// `is_taken` reports whether an id is already stored with different content;
/// added nodes keep their ids unless taken.
pub fn plan_revision(
    old: &EntityGraph,
    new: &EntityGraph,
    options: &VersionOptions,
    is_taken: impl Fn(&NodeRecord) -> bool,
) -> RevisionPlan {
    let changes = diff_graphs_with(old, new, options);
    let mut to_mint = HashSet::new();
    for record in new.records() {
        let added = changes.added.contains(&record.lineage_id);
        let mint = if added {
            is_taken(record)
        } else {
            options.force || changes.is_reversioned(record.lineage_id)
        };
        if mint {
            to_mint.insert(record.entity_id);
        }
    }
    RevisionPlan { changes, to_mint }
}

/// Mint new ids in the live tree for every planned node.
///
/// Repeated inline copies of one version all receive the same new id.
pub fn apply_plan(live: &mut Entity, plan: &RevisionPlan) -> HashMap<EntityId, EntityId> {
    let mut minted: HashMap<EntityId, EntityId> = HashMap::new();
    live.walk_mut(&mut |entity| {
        let old = entity.entity_id();
        if !plan.to_mint.contains(&old) {
            return;
        }
        let new = *minted.entry(old).or_insert_with(EntityId::new);
        entity.mint_as(new);
    });
    minted
}

/// Version a live tree against its stored graph.
///
/// Returns `None` when nothing changed and no versioning was forced; the live
/// tree is left untouched in that case. Otherwise the live tree is minted in
/// place and the rebuilt graph is returned.
pub fn revise(
    live: &mut Entity,
    stored: &EntityGraph,
    builder: &GraphBuilder,
    options: &VersionOptions,
    is_taken: impl Fn(&NodeRecord) -> bool,
) -> Result<Option<Revision>> {
    let current = builder.build(live)?;
    let plan = plan_revision(stored, &current, options, is_taken);
    if plan.is_noop() {
        debug!(root_id = %stored.root_id(), "No changes to version");
        return Ok(None);
    }

    let minted = apply_plan(live, &plan);
    let graph = builder.build(live)?;
    Ok(Some(Revision {
        graph,
        previous_root: Some(stored.root_id()),
        changes: plan.changes,
        minted,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::build_entity_graph;
    use crate::schema::{EntitySchema, ValueKind};
    use std::sync::Arc;

    fn leaf() -> Arc<EntitySchema> {
        EntitySchema::new("Leaf").field("name", ValueKind::Scalar).build()
    }

    fn parent() -> Arc<EntitySchema> {
        EntitySchema::new("Parent")
            .field("name", ValueKind::Scalar)
            .field("kids", ValueKind::EntitySequence)
            .optional("watch", ValueKind::Reference)
            .build()
    }

    fn family() -> Entity {
        let mut root = Entity::new(parent()).with("name", "root").unwrap();
        let mut mid = Entity::new(parent()).with("name", "mid").unwrap();
        mid.set("kids", vec![Entity::new(leaf()).with("name", "x").unwrap()])
            .unwrap();
        let sibling = Entity::new(leaf()).with("name", "y").unwrap();
        root.set("kids", vec![mid, sibling]).unwrap();
        root
    }

    fn never_taken(_: &NodeRecord) -> bool {
        false
    }

    #[test]
    fn test_no_changes() {
        let mut root = family();
        let old = build_entity_graph(&mut root).unwrap();
        let new = build_entity_graph(&mut root).unwrap();
        assert!(diff_graphs(&old, &new).is_empty());
    }

    #[test]
    fn test_leaf_change_propagates_to_root_only() {
        let mut root = family();
        let old = build_entity_graph(&mut root).unwrap();
        let mid = &mut root.items_mut("kids").unwrap()[0];
        let mid_lineage = mid.lineage_id();
        let leaf = &mut mid.items_mut("kids").unwrap()[0];
        let leaf_lineage = leaf.lineage_id();
        leaf.set("name", "changed").unwrap();
        let sibling_lineage = root.items("kids").unwrap()[1].lineage_id();

        let new = build_entity_graph(&mut root).unwrap();
        let changes = diff_graphs(&old, &new);
        assert_eq!(changes.modified, vec![leaf_lineage]);
        assert_eq!(changes.propagated, vec![root.lineage_id(), mid_lineage]);
        assert!(!changes.is_reversioned(sibling_lineage));
    }

    #[test]
    fn test_added_and_removed() {
        let mut root = family();
        let old = build_entity_graph(&mut root).unwrap();
        let removed = root.items_mut("kids").unwrap().pop().unwrap();
        let added = Entity::new(leaf());
        let added_lineage = added.lineage_id();
        root.items_mut("kids").unwrap().push(added);

        let new = build_entity_graph(&mut root).unwrap();
        let changes = diff_graphs(&old, &new);
        assert_eq!(changes.added, vec![added_lineage]);
        assert_eq!(changes.removed, vec![removed.lineage_id()]);
        assert_eq!(changes.modified, vec![root.lineage_id()]);
    }

    #[test]
    fn test_reorder_modifies_container_only() {
        let mut root = family();
        let old = build_entity_graph(&mut root).unwrap();
        root.items_mut("kids").unwrap().reverse();

        let new = build_entity_graph(&mut root).unwrap();
        let changes = diff_graphs(&old, &new);
        assert_eq!(changes.modified, vec![root.lineage_id()]);
        assert!(changes.moved.is_empty());
        assert!(changes.propagated.is_empty());
    }

    #[test]
    fn test_move_between_parents() {
        let mut root = family();
        let old = build_entity_graph(&mut root).unwrap();
        let sibling = root.items_mut("kids").unwrap().pop().unwrap();
        let moved = sibling.lineage_id();
        root.items_mut("kids").unwrap()[0]
            .items_mut("kids")
            .unwrap()
            .push(sibling);

        let new = build_entity_graph(&mut root).unwrap();
        let changes = diff_graphs(&old, &new);
        assert_eq!(changes.moved, vec![moved]);

        let untracked = VersionOptions {
            track_moves: false,
            ..VersionOptions::default()
        };
        assert!(diff_graphs_with(&old, &new, &untracked).moved.is_empty());
    }

    #[test]
    fn test_reference_change_does_not_propagate_to_target() {
        let mut root = family();
        let target = root.items("kids").unwrap()[1].reference();
        let old = build_entity_graph(&mut root).unwrap();
        root.set("watch", target).unwrap();

        let new = build_entity_graph(&mut root).unwrap();
        let changes = diff_graphs(&old, &new);
        assert_eq!(changes.modified, vec![root.lineage_id()]);
        assert!(!changes.is_reversioned(target.lineage_id));
    }

    #[test]
    fn test_revise_mints_changed_path() {
        let mut root = family();
        let stored = build_entity_graph(&mut root).unwrap();
        let old_root = root.entity_id();
        let sibling = root.items("kids").unwrap()[1].entity_id();
        root.items_mut("kids").unwrap()[0].set("name", "mid2").unwrap();

        let revision = revise(
            &mut root,
            &stored,
            &GraphBuilder::new(),
            &VersionOptions::default(),
            never_taken,
        )
        .unwrap()
        .unwrap();

        assert_ne!(root.entity_id(), old_root);
        assert_eq!(root.previous_id(), Some(old_root));
        assert_eq!(revision.previous_root, Some(old_root));
        assert_eq!(revision.root_id(), root.entity_id());
        assert_eq!(revision.minted.len(), 2);
        assert_eq!(root.items("kids").unwrap()[1].entity_id(), sibling);
        assert_eq!(
            root.items("kids").unwrap()[0].items("kids").unwrap()[0].root_id(),
            root.entity_id()
        );
    }

    #[test]
    fn test_revise_without_changes_is_none() {
        let mut root = family();
        let stored = build_entity_graph(&mut root).unwrap();
        let before = root.entity_id();
        let result = revise(
            &mut root,
            &stored,
            &GraphBuilder::new(),
            &VersionOptions::default(),
            never_taken,
        )
        .unwrap();
        assert!(result.is_none());
        assert_eq!(root.entity_id(), before);
    }

    #[test]
    fn test_forced_revision_mints_everything() {
        let mut root = family();
        let stored = build_entity_graph(&mut root).unwrap();
        let revision = revise(
            &mut root,
            &stored,
            &GraphBuilder::new(),
            &VersionOptions::forced(),
            never_taken,
        )
        .unwrap()
        .unwrap();
        assert_eq!(revision.minted.len(), stored.node_count());
        assert!(revision
            .graph
            .entity_ids()
            .iter()
            .all(|id| !stored.contains(*id)));
    }

    #[test]
    fn test_added_node_keeps_id_unless_taken() {
        let mut root = family();
        let stored = build_entity_graph(&mut root).unwrap();
        let added = Entity::new(leaf());
        let added_id = added.entity_id();
        root.items_mut("kids").unwrap().push(added);
        let current = build_entity_graph(&mut root).unwrap();

        let plan = plan_revision(&stored, &current, &VersionOptions::default(), never_taken);
        assert!(!plan.to_mint.contains(&added_id));
        assert!(plan.to_mint.contains(&root.entity_id()));

        let plan = plan_revision(&stored, &current, &VersionOptions::default(), |r| {
            r.entity_id == added_id
        });
        assert!(plan.to_mint.contains(&added_id));
    }

    #[test]
    fn test_apply_plan_gives_repeated_copies_one_id() {
        let shared = Entity::new(leaf());
        let shared_id = shared.entity_id();
        let mut root = Entity::new(parent());
        root.set("kids", vec![shared.clone(), shared]).unwrap();

        let plan = RevisionPlan {
            changes: ChangeSet::default(),
            to_mint: [shared_id].into_iter().collect(),
        };
        let minted = apply_plan(&mut root, &plan);
        let kids = root.items("kids").unwrap();
        assert_eq!(kids[0].entity_id(), minted[&shared_id]);
        assert_eq!(kids[1].entity_id(), minted[&shared_id]);
        build_entity_graph(&mut root).unwrap();
    }

    /// root -> [a -> [x], b -> [copy of x]]
    fn shared_copy() -> Entity {
        let x = Entity::new(leaf()).with("name", "x").unwrap();
        let a = Entity::new(parent()).with("kids", vec![x.clone()]).unwrap();
        let b = Entity::new(parent()).with("kids", vec![x]).unwrap();
        Entity::new(parent()).with("kids", vec![a, b]).unwrap()
    }

    fn rename_x(root: &mut Entity, name: &str) {
        for holder in root.items_mut("kids").unwrap() {
            holder.items_mut("kids").unwrap()[0].set("name", name).unwrap();
        }
    }

    #[test]
    fn test_holder_of_embedded_copy_is_propagated() {
        let mut root = shared_copy();
        let stored = build_entity_graph(&mut root).unwrap();
        let a = root.items("kids").unwrap()[0].lineage_id();
        let b = root.items("kids").unwrap()[1].lineage_id();
        let b_id = root.items("kids").unwrap()[1].entity_id();
        rename_x(&mut root, "x2");

        let revision = revise(
            &mut root,
            &stored,
            &GraphBuilder::new(),
            &VersionOptions::default(),
            never_taken,
        )
        .unwrap()
        .unwrap();

        assert_eq!(revision.changes.propagated, vec![root.lineage_id(), a, b]);
        let kids = root.items("kids").unwrap();
        assert_ne!(kids[1].entity_id(), b_id);
        assert_eq!(
            kids[0].items("kids").unwrap()[0].entity_id(),
            kids[1].items("kids").unwrap()[0].entity_id()
        );
    }

    #[test]
    fn test_edge_changes_report_kind_swaps() {
        let mut root = shared_copy();
        let old = build_entity_graph(&mut root).unwrap();
        let x = root.items("kids").unwrap()[0].items("kids").unwrap()[0].lineage_id();
        root.items_mut("kids").unwrap().reverse();

        let new = build_entity_graph(&mut root).unwrap();
        let changes = diff_graphs(&old, &new);
        assert_eq!(changes.moved, vec![x]);

        let swaps = &changes.edges.kind_changed;
        assert_eq!(swaps.len(), 2);
        assert!(swaps.iter().all(|c| c.edge.target == x));
        assert!(swaps
            .iter()
            .any(|c| c.previous == EdgeKind::Reference && c.edge.kind == EdgeKind::Ownership));
        // root's two ownership edges changed slot
        assert_eq!(changes.edges.added.len(), 2);
        assert_eq!(changes.edges.removed.len(), 2);
    }

    #[test]
    fn test_initial_changes_add_everything() {
        let mut root = family();
        let graph = build_entity_graph(&mut root).unwrap();
        let changes = initial_changes(&graph);
        assert_eq!(changes.added.len(), graph.node_count());
        assert_eq!(changes.edges.added.len(), graph.edge_count());
        assert!(changes.propagated.is_empty());
        assert!(changes.edges.removed.is_empty());
    }
}
