//! Entity Registry
//!
//! In-process, append-only store of entity graphs. Every registered graph is
//! kept as an immutable snapshot under its root `entity_id`; node records are
//! shared by `Arc` between snapshots, so an unchanged entity is stored once no
//! matter how many versions of its root include it.
//!
//! Everything handed back to callers is built fresh from the stored records:
//! mutating a returned [`Entity`] can never reach the registry's own state.
//!
//! Revisions are serialized per root lineage: each lineage has its own mutex,
//! so unrelated graphs version concurrently, while the store itself sits
//! behind a read-write lock that is held only for short copy or commit steps.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::RegistryConfig;
use crate::entity::Entity;
use crate::error::{EntityError, Result, StructuralFault};
use crate::graph::{validate, EntityGraph, GraphBuilder, NodeRecord};
use crate::ids::{EntityId, LineageId};
use crate::version::{diff_graphs_with, initial_changes, revise, ChangeSet, Revision, VersionOptions};

/// Registry counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStatus {
    /// Registered graph snapshots (one per root version)
    pub snapshots: usize,
    /// Distinct entity versions stored
    pub records: usize,
    /// Distinct lineages seen
    pub lineages: usize,
    /// Distinct entity types seen
    pub types: usize,
}

/// One registered version of a root, as recorded in its lineage's log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionEntry {
    pub root_id: EntityId,
    /// Root this version superseded; `None` for the first version
    pub previous_root: Option<EntityId>,
    pub registered_at: DateTime<Utc>,
    pub changes: ChangeSet,
}

#[derive(Debug, Default)]
struct Store {
    /// All stored versions, by entity_id
    records: HashMap<EntityId, Arc<NodeRecord>>,
    /// Registered graphs, by root entity_id
    snapshots: HashMap<EntityId, Arc<EntityGraph>>,
    /// Versions of each lineage, oldest first
    histories: HashMap<LineageId, Vec<EntityId>>,
    /// Latest registered root, by root lineage
    latest_roots: HashMap<LineageId, EntityId>,
    /// Lineages by type name, in registration order
    types: HashMap<String, Vec<LineageId>>,
    /// Registered versions of each root lineage, oldest first
    revisions: HashMap<LineageId, Vec<RevisionEntry>>,
    /// Superseded root, by root entity_id
    parents: HashMap<EntityId, EntityId>,
}

/// The entity registry
pub struct Registry {
    store: RwLock<Store>,
    /// One exclusive lock per root lineage
    locks: DashMap<LineageId, Arc<Mutex<()>>>,
    config: RegistryConfig,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Create an empty registry with default configuration
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    pub fn with_config(config: RegistryConfig) -> Self {
        Self {
            store: RwLock::new(Store::default()),
            locks: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn builder(&self) -> GraphBuilder {
        self.config.graph_builder()
    }

    fn lineage_lock(&self, lineage_id: LineageId) -> Arc<Mutex<()>> {
        self.locks.entry(lineage_id).or_default().clone()
    }

    // ========== Registration ==========

    /// Store every node of `graph` as one unit.
    ///
    /// Nothing is stored unless the whole graph passes validation and no
    /// node collides with a different stored version of the same id.
    pub fn register_entity_graph(&self, graph: &EntityGraph) -> Result<()> {
        let lock = self.lineage_lock(graph.lineage_id());
        let _guard = lock.lock();
        self.commit(graph, None, None).map(|_| ())
    }

    /// Build the graph of a root entity and register it
    pub fn register_entity(&self, root: &mut Entity) -> Result<EntityGraph> {
        ensure_root(root)?;
        let lock = self.lineage_lock(root.lineage_id());
        let _guard = lock.lock();
        let backup = root.clone();
        let result = self
            .builder()
            .build(root)
            .and_then(|graph| self.commit(&graph, None, None).map(|_| graph));
        if result.is_err() {
            *root = backup;
        }
        result
    }

    /// Store `graph` and append it to its root lineage's revision log.
    ///
    /// `changes` is computed against the latest stored root when not given.
    /// Caller must hold the lineage lock of `graph`'s root.
    fn commit(
        &self,
        graph: &EntityGraph,
        expected_latest: Option<EntityId>,
        changes: Option<ChangeSet>,
    ) -> Result<ChangeSet> {
        validate(graph)?;
        let root_id = graph.root_id();
        let lineage_id = graph.lineage_id();

        let mut store = self.store.write();
        if store.snapshots.contains_key(&root_id) {
            warn!(target: "entities::registry", root_id = %root_id, "Graph already registered");
            return Err(EntityError::DuplicateIdentity {
                entity_id: root_id,
                lineage_id,
            });
        }
        if let Some(expected) = expected_latest {
            let actual = store.latest_roots.get(&lineage_id).copied();
            if actual != Some(expected) {
                warn!(target: "entities::registry", lineage_id = %lineage_id, "Revision lost a race");
                return Err(EntityError::ConcurrentModification {
                    lineage_id,
                    expected,
                    actual: actual.unwrap_or(root_id),
                });
            }
        }
        for record in graph.records() {
            if let Some(existing) = store.records.get(&record.entity_id) {
                if existing.checksum() != record.checksum() {
                    warn!(
                        target: "entities::registry",
                        entity_id = %record.entity_id,
                        lineage_id = %record.lineage_id,
                        "Entity id already stored with different content"
                    );
                    return Err(EntityError::DuplicateIdentity {
                        entity_id: record.entity_id,
                        lineage_id: record.lineage_id,
                    });
                }
            }
        }

        let previous_root = store.latest_roots.get(&lineage_id).copied();
        let changes = match (changes, previous_root.and_then(|id| store.snapshots.get(&id))) {
            (Some(changes), _) => changes,
            (None, Some(previous)) => {
                diff_graphs_with(previous, graph, &self.config.version_options())
            }
            (None, None) => initial_changes(graph),
        };

        // Validated; from here on nothing can fail
        let mut snapshot = graph.clone();
        let mut stored = 0usize;
        for record in graph.records() {
            let id = record.entity_id;
            if let Some(existing) = store.records.get(&id).cloned() {
                snapshot.records.insert(id, existing);
                continue;
            }
            store.records.insert(id, Arc::clone(record));
            store.histories.entry(record.lineage_id).or_default().push(id);
            let lineages = store
                .types
                .entry(record.type_name().to_string())
                .or_default();
            if !lineages.contains(&record.lineage_id) {
                lineages.push(record.lineage_id);
            }
            stored += 1;
        }
        store.snapshots.insert(root_id, Arc::new(snapshot));
        store.latest_roots.insert(lineage_id, root_id);
        if let Some(previous) = previous_root {
            store.parents.insert(root_id, previous);
        }
        store.revisions.entry(lineage_id).or_default().push(RevisionEntry {
            root_id,
            previous_root,
            registered_at: Utc::now(),
            changes: changes.clone(),
        });

        info!(
            target: "entities::registry",
            root_id = %root_id,
            lineage_id = %lineage_id,
            nodes = graph.node_count(),
            new_records = stored,
            "Registered entity graph"
        );
        Ok(changes)
    }

    // ========== Lookups ==========

    fn snapshot(&self, root_id: EntityId) -> Result<Arc<EntityGraph>> {
        self.store
            .read()
            .snapshots
            .get(&root_id)
            .cloned()
            .ok_or(EntityError::GraphNotFound { root_id })
    }

    /// Independent copy of a stored entity as it appears in graph `root_id`
    pub fn get_stored_entity(&self, entity_id: EntityId, root_id: EntityId) -> Result<Entity> {
        let not_found = || EntityError::EntityNotFound { entity_id, root_id };
        let snapshot = self.snapshot(root_id).map_err(|_| not_found())?;
        if !snapshot.contains(entity_id) {
            return Err(not_found());
        }
        if self.config.registry.verify_on_read {
            for record in snapshot.records() {
                let in_subtree = record.entity_id == entity_id
                    || snapshot
                        .ancestry_path(record.entity_id)
                        .is_some_and(|path| path.contains(&entity_id));
                if in_subtree {
                    record.verify()?;
                }
            }
        }
        snapshot.entity(entity_id).ok_or_else(not_found)
    }

    /// Independent copy of a registered graph
    pub fn get_stored_graph(&self, root_id: EntityId) -> Result<EntityGraph> {
        Ok(self.snapshot(root_id)?.as_ref().clone())
    }

    /// All versions of a lineage, oldest first
    pub fn get_lineage_history(&self, lineage_id: LineageId) -> Result<Vec<EntityId>> {
        self.store
            .read()
            .histories
            .get(&lineage_id)
            .cloned()
            .ok_or(EntityError::LineageNotFound { lineage_id })
    }

    /// Newest version of a lineage
    pub fn latest_version(&self, lineage_id: LineageId) -> Result<EntityId> {
        self.store
            .read()
            .histories
            .get(&lineage_id)
            .and_then(|h| h.last().copied())
            .ok_or(EntityError::LineageNotFound { lineage_id })
    }

    /// Newest registered root of a root lineage
    pub fn latest_root(&self, lineage_id: LineageId) -> Result<EntityId> {
        self.store
            .read()
            .latest_roots
            .get(&lineage_id)
            .copied()
            .ok_or(EntityError::LineageNotFound { lineage_id })
    }

    /// Lineages that have stored versions of the given type
    pub fn lineages_of_type(&self, type_name: &str) -> Vec<LineageId> {
        self.store
            .read()
            .types
            .get(type_name)
            .cloned()
            .unwrap_or_default()
    }

    /// Registered versions of a root lineage, oldest first
    pub fn get_revision_log(&self, lineage_id: LineageId) -> Result<Vec<RevisionEntry>> {
        self.store
            .read()
            .revisions
            .get(&lineage_id)
            .cloned()
            .ok_or(EntityError::LineageNotFound { lineage_id })
    }

    /// Most recent registered root that both `a` and `b` descend from
    /// (either may be the other's ancestor). `None` for unrelated roots.
    pub fn common_ancestor(&self, a: EntityId, b: EntityId) -> Result<Option<EntityId>> {
        let store = self.store.read();
        for root_id in [a, b] {
            if !store.snapshots.contains_key(&root_id) {
                return Err(EntityError::GraphNotFound { root_id });
            }
        }
        let parents = &store.parents;
        let chain = |start: EntityId| {
            std::iter::successors(Some(start), move |id| parents.get(id).copied())
        };
        let ancestors_of_a: HashSet<EntityId> = chain(a).collect();
        Ok(chain(b).find(|id| ancestors_of_a.contains(id)))
    }

    pub fn contains_root(&self, root_id: EntityId) -> bool {
        self.store.read().snapshots.contains_key(&root_id)
    }

    pub fn contains_entity(&self, entity_id: EntityId) -> bool {
        self.store.read().records.contains_key(&entity_id)
    }

    pub fn status(&self) -> RegistryStatus {
        let store = self.store.read();
        RegistryStatus {
            snapshots: store.snapshots.len(),
            records: store.records.len(),
            lineages: store.histories.len(),
            types: store.types.len(),
        }
    }

    // ========== Versioning ==========

    /// Version a live root with the configured options and return the new graph
    pub fn version_entity(&self, root: &mut Entity) -> Result<EntityGraph> {
        let options = self.config.version_options();
        Ok(self.version_entity_with(root, options)?.graph)
    }

    /// Version a live root against its latest stored graph.
    ///
    /// A root that was never registered is registered as its first version.
    /// On success the live tree carries the new identities; on failure it is
    /// left exactly as it was.
    pub fn version_entity_with(&self, root: &mut Entity, options: VersionOptions) -> Result<Revision> {
        ensure_root(root)?;
        let lineage_id = root.lineage_id();
        let lock = self.lineage_lock(lineage_id);
        let _guard = lock.lock();
        let backup = root.clone();

        let latest = self.store.read().latest_roots.get(&lineage_id).copied();
        let Some(latest) = latest else {
            let result = self.builder().build(root).and_then(|graph| {
                let changes = self.commit(&graph, None, None)?;
                Ok(Revision {
                    graph,
                    previous_root: None,
                    changes,
                    minted: HashMap::new(),
                })
            });
            if result.is_err() {
                *root = backup;
            }
            return result;
        };
        if latest != root.entity_id() {
            warn!(
                target: "entities::registry",
                lineage_id = %lineage_id,
                expected = %root.entity_id(),
                actual = %latest,
                "Revision of a stale root"
            );
            return Err(EntityError::ConcurrentModification {
                lineage_id,
                expected: root.entity_id(),
                actual: latest,
            });
        }

        let stored = self.snapshot(latest)?;
        let is_taken = |record: &NodeRecord| {
            self.store
                .read()
                .records
                .get(&record.entity_id)
                .is_some_and(|r| r.checksum() != record.checksum())
        };

        let result = revise(root, &stored, &self.builder(), &options, is_taken).and_then(|rev| match rev {
            Some(rev) => self
                .commit(&rev.graph, Some(latest), Some(rev.changes.clone()))
                .map(|_| rev),
            None => Ok(Revision {
                graph: stored.as_ref().clone(),
                previous_root: Some(latest),
                changes: ChangeSet::default(),
                minted: HashMap::new(),
            }),
        });

        match result {
            Ok(rev) => {
                if rev.is_noop() {
                    debug!(target: "entities::registry", root_id = %latest, "Nothing to version");
                } else {
                    info!(
                        target: "entities::registry",
                        lineage_id = %lineage_id,
                        previous_root = %latest,
                        root_id = %rev.root_id(),
                        minted = rev.minted.len(),
                        "Versioned entity graph"
                    );
                }
                Ok(rev)
            }
            Err(e) => {
                *root = backup;
                Err(e)
            }
        }
    }

    /// Make a detached entity the root of its own graph and register it.
    ///
    /// A non-root entity is minted a new id first, so the version stored
    /// inside its former parent's graph stays untouched. A root is registered
    /// if needed, otherwise its stored graph is returned.
    pub fn promote_to_root(&self, entity: &mut Entity) -> Result<EntityGraph> {
        let lock = self.lineage_lock(entity.lineage_id());
        let _guard = lock.lock();

        if entity.is_root() {
            if let Ok(existing) = self.snapshot(entity.entity_id()) {
                return Ok(existing.as_ref().clone());
            }
            let backup = entity.clone();
            let result = self
                .builder()
                .build(entity)
                .and_then(|graph| self.commit(&graph, None, None).map(|_| graph));
            if result.is_err() {
                *entity = backup;
            }
            return result;
        }

        let backup = entity.clone();
        let former_root = entity.root_id();
        let new_id = entity.mint();
        entity.set_root_id(new_id);
        let result = self
            .builder()
            .build(entity)
            .and_then(|graph| self.commit(&graph, None, None).map(|_| graph));
        match result {
            Ok(graph) => {
                info!(
                    target: "entities::registry",
                    entity_id = %new_id,
                    former_root = %former_root,
                    "Promoted entity to root"
                );
                Ok(graph)
            }
            Err(e) => {
                *entity = backup;
                Err(e)
            }
        }
    }
}

fn ensure_root(entity: &Entity) -> Result<()> {
    if entity.is_root() {
        Ok(())
    } else {
        Err(entity.fault(StructuralFault::NotARoot {
            root_id: entity.root_id(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{EntitySchema, ValueKind};

    fn leaf() -> Arc<EntitySchema> {
        EntitySchema::new("Leaf").field("name", ValueKind::Scalar).build()
    }

    fn parent() -> Arc<EntitySchema> {
        EntitySchema::new("Parent")
            .field("kids", ValueKind::EntitySequence)
            .build()
    }

    fn tree() -> Entity {
        let mut root = Entity::new(parent());
        root.set(
            "kids",
            vec![
                Entity::new(leaf()).with("name", "a").unwrap(),
                Entity::new(leaf()).with("name", "b").unwrap(),
            ],
        )
        .unwrap();
        root
    }

    #[test]
    fn test_register_and_status() {
        let registry = Registry::new();
        let mut root = tree();
        registry.register_entity(&mut root).unwrap();

        assert!(registry.contains_root(root.entity_id()));
        assert_eq!(
            registry.status(),
            RegistryStatus {
                snapshots: 1,
                records: 3,
                lineages: 3,
                types: 2,
            }
        );
        assert_eq!(registry.lineages_of_type("Leaf").len(), 2);
        assert!(registry.lineages_of_type("Missing").is_empty());
    }

    #[test]
    fn test_register_non_root_rejected() {
        let registry = Registry::new();
        let mut root = tree();
        registry.register_entity(&mut root).unwrap();
        let mut child = registry
            .get_stored_entity(root.items("kids").unwrap()[0].entity_id(), root.entity_id())
            .unwrap();
        let err = registry.register_entity(&mut child).unwrap_err();
        assert!(matches!(err.fault(), Some(StructuralFault::NotARoot { .. })));
    }

    #[test]
    fn test_versioning_shares_unchanged_records() {
        let registry = Registry::new();
        let mut root = tree();
        registry.register_entity(&mut root).unwrap();
        root.items_mut("kids").unwrap()[0].set("name", "a2").unwrap();
        registry.version_entity(&mut root).unwrap();

        // two new versions (root and a), b shared
        assert_eq!(registry.status().records, 5);
        assert_eq!(registry.status().snapshots, 2);
    }

    #[test]
    fn test_failed_revision_restores_live_tree() {
        let registry = Registry::new();
        let mut root = tree();
        registry.register_entity(&mut root).unwrap();
        let before = root.entity_id();

        // an undeclared kind sneaks in through raw access
        *root.get_mut("kids").unwrap() = crate::entity::FieldValue::from("broken");
        let err = registry.version_entity(&mut root).unwrap_err();
        assert!(err.fault().is_some());
        assert_eq!(root.entity_id(), before);
        assert_eq!(registry.status().snapshots, 1);
    }
}
