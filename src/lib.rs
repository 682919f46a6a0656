//! Versioned Entities
//!
//! Git-like versioning over graphs of structured records. An entity carries
//! a per-version `entity_id`, the `root_id` of the graph it belongs to and a
//! `lineage_id` shared by all of its versions. Whenever anything in a graph
//! changes, the changed entities and every owner above them are minted new
//! ids; everything else keeps its identity and is shared between versions.
//!
//! ## Features
//!
//! - **Graph Discovery**: one pass over a root's fields separates ownership
//!   edges from reference edges and rejects ownership cycles
//! - **Minimal Re-versioning**: lineage-matched diffs with upward propagation
//! - **Isolated Registry**: every read returns an independent value
//! - **Checksum Validation**: SHA256 checksums guard stored records
//! - **Per-Lineage Locking**: unrelated graphs version concurrently
//!
//! ## Architecture
//!
//! ```text
//! Entity (live tree, &mut)
//!   │ build_entity_graph
//!   ▼
//! EntityGraph ── arena of Arc<NodeRecord> + DiGraph<EntityId, EntityEdge>
//!   │ diff_graphs / plan_revision
//!   ▼
//! Registry ── snapshots by root, lineage histories, shared records
//! ```

pub mod checksum;
pub mod codec;
pub mod config;
pub mod entity;
pub mod error;
pub mod graph;
pub mod ids;
pub mod registry;
pub mod schema;
pub mod version;

pub use checksum::Checksum;
pub use codec::{
    decode, decode_graph, decode_graph_with, encode, encode_graph, EntityDocument,
    FieldDocument, GraphDocument,
};
pub use config::RegistryConfig;
pub use entity::{Entity, EntityRef, FieldValue, Scalar, Slot};
pub use error::{EntityError, Result, StructuralFault};
pub use graph::{
    build_entity_graph, EdgeKind, EntityEdge, EntityGraph, ExportFormat, GraphBuilder,
    NodeRecord, StoredValue,
};
pub use ids::{EntityId, LineageId};
pub use registry::{Registry, RegistryStatus, RevisionEntry};
pub use schema::{EntitySchema, FieldDecl, SchemaCatalog, ValueKind};
pub use version::{
    diff_graphs, ChangeSet, EdgeChange, EdgeChanges, EdgeKindChange, Revision, VersionOptions,
};
