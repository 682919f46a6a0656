//! Error types for entity graphs and the registry

use thiserror::Error;

use crate::ids::{EntityId, LineageId};
use crate::schema::ValueKind;

/// Result type for entity operations
pub type Result<T> = std::result::Result<T, EntityError>;

/// Entity and registry errors
#[derive(Error, Debug)]
pub enum EntityError {
    #[error("Structural error on entity {entity_id} (lineage {lineage_id}): {fault}")]
    Structural {
        entity_id: EntityId,
        lineage_id: LineageId,
        fault: StructuralFault,
    },

    #[error("Entity not found: {entity_id} in graph {root_id}")]
    EntityNotFound { entity_id: EntityId, root_id: EntityId },

    #[error("Graph not found: {root_id}")]
    GraphNotFound { root_id: EntityId },

    #[error("Lineage not found: {lineage_id}")]
    LineageNotFound { lineage_id: LineageId },

    #[error("Unknown entity type: {type_name}")]
    UnknownType { type_name: String },

    #[error("Duplicate identity: entity {entity_id} (lineage {lineage_id}) is already registered")]
    DuplicateIdentity { entity_id: EntityId, lineage_id: LineageId },

    #[error("Concurrent modification of lineage {lineage_id}: revision based on {expected}, latest is {actual}")]
    ConcurrentModification {
        lineage_id: LineageId,
        expected: EntityId,
        actual: EntityId,
    },

    #[error("Checksum mismatch for entity {entity_id}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        entity_id: EntityId,
        expected: String,
        actual: String,
    },

    #[error("Invalid schema '{type_name}': {reason}")]
    InvalidSchema { type_name: String, reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EntityError {
    pub(crate) fn structural(entity_id: EntityId, lineage_id: LineageId, fault: StructuralFault) -> Self {
        Self::Structural { entity_id, lineage_id, fault }
    }

    /// True for lookups of identities the registry has never seen.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::EntityNotFound { .. }
                | Self::GraphNotFound { .. }
                | Self::LineageNotFound { .. }
                | Self::UnknownType { .. }
        )
    }

    /// True when re-reading the latest stored graph and retrying can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrentModification { .. })
    }

    /// The structural fault, if this is a structural error.
    pub fn fault(&self) -> Option<&StructuralFault> {
        match self {
            Self::Structural { fault, .. } => Some(fault),
            _ => None,
        }
    }
}

/// What exactly is wrong with the shape of an entity or graph
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StructuralFault {
    #[error("field '{field}' is declared {expected} but holds {found}")]
    KindMismatch {
        field: String,
        expected: ValueKind,
        found: &'static str,
    },

    #[error("field '{field}' holds a non-finite float")]
    NonFiniteFloat { field: String },

    #[error("field '{field}' is declared more than once by type '{type_name}'")]
    DuplicateField { field: String, type_name: String },

    #[error("required field '{field}' is missing")]
    MissingField { field: String },

    #[error("field '{field}' is not declared by type '{type_name}'")]
    UndeclaredField { field: String, type_name: String },

    #[error("ownership cycle through entity {0}")]
    OwnershipCycle(EntityId),

    #[error("entity {0} appears twice inline with different content")]
    ConflictingCopies(EntityId),

    #[error("lineage is shared by entities {first} and {second}")]
    DuplicateLineage { first: EntityId, second: EntityId },

    #[error("entity {0} has more than one owner")]
    MultipleOwners(EntityId),

    #[error("entity is not a root (root_id {root_id})")]
    NotARoot { root_id: EntityId },

    #[error("entity root_id {found} does not match graph root {expected}")]
    RootMismatch { expected: EntityId, found: EntityId },

    #[error("ownership depth exceeds limit of {0}")]
    DepthExceeded(usize),

    #[error("edges do not match the rebuilt graph: {0}")]
    EdgeMismatch(String),
}
