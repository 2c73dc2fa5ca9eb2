//! Error taxonomy for coordinator writes.
//!
//! Validation failures are rejected at the point of the offending write and
//! never coerced. They travel inside `anyhow::Error`; callers that need to
//! branch on them use [`CoordinatorError::find`].

use thiserror::Error;

use crate::models::{IndexId, NamespaceId, ProjectId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    /// Namespace is unknown or is not a root namespace.
    #[error("namespace {0} is not a root namespace")]
    InvalidNamespace(NamespaceId),

    /// A dependent record points at a different root namespace.
    #[error("namespace mismatch: expected root namespace {expected}, got {actual}")]
    NamespaceMismatch {
        expected: NamespaceId,
        actual: NamespaceId,
    },

    /// Composite uniqueness on `(index_id, project_identifier)` was violated.
    #[error("repository for project {project_identifier} already exists in index {index_id}")]
    DuplicateRepository {
        index_id: IndexId,
        project_identifier: ProjectId,
    },

    /// Malformed input such as a heartbeat missing required fields.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
}

impl CoordinatorError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Find a `CoordinatorError` anywhere in an `anyhow` error chain.
    pub fn find(err: &anyhow::Error) -> Option<&CoordinatorError> {
        err.chain().find_map(|e| e.downcast_ref::<CoordinatorError>())
    }

    /// True for the write-time validation class (HTTP 422 territory).
    pub fn is_validation(&self) -> bool {
        !matches!(self, Self::NotFound { .. })
    }
}
