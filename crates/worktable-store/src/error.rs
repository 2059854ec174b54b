//! Store error type.

use worktable_types::DocumentId;

/// Errors from the store's watch and mutation primitives.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("unknown collection `{0}`")]
    UnknownCollection(String),

    #[error("permission denied on collection `{0}`")]
    PermissionDenied(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("document {id} not found in `{collection}`")]
    NotFound { collection: String, id: DocumentId },

    #[error("store closed")]
    Closed,
}

impl StoreError {
    /// Whether the store refused the request itself (as opposed to being
    /// unreachable). Refusals are not worth retrying unchanged.
    pub fn is_refusal(&self) -> bool {
        !matches!(self, StoreError::Closed)
    }
}
