use common::id::IdError;
use common::store::StoreError;

/// Error types that can occur during impact analysis, cascade execution and
/// restore
#[derive(Debug, thiserror::Error)]
pub enum CascadeError {
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(#[from] IdError),

    #[error("{kind} '{id}' not found")]
    EntityNotFound { kind: String, id: String },

    #[error("Unknown entity kind '{0}'")]
    UnknownEntityKind(String),

    #[error("Cascade for '{entity_id}' failed: {cause}")]
    CascadeFailed { entity_id: String, cause: String },

    #[error("Audit record '{0}' not found")]
    AuditNotFound(String),

    #[error("Snapshot for audit record '{0}' is missing")]
    SnapshotMissing(String),

    #[error("Snapshot '{0}' has expired")]
    SnapshotExpired(String),

    #[error("Snapshot '{0}' was already used")]
    SnapshotAlreadyUsed(String),

    #[error("Hard delete requires a valid confirmation")]
    ConfirmationRequired,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl CascadeError {
    /// Stable machine-readable name, used in API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            CascadeError::InvalidIdentifier(_) => "InvalidIdentifier",
            CascadeError::EntityNotFound { .. } => "EntityNotFound",
            CascadeError::UnknownEntityKind(_) => "UnknownEntityKind",
            CascadeError::CascadeFailed { .. } => "CascadeFailed",
            CascadeError::AuditNotFound(_) => "AuditNotFound",
            CascadeError::SnapshotMissing(_) => "SnapshotMissing",
            CascadeError::SnapshotExpired(_) => "SnapshotExpired",
            CascadeError::SnapshotAlreadyUsed(_) => "SnapshotAlreadyUsed",
            CascadeError::ConfirmationRequired => "ConfirmationRequired",
            CascadeError::Store(_) => "StoreError",
        }
    }

    /// Whether retrying the same request could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CascadeError::CascadeFailed { .. } | CascadeError::Store(_))
    }
}

pub type Result<T> = std::result::Result<T, CascadeError>;
