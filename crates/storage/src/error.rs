use crate::record::AclKey;

/// All errors that can be returned by an AclStore implementation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    /// The snapshot was already committed or aborted by another holder.
    #[error("snapshot is no longer open")]
    SnapshotClosed,

    /// A grant or key failed validation before reaching the backend
    /// (empty resource, subject, or subject type).
    #[error("invalid acl record {key}: {reason}")]
    InvalidRecord { key: AclKey, reason: String },

    /// A backend-specific storage error (DB connection, serialization, etc.).
    #[error("storage backend error: {0}")]
    Backend(String),
}
