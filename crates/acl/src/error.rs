use cadence_context::ContextError;
use cadence_storage::StorageError;

use crate::cache::CacheError;
use crate::permission::Permission;

/// Errors from ACL writes and checks. Callers treat every variant of a
/// failed check as a denial.
#[derive(Debug, thiserror::Error)]
pub enum AclError {
    /// The subject has no row for the resource, or its row lacks the bit.
    #[error("permission denied: {subject_id} lacks {permission} on {resource_id}")]
    PermissionDenied {
        resource_id: String,
        subject_id: String,
        permission: Permission,
    },

    /// Includes a cancelled or expired caller context
    /// (`ContextError::Cancelled`, `ContextError::DeadlineExceeded`) and a
    /// unit of work that rolled back mid-call.
    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl AclError {
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, AclError::PermissionDenied { .. })
    }
}
