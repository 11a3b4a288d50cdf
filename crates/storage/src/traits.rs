use async_trait::async_trait;

use crate::error::StorageError;
use crate::record::{AclEntryRecord, AclGrant, AclKey};

/// The storage trait for ACL backends.
///
/// An `AclStore` implementation provides transactional storage for ACL
/// entries and answers committed permission lookups.
///
/// ## Snapshot Semantics
///
/// All mutating operations take `&mut Self::Snapshot`, a type representing an
/// in-progress transaction. The lifecycle is:
///
/// 1. `begin_snapshot()`: start a transaction, returns a `Snapshot`
/// 2. Call mutating methods with `&mut snapshot`
/// 3. `commit_snapshot(snapshot)`: commit and consume the transaction
///    OR `abort_snapshot(snapshot)`: roll back and consume the transaction
///
/// Writes staged in a snapshot MUST NOT be visible to the query operations
/// until the snapshot is committed. If a `Snapshot` is dropped without
/// committing, the underlying transaction MUST be rolled back.
///
/// ## Grant Merging
///
/// `grant_acl_entry` OR-merges the granted bits into an existing row for the
/// same key. There is at most one row per [`AclKey`].
///
/// ## Thread Safety
///
/// Implementations must be `Send + Sync + 'static` so a single store can be
/// shared across every unit of work in the process.
#[async_trait]
pub trait AclStore: Send + Sync + 'static {
    /// The snapshot (transaction) type used by this storage backend.
    type Snapshot: Send + 'static;

    // ── Snapshot lifecycle ────────────────────────────────────────────────────

    /// Begin a new snapshot (transaction).
    async fn begin_snapshot(&self) -> Result<Self::Snapshot, StorageError>;

    /// Commit a snapshot, making all staged writes visible atomically.
    async fn commit_snapshot(&self, snapshot: Self::Snapshot) -> Result<(), StorageError>;

    /// Abort (roll back) a snapshot, discarding all staged writes.
    async fn abort_snapshot(&self, snapshot: Self::Snapshot) -> Result<(), StorageError>;

    // ── Mutations (within snapshot) ───────────────────────────────────────────

    /// Stage a grant. Returns `Err(StorageError::InvalidRecord)` if any key
    /// component is empty.
    async fn grant_acl_entry(
        &self,
        snapshot: &mut Self::Snapshot,
        grant: AclGrant,
    ) -> Result<(), StorageError>;

    /// Stage removal of the row for `key`. Removing a missing row is not an error.
    async fn delete_acl_entry(
        &self,
        snapshot: &mut Self::Snapshot,
        key: &AclKey,
    ) -> Result<(), StorageError>;

    // ── Queries (committed state only) ────────────────────────────────────────

    /// Read the committed row for `key`, if any.
    async fn get_acl_entry(&self, key: &AclKey) -> Result<Option<AclEntryRecord>, StorageError>;

    /// List committed rows for a resource, ordered by subject id then subject type.
    async fn list_acl_entries(&self, resource_id: &str)
        -> Result<Vec<AclEntryRecord>, StorageError>;
}
