//! In-memory `AclStore` backend.
//!
//! Snapshots stage their writes locally and apply them to the shared table
//! in one critical section on commit, which gives the same visibility rules
//! as a database transaction: nothing staged is observable until commit,
//! and aborting or dropping a snapshot discards it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use time::OffsetDateTime;

use crate::error::StorageError;
use crate::record::{AclEntryRecord, AclGrant, AclKey};
use crate::traits::AclStore;

#[derive(Debug, Clone)]
enum StagedOp {
    Grant(AclGrant),
    Delete(AclKey),
}

/// An open transaction against a [`MemoryAclStore`].
#[derive(Debug)]
pub struct MemorySnapshot {
    id: u64,
    ops: Vec<StagedOp>,
}

impl MemorySnapshot {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of writes staged so far.
    pub fn staged(&self) -> usize {
        self.ops.len()
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    entries: RwLock<BTreeMap<AclKey, AclEntryRecord>>,
    next_snapshot: AtomicU64,
    reads: AtomicUsize,
    commits: AtomicUsize,
    aborts: AtomicUsize,
}

/// Process-local ACL table. Clones share the same table.
#[derive(Debug, Clone, Default)]
pub struct MemoryAclStore {
    inner: Arc<MemoryInner>,
}

impl MemoryAclStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed-state lookups (`get_acl_entry` and
    /// `list_acl_entries`) served so far.
    pub fn read_count(&self) -> usize {
        self.inner.reads.load(Ordering::SeqCst)
    }

    pub fn commit_count(&self) -> usize {
        self.inner.commits.load(Ordering::SeqCst)
    }

    pub fn abort_count(&self) -> usize {
        self.inner.aborts.load(Ordering::SeqCst)
    }

    /// Number of committed rows.
    pub fn len(&self) -> usize {
        self.inner.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn validate(key: &AclKey) -> Result<(), StorageError> {
        match key.missing_component() {
            Some(component) => Err(StorageError::InvalidRecord {
                key: key.clone(),
                reason: format!("{component} must not be empty"),
            }),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl AclStore for MemoryAclStore {
    type Snapshot = MemorySnapshot;

    async fn begin_snapshot(&self) -> Result<MemorySnapshot, StorageError> {
        let id = self.inner.next_snapshot.fetch_add(1, Ordering::SeqCst);
        Ok(MemorySnapshot {
            id,
            ops: Vec::new(),
        })
    }

    async fn commit_snapshot(&self, snapshot: MemorySnapshot) -> Result<(), StorageError> {
        let now = OffsetDateTime::now_utc();
        let mut entries = self.inner.entries.write();
        for op in snapshot.ops {
            match op {
                StagedOp::Grant(grant) => {
                    entries
                        .entry(grant.key.clone())
                        .and_modify(|row| {
                            row.permissions |= grant.permissions;
                            row.requester_id = grant.requester_id.clone();
                            row.updated_at = now;
                        })
                        .or_insert_with(|| AclEntryRecord {
                            resource_id: grant.key.resource_id.clone(),
                            subject_id: grant.key.subject_id.clone(),
                            subject_type: grant.key.subject_type.clone(),
                            permissions: grant.permissions,
                            requester_id: grant.requester_id.clone(),
                            created_at: now,
                            updated_at: now,
                        });
                }
                StagedOp::Delete(key) => {
                    entries.remove(&key);
                }
            }
        }
        self.inner.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn abort_snapshot(&self, _snapshot: MemorySnapshot) -> Result<(), StorageError> {
        self.inner.aborts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn grant_acl_entry(
        &self,
        snapshot: &mut MemorySnapshot,
        grant: AclGrant,
    ) -> Result<(), StorageError> {
        Self::validate(&grant.key)?;
        snapshot.ops.push(StagedOp::Grant(grant));
        Ok(())
    }

    async fn delete_acl_entry(
        &self,
        snapshot: &mut MemorySnapshot,
        key: &AclKey,
    ) -> Result<(), StorageError> {
        Self::validate(key)?;
        snapshot.ops.push(StagedOp::Delete(key.clone()));
        Ok(())
    }

    async fn get_acl_entry(&self, key: &AclKey) -> Result<Option<AclEntryRecord>, StorageError> {
        self.inner.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.inner.entries.read().get(key).cloned())
    }

    async fn list_acl_entries(
        &self,
        resource_id: &str,
    ) -> Result<Vec<AclEntryRecord>, StorageError> {
        self.inner.reads.fetch_add(1, Ordering::SeqCst);
        let entries = self.inner.entries.read();
        Ok(entries
            .values()
            .filter(|row| row.resource_id == resource_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conformance::run_conformance_suite;

    fn grant(resource: &str, subject: &str, bits: u32) -> AclGrant {
        AclGrant {
            key: AclKey::new(resource, subject, "tester"),
            permissions: bits,
            requester_id: "xyz".to_string(),
        }
    }

    #[tokio::test]
    async fn memory_store_passes_conformance() {
        let report = run_conformance_suite(|| async { MemoryAclStore::new() }).await;
        assert_eq!(report.failed, 0, "{report}");
        assert!(report.total > 0);
    }

    #[tokio::test]
    async fn clones_share_committed_rows() {
        let a = MemoryAclStore::new();
        let b = a.clone();
        let mut snap = a.begin_snapshot().await.unwrap();
        a.grant_acl_entry(&mut snap, grant("doc-1", "123", 1))
            .await
            .unwrap();
        a.commit_snapshot(snap).await.unwrap();
        assert_eq!(b.len(), 1);
        assert_eq!(b.commit_count(), 1);
    }

    #[tokio::test]
    async fn reads_are_counted_but_writes_are_not() {
        let store = MemoryAclStore::new();
        let mut snap = store.begin_snapshot().await.unwrap();
        store
            .grant_acl_entry(&mut snap, grant("doc-1", "123", 1))
            .await
            .unwrap();
        assert_eq!(snap.staged(), 1);
        store.commit_snapshot(snap).await.unwrap();
        assert_eq!(store.read_count(), 0);

        store
            .get_acl_entry(&AclKey::new("doc-1", "123", "tester"))
            .await
            .unwrap();
        store.list_acl_entries("doc-1").await.unwrap();
        assert_eq!(store.read_count(), 2);
    }

    #[tokio::test]
    async fn snapshot_ids_are_unique() {
        let store = MemoryAclStore::new();
        let a = store.begin_snapshot().await.unwrap();
        let b = store.begin_snapshot().await.unwrap();
        assert_ne!(a.id(), b.id());
        store.abort_snapshot(a).await.unwrap();
        store.abort_snapshot(b).await.unwrap();
        assert_eq!(store.abort_count(), 2);
        assert!(store.is_empty());
    }
}
