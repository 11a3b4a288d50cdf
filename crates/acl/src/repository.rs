//! ACL writes inside a unit of work, and scope-chained checks through the
//! permission cache.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use cadence_context::{ActionError, Cancellable, ContextError, MinimalContext, TransactionContext};
use cadence_storage::{AclEntryRecord, AclGrant, AclKey, AclStore, StorageError};
use tokio::sync::Mutex;

use crate::cache::{CacheKey, MemoryPermissionCache, PermissionCache};
use crate::error::AclError;
use crate::permission::Permission;
use crate::settings::CacheSettings;

/// Resource key of the store snapshot shared by every ACL write in one
/// unit of work.
const SNAPSHOT_KEY: &str = "cadence_acl.store_snapshot";

/// `None` once the snapshot has been committed or aborted.
type SharedSnapshot<S> = Mutex<Option<<S as AclStore>::Snapshot>>;

/// Run `fut` unless `ctx` is interrupted first. Interruption covers a
/// cancelled or expired context and a unit of work that is rolling back.
async fn until_interrupted<X, F, T, E>(ctx: &X, fut: F) -> Result<T, AclError>
where
    X: Cancellable + ?Sized,
    F: Future<Output = Result<T, E>>,
    AclError: From<E>,
{
    tokio::select! {
        biased;
        _ = ctx.interrupted() => {
            Err(ctx.interruption().unwrap_or(ContextError::Cancelled).into())
        }
        result = fut => result.map_err(AclError::from),
    }
}

pub struct AclRepository<S, C> {
    store: Arc<S>,
    cache: Arc<C>,
    ttl: Duration,
}

impl<S, C> Clone for AclRepository<S, C> {
    fn clone(&self) -> Self {
        AclRepository {
            store: Arc::clone(&self.store),
            cache: Arc::clone(&self.cache),
            ttl: self.ttl,
        }
    }
}

impl<S: AclStore> AclRepository<S, MemoryPermissionCache> {
    /// Repository with a process-local cache built from `settings`.
    pub fn with_memory_cache(store: Arc<S>, settings: &CacheSettings) -> Self {
        AclRepository::new(
            store,
            Arc::new(MemoryPermissionCache::from_settings(settings)),
            settings.ttl(),
        )
    }
}

impl<S: AclStore, C: PermissionCache> AclRepository<S, C> {
    /// `ttl` bounds how long an allow decision is served from `cache`.
    pub fn new(store: Arc<S>, cache: Arc<C>, ttl: Duration) -> Self {
        AclRepository { store, cache, ttl }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<C> {
        &self.cache
    }

    /// The unit of work's store snapshot, begun on first use.
    ///
    /// The call that begins it also schedules the store commit as a final
    /// commit action and the abort as a compensating action.
    async fn snapshot(&self, ctx: &TransactionContext) -> Result<Arc<SharedSnapshot<S>>, AclError> {
        let store = Arc::clone(&self.store);
        let object = ctx
            .get_transaction_object(SNAPSHOT_KEY, || async move {
                // Runs under the context's transaction lock.
                let snapshot = until_interrupted(ctx, store.begin_snapshot()).await?;
                Ok::<_, AclError>(Mutex::new(Some(snapshot)))
            })
            .await?;

        if object.created {
            if let Err(err) = self.schedule_snapshot_end(ctx, &object.value).await {
                // Registration lost a race with commit or rollback.
                let orphan = object.value.lock().await.take();
                if let Some(snapshot) = orphan {
                    self.store.abort_snapshot(snapshot).await?;
                }
                return Err(err.into());
            }
        }
        Ok(object.value)
    }

    async fn schedule_snapshot_end(
        &self,
        ctx: &TransactionContext,
        shared: &Arc<SharedSnapshot<S>>,
    ) -> Result<(), ContextError> {
        let (store, slot) = (Arc::clone(&self.store), Arc::clone(shared));
        ctx.register_final_commit_action(move |_ctx: MinimalContext| {
            let (store, slot) = (Arc::clone(&store), Arc::clone(&slot));
            async move {
                let Some(snapshot) = slot.lock().await.take() else {
                    return Ok(());
                };
                store.commit_snapshot(snapshot).await.map_err(ActionError::new)
            }
        })
        .await?;

        let (store, slot) = (Arc::clone(&self.store), Arc::clone(shared));
        ctx.register_compensatory_action(move |_ctx: MinimalContext| {
            let (store, slot) = (Arc::clone(&store), Arc::clone(&slot));
            async move {
                let Some(snapshot) = slot.lock().await.take() else {
                    return Ok(());
                };
                store.abort_snapshot(snapshot).await.map_err(ActionError::new)
            }
        })
        .await
    }

    /// Grant `permission` to a subject on a resource. The grant becomes
    /// visible to checks only once `ctx` commits; re-granting OR-merges
    /// into the existing row.
    pub async fn create_acl_entry(
        &self,
        ctx: &TransactionContext,
        resource_id: &str,
        subject_id: &str,
        subject_type: &str,
        requester_id: &str,
        permission: Permission,
    ) -> Result<(), AclError> {
        let shared = self.snapshot(ctx).await?;
        let grant = AclGrant {
            key: AclKey::new(resource_id, subject_id, subject_type),
            permissions: permission.bits(),
            requester_id: requester_id.to_string(),
        };

        // A compensation takes this lock during rollback; the store call is
        // raced so rollback's early interrupt releases it.
        let mut slot = shared.lock().await;
        let snapshot = slot.as_mut().ok_or(StorageError::SnapshotClosed)?;
        until_interrupted(ctx, self.store.grant_acl_entry(snapshot, grant)).await?;
        drop(slot);
        tracing::debug!(
            resource_id,
            subject_id,
            subject_type,
            requester_id,
            %permission,
            "staged acl grant"
        );
        Ok(())
    }

    /// Remove a subject's row for a resource. Cached allows for the row are
    /// evicted once the delete is visible. A check that read the row before
    /// the revoke committed can still cache its allow afterwards, so in the
    /// worst case a revoke takes one cache TTL to apply.
    pub async fn revoke_acl_entry(
        &self,
        ctx: &TransactionContext,
        resource_id: &str,
        subject_id: &str,
        subject_type: &str,
    ) -> Result<(), AclError> {
        let shared = self.snapshot(ctx).await?;
        let key = AclKey::new(resource_id, subject_id, subject_type);
        {
            let mut slot = shared.lock().await;
            let snapshot = slot.as_mut().ok_or(StorageError::SnapshotClosed)?;
            until_interrupted(ctx, self.store.delete_acl_entry(snapshot, &key)).await?;
        }

        // Registered after the snapshot commit, so it runs once the delete
        // is visible.
        let cache = Arc::clone(&self.cache);
        ctx.register_final_commit_action(move |_ctx: MinimalContext| {
            let cache = Arc::clone(&cache);
            let keys: Vec<CacheKey> = Permission::all()
                .iter()
                .map(|bit| CacheKey::new(&key.resource_id, &key.subject_id, &key.subject_type, bit))
                .collect();
            async move {
                for key in &keys {
                    cache.remove(key).await.map_err(ActionError::new)?;
                }
                Ok(())
            }
        })
        .await?;

        tracing::debug!(resource_id, subject_id, subject_type, "staged acl revoke");
        Ok(())
    }

    /// Committed entries for a resource, ordered by subject.
    pub async fn list_acl_entries<X>(
        &self,
        ctx: &X,
        resource_id: &str,
    ) -> Result<Vec<AclEntryRecord>, AclError>
    where
        X: Cancellable + ?Sized,
    {
        until_interrupted(ctx, self.store.list_acl_entries(resource_id)).await
    }

    pub async fn can_read<X, I>(
        &self,
        ctx: &X,
        resource_id: &str,
        subject_ids: &[I],
        subject_type: &str,
        requester_id: &str,
    ) -> Result<(), AclError>
    where
        X: Cancellable + ?Sized,
        I: AsRef<str>,
    {
        self.can(ctx, resource_id, subject_ids, subject_type, requester_id, Permission::READ)
            .await
    }

    pub async fn can_write<X, I>(
        &self,
        ctx: &X,
        resource_id: &str,
        subject_ids: &[I],
        subject_type: &str,
        requester_id: &str,
    ) -> Result<(), AclError>
    where
        X: Cancellable + ?Sized,
        I: AsRef<str>,
    {
        self.can(ctx, resource_id, subject_ids, subject_type, requester_id, Permission::WRITE)
            .await
    }

    /// Succeeds only if **every** id in `subject_ids` holds every bit of
    /// `permission` on `resource_id`. The ids are a scope chain, not a set
    /// of alternatives. An empty chain or an empty permission is denied.
    pub async fn can<X, I>(
        &self,
        ctx: &X,
        resource_id: &str,
        subject_ids: &[I],
        subject_type: &str,
        requester_id: &str,
        permission: Permission,
    ) -> Result<(), AclError>
    where
        X: Cancellable + ?Sized,
        I: AsRef<str>,
    {
        if subject_ids.is_empty() || permission.is_empty() {
            return Err(AclError::PermissionDenied {
                resource_id: resource_id.to_string(),
                subject_id: String::new(),
                permission,
            });
        }

        for subject_id in subject_ids {
            let subject_id: &str = subject_id.as_ref();
            for bit in permission.iter() {
                let key = CacheKey::new(resource_id, subject_id, subject_type, bit);
                if !self.check_bit(ctx, key, requester_id).await? {
                    return Err(AclError::PermissionDenied {
                        resource_id: resource_id.to_string(),
                        subject_id: subject_id.to_string(),
                        permission: bit,
                    });
                }
            }
        }
        Ok(())
    }

    /// One (resource, subject, bit) decision. Only allows are cached: a
    /// denial is re-read every time, so a grant committed after a denial is
    /// honoured by the very next check.
    async fn check_bit<X>(&self, ctx: &X, key: CacheKey, requester_id: &str) -> Result<bool, AclError>
    where
        X: Cancellable + ?Sized,
    {
        if let Some(allowed) = until_interrupted(ctx, self.cache.get(&key)).await? {
            tracing::debug!(%key, requester_id, allowed, "acl cache hit");
            return Ok(allowed);
        }

        let row_key = AclKey::new(&key.resource_id, &key.subject_id, &key.subject_type);
        let row = until_interrupted(ctx, self.store.get_acl_entry(&row_key))
            .await
            .inspect_err(|err| tracing::warn!(%key, error = %err, "acl store lookup failed"))?;
        let allowed = row
            .map(|row| Permission::from_bits_retain(row.permissions).contains(key.permission))
            .unwrap_or(false);
        tracing::debug!(%key, requester_id, allowed, "acl cache miss");

        if allowed {
            until_interrupted(ctx, self.cache.set(key, true, self.ttl)).await?;
        }
        Ok(allowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use cadence_context::{ContextFactory, TraceInfo, TxState};
    use cadence_storage::MemoryAclStore;

    const DOC: &str = "doc-1";
    const TYPE: &str = "tester";

    struct Fixture {
        factory: ContextFactory,
        store: Arc<MemoryAclStore>,
        repo: AclRepository<MemoryAclStore, MemoryPermissionCache>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryAclStore::new());
        let repo = AclRepository::with_memory_cache(Arc::clone(&store), &CacheSettings::default());
        Fixture {
            factory: ContextFactory::default().with_retry_policy(cadence_context::RetryPolicy::none()),
            store,
            repo,
        }
    }

    impl Fixture {
        fn ctx(&self) -> TransactionContext {
            self.factory.create_default(&TraceInfo::new_root())
        }

        async fn grant(&self, subject: &str, permission: Permission) {
            let ctx = self.ctx();
            self.repo
                .create_acl_entry(&ctx, DOC, subject, TYPE, "admin", permission)
                .await
                .unwrap();
            ctx.commit_transaction().await.unwrap();
        }
    }

    #[tokio::test]
    async fn grants_in_one_context_share_a_snapshot() {
        let f = fixture();
        let ctx = f.ctx();
        for subject in ["a", "b", "c"] {
            f.repo
                .create_acl_entry(&ctx, DOC, subject, TYPE, "admin", Permission::READ)
                .await
                .unwrap();
        }
        assert!(f.store.is_empty());
        ctx.commit_transaction().await.unwrap();

        assert_eq!(f.store.commit_count(), 1);
        assert_eq!(f.store.len(), 3);
    }

    #[tokio::test]
    async fn rolled_back_grant_is_never_visible() {
        let f = fixture();
        let ctx = f.ctx();
        f.repo
            .create_acl_entry(&ctx, DOC, "a", TYPE, "admin", Permission::READ)
            .await
            .unwrap();
        ctx.rollback_transaction().await;

        assert_eq!(f.store.abort_count(), 1);
        let reader = f.ctx();
        let err = f.repo.can_read(&reader, DOC, &["a"], TYPE, "x").await.unwrap_err();
        assert!(err.is_permission_denied());
    }

    #[tokio::test]
    async fn write_after_commit_is_rejected() {
        let f = fixture();
        let ctx = f.ctx();
        ctx.commit_transaction().await.unwrap();
        let err = f
            .repo
            .create_acl_entry(&ctx, DOC, "a", TYPE, "admin", Permission::READ)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AclError::Context(ContextError::AlreadyFinalized {
                state: TxState::Committed
            })
        ));
    }

    #[tokio::test]
    async fn allow_is_served_from_cache() {
        let f = fixture();
        f.grant("a", Permission::READ).await;
        let reader = f.ctx();

        f.repo.can_read(&reader, DOC, &["a"], TYPE, "x").await.unwrap();
        let reads = f.store.read_count();
        f.repo.can_read(&reader, DOC, &["a"], TYPE, "x").await.unwrap();
        assert_eq!(f.store.read_count(), reads);
        assert_eq!(f.repo.cache().stats().hits, 1);
    }

    #[tokio::test]
    async fn denial_is_not_cached() {
        let f = fixture();
        let reader = f.ctx();
        assert!(f.repo.can_read(&reader, DOC, &["a"], TYPE, "x").await.is_err());

        f.grant("a", Permission::READ).await;
        f.repo.can_read(&reader, DOC, &["a"], TYPE, "x").await.unwrap();
    }

    #[tokio::test]
    async fn every_subject_must_hold_the_bit() {
        let f = fixture();
        f.grant("a", Permission::READ | Permission::WRITE).await;
        f.grant("b", Permission::READ).await;
        let reader = f.ctx();

        f.repo.can_read(&reader, DOC, &["a", "b"], TYPE, "x").await.unwrap();
        let err = f
            .repo
            .can_write(&reader, DOC, &["a", "b"], TYPE, "x")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AclError::PermissionDenied { ref subject_id, permission, .. }
                if subject_id == "b" && permission == Permission::WRITE
        ));
        f.repo
            .can(&reader, DOC, &["a"], TYPE, "x", Permission::all())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn subject_type_scopes_the_check() {
        let f = fixture();
        f.grant("a", Permission::READ).await;
        let reader = f.ctx();
        assert!(f.repo.can_read(&reader, DOC, &["a"], "group", "x").await.is_err());
    }

    #[tokio::test]
    async fn empty_chain_is_denied() {
        let f = fixture();
        let reader = f.ctx();
        let none: &[&str] = &[];
        let err = f.repo.can_read(&reader, DOC, none, TYPE, "x").await.unwrap_err();
        assert!(err.is_permission_denied());
        assert_eq!(f.store.read_count(), 0);
    }

    #[tokio::test]
    async fn cancelled_context_aborts_check() {
        let f = fixture();
        f.grant("a", Permission::READ).await;
        let reader = f.ctx();
        reader.cancel().await;

        let err = f.repo.can_read(&reader, DOC, &["a"], TYPE, "x").await.unwrap_err();
        assert!(matches!(err, AclError::Context(ContextError::Cancelled)));
    }

    #[tokio::test]
    async fn revoke_evicts_cached_allow_on_commit() {
        let f = fixture();
        f.grant("a", Permission::READ | Permission::WRITE).await;
        let reader = f.ctx();
        f.repo.can_write(&reader, DOC, &["a"], TYPE, "x").await.unwrap();

        let ctx = f.ctx();
        f.repo.revoke_acl_entry(&ctx, DOC, "a", TYPE).await.unwrap();
        f.repo.can_write(&reader, DOC, &["a"], TYPE, "x").await.unwrap();
        ctx.commit_transaction().await.unwrap();

        assert!(f.repo.can_write(&reader, DOC, &["a"], TYPE, "x").await.is_err());
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn write_after_snapshot_ended_reports_closed_snapshot() {
        let f = fixture();
        let ctx = f.ctx();
        let shared = f.repo.snapshot(&ctx).await.unwrap();
        let taken = shared.lock().await.take().unwrap();
        f.store.abort_snapshot(taken).await.unwrap();

        let err = f
            .repo
            .create_acl_entry(&ctx, DOC, "a", TYPE, "x", Permission::READ)
            .await
            .unwrap_err();
        assert!(matches!(err, AclError::Storage(StorageError::SnapshotClosed)));
        let err = f.repo.revoke_acl_entry(&ctx, DOC, "a", TYPE).await.unwrap_err();
        assert!(matches!(err, AclError::Storage(StorageError::SnapshotClosed)));
        // The emptied slot makes the scheduled commit a no-op.
        ctx.commit_transaction().await.unwrap();
        assert!(f.store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn allow_cached_by_a_check_racing_a_revoke_expires_with_ttl() {
        let f = fixture();
        f.grant("a", Permission::READ).await;
        let ctx = f.ctx();
        f.repo.revoke_acl_entry(&ctx, DOC, "a", TYPE).await.unwrap();
        ctx.commit_transaction().await.unwrap();

        // A check that read the row before the revoke landed writes late.
        let stale = CacheKey::new(DOC, "a", TYPE, Permission::READ);
        let ttl = CacheSettings::default().ttl();
        f.repo.cache().set(stale, true, ttl).await.unwrap();

        f.repo.can_read(&f.ctx(), DOC, &["a"], TYPE, "x").await.unwrap();
        tokio::time::advance(ttl).await;
        let err = f.repo.can_read(&f.ctx(), DOC, &["a"], TYPE, "x").await.unwrap_err();
        assert!(matches!(err, AclError::PermissionDenied { .. }));
    }

    #[tokio::test]
    async fn failed_commit_action_leaves_grant_uncommitted() {
        let f = fixture();
        let ctx = f.ctx();
        f.repo
            .create_acl_entry(&ctx, DOC, "a", TYPE, "admin", Permission::READ)
            .await
            .unwrap();
        ctx.register_commit_action(|_ctx: MinimalContext| async {
            Err::<(), _>(ActionError::new("projection failed"))
        })
        .await
        .unwrap();

        assert!(ctx.commit_transaction().await.is_err());
        assert_eq!(f.store.commit_count(), 0);
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn list_returns_committed_rows() {
        let f = fixture();
        f.grant("b", Permission::READ).await;
        f.grant("a", Permission::WRITE).await;
        f.grant("a", Permission::READ).await;
        let reader = f.ctx();

        let rows = f.repo.list_acl_entries(&reader, DOC).await.unwrap();
        let summary: Vec<(&str, u32)> = rows
            .iter()
            .map(|row| (row.subject_id.as_str(), row.permissions))
            .collect();
        assert_eq!(summary, vec![("a", 0b11), ("b", 0b01)]);
    }
}
