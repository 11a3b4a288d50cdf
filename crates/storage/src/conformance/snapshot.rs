use std::future::Future;

use super::{commit_grants, committed_bits, make_grant, TestResult, BIT_A};
use crate::AclStore;

pub(super) async fn run_snapshot_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: AclStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "snapshot",
            "uncommitted_grant_invisible",
            uncommitted_grant_invisible(factory).await,
        ),
        TestResult::from_result(
            "snapshot",
            "aborted_grant_invisible",
            aborted_grant_invisible(factory).await,
        ),
        TestResult::from_result(
            "snapshot",
            "dropped_snapshot_discarded",
            dropped_snapshot_discarded(factory).await,
        ),
        TestResult::from_result(
            "snapshot",
            "committed_grant_visible",
            committed_grant_visible(factory).await,
        ),
        TestResult::from_result(
            "snapshot",
            "uncommitted_delete_invisible",
            uncommitted_delete_invisible(factory).await,
        ),
    ]
}

/// A staged grant is not readable while its snapshot is still open.
async fn uncommitted_grant_invisible<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: AclStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    s.grant_acl_entry(&mut snap, make_grant("doc-1", "123", BIT_A))
        .await
        .map_err(|e| e.to_string())?;

    let seen = committed_bits(&s, "doc-1", "123").await?;
    s.abort_snapshot(snap).await.map_err(|e| e.to_string())?;
    match seen {
        None => Ok(()),
        Some(bits) => Err(format!("staged grant visible before commit: {bits:#b}")),
    }
}

async fn aborted_grant_invisible<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: AclStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    s.grant_acl_entry(&mut snap, make_grant("doc-1", "123", BIT_A))
        .await
        .map_err(|e| e.to_string())?;
    s.abort_snapshot(snap).await.map_err(|e| e.to_string())?;

    if let Some(bits) = committed_bits(&s, "doc-1", "123").await? {
        return Err(format!("aborted grant visible: {bits:#b}"));
    }
    let listed = s.list_acl_entries("doc-1").await.map_err(|e| e.to_string())?;
    if !listed.is_empty() {
        return Err(format!("aborted grant listed: {} rows", listed.len()));
    }
    Ok(())
}

async fn dropped_snapshot_discarded<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: AclStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    {
        let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
        s.grant_acl_entry(&mut snap, make_grant("doc-1", "123", BIT_A))
            .await
            .map_err(|e| e.to_string())?;
    }
    match committed_bits(&s, "doc-1", "123").await? {
        None => Ok(()),
        Some(bits) => Err(format!("dropped snapshot leaked grant: {bits:#b}")),
    }
}

async fn committed_grant_visible<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: AclStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    commit_grants(&s, vec![make_grant("doc-1", "123", BIT_A)]).await?;
    match committed_bits(&s, "doc-1", "123").await? {
        Some(BIT_A) => Ok(()),
        other => Err(format!("expected Some({BIT_A:#b}), got {other:?}")),
    }
}

/// A staged delete leaves the committed row in place until commit.
async fn uncommitted_delete_invisible<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: AclStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    commit_grants(&s, vec![make_grant("doc-1", "123", BIT_A)]).await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    s.delete_acl_entry(&mut snap, &make_grant("doc-1", "123", 0).key)
        .await
        .map_err(|e| e.to_string())?;
    let seen = committed_bits(&s, "doc-1", "123").await?;
    s.abort_snapshot(snap).await.map_err(|e| e.to_string())?;

    if seen != Some(BIT_A) {
        return Err(format!("row changed before delete committed: {seen:?}"));
    }
    match committed_bits(&s, "doc-1", "123").await? {
        Some(BIT_A) => Ok(()),
        other => Err(format!("aborted delete removed row: {other:?}")),
    }
}
