use std::future::Future;
use std::sync::Arc;

use super::{committed_bits, make_grant, TestResult};
use crate::{AclStore, StorageError};

/// Number of concurrent tasks to spawn in each test.
const N: usize = 10;

pub(super) async fn run_concurrent_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: AclStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "concurrent",
            "concurrent_grants_distinct_subjects_all_visible",
            concurrent_grants_distinct_subjects_all_visible(factory).await,
        ),
        TestResult::from_result(
            "concurrent",
            "concurrent_regrants_same_key_merge_every_bit",
            concurrent_regrants_same_key_merge_every_bit(factory).await,
        ),
    ]
}

/// N tasks each commit a grant for a different subject; all N rows survive.
async fn concurrent_grants_distinct_subjects_all_visible<S, F, Fut>(
    factory: &F,
) -> Result<(), String>
where
    S: AclStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);

    let mut handles = Vec::new();
    for i in 0..N {
        let s = storage.clone();
        handles.push(tokio::spawn(async move {
            let mut snap = s.begin_snapshot().await?;
            s.grant_acl_entry(&mut snap, make_grant("doc-1", &format!("subject-{i}"), 1))
                .await?;
            s.commit_snapshot(snap).await
        }));
    }
    for handle in handles {
        handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e: StorageError| format!("storage error: {e}"))?;
    }

    let rows = storage
        .list_acl_entries("doc-1")
        .await
        .map_err(|e| e.to_string())?;
    if rows.len() != N {
        return Err(format!("expected {N} rows, got {}", rows.len()));
    }
    Ok(())
}

/// N tasks each grant a distinct bit on the same key. The merged row must
/// hold all N bits; a lost update would drop at least one.
async fn concurrent_regrants_same_key_merge_every_bit<S, F, Fut>(
    factory: &F,
) -> Result<(), String>
where
    S: AclStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);

    let mut handles = Vec::new();
    for i in 0..N {
        let s = storage.clone();
        handles.push(tokio::spawn(async move {
            let mut snap = s.begin_snapshot().await?;
            s.grant_acl_entry(&mut snap, make_grant("doc-1", "123", 1 << i))
                .await?;
            s.commit_snapshot(snap).await
        }));
    }
    for handle in handles {
        handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e: StorageError| format!("storage error: {e}"))?;
    }

    let expected = (1u32 << N) - 1;
    match committed_bits(storage.as_ref(), "doc-1", "123").await? {
        Some(bits) if bits == expected => Ok(()),
        other => Err(format!("expected {expected:#b}, got {other:?}")),
    }
}
