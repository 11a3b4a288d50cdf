use std::future::Future;

use super::{commit_grants, committed_bits, make_grant, TestResult, BIT_A, BIT_B};
use crate::record::AclKey;
use crate::AclStore;

pub(super) async fn run_commit_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: AclStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "commit",
        "multiple_grants_in_one_snapshot",
        multiple_grants_in_one_snapshot(factory).await,
    ));
    results.push(TestResult::from_result(
        "commit",
        "regrant_merges_bits",
        regrant_merges_bits(factory).await,
    ));
    results.push(TestResult::from_result(
        "commit",
        "regrant_keeps_single_row",
        regrant_keeps_single_row(factory).await,
    ));
    results.push(TestResult::from_result(
        "commit",
        "regrant_preserves_created_at",
        regrant_preserves_created_at(factory).await,
    ));
    results.push(TestResult::from_result(
        "commit",
        "subject_type_is_part_of_key",
        subject_type_is_part_of_key(factory).await,
    ));
    results.push(TestResult::from_result(
        "commit",
        "delete_removes_row",
        delete_removes_row(factory).await,
    ));
    results.push(TestResult::from_result(
        "commit",
        "delete_missing_row_is_noop",
        delete_missing_row_is_noop(factory).await,
    ));
    results.push(TestResult::from_result(
        "commit",
        "list_filters_by_resource",
        list_filters_by_resource(factory).await,
    ));
    results.push(TestResult::from_result(
        "commit",
        "commit_empty_snapshot",
        commit_empty_snapshot(factory).await,
    ));
    results.push(TestResult::from_result(
        "commit",
        "missing_row_reads_none",
        missing_row_reads_none(factory).await,
    ));

    results
}

async fn multiple_grants_in_one_snapshot<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: AclStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    commit_grants(
        &s,
        vec![
            make_grant("doc-1", "5345", BIT_B),
            make_grant("doc-1", "8542", BIT_B),
        ],
    )
    .await?;

    for subject in ["5345", "8542"] {
        if committed_bits(&s, "doc-1", subject).await? != Some(BIT_B) {
            return Err(format!("subject {subject} missing after commit"));
        }
    }
    Ok(())
}

/// A second grant for the same key ORs its bits into the existing row.
async fn regrant_merges_bits<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: AclStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    commit_grants(&s, vec![make_grant("doc-1", "123", BIT_A)]).await?;
    commit_grants(&s, vec![make_grant("doc-1", "123", BIT_B)]).await?;

    match committed_bits(&s, "doc-1", "123").await? {
        Some(bits) if bits == BIT_A | BIT_B => Ok(()),
        other => Err(format!("expected merged bits {:#b}, got {other:?}", BIT_A | BIT_B)),
    }
}

async fn regrant_keeps_single_row<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: AclStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    commit_grants(
        &s,
        vec![
            make_grant("doc-1", "123", BIT_A),
            make_grant("doc-1", "123", BIT_A),
        ],
    )
    .await?;
    commit_grants(&s, vec![make_grant("doc-1", "123", BIT_B)]).await?;

    let rows = s.list_acl_entries("doc-1").await.map_err(|e| e.to_string())?;
    if rows.len() != 1 {
        return Err(format!("expected 1 row, got {}", rows.len()));
    }
    Ok(())
}

async fn regrant_preserves_created_at<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: AclStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let key = AclKey::new("doc-1", "123", "tester");
    commit_grants(&s, vec![make_grant("doc-1", "123", BIT_A)]).await?;
    let first = s
        .get_acl_entry(&key)
        .await
        .map_err(|e| e.to_string())?
        .ok_or("row missing after first grant")?;
    commit_grants(&s, vec![make_grant("doc-1", "123", BIT_B)]).await?;
    let second = s
        .get_acl_entry(&key)
        .await
        .map_err(|e| e.to_string())?
        .ok_or("row missing after second grant")?;

    if second.created_at != first.created_at {
        return Err("created_at changed on regrant".to_string());
    }
    if second.updated_at < first.updated_at {
        return Err("updated_at moved backwards on regrant".to_string());
    }
    Ok(())
}

async fn subject_type_is_part_of_key<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: AclStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let mut grant = make_grant("doc-1", "123", BIT_B);
    grant.key.subject_type = "group".to_string();
    s.grant_acl_entry(&mut snap, grant)
        .await
        .map_err(|e| e.to_string())?;
    s.commit_snapshot(snap).await.map_err(|e| e.to_string())?;

    if committed_bits(&s, "doc-1", "123").await?.is_some() {
        return Err("grant for subject type 'group' visible as 'tester'".to_string());
    }
    let group = s
        .get_acl_entry(&AclKey::new("doc-1", "123", "group"))
        .await
        .map_err(|e| e.to_string())?;
    match group {
        Some(row) if row.permissions == BIT_B => Ok(()),
        other => Err(format!("expected group row, got {other:?}")),
    }
}

async fn delete_removes_row<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: AclStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    commit_grants(&s, vec![make_grant("doc-1", "123", BIT_A | BIT_B)]).await?;

    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    s.delete_acl_entry(&mut snap, &AclKey::new("doc-1", "123", "tester"))
        .await
        .map_err(|e| e.to_string())?;
    s.commit_snapshot(snap).await.map_err(|e| e.to_string())?;

    match committed_bits(&s, "doc-1", "123").await? {
        None => Ok(()),
        Some(bits) => Err(format!("row still present after delete: {bits:#b}")),
    }
}

async fn delete_missing_row_is_noop<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: AclStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    s.delete_acl_entry(&mut snap, &AclKey::new("doc-1", "nobody", "tester"))
        .await
        .map_err(|e| format!("delete of missing row failed: {e}"))?;
    s.commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit after noop delete failed: {e}"))
}

async fn list_filters_by_resource<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: AclStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    commit_grants(
        &s,
        vec![
            make_grant("doc-1", "123", BIT_A),
            make_grant("doc-1", "364", BIT_A | BIT_B),
            make_grant("doc-2", "123", BIT_B),
        ],
    )
    .await?;

    let rows = s.list_acl_entries("doc-1").await.map_err(|e| e.to_string())?;
    let subjects: Vec<&str> = rows.iter().map(|r| r.subject_id.as_str()).collect();
    if subjects != ["123", "364"] {
        return Err(format!("expected [123, 364], got {subjects:?}"));
    }
    if rows.iter().any(|r| r.resource_id != "doc-1") {
        return Err("listing leaked another resource".to_string());
    }
    Ok(())
}

async fn commit_empty_snapshot<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: AclStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    commit_grants(&s, Vec::new()).await
}

async fn missing_row_reads_none<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: AclStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    match committed_bits(&s, "doc-404", "123").await? {
        None => Ok(()),
        Some(bits) => Err(format!("unexpected row: {bits:#b}")),
    }
}
