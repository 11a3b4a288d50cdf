use std::future::Future;

use super::{committed_bits, make_grant, TestResult, BIT_A};
use crate::record::AclKey;
use crate::{AclStore, StorageError};

pub(super) async fn run_error_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: AclStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "error",
            "empty_resource_rejected",
            empty_component_rejected(factory, "", "123").await,
        ),
        TestResult::from_result(
            "error",
            "empty_subject_rejected",
            empty_component_rejected(factory, "doc-1", "").await,
        ),
        TestResult::from_result(
            "error",
            "delete_with_empty_key_rejected",
            delete_with_empty_key_rejected(factory).await,
        ),
    ]
}

async fn empty_component_rejected<S, F, Fut>(
    factory: &F,
    resource_id: &str,
    subject_id: &str,
) -> Result<(), String>
where
    S: AclStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let result = s
        .grant_acl_entry(&mut snap, make_grant(resource_id, subject_id, BIT_A))
        .await;
    s.commit_snapshot(snap).await.map_err(|e| e.to_string())?;

    match result {
        Err(StorageError::InvalidRecord { .. }) => {}
        Err(other) => return Err(format!("expected InvalidRecord, got {other}")),
        Ok(()) => return Err("invalid grant accepted".to_string()),
    }
    match committed_bits(&s, resource_id, subject_id).await? {
        None => Ok(()),
        Some(bits) => Err(format!("rejected grant was stored: {bits:#b}")),
    }
}

async fn delete_with_empty_key_rejected<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: AclStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut snap = s.begin_snapshot().await.map_err(|e| e.to_string())?;
    let result = s
        .delete_acl_entry(&mut snap, &AclKey::new("doc-1", "123", ""))
        .await;
    s.abort_snapshot(snap).await.map_err(|e| e.to_string())?;
    match result {
        Err(StorageError::InvalidRecord { .. }) => Ok(()),
        Err(other) => Err(format!("expected InvalidRecord, got {other}")),
        Ok(()) => Err("delete with empty subject type accepted".to_string()),
    }
}
