//! Conformance test suite for `AclStore` implementations.
//!
//! This module provides a backend-agnostic test suite that any `AclStore`
//! implementation can run to verify correctness. The suite covers:
//!
//! - **Snapshot isolation**: staged grants invisible until commit, discarded on abort/drop
//! - **Commit**: grants, merges, and deletes applied atomically
//! - **Error handling**: invalid keys rejected before reaching the table
//! - **Concurrency**: parallel snapshots never lose committed bits
//!
//! # Usage
//!
//! Backend crates call [`run_conformance_suite`] with a factory function that
//! creates a fresh, empty storage instance for each test:
//!
//! ```ignore
//! use cadence_storage::conformance::run_conformance_suite;
//!
//! #[tokio::test]
//! async fn postgres_conformance() {
//!     let report = run_conformance_suite(|| async {
//!         create_test_postgres_store().await
//!     }).await;
//!     assert!(report.failed == 0, "{report}");
//! }
//! ```

mod commit;
mod concurrent;
mod error;
mod snapshot;

use std::fmt;
use std::future::Future;

use crate::record::{AclGrant, AclKey};
use crate::AclStore;

/// Bit used by the suite for "read"-style grants.
const BIT_A: u32 = 0b01;
/// Bit used by the suite for "write"-style grants.
const BIT_B: u32 = 0b10;

/// Result of a single conformance test.
#[derive(Debug, Clone)]
pub struct TestResult {
    /// Test category (e.g. "snapshot", "commit").
    pub category: String,
    /// Test name (e.g. "uncommitted_grant_invisible").
    pub name: String,
    /// Whether the test passed.
    pub passed: bool,
    /// Error message if the test failed.
    pub message: Option<String>,
}

impl TestResult {
    fn from_result(category: &str, name: &str, result: Result<(), String>) -> Self {
        let (passed, message) = match result {
            Ok(()) => (true, None),
            Err(msg) => (false, Some(msg)),
        };
        Self {
            category: category.to_string(),
            name: name.to_string(),
            passed,
            message,
        }
    }
}

/// Aggregated report from a full conformance suite run.
#[derive(Debug, Clone)]
pub struct ConformanceReport {
    pub results: Vec<TestResult>,
    pub passed: usize,
    pub failed: usize,
    pub total: usize,
}

impl fmt::Display for ConformanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Conformance: {}/{} passed ({} failed)",
            self.passed, self.total, self.failed
        )?;
        for r in self.results.iter().filter(|r| !r.passed) {
            writeln!(
                f,
                "  FAIL [{}/{}]: {}",
                r.category,
                r.name,
                r.message.as_deref().unwrap_or("(no message)")
            )?;
        }
        Ok(())
    }
}

/// Run the full conformance suite against a storage backend.
///
/// The `factory` function is called once per test to create a fresh, empty
/// storage instance, ensuring test isolation.
pub async fn run_conformance_suite<S, F, Fut>(factory: F) -> ConformanceReport
where
    S: AclStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.extend(snapshot::run_snapshot_tests(&factory).await);
    results.extend(commit::run_commit_tests(&factory).await);
    results.extend(error::run_error_tests(&factory).await);
    results.extend(concurrent::run_concurrent_tests(&factory).await);

    let passed = results.iter().filter(|r| r.passed).count();
    let total = results.len();

    ConformanceReport {
        results,
        passed,
        failed: total - passed,
        total,
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn make_grant(resource_id: &str, subject_id: &str, permissions: u32) -> AclGrant {
    AclGrant {
        key: AclKey::new(resource_id, subject_id, "tester"),
        permissions,
        requester_id: "conformance".to_string(),
    }
}

/// Begin, stage the grants, and commit.
async fn commit_grants<S: AclStore>(store: &S, grants: Vec<AclGrant>) -> Result<(), String> {
    let mut snap = store
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    for grant in grants {
        store
            .grant_acl_entry(&mut snap, grant)
            .await
            .map_err(|e| format!("grant: {e}"))?;
    }
    store
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))
}

/// Committed bitmask for `(resource_id, subject_id, "tester")`, if a row exists.
async fn committed_bits<S: AclStore>(
    store: &S,
    resource_id: &str,
    subject_id: &str,
) -> Result<Option<u32>, String> {
    store
        .get_acl_entry(&AclKey::new(resource_id, subject_id, "tester"))
        .await
        .map(|row| row.map(|r| r.permissions))
        .map_err(|e| format!("get: {e}"))
}
