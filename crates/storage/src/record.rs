use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Primary key of an ACL row: one bitmask per (resource, subject, subject type).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AclKey {
    pub resource_id: String,
    pub subject_id: String,
    pub subject_type: String,
}

impl AclKey {
    pub fn new(resource_id: &str, subject_id: &str, subject_type: &str) -> Self {
        Self {
            resource_id: resource_id.to_string(),
            subject_id: subject_id.to_string(),
            subject_type: subject_type.to_string(),
        }
    }

    /// Name of the first empty component, if any.
    pub fn missing_component(&self) -> Option<&'static str> {
        if self.resource_id.is_empty() {
            Some("resource_id")
        } else if self.subject_id.is_empty() {
            Some("subject_id")
        } else if self.subject_type.is_empty() {
            Some("subject_type")
        } else {
            None
        }
    }
}

impl fmt::Display for AclKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}:{}",
            self.resource_id, self.subject_type, self.subject_id
        )
    }
}

/// A permission grant staged inside a snapshot.
///
/// Grants are merged on commit: if a row already exists for the key, the
/// new bits are OR-ed into it rather than replacing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclGrant {
    pub key: AclKey,
    /// Raw permission bitmask.
    pub permissions: u32,
    /// Caller that issued the grant.
    pub requester_id: String,
}

/// An ACL row as stored in the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclEntryRecord {
    pub resource_id: String,
    pub subject_id: String,
    pub subject_type: String,
    pub permissions: u32,
    /// Requester of the most recent grant merged into this row.
    pub requester_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl AclEntryRecord {
    pub fn key(&self) -> AclKey {
        AclKey::new(&self.resource_id, &self.subject_id, &self.subject_type)
    }
}
