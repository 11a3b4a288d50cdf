//! Correlation identifiers carried by every context.
//!
//! The wire shape follows the W3C `traceparent` header
//! (`{version}-{trace_id}-{parent_id}-{flags}`), plus a request id that
//! callers assign per inbound request.

use serde::{Deserialize, Serialize};

/// Anything that carries correlation identifiers.
///
/// This is the seam through which inbound caller contexts are turned into
/// [`TraceInfo`]: the factory accepts any `Correlated` parent.
pub trait Correlated {
    fn trace_info(&self) -> &TraceInfo;

    /// A span tagged with this value's correlation identifiers.
    fn span(&self) -> tracing::Span {
        let trace = self.trace_info();
        tracing::info_span!(
            "unit_of_work",
            trace_id = %trace.trace_id,
            parent_id = %trace.parent_id,
            request_id = %trace.request_id,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TraceParseError {
    #[error("traceparent must have 4 fields, found {0}")]
    WrongFieldCount(usize),

    #[error("traceparent {field} is malformed: '{value}'")]
    InvalidField { field: &'static str, value: String },

    #[error("traceparent {field} must not be all zeros")]
    AllZero { field: &'static str },
}

/// Trace version, trace id, parent id, request id and flags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceInfo {
    pub version: String,
    pub trace_id: String,
    pub parent_id: String,
    pub request_id: String,
    pub flags: String,
}

impl TraceInfo {
    /// Start a new trace with random identifiers, for work that has no
    /// inbound caller.
    pub fn new_root() -> Self {
        TraceInfo {
            version: "00".to_string(),
            trace_id: format!("{:032x}", rand::random::<u128>()),
            parent_id: format!("{:016x}", rand::random::<u64>()),
            request_id: format!("{:016x}", rand::random::<u64>()),
            flags: "01".to_string(),
        }
    }

    /// Parse a `traceparent` header value.
    pub fn parse_traceparent(header: &str, request_id: &str) -> Result<Self, TraceParseError> {
        let parts: Vec<&str> = header.trim().split('-').collect();
        if parts.len() != 4 {
            return Err(TraceParseError::WrongFieldCount(parts.len()));
        }
        let version = hex_field("version", parts[0], 2)?;
        if version == "ff" {
            return Err(TraceParseError::InvalidField {
                field: "version",
                value: version,
            });
        }
        let trace_id = non_zero(hex_field("trace_id", parts[1], 32)?, "trace_id")?;
        let parent_id = non_zero(hex_field("parent_id", parts[2], 16)?, "parent_id")?;
        let flags = hex_field("flags", parts[3], 2)?;

        Ok(TraceInfo {
            version,
            trace_id,
            parent_id,
            request_id: request_id.to_string(),
            flags,
        })
    }

    /// Render back into a `traceparent` header value.
    pub fn to_traceparent(&self) -> String {
        format!(
            "{}-{}-{}-{}",
            self.version, self.trace_id, self.parent_id, self.flags
        )
    }
}

impl Correlated for TraceInfo {
    fn trace_info(&self) -> &TraceInfo {
        self
    }
}

fn hex_field(field: &'static str, value: &str, len: usize) -> Result<String, TraceParseError> {
    let valid = value.len() == len
        && value
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
    if valid {
        Ok(value.to_string())
    } else {
        Err(TraceParseError::InvalidField {
            field,
            value: value.to_string(),
        })
    }
}

fn non_zero(value: String, field: &'static str) -> Result<String, TraceParseError> {
    if value.chars().all(|c| c == '0') {
        Err(TraceParseError::AllZero { field })
    } else {
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";

    #[test]
    fn parses_valid_traceparent() {
        let info = TraceInfo::parse_traceparent(HEADER, "req-1").unwrap();
        assert_eq!(info.version, "00");
        assert_eq!(info.trace_id, "4bf92f3577b34da6a3ce929d0e0e4736");
        assert_eq!(info.parent_id, "00f067aa0ba902b7");
        assert_eq!(info.request_id, "req-1");
        assert_eq!(info.flags, "01");
        assert_eq!(info.to_traceparent(), HEADER);
    }

    #[test]
    fn rejects_wrong_field_count() {
        let err = TraceInfo::parse_traceparent("00-abc-01", "r").unwrap_err();
        assert_eq!(err, TraceParseError::WrongFieldCount(3));
    }

    #[test]
    fn rejects_uppercase_and_short_fields() {
        let upper = HEADER.replace("4bf92f", "4BF92F");
        assert!(matches!(
            TraceInfo::parse_traceparent(&upper, "r"),
            Err(TraceParseError::InvalidField {
                field: "trace_id",
                ..
            })
        ));
        assert!(matches!(
            TraceInfo::parse_traceparent("00-abcd-00f067aa0ba902b7-01", "r"),
            Err(TraceParseError::InvalidField {
                field: "trace_id",
                ..
            })
        ));
    }

    #[test]
    fn rejects_all_zero_ids_and_forbidden_version() {
        let zero_trace = "00-00000000000000000000000000000000-00f067aa0ba902b7-01";
        assert_eq!(
            TraceInfo::parse_traceparent(zero_trace, "r").unwrap_err(),
            TraceParseError::AllZero { field: "trace_id" }
        );
        let ff = HEADER.replacen("00", "ff", 1);
        assert!(matches!(
            TraceInfo::parse_traceparent(&ff, "r"),
            Err(TraceParseError::InvalidField {
                field: "version",
                ..
            })
        ));
    }

    #[test]
    fn root_traces_are_well_formed_and_distinct() {
        let a = TraceInfo::new_root();
        let b = TraceInfo::new_root();
        assert_ne!(a.trace_id, b.trace_id);
        let reparsed = TraceInfo::parse_traceparent(&a.to_traceparent(), &a.request_id).unwrap();
        assert_eq!(reparsed, a);
    }

    #[test]
    fn parse_errors_are_std_errors_with_readable_messages() {
        let err: Box<dyn std::error::Error> =
            Box::new(TraceInfo::parse_traceparent("00-abc-01", "r").unwrap_err());
        assert_eq!(err.to_string(), "traceparent must have 4 fields, found 3");
        assert_eq!(
            TraceParseError::AllZero { field: "parent_id" }.to_string(),
            "traceparent parent_id must not be all zeros"
        );
    }
}
