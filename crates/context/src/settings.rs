//! Context settings, loadable from TOML.
//!
//! ```toml
//! timeout_ms = 120000
//!
//! [retry]
//! retries = 5
//! base_delay_ms = 500
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::retry::RetryPolicy;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ContextSettings {
    /// Deadline for a unit of work, in milliseconds.
    pub timeout_ms: u64,
    pub retry: RetrySettings,
}

impl Default for ContextSettings {
    fn default() -> Self {
        ContextSettings {
            timeout_ms: 120_000,
            retry: RetrySettings::default(),
        }
    }
}

impl ContextSettings {
    pub fn from_toml_str(source: &str) -> Result<Self, SettingsError> {
        let settings: ContextSettings = toml::from_str(source)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.timeout_ms == 0 {
            return Err(SettingsError::Invalid {
                field: "timeout_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Backoff schedule for compensating actions.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Retries after the first attempt.
    pub retries: u32,
    pub base_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        RetrySettings {
            retries: 5,
            base_delay_ms: 500,
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.retries, Duration::from_millis(self.base_delay_ms))
    }
}
