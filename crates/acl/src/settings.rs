use std::time::Duration;

use cadence_context::SettingsError;
use serde::Deserialize;

/// Permission cache settings.
///
/// ```toml
/// ttl_secs = 300
/// max_entries = 10000
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// How long a cached decision is trusted.
    pub ttl_secs: u64,
    pub max_entries: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        CacheSettings {
            ttl_secs: 300,
            max_entries: 10_000,
        }
    }
}

impl CacheSettings {
    pub fn from_toml_str(source: &str) -> Result<Self, SettingsError> {
        let settings: CacheSettings = toml::from_str(source)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.max_entries == 0 {
            return Err(SettingsError::Invalid {
                field: "max_entries",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let settings = CacheSettings::from_toml_str("").unwrap();
        assert_eq!(settings.ttl(), Duration::from_secs(300));
        assert_eq!(settings.max_entries, 10_000);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(matches!(
            CacheSettings::from_toml_str("max_entries = 0"),
            Err(SettingsError::Invalid {
                field: "max_entries",
                ..
            })
        ));
    }
}
