use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Minimum update spacing enforced on engines that set `forcesMinimumInterval`.
pub const REMOTE_MIN_UPDATE_INTERVAL_MS: i64 = 1000;

/// # Engine Config
///
/// Construction-time policy of one registry. Every field has a default, so a
/// document only needs to name what it changes:
///
/// ```json
/// { "name": "time", "maxSourceCount": 16, "minUpdateIntervalMs": 100 }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Engine name, also the storage namespace after sanitising.
    pub name: String,
    /// Population cap; 0 means unlimited.
    pub max_source_count: usize,
    /// Negative: never auto-update. Zero: always allow. Positive: enforced spacing.
    pub min_update_interval_ms: i64,
    /// Period of the engine-wide polling timer; 0 disables it.
    pub polling_interval_ms: u64,
    /// Floors the minimum update interval at one second.
    pub forces_minimum_interval: bool,
    /// Directory for the JSON file storage backend.
    pub storage_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            max_source_count: 0,
            min_update_interval_ms: -1,
            polling_interval_ms: 0,
            forces_minimum_interval: false,
            storage_dir: None,
        }
    }
}

impl EngineConfig {
    /// Default configuration carrying only a name.
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// Parses a JSON document.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a JSON file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    fn validate(&self) -> Result<()> {
        if self.name.chars().any(char::is_control) {
            return Err(EngineError::ConfigError(format!(
                "engine name {:?} contains control characters",
                self.name
            )));
        }
        Ok(())
    }

    /// Minimum update interval after the remote-engine floor is applied.
    pub fn effective_min_update_interval(&self) -> i64 {
        if self.forces_minimum_interval {
            self.min_update_interval_ms.max(REMOTE_MIN_UPDATE_INTERVAL_MS)
        } else {
            self.min_update_interval_ms
        }
    }

    /// Engine-wide polling period, `None` when disabled.
    pub fn polling_interval(&self) -> Option<Duration> {
        (self.polling_interval_ms > 0).then(|| Duration::from_millis(self.polling_interval_ms))
    }
}

impl fmt::Display for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EngineConfig
    Name: {},
    Max sources: {},
    Min update interval: {} ms,
    Polling interval: {} ms,
    Forces minimum interval: {},
    Storage dir: {:?}
",
            self.name,
            self.max_source_count,
            self.min_update_interval_ms,
            self.polling_interval_ms,
            self.forces_minimum_interval,
            self.storage_dir
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_from_empty_document() {
        let config = EngineConfig::from_json_str("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.min_update_interval_ms, -1);
        assert!(config.polling_interval().is_none());
    }

    #[test]
    fn test_camel_case_fields() {
        let config = EngineConfig::from_json_str(
            r#"{"name":"time","maxSourceCount":2,"minUpdateIntervalMs":100,"pollingIntervalMs":250}"#,
        )
        .unwrap();
        assert_eq!(config.name, "time");
        assert_eq!(config.max_source_count, 2);
        assert_eq!(config.effective_min_update_interval(), 100);
        assert_eq!(config.polling_interval(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_forced_minimum_interval() {
        let mut config = EngineConfig::named("remote");
        config.forces_minimum_interval = true;
        assert_eq!(config.effective_min_update_interval(), REMOTE_MIN_UPDATE_INTERVAL_MS);
        config.min_update_interval_ms = 5000;
        assert_eq!(config.effective_min_update_interval(), 5000);
    }

    #[test]
    fn test_from_json_file_and_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"name":"weather","storageDir":"/tmp/engines"}}"#).unwrap();
        let config = EngineConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.storage_dir, Some(PathBuf::from("/tmp/engines")));

        assert!(matches!(
            EngineConfig::from_json_str("{not json"),
            Err(EngineError::JsonError(_))
        ));
        assert!(matches!(
            EngineConfig::from_json_file("/definitely/not/here.json"),
            Err(EngineError::IoError(_))
        ));
    }
}
