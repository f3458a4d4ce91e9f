//! # Monitor Configuration
//!
//! Layered settings of `engine_monitor`: built-in defaults, then an optional
//! JSON file, then environment variables and command-line flags. Every field
//! is optional so each layer only overrides what it names.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use lib_dataengine::loggers::LoggerOptions;
use lib_dataengine::{EngineConfig, IntervalAlignment};
use serde::{Deserialize, Serialize};

/// Config file read when `--config-path` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "engine_monitor.json";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Prints the sources of a data engine as they update", version)]
#[serde(rename_all = "camelCase")]
pub struct MonitorConfig {
    #[clap(long, env = "ENGINE_NAME", help = "Name of the engine to acquire.")]
    pub engine: Option<String>,

    #[clap(long, env = "ENGINE_SOURCES", value_delimiter = ',', help = "Comma separated sources to connect to.")]
    pub sources: Option<Vec<String>>,

    #[clap(long, env = "ENGINE_INTERVAL_MS", help = "Polling interval in milliseconds; 0 for event driven updates.")]
    pub interval_ms: Option<u64>,

    #[clap(long, env = "ENGINE_ALIGNMENT", help = "Tick alignment (none, minute, hour).")]
    pub alignment: Option<String>,

    #[clap(long, env = "ENGINE_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "ENGINE_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "ENGINE_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "ENGINE_LOG_JSON", help = "Write console logs as JSON lines.")]
    pub log_json: Option<bool>,

    #[clap(long, env = "ENGINE_STORAGE_DIR", help = "Directory of the JSON storage backend.")]
    pub storage_dir: Option<PathBuf>,

    #[clap(long, env = "ENGINE_MAX_SOURCES", help = "Maximum number of sources kept by the engine; 0 for unlimited.")]
    pub max_source_count: Option<usize>,

    #[clap(long, env = "ENGINE_MIN_UPDATE_INTERVAL_MS", help = "Minimum spacing of provider refreshes; negative disables refreshes on query.")]
    pub min_update_interval_ms: Option<i64>,

    #[clap(long, env = "ENGINE_REPORT_INTERVAL_SECS", help = "Seconds between engine statistics reports; 0 disables them.")]
    pub report_interval_secs: Option<u64>,
}

impl MonitorConfig {
    /// Built-in values, the lowest layer.
    pub fn defaults() -> Self {
        Self {
            engine: Some("time".to_string()),
            sources: Some(vec!["Local".to_string(), "UTC".to_string()]),
            interval_ms: Some(1000),
            alignment: Some("none".to_string()),
            log_level: Some("info".to_string()),
            log_json: Some(false),
            storage_dir: dirs::data_local_dir().map(|dir| dir.join("dataengine")),
            max_source_count: Some(16),
            min_update_interval_ms: Some(0),
            report_interval_secs: Some(60),
            ..Default::default()
        }
    }

    /// Merges two layers; values present in `other` win.
    pub fn merge(self, other: MonitorConfig) -> MonitorConfig {
        MonitorConfig {
            engine: other.engine.or(self.engine),
            sources: other.sources.or(self.sources),
            interval_ms: other.interval_ms.or(self.interval_ms),
            alignment: other.alignment.or(self.alignment),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            log_json: other.log_json.or(self.log_json),
            storage_dir: other.storage_dir.or(self.storage_dir),
            max_source_count: other.max_source_count.or(self.max_source_count),
            min_update_interval_ms: other.min_update_interval_ms.or(self.min_update_interval_ms),
            report_interval_secs: other.report_interval_secs.or(self.report_interval_secs),
        }
    }

    /// Reads one JSON layer. A missing file is not an error.
    pub fn from_file(path: &Path) -> Result<Option<MonitorConfig>> {
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(Some(config))
    }

    /// Stacks defaults, the config file named by `cli` (or the default file) and `cli`.
    pub fn layered(cli: MonitorConfig) -> Result<MonitorConfig> {
        let path = cli
            .config_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

        let mut config = Self::defaults();
        if let Some(file) = Self::from_file(&path)? {
            config = config.merge(file);
        }
        Ok(config.merge(cli))
    }

    /// Name of the engine to acquire.
    pub fn engine_name(&self) -> &str {
        self.engine.as_deref().unwrap_or("time")
    }

    /// Sources to connect, possibly empty.
    pub fn source_list(&self) -> &[String] {
        self.sources.as_deref().unwrap_or_default()
    }

    /// Relay interval requested for every connection.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.unwrap_or(0))
    }

    /// Parsed tick alignment.
    pub fn interval_alignment(&self) -> Result<IntervalAlignment> {
        let text = self.alignment.as_deref().unwrap_or("none");
        text.parse()
            .with_context(|| format!("Invalid alignment '{}'", text))
    }

    /// Period of the statistics report, `None` when disabled.
    pub fn report_interval(&self) -> Option<Duration> {
        self.report_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    /// Logging setup derived from this configuration.
    pub fn logger_options(&self) -> LoggerOptions {
        LoggerOptions {
            app_name: "engine_monitor".to_string(),
            level: self.log_level.clone().unwrap_or_else(|| "info".to_string()),
            json: self.log_json.unwrap_or(false),
            log_dir: self.log_dir.clone(),
        }
    }

    /// Engine policy derived from this configuration.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            name: self.engine_name().to_string(),
            max_source_count: self.max_source_count.unwrap_or(0),
            min_update_interval_ms: self.min_update_interval_ms.unwrap_or(-1),
            storage_dir: self.storage_dir.clone(),
            ..EngineConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_later_layers_win() {
        let file = MonitorConfig {
            engine: Some("weather".to_string()),
            interval_ms: Some(5000),
            ..Default::default()
        };
        let cli = MonitorConfig {
            interval_ms: Some(250),
            ..Default::default()
        };
        let merged = MonitorConfig::defaults().merge(file).merge(cli);
        assert_eq!(merged.engine_name(), "weather");
        assert_eq!(merged.interval(), Duration::from_millis(250));
        assert_eq!(merged.source_list(), ["Local".to_string(), "UTC".to_string()]);
    }

    #[test]
    fn test_layered_reads_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"engine":"clock","alignment":"minute","sources":["Europe/Athens"]}}"#).unwrap();

        let cli = MonitorConfig {
            config_path: Some(file.path().to_path_buf()),
            report_interval_secs: Some(0),
            ..Default::default()
        };
        let config = MonitorConfig::layered(cli).unwrap();
        assert_eq!(config.engine_name(), "clock");
        assert_eq!(config.source_list(), ["Europe/Athens".to_string()]);
        assert_eq!(config.interval_alignment().unwrap(), IntervalAlignment::AlignToMinute);
        assert!(config.report_interval().is_none());
        assert_eq!(config.engine_config().name, "clock");
        assert_eq!(config.engine_config().max_source_count, 16);
    }

    #[test]
    fn test_missing_file_is_skipped_and_bad_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = MonitorConfig {
            config_path: Some(dir.path().join("absent.json")),
            ..Default::default()
        };
        assert_eq!(MonitorConfig::layered(missing).unwrap().engine_name(), "time");

        let bad_path = dir.path().join("bad.json");
        fs::write(&bad_path, "{ not json").unwrap();
        let bad = MonitorConfig {
            config_path: Some(bad_path),
            ..Default::default()
        };
        assert!(MonitorConfig::layered(bad).is_err());
    }
}
