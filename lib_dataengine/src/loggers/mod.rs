//! # Logging Setup
//!
//! Installs the process-wide `tracing` subscriber used by binaries embedding
//! the engine. The library itself logs through the `log` facade; the bridge
//! bundled with `tracing-subscriber` forwards those records, so one call here
//! captures both.
//!
//! Output goes to stdout (plain or JSON) and, when a log directory is given,
//! to a daily rotated JSON file written by a non-blocking worker.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::error::{EngineError, Result};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
/// # Logger Options
///
/// Controls where and how log records are written.
pub struct LoggerOptions {
    /// Prefix of the rotated log files.
    pub app_name: String,
    /// Filter directive used when `RUST_LOG` is not set (e.g. `info`, `lib_dataengine=debug`).
    pub level: String,
    /// Emit JSON lines on stdout instead of human readable text.
    pub json: bool,
    /// Directory for the rotated log file. `None` keeps output on stdout only.
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggerOptions {
    fn default() -> Self {
        Self {
            app_name: "dataengine".to_string(),
            level: "info".to_string(),
            json: false,
            log_dir: None,
        }
    }
}

impl LoggerOptions {
    /// Options for `app_name` with every other field defaulted.
    pub fn named(app_name: &str) -> Self {
        Self {
            app_name: app_name.to_string(),
            ..Self::default()
        }
    }
}

impl fmt::Display for LoggerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LoggerOptions {{ app: {}, level: {}, json: {}, dir: {} }}",
            self.app_name,
            self.level,
            self.json,
            self.log_dir
                .as_ref()
                .map(|d| d.display().to_string())
                .unwrap_or_else(|| "-".to_string())
        )
    }
}

/// # Initialize Logging
///
/// Installs the global subscriber described by `opts`.
///
/// ## Logic:
/// 1. Builds the filter from `RUST_LOG`, falling back to `opts.level`.
/// 2. Adds a stdout layer, JSON or plain.
/// 3. With `log_dir` set, creates the directory and adds a JSON file layer
///    rotated daily behind a non-blocking writer.
/// 4. Installs everything once per process.
///
/// # Returns
/// The worker guard of the file writer, if any. Keep it alive for the life of
/// the program; dropping it flushes and stops the writer.
///
/// # Errors
/// `LoggerError` for a bad filter directive or when a global subscriber is
/// already installed; `IoError` when the log directory cannot be created.
pub fn init_logging(opts: &LoggerOptions) -> Result<Option<WorkerGuard>> {
    // --- 1. Filter ---
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&opts.level))
        .map_err(|e| EngineError::LoggerError(format!("invalid level '{}': {}", opts.level, e)))?;

    // --- 2. Console ---
    let (json_console, plain_console) = if opts.json {
        (Some(tracing_subscriber::fmt::layer().json()), None)
    } else {
        (None, Some(tracing_subscriber::fmt::layer().with_target(true)))
    };

    // --- 3. Rotated file ---
    let (file_layer, guard) = match &opts.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = rolling::daily(dir, format!("{}.log", opts.app_name));
            let (writer, guard) = non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .json();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    // --- 4. Install ---
    tracing_subscriber::registry()
        .with(filter)
        .with(json_console)
        .with(plain_console)
        .with(file_layer)
        .try_init()
        .map_err(|e| EngineError::LoggerError(e.to_string()))?;

    log::info!("Logging initialized: {}", opts);
    Ok(guard)
}
