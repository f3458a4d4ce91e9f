//! # Engine Monitor
//!
//! Acquires one engine through the process-wide manager, connects a consumer
//! to the configured sources and prints every update it receives until
//! Ctrl-C. The built-in clock provider is registered under the configured
//! engine name, so out of the box the monitor shows the time in `Local` and
//! `UTC` (or any IANA zone passed with `--sources`).
//!
//! Storage is enabled for every connected source when a storage directory is
//! configured: the last readings come back on the next start.

mod monitor_config;

use anyhow::{Context, Result};
use clap::Parser;
use lib_dataengine::loggers::init_logging;
use lib_dataengine::providers::ClockProvider;
use lib_dataengine::{Consumer, DataUpdate, EngineManager, LoadedEngine, ProviderCatalog, SourceRegistry};
use monitor_config::MonitorConfig;
use std::time::Duration;
use tokio::time::{interval_at, Instant};
use tracing::{info, warn};

/// Renders one update as `source: key=value, ...`.
fn render(update: &DataUpdate) -> String {
    let fields: Vec<String> = update
        .data
        .iter()
        .map(|(key, value)| match value.as_str() {
            Some(text) => format!("{}={}", key, text),
            None => format!("{}={}", key, value),
        })
        .collect();
    format!("{}: {}", update.source, fields.join(", "))
}

/// Connects `consumer` to every configured source; returns how many exist.
async fn connect_all(registry: &SourceRegistry, consumer: &Consumer, config: &MonitorConfig) -> Result<usize> {
    let alignment = config.interval_alignment()?;
    let mut connected = 0;
    for source in config.source_list() {
        if registry
            .connect(source, consumer, config.interval(), alignment)
            .await
        {
            if config.storage_dir.is_some() {
                registry.set_storage_enabled(source, true);
            }
            connected += 1;
        } else {
            warn!("Source '{}' is not available in engine '{}'", source, registry.name());
        }
    }
    Ok(connected)
}

#[tokio::main]
async fn main() -> Result<()> {
    // --- 1. Configuration and logging ---
    let config = MonitorConfig::layered(MonitorConfig::parse())?;
    let _guard = init_logging(&config.logger_options()).context("Failed to initialize logging")?;
    info!("Configuration loaded: {:?}", config);

    // --- 2. Engine ---
    let engine_config = config.engine_config();
    info!("{}", engine_config);
    let engine_name = config.engine_name().to_string();
    ProviderCatalog::global().register(&engine_name, move || {
        LoadedEngine::new(engine_config.clone(), Box::new(ClockProvider::new()))
    });

    let manager = EngineManager::global();
    let registry = manager.acquire(&engine_name);
    if !registry.is_valid() {
        anyhow::bail!("Engine '{}' could not be started", engine_name);
    }

    // --- 3. Consumer ---
    let (consumer, mut updates) = Consumer::new("engine_monitor");
    let connected = connect_all(&registry, &consumer, &config).await?;
    if connected == 0 {
        warn!("No source could be connected; waiting for Ctrl-C");
    }

    // --- 4. Main loop ---
    let report_enabled = config.report_interval().is_some();
    let period = config.report_interval().unwrap_or(Duration::from_secs(3600));
    let mut report = interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            Some(update) = updates.recv() => {
                println!("{}", render(&update));
            }
            _ = report.tick(), if report_enabled => {
                manager.report().await;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, shutting down");
                break;
            }
        }
    }

    // --- 5. Shutdown ---
    for source in config.source_list() {
        registry.disconnect(source, &consumer);
    }
    drop(registry);
    manager.release_and_wait(&engine_name).await;
    info!("Engine '{}' released", engine_name);
    Ok(())
}
