//! # Data Engine Library
//!
//! Named, mutable data sources shared by many consumers. An engine (a
//! `SourceRegistry`) owns its sources; every source multiplexes its
//! subscribers onto direct pushes or shared polling relays, coalesces bursts
//! of writes into a single notification pass and can be persisted through a
//! pluggable storage collaborator. The `EngineManager` hands out engines by
//! name and reference-counts them.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// The scheduler core: data sets, sources, relays, registries and the manager.
pub mod core;
/// Engine configuration loaded from JSON documents.
pub mod configs;
/// Error taxonomy shared by the whole crate.
pub mod error;
/// Structured logging setup for binaries embedding the engine.
#[cfg(feature = "loggers")]
pub mod loggers;
/// Built-in source providers.
pub mod providers;
/// Storage collaborators used to persist source data.
pub mod storage;

// --- Public API Re-exports ---
pub use configs::EngineConfig;
pub use crate::core::{
    Consumer, ConsumerId, DataSet, DataUpdate, EngineContext, EngineLoader, EngineManager,
    IntervalAlignment, LoadedEngine, NoopProvider, ProviderCatalog, RegistryEvent, RegistryStats,
    SourceProvider, SourceRegistry, SourceStats, Value,
};
pub use error::{EngineError, Result};
pub use storage::{JsonFileStorage, MemoryStorage, StorageBackend};
