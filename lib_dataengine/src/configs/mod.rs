//! # Configuration Modules
//!
//! Construction-time policy for engines, read from JSON documents.

/// Per-engine policy: population cap, update spacing, polling period and storage location.
pub mod engine_config;

pub use engine_config::{EngineConfig, REMOTE_MIN_UPDATE_INTERVAL_MS};
