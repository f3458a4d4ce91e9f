//! # Core Engine Module
//!
//! The scheduler at the heart of the library. Components, leaf first:
//!
//! - **`data_set`**: key/value data of one source plus its dirty flag.
//! - **`consumer`**: consumer handles and the updates pushed to them.
//! - **`relay`**: shared timer nodes batching consumers of one source that
//!   asked for the same interval and alignment.
//! - **`data_source`**: one named source; owns its data, relays and direct
//!   subscribers and decides who is told about a change.
//! - **`provider`**: the plugin-host hooks producing and refreshing sources.
//! - **`actor`**: the task owning one engine's state, timers and coalescing.
//! - **`registry`**: the cloneable handle consumers and producers talk to.
//! - **`manager`**: the reference-counted table of named engines.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// The task that owns an engine's state.
mod actor;
/// Consumer identities, handles and update messages.
pub mod consumer;
/// Key/value data with a dirty flag.
pub mod data_set;
/// Named sources with their relays and subscribers.
pub mod data_source;
/// Reference-counted table of named engines.
pub mod manager;
/// Plugin-host hooks.
pub mod provider;
/// The engine handle.
pub mod registry;
/// Shared polling relays and interval alignment.
pub mod relay;

// --- Public API Re-exports ---
pub use consumer::{Consumer, ConsumerId, DataUpdate};
pub use data_set::{DataSet, Value};
pub use data_source::{RelayStats, SourceStats};
pub use manager::{EngineLoader, EngineManager, LoadedEngine, ProviderCatalog};
pub use provider::{EngineContext, NoopProvider, SourceProvider};
pub use registry::{RegistryEvent, RegistryStats, SourceRegistry};
pub use relay::{alignment_correction, clamp_interval, IntervalAlignment, ALIGNMENT_SKEW, MIN_POLLING_INTERVAL};
