//! # Source Providers
//!
//! The plugin-host side of an engine. A provider produces sources on request
//! and refreshes them when polled. Hooks run on the registry actor itself and
//! receive an [`EngineContext`] that writes straight into the registry state,
//! so calling back into the engine from a hook never deadlocks. Producers
//! that work asynchronously keep a handle from [`EngineContext::handle`] and
//! publish through it later.

use crate::core::actor::SourceTable;
use crate::core::data_set::{DataSet, Value};
use crate::core::registry::SourceRegistry;

/// # Source Provider
///
/// Every hook has a default, so a provider only implements what it needs. A
/// provider that implements nothing is a plain push engine: sources exist only
/// when something publishes them.
pub trait SourceProvider: Send + 'static {
    /// Runs once on the actor before any command is handled.
    fn init(&mut self, _ctx: &mut EngineContext<'_>) {}

    /// A consumer asked for `name`, which does not exist. Return `true` after
    /// creating it with [`EngineContext::set_data`] (possibly empty for
    /// asynchronous producers).
    fn source_requested(&mut self, _name: &str, _ctx: &mut EngineContext<'_>) -> bool {
        false
    }

    /// `name` should be refreshed. Return `true` if new data was written.
    fn update_source(&mut self, _name: &str, _ctx: &mut EngineContext<'_>) -> bool {
        false
    }

    /// Names this provider can produce, advertised through `sources()`.
    fn sources(&self) -> Option<Vec<String>> {
        None
    }
}

/// Provider without hooks, for engines fed purely by `publish`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProvider;

impl SourceProvider for NoopProvider {}

/// # Engine Context
///
/// Producer-side access to the registry, valid for the duration of one hook.
pub struct EngineContext<'a> {
    table: &'a mut SourceTable,
}

impl<'a> EngineContext<'a> {
    pub(crate) fn new(table: &'a mut SourceTable) -> Self {
        Self { table }
    }

    /// Name of the engine the hook runs for.
    pub fn engine_name(&self) -> &str {
        self.table.name()
    }

    /// Handle for publishing after the hook returns.
    pub fn handle(&self) -> SourceRegistry {
        self.table.handle()
    }

    /// Sets one key, creating the source when absent. `Value::Null` removes the key.
    pub fn set_data<V: Into<Value>>(&mut self, source: &str, key: &str, value: V) {
        self.table.set_data(source, key, value.into());
    }

    /// Creates `source` without data if it does not exist yet.
    pub fn create_source(&mut self, source: &str) {
        self.table.set_data_set(source, &DataSet::new());
    }

    /// Applies a whole data set, creating the source when absent.
    pub fn set_data_set(&mut self, source: &str, data: &DataSet) {
        self.table.set_data_set(source, data);
    }

    /// Removes one key of an existing source.
    pub fn remove_data(&mut self, source: &str, key: &str) {
        self.table.remove_data(source, key);
    }

    /// Empties an existing source.
    pub fn remove_all_data(&mut self, source: &str) {
        self.table.remove_all_data(source);
    }

    /// Turns persistence of `source` on or off.
    pub fn set_storage_enabled(&mut self, source: &str, enabled: bool) {
        self.table.set_storage_enabled(source, enabled);
    }

    /// Removes a source, storing it first when storage is enabled.
    pub fn remove_source(&mut self, source: &str) {
        self.table.remove_source(source);
    }

    /// Current data of `source`, if it exists.
    pub fn data(&self, source: &str) -> Option<&DataSet> {
        self.table.data(source)
    }

    /// Names of every current source.
    pub fn source_names(&self) -> Vec<String> {
        self.table.source_names()
    }
}
