//! # Storage Module
//!
//! Persistence collaborators for storage-enabled sources. The registry only
//! ever talks to the [`StorageBackend`] trait, always from a blocking worker
//! thread, and treats every failure as non-fatal: errors are logged and the
//! source carries on without its stored copy.

use std::time::Duration;

use crate::core::data_set::DataSet;
use crate::error::Result;

/// In-process storage, mostly for tests and short-lived tools.
pub mod memory;
/// One JSON document per engine under a directory.
pub mod json_file;
/// Redis-backed storage.
#[cfg(feature = "connections")]
pub mod redis_store;

pub use json_file::JsonFileStorage;
pub use memory::MemoryStorage;
#[cfg(feature = "connections")]
pub use redis_store::RedisStorage;

/// Stored entries not accessed for this long are dropped after a retrieve.
pub const MAX_STORAGE_AGE: Duration = Duration::from_secs(4 * 24 * 60 * 60);

/// Delay between the first unsaved write of a source and its deferred store.
pub const STORE_DELAY: Duration = Duration::from_secs(180);

/// # Storage Backend
///
/// Key/value persistence namespaced per engine. `client` is always the
/// output of [`client_name`].
pub trait StorageBackend: Send + Sync {
    /// Persists the data of `source`, replacing any previous copy.
    fn store(&self, client: &str, source: &str, data: &DataSet) -> Result<()>;

    /// Loads the stored data of `source`. A missing entry is an empty set.
    fn retrieve(&self, client: &str, source: &str) -> Result<DataSet>;

    /// Drops every entry of `client` not accessed within `max_age`.
    ///
    /// # Returns
    /// The number of entries removed.
    fn expire(&self, client: &str, max_age: Duration) -> Result<usize>;
}

/// Storage-safe namespace for an engine name: every character outside
/// `[A-Za-z0-9]` becomes `_`.
pub fn client_name(engine: &str) -> String {
    engine
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_name_sanitises_separators() {
        assert_eq!(client_name("org.kde.time"), "org_kde_time");
        assert_eq!(client_name("weather-eu 2"), "weather_eu_2");
        assert_eq!(client_name("zoné"), "zon_");
    }
}
