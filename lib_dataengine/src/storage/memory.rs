use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::core::data_set::DataSet;
use crate::error::{EngineError, Result};
use crate::storage::StorageBackend;

#[derive(Debug, Clone)]
struct Entry {
    accessed: DateTime<Utc>,
    data: DataSet,
}

/// # Memory Storage
///
/// A mutex-guarded map of `client -> source -> entry`. Nothing survives the
/// process, which is exactly what tests want.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    clients: Mutex<HashMap<String, HashMap<String, Entry>>>,
}

impl MemoryStorage {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries held for `client`.
    pub fn len(&self, client: &str) -> usize {
        let clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        clients.get(client).map_or(0, HashMap::len)
    }

    /// Whether nothing is stored for `client`.
    pub fn is_empty(&self, client: &str) -> bool {
        self.len(client) == 0
    }

    fn store_at(&self, client: &str, source: &str, data: &DataSet, accessed: DateTime<Utc>) {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        clients.entry(client.to_string()).or_default().insert(
            source.to_string(),
            Entry {
                accessed,
                data: data.clone(),
            },
        );
    }
}

impl StorageBackend for MemoryStorage {
    fn store(&self, client: &str, source: &str, data: &DataSet) -> Result<()> {
        self.store_at(client, source, data, Utc::now());
        Ok(())
    }

    fn retrieve(&self, client: &str, source: &str) -> Result<DataSet> {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = clients
            .get_mut(client)
            .and_then(|sources| sources.get_mut(source));
        Ok(match entry {
            Some(entry) => {
                entry.accessed = Utc::now();
                let mut data = entry.data.clone();
                data.mark_clean();
                data
            }
            None => DataSet::new(),
        })
    }

    fn expire(&self, client: &str, max_age: Duration) -> Result<usize> {
        let age = chrono::Duration::from_std(max_age)
            .map_err(|e| EngineError::storage(client, e.to_string()))?;
        let cutoff = Utc::now() - age;

        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sources) = clients.get_mut(client) else {
            return Ok(0);
        };
        let before = sources.len();
        sources.retain(|_, entry| entry.accessed >= cutoff);
        Ok(before - sources.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_store_and_retrieve() {
        let storage = MemoryStorage::new();
        let mut data = DataSet::new();
        data.set_value("temp", json!(20));

        storage.store("weather", "Paris", &data).unwrap();
        assert_eq!(storage.retrieve("weather", "Paris").unwrap(), data);
        assert!(storage.retrieve("weather", "Oslo").unwrap().is_empty());
        assert!(storage.retrieve("other", "Paris").unwrap().is_empty());
    }

    #[test]
    fn test_expire_drops_old_entries_only() {
        let storage = MemoryStorage::new();
        let data = DataSet::new();
        storage.store_at("weather", "old", &data, Utc::now() - chrono::Duration::days(5));
        storage.store("weather", "fresh", &data).unwrap();

        let removed = storage.expire("weather", crate::storage::MAX_STORAGE_AGE).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(storage.len("weather"), 1);
        assert_eq!(storage.expire("nobody", Duration::from_secs(1)).unwrap(), 0);
    }
}
