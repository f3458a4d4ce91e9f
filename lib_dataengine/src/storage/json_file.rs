//! # JSON File Storage
//!
//! Keeps one document per engine at `<dir>/<client>.json`:
//!
//! ```json
//! { "Paris": { "accessed": "2025-01-01T10:00:00Z", "data": { "temp": 20 } } }
//! ```
//!
//! Every operation is a read-modify-write of the whole document under a lock
//! shared by every backend rooted at the same directory.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use static_init::dynamic;

use crate::core::data_set::DataSet;
use crate::error::{EngineError, Result};
use crate::storage::StorageBackend;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    accessed: DateTime<Utc>,
    data: DataSet,
}

type Document = BTreeMap<String, StoredEntry>;

/// Document locks keyed by storage directory.
#[dynamic(lazy)]
static DIRECTORY_LOCKS: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>> = Mutex::new(HashMap::new());

fn directory_lock(dir: &Path) -> Arc<Mutex<()>> {
    let mut locks = DIRECTORY_LOCKS.lock().unwrap_or_else(PoisonError::into_inner);
    Arc::clone(locks.entry(dir.to_path_buf()).or_default())
}

/// # JSON File Storage
///
/// File-backed [`StorageBackend`] rooted at a directory created on demand.
#[derive(Debug)]
pub struct JsonFileStorage {
    dir: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl JsonFileStorage {
    /// Creates a backend writing under `dir`.
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        let dir = dir.into();
        let lock = directory_lock(&dir);
        Self { dir, lock }
    }

    /// Root directory of the backend.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the document holding `client`'s entries.
    pub fn document_path(&self, client: &str) -> PathBuf {
        self.dir.join(format!("{client}.json"))
    }

    fn load(&self, client: &str) -> Result<Document> {
        match fs::read_to_string(self.document_path(client)) {
            Ok(text) if text.trim().is_empty() => Ok(Document::new()),
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Document::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, client: &str, document: &Document) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.document_path(client);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(document)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

impl StorageBackend for JsonFileStorage {
    fn store(&self, client: &str, source: &str, data: &DataSet) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut document = self.load(client)?;
        document.insert(
            source.to_string(),
            StoredEntry {
                accessed: Utc::now(),
                data: data.clone(),
            },
        );
        self.save(client, &document)?;
        log::debug!("Stored source '{}' for client '{}'", source, client);
        Ok(())
    }

    fn retrieve(&self, client: &str, source: &str) -> Result<DataSet> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut document = self.load(client)?;
        let Some(entry) = document.get_mut(source) else {
            return Ok(DataSet::new());
        };
        entry.accessed = Utc::now();
        let data = entry.data.clone();
        self.save(client, &document)?;
        Ok(data)
    }

    fn expire(&self, client: &str, max_age: Duration) -> Result<usize> {
        let age = chrono::Duration::from_std(max_age)
            .map_err(|e| EngineError::storage(client, e.to_string()))?;
        let cutoff = Utc::now() - age;

        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut document = self.load(client)?;
        let before = document.len();
        document.retain(|_, entry| entry.accessed >= cutoff);
        let removed = before - document.len();
        if removed > 0 {
            self.save(client, &document)?;
            log::info!("Expired {} stored sources for client '{}'", removed, client);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonFileStorage::new(dir.path().join("nested"));
        let mut data = DataSet::new();
        data.set_value("temp", json!(20));
        data.set_value("sky", json!("clear"));

        storage.store("weather", "Paris", &data).unwrap();
        assert!(storage.document_path("weather").is_file());

        let reopened = JsonFileStorage::new(dir.path().join("nested"));
        assert_eq!(reopened.retrieve("weather", "Paris").unwrap(), data);
        assert!(reopened.retrieve("weather", "Oslo").unwrap().is_empty());
        assert!(reopened.retrieve("time", "Local").unwrap().is_empty());
    }

    #[test]
    fn test_expire_rewrites_document() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonFileStorage::new(dir.path());
        let stale = Utc::now() - chrono::Duration::days(5);
        let document = format!(
            r#"{{"old":{{"accessed":"{}","data":{{"a":1}}}}}}"#,
            stale.to_rfc3339()
        );
        fs::write(storage.document_path("weather"), document).unwrap();
        storage.store("weather", "fresh", &DataSet::new()).unwrap();

        assert_eq!(storage.expire("weather", crate::storage::MAX_STORAGE_AGE).unwrap(), 1);
        assert_eq!(storage.expire("weather", crate::storage::MAX_STORAGE_AGE).unwrap(), 0);
        assert!(storage.retrieve("weather", "old").unwrap().is_empty());
    }

    #[test]
    fn test_backends_on_one_directory_share_a_lock() {
        let dir = tempfile::tempdir().unwrap();
        let first = JsonFileStorage::new(dir.path());
        let second = JsonFileStorage::new(dir.path());
        let other = JsonFileStorage::new(dir.path().join("other"));
        assert!(Arc::ptr_eq(&first.lock, &second.lock));
        assert!(!Arc::ptr_eq(&first.lock, &other.lock));

        let mut handles = Vec::new();
        for n in 0..8 {
            let storage = JsonFileStorage::new(dir.path());
            handles.push(std::thread::spawn(move || {
                let mut data = DataSet::new();
                data.set_value("n", json!(n));
                storage.store("weather", &format!("city{n}"), &data).unwrap();
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        for n in 0..8 {
            let data = first.retrieve("weather", &format!("city{n}")).unwrap();
            assert_eq!(data.get("n"), Some(&json!(n)));
        }
    }

    #[test]
    fn test_corrupt_document_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonFileStorage::new(dir.path());
        fs::write(storage.document_path("broken"), "{oops").unwrap();
        assert!(matches!(
            storage.retrieve("broken", "x"),
            Err(EngineError::JsonError(_))
        ));
    }
}
