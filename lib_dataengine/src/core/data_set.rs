//! # Data Set
//!
//! The leaf of the engine: the current key/value data of one source plus the
//! dirty flag that tells the registry whether a notification pass is owed.

use serde::{Deserialize, Serialize};
use std::collections::btree_map::{self, BTreeMap};
use std::sync::Arc;

/// Opaque value stored under a key. `Value::Null` is the "empty" value.
pub type Value = serde_json::Value;

/// # Data Set
///
/// An ordered mapping from key to [`Value`] with a dirty flag.
///
/// Setting `Value::Null` removes the key; removing an absent key is a no-op and
/// leaves the set clean, so repeated empty writes never trigger notification
/// storms. Serialises as a plain JSON object (the dirty flag is not persisted).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataSet {
    entries: BTreeMap<String, Value>,
    #[serde(skip)]
    dirty: bool,
}

impl DataSet {
    /// Creates an empty, clean data set.
    pub fn new() -> Self {
        Self::default()
    }

    /// # Set Value
    ///
    /// Upserts `key`, or removes it when `value` is `Value::Null`.
    ///
    /// # Returns
    /// `true` when the content actually changed; only then is the set marked dirty.
    pub fn set_value(&mut self, key: &str, value: Value) -> bool {
        let changed = if value.is_null() {
            self.entries.remove(key).is_some()
        } else {
            match self.entries.get(key) {
                Some(current) if *current == value => false,
                _ => {
                    self.entries.insert(key.to_string(), value);
                    true
                }
            }
        };

        if changed {
            self.dirty = true;
        }
        changed
    }

    /// Removes `key`. Same as `set_value(key, Value::Null)`.
    pub fn remove(&mut self, key: &str) -> bool {
        self.set_value(key, Value::Null)
    }

    /// Empties the set. No-op (stays clean) when already empty.
    pub fn clear(&mut self) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        self.entries.clear();
        self.dirty = true;
        true
    }

    /// Upserts every entry of `other` into `self`.
    ///
    /// Used when stored data is restored into a still-empty source.
    pub fn merge(&mut self, other: &DataSet) -> bool {
        let mut changed = false;
        for (key, value) in other.iter() {
            changed |= self.set_value(key, value.clone());
        }
        changed
    }

    /// Returns the value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    /// Whether `key` is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the set holds no keys.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates entries in key order.
    pub fn iter(&self) -> btree_map::Iter<'_, String, Value> {
        self.entries.iter()
    }

    /// Iterates keys in order.
    pub fn keys(&self) -> btree_map::Keys<'_, String, Value> {
        self.entries.keys()
    }

    /// Whether a content change happened since the last [`DataSet::mark_clean`].
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Clears the dirty flag after a flush point.
    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// Read-only snapshot handed to consumers. The copy is clean.
    pub fn snapshot(&self) -> Arc<DataSet> {
        Arc::new(DataSet {
            entries: self.entries.clone(),
            dirty: false,
        })
    }
}

// Equality is about content only; two sets with the same entries are equal
// whatever their flush state.
impl PartialEq for DataSet {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl Eq for DataSet {}

impl<K: Into<String>> FromIterator<(K, Value)> for DataSet {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        let entries = iter
            .into_iter()
            .map(|(k, v)| (k.into(), v))
            .filter(|(_, v)| !v.is_null())
            .collect();
        Self {
            entries,
            dirty: false,
        }
    }
}

impl<'a> IntoIterator for &'a DataSet {
    type Item = (&'a String, &'a Value);
    type IntoIter = btree_map::Iter<'a, String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_same_value_twice_dirties_once() {
        let mut set = DataSet::new();
        assert!(set.set_value("time", json!("12:00")));
        assert!(set.is_dirty());

        set.mark_clean();
        assert!(!set.set_value("time", json!("12:00")));
        assert!(!set.set_value("time", json!("12:00")));
        assert!(!set.is_dirty());
    }

    #[test]
    fn test_null_removes_existing_key_only() {
        let mut set = DataSet::new();
        assert!(!set.set_value("missing", Value::Null));
        assert!(!set.is_dirty(), "removing an absent key must not dirty the set");

        set.set_value("temp", json!(20));
        set.mark_clean();
        assert!(set.remove("temp"));
        assert!(set.is_dirty());
        assert!(set.is_empty());
    }

    #[test]
    fn test_clear_on_empty_is_noop() {
        let mut set = DataSet::new();
        assert!(!set.clear());
        assert!(!set.is_dirty());

        set.set_value("a", json!(1));
        set.mark_clean();
        assert!(set.clear());
        assert!(set.is_dirty());
    }

    #[test]
    fn test_snapshot_is_detached_and_clean() {
        let mut set: DataSet = vec![("a", json!(1)), ("b", Value::Null)].into_iter().collect();
        assert_eq!(set.len(), 1);

        let snap = set.snapshot();
        set.set_value("a", json!(2));
        assert_eq!(snap.get("a"), Some(&json!(1)));
        assert!(!snap.is_dirty());
        assert_ne!(*snap, set);
    }

    #[test]
    fn test_serialises_as_plain_object() {
        let mut set = DataSet::new();
        set.set_value("Time", json!("10:00"));
        let text = serde_json::to_string(&set).unwrap();
        assert_eq!(text, r#"{"Time":"10:00"}"#);

        let back: DataSet = serde_json::from_str(&text).unwrap();
        assert_eq!(back, set);
        assert!(!back.is_dirty());
    }
}
