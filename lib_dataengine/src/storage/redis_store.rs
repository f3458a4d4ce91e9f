//! # Redis Storage
//!
//! Synchronous Redis wrapper persisting source data. Each source is a JSON
//! string under `dataengine:<client>:data:<source>`; a sorted set
//! `dataengine:<client>:meta:accessed` scores every source with its last access
//! time so old entries can be expired.

use std::time::Duration;

use chrono::Utc;
use redis::{Client, Commands};

use crate::core::data_set::DataSet;
use crate::error::Result;
use crate::storage::StorageBackend;

const KEY_PREFIX: &str = "dataengine";

/// A Redis-backed [`StorageBackend`].
pub struct RedisStorage {
    /// The internal Redis client instance.
    pub client: Client,
}

impl RedisStorage {
    /// Creates a backend from a connection string.
    ///
    /// # Arguments
    /// * `url` - The redis URL (e.g., "redis://127.0.0.1/").
    pub fn new(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        Ok(Self { client })
    }

    fn data_key(client: &str, source: &str) -> String {
        format!("{KEY_PREFIX}:{client}:data:{source}")
    }

    fn accessed_key(client: &str) -> String {
        format!("{KEY_PREFIX}:{client}:meta:accessed")
    }
}

impl StorageBackend for RedisStorage {
    fn store(&self, client: &str, source: &str, data: &DataSet) -> Result<()> {
        let payload = serde_json::to_string(data)?;
        let mut conn = self.client.get_connection()?;
        let _: () = conn.set(Self::data_key(client, source), payload)?;
        let _: () = conn.zadd(Self::accessed_key(client), source, Utc::now().timestamp())?;
        Ok(())
    }

    fn retrieve(&self, client: &str, source: &str) -> Result<DataSet> {
        let mut conn = self.client.get_connection()?;
        let payload: Option<String> = conn.get(Self::data_key(client, source))?;
        let Some(payload) = payload else {
            return Ok(DataSet::new());
        };
        let _: () = conn.zadd(Self::accessed_key(client), source, Utc::now().timestamp())?;
        Ok(serde_json::from_str(&payload)?)
    }

    fn expire(&self, client: &str, max_age: Duration) -> Result<usize> {
        let cutoff = Utc::now().timestamp() - max_age.as_secs() as i64;
        let accessed = Self::accessed_key(client);
        let mut conn = self.client.get_connection()?;

        let stale: Vec<String> = conn.zrangebyscore(&accessed, "-inf", cutoff)?;
        for source in &stale {
            let _: () = conn.del(Self::data_key(client, source))?;
            let _: () = conn.zrem(&accessed, source)?;
        }
        Ok(stale.len())
    }
}
