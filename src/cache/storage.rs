//! Age-bounded response cache on top of the key-value store.

use chrono::{Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use super::traits::{CacheEntry, QueryKey};
use crate::db::KeyValueStore;

/// Prefix for cache entries in the key-value store.
const CACHE_PREFIX: &str = "cache:";

/// A cached payload returned by [`CacheStore::get`].
#[derive(Debug, Clone)]
pub struct CachedEntity<T> {
  pub entity: T,
  pub cached_at: chrono::DateTime<Utc>,
}

/// Persists the most recent successful response per resource key.
///
/// Entries older than the requested max age are treated as absent and purged
/// on read. There is no capacity bound: distinct keys accumulate until they
/// expire and are read again, or until [`CacheStore::clear`].
#[derive(Clone)]
pub struct CacheStore {
  storage: Arc<dyn KeyValueStore>,
}

impl CacheStore {
  pub fn new(storage: Arc<dyn KeyValueStore>) -> Self {
    Self { storage }
  }

  fn storage_key(key: &dyn QueryKey) -> String {
    format!("{}{}", CACHE_PREFIX, key.cache_hash())
  }

  /// Store `payload` for `key`, replacing any previous entry.
  pub fn put<T: Serialize>(&self, key: &dyn QueryKey, payload: &T) -> Result<()> {
    let entry = CacheEntry {
      key: key.description(),
      payload: serde_json::to_value(payload)
        .map_err(|e| eyre!("Failed to serialize cache payload: {}", e))?,
      stored_at: Utc::now(),
    };
    let json =
      serde_json::to_string(&entry).map_err(|e| eyre!("Failed to serialize cache entry: {}", e))?;

    self.storage.set(&Self::storage_key(key), &json)?;
    debug!(key = %entry.key, "cached response");
    Ok(())
  }

  /// Read a live entry. Expired or unreadable entries are removed and reported absent.
  pub fn get<T: DeserializeOwned>(
    &self,
    key: &dyn QueryKey,
    max_age: Duration,
  ) -> Result<Option<CachedEntity<T>>> {
    let storage_key = Self::storage_key(key);
    let Some(json) = self.storage.get(&storage_key)? else {
      return Ok(None);
    };

    let entry: CacheEntry = match serde_json::from_str(&json) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(key = %key.description(), error = %e, "dropping unreadable cache entry");
        self.storage.remove(&storage_key)?;
        return Ok(None);
      }
    };

    if Utc::now() - entry.stored_at > max_age {
      debug!(key = %entry.key, stored_at = %entry.stored_at, "purging expired cache entry");
      self.storage.remove(&storage_key)?;
      return Ok(None);
    }

    match serde_json::from_value(entry.payload) {
      Ok(entity) => Ok(Some(CachedEntity {
        entity,
        cached_at: entry.stored_at,
      })),
      Err(e) => {
        warn!(key = %entry.key, error = %e, "cached payload has unexpected shape");
        self.storage.remove(&storage_key)?;
        Ok(None)
      }
    }
  }

  /// Remove every cache entry.
  pub fn clear(&self) -> Result<()> {
    for key in self.storage.keys_with_prefix(CACHE_PREFIX)? {
      self.storage.remove(&key)?;
    }
    Ok(())
  }

  /// Number of entries on disk, live or expired.
  pub fn len(&self) -> Result<usize> {
    Ok(self.storage.keys_with_prefix(CACHE_PREFIX)?.len())
  }


  /// Rewrite the stored time of an entry as if it was cached `age` ago.
  #[cfg(test)]
  pub fn backdate(&self, key: &dyn QueryKey, age: Duration) {
    let storage_key = Self::storage_key(key);
    let mut entry: CacheEntry =
      serde_json::from_str(&self.storage.get(&storage_key).unwrap().unwrap()).unwrap();
    entry.stored_at = Utc::now() - age;
    self
      .storage
      .set(&storage_key, &serde_json::to_string(&entry).unwrap())
      .unwrap();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::ResourceKey;
  use crate::db::MemoryStore;

  fn store() -> CacheStore {
    CacheStore::new(Arc::new(MemoryStore::new()))
  }

  #[test]
  fn test_put_then_get_returns_value() {
    let cache = store();
    let key = ResourceKey::Expense { id: "7".into() };

    cache.put(&key, &vec![1, 2, 3]).unwrap();
    let hit = cache
      .get::<Vec<i32>>(&key, Duration::minutes(5))
      .unwrap()
      .unwrap();
    assert_eq!(hit.entity, vec![1, 2, 3]);
  }

  #[test]
  fn test_newest_write_wins() {
    let cache = store();
    let key = ResourceKey::AllExpenses;

    cache.put(&key, &"old").unwrap();
    cache.put(&key, &"new").unwrap();
    let hit = cache
      .get::<String>(&key, Duration::minutes(5))
      .unwrap()
      .unwrap();
    assert_eq!(hit.entity, "new");
    assert_eq!(cache.len().unwrap(), 1);
  }

  #[test]
  fn test_expired_entry_is_purged() {
    let cache = store();
    let key = ResourceKey::AllExpenses;

    cache.put(&key, &"payload").unwrap();
    cache.backdate(&key, Duration::minutes(6));

    assert!(cache
      .get::<String>(&key, Duration::minutes(5))
      .unwrap()
      .is_none());
    // Purged: a larger max age cannot bring it back
    assert!(cache
      .get::<String>(&key, Duration::hours(1))
      .unwrap()
      .is_none());
    assert_eq!(cache.len().unwrap(), 0);
  }

  #[test]
  fn test_distinct_keys_accumulate_without_bound() {
    let cache = store();
    for id in 0..50 {
      cache
        .put(&ResourceKey::Expense { id: id.to_string() }, &id)
        .unwrap();
    }
    assert_eq!(cache.len().unwrap(), 50);

    cache.clear().unwrap();
    assert_eq!(cache.len().unwrap(), 0);
  }

  #[test]
  fn test_mismatched_payload_is_absent() {
    let cache = store();
    let key = ResourceKey::AllExpenses;
    cache.put(&key, &"text").unwrap();

    assert!(cache
      .get::<Vec<u32>>(&key, Duration::minutes(5))
      .unwrap()
      .is_none());
    assert_eq!(cache.len().unwrap(), 0);
  }
}
