//! Durable key-value storage.
//!
//! Everything the client persists (cached responses, the pending-operation
//! queue, the last sync time, the signed-in user) goes through
//! [`KeyValueStore`] as string keys and JSON string values.

pub mod schema;

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Storage key holding the serialized pending-operation queue.
pub const PENDING_OPERATIONS_KEY: &str = "pending_operations";
/// Storage key holding the RFC 3339 time of the last successful sync.
pub const LAST_SYNC_KEY: &str = "last_sync_time";
/// Storage key holding the signed-in user.
pub const USER_KEY: &str = "user_data";
/// Storage key holding the last known expense list. Not subject to cache expiry.
pub const EXPENSES_SNAPSHOT_KEY: &str = "cached_expenses";

/// String key-value persistence.
pub trait KeyValueStore: Send + Sync {
  fn get(&self, key: &str) -> Result<Option<String>>;

  /// Insert or replace the value for `key`.
  fn set(&self, key: &str, value: &str) -> Result<()>;

  fn remove(&self, key: &str) -> Result<()>;

  /// All keys starting with `prefix`, in lexical order.
  fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

/// SQLite-backed store that survives process restarts.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open or create the database inside `data_dir`.
  pub fn open(data_dir: &Path) -> Result<Self> {
    let path = Self::db_path(data_dir);

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;

    Ok(store)
  }

  fn db_path(data_dir: &Path) -> PathBuf {
    data_dir.join("spendsync.db")
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute_batch(schema::SCHEMA)
      .map_err(|e| eyre!("Failed to run migrations: {}", e))?;
    Ok(())
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl KeyValueStore for SqliteStore {
  fn get(&self, key: &str) -> Result<Option<String>> {
    let conn = self.lock()?;
    conn
      .query_row("SELECT value FROM kv WHERE key = ?", params![key], |row| {
        row.get(0)
      })
      .optional()
      .map_err(|e| eyre!("Failed to read key {}: {}", key, e))
  }

  fn set(&self, key: &str, value: &str) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO kv (key, value, updated_at) VALUES (?, ?, datetime('now'))",
        params![key, value],
      )
      .map_err(|e| eyre!("Failed to write key {}: {}", key, e))?;
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute("DELETE FROM kv WHERE key = ?", params![key])
      .map_err(|e| eyre!("Failed to remove key {}: {}", key, e))?;
    Ok(())
  }

  fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT key FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key")
      .map_err(|e| eyre!("Failed to prepare key scan: {}", e))?;

    let keys = stmt
      .query_map(params![prefix], |row| row.get(0))
      .map_err(|e| eyre!("Failed to scan keys: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    Ok(keys)
  }
}

/// In-memory store for `--ephemeral` runs and tests. Nothing is persisted.
#[derive(Default)]
pub struct MemoryStore {
  entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, String>>> {
    self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl KeyValueStore for MemoryStore {
  fn get(&self, key: &str) -> Result<Option<String>> {
    Ok(self.lock()?.get(key).cloned())
  }

  fn set(&self, key: &str, value: &str) -> Result<()> {
    self.lock()?.insert(key.to_string(), value.to_string());
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<()> {
    self.lock()?.remove(key);
    Ok(())
  }

  fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
    Ok(
      self
        .lock()?
        .keys()
        .filter(|k| k.starts_with(prefix))
        .cloned()
        .collect(),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_sqlite_values_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();

    {
      let store = SqliteStore::open(dir.path()).unwrap();
      store.set(PENDING_OPERATIONS_KEY, "[]").unwrap();
      store.set("cache:abc", "{}").unwrap();
    }

    let store = SqliteStore::open(dir.path()).unwrap();
    assert_eq!(
      store.get(PENDING_OPERATIONS_KEY).unwrap().as_deref(),
      Some("[]")
    );
    assert_eq!(store.get("cache:abc").unwrap().as_deref(), Some("{}"));
  }

  #[test]
  fn test_sqlite_set_replaces_and_remove_deletes() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::open(dir.path()).unwrap();

    store.set("k", "one").unwrap();
    store.set("k", "two").unwrap();
    assert_eq!(store.get("k").unwrap().as_deref(), Some("two"));

    store.remove("k").unwrap();
    assert_eq!(store.get("k").unwrap(), None);
  }

  #[test]
  fn test_prefix_scan_ignores_other_keys() {
    let dir = tempfile::tempdir().unwrap();
    let sqlite = SqliteStore::open(dir.path()).unwrap();
    let memory = MemoryStore::new();

    for store in [&sqlite as &dyn KeyValueStore, &memory] {
      store.set("cache:b", "1").unwrap();
      store.set("cache:a", "1").unwrap();
      store.set("cachex", "1").unwrap();
      store.set(USER_KEY, "{}").unwrap();

      assert_eq!(
        store.keys_with_prefix("cache:").unwrap(),
        vec!["cache:a".to_string(), "cache:b".to_string()]
      );
    }
  }
}
