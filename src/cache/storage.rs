//! Cache-store registry trait and SQLite implementation.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::fetch::FetchResponse;

/// A single cached response.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  /// The stored response
  pub response: FetchResponse,
  /// When the response was written
  pub cached_at: DateTime<Utc>,
}

/// Trait for cache storage backends.
///
/// A backend holds a set of named stores (one per cache generation), each
/// mapping a request key to a response. Every method is atomic on its own.
pub trait CacheStorage: Send + Sync {
  /// Names of all stores, oldest first.
  fn keys(&self) -> Result<Vec<String>>;

  /// Delete a store and every entry in it. Returns false if it did not exist.
  fn delete(&self, name: &str) -> Result<bool>;

  /// Look up a request key in a store.
  fn lookup(&self, name: &str, key: &str) -> Result<Option<CachedResponse>>;

  /// Write one entry into an existing store, replacing any previous value.
  fn put(&self, name: &str, key: &str, response: &FetchResponse) -> Result<()>;

  /// Create the store if needed and write all entries, or nothing at all.
  fn put_all(&self, name: &str, entries: &[(String, FetchResponse)]) -> Result<()>;

  /// Request keys held by a store, in key order.
  fn entry_keys(&self, name: &str) -> Result<Vec<String>>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the database at the given path, or the default
  /// location when none is configured.
  pub fn open_at(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;

    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("swcache").join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- One row per cache generation
CREATE TABLE IF NOT EXISTS cache_stores (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Stored responses, keyed by request within a generation
CREATE TABLE IF NOT EXISTS cache_entries (
    store_id INTEGER NOT NULL,
    request_key TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (store_id, request_key),
    FOREIGN KEY (store_id) REFERENCES cache_stores(id) ON DELETE CASCADE
);
"#;

const UPSERT_ENTRY: &str = "INSERT OR REPLACE INTO cache_entries (store_id, request_key, status, headers, body, cached_at)
   VALUES (?, ?, ?, ?, ?, datetime('now'))";

fn store_id(conn: &Connection, name: &str) -> Result<Option<i64>> {
  conn
    .query_row(
      "SELECT id FROM cache_stores WHERE name = ?",
      params![name],
      |row| row.get(0),
    )
    .optional()
    .map_err(|e| eyre!("Failed to look up cache store {}: {}", name, e))
}

fn encode_headers(headers: &[(String, String)]) -> Result<String> {
  serde_json::to_string(headers).map_err(|e| eyre!("Failed to serialize headers: {}", e))
}

impl CacheStorage for SqliteStorage {
  fn keys(&self) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT name FROM cache_stores ORDER BY id")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list cache stores: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache store name: {}", e))?;

    Ok(names)
  }

  fn delete(&self, name: &str) -> Result<bool> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let Some(id) = store_id(&tx, name)? else {
      return Ok(false);
    };

    tx.execute("DELETE FROM cache_entries WHERE store_id = ?", params![id])
      .map_err(|e| eyre!("Failed to delete entries of cache store {}: {}", name, e))?;
    tx.execute("DELETE FROM cache_stores WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to delete cache store {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(true)
  }

  fn lookup(&self, name: &str, key: &str) -> Result<Option<CachedResponse>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT e.status, e.headers, e.body, e.cached_at FROM cache_entries e
         INNER JOIN cache_stores s ON s.id = e.store_id
         WHERE s.name = ? AND e.request_key = ?",
        params![name, key],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {} in {}: {}", key, name, e))?;

    match row {
      Some((status, headers, body, cached_at_str)) => {
        let headers: Vec<(String, String)> = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers for {}: {}", key, e))?;
        let cached_at = parse_datetime(&cached_at_str)?;
        Ok(Some(CachedResponse {
          response: FetchResponse {
            status,
            headers,
            body: Bytes::from(body),
          },
          cached_at,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, name: &str, key: &str, response: &FetchResponse) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    // Never resurrect a store that activation already pruned
    let id = store_id(&conn, name)?.ok_or_else(|| eyre!("Cache store {} does not exist", name))?;
    let headers = encode_headers(&response.headers)?;

    conn
      .execute(
        UPSERT_ENTRY,
        params![id, key, response.status, headers, response.body.as_ref()],
      )
      .map_err(|e| eyre!("Failed to store {} in {}: {}", key, name, e))?;

    Ok(())
  }

  fn put_all(&self, name: &str, entries: &[(String, FetchResponse)]) -> Result<()> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR IGNORE INTO cache_stores (name) VALUES (?)",
      params![name],
    )
    .map_err(|e| eyre!("Failed to open cache store {}: {}", name, e))?;

    let id = store_id(&tx, name)?.ok_or_else(|| eyre!("Cache store {} vanished", name))?;

    for (key, response) in entries {
      let headers = encode_headers(&response.headers)?;
      tx.execute(
        UPSERT_ENTRY,
        params![id, key, response.status, headers, response.body.as_ref()],
      )
      .map_err(|e| eyre!("Failed to store {} in {}: {}", key, name, e))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn entry_keys(&self, name: &str) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare(
        "SELECT e.request_key FROM cache_entries e
         INNER JOIN cache_stores s ON s.id = e.store_id
         WHERE s.name = ?
         ORDER BY e.request_key",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys = stmt
      .query_map(params![name], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list entries of {}: {}", name, e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read entry key: {}", e))?;

    Ok(keys)
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  fn storage() -> (TempDir, SqliteStorage) {
    let dir = TempDir::new().unwrap();
    let storage = SqliteStorage::open_at(Some(&dir.path().join("cache.db"))).unwrap();
    (dir, storage)
  }

  #[test]
  fn test_put_all_then_lookup() {
    let (_dir, storage) = storage();
    let entries = vec![
      (
        "https://food.example/".to_string(),
        FetchResponse::new(200, "<html>").with_header("content-type", "text/html"),
      ),
      (
        "https://food.example/data.json".to_string(),
        FetchResponse::new(200, "[]"),
      ),
    ];

    storage.put_all("v1", &entries).unwrap();

    assert_eq!(storage.keys().unwrap(), vec!["v1"]);
    let hit = storage.lookup("v1", "https://food.example/").unwrap().unwrap();
    assert_eq!(hit.response.body.as_ref(), b"<html>");
    assert_eq!(hit.response.header("Content-Type"), Some("text/html"));
    assert!(storage.lookup("v1", "https://food.example/missing").unwrap().is_none());
    assert_eq!(storage.entry_keys("v1").unwrap().len(), 2);
  }

  #[test]
  fn test_put_overwrites_and_requires_store() {
    let (_dir, storage) = storage();
    assert!(storage.put("v1", "k", &FetchResponse::new(200, "a")).is_err());

    storage.put_all("v1", &[]).unwrap();
    storage.put("v1", "k", &FetchResponse::new(200, "a")).unwrap();
    storage.put("v1", "k", &FetchResponse::new(200, "b")).unwrap();

    let hit = storage.lookup("v1", "k").unwrap().unwrap();
    assert_eq!(hit.response.body.as_ref(), b"b");
  }

  #[test]
  fn test_delete_removes_entries() {
    let (_dir, storage) = storage();
    storage
      .put_all("v1", &[("k".to_string(), FetchResponse::new(200, "a"))])
      .unwrap();
    storage.put_all("v2", &[]).unwrap();

    assert!(storage.delete("v1").unwrap());
    assert!(!storage.delete("v1").unwrap());
    assert_eq!(storage.keys().unwrap(), vec!["v2"]);

    // Re-creating the name must not bring old entries back
    storage.put_all("v1", &[]).unwrap();
    assert!(storage.lookup("v1", "k").unwrap().is_none());
  }

  #[test]
  fn test_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cache.db");
    {
      let storage = SqliteStorage::open_at(Some(&path)).unwrap();
      storage
        .put_all("v1", &[("k".to_string(), FetchResponse::new(200, "a"))])
        .unwrap();
    }

    let storage = SqliteStorage::open_at(Some(&path)).unwrap();
    assert_eq!(storage.keys().unwrap(), vec!["v1"]);
    assert!(storage.lookup("v1", "k").unwrap().is_some());
  }
}
