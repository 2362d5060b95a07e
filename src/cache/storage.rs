//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::traits::{CachedResponse, RequestKey};

/// Trait for bucket storage backends.
///
/// Each call is atomic on its own. `add_all` is the only operation spanning
/// several keys and must be all-or-nothing.
pub trait CacheStorage: Send + Sync {
  /// Create the bucket if it does not exist yet.
  fn open(&self, bucket: &str) -> Result<()>;

  /// Whether a bucket with this name exists.
  fn has(&self, bucket: &str) -> Result<bool>;

  /// Store every entry, or none of them.
  fn add_all(&self, bucket: &str, entries: &[(RequestKey, CachedResponse)]) -> Result<()>;

  /// Look up a single request. Missing buckets behave as empty ones.
  fn match_request(&self, bucket: &str, key: &RequestKey) -> Result<Option<CachedResponse>>;

  /// Insert or replace a single entry, creating the bucket if needed.
  fn put(&self, bucket: &str, key: &RequestKey, response: &CachedResponse) -> Result<()>;

  /// Names of all buckets, oldest first.
  fn keys(&self) -> Result<Vec<String>>;

  /// Delete a bucket and everything in it. Returns false if it did not exist.
  fn delete(&self, bucket: &str) -> Result<bool>;

  /// Request keys stored in a bucket, in insertion order.
  fn entries(&self, bucket: &str) -> Result<Vec<RequestKey>>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the cache database at the default location.
  pub fn open_default() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open (or create) the cache database at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Non-persistent database.
  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
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

    Ok(data_dir.join("shellcache").join("cache.db"))
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
-- One row per named bucket (version tag)
CREATE TABLE IF NOT EXISTS buckets (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Request/response pairs
CREATE TABLE IF NOT EXISTS entries (
    bucket TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    status_text TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    response_type TEXT NOT NULL,
    cached_at TEXT NOT NULL,
    PRIMARY KEY (bucket, key_hash)
);

CREATE INDEX IF NOT EXISTS idx_entries_bucket ON entries(bucket);
"#;

fn ensure_bucket(conn: &Connection, bucket: &str) -> Result<()> {
  conn
    .execute(
      "INSERT OR IGNORE INTO buckets (name) VALUES (?)",
      params![bucket],
    )
    .map_err(|e| eyre!("Failed to create bucket {}: {}", bucket, e))?;
  Ok(())
}

fn insert_entry(
  conn: &Connection,
  bucket: &str,
  key: &RequestKey,
  response: &CachedResponse,
) -> Result<()> {
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers for {}: {}", key, e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO entries
         (bucket, key_hash, method, url, status, status_text, headers, body, response_type, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
      params![
        bucket,
        key.cache_hash(),
        key.method.as_str(),
        key.url,
        response.status,
        response.status_text,
        headers,
        response.body,
        response.response_type.as_str(),
        format_datetime(response.cached_at),
      ],
    )
    .map_err(|e| eyre!("Failed to store {} in bucket {}: {}", key, bucket, e))?;

  Ok(())
}

impl CacheStorage for SqliteStorage {
  fn open(&self, bucket: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    ensure_bucket(&conn, bucket)
  }

  fn has(&self, bucket: &str) -> Result<bool> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let found: Option<i64> = conn
      .query_row(
        "SELECT 1 FROM buckets WHERE name = ?",
        params![bucket],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query bucket {}: {}", bucket, e))?;

    Ok(found.is_some())
  }

  fn add_all(&self, bucket: &str, entries: &[(RequestKey, CachedResponse)]) -> Result<()> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    // Dropping the transaction without commit rolls everything back
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    ensure_bucket(&tx, bucket)?;
    for (key, response) in entries {
      insert_entry(&tx, bucket, key, response)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn match_request(&self, bucket: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare(
        "SELECT status, status_text, headers, body, response_type, cached_at FROM entries
         WHERE bucket = ? AND key_hash = ?",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let row: Option<(u16, String, String, Vec<u8>, String, String)> = stmt
      .query_row(params![bucket, key.cache_hash()], |row| {
        Ok((
          row.get(0)?,
          row.get(1)?,
          row.get(2)?,
          row.get(3)?,
          row.get(4)?,
          row.get(5)?,
        ))
      })
      .optional()
      .map_err(|e| eyre!("Failed to look up {}: {}", key, e))?;

    let Some((status, status_text, headers, body, response_type, cached_at)) = row else {
      return Ok(None);
    };

    let headers: BTreeMap<String, String> = serde_json::from_str(&headers)
      .map_err(|e| eyre!("Failed to deserialize headers for {}: {}", key, e))?;

    Ok(Some(CachedResponse {
      status,
      status_text,
      headers,
      body,
      response_type: response_type.parse()?,
      cached_at: parse_datetime(&cached_at)?,
    }))
  }

  fn put(&self, bucket: &str, key: &RequestKey, response: &CachedResponse) -> Result<()> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;
    ensure_bucket(&tx, bucket)?;
    insert_entry(&tx, bucket, key, response)?;
    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn keys(&self) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT name FROM buckets ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list buckets: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read bucket name: {}", e))?;

    Ok(names)
  }

  fn delete(&self, bucket: &str) -> Result<bool> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM entries WHERE bucket = ?", params![bucket])
      .map_err(|e| eyre!("Failed to delete entries of bucket {}: {}", bucket, e))?;
    let removed = tx
      .execute("DELETE FROM buckets WHERE name = ?", params![bucket])
      .map_err(|e| eyre!("Failed to delete bucket {}: {}", bucket, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn entries(&self, bucket: &str) -> Result<Vec<RequestKey>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT method, url FROM entries WHERE bucket = ? ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map(params![bucket], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
      })
      .map_err(|e| eyre!("Failed to list entries of {}: {}", bucket, e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read entry: {}", e))?;

    rows
      .into_iter()
      .map(|(method, url)| -> Result<RequestKey> {
        Ok(RequestKey {
          method: method.parse()?,
          url,
        })
      })
      .collect()
  }
}

fn format_datetime(dt: DateTime<Utc>) -> String {
  dt.format("%Y-%m-%d %H:%M:%S").to_string()
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
  use crate::net::{Method, Response, ResponseType};
  use tempfile::TempDir;
  use url::Url;

  fn key(path: &str) -> RequestKey {
    let url = Url::parse("https://app.test/").unwrap().join(path).unwrap();
    RequestKey::new(Method::Get, &url)
  }

  fn entry(body: &str) -> CachedResponse {
    CachedResponse::snapshot(Response::new(200, body).with_header("content-type", "text/plain"))
  }

  #[test]
  fn test_add_all_then_match() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage
      .add_all(
        "v1",
        &[(key("index.html"), entry("<html>")), (key("styles.css"), entry("body{}"))],
      )
      .unwrap();

    let hit = storage.match_request("v1", &key("styles.css")).unwrap().unwrap();
    assert_eq!(hit.body, b"body{}");
    assert_eq!(hit.response_type, ResponseType::Basic);
    assert_eq!(hit.headers.get("content-type").map(String::as_str), Some("text/plain"));

    assert!(storage.match_request("v1", &key("script.js")).unwrap().is_none());
    assert!(storage.match_request("v0", &key("styles.css")).unwrap().is_none());
    assert_eq!(storage.entries("v1").unwrap().len(), 2);
  }

  #[test]
  fn test_keys_in_creation_order_and_delete() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.open("v0").unwrap();
    storage.open("v1").unwrap();
    storage.put("v0", &key("index.html"), &entry("old")).unwrap();

    assert_eq!(storage.keys().unwrap(), vec!["v0", "v1"]);

    assert!(storage.delete("v0").unwrap());
    assert!(!storage.delete("v0").unwrap());
    assert_eq!(storage.keys().unwrap(), vec!["v1"]);
    assert!(storage.entries("v0").unwrap().is_empty());
    assert!(!storage.has("v0").unwrap());
  }

  #[test]
  fn test_put_replaces_existing_entry() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.put("v1", &key("data.json"), &entry("1")).unwrap();
    storage.put("v1", &key("data.json"), &entry("2")).unwrap();

    let hit = storage.match_request("v1", &key("data.json")).unwrap().unwrap();
    assert_eq!(hit.body, b"2");
    assert_eq!(storage.entries("v1").unwrap().len(), 1);
    assert!(storage.has("v1").unwrap());
  }

  #[test]
  fn test_add_all_rolls_back_on_failed_insert() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    {
      let conn = storage.conn.lock().unwrap();
      conn
        .execute_batch(
          "CREATE TRIGGER reject_styles BEFORE INSERT ON entries
           WHEN NEW.url LIKE '%styles.css'
           BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
        )
        .unwrap();
    }

    let result = storage.add_all(
      "v1",
      &[
        (key("index.html"), entry("<html>")),
        (key("styles.css"), entry("body{}")),
        (key("script.js"), entry("main()")),
      ],
    );

    assert!(result.is_err());
    assert!(storage.entries("v1").unwrap().is_empty());
    assert!(!storage.has("v1").unwrap());
    assert!(storage.match_request("v1", &key("index.html")).unwrap().is_none());
  }

  #[test]
  fn test_persists_across_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("nested").join("cache.db");

    {
      let storage = SqliteStorage::open_at(&path).unwrap();
      storage.add_all("v1", &[(key("index.html"), entry("<html>"))]).unwrap();
    }

    let storage = SqliteStorage::open_at(&path).unwrap();
    assert_eq!(storage.keys().unwrap(), vec!["v1"]);
    assert!(storage.match_request("v1", &key("index.html")).unwrap().is_some());
  }
}
