//! Durable, partitioned response store backed by SQLite.

use chrono::{DateTime, Duration};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use super::traits::{CacheEntry, PutOptions};
use crate::clock::Clock;
use crate::db::Database;
use crate::net::Response;

/// Named key→response store with staleness and entry-count bounds.
///
/// Each write is a single statement under the connection lock, so readers see
/// either the previous entry or the new one, never a mix.
pub struct CacheStore {
  db: Arc<Database>,
  clock: Arc<dyn Clock>,
}

impl CacheStore {
  pub fn new(db: Arc<Database>, clock: Arc<dyn Clock>) -> Self {
    Self { db, clock }
  }

  /// Open or create a partition.
  pub fn open(&self, cache_name: &str) -> Result<()> {
    let conn = self.db.lock()?;
    conn
      .execute(
        "INSERT OR IGNORE INTO cache_partitions (name, created_at) VALUES (?, ?)",
        params![cache_name, self.clock.now().timestamp_millis()],
      )
      .map_err(|e| eyre!("Failed to open cache {}: {}", cache_name, e))?;
    Ok(())
  }

  /// Look up an entry by normalized URL.
  pub fn get(&self, cache_name: &str, key: &str) -> Result<Option<CacheEntry>> {
    let conn = self.db.lock()?;

    let row: Option<(u16, String, Vec<u8>, i64)> = conn
      .query_row(
        "SELECT status, headers, body, stored_at FROM cache_entries
         WHERE cache_name = ? AND key_hash = ?",
        params![cache_name, hash_key(key)],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry {}: {}", key, e))?;

    match row {
      Some((status, headers, body, stored_at)) => {
        let headers: BTreeMap<String, String> = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers for {}: {}", key, e))?;
        let stored_at = DateTime::from_timestamp_millis(stored_at)
          .ok_or_else(|| eyre!("Invalid stored_at {} for {}", stored_at, key))?;

        Ok(Some(CacheEntry {
          key: key.to_string(),
          cache_name: cache_name.to_string(),
          status,
          headers,
          body,
          stored_at,
        }))
      }
      None => Ok(None),
    }
  }

  /// Store a response, replacing any previous entry for the same key.
  ///
  /// Fails if the partition was never opened or has been deleted. A replaced
  /// entry moves to the newest position; eviction removes entries
  /// in insertion order once `max_entries` is exceeded.
  pub fn put(
    &self,
    cache_name: &str,
    key: &str,
    response: &Response,
    options: PutOptions,
  ) -> Result<()> {
    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers for {}: {}", key, e))?;
    let now = self.clock.now().timestamp_millis();

    let mut conn = self.db.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    // Partitions are created by `open` only; a deleted one stays deleted
    let exists = tx
      .query_row(
        "SELECT 1 FROM cache_partitions WHERE name = ?",
        params![cache_name],
        |_| Ok(()),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up cache {}: {}", cache_name, e))?
      .is_some();
    if !exists {
      return Err(eyre!("Cache {} does not exist", cache_name));
    }

    tx.execute(
      "INSERT OR REPLACE INTO cache_entries (cache_name, key_hash, url, status, headers, body, stored_at)
       VALUES (?, ?, ?, ?, ?, ?, ?)",
      params![
        cache_name,
        hash_key(key),
        key,
        response.status,
        headers,
        response.body,
        now
      ],
    )
    .map_err(|e| eyre!("Failed to store cache entry {}: {}", key, e))?;

    if let Some(max_entries) = options.max_entries {
      let count: i64 = tx
        .query_row(
          "SELECT COUNT(*) FROM cache_entries WHERE cache_name = ?",
          params![cache_name],
          |row| row.get(0),
        )
        .map_err(|e| eyre!("Failed to count cache entries: {}", e))?;

      let excess = count - max_entries as i64;
      if excess > 0 {
        tx.execute(
          "DELETE FROM cache_entries WHERE seq IN (
             SELECT seq FROM cache_entries WHERE cache_name = ? ORDER BY seq ASC LIMIT ?
           )",
          params![cache_name, excess],
        )
        .map_err(|e| eyre!("Failed to evict cache entries: {}", e))?;
        debug!(cache = cache_name, evicted = excess, "evicted oldest entries");
      }
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  /// Whether the entry is older than `max_age`.
  pub fn is_stale(&self, entry: &CacheEntry, max_age: Duration) -> bool {
    self.clock.now() - entry.stored_at > max_age
  }

  /// Delete every partition whose name is not in `active`. Returns the names
  /// that were deleted.
  pub fn delete_partitions_not_in(&self, active: &[String]) -> Result<Vec<String>> {
    let doomed: Vec<String> = self
      .partitions()?
      .into_iter()
      .filter(|name| !active.contains(name))
      .collect();

    let mut conn = self.db.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    for name in &doomed {
      tx.execute(
        "DELETE FROM cache_entries WHERE cache_name = ?",
        params![name],
      )
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;
      tx.execute("DELETE FROM cache_partitions WHERE name = ?", params![name])
        .map_err(|e| eyre!("Failed to delete cache {}: {}", name, e))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(doomed)
  }

  /// Remove every entry from a partition, keeping the partition itself.
  pub fn clear(&self, cache_name: &str) -> Result<usize> {
    let conn = self.db.lock()?;
    conn
      .execute(
        "DELETE FROM cache_entries WHERE cache_name = ?",
        params![cache_name],
      )
      .map_err(|e| eyre!("Failed to clear cache {}: {}", cache_name, e))
  }

  /// Names of all existing partitions, sorted.
  pub fn partitions(&self) -> Result<Vec<String>> {
    let conn = self.db.lock()?;
    let mut stmt = conn
      .prepare("SELECT name FROM cache_partitions ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list caches: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache name: {}", e))?;

    Ok(names)
  }

  /// Number of entries in a partition.
  pub fn len(&self, cache_name: &str) -> Result<usize> {
    let conn = self.db.lock()?;
    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM cache_entries WHERE cache_name = ?",
        params![cache_name],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count cache entries: {}", e))?;
    Ok(count as usize)
  }

  /// Keys of a partition, oldest first.
  pub fn keys(&self, cache_name: &str) -> Result<Vec<String>> {
    let conn = self.db.lock()?;
    let mut stmt = conn
      .prepare("SELECT url FROM cache_entries WHERE cache_name = ? ORDER BY seq ASC")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys = stmt
      .query_map(params![cache_name], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list cache keys: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache key: {}", e))?;

    Ok(keys)
  }
}

/// SHA256 of the URL, for stable fixed-length primary keys
fn hash_key(key: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(key.as_bytes());
  hex::encode(hasher.finalize())
}
