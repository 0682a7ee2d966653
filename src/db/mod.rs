pub mod schema;

use color_eyre::{eyre::eyre, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Database connection shared by the cache store, the sync queue and the
/// lifecycle manager.
///
/// The lock is only ever taken inside synchronous sections, never across an
/// `.await`.
pub struct Database {
  conn: Mutex<Connection>,
}

impl Database {
  /// Open or create the database at `path`
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Open a private in-memory database
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;

    Self::from_connection(conn)
  }

  fn from_connection(mut conn: Connection) -> Result<Self> {
    conn
      .pragma_update(None, "foreign_keys", true)
      .map_err(|e| eyre!("Failed to enable foreign keys: {}", e))?;

    run_migrations(&mut conn)?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  /// Lock the connection for a synchronous unit of work
  pub fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Upgrade the schema in a single transaction, so a crash mid-upgrade leaves
/// the previous version intact.
fn run_migrations(conn: &mut Connection) -> Result<()> {
  let version: i64 = conn
    .query_row("PRAGMA user_version", [], |row| row.get(0))
    .map_err(|e| eyre!("Failed to read schema version: {}", e))?;

  if version >= schema::SCHEMA_VERSION {
    return Ok(());
  }

  let tx = conn
    .transaction()
    .map_err(|e| eyre!("Failed to begin migration: {}", e))?;

  tx.execute_batch(schema::SCHEMA_V1)
    .map_err(|e| eyre!("Failed to run migrations: {}", e))?;
  tx.pragma_update(None, "user_version", schema::SCHEMA_VERSION)
    .map_err(|e| eyre!("Failed to record schema version: {}", e))?;

  tx.commit()
    .map_err(|e| eyre!("Failed to commit migration: {}", e))?;

  Ok(())
}
