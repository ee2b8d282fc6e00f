//! SQLite-backed durable store.

use rusqlite::{params, Connection};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

use super::{LocalStore, Record, Table};
use crate::error::{SyncError, SyncResult};

/// SQLite-based local store implementation.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open (or create) the store at `path`, or at the default location.
  pub fn open(path: Option<&Path>) -> SyncResult<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| SyncError::Storage(format!("Failed to create store directory: {}", e)))?;
    }

    let conn = Connection::open(&path).map_err(|e| {
      SyncError::Storage(format!(
        "Failed to open store at {}: {}",
        path.display(),
        e
      ))
    })?;
    debug!(path = %path.display(), "Opened local store");

    Self::with_connection(conn)
  }

  /// Open a private in-memory database. Nothing survives the process.
  pub fn open_in_memory() -> SyncResult<Self> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  fn with_connection(conn: Connection) -> SyncResult<Self> {
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;
    Ok(store)
  }

  /// Get the default database path.
  pub fn default_path() -> SyncResult<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| SyncError::Storage("Could not determine data directory".to_string()))?;

    Ok(data_dir.join("rentsync").join("store.db"))
  }

  fn run_migrations(&self) -> SyncResult<()> {
    let conn = self.lock()?;
    conn
      .execute_batch(STORE_SCHEMA)
      .map_err(|e| SyncError::Storage(format!("Failed to run store migrations: {}", e)))?;
    Ok(())
  }

  fn lock(&self) -> SyncResult<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| SyncError::Storage(format!("Lock poisoned: {}", e)))
  }
}

/// One table per concern; rows are serialized JSON.
const STORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS pending_mutations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    data BLOB NOT NULL,
    stored_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS anonymous_cart (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    data BLOB NOT NULL,
    stored_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

fn insert(conn: &Connection, table: Table, data: &Value) -> SyncResult<i64> {
  let bytes = serde_json::to_vec(data)?;
  conn
    .execute(
      &format!("INSERT INTO {} (data) VALUES (?)", table.name()),
      params![bytes],
    )
    .map_err(|e| SyncError::Storage(format!("Failed to add record: {}", e)))?;
  Ok(conn.last_insert_rowid())
}

impl LocalStore for SqliteStore {
  fn get_all(&self, table: Table) -> SyncResult<Vec<Record>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare(&format!("SELECT id, data FROM {} ORDER BY id", table.name()))
      .map_err(|e| SyncError::Storage(format!("Failed to prepare query: {}", e)))?;

    let rows: Vec<(i64, Vec<u8>)> = stmt
      .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
      .map_err(|e| SyncError::Storage(format!("Failed to query records: {}", e)))?
      .collect::<Result<_, _>>()?;

    rows
      .into_iter()
      .map(|(id, bytes)| {
        let data = serde_json::from_slice(&bytes)?;
        Ok(Record { id, data })
      })
      .collect()
  }

  fn add(&self, table: Table, data: &Value) -> SyncResult<i64> {
    let conn = self.lock()?;
    insert(&conn, table, data)
  }

  fn clear(&self, table: Table) -> SyncResult<()> {
    let conn = self.lock()?;
    conn
      .execute(&format!("DELETE FROM {}", table.name()), [])
      .map_err(|e| SyncError::Storage(format!("Failed to clear {}: {}", table.name(), e)))?;
    Ok(())
  }

  fn replace_all(&self, table: Table, rows: &[Value]) -> SyncResult<()> {
    let mut conn = self.lock()?;

    let tx = conn
      .transaction()
      .map_err(|e| SyncError::Storage(format!("Failed to begin transaction: {}", e)))?;

    tx.execute(&format!("DELETE FROM {}", table.name()), [])
      .map_err(|e| SyncError::Storage(format!("Failed to clear {}: {}", table.name(), e)))?;
    for row in rows {
      insert(&tx, table, row)?;
    }

    tx.commit()
      .map_err(|e| SyncError::Storage(format!("Failed to commit transaction: {}", e)))?;
    Ok(())
  }
}
