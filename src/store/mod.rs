//! Durable local key/value store.
//!
//! One logical table per concern, each record addressed by an auto-assigned id.
//! Only whole-table operations are offered: `get_all`, `add`, `clear`, and an
//! atomic `replace_all` built from them.

mod fallback;
mod memory;
mod sqlite;

pub use fallback::FallbackStore;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::SyncResult;

/// Logical tables kept by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
  PendingMutations,
  AnonymousCart,
}

impl Table {
  pub fn name(self) -> &'static str {
    match self {
      Table::PendingMutations => "pending_mutations",
      Table::AnonymousCart => "anonymous_cart",
    }
  }
}

/// A stored row.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
  pub id: i64,
  pub data: Value,
}

/// Storage backend for the durable tables.
pub trait LocalStore: Send + Sync {
  /// All records of a table in insertion order.
  fn get_all(&self, table: Table) -> SyncResult<Vec<Record>>;

  /// Append a record, returning its assigned id.
  fn add(&self, table: Table, data: &Value) -> SyncResult<i64>;

  /// Remove every record of a table.
  fn clear(&self, table: Table) -> SyncResult<()>;

  /// Replace a table's contents with `rows`.
  fn replace_all(&self, table: Table, rows: &[Value]) -> SyncResult<()> {
    self.clear(table)?;
    for row in rows {
      self.add(table, row)?;
    }
    Ok(())
  }
}

/// Load and deserialize every record of a table.
///
/// Rows that no longer deserialize are skipped with a warning rather than
/// failing the whole load.
pub fn load_all<T: DeserializeOwned>(store: &dyn LocalStore, table: Table) -> SyncResult<Vec<T>> {
  let records = store.get_all(table)?;
  let mut out = Vec::with_capacity(records.len());
  for record in records {
    match serde_json::from_value(record.data) {
      Ok(item) => out.push(item),
      Err(e) => warn!(table = table.name(), id = record.id, "Skipping unreadable record: {}", e),
    }
  }
  Ok(out)
}

/// Serialize `items` and replace the table with them.
pub fn save_all<T: Serialize>(store: &dyn LocalStore, table: Table, items: &[T]) -> SyncResult<()> {
  let rows = items
    .iter()
    .map(serde_json::to_value)
    .collect::<Result<Vec<_>, _>>()?;
  store.replace_all(table, &rows)
}
