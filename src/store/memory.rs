//! In-memory store used when durable storage is disabled or unavailable.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

use super::{LocalStore, Record, Table};
use crate::error::{SyncError, SyncResult};

/// Store that keeps records for the lifetime of the process only.
#[derive(Default)]
pub struct MemoryStore {
  inner: Mutex<MemoryTables>,
}

#[derive(Default)]
struct MemoryTables {
  next_id: i64,
  tables: HashMap<Table, Vec<Record>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> SyncResult<std::sync::MutexGuard<'_, MemoryTables>> {
    self
      .inner
      .lock()
      .map_err(|e| SyncError::Storage(format!("Lock poisoned: {}", e)))
  }
}

impl LocalStore for MemoryStore {
  fn get_all(&self, table: Table) -> SyncResult<Vec<Record>> {
    Ok(self.lock()?.tables.get(&table).cloned().unwrap_or_default())
  }

  fn add(&self, table: Table, data: &Value) -> SyncResult<i64> {
    let mut inner = self.lock()?;
    inner.next_id += 1;
    let id = inner.next_id;
    inner.tables.entry(table).or_default().push(Record {
      id,
      data: data.clone(),
    });
    Ok(id)
  }

  fn clear(&self, table: Table) -> SyncResult<()> {
    self.lock()?.tables.remove(&table);
    Ok(())
  }
}
