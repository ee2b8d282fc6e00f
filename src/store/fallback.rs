//! Store wrapper that degrades to memory after the first storage failure.

use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::error;

use super::{LocalStore, MemoryStore, Record, Table};
use crate::error::SyncResult;
use crate::event::Notifier;

/// Wraps a durable store. Once the durable store fails, every later operation
/// for the session goes to an in-memory store and a single warning is surfaced.
pub struct FallbackStore {
  primary: Box<dyn LocalStore>,
  memory: MemoryStore,
  degraded: AtomicBool,
  notifier: Notifier,
}

impl FallbackStore {
  pub fn new(primary: Box<dyn LocalStore>, notifier: Notifier) -> Self {
    Self {
      primary,
      memory: MemoryStore::new(),
      degraded: AtomicBool::new(false),
      notifier,
    }
  }

  /// Start already degraded, e.g. when the durable store could not be opened.
  pub fn memory_only(notifier: Notifier) -> Self {
    let store = Self::new(Box::new(MemoryStore::new()), notifier);
    store.degrade("durable store could not be opened");
    store
  }

  pub fn is_degraded(&self) -> bool {
    self.degraded.load(Ordering::SeqCst)
  }

  fn degrade(&self, cause: &str) {
    if !self.degraded.swap(true, Ordering::SeqCst) {
      error!(cause, "Local store unavailable, continuing in memory");
      self.notifier.warning(
        "Offline storage unavailable",
        "Changes will be kept for this session only.",
      );
    }
  }

  fn run<T>(&self, op: impl Fn(&dyn LocalStore) -> SyncResult<T>) -> SyncResult<T> {
    if !self.is_degraded() {
      match op(self.primary.as_ref()) {
        Ok(v) => return Ok(v),
        Err(e) => self.degrade(&e.to_string()),
      }
    }
    op(&self.memory)
  }
}

impl LocalStore for FallbackStore {
  fn get_all(&self, table: Table) -> SyncResult<Vec<Record>> {
    self.run(|s| s.get_all(table))
  }

  fn add(&self, table: Table, data: &Value) -> SyncResult<i64> {
    self.run(|s| s.add(table, data))
  }

  fn clear(&self, table: Table) -> SyncResult<()> {
    self.run(|s| s.clear(table))
  }

  fn replace_all(&self, table: Table, rows: &[Value]) -> SyncResult<()> {
    self.run(|s| s.replace_all(table, rows))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::SyncError;
  use crate::event::drain_notifications;
  use serde_json::json;

  struct BrokenStore;

  impl LocalStore for BrokenStore {
    fn get_all(&self, _table: Table) -> SyncResult<Vec<Record>> {
      Err(SyncError::Storage("disk gone".into()))
    }

    fn add(&self, _table: Table, _data: &Value) -> SyncResult<i64> {
      Err(SyncError::Storage("disk gone".into()))
    }

    fn clear(&self, _table: Table) -> SyncResult<()> {
      Err(SyncError::Storage("disk gone".into()))
    }
  }

  #[test]
  fn test_degrades_once_and_keeps_working() {
    let notifier = Notifier::new();
    let mut rx = notifier.subscribe();
    let store = FallbackStore::new(Box::new(BrokenStore), notifier);

    store.add(Table::AnonymousCart, &json!({"a": 1})).unwrap();
    store.add(Table::AnonymousCart, &json!({"a": 2})).unwrap();
    assert!(store.is_degraded());
    assert_eq!(store.get_all(Table::AnonymousCart).unwrap().len(), 2);

    let warnings = drain_notifications(&mut rx);
    assert_eq!(warnings.len(), 1);
  }

  #[test]
  fn test_healthy_store_passes_through() {
    let store = FallbackStore::new(Box::new(MemoryStore::new()), Notifier::new());
    store.add(Table::PendingMutations, &json!(1)).unwrap();
    assert!(!store.is_degraded());
    assert_eq!(store.get_all(Table::PendingMutations).unwrap().len(), 1);
  }
}
