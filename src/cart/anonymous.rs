//! The cart of a user who has not logged in yet, kept in the local store.

use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use super::line::{Amount, CartLine};
use crate::error::SyncResult;
use crate::store::{load_all, save_all, LocalStore, Table};

pub struct AnonymousCart {
  store: Arc<dyn LocalStore>,
  lines: Mutex<Vec<CartLine>>,
}

impl AnonymousCart {
  pub fn open(store: Arc<dyn LocalStore>) -> SyncResult<Self> {
    let mut lines: Vec<CartLine> = load_all(store.as_ref(), Table::AnonymousCart)?;
    for line in &mut lines {
      line.recompute();
    }
    debug!(lines = lines.len(), "Loaded anonymous cart");
    Ok(Self {
      store,
      lines: Mutex::new(lines),
    })
  }

  pub fn lines(&self) -> Vec<CartLine> {
    self.lock().clone()
  }

  pub fn is_empty(&self) -> bool {
    self.lock().is_empty()
  }

  /// Add a line, merging into an existing line for the same item.
  ///
  /// On merge the quantities add up and the rental period is replaced by the
  /// new line's. A zero quantity adds nothing.
  pub fn add_item(&self, mut item: CartLine) -> SyncResult<Vec<CartLine>> {
    if item.quantity == 0 {
      debug!(item_id = %item.item_id, "Ignoring zero-quantity cart add");
      return Ok(self.lines());
    }
    self.update(|lines| {
      match lines.iter_mut().find(|l| l.item_id == item.item_id) {
        Some(existing) => {
          existing.quantity = existing.quantity.saturating_add(item.quantity);
          existing.start_date = item.start_date;
          existing.end_date = item.end_date;
          if item.available_quantity.is_some() {
            existing.available_quantity = item.available_quantity;
          }
          existing.recompute();
        }
        None => {
          item.id = None;
          item.recompute();
          lines.push(item);
        }
      }
      true
    })
  }

  pub fn remove_item(&self, item_id: &str) -> SyncResult<Vec<CartLine>> {
    self.update(|lines| {
      let before = lines.len();
      lines.retain(|l| l.item_id != item_id);
      lines.len() != before
    })
  }

  /// Set a line's quantity; zero removes it.
  pub fn update_quantity(&self, item_id: &str, quantity: u32) -> SyncResult<Vec<CartLine>> {
    if quantity == 0 {
      return self.remove_item(item_id);
    }
    self.update(|lines| match lines.iter_mut().find(|l| l.item_id == item_id) {
      Some(line) => {
        line.quantity = quantity;
        line.recompute();
        true
      }
      None => false,
    })
  }

  pub fn clear(&self) -> SyncResult<()> {
    self.lock().clear();
    self.store.clear(Table::AnonymousCart)
  }

  pub fn total_price(&self) -> Amount {
    self.lock().iter().map(|l| l.total).sum()
  }

  pub fn total_items(&self) -> u32 {
    self.lock().iter().map(|l| l.quantity).sum()
  }

  /// Apply `change`; if it reports a modification, persist the new contents.
  fn update(&self, change: impl FnOnce(&mut Vec<CartLine>) -> bool) -> SyncResult<Vec<CartLine>> {
    let mut lines = self.lock();
    let mut next = lines.clone();
    if change(&mut next) {
      save_all(self.store.as_ref(), Table::AnonymousCart, &next)?;
      *lines = next;
    }
    Ok(lines.clone())
  }

  fn lock(&self) -> MutexGuard<'_, Vec<CartLine>> {
    self.lines.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }
}
