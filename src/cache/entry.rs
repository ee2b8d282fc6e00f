//! Cache entries and change events.

use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;

/// A cached fetch result.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  pub key: String,
  pub value: Value,
  pub stored_at: Instant,
  pub ttl: Duration,
}

impl CacheEntry {
  pub fn new(key: impl Into<String>, value: Value, ttl: Duration) -> Self {
    Self {
      key: key.into(),
      value,
      stored_at: Instant::now(),
      ttl,
    }
  }

  /// Fresh while `now - stored_at < ttl`.
  pub fn is_fresh(&self) -> bool {
    self.age() < self.ttl
  }

  pub fn age(&self) -> Duration {
    Instant::now().saturating_duration_since(self.stored_at)
  }
}

/// Change notification for cache subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
  /// A fetch completed and its result was stored under this key
  Stored(String),
  /// The key was dropped by an explicit invalidation
  Invalidated(String),
}
