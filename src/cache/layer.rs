//! Cache layer that coalesces and caches fetches.

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::entry::{CacheEntry, CacheEvent};
use super::key::CacheKey;
use crate::error::{SyncError, SyncResult};

type SharedFetch = Shared<BoxFuture<'static, SyncResult<Value>>>;

struct InFlight {
  generation: u64,
  fetch: SharedFetch,
}

#[derive(Default)]
struct State {
  entries: HashMap<String, CacheEntry>,
  in_flight: HashMap<String, InFlight>,
}

struct Inner {
  state: Mutex<State>,
  default_ttl: Duration,
  stale_while_revalidate: AtomicBool,
  generation: AtomicU64,
  events: broadcast::Sender<CacheEvent>,
}

/// What a lookup decided to do, computed under the lock.
enum Lookup {
  Hit(Value),
  Join(SharedFetch),
  Stale(Value),
}

/// Read cache with TTL expiry and single-flight coalescing.
///
/// Cheap to clone; clones share the same maps. The maps are only written
/// through this type.
#[derive(Clone)]
pub struct FetchCache {
  inner: Arc<Inner>,
}

impl FetchCache {
  pub fn new(default_ttl: Duration) -> Self {
    let (events, _rx) = broadcast::channel(128);
    Self {
      inner: Arc::new(Inner {
        state: Mutex::new(State::default()),
        default_ttl,
        stale_while_revalidate: AtomicBool::new(false),
        generation: AtomicU64::new(0),
        events,
      }),
    }
  }

  /// Serve expired entries immediately and refresh them in the background.
  pub fn with_stale_while_revalidate(self, enabled: bool) -> Self {
    self.inner.stale_while_revalidate.store(enabled, Ordering::SeqCst);
    self
  }

  pub fn default_ttl(&self) -> Duration {
    self.inner.default_ttl
  }

  /// Subscribe to store/invalidate events.
  pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
    self.inner.events.subscribe()
  }

  /// Return the cached value for `key`, fetching it if needed.
  ///
  /// 1. If a fetch for `key` is in flight, wait for that one. With
  ///    stale-while-revalidate on, a stale entry is returned instead
  /// 2. If a fresh entry exists, return it without fetching
  /// 3. Otherwise start one fetch; store its result on success. A failure is
  ///    not cached and is delivered to every waiter.
  ///
  /// The fetch runs on its own task, so it completes and populates the cache
  /// even if every caller stops waiting. `fetcher` is invoked under the cache
  /// lock and must not call back into the cache before returning its future.
  pub async fn fetch_cached<F, Fut>(&self, key: &CacheKey, ttl: Duration, fetcher: F) -> SyncResult<Value>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = SyncResult<Value>> + Send + 'static,
  {
    let lookup = {
      let mut state = self.lock();

      let stale_ok = self.inner.stale_while_revalidate.load(Ordering::SeqCst);
      if let Some(in_flight) = state.in_flight.get(key.as_str()) {
        match state.entries.get(key.as_str()) {
          Some(entry) if stale_ok => Lookup::Stale(entry.value.clone()),
          _ => {
            debug!(%key, "Joining in-flight fetch");
            Lookup::Join(in_flight.fetch.clone())
          }
        }
      } else {
        let cached = state
          .entries
          .get(key.as_str())
          .map(|entry| (entry.is_fresh(), entry.value.clone()));
        match cached {
          Some((true, value)) => Lookup::Hit(value),
          Some((false, stale)) if stale_ok => {
            debug!(%key, "Serving stale entry, revalidating");
            self.start_fetch(&mut state, key, ttl, fetcher());
            Lookup::Stale(stale)
          }
          _ => Lookup::Join(self.start_fetch(&mut state, key, ttl, fetcher())),
        }
      }
    };

    match lookup {
      Lookup::Hit(value) | Lookup::Stale(value) => Ok(value),
      Lookup::Join(fetch) => fetch.await,
    }
  }

  /// [`fetch_cached`](Self::fetch_cached) with the default TTL, deserialized.
  pub async fn fetch_as<T, F, Fut>(&self, key: &CacheKey, fetcher: F) -> SyncResult<T>
  where
    T: DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = SyncResult<Value>> + Send + 'static,
  {
    let value = self.fetch_cached(key, self.inner.default_ttl, fetcher).await?;
    Ok(serde_json::from_value(value)?)
  }

  /// Register and spawn a new fetch for `key`. Must be called with the lock held.
  fn start_fetch<Fut>(&self, state: &mut State, key: &CacheKey, ttl: Duration, fut: Fut) -> SharedFetch
  where
    Fut: Future<Output = SyncResult<Value>> + Send + 'static,
  {
    let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst);
    let inner = Arc::clone(&self.inner);
    let owned_key = key.as_str().to_string();

    let fetch = async move {
      let result = fut.await;
      complete(&inner, &owned_key, generation, ttl, &result);
      result
    }
    .boxed()
    .shared();

    state.in_flight.insert(
      key.as_str().to_string(),
      InFlight {
        generation,
        fetch: fetch.clone(),
      },
    );
    tokio::spawn(fetch.clone());
    fetch
  }

  /// Current entry for `key`, fresh or stale.
  pub fn peek(&self, key: &CacheKey) -> Option<CacheEntry> {
    self.lock().entries.get(key.as_str()).cloned()
  }

  /// Fresh values whose key starts with `prefix`.
  pub fn fresh_with_prefix(&self, prefix: &str) -> Vec<Value> {
    self
      .lock()
      .entries
      .values()
      .filter(|e| e.key.starts_with(prefix) && e.is_fresh())
      .map(|e| e.value.clone())
      .collect()
  }

  pub fn is_in_flight(&self, key: &CacheKey) -> bool {
    self.lock().in_flight.contains_key(key.as_str())
  }

  pub fn len(&self) -> usize {
    self.lock().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Drop the entry for `key`. A fetch already in flight for it still resolves
  /// its waiters but no longer writes into the cache.
  pub fn invalidate(&self, key: &CacheKey) {
    let removed = {
      let mut state = self.lock();
      let had_entry = state.entries.remove(key.as_str()).is_some();
      let had_fetch = state.in_flight.remove(key.as_str()).is_some();
      had_entry || had_fetch
    };
    if removed {
      debug!(%key, "Invalidated");
      let _ = self.inner.events.send(CacheEvent::Invalidated(key.to_string()));
    }
  }

  /// Drop every entry whose key starts with `prefix`.
  pub fn invalidate_prefix(&self, prefix: &str) {
    let removed: Vec<String> = {
      let mut state = self.lock();
      let mut keys: Vec<String> = state
        .entries
        .keys()
        .chain(state.in_flight.keys())
        .filter(|k| k.starts_with(prefix))
        .cloned()
        .collect();
      keys.sort();
      keys.dedup();
      for k in &keys {
        state.entries.remove(k);
        state.in_flight.remove(k);
      }
      keys
    };

    debug!(prefix, count = removed.len(), "Invalidated prefix");
    for key in removed {
      let _ = self.inner.events.send(CacheEvent::Invalidated(key));
    }
  }

  /// Drop everything, e.g. when the identity changes.
  pub fn clear(&self) {
    let mut state = self.lock();
    state.entries.clear();
    state.in_flight.clear();
  }

  fn lock(&self) -> MutexGuard<'_, State> {
    lock_state(&self.inner)
  }
}

fn lock_state(inner: &Inner) -> MutexGuard<'_, State> {
  // The lock is never held across an await; a poisoned lock leaves the maps
  // structurally valid.
  inner.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Finish a fetch: release the in-flight slot and store a success.
///
/// Only the fetch that still owns the slot may write; an invalidation in the
/// meantime means the result is already out of date.
fn complete(inner: &Inner, key: &str, generation: u64, ttl: Duration, result: &SyncResult<Value>) {
  let stored = {
    let mut state = lock_state(inner);
    let owns_slot = state
      .in_flight
      .get(key)
      .map(|f| f.generation == generation)
      .unwrap_or(false);
    if !owns_slot {
      return;
    }
    state.in_flight.remove(key);

    match result {
      Ok(value) => {
        state
          .entries
          .insert(key.to_string(), CacheEntry::new(key, value.clone(), ttl));
        true
      }
      Err(e) => {
        log_failure(key, e);
        false
      }
    }
  };

  if stored {
    let _ = inner.events.send(CacheEvent::Stored(key.to_string()));
  }
}

fn log_failure(key: &str, e: &SyncError) {
  if e.is_transient() {
    debug!(key, "Fetch failed: {}", e);
  } else {
    warn!(key, "Fetch failed: {}", e);
  }
}
