//! Backend resources and cached reads over them.

use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::api::{ApiClient, Page};
use crate::cache::{CacheKey, FetchCache};
use crate::error::{SyncError, SyncResult};

pub const EQUIPMENTS_PATH: &str = "/api/equipments/";
pub const CATEGORIES_PATH: &str = "/api/categories/";
pub const CART_ITEMS_PATH: &str = "/api/cart-items/";

/// Categories change rarely.
const CATEGORIES_TTL: Duration = Duration::from_secs(60 * 60);

/// Read-through access to catalog data.
#[derive(Clone)]
pub struct CatalogClient {
  api: ApiClient,
  cache: FetchCache,
}

impl CatalogClient {
  pub fn new(api: ApiClient, cache: FetchCache) -> Self {
    Self { api, cache }
  }

  pub fn cache(&self) -> &FetchCache {
    &self.cache
  }

  /// Cached GET of any path.
  pub async fn fetch(&self, path: &str, query: &[(String, String)]) -> SyncResult<Value> {
    let key = CacheKey::new(path, query);
    self.get(&key, path, query.to_vec(), self.cache.default_ttl()).await
  }

  /// One page of the equipment listing.
  ///
  /// Pages are cached independently, keyed by page number and filter set.
  pub async fn equipments(&self, page: u64, filters: &[(String, String)]) -> SyncResult<Page<Value>> {
    let key = CacheKey::page(EQUIPMENTS_PATH, page, filters);
    let mut query: Vec<(String, String)> = filters
      .iter()
      .filter(|(k, _)| k.as_str() != "page")
      .cloned()
      .collect();
    query.push(("page".to_string(), page.to_string()));

    let value = self.get(&key, EQUIPMENTS_PATH, query, self.cache.default_ttl()).await?;
    Ok(serde_json::from_value(value)?)
  }

  pub async fn categories(&self) -> SyncResult<Vec<Value>> {
    let key = CacheKey::new::<&str, &str>(CATEGORIES_PATH, &[]);
    let value = self.get(&key, CATEGORIES_PATH, Vec::new(), CATEGORIES_TTL).await?;
    results_of(value)
  }

  /// A single listing. Served from any fresh cached page that contains it
  /// before falling back to the detail endpoint.
  pub async fn equipment(&self, id: &str) -> SyncResult<Value> {
    if let Some(found) = self.find_cached_equipment(id) {
      debug!(equipment_id = id, "Equipment served from cached page");
      return Ok(found);
    }
    let path = format!("{}{}/", EQUIPMENTS_PATH, id);
    let key = CacheKey::new::<&str, &str>(&path, &[]);
    self.get(&key, &path, Vec::new(), self.cache.default_ttl()).await
  }

  fn find_cached_equipment(&self, id: &str) -> Option<Value> {
    self
      .cache
      .fresh_with_prefix(EQUIPMENTS_PATH)
      .into_iter()
      .find_map(|value| {
        let listed = value.get("results").and_then(Value::as_array)?;
        listed.iter().find(|item| id_matches(item, id)).cloned()
      })
  }

  async fn get(&self, key: &CacheKey, path: &str, query: Vec<(String, String)>, ttl: Duration) -> SyncResult<Value> {
    let api = self.api.clone();
    let path = path.to_string();
    self
      .cache
      .fetch_cached(key, ttl, move || async move { api.get_json::<Value>(&path, &query).await })
      .await
  }
}

fn id_matches(item: &Value, id: &str) -> bool {
  match item.get("id") {
    Some(Value::String(s)) => s == id,
    Some(Value::Number(n)) => n.to_string() == id,
    _ => false,
  }
}

/// Accept either a bare list or a paged envelope.
fn results_of(value: Value) -> SyncResult<Vec<Value>> {
  match value {
    Value::Array(items) => Ok(items),
    Value::Object(mut map) => match map.remove("results") {
      Some(Value::Array(items)) => Ok(items),
      _ => Err(SyncError::Serialization("expected a list of results".to_string())),
    },
    _ => Err(SyncError::Serialization("expected a list of results".to_string())),
  }
}
