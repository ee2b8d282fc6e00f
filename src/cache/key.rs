//! Canonical cache keys.

use sha2::{Digest, Sha256};
use std::fmt;

/// Canonical key for a cached read.
///
/// Built from the resource path and its query parameters. Parameters are
/// trimmed and sorted, so `?b=2&a=1` and `?a=1&b=2` name the same entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
  /// Key for `path` with the given query parameters.
  pub fn new<K: AsRef<str>, V: AsRef<str>>(path: &str, query: &[(K, V)]) -> Self {
    let path = path.trim();
    let pairs = normalize(query);
    if pairs.is_empty() {
      return Self(path.to_string());
    }

    let encoded = url::form_urlencoded::Serializer::new(String::new())
      .extend_pairs(pairs)
      .finish();
    Self(format!("{}?{}", path, encoded))
  }

  /// Key for one page of a paged collection.
  ///
  /// `(resource, page, filter signature)`. Each page is its own entry, so
  /// moving to the next page never evicts the previous one.
  pub fn page<K: AsRef<str>, V: AsRef<str>>(resource: &str, page: u64, filters: &[(K, V)]) -> Self {
    Self(format!(
      "{}#page={}&filters={}",
      resource.trim(),
      page,
      filter_signature(filters)
    ))
  }

  /// Use `raw` verbatim.
  pub fn raw(raw: impl Into<String>) -> Self {
    Self(raw.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  pub fn starts_with(&self, prefix: &str) -> bool {
    self.0.starts_with(prefix)
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Stable, order-independent signature of a filter set.
///
/// SHA256 of the normalized pairs, truncated to 16 hex chars. Empty filters
/// produce `"none"`.
pub fn filter_signature<K: AsRef<str>, V: AsRef<str>>(filters: &[(K, V)]) -> String {
  let pairs = normalize(filters);
  if pairs.is_empty() {
    return "none".to_string();
  }

  let mut hasher = Sha256::new();
  for (k, v) in &pairs {
    hasher.update(k.as_bytes());
    hasher.update(b"=");
    hasher.update(v.as_bytes());
    hasher.update(b"&");
  }
  let digest = hex::encode(hasher.finalize());
  digest[..16].to_string()
}

/// Trim, drop empty names and sort.
fn normalize<K: AsRef<str>, V: AsRef<str>>(pairs: &[(K, V)]) -> Vec<(String, String)> {
  let mut out: Vec<(String, String)> = pairs
    .iter()
    .map(|(k, v)| (k.as_ref().trim().to_string(), v.as_ref().trim().to_string()))
    .filter(|(k, _)| !k.is_empty())
    .collect();
  out.sort();
  out
}
