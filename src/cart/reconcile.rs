//! Merges the anonymous cart into the server cart at login.

use futures::future::join_all;
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::anonymous::AnonymousCart;
use super::line::{CartLine, ServerCartLine};
use crate::api::{ApiClient, ApiRequest};
use crate::cache::{CacheKey, FetchCache};
use crate::error::{SyncError, SyncResult};
use crate::event::Notifier;
use crate::resources::CART_ITEMS_PATH;

/// One server call needed to fold an anonymous line into the server cart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOp {
  Create { line: CartLine, quantity: u32 },
  Update { line_id: String, item_id: String, quantity: u32 },
  /// The server line's item is out of stock.
  Remove { line_id: String, item_id: String },
}

impl MergeOp {
  fn item_id(&self) -> &str {
    match self {
      MergeOp::Create { line, .. } => &line.item_id,
      MergeOp::Update { item_id, .. } | MergeOp::Remove { item_id, .. } => item_id,
    }
  }
}

/// The calls a merge needs, and which items were clamped to stock.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergePlan {
  pub ops: Vec<MergeOp>,
  pub adjusted: Vec<String>,
}

/// Outcome of a login merge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
  pub created: usize,
  pub updated: usize,
  pub removed: usize,
  pub adjusted: Vec<String>,
  pub failed: Vec<String>,
}

/// Plan the merge of `anonymous` into `server`.
///
/// Same item on both sides: `min(server + anonymous, available)`. Item only in
/// the anonymous cart: a new line with `min(anonymous, available)`. Available
/// stock is the lowest value either side recorded; unknown stock does not clamp.
/// A server line clamped to zero is removed.
pub fn plan_merge(anonymous: &[CartLine], server: &[CartLine]) -> MergePlan {
  let mut plan = MergePlan::default();
  let by_item: HashMap<&str, &CartLine> = server.iter().map(|l| (l.item_id.as_str(), l)).collect();

  for anon in dedupe(anonymous) {
    let existing = by_item.get(anon.item_id.as_str()).copied();
    let available = [anon.available_quantity, existing.and_then(|l| l.available_quantity)]
      .into_iter()
      .flatten()
      .min()
      .unwrap_or(u32::MAX);

    match existing {
      Some(server_line) => {
        let wanted = server_line.quantity.saturating_add(anon.quantity);
        let quantity = wanted.min(available);
        if quantity < wanted {
          plan.adjusted.push(anon.item_id.clone());
        }
        match &server_line.id {
          Some(line_id) if quantity == 0 => plan.ops.push(MergeOp::Remove {
            line_id: line_id.clone(),
            item_id: anon.item_id.clone(),
          }),
          Some(line_id) if quantity != server_line.quantity => plan.ops.push(MergeOp::Update {
            line_id: line_id.clone(),
            item_id: anon.item_id.clone(),
            quantity,
          }),
          _ => {}
        }
      }
      None => {
        let quantity = anon.quantity.min(available);
        if quantity < anon.quantity {
          plan.adjusted.push(anon.item_id.clone());
        }
        if quantity > 0 {
          plan.ops.push(MergeOp::Create { line: anon, quantity });
        }
      }
    }
  }
  plan
}

/// Collapse duplicate anonymous lines for the same item.
fn dedupe(lines: &[CartLine]) -> Vec<CartLine> {
  let mut out: Vec<CartLine> = Vec::with_capacity(lines.len());
  for line in lines {
    match out.iter_mut().find(|l| l.item_id == line.item_id) {
      Some(seen) => {
        seen.quantity = seen.quantity.saturating_add(line.quantity);
        seen.available_quantity = match (seen.available_quantity, line.available_quantity) {
          (Some(a), Some(b)) => Some(a.min(b)),
          (a, b) => a.or(b),
        };
        seen.recompute();
      }
      None => out.push(line.clone()),
    }
  }
  out
}

/// Parse a cart endpoint response. An empty body is an empty cart.
fn parse_server_cart(value: Value) -> SyncResult<Vec<CartLine>> {
  let items = match value {
    Value::Null => return Ok(Vec::new()),
    Value::Array(items) => items,
    Value::Object(mut map) => match map.remove("results") {
      Some(Value::Array(items)) => items,
      _ => return Err(SyncError::Serialization("cart response has no results".to_string())),
    },
    other => return Err(SyncError::Serialization(format!("unexpected cart response: {}", other))),
  };
  items
    .into_iter()
    .map(|item| -> SyncResult<CartLine> { Ok(serde_json::from_value::<ServerCartLine>(item)?.into()) })
    .collect()
}

/// Owns the in-memory cart and keeps it consistent across login and logout.
pub struct CartReconciler {
  api: ApiClient,
  cache: FetchCache,
  anonymous: AnonymousCart,
  notifier: Notifier,
  cart: watch::Sender<Vec<CartLine>>,
}

impl CartReconciler {
  pub fn new(api: ApiClient, cache: FetchCache, anonymous: AnonymousCart, notifier: Notifier) -> Self {
    let initial = anonymous.lines();
    Self {
      api,
      cache,
      anonymous,
      notifier,
      cart: watch::channel(initial).0,
    }
  }

  pub fn anonymous(&self) -> &AnonymousCart {
    &self.anonymous
  }

  /// Observe the in-memory cart.
  pub fn watch(&self) -> watch::Receiver<Vec<CartLine>> {
    self.cart.subscribe()
  }

  pub fn current(&self) -> Vec<CartLine> {
    self.cart.borrow().clone()
  }

  /// Show the anonymous cart as the current cart.
  pub fn publish_anonymous(&self) {
    self.cart.send_replace(self.anonymous.lines());
  }

  /// Reload the server cart and make it the current cart.
  pub async fn refresh(&self) -> SyncResult<Vec<CartLine>> {
    let key = CacheKey::new::<&str, &str>(CART_ITEMS_PATH, &[]);
    self.cache.invalidate(&key);
    let api = self.api.clone();
    let value = self
      .cache
      .fetch_cached(&key, self.cache.default_ttl(), move || async move {
        api.request(reqwest::Method::GET, CART_ITEMS_PATH, None).await
      })
      .await?;
    let lines = parse_server_cart(value)?;
    self.cart.send_replace(lines.clone());
    Ok(lines)
  }

  /// Fold the anonymous cart into the server cart after login.
  ///
  /// Every merge call runs independently. Afterwards the anonymous cart is
  /// cleared and the current cart becomes a fresh copy of the server cart.
  /// If the session expires during the merge nothing is cleared.
  pub async fn on_login(&self) -> SyncResult<ReconcileReport> {
    let anonymous = self.anonymous.lines();
    if anonymous.is_empty() {
      debug!("No anonymous cart to merge");
      self.refresh().await?;
      return Ok(ReconcileReport::default());
    }

    let server = self.refresh().await?;
    let plan = plan_merge(&anonymous, &server);
    info!(ops = plan.ops.len(), adjusted = plan.adjusted.len(), "Merging anonymous cart");

    let results = join_all(plan.ops.iter().map(|op| self.apply(op))).await;

    let mut report = ReconcileReport {
      adjusted: plan.adjusted,
      ..Default::default()
    };
    let mut session_expired = false;
    for (op, result) in plan.ops.iter().zip(results) {
      match result {
        Ok(()) => match op {
          MergeOp::Create { .. } => report.created += 1,
          MergeOp::Update { .. } => report.updated += 1,
          MergeOp::Remove { .. } => report.removed += 1,
        },
        Err(SyncError::SessionExpired) => session_expired = true,
        Err(e) => {
          warn!(item_id = op.item_id(), "Cart merge failed: {}", e);
          report.failed.push(op.item_id().to_string());
        }
      }
    }
    if session_expired {
      return Err(SyncError::SessionExpired);
    }

    if !report.adjusted.is_empty() {
      self
        .notifier
        .warning("Cart adjusted", "Some quantities were adjusted to available stock");
    }
    if !report.failed.is_empty() {
      self.notifier.error(
        "Cart not fully merged",
        format!("{} item(s) from your cart could not be added", report.failed.len()),
      );
    }

    self.anonymous.clear()?;
    self.refresh().await?;
    Ok(report)
  }

  /// Drop the server cart of the current identity, in memory and cached.
  /// The anonymous cart is untouched.
  pub fn forget_server_cart(&self) {
    self.cart.send_replace(Vec::new());
    self.cache.invalidate_prefix(CART_ITEMS_PATH);
  }

  /// Forget every cart held on this client.
  pub fn on_logout(&self) -> SyncResult<()> {
    self.forget_server_cart();
    self.anonymous.clear()
  }

  async fn apply(&self, op: &MergeOp) -> SyncResult<()> {
    match op {
      MergeOp::Create { line, quantity } => {
        let req = ApiRequest::post(CART_ITEMS_PATH).json(line.create_body(*quantity));
        self.api.create(req).await?;
      }
      MergeOp::Update { line_id, quantity, .. } => {
        let req = ApiRequest::patch(format!("{}{}/", CART_ITEMS_PATH, line_id)).json(json!({ "quantity": quantity }));
        self.api.send(req).await?;
      }
      MergeOp::Remove { line_id, .. } => {
        self.api.send(ApiRequest::delete(format!("{}{}/", CART_ITEMS_PATH, line_id))).await?;
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cart::Amount;
  use crate::config::ApiConfig;
  use crate::event::{drain_notifications, Severity};
  use crate::store::MemoryStore;
  use pretty_assertions::assert_eq;
  use std::sync::Arc;
  use std::time::Duration;
  use wiremock::matchers::{body_json, method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  fn anon(item: &str, quantity: u32, available: u32) -> CartLine {
    CartLine::new(item, quantity, Amount::parse("5.00").unwrap()).with_available(available)
  }

  fn server_line(id: &str, item: &str, quantity: u32, available: u32) -> CartLine {
    let mut line = anon(item, quantity, available);
    line.id = Some(id.to_string());
    line
  }

  fn server_json(id: u64, item: u64, quantity: u32, available: u32) -> Value {
    json!({
      "id": id,
      "item": item,
      "item_details": {"id": item, "hourly_rate": "5.00", "available_quantity": available},
      "quantity": quantity,
      "total": 0
    })
  }

  fn reconciler_for(server: &MockServer, notifier: &Notifier) -> CartReconciler {
    let api = ApiClient::new(&ApiConfig::new(server.uri())).unwrap();
    api.set_csrf_token("tok");
    let anonymous = AnonymousCart::open(Arc::new(MemoryStore::new())).unwrap();
    CartReconciler::new(api, FetchCache::new(Duration::from_secs(60)), anonymous, notifier.clone())
  }

  async fn mount_cart(server: &MockServer, before: Value, after: Value) {
    Mock::given(method("GET"))
      .and(path("/api/cart-items/"))
      .respond_with(ResponseTemplate::new(200).set_body_json(before))
      .up_to_n_times(1)
      .mount(server)
      .await;
    Mock::given(method("GET"))
      .and(path("/api/cart-items/"))
      .respond_with(ResponseTemplate::new(200).set_body_json(after))
      .mount(server)
      .await;
  }

  #[test]
  fn test_plan_clamps_new_line_to_stock() {
    let plan = plan_merge(&[anon("5", 10, 4)], &[]);
    assert_eq!(plan.adjusted, vec!["5".to_string()]);
    match &plan.ops[..] {
      [MergeOp::Create { line, quantity }] => {
        assert_eq!(line.item_id, "5");
        assert_eq!(*quantity, 4);
      }
      other => panic!("unexpected plan: {:?}", other),
    }
  }

  #[test]
  fn test_plan_unions_existing_line() {
    let plan = plan_merge(&[anon("7", 2, 10)], &[server_line("31", "7", 3, 10)]);
    assert!(plan.adjusted.is_empty());
    assert_eq!(
      plan.ops,
      vec![MergeOp::Update {
        line_id: "31".into(),
        item_id: "7".into(),
        quantity: 5,
      }]
    );
  }

  #[test]
  fn test_plan_uses_lowest_known_stock() {
    let plan = plan_merge(&[anon("7", 4, 50)], &[server_line("31", "7", 3, 5)]);
    assert_eq!(plan.adjusted, vec!["7".to_string()]);
    assert_eq!(
      plan.ops,
      vec![MergeOp::Update {
        line_id: "31".into(),
        item_id: "7".into(),
        quantity: 5,
      }]
    );
  }

  #[test]
  fn test_plan_removes_server_line_without_stock() {
    let plan = plan_merge(&[anon("7", 2, 0)], &[server_line("31", "7", 3, 10)]);
    assert_eq!(plan.adjusted, vec!["7".to_string()]);
    assert_eq!(
      plan.ops,
      vec![MergeOp::Remove {
        line_id: "31".into(),
        item_id: "7".into(),
      }]
    );
  }

  #[test]
  fn test_plan_dedupes_anonymous_lines_and_skips_out_of_stock() {
    let plan = plan_merge(&[anon("1", 1, 9), anon("1", 2, 9), anon("2", 3, 0)], &[]);
    assert_eq!(plan.adjusted, vec!["2".to_string()]);
    assert_eq!(plan.ops.len(), 1);
    assert!(matches!(&plan.ops[0], MergeOp::Create { quantity: 3, .. }));
  }

  #[test]
  fn test_parse_empty_and_paged_cart() {
    assert!(parse_server_cart(Value::Null).unwrap().is_empty());
    let paged = json!({"count": 1, "results": [server_json(1, 2, 3, 4)]});
    assert_eq!(parse_server_cart(paged).unwrap().len(), 1);
    assert!(parse_server_cart(json!("oops")).is_err());
  }

  #[tokio::test]
  async fn test_login_clamps_and_notifies_once() {
    let server = MockServer::start().await;
    mount_cart(&server, json!([]), json!([server_json(40, 5, 4, 4), server_json(41, 6, 1, 1)])).await;
    Mock::given(method("POST"))
      .and(path("/api/cart-items/"))
      .and(body_json(json!({"item": "5", "quantity": 4})))
      .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 40})))
      .expect(1)
      .mount(&server)
      .await;
    Mock::given(method("POST"))
      .and(path("/api/cart-items/"))
      .and(body_json(json!({"item": "6", "quantity": 1})))
      .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 41})))
      .expect(1)
      .mount(&server)
      .await;

    let notifier = Notifier::new();
    let mut rx = notifier.subscribe();
    let reconciler = reconciler_for(&server, &notifier);
    reconciler.anonymous().add_item(anon("5", 10, 4)).unwrap();
    reconciler.anonymous().add_item(anon("6", 3, 1)).unwrap();

    let report = reconciler.on_login().await.unwrap();
    assert_eq!(report.created, 2);
    assert_eq!(report.adjusted.len(), 2);

    let warnings: Vec<_> = drain_notifications(&mut rx)
      .into_iter()
      .filter(|n| n.severity == Severity::Warning)
      .collect();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].message, "Some quantities were adjusted to available stock");

    let cart = reconciler.current();
    assert_eq!(cart[0].item_id, "5");
    assert_eq!(cart[0].quantity, 4);
    assert!(reconciler.anonymous().is_empty());
  }

  #[tokio::test]
  async fn test_login_unions_quantities() {
    let server = MockServer::start().await;
    mount_cart(&server, json!([server_json(31, 7, 3, 10)]), json!([server_json(31, 7, 5, 10)])).await;
    Mock::given(method("PATCH"))
      .and(path("/api/cart-items/31/"))
      .and(body_json(json!({"quantity": 5})))
      .respond_with(ResponseTemplate::new(200).set_body_json(server_json(31, 7, 5, 10)))
      .expect(1)
      .mount(&server)
      .await;

    let notifier = Notifier::new();
    let mut rx = notifier.subscribe();
    let reconciler = reconciler_for(&server, &notifier);
    reconciler.anonymous().add_item(anon("7", 2, 10)).unwrap();
    let mut cart_rx = reconciler.watch();

    let report = reconciler.on_login().await.unwrap();
    assert_eq!(report.updated, 1);
    assert!(report.adjusted.is_empty());
    assert!(drain_notifications(&mut rx).is_empty());

    assert!(cart_rx.has_changed().unwrap());
    let cart = cart_rx.borrow_and_update().clone();
    assert_eq!(cart.len(), 1);
    assert_eq!(cart[0].quantity, 5);
    assert_eq!(cart[0].total, Amount::parse("25.00").unwrap());
  }

  #[tokio::test]
  async fn test_login_deletes_line_that_went_out_of_stock() {
    let server = MockServer::start().await;
    mount_cart(&server, json!([server_json(31, 7, 3, 0)]), json!([])).await;
    Mock::given(method("DELETE"))
      .and(path("/api/cart-items/31/"))
      .respond_with(ResponseTemplate::new(204))
      .expect(1)
      .mount(&server)
      .await;

    let notifier = Notifier::new();
    let mut rx = notifier.subscribe();
    let reconciler = reconciler_for(&server, &notifier);
    reconciler.anonymous().add_item(anon("7", 2, 5)).unwrap();

    let report = reconciler.on_login().await.unwrap();
    assert_eq!(report.removed, 1);
    assert_eq!(report.adjusted, vec!["7".to_string()]);
    assert!(reconciler.current().is_empty());
    assert!(reconciler.anonymous().is_empty());

    let notes = drain_notifications(&mut rx);
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].severity, Severity::Warning);
  }

  #[tokio::test]
  async fn test_one_failed_line_does_not_block_others() {
    let server = MockServer::start().await;
    mount_cart(&server, json!([]), json!([server_json(50, 1, 1, 5)])).await;
    Mock::given(method("POST"))
      .and(path("/api/cart-items/"))
      .and(body_json(json!({"item": "1", "quantity": 1})))
      .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 50})))
      .expect(1)
      .mount(&server)
      .await;
    Mock::given(method("POST"))
      .and(path("/api/cart-items/"))
      .and(body_json(json!({"item": "2", "quantity": 1})))
      .respond_with(ResponseTemplate::new(400).set_body_json(json!({"detail": "Not available"})))
      .expect(1)
      .mount(&server)
      .await;

    let notifier = Notifier::new();
    let mut rx = notifier.subscribe();
    let reconciler = reconciler_for(&server, &notifier);
    reconciler.anonymous().add_item(anon("1", 1, 5)).unwrap();
    reconciler.anonymous().add_item(anon("2", 1, 5)).unwrap();

    let report = reconciler.on_login().await.unwrap();
    assert_eq!(report.created, 1);
    assert_eq!(report.failed, vec!["2".to_string()]);
    assert!(reconciler.anonymous().is_empty());

    let notes = drain_notifications(&mut rx);
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].severity, Severity::Error);
  }

  #[tokio::test]
  async fn test_session_expiry_keeps_anonymous_cart() {
    let server = MockServer::start().await;
    mount_cart(&server, json!([]), json!([])).await;
    Mock::given(method("POST"))
      .and(path("/api/cart-items/"))
      .respond_with(ResponseTemplate::new(401))
      .mount(&server)
      .await;
    Mock::given(method("POST"))
      .and(path("/api/accounts/token/refresh/"))
      .respond_with(ResponseTemplate::new(401))
      .mount(&server)
      .await;

    let notifier = Notifier::new();
    let reconciler = reconciler_for(&server, &notifier);
    reconciler.anonymous().add_item(anon("1", 1, 5)).unwrap();

    let err = reconciler.on_login().await.unwrap_err();
    assert!(matches!(err, SyncError::SessionExpired));
    assert_eq!(reconciler.anonymous().lines().len(), 1);
  }

  #[tokio::test]
  async fn test_logout_clears_everything() {
    let server = MockServer::start().await;
    let notifier = Notifier::new();
    let reconciler = reconciler_for(&server, &notifier);
    reconciler.anonymous().add_item(anon("1", 1, 5)).unwrap();
    reconciler.publish_anonymous();
    assert_eq!(reconciler.current().len(), 1);

    reconciler.on_logout().unwrap();
    assert!(reconciler.current().is_empty());
    assert!(reconciler.anonymous().is_empty());
  }
}
