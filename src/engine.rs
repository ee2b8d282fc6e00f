//! The sync engine: one context object owning the cache, the queue and the cart.
//!
//! Built once at startup and handed to whatever drives the UI. Reacts to auth
//! state transitions published by the session component.

use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::api::ApiClient;
use crate::cache::FetchCache;
use crate::cart::{AnonymousCart, CartLine, CartReconciler};
use crate::config::{Config, StorageConfig};
use crate::error::{SyncError, SyncResult};
use crate::event::{AuthState, Notification, Notifier, SessionSignal};
use crate::queue::{ApiReplayer, CartLineUpdate, DrainReport, DrainStop, ListingDraft, MutationKind, MutationQueue};
use crate::resources::CatalogClient;
use crate::store::{FallbackStore, LocalStore, MemoryStore, SqliteStore};

pub struct SyncEngine {
  notifier: Notifier,
  store: Arc<dyn LocalStore>,
  api: ApiClient,
  cache: FetchCache,
  catalog: CatalogClient,
  queue: MutationQueue,
  replayer: ApiReplayer,
  cart: CartReconciler,
  auth: watch::Sender<AuthState>,
}

/// Open the configured local store.
///
/// A durable store that cannot be opened degrades to memory with one warning
/// instead of failing startup.
pub fn open_store(config: &StorageConfig, notifier: &Notifier) -> Arc<dyn LocalStore> {
  if config.in_memory {
    debug!("Using in-memory store");
    return Arc::new(MemoryStore::new());
  }
  match SqliteStore::open(config.path.as_deref()) {
    Ok(sqlite) => Arc::new(FallbackStore::new(Box::new(sqlite), notifier.clone())),
    Err(e) => {
      warn!("Could not open local store: {}", e);
      Arc::new(FallbackStore::memory_only(notifier.clone()))
    }
  }
}

impl SyncEngine {
  pub fn new(config: &Config) -> SyncResult<Self> {
    let notifier = Notifier::new();
    let store = open_store(&config.storage, &notifier);
    let api = ApiClient::new(&config.api)?;
    Self::from_parts(config, store, api, notifier)
  }

  /// Assemble an engine from prebuilt parts.
  pub fn from_parts(config: &Config, store: Arc<dyn LocalStore>, api: ApiClient, notifier: Notifier) -> SyncResult<Self> {
    let cache = FetchCache::new(config.cache.default_ttl()).with_stale_while_revalidate(config.cache.stale_while_revalidate);
    let queue = MutationQueue::open(Arc::clone(&store), config.queue.clone(), notifier.clone())?;
    let anonymous = AnonymousCart::open(Arc::clone(&store))?;

    Ok(Self {
      catalog: CatalogClient::new(api.clone(), cache.clone()),
      replayer: ApiReplayer::new(api.clone(), cache.clone()),
      cart: CartReconciler::new(api.clone(), cache.clone(), anonymous, notifier.clone()),
      queue,
      cache,
      api,
      store,
      notifier,
      auth: watch::channel(AuthState::anonymous()).0,
    })
  }

  pub fn catalog(&self) -> &CatalogClient {
    &self.catalog
  }

  pub fn cache(&self) -> &FetchCache {
    &self.cache
  }

  pub fn queue(&self) -> &MutationQueue {
    &self.queue
  }

  pub fn cart(&self) -> &CartReconciler {
    &self.cart
  }

  pub fn api(&self) -> &ApiClient {
    &self.api
  }

  pub fn store(&self) -> &Arc<dyn LocalStore> {
    &self.store
  }

  pub fn notifications(&self) -> broadcast::Receiver<Notification> {
    self.notifier.subscribe()
  }

  pub fn auth_state(&self) -> AuthState {
    self.auth.borrow().clone()
  }

  /// Observe the auth state as the engine last saw it.
  pub fn watch_auth(&self) -> watch::Receiver<AuthState> {
    self.auth.subscribe()
  }

  /// React to an auth transition.
  ///
  /// Login drains the queue and then merges the anonymous cart, unless the
  /// session expired during the drain; the anonymous cart then waits for the
  /// next login. A role change drains again, since listings wait for the
  /// lessor role. Logout drops every cart and cached read tied to the old
  /// identity.
  pub async fn handle_auth_change(&self, next: AuthState) -> SyncResult<()> {
    let prev = self.auth.send_replace(next.clone());
    if prev == next {
      return Ok(());
    }
    info!(authenticated = next.authenticated, role = ?next.role, "Auth state changed");

    match (prev.authenticated, next.authenticated) {
      (false, true) => {
        let report = self.drain_pending().await?;
        if matches!(report.stopped, Some(DrainStop::SessionExpired(_))) {
          warn!("Session expired during login replay, skipping cart merge");
          return Ok(());
        }
        match self.cart.on_login().await {
          Ok(report) => debug!(?report, "Cart reconciled"),
          Err(SyncError::SessionExpired) => debug!("Session expired during cart merge"),
          Err(e) => {
            error!("Cart merge failed: {}", e);
            self.notifier.error("Cart sync failed", e.user_message());
          }
        }
      }
      (true, false) => {
        self.cart.on_logout()?;
        self.cache.clear();
      }
      (true, true) => {
        self.drain_pending().await?;
      }
      (false, false) => {}
    }
    Ok(())
  }

  /// Replay queued mutations whose precondition the current session meets.
  pub async fn drain_pending(&self) -> SyncResult<DrainReport> {
    let auth = self.auth_state();
    let replayer = self.replayer.clone();
    let report = self
      .queue
      .drain_when(
        |m| m.kind.is_ready(&auth),
        |m| {
          let replayer = replayer.clone();
          async move { replayer.replay(m).await }
        },
      )
      .await?;

    if let Some(DrainStop::SessionExpired(id)) = &report.stopped {
      debug!(mutation_id = %id, "Drain stopped by session expiry");
    }
    Ok(report)
  }

  /// Handle a signal from the transport.
  ///
  /// Expiry signs the engine out right away: the server cart and every cached
  /// read of the expired identity are dropped. The anonymous cart survives, it
  /// never belonged to that identity.
  pub fn handle_session_signal(&self, signal: SessionSignal) {
    match signal {
      SessionSignal::Expired => {
        warn!("Session expired");
        let prev = self.auth.send_replace(AuthState::anonymous());
        if prev.authenticated {
          self.cart.forget_server_cart();
          self.cache.clear();
        }
        self.cart.publish_anonymous();
        self
          .notifier
          .warning("Session expired", "Please log in again to continue.");
      }
    }
  }

  /// Process auth transitions and session signals until the auth channel closes.
  pub async fn run(&self, mut auth_rx: watch::Receiver<AuthState>) -> SyncResult<()> {
    let mut session_rx = self.api.session_signals();

    let initial = auth_rx.borrow_and_update().clone();
    self.apply_auth(initial).await;

    loop {
      tokio::select! {
        changed = auth_rx.changed() => {
          if changed.is_err() {
            debug!("Auth channel closed, stopping engine");
            return Ok(());
          }
          let state = auth_rx.borrow_and_update().clone();
          self.apply_auth(state).await;
        }
        signal = session_rx.recv() => match signal {
          Ok(signal) => self.handle_session_signal(signal),
          Err(broadcast::error::RecvError::Lagged(skipped)) => {
            warn!(skipped, "Missed session signals");
          }
          Err(broadcast::error::RecvError::Closed) => return Ok(()),
        },
      }
    }
  }

  async fn apply_auth(&self, state: AuthState) {
    if let Err(e) = self.handle_auth_change(state).await {
      error!("Failed to apply auth change: {}", e);
      self.notifier.error("Sync failed", e.user_message());
    }
  }

  /// Add an item to the cart of whoever is using the client. A zero quantity
  /// adds nothing.
  pub async fn add_to_cart(&self, line: CartLine) -> SyncResult<()> {
    if line.quantity == 0 {
      debug!(item_id = %line.item_id, "Ignoring zero-quantity cart add");
      return Ok(());
    }
    if !self.auth_state().authenticated {
      self.cart.anonymous().add_item(line)?;
      self.cart.publish_anonymous();
      return Ok(());
    }

    self.queue.enqueue(MutationKind::AddCartLine, line.create_body(line.quantity))?;
    self.sync_cart().await
  }

  /// Change an item's quantity; zero removes the line. Returns `false` if the
  /// item is not in the cart.
  pub async fn update_cart_quantity(&self, item_id: &str, quantity: u32) -> SyncResult<bool> {
    if !self.auth_state().authenticated {
      let before = self.cart.anonymous().lines();
      let after = self.cart.anonymous().update_quantity(item_id, quantity)?;
      self.cart.publish_anonymous();
      return Ok(before != after);
    }

    let line_id = self
      .cart
      .current()
      .into_iter()
      .find(|l| l.item_id == item_id)
      .and_then(|l| l.id);
    let Some(line_id) = line_id else {
      return Ok(false);
    };

    let update = CartLineUpdate { line_id, quantity };
    self
      .queue
      .enqueue(MutationKind::UpdateCartLine, serde_json::to_value(update)?)?;
    self.sync_cart().await?;
    Ok(true)
  }

  /// Queue a new listing and publish it right away if the user may.
  pub async fn create_listing(&self, draft: ListingDraft) -> SyncResult<Uuid> {
    let id = self
      .queue
      .enqueue(MutationKind::CreateListing, serde_json::to_value(draft)?)?;

    if MutationKind::CreateListing.is_ready(&self.auth_state()) {
      self.drain_pending().await?;
    } else {
      self.notifier.info(
        "Listing saved",
        "It will be published once you are signed in as a lessor.",
      );
    }
    Ok(id)
  }

  async fn sync_cart(&self) -> SyncResult<()> {
    let report = self.drain_pending().await?;
    if !report.committed.is_empty() {
      self.cart.refresh().await?;
    }
    Ok(())
  }
}
