//! Sends queued mutations to the backend.

use serde_json::json;
use tracing::debug;

use super::mutation::{CartLineUpdate, ListingDraft, MutationKind, PendingMutation};
use crate::api::{ApiClient, ApiRequest, Created};
use crate::cache::FetchCache;
use crate::error::SyncResult;
use crate::resources::{CART_ITEMS_PATH, EQUIPMENTS_PATH};

/// Replays a [`PendingMutation`] over HTTP and invalidates what it touched.
#[derive(Clone)]
pub struct ApiReplayer {
  client: ApiClient,
  cache: FetchCache,
}

impl ApiReplayer {
  pub fn new(client: ApiClient, cache: FetchCache) -> Self {
    Self { client, cache }
  }

  pub async fn replay(&self, mutation: PendingMutation) -> SyncResult<Created> {
    debug!(mutation_id = %mutation.id, kind = mutation.kind.label(), "Sending mutation");
    let created = match mutation.kind {
      MutationKind::CreateListing => {
        let draft: ListingDraft = serde_json::from_value(mutation.payload)?;
        self
          .client
          .create(ApiRequest::post(EQUIPMENTS_PATH).multipart(draft.into_multipart()))
          .await?
      }
      MutationKind::AddCartLine => {
        self
          .client
          .create(ApiRequest::post(CART_ITEMS_PATH).json(mutation.payload))
          .await?
      }
      MutationKind::UpdateCartLine => {
        let update: CartLineUpdate = serde_json::from_value(mutation.payload)?;
        let path = format!("{}{}/", CART_ITEMS_PATH, update.line_id);
        let req = if update.quantity == 0 {
          ApiRequest::delete(path)
        } else {
          ApiRequest::patch(path).json(json!({ "quantity": update.quantity }))
        };
        Created::New(self.client.send(req).await?)
      }
    };

    // Listings show up in the catalog; cart lines in the cart
    match mutation.kind {
      MutationKind::CreateListing => self.cache.invalidate_prefix(EQUIPMENTS_PATH),
      MutationKind::AddCartLine | MutationKind::UpdateCartLine => self.cache.invalidate_prefix(CART_ITEMS_PATH),
    }
    Ok(created)
  }
}
