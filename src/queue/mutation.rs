//! Deferred write operations and their payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::api::{Attachment, MultipartBody};
use crate::event::AuthState;

/// What a deferred write does once replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
  CreateListing,
  AddCartLine,
  UpdateCartLine,
}

impl MutationKind {
  /// Whether the session satisfies this mutation's replay precondition.
  pub fn is_ready(self, auth: &AuthState) -> bool {
    match self {
      MutationKind::CreateListing => auth.is_lessor(),
      MutationKind::AddCartLine | MutationKind::UpdateCartLine => auth.authenticated,
    }
  }

  pub fn label(self) -> &'static str {
    match self {
      MutationKind::CreateListing => "listing",
      MutationKind::AddCartLine => "cart item",
      MutationKind::UpdateCartLine => "cart update",
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
  Pending,
  InFlight,
  Failed,
  Committed,
}

/// A write captured while its precondition was unmet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMutation {
  pub id: Uuid,
  pub kind: MutationKind,
  pub payload: Value,
  pub created_at: DateTime<Utc>,
  /// Creation order; breaks ties between identical timestamps
  pub seq: u64,
  pub attempts: u32,
  pub status: MutationStatus,
  #[serde(default)]
  pub last_error: Option<String>,
}

impl PendingMutation {
  pub fn new(kind: MutationKind, payload: Value, seq: u64) -> Self {
    Self {
      id: Uuid::new_v4(),
      kind,
      payload,
      created_at: Utc::now(),
      seq,
      attempts: 0,
      status: MutationStatus::Pending,
      last_error: None,
    }
  }
}

/// A listing drafted before the user could publish it.
///
/// Form fields are kept as JSON; images travel as base64 inside the payload
/// and are turned back into file parts on replay.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListingDraft {
  #[serde(flatten)]
  pub fields: Map<String, Value>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub images: Vec<Attachment>,
}

impl ListingDraft {
  pub fn into_multipart(self) -> MultipartBody {
    let fields = self
      .fields
      .into_iter()
      .filter(|(_, v)| !v.is_null())
      .map(|(k, v)| {
        let text = match v {
          Value::String(s) => s,
          other => other.to_string(),
        };
        (k, text)
      })
      .collect();
    let files = self
      .images
      .into_iter()
      .map(|image| ("images".to_string(), image))
      .collect();

    MultipartBody { fields, files }
  }
}

/// Quantity change for an existing server cart line. Zero deletes the line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartLineUpdate {
  pub line_id: String,
  pub quantity: u32,
}
