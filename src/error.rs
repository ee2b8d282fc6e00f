//! Error taxonomy shared by every component of the engine.

use serde_json::Value;

/// Result alias used throughout the library.
pub type SyncResult<T> = Result<T, SyncError>;

/// A response from the backend with a non-success status.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("HTTP {status}: {detail}")]
pub struct ApiError {
  pub status: u16,
  pub detail: String,
}

impl ApiError {
  pub fn new(status: u16, detail: impl Into<String>) -> Self {
    Self {
      status,
      detail: detail.into(),
    }
  }

  /// Build an error from a response body, picking the most useful message field.
  ///
  /// Looks at `detail`, then `details`, `error` and `message`. Falls back to the raw
  /// body text, or "Unknown error" when the body is empty.
  pub fn from_body(status: u16, body: &str) -> Self {
    let detail = serde_json::from_str::<Value>(body)
      .ok()
      .and_then(|v| {
        ["detail", "details", "error", "message"]
          .iter()
          .find_map(|field| match v.get(field) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) if !other.is_null() => Some(other.to_string()),
            _ => None,
          })
      })
      .unwrap_or_else(|| {
        let trimmed = body.trim();
        if trimmed.is_empty() {
          "Unknown error".to_string()
        } else {
          trimmed.to_string()
        }
      });

    Self { status, detail }
  }
}

/// Errors produced by the cache, queue, cart and transport layers.
///
/// Cloneable so a single failure can be handed to every coalesced waiter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
  /// No response was received.
  #[error("network error: {0}")]
  Network(String),

  /// The server responded with an error status.
  #[error(transparent)]
  Api(#[from] ApiError),

  /// A 401 was received and the session could not be refreshed.
  #[error("session expired")]
  SessionExpired,

  /// The durable local store is unavailable.
  #[error("storage error: {0}")]
  Storage(String),

  /// A payload could not be encoded or decoded.
  #[error("serialization error: {0}")]
  Serialization(String),
}

impl SyncError {
  /// HTTP status, if the server answered.
  pub fn status(&self) -> Option<u16> {
    match self {
      Self::Api(e) => Some(e.status),
      _ => None,
    }
  }

  /// Errors that may succeed if retried later without user intervention.
  pub fn is_transient(&self) -> bool {
    match self {
      Self::Network(_) => true,
      Self::Api(e) => e.status >= 500 || e.status == 408 || e.status == 429,
      _ => false,
    }
  }

  /// "Resource already exists".
  pub fn is_conflict(&self) -> bool {
    self.status() == Some(409)
  }

  /// Errors that will not succeed on retry.
  pub fn is_terminal(&self) -> bool {
    match self {
      Self::Api(e) => {
        (400..500).contains(&e.status)
          && !self.is_transient()
          && e.status != 401
          && e.status != 409
      }
      Self::Serialization(_) => true,
      _ => false,
    }
  }

  /// Human readable cause for the notification boundary.
  pub fn user_message(&self) -> String {
    match self {
      Self::Network(_) => "No response from server. Please check your connection.".to_string(),
      Self::Api(e) => e.detail.clone(),
      Self::SessionExpired => "Your session has expired. Please log in again.".to_string(),
      Self::Storage(_) => "Local storage is unavailable; changes are kept in memory only.".to_string(),
      Self::Serialization(msg) => format!("Invalid data: {}", msg),
    }
  }
}

impl From<serde_json::Error> for SyncError {
  fn from(e: serde_json::Error) -> Self {
    Self::Serialization(e.to_string())
  }
}

impl From<rusqlite::Error> for SyncError {
  fn from(e: rusqlite::Error) -> Self {
    Self::Storage(e.to_string())
  }
}

impl From<reqwest::Error> for SyncError {
  fn from(e: reqwest::Error) -> Self {
    match e.status() {
      Some(status) => Self::Api(ApiError::new(status.as_u16(), e.to_string())),
      None if e.is_decode() => Self::Serialization(e.to_string()),
      None => Self::Network(e.to_string()),
    }
  }
}
