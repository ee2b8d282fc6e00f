//! Events crossing the engine boundary: auth transitions in, notifications out.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Role that may publish listings.
pub const LESSOR_ROLE: &str = "lessor";

/// Severity of a user-facing notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
  Info,
  Success,
  Warning,
  Error,
}

/// A `(title, message, severity)` event for the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
  pub title: String,
  pub message: String,
  pub severity: Severity,
}

/// Authentication state published by the external session component.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthState {
  pub authenticated: bool,
  pub role: Option<String>,
}

impl AuthState {
  pub fn anonymous() -> Self {
    Self::default()
  }

  pub fn authenticated(role: Option<&str>) -> Self {
    Self {
      authenticated: true,
      role: role.map(String::from),
    }
  }

  pub fn is_lessor(&self) -> bool {
    self.authenticated && self.role.as_deref() == Some(LESSOR_ROLE)
  }
}

/// Signals raised by the transport for the external session component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSignal {
  /// Refresh failed after a 401; identity must be cleared.
  Expired,
}

/// Publish side of the notification boundary.
///
/// Every notification is also logged, so a notification with no subscriber
/// is never lost silently.
#[derive(Debug, Clone)]
pub struct Notifier {
  tx: broadcast::Sender<Notification>,
}

impl Notifier {
  pub fn new() -> Self {
    let (tx, _rx) = broadcast::channel(64);
    Self { tx }
  }

  /// Subscribe to notifications published after this call.
  pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
    self.tx.subscribe()
  }

  pub fn notify(&self, title: impl Into<String>, message: impl Into<String>, severity: Severity) {
    let notification = Notification {
      title: title.into(),
      message: message.into(),
      severity,
    };

    match severity {
      Severity::Error => error!(title = %notification.title, "{}", notification.message),
      Severity::Warning => warn!(title = %notification.title, "{}", notification.message),
      _ => info!(title = %notification.title, "{}", notification.message),
    }

    // No receivers is fine; the log line above is the fallback sink
    let _ = self.tx.send(notification);
  }

  pub fn info(&self, title: impl Into<String>, message: impl Into<String>) {
    self.notify(title, message, Severity::Info);
  }

  pub fn success(&self, title: impl Into<String>, message: impl Into<String>) {
    self.notify(title, message, Severity::Success);
  }

  pub fn warning(&self, title: impl Into<String>, message: impl Into<String>) {
    self.notify(title, message, Severity::Warning);
  }

  pub fn error(&self, title: impl Into<String>, message: impl Into<String>) {
    self.notify(title, message, Severity::Error);
  }
}

impl Default for Notifier {
  fn default() -> Self {
    Self::new()
  }
}

/// Drain every notification currently buffered in a receiver.
pub fn drain_notifications(rx: &mut broadcast::Receiver<Notification>) -> Vec<Notification> {
  let mut out = Vec::new();
  loop {
    match rx.try_recv() {
      Ok(n) => out.push(n),
      Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
      Err(_) => break,
    }
  }
  out
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_lessor_requires_authentication() {
    assert!(AuthState::authenticated(Some("lessor")).is_lessor());
    assert!(!AuthState::authenticated(Some("lessee")).is_lessor());
    let stale = AuthState {
      authenticated: false,
      role: Some("lessor".into()),
    };
    assert!(!stale.is_lessor());
  }

  #[test]
  fn test_notify_without_subscribers() {
    let notifier = Notifier::new();
    notifier.info("Hello", "nobody listening");
  }

  #[test]
  fn test_subscriber_receives_in_order() {
    let notifier = Notifier::new();
    let mut rx = notifier.subscribe();
    notifier.info("a", "1");
    notifier.error("b", "2");

    let got = drain_notifications(&mut rx);
    assert_eq!(got.len(), 2);
    assert_eq!(got[0].title, "a");
    assert_eq!(got[1].severity, Severity::Error);
  }
}
