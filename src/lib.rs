//! Synchronized cache and deferred-mutation engine for the rental marketplace client.
//!
//! [`SyncEngine`] is the entry point. It owns a [`FetchCache`] for reads, a
//! [`MutationQueue`] for writes that must wait for login or the lessor role,
//! and a [`CartReconciler`] that merges the anonymous cart at login.

pub mod api;
pub mod cache;
pub mod cart;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod logging;
pub mod queue;
pub mod resources;
pub mod store;

pub use api::ApiClient;
pub use cache::{CacheKey, FetchCache};
pub use cart::{CartLine, CartReconciler};
pub use config::Config;
pub use engine::SyncEngine;
pub use error::{ApiError, SyncError, SyncResult};
pub use event::{AuthState, Notification, Notifier, Severity};
pub use queue::{MutationKind, MutationQueue, PendingMutation};
