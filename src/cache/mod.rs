//! Fetch cache for idempotent reads.
//!
//! This module provides a resource-agnostic read cache that:
//! - Keys results by resource path plus normalized query parameters
//! - Expires entries after a per-call time-to-live
//! - Coalesces concurrent identical requests into a single fetch
//! - Optionally serves stale entries while revalidating in the background
//! - Publishes store/invalidate events to subscribers

mod entry;
mod key;
mod layer;

pub use entry::{CacheEntry, CacheEvent};
pub use key::{filter_signature, CacheKey};
pub use layer::FetchCache;
