//! Cart state on this client.
//!
//! Before login the cart lives in the local store ([`AnonymousCart`]). At
//! login [`CartReconciler`] folds it into the server cart; from then on the
//! server cart is authoritative.

mod anonymous;
mod line;
mod reconcile;

pub use anonymous::AnonymousCart;
pub use line::{Amount, CartLine};
pub use reconcile::{plan_merge, CartReconciler, MergeOp, MergePlan, ReconcileReport};
