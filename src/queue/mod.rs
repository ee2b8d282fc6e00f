//! Offline mutation queue.
//!
//! Writes the user makes before they are allowed to are recorded here and
//! replayed in order once their precondition holds.

mod mutation;
mod offline;
mod replay;

pub use mutation::{CartLineUpdate, ListingDraft, MutationKind, MutationStatus, PendingMutation};
pub use offline::{DrainReport, DrainStop, MutationQueue};
pub use replay::ApiReplayer;
