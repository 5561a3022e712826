//! Live feed synchronization.
//!
//! A [`Synchronizer`] drives one (feed, viewer) pair at a time:
//!
//! ```text
//! Idle --activate--> Loading --first batch--> Ready <--> Refreshing
//!                       |                       |
//!                       +------- failure -------+--> Error --retry--> Loading
//! ```
//!
//! Every activation gets a new generation number. Batches, refresh results
//! and failures carry the generation they were started under and are
//! dropped once it is stale, so nothing from a previous feed can leak into
//! the current one.

mod controller;
mod task;
mod types;

pub use controller::Synchronizer;
pub use task::{run_with_timeout, CancellationToken, TaskHandle};
pub use types::{AckReason, FeedView, RefreshOutcome, RefreshTicket, SyncState};
