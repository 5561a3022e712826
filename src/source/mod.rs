//! Feed sources: push-capable document collections.
//!
//! A [`FeedSource`] is the boundary to the remote document database. It
//! delivers full ordered snapshots of a feed over a bounded channel and
//! accepts new items, deletions, and atomic read-modify-write updates.
//!
//! # Example
//!
//! ```ignore
//! let source = MemoryFeedSource::new(Arc::new(SystemClock));
//! let sub = source.subscribe(&FeedId::new("forumPosts"), OrderSpec::NewestFirst)?;
//!
//! loop {
//!     match sub.recv() {
//!         Ok(FeedEvent::Batch { batch }) => println!("{} items", batch.len()),
//!         Ok(event) if event.is_terminal() => break,
//!         Ok(_) => {}
//!         Err(_) => break,
//!     }
//! }
//! ```

mod memory;
mod types;

pub use memory::MemoryFeedSource;
pub use types::{DropReason, FeedEvent, FeedSubscription, SubscriptionId};

use crate::error::Result;
use crate::types::{FeedBatch, FeedId, FeedItem, ItemDraft, ItemId, OrderSpec};
use serde_json::{Map, Value};

/// A remote, push-capable feed collection.
///
/// Implementations must deliver an initial snapshot right after `subscribe`
/// and a new full snapshot after every change, with increasing revisions.
/// Failures after subscription are reported as a terminal
/// [`FeedEvent::Failed`] rather than by closing the channel silently.
pub trait FeedSource: Send + Sync {
    /// Open a live subscription to a feed.
    fn subscribe(&self, feed: &FeedId, order: OrderSpec) -> Result<FeedSubscription>;

    /// Close a subscription. Unknown ids are ignored.
    fn unsubscribe(&self, id: SubscriptionId);

    /// Pull the current snapshot once.
    fn fetch_once(&self, feed: &FeedId, order: OrderSpec) -> Result<FeedBatch>;

    /// Append a new item. The source assigns id and creation time.
    fn publish(&self, feed: &FeedId, draft: ItemDraft) -> Result<FeedItem>;

    /// Read a single item.
    fn get(&self, feed: &FeedId, item: &ItemId) -> Result<FeedItem>;

    /// Delete a single item.
    fn delete(&self, feed: &FeedId, item: &ItemId) -> Result<()>;

    /// Atomically add `delta` to an integer payload field, clamping at zero.
    /// Returns the new value.
    fn increment(&self, feed: &FeedId, item: &ItemId, field: &str, delta: i64) -> Result<i64>;

    /// Atomically read, modify and write an item's payload.
    ///
    /// `apply` sees the current payload and no other write to the feed
    /// lands between the read and the write. If `apply` fails the item is
    /// left unchanged and its error is returned. `apply` must not call back
    /// into the source. Returns the updated item.
    fn update(
        &self,
        feed: &FeedId,
        item: &ItemId,
        apply: &mut dyn FnMut(&mut Map<String, Value>) -> Result<()>,
    ) -> Result<FeedItem>;
}
