//! # readtrack
//!
//! Keeps a live, ordered feed of items in sync for one viewer and tracks
//! which items the viewer has not seen yet.
//!
//! ## Core Concepts
//!
//! - **Sources**: push-capable document collections delivering full snapshots
//! - **Cursors**: per-viewer, per-feed "last acknowledged" timestamps
//! - **Detection**: an item is new iff it was created after the cursor
//! - **Synchronizer**: the state machine tying the three together
//!
//! ## Example
//!
//! ```ignore
//! use readtrack::*;
//! use std::sync::Arc;
//!
//! let clock = Arc::new(SystemClock);
//! let source = Arc::new(MemoryFeedSource::new(clock.clone()));
//! let cursors = Arc::new(FileCursorStore::open_or_create(CursorStoreConfig {
//!     path: "./cursors".into(),
//!     ..Default::default()
//! })?);
//!
//! let sync = Synchronizer::new(source, cursors, clock, SyncConfig::default());
//! sync.activate(FeedId::new("forumPosts"), ViewerId::new("ada"))?;
//!
//! let view = sync.view();
//! println!("{} unread", view.unread_count());
//!
//! // The viewer looked at the feed.
//! sync.acknowledge(AckReason::Explicit)?;
//! ```

pub mod config;
pub mod cursor;
pub mod detector;
pub mod error;
pub mod favorites;
pub mod identity;
pub mod media;
pub mod notify;
pub mod publish;
pub mod review;
pub mod source;
pub mod sync;
pub mod types;

// Re-exports
pub use config::SyncConfig;
pub use cursor::{CursorStore, CursorStoreConfig, FileCursorStore, MemoryCursorStore};
pub use detector::{classify, is_unread, Classification, ClassifiedItem, FeedSnapshot};
pub use error::{FailureKind, Result, SourceFailure, SyncError};
pub use favorites::{add_favorite, favorites, is_favorite, remove_favorite};
pub use identity::{AuthEvent, Identity};
pub use media::{Media, MediaHash, MediaStore, MediaStoreConfig, Upload};
pub use notify::{
    classify_delivery_failure, plan_new_item_notifications, DeliveryFailure, NotificationTarget,
    PushMessage, PushRegistration, Recipient,
};
pub use publish::{add_comment, delete_comment, delete_item, PostDraft, COMMENT_COUNT};
pub use review::{add_review, RatingSummary, AVERAGE_RATING, NUMBER_OF_RATINGS};
pub use source::{DropReason, FeedEvent, FeedSource, FeedSubscription, MemoryFeedSource, SubscriptionId};
pub use sync::{
    AckReason, CancellationToken, FeedView, RefreshOutcome, RefreshTicket, SyncState,
    Synchronizer, TaskHandle,
};
pub use types::*;
