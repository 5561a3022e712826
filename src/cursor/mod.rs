//! Persistent per-viewer read cursors.
//!
//! A cursor records, for one (feed, viewer) pair, the timestamp up to which
//! the viewer has acknowledged the feed. Stores are plain key-value maps:
//! they do not enforce monotonicity, the synchronizer does.
//!
//! Two implementations are provided:
//! - [`FileCursorStore`]: durable, one checksummed file per store directory,
//!   guarded by an exclusive process lock
//! - [`MemoryCursorStore`]: in-process map with failure injection for tests

mod file;
mod memory;

pub use file::{CursorStoreConfig, FileCursorStore};
pub use memory::MemoryCursorStore;

use crate::error::Result;
use crate::types::{Cursor, FeedId, Timestamp, ViewerId};

/// Durable key-value store of cursors.
///
/// Writes for the same key may race; the last writer wins.
pub trait CursorStore: Send + Sync {
    /// Look up a cursor. `Ok(None)` means the viewer never opened the feed.
    fn get(&self, feed: &FeedId, viewer: &ViewerId) -> Result<Option<Cursor>>;

    /// Store a cursor value.
    fn set(&self, feed: &FeedId, viewer: &ViewerId, at: Timestamp) -> Result<()>;

    /// Remove every cursor of a viewer (account deletion). Returns how many
    /// entries were removed.
    fn remove_viewer(&self, viewer: &ViewerId) -> Result<usize>;

    /// Number of stored cursors.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
