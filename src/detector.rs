//! Unread detection.
//!
//! Classification is a pure function of the items and the cursor: an item is
//! new iff its creation time is strictly after the cursor. Items without a
//! usable creation time are treated as read, so a batch of malformed records
//! can never light up as unread.

use crate::types::{Cursor, FeedBatch, FeedItem, ItemId, Timestamp};
use serde::{Deserialize, Serialize};

/// A feed item together with its read state for one viewer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedItem {
    pub item: FeedItem,
    pub is_new: bool,
}

/// Result of classifying a set of items against a cursor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub items: Vec<ClassifiedItem>,
    pub unread_count: usize,
}

/// Whether a single item is unread relative to `cursor`.
pub fn is_unread(item: &FeedItem, cursor: Timestamp) -> bool {
    match item.created_at {
        Some(created) => created > cursor,
        None => false,
    }
}

/// Classify items against a cursor, keeping their order.
pub fn classify(items: &[FeedItem], cursor: &Cursor) -> Classification {
    let at = cursor.last_acknowledged;
    let items: Vec<ClassifiedItem> = items
        .iter()
        .map(|item| ClassifiedItem {
            is_new: is_unread(item, at),
            item: item.clone(),
        })
        .collect();
    let unread_count = items.iter().filter(|c| c.is_new).count();

    Classification {
        items,
        unread_count,
    }
}

/// The classified view of a feed at one source revision.
///
/// Recomputed on every batch and every acknowledgement; never persisted.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct FeedSnapshot {
    /// Source revision of the batch this snapshot was built from.
    pub revision: u64,
    pub items: Vec<ClassifiedItem>,
    pub unread_count: usize,
    pub has_unread: bool,
}

impl FeedSnapshot {
    /// Snapshot with no items.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Classify a batch against a cursor.
    pub fn from_batch(batch: &FeedBatch, cursor: &Cursor) -> Self {
        let classification = classify(&batch.items, cursor);
        Self {
            revision: batch.revision,
            has_unread: classification.unread_count > 0,
            unread_count: classification.unread_count,
            items: classification.items,
        }
    }

    /// Re-run classification in place after the cursor moved.
    pub fn reclassify(&mut self, cursor: &Cursor) {
        let at = cursor.last_acknowledged;
        let mut unread = 0;
        for entry in &mut self.items {
            entry.is_new = is_unread(&entry.item, at);
            if entry.is_new {
                unread += 1;
            }
        }
        self.unread_count = unread;
        self.has_unread = unread > 0;
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Look up an item by id.
    pub fn get(&self, id: &ItemId) -> Option<&ClassifiedItem> {
        self.items.iter().find(|c| &c.item.id == id)
    }

    /// Newest creation time among the items, if any item is dated.
    pub fn newest(&self) -> Option<Timestamp> {
        self.items.iter().filter_map(|c| c.item.created_at).max()
    }
}
