//! Core types for feed synchronization.

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Identifier of a feed (a forum, a marketplace listing set, a comment thread).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FeedId(pub String);

impl FeedId {
    pub fn new(id: impl Into<String>) -> Self {
        FeedId(id.into())
    }

    /// The comment thread attached to an item of this feed.
    pub fn comments_of(&self, item: &ItemId) -> FeedId {
        FeedId(format!("{}/{}/comments", self.0, item.0))
    }

    /// The reviews left on an item of this feed.
    pub fn reviews_of(&self, item: &ItemId) -> FeedId {
        FeedId(format!("{}/{}/reviews", self.0, item.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for FeedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FeedId({})", self.0)
    }
}

impl fmt::Display for FeedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a viewer (an authenticated user). Also used for item authors.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ViewerId(pub String);

impl ViewerId {
    pub fn new(id: impl Into<String>) -> Self {
        ViewerId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ViewerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ViewerId({})", self.0)
    }
}

impl fmt::Display for ViewerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque identifier of a feed item, assigned by the source.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ItemId(pub String);

impl ItemId {
    pub fn new(id: impl Into<String>) -> Self {
        ItemId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ItemId({})", self.0)
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Milliseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// The epoch. A cursor at this value treats every dated item as unread.
    pub const EPOCH: Timestamp = Timestamp(0);

    /// Current wall-clock time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_millis() as i64)
    }

    pub fn from_millis(ms: i64) -> Self {
        Timestamp(ms)
    }

    pub fn as_millis(self) -> i64 {
        self.0
    }

    /// Parse a document timestamp: integer milliseconds, or a
    /// `{ "seconds": .., "nanoseconds": .. }` server timestamp object.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().filter(|ms| *ms >= 0).map(Timestamp),
            Value::Object(obj) => {
                let seconds = obj.get("seconds")?.as_i64()?;
                if seconds < 0 {
                    return None;
                }
                let nanos = obj
                    .get("nanoseconds")
                    .and_then(Value::as_i64)
                    .unwrap_or(0)
                    .clamp(0, 999_999_999);
                seconds
                    .checked_mul(1000)
                    .and_then(|ms| ms.checked_add(nanos / 1_000_000))
                    .map(Timestamp)
            }
            _ => None,
        }
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Source of "now" for acknowledgements and server timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// Manually driven clock for tests and simulations.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: AtomicI64::new(start.0),
        }
    }

    pub fn set(&self, ts: Timestamp) {
        self.now.store(ts.0, Ordering::SeqCst);
    }

    /// Move the clock forward and return the new time.
    pub fn advance(&self, ms: i64) -> Timestamp {
        Timestamp(self.now.fetch_add(ms, Ordering::SeqCst) + ms)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.now.load(Ordering::SeqCst))
    }
}

/// A (feed, viewer) pair: the unit of cursor tracking and subscription.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FeedKey {
    pub feed: FeedId,
    pub viewer: ViewerId,
}

impl FeedKey {
    pub fn new(feed: FeedId, viewer: ViewerId) -> Self {
        Self { feed, viewer }
    }
}

/// Per-viewer, per-feed marker of the last acknowledged position.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub feed: FeedId,
    pub viewer: ViewerId,
    pub last_acknowledged: Timestamp,
}

impl Cursor {
    pub fn new(feed: FeedId, viewer: ViewerId, last_acknowledged: Timestamp) -> Self {
        Self {
            feed,
            viewer,
            last_acknowledged,
        }
    }

    /// A cursor for a viewer that has never acknowledged this feed.
    pub fn epoch(feed: FeedId, viewer: ViewerId) -> Self {
        Self::new(feed, viewer, Timestamp::EPOCH)
    }
}

/// A single item of a feed.
///
/// `created_at` is `None` when the source record carried no usable
/// timestamp; such items are always classified as read.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeedItem {
    pub id: ItemId,
    pub created_at: Option<Timestamp>,
    pub author_id: ViewerId,
    pub payload: Map<String, Value>,
}

impl FeedItem {
    /// Validate a raw document at the source boundary.
    ///
    /// The author is read from `authorId` (or `userId` for older records),
    /// the creation time from `createdAt`. Remaining fields become the payload.
    pub fn from_document(id: impl Into<String>, document: &Value) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(SyncError::Validation("document has an empty id".into()));
        }

        let obj = document.as_object().ok_or_else(|| {
            SyncError::Validation(format!("document {} is not an object", id))
        })?;

        let author = obj
            .get("authorId")
            .or_else(|| obj.get("userId"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| SyncError::Validation(format!("document {} has no author", id)))?;

        let created_at = obj.get("createdAt").and_then(Timestamp::from_value);

        let mut payload = obj.clone();
        payload.remove("authorId");
        payload.remove("createdAt");

        Ok(Self {
            id: ItemId(id),
            created_at,
            author_id: ViewerId(author.to_string()),
            payload,
        })
    }

    /// Read a derived integer counter (e.g. `commentCount`), zero if absent.
    pub fn counter(&self, field: &str) -> i64 {
        self.payload.get(field).and_then(Value::as_i64).unwrap_or(0)
    }

    /// Read a string payload field.
    pub fn text(&self, field: &str) -> Option<&str> {
        self.payload.get(field).and_then(Value::as_str)
    }
}

/// Input for a new item, before the source assigns id and creation time.
#[derive(Clone, Debug, PartialEq)]
pub struct ItemDraft {
    pub author_id: ViewerId,
    pub payload: Map<String, Value>,
}

impl ItemDraft {
    pub fn new(author_id: ViewerId, payload: Map<String, Value>) -> Self {
        Self { author_id, payload }
    }

    /// Reject drafts that must never reach the source.
    pub fn validate(&self) -> Result<()> {
        if self.author_id.0.trim().is_empty() {
            return Err(SyncError::Validation("author id is empty".into()));
        }
        if self.payload.is_empty() {
            return Err(SyncError::Validation("payload is empty".into()));
        }
        for reserved in ["authorId", "createdAt"] {
            if self.payload.contains_key(reserved) {
                return Err(SyncError::Validation(format!(
                    "payload may not set reserved field {}",
                    reserved
                )));
            }
        }
        Ok(())
    }
}

/// Ordering requested from a source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrderSpec {
    /// Descending by creation time (feeds).
    #[default]
    NewestFirst,
    /// Ascending by creation time (comment threads).
    OldestFirst,
}

impl OrderSpec {
    /// Sort items in place. Undated items go last in either order.
    pub fn sort(self, items: &mut [FeedItem]) {
        items.sort_by(|a, b| {
            let by_time = match (a.created_at, b.created_at) {
                (Some(x), Some(y)) => match self {
                    OrderSpec::NewestFirst => y.cmp(&x),
                    OrderSpec::OldestFirst => x.cmp(&y),
                },
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            };
            by_time.then_with(|| a.id.cmp(&b.id))
        });
    }
}

/// A full, ordered snapshot of a feed as delivered by a source.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeedBatch {
    pub feed: FeedId,
    /// Source revision this snapshot reflects. Higher is newer.
    pub revision: u64,
    pub items: Vec<FeedItem>,
}

impl FeedBatch {
    pub fn new(feed: FeedId, revision: u64, items: Vec<FeedItem>) -> Self {
        Self {
            feed,
            revision,
            items,
        }
    }

    /// Build a batch from raw documents, dropping the ones that fail validation.
    pub fn from_documents<I>(feed: FeedId, revision: u64, documents: I) -> Self
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        let mut items = Vec::new();
        for (id, doc) in documents {
            match FeedItem::from_document(id, &doc) {
                Ok(item) => items.push(item),
                Err(e) => tracing::warn!(feed = %feed, error = %e, "dropping malformed document"),
            }
        }
        Self::new(feed, revision, items)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
