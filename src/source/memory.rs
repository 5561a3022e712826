//! In-process feed source broadcasting full snapshots to subscribers.

use super::types::{DropReason, FeedEvent, FeedSubscription, SubscriptionId};
use super::FeedSource;
use crate::error::{Result, SourceFailure, SyncError};
use crate::types::{Clock, FeedBatch, FeedId, FeedItem, ItemDraft, ItemId, OrderSpec};
use crossbeam_channel::{bounded, Sender};
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Default per-subscription buffer (snapshots).
const DEFAULT_BUFFER_SIZE: usize = 32;

/// Internal subscription state.
struct Subscription {
    feed: FeedId,
    order: OrderSpec,
    sender: Sender<FeedEvent>,
}

impl Subscription {
    /// Try to send an event. Returns false if the buffer is full or the
    /// receiver is gone (subscriber will be dropped).
    fn try_send(&self, event: FeedEvent) -> bool {
        self.sender.try_send(event).is_ok()
    }
}

/// Injected failures.
#[derive(Default)]
struct Faults {
    offline: bool,
    denied: HashSet<FeedId>,
    fetch_failures: VecDeque<SourceFailure>,
    publish_failures: VecDeque<SourceFailure>,
}

/// Feed source held in memory.
///
/// Serves as the reference implementation of [`FeedSource`] and as a
/// controllable backend for tests: it can go offline, deny access to a
/// feed, or fail the next fetch or publish.
pub struct MemoryFeedSource {
    clock: Arc<dyn Clock>,
    /// Items by feed.
    feeds: RwLock<HashMap<FeedId, HashMap<ItemId, FeedItem>>>,
    /// Active subscriptions by ID.
    subscriptions: RwLock<HashMap<SubscriptionId, Subscription>>,
    /// Serializes mutations so snapshots leave in revision order.
    write_lock: Mutex<()>,
    faults: Mutex<Faults>,
    next_subscription: AtomicU64,
    next_item: AtomicU64,
    revision: AtomicU64,
    buffer_size: usize,
}

impl MemoryFeedSource {
    /// Create an empty source.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_buffer_size(clock, DEFAULT_BUFFER_SIZE)
    }

    /// Create an empty source with a custom subscription buffer.
    pub fn with_buffer_size(clock: Arc<dyn Clock>, buffer_size: usize) -> Self {
        Self {
            clock,
            feeds: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
            write_lock: Mutex::new(()),
            faults: Mutex::new(Faults::default()),
            next_subscription: AtomicU64::new(1),
            next_item: AtomicU64::new(1),
            revision: AtomicU64::new(0),
            buffer_size: buffer_size.max(1),
        }
    }

    /// Current source revision.
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    /// Get subscription count.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Number of items in a feed.
    pub fn item_count(&self, feed: &FeedId) -> usize {
        self.feeds.read().get(feed).map_or(0, HashMap::len)
    }

    // --- External writes ---

    /// Insert an already-formed item, as another client would.
    pub fn insert(&self, feed: &FeedId, item: FeedItem) {
        let _lock = self.write_lock.lock();
        self.feeds
            .write()
            .entry(feed.clone())
            .or_default()
            .insert(item.id.clone(), item);
        self.bump_and_broadcast(feed);
    }

    /// Insert a raw document, validating it the way a remote adapter would.
    pub fn insert_document(&self, feed: &FeedId, id: &str, document: &Value) -> Result<FeedItem> {
        let item = FeedItem::from_document(id, document)?;
        self.insert(feed, item.clone());
        Ok(item)
    }

    // --- Fault injection ---

    /// Go offline or back online. Going offline fails every open
    /// subscription with a transient error.
    pub fn set_offline(&self, offline: bool) {
        self.faults.lock().offline = offline;
        if offline {
            self.fail_subscribers(
                |_| true,
                SourceFailure::transient("connection lost"),
            );
        }
    }

    /// Deny access to a feed. Open subscriptions on it fail with a
    /// permission error.
    pub fn deny(&self, feed: &FeedId) {
        self.faults.lock().denied.insert(feed.clone());
        self.fail_subscribers(
            |sub| &sub.feed == feed,
            SourceFailure::permission(format!("access to {} revoked", feed)),
        );
    }

    /// Restore access to a feed.
    pub fn allow(&self, feed: &FeedId) {
        self.faults.lock().denied.remove(feed);
    }

    /// Fail the next `fetch_once` call.
    pub fn fail_next_fetch(&self, failure: SourceFailure) {
        self.faults.lock().fetch_failures.push_back(failure);
    }

    /// Fail the next `publish` call.
    pub fn fail_next_publish(&self, failure: SourceFailure) {
        self.faults.lock().publish_failures.push_back(failure);
    }

    fn check_access(&self, feed: &FeedId) -> Result<()> {
        let faults = self.faults.lock();
        if faults.offline {
            return Err(SyncError::TransientNetwork("source is offline".into()));
        }
        if faults.denied.contains(feed) {
            return Err(SyncError::Permission(format!("access to {} denied", feed)));
        }
        Ok(())
    }

    // --- Broadcasting ---

    fn snapshot(&self, feed: &FeedId, order: OrderSpec, revision: u64) -> FeedBatch {
        let mut items: Vec<FeedItem> = self
            .feeds
            .read()
            .get(feed)
            .map(|items| items.values().cloned().collect())
            .unwrap_or_default();
        order.sort(&mut items);
        FeedBatch::new(feed.clone(), revision, items)
    }

    /// Advance the revision and push a fresh snapshot to every subscriber of
    /// the feed. Must be called with `write_lock` held.
    fn bump_and_broadcast(&self, feed: &FeedId) {
        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        let mut to_remove = Vec::new();

        {
            let subs = self.subscriptions.read();
            for (id, sub) in subs.iter().filter(|(_, s)| &s.feed == feed) {
                let batch = self.snapshot(feed, sub.order, revision);
                if !sub.try_send(FeedEvent::Batch { batch }) {
                    to_remove.push(*id);
                }
            }
        }

        if !to_remove.is_empty() {
            let mut subs = self.subscriptions.write();
            for id in to_remove {
                if let Some(sub) = subs.remove(&id) {
                    tracing::warn!(subscription = id.0, feed = %feed, "dropping slow subscriber");
                    let _ = sub.sender.try_send(FeedEvent::Dropped {
                        reason: DropReason::BufferOverflow,
                    });
                }
            }
        }
    }

    /// Send a terminal failure to matching subscribers and remove them.
    fn fail_subscribers<F>(&self, filter: F, failure: SourceFailure)
    where
        F: Fn(&Subscription) -> bool,
    {
        let mut subs = self.subscriptions.write();
        let ids: Vec<SubscriptionId> = subs
            .iter()
            .filter(|(_, s)| filter(s))
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            if let Some(sub) = subs.remove(&id) {
                let _ = sub.sender.try_send(FeedEvent::Failed {
                    failure: failure.clone(),
                });
            }
        }
    }
}

impl FeedSource for MemoryFeedSource {
    fn subscribe(&self, feed: &FeedId, order: OrderSpec) -> Result<FeedSubscription> {
        self.check_access(feed)?;

        let _lock = self.write_lock.lock();
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = bounded(self.buffer_size);

        // Initial snapshot, like a listener firing on attach.
        let batch = self.snapshot(feed, order, self.revision());
        let _ = sender.try_send(FeedEvent::Batch { batch });

        self.subscriptions.write().insert(
            id,
            Subscription {
                feed: feed.clone(),
                order,
                sender,
            },
        );

        tracing::debug!(subscription = id.0, feed = %feed, "subscribed");
        Ok(FeedSubscription { id, receiver })
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        if let Some(sub) = self.subscriptions.write().remove(&id) {
            let _ = sub.sender.try_send(FeedEvent::Dropped {
                reason: DropReason::Unsubscribed,
            });
            tracing::debug!(subscription = id.0, feed = %sub.feed, "unsubscribed");
        }
    }

    fn fetch_once(&self, feed: &FeedId, order: OrderSpec) -> Result<FeedBatch> {
        if let Some(failure) = self.faults.lock().fetch_failures.pop_front() {
            return Err(failure.into());
        }
        self.check_access(feed)?;
        Ok(self.snapshot(feed, order, self.revision()))
    }

    fn publish(&self, feed: &FeedId, draft: ItemDraft) -> Result<FeedItem> {
        draft.validate()?;
        if let Some(failure) = self.faults.lock().publish_failures.pop_front() {
            return Err(failure.into());
        }
        self.check_access(feed)?;

        let _lock = self.write_lock.lock();
        let n = self.next_item.fetch_add(1, Ordering::SeqCst);
        let item = FeedItem {
            id: ItemId(format!("item-{:06}", n)),
            created_at: Some(self.clock.now()),
            author_id: draft.author_id,
            payload: draft.payload,
        };

        self.feeds
            .write()
            .entry(feed.clone())
            .or_default()
            .insert(item.id.clone(), item.clone());
        self.bump_and_broadcast(feed);

        Ok(item)
    }

    fn get(&self, feed: &FeedId, item: &ItemId) -> Result<FeedItem> {
        self.check_access(feed)?;
        self.feeds
            .read()
            .get(feed)
            .and_then(|items| items.get(item))
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("{}/{}", feed, item)))
    }

    fn delete(&self, feed: &FeedId, item: &ItemId) -> Result<()> {
        self.check_access(feed)?;

        let _lock = self.write_lock.lock();
        let removed = self
            .feeds
            .write()
            .get_mut(feed)
            .and_then(|items| items.remove(item));
        if removed.is_none() {
            return Err(SyncError::NotFound(format!("{}/{}", feed, item)));
        }
        self.bump_and_broadcast(feed);
        Ok(())
    }

    fn increment(&self, feed: &FeedId, item: &ItemId, field: &str, delta: i64) -> Result<i64> {
        self.check_access(feed)?;

        let _lock = self.write_lock.lock();
        let value = {
            let mut feeds = self.feeds.write();
            let target = feeds
                .get_mut(feed)
                .and_then(|items| items.get_mut(item))
                .ok_or_else(|| SyncError::NotFound(format!("{}/{}", feed, item)))?;
            let value = target.counter(field).saturating_add(delta).max(0);
            target.payload.insert(field.to_string(), Value::from(value));
            value
        };
        self.bump_and_broadcast(feed);
        Ok(value)
    }

    fn update(
        &self,
        feed: &FeedId,
        item: &ItemId,
        apply: &mut dyn FnMut(&mut Map<String, Value>) -> Result<()>,
    ) -> Result<FeedItem> {
        self.check_access(feed)?;
        let missing = || SyncError::NotFound(format!("{}/{}", feed, item));

        let _lock = self.write_lock.lock();
        let mut payload = self
            .feeds
            .read()
            .get(feed)
            .and_then(|items| items.get(item))
            .map(|existing| existing.payload.clone())
            .ok_or_else(missing)?;
        apply(&mut payload)?;

        let updated = {
            let mut feeds = self.feeds.write();
            let target = feeds
                .get_mut(feed)
                .and_then(|items| items.get_mut(item))
                .ok_or_else(missing)?;
            target.payload = payload;
            target.clone()
        };
        self.bump_and_broadcast(feed);
        Ok(updated)
    }
}

impl Drop for MemoryFeedSource {
    fn drop(&mut self) {
        for (_, sub) in self.subscriptions.get_mut().drain() {
            let _ = sub.sender.try_send(FeedEvent::Dropped {
                reason: DropReason::SourceClosed,
            });
        }
    }
}
