//! Stale results must never touch state: out-of-order batches, late refreshes
//! and events that arrive after deactivation.

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use readtrack::{
    FeedBatch, FeedEvent, FeedId, FeedItem, FeedSource, FeedSubscription, FailureKind, ItemDraft,
    ItemId, ManualClock, MemoryCursorStore, OrderSpec, RefreshOutcome, Result, SubscriptionId,
    SyncConfig, SyncError, SyncState, Synchronizer, Timestamp, ViewerId,
};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

/// A source driven entirely by the test: batches are pushed by hand and
/// `fetch_once` blocks until the test releases a result.
#[derive(Default)]
struct ScriptedSource {
    /// Senders stay alive after unsubscribe so late events can be injected.
    senders: Mutex<Vec<Sender<FeedEvent>>>,
    unsubscribed: Mutex<Vec<SubscriptionId>>,
    fetch: Mutex<Option<Receiver<Result<FeedBatch>>>>,
    /// When set, `publish` waits for a signal before storing.
    publish_gate: Mutex<Option<Receiver<()>>>,
    published: Mutex<Vec<FeedItem>>,
    next_id: AtomicU64,
}

impl ScriptedSource {
    fn push(&self, batch: FeedBatch) {
        if let Some(sender) = self.senders.lock().last() {
            let _ = sender.send(FeedEvent::Batch { batch });
        }
    }

    /// Make the next `fetch_once` wait for a value on the returned sender.
    fn gate_fetch(&self) -> Sender<Result<FeedBatch>> {
        let (tx, rx) = bounded(1);
        *self.fetch.lock() = Some(rx);
        tx
    }

    /// Make the next `publish` wait for a signal on the returned sender.
    fn gate_publish(&self) -> Sender<()> {
        let (tx, rx) = bounded(1);
        *self.publish_gate.lock() = Some(rx);
        tx
    }
}

impl FeedSource for ScriptedSource {
    fn subscribe(&self, _feed: &FeedId, _order: OrderSpec) -> Result<FeedSubscription> {
        let (tx, rx) = unbounded();
        self.senders.lock().push(tx);
        Ok(FeedSubscription {
            id: SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst)),
            receiver: rx,
        })
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.unsubscribed.lock().push(id);
    }

    fn fetch_once(&self, _feed: &FeedId, _order: OrderSpec) -> Result<FeedBatch> {
        let gate = self.fetch.lock().clone();
        match gate {
            Some(rx) => rx
                .recv_timeout(WAIT)
                .unwrap_or_else(|_| Err(SyncError::TransientNetwork("gate never opened".into()))),
            None => Err(SyncError::TransientNetwork("no fetch scripted".into())),
        }
    }

    fn publish(&self, _feed: &FeedId, draft: ItemDraft) -> Result<FeedItem> {
        let gate = self.publish_gate.lock().take();
        if let Some(rx) = gate {
            rx.recv_timeout(WAIT)
                .map_err(|_| SyncError::TransientNetwork("gate never opened".into()))?;
        }
        let item = FeedItem {
            id: ItemId::new(format!("pub{}", self.next_id.fetch_add(1, Ordering::SeqCst))),
            created_at: Some(Timestamp(2_000)),
            author_id: draft.author_id,
            payload: draft.payload,
        };
        self.published.lock().push(item.clone());
        Ok(item)
    }

    fn get(&self, feed: &FeedId, item: &ItemId) -> Result<FeedItem> {
        Err(SyncError::NotFound(format!("{}/{}", feed, item)))
    }

    fn delete(&self, feed: &FeedId, item: &ItemId) -> Result<()> {
        Err(SyncError::NotFound(format!("{}/{}", feed, item)))
    }

    fn increment(&self, feed: &FeedId, item: &ItemId, _field: &str, _delta: i64) -> Result<i64> {
        Err(SyncError::NotFound(format!("{}/{}", feed, item)))
    }

    fn update(
        &self,
        feed: &FeedId,
        item: &ItemId,
        _apply: &mut dyn FnMut(&mut Map<String, Value>) -> Result<()>,
    ) -> Result<FeedItem> {
        Err(SyncError::NotFound(format!("{}/{}", feed, item)))
    }
}

fn feed() -> FeedId {
    FeedId::new("forumPosts")
}

fn batch(revision: u64, stamps: &[i64]) -> FeedBatch {
    let items = stamps
        .iter()
        .map(|ts| FeedItem {
            id: ItemId::new(format!("i{}", ts)),
            created_at: Some(Timestamp(*ts)),
            author_id: ViewerId::new("bob"),
            payload: Map::new(),
        })
        .collect();
    FeedBatch::new(feed(), revision, items)
}

fn setup(config: SyncConfig) -> (Arc<ScriptedSource>, Synchronizer) {
    let source = Arc::new(ScriptedSource::default());
    let sync = Synchronizer::new(
        source.clone(),
        Arc::new(MemoryCursorStore::new()),
        Arc::new(ManualClock::new(Timestamp(1_000))),
        config,
    );
    (source, sync)
}

fn config() -> SyncConfig {
    SyncConfig {
        first_batch_timeout: Duration::from_secs(5),
        fetch_timeout: Duration::from_secs(5),
        publish_timeout: Duration::from_secs(1),
    }
}

#[test]
fn test_late_batch_after_deactivate_is_ignored() {
    let (source, sync) = setup(config());
    sync.activate(feed(), ViewerId::new("ada")).unwrap();
    source.push(batch(1, &[10, 20]));
    sync.wait_for(WAIT, |v| v.state == SyncState::Ready).unwrap();

    sync.deactivate();
    let generation = sync.generation();
    source.push(batch(2, &[10, 20, 30]));
    std::thread::sleep(Duration::from_millis(50));

    let view = sync.view();
    assert_eq!(view.state, SyncState::Idle);
    assert!(view.snapshot.is_empty());
    assert_eq!(view.generation, generation);
    assert_eq!(source.unsubscribed.lock().len(), 1);
}

#[test]
fn test_older_revision_is_dropped() {
    let (source, sync) = setup(config());
    sync.activate(feed(), ViewerId::new("ada")).unwrap();

    source.push(batch(5, &[10, 20, 30]));
    source.push(batch(4, &[10]));
    source.push(batch(6, &[10, 20, 30, 40]));

    let view = sync
        .wait_for(WAIT, |v| v.snapshot.revision == 6)
        .unwrap();
    assert_eq!(view.snapshot.len(), 4);

    source.push(batch(3, &[]));
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(sync.view().snapshot.revision, 6);
    assert_eq!(sync.view().snapshot.len(), 4);
}

#[test]
fn test_refresh_in_flight_during_deactivate_is_discarded() {
    let (source, sync) = setup(config());
    sync.activate(feed(), ViewerId::new("ada")).unwrap();
    source.push(batch(1, &[10]));
    sync.wait_for(WAIT, |v| v.state == SyncState::Ready).unwrap();

    let gate = source.gate_fetch();
    let ticket = sync.manual_refresh().unwrap();
    assert_eq!(sync.state(), SyncState::Refreshing);

    sync.deactivate();
    assert_eq!(ticket.wait(WAIT), Some(RefreshOutcome::Discarded));

    // The fetch completes after the fact.
    let _ = gate.send(Ok(batch(9, &[10, 20, 30])));
    std::thread::sleep(Duration::from_millis(50));

    let view = sync.view();
    assert_eq!(view.state, SyncState::Idle);
    assert!(view.snapshot.is_empty());
}

#[test]
fn test_refresh_older_than_live_snapshot_is_superseded() {
    let (source, sync) = setup(config());
    sync.activate(feed(), ViewerId::new("ada")).unwrap();
    source.push(batch(3, &[10]));
    sync.wait_for(WAIT, |v| v.state == SyncState::Ready).unwrap();

    let gate = source.gate_fetch();
    let ticket = sync.manual_refresh().unwrap();

    // The subscription moves ahead while the pull is in flight.
    source.push(batch(5, &[10, 20]));
    sync.wait_for(WAIT, |v| v.snapshot.revision == 5).unwrap();
    assert_eq!(sync.state(), SyncState::Refreshing);

    gate.send(Ok(batch(4, &[10]))).unwrap();
    assert_eq!(ticket.wait(WAIT), Some(RefreshOutcome::Superseded));

    let view = sync.wait_for(WAIT, |v| v.state == SyncState::Ready).unwrap();
    assert_eq!(view.snapshot.revision, 5);
    assert_eq!(view.snapshot.len(), 2);
}

#[test]
fn test_refresh_applies_newer_snapshot() {
    let (source, sync) = setup(config());
    sync.activate(feed(), ViewerId::new("ada")).unwrap();
    source.push(batch(1, &[10]));
    sync.wait_for(WAIT, |v| v.state == SyncState::Ready).unwrap();

    let gate = source.gate_fetch();
    let ticket = sync.manual_refresh().unwrap();
    gate.send(Ok(batch(2, &[10, 20]))).unwrap();

    assert_eq!(ticket.wait(WAIT), Some(RefreshOutcome::Applied { revision: 2 }));
    let view = sync.view();
    assert_eq!(view.state, SyncState::Ready);
    assert_eq!(view.snapshot.len(), 2);
}

#[test]
fn test_refresh_timeout_keeps_snapshot() {
    let (source, sync) = setup(SyncConfig {
        fetch_timeout: Duration::from_millis(50),
        ..config()
    });
    sync.activate(feed(), ViewerId::new("ada")).unwrap();
    source.push(batch(1, &[10, 20]));
    sync.wait_for(WAIT, |v| v.state == SyncState::Ready).unwrap();

    let _gate = source.gate_fetch();
    let ticket = sync.manual_refresh().unwrap();
    match ticket.wait(WAIT) {
        Some(RefreshOutcome::Failed(failure)) => assert_eq!(failure.kind, FailureKind::Timeout),
        other => panic!("unexpected outcome: {:?}", other),
    }

    let view = sync.view();
    assert_eq!(view.state, SyncState::Ready);
    assert_eq!(view.snapshot.len(), 2);
}

#[test]
fn test_first_batch_timeout_then_recovery() {
    let (source, sync) = setup(SyncConfig {
        first_batch_timeout: Duration::from_millis(50),
        ..config()
    });
    sync.activate(feed(), ViewerId::new("ada")).unwrap();

    let view = sync
        .wait_for(WAIT, |v| matches!(v.state, SyncState::Error(_)))
        .unwrap();
    assert_eq!(view.state, SyncState::Error(FailureKind::Timeout));

    // The subscription is still open; a late first batch recovers.
    source.push(batch(1, &[10]));
    let view = sync.wait_for(WAIT, |v| v.state == SyncState::Ready).unwrap();
    assert_eq!(view.unread_count(), 1);
    assert!(view.last_error.is_none());
}

#[test]
fn test_reactivation_discards_previous_refresh() {
    let (source, sync) = setup(config());
    sync.activate(feed(), ViewerId::new("ada")).unwrap();
    source.push(batch(1, &[10]));
    sync.wait_for(WAIT, |v| v.state == SyncState::Ready).unwrap();

    let gate = source.gate_fetch();
    let ticket = sync.manual_refresh().unwrap();

    sync.activate(feed(), ViewerId::new("bob")).unwrap();
    assert_eq!(ticket.wait(WAIT), Some(RefreshOutcome::Discarded));
    let _ = gate.send(Ok(batch(7, &[10, 20, 30])));

    source.push(batch(8, &[10, 20]));
    let view = sync.wait_for(WAIT, |v| v.state == SyncState::Ready).unwrap();
    assert_eq!(view.snapshot.revision, 8);
    assert_eq!(view.key.unwrap().viewer, ViewerId::new("bob"));
}

#[test]
fn test_publish_timeout_may_still_store() {
    let (source, sync) = setup(SyncConfig {
        publish_timeout: Duration::from_millis(50),
        ..config()
    });
    sync.activate(feed(), ViewerId::new("ada")).unwrap();
    source.push(batch(1, &[10]));
    sync.wait_for(WAIT, |v| v.state == SyncState::Ready).unwrap();

    let gate = source.gate_publish();
    let mut payload = Map::new();
    payload.insert("title".into(), Value::from("slow"));
    let err = sync
        .publish(&feed(), &ViewerId::new("ada"), payload)
        .unwrap_err();
    assert!(matches!(err, SyncError::Timeout(_)));
    assert!(err.is_retryable());
    // No acknowledgement for an unconfirmed publish.
    assert_eq!(sync.view().cursor.unwrap().last_acknowledged, Timestamp::EPOCH);

    // The source finishes the write after the caller gave up.
    gate.send(()).unwrap();
    let deadline = std::time::Instant::now() + WAIT;
    while source.published.lock().is_empty() && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    let published = source.published.lock();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].text("title"), Some("slow"));
}
