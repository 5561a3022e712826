//! The feed synchronizer state machine.

use super::task::{run_with_timeout, CancellationToken, TaskHandle};
use super::types::{AckReason, FeedView, RefreshOutcome, RefreshTicket, SyncState};
use crate::config::SyncConfig;
use crate::cursor::CursorStore;
use crate::detector::FeedSnapshot;
use crate::error::{FailureKind, Result, SourceFailure, SyncError};
use crate::identity::AuthEvent;
use crate::source::{DropReason, FeedEvent, FeedSource, FeedSubscription, SubscriptionId};
use crate::types::{
    Clock, Cursor, FeedBatch, FeedId, FeedItem, FeedKey, ItemDraft, OrderSpec, Timestamp,
    ViewerId,
};
use crossbeam_channel::{after, bounded, never, select};
use parking_lot::{Condvar, Mutex};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// The feed currently driven by the synchronizer.
struct Active {
    key: FeedKey,
    order: OrderSpec,
    cursor: Cursor,
    subscription: Option<SubscriptionId>,
    focused: bool,
}

/// Mutable synchronizer state, guarded by `Shared::inner`.
struct Inner {
    state: SyncState,
    /// Bumped on every activation and teardown. Work started under an older
    /// generation must not touch state.
    generation: u64,
    active: Option<Active>,
    snapshot: FeedSnapshot,
    last_error: Option<SourceFailure>,
    /// Refreshes started and not yet finished for this generation.
    refreshing: usize,
}

impl Inner {
    fn view(&self) -> FeedView {
        FeedView {
            state: self.state,
            generation: self.generation,
            key: self.active.as_ref().map(|a| a.key.clone()),
            cursor: self.active.as_ref().map(|a| a.cursor.clone()),
            focused: self.active.as_ref().map_or(false, |a| a.focused),
            snapshot: self.snapshot.clone(),
            last_error: self.last_error.clone(),
        }
    }

    /// Install a batch if it is not older than the current snapshot.
    /// Returns false when the batch was superseded.
    fn apply_batch(&mut self, batch: &FeedBatch) -> bool {
        let Some(active) = self.active.as_ref() else {
            return false;
        };
        if batch.feed != active.key.feed {
            tracing::warn!(expected = %active.key.feed, got = %batch.feed, "batch for another feed");
            return false;
        }
        if batch.revision < self.snapshot.revision {
            tracing::debug!(
                revision = batch.revision,
                current = self.snapshot.revision,
                "dropping superseded snapshot"
            );
            return false;
        }

        self.snapshot = FeedSnapshot::from_batch(batch, &active.cursor);
        self.state = match self.state {
            SyncState::Refreshing if self.refreshing > 0 => SyncState::Refreshing,
            _ => SyncState::Ready,
        };
        self.last_error = None;
        true
    }

    /// Drop the active feed after a permission failure. Returns the
    /// subscription to close.
    fn teardown(&mut self, failure: SourceFailure) -> Option<SubscriptionId> {
        self.generation += 1;
        let subscription = self.active.take().and_then(|a| a.subscription);
        self.state = SyncState::Idle;
        self.snapshot = FeedSnapshot::empty();
        self.refreshing = 0;
        self.last_error = Some(failure);
        subscription
    }
}

/// State shared with the pump and refresh threads.
struct Shared {
    source: Arc<dyn FeedSource>,
    cursors: Arc<dyn CursorStore>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
    inner: Mutex<Inner>,
    changed: Condvar,
    /// Serializes cursor writes.
    cursor_writes: Mutex<()>,
}

impl Shared {
    fn handle_batch(&self, generation: u64, batch: FeedBatch) {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            tracing::debug!(generation, revision = batch.revision, "discarding batch from stale subscription");
            return;
        }
        if inner.apply_batch(&batch) {
            tracing::debug!(
                feed = %batch.feed,
                revision = batch.revision,
                items = batch.len(),
                unread = inner.snapshot.unread_count,
                "applied batch"
            );
            self.changed.notify_all();
        }
    }

    /// Map a source failure onto state. Permission failures tear the feed down.
    fn handle_failure(&self, generation: u64, failure: SourceFailure) {
        let subscription = {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                return;
            }
            let subscription = if failure.kind == FailureKind::Permission {
                tracing::warn!(error = %failure.message, "permission denied, deactivating feed");
                inner.teardown(failure)
            } else {
                tracing::warn!(kind = ?failure.kind, error = %failure.message, "feed source failed");
                inner.state = SyncState::Error(failure.kind);
                inner.last_error = Some(failure);
                None
            };
            self.changed.notify_all();
            subscription
        };

        if let Some(id) = subscription {
            self.source.unsubscribe(id);
        }
    }

    fn finish_refresh(&self, generation: u64, result: Result<FeedBatch>) -> RefreshOutcome {
        let mut subscription = None;
        let outcome = {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                tracing::debug!(generation, "discarding refresh result from stale activation");
                return RefreshOutcome::Discarded;
            }
            inner.refreshing = inner.refreshing.saturating_sub(1);

            let outcome = match result {
                Ok(batch) => {
                    if inner.apply_batch(&batch) {
                        RefreshOutcome::Applied {
                            revision: batch.revision,
                        }
                    } else {
                        RefreshOutcome::Superseded
                    }
                }
                Err(SyncError::Cancelled) => RefreshOutcome::Discarded,
                Err(e) => {
                    let failure = SourceFailure::from(&e);
                    if failure.kind == FailureKind::Permission {
                        tracing::warn!(error = %e, "refresh denied, deactivating feed");
                        subscription = inner.teardown(failure.clone());
                    } else {
                        // Keep whatever is on screen.
                        tracing::warn!(error = %e, "manual refresh failed");
                    }
                    RefreshOutcome::Failed(failure)
                }
            };

            if inner.state == SyncState::Refreshing && inner.refreshing == 0 {
                inner.state = SyncState::Ready;
            }
            self.changed.notify_all();
            outcome
        };

        if let Some(id) = subscription {
            self.source.unsubscribe(id);
        }
        outcome
    }

    /// Deliver subscription events in arrival order until the stream ends
    /// or the task is cancelled.
    fn pump(&self, generation: u64, subscription: FeedSubscription, token: CancellationToken) {
        // Replaced with `never` once the first batch arrives or it fires.
        let mut deadline = after(self.config.first_batch_timeout);

        loop {
            let mut disarm = false;
            select! {
                recv(subscription.receiver) -> event => match event {
                    Ok(FeedEvent::Batch { batch }) => {
                        disarm = true;
                        self.handle_batch(generation, batch);
                    }
                    Ok(FeedEvent::Failed { failure }) => {
                        self.handle_failure(generation, failure);
                        break;
                    }
                    Ok(FeedEvent::Dropped { reason }) => {
                        if reason != DropReason::Unsubscribed {
                            self.handle_failure(
                                generation,
                                SourceFailure::transient(format!("subscription dropped: {:?}", reason)),
                            );
                        }
                        break;
                    }
                    Err(_) => {
                        self.handle_failure(
                            generation,
                            SourceFailure::transient("subscription channel closed"),
                        );
                        break;
                    }
                },
                recv(token.signal()) -> _ => break,
                recv(deadline) -> _ => {
                    disarm = true;
                    self.handle_failure(
                        generation,
                        SourceFailure::new(
                            FailureKind::Timeout,
                            format!("no snapshot within {:?}", self.config.first_batch_timeout),
                        ),
                    );
                }
            }
            if disarm {
                deadline = never();
            }
        }

        tracing::debug!(generation, subscription = subscription.id.0, "pump stopped");
    }
}

#[derive(Default)]
struct Workers {
    pump: Option<TaskHandle<()>>,
    refreshes: Vec<TaskHandle<()>>,
}

/// Keeps one feed in sync for one viewer.
///
/// Owns the subscription to the active feed, classifies every snapshot
/// against the viewer's cursor, and moves the cursor forward on
/// acknowledgement. All collaborators are injected, so tests can swap in
/// [`crate::MemoryFeedSource`], [`crate::MemoryCursorStore`] and
/// [`crate::ManualClock`].
pub struct Synchronizer {
    shared: Arc<Shared>,
    workers: Mutex<Workers>,
    /// Serializes activate, deactivate and retry.
    lifecycle: Mutex<()>,
}

impl Synchronizer {
    pub fn new(
        source: Arc<dyn FeedSource>,
        cursors: Arc<dyn CursorStore>,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                source,
                cursors,
                clock,
                config,
                inner: Mutex::new(Inner {
                    state: SyncState::Idle,
                    generation: 0,
                    active: None,
                    snapshot: FeedSnapshot::empty(),
                    last_error: None,
                    refreshing: 0,
                }),
                changed: Condvar::new(),
                cursor_writes: Mutex::new(()),
            }),
            workers: Mutex::new(Workers::default()),
            lifecycle: Mutex::new(()),
        }
    }

    // --- Inspection ---

    /// A copy of the current state.
    pub fn view(&self) -> FeedView {
        self.shared.inner.lock().view()
    }

    pub fn state(&self) -> SyncState {
        self.shared.inner.lock().state
    }

    pub fn generation(&self) -> u64 {
        self.shared.inner.lock().generation
    }

    pub fn active_key(&self) -> Option<FeedKey> {
        self.shared.inner.lock().active.as_ref().map(|a| a.key.clone())
    }

    /// Block until the view satisfies `predicate` or `timeout` elapses.
    pub fn wait_for<P>(&self, timeout: Duration, predicate: P) -> Option<FeedView>
    where
        P: Fn(&FeedView) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut inner = self.shared.inner.lock();
        loop {
            let view = inner.view();
            if predicate(&view) {
                return Some(view);
            }
            if self.shared.changed.wait_until(&mut inner, deadline).timed_out() {
                let view = inner.view();
                return predicate(&view).then_some(view);
            }
        }
    }

    // --- Lifecycle ---

    /// Start syncing a feed for a viewer, replacing any active feed.
    ///
    /// Source and cursor failures do not fail the call; they show up in
    /// [`Synchronizer::state`].
    pub fn activate(&self, feed: FeedId, viewer: ViewerId) -> Result<()> {
        self.activate_ordered(feed, viewer, OrderSpec::NewestFirst)
    }

    /// Like [`Synchronizer::activate`] with an explicit ordering
    /// (comment threads read oldest first).
    pub fn activate_ordered(&self, feed: FeedId, viewer: ViewerId, order: OrderSpec) -> Result<()> {
        if feed.0.trim().is_empty() {
            return Err(SyncError::Validation("feed id is empty".into()));
        }
        if viewer.0.trim().is_empty() {
            return Err(SyncError::Validation("viewer id is empty".into()));
        }

        let _lifecycle = self.lifecycle.lock();
        self.deactivate_locked();
        self.start(FeedKey::new(feed, viewer), order, FeedSnapshot::empty())
    }

    /// Stop syncing. Safe to call any number of times.
    pub fn deactivate(&self) {
        let _lifecycle = self.lifecycle.lock();
        self.deactivate_locked();
    }

    /// Leave the error state by re-subscribing to the same feed.
    pub fn retry(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock();
        self.retry_locked()
    }

    /// The snapshot on screen survives the re-subscribe; the revision rule
    /// drops anything the new subscription delivers that is older.
    fn retry_locked(&self) -> Result<()> {
        let (state, key, order, snapshot) = {
            let inner = self.shared.inner.lock();
            let active = inner.active.as_ref().ok_or(SyncError::NotActive)?;
            (inner.state, active.key.clone(), active.order, inner.snapshot.clone())
        };
        if !matches!(state, SyncState::Error(_)) {
            return Ok(());
        }

        tracing::info!(
            feed = %key.feed,
            viewer = %key.viewer,
            kept = snapshot.len(),
            "retrying feed subscription"
        );
        self.deactivate_locked();
        self.start(key, order, snapshot)
    }

    /// Subscribe to `key.feed` under a fresh generation, starting from
    /// `carried` (empty on activation).
    fn start(&self, key: FeedKey, order: OrderSpec, mut carried: FeedSnapshot) -> Result<()> {
        let shared = &self.shared;
        let cursor = self.load_cursor(&key);
        carried.reclassify(&cursor);

        let generation = {
            let mut inner = shared.inner.lock();
            inner.generation += 1;
            inner.active = Some(Active {
                key: key.clone(),
                order,
                cursor,
                subscription: None,
                focused: false,
            });
            inner.state = SyncState::Loading;
            inner.snapshot = carried;
            inner.last_error = None;
            inner.refreshing = 0;
            shared.changed.notify_all();
            inner.generation
        };

        tracing::info!(feed = %key.feed, viewer = %key.viewer, generation, "activating feed");

        let subscription = match shared.source.subscribe(&key.feed, order) {
            Ok(subscription) => subscription,
            Err(e) => {
                shared.handle_failure(generation, SourceFailure::from(&e));
                return Ok(());
            }
        };

        let current = {
            let mut inner = shared.inner.lock();
            let current = inner.generation == generation;
            if let Some(active) = inner.active.as_mut().filter(|_| current) {
                active.subscription = Some(subscription.id);
            }
            current
        };
        if !current {
            shared.source.unsubscribe(subscription.id);
            return Ok(());
        }

        let subscription_id = subscription.id;
        let pump_shared = Arc::clone(shared);
        match TaskHandle::spawn("readtrack-pump", move |token| {
            pump_shared.pump(generation, subscription, token)
        }) {
            Ok(handle) => {
                self.workers.lock().pump = Some(handle);
                Ok(())
            }
            Err(e) => {
                shared.source.unsubscribe(subscription_id);
                shared.handle_failure(generation, SourceFailure::from(&e));
                Err(e)
            }
        }
    }

    /// Read the viewer's cursor, creating it at the epoch on first view.
    /// Storage failures fall back to the epoch.
    fn load_cursor(&self, key: &FeedKey) -> Cursor {
        let shared = &self.shared;
        match shared.cursors.get(&key.feed, &key.viewer) {
            Ok(Some(cursor)) => cursor,
            Ok(None) => {
                let _writes = shared.cursor_writes.lock();
                if let Err(e) = shared.cursors.set(&key.feed, &key.viewer, Timestamp::EPOCH) {
                    tracing::warn!(feed = %key.feed, viewer = %key.viewer, error = %e, "could not create cursor");
                }
                Cursor::epoch(key.feed.clone(), key.viewer.clone())
            }
            Err(e) => {
                tracing::warn!(
                    feed = %key.feed,
                    viewer = %key.viewer,
                    error = %e,
                    "cursor unavailable, treating everything as unread"
                );
                Cursor::epoch(key.feed.clone(), key.viewer.clone())
            }
        }
    }

    fn deactivate_locked(&self) {
        let (pump, refreshes) = {
            let mut workers = self.workers.lock();
            (workers.pump.take(), std::mem::take(&mut workers.refreshes))
        };

        let subscription = {
            let mut inner = self.shared.inner.lock();
            inner.generation += 1;
            let previous = inner.active.take();
            inner.state = SyncState::Idle;
            inner.snapshot = FeedSnapshot::empty();
            inner.refreshing = 0;
            self.shared.changed.notify_all();

            previous.and_then(|active| {
                tracing::info!(
                    feed = %active.key.feed,
                    viewer = %active.key.viewer,
                    generation = inner.generation,
                    "deactivated feed"
                );
                active.subscription
            })
        };

        if let Some(id) = subscription {
            self.shared.source.unsubscribe(id);
        }

        for task in pump.iter().chain(refreshes.iter()) {
            task.cancel();
        }
        if let Some(task) = pump {
            task.join();
        }
        for task in refreshes {
            task.join();
        }
    }

    // --- Read tracking ---

    /// Mark everything currently visible as read and persist the cursor.
    ///
    /// Returns the new cursor value. Persisting is best effort: a failed
    /// write is logged and the in-memory cursor still advances.
    pub fn acknowledge(&self, reason: AckReason) -> Result<Timestamp> {
        self.acknowledge_at_least(reason, None)
    }

    fn acknowledge_at_least(&self, reason: AckReason, floor: Option<Timestamp>) -> Result<Timestamp> {
        let shared = &self.shared;
        let _writes = shared.cursor_writes.lock();

        let (key, generation, target) = {
            let inner = shared.inner.lock();
            let active = inner.active.as_ref().ok_or(SyncError::NotActive)?;
            let target = [
                Some(active.cursor.last_acknowledged),
                Some(shared.clock.now()),
                inner.snapshot.newest(),
                floor,
            ]
            .into_iter()
            .flatten()
            .max()
            .unwrap_or(Timestamp::EPOCH);
            (active.key.clone(), inner.generation, target)
        };

        if let Err(e) = shared.cursors.set(&key.feed, &key.viewer, target) {
            tracing::warn!(feed = %key.feed, viewer = %key.viewer, error = %e, "cursor write failed");
        }

        let mut inner = shared.inner.lock();
        if inner.generation != generation {
            return Ok(target);
        }
        let Inner {
            active, snapshot, ..
        } = &mut *inner;
        if let Some(active) = active.as_mut() {
            if target > active.cursor.last_acknowledged {
                active.cursor.last_acknowledged = target;
            }
            snapshot.reclassify(&active.cursor);
        }
        shared.changed.notify_all();

        tracing::debug!(feed = %key.feed, viewer = %key.viewer, %reason, at = target.0, "acknowledged");
        Ok(target)
    }

    /// The feed's screen gained focus: remember it and acknowledge.
    pub fn focus(&self) -> Result<Timestamp> {
        {
            let mut inner = self.shared.inner.lock();
            let active = inner.active.as_mut().ok_or(SyncError::NotActive)?;
            active.focused = true;
        }
        self.acknowledge(AckReason::Focus)
    }

    /// The feed's screen lost focus.
    pub fn blur(&self) {
        if let Some(active) = self.shared.inner.lock().active.as_mut() {
            active.focused = false;
        }
    }

    /// The app returned to the foreground. Acknowledges only when the active
    /// feed is focused; returns whether it did.
    pub fn on_foreground_resume(&self) -> Result<bool> {
        let focused = self
            .shared
            .inner
            .lock()
            .active
            .as_ref()
            .map_or(false, |a| a.focused);
        if !focused {
            return Ok(false);
        }
        match self.acknowledge(AckReason::Resume) {
            Ok(_) => Ok(true),
            Err(SyncError::NotActive) => Ok(false),
            Err(e) => Err(e),
        }
    }

    // --- Refresh ---

    /// Pull the feed once alongside the live subscription.
    ///
    /// From the error state this also re-subscribes. A failed pull leaves the
    /// current snapshot in place.
    pub fn manual_refresh(&self) -> Result<RefreshTicket> {
        let _lifecycle = self.lifecycle.lock();

        if matches!(self.state(), SyncState::Error(_)) {
            self.retry_locked()?;
        }

        let shared = &self.shared;
        let (generation, feed, order) = {
            let mut inner = shared.inner.lock();
            let (feed, order) = {
                let active = inner.active.as_ref().ok_or(SyncError::NotActive)?;
                (active.key.feed.clone(), active.order)
            };
            inner.refreshing += 1;
            if inner.state == SyncState::Ready {
                inner.state = SyncState::Refreshing;
            }
            shared.changed.notify_all();
            (inner.generation, feed, order)
        };

        tracing::debug!(feed = %feed, generation, "manual refresh");

        let (tx, rx) = bounded(1);
        let task_shared = Arc::clone(shared);
        let spawned = TaskHandle::spawn("readtrack-refresh", move |token| {
            let source = Arc::clone(&task_shared.source);
            let result = run_with_timeout(&token, task_shared.config.fetch_timeout, move || {
                source.fetch_once(&feed, order)
            });
            let outcome = task_shared.finish_refresh(generation, result);
            let _ = tx.send(outcome);
        });

        match spawned {
            Ok(handle) => {
                let mut workers = self.workers.lock();
                workers.refreshes.retain(|task| !task.is_finished());
                workers.refreshes.push(handle);
                Ok(RefreshTicket::new(rx))
            }
            Err(e) => {
                shared.finish_refresh(generation, Err(SyncError::Cancelled));
                Err(e)
            }
        }
    }

    // --- Publishing ---

    /// Hand a new item to the source.
    ///
    /// Validation happens before any I/O. On success, if the author is the
    /// viewer of this feed, the cursor moves past the new item so it never
    /// shows as unread to its own author. On failure the cursor is untouched.
    ///
    /// A [`SyncError::Timeout`] does not mean the item was rejected. The
    /// source call keeps running in the background and may still store it,
    /// in which case the live subscription delivers it later. Publishing the
    /// same payload again after a timeout can therefore create a duplicate.
    pub fn publish(&self, feed: &FeedId, author: &ViewerId, payload: Map<String, Value>) -> Result<FeedItem> {
        if feed.0.trim().is_empty() {
            return Err(SyncError::Validation("feed id is empty".into()));
        }
        let draft = ItemDraft::new(author.clone(), payload);
        draft.validate()?;

        let source = Arc::clone(&self.shared.source);
        let target = feed.clone();
        let item = run_with_timeout(
            &CancellationToken::new(),
            self.shared.config.publish_timeout,
            move || source.publish(&target, draft),
        )
        .map_err(|e| {
            tracing::warn!(feed = %feed, author = %author, error = %e, "publish failed");
            e
        })?;

        tracing::info!(feed = %feed, author = %author, item = %item.id, "published item");

        let own_feed = self
            .active_key()
            .map_or(false, |key| &key.feed == feed && &key.viewer == author);
        if own_feed {
            match self.acknowledge_at_least(AckReason::Publish, item.created_at) {
                Ok(_) | Err(SyncError::NotActive) => {}
                Err(e) => tracing::warn!(error = %e, "acknowledge after publish failed"),
            }
        }

        Ok(item)
    }

    // --- Identity ---

    /// Follow the identity provider: sign-in activates `feed` for the new
    /// viewer, sign-out deactivates.
    pub fn handle_auth_event(&self, event: &AuthEvent, feed: &FeedId) -> Result<()> {
        match event {
            AuthEvent::SignedIn(identity) => {
                if self.active_key().map_or(false, |key| {
                    &key.feed == feed && key.viewer == identity.viewer_id
                }) {
                    return Ok(());
                }
                self.activate(feed.clone(), identity.viewer_id.clone())
            }
            AuthEvent::SignedOut => {
                self.deactivate();
                Ok(())
            }
            AuthEvent::ProfileChanged(identity) => {
                tracing::debug!(viewer = %identity.viewer_id, "profile changed");
                Ok(())
            }
        }
    }
}

impl Drop for Synchronizer {
    fn drop(&mut self) {
        self.deactivate();
    }
}
