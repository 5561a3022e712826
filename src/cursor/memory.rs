//! In-process cursor store.

use super::CursorStore;
use crate::error::{Result, SyncError};
use crate::types::{Cursor, FeedId, FeedKey, Timestamp, ViewerId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Cursor store held entirely in memory.
///
/// Reads and writes can be made to fail on demand, which is how tests
/// exercise the epoch-zero fallback of the synchronizer.
#[derive(Default)]
pub struct MemoryCursorStore {
    entries: RwLock<HashMap<FeedKey, Timestamp>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `get` calls fail with a storage error.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent `set` calls fail with a storage error.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful writes so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl CursorStore for MemoryCursorStore {
    fn get(&self, feed: &FeedId, viewer: &ViewerId) -> Result<Option<Cursor>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(SyncError::Storage("cursor read failed".into()));
        }
        let key = FeedKey::new(feed.clone(), viewer.clone());
        Ok(self
            .entries
            .read()
            .get(&key)
            .map(|at| Cursor::new(feed.clone(), viewer.clone(), *at)))
    }

    fn set(&self, feed: &FeedId, viewer: &ViewerId, at: Timestamp) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SyncError::Storage("cursor write failed".into()));
        }
        self.entries
            .write()
            .insert(FeedKey::new(feed.clone(), viewer.clone()), at);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn remove_viewer(&self, viewer: &ViewerId) -> Result<usize> {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|key, _| &key.viewer != viewer);
        Ok(before - entries.len())
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }
}
