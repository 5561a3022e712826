//! Observable synchronizer state.

use crate::detector::FeedSnapshot;
use crate::error::{FailureKind, SourceFailure};
use crate::types::{Cursor, FeedKey};
use crossbeam_channel::Receiver;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Lifecycle state of the synchronizer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// No feed is active.
    Idle,
    /// Subscribed, waiting for the first snapshot.
    Loading,
    /// A snapshot is installed and the subscription is live.
    Ready,
    /// A manual refresh is in flight; the last snapshot is still shown.
    Refreshing,
    /// The subscription failed. The last snapshot, if any, is kept.
    Error(FailureKind),
}

impl SyncState {
    pub fn is_idle(self) -> bool {
        self == SyncState::Idle
    }

    /// Whether a snapshot from the live subscription has been installed.
    pub fn has_data(self) -> bool {
        matches!(self, SyncState::Ready | SyncState::Refreshing)
    }
}

/// What triggered an acknowledgement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckReason {
    Explicit,
    Focus,
    Resume,
    Publish,
}

impl fmt::Display for AckReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AckReason::Explicit => "explicit",
            AckReason::Focus => "focus",
            AckReason::Resume => "resume",
            AckReason::Publish => "publish",
        };
        f.write_str(name)
    }
}

/// A consistent copy of the synchronizer's state, taken under one lock.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeedView {
    pub state: SyncState,
    pub generation: u64,
    pub key: Option<FeedKey>,
    pub cursor: Option<Cursor>,
    pub focused: bool,
    pub snapshot: FeedSnapshot,
    pub last_error: Option<SourceFailure>,
}

impl FeedView {
    pub fn unread_count(&self) -> usize {
        self.snapshot.unread_count
    }

    pub fn has_unread(&self) -> bool {
        self.snapshot.has_unread
    }
}

/// How a manual refresh ended.
#[derive(Clone, Debug, PartialEq)]
pub enum RefreshOutcome {
    /// The pulled snapshot was installed.
    Applied { revision: u64 },
    /// A newer snapshot was already installed; the pull was dropped.
    Superseded,
    /// The pull failed. The previous snapshot is kept.
    Failed(SourceFailure),
    /// The feed was deactivated or replaced before the pull finished.
    Discarded,
}

/// Completion handle for [`crate::Synchronizer::manual_refresh`].
pub struct RefreshTicket {
    receiver: Receiver<RefreshOutcome>,
}

impl RefreshTicket {
    pub(crate) fn new(receiver: Receiver<RefreshOutcome>) -> Self {
        Self { receiver }
    }

    /// Wait for the refresh to finish.
    ///
    /// Returns `None` on timeout, or [`RefreshOutcome::Discarded`] if the
    /// task was torn down without reporting.
    pub fn wait(&self, timeout: Duration) -> Option<RefreshOutcome> {
        match self.receiver.recv_timeout(timeout) {
            Ok(outcome) => Some(outcome),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => None,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                Some(RefreshOutcome::Discarded)
            }
        }
    }
}
