//! Subscription types for live feed updates.

use crate::error::{FailureKind, SourceFailure};
use crate::types::FeedBatch;
use serde::{Deserialize, Serialize};

/// Events delivered on a feed subscription.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedEvent {
    /// A full snapshot of the feed (never a delta).
    Batch { batch: FeedBatch },

    /// The source failed. Terminal: no further events follow.
    Failed { failure: SourceFailure },

    /// The subscription was closed by the source. Terminal.
    Dropped { reason: DropReason },
}

impl FeedEvent {
    /// Whether the stream ends after this event.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, FeedEvent::Batch { .. })
    }

    /// The failure class, for `Failed` events.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            FeedEvent::Failed { failure } => Some(failure.kind),
            _ => None,
        }
    }
}

/// Why a subscription was dropped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Send buffer overflowed (slow consumer).
    BufferOverflow,
    /// Explicitly unsubscribed.
    Unsubscribed,
    /// The source shut down.
    SourceClosed,
}

/// Unique identifier for a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

/// Receiving end of a feed subscription.
pub struct FeedSubscription {
    pub id: SubscriptionId,
    /// Channel to receive events.
    pub receiver: crossbeam_channel::Receiver<FeedEvent>,
}

impl FeedSubscription {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<FeedEvent, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<FeedEvent, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<FeedEvent, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}
