//! Error types for feed synchronization.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for synchronizer, cursor store, and source operations.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    Permission(String),

    #[error("Cursor storage error: {0}")]
    Storage(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("No feed is active")]
    NotActive,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Cursor store is locked by another process")]
    Locked,

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

/// Coarse classification of a failure, carried across channels and
/// exposed in [`crate::SyncState::Error`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    TransientNetwork,
    NotFound,
    Permission,
    Storage,
    Validation,
    Timeout,
    Internal,
}

impl SyncError {
    /// Map this error onto its failure class.
    pub fn kind(&self) -> FailureKind {
        match self {
            SyncError::TransientNetwork(_) => FailureKind::TransientNetwork,
            SyncError::NotFound(_) => FailureKind::NotFound,
            SyncError::Permission(_) => FailureKind::Permission,
            SyncError::Validation(_) => FailureKind::Validation,
            SyncError::Timeout(_) => FailureKind::Timeout,
            SyncError::Storage(_)
            | SyncError::Io(_)
            | SyncError::Locked
            | SyncError::InvalidFormat(_)
            | SyncError::ChecksumMismatch { .. }
            | SyncError::Serialization(_)
            | SyncError::Deserialization(_) => FailureKind::Storage,
            SyncError::NotActive | SyncError::Cancelled => FailureKind::Internal,
        }
    }

    /// Whether the caller may reasonably retry the same operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            FailureKind::TransientNetwork | FailureKind::Timeout
        )
    }
}

/// A failure reported by a feed source over a subscription channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl SourceFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::TransientNetwork, message)
    }

    pub fn permission(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Permission, message)
    }
}

impl From<&SyncError> for SourceFailure {
    fn from(e: &SyncError) -> Self {
        SourceFailure::new(e.kind(), e.to_string())
    }
}

impl From<SourceFailure> for SyncError {
    fn from(f: SourceFailure) -> Self {
        match f.kind {
            FailureKind::TransientNetwork => SyncError::TransientNetwork(f.message),
            FailureKind::NotFound => SyncError::NotFound(f.message),
            FailureKind::Permission => SyncError::Permission(f.message),
            FailureKind::Storage => SyncError::Storage(f.message),
            FailureKind::Validation => SyncError::Validation(f.message),
            FailureKind::Timeout | FailureKind::Internal => {
                SyncError::TransientNetwork(f.message)
            }
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for SyncError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for SyncError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        SyncError::Deserialization(e.to_string())
    }
}

/// Result type for synchronizer operations.
pub type Result<T> = std::result::Result<T, SyncError>;
