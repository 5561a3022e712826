//! Synchronizer configuration.

use std::time::Duration;

/// Synchronizer configuration.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// How long `activate` waits for the first batch before entering
    /// the error state.
    pub first_batch_timeout: Duration,

    /// Deadline for a single `fetch_once` pull.
    pub fetch_timeout: Duration,

    /// Deadline for handing a new item to the source.
    pub publish_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            first_batch_timeout: Duration::from_secs(15),
            fetch_timeout: Duration::from_secs(10),
            publish_timeout: Duration::from_secs(10),
        }
    }
}

impl SyncConfig {
    /// Short deadlines, suitable for tests and local sources.
    pub fn fast() -> Self {
        Self {
            first_batch_timeout: Duration::from_millis(500),
            fetch_timeout: Duration::from_millis(500),
            publish_timeout: Duration::from_millis(500),
        }
    }
}
