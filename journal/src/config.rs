//! Configuration options for the journal.

use std::time::Duration;

use common::StorageConfig;

/// Configuration for opening a [`Journal`](crate::Journal).
#[derive(Debug, Clone)]
pub struct Config {
    /// Storage backend configuration.
    ///
    /// Determines where and how journal data is persisted. See
    /// [`StorageConfig`] for available options including in-memory and
    /// SlateDB backends.
    pub storage: StorageConfig,

    /// Whether every write batch waits for durable storage before being
    /// acknowledged.
    ///
    /// When `false` (the default), batches are acknowledged once applied,
    /// trading crash durability for write latency.
    pub sync_on_write: bool,

    /// Interval at which live queries re-scan for new events.
    ///
    /// Live queries are normally woken by append notifications; the refresh
    /// interval is the fallback that bounds staleness if a notification is
    /// lost.
    pub refresh_interval: Duration,

    /// Maximum number of buffered, undelivered items per query.
    ///
    /// Each replay round fetches at most this many events minus what is
    /// already buffered, so a slow consumer never forces unbounded memory.
    pub max_buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            sync_on_write: false,
            refresh_interval: Duration::from_secs(3),
            max_buffer_size: 100,
        }
    }
}
