//! Storage traits and types.
//!
//! This module defines the ordered key-value storage abstraction used by the
//! eventlog crates: point reads, atomic batched writes, and snapshot-isolated
//! forward range iteration. Two backends are provided: [`in_memory`] for
//! tests and development, and [`slate`] for durable SlateDB-backed storage.
//! Use [`factory::create_storage`] to construct a backend from configuration.

pub mod config;
pub mod factory;
pub mod in_memory;
pub mod slate;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::util::BytesRange;

/// A key-value record stored in (or read from) storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: Bytes,
    pub value: Bytes,
}

impl Record {
    pub fn new(key: Bytes, value: Bytes) -> Self {
        Self { key, value }
    }
}

/// Options controlling write durability.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Whether to wait for the write to be durable before returning.
    ///
    /// When `false` (the default), the write is acknowledged once applied
    /// in memory, trading durability for latency.
    pub await_durable: bool,
}

/// Errors produced by storage backends.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    #[error("storage error: {0}")]
    Storage(String),
}

impl StorageError {
    /// Wraps a backend-specific error.
    pub fn from_storage(err: impl std::fmt::Display) -> Self {
        StorageError::Storage(err.to_string())
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Read operations over storage.
///
/// Implemented by both live databases and snapshots. Iteration is always in
/// ascending byte-lexicographic key order.
#[async_trait]
pub trait StorageRead: Send + Sync {
    /// Retrieves a single record by key, or `None` if absent.
    async fn get(&self, key: Bytes) -> StorageResult<Option<Record>>;

    /// Returns a forward iterator over records in the given key range.
    async fn scan_iter(
        &self,
        range: BytesRange,
    ) -> StorageResult<Box<dyn StorageIterator + Send + '_>>;

    /// Collects all records in the given key range.
    ///
    /// Convenience wrapper over [`scan_iter`](StorageRead::scan_iter) for
    /// small ranges and tests.
    async fn scan(&self, range: BytesRange) -> StorageResult<Vec<Record>> {
        let mut iter = self.scan_iter(range).await?;
        let mut records = Vec::new();
        while let Some(record) = iter.next().await? {
            records.push(record);
        }
        Ok(records)
    }
}

/// A pull-based iterator over storage records.
#[async_trait]
pub trait StorageIterator {
    /// Returns the next record in key order, or `None` when exhausted.
    async fn next(&mut self) -> StorageResult<Option<Record>>;
}

/// A consistent read-only view of storage at a point in time.
///
/// Writes applied after the snapshot was taken are not visible through it.
#[async_trait]
pub trait StorageSnapshot: StorageRead {}

/// Full read-write storage operations.
#[async_trait]
pub trait Storage: StorageRead {
    /// Writes a batch of records atomically with default options.
    async fn put(&self, records: Vec<Record>) -> StorageResult<()> {
        self.put_with_options(records, WriteOptions::default())
            .await
    }

    /// Writes a batch of records atomically.
    ///
    /// Either every record in the batch becomes visible or none does;
    /// partial application must never be observable.
    async fn put_with_options(
        &self,
        records: Vec<Record>,
        options: WriteOptions,
    ) -> StorageResult<()>;

    /// Deletes a batch of keys atomically. Missing keys are ignored.
    async fn delete(&self, keys: Vec<Bytes>) -> StorageResult<()>;

    /// Takes a consistent snapshot of the current storage state.
    async fn snapshot(&self) -> StorageResult<Arc<dyn StorageSnapshot>>;
}
