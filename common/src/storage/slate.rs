//! SlateDB-backed storage.
//!
//! SlateDB is an embedded key-value store built on object storage, providing
//! LSM-tree semantics with cloud-native durability. This module adapts it to
//! the [`Storage`] trait family.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use slatedb::{Db, DbIterator, DbRead, WriteBatch};

use crate::util::BytesRange;

use super::{
    Record, Storage, StorageError, StorageIterator, StorageRead, StorageResult, StorageSnapshot,
    WriteOptions,
};

/// SlateDB-backed implementation of the [`Storage`] trait.
pub struct SlateDbStorage {
    db: Arc<Db>,
}

impl SlateDbStorage {
    /// Creates a new storage instance wrapping the given SlateDB database.
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl StorageRead for SlateDbStorage {
    #[tracing::instrument(level = "trace", skip_all)]
    async fn get(&self, key: Bytes) -> StorageResult<Option<Record>> {
        let value = self
            .db
            .get(&key)
            .await
            .map_err(StorageError::from_storage)?;

        match value {
            Some(v) => Ok(Some(Record::new(key, v))),
            None => Ok(None),
        }
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn scan_iter(
        &self,
        range: BytesRange,
    ) -> StorageResult<Box<dyn StorageIterator + Send + '_>> {
        let iter = self
            .db
            .scan(range)
            .await
            .map_err(StorageError::from_storage)?;
        Ok(Box::new(SlateDbIterator { iter }))
    }
}

#[async_trait]
impl Storage for SlateDbStorage {
    /// Writes a batch of records to SlateDB as a single atomic operation.
    async fn put_with_options(
        &self,
        records: Vec<Record>,
        options: WriteOptions,
    ) -> StorageResult<()> {
        let mut batch = WriteBatch::new();
        for record in records {
            batch.put(record.key, record.value);
        }
        let write_options = slatedb::config::WriteOptions {
            await_durable: options.await_durable,
        };
        self.db
            .write_with_options(batch, &write_options)
            .await
            .map_err(StorageError::from_storage)?;
        Ok(())
    }

    async fn delete(&self, keys: Vec<Bytes>) -> StorageResult<()> {
        let mut batch = WriteBatch::new();
        for key in keys {
            batch.delete(key);
        }
        self.db
            .write(batch)
            .await
            .map_err(StorageError::from_storage)?;
        Ok(())
    }

    async fn snapshot(&self) -> StorageResult<Arc<dyn StorageSnapshot>> {
        let snapshot = self
            .db
            .snapshot()
            .await
            .map_err(StorageError::from_storage)?;
        Ok(Arc::new(SlateDbStorageSnapshot { snapshot }))
    }
}

struct SlateDbIterator<'a> {
    iter: DbIterator<'a>,
}

#[async_trait]
impl StorageIterator for SlateDbIterator<'_> {
    #[tracing::instrument(level = "trace", skip_all)]
    async fn next(&mut self) -> StorageResult<Option<Record>> {
        match self.iter.next().await.map_err(StorageError::from_storage)? {
            Some(entry) => Ok(Some(Record::new(entry.key, entry.value))),
            None => Ok(None),
        }
    }
}

/// SlateDB snapshot wrapper providing a consistent read-only view of the
/// database at the time the snapshot was created.
pub struct SlateDbStorageSnapshot<S> {
    snapshot: Arc<S>,
}

#[async_trait]
impl<S: DbRead + Send + Sync + 'static> StorageRead for SlateDbStorageSnapshot<S> {
    #[tracing::instrument(level = "trace", skip_all)]
    async fn get(&self, key: Bytes) -> StorageResult<Option<Record>> {
        let value = self
            .snapshot
            .get(&key)
            .await
            .map_err(StorageError::from_storage)?;

        match value {
            Some(v) => Ok(Some(Record::new(key, v))),
            None => Ok(None),
        }
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn scan_iter(
        &self,
        range: BytesRange,
    ) -> StorageResult<Box<dyn StorageIterator + Send + '_>> {
        let iter = self
            .snapshot
            .scan(range)
            .await
            .map_err(StorageError::from_storage)?;
        Ok(Box::new(SlateDbIterator { iter }))
    }
}

#[async_trait]
impl<S: DbRead + Send + Sync + 'static> StorageSnapshot for SlateDbStorageSnapshot<S> {}
