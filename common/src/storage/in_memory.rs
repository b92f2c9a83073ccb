//! In-memory storage backend.
//!
//! Backed by a [`BTreeMap`] so iteration order matches byte-lexicographic
//! key order, the same ordering durable backends provide. Snapshots clone
//! the map, which is acceptable for the test and development workloads this
//! backend targets.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;

use crate::util::BytesRange;

use super::{
    Record, Storage, StorageError, StorageIterator, StorageRead, StorageResult, StorageSnapshot,
    WriteOptions,
};

/// In-memory implementation of the [`Storage`] trait.
#[derive(Default)]
pub struct InMemoryStorage {
    data: RwLock<BTreeMap<Bytes, Bytes>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn read_map(&self) -> StorageResult<std::sync::RwLockReadGuard<'_, BTreeMap<Bytes, Bytes>>> {
        self.data
            .read()
            .map_err(|_| StorageError::Storage("storage lock poisoned".to_string()))
    }

    fn write_map(&self) -> StorageResult<std::sync::RwLockWriteGuard<'_, BTreeMap<Bytes, Bytes>>> {
        self.data
            .write()
            .map_err(|_| StorageError::Storage("storage lock poisoned".to_string()))
    }
}

#[async_trait]
impl StorageRead for InMemoryStorage {
    async fn get(&self, key: Bytes) -> StorageResult<Option<Record>> {
        let map = self.read_map()?;
        Ok(map
            .get(&key)
            .map(|value| Record::new(key.clone(), value.clone())))
    }

    async fn scan_iter(
        &self,
        range: BytesRange,
    ) -> StorageResult<Box<dyn StorageIterator + Send + '_>> {
        let map = self.read_map()?;
        Ok(Box::new(InMemoryIterator::over(&map, &range)))
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn put_with_options(
        &self,
        records: Vec<Record>,
        _options: WriteOptions,
    ) -> StorageResult<()> {
        let mut map = self.write_map()?;
        for record in records {
            map.insert(record.key, record.value);
        }
        Ok(())
    }

    async fn delete(&self, keys: Vec<Bytes>) -> StorageResult<()> {
        let mut map = self.write_map()?;
        for key in keys {
            map.remove(&key);
        }
        Ok(())
    }

    async fn snapshot(&self) -> StorageResult<Arc<dyn StorageSnapshot>> {
        let map = self.read_map()?;
        Ok(Arc::new(InMemoryStorageSnapshot { data: map.clone() }))
    }
}

/// Snapshot of an [`InMemoryStorage`] at a point in time.
pub struct InMemoryStorageSnapshot {
    data: BTreeMap<Bytes, Bytes>,
}

#[async_trait]
impl StorageRead for InMemoryStorageSnapshot {
    async fn get(&self, key: Bytes) -> StorageResult<Option<Record>> {
        Ok(self
            .data
            .get(&key)
            .map(|value| Record::new(key.clone(), value.clone())))
    }

    async fn scan_iter(
        &self,
        range: BytesRange,
    ) -> StorageResult<Box<dyn StorageIterator + Send + '_>> {
        Ok(Box::new(InMemoryIterator::over(&self.data, &range)))
    }
}

#[async_trait]
impl StorageSnapshot for InMemoryStorageSnapshot {}

/// Iterator over a materialized slice of the key space.
struct InMemoryIterator {
    records: std::vec::IntoIter<Record>,
}

impl InMemoryIterator {
    fn over(map: &BTreeMap<Bytes, Bytes>, range: &BytesRange) -> Self {
        let records: Vec<Record> = map
            .range(range.clone())
            .map(|(k, v)| Record::new(k.clone(), v.clone()))
            .collect();
        Self {
            records: records.into_iter(),
        }
    }
}

#[async_trait]
impl StorageIterator for InMemoryIterator {
    async fn next(&mut self) -> StorageResult<Option<Record>> {
        Ok(self.records.next())
    }
}
