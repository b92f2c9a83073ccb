//! Stream-name to namespace-id mapping.
//!
//! Every stream name (including the synthetic `$$$tag` streams) is assigned
//! a compact numeric namespace id on first use. Assignments are permanent:
//! the mapping entry is persisted before the in-memory cache is updated, and
//! an id, once handed out, is never reused or reassigned.
//!
//! The registry lives inside the single writer task, which serializes all
//! allocations; no additional locking is needed.

use std::collections::{BTreeSet, HashMap};

use bytes::Bytes;
use common::{BytesRange, Record, Storage, StorageRead, WriteOptions};

use crate::error::{Error, Result};
use crate::keys::{ID_OFFSET, Key};
use crate::model::{NamespaceId, TAG_STREAM_PREFIX};

/// In-memory bidirectional view of the persisted name-mapping table.
pub(crate) struct IdRegistry {
    map: HashMap<String, NamespaceId>,
}

impl IdRegistry {
    /// Rebuilds the registry by scanning the mapping table.
    ///
    /// Mapping entries occupy the contiguous low end of the keyspace
    /// (namespace id 1), so the scan starts at the first assignable id and
    /// stops at the first non-mapping key.
    pub(crate) async fn open(storage: &dyn StorageRead) -> Result<Self> {
        let mut map = HashMap::new();
        let start = Key::mapping(ID_OFFSET).encode();
        let mut iter = storage.scan_iter(BytesRange::from_key(start)).await?;
        while let Some(record) = iter.next().await? {
            let key = Key::decode(&record.key)?;
            if !key.is_mapping() {
                break;
            }
            let name = String::from_utf8(record.value.to_vec())
                .map_err(|_| Error::Encoding("mapping entry is not UTF-8".to_string()))?;
            map.insert(name, key.kind);
        }
        Ok(Self { map })
    }

    /// Returns the cached id for `name`, if one has been assigned.
    pub(crate) fn lookup(&self, name: &str) -> Option<NamespaceId> {
        self.map.get(name).copied()
    }

    /// Returns the id for `name`, allocating and persisting a new mapping
    /// entry if the name has not been seen before.
    ///
    /// The entry is written durably before the cache is updated, so a failed
    /// write leaves no partial state behind. Returns the id and whether it
    /// was newly allocated.
    pub(crate) async fn resolve(
        &mut self,
        name: &str,
        storage: &dyn Storage,
        options: WriteOptions,
    ) -> Result<(NamespaceId, bool)> {
        if let Some(id) = self.map.get(name) {
            return Ok((*id, false));
        }

        let id = self.map.len() as NamespaceId + ID_OFFSET;
        let record = Record::new(Key::mapping(id).encode(), Bytes::from(name.to_string()));
        storage.put_with_options(vec![record], options).await?;
        self.map.insert(name.to_string(), id);
        Ok((id, true))
    }

    /// Returns a snapshot of all known real stream names.
    ///
    /// Synthetic tag streams are not stream names and are excluded.
    pub(crate) fn known_names(&self) -> BTreeSet<String> {
        self.map
            .keys()
            .filter(|name| !name.starts_with(TAG_STREAM_PREFIX))
            .cloned()
            .collect()
    }
}
