//! Range-scan replay of event sequences.
//!
//! Replay opens a snapshot of the store and walks one namespace forward in
//! key order, reconstructing the event sequence between two bounds. It is
//! read-only and runs on the caller's task, concurrently with writes and
//! with other replays; it never touches writer state.
//!
//! Deleted events are stored as a tombstone key directly after the event's
//! data key, so the walk keeps one record of lookahead: a data key followed
//! by its own tombstone is consumed silently. A tombstone without a data key
//! can appear in stores written by older versions that removed the data key
//! on deletion; those are skipped as well.

use std::sync::Arc;

use common::{BytesRange, Storage, StorageError, StorageRead};

use crate::codec::EventCodec;
use crate::error::{Error, Result};
use crate::keys::{Key, decode_counter};
use crate::model::{EventRecord, NamespaceId, SequenceNr};

/// Read-side engine reconstructing event sequences from storage snapshots.
#[derive(Clone)]
pub struct ReplayEngine {
    storage: Arc<dyn Storage>,
    codec: Arc<dyn EventCodec>,
}

impl ReplayEngine {
    pub(crate) fn new(storage: Arc<dyn Storage>, codec: Arc<dyn EventCodec>) -> Self {
        Self { storage, codec }
    }

    /// Reads the highest sequence number written in a namespace.
    ///
    /// Returns `0` if the namespace has no counter record.
    pub async fn highest_sequence_nr(&self, namespace_id: NamespaceId) -> Result<SequenceNr> {
        read_counter(self.storage.as_ref(), namespace_id).await
    }

    /// Replays events of a stream namespace in sequence order.
    ///
    /// Yields events with sequence numbers in `[max(from, 1), to]`, skipping
    /// tombstoned entries, up to `max` events. Counter records sit at
    /// sequence 0 and are never touched by the seek.
    pub async fn replay(
        &self,
        namespace_id: NamespaceId,
        from: SequenceNr,
        to: SequenceNr,
        max: u64,
    ) -> Result<Vec<(SequenceNr, EventRecord)>> {
        self.scan_namespace(namespace_id, from, to, max, true).await
    }

    /// Replays a tag namespace in tag-offset order.
    ///
    /// Tag index entries are never individually deleted, so no tombstone
    /// handling applies.
    pub async fn replay_tagged(
        &self,
        namespace_id: NamespaceId,
        from: i64,
        to: i64,
        max: u64,
    ) -> Result<Vec<(i64, EventRecord)>> {
        self.scan_namespace(namespace_id, from, to, max, false)
            .await
    }

    async fn scan_namespace(
        &self,
        namespace_id: NamespaceId,
        from: i64,
        to: i64,
        max: u64,
        check_tombstones: bool,
    ) -> Result<Vec<(i64, EventRecord)>> {
        let mut out = Vec::new();
        if max == 0 || to < 1 {
            return Ok(out);
        }

        tracing::debug!(
            namespace_id,
            from,
            to,
            max,
            "replaying namespace from snapshot"
        );

        let snapshot = self.storage.snapshot().await.map_err(replay_error)?;
        let start = Key::event(namespace_id, from.max(1)).encode();
        let mut iter = snapshot
            .scan_iter(BytesRange::from_key(start))
            .await
            .map_err(replay_error)?;

        // One record of lookahead so a data key can see its own tombstone.
        let mut pending: Option<common::Record> = None;

        while (out.len() as u64) < max {
            let record = match pending.take() {
                Some(record) => record,
                None => match iter.next().await.map_err(replay_error)? {
                    Some(record) => record,
                    None => break,
                },
            };

            let key = Key::decode(&record.key)?;
            if key.namespace_id != namespace_id || key.sequence_nr > to {
                break;
            }
            if key.is_tombstone() {
                // Stray tombstone from an older store format; the data key
                // it marked is already gone.
                continue;
            }

            let mut deleted = false;
            if check_tombstones {
                if let Some(next) = iter.next().await.map_err(replay_error)? {
                    let next_key = Key::decode(&next.key)?;
                    if next_key.namespace_id == key.namespace_id
                        && next_key.sequence_nr == key.sequence_nr
                        && next_key.is_tombstone()
                    {
                        deleted = true;
                    } else {
                        pending = Some(next);
                    }
                }
            }
            if deleted {
                continue;
            }

            let event = self.codec.decode(&record.value)?;
            out.push((key.sequence_nr, event));
        }

        Ok(out)
    }
}

fn replay_error(err: StorageError) -> Error {
    Error::Replay(err.to_string())
}

/// Reads a namespace's counter, returning `0` when absent.
pub(crate) async fn read_counter(
    storage: &dyn StorageRead,
    namespace_id: NamespaceId,
) -> Result<SequenceNr> {
    let record = storage.get(Key::counter(namespace_id).encode()).await?;
    match record {
        Some(record) => decode_counter(&record.value),
        None => Ok(0),
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use common::Record;
    use common::storage::in_memory::InMemoryStorage;

    use crate::codec::BinaryEventCodec;
    use crate::keys::encode_counter;

    use super::*;

    const NID: NamespaceId = 10;

    fn engine(storage: Arc<InMemoryStorage>) -> ReplayEngine {
        ReplayEngine::new(storage, Arc::new(BinaryEventCodec))
    }

    async fn write_event(storage: &InMemoryStorage, nid: NamespaceId, seq: i64, payload: &str) {
        let record = EventRecord {
            stream_name: "stream".to_string(),
            sequence_nr: seq,
            writer: String::new(),
            payload: Bytes::from(payload.to_string()),
        };
        let value = BinaryEventCodec.encode(&record).unwrap();
        storage
            .put(vec![
                Record::new(Key::counter(nid).encode(), encode_counter(seq)),
                Record::new(Key::event(nid, seq).encode(), value),
            ])
            .await
            .unwrap();
    }

    async fn write_tombstone(storage: &InMemoryStorage, nid: NamespaceId, seq: i64) {
        storage
            .put(vec![Record::new(
                Key::tombstone(nid, seq).encode(),
                Bytes::new(),
            )])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn should_replay_events_in_sequence_order() {
        // given
        let storage = Arc::new(InMemoryStorage::new());
        for seq in 1..=3 {
            write_event(&storage, NID, seq, &format!("event-{}", seq)).await;
        }

        // when
        let events = engine(storage).replay(NID, 1, i64::MAX, u64::MAX).await.unwrap();

        // then
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].0, 1);
        assert_eq!(events[1].0, 2);
        assert_eq!(events[2].0, 3);
        assert_eq!(events[0].1.payload, Bytes::from("event-1"));
    }

    #[tokio::test]
    async fn should_respect_bounds() {
        // given
        let storage = Arc::new(InMemoryStorage::new());
        for seq in 1..=5 {
            write_event(&storage, NID, seq, "e").await;
        }

        // when
        let events = engine(storage).replay(NID, 2, 4, u64::MAX).await.unwrap();

        // then
        let seqs: Vec<i64> = events.iter().map(|(seq, _)| *seq).collect();
        assert_eq!(seqs, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn should_stop_after_max_events() {
        // given
        let storage = Arc::new(InMemoryStorage::new());
        for seq in 1..=5 {
            write_event(&storage, NID, seq, "e").await;
        }

        // when
        let events = engine(storage).replay(NID, 1, i64::MAX, 2).await.unwrap();

        // then
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].0, 2);
    }

    #[tokio::test]
    async fn should_skip_tombstoned_events() {
        // given
        let storage = Arc::new(InMemoryStorage::new());
        for seq in 1..=4 {
            write_event(&storage, NID, seq, "e").await;
        }
        write_tombstone(&storage, NID, 1).await;
        write_tombstone(&storage, NID, 2).await;

        // when
        let events = engine(storage).replay(NID, 1, i64::MAX, u64::MAX).await.unwrap();

        // then
        let seqs: Vec<i64> = events.iter().map(|(seq, _)| *seq).collect();
        assert_eq!(seqs, vec![3, 4]);
    }

    #[tokio::test]
    async fn should_not_count_tombstoned_events_against_max() {
        // given
        let storage = Arc::new(InMemoryStorage::new());
        for seq in 1..=4 {
            write_event(&storage, NID, seq, "e").await;
        }
        write_tombstone(&storage, NID, 1).await;

        // when
        let events = engine(storage).replay(NID, 1, i64::MAX, 3).await.unwrap();

        // then - three live events delivered despite the leading tombstone
        let seqs: Vec<i64> = events.iter().map(|(seq, _)| *seq).collect();
        assert_eq!(seqs, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn should_skip_stray_tombstone_without_data_key() {
        // given - old-format deletion: data key removed, tombstone left
        let storage = Arc::new(InMemoryStorage::new());
        write_tombstone(&storage, NID, 1).await;
        write_event(&storage, NID, 2, "kept").await;

        // when
        let events = engine(storage).replay(NID, 1, i64::MAX, u64::MAX).await.unwrap();

        // then
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, 2);
    }

    #[tokio::test]
    async fn should_not_cross_namespace_boundary() {
        // given
        let storage = Arc::new(InMemoryStorage::new());
        write_event(&storage, NID, 1, "mine").await;
        write_event(&storage, NID + 1, 1, "other").await;

        // when
        let events = engine(storage).replay(NID, 1, i64::MAX, u64::MAX).await.unwrap();

        // then
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].1.payload, Bytes::from("mine"));
    }

    #[tokio::test]
    async fn should_return_zero_highest_for_unknown_namespace() {
        // given
        let storage = Arc::new(InMemoryStorage::new());

        // when
        let highest = engine(storage).highest_sequence_nr(NID).await.unwrap();

        // then
        assert_eq!(highest, 0);
    }

    #[tokio::test]
    async fn should_read_highest_from_counter() {
        // given
        let storage = Arc::new(InMemoryStorage::new());
        write_event(&storage, NID, 7, "e").await;

        // when
        let highest = engine(storage).highest_sequence_nr(NID).await.unwrap();

        // then
        assert_eq!(highest, 7);
    }

    #[tokio::test]
    async fn should_replay_tagged_without_tombstone_lookahead() {
        // given
        let storage = Arc::new(InMemoryStorage::new());
        for offset in 1..=3 {
            write_event(&storage, NID, offset, &format!("tagged-{}", offset)).await;
        }

        // when
        let events = engine(storage)
            .replay_tagged(NID, 0, i64::MAX, u64::MAX)
            .await
            .unwrap();

        // then
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].0, 1);
        assert_eq!(events[2].0, 3);
    }
}
