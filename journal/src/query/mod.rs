//! Query interface over the journal.
//!
//! [`ReadJournal`] constructs demand-driven query streams in four shapes:
//! stream names, events by stream, events by tag, each in a *current*
//! (bounded, terminating) and a *live* (unbounded, tailing) variant. See
//! [`publisher`] for the shared state machine and flow-control rules.

mod names;
mod publisher;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::journal::JournalHandle;
use crate::model::{EventEnvelope, NamespaceId, Offset, SequenceNr, tag_stream_name};
use crate::replay::ReplayEngine;
use crate::subscriptions::Notification;

pub use publisher::QueryStream;

use publisher::{Mode, ReplaySource, spawn_events};

/// Read-side entry point, obtained from
/// [`Journal::reader`](crate::Journal::reader).
///
/// Cheap to clone; every query method spawns an independent publisher task
/// whose lifetime is tied to the returned [`QueryStream`].
#[derive(Clone)]
pub struct ReadJournal {
    handle: JournalHandle,
    replay: ReplayEngine,
    refresh_interval: Duration,
    max_buffer_size: usize,
}

impl ReadJournal {
    pub(crate) fn new(
        handle: JournalHandle,
        replay: ReplayEngine,
        refresh_interval: Duration,
        max_buffer_size: usize,
    ) -> Self {
        Self {
            handle,
            replay,
            refresh_interval,
            max_buffer_size,
        }
    }

    #[cfg(test)]
    pub(crate) fn replay_engine(&self) -> &ReplayEngine {
        &self.replay
    }

    /// All stream names the journal has ever seen, then completion.
    pub fn current_stream_names(&self) -> QueryStream<String> {
        names::spawn_names(self.handle.clone(), false)
    }

    /// All known stream names, then every newly discovered name as it
    /// appears. Never completes on its own.
    pub fn stream_names(&self) -> QueryStream<String> {
        names::spawn_names(self.handle.clone(), true)
    }

    /// Events of one stream with sequence numbers in `[from, to]`, bounded
    /// by the stream's highest sequence number at query start; completes
    /// when that bound is reached.
    pub fn current_events_by_stream(
        &self,
        stream_name: &str,
        from: SequenceNr,
        to: SequenceNr,
    ) -> QueryStream<EventEnvelope> {
        spawn_events(
            self.stream_source(stream_name),
            from,
            to,
            Mode::Current,
            self.max_buffer_size,
        )
    }

    /// Events of one stream from `from` onwards, tailing new appends as
    /// they happen. Completes only if `to` is finite and reached.
    pub fn events_by_stream(
        &self,
        stream_name: &str,
        from: SequenceNr,
        to: SequenceNr,
    ) -> QueryStream<EventEnvelope> {
        spawn_events(
            self.stream_source(stream_name),
            from,
            to,
            Mode::Live {
                refresh_interval: self.refresh_interval,
            },
            self.max_buffer_size,
        )
    }

    /// Events carrying a tag, in tag-offset order, bounded by the tag's
    /// highest offset at query start.
    pub fn current_events_by_tag(
        &self,
        tag: &str,
        offset: Offset,
    ) -> Result<QueryStream<EventEnvelope>> {
        let from = offset_position(offset)?;
        Ok(spawn_events(
            self.tag_source(tag),
            from,
            i64::MAX,
            Mode::Current,
            self.max_buffer_size,
        ))
    }

    /// Events carrying a tag, in tag-offset order, tailing new appends as
    /// they happen. Never completes on its own.
    pub fn events_by_tag(&self, tag: &str, offset: Offset) -> Result<QueryStream<EventEnvelope>> {
        let from = offset_position(offset)?;
        Ok(spawn_events(
            self.tag_source(tag),
            from,
            i64::MAX,
            Mode::Live {
                refresh_interval: self.refresh_interval,
            },
            self.max_buffer_size,
        ))
    }

    fn stream_source(&self, stream_name: &str) -> ByStreamSource {
        ByStreamSource {
            handle: self.handle.clone(),
            replay: self.replay.clone(),
            stream_name: stream_name.to_string(),
            namespace_id: None,
        }
    }

    fn tag_source(&self, tag: &str) -> ByTagSource {
        ByTagSource {
            handle: self.handle.clone(),
            replay: self.replay.clone(),
            tag: tag.to_string(),
            namespace_id: None,
        }
    }
}

fn offset_position(offset: Offset) -> Result<i64> {
    match offset {
        Offset::NoOffset => Ok(0),
        Offset::Sequence(n) => Ok(n),
        Offset::TimeBased(_) => Err(Error::UnsupportedOffset(
            "time-based offsets are not supported by this journal".to_string(),
        )),
    }
}

/// Replay strategy for by-stream queries: positions are the stream's own
/// sequence numbers.
struct ByStreamSource {
    handle: JournalHandle,
    replay: ReplayEngine,
    stream_name: String,
    namespace_id: Option<NamespaceId>,
}

impl ByStreamSource {
    /// The stream may not exist yet when a live query starts; keep looking
    /// it up until it does.
    async fn resolve(&mut self) -> Result<Option<NamespaceId>> {
        if self.namespace_id.is_none() {
            self.namespace_id = self.handle.lookup_id(&self.stream_name).await?;
        }
        Ok(self.namespace_id)
    }
}

#[async_trait]
impl ReplaySource for ByStreamSource {
    async fn subscribe(&mut self) -> Result<mpsc::UnboundedReceiver<Notification>> {
        self.handle.subscribe_stream(&self.stream_name).await
    }

    async fn highest(&mut self) -> Result<i64> {
        match self.resolve().await? {
            Some(nid) => self.replay.highest_sequence_nr(nid).await,
            None => Ok(0),
        }
    }

    async fn replay(&mut self, from: i64, to: i64, max: u64) -> Result<Vec<EventEnvelope>> {
        let Some(nid) = self.resolve().await? else {
            return Ok(Vec::new());
        };
        let events = self.replay.replay(nid, from, to, max).await?;
        Ok(events
            .into_iter()
            .map(|(sequence_nr, record)| EventEnvelope {
                offset: sequence_nr,
                stream_name: record.stream_name,
                sequence_nr: record.sequence_nr,
                payload: record.payload,
            })
            .collect())
    }
}

/// Replay strategy for by-tag queries: positions are tag-local offsets,
/// unrelated to the origin streams' sequence numbers.
struct ByTagSource {
    handle: JournalHandle,
    replay: ReplayEngine,
    tag: String,
    namespace_id: Option<NamespaceId>,
}

impl ByTagSource {
    async fn resolve(&mut self) -> Result<Option<NamespaceId>> {
        if self.namespace_id.is_none() {
            self.namespace_id = self.handle.lookup_id(&tag_stream_name(&self.tag)).await?;
        }
        Ok(self.namespace_id)
    }
}

#[async_trait]
impl ReplaySource for ByTagSource {
    async fn subscribe(&mut self) -> Result<mpsc::UnboundedReceiver<Notification>> {
        self.handle.subscribe_tag(&self.tag).await
    }

    async fn highest(&mut self) -> Result<i64> {
        match self.resolve().await? {
            Some(nid) => self.replay.highest_sequence_nr(nid).await,
            None => Ok(0),
        }
    }

    async fn replay(&mut self, from: i64, to: i64, max: u64) -> Result<Vec<EventEnvelope>> {
        let Some(nid) = self.resolve().await? else {
            return Ok(Vec::new());
        };
        let entries = self.replay.replay_tagged(nid, from, to, max).await?;
        Ok(entries
            .into_iter()
            .map(|(offset, record)| EventEnvelope {
                offset,
                stream_name: record.stream_name,
                sequence_nr: record.sequence_nr,
                payload: record.payload,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_translate_offsets_to_positions() {
        // given/when/then
        assert_eq!(offset_position(Offset::NoOffset).unwrap(), 0);
        assert_eq!(offset_position(Offset::Sequence(42)).unwrap(), 42);
    }

    #[test]
    fn should_reject_time_based_offsets() {
        // given/when
        let result = offset_position(Offset::TimeBased(123));

        // then
        assert!(matches!(result, Err(Error::UnsupportedOffset(_))));
    }
}
