//! Core data types for the journal.

use std::collections::BTreeSet;

use bytes::Bytes;

/// Compact integer substitute for a stream or tag name inside binary keys.
///
/// Assigned permanently on first use and never reassigned. Ids below
/// [`ID_OFFSET`](crate::keys::ID_OFFSET) are reserved.
pub type NamespaceId = i32;

/// Position of an event within its stream.
///
/// Sequence numbers are assigned by the writing layer and are strictly
/// increasing per stream, starting at 1.
pub type SequenceNr = i64;

/// Reserved prefix marking the synthetic stream that backs a tag's index.
///
/// Real stream names must never begin with this prefix; writes that do are
/// rejected before any mutation is applied.
pub const TAG_STREAM_PREFIX: &str = "$$$";

/// Returns the synthetic stream name backing the given tag's index.
pub fn tag_stream_name(tag: &str) -> String {
    format!("{}{}", TAG_STREAM_PREFIX, tag)
}

/// The durable unit stored in the journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    /// The stream this event belongs to.
    pub stream_name: String,
    /// Position of the event within its stream.
    pub sequence_nr: SequenceNr,
    /// Identifier of the writer that produced the event.
    pub writer: String,
    /// Opaque event payload.
    pub payload: Bytes,
}

/// A single write request entry.
///
/// Sequence numbers are assigned by the external write-ahead layer that owns
/// per-stream ordering; the journal never invents them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventWrite {
    /// Target stream.
    pub stream_name: String,
    /// Sequence number assigned by the caller; strictly increasing per stream.
    pub sequence_nr: SequenceNr,
    /// Identifier of the writer producing the event.
    pub writer: String,
    /// Opaque event payload.
    pub payload: Bytes,
    /// Tags to index this event under.
    pub tags: BTreeSet<String>,
}

impl EventWrite {
    /// Creates an untagged write entry.
    pub fn new(stream_name: impl Into<String>, sequence_nr: SequenceNr, payload: Bytes) -> Self {
        Self {
            stream_name: stream_name.into(),
            sequence_nr,
            writer: String::new(),
            payload,
            tags: BTreeSet::new(),
        }
    }

    /// Adds a tag to the write entry.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Sets the writer identifier.
    pub fn with_writer(mut self, writer: impl Into<String>) -> Self {
        self.writer = writer.into();
        self
    }
}

/// A query result item.
///
/// `offset` is the sequence number for by-stream queries and the tag offset
/// for by-tag queries; in both cases it is the position to resume from
/// (exclusive) when re-issuing the query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventEnvelope {
    /// Resume position of this item within the queried sequence.
    pub offset: i64,
    /// The stream the event was originally written to.
    pub stream_name: String,
    /// Position of the event within its origin stream.
    pub sequence_nr: SequenceNr,
    /// Opaque event payload.
    pub payload: Bytes,
}

/// Starting position for a by-tag query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offset {
    /// Start from the beginning of the tag's sequence.
    NoOffset,
    /// Start from the given tag offset (inclusive).
    Sequence(i64),
    /// Wall-clock based offsets used by some journals. Not supported here;
    /// rejected at query construction.
    TimeBased(u64),
}
