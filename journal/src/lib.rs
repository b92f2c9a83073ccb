//! An embedded event-log storage engine built on an ordered key-value store.
//!
//! The journal stores durable, append-only per-stream event sequences, keeps
//! a secondary index grouping events by tag, and serves both one-shot
//! snapshots and continuously tailing subscriptions over them with explicit
//! consumer-driven flow control.
//!
//! # Architecture
//!
//! Stream and tag names are mapped to compact numeric namespace ids, and
//! every record lives under a fixed-width binary key whose byte order equals
//! `(namespace, sequence, kind)` order, so one forward range scan replays
//! one stream. A single writer task owns all mutation: it resolves ids,
//! allocates tag offsets, applies each write as one atomic storage batch,
//! and wakes subscribed queries. Reads run against storage snapshots,
//! concurrent with writes.
//!
//! # Key Concepts
//!
//! - **Journal / JournalHandle**: the engine and its cloneable write handle.
//! - **ReadJournal**: constructs *current* (bounded, terminating) and *live*
//!   (tailing) query streams by stream name or by tag.
//! - **QueryStream**: the consumer side of a query; items are only emitted
//!   against demand the consumer has granted.
//!
//! # Example
//!
//! ```ignore
//! use bytes::Bytes;
//! use journal::{Config, EventWrite, Journal, Offset};
//!
//! let journal = Journal::open(Config::default()).await?;
//! let handle = journal.handle();
//!
//! handle
//!     .append(vec![
//!         EventWrite::new("account-1", 1, Bytes::from("opened")),
//!         EventWrite::new("account-1", 2, Bytes::from("credited")).with_tag("audit"),
//!     ])
//!     .await?;
//!
//! let reader = journal.reader();
//! let mut events = reader.current_events_by_stream("account-1", 0, i64::MAX);
//! while let Some(envelope) = events.next().await? {
//!     println!("seq={}: {:?}", envelope.sequence_nr, envelope.payload);
//! }
//! ```

mod codec;
mod config;
mod error;
mod ids;
mod journal;
mod keys;
mod model;
mod query;
mod replay;
mod subscriptions;

pub use codec::{BinaryEventCodec, EventCodec};
pub use config::Config;
pub use error::{Error, Result};
pub use journal::{Journal, JournalHandle};
pub use keys::{ID_OFFSET, Key, MAPPING_NAMESPACE_ID};
pub use model::{
    EventEnvelope, EventRecord, EventWrite, NamespaceId, Offset, SequenceNr, TAG_STREAM_PREFIX,
};
pub use query::{QueryStream, ReadJournal};
pub use replay::ReplayEngine;
pub use subscriptions::Notification;
