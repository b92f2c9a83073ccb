//! The journal write path.
//!
//! All mutation of the store goes through a single writer task that owns the
//! id registry, the per-tag offset high-water-marks, and the subscription
//! registry. Serializing these behind one task guarantees at-most-one id per
//! name and strictly increasing tag offsets without any shared locks. The
//! task is fed through a command channel; [`JournalHandle`] is the cloneable
//! front end.
//!
//! Reads never pass through the writer: replay runs against storage
//! snapshots on the caller's task (see [`crate::replay`]). The writer only
//! answers the cheap lookups that need its in-memory state.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use common::storage::factory::create_storage;
use common::{Record, Storage, WriteOptions};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::codec::{BinaryEventCodec, EventCodec};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::ids::IdRegistry;
use crate::keys::{Key, encode_counter};
use crate::model::{EventRecord, EventWrite, NamespaceId, SequenceNr, TAG_STREAM_PREFIX,
    tag_stream_name};
use crate::query::ReadJournal;
use crate::replay::{ReplayEngine, read_counter};
use crate::subscriptions::{Notification, SubscriptionRegistry};

const COMMAND_QUEUE_CAPACITY: usize = 1024;

/// An embedded event-log store.
///
/// `Journal` owns the writer task. Use [`handle`](Journal::handle) for write
/// access and [`reader`](Journal::reader) for queries; both can be cloned
/// and shared freely. The writer task runs until [`close`](Journal::close)
/// is called or every handle (including the `Journal` itself) is dropped.
pub struct Journal {
    handle: JournalHandle,
    storage: Arc<dyn Storage>,
    codec: Arc<dyn EventCodec>,
    config: Config,
    stop: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl Journal {
    /// Opens or creates a journal with the given configuration.
    pub async fn open(config: Config) -> Result<Self> {
        let storage = create_storage(&config.storage).await?;
        Self::with_storage(config, storage, Arc::new(BinaryEventCodec)).await
    }

    /// Opens a journal over an existing storage backend and codec.
    pub async fn with_storage(
        config: Config,
        storage: Arc<dyn Storage>,
        codec: Arc<dyn EventCodec>,
    ) -> Result<Self> {
        let ids = IdRegistry::open(storage.as_ref()).await?;

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let stop = CancellationToken::new();

        let task = WriterTask {
            storage: Arc::clone(&storage),
            codec: Arc::clone(&codec),
            write_options: WriteOptions {
                await_durable: config.sync_on_write,
            },
            ids,
            tag_offsets: HashMap::new(),
            subscriptions: SubscriptionRegistry::new(),
            cmd_rx,
            stop: stop.clone(),
        };
        let task = tokio::spawn(task.run());

        Ok(Self {
            handle: JournalHandle { cmd_tx },
            storage,
            codec,
            config,
            stop,
            task,
        })
    }

    /// Returns a cloneable handle to the write path.
    pub fn handle(&self) -> JournalHandle {
        self.handle.clone()
    }

    /// Returns the query interface over this journal.
    pub fn reader(&self) -> ReadJournal {
        ReadJournal::new(
            self.handle.clone(),
            ReplayEngine::new(Arc::clone(&self.storage), Arc::clone(&self.codec)),
            self.config.refresh_interval,
            self.config.max_buffer_size,
        )
    }

    /// Stops the writer task and waits for it to finish.
    pub async fn close(self) -> Result<()> {
        self.stop.cancel();
        self.task.await.map_err(|e| Error::Storage(e.to_string()))
    }
}

/// Commands processed by the writer task.
enum Command {
    Append {
        writes: Vec<EventWrite>,
        reply: oneshot::Sender<Vec<Result<()>>>,
    },
    DeleteTo {
        stream_name: String,
        to_sequence_nr: SequenceNr,
        reply: oneshot::Sender<Result<()>>,
    },
    HighestSequenceNr {
        stream_name: String,
        reply: oneshot::Sender<Result<SequenceNr>>,
    },
    LookupId {
        name: String,
        reply: oneshot::Sender<Option<NamespaceId>>,
    },
    SubscribeStream {
        name: String,
        reply: oneshot::Sender<mpsc::UnboundedReceiver<Notification>>,
    },
    SubscribeTag {
        tag: String,
        reply: oneshot::Sender<mpsc::UnboundedReceiver<Notification>>,
    },
    SubscribeNames {
        reply: oneshot::Sender<(BTreeSet<String>, mpsc::UnboundedReceiver<Notification>)>,
    },
    CurrentNames {
        reply: oneshot::Sender<BTreeSet<String>>,
    },
}

/// Cloneable front end to the journal's writer task.
#[derive(Clone)]
pub struct JournalHandle {
    cmd_tx: mpsc::Sender<Command>,
}

impl JournalHandle {
    /// Appends a batch of writes.
    ///
    /// Each entry is applied atomically on its own: the event record, the
    /// stream counter, and any tag index entries for it become visible
    /// together or not at all. Entries are independent of each other — one
    /// entry failing validation or storage does not abort its siblings,
    /// which is why the result carries one `Result` per entry.
    pub async fn append(&self, writes: Vec<EventWrite>) -> Result<Vec<Result<()>>> {
        self.send(|reply| Command::Append { writes, reply }).await
    }

    /// Marks all events of a stream up to `to_sequence_nr` (inclusive) as
    /// deleted.
    ///
    /// Deletion writes tombstones; event data is never physically removed
    /// and the stream's highest sequence number is unaffected. Idempotent.
    pub async fn delete_to(&self, stream_name: &str, to_sequence_nr: SequenceNr) -> Result<()> {
        self.send(|reply| Command::DeleteTo {
            stream_name: stream_name.to_string(),
            to_sequence_nr,
            reply,
        })
        .await?
    }

    /// Returns the highest sequence number written to a stream, or `0` if
    /// the stream is unknown.
    pub async fn highest_sequence_nr(&self, stream_name: &str) -> Result<SequenceNr> {
        self.send(|reply| Command::HighestSequenceNr {
            stream_name: stream_name.to_string(),
            reply,
        })
        .await?
    }

    /// Returns a snapshot of all stream names the journal has ever seen.
    pub async fn current_stream_names(&self) -> Result<BTreeSet<String>> {
        self.send(|reply| Command::CurrentNames { reply }).await
    }

    pub(crate) async fn lookup_id(&self, name: &str) -> Result<Option<NamespaceId>> {
        self.send(|reply| Command::LookupId {
            name: name.to_string(),
            reply,
        })
        .await
    }

    pub(crate) async fn subscribe_stream(
        &self,
        name: &str,
    ) -> Result<mpsc::UnboundedReceiver<Notification>> {
        self.send(|reply| Command::SubscribeStream {
            name: name.to_string(),
            reply,
        })
        .await
    }

    pub(crate) async fn subscribe_tag(
        &self,
        tag: &str,
    ) -> Result<mpsc::UnboundedReceiver<Notification>> {
        self.send(|reply| Command::SubscribeTag {
            tag: tag.to_string(),
            reply,
        })
        .await
    }

    pub(crate) async fn subscribe_names(
        &self,
    ) -> Result<(BTreeSet<String>, mpsc::UnboundedReceiver<Notification>)> {
        self.send(|reply| Command::SubscribeNames { reply }).await
    }

    async fn send<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(command(reply_tx))
            .await
            .map_err(|_| Error::Shutdown)?;
        reply_rx.await.map_err(|_| Error::Shutdown)
    }
}

/// The single-writer event loop.
struct WriterTask {
    storage: Arc<dyn Storage>,
    codec: Arc<dyn EventCodec>,
    write_options: WriteOptions,
    ids: IdRegistry,
    tag_offsets: HashMap<String, SequenceNr>,
    subscriptions: SubscriptionRegistry,
    cmd_rx: mpsc::Receiver<Command>,
    stop: CancellationToken,
}

impl WriterTask {
    async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd).await,
                        None => break,
                    }
                }
                _ = self.stop.cancelled() => break,
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Append { writes, reply } => {
                let results = self.handle_append(writes).await;
                let _ = reply.send(results);
            }
            Command::DeleteTo {
                stream_name,
                to_sequence_nr,
                reply,
            } => {
                let _ = reply.send(self.handle_delete_to(&stream_name, to_sequence_nr).await);
            }
            Command::HighestSequenceNr { stream_name, reply } => {
                let result = match self.ids.lookup(&stream_name) {
                    Some(nid) => read_counter(self.storage.as_ref(), nid).await,
                    None => Ok(0),
                };
                let _ = reply.send(result);
            }
            Command::LookupId { name, reply } => {
                let _ = reply.send(self.ids.lookup(&name));
            }
            Command::SubscribeStream { name, reply } => {
                let _ = reply.send(self.subscriptions.subscribe_stream(&name));
            }
            Command::SubscribeTag { tag, reply } => {
                let _ = reply.send(self.subscriptions.subscribe_tag(&tag));
            }
            Command::SubscribeNames { reply } => {
                let names = self.ids.known_names();
                let rx = self.subscriptions.subscribe_names();
                let _ = reply.send((names, rx));
            }
            Command::CurrentNames { reply } => {
                let _ = reply.send(self.ids.known_names());
            }
        }
    }

    async fn handle_append(&mut self, writes: Vec<EventWrite>) -> Vec<Result<()>> {
        let mut appended_streams = BTreeSet::new();
        let mut appended_tags = BTreeSet::new();

        let mut results = Vec::with_capacity(writes.len());
        for write in writes {
            let stream_name = write.stream_name.clone();
            let tags = write.tags.clone();
            match self.append_one(write).await {
                Ok(()) => {
                    appended_streams.insert(stream_name);
                    appended_tags.extend(tags);
                    results.push(Ok(()));
                }
                Err(err) => results.push(Err(err)),
            }
        }

        // Notification fan-out is a post-commit side effect: once per
        // distinct stream and tag, after every entry has been decided.
        for name in appended_streams {
            self.subscriptions.notify_stream_appended(&name);
        }
        for tag in appended_tags {
            self.subscriptions.notify_tag_appended(&tag);
        }

        results
    }

    async fn append_one(&mut self, write: EventWrite) -> Result<()> {
        if write.stream_name.starts_with(TAG_STREAM_PREFIX) {
            return Err(Error::Validation(format!(
                "stream name {} must not start with {}",
                write.stream_name, TAG_STREAM_PREFIX
            )));
        }

        let nid = self.resolve_id(&write.stream_name).await?;

        let record = EventRecord {
            stream_name: write.stream_name,
            sequence_nr: write.sequence_nr,
            writer: write.writer,
            payload: write.payload,
        };
        let value = self.codec.encode(&record)?;

        let mut batch = vec![
            Record::new(
                Key::counter(nid).encode(),
                encode_counter(record.sequence_nr),
            ),
            Record::new(Key::event(nid, record.sequence_nr).encode(), value.clone()),
        ];

        for tag in &write.tags {
            let tag_nid = self.resolve_id(&tag_stream_name(tag)).await?;
            let offset = self.next_tag_offset(tag, tag_nid).await?;
            batch.push(Record::new(
                Key::counter(tag_nid).encode(),
                encode_counter(offset),
            ));
            batch.push(Record::new(
                Key::event(tag_nid, offset).encode(),
                value.clone(),
            ));
        }

        self.storage
            .put_with_options(batch, self.write_options.clone())
            .await?;
        Ok(())
    }

    /// Resolves a name to its namespace id, allocating on first use and
    /// announcing newly discovered stream names.
    async fn resolve_id(&mut self, name: &str) -> Result<NamespaceId> {
        let (nid, added) = self
            .ids
            .resolve(name, self.storage.as_ref(), self.write_options.clone())
            .await?;
        if added && !name.starts_with(TAG_STREAM_PREFIX) {
            self.subscriptions.notify_name_added(name);
        }
        Ok(nid)
    }

    /// Allocates the next offset for a tag.
    ///
    /// The high-water-mark is seeded from the tag's counter on first use
    /// since startup; afterwards it advances purely in memory and is
    /// persisted through the event batch, avoiding a storage round trip per
    /// tagged event.
    async fn next_tag_offset(&mut self, tag: &str, tag_nid: NamespaceId) -> Result<SequenceNr> {
        if !self.tag_offsets.contains_key(tag) {
            let persisted = read_counter(self.storage.as_ref(), tag_nid).await?;
            self.tag_offsets.insert(tag.to_string(), persisted);
        }
        let offset = self
            .tag_offsets
            .entry(tag.to_string())
            .and_modify(|n| *n += 1)
            .or_insert(1);
        Ok(*offset)
    }

    async fn handle_delete_to(
        &mut self,
        stream_name: &str,
        to_sequence_nr: SequenceNr,
    ) -> Result<()> {
        let Some(nid) = self.ids.lookup(stream_name) else {
            return Ok(());
        };

        // Seek to the first event still present in the namespace.
        let start = Key::event(nid, 1).encode();
        let mut iter = self
            .storage
            .scan_iter(common::BytesRange::from_key(start))
            .await?;
        let first = match iter.next().await? {
            Some(record) => {
                let key = Key::decode(&record.key)?;
                if key.namespace_id != nid {
                    return Ok(());
                }
                key.sequence_nr
            }
            None => return Ok(()),
        };
        drop(iter);

        let to = to_sequence_nr.min(read_counter(self.storage.as_ref(), nid).await?);
        if first > to {
            return Ok(());
        }

        let batch: Vec<Record> = (first..=to)
            .map(|seq| Record::new(Key::tombstone(nid, seq).encode(), Bytes::new()))
            .collect();
        self.storage
            .put_with_options(batch, self.write_options.clone())
            .await?;
        Ok(())
    }
}
