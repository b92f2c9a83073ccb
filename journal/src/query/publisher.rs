//! Demand-driven query publishers.
//!
//! Every active query is an independent publisher task running a small state
//! machine: `Init -> {Replaying <-> Idle} -> Completed | Failed`. The
//! consumer side is a [`QueryStream`], which feeds demand to the publisher;
//! the publisher never sends more items than the consumer has asked for, and
//! always drains its buffer before fetching more once demand allows.
//!
//! The four concrete query shapes (current/live crossed with by-stream and
//! by-tag) share one publisher; a [`ReplaySource`] strategy supplies the
//! bounds and the scan, and the mode decides what resumes a drained scan:
//! current queries re-drive themselves until the captured bound is reached,
//! live queries wait for an append notification or a periodic refresh tick.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, interval_at};

use crate::error::{Error, Result};
use crate::model::EventEnvelope;
use crate::subscriptions::Notification;

/// Consumer-to-publisher flow control messages.
pub(crate) enum Demand {
    /// The consumer is ready to receive `n` more items.
    Request(u64),
    /// The consumer is gone; stop and release everything.
    Cancel,
}

/// Publisher-to-consumer delivery messages.
pub(crate) enum StreamSignal<T> {
    Item(T),
    Complete,
    Failed(Error),
}

/// Creates the channel pair linking a publisher task to its consumer handle.
pub(crate) fn stream_channel<T>() -> (
    QueryStream<T>,
    mpsc::UnboundedReceiver<Demand>,
    mpsc::UnboundedSender<StreamSignal<T>>,
) {
    let (demand_tx, demand_rx) = mpsc::unbounded_channel();
    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    (
        QueryStream::from_parts(demand_tx, signal_rx),
        demand_rx,
        signal_tx,
    )
}

/// Consumer handle of a running query.
///
/// Items are only delivered against outstanding demand. [`next`] requests
/// one item at a time; call [`request`] first to let the publisher run
/// ahead and prefetch. Dropping the handle cancels the query.
///
/// [`next`]: QueryStream::next
/// [`request`]: QueryStream::request
pub struct QueryStream<T> {
    demand_tx: mpsc::UnboundedSender<Demand>,
    signal_rx: mpsc::UnboundedReceiver<StreamSignal<T>>,
    requested: u64,
    terminated: bool,
}

impl<T> QueryStream<T> {
    fn from_parts(
        demand_tx: mpsc::UnboundedSender<Demand>,
        signal_rx: mpsc::UnboundedReceiver<StreamSignal<T>>,
    ) -> Self {
        Self {
            demand_tx,
            signal_rx,
            requested: 0,
            terminated: false,
        }
    }

    /// Grants the publisher demand for `n` additional items.
    pub fn request(&mut self, n: u64) {
        if n > 0 && self.demand_tx.send(Demand::Request(n)).is_ok() {
            self.requested += n;
        }
    }

    /// Returns the next item, `Ok(None)` when the query has completed, or
    /// the error that terminated it.
    ///
    /// If no demand is outstanding, one item's worth is requested on the
    /// caller's behalf.
    pub async fn next(&mut self) -> Result<Option<T>> {
        if self.terminated {
            return Ok(None);
        }
        if self.requested == 0 {
            self.request(1);
        }
        match self.signal_rx.recv().await {
            Some(StreamSignal::Item(item)) => {
                self.requested = self.requested.saturating_sub(1);
                Ok(Some(item))
            }
            Some(StreamSignal::Complete) | None => {
                self.terminated = true;
                Ok(None)
            }
            Some(StreamSignal::Failed(err)) => {
                self.terminated = true;
                Err(err)
            }
        }
    }

    /// Cancels the query. No further items are observed after this returns.
    pub fn cancel(&mut self) {
        let _ = self.demand_tx.send(Demand::Cancel);
        self.terminated = true;
    }

    /// Adapts the handle into a [`futures::Stream`], requesting one item at
    /// a time. The error that terminated a failed query is yielded as the
    /// final element.
    pub fn into_stream(self) -> impl futures::Stream<Item = Result<T>>
    where
        T: Send + 'static,
    {
        futures::stream::unfold(self, |mut stream| async move {
            match stream.next().await {
                Ok(Some(item)) => Some((Ok(item), stream)),
                Ok(None) => None,
                Err(err) => Some((Err(err), stream)),
            }
        })
    }
}

impl<T> Drop for QueryStream<T> {
    fn drop(&mut self) {
        let _ = self.demand_tx.send(Demand::Cancel);
    }
}

/// Buffered items awaiting demand, with delivery bookkeeping.
pub(crate) struct DeliveryBuffer<T> {
    items: VecDeque<T>,
    signal_tx: mpsc::UnboundedSender<StreamSignal<T>>,
}

impl<T> DeliveryBuffer<T> {
    pub(crate) fn new(signal_tx: mpsc::UnboundedSender<StreamSignal<T>>) -> Self {
        Self {
            items: VecDeque::new(),
            signal_tx,
        }
    }

    pub(crate) fn push(&mut self, item: T) {
        self.items.push_back(item);
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Sends buffered items while demand lasts. Returns false if the
    /// consumer is gone.
    pub(crate) fn deliver(&mut self, demand: &mut u64) -> bool {
        while *demand > 0 {
            let Some(item) = self.items.pop_front() else {
                break;
            };
            if self.signal_tx.send(StreamSignal::Item(item)).is_err() {
                return false;
            }
            *demand -= 1;
        }
        true
    }

    pub(crate) fn complete(&self) {
        let _ = self.signal_tx.send(StreamSignal::Complete);
    }

    pub(crate) fn fail(&self, err: Error) {
        let _ = self.signal_tx.send(StreamSignal::Failed(err));
    }
}

/// Strategy supplying a publisher with its data: where the queried sequence
/// currently ends, how to scan a slice of it, and how to hear about appends.
#[async_trait]
pub(crate) trait ReplaySource: Send + 'static {
    /// Registers for append notifications. Called once, by live queries,
    /// before their first replay.
    async fn subscribe(&mut self) -> Result<mpsc::UnboundedReceiver<Notification>>;

    /// Reads the current upper bound of the queried sequence.
    async fn highest(&mut self) -> Result<i64>;

    /// Scans envelopes with positions in `[from, to]`, yielding at most
    /// `max` in position order.
    async fn replay(&mut self, from: i64, to: i64, max: u64) -> Result<Vec<EventEnvelope>>;
}

/// Whether a query terminates at a captured bound or keeps tailing.
pub(crate) enum Mode {
    Current,
    Live { refresh_interval: Duration },
}

/// Spawns an event query publisher and returns its consumer handle.
pub(crate) fn spawn_events<S: ReplaySource>(
    source: S,
    from: i64,
    to: i64,
    mode: Mode,
    max_buffer_size: usize,
) -> QueryStream<EventEnvelope> {
    let (stream, demand_rx, signal_tx) = stream_channel();

    let publisher = EventPublisher {
        source,
        refresh_interval: match &mode {
            Mode::Current => None,
            Mode::Live { refresh_interval } => Some(*refresh_interval),
        },
        refresh: None,
        notify_rx: None,
        demand_rx,
        buffer: DeliveryBuffer::new(signal_tx),
        demand: 0,
        current: from,
        to,
        max_buffer_size,
        caught_up: false,
        replay_pending: true,
    };
    tokio::spawn(publisher.run());

    stream
}

enum Wake {
    Demand(Option<Demand>),
    Replay,
    NotifyClosed,
}

/// The shared query state machine.
struct EventPublisher<S> {
    source: S,
    refresh_interval: Option<Duration>,
    refresh: Option<Interval>,
    notify_rx: Option<mpsc::UnboundedReceiver<Notification>>,
    demand_rx: mpsc::UnboundedReceiver<Demand>,
    buffer: DeliveryBuffer<EventEnvelope>,
    demand: u64,
    current: i64,
    to: i64,
    max_buffer_size: usize,
    caught_up: bool,
    replay_pending: bool,
}

impl<S: ReplaySource> EventPublisher<S> {
    fn live(&self) -> bool {
        self.refresh_interval.is_some()
    }

    async fn run(mut self) {
        // Init: nothing happens until the consumer signals demand.
        match self.demand_rx.recv().await {
            Some(Demand::Request(n)) => self.demand = n,
            Some(Demand::Cancel) | None => return,
        }

        if let Some(period) = self.refresh_interval {
            // Subscribe before the first replay so nothing appended after
            // the scan can be missed. The subscription is never re-issued;
            // channel liveness covers cleanup.
            match self.source.subscribe().await {
                Ok(rx) => self.notify_rx = Some(rx),
                Err(err) => {
                    self.buffer.fail(err);
                    return;
                }
            }
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            self.refresh = Some(interval);
        } else {
            // Current queries are bounded by what exists at query start,
            // clipped against any tighter caller-supplied bound.
            match self.source.highest().await {
                Ok(highest) => self.to = self.to.min(highest),
                Err(err) => {
                    self.fail(err);
                    return;
                }
            }
        }

        loop {
            if !self.drain_demand() {
                return;
            }
            if self.replay_due() {
                // Yield between chunks so a long bounded query cannot
                // starve the scheduler.
                tokio::task::yield_now().await;
                if let Err(err) = self.replay_chunk().await {
                    self.fail(err);
                    return;
                }
                if !self.drain_demand() {
                    return;
                }
            }
            if !self.buffer.deliver(&mut self.demand) {
                return;
            }
            if self.completed() {
                self.buffer.complete();
                return;
            }
            if self.replay_due() {
                continue;
            }
            if !self.idle_wait().await {
                return;
            }
        }
    }

    fn replay_due(&self) -> bool {
        let buffer_has_room =
            self.buffer.is_empty() || self.buffer.len() <= self.max_buffer_size / 2;
        self.replay_pending && buffer_has_room && self.current <= self.to
    }

    fn completed(&self) -> bool {
        // A query terminates iff no more matching events can exist below
        // its bound: either the position passed the bound, or (for bounded
        // queries) a scan came back short of its limit.
        self.buffer.is_empty() && (self.current > self.to || (!self.live() && self.caught_up))
    }

    async fn replay_chunk(&mut self) -> Result<()> {
        let limit = (self.max_buffer_size - self.buffer.len()) as u64;
        tracing::debug!(
            from = self.current,
            to = self.to,
            limit,
            "replaying query chunk"
        );
        let envelopes = self.source.replay(self.current, self.to, limit).await?;
        let fetched = envelopes.len() as u64;
        for envelope in envelopes {
            self.current = envelope.offset + 1;
            self.buffer.push(envelope);
        }
        self.caught_up = fetched < limit;
        self.replay_pending = !self.caught_up && self.current <= self.to;
        Ok(())
    }

    /// Fails the query: flush what demand allows, surface the error, stop.
    fn fail(&mut self, err: Error) {
        if self.buffer.deliver(&mut self.demand) {
            self.buffer.fail(err);
        }
    }

    /// Applies demand messages without blocking. Returns false on cancel.
    fn drain_demand(&mut self) -> bool {
        loop {
            match self.demand_rx.try_recv() {
                Ok(Demand::Request(n)) => self.demand += n,
                Ok(Demand::Cancel) => return false,
                Err(mpsc::error::TryRecvError::Empty) => return true,
                Err(mpsc::error::TryRecvError::Disconnected) => return false,
            }
        }
    }

    /// Suspends until new demand, an append notification, or a refresh
    /// tick. Returns false on cancel.
    async fn idle_wait(&mut self) -> bool {
        loop {
            let wake = tokio::select! {
                demand = self.demand_rx.recv() => Wake::Demand(demand),
                _ = tick(self.refresh.as_mut()) => Wake::Replay,
                notification = notified(self.notify_rx.as_mut()) => match notification {
                    Some(_) => Wake::Replay,
                    None => Wake::NotifyClosed,
                },
            };
            match wake {
                Wake::Demand(Some(Demand::Request(n))) => {
                    self.demand += n;
                    return true;
                }
                Wake::Demand(Some(Demand::Cancel)) | Wake::Demand(None) => return false,
                Wake::Replay => {
                    self.caught_up = false;
                    self.replay_pending = true;
                    return true;
                }
                // The journal went away; the refresh tick keeps the query
                // serviceable against storage.
                Wake::NotifyClosed => self.notify_rx = None,
            }
        }
    }
}

async fn tick(interval: Option<&mut Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn notified(
    rx: Option<&mut mpsc::UnboundedReceiver<Notification>>,
) -> Option<Notification> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;

    fn envelope(offset: i64) -> EventEnvelope {
        EventEnvelope {
            offset,
            stream_name: "s".to_string(),
            sequence_nr: offset,
            payload: Bytes::from(format!("e-{}", offset)),
        }
    }

    /// Test source over a shared event list the test can append to,
    /// optionally failing at a given replay call.
    struct StubSource {
        events: Arc<Mutex<Vec<EventEnvelope>>>,
        fail_at_call: Option<usize>,
        calls: usize,
        notify_slot: Arc<Mutex<Option<mpsc::UnboundedSender<Notification>>>>,
    }

    impl StubSource {
        fn with_offsets(offsets: &[i64]) -> Self {
            Self {
                events: Arc::new(Mutex::new(offsets.iter().copied().map(envelope).collect())),
                fail_at_call: None,
                calls: 0,
                notify_slot: Arc::new(Mutex::new(None)),
            }
        }

        fn failing_at_call(mut self, call: usize) -> Self {
            self.fail_at_call = Some(call);
            self
        }

        fn events(&self) -> Arc<Mutex<Vec<EventEnvelope>>> {
            Arc::clone(&self.events)
        }

        fn notify_slot(&self) -> Arc<Mutex<Option<mpsc::UnboundedSender<Notification>>>> {
            Arc::clone(&self.notify_slot)
        }
    }

    #[async_trait]
    impl ReplaySource for StubSource {
        async fn subscribe(&mut self) -> Result<mpsc::UnboundedReceiver<Notification>> {
            let (tx, rx) = mpsc::unbounded_channel();
            *self.notify_slot.lock().unwrap() = Some(tx);
            Ok(rx)
        }

        async fn highest(&mut self) -> Result<i64> {
            Ok(self
                .events
                .lock()
                .unwrap()
                .iter()
                .map(|e| e.offset)
                .max()
                .unwrap_or(0))
        }

        async fn replay(&mut self, from: i64, to: i64, max: u64) -> Result<Vec<EventEnvelope>> {
            self.calls += 1;
            if self.fail_at_call == Some(self.calls) {
                return Err(Error::Replay("disk gone".to_string()));
            }
            Ok(self
                .events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.offset >= from && e.offset <= to)
                .take(max as usize)
                .cloned()
                .collect())
        }
    }

    async fn collect(stream: &mut QueryStream<EventEnvelope>) -> Vec<i64> {
        let mut offsets = Vec::new();
        while let Some(envelope) = stream.next().await.unwrap() {
            offsets.push(envelope.offset);
        }
        offsets
    }

    #[tokio::test]
    async fn should_emit_all_events_then_complete_for_current_query() {
        // given
        let source = StubSource::with_offsets(&[1, 2, 3]);
        let mut stream = spawn_events(source, 0, i64::MAX, Mode::Current, 100);

        // when
        let offsets = collect(&mut stream).await;

        // then
        assert_eq!(offsets, vec![1, 2, 3]);
        assert!(stream.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn should_complete_current_query_with_no_events() {
        // given
        let source = StubSource::with_offsets(&[]);
        let mut stream = spawn_events(source, 0, i64::MAX, Mode::Current, 100);

        // when/then
        assert!(stream.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn should_clip_current_query_to_highest_at_start() {
        // given - the query bound exceeds what exists, and an event appears
        // after the bound was captured
        let source = StubSource::with_offsets(&[1, 2]);
        let events = source.events();
        let mut stream = spawn_events(source, 0, 1_000, Mode::Current, 100);

        // when - drain one, then a concurrent writer appends offset 3
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.offset, 1);
        events.lock().unwrap().push(envelope(3));
        let rest = collect(&mut stream).await;

        // then - the late event is outside the captured bound
        assert_eq!(rest, vec![2]);
    }

    #[tokio::test]
    async fn should_not_emit_more_than_outstanding_demand() {
        // given
        let source = StubSource::with_offsets(&[1, 2, 3, 4, 5]);
        let mut stream = spawn_events(source, 0, i64::MAX, Mode::Current, 100);

        // when - demand only two
        stream.request(2);
        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();

        // then - a third item must not arrive until more demand is granted
        assert_eq!(first.offset, 1);
        assert_eq!(second.offset, 2);
        let starved =
            tokio::time::timeout(Duration::from_millis(50), stream.signal_rx.recv()).await;
        assert!(starved.is_err(), "publisher emitted beyond demand");

        // when - grant the rest
        stream.request(3);
        let rest = collect(&mut stream).await;

        // then
        assert_eq!(rest, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn should_fetch_in_chunks_bounded_by_buffer_size() {
        // given - 5 events but room for at most 2 buffered items
        let source = StubSource::with_offsets(&[1, 2, 3, 4, 5]);
        let mut stream = spawn_events(source, 0, i64::MAX, Mode::Current, 2);

        // when
        let offsets = collect(&mut stream).await;

        // then
        assert_eq!(offsets, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn should_flush_buffered_items_before_failing() {
        // given - the buffer limits the first scan to two events, and the
        // follow-up scan errors
        let source = StubSource::with_offsets(&[1, 2, 3, 4]).failing_at_call(2);
        let mut stream = spawn_events(source, 0, i64::MAX, Mode::Current, 2);

        // when - demand everything up front
        stream.request(10);
        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();
        let failure = stream.next().await;

        // then - buffered items arrived before the error surfaced
        assert_eq!(first.offset, 1);
        assert_eq!(second.offset, 2);
        assert!(matches!(failure, Err(Error::Replay(_))));
    }

    #[tokio::test]
    async fn should_emit_new_events_after_append_notification() {
        // given
        let source = StubSource::with_offsets(&[1]);
        let events = source.events();
        let notify = source.notify_slot();
        let mut stream = spawn_events(
            source,
            0,
            i64::MAX,
            Mode::Live {
                refresh_interval: Duration::from_secs(3600),
            },
            100,
        );

        // when - drain the existing event
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.offset, 1);

        // and a new event is appended and announced
        let next = tokio::spawn(async move { stream.next().await });
        tokio::task::yield_now().await;
        events.lock().unwrap().push(envelope(2));
        notify
            .lock()
            .unwrap()
            .as_ref()
            .expect("live query subscribed")
            .send(Notification::StreamAppended("s".to_string()))
            .unwrap();

        // then - the new event is emitted without re-issuing the query
        let second = next.await.unwrap().unwrap().unwrap();
        assert_eq!(second.offset, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn should_emit_new_events_on_refresh_tick_when_notification_lost() {
        // given - the notification channel stays silent
        let source = StubSource::with_offsets(&[1]);
        let events = source.events();
        let _notify = source.notify_slot();
        let mut stream = spawn_events(
            source,
            0,
            i64::MAX,
            Mode::Live {
                refresh_interval: Duration::from_millis(100),
            },
            100,
        );

        // when
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.offset, 1);

        events.lock().unwrap().push(envelope(2));
        let next = tokio::spawn(async move { stream.next().await });
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_millis(150)).await;

        // then - the refresh tick picked up the new event
        let second = next.await.unwrap().unwrap().unwrap();
        assert_eq!(second.offset, 2);
    }

    #[tokio::test]
    async fn should_complete_live_query_when_finite_bound_reached() {
        // given
        let source = StubSource::with_offsets(&[1, 2, 3]);
        let mut stream = spawn_events(
            source,
            0,
            2,
            Mode::Live {
                refresh_interval: Duration::from_secs(3600),
            },
            100,
        );

        // when
        let offsets = collect(&mut stream).await;

        // then - stops at the finite bound even though more events exist
        assert_eq!(offsets, vec![1, 2]);
    }

    #[tokio::test]
    async fn should_adapt_into_futures_stream() {
        use futures::StreamExt;

        // given
        let source = StubSource::with_offsets(&[1, 2, 3]);
        let stream = spawn_events(source, 0, i64::MAX, Mode::Current, 100);

        // when
        let offsets: Vec<i64> = stream
            .into_stream()
            .map(|result| result.unwrap().offset)
            .collect()
            .await;

        // then
        assert_eq!(offsets, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn should_stop_emitting_after_cancel() {
        // given
        let source = StubSource::with_offsets(&[1, 2, 3]);
        let mut stream = spawn_events(source, 0, i64::MAX, Mode::Current, 100);
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.offset, 1);

        // when
        stream.cancel();

        // then
        assert!(stream.next().await.unwrap().is_none());
    }
}
