//! Stream-name query publishers.
//!
//! Name queries have no replay loop: the journal hands over its full name
//! set in one step, and the live variant additionally receives each newly
//! discovered name through a one-time subscription taken atomically with
//! the snapshot, so no discovery can fall between the two.

use tokio::sync::mpsc;

use crate::journal::JournalHandle;
use crate::subscriptions::Notification;

use super::publisher::{Demand, DeliveryBuffer, QueryStream, stream_channel};

/// Spawns a stream-name query publisher and returns its consumer handle.
pub(crate) fn spawn_names(handle: JournalHandle, live: bool) -> QueryStream<String> {
    let (stream, demand_rx, signal_tx) = stream_channel();
    let publisher = NamesPublisher {
        handle,
        live,
        demand_rx,
        buffer: DeliveryBuffer::new(signal_tx),
        demand: 0,
        notify_rx: None,
    };
    tokio::spawn(publisher.run());
    stream
}

struct NamesPublisher {
    handle: JournalHandle,
    live: bool,
    demand_rx: mpsc::UnboundedReceiver<Demand>,
    buffer: DeliveryBuffer<String>,
    demand: u64,
    notify_rx: Option<mpsc::UnboundedReceiver<Notification>>,
}

impl NamesPublisher {
    async fn run(mut self) {
        // Init: nothing happens until the consumer signals demand.
        match self.demand_rx.recv().await {
            Some(Demand::Request(n)) => self.demand = n,
            Some(Demand::Cancel) | None => return,
        }

        let names = if self.live {
            match self.handle.subscribe_names().await {
                Ok((names, rx)) => {
                    self.notify_rx = Some(rx);
                    names
                }
                Err(err) => {
                    self.buffer.fail(err);
                    return;
                }
            }
        } else {
            match self.handle.current_stream_names().await {
                Ok(names) => names,
                Err(err) => {
                    self.buffer.fail(err);
                    return;
                }
            }
        };
        for name in names {
            self.buffer.push(name);
        }

        loop {
            if !self.buffer.deliver(&mut self.demand) {
                return;
            }
            if !self.live && self.buffer.is_empty() {
                self.buffer.complete();
                return;
            }
            if !self.idle_wait().await {
                return;
            }
        }
    }

    /// Suspends until new demand or a newly discovered name. Returns false
    /// on cancel.
    async fn idle_wait(&mut self) -> bool {
        loop {
            tokio::select! {
                demand = self.demand_rx.recv() => {
                    match demand {
                        Some(Demand::Request(n)) => {
                            self.demand += n;
                            return true;
                        }
                        Some(Demand::Cancel) | None => return false,
                    }
                }
                notification = notified(self.notify_rx.as_mut()) => {
                    match notification {
                        Some(Notification::NameAdded(name)) => {
                            self.buffer.push(name);
                            return true;
                        }
                        Some(_) => {}
                        None => self.notify_rx = None,
                    }
                }
            }
        }
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
