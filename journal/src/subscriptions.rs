//! Subscriber tracking for append notifications.
//!
//! Queries register interest in a stream, a tag, or in the discovery of new
//! stream names. Notifications are lightweight wake signals carrying only the
//! name, never payloads; a woken consumer re-reads through the replay path.
//!
//! Subscribers are channel endpoints. A send to a closed channel means the
//! consumer went away, and the registration is dropped on the spot; channel
//! closure is the only liveness signal needed.

use std::collections::HashMap;

use tokio::sync::mpsc;

/// Wake signal pushed to interested subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// An event was appended to the named stream.
    StreamAppended(String),
    /// An event carrying the named tag was appended.
    TagAppended(String),
    /// A stream name was seen for the first time.
    NameAdded(String),
}

type Subscriber = mpsc::UnboundedSender<Notification>;

/// Registry of notification subscribers, owned by the writer task.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    by_stream: HashMap<String, Vec<Subscriber>>,
    by_tag: HashMap<String, Vec<Subscriber>>,
    all_names: Vec<Subscriber>,
}

impl SubscriptionRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers interest in appends to one stream.
    pub(crate) fn subscribe_stream(&mut self, name: &str) -> mpsc::UnboundedReceiver<Notification> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.by_stream.entry(name.to_string()).or_default().push(tx);
        rx
    }

    /// Registers interest in appends carrying one tag.
    pub(crate) fn subscribe_tag(&mut self, tag: &str) -> mpsc::UnboundedReceiver<Notification> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.by_tag.entry(tag.to_string()).or_default().push(tx);
        rx
    }

    /// Registers interest in newly discovered stream names.
    pub(crate) fn subscribe_names(&mut self) -> mpsc::UnboundedReceiver<Notification> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.all_names.push(tx);
        rx
    }

    /// Wakes subscribers of the given stream.
    pub(crate) fn notify_stream_appended(&mut self, name: &str) {
        if let Some(subscribers) = self.by_stream.get_mut(name) {
            let notification = Notification::StreamAppended(name.to_string());
            subscribers.retain(|tx| tx.send(notification.clone()).is_ok());
            if subscribers.is_empty() {
                self.by_stream.remove(name);
            }
        }
    }

    /// Wakes subscribers of the given tag.
    pub(crate) fn notify_tag_appended(&mut self, tag: &str) {
        if let Some(subscribers) = self.by_tag.get_mut(tag) {
            let notification = Notification::TagAppended(tag.to_string());
            subscribers.retain(|tx| tx.send(notification.clone()).is_ok());
            if subscribers.is_empty() {
                self.by_tag.remove(tag);
            }
        }
    }

    /// Wakes all-names subscribers about a newly discovered stream.
    pub(crate) fn notify_name_added(&mut self, name: &str) {
        let notification = Notification::NameAdded(name.to_string());
        self.all_names
            .retain(|tx| tx.send(notification.clone()).is_ok());
    }
}
