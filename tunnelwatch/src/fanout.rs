//! Fan-out of committed store changes to any number of consumers.
//!
//! Every channel owns one `tokio::sync::broadcast` queue. The store sends
//! into it while still holding the channel's write lock, so consumers see
//! updates in exactly the order they were committed, each tagged with a
//! strictly increasing `seq`.
//!
//! Sending never waits on consumers. A consumer that falls further behind
//! than the configured buffer is dropped: its next [`Subscription::recv`]
//! returns [`SubscriptionError::Overloaded`] and the subscription ends.
//! Ingestion is unaffected.
//!
//! # Joining without gaps
//!
//! [`Publisher::join`] takes the snapshot and registers the receiver under
//! the channel's read lock. No commit can land between the two, so the
//! first live update a joiner receives is exactly the one after its
//! snapshot.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tunnelwatch::{ChannelId, Publisher, SeriesStore, StoreConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(SeriesStore::new(StoreConfig::default()));
//! let publisher = Publisher::new(Arc::clone(&store));
//! let channel = ChannelId::new("tunel1")?;
//!
//! let (history, mut subscription) = publisher.join(&channel);
//! println!("{} readings so far", history.len());
//! while let Ok(update) = subscription.recv().await {
//!     println!("seq {}: {} new readings", update.seq, update.added.len());
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

use crate::error::SubscriptionError;
use crate::reading::{ChannelId, Reading};
use crate::store::SeriesStore;

/// One committed change to a channel's series.
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    /// The channel that changed.
    pub channel: ChannelId,
    /// Commit sequence number, strictly increasing per channel.
    pub seq: u64,
    /// Readings that were not present before, in series order.
    pub added: Vec<Reading>,
    /// Readings whose fields or timestamp changed, in series order.
    pub updated: Vec<Reading>,
    /// Readings removed by the bound policy.
    pub evicted: Vec<Reading>,
    /// The channel's newest reading after this commit.
    pub latest: Option<Reading>,
    /// Whether `latest` differs from the previous commit's.
    pub latest_changed: bool,
}

/// Event carried on a channel's broadcast queue.
#[derive(Debug, Clone)]
pub(crate) enum ChannelEvent {
    Committed(Arc<Update>),
    Removed,
}

/// Sending half of a channel's update queue.
#[derive(Debug)]
pub(crate) struct Fanout {
    sender: broadcast::Sender<ChannelEvent>,
}

impl Fanout {
    pub(crate) fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer.max(1));
        Self { sender }
    }

    /// Publishes an event; having no subscribers is not an error.
    pub(crate) fn publish(&self, event: ChannelEvent) {
        let _ = self.sender.send(event);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.sender.subscribe()
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// A consumer's live view of one channel.
///
/// Dropping the subscription releases its queue position immediately. A
/// subscription that ended (overloaded or channel removed) releases it on
/// its own.
#[derive(Debug)]
pub struct Subscription {
    channel: ChannelId,
    /// `None` once the subscription has ended.
    receiver: Option<broadcast::Receiver<ChannelEvent>>,
    last_seq: u64,
}

impl Subscription {
    pub(crate) fn new(channel: ChannelId, receiver: broadcast::Receiver<ChannelEvent>, last_seq: u64) -> Self {
        Self {
            channel,
            receiver: Some(receiver),
            last_seq,
        }
    }

    /// The channel this subscription follows.
    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    /// Sequence number of the last update delivered (or of the snapshot
    /// taken at join time).
    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    /// Waits for the next committed update.
    ///
    /// # Errors
    ///
    /// - [`SubscriptionError::Overloaded`] if this consumer fell behind and
    ///   was dropped
    /// - [`SubscriptionError::ChannelRemoved`] if the channel was
    ///   unregistered or swept for idleness
    /// - [`SubscriptionError::Closed`] on any call after one of the above
    pub async fn recv(&mut self) -> Result<Arc<Update>, SubscriptionError> {
        let Some(receiver) = self.receiver.as_mut() else {
            return Err(SubscriptionError::Closed);
        };
        let event = receiver.recv().await;
        self.handle(event)
    }

    /// Returns the next update if one is already queued.
    ///
    /// # Errors
    ///
    /// Same as [`Subscription::recv`].
    pub fn try_recv(&mut self) -> Result<Option<Arc<Update>>, SubscriptionError> {
        let Some(receiver) = self.receiver.as_mut() else {
            return Err(SubscriptionError::Closed);
        };
        match receiver.try_recv() {
            Ok(event) => self.handle(Ok(event)).map(Some),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Lagged(missed)) => self.handle(Err(RecvError::Lagged(missed))).map(Some),
            Err(TryRecvError::Closed) => self.handle(Err(RecvError::Closed)).map(Some),
        }
    }

    fn handle(&mut self, event: Result<ChannelEvent, RecvError>) -> Result<Arc<Update>, SubscriptionError> {
        match event {
            Ok(ChannelEvent::Committed(update)) => {
                self.last_seq = update.seq;
                Ok(update)
            }
            Ok(ChannelEvent::Removed) | Err(RecvError::Closed) => {
                self.receiver = None;
                Err(SubscriptionError::ChannelRemoved)
            }
            Err(RecvError::Lagged(missed)) => {
                self.receiver = None;
                tracing::warn!(channel = %self.channel, missed, "dropping overloaded subscriber");
                Err(SubscriptionError::Overloaded { missed })
            }
        }
    }
}

/// Entry point for consumers of committed store changes.
#[derive(Debug, Clone)]
pub struct Publisher {
    store: Arc<SeriesStore>,
}

impl Publisher {
    /// Creates a publisher over `store`.
    pub fn new(store: Arc<SeriesStore>) -> Self {
        Self { store }
    }

    /// Subscribes to live updates for `channel`.
    ///
    /// Unknown channels are created empty so a consumer may subscribe
    /// before the first reading arrives.
    pub fn subscribe(&self, channel: &ChannelId) -> Subscription {
        let (_, seq, receiver) = self.store.attach(channel, false);
        Subscription::new(channel.clone(), receiver, seq)
    }

    /// Atomically snapshots `channel` and subscribes to everything after it.
    pub fn join(&self, channel: &ChannelId) -> (Vec<Reading>, Subscription) {
        let (snapshot, seq, receiver) = self.store.attach(channel, true);
        (snapshot, Subscription::new(channel.clone(), receiver, seq))
    }

    /// Stops delivery to `subscription` and releases its resources.
    pub fn unsubscribe(&self, subscription: Subscription) {
        tracing::debug!(channel = %subscription.channel, "subscriber left");
        drop(subscription);
    }

    /// Number of live subscriptions on `channel`.
    pub fn subscriber_count(&self, channel: &ChannelId) -> usize {
        self.store.subscriber_count(channel)
    }
}
