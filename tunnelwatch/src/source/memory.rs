//! In-process push feed.
//!
//! [`MemoryFeed`] behaves like a hosted realtime database: it keeps a keyed
//! collection per channel and pushes the whole collection to every live
//! subscriber after each write. Outages can be injected to exercise the
//! reconnect path; while the feed is unavailable, writes are still accepted
//! (upstream keeps recording) but nothing is delivered.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use tokio::sync::mpsc;

use super::{FeedItem, FeedSource, FeedSubscription, RawSnapshot, record_timestamp};
use crate::error::TransportError;
use crate::reading::{ChannelId, Reading};

#[derive(Debug, Default)]
struct ChannelFeed {
    records: Map<String, Value>,
    subscribers: Vec<mpsc::UnboundedSender<FeedItem>>,
}

impl ChannelFeed {
    fn push_snapshot(&mut self) {
        let snapshot = RawSnapshot::from_map(self.records.clone());
        self.subscribers.retain(|tx| tx.send(Ok(snapshot.clone())).is_ok());
    }

    fn fail_subscribers(&mut self, error: impl Fn() -> TransportError) {
        for tx in self.subscribers.drain(..) {
            let _ = tx.send(Err(error()));
        }
    }
}

#[derive(Debug)]
struct FeedState {
    channels: HashMap<ChannelId, ChannelFeed>,
    available: bool,
}

/// In-memory realtime feed, cheap to clone and share.
///
/// # Example
///
/// ```rust
/// use serde_json::json;
/// use tunnelwatch::source::{FeedSource, MemoryFeed};
/// use tunnelwatch::ChannelId;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let feed = MemoryFeed::new();
/// let channel = ChannelId::new("tunel1")?;
///
/// let mut sub = feed.subscribe(&channel).await?;
/// let initial = sub.next().await.unwrap()?;
/// assert!(initial.is_empty());
///
/// feed.put(&channel, "-Nx1", json!({ "humidity": 50, "temperature": 20, "timestamp": 100 }));
/// let next = sub.next().await.unwrap()?;
/// assert_eq!(next.len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct MemoryFeed {
    state: Arc<Mutex<FeedState>>,
    range_queries: bool,
    description: String,
}

impl Default for MemoryFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFeed {
    /// Creates an empty feed without range query support.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FeedState {
                channels: HashMap::new(),
                available: true,
            })),
            range_queries: false,
            description: "memory".to_string(),
        }
    }

    /// Enables [`FeedSource::fetch_range`] on this feed.
    #[must_use]
    pub fn with_range_queries(mut self) -> Self {
        self.range_queries = true;
        self.description = "memory (range queries)".to_string();
        self
    }

    /// Writes `record` under `key` and pushes the new snapshot.
    pub fn put(&self, channel: &ChannelId, key: &str, record: Value) {
        let mut state = self.state.lock();
        let available = state.available;
        let feed = state.channels.entry(channel.clone()).or_default();
        feed.records.insert(key.to_string(), record);
        if available {
            feed.push_snapshot();
        }
    }

    /// Writes a reading in the upstream record shape.
    pub fn put_reading(&self, reading: &Reading) {
        self.put(
            reading.channel_id(),
            reading.source_key(),
            json!({
                "humidity": reading.humidity(),
                "temperature": reading.temperature(),
                "timestamp": reading.timestamp(),
                "tunnelId": reading.channel_id().as_str(),
            }),
        );
    }

    /// Deletes the record under `key` and pushes the new snapshot.
    pub fn remove(&self, channel: &ChannelId, key: &str) {
        let mut state = self.state.lock();
        let available = state.available;
        if let Some(feed) = state.channels.get_mut(channel) {
            if feed.records.remove(key).is_some() && available {
                feed.push_snapshot();
            }
        }
    }

    /// Drops every live subscription on `channel` with a transport error.
    ///
    /// New subscriptions are accepted immediately afterwards.
    pub fn disconnect(&self, channel: &ChannelId) {
        let mut state = self.state.lock();
        if let Some(feed) = state.channels.get_mut(channel) {
            let name = channel.to_string();
            feed.fail_subscribers(|| TransportError::Closed { channel: name.clone() });
        }
    }

    /// Starts or ends an outage.
    ///
    /// Going unavailable fails every live subscription; while unavailable,
    /// `subscribe` and `fetch_range` return [`TransportError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        let mut state = self.state.lock();
        if state.available == available {
            return;
        }
        state.available = available;
        if !available {
            for feed in state.channels.values_mut() {
                feed.fail_subscribers(|| TransportError::Unavailable {
                    reason: "injected outage".to_string(),
                });
            }
        }
        tracing::debug!(available, "memory feed availability changed");
    }

    /// Number of live subscriptions on `channel`.
    pub fn subscriber_count(&self, channel: &ChannelId) -> usize {
        let mut state = self.state.lock();
        state.channels.get_mut(channel).map_or(0, |feed| {
            feed.subscribers.retain(|tx| !tx.is_closed());
            feed.subscribers.len()
        })
    }

    fn unavailable() -> TransportError {
        TransportError::Unavailable {
            reason: "injected outage".to_string(),
        }
    }
}

#[async_trait]
impl FeedSource for MemoryFeed {
    async fn subscribe(&self, channel: &ChannelId) -> Result<FeedSubscription, TransportError> {
        let mut state = self.state.lock();
        if !state.available {
            return Err(Self::unavailable());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let feed = state.channels.entry(channel.clone()).or_default();
        // Current value first, like an onValue listener.
        let _ = tx.send(Ok(RawSnapshot::from_map(feed.records.clone())));
        feed.subscribers.push(tx);

        Ok(FeedSubscription::new(rx))
    }

    async fn fetch_range(
        &self,
        channel: &ChannelId,
        from: u64,
        to: u64,
    ) -> Result<Option<RawSnapshot>, TransportError> {
        if !self.range_queries {
            return Ok(None);
        }

        let state = self.state.lock();
        if !state.available {
            return Err(Self::unavailable());
        }

        #[allow(clippy::cast_precision_loss)] // epoch millis fit f64 exactly
        let (from, to) = (from as f64, to as f64);
        let entries = state
            .channels
            .get(channel)
            .map(|feed| {
                feed.records
                    .iter()
                    .filter(|(_, record)| record_timestamp(record).is_some_and(|ts| ts >= from && ts <= to))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default();

        Ok(Some(RawSnapshot::from_map(entries)))
    }

    fn description(&self) -> &str {
        &self.description
    }
}
