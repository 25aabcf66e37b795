//! Feed transports delivering raw keyed snapshots per channel.
//!
//! The ingestion side depends only on [`FeedSource`]: "give me a stream of
//! snapshots for this channel" plus an optional range query used for
//! backfill. Transports decide how snapshots are produced (push from an
//! in-process feed, polling a REST endpoint, a message queue consumer).
//!
//! A snapshot is the channel's full current keyed collection, the shape
//! realtime databases deliver on every change:
//!
//! ```json
//! {
//!   "-Nx1": { "humidity": 51, "temperature": 20.5, "timestamp": 1700000000000, "tunnelId": 1 },
//!   "-Nx2": { "humidity": "52", "temperature": "20.7", "timestamp": 1700000005000 }
//! }
//! ```
//!
//! `null` means "no readings currently available". Collections with integer
//! keys arrive as JSON arrays; the index becomes the source key and `null`
//! holes are skipped.

#[cfg(feature = "http-poll")]
mod http;
mod memory;

#[cfg(feature = "http-poll")]
pub use http::HttpPollFeed;
pub use memory::MemoryFeed;

use std::fmt::Debug;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::TransportError;
use crate::reading::ChannelId;

/// One untyped keyed snapshot from upstream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawSnapshot {
    entries: Map<String, Value>,
}

impl RawSnapshot {
    /// Creates an empty snapshot.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Wraps an already keyed collection.
    pub fn from_map(entries: Map<String, Value>) -> Self {
        Self { entries }
    }

    /// Interprets a JSON document as a snapshot.
    ///
    /// `null` yields an empty snapshot. An array is keyed by index, skipping
    /// `null` elements.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Decode`] if the document is not an object,
    /// an array, or `null`.
    pub fn from_value(value: Value) -> Result<Self, TransportError> {
        let entries = match value {
            Value::Null => Map::new(),
            Value::Object(entries) => entries,
            Value::Array(items) => items
                .into_iter()
                .enumerate()
                .filter(|(_, record)| !record.is_null())
                .map(|(index, record)| (index.to_string(), record))
                .collect(),
            other => {
                return Err(TransportError::Decode {
                    source: serde::de::Error::custom(format!(
                        "expected an object, array or null snapshot, found {other}"
                    )),
                });
            }
        };
        Ok(Self { entries })
    }

    /// Parses raw JSON bytes as a snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Decode`] on malformed JSON or a document
    /// that is not an object, an array, or `null`.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, TransportError> {
        let value: Value = serde_json::from_slice(bytes).map_err(|source| TransportError::Decode { source })?;
        Self::from_value(value)
    }

    /// Iterates `(source_key, record)` pairs.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of records in the snapshot.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the snapshot holds no records.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Item yielded by a feed subscription.
pub type FeedItem = Result<RawSnapshot, TransportError>;

/// A live stream of snapshots for one channel.
///
/// Dropping the subscription releases the transport: any background
/// producer task is aborted.
#[derive(Debug)]
pub struct FeedSubscription {
    receiver: mpsc::UnboundedReceiver<FeedItem>,
    producer: Option<JoinHandle<()>>,
}

impl FeedSubscription {
    /// Wraps a receiver fed by the transport.
    pub fn new(receiver: mpsc::UnboundedReceiver<FeedItem>) -> Self {
        Self {
            receiver,
            producer: None,
        }
    }

    /// Wraps a receiver fed by `producer`, which is aborted on drop.
    pub fn with_producer(receiver: mpsc::UnboundedReceiver<FeedItem>, producer: JoinHandle<()>) -> Self {
        Self {
            receiver,
            producer: Some(producer),
        }
    }

    /// Waits for the next snapshot or transport error.
    ///
    /// Returns `None` once the upstream stream has ended.
    pub async fn next(&mut self) -> Option<FeedItem> {
        self.receiver.recv().await
    }
}

impl Drop for FeedSubscription {
    fn drop(&mut self) {
        if let Some(producer) = self.producer.take() {
            producer.abort();
        }
    }
}

/// A source of per-channel snapshots.
///
/// Implementations must be cheap to share across channel tasks.
#[async_trait]
pub trait FeedSource: Send + Sync + Debug {
    /// Opens a live subscription to `channel`.
    ///
    /// The first item of the stream should be the channel's current
    /// snapshot.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if the subscription cannot be opened.
    async fn subscribe(&self, channel: &ChannelId) -> Result<FeedSubscription, TransportError>;

    /// Fetches records of `channel` with `from <= timestamp <= to`.
    ///
    /// Returns `Ok(None)` when the transport has no range queries, in which
    /// case callers reconcile through the next full snapshot instead.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if the query fails.
    async fn fetch_range(
        &self,
        _channel: &ChannelId,
        _from: u64,
        _to: u64,
    ) -> Result<Option<RawSnapshot>, TransportError> {
        Ok(None)
    }

    /// Human-readable description of the source, used in logs.
    fn description(&self) -> &str;
}

/// Reads the `timestamp` field of a raw record the way ingestion coerces it.
pub(crate) fn record_timestamp(record: &Value) -> Option<f64> {
    match record.get("timestamp")? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_null_snapshot_is_empty() {
        let snapshot = RawSnapshot::from_value(Value::Null).unwrap();
        assert!(snapshot.is_empty());

        let snapshot = RawSnapshot::from_slice(b"null").unwrap();
        assert!(snapshot.is_empty());
    }

    #[test]
    fn test_keyed_snapshot() {
        let snapshot = RawSnapshot::from_value(json!({
            "a": { "timestamp": 1 },
            "b": { "timestamp": 2 },
        }))
        .unwrap();
        assert_eq!(snapshot.len(), 2);
        let keys: Vec<&str> = snapshot.entries().map(|(k, _)| k).collect();
        assert_eq!(keys, ["a", "b"]);
    }

    #[test]
    fn test_array_snapshot_keyed_by_index() {
        let snapshot = RawSnapshot::from_value(json!([
            null,
            { "humidity": 50, "temperature": 20, "timestamp": 100 },
            null,
            { "humidity": 51, "temperature": 21, "timestamp": 200 },
        ]))
        .unwrap();

        assert_eq!(snapshot.len(), 2);
        let keys: Vec<&str> = snapshot.entries().map(|(k, _)| k).collect();
        assert_eq!(keys, ["1", "3"]);

        let (readings, rejected) = crate::ingest::parse_snapshot(&ChannelId::new("tunel1").unwrap(), &snapshot);
        assert!(rejected.is_empty());
        assert_eq!(readings.iter().map(|r| r.timestamp()).collect::<Vec<_>>(), vec![100, 200]);
    }

    #[test]
    fn test_scalar_snapshot_rejected() {
        assert!(matches!(RawSnapshot::from_value(json!(42)), Err(TransportError::Decode { .. })));
        assert!(matches!(RawSnapshot::from_value(json!("x")), Err(TransportError::Decode { .. })));
        assert!(matches!(RawSnapshot::from_slice(b"{not json"), Err(TransportError::Decode { .. })));
    }

    #[test]
    fn test_record_timestamp_coercion() {
        assert_eq!(record_timestamp(&json!({ "timestamp": 5 })), Some(5.0));
        assert_eq!(record_timestamp(&json!({ "timestamp": " 7 " })), Some(7.0));
        assert_eq!(record_timestamp(&json!({ "timestamp": true })), None);
        assert_eq!(record_timestamp(&json!({})), None);
    }
}
