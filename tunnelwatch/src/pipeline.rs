//! The assembled telemetry pipeline.
//!
//! [`Pipeline`] wires one [`FeedSource`] to the series store through the
//! ingestor, keeps one [`SubscriptionHandle`] per connected channel, and
//! exposes the consumer surface (`latest`, `snapshot`, `window`,
//! `subscribe`). When the store config sets an idle timeout, a background
//! sweeper removes channels that are neither connected, subscribed to, nor
//! written for that long.
//!
//! # Example Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use tunnelwatch::config::PipelineConfig;
//! use tunnelwatch::source::MemoryFeed;
//! use tunnelwatch::{ChannelId, Pipeline};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let feed = MemoryFeed::new();
//! let pipeline = Pipeline::new(PipelineConfig::default(), Arc::new(feed.clone()))?;
//! let channel = ChannelId::new("tunel1")?;
//!
//! let (history, mut updates) = pipeline.join(&channel);
//! assert!(history.is_empty());
//! pipeline.connect(&channel)?;
//!
//! feed.put(&channel, "-Nx1", serde_json::json!({
//!     "humidity": 50, "temperature": 20.5, "timestamp": 1_700_000_000_000u64,
//! }));
//! let update = updates.recv().await?;
//! assert_eq!(update.added.len(), 1);
//!
//! pipeline.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{PipelineConfig, RetryConfig};
use crate::controller::{ConnectionStatus, SubscriptionHandle};
use crate::error::{ControllerError, Result};
use crate::fanout::{Publisher, Subscription};
use crate::ingest::{IngestStats, Ingestor};
use crate::query::WindowResult;
use crate::reading::{ChannelId, Reading};
use crate::source::FeedSource;
use crate::store::SeriesStore;

/// Shortest interval between idle sweeps.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct Inner {
    store: Arc<SeriesStore>,
    ingestor: Arc<Ingestor>,
    source: Arc<dyn FeedSource>,
    retry: RetryConfig,
    handles: Mutex<HashMap<ChannelId, SubscriptionHandle>>,
}

impl Inner {
    fn sweep_idle(&self, now: Instant) -> Vec<ChannelId> {
        let pinned: HashSet<ChannelId> = self.handles.lock().keys().cloned().collect();
        let evicted = self.store.evict_idle_except(now, &pinned);
        for channel in &evicted {
            self.ingestor.forget(channel);
        }
        evicted
    }
}

/// Feed-to-consumer pipeline for many channels.
#[derive(Debug)]
pub struct Pipeline {
    inner: Arc<Inner>,
    publisher: Publisher,
    sweeper: Option<JoinHandle<()>>,
}

impl Pipeline {
    /// Builds a pipeline reading from `source`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`](crate::error::ConfigError) if `config` fails
    /// validation.
    ///
    /// # Panics
    ///
    /// Panics if an idle timeout is configured and this is called outside
    /// a Tokio runtime.
    pub fn new(config: PipelineConfig, source: Arc<dyn FeedSource>) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(SeriesStore::new(config.store.clone()));
        let inner = Arc::new(Inner {
            ingestor: Arc::new(Ingestor::new(Arc::clone(&store))),
            store: Arc::clone(&store),
            source,
            retry: config.retry,
            handles: Mutex::new(HashMap::new()),
        });

        let sweeper = config
            .store
            .idle_timeout
            .map(|timeout| spawn_sweeper(Arc::clone(&inner), (timeout / 2).max(MIN_SWEEP_INTERVAL)));

        Ok(Self {
            inner,
            publisher: Publisher::new(store),
            sweeper,
        })
    }

    /// Starts (or restarts after `Failed`) the feed subscription of `channel`.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::AlreadyConnected`] if it is running.
    pub fn connect(&self, channel: &ChannelId) -> Result<()> {
        let mut handles = self.inner.handles.lock();
        let handle = handles.entry(channel.clone()).or_insert_with(|| {
            SubscriptionHandle::new(
                channel.clone(),
                Arc::clone(&self.inner.source),
                Arc::clone(&self.inner.ingestor),
                self.inner.retry.clone(),
            )
        });
        handle.connect()?;
        self.inner.store.ensure_channel(channel);
        Ok(())
    }

    /// Stops the feed subscription of `channel`, keeping its data.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::ChannelNotFound`] if `channel` has no
    /// subscription.
    pub async fn close(&self, channel: &ChannelId) -> Result<()> {
        let handle = self.inner.handles.lock().remove(channel);
        let Some(handle) = handle else {
            return Err(ControllerError::ChannelNotFound {
                channel: channel.to_string(),
            }
            .into());
        };
        handle.close().await;
        Ok(())
    }

    /// Closes `channel`'s subscription, if any, and destroys its series.
    ///
    /// Consumers subscribed to the channel are notified.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::ChannelNotFound`] if the channel was
    /// neither connected nor stored.
    pub async fn unregister(&self, channel: &ChannelId) -> Result<()> {
        let handle = self.inner.handles.lock().remove(channel);
        let had_handle = handle.is_some();
        if let Some(handle) = handle {
            handle.close().await;
        }

        let had_series = self.inner.store.unregister(channel);
        self.inner.ingestor.forget(channel);

        if !had_handle && !had_series {
            return Err(ControllerError::ChannelNotFound {
                channel: channel.to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Connection status of `channel`, or `None` if it was never connected.
    pub fn status(&self, channel: &ChannelId) -> Option<ConnectionStatus> {
        self.inner.handles.lock().get(channel).map(SubscriptionHandle::status)
    }

    /// Receiver for `channel`'s connection status changes.
    pub fn watch_status(&self, channel: &ChannelId) -> Option<watch::Receiver<ConnectionStatus>> {
        self.inner.handles.lock().get(channel).map(SubscriptionHandle::watch)
    }

    /// Newest reading of `channel`.
    pub fn latest(&self, channel: &ChannelId) -> Option<Reading> {
        self.inner.store.latest(channel)
    }

    /// Point-in-time copy of `channel`'s series.
    pub fn snapshot(&self, channel: &ChannelId) -> Vec<Reading> {
        self.inner.store.snapshot(channel)
    }

    /// Readings of `channel` with `from <= timestamp < to`.
    pub fn window(&self, channel: &ChannelId, from: u64, to: u64) -> Vec<Reading> {
        self.inner.store.window(channel, from, to)
    }

    /// Window query with coverage metadata.
    pub fn window_query(&self, channel: &ChannelId, from: u64, to: u64) -> WindowResult {
        self.inner.store.window_query(channel, from, to)
    }

    /// Live updates for `channel`.
    pub fn subscribe(&self, channel: &ChannelId) -> Subscription {
        self.publisher.subscribe(channel)
    }

    /// Snapshot of `channel` plus live updates from exactly that point.
    pub fn join(&self, channel: &ChannelId) -> (Vec<Reading>, Subscription) {
        self.publisher.join(channel)
    }

    /// Ingestion counters for `channel`.
    pub fn stats(&self, channel: &ChannelId) -> Option<IngestStats> {
        self.inner.ingestor.stats(channel)
    }

    /// Channels currently held by the store.
    pub fn channels(&self) -> Vec<ChannelId> {
        self.inner.store.channels()
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<SeriesStore> {
        &self.inner.store
    }

    /// The fan-out publisher.
    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    /// Runs one idle sweep immediately.
    ///
    /// Connected channels are never swept.
    pub fn sweep_idle(&self, now: Instant) -> Vec<ChannelId> {
        self.inner.sweep_idle(now)
    }

    /// Stops the sweeper and closes every subscription.
    pub async fn shutdown(mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
            let _ = sweeper.await;
        }

        let handles: Vec<SubscriptionHandle> = self.inner.handles.lock().drain().map(|(_, h)| h).collect();
        let count = handles.len();
        for handle in handles {
            handle.close().await;
        }
        tracing::info!(closed = count, "pipeline shut down");
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

fn spawn_sweeper(inner: Arc<Inner>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let evicted = inner.sweep_idle(Instant::now());
            for channel in evicted {
                tracing::debug!(%channel, "swept idle channel");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::controller::ConnectionState;
    use crate::error::TunnelError;
    use crate::source::MemoryFeed;
    use serde_json::json;

    fn channel() -> ChannelId {
        ChannelId::new("tunel1").unwrap()
    }

    #[tokio::test]
    async fn test_close_unknown_channel() {
        let pipeline = Pipeline::new(PipelineConfig::default(), Arc::new(MemoryFeed::new())).unwrap();
        let err = pipeline.close(&channel()).await.unwrap_err();
        assert!(matches!(
            err,
            TunnelError::Controller(ControllerError::ChannelNotFound { .. })
        ));
        assert!(pipeline.unregister(&channel()).await.is_err());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = PipelineConfig::default();
        config.store.max_readings = 0;
        assert!(matches!(
            Pipeline::new(config, Arc::new(MemoryFeed::new())),
            Err(TunnelError::Config(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_close_keeps_data() {
        let feed = MemoryFeed::new();
        let pipeline = Pipeline::new(PipelineConfig::default(), Arc::new(feed.clone())).unwrap();
        let t = channel();
        feed.put(&t, "a", json!({ "humidity": 50, "temperature": 20, "timestamp": 100 }));

        pipeline.connect(&t).unwrap();
        let mut status = pipeline.watch_status(&t).unwrap();
        status.wait_for(|s| s.state == ConnectionState::Live).await.unwrap();
        assert!(matches!(
            pipeline.connect(&t),
            Err(TunnelError::Controller(ControllerError::AlreadyConnected { .. }))
        ));

        pipeline.close(&t).await.unwrap();
        assert!(pipeline.status(&t).is_none());
        assert_eq!(pipeline.snapshot(&t).len(), 1);
        assert_eq!(feed.subscriber_count(&t), 0);

        pipeline.unregister(&t).await.unwrap();
        assert!(pipeline.latest(&t).is_none());
        assert!(pipeline.stats(&t).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_skips_connected_channels() {
        let config = PipelineConfig {
            store: StoreConfig {
                idle_timeout: Some(Duration::from_secs(60)),
                ..StoreConfig::default()
            },
            ..PipelineConfig::default()
        };
        let feed = MemoryFeed::new();
        let pipeline = Pipeline::new(config, Arc::new(feed.clone())).unwrap();
        let connected = channel();
        let idle = ChannelId::new("tunel2").unwrap();

        pipeline.connect(&connected).unwrap();
        pipeline.store().ensure_channel(&idle);

        let later = Instant::now() + Duration::from_secs(120);
        assert_eq!(pipeline.sweep_idle(later), vec![idle.clone()]);
        assert_eq!(pipeline.channels(), vec![connected]);

        pipeline.shutdown().await;
    }
}
