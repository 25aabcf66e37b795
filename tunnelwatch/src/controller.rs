//! Connection lifecycle for one channel's feed subscription.
//!
//! ```text
//!               connect()                first snapshot
//! Disconnected ----------> Connecting -------------------> Live
//!      ^                       |                          |  ^
//!      | close()               | error                    |  | snapshot (backfill first)
//!      |                       v          error / stall   v  |
//!  (any state)              Retrying <----------------------+
//!                              |
//!                              | retry budget exhausted
//!                              v
//!                            Failed  (connect() again to recover)
//! ```
//!
//! Transport errors never leave this module; they only move the state
//! machine. Consumers observe the state through a `watch` channel and see a
//! terminal `Failed` only once the retry budget is spent.
//!
//! # Backfill
//!
//! When a subscription comes back from `Retrying`, the controller first asks
//! the source for everything between the newest reading it saw and now. If
//! the source has no range queries, the first full snapshot after the
//! reconnect reconciles through the store's idempotent insert instead.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::backoff::Backoff;
use crate::config::RetryConfig;
use crate::error::{ControllerError, TransportError};
use crate::ingest::Ingestor;
use crate::reading::ChannelId;
use crate::source::{FeedSource, FeedSubscription, RawSnapshot};

/// Connection state of a channel subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionState {
    /// Not running. Initial state, and the state after `close()`.
    Disconnected,
    /// Waiting for the first snapshot.
    Connecting,
    /// Receiving snapshots.
    Live,
    /// Lost the feed; waiting out a backoff delay before reconnecting.
    Retrying,
    /// Retry budget exhausted. Requires a manual `connect()`.
    Failed,
}

/// Observable status of a channel subscription.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStatus {
    /// Current state.
    pub state: ConnectionState,
    /// Newest source timestamp ingested, in epoch milliseconds.
    pub last_seen: Option<u64>,
    /// Reconnect attempts in the current outage.
    pub retry_count: u32,
    /// Last transport error, kept until the next successful snapshot.
    pub last_error: Option<String>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            last_seen: None,
            retry_count: 0,
            last_error: None,
        }
    }
}

/// Owns the feed subscription of one channel and drives its state machine.
///
/// Dropping the handle aborts the background task.
#[derive(Debug)]
pub struct SubscriptionHandle {
    worker: Arc<Worker>,
    task: Option<JoinHandle<()>>,
}

impl SubscriptionHandle {
    /// Creates a disconnected handle.
    pub fn new(
        channel: ChannelId,
        source: Arc<dyn FeedSource>,
        ingestor: Arc<Ingestor>,
        retry: RetryConfig,
    ) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::default());
        Self {
            worker: Arc::new(Worker {
                channel,
                source,
                ingestor,
                retry,
                status,
            }),
            task: None,
        }
    }

    /// The channel this handle serves.
    pub fn channel(&self) -> &ChannelId {
        &self.worker.channel
    }

    /// Current status.
    pub fn status(&self) -> ConnectionStatus {
        self.worker.status.borrow().clone()
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.worker.status.borrow().state
    }

    /// Returns a receiver notified on every status change.
    pub fn watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.worker.status.subscribe()
    }

    /// Returns the terminal failure, if the handle is in `Failed`.
    pub fn failure(&self) -> Option<ControllerError> {
        let status = self.worker.status.borrow();
        (status.state == ConnectionState::Failed).then(|| ControllerError::Failed {
            channel: self.worker.channel.to_string(),
            attempts: status.retry_count,
        })
    }

    /// Starts the subscription.
    ///
    /// Valid from `Disconnected` and `Failed`.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::AlreadyConnected`] if the subscription is
    /// already running.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn connect(&mut self) -> Result<(), ControllerError> {
        if self.task.as_ref().is_some_and(|task| !task.is_finished()) {
            return Err(ControllerError::AlreadyConnected {
                channel: self.worker.channel.to_string(),
            });
        }

        self.worker.status.send_modify(|status| {
            status.state = ConnectionState::Connecting;
            status.retry_count = 0;
        });
        tracing::debug!(channel = %self.worker.channel, source = self.worker.source.description(), "connecting");

        let worker = Arc::clone(&self.worker);
        self.task = Some(tokio::spawn(async move { worker.run().await }));
        Ok(())
    }

    /// Stops the subscription and releases the feed.
    ///
    /// When this returns, the background task has finished and the feed
    /// subscription is dropped.
    pub async fn close(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
        self.worker.set_state(ConnectionState::Disconnected);
        tracing::info!(channel = %self.worker.channel, "disconnected");
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[derive(Debug)]
struct Worker {
    channel: ChannelId,
    source: Arc<dyn FeedSource>,
    ingestor: Arc<Ingestor>,
    retry: RetryConfig,
    status: watch::Sender<ConnectionStatus>,
}

impl Worker {
    async fn run(&self) {
        let mut backoff = Backoff::new(&self.retry);

        loop {
            let error = match self.source.subscribe(&self.channel).await {
                Ok(mut feed) => self.stream(&mut feed, &mut backoff).await,
                Err(error) => error,
            };

            let attempts = self.status.borrow().retry_count;
            if attempts >= self.retry.max_retries {
                self.status.send_modify(|status| {
                    status.state = ConnectionState::Failed;
                    status.last_error = Some(error.to_string());
                });
                tracing::error!(channel = %self.channel, attempts, %error, "feed failed, retry budget exhausted");
                return;
            }

            let delay = backoff.next_delay();
            self.status.send_modify(|status| {
                status.state = ConnectionState::Retrying;
                status.retry_count = attempts + 1;
                status.last_error = Some(error.to_string());
            });
            tracing::warn!(
                channel = %self.channel,
                attempt = attempts + 1,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                %error,
                "feed lost, retrying"
            );

            tokio::time::sleep(delay).await;
        }
    }

    /// Consumes snapshots until the feed is lost; returns why.
    async fn stream(&self, feed: &mut FeedSubscription, backoff: &mut Backoff) -> TransportError {
        let mut live = false;

        loop {
            let snapshot = match self.next_item(feed).await {
                Ok(snapshot) => snapshot,
                Err(error) => return error,
            };

            if !live {
                if self.state() == ConnectionState::Retrying {
                    self.backfill().await;
                }
                live = true;
            }

            self.ingestor.ingest(&self.channel, &snapshot);
            let last_seen = self.ingestor.store().latest(&self.channel).map(|r| r.timestamp());

            let became_live = self.state() != ConnectionState::Live;
            self.status.send_modify(|status| {
                status.state = ConnectionState::Live;
                status.retry_count = 0;
                status.last_error = None;
                if last_seen.is_some() {
                    status.last_seen = last_seen;
                }
            });
            if became_live {
                backoff.reset();
                tracing::info!(channel = %self.channel, "live");
            }
        }
    }

    async fn next_item(&self, feed: &mut FeedSubscription) -> Result<RawSnapshot, TransportError> {
        let item = match self.retry.stall_timeout {
            Some(stall) => tokio::time::timeout(stall, feed.next())
                .await
                .map_err(|_| TransportError::Stalled {
                    channel: self.channel.to_string(),
                    elapsed: stall,
                })?,
            None => feed.next().await,
        };

        item.unwrap_or_else(|| {
            Err(TransportError::Closed {
                channel: self.channel.to_string(),
            })
        })
    }

    /// Fetches what was missed during the outage, when the source can.
    async fn backfill(&self) {
        let Some(from) = self.status.borrow().last_seen else {
            return;
        };
        let to = now_millis();

        match self.source.fetch_range(&self.channel, from, to).await {
            Ok(Some(missed)) => {
                let report = self.ingestor.ingest(&self.channel, &missed);
                tracing::info!(
                    channel = %self.channel,
                    from,
                    to,
                    recovered = report.outcome.added.len(),
                    "backfilled outage window"
                );
            }
            Ok(None) => {
                tracing::debug!(channel = %self.channel, "no range queries, reconciling from snapshot");
            }
            Err(error) => {
                tracing::warn!(channel = %self.channel, %error, "backfill failed, reconciling from snapshot");
            }
        }
    }

    fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    fn set_state(&self, state: ConnectionState) {
        self.status.send_modify(|status| status.state = state);
    }
}

/// Wall-clock time in epoch milliseconds.
fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}
