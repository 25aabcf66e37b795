//! Series store: the single source of truth for every channel's readings.
//!
//! The store maps each [`ChannelId`] to a slot holding that channel's
//! [`ChannelSeries`], its commit sequence, and its fan-out queue. Channels
//! are created lazily on first use and destroyed by [`SeriesStore::unregister`]
//! or the idle sweep.
//!
//! # Design
//!
//! - Writes to one channel are serialized by the slot's write lock; writes
//!   to different channels never contend beyond a brief map lookup.
//! - An insert, the latest-value refresh, and the fan-out publish all
//!   happen inside one write critical section, so readers never observe a
//!   partially applied batch and subscribers see commits in order.
//! - Reads (`snapshot`, `window`) take an O(1) [`SeriesView`] under the
//!   read lock and copy after releasing it, so a large copy never holds up
//!   the writer. `latest` reads a per-channel cache cell.
//!
//! # Example Usage
//!
//! ```rust
//! use tunnelwatch::{ChannelId, Reading, SeriesStore, StoreConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = SeriesStore::new(StoreConfig::default());
//! let channel = ChannelId::new("tunel1")?;
//!
//! let outcome = store.insert(&channel, vec![
//!     Reading::new(channel.clone(), "a", 100, 20.0, 50.0)?,
//!     Reading::new(channel.clone(), "b", 90, 19.0, 52.0)?,
//! ]);
//! assert_eq!(outcome.added.len(), 2);
//!
//! let keys: Vec<_> = store.snapshot(&channel).iter().map(|r| r.source_key().to_string()).collect();
//! assert_eq!(keys, ["b", "a"]);
//! assert_eq!(store.latest(&channel).unwrap().source_key(), "a");
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::config::StoreConfig;
use crate::fanout::{ChannelEvent, Fanout, Update};
use crate::latest::LatestCache;
use crate::query::WindowResult;
use crate::reading::{ChannelId, Reading};
use crate::series::{ChannelSeries, InsertOutcome, SeriesView};

/// Per-channel storage slot.
#[derive(Debug)]
struct ChannelSlot {
    state: RwLock<SlotState>,
    fanout: Fanout,
}

#[derive(Debug)]
struct SlotState {
    series: ChannelSeries,
    seq: u64,
    last_insert: Instant,
    /// Set once the slot is unlinked from the map; writers must retry.
    removed: bool,
}

impl ChannelSlot {
    fn new(config: &StoreConfig) -> Self {
        Self {
            state: RwLock::new(SlotState {
                series: ChannelSeries::new(config.max_readings, config.retention_ms()),
                seq: 0,
                last_insert: Instant::now(),
                removed: false,
            }),
            fanout: Fanout::new(config.subscriber_buffer),
        }
    }
}

/// Time-ordered, bounded reading store for many channels.
///
/// # Thread Safety
///
/// `SeriesStore` is `Send + Sync` and is meant to be shared behind an
/// `Arc` between the ingestion tasks and any number of readers.
#[derive(Debug)]
pub struct SeriesStore {
    config: StoreConfig,
    channels: RwLock<HashMap<ChannelId, Arc<ChannelSlot>>>,
    latest: LatestCache,
}

impl SeriesStore {
    /// Creates an empty store.
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            channels: RwLock::new(HashMap::new()),
            latest: LatestCache::new(),
        }
    }

    /// Returns the store configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Upserts a batch of readings into `channel`.
    ///
    /// Readings are de-duplicated by source key, kept sorted by
    /// `(timestamp, source_key)`, and bounded per the store config. If the
    /// batch changed anything, the change is published to subscribers
    /// before the write lock is released.
    ///
    /// Readings whose own channel id differs from `channel` are skipped.
    pub fn insert(&self, channel: &ChannelId, readings: Vec<Reading>) -> InsertOutcome {
        let (readings, foreign): (Vec<_>, Vec<_>) =
            readings.into_iter().partition(|r| r.channel_id() == channel);
        if !foreign.is_empty() {
            tracing::warn!(%channel, skipped = foreign.len(), "readings addressed to another channel");
        }

        loop {
            let slot = self.slot_or_create(channel);
            let mut state = slot.state.write();
            if state.removed {
                // Unregistered between lookup and lock; retry on a fresh slot.
                continue;
            }

            let outcome = state.series.insert_batch(readings);
            state.last_insert = Instant::now();

            if !outcome.is_empty() {
                state.seq += 1;
                let latest = state.series.latest().cloned();
                let latest_changed = self.latest.refresh(channel, latest.as_ref());

                slot.fanout.publish(ChannelEvent::Committed(Arc::new(Update {
                    channel: channel.clone(),
                    seq: state.seq,
                    added: outcome.added.clone(),
                    updated: outcome.updated.clone(),
                    evicted: outcome.evicted.clone(),
                    latest,
                    latest_changed,
                })));

                tracing::trace!(
                    %channel,
                    seq = state.seq,
                    added = outcome.added.len(),
                    updated = outcome.updated.len(),
                    evicted = outcome.evicted.len(),
                    "committed"
                );
            }

            return outcome;
        }
    }

    /// Creates `channel` with an empty series if it does not exist yet.
    pub fn ensure_channel(&self, channel: &ChannelId) {
        self.slot_or_create(channel);
    }

    /// Returns the newest reading of `channel` in O(1).
    ///
    /// `None` for unknown or empty channels.
    pub fn latest(&self, channel: &ChannelId) -> Option<Reading> {
        self.latest.get(channel)
    }

    /// Returns a point-in-time copy of `channel`'s series in order.
    ///
    /// Unknown channels yield an empty vector.
    pub fn snapshot(&self, channel: &ChannelId) -> Vec<Reading> {
        self.view(channel).map(|view| view.to_vec()).unwrap_or_default()
    }

    /// Returns readings of `channel` with `from <= timestamp < to`.
    pub fn window(&self, channel: &ChannelId, from: u64, to: u64) -> Vec<Reading> {
        self.view(channel).map(|view| view.range(from, to)).unwrap_or_default()
    }

    /// Like [`SeriesStore::window`], with coverage metadata.
    pub fn window_query(&self, channel: &ChannelId, from: u64, to: u64) -> WindowResult {
        let Some(view) = self.view(channel) else {
            return WindowResult::new(Vec::new(), (from, to), (None, None));
        };
        WindowResult::new(view.range(from, to), (from, to), view.bounds())
    }

    /// Point-in-time view of `channel`'s series, or `None` if unknown.
    ///
    /// Holds the channel's read lock only long enough to clone an `Arc`.
    pub fn view(&self, channel: &ChannelId) -> Option<SeriesView> {
        self.slot(channel).map(|slot| slot.state.read().series.view())
    }

    /// Number of readings held for `channel`.
    pub fn len(&self, channel: &ChannelId) -> usize {
        self.slot(channel)
            .map(|slot| slot.state.read().series.len())
            .unwrap_or(0)
    }

    /// Current commit sequence of `channel` (0 before the first commit).
    pub fn seq(&self, channel: &ChannelId) -> u64 {
        self.slot(channel).map(|slot| slot.state.read().seq).unwrap_or(0)
    }

    /// Returns `true` if `channel` is registered.
    pub fn contains(&self, channel: &ChannelId) -> bool {
        self.channels.read().contains_key(channel)
    }

    /// Lists registered channels, sorted by name.
    pub fn channels(&self) -> Vec<ChannelId> {
        let mut channels: Vec<_> = self.channels.read().keys().cloned().collect();
        channels.sort();
        channels
    }

    /// Destroys `channel` and its series.
    ///
    /// Subscribers receive a removal notice. Returns `false` if the channel
    /// was not registered.
    pub fn unregister(&self, channel: &ChannelId) -> bool {
        let mut channels = self.channels.write();
        let Some(slot) = channels.remove(channel) else {
            return false;
        };
        self.retire(channel, &slot);
        drop(channels);

        tracing::info!(%channel, "channel unregistered");
        true
    }

    /// Removes channels with no insert for longer than the configured idle
    /// timeout and no live subscribers.
    ///
    /// Returns the removed channels. Does nothing if no idle timeout is set.
    pub fn evict_idle(&self, now: Instant) -> Vec<ChannelId> {
        self.evict_idle_except(now, &HashSet::new())
    }

    /// Like [`SeriesStore::evict_idle`], never touching channels in `pinned`.
    pub fn evict_idle_except(&self, now: Instant, pinned: &HashSet<ChannelId>) -> Vec<ChannelId> {
        let Some(idle_timeout) = self.config.idle_timeout else {
            return Vec::new();
        };

        let mut channels = self.channels.write();
        let idle: Vec<ChannelId> = channels
            .iter()
            .filter(|(channel, slot)| {
                !pinned.contains(*channel)
                    && slot.fanout.subscriber_count() == 0
                    && now.saturating_duration_since(slot.state.read().last_insert) >= idle_timeout
            })
            .map(|(channel, _)| channel.clone())
            .collect();

        for channel in &idle {
            if let Some(slot) = channels.remove(channel) {
                self.retire(channel, &slot);
            }
        }
        drop(channels);

        if !idle.is_empty() {
            tracing::info!(count = idle.len(), "evicted idle channels");
        }
        idle
    }

    /// Returns the idle timeout, if configured.
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.config.idle_timeout
    }

    /// Snapshots `channel` (optionally) and registers a receiver under the
    /// same read lock, so no commit falls between them.
    pub(crate) fn attach(
        &self,
        channel: &ChannelId,
        with_snapshot: bool,
    ) -> (Vec<Reading>, u64, broadcast::Receiver<ChannelEvent>) {
        let (view, seq, receiver) = loop {
            let slot = self.slot_or_create(channel);
            let state = slot.state.read();
            if state.removed {
                continue;
            }
            let view = with_snapshot.then(|| state.series.view());
            break (view, state.seq, slot.fanout.subscribe());
        };
        (view.map(|v| v.to_vec()).unwrap_or_default(), seq, receiver)
    }

    pub(crate) fn subscriber_count(&self, channel: &ChannelId) -> usize {
        self.slot(channel)
            .map(|slot| slot.fanout.subscriber_count())
            .unwrap_or(0)
    }

    /// Marks an unlinked slot as removed and notifies its subscribers.
    fn retire(&self, channel: &ChannelId, slot: &ChannelSlot) {
        let mut state = slot.state.write();
        state.removed = true;
        self.latest.remove(channel);
        slot.fanout.publish(ChannelEvent::Removed);
    }

    fn slot(&self, channel: &ChannelId) -> Option<Arc<ChannelSlot>> {
        self.channels.read().get(channel).cloned()
    }

    fn slot_or_create(&self, channel: &ChannelId) -> Arc<ChannelSlot> {
        if let Some(slot) = self.slot(channel) {
            return slot;
        }

        let mut channels = self.channels.write();
        Arc::clone(channels.entry(channel.clone()).or_insert_with(|| {
            tracing::debug!(%channel, "channel created");
            Arc::new(ChannelSlot::new(&self.config))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(name: &str) -> ChannelId {
        ChannelId::new(name).unwrap()
    }

    fn reading(channel: &ChannelId, key: &str, ts: u64, temp: f64, hum: f64) -> Reading {
        Reading::new(channel.clone(), key, ts, temp, hum).unwrap()
    }

    #[test]
    fn test_latest_matches_snapshot_tail() {
        let store = SeriesStore::new(StoreConfig::default());
        let t = channel("tunel1");

        assert!(store.latest(&t).is_none());
        assert!(store.snapshot(&t).is_empty());

        store.insert(&t, vec![reading(&t, "a", 100, 20.0, 50.0), reading(&t, "b", 90, 19.0, 52.0)]);
        let snapshot = store.snapshot(&t);
        assert_eq!(store.latest(&t).as_ref(), snapshot.last());

        store.insert(&t, vec![reading(&t, "a", 80, 20.0, 50.0)]);
        let snapshot = store.snapshot(&t);
        assert_eq!(snapshot.last().unwrap().source_key(), "b");
        assert_eq!(store.latest(&t).as_ref(), snapshot.last());
    }

    #[test]
    fn test_channels_are_independent() {
        let store = SeriesStore::new(StoreConfig::default());
        let t1 = channel("tunel1");
        let t2 = channel("tunel2");

        store.insert(&t1, vec![reading(&t1, "a", 100, 20.0, 50.0)]);
        store.insert(&t2, vec![reading(&t2, "a", 200, 10.0, 40.0)]);

        assert_eq!(store.len(&t1), 1);
        assert_eq!(store.latest(&t2).unwrap().timestamp(), 200);
        assert_eq!(store.channels(), vec![t1, t2]);
    }

    #[test]
    fn test_foreign_readings_are_skipped() {
        let store = SeriesStore::new(StoreConfig::default());
        let t1 = channel("tunel1");
        let t2 = channel("tunel2");

        let outcome = store.insert(&t1, vec![reading(&t2, "a", 100, 20.0, 50.0)]);
        assert!(outcome.is_empty());
        assert_eq!(store.len(&t1), 0);
    }

    #[test]
    fn test_seq_only_advances_on_change() {
        let store = SeriesStore::new(StoreConfig::default());
        let t = channel("tunel1");

        store.insert(&t, vec![reading(&t, "a", 100, 20.0, 50.0)]);
        store.insert(&t, vec![reading(&t, "a", 100, 20.0, 50.0)]);
        assert_eq!(store.seq(&t), 1);

        store.insert(&t, vec![reading(&t, "a", 100, 21.0, 50.0)]);
        assert_eq!(store.seq(&t), 2);
    }

    #[test]
    fn test_unregister_destroys_series() {
        let store = SeriesStore::new(StoreConfig::default());
        let t = channel("tunel1");
        store.insert(&t, vec![reading(&t, "a", 100, 20.0, 50.0)]);

        assert!(store.unregister(&t));
        assert!(!store.contains(&t));
        assert!(store.latest(&t).is_none());
        assert!(store.snapshot(&t).is_empty());
        assert!(!store.unregister(&t));

        // Inserting again recreates it lazily.
        store.insert(&t, vec![reading(&t, "b", 200, 20.0, 50.0)]);
        assert_eq!(store.len(&t), 1);
    }

    #[test]
    fn test_evict_idle() {
        let store = SeriesStore::new(StoreConfig {
            idle_timeout: Some(Duration::from_secs(60)),
            ..StoreConfig::default()
        });
        let t = channel("tunel1");
        store.insert(&t, vec![reading(&t, "a", 100, 20.0, 50.0)]);

        assert!(store.evict_idle(Instant::now()).is_empty());

        let later = Instant::now() + Duration::from_secs(61);
        let pinned = HashSet::from([t.clone()]);
        assert!(store.evict_idle_except(later, &pinned).is_empty());
        assert_eq!(store.evict_idle(later), vec![t.clone()]);
        assert!(!store.contains(&t));
    }

    #[test]
    fn test_writer_proceeds_while_view_is_copied() {
        let store = SeriesStore::new(StoreConfig::default());
        let t = channel("tunel1");
        store.insert(
            &t,
            (1..=1_000).map(|i| reading(&t, &format!("k{i}"), i, 20.0, 50.0)).collect(),
        );

        let view = store.view(&t).unwrap();
        std::thread::scope(|s| {
            let copier = s.spawn(|| view.to_vec());
            // Taking the write lock must not wait for the copy above.
            store.insert(&t, vec![reading(&t, "late", 5_000, 21.0, 50.0)]);
            assert_eq!(copier.join().unwrap().len(), 1_000);
        });

        assert_eq!(view.len(), 1_000);
        assert_eq!(store.len(&t), 1_001);
        assert_eq!(store.latest(&t).unwrap().source_key(), "late");
    }

    #[test]
    fn test_window_query_reports_coverage() {
        let store = SeriesStore::new(StoreConfig::default());
        let t = channel("tunel1");
        store.insert(
            &t,
            (1..=5).map(|i| reading(&t, &format!("k{i}"), i * 100, 20.0, 50.0)).collect(),
        );

        let result = store.window_query(&t, 50, 350);
        assert_eq!(result.len(), 3);
        assert!(result.may_be_incomplete());
        assert_eq!(result.available_range(), (Some(100), Some(500)));

        let result = store.window_query(&t, 200, 400);
        assert!(!result.may_be_incomplete());

        let unknown = store.window_query(&channel("nope"), 0, 10);
        assert!(unknown.is_empty());
        assert_eq!(unknown.available_range(), (None, None));
    }
}
