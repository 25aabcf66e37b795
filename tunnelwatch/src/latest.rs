//! Latest-value cache: O(1) access to the newest reading of each channel.
//!
//! The cache is a derived view over the series store. The store refreshes
//! a channel's entry inside the same critical section that commits an
//! insert, so the cached value always equals the tail of the series that
//! readers can observe. It holds no truth of its own.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::reading::{ChannelId, Reading};

type Cell = Arc<RwLock<Option<Reading>>>;

/// Newest reading per channel.
///
/// Each channel has its own cell. The outer map is only write-locked when a
/// channel first appears or is removed, so commits on different channels
/// never wait on each other here.
#[derive(Debug, Default)]
pub struct LatestCache {
    cells: RwLock<HashMap<ChannelId, Cell>>,
}

impl LatestCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the newest reading of `channel`, or `None` for unknown or
    /// empty channels.
    pub fn get(&self, channel: &ChannelId) -> Option<Reading> {
        self.cells.read().get(channel).and_then(|cell| cell.read().clone())
    }

    /// Recomputes the entry for `channel` from the series tail.
    ///
    /// Returns `true` if the cached value changed.
    pub(crate) fn refresh(&self, channel: &ChannelId, tail: Option<&Reading>) -> bool {
        let cell = match (self.cell(channel), tail) {
            (Some(cell), _) => cell,
            (None, None) => return false,
            (None, Some(_)) => Arc::clone(self.cells.write().entry(channel.clone()).or_default()),
        };

        let mut value = cell.write();
        if value.as_ref() == tail {
            return false;
        }
        *value = tail.cloned();
        true
    }

    /// Drops the entry for `channel`.
    pub(crate) fn remove(&self, channel: &ChannelId) {
        self.cells.write().remove(channel);
    }

    /// Number of channels with a cached reading.
    pub fn len(&self) -> usize {
        self.cells.read().values().filter(|cell| cell.read().is_some()).count()
    }

    /// Returns `true` if no channel has a reading.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cell(&self, channel: &ChannelId) -> Option<Cell> {
        self.cells.read().get(channel).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(key: &str, ts: u64) -> Reading {
        Reading::new(ChannelId::new("t").unwrap(), key, ts, 20.0, 50.0).unwrap()
    }

    #[test]
    fn test_refresh_reports_changes() {
        let cache = LatestCache::new();
        let channel = ChannelId::new("t").unwrap();

        assert!(cache.get(&channel).is_none());
        assert!(cache.refresh(&channel, Some(&reading("a", 10))));
        assert!(!cache.refresh(&channel, Some(&reading("a", 10))));
        assert!(cache.refresh(&channel, Some(&reading("b", 20))));
        assert_eq!(cache.get(&channel).unwrap().source_key(), "b");

        assert!(cache.refresh(&channel, None));
        assert!(cache.is_empty());
        assert!(!cache.refresh(&ChannelId::new("other").unwrap(), None));
    }

    #[test]
    fn test_channels_refresh_concurrently() {
        let cache = LatestCache::new();
        let channels: Vec<ChannelId> = (0..4).map(|i| ChannelId::new(format!("t{i}")).unwrap()).collect();

        std::thread::scope(|s| {
            for channel in &channels {
                let cache = &cache;
                s.spawn(move || {
                    for ts in 1..=200u64 {
                        let r = Reading::new(channel.clone(), format!("k{ts}"), ts, 20.0, 50.0).unwrap();
                        assert!(cache.refresh(channel, Some(&r)));
                    }
                });
            }
        });

        assert_eq!(cache.len(), 4);
        for channel in &channels {
            assert_eq!(cache.get(channel).unwrap().timestamp(), 200);
        }
        cache.remove(&channels[0]);
        assert!(cache.get(&channels[0]).is_none());
        assert_eq!(cache.get(&channels[1]).unwrap().timestamp(), 200);
    }
}
