//! Ordered, bounded, de-duplicated series of readings for one channel.
//!
//! A [`ChannelSeries`] keeps readings sorted by `(timestamp, source_key)`
//! and never holds two readings with the same source key. It pairs two
//! structures that are always updated together:
//!
//! - `entries` - a shared `VecDeque` in series order; inserts use binary
//!   search, evictions pop from the front
//! - `index` - `source_key -> timestamp`, giving O(1) duplicate detection
//!   and locating an existing reading with one binary search
//!
//! # Bounds
//!
//! Two bounds apply after every batch, the tighter one winning:
//!
//! - a count bound (`max_readings`)
//! - an optional retention window in source time, measured back from the
//!   newest reading of the series
//!
//! # Upsert semantics
//!
//! | Incoming reading                          | Effect                         |
//! |-------------------------------------------|--------------------------------|
//! | unknown source key                        | inserted at its sorted position|
//! | known key, identical fields               | ignored, counted as duplicate  |
//! | known key, same timestamp, changed fields | replaced in place              |
//! | known key, new timestamp                  | removed and reinserted         |
//!
//! # Views
//!
//! Entries live behind an `Arc` and are copied on write. [`ChannelSeries::view`]
//! hands out a [`SeriesView`] in O(1), so a caller holding the series behind
//! a lock can release it before copying readings out.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::reading::Reading;

/// Result of applying one batch to a series.
///
/// `added` and `updated` hold the final version of each reading touched by
/// the batch, sorted in series order. A reading that was added and then
/// evicted inside the same batch appears nowhere.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InsertOutcome {
    /// Readings whose source key was not present before the batch.
    pub added: Vec<Reading>,
    /// Readings whose source key existed and whose fields changed.
    pub updated: Vec<Reading>,
    /// Previously visible readings removed by the bound policy.
    pub evicted: Vec<Reading>,
    /// Incoming readings identical to what the series already held.
    pub duplicates: usize,
}

impl InsertOutcome {
    /// Returns `true` if the batch changed nothing visible.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.evicted.is_empty()
    }

    /// Number of readings added or updated.
    pub fn changed_count(&self) -> usize {
        self.added.len() + self.updated.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Touch {
    Added,
    Updated,
}

/// Time-ordered bounded buffer of readings for a single channel.
#[derive(Debug, Clone)]
pub struct ChannelSeries {
    entries: Arc<VecDeque<Reading>>,
    index: HashMap<String, u64>,
    max_readings: usize,
    retention_ms: Option<u64>,
}

impl ChannelSeries {
    /// Creates an empty series with the given bounds.
    ///
    /// A `max_readings` of zero is treated as one.
    pub fn new(max_readings: usize, retention_ms: Option<u64>) -> Self {
        let max_readings = max_readings.max(1);
        Self {
            entries: Arc::new(VecDeque::with_capacity(max_readings.min(1024))),
            index: HashMap::new(),
            max_readings,
            retention_ms,
        }
    }

    /// Applies a batch of readings and then the bound policy.
    ///
    /// The batch is applied as a unit: callers holding the series behind a
    /// lock publish the returned outcome before any reader sees the result.
    pub fn insert_batch<I>(&mut self, readings: I) -> InsertOutcome
    where
        I: IntoIterator<Item = Reading>,
    {
        let mut touched: HashMap<String, Touch> = HashMap::new();
        let mut duplicates = 0;

        for reading in readings {
            match self.upsert(reading) {
                Upsert::Duplicate => duplicates += 1,
                Upsert::Added(key) => {
                    touched.entry(key).or_insert(Touch::Added);
                }
                Upsert::Updated(key) => {
                    touched.entry(key).or_insert(Touch::Updated);
                }
            }
        }

        let mut evicted = Vec::new();
        for reading in self.enforce_bounds() {
            match touched.remove(reading.source_key()) {
                // Never visible to anyone, nothing to report.
                Some(Touch::Added) => {}
                Some(Touch::Updated) | None => evicted.push(reading),
            }
        }

        let mut added = Vec::new();
        let mut updated = Vec::new();
        for (key, touch) in touched {
            let Some(reading) = self.get(&key).cloned() else {
                continue;
            };
            match touch {
                Touch::Added => added.push(reading),
                Touch::Updated => updated.push(reading),
            }
        }
        added.sort_by(Reading::cmp_order);
        updated.sort_by(Reading::cmp_order);

        InsertOutcome {
            added,
            updated,
            evicted,
            duplicates,
        }
    }

    /// Upserts a single reading without applying bounds.
    fn upsert(&mut self, reading: Reading) -> Upsert {
        let key = reading.source_key().to_string();

        let Some(&old_ts) = self.index.get(&key) else {
            let pos = self.insertion_point(&reading);
            self.index.insert(key.clone(), reading.timestamp());
            self.entries_mut().insert(pos, reading);
            return Upsert::Added(key);
        };

        let Some(pos) = self.position_of(old_ts, &key) else {
            // Index and entries disagree; repair by treating it as new.
            let pos = self.insertion_point(&reading);
            self.index.insert(key.clone(), reading.timestamp());
            self.entries_mut().insert(pos, reading);
            return Upsert::Added(key);
        };

        if self.entries[pos] == reading {
            return Upsert::Duplicate;
        }

        if old_ts == reading.timestamp() {
            self.entries_mut()[pos] = reading;
        } else {
            self.entries_mut().remove(pos);
            let new_pos = self.insertion_point(&reading);
            self.index.insert(key.clone(), reading.timestamp());
            self.entries_mut().insert(new_pos, reading);
        }

        Upsert::Updated(key)
    }

    /// Evicts readings that fall outside the count or retention bound.
    fn enforce_bounds(&mut self) -> Vec<Reading> {
        let mut evicted = Vec::new();

        while self.entries.len() > self.max_readings {
            if let Some(oldest) = self.pop_oldest() {
                evicted.push(oldest);
            }
        }

        if let (Some(retention), Some(newest)) = (self.retention_ms, self.newest_timestamp()) {
            let cutoff = newest.saturating_sub(retention);
            while self
                .entries
                .front()
                .is_some_and(|oldest| oldest.timestamp() < cutoff)
            {
                if let Some(oldest) = self.pop_oldest() {
                    evicted.push(oldest);
                }
            }
        }

        evicted
    }

    fn pop_oldest(&mut self) -> Option<Reading> {
        let oldest = self.entries_mut().pop_front()?;
        self.index.remove(oldest.source_key());
        Some(oldest)
    }

    /// Unshares the entries if a view still holds them.
    fn entries_mut(&mut self) -> &mut VecDeque<Reading> {
        Arc::make_mut(&mut self.entries)
    }

    fn insertion_point(&self, reading: &Reading) -> usize {
        let key = reading.order_key();
        self.entries.partition_point(|e| e.order_key() < key)
    }

    fn position_of(&self, timestamp: u64, source_key: &str) -> Option<usize> {
        self.entries
            .binary_search_by(|e| e.order_key().cmp(&(timestamp, source_key)))
            .ok()
    }

    /// Looks up a reading by source key.
    pub fn get(&self, source_key: &str) -> Option<&Reading> {
        let &ts = self.index.get(source_key)?;
        self.position_of(ts, source_key).map(|pos| &self.entries[pos])
    }

    /// The most recent reading, if any.
    pub fn latest(&self) -> Option<&Reading> {
        self.entries.back()
    }

    /// The oldest retained reading, if any.
    pub fn oldest(&self) -> Option<&Reading> {
        self.entries.front()
    }

    /// Timestamp of the newest reading.
    pub fn newest_timestamp(&self) -> Option<u64> {
        self.entries.back().map(Reading::timestamp)
    }

    /// Number of readings held.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the series holds no readings.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The count bound of this series.
    pub fn max_readings(&self) -> usize {
        self.max_readings
    }

    /// Point-in-time view of the entries, unaffected by later inserts.
    pub fn view(&self) -> SeriesView {
        SeriesView {
            entries: Arc::clone(&self.entries),
        }
    }

    /// Copies every reading in series order.
    pub fn to_vec(&self) -> Vec<Reading> {
        self.entries.iter().cloned().collect()
    }

    /// Copies readings with `from <= timestamp < to`, in series order.
    pub fn range(&self, from: u64, to: u64) -> Vec<Reading> {
        copy_range(&self.entries, from, to)
    }

    /// Iterates readings in series order.
    pub fn iter(&self) -> impl Iterator<Item = &Reading> {
        self.entries.iter()
    }
}

/// Frozen snapshot of a [`ChannelSeries`].
///
/// Cheap to take and to clone. Copying readings out of it needs no lock.
#[derive(Debug, Clone)]
pub struct SeriesView {
    entries: Arc<VecDeque<Reading>>,
}

impl SeriesView {
    /// Copies every reading in series order.
    pub fn to_vec(&self) -> Vec<Reading> {
        self.entries.iter().cloned().collect()
    }

    /// Copies readings with `from <= timestamp < to`, in series order.
    pub fn range(&self, from: u64, to: u64) -> Vec<Reading> {
        copy_range(&self.entries, from, to)
    }

    /// Timestamps of the oldest and newest readings.
    pub fn bounds(&self) -> (Option<u64>, Option<u64>) {
        (
            self.entries.front().map(Reading::timestamp),
            self.entries.back().map(Reading::timestamp),
        )
    }

    /// Number of readings in the view.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the view holds no readings.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn copy_range(entries: &VecDeque<Reading>, from: u64, to: u64) -> Vec<Reading> {
    if from >= to {
        return Vec::new();
    }
    let start = entries.partition_point(|e| e.timestamp() < from);
    let end = entries.partition_point(|e| e.timestamp() < to);
    entries.range(start..end).cloned().collect()
}

enum Upsert {
    Added(String),
    Updated(String),
    Duplicate,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::ChannelId;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn reading(key: &str, ts: u64, temp: f64, hum: f64) -> Reading {
        Reading::new(ChannelId::new("tunel1").unwrap(), key, ts, temp, hum).unwrap()
    }

    fn keys(series: &ChannelSeries) -> Vec<String> {
        series.iter().map(|r| r.source_key().to_string()).collect()
    }

    fn assert_sorted_unique(series: &ChannelSeries) {
        let entries: Vec<_> = series.iter().collect();
        for pair in entries.windows(2) {
            assert!(
                pair[0].order_key() < pair[1].order_key(),
                "series out of order: {:?} before {:?}",
                pair[0].order_key(),
                pair[1].order_key()
            );
        }
        assert_eq!(series.index.len(), series.len());
    }

    #[test]
    fn test_out_of_order_insert_is_sorted() {
        let mut series = ChannelSeries::new(100, None);
        let outcome = series.insert_batch([reading("a", 100, 20.0, 50.0), reading("b", 90, 19.0, 52.0)]);

        assert_eq!(keys(&series), vec!["b", "a"]);
        assert_eq!(series.latest().unwrap().source_key(), "a");
        assert_eq!(outcome.added.len(), 2);
        assert_eq!(outcome.added[0].source_key(), "b");
        assert!(outcome.updated.is_empty());
    }

    #[test]
    fn test_view_is_frozen_at_creation() {
        let mut series = ChannelSeries::new(3, None);
        series.insert_batch([reading("a", 10, 1.0, 1.0), reading("b", 20, 1.0, 1.0), reading("c", 30, 1.0, 1.0)]);

        let view = series.view();
        series.insert_batch([reading("d", 40, 1.0, 1.0), reading("b", 20, 9.0, 9.0)]);

        let frozen = view.to_vec();
        assert_eq!(frozen.iter().map(Reading::source_key).collect::<Vec<_>>(), ["a", "b", "c"]);
        assert_eq!(frozen[1].temperature(), 1.0);
        assert_eq!(view.bounds(), (Some(10), Some(30)));
        assert_eq!(view.range(15, 35).len(), 2);

        assert_eq!(keys(&series), vec!["b", "c", "d"]);
        assert_eq!(series.view().bounds(), (Some(20), Some(40)));
    }

    #[test]
    fn test_identical_reinsert_is_noop() {
        let mut series = ChannelSeries::new(100, None);
        series.insert_batch([reading("a", 100, 20.0, 50.0)]);
        let outcome = series.insert_batch([reading("a", 100, 20.0, 50.0)]);

        assert!(outcome.is_empty());
        assert_eq!(outcome.duplicates, 1);
        assert_eq!(series.len(), 1);
    }

    #[test]
    fn test_update_in_place() {
        let mut series = ChannelSeries::new(100, None);
        series.insert_batch([reading("a", 100, 20.0, 50.0), reading("b", 110, 20.0, 50.0)]);
        let outcome = series.insert_batch([reading("a", 100, 21.0, 48.0)]);

        assert_eq!(series.len(), 2);
        assert_eq!(keys(&series), vec!["a", "b"]);
        let a = series.get("a").unwrap();
        assert_eq!(a.temperature(), 21.0);
        assert_eq!(a.humidity(), 48.0);
        assert_eq!(outcome.updated, vec![reading("a", 100, 21.0, 48.0)]);
        assert!(outcome.added.is_empty());
    }

    #[test]
    fn test_timestamp_change_moves_reading() {
        let mut series = ChannelSeries::new(100, None);
        series.insert_batch([
            reading("a", 100, 1.0, 1.0),
            reading("b", 200, 1.0, 1.0),
            reading("c", 300, 1.0, 1.0),
        ]);

        series.insert_batch([reading("a", 250, 1.0, 1.0)]);

        assert_eq!(keys(&series), vec!["b", "a", "c"]);
        assert_eq!(series.len(), 3);
        assert_eq!(series.get("a").unwrap().timestamp(), 250);
        assert_sorted_unique(&series);
    }

    #[test]
    fn test_count_bound_evicts_oldest() {
        let mut series = ChannelSeries::new(3, None);
        series.insert_batch([
            reading("a", 10, 1.0, 1.0),
            reading("b", 20, 1.0, 1.0),
            reading("c", 30, 1.0, 1.0),
        ]);

        let outcome = series.insert_batch([reading("d", 40, 1.0, 1.0)]);

        assert_eq!(series.len(), 3);
        assert_eq!(keys(&series), vec!["b", "c", "d"]);
        assert_eq!(outcome.evicted, vec![reading("a", 10, 1.0, 1.0)]);
        assert!(series.get("a").is_none());
    }

    #[test]
    fn test_added_then_evicted_in_same_batch_is_not_reported() {
        let mut series = ChannelSeries::new(2, None);
        series.insert_batch([reading("b", 20, 1.0, 1.0), reading("c", 30, 1.0, 1.0)]);

        // Older than everything kept, so it falls straight off the front.
        let outcome = series.insert_batch([reading("a", 10, 1.0, 1.0)]);

        assert!(outcome.is_empty());
        assert_eq!(keys(&series), vec!["b", "c"]);
    }

    #[test]
    fn test_retention_window_evicts_by_source_time() {
        let mut series = ChannelSeries::new(100, Some(1_000));
        series.insert_batch([reading("a", 10_000, 1.0, 1.0), reading("b", 10_500, 1.0, 1.0)]);

        let outcome = series.insert_batch([reading("c", 11_200, 1.0, 1.0)]);

        assert_eq!(keys(&series), vec!["b", "c"]);
        assert_eq!(outcome.evicted.len(), 1);
        assert_eq!(outcome.evicted[0].source_key(), "a");
    }

    #[test]
    fn test_range_is_half_open() {
        let mut series = ChannelSeries::new(100, None);
        series.insert_batch((1..=10).map(|i| reading(&format!("k{i}"), i * 10, 1.0, 1.0)));

        let window = series.range(30, 60);
        let ts: Vec<u64> = window.iter().map(Reading::timestamp).collect();
        assert_eq!(ts, vec![30, 40, 50]);

        assert!(series.range(60, 30).is_empty());
        assert!(series.range(200, 300).is_empty());
    }

    #[test]
    fn test_random_inserts_stay_sorted_and_bounded() {
        let mut rng = StdRng::seed_from_u64(0x7e11);
        let mut series = ChannelSeries::new(64, None);

        for _ in 0..500 {
            let batch: Vec<Reading> = (0..rng.random_range(1..8))
                .map(|_| {
                    let key = format!("k{}", rng.random_range(0..200));
                    let ts = rng.random_range(1..10_000);
                    reading(&key, ts, f64::from(rng.random_range(-10..40)), 50.0)
                })
                .collect();

            series.insert_batch(batch);

            assert_sorted_unique(&series);
            assert!(series.len() <= 64);
            let max_ts = series.iter().map(Reading::timestamp).max();
            assert_eq!(series.latest().map(Reading::timestamp), max_ts);
        }
    }
}
