//! Integration tests for the series store.
//!
//! These tests drive the public store API the way the ingestion side and
//! consumers do: ordering under out-of-order delivery, idempotent upserts,
//! the count bound, the latest-value cache, and atomicity of batches under
//! concurrent readers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tunnelwatch::{ChannelId, Reading, SeriesStore, StoreConfig};

fn channel() -> ChannelId {
    ChannelId::new("tunel1").unwrap()
}

fn reading(channel: &ChannelId, key: &str, ts: u64, temp: f64, hum: f64) -> Reading {
    Reading::new(channel.clone(), key, ts, temp, hum).unwrap()
}

fn keys(readings: &[Reading]) -> Vec<&str> {
    readings.iter().map(Reading::source_key).collect()
}

#[test]
fn test_out_of_order_pair() {
    let store = SeriesStore::new(StoreConfig::default());
    let t = channel();

    store.insert(
        &t,
        vec![reading(&t, "a", 100, 20.0, 50.0), reading(&t, "b", 90, 19.0, 52.0)],
    );

    let snapshot = store.snapshot(&t);
    assert_eq!(keys(&snapshot), ["b", "a"]);
    assert_eq!(snapshot[0].timestamp(), 90);
    assert_eq!(snapshot[1].timestamp(), 100);
    assert_eq!(store.latest(&t).unwrap().source_key(), "a");
}

#[test]
fn test_same_key_new_fields_replaces() {
    let store = SeriesStore::new(StoreConfig::default());
    let t = channel();

    store.insert(&t, vec![reading(&t, "a", 100, 20.0, 50.0)]);
    let outcome = store.insert(&t, vec![reading(&t, "a", 100, 21.0, 48.0)]);

    let snapshot = store.snapshot(&t);
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].temperature(), 21.0);
    assert_eq!(snapshot[0].humidity(), 48.0);
    assert_eq!(outcome.updated.len(), 1);
    assert!(outcome.added.is_empty());
}

#[test]
fn test_identical_reinsert_is_noop() {
    let store = SeriesStore::new(StoreConfig::default());
    let t = channel();

    store.insert(&t, vec![reading(&t, "a", 100, 20.0, 50.0)]);
    let seq = store.seq(&t);
    let outcome = store.insert(&t, vec![reading(&t, "a", 100, 20.0, 50.0)]);

    assert!(outcome.is_empty());
    assert_eq!(outcome.duplicates, 1);
    assert_eq!(store.len(&t), 1);
    assert_eq!(store.seq(&t), seq);
}

#[test]
fn test_timestamp_change_moves_once() {
    let store = SeriesStore::new(StoreConfig::default());
    let t = channel();
    store.insert(
        &t,
        vec![
            reading(&t, "a", 10, 1.0, 1.0),
            reading(&t, "b", 20, 1.0, 1.0),
            reading(&t, "c", 30, 1.0, 1.0),
        ],
    );

    store.insert(&t, vec![reading(&t, "a", 40, 1.0, 1.0)]);

    let snapshot = store.snapshot(&t);
    assert_eq!(keys(&snapshot), ["b", "c", "a"]);
    assert_eq!(store.latest(&t).unwrap().source_key(), "a");
}

#[test]
fn test_bound_evicts_exactly_the_oldest() {
    let bound = 5;
    let store = SeriesStore::new(StoreConfig {
        max_readings: bound,
        ..StoreConfig::default()
    });
    let t = channel();

    let readings: Vec<Reading> = (1..=bound as u64)
        .map(|i| reading(&t, &format!("k{i}"), i * 10, 1.0, 1.0))
        .collect();
    store.insert(&t, readings);
    assert_eq!(store.len(&t), bound);

    let outcome = store.insert(&t, vec![reading(&t, "k6", 60, 1.0, 1.0)]);

    assert_eq!(keys(&outcome.evicted), ["k1"]);
    let snapshot = store.snapshot(&t);
    assert_eq!(snapshot.len(), bound);
    assert_eq!(snapshot[0].source_key(), "k2");
}

#[test]
fn test_retention_bound_by_source_time() {
    let store = SeriesStore::new(StoreConfig {
        retention: Some(Duration::from_secs(60)),
        ..StoreConfig::default()
    });
    let t = channel();

    store.insert(
        &t,
        vec![
            reading(&t, "old", 1_000, 1.0, 1.0),
            reading(&t, "mid", 40_000, 1.0, 1.0),
        ],
    );
    store.insert(&t, vec![reading(&t, "new", 70_000, 1.0, 1.0)]);

    assert_eq!(keys(&store.snapshot(&t)), ["mid", "new"]);
}

#[test]
fn test_window_and_unknown_channel() {
    let store = SeriesStore::new(StoreConfig::default());
    let t = channel();
    store.insert(
        &t,
        (1..=10).map(|i| reading(&t, &format!("k{i}"), i * 100, 1.0, 1.0)).collect(),
    );

    let window = store.window(&t, 250, 600);
    let ts: Vec<u64> = window.iter().map(Reading::timestamp).collect();
    assert_eq!(ts, vec![300, 400, 500]);

    let unknown = ChannelId::new("nope").unwrap();
    assert!(store.latest(&unknown).is_none());
    assert!(store.snapshot(&unknown).is_empty());
    assert!(store.window(&unknown, 0, u64::MAX).is_empty());
    assert!(!store.contains(&unknown));
}

#[test]
fn test_snapshot_is_a_copy() {
    let store = SeriesStore::new(StoreConfig::default());
    let t = channel();
    store.insert(&t, vec![reading(&t, "a", 100, 20.0, 50.0)]);

    let before = store.snapshot(&t);
    store.insert(&t, vec![reading(&t, "a", 100, 30.0, 50.0), reading(&t, "b", 200, 1.0, 1.0)]);

    assert_eq!(before.len(), 1);
    assert_eq!(before[0].temperature(), 20.0);
}

#[test]
fn test_readers_never_see_partial_batches() {
    const BATCH: u64 = 10;
    const BATCHES: u64 = 200;

    let store = SeriesStore::new(StoreConfig {
        max_readings: 100_000,
        ..StoreConfig::default()
    });
    let t = channel();
    let done = AtomicBool::new(false);

    std::thread::scope(|s| {
        s.spawn(|| {
            for b in 0..BATCHES {
                let batch: Vec<Reading> = (0..BATCH)
                    .rev()
                    .map(|i| {
                        let n = b * BATCH + i;
                        reading(&t, &format!("k{n}"), 1 + n, 1.0, 1.0)
                    })
                    .collect();
                store.insert(&t, batch);
            }
            done.store(true, Ordering::Release);
        });

        for _ in 0..2 {
            s.spawn(|| {
                while !done.load(Ordering::Acquire) {
                    let snapshot = store.snapshot(&t);
                    assert_eq!(snapshot.len() as u64 % BATCH, 0, "observed a partial batch");
                    for pair in snapshot.windows(2) {
                        assert!(pair[0].order_key() < pair[1].order_key());
                    }
                    if let Some(tail) = snapshot.last() {
                        // Series only grows here, so the cache can only be ahead.
                        assert!(store.latest(&t).unwrap().timestamp() >= tail.timestamp());
                    }
                }
            });
        }
    });

    assert_eq!(store.len(&t), (BATCH * BATCHES) as usize);
    assert_eq!(store.latest(&t).unwrap().timestamp(), BATCH * BATCHES);
}

#[test]
fn test_channels_write_independently() {
    let store = SeriesStore::new(StoreConfig::default());
    let channels: Vec<ChannelId> = (0..4).map(|i| ChannelId::new(format!("tunel{i}")).unwrap()).collect();

    std::thread::scope(|s| {
        for ch in &channels {
            let store = &store;
            s.spawn(move || {
                for i in 1..=500u64 {
                    store.insert(ch, vec![reading(ch, &format!("k{i}"), i, 1.0, 1.0)]);
                }
            });
        }
    });

    for ch in &channels {
        assert_eq!(store.len(ch), 500);
        assert_eq!(store.seq(ch), 500);
        assert_eq!(store.latest(ch).unwrap().timestamp(), 500);
    }
}
