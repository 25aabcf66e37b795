//! Integration tests for reconnection and backfill.
//!
//! Drives a full pipeline over the in-memory feed with injected outages:
//! Live -> Retrying -> Live must leave no gaps in the store, retry delays
//! must be non-decreasing up to the cap, and an exhausted retry budget must
//! surface as `Failed`.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;
use tunnelwatch::config::{PipelineConfig, RetryConfig};
use tunnelwatch::source::MemoryFeed;
use tunnelwatch::{ChannelId, ConnectionState, Pipeline, Reading};

fn config(max_retries: u32) -> PipelineConfig {
    PipelineConfig {
        retry: RetryConfig {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            jitter: 0.5,
            max_retries,
            stall_timeout: None,
        },
        ..PipelineConfig::default()
    }
}

fn record(ts: u64, temp: f64) -> serde_json::Value {
    json!({ "humidity": 50, "temperature": temp, "timestamp": ts, "tunnelId": 1 })
}

async fn wait_for(pipeline: &Pipeline, channel: &ChannelId, state: ConnectionState) {
    let mut status = pipeline.watch_status(channel).unwrap();
    status.wait_for(|s| s.state == state).await.unwrap();
}

async fn outage_round_trip(feed: MemoryFeed) -> (Pipeline, ChannelId) {
    let pipeline = Pipeline::new(config(10), Arc::new(feed.clone())).unwrap();
    let t = ChannelId::new("tunel1").unwrap();

    feed.put(&t, "a", record(1_000, 20.0));
    pipeline.connect(&t).unwrap();
    wait_for(&pipeline, &t, ConnectionState::Live).await;
    assert_eq!(pipeline.status(&t).unwrap().last_seen, Some(1_000));

    feed.set_available(false);
    wait_for(&pipeline, &t, ConnectionState::Retrying).await;

    // Upstream keeps recording while we are cut off.
    feed.put(&t, "b", record(2_000, 21.0));
    feed.put(&t, "c", record(3_000, 22.0));
    assert_eq!(pipeline.snapshot(&t).len(), 1);

    feed.set_available(true);
    wait_for(&pipeline, &t, ConnectionState::Live).await;

    (pipeline, t)
}

#[tokio::test(start_paused = true)]
async fn test_outage_leaves_no_gap_with_range_backfill() {
    let feed = MemoryFeed::new().with_range_queries();
    let (pipeline, t) = outage_round_trip(feed).await;

    let keys: Vec<String> = pipeline
        .snapshot(&t)
        .iter()
        .map(|r| r.source_key().to_string())
        .collect();
    assert_eq!(keys, ["a", "b", "c"]);

    let status = pipeline.status(&t).unwrap();
    assert_eq!(status.retry_count, 0);
    assert_eq!(status.last_seen, Some(3_000));
    assert!(status.last_error.is_none());

    // Initial snapshot, backfill window, first snapshot after reconnect.
    assert_eq!(pipeline.stats(&t).unwrap().snapshots, 3);

    pipeline.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_outage_leaves_no_gap_with_snapshot_reconcile() {
    let feed = MemoryFeed::new();
    let (pipeline, t) = outage_round_trip(feed).await;

    let ts: Vec<u64> = pipeline.snapshot(&t).iter().map(Reading::timestamp).collect();
    assert_eq!(ts, vec![1_000, 2_000, 3_000]);
    assert_eq!(pipeline.latest(&t).unwrap().temperature(), 22.0);
    assert_eq!(pipeline.stats(&t).unwrap().snapshots, 2);

    pipeline.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_consumer_sees_outage_readings_after_reconnect() {
    let feed = MemoryFeed::new();
    let pipeline = Pipeline::new(config(10), Arc::new(feed.clone())).unwrap();
    let t = ChannelId::new("tunel1").unwrap();
    let mut updates = pipeline.subscribe(&t);

    pipeline.connect(&t).unwrap();
    feed.put(&t, "a", record(1_000, 20.0));
    wait_for(&pipeline, &t, ConnectionState::Live).await;
    let first = updates.recv().await.unwrap();
    assert_eq!(first.added.len(), 1);

    feed.disconnect(&t);
    wait_for(&pipeline, &t, ConnectionState::Retrying).await;
    feed.put(&t, "b", record(2_000, 21.0));
    wait_for(&pipeline, &t, ConnectionState::Live).await;

    let update = updates.recv().await.unwrap();
    assert_eq!(update.seq, first.seq + 1);
    assert_eq!(update.added[0].source_key(), "b");
    assert!(update.latest_changed);

    pipeline.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_retry_delays_non_decreasing_until_failed() {
    let feed = MemoryFeed::new();
    feed.set_available(false);
    let pipeline = Pipeline::new(config(8), Arc::new(feed.clone())).unwrap();
    let t = ChannelId::new("tunel1").unwrap();

    pipeline.connect(&t).unwrap();
    let mut status = pipeline.watch_status(&t).unwrap();

    let mut attempts_at = Vec::new();
    loop {
        status.changed().await.unwrap();
        let current = status.borrow_and_update().clone();
        match current.state {
            ConnectionState::Retrying => attempts_at.push(Instant::now()),
            ConnectionState::Failed => {
                attempts_at.push(Instant::now());
                break;
            }
            _ => {}
        }
    }

    let delays: Vec<Duration> = attempts_at.windows(2).map(|w| w[1] - w[0]).collect();
    assert_eq!(delays.len(), 8);
    for pair in delays.windows(2) {
        assert!(pair[0] <= pair[1], "delays decreased: {delays:?}");
    }
    assert!(delays.iter().all(|d| *d <= Duration::from_secs(2)));
    assert_eq!(*delays.last().unwrap(), Duration::from_secs(2));

    let status = pipeline.status(&t).unwrap();
    assert_eq!(status.state, ConnectionState::Failed);
    assert_eq!(status.retry_count, 8);

    // Failed is terminal until a manual connect.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(pipeline.status(&t).unwrap().state, ConnectionState::Failed);

    feed.set_available(true);
    pipeline.connect(&t).unwrap();
    wait_for(&pipeline, &t, ConnectionState::Live).await;

    pipeline.shutdown().await;
}
