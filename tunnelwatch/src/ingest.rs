//! Snapshot ingestion: raw keyed records in, ordered batches into the store.
//!
//! For every snapshot the [`Ingestor`]:
//!
//! 1. parses each entry into a [`Reading`], counting and logging entries
//!    that fail validation instead of failing the snapshot
//! 2. sorts the valid readings by `(timestamp, source_key)`
//! 3. inserts them into the [`SeriesStore`] as one batch
//!
//! An empty or `null` snapshot registers the channel and leaves whatever
//! history the store already holds untouched. Keys missing from a later
//! snapshot are not deletions.
//!
//! Full-snapshot feeds resend every record on every change, so the
//! ingestor remembers which source keys are currently failing validation.
//! A bad record is counted and logged once, and again only if its
//! rejection reason changes or it recovers and breaks again.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;
use serde::Serialize;

use crate::error::ReadingError;
use crate::reading::{ChannelId, Reading};
use crate::series::InsertOutcome;
use crate::source::RawSnapshot;
use crate::store::SeriesStore;

/// Per-channel ingestion counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    /// Snapshots processed.
    pub snapshots: u64,
    /// Readings that were new or changed in the store.
    pub accepted: u64,
    /// Distinct malformed records; a record resent unchanged counts once.
    pub rejected: u64,
    /// Wall-clock time of the last processed snapshot.
    pub last_ingest: Option<SystemTime>,
}

/// A record that failed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    /// Upstream key of the record.
    pub key: String,
    /// Why it was rejected.
    pub error: ReadingError,
}

/// Result of ingesting one snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestReport {
    /// Number of records that parsed into readings.
    pub accepted: usize,
    /// Records dropped by validation.
    pub rejected: Vec<Rejection>,
    /// How many of `rejected` were not already known to be failing.
    pub newly_rejected: usize,
    /// What the store did with the accepted readings.
    pub outcome: InsertOutcome,
}

/// Parses every entry of `snapshot` for `channel`.
///
/// Returns the valid readings sorted in series order, and the rejections.
pub fn parse_snapshot(channel: &ChannelId, snapshot: &RawSnapshot) -> (Vec<Reading>, Vec<Rejection>) {
    let mut readings = Vec::with_capacity(snapshot.len());
    let mut rejected = Vec::new();

    for (key, record) in snapshot.entries() {
        match Reading::from_record(channel, key, record) {
            Ok(reading) => readings.push(reading),
            Err(error) => rejected.push(Rejection {
                key: key.to_string(),
                error,
            }),
        }
    }

    readings.sort_by(Reading::cmp_order);
    (readings, rejected)
}

#[derive(Debug, Default)]
struct ChannelLedger {
    stats: IngestStats,
    /// Source keys currently failing validation, with the last reason.
    failing: HashMap<String, ReadingError>,
}

impl ChannelLedger {
    /// Records which keys of a snapshot fail; returns those not already
    /// failing for the same reason.
    fn note<'a>(&mut self, readings: &[Reading], rejected: &'a [Rejection]) -> Vec<&'a Rejection> {
        if !self.failing.is_empty() {
            for reading in readings {
                self.failing.remove(reading.source_key());
            }
        }

        rejected
            .iter()
            .filter(|r| {
                let fresh = self.failing.get(&r.key) != Some(&r.error);
                if fresh {
                    self.failing.insert(r.key.clone(), r.error.clone());
                }
                fresh
            })
            .collect()
    }
}

/// Normalizes snapshots into the series store.
#[derive(Debug)]
pub struct Ingestor {
    store: Arc<SeriesStore>,
    ledgers: RwLock<HashMap<ChannelId, ChannelLedger>>,
}

impl Ingestor {
    /// Creates an ingestor writing into `store`.
    pub fn new(store: Arc<SeriesStore>) -> Self {
        Self {
            store,
            ledgers: RwLock::new(HashMap::new()),
        }
    }

    /// The store this ingestor writes to.
    pub fn store(&self) -> &Arc<SeriesStore> {
        &self.store
    }

    /// Ingests one snapshot for `channel`.
    pub fn ingest(&self, channel: &ChannelId, snapshot: &RawSnapshot) -> IngestReport {
        let (readings, rejected) = parse_snapshot(channel, snapshot);

        let newly_rejected = {
            let mut ledgers = self.ledgers.write();
            let ledger = ledgers.entry(channel.clone()).or_default();
            let fresh = ledger.note(&readings, &rejected);
            for rejection in &fresh {
                tracing::warn!(%channel, key = %rejection.key, error = %rejection.error, "rejected record");
            }
            ledger.stats.rejected += fresh.len() as u64;
            fresh.len()
        };

        let accepted = readings.len();
        let outcome = if readings.is_empty() {
            self.store.ensure_channel(channel);
            InsertOutcome::default()
        } else {
            self.store.insert(channel, readings)
        };

        {
            let mut ledgers = self.ledgers.write();
            let stats = &mut ledgers.entry(channel.clone()).or_default().stats;
            stats.snapshots += 1;
            stats.accepted += outcome.changed_count() as u64;
            stats.last_ingest = Some(SystemTime::now());
        }

        tracing::debug!(
            %channel,
            records = snapshot.len(),
            accepted,
            rejected = rejected.len(),
            added = outcome.added.len(),
            updated = outcome.updated.len(),
            evicted = outcome.evicted.len(),
            "ingested snapshot"
        );

        IngestReport {
            accepted,
            rejected,
            newly_rejected,
            outcome,
        }
    }

    /// Counters for `channel`, or `None` if nothing was ingested for it.
    pub fn stats(&self, channel: &ChannelId) -> Option<IngestStats> {
        self.ledgers.read().get(channel).map(|ledger| ledger.stats.clone())
    }

    /// Drops the counters and failing-key memory for `channel`.
    pub fn forget(&self, channel: &ChannelId) {
        self.ledgers.write().remove(channel);
    }
}
