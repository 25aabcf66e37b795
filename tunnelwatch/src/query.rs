//! Range query results with coverage metadata.
//!
//! [`SeriesStore::window`](crate::store::SeriesStore::window) returns plain
//! readings. [`SeriesStore::window_query`](crate::store::SeriesStore::window_query)
//! wraps the same readings in a [`WindowResult`] that also reports what the
//! store actually holds, so a chart redraw or a backfill can tell "no data
//! happened" apart from "data aged out of the bounded window".
//!
//! # Example Usage
//!
//! ```rust
//! use tunnelwatch::{ChannelId, Reading, SeriesStore, StoreConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = SeriesStore::new(StoreConfig::default());
//! let channel = ChannelId::new("tunel1")?;
//! store.insert(&channel, vec![Reading::new(channel.clone(), "a", 5_000, 20.0, 50.0)?]);
//!
//! let result = store.window_query(&channel, 1_000, 10_000);
//! if result.may_be_incomplete() {
//!     println!("requested start predates retained history");
//! }
//! assert_eq!(result.len(), 1);
//! # Ok(())
//! # }
//! ```

use serde::Serialize;

use crate::reading::Reading;

/// How far back a channel's retained history reaches relative to a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Coverage {
    /// The channel held no readings.
    NoData,
    /// The query starts before the oldest retained reading; earlier
    /// readings may have been evicted or never received.
    StartsBeforeHistory,
    /// Retained history reaches the query start. Ending after the newest
    /// reading is normal for live queries and does not count as a gap.
    Covered,
}

impl Coverage {
    /// Classifies the query `[from, to)` against the `(oldest, newest)`
    /// timestamps a channel holds.
    pub fn classify(held: (Option<u64>, Option<u64>), from: u64, to: u64) -> Self {
        if from >= to {
            return Self::Covered;
        }
        match held.0 {
            None => Self::NoData,
            Some(oldest) if from < oldest => Self::StartsBeforeHistory,
            Some(_) => Self::Covered,
        }
    }
}

/// Result of a window query over one channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowResult {
    readings: Vec<Reading>,
    requested_range: (u64, u64),
    available_range: (Option<u64>, Option<u64>),
    coverage: Coverage,
}

impl WindowResult {
    /// Creates a window result for `requested_range` from the readings found
    /// and the `(oldest, newest)` timestamps the channel held.
    pub fn new(
        readings: Vec<Reading>,
        requested_range: (u64, u64),
        available_range: (Option<u64>, Option<u64>),
    ) -> Self {
        Self {
            coverage: Coverage::classify(available_range, requested_range.0, requested_range.1),
            readings,
            requested_range,
            available_range,
        }
    }

    /// The readings in series order.
    pub fn readings(&self) -> &[Reading] {
        &self.readings
    }

    /// Consumes the result, returning the readings.
    pub fn into_readings(self) -> Vec<Reading> {
        self.readings
    }

    /// Returns the `(from, to)` range that was requested.
    pub fn requested_range(&self) -> (u64, u64) {
        self.requested_range
    }

    /// Returns the `(oldest, newest)` timestamps the channel held.
    ///
    /// Either value is `None` if the channel was empty or unknown.
    pub fn available_range(&self) -> (Option<u64>, Option<u64>) {
        self.available_range
    }

    /// How the retained history relates to the requested range.
    pub fn coverage(&self) -> Coverage {
        self.coverage
    }

    /// Returns `true` unless retained history reaches the requested start.
    pub fn may_be_incomplete(&self) -> bool {
        self.coverage != Coverage::Covered
    }

    /// Number of readings in the result.
    pub fn len(&self) -> usize {
        self.readings.len()
    }

    /// Returns `true` if the result holds no readings.
    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }
}

impl IntoIterator for WindowResult {
    type Item = Reading;
    type IntoIter = std::vec::IntoIter<Reading>;

    fn into_iter(self) -> Self::IntoIter {
        self.readings.into_iter()
    }
}
