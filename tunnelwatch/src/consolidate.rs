//! Downsampling of a channel window into fixed-width time buckets.
//!
//! Chart redraws rarely need every raw reading. [`downsample`] groups an
//! ordered window into buckets aligned to multiples of the bucket width in
//! source time and aggregates temperature and humidity independently with a
//! [`ConsolidationFn`].
//!
//! ```text
//! readings:  |.. . ...|.   ....|     |..   .|
//! buckets:   [  t0    )[  t1   )     [  t3  )   (empty buckets are skipped)
//! ```
//!
//! # Example Usage
//!
//! ```rust
//! use std::time::Duration;
//! use tunnelwatch::consolidate::{downsample, ConsolidationFn};
//! use tunnelwatch::{ChannelId, Reading};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let t = ChannelId::new("tunel1")?;
//! let readings = vec![
//!     Reading::new(t.clone(), "a", 1_000, 20.0, 50.0)?,
//!     Reading::new(t.clone(), "b", 1_500, 22.0, 54.0)?,
//!     Reading::new(t.clone(), "c", 2_100, 25.0, 40.0)?,
//! ];
//!
//! let points = downsample(&readings, Duration::from_secs(1), ConsolidationFn::Average);
//! assert_eq!(points.len(), 2);
//! assert_eq!(points[0].temperature, 21.0);
//! assert_eq!(points[0].count, 2);
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::reading::Reading;

/// Aggregation applied to the readings of one bucket.
///
/// Non-finite inputs are ignored; readings are finite by construction, so
/// this only matters for values built by hand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConsolidationFn {
    /// Arithmetic mean.
    Average,

    /// Smallest value.
    Min,

    /// Largest value.
    Max,

    /// Value of the newest reading in the bucket.
    Last,
}

impl ConsolidationFn {
    /// Applies this function to `values` in series order.
    ///
    /// Returns NaN for an empty slice.
    ///
    /// ```rust
    /// use tunnelwatch::consolidate::ConsolidationFn;
    ///
    /// let values = [1.0, 2.0, f64::NAN, 4.0];
    /// assert!((ConsolidationFn::Average.apply(&values) - 7.0 / 3.0).abs() < 1e-10);
    /// assert_eq!(ConsolidationFn::Min.apply(&values), 1.0);
    /// assert_eq!(ConsolidationFn::Max.apply(&values), 4.0);
    /// assert_eq!(ConsolidationFn::Last.apply(&values), 4.0);
    /// ```
    #[allow(clippy::cast_precision_loss)] // bucket sizes are far below 2^52
    pub fn apply(self, values: &[f64]) -> f64 {
        let mut valid = values.iter().copied().filter(|v| v.is_finite());

        match self {
            Self::Average => {
                let (sum, count) = valid.fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
                if count == 0 { f64::NAN } else { sum / count as f64 }
            }
            Self::Min => valid.reduce(f64::min).unwrap_or(f64::NAN),
            Self::Max => valid.reduce(f64::max).unwrap_or(f64::NAN),
            Self::Last => valid.next_back().unwrap_or(f64::NAN),
        }
    }
}

/// One aggregated bucket.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BucketPoint {
    /// Inclusive bucket start in epoch milliseconds.
    pub start: u64,
    /// Exclusive bucket end in epoch milliseconds.
    pub end: u64,
    /// Aggregated temperature.
    pub temperature: f64,
    /// Aggregated humidity.
    pub humidity: f64,
    /// Number of readings that fell in the bucket.
    pub count: usize,
}

/// Buckets `readings` by source time and aggregates each bucket.
///
/// `readings` are expected in series order, as returned by
/// [`SeriesStore::window`](crate::store::SeriesStore::window). Buckets
/// without readings are omitted. A zero `bucket` width is treated as one
/// millisecond.
pub fn downsample(readings: &[Reading], bucket: Duration, consolidation_fn: ConsolidationFn) -> Vec<BucketPoint> {
    let width = u64::try_from(bucket.as_millis()).unwrap_or(u64::MAX).max(1);

    let mut points = Vec::new();
    let mut start_idx = 0;
    while start_idx < readings.len() {
        let start = (readings[start_idx].timestamp() / width) * width;
        let end = start.saturating_add(width);

        let len = readings[start_idx..]
            .iter()
            .take_while(|r| r.timestamp() < end)
            .count();
        let bucket = &readings[start_idx..start_idx + len];

        let temperatures: Vec<f64> = bucket.iter().map(Reading::temperature).collect();
        let humidities: Vec<f64> = bucket.iter().map(Reading::humidity).collect();
        points.push(BucketPoint {
            start,
            end,
            temperature: consolidation_fn.apply(&temperatures),
            humidity: consolidation_fn.apply(&humidities),
            count: len,
        });

        start_idx += len;
    }

    points
}
