//! # tunnelwatch
//!
//! Real-time telemetry ingestion and windowed-series cache.
//!
//! tunnelwatch subscribes to a push- or poll-based upstream feed per sensor
//! channel (one tunnel), normalizes the raw keyed records into validated
//! temperature/humidity readings, and keeps a bounded, time-ordered series
//! per channel that any number of consumers can query or follow live.
//!
//! **Status**: This crate is in early development. The API is not yet stable.
//!
//! ## Key Properties
//!
//! - Out-of-order and duplicate delivery is absorbed: the series is always
//!   sorted by `(timestamp, source_key)` and upserts are idempotent
//! - Bounded memory per channel, by count and by source-time retention
//! - Readers never block writers and never see a half-applied batch
//! - Slow consumers are dropped with a notice instead of stalling ingestion
//! - Reconnects back off exponentially and backfill the outage window
//!
//! ## Quick Start
//!
//! ```rust
//! use tunnelwatch::{ChannelId, Reading, SeriesStore, StoreConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = SeriesStore::new(StoreConfig::default());
//! let tunnel = ChannelId::new("tunel1")?;
//!
//! store.insert(&tunnel, vec![
//!     Reading::new(tunnel.clone(), "a", 100, 20.0, 50.0)?,
//!     Reading::new(tunnel.clone(), "b", 90, 19.0, 52.0)?,
//! ]);
//!
//! let timestamps: Vec<u64> = store.snapshot(&tunnel).iter().map(Reading::timestamp).collect();
//! assert_eq!(timestamps, [90, 100]);
//! assert_eq!(store.latest(&tunnel).unwrap().source_key(), "a");
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`Reading`] — One validated sample; built from raw records
//! - [`SeriesStore`] — Per-channel ordered, bounded series; single source of truth
//! - [`Publisher`] — Fan-out of committed changes with atomic snapshot-then-follow
//! - [`SubscriptionHandle`] — Per-channel feed connection state machine
//! - [`Pipeline`] — Everything above wired to one [`FeedSource`]
//!
//! ## Modules
//!
//! - [`reading`] — Reading model and raw field coercion
//! - [`series`] — One channel's ordered series and bound policy
//! - [`store`] — Multi-channel store, locking, commit sequencing
//! - [`latest`] — O(1) newest-reading cache
//! - [`query`] — Window results with coverage metadata
//! - [`consolidate`] — Downsampling of windows for chart redraw
//! - [`fanout`] — Consumer subscriptions
//! - [`source`] — Feed transports
//! - [`ingest`] — Snapshot parsing and ingestion counters
//! - [`backoff`] — Jittered exponential reconnect delays
//! - [`controller`] — Connection lifecycle and backfill
//! - [`pipeline`] — The assembled pipeline
//! - [`config`] — Configuration
//! - [`error`] — Error types

pub mod backoff;
pub mod config;
pub mod consolidate;
pub mod controller;
pub mod error;
pub mod fanout;
pub mod ingest;
pub mod latest;
pub mod pipeline;
pub mod query;
pub mod reading;
pub mod series;
pub mod source;
pub mod store;

// Re-export primary API types at crate root for convenience.
pub use config::{PipelineConfig, RetryConfig, StoreConfig};
pub use controller::{ConnectionState, ConnectionStatus, SubscriptionHandle};
pub use error::{Result, TunnelError};
pub use fanout::{Publisher, Subscription, Update};
pub use ingest::{IngestReport, IngestStats, Ingestor};
pub use pipeline::Pipeline;
pub use query::{Coverage, WindowResult};
pub use reading::{ChannelId, Reading};
pub use source::{FeedSource, RawSnapshot};
pub use store::SeriesStore;
