//! Error types for the tunnelwatch telemetry cache.
//!
//! Errors are grouped by the boundary they belong to. Reading and transport
//! errors are handled inside the ingestion pipeline and never reach
//! consumers; the remaining families are returned to the owning caller.

use std::time::Duration;

use thiserror::Error;

/// The main error type for all tunnelwatch operations.
#[derive(Error, Debug)]
pub enum TunnelError {
    /// A raw record could not be turned into a [`Reading`](crate::Reading).
    #[error("invalid reading: {0}")]
    Reading(#[from] ReadingError),

    /// The upstream feed failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Configuration was rejected during validation or loading.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// A connection lifecycle operation failed.
    #[error("controller error: {0}")]
    Controller(#[from] ControllerError),

    /// A fan-out subscription ended.
    #[error("subscription error: {0}")]
    Subscription(#[from] SubscriptionError),
}

/// Errors produced while validating a raw record into a reading.
///
/// These are counted and dropped by the ingestor; they are never fatal to
/// the pipeline.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReadingError {
    /// The record under `key` was not a key/value object.
    #[error("record '{key}' is not an object")]
    NotAnObject {
        /// The upstream key of the offending record.
        key: String,
    },

    /// A required field was absent or null.
    #[error("missing field '{field}'")]
    MissingField {
        /// Name of the missing field.
        field: &'static str,
    },

    /// A field could not be coerced to a number.
    #[error("field '{field}' is not numeric: {value}")]
    NonNumeric {
        /// Name of the field.
        field: &'static str,
        /// The raw value as rendered JSON.
        value: String,
    },

    /// A field coerced to NaN or infinity.
    #[error("field '{field}' is not finite")]
    NonFinite {
        /// Name of the field.
        field: &'static str,
    },

    /// The timestamp was zero or negative.
    #[error("timestamp must be positive, got {value}")]
    NonPositiveTimestamp {
        /// The offending timestamp.
        value: f64,
    },

    /// The channel identifier was empty.
    #[error("channel id is empty")]
    EmptyChannelId,

    /// The upstream source key was empty.
    #[error("source key is empty")]
    EmptySourceKey,
}

/// Errors raised by a feed transport.
///
/// These drive the connection state machine and are never surfaced to
/// consumers directly.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The subscription could not be established.
    #[error("failed to connect to '{endpoint}': {reason}")]
    Connect {
        /// Human-readable endpoint description.
        endpoint: String,
        /// Why the connection failed.
        reason: String,
    },

    /// The upstream closed the subscription.
    #[error("subscription for channel '{channel}' closed by upstream")]
    Closed {
        /// The channel whose stream ended.
        channel: String,
    },

    /// No snapshot arrived within the stall timeout.
    #[error("no data from channel '{channel}' for {elapsed:?}")]
    Stalled {
        /// The stalled channel.
        channel: String,
        /// How long the stream was silent.
        elapsed: Duration,
    },

    /// The upstream payload was not a valid snapshot document.
    #[error("failed to decode snapshot: {source}")]
    Decode {
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// The upstream is temporarily unavailable.
    #[error("feed unavailable: {reason}")]
    Unavailable {
        /// Description of the outage.
        reason: String,
    },

    /// HTTP request failed.
    #[cfg(feature = "http-poll")]
    #[error("HTTP request failed: {source}")]
    Http {
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },

    /// The feed's base URL is not usable.
    #[cfg(feature = "http-poll")]
    #[error("invalid feed URL '{url}': {reason}")]
    InvalidUrl {
        /// The URL as given.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Server returned a non-2xx status.
    #[cfg(feature = "http-poll")]
    #[error("server returned status {status}")]
    HttpStatus {
        /// The HTTP status code.
        status: u16,
    },
}

/// Errors that can occur during configuration validation or loading.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A configured value is outside its valid range.
    #[error("invalid value for '{field}': {reason}")]
    InvalidValue {
        /// The configuration field.
        field: &'static str,
        /// Why the value is invalid.
        reason: String,
    },

    /// The configuration file could not be read.
    #[error("failed to read config '{}': {source}", path.display())]
    Read {
        /// Path of the config file.
        path: std::path::PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid JSON for the config schema.
    #[error("failed to parse config '{}': {source}", path.display())]
    Parse {
        /// Path of the config file.
        path: std::path::PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

/// Errors returned by connection lifecycle operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControllerError {
    /// `connect()` was called while the subscription is already running.
    #[error("channel '{channel}' is already connected")]
    AlreadyConnected {
        /// The channel.
        channel: String,
    },

    /// The channel has no registered subscription.
    #[error("channel '{channel}' not found")]
    ChannelNotFound {
        /// The channel.
        channel: String,
    },

    /// The retry budget was exhausted; a manual `connect()` is required.
    #[error("channel '{channel}' failed after {attempts} attempts")]
    Failed {
        /// The channel.
        channel: String,
        /// Number of reconnection attempts made.
        attempts: u32,
    },
}

/// Reasons a consumer subscription stopped delivering updates.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    /// The consumer fell too far behind and was dropped.
    #[error("subscriber dropped after missing {missed} updates")]
    Overloaded {
        /// Number of updates the consumer missed.
        missed: u64,
    },

    /// The channel was unregistered or evicted for idleness.
    #[error("channel was removed")]
    ChannelRemoved,

    /// The subscription was already finished.
    #[error("subscription closed")]
    Closed,
}

/// Type alias for `Result<T, TunnelError>`.
pub type Result<T> = std::result::Result<T, TunnelError>;
