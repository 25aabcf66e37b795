//! The reading model: one validated temperature/humidity sample.
//!
//! Readings are immutable once constructed. The only way to build one is
//! through [`Reading::new`] or [`Reading::from_record`], both of which
//! enforce the validation rules below:
//!
//! - `channel_id` and `source_key` must be non-empty
//! - `timestamp` must be present and strictly positive (epoch milliseconds)
//! - `temperature` and `humidity` must be numeric and finite
//!
//! Raw upstream records are untyped JSON objects. Numeric fields may arrive
//! as JSON numbers or as numeric strings; anything else is rejected.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::ReadingError;

/// Identifier of a logical sensor channel (one tunnel).
///
/// Cheap to clone; the underlying string is shared.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(Arc<str>);

impl ChannelId {
    /// Creates a channel id, rejecting empty or whitespace-only names.
    ///
    /// # Errors
    ///
    /// Returns [`ReadingError::EmptyChannelId`] if `name` is blank.
    pub fn new(name: impl AsRef<str>) -> Result<Self, ReadingError> {
        let name = name.as_ref().trim();
        if name.is_empty() {
            return Err(ReadingError::EmptyChannelId);
        }
        Ok(Self(Arc::from(name)))
    }

    /// Returns the channel name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl AsRef<str> for ChannelId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Serialize for ChannelId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ChannelId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Self::new(name).map_err(serde::de::Error::custom)
    }
}

/// One timestamped sample from a channel.
///
/// Serializable for consumers; deserialization goes through
/// [`Reading::from_record`] so the invariants always hold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    channel_id: ChannelId,
    timestamp: u64,
    temperature: f64,
    humidity: f64,
    source_key: String,
}

impl Reading {
    /// Creates a validated reading.
    ///
    /// `timestamp` is source time in milliseconds since the Unix epoch.
    ///
    /// # Errors
    ///
    /// Returns [`ReadingError`] if any validation rule fails.
    pub fn new(
        channel_id: ChannelId,
        source_key: impl Into<String>,
        timestamp: u64,
        temperature: f64,
        humidity: f64,
    ) -> Result<Self, ReadingError> {
        let source_key = source_key.into();
        if source_key.trim().is_empty() {
            return Err(ReadingError::EmptySourceKey);
        }
        if timestamp == 0 {
            return Err(ReadingError::NonPositiveTimestamp { value: 0.0 });
        }
        if !temperature.is_finite() {
            return Err(ReadingError::NonFinite {
                field: "temperature",
            });
        }
        if !humidity.is_finite() {
            return Err(ReadingError::NonFinite { field: "humidity" });
        }

        Ok(Self {
            channel_id,
            timestamp,
            temperature,
            humidity,
            source_key,
        })
    }

    /// Parses one entry of an upstream snapshot.
    ///
    /// `key` is the upstream-assigned record key and becomes the reading's
    /// source key. The record's own channel field, if any, is ignored: the
    /// subscribed channel is authoritative.
    ///
    /// # Errors
    ///
    /// Returns [`ReadingError`] if the record is not an object or any field
    /// fails validation.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)] // validated positive and finite
    pub fn from_record(channel_id: &ChannelId, key: &str, record: &Value) -> Result<Self, ReadingError> {
        let fields = record.as_object().ok_or_else(|| ReadingError::NotAnObject {
            key: key.to_string(),
        })?;

        let timestamp = coerce_field(fields.get("timestamp"), "timestamp")?;
        if timestamp < 1.0 {
            return Err(ReadingError::NonPositiveTimestamp { value: timestamp });
        }
        let temperature = coerce_field(fields.get("temperature"), "temperature")?;
        let humidity = coerce_field(fields.get("humidity"), "humidity")?;

        Self::new(
            channel_id.clone(),
            key,
            timestamp.trunc() as u64,
            temperature,
            humidity,
        )
    }

    /// The channel this reading belongs to.
    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    /// Source timestamp in epoch milliseconds.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Temperature in degrees Celsius.
    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    /// Relative humidity, conventionally 0-100.
    pub fn humidity(&self) -> f64 {
        self.humidity
    }

    /// Upstream-assigned unique key within the channel.
    pub fn source_key(&self) -> &str {
        &self.source_key
    }

    /// Total order used by the series: timestamp, then source key.
    pub fn order_key(&self) -> (u64, &str) {
        (self.timestamp, &self.source_key)
    }

    /// Compares two readings by series order.
    pub fn cmp_order(&self, other: &Self) -> Ordering {
        self.order_key().cmp(&other.order_key())
    }
}

/// Coerces a raw JSON field into a finite number.
///
/// Accepts JSON numbers and numeric strings. Null or absent values are
/// reported as missing.
fn coerce_field(value: Option<&Value>, field: &'static str) -> Result<f64, ReadingError> {
    let number = match value {
        None | Some(Value::Null) => return Err(ReadingError::MissingField { field }),
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        Some(_) => None,
    };

    let number = number.ok_or_else(|| ReadingError::NonNumeric {
        field,
        value: value.map(Value::to_string).unwrap_or_default(),
    })?;

    if !number.is_finite() {
        return Err(ReadingError::NonFinite { field });
    }

    Ok(number)
}
