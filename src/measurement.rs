//! Reading data types.
//!
//! A [`Reading`] is one timestamped three-axis sample plus its derived magnitude.
//! Readings are immutable once produced and the magnitude is always computed here,
//! never taken from input (files, clients or sources).

use chrono::{DateTime, DurationRound, SecondsFormat, TimeDelta, Utc};
use serde::{Deserialize, Serialize, Serializer};

/// Raw axis values as produced by a [`crate::hardware::ReadingSource`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisSample {
    /// X axis
    pub x: f64,
    /// Y axis
    pub y: f64,
    /// Z axis
    pub z: f64,
}

impl AxisSample {
    /// Create a sample from three axis values.
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

/// One immutable timestamped reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Reading {
    #[serde(serialize_with = "serialize_timestamp")]
    timestamp: DateTime<Utc>,
    x: f64,
    y: f64,
    z: f64,
    total: f64,
}

impl Reading {
    /// Build a reading. The timestamp is truncated to whole milliseconds, the
    /// resolution of the on-disk format, and `total` is derived from the axes.
    pub fn new(timestamp: DateTime<Utc>, sample: AxisSample) -> Self {
        let timestamp = truncate_to_millis(timestamp);
        Self {
            timestamp,
            x: sample.x,
            y: sample.y,
            z: sample.z,
            total: magnitude(sample.x, sample.y, sample.z),
        }
    }

    /// Wall-clock capture time (UTC, millisecond precision).
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// X axis value
    pub fn x(&self) -> f64 {
        self.x
    }

    /// Y axis value
    pub fn y(&self) -> f64 {
        self.y
    }

    /// Z axis value
    pub fn z(&self) -> f64 {
        self.z
    }

    /// Euclidean norm of the three axes.
    pub fn total(&self) -> f64 {
        self.total
    }

    /// The axis values without the derived magnitude.
    pub fn axes(&self) -> AxisSample {
        AxisSample::new(self.x, self.y, self.z)
    }

    /// Start of the wall-clock second this reading belongs to.
    pub fn second(&self) -> DateTime<Utc> {
        truncate_to_second(self.timestamp)
    }
}

/// Euclidean norm of three axis values.
pub fn magnitude(x: f64, y: f64, z: f64) -> f64 {
    (x * x + y * y + z * z).sqrt()
}

/// Drop sub-millisecond precision.
pub fn truncate_to_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(TimeDelta::milliseconds(1)).unwrap_or(ts)
}

/// Start of the second containing `ts`.
pub fn truncate_to_second(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(TimeDelta::seconds(1)).unwrap_or(ts)
}

/// ISO-8601 with exactly three fractional digits and a `Z` suffix,
/// e.g. `2025-01-01T14:30:22.123Z`.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse any RFC 3339 timestamp into UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|ts| ts.with_timezone(&Utc))
}

/// Serde adapter writing timestamps with [`format_timestamp`].
pub fn serialize_timestamp<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format_timestamp(*ts))
}
