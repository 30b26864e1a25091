//! Per-second reading accumulators.

use crate::measurement::Reading;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Mutable accumulator for the currently open second `[second, second + 1s)`.
///
/// Owned exclusively by the sampler. [`SecondBucket::seal`] consumes it, so a bucket
/// can be sealed exactly once.
#[derive(Debug)]
pub struct SecondBucket {
    second: DateTime<Utc>,
    rate_hz: u32,
    readings: Vec<Reading>,
}

impl SecondBucket {
    /// Open a bucket for `second`, pre-sized for `rate_hz` readings.
    pub fn open(second: DateTime<Utc>, rate_hz: u32) -> Self {
        Self {
            second,
            rate_hz,
            readings: Vec::with_capacity(rate_hz as usize),
        }
    }

    /// Second this bucket covers.
    pub fn second(&self) -> DateTime<Utc> {
        self.second
    }

    /// Rate in effect for the whole bucket.
    pub fn rate_hz(&self) -> u32 {
        self.rate_hz
    }

    /// Number of readings collected so far.
    pub fn len(&self) -> usize {
        self.readings.len()
    }

    /// True if no reading has been collected.
    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    /// Append a reading. Readings from another second are handed back.
    pub fn push(&mut self, reading: Reading) -> Result<(), Reading> {
        if reading.second() != self.second {
            return Err(reading);
        }
        self.readings.push(reading);
        Ok(())
    }

    /// Freeze the bucket for handoff.
    pub fn seal(self) -> SealedBucket {
        SealedBucket {
            second: self.second,
            rate_hz: self.rate_hz,
            readings: self.readings.into(),
        }
    }
}

/// Immutable, sealed second of readings on its way to storage.
#[derive(Debug, Clone)]
pub struct SealedBucket {
    second: DateTime<Utc>,
    rate_hz: u32,
    readings: Arc<[Reading]>,
}

impl SealedBucket {
    /// Second this bucket covers.
    pub fn second(&self) -> DateTime<Utc> {
        self.second
    }

    /// Rate that was in effect while the bucket was open.
    pub fn rate_hz(&self) -> u32 {
        self.rate_hz
    }

    /// Readings in capture order.
    pub fn readings(&self) -> &Arc<[Reading]> {
        &self.readings
    }

    /// Number of readings.
    pub fn len(&self) -> usize {
        self.readings.len()
    }

    /// True if the second produced no reading.
    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }
}
