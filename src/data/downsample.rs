//! Block reduction of the aggregate view for display.
//!
//! A window of 120 files at 800 Hz holds close to 100k readings, far more than a chart
//! can draw. The readings are split into consecutive blocks and each block becomes one
//! row: the block's first timestamp, the mean of each axis, and the peak magnitude, so
//! spikes survive the reduction.
//!
//! The last block may be shorter than the others; it is kept, not cropped, because it
//! holds the newest data.

use crate::measurement::{serialize_timestamp, Reading};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// One reduced row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DisplayRow {
    /// Timestamp of the first reading in the block.
    #[serde(serialize_with = "serialize_timestamp")]
    pub timestamp: DateTime<Utc>,
    /// Mean X
    pub x: f64,
    /// Mean Y
    pub y: f64,
    /// Mean Z
    pub z: f64,
    /// Largest magnitude in the block.
    pub total: f64,
}

impl From<&Reading> for DisplayRow {
    fn from(r: &Reading) -> Self {
        Self {
            timestamp: r.timestamp(),
            x: r.x(),
            y: r.y(),
            z: r.z(),
            total: r.total(),
        }
    }
}

/// Number of readings per block so that `len` readings yield at most `max_points` rows.
pub fn block_size(len: usize, max_points: usize) -> usize {
    if max_points == 0 {
        return len.max(1);
    }
    len.div_ceil(max_points).max(1)
}

/// Reduce `readings` (of known length `len`) to at most `max_points` rows.
pub fn downsample<'a>(
    readings: impl Iterator<Item = &'a Reading>,
    len: usize,
    max_points: usize,
) -> Vec<DisplayRow> {
    let block = block_size(len, max_points);
    let mut rows = Vec::with_capacity(len.div_ceil(block));
    let mut acc: Option<(DisplayRow, usize)> = None;

    for reading in readings {
        match acc.as_mut() {
            Some((row, n)) => {
                row.x += reading.x();
                row.y += reading.y();
                row.z += reading.z();
                row.total = row.total.max(reading.total());
                *n += 1;
            }
            None => acc = Some((DisplayRow::from(reading), 1)),
        }
        if acc.as_ref().is_some_and(|(_, n)| *n == block) {
            rows.extend(acc.take().map(finish));
        }
    }
    rows.extend(acc.map(finish));
    rows
}

fn finish((mut row, n): (DisplayRow, usize)) -> DisplayRow {
    let n = n as f64;
    row.x /= n;
    row.y /= n;
    row.z /= n;
    row
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::AxisSample;
    use chrono::{TimeDelta, TimeZone};

    fn readings(n: usize) -> Vec<Reading> {
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        (0..n)
            .map(|i| {
                Reading::new(
                    t0 + TimeDelta::milliseconds(i as i64),
                    AxisSample::new(i as f64, 0.0, 1.0),
                )
            })
            .collect()
    }

    #[test]
    fn small_inputs_pass_through() {
        let data = readings(10);
        let rows = downsample(data.iter(), data.len(), 1000);
        assert_eq!(rows.len(), 10);
        assert_eq!(rows[3], DisplayRow::from(&data[3]));
    }

    #[test]
    fn blocks_average_axes_and_keep_peak() {
        let data = readings(4);
        let rows = downsample(data.iter(), data.len(), 2);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].x, 0.5);
        assert_eq!(rows[0].z, 1.0);
        assert_eq!(rows[0].timestamp, data[0].timestamp());
        assert_eq!(rows[1].x, 2.5);
        assert_eq!(rows[1].total, data[3].total());
    }

    #[test]
    fn trailing_partial_block_is_kept() {
        let data = readings(10);
        let rows = downsample(data.iter(), data.len(), 3);
        // Blocks of 4: 4 + 4 + 2.
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2].x, 8.5);
    }

    #[test]
    fn output_never_exceeds_limit() {
        for (n, limit) in [(96_000, 1000), (1001, 1000), (7, 2), (0, 5)] {
            let data = readings(n);
            assert!(downsample(data.iter(), n, limit).len() <= limit);
        }
    }
}
