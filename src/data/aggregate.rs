//! Aggregate view over the retention window and its running maximum.
//!
//! The [`Aggregator`] mirrors the window's files and tracks the reading with the
//! largest magnitude. Updates are incremental: new files are scanned in O(readings),
//! and only the eviction of the file that holds the maximum forces a full rescan.

use crate::data::path::ReadingPath;
use crate::data::store::{encode_readings, FileStore, StoredFile};
use crate::error::AppResult;
use crate::measurement::{serialize_timestamp, Reading};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Aggregate file name below the storage root.
pub const AGGREGATE_FILE: &str = "aggregate_data.csv";
/// Max-record file name below the storage root.
pub const MAX_RECORD_FILE: &str = "max_record.json";

/// The largest magnitude currently retained and where it came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MaxRecord {
    /// Magnitude of the reading.
    pub value: f64,
    /// File holding the reading.
    pub source: ReadingPath,
    /// Capture time of the reading.
    #[serde(serialize_with = "serialize_timestamp")]
    pub timestamp: DateTime<Utc>,
}

impl MaxRecord {
    fn of(reading: &Reading, source: ReadingPath) -> Self {
        Self {
            value: reading.total(),
            source,
            timestamp: reading.timestamp(),
        }
    }
}

/// Point-in-time copy of the aggregate. Cheap: files are shared, not copied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateView {
    files: Vec<Arc<StoredFile>>,
    max_record: Option<MaxRecord>,
    reading_count: usize,
}

impl AggregateView {
    /// Retained files, oldest first.
    pub fn files(&self) -> &[Arc<StoredFile>] {
        &self.files
    }

    /// All retained readings in time order.
    pub fn readings(&self) -> impl Iterator<Item = &Reading> + '_ {
        self.files.iter().flat_map(|f| f.readings().iter())
    }

    /// Current maximum, `None` while the window is empty.
    pub fn max_record(&self) -> Option<&MaxRecord> {
        self.max_record.as_ref()
    }

    /// Number of retained readings.
    pub fn reading_count(&self) -> usize {
        self.reading_count
    }
}

/// Incrementally maintained aggregate.
#[derive(Debug, Default)]
pub struct Aggregator {
    files: VecDeque<Arc<StoredFile>>,
    max_record: Option<MaxRecord>,
    reading_count: usize,
    full_recomputes: u64,
}

impl Aggregator {
    /// Empty aggregate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one window change. Must be called with every admission and eviction,
    /// in the same step as the window update.
    pub fn on_window_changed(&mut self, added: &[Arc<StoredFile>], removed: &[Arc<StoredFile>]) {
        let mut max_evicted = false;
        for gone in removed {
            let Some(pos) = self.files.iter().position(|f| f.path() == gone.path()) else {
                continue;
            };
            if let Some(file) = self.files.remove(pos) {
                self.reading_count -= file.readings().len();
            }
            if self.max_record.as_ref().is_some_and(|m| m.source == gone.path()) {
                max_evicted = true;
            }
        }
        for file in added {
            self.reading_count += file.readings().len();
            self.files.push_back(file.clone());
        }

        if max_evicted {
            self.recompute();
        } else {
            for file in added {
                Self::fold_max(&mut self.max_record, file);
            }
        }
    }

    /// Rescan every retained reading.
    fn recompute(&mut self) {
        self.full_recomputes += 1;
        let mut max = None;
        for file in &self.files {
            Self::fold_max(&mut max, file);
        }
        debug!(files = self.files.len(), max = ?max.as_ref().map(|m: &MaxRecord| m.value), "Recomputed maximum");
        self.max_record = max;
    }

    /// Strictly greater wins, so ties keep the earliest reading.
    fn fold_max(max: &mut Option<MaxRecord>, file: &StoredFile) {
        for reading in file.readings() {
            let better = match max {
                Some(current) => reading.total() > current.value,
                None => true,
            };
            if better {
                *max = Some(MaxRecord::of(reading, file.path()));
            }
        }
    }

    /// Current state without recomputation.
    pub fn snapshot(&self) -> AggregateView {
        AggregateView {
            files: self.files.iter().cloned().collect(),
            max_record: self.max_record.clone(),
            reading_count: self.reading_count,
        }
    }

    /// Current maximum.
    pub fn max_record(&self) -> Option<&MaxRecord> {
        self.max_record.as_ref()
    }

    /// Number of full rescans so far.
    pub fn full_recomputes(&self) -> u64 {
        self.full_recomputes
    }
}

/// Decides when to persist the aggregate artifacts: after `interval` has passed or
/// `admissions` files were admitted since the last write, whichever comes first.
#[derive(Debug, Clone)]
pub struct PersistSchedule {
    interval: Duration,
    admissions: usize,
    last: Instant,
    admitted: usize,
}

impl PersistSchedule {
    /// Start counting from `now`.
    pub fn new(interval: Duration, admissions: usize, now: Instant) -> Self {
        Self {
            interval,
            admissions: admissions.max(1),
            last: now,
            admitted: 0,
        }
    }

    /// Count one admitted file.
    pub fn record_admission(&mut self) {
        self.admitted += 1;
    }

    /// Whether either trigger has fired.
    pub fn is_due(&self, now: Instant) -> bool {
        self.admitted >= self.admissions
            || (self.admitted > 0 && now.saturating_duration_since(self.last) >= self.interval)
    }

    /// Whether anything was admitted since the last write.
    pub fn has_pending(&self) -> bool {
        self.admitted > 0
    }

    /// Reset both triggers after a write.
    pub fn mark_persisted(&mut self, now: Instant) {
        self.last = now;
        self.admitted = 0;
    }
}

#[derive(Serialize)]
struct MaxRecordArtifact<'a> {
    max_record: Option<&'a MaxRecord>,
    files: usize,
    readings: usize,
    #[serde(serialize_with = "serialize_timestamp")]
    updated: DateTime<Utc>,
}

/// Write `aggregate_data.csv` and `max_record.json` atomically.
pub fn persist(store: &FileStore, view: &AggregateView) -> AppResult<()> {
    let csv = encode_readings(view.readings())?;
    store.publish(&store.root().join(AGGREGATE_FILE), &csv)?;

    let artifact = MaxRecordArtifact {
        max_record: view.max_record(),
        files: view.files().len(),
        readings: view.reading_count(),
        updated: Utc::now(),
    };
    let json = serde_json::to_vec_pretty(&artifact)?;
    store.publish(&store.root().join(MAX_RECORD_FILE), &json)?;
    debug!(files = artifact.files, readings = artifact.readings, "Aggregate persisted");
    Ok(())
}
