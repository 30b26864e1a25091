//! Fixed-capacity FIFO over stored files.
//!
//! [`RetentionManager`] keeps the [`RetentionWindow`] and the [`Aggregator`] behind one
//! mutex and updates both in the same critical section, so a query never sees a window
//! and a maximum that disagree. File deletion happens after the lock is released.

use crate::data::aggregate::{AggregateView, Aggregator, MaxRecord};
use crate::data::path::ReadingPath;
use crate::data::store::{FileStore, StoredFile};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Ordered queue of retained files with `len() <= max_files`.
#[derive(Debug)]
pub struct RetentionWindow {
    files: VecDeque<Arc<StoredFile>>,
    max_files: usize,
    total_bytes: u64,
}

impl RetentionWindow {
    /// Empty window holding at most `max_files` files.
    pub fn new(max_files: usize) -> Self {
        Self {
            files: VecDeque::with_capacity(max_files.max(1) + 1),
            max_files: max_files.max(1),
            total_bytes: 0,
        }
    }

    /// Append a file and return whatever had to be evicted, oldest first.
    pub fn admit(&mut self, file: Arc<StoredFile>) -> Vec<Arc<StoredFile>> {
        self.total_bytes += file.size_bytes();
        self.files.push_back(file);
        let mut evicted = Vec::new();
        while self.files.len() > self.max_files {
            if let Some(old) = self.files.pop_front() {
                self.total_bytes -= old.size_bytes();
                evicted.push(old);
            }
        }
        evicted
    }

    /// Number of retained files.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// True when nothing is retained.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Capacity.
    pub fn max_files(&self) -> usize {
        self.max_files
    }

    /// Retained files, oldest first.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Arc<StoredFile>> + '_ {
        self.files.iter()
    }

    /// Sum of retained file sizes.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }
}

/// Result of one admission.
#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    /// Window length after the admission.
    pub total_files: usize,
    /// Files removed from the window, oldest first.
    pub evicted: Vec<ReadingPath>,
}

/// Lightweight figures for status reporting.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowSummary {
    /// Retained files.
    pub files: usize,
    /// Their total size.
    pub total_bytes: u64,
    /// Oldest retained file.
    pub oldest: Option<ReadingPath>,
    /// Newest retained file.
    pub newest: Option<ReadingPath>,
    /// Current maximum.
    pub max_record: Option<MaxRecord>,
}

#[derive(Debug)]
struct RetentionState {
    window: RetentionWindow,
    aggregator: Aggregator,
}

/// Owns the lifecycle of stored files once they are published.
#[derive(Debug)]
pub struct RetentionManager {
    store: Arc<FileStore>,
    state: Mutex<RetentionState>,
}

impl RetentionManager {
    /// Manager for `store` keeping at most `max_files` files.
    pub fn new(store: Arc<FileStore>, max_files: usize) -> Self {
        Self {
            store,
            state: Mutex::new(RetentionState {
                window: RetentionWindow::new(max_files),
                aggregator: Aggregator::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RetentionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Underlying store.
    pub fn store(&self) -> &Arc<FileStore> {
        &self.store
    }

    /// Admit a freshly written file, evicting the oldest beyond capacity.
    ///
    /// Deletion of evicted files is best effort: a failure is logged once and the file
    /// is forgotten.
    pub fn admit(&self, file: StoredFile) -> Admission {
        let file = Arc::new(file);
        let (evicted, total_files) = {
            let mut state = self.lock();
            let evicted = state.window.admit(file.clone());
            state.aggregator.on_window_changed(&[file], &evicted);
            (evicted, state.window.len())
        };
        for old in &evicted {
            match self.store.delete(&old.path()) {
                Ok(()) => debug!(path = %old.path(), "Evicted file"),
                Err(e) => warn!(path = %old.path(), error = %e, "Failed to delete evicted file"),
            }
        }
        Admission {
            total_files,
            evicted: evicted.iter().map(|f| f.path()).collect(),
        }
    }

    /// Consistent copy of the aggregate view.
    pub fn snapshot(&self) -> AggregateView {
        self.lock().aggregator.snapshot()
    }

    /// Counts and endpoints of the window.
    pub fn summary(&self) -> WindowSummary {
        let state = self.lock();
        let oldest = state.window.iter().next().map(|f| f.path());
        let newest = state.window.iter().next_back().map(|f| f.path());
        WindowSummary {
            files: state.window.len(),
            total_bytes: state.window.total_bytes(),
            oldest,
            newest,
            max_record: state.aggregator.max_record().cloned(),
        }
    }

    /// Retained file names, newest first, at most `limit`.
    pub fn file_names(&self, limit: usize) -> Vec<String> {
        self.lock()
            .window
            .iter()
            .rev()
            .take(limit)
            .map(|f| f.path().to_string())
            .collect()
    }

    /// Window length.
    pub fn len(&self) -> usize {
        self.lock().window.len()
    }

    /// True when nothing is retained.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rebuild the window from disk after a restart.
    ///
    /// Files beyond capacity are deleted without being parsed; the rest are loaded in
    /// time order through [`RetentionManager::admit`]. Unreadable files are deleted, since
    /// outside the window nothing would ever evict them.
    pub fn restore(&self) -> usize {
        let found: Vec<_> = self.store.list().collect();
        let capacity = self.lock().window.max_files();
        let excess = found.len().saturating_sub(capacity);
        for stale in &found[..excess] {
            if let Err(e) = self.store.delete(&stale.path) {
                warn!(path = %stale.path, error = %e, "Failed to delete evicted file");
            }
        }
        let mut restored = 0;
        for meta in &found[excess..] {
            match self.store.load(meta) {
                Ok(file) => {
                    self.admit(file);
                    restored += 1;
                }
                Err(e) => {
                    warn!(path = %meta.path, error = %e, "Deleting unreadable file");
                    if let Err(e) = self.store.delete(&meta.path) {
                        warn!(path = %meta.path, error = %e, "Failed to delete unreadable file");
                    }
                }
            }
        }
        info!(restored, evicted = excess, "Retention window rebuilt from disk");
        restored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::SecondBucket;
    use crate::measurement::{AxisSample, Reading};
    use chrono::{TimeDelta, TimeZone, Utc};

    fn write(store: &FileStore, offset: i64) -> StoredFile {
        let second = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap() + TimeDelta::seconds(offset);
        let mut bucket = SecondBucket::open(second, 100);
        bucket
            .push(Reading::new(second, AxisSample::new(0.0, 0.0, 1.0 + offset as f64)))
            .unwrap();
        store.write(&bucket.seal()).unwrap()
    }

    #[test]
    fn window_never_exceeds_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStore::open(dir.path()).unwrap());
        let manager = RetentionManager::new(store.clone(), 5);
        for i in 0..12 {
            let admission = manager.admit(write(&store, i));
            assert!(admission.total_files <= 5);
        }
        assert_eq!(manager.len(), 5);
        assert_eq!(store.list().count(), 5);
    }

    #[test]
    fn file_names_are_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStore::open(dir.path()).unwrap());
        let manager = RetentionManager::new(store.clone(), 10);
        for i in 0..4 {
            manager.admit(write(&store, i));
        }
        let names = manager.file_names(2);
        assert_eq!(names, vec!["2025/01/Week_1/01/000003.csv", "2025/01/Week_1/01/000002.csv"]);
    }

    #[test]
    fn summary_reports_endpoints_and_max() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStore::open(dir.path()).unwrap());
        let manager = RetentionManager::new(store.clone(), 3);
        for i in 0..5 {
            manager.admit(write(&store, i));
        }
        let summary = manager.summary();
        assert_eq!(summary.files, 3);
        assert_eq!(summary.oldest.unwrap().to_string(), "2025/01/Week_1/01/000002.csv");
        assert_eq!(summary.newest.unwrap().to_string(), "2025/01/Week_1/01/000004.csv");
        assert_eq!(summary.max_record.unwrap().value, 5.0);
        assert!(summary.total_bytes > 0);
    }

    #[test]
    fn deletion_failure_does_not_block_admission() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStore::open(dir.path()).unwrap());
        let manager = RetentionManager::new(store.clone(), 1);
        let first = write(&store, 0);
        // Removed behind the manager's back; eviction must still succeed.
        std::fs::remove_file(first.path().under(dir.path())).unwrap();
        manager.admit(first);
        let admission = manager.admit(write(&store, 1));
        assert_eq!(admission.evicted.len(), 1);
        assert_eq!(admission.total_files, 1);
    }

    #[test]
    fn restore_rebuilds_and_trims() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).unwrap();
            for i in 0..8 {
                write(&store, i);
            }
        }
        let store = Arc::new(FileStore::open(dir.path()).unwrap());
        let manager = RetentionManager::new(store.clone(), 5);
        assert_eq!(manager.restore(), 5);
        assert_eq!(manager.summary().oldest.unwrap().to_string(), "2025/01/Week_1/01/000003.csv");
        assert_eq!(store.list().count(), 5);
        assert_eq!(manager.snapshot().max_record().unwrap().value, 8.0);
    }

    #[test]
    fn restore_deletes_unreadable_files() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).unwrap();
            for i in 0..3 {
                write(&store, i);
            }
        }
        let corrupt = dir.path().join("2025/01/Week_1/01/000001.csv");
        std::fs::write(&corrupt, "timestamp,x,y,z,total\nyesterday,1,2,3,4\n").unwrap();

        let store = Arc::new(FileStore::open(dir.path()).unwrap());
        let manager = RetentionManager::new(store.clone(), 5);
        assert_eq!(manager.restore(), 2);
        assert!(!corrupt.exists());
        assert_eq!(store.list().count(), 2);
        assert_eq!(store.folder_structure().file_count(), 2);
    }
}
