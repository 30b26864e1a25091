//! Zip export of the retained files.
//!
//! The archive is assembled in memory from the files in a window snapshot and then
//! published atomically to `<root>/exports/readings_<YYYYMMDD_HHMMSS>.zip`. Entries keep
//! their relative `YYYY/MM/Week_N/DD/HHMMSS.csv` names. Only the newest `keep` archives
//! survive a new export.

use crate::data::aggregate::AggregateView;
use crate::data::store::{FileStore, EXPORTS_DIR};
use crate::error::{AppResult, DaqError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::{self, Cursor, Write};
use tracing::{debug, info, warn};
use zip::write::FileOptions;
use zip::CompressionMethod;

/// Where an export was written and what it holds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportSummary {
    /// Archive path relative to the storage root.
    pub download: String,
    /// Files included.
    pub file_count: usize,
    /// Archive size.
    pub size_bytes: u64,
}

/// Archive every file of `view` into the exports directory, then prune it to `keep`
/// archives.
///
/// Files evicted between the snapshot and the read are skipped. An empty window is
/// reported as an error rather than producing an empty archive.
pub fn export_zip(
    store: &FileStore,
    view: &AggregateView,
    now: DateTime<Utc>,
    keep: usize,
) -> AppResult<ExportSummary> {
    if view.files().is_empty() {
        return Err(DaqError::NotFound("no retained files to export".into()));
    }
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let mut file_count = 0;

    for file in view.files() {
        let path = file.path();
        let bytes = match std::fs::read(path.under(store.root())) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(path = %path, "File evicted during export; skipped");
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        writer.start_file(path.to_string(), options)?;
        writer.write_all(&bytes)?;
        file_count += 1;
    }
    let archive = writer.finish()?.into_inner();

    let download = format!("{EXPORTS_DIR}/readings_{}.zip", now.format("%Y%m%d_%H%M%S"));
    store.publish(&store.root().join(&download), &archive)?;
    info!(download = %download, file_count, size_bytes = archive.len(), "Export written");
    if let Err(e) = prune_exports(store, keep.max(1)) {
        warn!(error = %e, "Failed to prune old exports");
    }
    Ok(ExportSummary {
        download,
        file_count,
        size_bytes: archive.len() as u64,
    })
}

/// Delete all but the newest `keep` archives. Returns how many were removed.
///
/// Archive names embed a sortable timestamp, so name order is age order. Anything in
/// the directory that is not `readings_*.zip` is left alone.
pub fn prune_exports(store: &FileStore, keep: usize) -> AppResult<usize> {
    let dir = store.root().join(EXPORTS_DIR);
    let mut archives: Vec<_> = match std::fs::read_dir(&dir) {
        Ok(entries) => entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with("readings_") && name.ends_with(".zip"))
            })
            .collect(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    archives.sort();
    let excess = archives.len().saturating_sub(keep);
    for stale in &archives[..excess] {
        std::fs::remove_file(stale)?;
        debug!(path = %stale.display(), "Old export removed");
    }
    Ok(excess)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::SecondBucket;
    use crate::data::retention::RetentionManager;
    use crate::measurement::{AxisSample, Reading};
    use chrono::{TimeDelta, TimeZone};
    use std::io::Read;
    use std::sync::Arc;

    #[test]
    fn archive_holds_every_retained_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStore::open(dir.path()).unwrap());
        let manager = RetentionManager::new(store.clone(), 10);
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        for s in 0..3 {
            let second = t0 + TimeDelta::seconds(s);
            let mut bucket = SecondBucket::open(second, 100);
            bucket.push(Reading::new(second, AxisSample::new(0.0, 0.0, 1.0))).unwrap();
            manager.admit(store.write(&bucket.seal()).unwrap());
        }

        let summary = export_zip(&store, &manager.snapshot(), t0, 5).unwrap();
        assert_eq!(summary.download, "exports/readings_20250101_120000.zip");
        assert_eq!(summary.file_count, 3);

        let bytes = std::fs::read(dir.path().join(&summary.download)).unwrap();
        assert_eq!(bytes.len() as u64, summary.size_bytes);
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(archive.len(), 3);
        let mut entry = archive.by_name("2025/01/Week_1/01/120001.csv").unwrap();
        let mut text = String::new();
        entry.read_to_string(&mut text).unwrap();
        assert!(text.starts_with("timestamp,x,y,z,total"));
    }

    #[test]
    fn only_newest_archives_are_kept() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStore::open(dir.path()).unwrap());
        let manager = RetentionManager::new(store.clone(), 10);
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        let mut bucket = SecondBucket::open(t0, 100);
        bucket.push(Reading::new(t0, AxisSample::new(0.0, 0.0, 1.0))).unwrap();
        manager.admit(store.write(&bucket.seal()).unwrap());
        std::fs::create_dir_all(dir.path().join(EXPORTS_DIR)).unwrap();
        std::fs::write(dir.path().join(EXPORTS_DIR).join("notes.txt"), "keep me").unwrap();

        for minute in 0..5 {
            export_zip(&store, &manager.snapshot(), t0 + TimeDelta::minutes(minute), 2).unwrap();
        }

        let mut names: Vec<_> = std::fs::read_dir(dir.path().join(EXPORTS_DIR))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec!["notes.txt", "readings_20250101_120300.zip", "readings_20250101_120400.zip"]
        );
    }

    #[test]
    fn empty_window_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let err = export_zip(&store, &AggregateView::default(), Utc::now(), 5).unwrap_err();
        assert!(matches!(err, DaqError::NotFound(_)));
    }
}
