//! On-disk store for per-second reading files.
//!
//! Every file is written to `<root>/.staging/` first and then renamed into place, so a
//! reader never sees a partial file. The staging directory lives on the same filesystem
//! as the published files, which keeps the rename atomic.

use crate::acquisition::SealedBucket;
use crate::data::path::ReadingPath;
use crate::error::{AppResult, DaqError};
use crate::measurement::{format_timestamp, parse_timestamp, AxisSample, Reading};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tracing::{debug, info, warn};

/// Scratch directory for atomic publishes.
pub const STAGING_DIR: &str = ".staging";
/// Directory for zip exports.
pub const EXPORTS_DIR: &str = "exports";
/// Column header shared by second files and the aggregate file.
pub const HEADER: [&str; 5] = ["timestamp", "x", "y", "z", "total"];

/// A published, write-once second file.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredFile {
    path: ReadingPath,
    readings: Arc<[Reading]>,
    seq: u64,
    size_bytes: u64,
}

impl StoredFile {
    /// Location relative to the storage root.
    pub fn path(&self) -> ReadingPath {
        self.path
    }

    /// Readings in capture order.
    pub fn readings(&self) -> &[Reading] {
        &self.readings
    }

    /// Creation order within this process.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Size of the file on disk.
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }
}

/// Metadata of a file found while walking the store.
#[derive(Debug, Clone, PartialEq)]
pub struct FileMeta {
    /// Location relative to the root.
    pub path: ReadingPath,
    /// Size in bytes.
    pub size_bytes: u64,
    /// Modification time, unix seconds.
    pub modified: u64,
}

/// Hierarchical store rooted at one directory.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    staging: PathBuf,
    next_seq: AtomicU64,
    next_stage: AtomicU64,
}

impl FileStore {
    /// Open (and create) the store. Leftovers in the staging directory are removed.
    ///
    /// Failing to create the root is fatal.
    pub fn open(root: impl Into<PathBuf>) -> AppResult<Self> {
        let root = root.into();
        let fatal = |source| DaqError::StorageRoot {
            path: root.clone(),
            source,
        };
        fs::create_dir_all(&root).map_err(fatal)?;
        let staging = root.join(STAGING_DIR);
        match fs::remove_dir_all(&staging) {
            Ok(()) => debug!(path = %staging.display(), "Cleared staging directory"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %staging.display(), error = %e, "Could not clear staging directory"),
        }
        fs::create_dir_all(&staging).map_err(fatal)?;
        info!(root = %root.display(), "File store opened");
        Ok(Self {
            root,
            staging,
            next_seq: AtomicU64::new(0),
            next_stage: AtomicU64::new(0),
        })
    }

    /// Storage root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Persist a sealed bucket as `YYYY/MM/Week_N/DD/HHMMSS.csv`.
    ///
    /// An existing file for the same second is never overwritten.
    pub fn write(&self, bucket: &SealedBucket) -> AppResult<StoredFile> {
        let path = ReadingPath::for_second(bucket.second());
        let target = path.under(&self.root);
        if target.exists() {
            return Err(DaqError::Storage(format!("path collision: {path}")));
        }
        let bytes = encode_readings(bucket.readings().iter())?;
        self.publish(&target, &bytes)?;
        Ok(StoredFile {
            path,
            readings: bucket.readings().clone(),
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            size_bytes: bytes.len() as u64,
        })
    }

    /// Atomically place `bytes` at `target`: write to staging, fsync, rename.
    pub fn publish(&self, target: &Path, bytes: &[u8]) -> AppResult<()> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let staged = self.staging.join(format!(
            "{}.tmp",
            self.next_stage.fetch_add(1, Ordering::SeqCst)
        ));
        let result = (|| -> io::Result<()> {
            let mut file = File::create(&staged)?;
            file.write_all(bytes)?;
            file.sync_all()?;
            fs::rename(&staged, target)
        })();
        if let Err(e) = result {
            let _ = fs::remove_file(&staged);
            return Err(DaqError::Storage(format!("{}: {e}", target.display())));
        }
        Ok(())
    }

    /// Parse one file. Missing files are [`DaqError::NotFound`].
    pub fn read(&self, path: &ReadingPath) -> AppResult<Vec<Reading>> {
        let file = File::open(path.under(&self.root)).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => DaqError::NotFound(path.to_string()),
            _ => DaqError::Io(e),
        })?;
        decode_readings(file)
    }

    /// Read a file back into a [`StoredFile`], used when rebuilding the catalog.
    pub fn load(&self, meta: &FileMeta) -> AppResult<StoredFile> {
        let readings = self.read(&meta.path)?;
        Ok(StoredFile {
            path: meta.path,
            readings: readings.into(),
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            size_bytes: meta.size_bytes,
        })
    }

    /// Delete one file and prune directories it leaves empty.
    ///
    /// A file that is already gone is not an error.
    pub fn delete(&self, path: &ReadingPath) -> AppResult<()> {
        let target = path.under(&self.root);
        match fs::remove_file(&target) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(DaqError::Io(e)),
        }
        let mut dir = target.parent();
        while let Some(d) = dir {
            if d == self.root.as_path() || fs::remove_dir(d).is_err() {
                break;
            }
            dir = d.parent();
        }
        Ok(())
    }

    /// Lazily enumerate every second file in time order.
    pub fn list(&self) -> Catalog {
        Catalog::new(self.root.clone())
    }

    /// Year, month, week and day tree of every file on disk.
    pub fn folder_structure(&self) -> FolderTree {
        let mut tree = FolderTree::default();
        for meta in self.list() {
            tree.insert(&meta);
        }
        tree
    }
}

/// Encode readings as CSV with the standard header.
///
/// Floats use Rust's shortest round-trip representation, so parsing gives back
/// identical values.
pub fn encode_readings<'a>(readings: impl Iterator<Item = &'a Reading>) -> AppResult<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(HEADER)?;
    for r in readings {
        writer.write_record(&[
            format_timestamp(r.timestamp()),
            r.x().to_string(),
            r.y().to_string(),
            r.z().to_string(),
            r.total().to_string(),
        ])?;
    }
    writer
        .into_inner()
        .map_err(|e| DaqError::Storage(e.to_string()))
}

/// Parse CSV produced by [`encode_readings`]. The `total` column is ignored and
/// recomputed from the axes.
pub fn decode_readings<R: Read>(input: R) -> AppResult<Vec<Reading>> {
    let mut reader = csv::Reader::from_reader(input);
    let mut readings = Vec::new();
    for record in reader.records() {
        let record = record?;
        let field = |i: usize| record.get(i).unwrap_or_default();
        let timestamp = parse_timestamp(field(0)).map_err(|e| {
            DaqError::Storage(format!("bad timestamp '{}': {e}", field(0)))
        })?;
        let axis = |i: usize| {
            field(i)
                .parse::<f64>()
                .map_err(|e| DaqError::Storage(format!("bad {} value '{}': {e}", HEADER[i], field(i))))
        };
        readings.push(Reading::new(
            timestamp,
            AxisSample::new(axis(1)?, axis(2)?, axis(3)?),
        ));
    }
    Ok(readings)
}

const LEVELS: usize = 4;

/// Lazy, time-ordered walk over `YYYY/MM/Week_N/DD/*.csv`.
///
/// Directories are listed one at a time as the walk reaches them; unreadable
/// directories and stray files are skipped with a log line.
pub struct Catalog {
    root: PathBuf,
    stack: Vec<std::vec::IntoIter<PathBuf>>,
}

impl Catalog {
    fn new(root: PathBuf) -> Self {
        let top = sorted_children(&root, true);
        Self {
            root,
            stack: vec![top.into_iter()],
        }
    }

    fn meta(&self, path: &Path) -> Option<FileMeta> {
        let reading_path = ReadingPath::from_relative(&self.root, path).ok()?;
        let metadata = fs::metadata(path).ok()?;
        let modified = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_secs());
        Some(FileMeta {
            path: reading_path,
            size_bytes: metadata.len(),
            modified,
        })
    }
}

impl Iterator for Catalog {
    type Item = FileMeta;

    fn next(&mut self) -> Option<FileMeta> {
        loop {
            let depth = self.stack.len();
            let entry = self.stack.last_mut()?.next();
            match entry {
                None => {
                    self.stack.pop();
                }
                Some(dir) if depth <= LEVELS => {
                    let children = sorted_children(&dir, depth < LEVELS);
                    self.stack.push(children.into_iter());
                }
                Some(file) => match self.meta(&file) {
                    Some(meta) => return Some(meta),
                    None => debug!(path = %file.display(), "Skipping unrecognized file"),
                },
            }
        }
    }
}

/// Sorted entries of `dir`: directories that look like a path level when `dirs` is
/// set, `.csv` files otherwise.
fn sorted_children(dir: &Path, dirs: bool) -> Vec<PathBuf> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(path = %dir.display(), error = %e, "Cannot list directory");
            return Vec::new();
        }
    };
    let mut children: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .filter(|entry| {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            if dirs {
                is_dir && (name.bytes().all(|b| b.is_ascii_digit()) || name.starts_with("Week_"))
            } else {
                !is_dir && name.ends_with(".csv")
            }
        })
        .map(|entry| entry.path())
        .collect();
    children.sort();
    children
}

/// One file in the folder tree.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileEntry {
    /// `HHMMSS.csv`
    pub filename: String,
    /// Full relative path, usable with `get_csv_data`.
    pub path: String,
    /// Bytes on disk.
    pub size: u64,
    /// Unix seconds.
    pub modified: u64,
}

/// Files of one day, by day directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct WeekNode {
    days: BTreeMap<String, Vec<FileEntry>>,
}

/// Weeks of one month.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct MonthNode {
    weeks: BTreeMap<String, WeekNode>,
}

/// Months of one year.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct YearNode {
    months: BTreeMap<String, MonthNode>,
}

/// `year -> month -> Week_N -> day -> [files]`, serialized as nested JSON objects.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct FolderTree {
    years: BTreeMap<String, YearNode>,
}

impl FolderTree {
    /// Add one file under its date components.
    pub fn insert(&mut self, meta: &FileMeta) {
        let p = meta.path;
        self.years
            .entry(p.year_dir())
            .or_default()
            .months
            .entry(p.month_dir())
            .or_default()
            .weeks
            .entry(p.week_dir())
            .or_default()
            .days
            .entry(p.day_dir())
            .or_default()
            .push(FileEntry {
                filename: p.file_name(),
                path: p.to_string(),
                size: meta.size_bytes,
                modified: meta.modified,
            });
    }

    /// Files of one day, if any.
    pub fn day(&self, year: &str, month: &str, week: &str, day: &str) -> Option<&[FileEntry]> {
        self.years
            .get(year)?
            .months
            .get(month)?
            .weeks
            .get(week)?
            .days
            .get(day)
            .map(Vec::as_slice)
    }

    /// Total number of files in the tree.
    pub fn file_count(&self) -> usize {
        self.years
            .values()
            .flat_map(|y| y.months.values())
            .flat_map(|m| m.weeks.values())
            .flat_map(|w| w.days.values())
            .map(Vec::len)
            .sum()
    }
}
