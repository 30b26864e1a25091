//! Persistence: the per-second file store, the retention window and the aggregate view.
pub mod aggregate;
pub mod downsample;
pub mod export;
pub mod path;
pub mod retention;
pub mod store;

pub use aggregate::{AggregateView, Aggregator, MaxRecord, PersistSchedule};
pub use downsample::{downsample, DisplayRow};
pub use export::{export_zip, prune_exports, ExportSummary};
pub use path::ReadingPath;
pub use retention::{Admission, RetentionManager, RetentionWindow, WindowSummary};
pub use store::{FileMeta, FileStore, FolderTree, StoredFile};
