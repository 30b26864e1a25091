//! Command dispatch.
//!
//! [`CommandRouter::dispatch`] maps each [`Command`] to one handler. A handler returns an
//! [`Outcome`]: the reply for the requesting client plus, for control commands, a message
//! to broadcast to everyone. Anything that touches the disk runs on the blocking pool so
//! no handler can stall the network runtime, and none of them can reach the sampler's
//! timing loop (the sampler is only ever poked through atomics).

use crate::acquisition::SamplerControl;
use crate::config::NetworkSettings;
use crate::data::{downsample, export_zip, ReadingPath, RetentionManager};
use crate::error::{AppResult, DaqError};
use crate::network::protocol::{Command, ServerMessage, ZipExportResult};
use crate::status::StatusReporter;
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

/// Messages produced by one command.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    /// Sent to the requesting client only.
    pub reply: ServerMessage,
    /// Sent to every connected client after the reply.
    pub broadcast: Option<ServerMessage>,
}

impl Outcome {
    fn reply(reply: ServerMessage) -> Self {
        Self {
            reply,
            broadcast: None,
        }
    }

    fn with_broadcast(reply: ServerMessage, broadcast: ServerMessage) -> Self {
        Self {
            reply,
            broadcast: Some(broadcast),
        }
    }
}

/// Validates and dispatches client commands.
#[derive(Clone)]
pub struct CommandRouter {
    sampler: SamplerControl,
    retention: Arc<RetentionManager>,
    status: StatusReporter,
    limits: NetworkSettings,
    keep_exports: usize,
}

impl CommandRouter {
    /// Router over the service's components.
    pub fn new(
        sampler: SamplerControl,
        retention: Arc<RetentionManager>,
        status: StatusReporter,
        limits: NetworkSettings,
        keep_exports: usize,
    ) -> Self {
        Self {
            sampler,
            retention,
            status,
            limits,
            keep_exports,
        }
    }

    /// Current `status` message.
    pub fn status_message(&self) -> ServerMessage {
        ServerMessage::Status {
            data: self.status.snapshot(),
            event: None,
        }
    }

    /// Parse and handle one text frame. Never fails: protocol problems become `error`
    /// replies.
    pub async fn handle_text(&self, text: &str) -> Outcome {
        match Command::parse(text) {
            Ok(command) => self.dispatch(command).await,
            Err(e) => Outcome::reply(ServerMessage::error(e.client_message())),
        }
    }

    /// Handle one parsed command.
    pub async fn dispatch(&self, command: Command) -> Outcome {
        let result = match &command {
            Command::GetStatus => Ok(Outcome::reply(self.status_message())),
            Command::GetFileList => Ok(self.file_list()),
            Command::GetCsvData { filename } => self.csv_data(filename).await,
            Command::GetRecentData => self.recent_data().await,
            Command::GetFolderStructure => self.folder_structure().await,
            Command::SetSamplingRate { rate } => Ok(self.set_sampling_rate(*rate)),
            Command::ExportAllCsvZip => Ok(self.export().await),
            Command::PauseCollection | Command::StopCollection => {
                self.sampler.pause();
                info!("Collection paused");
                Ok(Outcome::with_broadcast(ServerMessage::ack(&command), self.status_message()))
            }
            Command::ResumeCollection | Command::StartCollection => {
                self.sampler.resume();
                info!("Collection resumed");
                Ok(Outcome::with_broadcast(ServerMessage::ack(&command), self.status_message()))
            }
        };
        result.unwrap_or_else(|e| {
            warn!(command = command.name(), error = %e, "Command failed");
            Outcome::reply(ServerMessage::error(e.client_message()))
        })
    }

    fn file_list(&self) -> Outcome {
        Outcome::reply(ServerMessage::FileList {
            files: self.retention.file_names(self.limits.file_list_limit),
        })
    }

    async fn csv_data(&self, filename: &str) -> AppResult<Outcome> {
        let path = ReadingPath::parse(filename)?;
        let store = self.retention.store().clone();
        let mut rows = blocking(move || store.read(&path)).await?;
        let total_rows = rows.len();
        let keep_from = total_rows.saturating_sub(self.limits.csv_row_limit);
        rows.drain(..keep_from);
        Ok(Outcome::reply(ServerMessage::CsvData {
            filename: path.to_string(),
            data: rows,
            total_rows,
        }))
    }

    async fn recent_data(&self) -> AppResult<Outcome> {
        let view = self.retention.snapshot();
        let points = self.limits.recent_data_points;
        let (data, total_readings, max_record) = blocking(move || {
            let rows = downsample(view.readings(), view.reading_count(), points);
            Ok((rows, view.reading_count(), view.max_record().cloned()))
        })
        .await?;
        Ok(Outcome::reply(ServerMessage::RecentData {
            data,
            total_readings,
            max_record,
        }))
    }

    async fn folder_structure(&self) -> AppResult<Outcome> {
        let store = self.retention.store().clone();
        let structure = blocking(move || Ok(store.folder_structure())).await?;
        Ok(Outcome::reply(ServerMessage::FolderStructure { structure }))
    }

    fn set_sampling_rate(&self, rate: i64) -> Outcome {
        match self.sampler.set_rate(rate) {
            Ok(accepted) => {
                info!(rate_hz = accepted, "Sampling rate change requested");
                Outcome::with_broadcast(
                    ServerMessage::CommandResponse {
                        command: "set_sampling_rate".into(),
                        success: true,
                        new_rate: Some(accepted),
                        message: None,
                    },
                    self.status_message(),
                )
            }
            Err(e) => Outcome::reply(ServerMessage::CommandResponse {
                command: "set_sampling_rate".into(),
                success: false,
                new_rate: Some(self.sampler.current_rate()),
                message: Some(e.to_string()),
            }),
        }
    }

    async fn export(&self) -> Outcome {
        let view = self.retention.snapshot();
        let store = self.retention.store().clone();
        let keep = self.keep_exports;
        let result = match blocking(move || export_zip(&store, &view, Utc::now(), keep)).await {
            Ok(summary) => ZipExportResult::Ready(summary),
            Err(e) => {
                warn!(error = %e, "Export failed");
                ZipExportResult::Failed {
                    error: e.to_string(),
                }
            }
        };
        Outcome::reply(ServerMessage::ZipExport(result))
    }
}

/// Run blocking file work off the async runtime.
async fn blocking<T, F>(work: F) -> AppResult<T>
where
    F: FnOnce() -> AppResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| DaqError::Storage(format!("background task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::SecondBucket;
    use crate::data::FileStore;
    use crate::measurement::{AxisSample, Reading};
    use crate::network::ClientRegistry;
    use chrono::{TimeDelta, TimeZone};

    struct Fixture {
        _dir: tempfile::TempDir,
        router: CommandRouter,
        sampler: SamplerControl,
        retention: Arc<RetentionManager>,
    }

    fn fixture(limits: NetworkSettings) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStore::open(dir.path()).unwrap());
        let retention = Arc::new(RetentionManager::new(store, 10));
        let sampler = SamplerControl::new(800, 100, 1000);
        let status = StatusReporter::new(sampler.clone(), retention.clone(), ClientRegistry::new());
        let router = CommandRouter::new(sampler.clone(), retention.clone(), status, limits, 3);
        Fixture {
            _dir: dir,
            router,
            sampler,
            retention,
        }
    }

    fn admit(retention: &RetentionManager, offset: i64, readings: usize) {
        let second = Utc.with_ymd_and_hms(2025, 1, 1, 14, 30, 22).unwrap() + TimeDelta::seconds(offset);
        let mut bucket = SecondBucket::open(second, 800);
        for i in 0..readings {
            let ts = second + TimeDelta::milliseconds(i as i64);
            bucket
                .push(Reading::new(ts, AxisSample::new(0.0, 0.0, 1.0 + i as f64)))
                .unwrap();
        }
        retention.admit(retention.store().write(&bucket.seal()).unwrap());
    }

    #[tokio::test]
    async fn missing_file_is_an_error_reply() {
        let f = fixture(NetworkSettings::default());
        let outcome = f
            .router
            .handle_text(r#"{"command":"get_csv_data","filename":"2025/01/Week_1/01/143022.csv"}"#)
            .await;
        match outcome.reply {
            ServerMessage::Error { message } => assert!(message.contains("2025/01/Week_1/01/143022.csv")),
            other => panic!("unexpected {other:?}"),
        }
        assert!(outcome.broadcast.is_none());
    }

    #[tokio::test]
    async fn protocol_errors_use_plain_wording() {
        let f = fixture(NetworkSettings::default());
        for (text, expected) in [
            (r#"{"command":"make_coffee"}"#, "Unknown command: make_coffee"),
            ("{not json", "Invalid JSON format"),
        ] {
            match f.router.handle_text(text).await.reply {
                ServerMessage::Error { message } => assert_eq!(message, expected),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn traversal_is_rejected() {
        let f = fixture(NetworkSettings::default());
        let outcome = f
            .router
            .handle_text(r#"{"command":"get_csv_data","filename":"../../etc/passwd"}"#)
            .await;
        assert_eq!(outcome.reply.kind(), "error");
    }

    #[tokio::test]
    async fn csv_data_returns_last_rows() {
        let limits = NetworkSettings {
            csv_row_limit: 5,
            ..NetworkSettings::default()
        };
        let f = fixture(limits);
        admit(&f.retention, 0, 20);
        let outcome = f
            .router
            .dispatch(Command::GetCsvData {
                filename: "2025/01/Week_1/01/143022.csv".into(),
            })
            .await;
        match outcome.reply {
            ServerMessage::CsvData { data, total_rows, .. } => {
                assert_eq!(total_rows, 20);
                assert_eq!(data.len(), 5);
                assert_eq!(data[4].total(), 20.0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn out_of_range_rate_is_refused_without_broadcast() {
        let f = fixture(NetworkSettings::default());
        let outcome = f.router.dispatch(Command::SetSamplingRate { rate: 5000 }).await;
        match outcome.reply {
            ServerMessage::CommandResponse { success, new_rate, .. } => {
                assert!(!success);
                assert_eq!(new_rate, Some(800));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(outcome.broadcast.is_none());
        assert_eq!(f.sampler.pending_rate(), None);
    }

    #[tokio::test]
    async fn astronomical_rate_is_refused_not_malformed() {
        let f = fixture(NetworkSettings::default());
        let outcome = f
            .router
            .handle_text(r#"{"command":"set_sampling_rate","rate":1e300}"#)
            .await;
        assert!(matches!(
            outcome.reply,
            ServerMessage::CommandResponse { success: false, new_rate: Some(800), .. }
        ));
    }

    #[tokio::test]
    async fn accepted_rate_broadcasts_status() {
        let f = fixture(NetworkSettings::default());
        let outcome = f.router.dispatch(Command::SetSamplingRate { rate: 500 }).await;
        assert!(matches!(
            outcome.reply,
            ServerMessage::CommandResponse { success: true, new_rate: Some(500), .. }
        ));
        match outcome.broadcast {
            Some(ServerMessage::Status { data, .. }) => assert_eq!(data.pending_rate, Some(500)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn pause_and_resume_toggle_sampler() {
        let f = fixture(NetworkSettings::default());
        f.router.dispatch(Command::PauseCollection).await;
        assert!(f.sampler.is_paused());
        let outcome = f.router.dispatch(Command::ResumeCollection).await;
        assert!(!f.sampler.is_paused());
        assert!(outcome.broadcast.is_some());
    }

    #[tokio::test]
    async fn stop_and_start_are_pause_and_resume() {
        let f = fixture(NetworkSettings::default());
        let outcome = f.router.dispatch(Command::StopCollection).await;
        assert!(f.sampler.is_paused());
        assert!(matches!(
            &outcome.reply,
            ServerMessage::CommandResponse { command, success: true, .. } if command == "stop_collection"
        ));
        match outcome.broadcast {
            Some(ServerMessage::Status { data, .. }) => assert!(data.paused),
            other => panic!("unexpected {other:?}"),
        }
        f.router.dispatch(Command::StartCollection).await;
        assert!(!f.sampler.is_paused());
    }

    #[tokio::test]
    async fn file_list_and_recent_data_reflect_window() {
        let limits = NetworkSettings {
            file_list_limit: 2,
            recent_data_points: 4,
            ..NetworkSettings::default()
        };
        let f = fixture(limits);
        for s in 0..3 {
            admit(&f.retention, s, 8);
        }
        match f.router.dispatch(Command::GetFileList).await.reply {
            ServerMessage::FileList { files } => {
                assert_eq!(files, vec!["2025/01/Week_1/01/143024.csv", "2025/01/Week_1/01/143023.csv"]);
            }
            other => panic!("unexpected {other:?}"),
        }
        match f.router.dispatch(Command::GetRecentData).await.reply {
            ServerMessage::RecentData { data, total_readings, max_record } => {
                assert_eq!(total_readings, 24);
                assert_eq!(data.len(), 4);
                assert_eq!(max_record.unwrap().value, 8.0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn folder_structure_nests_by_date() {
        let f = fixture(NetworkSettings::default());
        admit(&f.retention, 0, 3);
        admit(&f.retention, 1, 3);

        let reply = tokio_test::block_on(f.router.dispatch(Command::GetFolderStructure)).reply;
        let value: serde_json::Value = serde_json::from_str(&reply.to_json()).unwrap();
        assert_eq!(value["type"], "folder_structure");
        let day = value["structure"]["2025"]["01"]["Week_1"]["01"].as_array().unwrap();
        assert_eq!(day.len(), 2);
        assert_eq!(day[0]["filename"], "143022.csv");
        assert_eq!(day[1]["path"], "2025/01/Week_1/01/143023.csv");
        assert!(day[0]["size"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn export_on_empty_window_reports_error_field() {
        let f = fixture(NetworkSettings::default());
        let json = f.router.dispatch(Command::ExportAllCsvZip).await.reply.to_json();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "zip_export");
        assert!(value["error"].is_string());
    }
}
