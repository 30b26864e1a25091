//! Wire format of the client channel.
//!
//! Every WebSocket text frame carries one JSON object. Clients send
//! `{"command": <name>, ...params}`; the server answers with objects tagged by `type`.
//! Parsing goes through [`serde_json::Value`] first so invalid JSON, unknown commands
//! and bad parameters each get their own error message.

use crate::data::{DisplayRow, ExportSummary, FolderTree, MaxRecord};
use crate::error::{AppResult, DaqError};
use crate::measurement::Reading;
use crate::status::{ServiceStatus, StatusEvent};
use serde::Serialize;
use serde_json::{Map, Value};

/// A parsed client command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// `get_status`
    GetStatus,
    /// `get_file_list`
    GetFileList,
    /// `get_csv_data {filename}`
    GetCsvData {
        /// Path relative to the storage root.
        filename: String,
    },
    /// `get_recent_data`
    GetRecentData,
    /// `get_folder_structure`
    GetFolderStructure,
    /// `set_sampling_rate {rate}`
    SetSamplingRate {
        /// Requested rate in Hz, range-checked by the sampler.
        rate: i64,
    },
    /// `export_all_csv_zip`
    ExportAllCsvZip,
    /// `pause_collection`
    PauseCollection,
    /// `resume_collection`
    ResumeCollection,
    /// `start_collection`, resume under the name older clients use.
    StartCollection,
    /// `stop_collection`, pause under the name older clients use.
    StopCollection,
}

impl Command {
    /// Wire name of the command.
    pub fn name(&self) -> &'static str {
        match self {
            Command::GetStatus => "get_status",
            Command::GetFileList => "get_file_list",
            Command::GetCsvData { .. } => "get_csv_data",
            Command::GetRecentData => "get_recent_data",
            Command::GetFolderStructure => "get_folder_structure",
            Command::SetSamplingRate { .. } => "set_sampling_rate",
            Command::ExportAllCsvZip => "export_all_csv_zip",
            Command::PauseCollection => "pause_collection",
            Command::ResumeCollection => "resume_collection",
            Command::StartCollection => "start_collection",
            Command::StopCollection => "stop_collection",
        }
    }

    /// Parse one text frame.
    pub fn parse(text: &str) -> AppResult<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|_| DaqError::Protocol("Invalid JSON format".into()))?;
        let Value::Object(fields) = value else {
            return Err(DaqError::Protocol("Command must be a JSON object".into()));
        };
        let name = fields
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| DaqError::Protocol("Missing 'command' field".into()))?;

        let command = match name {
            "get_status" => Command::GetStatus,
            "get_file_list" => Command::GetFileList,
            "get_csv_data" => Command::GetCsvData {
                filename: string_param(&fields, name, "filename")?,
            },
            "get_recent_data" => Command::GetRecentData,
            "get_folder_structure" => Command::GetFolderStructure,
            "set_sampling_rate" => Command::SetSamplingRate {
                rate: rate_param(&fields)?,
            },
            "export_all_csv_zip" => Command::ExportAllCsvZip,
            "pause_collection" => Command::PauseCollection,
            "resume_collection" => Command::ResumeCollection,
            "start_collection" => Command::StartCollection,
            "stop_collection" => Command::StopCollection,
            other => return Err(DaqError::Protocol(format!("Unknown command: {other}"))),
        };
        Ok(command)
    }
}

fn string_param(fields: &Map<String, Value>, command: &str, key: &str) -> AppResult<String> {
    fields
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| DaqError::Protocol(format!("'{command}' requires a string '{key}' parameter")))
}

/// Integer Hz. `500` and `500.0` are accepted, `500.5` and `"500"` are not.
fn rate_param(fields: &Map<String, Value>) -> AppResult<i64> {
    let invalid = || DaqError::Protocol("'set_sampling_rate' requires an integer 'rate' parameter".into());
    let rate = fields.get("rate").ok_or_else(invalid)?;
    if let Some(rate) = rate.as_i64() {
        return Ok(rate);
    }
    // Whole numbers beyond i64 saturate; the range check rejects them anyway.
    match rate.as_f64() {
        Some(f) if f.is_finite() && f.fract() == 0.0 => {
            Ok(f.clamp(i64::MIN as f64, i64::MAX as f64) as i64)
        }
        _ => Err(invalid()),
    }
}

/// Messages sent to clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum ServerMessage {
    Status {
        data: ServiceStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        event: Option<StatusEvent>,
    },
    FileList {
        files: Vec<String>,
    },
    CsvData {
        filename: String,
        data: Vec<Reading>,
        total_rows: usize,
    },
    RecentData {
        data: Vec<DisplayRow>,
        total_readings: usize,
        max_record: Option<MaxRecord>,
    },
    FolderStructure {
        structure: FolderTree,
    },
    NewFile {
        filename: String,
        total_files: usize,
        samples: usize,
    },
    CommandResponse {
        command: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        new_rate: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    ZipExport(ZipExportResult),
    Error {
        message: String,
    },
    Shutdown {
        message: String,
    },
}

/// Body of a `zip_export` message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ZipExportResult {
    /// `{download, file_count, size_bytes}`
    Ready(ExportSummary),
    /// `{error}`
    Failed {
        /// What went wrong.
        error: String,
    },
}

impl ServerMessage {
    /// `error` message with the given text.
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    /// Successful `command_response` without a value.
    pub fn ack(command: &Command) -> Self {
        ServerMessage::CommandResponse {
            command: command.name().to_string(),
            success: true,
            new_rate: None,
            message: None,
        }
    }

    /// Wire name of the message.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Status { .. } => "status",
            ServerMessage::FileList { .. } => "file_list",
            ServerMessage::CsvData { .. } => "csv_data",
            ServerMessage::RecentData { .. } => "recent_data",
            ServerMessage::FolderStructure { .. } => "folder_structure",
            ServerMessage::NewFile { .. } => "new_file",
            ServerMessage::CommandResponse { .. } => "command_response",
            ServerMessage::ZipExport(_) => "zip_export",
            ServerMessage::Error { .. } => "error",
            ServerMessage::Shutdown { .. } => "shutdown",
        }
    }

    /// Encode as a JSON text frame.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            serde_json::json!({ "type": "error", "message": format!("Failed to encode {}: {e}", self.kind()) })
                .to_string()
        })
    }
}
