//! Custom error types for the acquisition service.
//!
//! This module defines the primary error type, `DaqError`, shared by every component of
//! the pipeline. It is built with `thiserror` and maps each failure onto one of the five
//! error classes the service distinguishes:
//!
//! - **Transient hardware**: sensor read failures. These never leave the sampling thread;
//!   they are represented by [`crate::hardware::SourceError`] and only surface as the
//!   connectivity flag.
//! - **Storage**: disk full, permission problems, path collisions. Logged, the operation is
//!   skipped and the pipeline keeps running.
//! - **Protocol**: malformed or unknown client commands. Answered with a structured error
//!   message to the offending client; the connection stays open.
//! - **Capacity**: overflow of the bucket handoff queue. Drop-oldest, logged as data loss.
//! - **Fatal**: cannot bind the network port or create the storage root. The only class
//!   that halts the process.
//!
//! By using `#[from]`, `DaqError` can be created from underlying error types with `?`.

use std::net::SocketAddr;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Coarse classification used to decide where an error is recovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Sensor hiccup; retried on the normal schedule.
    TransientHardware,
    /// Disk or filesystem problem; operation skipped.
    Storage,
    /// Bad client input; answered with an error message.
    Protocol,
    /// Bounded queue overflow; oldest data dropped.
    Capacity,
    /// Startup cannot continue.
    Fatal,
}

#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Invalid reading path '{0}'")]
    InvalidPath(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Sampling rate {requested} Hz is outside {min}..={max} Hz")]
    RateOutOfRange { requested: i64, min: u32, max: u32 },

    #[error("Bucket handoff queue full, dropped second {0}")]
    HandoffOverflow(String),

    #[error("Cannot create storage root {}: {source}", path.display())]
    StorageRoot {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<DaqError>),
}

impl DaqError {
    /// Which layer is responsible for recovering from this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            DaqError::Config(_)
            | DaqError::Configuration(_)
            | DaqError::StorageRoot { .. }
            | DaqError::Bind { .. } => {
                ErrorClass::Fatal
            }
            DaqError::ShutdownFailed(_) => ErrorClass::Fatal,
            DaqError::Io(_)
            | DaqError::Csv(_)
            | DaqError::Zip(_)
            | DaqError::Storage(_)
            | DaqError::Json(_) => ErrorClass::Storage,
            DaqError::NotFound(_)
            | DaqError::InvalidPath(_)
            | DaqError::Protocol(_)
            | DaqError::RateOutOfRange { .. } => ErrorClass::Protocol,
            DaqError::HandoffOverflow(_) => ErrorClass::Capacity,
        }
    }

    /// True when the process must stop.
    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Fatal
    }

    /// Text for a client `error` message. Protocol errors carry their own wording and
    /// go out without the class prefix.
    pub fn client_message(&self) -> String {
        match self {
            DaqError::Protocol(message) => message.clone(),
            other => other.to_string(),
        }
    }
}
