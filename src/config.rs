//! Configuration management for the acquisition service.
//!
//! Configuration is loaded with `figment` from, in increasing priority:
//! 1. Built-in defaults (`Settings::default()`)
//! 2. A TOML file (`config/sensor_daq.toml` unless another path is given)
//! 3. Environment variables prefixed with `SENSOR_DAQ_`, using `__` between
//!    nested keys (e.g. `SENSOR_DAQ_SAMPLER__RATE_HZ=500`)
//!
//! After loading, [`Settings::validate`] checks every value. Invalid values fail
//! startup with a diagnostic; nothing is silently clamped.
//!
//! # Example
//! ```no_run
//! use sensor_daq::config::Settings;
//!
//! let settings = Settings::load(None)?;
//! println!("Sampling at {} Hz", settings.sampler.rate_hz);
//! # Ok::<(), sensor_daq::error::DaqError>(())
//! ```

use crate::error::{AppResult, DaqError};
use crate::validation::{
    is_in_range, is_nonzero_duration, is_one_of, is_positive, is_valid_ip, is_valid_path,
    is_valid_port, is_valid_rate_bounds,
};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/sensor_daq.toml";

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "SENSOR_DAQ_";

/// Highest rate any configuration may allow. The I2C bus tops out well below this.
pub const RATE_CEILING_HZ: u32 = 10_000;

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];
const LOG_FORMATS: &[&str] = &["pretty", "compact", "json"];
const SOURCES: &[&str] = &["mock"];

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Application settings
    pub application: ApplicationSettings,
    /// Sampler timing and sensor selection
    pub sampler: SamplerSettings,
    /// On-disk layout and retention
    pub storage: StorageSettings,
    /// Aggregate artifact persistence
    pub aggregation: AggregationSettings,
    /// Client-facing WebSocket endpoint
    pub network: NetworkSettings,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationSettings {
    /// Application name, used in logs
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            name: "sensor-daq".to_string(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// Sampler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerSettings {
    /// Target sampling rate in Hz at startup.
    pub rate_hz: u32,
    /// Lowest rate accepted from `set_sampling_rate`.
    pub min_rate_hz: u32,
    /// Highest rate accepted from `set_sampling_rate`.
    pub max_rate_hz: u32,
    /// Reading source kind. Only `mock` ships with the crate.
    pub source: String,
    /// Sealed seconds that may wait for the storage worker before the oldest is dropped.
    pub handoff_capacity: usize,
    /// Consecutive empty seconds before the stall is reported as a status change.
    pub stall_seconds: u32,
}

impl Default for SamplerSettings {
    fn default() -> Self {
        Self {
            rate_hz: 800,
            min_rate_hz: 100,
            max_rate_hz: 1000,
            source: "mock".to_string(),
            handoff_capacity: 4,
            stall_seconds: 3,
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Root directory holding `YYYY/MM/Week_N/DD/HHMMSS.csv` files.
    pub root: PathBuf,
    /// Maximum number of per-second files kept on disk.
    pub max_files: usize,
    /// Zip exports kept under `exports/`; older ones are deleted after each export.
    pub keep_exports: usize,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from("readings"),
            max_files: 120,
            keep_exports: 5,
        }
    }
}

/// Aggregate persistence policy. Whichever trigger fires first wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationSettings {
    /// Persist the aggregate artifacts at least this often.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Persist the aggregate artifacts after this many admitted files.
    pub admissions: usize,
}

impl Default for AggregationSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2 * 60 * 60),
            admissions: 120,
        }
    }
}

/// Network configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    /// Bind address
    pub host: String,
    /// Bind port
    pub port: u16,
    /// Period of the unsolicited `status` broadcast.
    #[serde(with = "humantime_serde")]
    pub status_interval: Duration,
    /// Broadcast messages a client may fall behind before it is disconnected.
    pub client_backlog: usize,
    /// Maximum rows returned by `get_csv_data`.
    pub csv_row_limit: usize,
    /// Maximum rows returned by `get_recent_data`.
    pub recent_data_points: usize,
    /// Maximum names returned by `get_file_list`.
    pub file_list_limit: usize,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8765,
            status_interval: Duration::from_secs(5),
            client_backlog: 256,
            csv_row_limit: 1000,
            recent_data_points: 1000,
            file_list_limit: 100,
        }
    }
}

impl NetworkSettings {
    /// Socket address to bind. Call after [`Settings::validate`].
    pub fn bind_addr(&self) -> AppResult<SocketAddr> {
        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|e| DaqError::Configuration(format!("network bind address: {e}")))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

impl Settings {
    /// Load from the given TOML file (or the default path) plus environment overrides,
    /// then validate.
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
        let settings: Settings = Self::figment(path).extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// The provider chain used by [`Settings::load`]. A missing file is not an error.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Check every value. Fails on the first offending key.
    pub fn validate(&self) -> AppResult<()> {
        let app = &self.application;
        check("application.log_level", &app.log_level, is_one_of(&app.log_level, LOG_LEVELS))?;
        check("application.log_format", &app.log_format, is_one_of(&app.log_format, LOG_FORMATS))?;

        let s = &self.sampler;
        check(
            "sampler.min_rate_hz..max_rate_hz",
            format!("{}..={}", s.min_rate_hz, s.max_rate_hz),
            is_valid_rate_bounds(s.min_rate_hz, s.max_rate_hz, RATE_CEILING_HZ),
        )?;
        check("sampler.rate_hz", s.rate_hz, is_in_range(s.rate_hz, s.min_rate_hz..=s.max_rate_hz))?;
        check("sampler.source", &s.source, is_one_of(&s.source, SOURCES))?;
        check("sampler.handoff_capacity", s.handoff_capacity, is_positive(s.handoff_capacity))?;
        check("sampler.stall_seconds", s.stall_seconds, is_positive(s.stall_seconds as usize))?;

        let st = &self.storage;
        let root = st.root.to_string_lossy();
        check("storage.root", &root, is_valid_path(&root))?;
        check("storage.max_files", st.max_files, is_positive(st.max_files))?;
        check("storage.keep_exports", st.keep_exports, is_positive(st.keep_exports))?;

        let ag = &self.aggregation;
        check("aggregation.interval", format!("{:?}", ag.interval), is_nonzero_duration(ag.interval))?;
        check("aggregation.admissions", ag.admissions, is_positive(ag.admissions))?;

        let n = &self.network;
        check("network.host", &n.host, is_valid_ip(&n.host))?;
        check("network.port", n.port, is_valid_port(n.port))?;
        check(
            "network.status_interval",
            format!("{:?}", n.status_interval),
            is_nonzero_duration(n.status_interval),
        )?;
        check("network.client_backlog", n.client_backlog, is_positive(n.client_backlog))?;
        check("network.csv_row_limit", n.csv_row_limit, is_positive(n.csv_row_limit))?;
        check(
            "network.recent_data_points",
            n.recent_data_points,
            is_positive(n.recent_data_points),
        )?;
        check("network.file_list_limit", n.file_list_limit, is_positive(n.file_list_limit))?;
        Ok(())
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> AppResult<String> {
        toml::to_string_pretty(self).map_err(|e| DaqError::Configuration(e.to_string()))
    }
}

fn check(key: &str, value: impl std::fmt::Display, result: Result<(), &'static str>) -> AppResult<()> {
    result.map_err(|reason| DaqError::Configuration(format!("{key} = {value}: {reason}")))
}
