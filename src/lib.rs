//! # Sensor DAQ Core Library
//!
//! Continuous accelerometer acquisition: a paced sampler rolls readings into one CSV file
//! per wall-clock second, a bounded retention window evicts the oldest files, an
//! aggregator keeps the running maximum over what is retained, and a WebSocket channel
//! lets any number of dashboards query the data and receive live events.
//!
//! ## Crate Structure
//!
//! - **`acquisition`**: the sampling thread, its absolute-deadline pacer, per-second
//!   buckets and the drop-oldest handoff to storage.
//! - **`config`**: `figment`-loaded settings (defaults, TOML file, `SENSOR_DAQ_*`
//!   environment) with fail-fast validation.
//! - **`data`**: path codec, file store, retention window, aggregate view, display
//!   downsampling and zip export.
//! - **`error`**: the `DaqError` taxonomy shared by every component.
//! - **`hardware`**: the `ReadingSource` capability, an MPU-6050 I2C driver and a mock
//!   accelerometer.
//! - **`logging`**: `tracing-subscriber` setup.
//! - **`measurement`**: the immutable `Reading` type.
//! - **`network`**: wire protocol, command router, broadcaster and WebSocket server.
//! - **`pipeline`**: the storage worker between the handoff queue and the window.
//! - **`service`**: wires everything together and owns the shutdown order.
//! - **`status`**: service status snapshot and pipeline events.
//! - **`validation`**: helpers used by configuration validation.

pub mod acquisition;
pub mod config;
pub mod data;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod measurement;
pub mod network;
pub mod pipeline;
pub mod service;
pub mod status;
pub mod validation;

pub use error::{AppResult, DaqError};
pub use service::Service;
