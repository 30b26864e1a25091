//! Reading source capability.
//!
//! # Contract
//! - `read` performs exactly one acquisition and returns immediately with a value or
//!   an error; it must not sleep to pace itself, the sampler owns the schedule.
//! - Every error is treated as transient. The sampler marks the sensor disconnected,
//!   emits no reading for that slot and calls `read` again at the next deadline.
//! - Implementations are driven from a dedicated OS thread, so the trait is
//!   synchronous and only requires `Send`.

use crate::measurement::AxisSample;
use thiserror::Error;

/// Transient sensor failure. Never fatal, never leaves the sampling thread.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// The device did not answer in time.
    #[error("sensor read timed out")]
    Timeout,
    /// Bus or device I/O failure.
    #[error("sensor I/O error: {0}")]
    Io(String),
    /// The device is not present on the bus.
    #[error("sensor disconnected")]
    Disconnected,
}

/// Capability: produce one three-axis sample per invocation.
pub trait ReadingSource: Send {
    /// Short identifier for logs.
    fn name(&self) -> &str;

    /// Acquire one sample.
    fn read(&mut self) -> Result<AxisSample, SourceError>;
}

impl<T: ReadingSource + ?Sized> ReadingSource for Box<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn read(&mut self) -> Result<AxisSample, SourceError> {
        (**self).read()
    }
}
