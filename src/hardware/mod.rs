//! Sensor hardware abstractions.
//!
//! The sampler talks to the physical accelerometer only through the
//! [`ReadingSource`] capability.
//!
//! - [`mpu6050::Mpu6050`] drives a real MPU-6050 over any `embedded-hal` I2C bus. The
//!   bus is platform specific, so the driver is handed to
//!   [`Service::start`](crate::Service::start) by the embedding program rather than
//!   built from configuration.
//! - [`mock::MockAccelerometer`] lets the whole pipeline run without hardware and is
//!   what `sampler.source = "mock"` selects.

pub mod capabilities;
pub mod mock;
pub mod mpu6050;

pub use capabilities::{ReadingSource, SourceError};
pub use mock::{FaultInjector, MockAccelerometer};
pub use mpu6050::Mpu6050;

use crate::error::{AppResult, DaqError};

/// Build the reading source named in `sampler.source`.
pub fn source_from_kind(kind: &str) -> AppResult<Box<dyn ReadingSource>> {
    match kind {
        "mock" => Ok(Box::new(MockAccelerometer::new())),
        other => Err(DaqError::Configuration(format!(
            "Unknown reading source '{other}'"
        ))),
    }
}
