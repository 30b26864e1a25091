//! Mock Hardware Implementations
//!
//! Provides a simulated accelerometer for running the service without a sensor.
//!
//! `MockAccelerometer` returns gravity along +Z with small Gaussian-like noise on every
//! axis and an occasional vibration burst, so the running maximum moves over time.
//! Failures can be injected from another thread through a [`FaultInjector`].

use crate::hardware::capabilities::{ReadingSource, SourceError};
use crate::measurement::AxisSample;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// Noise amplitude in g.
const NOISE_G: f64 = 0.02;
/// Probability of a vibration burst on any sample.
const BURST_PROBABILITY: f64 = 0.001;
/// Peak burst amplitude in g.
const BURST_G: f64 = 0.8;

/// Handle for injecting failures into a [`MockAccelerometer`] that has already been
/// moved onto the sampling thread.
#[derive(Debug, Clone, Default)]
pub struct FaultInjector {
    fail_next: Arc<AtomicU32>,
    offline: Arc<AtomicBool>,
}

impl FaultInjector {
    /// Make the next `n` reads fail with [`SourceError::Timeout`].
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Unplug (`true`) or replug (`false`) the simulated sensor.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Consume one injected failure, if any.
    fn take(&self) -> Option<SourceError> {
        if self.offline.load(Ordering::SeqCst) {
            return Some(SourceError::Disconnected);
        }
        let mut current = self.fail_next.load(Ordering::SeqCst);
        while current > 0 {
            match self.fail_next.compare_exchange(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Some(SourceError::Timeout),
                Err(actual) => current = actual,
            }
        }
        None
    }
}

/// Simulated three-axis accelerometer.
///
/// # Example
///
/// ```rust
/// use sensor_daq::hardware::{MockAccelerometer, ReadingSource};
///
/// let mut sensor = MockAccelerometer::with_seed(7);
/// let faults = sensor.fault_injector();
/// faults.fail_next(1);
/// assert!(sensor.read().is_err());
/// assert!(sensor.read().is_ok());
/// ```
pub struct MockAccelerometer {
    rng: StdRng,
    faults: FaultInjector,
}

impl MockAccelerometer {
    /// Create a mock seeded from OS entropy.
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
            faults: FaultInjector::default(),
        }
    }

    /// Create a deterministic mock.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            faults: FaultInjector::default(),
        }
    }

    /// Shared handle for failure injection.
    pub fn fault_injector(&self) -> FaultInjector {
        self.faults.clone()
    }

    fn noise(&mut self) -> f64 {
        // Sum of uniforms approximates a normal distribution well enough for a mock.
        let sum: f64 = (0..4).map(|_| self.rng.gen_range(-1.0..1.0)).sum();
        sum * NOISE_G / 2.0
    }
}

impl Default for MockAccelerometer {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadingSource for MockAccelerometer {
    fn name(&self) -> &str {
        "mock-accelerometer"
    }

    fn read(&mut self) -> Result<AxisSample, SourceError> {
        if let Some(err) = self.faults.take() {
            return Err(err);
        }
        let burst = if self.rng.gen_bool(BURST_PROBABILITY) {
            self.rng.gen_range(-BURST_G..BURST_G)
        } else {
            0.0
        };
        let x = self.noise() + burst;
        let y = self.noise();
        let z = 1.0 + self.noise();
        Ok(AxisSample::new(x, y, z))
    }
}
