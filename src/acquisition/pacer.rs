//! Absolute-deadline pacing for the sampling loop.
//!
//! Slot `k` is due at `anchor + k / rate`. Deadlines are derived from the anchor instead
//! of from "now + period", so sleep overshoot and read latency never accumulate into
//! drift. If the loop falls more than one slot behind, the overdue slots are skipped
//! rather than sampled in a burst.

use std::time::{Duration, Instant};

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Below this remaining time the pacer spins instead of sleeping; OS sleep granularity
/// is too coarse for sub-millisecond slots.
pub const SPIN_THRESHOLD: Duration = Duration::from_micros(500);

/// Deadline generator for a fixed rate.
#[derive(Debug, Clone)]
pub struct Pacer {
    rate_hz: u32,
    anchor: Instant,
    slot: u64,
    skipped: u64,
}

impl Pacer {
    /// Start pacing at `rate_hz` with slot 0 due at `start`.
    pub fn new(rate_hz: u32, start: Instant) -> Self {
        Self {
            rate_hz: rate_hz.max(1),
            anchor: start,
            slot: 0,
            skipped: 0,
        }
    }

    /// Current rate.
    pub fn rate_hz(&self) -> u32 {
        self.rate_hz
    }

    /// Nominal interval between slots.
    pub fn period(&self) -> Duration {
        Duration::from_nanos((NANOS_PER_SEC / self.rate_hz as u128) as u64)
    }

    /// Total slots skipped because the loop was late.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Deadline of the next slot.
    pub fn next_deadline(&self) -> Instant {
        self.deadline_of(self.slot)
    }

    fn deadline_of(&self, slot: u64) -> Instant {
        let offset = slot as u128 * NANOS_PER_SEC / self.rate_hz as u128;
        self.anchor + Duration::from_nanos(offset as u64)
    }

    /// Switch rate. The pending deadline is kept and becomes the new anchor.
    pub fn set_rate(&mut self, rate_hz: u32) {
        let rate_hz = rate_hz.max(1);
        if rate_hz == self.rate_hz {
            return;
        }
        self.anchor = self.next_deadline();
        self.slot = 0;
        self.rate_hz = rate_hz;
    }

    /// Mark the current slot as served at `now` and move to the next one.
    ///
    /// Returns how many slots were skipped to catch up.
    pub fn advance(&mut self, now: Instant) -> u64 {
        self.slot += 1;
        let elapsed = now.saturating_duration_since(self.anchor).as_nanos();
        let due = (elapsed * self.rate_hz as u128 / NANOS_PER_SEC) as u64;
        if due > self.slot {
            let skipped = due - self.slot;
            self.slot = due;
            self.skipped += skipped;
            skipped
        } else {
            0
        }
    }

    /// Block until the next deadline, then advance.
    pub fn wait(&mut self) -> u64 {
        let deadline = self.next_deadline();
        sleep_until(deadline);
        self.advance(Instant::now())
    }
}

/// Sleep for the bulk of the interval, then spin for the final stretch.
pub fn sleep_until(deadline: Instant) {
    loop {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        let remaining = deadline - now;
        if remaining > SPIN_THRESHOLD {
            std::thread::sleep(remaining - SPIN_THRESHOLD);
        } else {
            std::hint::spin_loop();
        }
    }
}
