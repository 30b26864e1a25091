//! The sampling loop.
//!
//! [`Sampler`] owns the reading source, the open [`SecondBucket`] and the pacer, and runs
//! on its own OS thread. Everything other threads may need is exposed through the
//! cloneable [`SamplerControl`], which only touches atomics and therefore never blocks
//! the timing loop.

use crate::acquisition::bucket::{SealedBucket, SecondBucket};
use crate::acquisition::handoff::HandoffQueue;
use crate::acquisition::pacer::Pacer;
use crate::error::{AppResult, DaqError};
use crate::hardware::{ReadingSource, SourceError};
use crate::measurement::{truncate_to_second, Reading};
use crate::status::{EventBus, PipelineEvent, StatusEvent};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug)]
struct SamplerShared {
    current_rate: AtomicU32,
    /// Zero means no change is pending.
    requested_rate: AtomicU32,
    min_rate: u32,
    max_rate: u32,
    connected: AtomicBool,
    paused: AtomicBool,
    running: AtomicBool,
    total_samples: AtomicU64,
    dropped_buckets: AtomicU64,
}

/// Thread-safe view and control surface of a running [`Sampler`].
#[derive(Debug, Clone)]
pub struct SamplerControl {
    shared: Arc<SamplerShared>,
}

impl SamplerControl {
    /// Create the control block for a sampler starting at `rate_hz`, accepting
    /// changes within `min_rate..=max_rate`.
    pub fn new(rate_hz: u32, min_rate: u32, max_rate: u32) -> Self {
        Self {
            shared: Arc::new(SamplerShared {
                current_rate: AtomicU32::new(rate_hz),
                requested_rate: AtomicU32::new(0),
                min_rate,
                max_rate,
                connected: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                running: AtomicBool::new(false),
                total_samples: AtomicU64::new(0),
                dropped_buckets: AtomicU64::new(0),
            }),
        }
    }

    /// Request a new rate. It takes effect when the next second opens.
    ///
    /// Out-of-range requests fail immediately and leave the rate unchanged.
    pub fn set_rate(&self, requested: i64) -> AppResult<u32> {
        let (min, max) = self.rate_bounds();
        let rate = u32::try_from(requested)
            .ok()
            .filter(|r| (min..=max).contains(r))
            .ok_or(DaqError::RateOutOfRange {
                requested,
                min,
                max,
            })?;
        if rate == self.current_rate() {
            // Cancels any other change still waiting for the boundary.
            self.shared.requested_rate.store(0, Ordering::SeqCst);
        } else {
            self.shared.requested_rate.store(rate, Ordering::SeqCst);
        }
        Ok(rate)
    }

    /// Accepted rate window.
    pub fn rate_bounds(&self) -> (u32, u32) {
        (self.shared.min_rate, self.shared.max_rate)
    }

    /// Rate the current bucket is being filled at.
    pub fn current_rate(&self) -> u32 {
        self.shared.current_rate.load(Ordering::SeqCst)
    }

    /// Rate waiting for the next second boundary.
    pub fn pending_rate(&self) -> Option<u32> {
        match self.shared.requested_rate.load(Ordering::SeqCst) {
            0 => None,
            rate => Some(rate),
        }
    }

    /// Whether the most recent read succeeded.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Stop taking readings. The schedule keeps running so buckets still seal on time.
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::SeqCst);
    }

    /// Resume taking readings.
    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::SeqCst);
    }

    /// Whether collection is paused.
    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    /// Readings taken since startup.
    pub fn total_samples(&self) -> u64 {
        self.shared.total_samples.load(Ordering::SeqCst)
    }

    /// Sealed seconds lost to handoff overflow.
    pub fn dropped_buckets(&self) -> u64 {
        self.shared.dropped_buckets.load(Ordering::SeqCst)
    }

    fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }
}

/// Drives a [`ReadingSource`] at the configured rate and seals one bucket per second.
pub struct Sampler<S: ReadingSource> {
    source: S,
    control: SamplerControl,
    pacer: Pacer,
    bucket: Option<SecondBucket>,
    queue: Arc<HandoffQueue>,
    events: EventBus,
    stall_seconds: u32,
    empty_seconds: u32,
    stalled: bool,
}

impl<S: ReadingSource> Sampler<S> {
    /// Build a sampler that hands sealed buckets to `queue`.
    pub fn new(
        source: S,
        control: SamplerControl,
        queue: Arc<HandoffQueue>,
        events: EventBus,
        stall_seconds: u32,
    ) -> Self {
        let pacer = Pacer::new(control.current_rate(), Instant::now());
        Self {
            source,
            control,
            pacer,
            bucket: None,
            queue,
            events,
            stall_seconds: stall_seconds.max(1),
            empty_seconds: 0,
            stalled: false,
        }
    }

    /// Control handle sharing this sampler's state.
    pub fn control(&self) -> SamplerControl {
        self.control.clone()
    }

    /// Wait for the next slot, then sample.
    pub fn tick(&mut self) {
        let skipped = self.pacer.wait();
        if skipped > 0 {
            debug!(skipped, "Sampler fell behind; skipped overdue slots");
        }
        self.sample_at(Utc::now());
    }

    /// Serve one slot at wall-clock time `now`.
    ///
    /// Seals the open bucket first if `now` is in a later second.
    pub fn sample_at(&mut self, now: DateTime<Utc>) {
        if !self.roll_to(truncate_to_second(now)) {
            return;
        }
        if self.control.is_paused() {
            return;
        }
        match self.source.read() {
            Ok(sample) => {
                self.set_connected(true, None);
                self.control.shared.total_samples.fetch_add(1, Ordering::Relaxed);
                if let Some(bucket) = self.bucket.as_mut() {
                    if let Err(reading) = bucket.push(Reading::new(now, sample)) {
                        debug!(timestamp = %reading.timestamp(), "Reading outside open second");
                    }
                }
            }
            Err(err) => self.set_connected(false, Some(&err)),
        }
    }

    /// Seal and hand off whatever is in the open bucket.
    pub fn flush(&mut self) {
        if let Some(bucket) = self.bucket.take() {
            self.seal(bucket);
        }
    }

    /// Make sure the open bucket covers `second`. Returns false if the sample must be
    /// discarded because the wall clock moved backwards.
    fn roll_to(&mut self, second: DateTime<Utc>) -> bool {
        let gap = match self.bucket.as_ref() {
            Some(open) if open.second() == second => return true,
            Some(open) if second < open.second() => {
                warn!(
                    open = %open.second(),
                    now = %second,
                    "Wall clock stepped backwards; discarding sample"
                );
                return false;
            }
            Some(open) => (second - open.second()).num_seconds().saturating_sub(1),
            None => 0,
        };
        if let Some(bucket) = self.bucket.take() {
            self.seal(bucket);
        }
        // Whole seconds without a single slot count as empty.
        if gap > 0 && !self.control.is_paused() {
            self.note_empty(u32::try_from(gap).unwrap_or(u32::MAX));
        }
        self.apply_pending_rate();
        self.bucket = Some(SecondBucket::open(second, self.pacer.rate_hz()));
        true
    }

    fn seal(&mut self, bucket: SecondBucket) {
        if bucket.is_empty() {
            if !self.control.is_paused() {
                self.note_empty(1);
            }
            return;
        }
        self.note_filled();
        self.hand_off(bucket.seal());
    }

    fn hand_off(&self, sealed: SealedBucket) {
        if let Some(dropped) = self.queue.push(sealed) {
            self.control.shared.dropped_buckets.fetch_add(1, Ordering::Relaxed);
            let err = DaqError::HandoffOverflow(dropped.second().to_rfc3339());
            warn!(
                second = %dropped.second(),
                readings = dropped.len(),
                "{err}"
            );
        }
    }

    fn note_empty(&mut self, seconds: u32) {
        self.empty_seconds = self.empty_seconds.saturating_add(seconds);
        if !self.stalled && self.empty_seconds >= self.stall_seconds {
            self.stalled = true;
            error!(
                empty_seconds = self.empty_seconds,
                source = self.source.name(),
                "No readings for consecutive seconds; sampler stalled"
            );
            self.events.publish(PipelineEvent::Status(StatusEvent::Stalled {
                empty_seconds: self.empty_seconds,
            }));
        }
    }

    fn note_filled(&mut self) {
        self.empty_seconds = 0;
        if self.stalled {
            self.stalled = false;
            info!(source = self.source.name(), "Readings flowing again");
            self.events.publish(PipelineEvent::Status(StatusEvent::Recovered));
        }
    }

    fn apply_pending_rate(&mut self) {
        let requested = self.control.shared.requested_rate.swap(0, Ordering::SeqCst);
        if requested == 0 || requested == self.pacer.rate_hz() {
            return;
        }
        let previous = self.pacer.rate_hz();
        self.pacer.set_rate(requested);
        self.control.shared.current_rate.store(requested, Ordering::SeqCst);
        info!(from = previous, rate_hz = requested, "Sampling rate changed");
        self.events.publish(PipelineEvent::Status(StatusEvent::RateChanged {
            rate_hz: requested,
        }));
    }

    fn set_connected(&self, connected: bool, cause: Option<&SourceError>) {
        let was = self.control.shared.connected.swap(connected, Ordering::SeqCst);
        if was == connected {
            return;
        }
        match cause {
            Some(err) => warn!(source = self.source.name(), error = %err, "Sensor read failed"),
            None => info!(source = self.source.name(), "Sensor connected"),
        }
        self.events.publish(PipelineEvent::Status(StatusEvent::ConnectivityChanged {
            connected,
        }));
    }
}

impl<S: ReadingSource + 'static> Sampler<S> {
    /// Run the loop on a dedicated thread named `sampler`.
    pub fn spawn(mut self) -> std::io::Result<SamplerThread> {
        let control = self.control.clone();
        control.shared.running.store(true, Ordering::SeqCst);
        let handle = std::thread::Builder::new()
            .name("sampler".into())
            .spawn(move || {
                self.pacer = Pacer::new(self.pacer.rate_hz(), Instant::now());
                info!(
                    rate_hz = self.pacer.rate_hz(),
                    source = self.source.name(),
                    "Sampler started"
                );
                while self.control.is_running() {
                    self.tick();
                }
                self.flush();
                info!(skipped_slots = self.pacer.skipped(), "Sampler stopped");
            });
        match handle {
            Ok(handle) => Ok(SamplerThread {
                handle: Some(handle),
                control,
            }),
            Err(e) => {
                control.shared.running.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }
}

/// Join handle for a running sampler thread.
#[derive(Debug)]
pub struct SamplerThread {
    handle: Option<JoinHandle<()>>,
    control: SamplerControl,
}

impl SamplerThread {
    /// Control handle for the running sampler.
    pub fn control(&self) -> SamplerControl {
        self.control.clone()
    }

    /// Stop sampling, flush the open bucket and wait for the thread to exit.
    pub fn stop(mut self) -> AppResult<()> {
        self.halt()
    }

    fn halt(&mut self) -> AppResult<()> {
        self.control.shared.running.store(false, Ordering::SeqCst);
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| DaqError::Storage("sampler thread panicked".into())),
            None => Ok(()),
        }
    }
}

impl Drop for SamplerThread {
    fn drop(&mut self) {
        let _ = self.halt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::handoff::Pop;
    use crate::hardware::MockAccelerometer;
    use chrono::{TimeDelta, TimeZone};
    use std::time::Duration;
    use tracing_test::traced_test;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 14, 30, 22).unwrap()
    }

    fn ms(n: i64) -> TimeDelta {
        TimeDelta::milliseconds(n)
    }

    fn sampler(rate: u32) -> (Sampler<MockAccelerometer>, Arc<HandoffQueue>, EventBus) {
        let queue = Arc::new(HandoffQueue::new(8));
        let events = EventBus::new(32);
        let control = SamplerControl::new(rate, 100, 1000);
        let sampler = Sampler::new(
            MockAccelerometer::with_seed(3),
            control,
            queue.clone(),
            events.clone(),
            3,
        );
        (sampler, queue, events)
    }

    fn pop(queue: &HandoffQueue) -> SealedBucket {
        match queue.pop_timeout(Duration::from_millis(1)) {
            Pop::Bucket(b) => b,
            other => panic!("expected a bucket, got {other:?}"),
        }
    }

    #[test]
    fn seals_once_per_second() {
        let (mut sampler, queue, _) = sampler(100);
        for i in 0..100 {
            sampler.sample_at(t0() + ms(i * 10));
        }
        assert!(queue.is_empty());
        sampler.sample_at(t0() + ms(1000));
        let bucket = pop(&queue);
        assert_eq!(bucket.second(), t0());
        assert_eq!(bucket.len(), 100);
        assert!(bucket.readings().iter().all(|r| r.second() == t0()));
    }

    #[test]
    fn failures_mark_disconnected_and_shrink_bucket() {
        let (mut sampler, queue, events) = sampler(100);
        let mut rx = events.subscribe();
        let faults = sampler.source.fault_injector();

        sampler.sample_at(t0());
        assert!(sampler.control().is_connected());

        faults.fail_next(5);
        for i in 1..6 {
            sampler.sample_at(t0() + ms(i * 10));
        }
        assert!(!sampler.control().is_connected());

        for i in 6..100 {
            sampler.sample_at(t0() + ms(i * 10));
        }
        assert!(sampler.control().is_connected());
        sampler.flush();

        let bucket = pop(&queue);
        assert_eq!(bucket.len(), 95);
        assert_eq!(
            rx.try_recv().unwrap(),
            PipelineEvent::Status(StatusEvent::ConnectivityChanged { connected: true })
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            PipelineEvent::Status(StatusEvent::ConnectivityChanged { connected: false })
        );
    }

    #[test]
    fn rate_change_waits_for_second_boundary() {
        let (mut sampler, queue, events) = sampler(100);
        let mut rx = events.subscribe();
        let control = sampler.control();

        sampler.sample_at(t0());
        assert_eq!(control.set_rate(500).unwrap(), 500);
        assert_eq!(control.pending_rate(), Some(500));
        assert_eq!(control.current_rate(), 100);

        sampler.sample_at(t0() + ms(500));
        assert_eq!(control.current_rate(), 100);

        sampler.sample_at(t0() + ms(1000));
        assert_eq!(control.current_rate(), 500);
        assert_eq!(control.pending_rate(), None);
        sampler.flush();

        let first = pop(&queue);
        let second = pop(&queue);
        assert_eq!(first.rate_hz(), 100);
        assert_eq!(first.len(), 2);
        assert_eq!(second.rate_hz(), 500);
        assert_eq!(
            rx.try_recv().unwrap(),
            PipelineEvent::Status(StatusEvent::ConnectivityChanged { connected: true })
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            PipelineEvent::Status(StatusEvent::RateChanged { rate_hz: 500 })
        );
    }

    #[test]
    fn out_of_range_rate_is_rejected_immediately() {
        let control = SamplerControl::new(800, 100, 1000);
        for bad in [0, 99, 1001, -5, i64::MAX] {
            let err = control.set_rate(bad).unwrap_err();
            assert!(matches!(err, DaqError::RateOutOfRange { .. }));
        }
        assert_eq!(control.current_rate(), 800);
        assert_eq!(control.pending_rate(), None);
    }

    #[test]
    fn three_empty_seconds_report_a_stall() {
        let (mut sampler, queue, events) = sampler(100);
        let mut rx = events.subscribe();
        let faults = sampler.source.fault_injector();

        sampler.sample_at(t0());
        faults.set_offline(true);
        for s in 1..=4 {
            sampler.sample_at(t0() + TimeDelta::seconds(s));
        }
        // Seconds 1, 2 and 3 were sealed empty.
        let events: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert!(events.contains(&PipelineEvent::Status(StatusEvent::Stalled { empty_seconds: 3 })));
        assert_eq!(queue.len(), 1);

        faults.set_offline(false);
        sampler.sample_at(t0() + TimeDelta::seconds(5));
        sampler.sample_at(t0() + TimeDelta::seconds(6));
        assert_eq!(rx.try_recv().unwrap(), PipelineEvent::Status(StatusEvent::ConnectivityChanged { connected: true }));
        assert_eq!(rx.try_recv().unwrap(), PipelineEvent::Status(StatusEvent::Recovered));
    }

    #[test]
    fn paused_seconds_are_not_stalls() {
        let (mut sampler, queue, events) = sampler(100);
        let mut rx = events.subscribe();
        sampler.control().pause();
        for s in 0..6 {
            sampler.sample_at(t0() + TimeDelta::seconds(s));
        }
        assert!(queue.is_empty());
        assert!(rx.try_recv().is_err());
        assert_eq!(sampler.control().total_samples(), 0);
    }

    #[test]
    fn backwards_clock_discards_sample() {
        let (mut sampler, queue, _) = sampler(100);
        sampler.sample_at(t0() + TimeDelta::seconds(1));
        sampler.sample_at(t0());
        sampler.flush();
        assert_eq!(pop(&queue).len(), 1);
    }

    #[test]
    #[traced_test]
    fn overflow_is_counted_and_logged() {
        let queue = Arc::new(HandoffQueue::new(1));
        let control = SamplerControl::new(100, 100, 1000);
        let mut sampler = Sampler::new(
            MockAccelerometer::with_seed(9),
            control.clone(),
            queue,
            EventBus::new(8),
            3,
        );
        for s in 0..4 {
            sampler.sample_at(t0() + TimeDelta::seconds(s));
        }
        assert_eq!(control.dropped_buckets(), 2);
        assert!(logs_contain("Bucket handoff queue full"));
    }

    #[test]
    fn spawned_thread_stops_and_flushes() {
        let queue = Arc::new(HandoffQueue::new(8));
        let sampler = Sampler::new(
            MockAccelerometer::with_seed(5),
            SamplerControl::new(1000, 100, 1000),
            queue.clone(),
            EventBus::new(8),
            3,
        );
        let thread = sampler.spawn().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        let control = thread.control();
        thread.stop().unwrap();
        assert!(control.total_samples() > 0);
        assert!(!queue.is_empty());
    }
}
