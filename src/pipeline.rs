//! Storage worker.
//!
//! Runs on its own thread so disk latency never reaches the sampler. For each sealed
//! bucket it writes the file, admits it to the retention window (which updates the
//! aggregate in the same step), announces it on the event bus and, when the persist
//! schedule fires, rewrites the aggregate artifacts.

use crate::acquisition::{HandoffQueue, Pop, SealedBucket};
use crate::data::{aggregate, PersistSchedule, RetentionManager};
use crate::error::{AppResult, DaqError};
use crate::status::{EventBus, PipelineEvent};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// How long the worker waits for a bucket before checking the persist timer.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Consumer side of the bucket handoff.
pub struct StorageWorker {
    queue: Arc<HandoffQueue>,
    retention: Arc<RetentionManager>,
    events: EventBus,
    schedule: PersistSchedule,
}

impl StorageWorker {
    /// Worker draining `queue` into `retention`.
    pub fn new(
        queue: Arc<HandoffQueue>,
        retention: Arc<RetentionManager>,
        events: EventBus,
        schedule: PersistSchedule,
    ) -> Self {
        Self {
            queue,
            retention,
            events,
            schedule,
        }
    }

    /// Write, admit and announce one bucket. Storage errors are logged and the
    /// bucket is dropped.
    pub fn process(&mut self, bucket: &SealedBucket) {
        let file = match self.retention.store().write(bucket) {
            Ok(file) => file,
            Err(e) => {
                error!(
                    second = %bucket.second(),
                    readings = bucket.len(),
                    error = %e,
                    "Failed to write bucket; readings dropped"
                );
                return;
            }
        };
        let filename = file.path().to_string();
        let samples = file.readings().len();
        let admission = self.retention.admit(file);
        debug!(
            path = %filename,
            samples,
            evicted = admission.evicted.len(),
            "File admitted"
        );
        self.events.publish(PipelineEvent::NewFile {
            filename,
            total_files: admission.total_files,
            samples,
        });
        self.schedule.record_admission();
    }

    /// Persist the aggregate artifacts if the schedule says so, or unconditionally when
    /// `force` is set and something was admitted since the last write.
    pub fn maybe_persist(&mut self, force: bool) {
        let now = Instant::now();
        if !(self.schedule.is_due(now) || (force && self.schedule.has_pending())) {
            return;
        }
        let view = self.retention.snapshot();
        match aggregate::persist(self.retention.store(), &view) {
            Ok(()) => self.schedule.mark_persisted(now),
            Err(e) => error!(error = %e, "Failed to persist aggregate"),
        }
    }

    /// Loop until the queue is closed and drained, then write the final artifacts.
    pub fn run(mut self) {
        info!("Storage worker started");
        loop {
            match self.queue.pop_timeout(POLL_INTERVAL) {
                Pop::Bucket(bucket) => self.process(&bucket),
                Pop::Timeout => {}
                Pop::Closed => break,
            }
            self.maybe_persist(false);
        }
        self.maybe_persist(true);
        info!("Storage worker stopped");
    }

    /// Run on a thread named `storage-worker`.
    pub fn spawn(self) -> std::io::Result<WorkerThread> {
        let handle = std::thread::Builder::new()
            .name("storage-worker".into())
            .spawn(move || self.run())?;
        Ok(WorkerThread { handle })
    }
}

/// Join handle for the storage worker.
#[derive(Debug)]
pub struct WorkerThread {
    handle: JoinHandle<()>,
}

impl WorkerThread {
    /// Wait for the worker to drain the (already closed) queue.
    pub fn join(self) -> AppResult<()> {
        self.handle
            .join()
            .map_err(|_| DaqError::Storage("storage worker panicked".into()))
    }
}
