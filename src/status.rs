//! Service status and pipeline events.
//!
//! Producers (the sampler thread and the storage worker) publish [`PipelineEvent`]s on an
//! [`EventBus`]. The network side subscribes and turns them into client messages. The bus
//! is a `tokio::sync::broadcast` channel, whose `send` is synchronous and never blocks, so
//! it is safe to call from the timing-critical sampler thread.

use crate::acquisition::SamplerControl;
use crate::data::{MaxRecord, RetentionManager};
use crate::network::ClientRegistry;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Snapshot of everything the `status` message reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceStatus {
    /// Last read from the sensor succeeded.
    pub connected: bool,
    /// Collection paused by a client.
    pub paused: bool,
    /// Rate currently driving the sampler, in Hz.
    pub sampling_rate: u32,
    /// Rate that will apply at the next second boundary, if a change is waiting.
    pub pending_rate: Option<u32>,
    /// Readings taken since startup.
    pub total_samples: u64,
    /// Sealed seconds lost to handoff overflow.
    pub dropped_buckets: u64,
    /// Files currently in the retention window.
    pub csv_files: usize,
    /// Size of the retained files.
    pub total_size_mb: f64,
    /// Newest retained file, relative to the storage root.
    pub latest_file: Option<String>,
    /// Oldest retained file, relative to the storage root.
    pub oldest_file: Option<String>,
    /// Largest magnitude in the window.
    pub max_record: Option<MaxRecord>,
    /// Connected clients.
    pub clients: usize,
}

/// A change in the sampler's health or configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StatusEvent {
    /// Sensor reads started failing or recovered.
    #[allow(missing_docs)]
    ConnectivityChanged { connected: bool },
    /// This many consecutive seconds produced no readings.
    #[allow(missing_docs)]
    Stalled { empty_seconds: u32 },
    /// Readings are flowing again after a stall.
    Recovered,
    /// A requested rate took effect at a second boundary.
    #[allow(missing_docs)]
    RateChanged { rate_hz: u32 },
}

/// Events flowing from the pipeline to connected clients.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    /// A second file was published and admitted to the window.
    #[allow(missing_docs)]
    NewFile {
        filename: String,
        total_files: usize,
        samples: usize,
    },
    /// Sampler health or configuration changed.
    Status(StatusEvent),
}

/// Fan-out channel for [`PipelineEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    /// Create a bus that buffers up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: PipelineEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Assembles [`ServiceStatus`] from the components that own each field.
#[derive(Clone)]
pub struct StatusReporter {
    sampler: SamplerControl,
    retention: Arc<RetentionManager>,
    clients: ClientRegistry,
}

impl StatusReporter {
    /// Combine the sampler, retention and client views.
    pub fn new(
        sampler: SamplerControl,
        retention: Arc<RetentionManager>,
        clients: ClientRegistry,
    ) -> Self {
        Self {
            sampler,
            retention,
            clients,
        }
    }

    /// Current status. Takes the retention lock briefly; never touches disk.
    pub fn snapshot(&self) -> ServiceStatus {
        let window = self.retention.summary();
        ServiceStatus {
            connected: self.sampler.is_connected(),
            paused: self.sampler.is_paused(),
            sampling_rate: self.sampler.current_rate(),
            pending_rate: self.sampler.pending_rate(),
            total_samples: self.sampler.total_samples(),
            dropped_buckets: self.sampler.dropped_buckets(),
            csv_files: window.files,
            total_size_mb: bytes_to_mb(window.total_bytes),
            latest_file: window.newest.map(|p| p.to_string()),
            oldest_file: window.oldest.map(|p| p.to_string()),
            max_record: window.max_record,
            clients: self.clients.count(),
        }
    }
}

fn bytes_to_mb(bytes: u64) -> f64 {
    let mb = bytes as f64 / (1024.0 * 1024.0);
    (mb * 100.0).round() / 100.0
}
