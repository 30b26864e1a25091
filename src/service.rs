//! The running service.
//!
//! [`Service::start`] builds every component from [`Settings`] and wires them together
//! explicitly; nothing is global. Startup order puts the fatal steps (creating the
//! storage root, binding the port) before any thread is spawned.
//!
//! [`Service::shutdown`] stops in pipeline order:
//! 1. stop the sampler and flush its open bucket,
//! 2. close the handoff queue and let the storage worker drain it and persist the
//!    aggregate,
//! 3. tell every client the server is going away and close the connections.
//!
//! Everything on disk is then a plain catalog that [`RetentionManager::restore`] can
//! rebuild on the next start.

use crate::acquisition::{HandoffQueue, Sampler, SamplerControl, SamplerThread};
use crate::config::Settings;
use crate::data::{FileStore, PersistSchedule, RetentionManager};
use crate::error::{AppResult, DaqError};
use crate::hardware::ReadingSource;
use crate::network::{Broadcaster, ClientRegistry, CommandRouter, WsServer};
use crate::pipeline::{StorageWorker, WorkerThread};
use crate::status::{EventBus, StatusReporter};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Capacity of the internal pipeline event bus.
const EVENT_CAPACITY: usize = 1024;

/// Handle to a running service.
pub struct Service {
    local_addr: SocketAddr,
    sampler: Option<SamplerThread>,
    control: SamplerControl,
    queue: Arc<HandoffQueue>,
    worker: Option<WorkerThread>,
    retention: Arc<RetentionManager>,
    clients: ClientRegistry,
    shutdown: watch::Sender<bool>,
    server: JoinHandle<()>,
    broadcaster: JoinHandle<()>,
}

impl Service {
    /// Build and start everything. Must be called inside a Tokio runtime.
    pub async fn start<S>(settings: &Settings, source: S) -> AppResult<Self>
    where
        S: ReadingSource + 'static,
    {
        settings.validate()?;

        let store = Arc::new(FileStore::open(&settings.storage.root)?);
        let retention = Arc::new(RetentionManager::new(store, settings.storage.max_files));
        let restore_target = retention.clone();
        tokio::task::spawn_blocking(move || restore_target.restore())
            .await
            .map_err(|e| DaqError::Storage(format!("catalog rebuild failed: {e}")))?;

        let s = &settings.sampler;
        let control = SamplerControl::new(s.rate_hz, s.min_rate_hz, s.max_rate_hz);
        let events = EventBus::new(EVENT_CAPACITY);
        let clients = ClientRegistry::new();
        let status = StatusReporter::new(control.clone(), retention.clone(), clients.clone());
        let router = CommandRouter::new(
            control.clone(),
            retention.clone(),
            status.clone(),
            settings.network.clone(),
            settings.storage.keep_exports,
        );
        let broadcaster = Broadcaster::new(settings.network.client_backlog);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let server = WsServer::bind(
            settings.network.bind_addr()?,
            router,
            broadcaster.clone(),
            clients.clone(),
            shutdown_rx.clone(),
        )
        .await?;
        let local_addr = server.local_addr();

        let queue = Arc::new(HandoffQueue::new(s.handoff_capacity));
        let schedule = PersistSchedule::new(
            settings.aggregation.interval,
            settings.aggregation.admissions,
            Instant::now(),
        );
        let worker = StorageWorker::new(queue.clone(), retention.clone(), events.clone(), schedule)
            .spawn()?;
        let sampler = Sampler::new(source, control.clone(), queue.clone(), events.clone(), s.stall_seconds)
            .spawn()?;

        let broadcaster_task = tokio::spawn(broadcaster.run(
            events.subscribe(),
            status,
            settings.network.status_interval,
            shutdown_rx,
        ));
        let server_task = tokio::spawn(server.run());

        info!(
            name = %settings.application.name,
            addr = %local_addr,
            rate_hz = s.rate_hz,
            root = %settings.storage.root.display(),
            max_files = settings.storage.max_files,
            "Service started"
        );
        Ok(Self {
            local_addr,
            sampler: Some(sampler),
            control,
            queue,
            worker: Some(worker),
            retention,
            clients,
            shutdown: shutdown_tx,
            server: server_task,
            broadcaster: broadcaster_task,
        })
    }

    /// Address the WebSocket server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Sampler control surface.
    pub fn control(&self) -> &SamplerControl {
        &self.control
    }

    /// Retention window and aggregate.
    pub fn retention(&self) -> &Arc<RetentionManager> {
        &self.retention
    }

    /// Connected clients.
    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }

    /// Ordered shutdown. Every step runs even if an earlier one failed; the failures
    /// are returned together.
    pub async fn shutdown(mut self) -> AppResult<()> {
        info!("Shutting down");
        let mut errors = Vec::new();

        if let Some(sampler) = self.sampler.take() {
            if let Err(e) = join_blocking(move || sampler.stop()).await {
                errors.push(e);
            }
        }

        self.queue.close();
        if let Some(worker) = self.worker.take() {
            if let Err(e) = join_blocking(move || worker.join()).await {
                errors.push(e);
            }
        }

        let _ = self.shutdown.send(true);
        if let Err(e) = (&mut self.server).await {
            errors.push(DaqError::Protocol(format!("server task failed: {e}")));
        }
        if let Err(e) = (&mut self.broadcaster).await {
            errors.push(DaqError::Protocol(format!("broadcaster task failed: {e}")));
        }

        if errors.is_empty() {
            info!("Shutdown complete");
            Ok(())
        } else {
            for e in &errors {
                error!(error = %e, "Shutdown step failed");
            }
            Err(DaqError::ShutdownFailed(errors))
        }
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        // Releases the worker and client tasks if `shutdown` was never called.
        self.queue.close();
        let _ = self.shutdown.send(true);
    }
}

async fn join_blocking<F>(work: F) -> AppResult<()>
where
    F: FnOnce() -> AppResult<()> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| DaqError::Storage(format!("shutdown task failed: {e}")))?
}
