//! Fan-out of unsolicited messages to every connected client.
//!
//! Messages are encoded once and shared as `Arc<str>`. Each client task holds its own
//! receiver on a bounded broadcast channel; a client that falls more than the channel
//! capacity behind sees `Lagged` and is disconnected, so a slow reader never applies
//! backpressure to the pipeline.

use crate::network::protocol::ServerMessage;
use crate::status::{PipelineEvent, StatusReporter};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Encoded frame shared between client tasks.
pub type Frame = Arc<str>;

/// Sender side of the client fan-out.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    sender: broadcast::Sender<Frame>,
}

impl Broadcaster {
    /// Channel buffering up to `backlog` frames per client.
    pub fn new(backlog: usize) -> Self {
        let (sender, _) = broadcast::channel(backlog.max(1));
        Self { sender }
    }

    /// Send to every subscribed client. Returns how many clients were reached.
    pub fn send(&self, message: &ServerMessage) -> usize {
        let frame: Frame = message.to_json().into();
        self.sender.send(frame).unwrap_or(0)
    }

    /// Receiver for a new client.
    pub fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.sender.subscribe()
    }

    /// Number of subscribed clients.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Translate pipeline events into client messages and push a periodic `status`
    /// until `shutdown` flips to true.
    pub async fn run(
        self,
        mut events: broadcast::Receiver<PipelineEvent>,
        status: StatusReporter,
        status_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(status_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(PipelineEvent::NewFile { filename, total_files, samples }) => {
                        self.send(&ServerMessage::NewFile { filename, total_files, samples });
                    }
                    Ok(PipelineEvent::Status(change)) => {
                        self.send(&ServerMessage::Status {
                            data: status.snapshot(),
                            event: Some(change),
                        });
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Broadcaster fell behind the pipeline; events skipped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = ticker.tick() => {
                    if self.receiver_count() > 0 {
                        let reached = self.send(&ServerMessage::Status { data: status.snapshot(), event: None });
                        debug!(reached, "Periodic status sent");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Broadcaster stopped");
    }
}
