//! WebSocket endpoint.
//!
//! One accept loop, one task per client. A client task multiplexes three inputs with
//! `tokio::select!`: frames from its socket, frames from the broadcaster and the
//! service-wide shutdown signal. Failures are contained in the task; other clients and
//! the pipeline never notice.

use crate::error::{AppResult, DaqError};
use crate::network::broadcaster::Broadcaster;
use crate::network::protocol::ServerMessage;
use crate::network::router::CommandRouter;
use crate::network::session::{ClientRegistry, ConnectionState};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// A client that cannot take a frame within this time is dropped.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
/// How long shutdown waits for clients to receive their notice.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

type Socket = tokio_tungstenite::WebSocketStream<TcpStream>;
type Sink = futures::stream::SplitSink<Socket, Message>;

/// Shared handles every client task needs.
#[derive(Clone)]
struct ClientContext {
    router: CommandRouter,
    broadcaster: Broadcaster,
    clients: ClientRegistry,
    shutdown: watch::Receiver<bool>,
}

/// Listening WebSocket server.
pub struct WsServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    context: ClientContext,
}

impl WsServer {
    /// Bind the listening socket. Failure is fatal for the service.
    pub async fn bind(
        addr: SocketAddr,
        router: CommandRouter,
        broadcaster: Broadcaster,
        clients: ClientRegistry,
        shutdown: watch::Receiver<bool>,
    ) -> AppResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| DaqError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| DaqError::Bind { addr, source })?;
        info!(addr = %local_addr, "WebSocket server listening");
        Ok(Self {
            listener,
            local_addr,
            context: ClientContext {
                router,
                broadcaster,
                clients,
                shutdown,
            },
        })
    }

    /// Address actually bound (useful with port 0 in tests).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept clients until shutdown, then give connected clients a moment to receive
    /// their shutdown notice.
    pub async fn run(self) {
        let mut tasks = JoinSet::new();
        let mut shutdown = self.context.shutdown.clone();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let context = self.context.clone();
                        tasks.spawn(async move {
                            if let Err(e) = handle_client(stream, peer, context).await {
                                warn!(%peer, error = %e, "Client connection ended with error");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "Accept error"),
                },
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
                _ = shutdown.changed() => break,
            }
        }

        let drain = async { while tasks.join_next().await.is_some() {} };
        if timeout(CLOSE_GRACE, drain).await.is_err() {
            warn!("Clients did not close in time; aborting connections");
            tasks.abort_all();
        }
        info!("WebSocket server stopped");
    }
}

async fn send(sink: &mut Sink, message: &ServerMessage) -> AppResult<()> {
    send_frame(sink, Message::Text(message.to_json())).await
}

async fn send_frame(sink: &mut Sink, frame: Message) -> AppResult<()> {
    match timeout(WRITE_TIMEOUT, sink.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(DaqError::Protocol(format!("send failed: {e}"))),
        Err(_) => Err(DaqError::Protocol("send timed out".into())),
    }
}

async fn close(sink: &mut Sink, code: CloseCode, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    let _ = send_frame(sink, Message::Close(Some(frame))).await;
}

async fn handle_client(stream: TcpStream, peer: SocketAddr, ctx: ClientContext) -> AppResult<()> {
    let socket = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| DaqError::Protocol(format!("handshake failed: {e}")))?;
    let session = ctx.clients.register(peer);
    info!(%peer, client = %session.id, "Client connected");

    let mut frames = ctx.broadcaster.subscribe();
    let (mut sink, mut incoming) = socket.split();
    let result = serve(&ctx, &session.id, &mut sink, &mut incoming, &mut frames).await;

    ctx.clients.remove(&session.id);
    info!(%peer, client = %session.id, "Client disconnected");
    result
}

async fn serve(
    ctx: &ClientContext,
    id: &uuid::Uuid,
    sink: &mut Sink,
    incoming: &mut futures::stream::SplitStream<Socket>,
    frames: &mut broadcast::Receiver<crate::network::broadcaster::Frame>,
) -> AppResult<()> {
    let mut shutdown = ctx.shutdown.clone();
    send(sink, &ctx.router.status_message()).await?;
    ctx.clients.transition(id, ConnectionState::AwaitingCommand);

    loop {
        if *shutdown.borrow() {
            return say_goodbye(sink).await;
        }
        tokio::select! {
            message = incoming.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    ctx.clients.transition(id, ConnectionState::Processing);
                    let outcome = ctx.router.handle_text(&text).await;
                    send(sink, &outcome.reply).await?;
                    if let Some(broadcast) = outcome.broadcast {
                        ctx.broadcaster.send(&broadcast);
                    }
                    ctx.clients.transition(id, ConnectionState::AwaitingCommand);
                }
                Some(Ok(Message::Binary(_))) => {
                    send(sink, &ServerMessage::error("Binary frames are not supported; send JSON text")).await?;
                }
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(client = %id, error = %e, "Read error");
                    return Ok(());
                }
            },
            frame = frames.recv() => match frame {
                Ok(frame) => send_frame(sink, Message::Text(frame.to_string())).await?,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(client = %id, missed, "Client too slow; disconnecting");
                    let notice = ServerMessage::error(format!("Disconnected: {missed} messages behind"));
                    let _ = send(sink, &notice).await;
                    close(sink, CloseCode::Policy, "client too slow").await;
                    return Ok(());
                }
                Err(broadcast::error::RecvError::Closed) => return say_goodbye(sink).await,
            },
            _ = shutdown.changed() => return say_goodbye(sink).await,
        }
    }
}

async fn say_goodbye(sink: &mut Sink) -> AppResult<()> {
    let notice = ServerMessage::Shutdown {
        message: "Server shutting down".into(),
    };
    let _ = send(sink, &notice).await;
    close(sink, CloseCode::Away, "server shutting down").await;
    Ok(())
}
