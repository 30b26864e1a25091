//! Client-facing WebSocket channel: wire protocol, command routing, event fan-out and
//! connection bookkeeping.
pub mod broadcaster;
pub mod protocol;
pub mod router;
pub mod server;
pub mod session;

pub use broadcaster::Broadcaster;
pub use protocol::{Command, ServerMessage, ZipExportResult};
pub use router::{CommandRouter, Outcome};
pub use server::WsServer;
pub use session::{ClientRegistry, ClientSession, ConnectionState};
