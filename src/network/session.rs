//! Registry of connected clients.
//!
//! Each connection moves through `Connected -> (AwaitingCommand <-> Processing) -> Closed`.
//! The registry is only bookkeeping for status and logs; it never holds a socket, so a
//! slow client cannot block anything that reads it.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};
use uuid::Uuid;

/// Lifecycle of one client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake done, initial status not yet sent.
    Connected,
    /// Idle, waiting for the next frame.
    AwaitingCommand,
    /// A command is being handled.
    Processing,
    /// The connection is gone.
    Closed,
}

impl ConnectionState {
    /// Whether moving to `next` is a legal transition.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connected, AwaitingCommand)
                | (AwaitingCommand, Processing)
                | (Processing, AwaitingCommand)
                | (Connected | AwaitingCommand | Processing, Closed)
        )
    }
}

/// One connected client.
#[derive(Debug, Clone)]
pub struct ClientSession {
    /// Connection id used in logs.
    pub id: Uuid,
    /// Remote address.
    pub peer: SocketAddr,
    /// When the connection was accepted.
    pub connected_at: DateTime<Utc>,
    /// Current lifecycle state.
    pub state: ConnectionState,
    /// Commands handled so far.
    pub commands: u64,
}

/// Shared map of live sessions.
#[derive(Debug, Clone, Default)]
pub struct ClientRegistry {
    sessions: Arc<RwLock<HashMap<Uuid, ClientSession>>>,
}

impl ClientRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly accepted connection.
    pub fn register(&self, peer: SocketAddr) -> ClientSession {
        let session = ClientSession {
            id: Uuid::new_v4(),
            peer,
            connected_at: Utc::now(),
            state: ConnectionState::Connected,
            commands: 0,
        };
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session.id, session.clone());
        session
    }

    /// Move a session to `next`. Returns false for unknown ids or illegal transitions.
    pub fn transition(&self, id: &Uuid, next: ConnectionState) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        match sessions.get_mut(id) {
            Some(session) if session.state.can_transition_to(next) => {
                if next == ConnectionState::Processing {
                    session.commands += 1;
                }
                session.state = next;
                true
            }
            _ => false,
        }
    }

    /// Close and forget a session.
    pub fn remove(&self, id: &Uuid) -> Option<ClientSession> {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .map(|mut session| {
                session.state = ConnectionState::Closed;
                session
            })
    }

    /// Look up a session.
    pub fn get(&self, id: &Uuid) -> Option<ClientSession> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Number of live sessions.
    pub fn count(&self) -> usize {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}
