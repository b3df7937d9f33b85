//! Listener Dispatch
//!
//! Connection bindings of one session and the fan-out of its events. Each
//! binding is a connection id plus a bounded queue drained by that
//! connection's writer task; the session never writes to a socket itself.
//! Pushes use `try_send`, so a full or closed queue is reported back instead
//! of blocking the session, and the session turns it into a disconnect.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::protocol::ServerEvent;

/// Identifies one transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // short form for logs
        write!(f, "{}", hex::encode(&self.0.as_bytes()[..6]))
    }
}

/// Which binding a connection arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// WebSocket call/return.
    Rpc,
    /// Length-prefixed binary stream.
    Stream,
}

/// Why a push did not go out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    /// The connection is not keeping up.
    Full,
    /// The connection's writer is gone.
    Closed,
}

/// The server's handle for pushing events to one connection.
#[derive(Debug, Clone)]
pub struct PushHandle {
    pub connection: ConnectionId,
    pub transport: TransportKind,
    sender: mpsc::Sender<ServerEvent>,
}

impl PushHandle {
    pub fn new(connection: ConnectionId, transport: TransportKind, sender: mpsc::Sender<ServerEvent>) -> Self {
        Self { connection, transport, sender }
    }

    /// Queue an event without waiting.
    pub fn push(&self, event: ServerEvent) -> Result<(), PushError> {
        self.sender.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PushError::Full,
            mpsc::error::TrySendError::Closed(_) => PushError::Closed,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// A player's live connection.
#[derive(Debug, Clone)]
pub struct ConnectionBinding {
    pub nickname: String,
    pub handle: PushHandle,
    pub last_heartbeat: Instant,
}

/// All live bindings of one session, keyed by nickname.
#[derive(Debug, Default)]
pub struct ListenerTable {
    bindings: BTreeMap<String, ConnectionBinding>,
}

impl ListenerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Bind a nickname to a connection, returning the binding it replaced.
    pub fn attach(&mut self, nickname: &str, handle: PushHandle, now: Instant) -> Option<ConnectionBinding> {
        let binding = ConnectionBinding {
            nickname: nickname.to_string(),
            handle,
            last_heartbeat: now,
        };
        self.bindings.insert(nickname.to_string(), binding)
    }

    /// Remove a nickname's binding whatever connection holds it.
    pub fn detach(&mut self, nickname: &str) -> Option<ConnectionBinding> {
        self.bindings.remove(nickname)
    }

    /// Remove the binding only if it still belongs to `connection`. A stale
    /// connection must not unbind the one that replaced it.
    pub fn detach_connection(&mut self, nickname: &str, connection: ConnectionId) -> bool {
        if self.is_bound_to(nickname, connection) {
            self.bindings.remove(nickname);
            true
        } else {
            false
        }
    }

    pub fn is_bound_to(&self, nickname: &str, connection: ConnectionId) -> bool {
        self.bindings
            .get(nickname)
            .map(|b| b.handle.connection == connection)
            .unwrap_or(false)
    }

    pub fn get(&self, nickname: &str) -> Option<&ConnectionBinding> {
        self.bindings.get(nickname)
    }

    /// Refresh the liveness timestamp. Nothing else changes.
    pub fn refresh(&mut self, nickname: &str, connection: ConnectionId, now: Instant) -> bool {
        match self.bindings.get_mut(nickname) {
            Some(binding) if binding.handle.connection == connection => {
                binding.last_heartbeat = now;
                true
            }
            _ => false,
        }
    }

    /// Nicknames whose last heartbeat is older than `timeout`.
    pub fn expired(&self, now: Instant, timeout: Duration) -> Vec<String> {
        self.bindings
            .values()
            .filter(|b| now.saturating_duration_since(b.last_heartbeat) > timeout)
            .map(|b| b.nickname.clone())
            .collect()
    }

    /// Push one event to every binding. Returns the nicknames that could not
    /// be reached; their bindings are already removed.
    pub fn broadcast(&mut self, event: &ServerEvent) -> Vec<String> {
        let mut unreachable = Vec::new();
        for binding in self.bindings.values() {
            if let Err(error) = binding.handle.push(event.clone()) {
                tracing::warn!(
                    nickname = %binding.nickname,
                    connection = %binding.handle.connection,
                    ?error,
                    "push failed, dropping binding"
                );
                unreachable.push(binding.nickname.clone());
            }
        }
        for nickname in &unreachable {
            self.bindings.remove(nickname);
        }
        unreachable
    }
}

// =============================================================================
// TESTS
// =============================================================================
