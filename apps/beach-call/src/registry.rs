use dashmap::DashMap;
use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::protocol::ServerMessage;

/// Identity of one live client channel, unique for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ConnectionId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(ConnectionId)
    }
}

/// Sending half of a connection's outbound queue. The transport drains the
/// receiving half into the socket (or a polling mailbox).
pub type Outbox = mpsc::UnboundedSender<ServerMessage>;

/// Tracks every currently connected client.
pub struct ConnectionRegistry {
    next_id: AtomicU64,
    connections: DashMap<ConnectionId, Outbox>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            connections: DashMap::new(),
        }
    }

    /// Allocate a fresh identity and add the connection to the live set.
    pub fn register(&self, outbox: Outbox) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.connections.insert(id, outbox);
        debug!(connection = %id, live = self.connections.len(), "connection registered");
        id
    }

    /// Like [`register`](Self::register), but queues `greeting` before the
    /// connection becomes visible, so it is always the first message the
    /// client receives.
    pub fn register_with<F>(&self, outbox: Outbox, greeting: F) -> ConnectionId
    where
        F: FnOnce(ConnectionId) -> ServerMessage,
    {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        if let Err(err) = outbox.send(greeting(id)) {
            warn!(connection = %id, error = %err, "failed to deliver greeting");
        }
        self.connections.insert(id, outbox);
        debug!(connection = %id, live = self.connections.len(), "connection registered");
        id
    }

    /// Remove a connection. Returns false when it was already gone.
    pub fn unregister(&self, id: ConnectionId) -> bool {
        let removed = self.connections.remove(&id).is_some();
        if removed {
            debug!(connection = %id, live = self.connections.len(), "connection unregistered");
        }
        removed
    }

    pub fn is_live(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Best-effort delivery. Messages for vanished connections are dropped,
    /// and a closed outbox is logged and swallowed.
    pub fn send(&self, id: ConnectionId, message: ServerMessage) -> bool {
        let Some(outbox) = self.connections.get(&id) else {
            debug!(connection = %id, "dropping message for vanished connection");
            return false;
        };
        match outbox.send(message) {
            Ok(()) => true,
            Err(err) => {
                warn!(connection = %id, error = %err, "failed to deliver message");
                false
            }
        }
    }

    /// Deliver to every live connection not in `excluded`. Returns the number
    /// of successful deliveries.
    pub fn broadcast_except(&self, excluded: &[ConnectionId], message: &ServerMessage) -> usize {
        let targets: Vec<ConnectionId> = self
            .connections
            .iter()
            .map(|entry| *entry.key())
            .filter(|id| !excluded.contains(id))
            .collect();

        targets
            .into_iter()
            .filter(|id| self.send(*id, message.clone()))
            .count()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
