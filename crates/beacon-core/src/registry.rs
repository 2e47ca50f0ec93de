//! Per-worker connection registry.
//!
//! The registry tracks the transport-level connections attached to one
//! worker and the username each connection has bound, if any. It is mutated
//! only by the owning worker's event loop, so no locking is needed.

use beacon_protocol::Envelope;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Identifier for one transport-level connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    #[must_use]
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Best-effort outbound handle to one client connection.
///
/// Sends never block and never error: once the connection is gone the
/// envelope is silently dropped.
#[derive(Debug, Clone)]
pub struct ClientSink(mpsc::UnboundedSender<Envelope>);

impl ClientSink {
    #[must_use]
    pub fn new(tx: mpsc::UnboundedSender<Envelope>) -> Self {
        Self(tx)
    }

    /// Create a connected sink/receiver pair. The I/O layer drains the
    /// receiver and writes each envelope to the transport.
    #[must_use]
    pub fn pair() -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(tx), rx)
    }

    /// Queue an envelope for the client.
    pub fn send(&self, envelope: Envelope) {
        if self.0.send(envelope).is_err() {
            trace!("dropping envelope for closed connection");
        }
    }
}

struct ConnectionState {
    sink: ClientSink,
    username: Option<String>,
}

/// Connections currently attached to one worker.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, ConnectionState>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a connection.
    pub fn insert(&mut self, id: ConnectionId, sink: ClientSink) {
        debug!(connection = %id, "connection attached");
        self.connections.insert(
            id,
            ConnectionState {
                sink,
                username: None,
            },
        );
    }

    /// Drop a connection. Returns the username that was bound to it, if the
    /// connection existed and was registered.
    pub fn remove(&mut self, id: ConnectionId) -> Option<String> {
        let state = self.connections.remove(&id)?;
        state.username
    }

    /// Outbound sink for a connection.
    #[must_use]
    pub fn sink(&self, id: ConnectionId) -> Option<&ClientSink> {
        self.connections.get(&id).map(|state| &state.sink)
    }

    /// Bind a username to a connection.
    ///
    /// Returns `false` if the connection is unknown.
    pub fn bind(&mut self, id: ConnectionId, username: &str) -> bool {
        match self.connections.get_mut(&id) {
            Some(state) => {
                state.username = Some(username.to_string());
                true
            }
            None => false,
        }
    }

    /// Clear a connection's binding so a later transport close does not
    /// trigger a second deregistration. Returns the username that was bound.
    pub fn unbind(&mut self, id: ConnectionId) -> Option<String> {
        self.connections
            .get_mut(&id)
            .and_then(|state| state.username.take())
    }

    /// The username bound to a connection, if any.
    #[must_use]
    pub fn username(&self, id: ConnectionId) -> Option<&str> {
        self.connections
            .get(&id)
            .and_then(|state| state.username.as_deref())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_unbind() {
        let mut registry = ConnectionRegistry::new();
        let (sink, _rx) = ClientSink::pair();
        let id = ConnectionId::new(1);

        registry.insert(id, sink);
        assert!(registry.bind(id, "alice"));
        assert_eq!(registry.username(id), Some("alice"));

        assert_eq!(registry.unbind(id), Some("alice".to_string()));
        assert_eq!(registry.username(id), None);
        // A second unbind finds nothing.
        assert_eq!(registry.unbind(id), None);
    }

    #[test]
    fn test_bind_unknown_connection() {
        let mut registry = ConnectionRegistry::new();
        assert!(!registry.bind(ConnectionId::new(9), "alice"));
    }

    #[test]
    fn test_remove_returns_binding() {
        let mut registry = ConnectionRegistry::new();
        let (sink, _rx) = ClientSink::pair();
        let id = ConnectionId::new(2);

        registry.insert(id, sink);
        registry.bind(id, "bob");

        assert_eq!(registry.remove(id), Some("bob".to_string()));
        assert!(registry.is_empty());
        assert_eq!(registry.remove(id), None);
    }

    #[tokio::test]
    async fn test_sink_delivery() {
        let mut registry = ConnectionRegistry::new();
        let (sink, mut rx) = ClientSink::pair();
        let id = ConnectionId::new(3);
        registry.insert(id, sink);

        registry
            .sink(id)
            .unwrap()
            .send(Envelope::ack(true, "alice"));

        assert_eq!(rx.recv().await, Some(Envelope::ack(true, "alice")));
    }

    #[test]
    fn test_sink_send_after_close_is_silent() {
        let (sink, rx) = ClientSink::pair();
        drop(rx);
        // Best-effort: no panic, no error.
        sink.send(Envelope::ack(true, "alice"));
    }
}
