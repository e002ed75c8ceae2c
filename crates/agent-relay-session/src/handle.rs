//! Per-connection outbound handle.

use std::sync::Arc;

use tokio::sync::mpsc;

use agent_relay_core::{ClientCapability, ClientId, SessionId, SessionNotification};

/// A message queued for delivery to one connection.
///
/// The transport writer turns these into wire frames; per-connection
/// ordering is the channel's FIFO order.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// An already-formed JSON-RPC frame (responses, server requests).
    Frame(serde_json::Value),
    /// A session update to be wrapped as a `session_update` notification.
    SessionUpdate {
        session_id: SessionId,
        update: SessionNotification,
    },
}

/// Handle to one registered connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    /// The connection's client id.
    pub client_id: ClientId,
    outbound: mpsc::UnboundedSender<Outbound>,
    capability: Arc<dyn ClientCapability>,
}

impl ConnectionHandle {
    /// Create a handle from a connection's outbound channel and capability.
    #[must_use]
    pub fn new(
        client_id: ClientId,
        outbound: mpsc::UnboundedSender<Outbound>,
        capability: Arc<dyn ClientCapability>,
    ) -> Self {
        Self {
            client_id,
            outbound,
            capability,
        }
    }

    /// Queue a message. Returns false if the connection's writer is gone.
    pub fn send(&self, msg: Outbound) -> bool {
        self.outbound.send(msg).is_ok()
    }

    /// The capability object for this connection.
    #[must_use]
    pub fn capability(&self) -> Arc<dyn ClientCapability> {
        Arc::clone(&self.capability)
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}
