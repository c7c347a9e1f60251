//! The sync kernel: client and server state machines.
//!
//! Grounded on `enterprise::collaboration::session` (`CollaborationSession`,
//! `Participant` map, `SessionConfig`) for the room/session skeleton,
//! `enterprise::realtime::room` (`Room`, room-capacity vocabulary) for the
//! room shape, and `enterprise::collaboration::sync_engine` (`SyncState`,
//! `SyncMessage`) for the catch-up/broadcast plumbing.

pub mod auth;
pub mod client;
pub mod server;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

pub use auth::{AuthAdapter, AuthContext, DefaultAuthAdapter};
pub use client::{
    ClientError, ClientEvent, ClientState, ClientTransport, ReconnectConfig, SyncClient,
    SyncClientConfig, SyncClientError, TransportError,
};
pub use server::{ServerConfig, SyncServer};

use crate::policy::PolicyManifest;
use crate::protocol::{Envelope, PresencePayload};

/// The role a client was granted at handshake time. Advisory on the client
/// side; `authorize()` remains the server's sole authority (§9 open question).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Read-only.
    Viewer,
    /// Read-write.
    Editor,
    /// Read-write plus room administration.
    Admin,
}

/// Per-session server-side record for one connected client.
#[derive(Debug, Clone)]
pub struct ClientConnection {
    /// The client's declared id.
    pub client_id: String,
    /// The document this connection is joined to.
    pub doc_id: String,
    /// The session id allocated at handshake.
    pub session_id: String,
    /// The authenticated user id, if any.
    pub user_id: Option<String>,
    /// The granted role, if the auth adapter returned one.
    pub role: Option<Role>,
    /// Free-form user metadata supplied at handshake.
    pub user_meta: Option<serde_json::Value>,
    /// The manifest negotiated for this session.
    pub effective_manifest: PolicyManifest,
    /// The last frontier tag this client is known to have observed.
    pub last_frontier_tag: String,
    /// The client's current presence, if any.
    pub presence: Option<PresenceState>,
    /// When the connection was established.
    pub connected_at: DateTime<Utc>,
    /// When the last inbound message from this client was processed.
    pub last_message_at: DateTime<Utc>,
}

/// A client's presence payload plus its expiry.
#[derive(Debug, Clone)]
pub struct PresenceState {
    /// The presence payload itself.
    pub payload: PresencePayload,
    /// When this presence expires absent a refresh.
    pub expires_at: DateTime<Utc>,
}

/// One message handed to a connection's outbound sink: either a frame to
/// relay to the peer, or an instruction to close the transport with a
/// specific WebSocket close code (see §6's close-code table).
#[derive(Debug, Clone)]
pub enum SinkMessage {
    /// Relay this envelope to the peer as-is.
    Frame(Envelope),
    /// Close the underlying transport with this close code.
    Close(u16),
}

/// One connected transport, as the server sees it: just a way to push
/// envelopes (or a close instruction) to that peer. The real binary wires
/// this to a WebSocket sink; tests wire it to an `UnboundedSender` they can
/// drain.
pub type OutboundSink = UnboundedSender<SinkMessage>;

/// Per-document server state: the set of connected clients and the
/// presence-batching queue.
pub struct Room {
    /// The document this room serves.
    pub doc_id: String,
    /// The room's current frontier tag.
    pub current_frontier_tag: String,
    /// Connected clients, by client id.
    pub clients: HashMap<String, ClientConnection>,
    /// Outbound sinks, by client id, kept separate from `clients` so
    /// broadcast doesn't need to borrow through the connection record.
    pub sinks: HashMap<String, OutboundSink>,
    /// Client ids whose presence changed since the last broadcast.
    pub dirty_presence_clients: std::collections::HashSet<String>,
    /// Whether a presence-broadcast timer is currently pending.
    pub presence_broadcast_pending: bool,
}

impl Room {
    /// Construct an empty room for `doc_id` at the given starting frontier.
    pub fn new(doc_id: impl Into<String>, current_frontier_tag: impl Into<String>) -> Self {
        Self {
            doc_id: doc_id.into(),
            current_frontier_tag: current_frontier_tag.into(),
            clients: HashMap::new(),
            sinks: HashMap::new(),
            dirty_presence_clients: std::collections::HashSet::new(),
            presence_broadcast_pending: false,
        }
    }

    /// Whether the room has no connected clients.
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Send an envelope to one client, dropping it silently if the client's
    /// sink has gone away (disconnected between the broadcast decision and
    /// the send).
    pub fn send_to(&self, client_id: &str, envelope: Envelope) {
        if let Some(sink) = self.sinks.get(client_id) {
            let _ = sink.send(SinkMessage::Frame(envelope));
        }
    }

    /// Send an envelope to every client except `except_client_id`.
    pub fn broadcast_except(&self, except_client_id: &str, envelope: &Envelope) {
        for (client_id, sink) in &self.sinks {
            if client_id != except_client_id {
                let _ = sink.send(SinkMessage::Frame(envelope.clone()));
            }
        }
    }

    /// Instruct one client's transport to close with `code`, dropping the
    /// instruction silently if the client's sink has already gone away.
    pub fn close(&self, client_id: &str, code: u16) {
        if let Some(sink) = self.sinks.get(client_id) {
            let _ = sink.send(SinkMessage::Close(code));
        }
    }

    /// Instruct every connected client's transport to close with `code`.
    pub fn close_all(&self, code: u16) {
        for sink in self.sinks.values() {
            let _ = sink.send(SinkMessage::Close(code));
        }
    }

    /// Build the full current presence snapshot for `presence_ack`.
    pub fn presence_snapshot(&self) -> Vec<crate::protocol::PresenceEntry> {
        self.clients
            .values()
            .map(|c| crate::protocol::PresenceEntry {
                client_id: c.client_id.clone(),
                presence: c.presence.as_ref().map(|p| p.payload.clone()),
            })
            .collect()
    }
}

/// Errors raised by the sync kernel that don't already have a more specific
/// module-local type.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The caller attempted an operation that requires a different client
    /// state (e.g. `sendUpdate` while not connected).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A storage operation failed.
    #[error("storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),

    /// A protocol-level operation failed.
    #[error("protocol error: {0}")]
    Protocol(#[from] crate::protocol::ProtocolError),

    /// A policy negotiation failed.
    #[error("policy error: {0}")]
    Policy(#[from] crate::policy::PolicyError),
}

/// Result alias for the sync module.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Infer the actor type for an inbound `doc_update`, used when appending an
/// operation log entry (see [`crate::audit::infer_actor_type`]).
pub fn infer_update_actor_type(
    origin: Option<&str>,
    user_id: Option<&str>,
) -> crate::audit::ActorType {
    crate::audit::infer_actor_type(origin, user_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_starts_empty() {
        let room = Room::new("doc-1", "t0");
        assert!(room.is_empty());
        assert!(room.presence_snapshot().is_empty());
    }
}
