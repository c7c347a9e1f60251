//! The sync client: connection lifecycle, handshake, catch-up, sending,
//! and the ping/reconnect timers.
//!
//! Grounded on `enterprise::collaboration::sync_engine`'s client-side replay
//! loop for the send/ack bookkeeping, and `enterprise::realtime::channel`
//! for the state machine and exponential-backoff reconnect shape. The
//! per-process `seq` counter is an `AtomicU64` owned by this instance
//! rather than a module-scoped global, per the redesign note against
//! sharing one counter across connections.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::policy::{self, PolicyManifest};
use crate::protocol::{
    self, CatchUpRequestPayload, ClientCapabilities, Cursor, DocUpdatePayload, Envelope,
    ErrorCategory, ErrorCode, Payload, PresencePayload, PresenceStatus, Selection,
};

use super::Role;

/// Outbound transport the client sends frames through. A real binary wires
/// this to a WebSocket sink; tests wire it to an in-memory channel that
/// feeds frames back through [`SyncClient::handle_inbound_frame`].
#[async_trait]
pub trait ClientTransport: Send + Sync {
    /// Send one raw text frame.
    async fn send(&self, frame: String) -> std::result::Result<(), TransportError>;

    /// Close the underlying connection with the given close code.
    async fn close(&self, code: u16);
}

/// A transport-level send failure.
#[derive(Debug, Error)]
#[error("transport send failed: {0}")]
pub struct TransportError(pub String);

/// Reconnect policy: exponential backoff with a cap, optionally unlimited
/// attempts (`max_attempts < 0`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Whether the client auto-reconnects on transport close.
    pub enabled: bool,
    /// Maximum reconnect attempts. Negative means unlimited.
    pub max_attempts: i64,
    /// Base delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Ceiling on the exponentially-growing delay, in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: -1,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct SyncClientConfig {
    /// The document to join.
    pub doc_id: String,
    /// This client's id.
    pub client_id: String,
    /// The manifest this client proposes at handshake.
    pub policy_manifest: PolicyManifest,
    /// Declared capabilities, informational only.
    pub capabilities: ClientCapabilities,
    /// Free-form user metadata sent at handshake.
    pub user_meta: Option<serde_json::Value>,
    /// An opaque bearer token for the server's auth adapter.
    pub token: Option<String>,
    /// Reconnect policy.
    pub reconnect: ReconnectConfig,
    /// Interval between liveness pings while connected.
    pub ping_interval_ms: u64,
    /// How long `connect()` waits for `handshake_ack` before failing.
    pub connect_timeout_ms: u64,
}

impl Default for SyncClientConfig {
    fn default() -> Self {
        Self {
            doc_id: String::new(),
            client_id: String::new(),
            policy_manifest: PolicyManifest {
                policy_id: "weave:v1".to_string(),
                ai_sanitization_policy: Default::default(),
                max_update_size: 10 * 1024 * 1024,
                protocol_features: Default::default(),
                presence_ttl_ms: 30_000,
            },
            capabilities: ClientCapabilities {
                features: Vec::new(),
                max_update_size: 10 * 1024 * 1024,
                supports_binary: false,
                supports_compression: false,
            },
            user_meta: None,
            token: None,
            reconnect: ReconnectConfig::default(),
            ping_interval_ms: 15_000,
            connect_timeout_ms: 10_000,
        }
    }
}

/// The client half of the sync kernel's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No transport, not attempting to connect.
    Disconnected,
    /// Transport opening.
    Connecting,
    /// Transport open, handshake sent, awaiting `handshake_ack`.
    Handshaking,
    /// Handshake completed; steady state.
    Connected,
    /// Transport closed unexpectedly; backoff in progress.
    Reconnecting,
    /// Terminal: a non-retryable failure occurred.
    Error,
}

/// A structured error surfaced either from the server's `error` envelope or
/// from a local failure (handshake validation, timeout, transport error).
#[derive(Debug, Clone)]
pub struct ClientError {
    /// The error code, if this originated from a server `error` envelope.
    pub code: Option<ErrorCode>,
    /// The error's category.
    pub category: ErrorCategory,
    /// Human-readable message.
    pub message: String,
    /// Whether the caller may usefully retry.
    pub retryable: bool,
    /// Suggested backoff before retrying, in milliseconds.
    pub retry_after_ms: Option<u64>,
    /// Sanitized structured detail, if the server supplied any.
    pub details: Option<serde_json::Value>,
}

/// Events the client emits as it progresses through the state machine.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The state machine transitioned.
    StateChange(ClientState),
    /// Handshake completed successfully.
    Connected {
        /// The session id the server allocated.
        session_id: String,
        /// The room's frontier tag at handshake time.
        server_frontier_tag: String,
    },
    /// The transport closed.
    Disconnected,
    /// A structured error, local or server-sent.
    Error(ClientError),
    /// A CRDT update arrived from the server (from another client, or as
    /// part of catch-up). The external CRDT must apply `data`.
    RemoteUpdate {
        /// The decoded update bytes.
        data: Vec<u8>,
        /// The frontier tag this update produces.
        frontier_tag: String,
    },
    /// A `doc_ack` arrived for a previously sent update.
    UpdateAck {
        /// The envelope `seq` this acks.
        seq: u64,
        /// Whether the server applied the update.
        applied: bool,
        /// Why not, if `!applied`.
        reason: Option<String>,
    },
    /// A `presence_ack` arrived: the full current room presence set.
    PresenceUpdate(Vec<crate::protocol::PresenceEntry>),
    /// Catch-up finished.
    CatchUpComplete {
        /// Whether the catch-up payload was a full snapshot.
        is_snapshot: bool,
        /// The frontier tag catch-up brought the client to.
        frontier_tag: String,
    },
}

/// Errors raised by client-side operations.
#[derive(Debug, Error)]
pub enum SyncClientError {
    /// The requested operation requires a different state, e.g. `sendUpdate`
    /// while not connected.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// The transport rejected a send.
    #[error("transport error: {0}")]
    Transport(String),
    /// `connect()` did not receive `handshake_ack` within its timeout.
    #[error("handshake timed out")]
    HandshakeTimeout,
    /// The server's manifest failed structural validation.
    #[error("server manifest invalid: {0:?}")]
    ServerManifestInvalid(Vec<String>),
    /// Negotiation between this client's manifest and the server's failed.
    #[error("policy negotiation failed: {0}")]
    PolicyIncompatible(String),
    /// The negotiated effective manifest's hash disagreed with the server's.
    #[error("policy hash mismatch")]
    PolicyHashMismatch,
    /// A pending ack's oneshot was dropped (disconnect raced the response).
    #[error("ack cancelled")]
    AckCancelled,
}

/// Result alias for the sync client module.
pub type Result<T> = std::result::Result<T, SyncClientError>;

type ConnectWaiter = oneshot::Sender<Result<()>>;
type AckWaiter = oneshot::Sender<(bool, Option<String>)>;

struct ClientInner {
    config: SyncClientConfig,
    state: Mutex<ClientState>,
    transport: Mutex<Option<Arc<dyn ClientTransport>>>,
    seq: AtomicU64,
    reconnect_attempts: AtomicI64,
    last_frontier_tag: Mutex<Option<String>>,
    effective_manifest: Mutex<Option<PolicyManifest>>,
    session_id: Mutex<Option<String>>,
    server_frontier_tag: Mutex<Option<String>>,
    role: Mutex<Option<Role>>,
    connect_waiter: Mutex<Option<ConnectWaiter>>,
    pending_acks: Mutex<HashMap<u64, AckWaiter>>,
    invalid_message_count: AtomicU64,
    ping_task: Mutex<Option<JoinHandle<()>>>,
    events: mpsc::UnboundedSender<ClientEvent>,
}

/// The client half of the sync kernel.
///
/// Cheaply cloneable: every field lives behind an `Arc`/interior-mutability
/// wrapper so the ping timer task and the caller's receive loop can each
/// hold a handle without fighting the borrow checker.
#[derive(Clone)]
pub struct SyncClient {
    inner: Arc<ClientInner>,
}

impl SyncClient {
    /// Construct a client and its event receiver.
    pub fn new(config: SyncClientConfig) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ClientInner {
            config,
            state: Mutex::new(ClientState::Disconnected),
            transport: Mutex::new(None),
            seq: AtomicU64::new(0),
            reconnect_attempts: AtomicI64::new(0),
            last_frontier_tag: Mutex::new(None),
            effective_manifest: Mutex::new(None),
            session_id: Mutex::new(None),
            server_frontier_tag: Mutex::new(None),
            role: Mutex::new(None),
            connect_waiter: Mutex::new(None),
            pending_acks: Mutex::new(HashMap::new()),
            invalid_message_count: AtomicU64::new(0),
            ping_task: Mutex::new(None),
            events: tx,
        });
        (Self { inner }, rx)
    }

    /// Current state.
    pub fn state(&self) -> ClientState {
        *self.inner.state.lock()
    }

    /// The frontier tag last observed locally, if any. Seeded across
    /// reconnects so the server can skip catch-up when possible.
    pub fn last_frontier_tag(&self) -> Option<String> {
        self.inner.last_frontier_tag.lock().clone()
    }

    /// Number of inbound frames dropped for failing structural validation.
    pub fn invalid_message_count(&self) -> u64 {
        self.inner.invalid_message_count.load(Ordering::Relaxed)
    }

    /// Seed the last-known frontier tag, e.g. from local storage on startup,
    /// before the first `connect()`.
    pub fn seed_last_frontier_tag(&self, tag: impl Into<String>) {
        *self.inner.last_frontier_tag.lock() = Some(tag.into());
    }

    fn next_seq(&self) -> u64 {
        self.inner.seq.fetch_add(1, Ordering::Relaxed)
    }

    fn set_state(&self, state: ClientState) {
        *self.inner.state.lock() = state;
        self.emit(ClientEvent::StateChange(state));
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.inner.events.send(event);
    }

    async fn send_envelope(&self, envelope: &Envelope) -> Result<()> {
        let transport = self.inner.transport.lock().clone();
        let Some(transport) = transport else {
            return Err(SyncClientError::InvalidState("no transport".to_string()));
        };
        let raw = protocol::serialize_envelope(envelope)
            .map_err(|e| SyncClientError::Transport(e.to_string()))?;
        transport
            .send(raw)
            .await
            .map_err(|e| SyncClientError::Transport(e.0))
    }

    fn envelope(&self, payload: Payload) -> Envelope {
        Envelope {
            version: crate::PROTOCOL_VERSION.to_string(),
            doc_id: self.inner.config.doc_id.clone(),
            client_id: self.inner.config.client_id.clone(),
            seq: self.next_seq(),
            timestamp: Utc::now().to_rfc3339(),
            payload,
        }
    }

    /// Open a connection: register `transport`, send `handshake`, and wait
    /// up to `connect_timeout_ms` for a successful `handshake_ack`. The
    /// caller is responsible for actually opening the transport and for
    /// pumping its inbound frames into [`Self::handle_inbound_frame`].
    pub async fn connect(&self, transport: Arc<dyn ClientTransport>) -> Result<()> {
        *self.inner.transport.lock() = Some(transport);
        self.set_state(ClientState::Connecting);
        self.set_state(ClientState::Handshaking);

        let (tx, rx) = oneshot::channel();
        *self.inner.connect_waiter.lock() = Some(tx);

        let manifest = self.inner.config.policy_manifest.clone();
        let last_frontier_tag = self.inner.last_frontier_tag.lock().clone();
        let payload = Payload::Handshake(protocol::HandshakePayload {
            client_manifest: serde_json::to_value(&manifest).expect("manifest serializes"),
            client_manifest_hash: manifest.compute_hash(),
            capabilities: self.inner.config.capabilities.clone(),
            last_frontier_tag,
            token: self.inner.config.token.clone(),
            user_meta: self.inner.config.user_meta.clone(),
        });
        let envelope = self.envelope(payload);
        if let Err(e) = self.send_envelope(&envelope).await {
            *self.inner.connect_waiter.lock() = None;
            self.set_state(ClientState::Error);
            return Err(e);
        }

        let timeout = Duration::from_millis(self.inner.config.connect_timeout_ms);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SyncClientError::AckCancelled),
            Err(_) => {
                *self.inner.connect_waiter.lock() = None;
                self.set_state(ClientState::Error);
                Err(SyncClientError::HandshakeTimeout)
            }
        }
    }

    /// Feed one raw inbound frame to the client. Invalid frames are counted
    /// and dropped rather than dispatched, matching the validator's fuzzing
    /// contract (it never panics, only reports `{ok:false}`).
    pub async fn handle_inbound_frame(&self, raw: &str) {
        let result = protocol::validate_client_inbound(raw);
        if !result.ok {
            self.inner.invalid_message_count.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let envelope = result.envelope.expect("ok implies envelope");
        match envelope.payload {
            Payload::HandshakeAck(ack) => self.on_handshake_ack(ack).await,
            Payload::DocUpdate(update) => self.on_doc_update(update).await,
            Payload::DocAck(ack) => self.on_doc_ack(ack),
            Payload::PresenceAck(ack) => self.emit(ClientEvent::PresenceUpdate(ack.presences)),
            Payload::CatchUpResponse(response) => self.on_catch_up_response(response).await,
            Payload::Error(error) => self.on_error(error),
            Payload::Pong(_) => {}
            _ => {
                self.inner.invalid_message_count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    async fn on_handshake_ack(&self, payload: protocol::HandshakeAckPayload) {
        let server_manifest: PolicyManifest =
            match serde_json::from_value(payload.server_manifest.clone()) {
                Ok(m) => m,
                Err(e) => {
                    self.fail_handshake(SyncClientError::ServerManifestInvalid(vec![e.to_string()]))
                        .await;
                    return;
                }
            };
        let validation = policy::validate_manifest(&server_manifest);
        if !validation.valid {
            let errors = validation.errors.into_iter().map(|e| e.message).collect();
            self.fail_handshake(SyncClientError::ServerManifestInvalid(errors)).await;
            return;
        }

        let negotiation = policy::negotiate(
            &[self.inner.config.policy_manifest.clone(), server_manifest],
            false,
        );
        if !negotiation.success {
            self.fail_handshake(SyncClientError::PolicyIncompatible(negotiation.errors.join("; ")))
                .await;
            return;
        }
        let effective = negotiation.manifest.expect("negotiate reported success");
        if effective.compute_hash() != payload.chosen_manifest_hash {
            self.fail_handshake(SyncClientError::PolicyHashMismatch).await;
            return;
        }

        *self.inner.effective_manifest.lock() = Some(effective);
        *self.inner.session_id.lock() = Some(payload.session_id.clone());
        *self.inner.server_frontier_tag.lock() = Some(payload.server_frontier_tag.clone());
        *self.inner.role.lock() = payload.role.as_deref().and_then(parse_role);

        self.inner.reconnect_attempts.store(0, Ordering::SeqCst);
        self.set_state(ClientState::Connected);
        self.start_ping_timer();

        if let Some(tx) = self.inner.connect_waiter.lock().take() {
            let _ = tx.send(Ok(()));
        }
        self.emit(ClientEvent::Connected {
            session_id: payload.session_id,
            server_frontier_tag: payload.server_frontier_tag.clone(),
        });

        let last = self.inner.last_frontier_tag.lock().clone();
        let needs_catch_up = payload.needs_catch_up
            && last
                .as_ref()
                .map(|tag| tag != &payload.server_frontier_tag)
                .unwrap_or(false);
        if needs_catch_up {
            let _ = self.request_catch_up(false).await;
        }
    }

    async fn fail_handshake(&self, err: SyncClientError) {
        self.set_state(ClientState::Error);
        self.emit(ClientEvent::Error(ClientError {
            code: None,
            category: ErrorCategory::Policy,
            message: err.to_string(),
            retryable: false,
            retry_after_ms: None,
            details: None,
        }));
        if let Some(tx) = self.inner.connect_waiter.lock().take() {
            let _ = tx.send(Err(err));
        }
        self.close_transport(1008).await;
    }

    async fn on_doc_update(&self, payload: DocUpdatePayload) {
        let data = match crate::encoding::decode(&payload.update_data) {
            Ok(bytes) => bytes,
            Err(_) => {
                self.inner.invalid_message_count.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        *self.inner.last_frontier_tag.lock() = Some(payload.frontier_tag.clone());
        self.emit(ClientEvent::RemoteUpdate {
            data,
            frontier_tag: payload.frontier_tag,
        });
    }

    fn on_doc_ack(&self, payload: protocol::DocAckPayload) {
        *self.inner.last_frontier_tag.lock() = Some(payload.server_frontier_tag.clone());
        if let Some(tx) = self.inner.pending_acks.lock().remove(&payload.acked_seq) {
            let _ = tx.send((payload.applied, payload.rejection_reason.clone()));
        }
        self.emit(ClientEvent::UpdateAck {
            seq: payload.acked_seq,
            applied: payload.applied,
            reason: payload.rejection_reason,
        });
    }

    async fn on_catch_up_response(&self, payload: protocol::CatchUpResponsePayload) {
        let data = match crate::encoding::decode(&payload.data) {
            Ok(bytes) => bytes,
            Err(_) => {
                self.inner.invalid_message_count.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        *self.inner.last_frontier_tag.lock() = Some(payload.frontier_tag.clone());
        self.emit(ClientEvent::RemoteUpdate {
            data,
            frontier_tag: payload.frontier_tag.clone(),
        });
        self.emit(ClientEvent::CatchUpComplete {
            is_snapshot: payload.is_snapshot,
            frontier_tag: payload.frontier_tag,
        });
    }

    fn on_error(&self, payload: protocol::ErrorPayload) {
        let retryable = payload.retryable;
        self.emit(ClientEvent::Error(ClientError {
            code: Some(payload.code),
            category: payload.category,
            message: payload.message,
            retryable,
            retry_after_ms: payload.retry_after_ms,
            details: payload.details,
        }));
        if !retryable {
            self.set_state(ClientState::Error);
        }
    }

    /// Send a local CRDT update. Requires [`ClientState::Connected`];
    /// returns the envelope `seq` for ack correlation. Updates
    /// `last_frontier_tag` optimistically before the ack arrives.
    pub async fn send_update(
        &self,
        bytes: &[u8],
        frontier_tag: impl Into<String>,
        parent_frontier_tag: impl Into<String>,
        origin: Option<String>,
    ) -> Result<u64> {
        if self.state() != ClientState::Connected {
            return Err(SyncClientError::InvalidState(
                "sendUpdate requires connected state".to_string(),
            ));
        }
        let frontier_tag = frontier_tag.into();
        let payload = Payload::DocUpdate(DocUpdatePayload {
            update_data: crate::encoding::encode(bytes),
            is_base64: true,
            frontier_tag: frontier_tag.clone(),
            parent_frontier_tag: parent_frontier_tag.into(),
            size_bytes: bytes.len() as u64,
            origin,
        });
        let envelope = self.envelope(payload);
        let seq = envelope.seq;
        self.send_envelope(&envelope).await?;
        *self.inner.last_frontier_tag.lock() = Some(frontier_tag);
        Ok(seq)
    }

    /// Send a local update and wait for its `doc_ack`, for callers that want
    /// promise-style correlation instead of watching the event stream.
    pub async fn send_update_and_wait(
        &self,
        bytes: &[u8],
        frontier_tag: impl Into<String>,
        parent_frontier_tag: impl Into<String>,
        origin: Option<String>,
    ) -> Result<(bool, Option<String>)> {
        let (tx, rx) = oneshot::channel();
        let frontier_tag = frontier_tag.into();
        let parent_frontier_tag = parent_frontier_tag.into();

        if self.state() != ClientState::Connected {
            return Err(SyncClientError::InvalidState(
                "sendUpdate requires connected state".to_string(),
            ));
        }
        let payload = Payload::DocUpdate(DocUpdatePayload {
            update_data: crate::encoding::encode(bytes),
            is_base64: true,
            frontier_tag: frontier_tag.clone(),
            parent_frontier_tag,
            size_bytes: bytes.len() as u64,
            origin,
        });
        let envelope = self.envelope(payload);
        let seq = envelope.seq;
        self.inner.pending_acks.lock().insert(seq, tx);
        if let Err(e) = self.send_envelope(&envelope).await {
            self.inner.pending_acks.lock().remove(&seq);
            return Err(e);
        }
        *self.inner.last_frontier_tag.lock() = Some(frontier_tag);
        rx.await.map_err(|_| SyncClientError::AckCancelled)
    }

    /// Send presence. A silent no-op outside [`ClientState::Connected`].
    pub async fn send_presence(
        &self,
        cursor: Option<Cursor>,
        selection: Option<Selection>,
        status: PresenceStatus,
    ) {
        if self.state() != ClientState::Connected {
            return;
        }
        let payload = Payload::Presence(PresencePayload {
            user_meta: self.inner.config.user_meta.clone().unwrap_or(serde_json::Value::Null),
            cursor,
            selection,
            status,
            last_activity: Utc::now().to_rfc3339(),
        });
        let envelope = self.envelope(payload);
        let _ = self.send_envelope(&envelope).await;
    }

    /// Request catch-up. A no-op (returns `Ok(())` without sending) outside
    /// [`ClientState::Connected`], matching the fire-and-forget contract.
    pub async fn request_catch_up(&self, prefer_snapshot: bool) -> Result<()> {
        if self.state() != ClientState::Connected {
            return Ok(());
        }
        let from_frontier_tag = self.inner.last_frontier_tag.lock().clone().unwrap_or_default();
        let payload = Payload::CatchUpRequest(CatchUpRequestPayload {
            from_frontier_tag,
            prefer_snapshot,
        });
        let envelope = self.envelope(payload);
        self.send_envelope(&envelope).await
    }

    fn start_ping_timer(&self) {
        self.stop_ping_timer();
        let client = self.clone();
        let interval = Duration::from_millis(self.inner.config.ping_interval_ms.max(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if client.state() != ClientState::Connected {
                    break;
                }
                let envelope = client.envelope(Payload::Ping(protocol::EmptyPayload {}));
                let _ = client.send_envelope(&envelope).await;
            }
        });
        *self.inner.ping_task.lock() = Some(handle);
    }

    fn stop_ping_timer(&self) {
        if let Some(handle) = self.inner.ping_task.lock().take() {
            handle.abort();
        }
    }

    async fn close_transport(&self, code: u16) {
        let transport = self.inner.transport.lock().take();
        if let Some(transport) = transport {
            transport.close(code).await;
        }
    }

    /// Explicitly disconnect. Synchronous from the caller's perspective:
    /// the transport is closed and the ping timer stopped before returning.
    /// Pending acks are failed rather than left to dangle.
    pub async fn disconnect(&self) {
        self.stop_ping_timer();
        self.close_transport(1000).await;
        for (_, tx) in self.inner.pending_acks.lock().drain() {
            let _ = tx.send((false, Some("disconnected".to_string())));
        }
        self.set_state(ClientState::Disconnected);
        self.emit(ClientEvent::Disconnected);
    }

    /// React to the transport closing (whether by `disconnect()` or a
    /// network failure). Returns the backoff duration the caller should
    /// sleep before opening a fresh transport and calling `connect()`
    /// again, or `None` if no reconnect should be attempted. Reconnection
    /// itself is the caller's responsibility since opening a new transport
    /// is outside this crate's scope (§1).
    pub fn on_transport_closed(&self) -> Option<Duration> {
        self.stop_ping_timer();
        *self.inner.transport.lock() = None;
        let prior = self.state();
        self.emit(ClientEvent::Disconnected);

        for (_, tx) in self.inner.pending_acks.lock().drain() {
            let _ = tx.send((false, Some("disconnected".to_string())));
        }

        if !self.inner.config.reconnect.enabled
            || !matches!(
                prior,
                ClientState::Connecting
                    | ClientState::Handshaking
                    | ClientState::Connected
                    | ClientState::Reconnecting
            )
        {
            self.set_state(ClientState::Disconnected);
            return None;
        }

        let attempts = self.inner.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if self.inner.config.reconnect.max_attempts >= 0
            && attempts > self.inner.config.reconnect.max_attempts
        {
            self.set_state(ClientState::Error);
            self.emit(ClientEvent::Error(ClientError {
                code: Some(ErrorCode::MaxReconnectAttempts),
                category: ErrorCategory::Internal,
                message: "exhausted reconnect attempts".to_string(),
                retryable: false,
                retry_after_ms: None,
                details: None,
            }));
            return None;
        }

        self.set_state(ClientState::Reconnecting);
        let base = self.inner.config.reconnect.base_delay_ms as f64;
        let cap = self.inner.config.reconnect.max_delay_ms as f64;
        let delay_ms = (base * 2f64.powi((attempts - 1) as i32)).min(cap) as u64;
        Some(Duration::from_millis(delay_ms))
    }
}

fn parse_role(raw: &str) -> Option<Role> {
    match raw {
        "viewer" => Some(Role::Viewer),
        "editor" => Some(Role::Editor),
        "admin" => Some(Role::Admin),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::mpsc::UnboundedSender;

    struct ChannelTransport {
        to_server: UnboundedSender<String>,
        closed: Arc<StdMutex<Option<u16>>>,
    }

    #[async_trait]
    impl ClientTransport for ChannelTransport {
        async fn send(&self, frame: String) -> std::result::Result<(), TransportError> {
            self.to_server
                .send(frame)
                .map_err(|e| TransportError(e.to_string()))
        }

        async fn close(&self, code: u16) {
            *self.closed.lock().unwrap() = Some(code);
        }
    }

    fn manifest() -> PolicyManifest {
        PolicyManifest {
            policy_id: "weave:v1".to_string(),
            ai_sanitization_policy: Default::default(),
            max_update_size: 1_000_000,
            protocol_features: Default::default(),
            presence_ttl_ms: 30_000,
        }
    }

    fn config() -> SyncClientConfig {
        SyncClientConfig {
            doc_id: "doc-1".to_string(),
            client_id: "client-1".to_string(),
            policy_manifest: manifest(),
            connect_timeout_ms: 200,
            ping_interval_ms: 60_000,
            ..SyncClientConfig::default()
        }
    }

    fn ack_for(handshake_raw: &str, manifest: &PolicyManifest) -> String {
        let envelope: Envelope = serde_json::from_str(handshake_raw).unwrap();
        let Payload::Handshake(hs) = envelope.payload else {
            panic!("expected handshake")
        };
        assert_eq!(hs.client_manifest_hash, manifest.compute_hash());

        let negotiation = policy::negotiate(&[manifest.clone(), manifest.clone()], false);
        let effective = negotiation.manifest.unwrap();
        serde_json::json!({
            "version": crate::PROTOCOL_VERSION,
            "docId": "doc-1",
            "clientId": "client-1",
            "seq": 1,
            "timestamp": "2026-01-01T00:00:00Z",
            "type": "handshake_ack",
            "serverManifest": manifest,
            "effectiveManifest": effective,
            "chosenManifestHash": effective.compute_hash(),
            "serverCapabilities": {
                "maxClientsPerRoom": 10,
                "presenceTtlMs": 30000,
                "supportsSnapshots": true
            },
            "sessionId": "sess-1",
            "role": "editor",
            "needsCatchUp": false,
            "serverFrontierTag": "t0",
            "negotiationLog": null
        })
        .to_string()
    }

    #[tokio::test]
    async fn connect_completes_on_matching_handshake_ack() {
        let (client, mut events) = SyncClient::new(config());
        let (to_server, mut from_client) = mpsc::unbounded_channel();
        let transport = Arc::new(ChannelTransport {
            to_server,
            closed: Arc::new(StdMutex::new(None)),
        });

        let client_for_task = client.clone();
        let manifest_for_task = config().policy_manifest;
        let responder = tokio::spawn(async move {
            let raw = from_client.recv().await.unwrap();
            let ack = ack_for(&raw, &manifest_for_task);
            client_for_task.handle_inbound_frame(&ack).await;
        });

        client.connect(transport).await.expect("handshake should succeed");
        responder.await.unwrap();

        assert_eq!(client.state(), ClientState::Connected);
        let mut saw_connected = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, ClientEvent::Connected { .. }) {
                saw_connected = true;
            }
        }
        assert!(saw_connected);
    }

    #[tokio::test]
    async fn connect_times_out_without_ack() {
        let (client, _events) = SyncClient::new(config());
        let (to_server, _rx) = mpsc::unbounded_channel();
        let transport = Arc::new(ChannelTransport {
            to_server,
            closed: Arc::new(StdMutex::new(None)),
        });
        let err = client.connect(transport).await.unwrap_err();
        assert!(matches!(err, SyncClientError::HandshakeTimeout));
        assert_eq!(client.state(), ClientState::Error);
    }

    #[tokio::test]
    async fn send_update_requires_connected_state() {
        let (client, _events) = SyncClient::new(config());
        let err = client
            .send_update(b"data", "t1", "t0", None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncClientError::InvalidState(_)));
    }

    #[tokio::test]
    async fn send_presence_is_a_silent_noop_when_disconnected() {
        let (client, _events) = SyncClient::new(config());
        client
            .send_presence(None, None, PresenceStatus::Active)
            .await;
    }

    #[test]
    fn reconnect_backoff_doubles_and_caps() {
        let (client, _events) = SyncClient::new(SyncClientConfig {
            reconnect: ReconnectConfig {
                enabled: true,
                max_attempts: -1,
                base_delay_ms: 100,
                max_delay_ms: 1000,
                ..ReconnectConfig::default()
            },
            ..config()
        });
        *client.inner.state.lock() = ClientState::Connected;
        let first = client.on_transport_closed().unwrap();
        assert_eq!(first, Duration::from_millis(100));

        *client.inner.state.lock() = ClientState::Reconnecting;
        let second = client.on_transport_closed().unwrap();
        assert_eq!(second, Duration::from_millis(200));

        for _ in 0..10 {
            *client.inner.state.lock() = ClientState::Reconnecting;
            let delay = client.on_transport_closed().unwrap();
            assert!(delay <= Duration::from_millis(1000));
        }
    }

    #[test]
    fn reconnect_disabled_never_schedules() {
        let (client, _events) = SyncClient::new(SyncClientConfig {
            reconnect: ReconnectConfig {
                enabled: false,
                ..ReconnectConfig::default()
            },
            ..config()
        });
        *client.inner.state.lock() = ClientState::Connected;
        assert!(client.on_transport_closed().is_none());
        assert_eq!(client.state(), ClientState::Disconnected);
    }
}
