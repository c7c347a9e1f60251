//! The sync server: room/session lifecycle, update exchange, presence
//! batching, catch-up, and shutdown.
//!
//! Grounded on `enterprise::collaboration::session` for the room/session
//! skeleton and `enterprise::collaboration::sync_engine` for the
//! catch-up/broadcast plumbing; the `DashMap`-backed room registry mirrors
//! the teacher's sharded state pattern.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::audit::{ActorType, InMemoryOperationLog, OpType, OperationLog, OperationLogEntry};
use crate::observability::{series, Labels, MetricRegistry};
use crate::policy::{self, PolicyManifest};
use crate::protocol::{
    CatchUpRequestPayload, CatchUpResponsePayload, DocAckPayload, DocUpdatePayload, ErrorCode,
    HandshakeAckPayload, HandshakePayload, NegotiationLogRow, PresencePayload, ServerCapabilities,
};
use crate::ratelimit::{Decision, RateLimitConfig, RateLimiter};
use crate::storage::{StorageBackend, Update};

use super::auth::{AuthAdapter, AuthContext, DefaultAuthAdapter};
use super::{ClientConnection, OutboundSink, PresenceState, Room, SinkMessage};

/// WebSocket close code for a connection evicted for sitting idle past
/// `idleTimeoutMs` (§6).
pub const CLOSE_IDLE_TIMEOUT: u16 = 4000;
/// WebSocket close code for a handshake that never arrived in time (§6).
pub const CLOSE_HANDSHAKE_TIMEOUT: u16 = 4008;
/// WebSocket close code for a handshake rejected on policy/authorization
/// grounds (§6).
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// WebSocket close code sent to every connected client on server shutdown
/// (§6).
pub const CLOSE_SERVER_SHUTDOWN: u16 = 1001;

/// Server-side limits and timers. Defaults are contracts, not magic numbers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Maximum clients admitted into one room.
    pub max_clients_per_room: usize,
    /// Presence time-to-live.
    pub presence_ttl_ms: u64,
    /// How long a pending connection has to send `handshake`.
    pub handshake_timeout_ms: u64,
    /// Interval at which batched presence is broadcast.
    pub presence_broadcast_interval_ms: u64,
    /// Connections idle longer than this are closed. `0` disables the check.
    pub idle_timeout_ms: u64,
    /// How often the idle sweep runs.
    pub idle_check_interval_ms: u64,
    /// Maximum accepted `doc_update` payload size, in bytes.
    pub max_update_size: u64,
    /// Maximum accepted raw frame size, in bytes.
    pub max_message_size: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_clients_per_room: 64,
            presence_ttl_ms: 30_000,
            handshake_timeout_ms: 10_000,
            presence_broadcast_interval_ms: 200,
            idle_timeout_ms: 5 * 60 * 1000,
            idle_check_interval_ms: 30_000,
            max_update_size: 10 * 1024 * 1024,
            max_message_size: 12 * 1024 * 1024,
        }
    }
}

/// The result of a successful handshake: the ack to send plus bookkeeping
/// the caller (the connection task) needs to register the client.
#[derive(Debug, Clone)]
pub struct HandshakeOutcome {
    /// The payload to send back as `handshake_ack`.
    pub ack: HandshakeAckPayload,
    /// The session id allocated.
    pub session_id: String,
}

/// Why a handshake was rejected.
#[derive(Debug, Clone)]
pub struct HandshakeRejection {
    /// The code to send in the `error` reply.
    pub code: ErrorCode,
    /// A human-readable reason.
    pub reason: String,
}

/// The server half of the sync kernel.
pub struct SyncServer {
    config: ServerConfig,
    server_manifest: PolicyManifest,
    storage: Arc<dyn StorageBackend>,
    auth: Arc<dyn AuthAdapter>,
    operation_log: Arc<dyn OperationLog>,
    rate_limiter: RateLimiter,
    metrics: Arc<MetricRegistry>,
    rooms: DashMap<String, Arc<AsyncMutex<Room>>>,
    server_seq: AtomicU64,
}

impl SyncServer {
    /// Construct a server with a custom auth adapter and operation log.
    pub fn new(
        config: ServerConfig,
        server_manifest: PolicyManifest,
        storage: Arc<dyn StorageBackend>,
        auth: Arc<dyn AuthAdapter>,
        operation_log: Arc<dyn OperationLog>,
    ) -> crate::WeaveResult<Self> {
        let validation = policy::validate_manifest(&server_manifest);
        if !validation.valid {
            return Err(crate::WeaveError::Internal(format!(
                "server manifest failed validation: {:?}",
                validation.errors
            )));
        }
        let rate_limiter = RateLimiter::new(RateLimitConfig::default())
            .map_err(|e| crate::WeaveError::Internal(e.to_string()))?;
        Ok(Self {
            config,
            server_manifest,
            storage,
            auth,
            operation_log,
            rate_limiter,
            metrics: Arc::new(MetricRegistry::with_default_series()),
            rooms: DashMap::new(),
            server_seq: AtomicU64::new(0),
        })
    }

    /// Construct a server with sensible defaults: an in-memory operation log
    /// and the accept-all auth adapter.
    pub fn with_defaults(
        config: ServerConfig,
        server_manifest: PolicyManifest,
        storage: Arc<dyn StorageBackend>,
    ) -> crate::WeaveResult<Self> {
        Self::new(
            config,
            server_manifest,
            storage,
            Arc::new(DefaultAuthAdapter),
            Arc::new(InMemoryOperationLog::new()),
        )
    }

    /// The metrics registry backing this server, for a caller wiring a
    /// `/metrics` endpoint.
    pub fn metrics(&self) -> Arc<MetricRegistry> {
        self.metrics.clone()
    }

    fn next_seq(&self) -> u64 {
        self.server_seq.fetch_add(1, Ordering::Relaxed)
    }

    async fn room_for(&self, doc_id: &str) -> Arc<AsyncMutex<Room>> {
        if let Some(room) = self.rooms.get(doc_id) {
            return room.clone();
        }
        let frontier_tag = self
            .storage
            .get_current_frontier_tag(doc_id)
            .await
            .unwrap_or_default();
        let room = Arc::new(AsyncMutex::new(Room::new(doc_id, frontier_tag)));
        self.rooms.entry(doc_id.to_string()).or_insert(room).clone()
    }

    /// Consume one token from `client_id`'s bucket. Called by the transport
    /// layer before any message (other than `handshake`, which has its own
    /// capacity gate) is dispatched to business logic.
    pub fn check_rate_limit(&self, client_id: &str) -> Decision {
        self.rate_limiter.consume(client_id)
    }

    /// Rate-limiter idle bucket sweep; intended to run on a periodic timer.
    pub fn sweep_rate_limiter(&self) -> usize {
        self.rate_limiter.sweep_idle()
    }

    /// Handle an inbound `handshake` for `client_id` joining `doc_id`.
    ///
    /// Runs capacity, manifest-validation, hash-verification, compatibility,
    /// negotiation, and auth checks in that order, matching the
    /// specification's numbered handshake algorithm. Registers the client
    /// into the room's state and `sink` map only on success.
    pub async fn handle_handshake(
        &self,
        doc_id: &str,
        client_id: &str,
        payload: HandshakePayload,
        sink: OutboundSink,
    ) -> Result<HandshakeOutcome, HandshakeRejection> {
        let room_arc = self.room_for(doc_id).await;
        let mut room = room_arc.lock().await;

        if room.clients.len() >= self.config.max_clients_per_room {
            self.record_handshake_failure("room_full");
            return Err(HandshakeRejection {
                code: ErrorCode::RoomFull,
                reason: "room is at capacity".to_string(),
            });
        }

        let server_validation = policy::validate_manifest(&self.server_manifest);
        if !server_validation.valid {
            self.record_handshake_failure("server_manifest_invalid");
            return Err(HandshakeRejection {
                code: ErrorCode::ErrPolicyIncompatible,
                reason: "server manifest is invalid".to_string(),
            });
        }

        let client_manifest: PolicyManifest = match serde_json::from_value(payload.client_manifest.clone())
        {
            Ok(m) => m,
            Err(e) => {
                self.record_handshake_failure("client_manifest_malformed");
                return Err(HandshakeRejection {
                    code: ErrorCode::ErrPolicyIncompatible,
                    reason: format!("malformed client manifest: {e}"),
                });
            }
        };
        let client_validation = policy::validate_manifest(&client_manifest);
        if !client_validation.valid {
            self.record_handshake_failure("client_manifest_invalid");
            return Err(HandshakeRejection {
                code: ErrorCode::ErrPolicyIncompatible,
                reason: format!("client manifest invalid: {:?}", client_validation.errors),
            });
        }
        if client_manifest.compute_hash() != payload.client_manifest_hash {
            self.record_handshake_failure("client_manifest_hash_mismatch");
            return Err(HandshakeRejection {
                code: ErrorCode::ErrPolicyIncompatible,
                reason: "client manifest hash does not match its declared hash".to_string(),
            });
        }

        if !policy::are_manifests_compatible(&client_manifest, &self.server_manifest) {
            self.record_handshake_failure("incompatible_policy_family");
            return Err(HandshakeRejection {
                code: ErrorCode::ErrPolicyIncompatible,
                reason: "client and server policy families are incompatible".to_string(),
            });
        }

        let negotiation = policy::negotiate(&[client_manifest, self.server_manifest.clone()], true);
        if !negotiation.success {
            self.record_handshake_failure("negotiation_failed");
            return Err(HandshakeRejection {
                code: ErrorCode::ErrPolicyIncompatible,
                reason: negotiation.errors.join("; "),
            });
        }
        let effective_manifest = negotiation.manifest.expect("negotiate reported success");

        let auth_context = AuthContext {
            doc_id: doc_id.to_string(),
            client_id: client_id.to_string(),
            token: payload.token.clone(),
            user_meta: payload.user_meta.clone(),
            user_id: None,
            role: None,
        };
        let auth_outcome = self.auth.authenticate(&auth_context).await;
        if !auth_outcome.authenticated {
            self.record_handshake_failure("unauthorized");
            return Err(HandshakeRejection {
                code: ErrorCode::Unauthorized,
                reason: auth_outcome.reason.unwrap_or_else(|| "denied".to_string()),
            });
        }

        let session_id = Uuid::new_v4().to_string();
        let chosen_manifest_hash = effective_manifest.compute_hash();
        let current_frontier_tag = room.current_frontier_tag.clone();
        let needs_catch_up = payload
            .last_frontier_tag
            .as_ref()
            .map(|tag| tag != &current_frontier_tag)
            .unwrap_or(false);

        let now = Utc::now();
        let connection = ClientConnection {
            client_id: client_id.to_string(),
            doc_id: doc_id.to_string(),
            session_id: session_id.clone(),
            user_id: auth_outcome.user_id,
            role: auth_outcome.role,
            user_meta: payload.user_meta.clone(),
            effective_manifest: effective_manifest.clone(),
            last_frontier_tag: current_frontier_tag.clone(),
            presence: None,
            connected_at: now,
            last_message_at: now,
        };
        room.clients.insert(client_id.to_string(), connection);
        room.sinks.insert(client_id.to_string(), sink);

        let negotiation_log = negotiation.log.map(|rows| {
            rows.into_iter()
                .map(|row| NegotiationLogRow {
                    field: row.field,
                    proposed: row.proposed,
                    resolved: row.resolved,
                })
                .collect()
        });

        Ok(HandshakeOutcome {
            ack: HandshakeAckPayload {
                server_manifest: serde_json::to_value(&self.server_manifest)
                    .expect("manifest serializes"),
                effective_manifest: serde_json::to_value(&effective_manifest)
                    .expect("manifest serializes"),
                chosen_manifest_hash,
                server_capabilities: ServerCapabilities {
                    max_clients_per_room: self.config.max_clients_per_room as u32,
                    presence_ttl_ms: self.config.presence_ttl_ms,
                    supports_snapshots: true,
                },
                session_id: session_id.clone(),
                role: connection_role_label(&room, client_id),
                needs_catch_up,
                server_frontier_tag: current_frontier_tag,
                negotiation_log,
            },
            session_id,
        })
    }

    fn record_handshake_failure(&self, reason: &'static str) {
        self.metrics
            .incr_counter(series::SYNC_HANDSHAKE_FAILURES_TOTAL, &label_reason(reason));
    }

    /// Handle an inbound `doc_update`. Mutates the room's frontier and
    /// persists via storage only after every check (size, auth, frontier)
    /// passes, then broadcasts the identical update to the rest of the room.
    pub async fn handle_doc_update(
        &self,
        doc_id: &str,
        client_id: &str,
        envelope_seq: u64,
        payload: DocUpdatePayload,
    ) -> DocAckPayload {
        let room_arc = self.room_for(doc_id).await;
        let mut room = room_arc.lock().await;

        if !room.clients.contains_key(client_id) {
            return ack_rejected(envelope_seq, &room.current_frontier_tag, "Not connected to room");
        }

        if payload.size_bytes > self.config.max_update_size {
            return ack_rejected(envelope_seq, &room.current_frontier_tag, "Update exceeds maxUpdateSize");
        }

        let (user_id, role) = {
            let connection = &room.clients[client_id];
            (connection.user_id.clone(), connection.role)
        };
        let user_id_for_actor = user_id.clone();
        let auth_context = AuthContext {
            doc_id: doc_id.to_string(),
            client_id: client_id.to_string(),
            token: None,
            user_meta: None,
            user_id,
            role,
        };
        if !self.auth.authorize(&auth_context, "write").await {
            self.append_operation_log(OperationLogEntry {
                id: Uuid::new_v4(),
                doc_id: doc_id.to_string(),
                actor_id: client_id.to_string(),
                actor_type: ActorType::Human,
                op_type: OpType::Permission,
                ts: Utc::now(),
                frontier_tag: None,
                parent_frontier_tag: None,
                size_bytes: None,
                summary: Some("write_denied".to_string()),
            })
            .await;
            return ack_rejected(envelope_seq, &room.current_frontier_tag, "Unauthorized");
        }

        let data = match crate::encoding::decode(&payload.update_data) {
            Ok(bytes) => bytes,
            Err(_) => return ack_rejected(envelope_seq, &room.current_frontier_tag, "Invalid base64 payload"),
        };

        if payload.parent_frontier_tag != room.current_frontier_tag {
            self.metrics
                .incr_counter(series::CONFLICT_RETRY_TOTAL, &label_reason(doc_id));
            return ack_rejected(
                envelope_seq,
                &room.current_frontier_tag,
                "Frontier conflict - please catch up",
            );
        }

        let update = Update {
            doc_id: doc_id.to_string(),
            seq: self.storage.get_latest_seq(doc_id).await.unwrap_or(0) + 1,
            data,
            frontier_tag: payload.frontier_tag.clone(),
            parent_frontier_tag: payload.parent_frontier_tag.clone(),
            client_id: client_id.to_string(),
            timestamp: Utc::now(),
            size_bytes: payload.size_bytes,
            origin: payload.origin.clone(),
        };

        let apply_started = std::time::Instant::now();
        if let Err(e) = self.storage.append_update(update.clone()).await {
            tracing::warn!(doc_id, client_id, error = %e, "failed to persist update");
            return ack_rejected(envelope_seq, &room.current_frontier_tag, "Persistence failure");
        }
        self.metrics.observe_histogram(
            series::UPDATE_APPLY_LATENCY_MS,
            &Labels::new(),
            apply_started.elapsed().as_secs_f64() * 1000.0,
        );

        room.current_frontier_tag = payload.frontier_tag.clone();
        if let Some(connection) = room.clients.get_mut(client_id) {
            connection.last_frontier_tag = payload.frontier_tag.clone();
            connection.last_message_at = Utc::now();
        }

        let actor_type = crate::audit::infer_actor_type(payload.origin.as_deref(), user_id_for_actor.as_deref());
        self.append_operation_log(OperationLogEntry {
            id: Uuid::new_v4(),
            doc_id: doc_id.to_string(),
            actor_id: client_id.to_string(),
            actor_type,
            op_type: OpType::CrdtUpdate,
            ts: Utc::now(),
            frontier_tag: Some(payload.frontier_tag.clone()),
            parent_frontier_tag: Some(payload.parent_frontier_tag.clone()),
            size_bytes: Some(payload.size_bytes),
            summary: None,
        })
        .await;

        let broadcast_envelope = crate::protocol::Envelope {
            version: crate::PROTOCOL_VERSION.to_string(),
            doc_id: doc_id.to_string(),
            client_id: client_id.to_string(),
            seq: self.next_seq(),
            timestamp: Utc::now().to_rfc3339(),
            payload: crate::protocol::Payload::DocUpdate(payload),
        };
        room.broadcast_except(client_id, &broadcast_envelope);

        DocAckPayload {
            acked_seq: envelope_seq,
            applied: true,
            server_frontier_tag: room.current_frontier_tag.clone(),
            rejection_reason: None,
        }
    }

    /// Handle an inbound `presence`: refresh the client's presence and mark
    /// the room dirty. The caller is responsible for scheduling the actual
    /// broadcast (`flush_presence_broadcast`) on its own timer so that
    /// presence traffic stays bounded by `presenceBroadcastIntervalMs`
    /// regardless of cursor-move rate.
    pub async fn handle_presence(&self, doc_id: &str, client_id: &str, payload: PresencePayload) -> bool {
        let room_arc = self.room_for(doc_id).await;
        let mut room = room_arc.lock().await;
        let Some(connection) = room.clients.get_mut(client_id) else {
            return false;
        };
        connection.presence = Some(PresenceState {
            payload,
            expires_at: Utc::now() + chrono::Duration::milliseconds(self.config.presence_ttl_ms as i64),
        });
        connection.last_message_at = Utc::now();
        room.dirty_presence_clients.insert(client_id.to_string());
        true
    }

    /// Flush any pending presence changes for `doc_id` as a `presence_ack`
    /// broadcast carrying the room's full current presence set. No-op if
    /// nothing is dirty.
    pub async fn flush_presence_broadcast(&self, doc_id: &str) -> Option<crate::protocol::Envelope> {
        let room_arc = self.room_for(doc_id).await;
        let mut room = room_arc.lock().await;
        if room.dirty_presence_clients.is_empty() {
            return None;
        }
        room.dirty_presence_clients.clear();
        let presences = room.presence_snapshot();
        let envelope = crate::protocol::Envelope {
            version: crate::PROTOCOL_VERSION.to_string(),
            doc_id: doc_id.to_string(),
            client_id: "server".to_string(),
            seq: self.next_seq(),
            timestamp: Utc::now().to_rfc3339(),
            payload: crate::protocol::Payload::PresenceAck(crate::protocol::PresenceAckPayload {
                presences,
            }),
        };
        for sink in room.sinks.values() {
            let _ = sink.send(SinkMessage::Frame(envelope.clone()));
        }
        Some(envelope)
    }

    /// Expire presences whose TTL has elapsed; returns the client ids that
    /// were cleared so the caller can note a presence broadcast is now due.
    pub async fn sweep_expired_presence(&self, doc_id: &str) -> Vec<String> {
        let room_arc = self.room_for(doc_id).await;
        let mut room = room_arc.lock().await;
        let now = Utc::now();
        let mut expired = Vec::new();
        for (client_id, connection) in room.clients.iter_mut() {
            if let Some(state) = &connection.presence {
                if state.expires_at < now {
                    connection.presence = None;
                    expired.push(client_id.clone());
                }
            }
        }
        for client_id in &expired {
            room.dirty_presence_clients.insert(client_id.clone());
        }
        expired
    }

    /// Handle an inbound `catch_up_request`.
    pub async fn handle_catch_up_request(
        &self,
        doc_id: &str,
        client_id: &str,
        payload: CatchUpRequestPayload,
    ) -> Result<CatchUpResponsePayload, ErrorCode> {
        let prefer_snapshot = payload.prefer_snapshot || payload.from_frontier_tag.is_empty();

        let response = if prefer_snapshot {
            self.snapshot_response(doc_id).await?
        } else {
            match self.storage.get_updates_since(doc_id, &payload.from_frontier_tag).await {
                Ok(updates) if !updates.is_empty() => incremental_response(updates),
                Ok(_) => self.snapshot_response(doc_id).await?,
                Err(_) => self.snapshot_response(doc_id).await?,
            }
        };

        let room_arc = self.room_for(doc_id).await;
        let mut room = room_arc.lock().await;
        if let Some(connection) = room.clients.get_mut(client_id) {
            connection.last_frontier_tag = response.frontier_tag.clone();
        }

        Ok(response)
    }

    async fn snapshot_response(&self, doc_id: &str) -> Result<CatchUpResponsePayload, ErrorCode> {
        match self.storage.get_latest_snapshot(doc_id).await {
            Ok(Some(snapshot)) => Ok(CatchUpResponsePayload {
                is_snapshot: true,
                data: crate::encoding::encode(&snapshot.data),
                frontier_tag: snapshot.frontier_tag,
                update_count: None,
            }),
            Ok(None) => Err(ErrorCode::DocNotFound),
            Err(_) => Err(ErrorCode::DocNotFound),
        }
    }

    /// Disconnect a client: remove it from the room, mark the rest dirty so
    /// a presence broadcast follows, and drop the room if it's now empty.
    pub async fn disconnect(&self, doc_id: &str, client_id: &str) {
        let room_arc = self.room_for(doc_id).await;
        let mut room = room_arc.lock().await;
        room.clients.remove(client_id);
        room.sinks.remove(client_id);
        for remaining in room.clients.keys() {
            room.dirty_presence_clients.insert(remaining.clone());
        }
        let empty = room.is_empty();
        drop(room);
        if empty {
            self.rooms.remove(doc_id);
        }
    }

    /// Scan every room for clients idle past `idleTimeoutMs`; returns the
    /// `(doc_id, client_id)` pairs the caller should close with
    /// `IDLE_TIMEOUT`. A no-op when `idle_timeout_ms` is `0`.
    pub async fn sweep_idle_clients(&self) -> Vec<(String, String)> {
        if self.config.idle_timeout_ms == 0 {
            return Vec::new();
        }
        let now = Utc::now();
        let mut timed_out = Vec::new();
        for entry in self.rooms.iter() {
            let room = entry.value().lock().await;
            for connection in room.clients.values() {
                let idle_ms = (now - connection.last_message_at).num_milliseconds();
                if idle_ms > self.config.idle_timeout_ms as i64 {
                    timed_out.push((room.doc_id.clone(), connection.client_id.clone()));
                }
            }
        }
        timed_out
    }

    /// Evict a client found idle past `idleTimeoutMs` by `sweep_idle_clients`:
    /// send it an `IDLE_TIMEOUT` error, instruct its transport to close with
    /// code `4000`, then remove it from the room.
    pub async fn evict_idle_client(&self, doc_id: &str, client_id: &str) {
        let room_arc = self.room_for(doc_id).await;
        {
            let room = room_arc.lock().await;
            let error_envelope = crate::protocol::Envelope {
                version: crate::PROTOCOL_VERSION.to_string(),
                doc_id: doc_id.to_string(),
                client_id: client_id.to_string(),
                seq: self.next_seq(),
                timestamp: Utc::now().to_rfc3339(),
                payload: crate::protocol::Payload::Error(crate::protocol::build_error_payload(
                    ErrorCode::IdleTimeout,
                    "connection idle past the configured timeout",
                    None,
                    None,
                )),
            };
            room.send_to(client_id, error_envelope);
            room.close(client_id, CLOSE_IDLE_TIMEOUT);
        }
        self.disconnect(doc_id, client_id).await;
    }

    /// Stop serving: instructs every connected client's transport to close
    /// with code `1001`, then clears all room state. The transport layer is
    /// responsible for actually tearing down the socket once it observes the
    /// close instruction on its sink.
    pub async fn shutdown(&self) {
        for entry in self.rooms.iter() {
            let room = entry.value().lock().await;
            room.close_all(CLOSE_SERVER_SHUTDOWN);
        }
        self.rooms.clear();
    }

    /// Number of currently active rooms, for diagnostics/tests.
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// The doc ids of every currently active room, for a caller driving the
    /// presence-broadcast/idle-sweep timers (see [`spawn_background_tasks`]).
    pub fn doc_ids(&self) -> Vec<String> {
        self.rooms.iter().map(|entry| entry.key().clone()).collect()
    }

    /// The server's own manifest, for a transport layer that needs to log or
    /// expose it (e.g. a status endpoint).
    pub fn server_manifest(&self) -> &PolicyManifest {
        &self.server_manifest
    }

    /// Refresh `lastMessageAt` for a connected client without otherwise
    /// touching room state. Intended for message types the kernel doesn't
    /// otherwise mutate state for (`ping`), so the idle sweep still sees the
    /// connection as live.
    pub async fn touch_client(&self, doc_id: &str, client_id: &str) {
        let room_arc = self.room_for(doc_id).await;
        let mut room = room_arc.lock().await;
        if let Some(connection) = room.clients.get_mut(client_id) {
            connection.last_message_at = Utc::now();
        }
    }

    async fn append_operation_log(&self, entry: OperationLogEntry) {
        if let Err(e) = self.operation_log.append(entry).await {
            tracing::warn!(error = %e, "operation log append failed");
        }
    }
}

fn connection_role_label(room: &Room, client_id: &str) -> Option<String> {
    room.clients
        .get(client_id)
        .and_then(|c| c.role)
        .map(|role| format!("{role:?}").to_lowercase())
}

fn ack_rejected(acked_seq: u64, server_frontier_tag: &str, reason: &str) -> DocAckPayload {
    DocAckPayload {
        acked_seq,
        applied: false,
        server_frontier_tag: server_frontier_tag.to_string(),
        rejection_reason: Some(reason.to_string()),
    }
}

fn incremental_response(updates: Vec<Update>) -> CatchUpResponsePayload {
    let frontier_tag = updates.last().map(|u| u.frontier_tag.clone()).unwrap_or_default();
    let update_count = updates.len() as u64;
    let concatenated: Vec<u8> = updates.iter().flat_map(|u| u.data.iter().copied()).collect();
    CatchUpResponsePayload {
        is_snapshot: false,
        data: crate::encoding::encode(&concatenated),
        frontier_tag,
        update_count: Some(update_count),
    }
}

fn label_reason(reason: &str) -> Labels {
    crate::observability::metrics::label("reason", reason)
}

/// Spawn the server's background timers (presence broadcast, presence
/// expiry sweep, idle-connection sweep, rate-limiter eviction) as detached
/// tasks. Returns their `JoinHandle`s so a caller can abort them on
/// shutdown.
pub fn spawn_background_tasks(
    server: Arc<SyncServer>,
    doc_ids: impl Fn() -> Vec<String> + Send + Sync + 'static,
) -> Vec<tokio::task::JoinHandle<()>> {
    let presence_interval = Duration::from_millis(server.config.presence_broadcast_interval_ms);
    let idle_interval = Duration::from_millis(server.config.idle_check_interval_ms.max(1));

    let presence_server = server.clone();
    let presence_docs = {
        let doc_ids = Arc::new(doc_ids);
        let doc_ids_for_presence = doc_ids.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(presence_interval);
            loop {
                ticker.tick().await;
                for doc_id in (doc_ids_for_presence)() {
                    presence_server.flush_presence_broadcast(&doc_id).await;
                }
            }
        })
    };

    let idle_server = server.clone();
    let idle_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(idle_interval);
        loop {
            ticker.tick().await;
            let timed_out = idle_server.sweep_idle_clients().await;
            for (doc_id, client_id) in timed_out {
                idle_server.evict_idle_client(&doc_id, &client_id).await;
            }
            idle_server.sweep_rate_limiter();
        }
    });

    vec![presence_docs, idle_task]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{AiSanitizationPolicy, CanonMark};
    use crate::storage::InMemory;
    use tokio::sync::mpsc;

    fn manifest() -> PolicyManifest {
        PolicyManifest {
            policy_id: "weave:v1".to_string(),
            ai_sanitization_policy: AiSanitizationPolicy {
                allowed_marks: [CanonMark::Bold].into_iter().collect(),
                allowed_block_types: ["paragraph".to_string()].into_iter().collect(),
            },
            max_update_size: 1_000_000,
            protocol_features: ["presence".to_string()].into_iter().collect(),
            presence_ttl_ms: 30_000,
        }
    }

    fn server() -> SyncServer {
        SyncServer::with_defaults(ServerConfig::default(), manifest(), Arc::new(InMemory::new())).unwrap()
    }

    fn handshake_payload() -> HandshakePayload {
        let client_manifest = manifest();
        HandshakePayload {
            client_manifest_hash: client_manifest.compute_hash(),
            client_manifest: serde_json::to_value(client_manifest).unwrap(),
            capabilities: crate::protocol::ClientCapabilities {
                features: vec![],
                max_update_size: 1_000_000,
                supports_binary: false,
                supports_compression: false,
            },
            last_frontier_tag: None,
            token: None,
            user_meta: None,
        }
    }

    #[tokio::test]
    async fn handshake_succeeds_and_registers_client() {
        let server = server();
        let (tx, _rx) = mpsc::unbounded_channel();
        let outcome = server
            .handle_handshake("doc-1", "client-1", handshake_payload(), tx)
            .await
            .expect("handshake should succeed");
        assert!(!outcome.ack.needs_catch_up);
        assert_eq!(server.room_count(), 1);
    }

    #[tokio::test]
    async fn handshake_rejects_hash_mismatch() {
        let server = server();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut payload = handshake_payload();
        payload.client_manifest_hash = "deadbeef".to_string();
        let rejection = server
            .handle_handshake("doc-1", "client-1", payload, tx)
            .await
            .unwrap_err();
        assert!(matches!(rejection.code, ErrorCode::ErrPolicyIncompatible));
    }

    #[tokio::test]
    async fn handshake_rejects_when_room_full() {
        let mut config = ServerConfig::default();
        config.max_clients_per_room = 1;
        let server = SyncServer::with_defaults(config, manifest(), Arc::new(InMemory::new())).unwrap();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        server
            .handle_handshake("doc-1", "client-1", handshake_payload(), tx1)
            .await
            .unwrap();

        let (tx2, _rx2) = mpsc::unbounded_channel();
        let rejection = server
            .handle_handshake("doc-1", "client-2", handshake_payload(), tx2)
            .await
            .unwrap_err();
        assert!(matches!(rejection.code, ErrorCode::RoomFull));
    }

    #[tokio::test]
    async fn doc_update_rejects_when_not_connected() {
        let server = server();
        let ack = server
            .handle_doc_update(
                "doc-1",
                "ghost",
                1,
                DocUpdatePayload {
                    update_data: crate::encoding::encode(b"data"),
                    is_base64: true,
                    frontier_tag: "t1".to_string(),
                    parent_frontier_tag: "".to_string(),
                    size_bytes: 4,
                    origin: None,
                },
            )
            .await;
        assert!(!ack.applied);
        assert_eq!(ack.rejection_reason.as_deref(), Some("Not connected to room"));
    }

    #[tokio::test]
    async fn doc_update_applies_and_advances_frontier() {
        let server = server();
        let (tx, _rx) = mpsc::unbounded_channel();
        server
            .handle_handshake("doc-1", "client-1", handshake_payload(), tx)
            .await
            .unwrap();

        let ack = server
            .handle_doc_update(
                "doc-1",
                "client-1",
                1,
                DocUpdatePayload {
                    update_data: crate::encoding::encode(b"data"),
                    is_base64: true,
                    frontier_tag: "t1".to_string(),
                    parent_frontier_tag: "".to_string(),
                    size_bytes: 4,
                    origin: None,
                },
            )
            .await;
        assert!(ack.applied);
        assert_eq!(ack.server_frontier_tag, "t1");
    }

    #[tokio::test]
    async fn doc_update_detects_frontier_conflict() {
        let server = server();
        let (tx, _rx) = mpsc::unbounded_channel();
        server
            .handle_handshake("doc-1", "client-1", handshake_payload(), tx)
            .await
            .unwrap();

        let ack = server
            .handle_doc_update(
                "doc-1",
                "client-1",
                1,
                DocUpdatePayload {
                    update_data: crate::encoding::encode(b"data"),
                    is_base64: true,
                    frontier_tag: "t1".to_string(),
                    parent_frontier_tag: "stale".to_string(),
                    size_bytes: 4,
                    origin: None,
                },
            )
            .await;
        assert!(!ack.applied);
        assert_eq!(
            ack.rejection_reason.as_deref(),
            Some("Frontier conflict - please catch up")
        );
    }

    #[tokio::test]
    async fn presence_broadcast_carries_full_room_snapshot() {
        let server = server();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        server
            .handle_handshake("doc-1", "client-1", handshake_payload(), tx1)
            .await
            .unwrap();
        server
            .handle_handshake("doc-1", "client-2", handshake_payload(), tx2)
            .await
            .unwrap();

        let updated = server
            .handle_presence(
                "doc-1",
                "client-1",
                PresencePayload {
                    user_meta: serde_json::json!({"name": "alice"}),
                    cursor: None,
                    selection: None,
                    status: crate::protocol::PresenceStatus::Active,
                    last_activity: Utc::now().to_rfc3339(),
                },
            )
            .await;
        assert!(updated);

        server.flush_presence_broadcast("doc-1").await;

        let message = rx2.try_recv().expect("client-2 should receive presence_ack");
        match message {
            SinkMessage::Frame(envelope) => match envelope.payload {
                crate::protocol::Payload::PresenceAck(ack) => {
                    assert_eq!(ack.presences.len(), 2);
                }
                other => panic!("expected presence_ack, got {other:?}"),
            },
            SinkMessage::Close(code) => panic!("expected a frame, got a close({code})"),
        }
        assert!(rx1.try_recv().is_ok(), "client-1 also receives the broadcast");
    }

    #[tokio::test]
    async fn catch_up_falls_back_to_snapshot_when_no_tag_matches() {
        let storage = Arc::new(InMemory::new());
        storage
            .save_snapshot(crate::storage::Snapshot {
                doc_id: "doc-1".to_string(),
                seq: 0,
                data: b"snap".to_vec(),
                frontier_tag: "t0".to_string(),
                created_at: Utc::now(),
                size_bytes: 4,
                checksum: crate::storage::checksum::fnv1a_hex(b"snap"),
            })
            .await
            .unwrap();
        let server = SyncServer::with_defaults(ServerConfig::default(), manifest(), storage).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        server
            .handle_handshake("doc-1", "client-1", handshake_payload(), tx)
            .await
            .unwrap();

        let response = server
            .handle_catch_up_request(
                "doc-1",
                "client-1",
                CatchUpRequestPayload {
                    from_frontier_tag: "unknown".to_string(),
                    prefer_snapshot: false,
                },
            )
            .await
            .unwrap();
        assert!(response.is_snapshot);
        assert_eq!(response.frontier_tag, "t0");
    }

    #[tokio::test]
    async fn rate_limit_denies_after_bucket_exhausted() {
        let server = server();
        let mut last = Decision::Allowed;
        for _ in 0..1000 {
            last = server.check_rate_limit("client-1");
            if matches!(last, Decision::Denied { .. }) {
                break;
            }
        }
        assert!(matches!(last, Decision::Denied { .. }));
    }

    #[tokio::test]
    async fn disconnect_removes_client_and_drops_empty_room() {
        let server = server();
        let (tx, _rx) = mpsc::unbounded_channel();
        server
            .handle_handshake("doc-1", "client-1", handshake_payload(), tx)
            .await
            .unwrap();
        assert_eq!(server.room_count(), 1);

        server.disconnect("doc-1", "client-1").await;
        assert_eq!(server.room_count(), 0);
    }
}
