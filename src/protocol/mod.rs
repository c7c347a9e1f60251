//! The wire envelope, message taxonomy, and structural validators.
//!
//! Grounded on `enterprise::collaboration::protocol` (`MessageType`,
//! `ProtocolVersion`, `ProtocolError`, the codec shape), generalized from the
//! teacher's binary `bincode` framing to UTF-8 JSON with base64-encoded
//! binary payloads, since the wire format here is explicitly text-framed.

pub mod errors;
pub mod validate;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use errors::{ErrorCategory, ErrorCode, ErrorPayload};
pub use validate::{validate_client_inbound, validate_server_inbound, ValidationResult};

/// The closed set of message types. Unknown types are rejected at
/// deserialization rather than silently accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Client to server: opens a session.
    Handshake,
    /// Server to client: completes a session.
    HandshakeAck,
    /// Bidirectional: a CRDT update.
    DocUpdate,
    /// Server to client: acknowledges a `doc_update`.
    DocAck,
    /// Client to server: presence/cursor state.
    Presence,
    /// Server to client: full-room presence snapshot.
    PresenceAck,
    /// Client to server: requests catch-up.
    CatchUpRequest,
    /// Server to client: catch-up payload.
    CatchUpResponse,
    /// Server to client: a structured error.
    Error,
    /// Bidirectional: liveness probe.
    Ping,
    /// Bidirectional: liveness response.
    Pong,
}

/// Client-declared capabilities, informational only — the kernel enforces
/// its own limits regardless of what either side claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ClientCapabilities {
    /// Named protocol features the client understands.
    pub features: Vec<String>,
    /// The largest update the client will send.
    pub max_update_size: u64,
    /// Whether the client's transport natively supports binary frames.
    pub supports_binary: bool,
    /// Whether the client can decompress compressed payloads.
    pub supports_compression: bool,
}

/// Server-declared capabilities, informational only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ServerCapabilities {
    /// Maximum clients the server will admit into one room.
    pub max_clients_per_room: u32,
    /// Presence time-to-live the server enforces.
    pub presence_ttl_ms: u64,
    /// Whether the server supports snapshot-based catch-up.
    pub supports_snapshots: bool,
}

/// Cursor position within the document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct Cursor {
    /// The block the cursor is positioned in.
    pub block_id: String,
    /// Offset within the block.
    pub offset: u32,
}

/// A text selection, anchor to head.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Selection {
    /// The fixed end of the selection.
    pub anchor: Cursor,
    /// The moving end of the selection.
    pub head: Cursor,
}

/// Presence activity status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    /// The user is actively editing.
    Active,
    /// The user is connected but inactive.
    Idle,
    /// The user has stepped away.
    Away,
}

/// One row of `presence_ack`'s full-room snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct PresenceEntry {
    /// The presenting client.
    pub client_id: String,
    /// That client's current presence payload, absent if expired.
    pub presence: Option<PresencePayload>,
}

/// A field-by-field negotiation log entry, carried optionally on
/// `handshake_ack` when the server opts into exposing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct NegotiationLogRow {
    /// Dotted field path.
    pub field: String,
    /// The value each side proposed, in `[client, server]` order.
    pub proposed: Vec<serde_json::Value>,
    /// The resolved value.
    pub resolved: serde_json::Value,
}

/// `handshake` payload: C→S.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct HandshakePayload {
    /// The client's policy manifest.
    pub client_manifest: serde_json::Value,
    /// The sha-256 hex hash the client computed over its manifest.
    pub client_manifest_hash: String,
    /// The client's declared capabilities.
    pub capabilities: ClientCapabilities,
    /// The frontier tag the client last observed, if reconnecting.
    pub last_frontier_tag: Option<String>,
    /// An opaque bearer token for the auth adapter.
    pub token: Option<String>,
    /// Free-form user metadata.
    pub user_meta: Option<serde_json::Value>,
}

/// `handshake_ack` payload: S→C.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct HandshakeAckPayload {
    /// The server's own policy manifest.
    pub server_manifest: serde_json::Value,
    /// The negotiated effective manifest.
    pub effective_manifest: serde_json::Value,
    /// The sha-256 hex hash of `effective_manifest`.
    pub chosen_manifest_hash: String,
    /// The server's declared capabilities.
    pub server_capabilities: ServerCapabilities,
    /// The session the server allocated for this connection.
    pub session_id: String,
    /// The role the auth adapter granted. Advisory on the client side; the
    /// server's own `authorize()` call remains the sole authority.
    pub role: Option<String>,
    /// Whether the client should issue a `catch_up_request`.
    pub needs_catch_up: bool,
    /// The room's frontier tag at handshake time.
    pub server_frontier_tag: String,
    /// Per-field negotiation trace, present only when requested.
    pub negotiation_log: Option<Vec<NegotiationLogRow>>,
}

/// `doc_update` payload: bidirectional.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct DocUpdatePayload {
    /// The CRDT update bytes, base64-encoded when `is_base64`.
    pub update_data: String,
    /// Whether `update_data` is base64 (always true on this wire format).
    pub is_base64: bool,
    /// The frontier tag this update produces.
    pub frontier_tag: String,
    /// The frontier tag this update was built on.
    pub parent_frontier_tag: String,
    /// Size of the decoded update, in bytes.
    pub size_bytes: u64,
    /// Free-form origin tag, e.g. `lfcc:ai:*`.
    pub origin: Option<String>,
}

/// `doc_ack` payload: S→C.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct DocAckPayload {
    /// The envelope `seq` this ack responds to.
    pub acked_seq: u64,
    /// Whether the update was applied.
    pub applied: bool,
    /// The room's frontier tag after this ack.
    pub server_frontier_tag: String,
    /// Human-readable reason when `applied` is false.
    pub rejection_reason: Option<String>,
}

/// An arbitrary presence payload: user metadata plus optional cursor state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct PresencePayload {
    /// Free-form user metadata (name, color, avatar, ...).
    pub user_meta: serde_json::Value,
    /// Cursor position, if the user has one.
    pub cursor: Option<Cursor>,
    /// Text selection, if the user has one.
    pub selection: Option<Selection>,
    /// Activity status.
    pub status: PresenceStatus,
    /// When this presence was last refreshed, ISO-8601.
    pub last_activity: String,
}

/// `presence_ack` payload: S→C.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct PresenceAckPayload {
    /// The full current presence set of the room.
    pub presences: Vec<PresenceEntry>,
}

/// `catch_up_request` payload: C→S.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct CatchUpRequestPayload {
    /// The frontier tag the client last observed; empty to force a snapshot.
    pub from_frontier_tag: String,
    /// Whether the client would rather receive a full snapshot.
    pub prefer_snapshot: bool,
}

/// `catch_up_response` payload: S→C.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct CatchUpResponsePayload {
    /// Whether `data` is a full snapshot rather than an incremental log.
    pub is_snapshot: bool,
    /// Base64-encoded snapshot or concatenated update payload.
    pub data: String,
    /// The frontier tag `data` brings the client to.
    pub frontier_tag: String,
    /// Number of updates included, when `is_snapshot` is false.
    pub update_count: Option<u64>,
}

/// The tagged union of every message payload, keyed by [`MessageType`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    /// See [`HandshakePayload`].
    Handshake(HandshakePayload),
    /// See [`HandshakeAckPayload`].
    HandshakeAck(HandshakeAckPayload),
    /// See [`DocUpdatePayload`].
    DocUpdate(DocUpdatePayload),
    /// See [`DocAckPayload`].
    DocAck(DocAckPayload),
    /// See [`PresencePayload`].
    Presence(PresencePayload),
    /// See [`PresenceAckPayload`].
    PresenceAck(PresenceAckPayload),
    /// See [`CatchUpRequestPayload`].
    CatchUpRequest(CatchUpRequestPayload),
    /// See [`CatchUpResponsePayload`].
    CatchUpResponse(CatchUpResponsePayload),
    /// See [`ErrorPayload`].
    Error(ErrorPayload),
    /// Empty.
    Ping(EmptyPayload),
    /// Empty.
    Pong(EmptyPayload),
}

/// The empty payload carried by `ping`/`pong`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmptyPayload {}

impl Payload {
    /// The [`MessageType`] this payload carries.
    pub fn message_type(&self) -> MessageType {
        match self {
            Payload::Handshake(_) => MessageType::Handshake,
            Payload::HandshakeAck(_) => MessageType::HandshakeAck,
            Payload::DocUpdate(_) => MessageType::DocUpdate,
            Payload::DocAck(_) => MessageType::DocAck,
            Payload::Presence(_) => MessageType::Presence,
            Payload::PresenceAck(_) => MessageType::PresenceAck,
            Payload::CatchUpRequest(_) => MessageType::CatchUpRequest,
            Payload::CatchUpResponse(_) => MessageType::CatchUpResponse,
            Payload::Error(_) => MessageType::Error,
            Payload::Ping(_) => MessageType::Ping,
            Payload::Pong(_) => MessageType::Pong,
        }
    }
}

/// The wire envelope. Every field is mandatory and no others are permitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct Envelope {
    /// Must equal [`crate::PROTOCOL_VERSION`].
    pub version: String,
    /// The document this message concerns.
    pub doc_id: String,
    /// The sending client's id.
    pub client_id: String,
    /// Per-process monotonic sequence, used for ack correlation.
    pub seq: u64,
    /// ISO-8601 send timestamp.
    pub timestamp: String,
    /// The tagged message payload, carrying its own `type` discriminant.
    #[serde(flatten)]
    pub payload: Payload,
}

impl Envelope {
    /// The [`MessageType`] this envelope carries.
    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }
}

/// Errors raised while building, parsing, or validating protocol messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The envelope did not parse as valid JSON against the closed schema.
    #[error("malformed envelope: {0}")]
    Malformed(String),

    /// `version` did not match [`crate::PROTOCOL_VERSION`].
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    /// Structural validation rejected the message; see [`ValidationResult`].
    #[error("validation failed: {0:?}")]
    Invalid(Vec<String>),
}

/// Result alias for the protocol module.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Parse a raw JSON frame into an [`Envelope`], checking `version` but not
/// running structural per-type validation (see [`validate_client_inbound`]/
/// [`validate_server_inbound`] for that).
pub fn parse_envelope(raw: &str) -> Result<Envelope> {
    let envelope: Envelope =
        serde_json::from_str(raw).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    if envelope.version != crate::PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(envelope.version.clone()));
    }
    Ok(envelope)
}

/// Serialize an [`Envelope`] to its wire JSON form.
pub fn serialize_envelope(envelope: &Envelope) -> Result<String> {
    serde_json::to_string(envelope).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Sanitize an arbitrary JSON value for inclusion in an error payload's
/// `details` field: caps object key count, nesting depth, array length, and
/// string length so a malicious or buggy peer can't smuggle an unbounded
/// payload through error diagnostics.
pub fn sanitize_details(value: &serde_json::Value) -> serde_json::Value {
    const MAX_DEPTH: usize = 4;
    const MAX_KEYS: usize = 32;
    const MAX_ARRAY_LEN: usize = 32;
    const MAX_STRING_LEN: usize = 512;

    fn go(value: &serde_json::Value, depth: usize) -> serde_json::Value {
        if depth >= MAX_DEPTH {
            return serde_json::Value::String("[max depth exceeded]".to_string());
        }
        match value {
            serde_json::Value::String(s) if s.len() > MAX_STRING_LEN => {
                let boundary = s
                    .char_indices()
                    .map(|(i, _)| i)
                    .take_while(|&i| i <= MAX_STRING_LEN)
                    .last()
                    .unwrap_or(0);
                serde_json::Value::String(format!("{}...[truncated]", &s[..boundary]))
            }
            serde_json::Value::Array(items) => serde_json::Value::Array(
                items
                    .iter()
                    .take(MAX_ARRAY_LEN)
                    .map(|v| go(v, depth + 1))
                    .collect(),
            ),
            serde_json::Value::Object(map) => {
                let mut out = serde_json::Map::new();
                for (k, v) in map.iter().take(MAX_KEYS) {
                    out.insert(k.clone(), go(v, depth + 1));
                }
                serde_json::Value::Object(out)
            }
            other => other.clone(),
        }
    }

    go(value, 0)
}

/// Normalize a `retryAfterMs` value to a non-negative integer, defaulting
/// unparseable or negative values to `0`.
pub fn normalize_retry_after_ms(value: Option<i64>) -> u64 {
    value.filter(|v| *v >= 0).map(|v| v as u64).unwrap_or(0)
}

/// A single structural validation error: the offending field path and why.
pub type FieldErrors = BTreeMap<String, String>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_through_json() {
        let envelope = Envelope {
            version: crate::PROTOCOL_VERSION.to_string(),
            doc_id: "doc-1".to_string(),
            client_id: "client-1".to_string(),
            seq: 42,
            timestamp: "2026-01-01T00:00:00Z".to_string(),
            payload: Payload::Ping(EmptyPayload {}),
        };
        let raw = serialize_envelope(&envelope).unwrap();
        let parsed = parse_envelope(&raw).unwrap();
        assert_eq!(parsed.message_type(), MessageType::Ping);
        assert_eq!(parsed.seq, 42);
    }

    #[test]
    fn parse_rejects_unknown_message_type() {
        let raw = r#"{"version":"weave-sync/1","docId":"d","clientId":"c","seq":1,"timestamp":"t","type":"not_a_real_type"}"#;
        assert!(parse_envelope(raw).is_err());
    }

    #[test]
    fn parse_rejects_mismatched_version() {
        let raw = r#"{"version":"weave-sync/0","docId":"d","clientId":"c","seq":1,"timestamp":"t","type":"ping"}"#;
        let err = parse_envelope(raw).unwrap_err();
        assert!(matches!(err, ProtocolError::UnsupportedVersion(_)));
    }

    #[test]
    fn parse_rejects_unknown_fields() {
        let raw = r#"{"version":"weave-sync/1","docId":"d","clientId":"c","seq":1,"timestamp":"t","type":"ping","bogus":true}"#;
        assert!(parse_envelope(raw).is_err());
    }

    #[test]
    fn sanitize_truncates_long_strings_and_deep_nesting() {
        let long = "x".repeat(1000);
        let value = serde_json::json!({"a": {"b": {"c": {"d": {"e": long}}}}});
        let sanitized = sanitize_details(&value);
        let rendered = sanitized.to_string();
        assert!(rendered.len() < value.to_string().len());
    }

    #[test]
    fn sanitize_truncates_multibyte_strings_without_panicking() {
        let long = "\u{20AC}".repeat(171);
        assert_eq!(long.len(), 513);
        let value = serde_json::json!({"detail": long});
        let sanitized = sanitize_details(&value);
        match sanitized.get("detail") {
            Some(serde_json::Value::String(s)) => assert!(s.ends_with("...[truncated]")),
            other => panic!("expected a truncated string, got {other:?}"),
        }
    }

    #[test]
    fn normalize_retry_after_defaults_negative_to_zero() {
        assert_eq!(normalize_retry_after_ms(Some(-5)), 0);
        assert_eq!(normalize_retry_after_ms(Some(250)), 250);
        assert_eq!(normalize_retry_after_ms(None), 0);
    }
}
