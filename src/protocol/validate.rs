//! Structural validators for inbound messages.
//!
//! Two validators exist, one per direction, because the set of message types
//! a peer may legitimately *receive* differs: a client never legitimately
//! receives a `handshake` (that's server-inbound only), and a server never
//! legitimately receives a `handshake_ack`. Both are total functions: they
//! never panic, they only ever return a [`ValidationResult`] — this is the
//! fuzzing contract from the specification's structural-validation property.

use super::{parse_envelope, Envelope, MessageType};

/// The outcome of validating one inbound frame.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    /// Whether the frame was well-formed and addressed to this direction.
    pub ok: bool,
    /// Human-readable validation failures; empty iff `ok`.
    pub errors: Vec<String>,
    /// The parsed envelope, present iff `ok`.
    pub envelope: Option<Envelope>,
}

impl ValidationResult {
    fn failure(errors: Vec<String>) -> Self {
        Self {
            ok: false,
            errors,
            envelope: None,
        }
    }

    fn success(envelope: Envelope) -> Self {
        Self {
            ok: true,
            errors: Vec::new(),
            envelope: Some(envelope),
        }
    }
}

/// Message types a server may legitimately receive from a client.
const SERVER_INBOUND_TYPES: &[MessageType] = &[
    MessageType::Handshake,
    MessageType::DocUpdate,
    MessageType::Presence,
    MessageType::CatchUpRequest,
    MessageType::Ping,
    MessageType::Pong,
];

/// Message types a client may legitimately receive from a server.
const CLIENT_INBOUND_TYPES: &[MessageType] = &[
    MessageType::HandshakeAck,
    MessageType::DocUpdate,
    MessageType::DocAck,
    MessageType::PresenceAck,
    MessageType::CatchUpResponse,
    MessageType::Error,
    MessageType::Ping,
    MessageType::Pong,
];

fn validate_direction(raw: &str, allowed: &[MessageType], direction: &str) -> ValidationResult {
    let envelope = match parse_envelope(raw) {
        Ok(e) => e,
        Err(e) => return ValidationResult::failure(vec![e.to_string()]),
    };

    let message_type = envelope.message_type();
    if !allowed.contains(&message_type) {
        return ValidationResult::failure(vec![format!(
            "message type {message_type:?} is not valid {direction}-inbound"
        )]);
    }

    if envelope.doc_id.trim().is_empty() {
        return ValidationResult::failure(vec!["docId must not be empty".to_string()]);
    }
    if envelope.client_id.trim().is_empty() {
        return ValidationResult::failure(vec!["clientId must not be empty".to_string()]);
    }

    ValidationResult::success(envelope)
}

/// Validate a raw frame a server received from a client. Never panics.
pub fn validate_server_inbound(raw: &str) -> ValidationResult {
    validate_direction(raw, SERVER_INBOUND_TYPES, "server")
}

/// Validate a raw frame a client received from a server. Never panics.
pub fn validate_client_inbound(raw: &str) -> ValidationResult {
    validate_direction(raw, CLIENT_INBOUND_TYPES, "client")
}
