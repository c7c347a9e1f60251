//! The error code catalog: each [`ErrorCode`] maps to a fixed
//! [`ErrorCategory`] and default retryability.

use serde::{Deserialize, Serialize};

use super::sanitize_details;

/// The closed set of wire-level error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// A message failed structural validation.
    ValidationFailed,
    /// The two peers' policy manifests could not be reconciled.
    ErrPolicyIncompatible,
    /// The client and server computed different hashes for the same manifest.
    PolicyHashMismatch,
    /// The handshake did not arrive before the timeout.
    HandshakeTimeout,
    /// The auth adapter denied the connection.
    Unauthorized,
    /// The target room is at capacity.
    RoomFull,
    /// A raw frame exceeded the configured size limit.
    PayloadTooLarge,
    /// The requested document has no persisted state.
    DocNotFound,
    /// The client exceeded its rate limit.
    RateLimited,
    /// The connection was idle past the configured timeout.
    IdleTimeout,
    /// The client exhausted its reconnect attempts.
    MaxReconnectAttempts,
    /// An error not otherwise categorized.
    Internal,
}

/// The category an [`ErrorCode`] belongs to, used by clients to decide how
/// to react (retry, surface to the user, abandon the session).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// The message itself was malformed.
    Validation,
    /// A policy manifest could not be reconciled.
    Policy,
    /// A write lost a race against a concurrent update.
    Conflict,
    /// The client is sending too fast.
    RateLimit,
    /// The connection failed authentication or authorization.
    Auth,
    /// A resource limit (room capacity, payload size) was hit.
    Capacity,
    /// The referenced resource does not exist.
    NotFound,
    /// An operation exceeded its time budget.
    Timeout,
    /// An unanticipated internal failure.
    Internal,
}

impl ErrorCode {
    /// The category this code belongs to.
    pub fn category(self) -> ErrorCategory {
        match self {
            ErrorCode::ValidationFailed => ErrorCategory::Validation,
            ErrorCode::ErrPolicyIncompatible | ErrorCode::PolicyHashMismatch => ErrorCategory::Policy,
            ErrorCode::HandshakeTimeout => ErrorCategory::Timeout,
            ErrorCode::Unauthorized => ErrorCategory::Auth,
            ErrorCode::RoomFull | ErrorCode::PayloadTooLarge => ErrorCategory::Capacity,
            ErrorCode::DocNotFound => ErrorCategory::NotFound,
            ErrorCode::RateLimited => ErrorCategory::RateLimit,
            ErrorCode::IdleTimeout => ErrorCategory::Timeout,
            ErrorCode::MaxReconnectAttempts => ErrorCategory::Internal,
            ErrorCode::Internal => ErrorCategory::Internal,
        }
    }

    /// Whether this code is retryable by default.
    pub fn default_retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::RateLimited | ErrorCode::HandshakeTimeout | ErrorCode::IdleTimeout
        )
    }
}

/// The `error` message payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ErrorPayload {
    /// The error code.
    pub code: ErrorCode,
    /// The code's category, cached for clients that don't keep the catalog.
    pub category: ErrorCategory,
    /// A human-readable message. Not for programmatic branching — use `code`.
    pub message: String,
    /// Whether the client may usefully retry.
    pub retryable: bool,
    /// Suggested backoff before retrying, in milliseconds.
    pub retry_after_ms: Option<u64>,
    /// Sanitized structured detail, bounded by [`sanitize_details`].
    pub details: Option<serde_json::Value>,
}

/// Build an [`ErrorPayload`] from a code, applying the catalog's default
/// category/retryability unless overridden, and sanitizing `details`.
pub fn build_error_payload(
    code: ErrorCode,
    message: impl Into<String>,
    retry_after_ms: Option<i64>,
    details: Option<serde_json::Value>,
) -> ErrorPayload {
    ErrorPayload {
        code,
        category: code.category(),
        message: message.into(),
        retryable: code.default_retryable(),
        retry_after_ms: retry_after_ms
            .map(|v| super::normalize_retry_after_ms(Some(v)))
            .filter(|_| code.default_retryable()),
        details: details.map(|d| sanitize_details(&d)),
    }
}
