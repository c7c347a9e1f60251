//! Crate-wide error type.
//!
//! Each module defines its own `thiserror`-derived error enum scoped to that
//! module's concerns (see `encoding::EncodingError`, `policy::PolicyError`,
//! `storage::StorageError`, `protocol::ProtocolError`, `sync::SyncError`).
//! This type composes them for callers that cross module boundaries, the way
//! the teacher's `CollaborationError` composes `ProtocolError` and friends.

use thiserror::Error;

use crate::encoding::EncodingError;
use crate::policy::PolicyError;
use crate::protocol::ProtocolError;
use crate::storage::StorageError;

/// Crate-wide result alias.
pub type WeaveResult<T> = std::result::Result<T, WeaveError>;

/// Crate-wide error type.
#[derive(Debug, Error)]
pub enum WeaveError {
    /// Encoding/decoding failure.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Policy manifest validation or negotiation failure.
    #[error("policy error: {0}")]
    Policy(#[from] PolicyError),

    /// Durable storage failure.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Wire protocol failure.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Sync kernel failure not otherwise categorized.
    #[error("sync error: {0}")]
    Sync(String),

    /// Catch-all for unexpected internal conditions.
    #[error("internal error: {0}")]
    Internal(String),
}
