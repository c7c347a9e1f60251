//! Durable storage for per-document snapshots and the update log.
//!
//! Grounded on the teacher's `enterprise::eventsource::store` (`EventStore`
//! trait, `get_events_since`, append-only persistence) for the trait shape,
//! generalized from event-sourced aggregates to CRDT documents keyed by
//! frontier tag rather than by aggregate version.

pub mod checksum;
pub mod file;
pub mod fs;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use file::FileBacked;
pub use fs::{FsError, IFileSystem, MemoryFileSystem, OsFileSystem};
pub use memory::InMemory;

/// A persisted CRDT update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Update {
    /// The document this update belongs to.
    pub doc_id: String,
    /// Per-document, strictly increasing, contiguous sequence number.
    pub seq: u64,
    /// The opaque CRDT update bytes.
    pub data: Vec<u8>,
    /// The frontier tag this update produces.
    pub frontier_tag: String,
    /// The frontier tag this update was built on.
    pub parent_frontier_tag: String,
    /// The client that authored this update.
    pub client_id: String,
    /// When the update was received by the server.
    pub timestamp: DateTime<Utc>,
    /// Size of `data` in bytes, cached so callers don't re-measure it.
    pub size_bytes: u64,
    /// Free-form origin tag, e.g. `lfcc:ai:*`.
    pub origin: Option<String>,
}

/// A persisted full-document snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// The document this snapshot captures.
    pub doc_id: String,
    /// The sequence number at which this snapshot was taken.
    pub seq: u64,
    /// The opaque snapshot bytes.
    pub data: Vec<u8>,
    /// The frontier tag of the captured state.
    pub frontier_tag: String,
    /// When the snapshot was created.
    pub created_at: DateTime<Utc>,
    /// Size of `data` in bytes.
    pub size_bytes: u64,
    /// FNV-1a 32-bit hex checksum over `data`.
    pub checksum: String,
}

/// Per-document bookkeeping record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// The document this record describes.
    pub doc_id: String,
    /// The highest update sequence number persisted.
    pub latest_seq: u64,
    /// The sequence number of the most recent snapshot, if any.
    pub latest_snapshot_seq: Option<u64>,
    /// The current frontier tag: that of the last persisted update, or the
    /// snapshot's if there are no newer updates.
    pub frontier_tag: String,
    /// When the document was first written.
    pub created_at: DateTime<Utc>,
    /// When the document was last written.
    pub updated_at: DateTime<Utc>,
}

/// Errors raised by a storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    /// No such document, snapshot, or update exists.
    #[error("not found: {0}")]
    NotFound(String),

    /// The requested document id is not filesystem-safe.
    #[error("invalid document id: {0}")]
    InvalidDocId(String),

    /// On-disk data failed its integrity check and was skipped.
    #[error("corrupt data skipped: {0}")]
    Corrupt(String),

    /// Underlying I/O failure.
    #[error("io error: {0}")]
    Io(String),
}

impl From<FsError> for StorageError {
    fn from(e: FsError) -> Self {
        match e {
            FsError::NotFound(p) => StorageError::NotFound(p),
            other => StorageError::Io(other.to_string()),
        }
    }
}

/// Result alias for the storage module.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Durable storage for per-document snapshots and the update log.
///
/// Implementations must serialize writes per document (the Kernel relies on
/// `append_update` advancing the frontier atomically with respect to
/// concurrent reads of the same document).
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// The most recent snapshot for a document, if any.
    async fn get_latest_snapshot(&self, doc_id: &str) -> Result<Option<Snapshot>>;

    /// Persist a new snapshot.
    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<()>;

    /// All snapshots for a document, ordered by `seq` ascending.
    async fn list_snapshots(&self, doc_id: &str) -> Result<Vec<Snapshot>>;

    /// Delete a specific snapshot.
    async fn delete_snapshot(&self, doc_id: &str, seq: u64) -> Result<()>;

    /// Updates for a document, ordered by `seq` ascending, optionally only
    /// those with `seq > after_seq`.
    async fn get_updates(&self, doc_id: &str, after_seq: Option<u64>) -> Result<Vec<Update>>;

    /// The suffix of the update log starting at the update whose
    /// `parent_frontier_tag` matches `frontier_tag`; the full log if no such
    /// update exists.
    async fn get_updates_since(&self, doc_id: &str, frontier_tag: &str) -> Result<Vec<Update>>;

    /// Atomically append an update and advance the document's frontier tag.
    async fn append_update(&self, update: Update) -> Result<()>;

    /// Prune updates with `seq < before_seq`.
    async fn delete_updates(&self, doc_id: &str, before_seq: u64) -> Result<()>;

    /// The highest persisted update sequence number, or `0` for an unwritten
    /// document.
    async fn get_latest_seq(&self, doc_id: &str) -> Result<u64>;

    /// The document's current frontier tag.
    async fn get_current_frontier_tag(&self, doc_id: &str) -> Result<String>;

    /// Whether a document has ever been written.
    async fn doc_exists(&self, doc_id: &str) -> Result<bool>;

    /// All known document ids.
    async fn list_docs(&self) -> Result<Vec<String>>;

    /// Permanently delete a document and all its snapshots/updates.
    async fn delete_doc(&self, doc_id: &str) -> Result<()>;
}

/// Sanitize a document id into a filesystem-safe directory name.
///
/// Replaces every character other than ASCII alphanumerics, `-`, and `_` with
/// `_`, and rejects ids that would normalize to an empty string or to `.`/
/// `..` (path traversal).
pub fn sanitize_doc_id(doc_id: &str) -> Result<String> {
    if doc_id.is_empty() {
        return Err(StorageError::InvalidDocId("empty document id".to_string()));
    }
    let sanitized: String = doc_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if sanitized.is_empty() || sanitized == "." || sanitized == ".." {
        return Err(StorageError::InvalidDocId(doc_id.to_string()));
    }
    Ok(sanitized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_unsafe_characters() {
        assert_eq!(sanitize_doc_id("doc/../etc").unwrap(), "doc___etc");
        assert_eq!(sanitize_doc_id("my-doc_1").unwrap(), "my-doc_1");
    }

    #[test]
    fn sanitize_rejects_empty_and_dot_ids() {
        assert!(sanitize_doc_id("").is_err());
        assert!(sanitize_doc_id(".").is_err());
        assert!(sanitize_doc_id("..").is_err());
    }
}
