//! The append-only operation log.
//!
//! Grounded on `enterprise::audit::{event, logger, storage}`; the sync
//! kernel's `OperationLogEntry` is this crate's narrowed, sync-specific
//! analogue of the teacher's general `AuditEvent`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Who originated an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    /// A human editor.
    Human,
    /// An AI-originated actor.
    Ai,
}

/// What kind of operation was logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpType {
    /// A CRDT update was applied.
    CrdtUpdate,
    /// A presence update was applied.
    Presence,
    /// A permission decision was made.
    Permission,
    /// A system/lifecycle event (room created/destroyed, compaction, ...).
    System,
}

/// Infer whether an actor is AI or human from an update's `origin` tag
/// (`lfcc:ai:*`) or `userId` (`ai-*`, `ghost-*`), defaulting to human.
pub fn infer_actor_type(origin: Option<&str>, user_id: Option<&str>) -> ActorType {
    if let Some(origin) = origin {
        if origin.starts_with("lfcc:ai:") {
            return ActorType::Ai;
        }
    }
    if let Some(user_id) = user_id {
        if user_id.starts_with("ai-") || user_id.starts_with("ghost-") {
            return ActorType::Ai;
        }
    }
    ActorType::Human
}

/// One append-only entry in a document's operation log. Never modified once
/// written.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationLogEntry {
    /// Unique entry id.
    pub id: Uuid,
    /// The document this entry concerns.
    pub doc_id: String,
    /// The client or user that performed the operation.
    pub actor_id: String,
    /// Whether the actor was human or AI.
    pub actor_type: ActorType,
    /// The kind of operation.
    pub op_type: OpType,
    /// When the operation was logged.
    pub ts: DateTime<Utc>,
    /// The frontier tag produced, if applicable.
    pub frontier_tag: Option<String>,
    /// The frontier tag consumed, if applicable.
    pub parent_frontier_tag: Option<String>,
    /// Size in bytes, if applicable.
    pub size_bytes: Option<u64>,
    /// A short human-readable summary, e.g. `"write_denied"`.
    pub summary: Option<String>,
}

/// A query over the operation log.
#[derive(Debug, Clone, Default)]
pub struct OperationLogQuery {
    /// Restrict to entries for this document.
    pub doc_id: Option<String>,
    /// Restrict to entries from this actor.
    pub actor_id: Option<String>,
    /// Restrict to entries of this type.
    pub op_type: Option<OpType>,
    /// Maximum number of entries to return, most recent first.
    pub limit: Option<usize>,
}

/// Errors raised by operation log append/query. Append failures are logged
/// by callers but never abort the message path they arose from.
#[derive(Debug, Error)]
pub enum AuditError {
    /// The underlying sink failed to persist the entry.
    #[error("append failed: {0}")]
    AppendFailed(String),
}

/// Result alias for the audit module.
pub type Result<T> = std::result::Result<T, AuditError>;

/// A sink for operation log entries, and a query surface over them.
#[async_trait]
pub trait OperationLog: Send + Sync {
    /// Append an entry. Implementations should never panic; a failure here
    /// must not abort the caller's message handling.
    async fn append(&self, entry: OperationLogEntry) -> Result<()>;

    /// Query the log.
    async fn query(&self, query: OperationLogQuery) -> Result<Vec<OperationLogEntry>>;
}

/// A process-local, non-durable operation log.
#[derive(Default)]
pub struct InMemoryOperationLog {
    entries: Mutex<Vec<OperationLogEntry>>,
}

impl InMemoryOperationLog {
    /// Construct an empty log.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OperationLog for InMemoryOperationLog {
    async fn append(&self, entry: OperationLogEntry) -> Result<()> {
        self.entries.lock().push(entry);
        Ok(())
    }

    async fn query(&self, query: OperationLogQuery) -> Result<Vec<OperationLogEntry>> {
        let entries = self.entries.lock();
        let mut matched: Vec<OperationLogEntry> = entries
            .iter()
            .rev()
            .filter(|e| query.doc_id.as_deref().map_or(true, |d| d == e.doc_id))
            .filter(|e| query.actor_id.as_deref().map_or(true, |a| a == e.actor_id))
            .filter(|e| query.op_type.map_or(true, |t| t == e.op_type))
            .cloned()
            .collect();
        if let Some(limit) = query.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(doc_id: &str, actor_id: &str, op_type: OpType) -> OperationLogEntry {
        OperationLogEntry {
            id: Uuid::new_v4(),
            doc_id: doc_id.to_string(),
            actor_id: actor_id.to_string(),
            actor_type: ActorType::Human,
            op_type,
            ts: Utc::now(),
            frontier_tag: None,
            parent_frontier_tag: None,
            size_bytes: None,
            summary: None,
        }
    }

    #[test]
    fn infer_actor_type_from_origin_tag() {
        assert_eq!(infer_actor_type(Some("lfcc:ai:summarize"), None), ActorType::Ai);
        assert_eq!(infer_actor_type(None, Some("ai-writer-1")), ActorType::Ai);
        assert_eq!(infer_actor_type(None, Some("ghost-42")), ActorType::Ai);
        assert_eq!(infer_actor_type(None, Some("alice")), ActorType::Human);
        assert_eq!(infer_actor_type(None, None), ActorType::Human);
    }

    #[tokio::test]
    async fn append_then_query_by_doc_and_actor() {
        let log = InMemoryOperationLog::new();
        log.append(entry("doc-1", "alice", OpType::CrdtUpdate)).await.unwrap();
        log.append(entry("doc-1", "bob", OpType::Presence)).await.unwrap();
        log.append(entry("doc-2", "alice", OpType::CrdtUpdate)).await.unwrap();

        let results = log
            .query(OperationLogQuery {
                doc_id: Some("doc-1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(results.len(), 2);

        let results = log
            .query(OperationLogQuery {
                actor_id: Some("alice".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn query_returns_most_recent_first_and_respects_limit() {
        let log = InMemoryOperationLog::new();
        for i in 0..5 {
            log.append(entry("doc-1", &format!("actor-{i}"), OpType::System))
                .await
                .unwrap();
        }
        let results = log
            .query(OperationLogQuery {
                limit: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].actor_id, "actor-4");
    }
}
