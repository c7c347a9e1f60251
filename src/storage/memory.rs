//! A non-durable, in-process storage backend. Useful for tests and for
//! ephemeral documents that opt out of durability.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use super::{sanitize_doc_id, DocumentMetadata, Result, Snapshot, StorageBackend, StorageError, Update};

#[derive(Default)]
struct DocState {
    snapshots: Vec<Snapshot>,
    updates: Vec<Update>,
    frontier_tag: String,
    meta: Option<DocumentMetadata>,
}

/// An in-memory `docId -> {snapshots, updates, frontierTag}` mapping with no
/// durability across process restarts.
#[derive(Default)]
pub struct InMemory {
    docs: Mutex<HashMap<String, DocState>>,
}

impl InMemory {
    /// Construct an empty in-memory backend.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for InMemory {
    async fn get_latest_snapshot(&self, doc_id: &str) -> Result<Option<Snapshot>> {
        sanitize_doc_id(doc_id)?;
        let docs = self.docs.lock();
        Ok(docs
            .get(doc_id)
            .and_then(|d| d.snapshots.last())
            .cloned())
    }

    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<()> {
        sanitize_doc_id(&snapshot.doc_id)?;
        let mut docs = self.docs.lock();
        let doc = docs.entry(snapshot.doc_id.clone()).or_default();
        doc.snapshots.push(snapshot);
        doc.snapshots.sort_by_key(|s| s.seq);
        Ok(())
    }

    async fn list_snapshots(&self, doc_id: &str) -> Result<Vec<Snapshot>> {
        sanitize_doc_id(doc_id)?;
        let docs = self.docs.lock();
        Ok(docs
            .get(doc_id)
            .map(|d| d.snapshots.clone())
            .unwrap_or_default())
    }

    async fn delete_snapshot(&self, doc_id: &str, seq: u64) -> Result<()> {
        sanitize_doc_id(doc_id)?;
        let mut docs = self.docs.lock();
        let doc = docs
            .get_mut(doc_id)
            .ok_or_else(|| StorageError::NotFound(doc_id.to_string()))?;
        let before = doc.snapshots.len();
        doc.snapshots.retain(|s| s.seq != seq);
        if doc.snapshots.len() == before {
            return Err(StorageError::NotFound(format!("{doc_id}@{seq}")));
        }
        Ok(())
    }

    async fn get_updates(&self, doc_id: &str, after_seq: Option<u64>) -> Result<Vec<Update>> {
        sanitize_doc_id(doc_id)?;
        let docs = self.docs.lock();
        let updates = docs.get(doc_id).map(|d| d.updates.clone()).unwrap_or_default();
        Ok(match after_seq {
            Some(after) => updates.into_iter().filter(|u| u.seq > after).collect(),
            None => updates,
        })
    }

    async fn get_updates_since(&self, doc_id: &str, frontier_tag: &str) -> Result<Vec<Update>> {
        sanitize_doc_id(doc_id)?;
        let docs = self.docs.lock();
        let updates = docs.get(doc_id).map(|d| d.updates.clone()).unwrap_or_default();
        let pos = updates.iter().position(|u| u.parent_frontier_tag == frontier_tag);
        Ok(match pos {
            Some(i) => updates[i..].to_vec(),
            None => updates,
        })
    }

    async fn append_update(&self, update: Update) -> Result<()> {
        sanitize_doc_id(&update.doc_id)?;
        let mut docs = self.docs.lock();
        let doc = docs.entry(update.doc_id.clone()).or_default();
        doc.frontier_tag = update.frontier_tag.clone();
        let now = Utc::now();
        let created_at = doc.meta.as_ref().map(|m| m.created_at).unwrap_or(now);
        doc.meta = Some(DocumentMetadata {
            doc_id: update.doc_id.clone(),
            latest_seq: update.seq,
            latest_snapshot_seq: doc.snapshots.last().map(|s| s.seq),
            frontier_tag: update.frontier_tag.clone(),
            created_at,
            updated_at: now,
        });
        doc.updates.push(update);
        Ok(())
    }

    async fn delete_updates(&self, doc_id: &str, before_seq: u64) -> Result<()> {
        sanitize_doc_id(doc_id)?;
        let mut docs = self.docs.lock();
        if let Some(doc) = docs.get_mut(doc_id) {
            doc.updates.retain(|u| u.seq >= before_seq);
        }
        Ok(())
    }

    async fn get_latest_seq(&self, doc_id: &str) -> Result<u64> {
        sanitize_doc_id(doc_id)?;
        let docs = self.docs.lock();
        Ok(docs
            .get(doc_id)
            .and_then(|d| d.updates.last().map(|u| u.seq))
            .unwrap_or(0))
    }

    async fn get_current_frontier_tag(&self, doc_id: &str) -> Result<String> {
        sanitize_doc_id(doc_id)?;
        let docs = self.docs.lock();
        Ok(docs
            .get(doc_id)
            .map(|d| d.frontier_tag.clone())
            .unwrap_or_default())
    }

    async fn doc_exists(&self, doc_id: &str) -> Result<bool> {
        sanitize_doc_id(doc_id)?;
        Ok(self.docs.lock().contains_key(doc_id))
    }

    async fn list_docs(&self) -> Result<Vec<String>> {
        Ok(self.docs.lock().keys().cloned().collect())
    }

    async fn delete_doc(&self, doc_id: &str) -> Result<()> {
        sanitize_doc_id(doc_id)?;
        self.docs.lock().remove(doc_id);
        Ok(())
    }
}
