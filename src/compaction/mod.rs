//! Compaction policy and snapshot + tail-replay recovery.
//!
//! Grounded on `enterprise::eventsource::snapshot` (the `Snapshot`/
//! `SnapshotStore` shape) and `enterprise::eventsource::replay`
//! (replay-driven aggregate rebuild with a result struct), generalized from
//! aggregate-replay to document-frontier replay.

use std::future::Future;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::{DocumentMetadata, Snapshot, StorageBackend, StorageError, Update};

/// Configurable compaction thresholds. Defaults are contracts, not magic
/// numbers: callers are expected to tune them to their document traffic.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CompactionPolicy {
    /// Update-log length above which compaction is triggered.
    pub update_threshold: u64,
    /// Number of most-recent updates retained after compaction.
    pub keep_recent_updates: u64,
    /// Minimum elapsed time between compactions for a single document.
    pub min_interval_ms: u64,
}

impl Default for CompactionPolicy {
    fn default() -> Self {
        Self {
            update_threshold: 500,
            keep_recent_updates: 50,
            min_interval_ms: 60_000,
        }
    }
}

/// Errors raised by compaction or recovery.
#[derive(Debug, Error)]
pub enum CompactionError {
    /// The storage backend returned an error.
    #[error("storage error during compaction: {0}")]
    Storage(#[from] StorageError),

    /// The caller-supplied snapshot/apply callback failed.
    #[error("callback failed: {0}")]
    Callback(String),
}

/// Result alias for the compaction module.
pub type Result<T> = std::result::Result<T, CompactionError>;

/// The outcome of a compaction run.
#[derive(Debug, Clone)]
pub struct CompactionResult {
    /// The snapshot that compaction produced.
    pub new_snapshot: Snapshot,
    /// Number of updates deleted by this compaction.
    pub pruned_updates: u64,
    /// Number of updates retained after compaction.
    pub kept_updates: u64,
}

/// Whether a document's update log warrants compaction right now.
///
/// `last_compaction_at` is caller-supplied state (typically a
/// `DashMap<DocId, Instant>` owned by the sync server, mirroring how
/// `ratelimit` keeps per-key state outside the policy struct itself) rather
/// than anything this function tracks internally.
pub async fn should_compact(
    doc_id: &str,
    storage: &dyn StorageBackend,
    policy: &CompactionPolicy,
    last_compaction_at: Option<std::time::Instant>,
) -> Result<bool> {
    if let Some(last) = last_compaction_at {
        if last.elapsed().as_millis() < policy.min_interval_ms as u128 {
            return Ok(false);
        }
    }
    let latest_seq = storage.get_latest_seq(doc_id).await?;
    let snapshots = storage.list_snapshots(doc_id).await?;
    let latest_snapshot_seq = snapshots.last().map(|s| s.seq).unwrap_or(0);
    let log_len = latest_seq.saturating_sub(latest_snapshot_seq);
    Ok(log_len >= policy.update_threshold)
}

/// Run compaction for a document.
///
/// `create_snapshot` replays the caller's live CRDT state into an opaque
/// blob; it is invoked with the document id and must return bytes plus the
/// frontier tag they represent. The resulting snapshot is saved at the
/// current latest sequence number, and updates older than
/// `latest_seq - keep_recent_updates + 1` are pruned, keeping exactly
/// `keep_recent_updates` entries when the log is at least that long.
pub async fn run_compaction<F, Fut>(
    storage: &dyn StorageBackend,
    policy: &CompactionPolicy,
    doc_id: &str,
    create_snapshot: F,
) -> Result<CompactionResult>
where
    F: FnOnce(String) -> Fut,
    Fut: Future<Output = std::result::Result<(Vec<u8>, String), String>>,
{
    let latest_seq = storage.get_latest_seq(doc_id).await?;
    let (data, frontier_tag) = create_snapshot(doc_id.to_string())
        .await
        .map_err(CompactionError::Callback)?;

    let snapshot = Snapshot {
        doc_id: doc_id.to_string(),
        seq: latest_seq,
        size_bytes: data.len() as u64,
        checksum: crate::storage::checksum::fnv1a_hex(&data),
        data,
        frontier_tag,
        created_at: chrono::Utc::now(),
    };
    storage.save_snapshot(snapshot.clone()).await?;

    let before_seq = latest_seq.saturating_sub(policy.keep_recent_updates).saturating_add(1);
    let remaining_before = storage.get_updates(doc_id, None).await?.len() as u64;
    storage.delete_updates(doc_id, before_seq).await?;
    let remaining_after = storage.get_updates(doc_id, None).await?.len() as u64;

    Ok(CompactionResult {
        new_snapshot: snapshot,
        pruned_updates: remaining_before.saturating_sub(remaining_after),
        kept_updates: remaining_after,
    })
}

/// The outcome of a recovery attempt.
#[derive(Debug, Clone)]
pub struct RecoveryResult {
    /// Whether recovery completed without error.
    pub success: bool,
    /// The document that was recovered.
    pub doc_id: String,
    /// The frontier tag after recovery, if successful.
    pub frontier_tag: Option<String>,
    /// Number of updates replayed after the snapshot (or from scratch).
    pub updates_applied: u64,
    /// Whether a snapshot was used as the recovery base.
    pub snapshot_used: bool,
    /// The error message, if recovery failed.
    pub error: Option<String>,
}

/// Recover a document's live state from storage.
///
/// Loads the latest snapshot (if any) via `apply_snapshot`, then replays
/// every update with `seq` strictly greater than the snapshot's via
/// `apply_update`, in order. Recovery never partially mutates persisted
/// state: any failure converts to `success: false` without touching storage.
pub async fn recover_doc<S, SFut, U, UFut>(
    storage: &dyn StorageBackend,
    doc_id: &str,
    apply_snapshot: S,
    apply_update: U,
) -> RecoveryResult
where
    S: FnOnce(String, Vec<u8>) -> SFut,
    SFut: Future<Output = std::result::Result<(), String>>,
    U: Fn(String, Vec<u8>) -> UFut,
    UFut: Future<Output = std::result::Result<String, String>>,
{
    match recover_doc_inner(storage, doc_id, apply_snapshot, apply_update).await {
        Ok(result) => result,
        Err(e) => RecoveryResult {
            success: false,
            doc_id: doc_id.to_string(),
            frontier_tag: None,
            updates_applied: 0,
            snapshot_used: false,
            error: Some(e.to_string()),
        },
    }
}

async fn recover_doc_inner<S, SFut, U, UFut>(
    storage: &dyn StorageBackend,
    doc_id: &str,
    apply_snapshot: S,
    apply_update: U,
) -> Result<RecoveryResult>
where
    S: FnOnce(String, Vec<u8>) -> SFut,
    SFut: Future<Output = std::result::Result<(), String>>,
    U: Fn(String, Vec<u8>) -> UFut,
    UFut: Future<Output = std::result::Result<String, String>>,
{
    let snapshot = storage.get_latest_snapshot(doc_id).await?;
    let snapshot_used = snapshot.is_some();
    let snapshot_seq = snapshot.as_ref().map(|s| s.seq);
    let mut frontier_tag = snapshot.as_ref().map(|s| s.frontier_tag.clone());

    if let Some(snapshot) = snapshot {
        apply_snapshot(doc_id.to_string(), snapshot.data)
            .await
            .map_err(CompactionError::Callback)?;
    }

    let updates: Vec<Update> = storage.get_updates(doc_id, snapshot_seq).await?;
    let mut applied = 0u64;
    for update in &updates {
        let tag = apply_update(doc_id.to_string(), update.data.clone())
            .await
            .map_err(CompactionError::Callback)?;
        frontier_tag = Some(tag);
        applied += 1;
    }

    Ok(RecoveryResult {
        success: true,
        doc_id: doc_id.to_string(),
        frontier_tag,
        updates_applied: applied,
        snapshot_used,
        error: None,
    })
}

/// Compare the current persisted frontier tag against an expectation.
pub async fn verify_recovery(
    storage: &dyn StorageBackend,
    doc_id: &str,
    expected_tag: &str,
) -> Result<bool> {
    let current = storage.get_current_frontier_tag(doc_id).await?;
    Ok(current == expected_tag)
}

/// Diagnostic snapshot of a document's recovery-relevant state.
#[derive(Debug, Clone)]
pub struct RecoveryState {
    /// Whether a snapshot exists for this document.
    pub has_snapshot: bool,
    /// The sequence number of the latest snapshot, if any.
    pub snapshot_seq: Option<u64>,
    /// Number of updates newer than the latest snapshot.
    pub pending_updates: u64,
    /// The document's current frontier tag.
    pub frontier_tag: String,
}

/// Expose `{hasSnapshot, snapshotSeq, pendingUpdates, frontierTag}` for
/// diagnostics and tests.
pub async fn get_recovery_state(storage: &dyn StorageBackend, doc_id: &str) -> Result<RecoveryState> {
    let snapshot = storage.get_latest_snapshot(doc_id).await?;
    let snapshot_seq = snapshot.as_ref().map(|s| s.seq);
    let updates = storage.get_updates(doc_id, snapshot_seq).await?;
    let frontier_tag = storage.get_current_frontier_tag(doc_id).await?;
    Ok(RecoveryState {
        has_snapshot: snapshot.is_some(),
        snapshot_seq,
        pending_updates: updates.len() as u64,
        frontier_tag,
    })
}

/// Track a document's metadata together with whether recovery has run,
/// useful for the sync server's startup path.
#[derive(Debug, Clone)]
pub struct RecoveredDocument {
    /// Storage's view of this document's bookkeeping.
    pub metadata: DocumentMetadata,
    /// The recovery outcome that produced the live state.
    pub recovery: RecoveryResult,
}
