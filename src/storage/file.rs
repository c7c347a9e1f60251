//! A durable, file-backed [`StorageBackend`].
//!
//! Layout, rooted at a configurable base directory:
//!
//! ```text
//! index.json
//! docs/<sanitized-doc-id>/
//!   meta.json
//!   snapshots/<zero-padded-seq>.snapshot
//!   snapshots/<zero-padded-seq>.snapshot.meta.json
//!   updates/<zero-padded-seq>.update
//!   updates/<zero-padded-seq>.update.meta.json
//! ```
//!
//! Generic over [`IFileSystem`] so the same code path is exercised against
//! both the real OS filesystem and [`MemoryFileSystem`](super::fs::MemoryFileSystem)
//! in tests, mirroring how the teacher tests `enterprise::cloud::storage`
//! against a fake backend.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::checksum::fnv1a_hex;
use super::fs::IFileSystem;
use super::{sanitize_doc_id, DocumentMetadata, Result, Snapshot, StorageBackend, StorageError, Update};

const SEQ_WIDTH: usize = 20;

fn seq_name(seq: u64) -> String {
    format!("{seq:0width$}", width = SEQ_WIDTH)
}

#[derive(Debug, Serialize, Deserialize)]
struct UpdateFileMeta {
    seq: u64,
    frontier_tag: String,
    parent_frontier_tag: String,
    client_id: String,
    timestamp: chrono::DateTime<Utc>,
    size_bytes: u64,
    origin: Option<String>,
    checksum: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFileMeta {
    seq: u64,
    frontier_tag: String,
    created_at: chrono::DateTime<Utc>,
    size_bytes: u64,
    checksum: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct GlobalIndex {
    docs: BTreeMap<String, DocumentMetadata>,
}

/// A durable storage backend rooted at a directory on a filesystem `F`.
pub struct FileBacked<F: IFileSystem> {
    base: PathBuf,
    fs: F,
    /// Per-doc write lock: the Kernel requires per-document write
    /// serialization (§5), enforced here independent of any caller-side
    /// locking.
    doc_locks: Mutex<BTreeMap<String, std::sync::Arc<tokio::sync::Mutex<()>>>>,
}

impl<F: IFileSystem> FileBacked<F> {
    /// Construct a file-backed store rooted at `base`, using `fs` for every
    /// filesystem operation.
    pub fn new(base: impl Into<PathBuf>, fs: F) -> Self {
        Self {
            base: base.into(),
            fs,
            doc_locks: Mutex::new(BTreeMap::new()),
        }
    }

    async fn ensure_layout(&self, sanitized: &str) -> Result<()> {
        self.fs.mkdir(&self.base, true).await?;
        self.fs.mkdir(&self.docs_dir(), true).await?;
        self.fs.mkdir(&self.doc_dir(sanitized), true).await?;
        self.fs.mkdir(&self.snapshots_dir(sanitized), true).await?;
        self.fs.mkdir(&self.updates_dir(sanitized), true).await?;
        Ok(())
    }

    fn docs_dir(&self) -> PathBuf {
        self.base.join("docs")
    }

    fn doc_dir(&self, sanitized: &str) -> PathBuf {
        self.docs_dir().join(sanitized)
    }

    fn meta_path(&self, sanitized: &str) -> PathBuf {
        self.doc_dir(sanitized).join("meta.json")
    }

    fn index_path(&self) -> PathBuf {
        self.base.join("index.json")
    }

    fn snapshots_dir(&self, sanitized: &str) -> PathBuf {
        self.doc_dir(sanitized).join("snapshots")
    }

    fn updates_dir(&self, sanitized: &str) -> PathBuf {
        self.doc_dir(sanitized).join("updates")
    }

    async fn lock_for(&self, doc_id: &str) -> std::sync::Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.doc_locks.lock();
        locks
            .entry(doc_id.to_string())
            .or_insert_with(|| std::sync::Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Write `contents` to `final_path` via a temp file + rename so readers
    /// never observe a torn write.
    async fn atomic_write(&self, final_path: &Path, contents: &[u8]) -> Result<()> {
        let tmp_path = final_path.with_extension(format!(
            "tmp.{}",
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        self.fs.write_file(&tmp_path, contents).await?;
        self.fs.rename(&tmp_path, final_path).await?;
        Ok(())
    }

    async fn atomic_write_json<T: Serialize>(&self, final_path: &Path, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|e| StorageError::Io(format!("serialize {}: {e}", final_path.display())))?;
        self.atomic_write(final_path, &bytes).await
    }

    async fn read_json<T: for<'de> Deserialize<'de>>(&self, path: &Path) -> Result<Option<T>> {
        match self.fs.read_file(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StorageError::Io(format!("parse {}: {e}", path.display()))),
            Err(super::fs::FsError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_doc_meta(&self, sanitized: &str) -> Result<Option<DocumentMetadata>> {
        self.read_json(&self.meta_path(sanitized)).await
    }

    async fn write_doc_meta(&self, sanitized: &str, meta: &DocumentMetadata) -> Result<()> {
        self.atomic_write_json(&self.meta_path(sanitized), meta).await?;
        let mut index = self
            .read_json::<GlobalIndex>(&self.index_path())
            .await?
            .unwrap_or_default();
        index.docs.insert(meta.doc_id.clone(), meta.clone());
        self.atomic_write_json(&self.index_path(), &index).await
    }

    async fn list_update_seqs(&self, sanitized: &str) -> Result<Vec<u64>> {
        let entries = match self.fs.readdir(&self.updates_dir(sanitized)).await {
            Ok(e) => e,
            Err(super::fs::FsError::NotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut seqs: Vec<u64> = entries
            .iter()
            .filter_map(|name| name.strip_suffix(".update"))
            .filter_map(|stem| stem.parse().ok())
            .collect();
        seqs.sort_unstable();
        Ok(seqs)
    }

    async fn list_snapshot_seqs(&self, sanitized: &str) -> Result<Vec<u64>> {
        let entries = match self.fs.readdir(&self.snapshots_dir(sanitized)).await {
            Ok(e) => e,
            Err(super::fs::FsError::NotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut seqs: Vec<u64> = entries
            .iter()
            .filter_map(|name| name.strip_suffix(".snapshot"))
            .filter_map(|stem| stem.parse().ok())
            .collect();
        seqs.sort_unstable();
        Ok(seqs)
    }

    async fn load_update(&self, sanitized: &str, doc_id: &str, seq: u64) -> Result<Option<Update>> {
        let name = seq_name(seq);
        let data_path = self.updates_dir(sanitized).join(format!("{name}.update"));
        let meta_path = self
            .updates_dir(sanitized)
            .join(format!("{name}.update.meta.json"));

        let meta: UpdateFileMeta = match self.read_json(&meta_path).await? {
            Some(m) => m,
            None => return Ok(None),
        };
        let data = match self.fs.read_file(&data_path).await {
            Ok(d) => d,
            Err(super::fs::FsError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if fnv1a_hex(&data) != meta.checksum {
            tracing::warn!(doc_id, seq, "update payload failed checksum, skipping");
            return Err(StorageError::Corrupt(format!("{doc_id}@{seq}")));
        }

        Ok(Some(Update {
            doc_id: doc_id.to_string(),
            seq: meta.seq,
            data,
            frontier_tag: meta.frontier_tag,
            parent_frontier_tag: meta.parent_frontier_tag,
            client_id: meta.client_id,
            timestamp: meta.timestamp,
            size_bytes: meta.size_bytes,
            origin: meta.origin,
        }))
    }

    async fn load_snapshot(&self, sanitized: &str, doc_id: &str, seq: u64) -> Result<Option<Snapshot>> {
        let name = seq_name(seq);
        let data_path = self.snapshots_dir(sanitized).join(format!("{name}.snapshot"));
        let meta_path = self
            .snapshots_dir(sanitized)
            .join(format!("{name}.snapshot.meta.json"));

        let meta: SnapshotFileMeta = match self.read_json(&meta_path).await? {
            Some(m) => m,
            None => return Ok(None),
        };
        let data = match self.fs.read_file(&data_path).await {
            Ok(d) => d,
            Err(super::fs::FsError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if fnv1a_hex(&data) != meta.checksum {
            tracing::warn!(doc_id, seq, "snapshot payload failed checksum, skipping");
            return Err(StorageError::Corrupt(format!("{doc_id}@{seq} snapshot")));
        }

        Ok(Some(Snapshot {
            doc_id: doc_id.to_string(),
            seq: meta.seq,
            data,
            frontier_tag: meta.frontier_tag,
            created_at: meta.created_at,
            size_bytes: meta.size_bytes,
            checksum: meta.checksum,
        }))
    }
}

#[async_trait]
impl<F: IFileSystem> StorageBackend for FileBacked<F> {
    async fn get_latest_snapshot(&self, doc_id: &str) -> Result<Option<Snapshot>> {
        let sanitized = sanitize_doc_id(doc_id)?;
        let seqs = self.list_snapshot_seqs(&sanitized).await?;
        for &seq in seqs.iter().rev() {
            match self.load_snapshot(&sanitized, doc_id, seq).await {
                Ok(Some(s)) => return Ok(Some(s)),
                Ok(None) => continue,
                Err(StorageError::Corrupt(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<()> {
        let sanitized = sanitize_doc_id(&snapshot.doc_id)?;
        let lock = self.lock_for(&snapshot.doc_id).await;
        let _guard = lock.lock().await;
        self.ensure_layout(&sanitized).await?;

        let name = seq_name(snapshot.seq);
        let data_path = self.snapshots_dir(&sanitized).join(format!("{name}.snapshot"));
        let meta_path = self
            .snapshots_dir(&sanitized)
            .join(format!("{name}.snapshot.meta.json"));

        self.atomic_write(&data_path, &snapshot.data).await?;
        self.atomic_write_json(
            &meta_path,
            &SnapshotFileMeta {
                seq: snapshot.seq,
                frontier_tag: snapshot.frontier_tag.clone(),
                created_at: snapshot.created_at,
                size_bytes: snapshot.size_bytes,
                checksum: snapshot.checksum.clone(),
            },
        )
        .await?;

        let mut meta = self
            .read_doc_meta(&sanitized)
            .await?
            .unwrap_or_else(|| fresh_meta(&snapshot.doc_id));
        meta.latest_snapshot_seq = Some(snapshot.seq);
        meta.updated_at = Utc::now();
        self.write_doc_meta(&sanitized, &meta).await
    }

    async fn list_snapshots(&self, doc_id: &str) -> Result<Vec<Snapshot>> {
        let sanitized = sanitize_doc_id(doc_id)?;
        let seqs = self.list_snapshot_seqs(&sanitized).await?;
        let mut out = Vec::with_capacity(seqs.len());
        for seq in seqs {
            match self.load_snapshot(&sanitized, doc_id, seq).await {
                Ok(Some(s)) => out.push(s),
                Ok(None) => {}
                Err(StorageError::Corrupt(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    async fn delete_snapshot(&self, doc_id: &str, seq: u64) -> Result<()> {
        let sanitized = sanitize_doc_id(doc_id)?;
        let lock = self.lock_for(doc_id).await;
        let _guard = lock.lock().await;
        let name = seq_name(seq);
        self.fs
            .unlink(&self.snapshots_dir(&sanitized).join(format!("{name}.snapshot")))
            .await?;
        self.fs
            .unlink(
                &self
                    .snapshots_dir(&sanitized)
                    .join(format!("{name}.snapshot.meta.json")),
            )
            .await?;
        Ok(())
    }

    async fn get_updates(&self, doc_id: &str, after_seq: Option<u64>) -> Result<Vec<Update>> {
        let sanitized = sanitize_doc_id(doc_id)?;
        let seqs = self.list_update_seqs(&sanitized).await?;
        let mut out = Vec::new();
        for seq in seqs {
            if after_seq.map_or(false, |after| seq <= after) {
                continue;
            }
            match self.load_update(&sanitized, doc_id, seq).await {
                Ok(Some(u)) => out.push(u),
                Ok(None) => {}
                Err(StorageError::Corrupt(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    async fn get_updates_since(&self, doc_id: &str, frontier_tag: &str) -> Result<Vec<Update>> {
        let all = self.get_updates(doc_id, None).await?;
        let pos = all.iter().position(|u| u.parent_frontier_tag == frontier_tag);
        Ok(match pos {
            Some(i) => all[i..].to_vec(),
            None => all,
        })
    }

    async fn append_update(&self, update: Update) -> Result<()> {
        let sanitized = sanitize_doc_id(&update.doc_id)?;
        let lock = self.lock_for(&update.doc_id).await;
        let _guard = lock.lock().await;
        self.ensure_layout(&sanitized).await?;

        let name = seq_name(update.seq);
        let data_path = self.updates_dir(&sanitized).join(format!("{name}.update"));
        let meta_path = self
            .updates_dir(&sanitized)
            .join(format!("{name}.update.meta.json"));
        let checksum = fnv1a_hex(&update.data);

        self.atomic_write(&data_path, &update.data).await?;
        self.atomic_write_json(
            &meta_path,
            &UpdateFileMeta {
                seq: update.seq,
                frontier_tag: update.frontier_tag.clone(),
                parent_frontier_tag: update.parent_frontier_tag.clone(),
                client_id: update.client_id.clone(),
                timestamp: update.timestamp,
                size_bytes: update.size_bytes,
                origin: update.origin.clone(),
                checksum,
            },
        )
        .await?;

        let mut meta = self
            .read_doc_meta(&sanitized)
            .await?
            .unwrap_or_else(|| fresh_meta(&update.doc_id));
        meta.latest_seq = update.seq;
        meta.frontier_tag = update.frontier_tag;
        meta.updated_at = Utc::now();
        self.write_doc_meta(&sanitized, &meta).await
    }

    async fn delete_updates(&self, doc_id: &str, before_seq: u64) -> Result<()> {
        let sanitized = sanitize_doc_id(doc_id)?;
        let lock = self.lock_for(doc_id).await;
        let _guard = lock.lock().await;
        let seqs = self.list_update_seqs(&sanitized).await?;
        for seq in seqs {
            if seq < before_seq {
                let name = seq_name(seq);
                let _ = self
                    .fs
                    .unlink(&self.updates_dir(&sanitized).join(format!("{name}.update")))
                    .await;
                let _ = self
                    .fs
                    .unlink(
                        &self
                            .updates_dir(&sanitized)
                            .join(format!("{name}.update.meta.json")),
                    )
                    .await;
            }
        }
        Ok(())
    }

    async fn get_latest_seq(&self, doc_id: &str) -> Result<u64> {
        let sanitized = sanitize_doc_id(doc_id)?;
        match self.read_doc_meta(&sanitized).await? {
            Some(meta) => Ok(meta.latest_seq),
            None => Ok(0),
        }
    }

    async fn get_current_frontier_tag(&self, doc_id: &str) -> Result<String> {
        let sanitized = sanitize_doc_id(doc_id)?;
        match self.read_doc_meta(&sanitized).await? {
            Some(meta) => Ok(meta.frontier_tag),
            None => Ok(String::new()),
        }
    }

    async fn doc_exists(&self, doc_id: &str) -> Result<bool> {
        let sanitized = sanitize_doc_id(doc_id)?;
        Ok(self.fs.exists(&self.meta_path(&sanitized)).await)
    }

    async fn list_docs(&self) -> Result<Vec<String>> {
        let index = self
            .read_json::<GlobalIndex>(&self.index_path())
            .await?
            .unwrap_or_default();
        Ok(index.docs.into_keys().collect())
    }

    async fn delete_doc(&self, doc_id: &str) -> Result<()> {
        let sanitized = sanitize_doc_id(doc_id)?;
        let lock = self.lock_for(doc_id).await;
        let _guard = lock.lock().await;
        let _ = self.fs.rmdir(&self.doc_dir(&sanitized), true).await;
        let mut index = self
            .read_json::<GlobalIndex>(&self.index_path())
            .await?
            .unwrap_or_default();
        index.docs.remove(doc_id);
        self.atomic_write_json(&self.index_path(), &index).await
    }
}

fn fresh_meta(doc_id: &str) -> DocumentMetadata {
    let now = Utc::now();
    DocumentMetadata {
        doc_id: doc_id.to_string(),
        latest_seq: 0,
        latest_snapshot_seq: None,
        frontier_tag: String::new(),
        created_at: now,
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::fs::MemoryFileSystem;

    fn update(doc_id: &str, seq: u64, parent: &str, frontier: &str) -> Update {
        Update {
            doc_id: doc_id.to_string(),
            seq,
            data: format!("payload-{seq}").into_bytes(),
            frontier_tag: frontier.to_string(),
            parent_frontier_tag: parent.to_string(),
            client_id: "client-a".to_string(),
            timestamp: Utc::now(),
            size_bytes: 0,
            origin: None,
        }
    }

    fn store() -> FileBacked<MemoryFileSystem> {
        FileBacked::new("/data", MemoryFileSystem::new())
    }

    #[tokio::test]
    async fn append_and_read_back_round_trips() {
        let store = store();
        store.append_update(update("doc-1", 1, "", "t1")).await.unwrap();
        store.append_update(update("doc-1", 2, "t1", "t2")).await.unwrap();

        let updates = store.get_updates("doc-1", None).await.unwrap();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].data, b"payload-1");
        assert_eq!(store.get_latest_seq("doc-1").await.unwrap(), 2);
        assert_eq!(store.get_current_frontier_tag("doc-1").await.unwrap(), "t2");
    }

    #[tokio::test]
    async fn corrupted_payload_is_skipped_not_propagated() {
        let store = store();
        store.append_update(update("doc-1", 1, "", "t1")).await.unwrap();
        store.append_update(update("doc-1", 2, "t1", "t2")).await.unwrap();

        store
            .fs
            .write_file(
                Path::new("/data/docs/doc-1/updates/00000000000000000001.update"),
                b"corrupted",
            )
            .await
            .unwrap();

        let updates = store.get_updates("doc-1", None).await.unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].seq, 2);
    }

    #[tokio::test]
    async fn delete_updates_prunes_below_threshold() {
        let store = store();
        for seq in 1..=5u64 {
            store
                .append_update(update("doc-1", seq, "", "tag"))
                .await
                .unwrap();
        }
        store.delete_updates("doc-1", 4).await.unwrap();
        let remaining = store.get_updates("doc-1", None).await.unwrap();
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[0].seq, 4);
    }

    #[tokio::test]
    async fn save_snapshot_updates_doc_metadata() {
        let store = store();
        store
            .save_snapshot(Snapshot {
                doc_id: "doc-1".to_string(),
                seq: 10,
                data: b"snap".to_vec(),
                frontier_tag: "t10".to_string(),
                created_at: Utc::now(),
                size_bytes: 4,
                checksum: fnv1a_hex(b"snap"),
            })
            .await
            .unwrap();

        let snap = store.get_latest_snapshot("doc-1").await.unwrap().unwrap();
        assert_eq!(snap.seq, 10);
        assert_eq!(snap.data, b"snap");
    }

    #[tokio::test]
    async fn list_docs_reflects_index() {
        let store = store();
        store.append_update(update("doc-a", 1, "", "t1")).await.unwrap();
        store.append_update(update("doc-b", 1, "", "t1")).await.unwrap();
        let mut docs = store.list_docs().await.unwrap();
        docs.sort();
        assert_eq!(docs, vec!["doc-a".to_string(), "doc-b".to_string()]);
    }

    #[tokio::test]
    async fn delete_doc_removes_all_state() {
        let store = store();
        store.append_update(update("doc-1", 1, "", "t1")).await.unwrap();
        store.delete_doc("doc-1").await.unwrap();
        assert!(!store.doc_exists("doc-1").await.unwrap());
        assert!(store.list_docs().await.unwrap().is_empty());
    }
}
