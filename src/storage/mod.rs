//! Storage layer for trendforge
//!
//! Content-addressed blobs plus a SQLite catalogue. Raw documents are the
//! source of truth; the index snapshot is a cache that can always be rebuilt
//! from them.

pub mod blob;
pub mod database;
mod index_store;

use crate::chunking::RawDocument;
use crate::error::{Result, TrendError};
use crate::pipeline::PipelineState;
use ahash::AHashSet;
use chrono::Utc;
use rusqlite::{params, Transaction};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub use blob::{BlobStore, BlobWrite, GcStats};
pub use database::{Database, DbPool, DbStats, RunSummary};
pub use index_store::SnapshotStats;

/// Storage manager that coordinates blob and database storage
pub struct StorageManager {
    pub blob_store: BlobStore,
    pub database: Database,
    base_path: PathBuf,
}

impl StorageManager {
    /// Open storage rooted at `base_path`
    pub fn new(base_path: PathBuf, compression_threshold: usize) -> Result<Self> {
        let store_dir = base_path.join("store");
        let reports_dir = base_path.join("reports");

        for dir in [&store_dir, &reports_dir] {
            std::fs::create_dir_all(dir).map_err(|e| TrendError::Io {
                source: e,
                context: format!("Failed to create storage directory: {}", dir.display()),
            })?;
        }

        let blob_store = BlobStore::new(store_dir.clone(), compression_threshold)?;
        let database = Database::new(&store_dir.join("db.sqlite"))?;

        Ok(Self {
            blob_store,
            database,
            base_path,
        })
    }

    /// Internal, rebuildable data
    pub fn store_dir(&self) -> PathBuf {
        self.base_path.join("store")
    }

    /// Finished reports
    pub fn reports_dir(&self) -> PathBuf {
        self.base_path.join("reports")
    }

    /// Write a blob file and record it in `tx`
    fn put_blob(&self, tx: &Transaction<'_>, data: &[u8]) -> Result<String> {
        let written = self.blob_store.write(data)?;
        tx.execute(
            "INSERT OR IGNORE INTO blobs (hash, size, compressed, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                written.hash,
                written.size as i64,
                written.compressed,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(written.hash)
    }

    /// Record raw documents, replacing earlier versions with the same id
    pub fn save_sources(&self, documents: &[RawDocument]) -> Result<usize> {
        let mut conn = self.database.get_conn()?;
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        for doc in documents {
            let text_blob = self.put_blob(&tx, doc.text.as_bytes())?;
            let metadata = serde_json::to_string(&doc.metadata).map_err(|e| TrendError::Json {
                source: e,
                context: format!("Failed to encode metadata of {}", doc.id),
            })?;
            tx.execute(
                "INSERT OR REPLACE INTO sources (doc_id, content_hash, text_blob, metadata, stored_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![doc.id, doc.content_hash(), text_blob, metadata, now],
            )?;
        }

        tx.commit()?;
        debug!("Stored {} source documents", documents.len());
        Ok(documents.len())
    }

    /// Every stored raw document, by id
    pub fn load_sources(&self) -> Result<Vec<RawDocument>> {
        let conn = self.database.get_conn()?;
        let mut stmt =
            conn.prepare("SELECT doc_id, text_blob, metadata FROM sources ORDER BY doc_id")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, text_blob, metadata)| {
                let metadata = serde_json::from_str(&metadata).map_err(|e| TrendError::Json {
                    source: e,
                    context: format!("Failed to decode metadata of {}", id),
                })?;
                Ok(RawDocument {
                    text: self.blob_store.read_string(&text_blob)?,
                    id,
                    metadata,
                })
            })
            .collect()
    }

    /// Archive a run's state, replacing an earlier archive of the same run
    pub fn archive_run(&self, state: &PipelineState) -> Result<()> {
        let json = serde_json::to_vec(state).map_err(|e| TrendError::Json {
            source: e,
            context: format!("Failed to encode run {}", state.run_id),
        })?;

        let mut conn = self.database.get_conn()?;
        let tx = conn.transaction()?;
        let state_blob = self.put_blob(&tx, &json)?;

        let failure = state.failure.as_ref();
        tx.execute(
            "INSERT OR REPLACE INTO runs (run_id, topic, status, failure_reason, failed_at_status,
                completion_note, attempt_count, revision_count, recollection_used, state_blob,
                created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                state.run_id.to_string(),
                state.topic,
                state.status().as_str(),
                failure.map(|f| format!("{}: {}", f.reason, f.detail)),
                failure.map(|f| f.status.as_str()),
                state.completion_note.map(|_| "max_revisions_reached"),
                state.evidence.attempt_count,
                state.revision_count,
                state.recollection_used,
                state_blob,
                state.created_at.to_rfc3339(),
                state.updated_at.to_rfc3339(),
            ],
        )?;
        tx.commit()?;

        info!("Archived run {} ({})", state.run_id, state.status());
        Ok(())
    }

    /// Full state of an archived run
    pub fn load_run(&self, run_id: &str) -> Result<Option<PipelineState>> {
        let Some(hash) = self.database.run_state_blob(run_id)? else {
            return Ok(None);
        };
        let bytes = self.blob_store.read(&hash)?;
        let state = serde_json::from_slice(&bytes).map_err(|e| TrendError::Json {
            source: e,
            context: format!("Failed to decode run {}", run_id),
        })?;
        Ok(Some(state))
    }

    /// Write a finished report under the reports directory
    pub fn write_report(&self, state: &PipelineState) -> Result<Option<PathBuf>> {
        let Some(report) = &state.draft_report else {
            return Ok(None);
        };
        let path = self.reports_dir().join(format!("{}.md", state.run_id));
        std::fs::write(&path, report).map_err(|e| TrendError::Io {
            source: e,
            context: format!("Failed to write report: {}", path.display()),
        })?;
        Ok(Some(path))
    }

    /// Drop blob rows and files nothing references any more
    pub fn gc(&self) -> Result<GcStats> {
        let conn = self.database.get_conn()?;
        conn.execute(
            "DELETE FROM blobs WHERE hash NOT IN (
                SELECT text_blob FROM sources
                UNION SELECT text_blob FROM chunks
                UNION SELECT vector_blob FROM vectors
                UNION SELECT state_blob FROM runs
             )",
            [],
        )?;

        let mut stmt = conn.prepare("SELECT hash FROM blobs")?;
        let referenced = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<AHashSet<_>, _>>()?;

        let stats = self.blob_store.gc(&referenced)?;
        if stats.deleted_blobs > 0 {
            info!(
                "Collected {} unreferenced blobs ({})",
                stats.deleted_blobs,
                StorageStats::format_size(stats.freed_bytes)
            );
        }
        Ok(stats)
    }

    /// Get combined storage statistics
    pub fn stats(&self) -> Result<StorageStats> {
        Ok(StorageStats {
            db: self.database.stats()?,
            store_size: dir_size(&self.store_dir())?,
            reports_size: dir_size(&self.reports_dir())?,
        })
    }
}

fn dir_size(path: &Path) -> Result<u64> {
    let mut size = 0u64;
    if !path.is_dir() {
        return Ok(size);
    }

    let entries = std::fs::read_dir(path).map_err(|e| TrendError::Io {
        source: e,
        context: format!("Failed to read directory: {}", path.display()),
    })?;
    for entry in entries {
        let entry = entry.map_err(|e| TrendError::Io {
            source: e,
            context: "Failed to read directory entry".to_string(),
        })?;
        let path = entry.path();
        if path.is_dir() {
            size += dir_size(&path)?;
        } else {
            size += entry
                .metadata()
                .map_err(|e| TrendError::Io {
                    source: e,
                    context: format!("Failed to get file metadata: {}", path.display()),
                })?
                .len();
        }
    }
    Ok(size)
}

/// Combined storage statistics
#[derive(Debug)]
pub struct StorageStats {
    pub db: DbStats,
    pub store_size: u64,
    pub reports_size: u64,
}

impl StorageStats {
    pub fn total_size(&self) -> u64 {
        self.store_size + self.reports_size
    }

    /// Format size as human-readable string
    pub fn format_size(bytes: u64) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
        let mut size = bytes as f64;
        let mut unit_idx = 0;

        while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
            size /= 1024.0;
            unit_idx += 1;
        }

        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::DocumentMetadata;
    use crate::pipeline::{FailureReason, PipelineStatus};
    use tempfile::TempDir;

    fn storage(dir: &TempDir) -> StorageManager {
        StorageManager::new(dir.path().to_path_buf(), 4096).unwrap()
    }

    #[test]
    fn test_layout() {
        let temp_dir = TempDir::new().unwrap();
        let storage = storage(&temp_dir);

        assert!(storage.store_dir().join("db.sqlite").exists());
        assert!(storage.store_dir().join("blobs").exists());
        assert!(storage.reports_dir().exists());
    }

    #[test]
    fn test_sources_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let storage = storage(&temp_dir);

        let doc = RawDocument::new("paper-1", "Diffusion models for robot control").with_metadata(
            DocumentMetadata {
                title: Some("Diffusion policies".to_string()),
                source: "arxiv".to_string(),
                ..Default::default()
            },
        );
        storage.save_sources(&[doc.clone()]).unwrap();

        let changed = RawDocument::new("paper-1", "Revised abstract");
        storage.save_sources(&[changed.clone()]).unwrap();

        assert_eq!(storage.load_sources().unwrap(), vec![changed]);
    }

    #[test]
    fn test_archive_run() {
        let temp_dir = TempDir::new().unwrap();
        let storage = storage(&temp_dir);

        let mut state = PipelineState::new("edge AI");
        state.transition(PipelineStatus::PlanningComplete).unwrap();
        state.fail(FailureReason::PlanRejected, "10 reviews");
        storage.archive_run(&state).unwrap();

        let runs = storage.database.list_runs(10).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, "failed");
        assert_eq!(runs[0].failed_at_status.as_deref(), Some("planning_complete"));

        let loaded = storage
            .load_run(&state.run_id.to_string())
            .unwrap()
            .unwrap();
        assert_eq!(loaded.status(), PipelineStatus::Failed);
        assert_eq!(loaded.history().len(), 2);
    }

    #[test]
    fn test_gc_drops_replaced_text() {
        let temp_dir = TempDir::new().unwrap();
        let storage = storage(&temp_dir);

        storage
            .save_sources(&[RawDocument::new("d", "first version")])
            .unwrap();
        storage
            .save_sources(&[RawDocument::new("d", "second version")])
            .unwrap();

        let stats = storage.gc().unwrap();
        assert_eq!(stats.deleted_blobs, 1);
        assert_eq!(storage.stats().unwrap().db.blob_count, 1);
    }

    #[test]
    fn test_format_size() {
        assert_eq!(StorageStats::format_size(0), "0.00 B");
        assert_eq!(StorageStats::format_size(1023), "1023.00 B");
        assert_eq!(StorageStats::format_size(1024), "1.00 KB");
        assert_eq!(StorageStats::format_size(1024 * 1024), "1.00 MB");
    }
}
