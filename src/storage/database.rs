//! SQLite database management with migrations
//!
//! Holds raw source documents, the persisted index snapshot (documents,
//! chunks, postings, vectors) and archived pipeline runs. Bulky payloads live
//! in the blob store; rows reference them by hash.

use crate::error::{Result, TrendError};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use std::path::Path;

/// Database connection pool
pub type DbPool = Pool<SqliteConnectionManager>;

/// Database manager with migration support
pub struct Database {
    pool: DbPool,
}

impl Database {
    /// Open or create the database and bring its schema up to date
    pub fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| TrendError::Io {
                source: e,
                context: format!("Failed to create database directory: {:?}", parent),
            })?;
        }

        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.execute_batch(
                "
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = NORMAL;
                PRAGMA foreign_keys = ON;
                PRAGMA busy_timeout = 5000;
                ",
            )
        });

        let pool = Pool::builder()
            .max_size(8)
            .build(manager)
            .map_err(|e| TrendError::Storage(format!("Failed to create connection pool: {}", e)))?;

        let db = Self { pool };
        db.migrate()?;
        Ok(db)
    }

    /// Get a connection from the pool
    pub fn get_conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| TrendError::Storage(format!("Failed to get connection: {}", e)))
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.get_conn()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS _migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            )",
            [],
        )?;

        let current_version: i32 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM _migrations",
            [],
            |row| row.get(0),
        )?;

        for (version, migration) in MIGRATIONS.iter().enumerate() {
            let version = version as i32 + 1;
            if version > current_version {
                tracing::info!("Applying migration {}", version);
                conn.execute_batch(migration)?;
                conn.execute(
                    "INSERT INTO _migrations (version, applied_at) VALUES (?1, datetime('now'))",
                    params![version],
                )?;
            }
        }

        Ok(())
    }

    /// Row counts and blob bytes
    pub fn stats(&self) -> Result<DbStats> {
        let conn = self.get_conn()?;
        let count = |table: &str| -> Result<usize> {
            let n: i64 =
                conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                    row.get(0)
                })?;
            Ok(n as usize)
        };

        let total_size: i64 =
            conn.query_row("SELECT COALESCE(SUM(size), 0) FROM blobs", [], |row| {
                row.get(0)
            })?;

        Ok(DbStats {
            source_count: count("sources")?,
            document_count: count("documents")?,
            chunk_count: count("chunks")?,
            posting_count: count("postings")?,
            vector_count: count("vectors")?,
            run_count: count("runs")?,
            blob_count: count("blobs")?,
            total_blob_bytes: total_size as u64,
        })
    }

    /// Most recent runs first
    pub fn list_runs(&self, limit: usize) -> Result<Vec<RunSummary>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT run_id, topic, status, failure_reason, failed_at_status, completion_note,
                    attempt_count, revision_count, recollection_used, created_at, updated_at
             FROM runs ORDER BY created_at DESC, run_id LIMIT ?1",
        )?;

        let runs = stmt
            .query_map(params![limit as i64], RunSummary::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(runs)
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<RunSummary>> {
        let conn = self.get_conn()?;
        Ok(conn
            .query_row(
                "SELECT run_id, topic, status, failure_reason, failed_at_status, completion_note,
                        attempt_count, revision_count, recollection_used, created_at, updated_at
                 FROM runs WHERE run_id = ?1",
                params![run_id],
                RunSummary::from_row,
            )
            .optional()?)
    }

    /// Blob hash of an archived run's full state
    pub fn run_state_blob(&self, run_id: &str) -> Result<Option<String>> {
        let conn = self.get_conn()?;
        Ok(conn
            .query_row(
                "SELECT state_blob FROM runs WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?)
    }
}

/// Database statistics
#[derive(Debug, Serialize)]
pub struct DbStats {
    pub source_count: usize,
    pub document_count: usize,
    pub chunk_count: usize,
    pub posting_count: usize,
    pub vector_count: usize,
    pub run_count: usize,
    pub blob_count: usize,
    pub total_blob_bytes: u64,
}

/// One archived run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub topic: String,
    pub status: String,
    pub failure_reason: Option<String>,
    /// Status the run was in when it failed
    pub failed_at_status: Option<String>,
    pub completion_note: Option<String>,
    pub attempt_count: u32,
    pub revision_count: u32,
    pub recollection_used: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl RunSummary {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            run_id: row.get(0)?,
            topic: row.get(1)?,
            status: row.get(2)?,
            failure_reason: row.get(3)?,
            failed_at_status: row.get(4)?,
            completion_note: row.get(5)?,
            attempt_count: row.get(6)?,
            revision_count: row.get(7)?,
            recollection_used: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }
}

/// Database migrations (each string is one migration)
const MIGRATIONS: &[&str] = &[
    // Migration 1: sources and index snapshot
    r#"
    CREATE TABLE blobs (
        hash TEXT PRIMARY KEY,
        size INTEGER NOT NULL,
        compressed BOOLEAN NOT NULL,
        created_at TEXT NOT NULL
    );

    -- Raw documents, the source of truth for rebuilds
    CREATE TABLE sources (
        doc_id TEXT PRIMARY KEY,
        content_hash TEXT NOT NULL,
        text_blob TEXT NOT NULL REFERENCES blobs(hash),
        metadata TEXT NOT NULL,
        stored_at TEXT NOT NULL
    );

    -- Everything below is a cache of the in-memory corpus
    CREATE TABLE documents (
        doc_id TEXT PRIMARY KEY,
        content_hash TEXT NOT NULL,
        chunk_size INTEGER NOT NULL,
        overlap INTEGER NOT NULL,
        metadata TEXT NOT NULL
    );

    CREATE TABLE chunks (
        id INTEGER PRIMARY KEY,
        doc_id TEXT NOT NULL REFERENCES documents(doc_id) ON DELETE CASCADE,
        sequence_index INTEGER NOT NULL,
        start_offset INTEGER NOT NULL,
        end_offset INTEGER NOT NULL,
        text_blob TEXT NOT NULL REFERENCES blobs(hash)
    );

    CREATE INDEX idx_chunks_doc ON chunks(doc_id, sequence_index);

    CREATE TABLE postings (
        term TEXT NOT NULL,
        chunk_id INTEGER NOT NULL REFERENCES chunks(id) ON DELETE CASCADE,
        term_frequency INTEGER NOT NULL,
        PRIMARY KEY (term, chunk_id)
    );

    CREATE INDEX idx_postings_chunk ON postings(chunk_id);

    CREATE TABLE vectors (
        chunk_id INTEGER PRIMARY KEY REFERENCES chunks(id) ON DELETE CASCADE,
        dimension INTEGER NOT NULL,
        vector_blob TEXT NOT NULL REFERENCES blobs(hash)
    );

    CREATE TABLE index_meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
    "#,
    // Migration 2: run archive
    r#"
    CREATE TABLE runs (
        run_id TEXT PRIMARY KEY,
        topic TEXT NOT NULL,
        status TEXT NOT NULL,
        failure_reason TEXT,
        failed_at_status TEXT,
        completion_note TEXT,
        attempt_count INTEGER NOT NULL,
        revision_count INTEGER NOT NULL,
        recollection_used BOOLEAN NOT NULL,
        state_blob TEXT NOT NULL REFERENCES blobs(hash),
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX idx_runs_created_at ON runs(created_at);
    CREATE INDEX idx_runs_status ON runs(status);
    "#,
];

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_database_creation() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        let _db = Database::new(&db_path).unwrap();
        assert!(db_path.exists());
    }

    #[test]
    fn test_migrations_applied_once() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        drop(Database::new(&db_path).unwrap());
        let db = Database::new(&db_path).unwrap();

        let conn = db.get_conn().unwrap();
        let (version, rows): (i32, i32) = conn
            .query_row("SELECT MAX(version), COUNT(*) FROM _migrations", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .unwrap();

        assert_eq!(version, MIGRATIONS.len() as i32);
        assert_eq!(rows, MIGRATIONS.len() as i32);
    }

    #[test]
    fn test_schema_exists() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("test.db")).unwrap();
        let conn = db.get_conn().unwrap();

        for table in [
            "blobs",
            "sources",
            "documents",
            "chunks",
            "postings",
            "vectors",
            "index_meta",
            "runs",
        ] {
            let count: i32 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    params![table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "Table {} should exist", table);
        }
    }

    #[test]
    fn test_foreign_keys_enabled() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("test.db")).unwrap();
        let conn = db.get_conn().unwrap();

        let fk_enabled: i32 = conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(fk_enabled, 1);

        let orphan = conn.execute(
            "INSERT INTO chunks (id, doc_id, sequence_index, start_offset, end_offset, text_blob)
             VALUES (1, 'missing', 0, 0, 1, 'nohash')",
            [],
        );
        assert!(orphan.is_err());
    }

    #[test]
    fn test_empty_stats() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("test.db")).unwrap();

        let stats = db.stats().unwrap();
        assert_eq!(stats.chunk_count, 0);
        assert_eq!(stats.run_count, 0);
        assert!(db.list_runs(10).unwrap().is_empty());
        assert!(db.get_run("nope").unwrap().is_none());
    }
}
