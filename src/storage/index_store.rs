//! Persisted index snapshot
//!
//! Chunk records, postings and vectors are keyed by chunk id. A save replaces
//! the whole snapshot in one transaction.

use super::StorageManager;
use crate::chunking::{Chunk, ChunkId, ChunkStore, DocumentMetadata, DocumentRecord};
use crate::config::RetrievalConfig;
use crate::embedding::{Bm25Params, Corpus, KeywordIndex, Posting, Tokenizer, VectorIndex};
use crate::error::{Result, TrendError};
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::info;

const NEXT_CHUNK_ID: &str = "next_chunk_id";

/// Counts written or read by a snapshot operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SnapshotStats {
    pub documents: usize,
    pub chunks: usize,
    pub postings: usize,
    pub vectors: usize,
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_vector(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(TrendError::Storage(format!(
            "Vector blob length {} is not a multiple of 4",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

fn json_error(context: String) -> impl FnOnce(serde_json::Error) -> TrendError {
    move |source| TrendError::Json { source, context }
}

impl StorageManager {
    /// Replace the persisted snapshot with `corpus`
    pub fn save_corpus(&self, corpus: &Corpus) -> Result<SnapshotStats> {
        let mut stats = SnapshotStats::default();
        let mut conn = self.database.get_conn()?;
        let tx = conn.transaction()?;

        tx.execute_batch(
            "DELETE FROM vectors; DELETE FROM postings; DELETE FROM chunks; DELETE FROM documents;",
        )?;

        let store = corpus.chunks();
        for record in store.documents() {
            let metadata = serde_json::to_string(&record.metadata)
                .map_err(json_error(format!("Failed to encode metadata of {}", record.id)))?;
            tx.execute(
                "INSERT INTO documents (doc_id, content_hash, chunk_size, overlap, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.id,
                    record.content_hash,
                    record.chunk_size as i64,
                    record.overlap as i64,
                    metadata
                ],
            )?;
            stats.documents += 1;
        }

        for chunk in store.chunks() {
            let text_blob = self.put_blob(&tx, chunk.text.as_bytes())?;
            tx.execute(
                "INSERT INTO chunks (id, doc_id, sequence_index, start_offset, end_offset, text_blob)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    chunk.id.0 as i64,
                    chunk.source_doc_id,
                    chunk.sequence_index,
                    chunk.start as i64,
                    chunk.end as i64,
                    text_blob
                ],
            )?;
            stats.chunks += 1;
        }

        {
            let mut insert = tx.prepare(
                "INSERT INTO postings (term, chunk_id, term_frequency) VALUES (?1, ?2, ?3)",
            )?;
            for posting in corpus.keyword_index().postings() {
                insert.execute(params![
                    posting.term,
                    posting.chunk_id.0 as i64,
                    posting.term_frequency
                ])?;
                stats.postings += 1;
            }
        }

        for (chunk_id, vector) in corpus.vector_index().iter() {
            let vector_blob = self.put_blob(&tx, &encode_vector(vector))?;
            tx.execute(
                "INSERT INTO vectors (chunk_id, dimension, vector_blob) VALUES (?1, ?2, ?3)",
                params![chunk_id.0 as i64, vector.len() as i64, vector_blob],
            )?;
            stats.vectors += 1;
        }

        let dimension = corpus
            .vector_index()
            .dimension()
            .map(|d| d.to_string())
            .unwrap_or_default();
        for (key, value) in [
            ("dimension", dimension),
            (NEXT_CHUNK_ID, store.next_id().to_string()),
            ("saved_at", Utc::now().to_rfc3339()),
        ] {
            tx.execute(
                "INSERT OR REPLACE INTO index_meta (key, value) VALUES (?1, ?2)",
                params![key, value],
            )?;
        }

        tx.commit()?;
        drop(conn);
        self.gc()?;

        info!(
            "Saved index snapshot: {} documents, {} chunks, {} postings, {} vectors",
            stats.documents, stats.chunks, stats.postings, stats.vectors
        );
        Ok(stats)
    }

    /// Load the persisted snapshot into a corpus.
    ///
    /// Fails with `DimensionMismatch` when the stored vectors do not match
    /// `dimension`; rebuilding from sources fixes that.
    pub fn load_corpus(
        &self,
        retrieval: &RetrievalConfig,
        dimension: Option<usize>,
    ) -> Result<(Corpus, SnapshotStats)> {
        let mut stats = SnapshotStats::default();
        let conn = self.database.get_conn()?;

        let mut records: BTreeMap<String, (DocumentRecord, Vec<Chunk>)> = BTreeMap::new();
        {
            let mut stmt = conn.prepare(
                "SELECT doc_id, content_hash, chunk_size, overlap, metadata FROM documents",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            for (id, content_hash, chunk_size, overlap, metadata) in rows {
                let metadata: DocumentMetadata = serde_json::from_str(&metadata)
                    .map_err(json_error(format!("Failed to decode metadata of {}", id)))?;
                let record = DocumentRecord {
                    id: id.clone(),
                    content_hash,
                    chunk_size: chunk_size as usize,
                    overlap: overlap as usize,
                    metadata,
                    chunk_ids: Vec::new(),
                };
                records.insert(id, (record, Vec::new()));
            }
        }

        {
            let mut stmt = conn.prepare(
                "SELECT id, doc_id, sequence_index, start_offset, end_offset, text_blob
                 FROM chunks ORDER BY doc_id, sequence_index",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, u32>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            for (id, doc_id, sequence_index, start, end, text_blob) in rows {
                let entry = records.get_mut(&doc_id).ok_or_else(|| {
                    TrendError::Storage(format!("Chunk {} belongs to unknown document {}", id, doc_id))
                })?;
                let id = ChunkId(id as u64);
                entry.0.chunk_ids.push(id);
                entry.1.push(Chunk {
                    id,
                    source_doc_id: doc_id,
                    sequence_index,
                    text: self.blob_store.read_string(&text_blob)?,
                    start: start as usize,
                    end: end as usize,
                });
            }
        }

        let mut store = ChunkStore::new();
        for (_, (record, chunks)) in records {
            stats.documents += 1;
            stats.chunks += chunks.len();
            store.restore(record, chunks);
        }

        // Ids of removed chunks stay retired across restarts
        let next_id: Option<String> = conn
            .query_row(
                "SELECT value FROM index_meta WHERE key = ?1",
                params![NEXT_CHUNK_ID],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(value) = next_id {
            let next = value.parse::<u64>().map_err(|e| {
                TrendError::Storage(format!("Invalid {} '{}': {}", NEXT_CHUNK_ID, value, e))
            })?;
            store.reserve_ids(next);
        }

        let postings: Vec<Posting> = {
            let mut stmt = conn.prepare(
                "SELECT term, chunk_id, term_frequency FROM postings ORDER BY term, chunk_id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(Posting {
                    term: row.get(0)?,
                    chunk_id: ChunkId(row.get::<_, i64>(1)? as u64),
                    term_frequency: row.get(2)?,
                })
            })?;
            rows.collect::<std::result::Result<_, _>>()?
        };
        stats.postings = postings.len();
        let keywords = KeywordIndex::from_postings(
            Tokenizer::new(retrieval.remove_stopwords),
            Bm25Params {
                k1: retrieval.bm25_k1,
                b: retrieval.bm25_b,
            },
            postings,
        );

        let mut vectors = VectorIndex::new(dimension);
        {
            let mut stmt =
                conn.prepare("SELECT chunk_id, vector_blob FROM vectors ORDER BY chunk_id")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            for (chunk_id, vector_blob) in rows {
                let vector = decode_vector(&self.blob_store.read(&vector_blob)?)?;
                vectors.upsert(ChunkId(chunk_id as u64), vector)?;
                stats.vectors += 1;
            }
        }

        info!(
            "Loaded index snapshot: {} documents, {} chunks, {} vectors",
            stats.documents, stats.chunks, stats.vectors
        );
        Ok((Corpus::from_parts(store, keywords, vectors), stats))
    }
}
