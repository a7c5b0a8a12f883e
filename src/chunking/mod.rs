//! Chunk store
//!
//! Splits source documents into overlapping character windows and owns the
//! resulting chunk records. Chunk ids are assigned monotonically by the store
//! and stay stable for as long as a document's content and chunking
//! parameters do not change.

use crate::error::{Result, TrendError};
use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identifier of a chunk, ordered by assignment
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(pub u64);

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Descriptive metadata carried with a fetched or loaded document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// Human-readable title
    #[serde(default)]
    pub title: Option<String>,
    /// Publisher, archive or file the document came from
    #[serde(default)]
    pub source: String,
    /// Canonical location, if any
    #[serde(default)]
    pub url: Option<String>,
    /// Publication date as reported by the source
    #[serde(default)]
    pub published: Option<String>,
}

/// A document as returned by a document source or read from disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDocument {
    /// Stable document identifier
    pub id: String,
    /// Full text
    pub text: String,
    #[serde(default)]
    pub metadata: DocumentMetadata,
}

impl RawDocument {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            metadata: DocumentMetadata::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: DocumentMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// BLAKE3 hash of the document text
    pub fn content_hash(&self) -> String {
        blake3::hash(self.text.as_bytes()).to_hex().to_string()
    }
}

/// A contiguous, possibly overlapping span of a source document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub source_doc_id: String,
    /// Position of this chunk among the document's chunks
    pub sequence_index: u32,
    pub text: String,
    /// Character offset of the first character (inclusive)
    pub start: usize,
    /// Character offset past the last character
    pub end: usize,
}

/// A window produced by [`split_windows`], before an id is assigned
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window {
    pub start: usize,
    pub end: usize,
    pub text: String,
}

/// Split text into windows of `chunk_size` characters sharing `overlap`
/// characters with their predecessor.
///
/// Offsets are counted in Unicode scalar values, never bytes, so multi-byte
/// text is never cut mid-character. Whitespace-only windows are skipped.
pub fn split_windows(text: &str, chunk_size: usize, overlap: usize) -> Result<Vec<Window>> {
    validate_params(chunk_size, overlap)?;

    let offsets: Vec<usize> = text.char_indices().map(|(byte, _)| byte).collect();
    let total = offsets.len();
    if total == 0 {
        return Ok(Vec::new());
    }

    let byte_at = |char_idx: usize| {
        if char_idx >= total {
            text.len()
        } else {
            offsets[char_idx]
        }
    };

    let step = chunk_size - overlap;
    let mut windows = Vec::new();
    let mut start = 0;

    loop {
        let end = (start + chunk_size).min(total);
        let slice = &text[byte_at(start)..byte_at(end)];
        if !slice.trim().is_empty() {
            windows.push(Window {
                start,
                end,
                text: slice.to_string(),
            });
        }
        if end == total {
            break;
        }
        start += step;
    }

    Ok(windows)
}

fn validate_params(chunk_size: usize, overlap: usize) -> Result<()> {
    if chunk_size == 0 {
        return Err(TrendError::InvalidConfig(
            "chunk_size must be greater than 0".to_string(),
        ));
    }
    if overlap >= chunk_size {
        return Err(TrendError::InvalidConfig(format!(
            "overlap ({}) must be smaller than chunk_size ({})",
            overlap, chunk_size
        )));
    }
    Ok(())
}

/// What the store remembers about an ingested document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: String,
    pub content_hash: String,
    pub chunk_size: usize,
    pub overlap: usize,
    pub metadata: DocumentMetadata,
    pub chunk_ids: Vec<ChunkId>,
}

/// Owner of all chunks in a corpus
#[derive(Debug)]
pub struct ChunkStore {
    chunks: BTreeMap<ChunkId, Chunk>,
    documents: AHashMap<String, DocumentRecord>,
    next_id: u64,
}

impl Default for ChunkStore {
    fn default() -> Self {
        Self {
            chunks: BTreeMap::new(),
            documents: AHashMap::new(),
            next_id: 1,
        }
    }
}

impl ChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Split a document into chunks and store them.
    ///
    /// Re-ingesting the same document with unchanged text and parameters
    /// returns the stored chunks with their original ids. A changed document
    /// replaces its previous chunks.
    pub fn ingest(
        &mut self,
        document: &RawDocument,
        chunk_size: usize,
        overlap: usize,
    ) -> Result<Vec<Chunk>> {
        validate_params(chunk_size, overlap)?;

        let content_hash = document.content_hash();
        if let Some(existing) = self.documents.get(&document.id) {
            if existing.content_hash == content_hash
                && existing.chunk_size == chunk_size
                && existing.overlap == overlap
            {
                tracing::debug!("Document {} unchanged, reusing chunks", document.id);
                return Ok(self.collect(&existing.chunk_ids));
            }
        }

        self.remove_document(&document.id);

        let windows = split_windows(&document.text, chunk_size, overlap)?;
        let mut chunk_ids = Vec::with_capacity(windows.len());
        let mut created = Vec::with_capacity(windows.len());

        for (seq, window) in windows.into_iter().enumerate() {
            let id = ChunkId(self.next_id);
            self.next_id += 1;

            let chunk = Chunk {
                id,
                source_doc_id: document.id.clone(),
                sequence_index: seq as u32,
                text: window.text,
                start: window.start,
                end: window.end,
            };
            chunk_ids.push(id);
            self.chunks.insert(id, chunk.clone());
            created.push(chunk);
        }

        tracing::debug!(
            "Chunked document {} into {} chunks (size={}, overlap={})",
            document.id,
            created.len(),
            chunk_size,
            overlap
        );

        self.documents.insert(
            document.id.clone(),
            DocumentRecord {
                id: document.id.clone(),
                content_hash,
                chunk_size,
                overlap,
                metadata: document.metadata.clone(),
                chunk_ids,
            },
        );

        Ok(created)
    }

    /// Remove a document and its chunks, returning the retired chunk ids
    pub fn remove_document(&mut self, doc_id: &str) -> Vec<ChunkId> {
        match self.documents.remove(doc_id) {
            Some(record) => {
                for id in &record.chunk_ids {
                    self.chunks.remove(id);
                }
                record.chunk_ids
            }
            None => Vec::new(),
        }
    }

    /// Re-insert a persisted document with its chunks, keeping their ids
    pub fn restore(&mut self, record: DocumentRecord, chunks: Vec<Chunk>) {
        for chunk in chunks {
            self.next_id = self.next_id.max(chunk.id.0 + 1);
            self.chunks.insert(chunk.id, chunk);
        }
        self.documents.insert(record.id.clone(), record);
    }

    /// Id the next new chunk will receive
    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    /// Never hand out ids below `next`, even ones no stored chunk holds
    pub fn reserve_ids(&mut self, next: u64) {
        self.next_id = self.next_id.max(next);
    }

    pub fn get(&self, id: ChunkId) -> Option<&Chunk> {
        self.chunks.get(&id)
    }

    pub fn contains(&self, id: ChunkId) -> bool {
        self.chunks.contains_key(&id)
    }

    /// All chunks in id order
    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.values()
    }

    pub fn document(&self, doc_id: &str) -> Option<&DocumentRecord> {
        self.documents.get(doc_id)
    }

    /// Document records sorted by id
    pub fn documents(&self) -> Vec<&DocumentRecord> {
        let mut docs: Vec<&DocumentRecord> = self.documents.values().collect();
        docs.sort_by(|a, b| a.id.cmp(&b.id));
        docs
    }

    /// Chunks of one document in sequence order
    pub fn document_chunks(&self, doc_id: &str) -> Vec<Chunk> {
        self.documents
            .get(doc_id)
            .map(|record| self.collect(&record.chunk_ids))
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn document_count(&self) -> usize {
        self.documents.len()
    }

    fn collect(&self, ids: &[ChunkId]) -> Vec<Chunk> {
        ids.iter()
            .filter_map(|id| self.chunks.get(id).cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_windows_overlap() {
        let windows = split_windows("abcdefghij", 4, 2).unwrap();
        let texts: Vec<&str> = windows.iter().map(|w| w.text.as_str()).collect();
        assert_eq!(texts, vec!["abcd", "cdef", "efgh", "ghij"]);
        assert_eq!(windows[1].start, 2);
        assert_eq!(windows[1].end, 6);
    }

    #[test]
    fn test_last_window_ends_at_text_end() {
        let windows = split_windows("abcdefg", 4, 1).unwrap();
        let texts: Vec<&str> = windows.iter().map(|w| w.text.as_str()).collect();
        assert_eq!(texts, vec!["abcd", "defg"]);
    }

    #[test]
    fn test_short_text_single_window() {
        let windows = split_windows("hi", 10, 3).unwrap();
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].text, "hi");
    }

    #[test]
    fn test_multibyte_text() {
        let windows = split_windows("로봇공학동향", 4, 2).unwrap();
        let texts: Vec<&str> = windows.iter().map(|w| w.text.as_str()).collect();
        assert_eq!(texts, vec!["로봇공학", "공학동향"]);
    }

    #[test]
    fn test_invalid_params() {
        assert!(matches!(
            split_windows("text", 4, 4),
            Err(TrendError::InvalidConfig(_))
        ));
        assert!(matches!(
            split_windows("text", 0, 0),
            Err(TrendError::InvalidConfig(_))
        ));

        let mut store = ChunkStore::new();
        let doc = RawDocument::new("d1", "text");
        assert!(store.ingest(&doc, 4, 5).is_err());
    }

    #[test]
    fn test_whitespace_windows_skipped() {
        let windows = split_windows("ab        cd", 4, 0).unwrap();
        let texts: Vec<&str> = windows.iter().map(|w| w.text.as_str()).collect();
        assert_eq!(texts, vec!["ab  ", "  cd"]);
    }

    #[test]
    fn test_ingest_is_idempotent() {
        let mut store = ChunkStore::new();
        let doc = RawDocument::new("report", "Robots are entering warehouses at scale.");

        let first = store.ingest(&doc, 16, 4).unwrap();
        let second = store.ingest(&doc, 16, 4).unwrap();

        assert_eq!(first, second);
        assert_eq!(store.len(), first.len());
    }

    #[test]
    fn test_ids_monotonic_within_document() {
        let mut store = ChunkStore::new();
        let doc = RawDocument::new("d", "a".repeat(100));
        let chunks = store.ingest(&doc, 10, 2).unwrap();

        for pair in chunks.windows(2) {
            assert!(pair[0].id < pair[1].id);
            assert_eq!(pair[0].sequence_index + 1, pair[1].sequence_index);
        }
    }

    #[test]
    fn test_changed_document_replaces_chunks() {
        let mut store = ChunkStore::new();
        let v1 = RawDocument::new("d", "first version of the text");
        let v2 = RawDocument::new("d", "second version");

        let old = store.ingest(&v1, 8, 2).unwrap();
        let new = store.ingest(&v2, 8, 2).unwrap();

        assert!(old.iter().all(|c| !store.contains(c.id)));
        assert!(new.iter().all(|c| store.contains(c.id)));
        assert!(new[0].id > old.last().unwrap().id);
        assert_eq!(store.document_count(), 1);
    }

    #[test]
    fn test_ids_start_at_one() {
        let mut store = ChunkStore::new();
        let chunks = store.ingest(&RawDocument::new("d", "short"), 8, 2).unwrap();
        assert_eq!(chunks[0].id, ChunkId(1));
        assert_eq!(chunks[0].id.to_string(), "c1");
    }

    #[test]
    fn test_empty_document() {
        let mut store = ChunkStore::new();
        let chunks = store.ingest(&RawDocument::new("e", ""), 8, 2).unwrap();
        assert!(chunks.is_empty());
        assert_eq!(store.document_count(), 1);
    }
}
