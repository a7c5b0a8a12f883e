/// Corpus container and batch ingestion
use super::{Bm25Params, EmbeddingProvider, KeywordIndex, Tokenizer, VectorIndex};
use crate::chunking::{split_windows, Chunk, ChunkId, ChunkStore, RawDocument};
use crate::config::{ChunkingConfig, RetrievalConfig};
use crate::error::Result;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Chunk store plus the two indexes derived from it
pub struct Corpus {
    store: ChunkStore,
    keywords: KeywordIndex,
    vectors: VectorIndex,
}

impl Corpus {
    pub fn new(tokenizer: Tokenizer, bm25: Bm25Params, dimension: Option<usize>) -> Self {
        Self {
            store: ChunkStore::new(),
            keywords: KeywordIndex::new(tokenizer, bm25),
            vectors: VectorIndex::new(dimension),
        }
    }

    /// Empty corpus using the retrieval analyzer and BM25 settings
    pub fn from_config(retrieval: &RetrievalConfig, dimension: Option<usize>) -> Self {
        Self::new(
            Tokenizer::new(retrieval.remove_stopwords),
            Bm25Params {
                k1: retrieval.bm25_k1,
                b: retrieval.bm25_b,
            },
            dimension,
        )
    }

    /// Assemble a corpus from already-built parts
    pub fn from_parts(store: ChunkStore, keywords: KeywordIndex, vectors: VectorIndex) -> Self {
        Self {
            store,
            keywords,
            vectors,
        }
    }

    /// Chunk a document and index its chunks lexically.
    ///
    /// Chunks retired by a changed document leave both indexes.
    pub fn ingest_document(
        &mut self,
        document: &RawDocument,
        chunking: &ChunkingConfig,
    ) -> Result<Vec<Chunk>> {
        let previous: Vec<ChunkId> = self
            .store
            .document(&document.id)
            .map(|record| record.chunk_ids.clone())
            .unwrap_or_default();

        let chunks = self
            .store
            .ingest(document, chunking.chunk_size, chunking.overlap)?;

        for id in previous {
            if !self.store.contains(id) {
                self.keywords.remove(id);
                self.vectors.remove(id);
            }
        }
        self.keywords.index(&chunks);
        Ok(chunks)
    }

    /// Attach an embedding to an existing chunk
    pub fn set_embedding(&mut self, id: ChunkId, embedding: Vec<f32>) -> Result<()> {
        self.vectors.upsert(id, embedding)
    }

    pub fn remove_document(&mut self, doc_id: &str) -> usize {
        let removed = self.store.remove_document(doc_id);
        for id in &removed {
            self.keywords.remove(*id);
            self.vectors.remove(*id);
        }
        removed.len()
    }

    pub fn chunks(&self) -> &ChunkStore {
        &self.store
    }

    pub fn keyword_index(&self) -> &KeywordIndex {
        &self.keywords
    }

    pub fn vector_index(&self) -> &VectorIndex {
        &self.vectors
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

/// Result of one ingestion call
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub documents: usize,
    /// Documents whose content and parameters were already indexed
    pub unchanged: usize,
    pub chunks: usize,
    pub embedded: usize,
    pub failed_embeddings: usize,
    pub duration_ms: u64,
}

/// Chunks, embeds and indexes documents into a shared corpus.
///
/// Embeddings are computed before the write guard is taken; every write of
/// one call happens under a single guard.
pub struct BatchIndexer {
    provider: Option<Arc<dyn EmbeddingProvider>>,
    chunking: ChunkingConfig,
    batch_size: usize,
}

struct Prepared {
    document: RawDocument,
    embeddings: Vec<Option<Vec<f32>>>,
}

impl BatchIndexer {
    pub fn new(
        provider: Option<Arc<dyn EmbeddingProvider>>,
        chunking: ChunkingConfig,
        batch_size: usize,
    ) -> Self {
        Self {
            provider,
            chunking,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn ingest(
        &self,
        corpus: &RwLock<Corpus>,
        documents: Vec<RawDocument>,
    ) -> Result<IngestReport> {
        let start = std::time::Instant::now();
        let mut report = IngestReport {
            documents: documents.len(),
            ..Default::default()
        };

        info!("Ingesting {} documents", documents.len());

        let mut pending = Vec::new();
        {
            let guard = corpus.read().await;
            for document in documents {
                let unchanged = guard.chunks().document(&document.id).is_some_and(|record| {
                    record.content_hash == document.content_hash()
                        && record.chunk_size == self.chunking.chunk_size
                        && record.overlap == self.chunking.overlap
                });
                if unchanged {
                    debug!("Skipping unchanged document {}", document.id);
                    report.unchanged += 1;
                } else {
                    pending.push(document);
                }
            }
        }

        let mut prepared = Vec::with_capacity(pending.len());
        for document in pending {
            let windows =
                split_windows(&document.text, self.chunking.chunk_size, self.chunking.overlap)?;
            let texts: Vec<String> = windows.into_iter().map(|w| w.text).collect();
            let embeddings = self.embed_all(texts).await;
            prepared.push(Prepared {
                document,
                embeddings,
            });
        }

        let mut guard = corpus.write().await;
        for item in prepared {
            let chunks = guard.ingest_document(&item.document, &self.chunking)?;
            report.chunks += chunks.len();

            for (chunk, embedding) in chunks.iter().zip(item.embeddings) {
                let Some(embedding) = embedding else {
                    report.failed_embeddings += 1;
                    continue;
                };
                match guard.set_embedding(chunk.id, embedding) {
                    Ok(()) => report.embedded += 1,
                    Err(e) => {
                        warn!("Indexing {} without a vector: {}", chunk.id, e);
                        report.failed_embeddings += 1;
                    }
                }
            }
        }
        drop(guard);

        report.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "Ingestion complete: {} chunks, {} embedded, {} without vectors, {}ms",
            report.chunks, report.embedded, report.failed_embeddings, report.duration_ms
        );

        Ok(report)
    }

    /// Embed texts in batches; one slot per text, `None` when embedding failed
    async fn embed_all(&self, texts: Vec<String>) -> Vec<Option<Vec<f32>>> {
        let Some(provider) = &self.provider else {
            return vec![None; texts.len()];
        };

        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let provider = Arc::clone(provider);
            let batch = batch.to_vec();
            let expected = batch.len();

            let result = tokio::task::spawn_blocking(move || {
                match provider.embed_batch(&batch) {
                    Ok(vectors) if vectors.len() == batch.len() => {
                        vectors.into_iter().map(Some).collect::<Vec<_>>()
                    }
                    Ok(_) | Err(_) => {
                        debug!("Batch embedding failed, retrying per chunk");
                        batch
                            .iter()
                            .map(|text| match provider.embed(text) {
                                Ok(vector) => Some(vector),
                                Err(e) => {
                                    warn!("Embedding failed: {}", e);
                                    None
                                }
                            })
                            .collect()
                    }
                }
            })
            .await;

            match result {
                Ok(vectors) => out.extend(vectors),
                Err(e) => {
                    warn!("Embedding task failed: {}", e);
                    out.extend(std::iter::repeat(None).take(expected));
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::EmbeddingError;

    /// Counts letters a..c; fails on text containing "fail"
    struct LetterEmbedder;

    impl EmbeddingProvider for LetterEmbedder {
        fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, EmbeddingError> {
            if text.contains("fail") {
                return Err(EmbeddingError::GenerationError("refused".to_string()));
            }
            Ok(['a', 'b', 'c']
                .iter()
                .map(|l| text.chars().filter(|c| c == l).count() as f32)
                .collect())
        }

        fn dimension(&self) -> usize {
            3
        }

        fn model_name(&self) -> &str {
            "letters"
        }
    }

    fn chunking() -> ChunkingConfig {
        ChunkingConfig {
            chunk_size: 12,
            overlap: 2,
        }
    }

    fn corpus() -> RwLock<Corpus> {
        RwLock::new(Corpus::from_config(&RetrievalConfig::default(), Some(3)))
    }

    #[tokio::test]
    async fn test_ingest_indexes_both_views() {
        let corpus = corpus();
        let indexer = BatchIndexer::new(Some(Arc::new(LetterEmbedder)), chunking(), 2);

        let report = indexer
            .ingest(
                &corpus,
                vec![RawDocument::new("d1", "abc cab robots in labs")],
            )
            .await
            .unwrap();

        let guard = corpus.read().await;
        assert_eq!(report.chunks, guard.len());
        assert_eq!(report.embedded, guard.vector_index().len());
        assert_eq!(guard.keyword_index().len(), guard.len());
        assert_eq!(report.failed_embeddings, 0);
    }

    #[tokio::test]
    async fn test_failed_embedding_is_lexical_only() {
        let corpus = corpus();
        let indexer = BatchIndexer::new(Some(Arc::new(LetterEmbedder)), chunking(), 8);

        let report = indexer
            .ingest(
                &corpus,
                vec![
                    RawDocument::new("ok", "abc"),
                    RawDocument::new("bad", "fail whale"),
                ],
            )
            .await
            .unwrap();

        assert_eq!(report.chunks, 2);
        assert_eq!(report.embedded, 1);
        assert_eq!(report.failed_embeddings, 1);

        let guard = corpus.read().await;
        assert_eq!(guard.keyword_index().search_text("whale", 5).len(), 1);
    }

    #[tokio::test]
    async fn test_reingest_unchanged_is_skipped() {
        let corpus = corpus();
        let indexer = BatchIndexer::new(None, chunking(), 4);
        let doc = RawDocument::new("d", "lidar and radar sensor fusion");

        let first = indexer.ingest(&corpus, vec![doc.clone()]).await.unwrap();
        let ids: Vec<ChunkId> = corpus.read().await.chunks().chunks().map(|c| c.id).collect();

        let second = indexer.ingest(&corpus, vec![doc]).await.unwrap();
        let again: Vec<ChunkId> = corpus.read().await.chunks().chunks().map(|c| c.id).collect();

        assert!(first.chunks > 0);
        assert_eq!(second.unchanged, 1);
        assert_eq!(second.chunks, 0);
        assert_eq!(ids, again);
    }

    #[tokio::test]
    async fn test_changed_document_leaves_indexes() {
        let corpus = corpus();
        let indexer = BatchIndexer::new(None, chunking(), 4);

        indexer
            .ingest(&corpus, vec![RawDocument::new("d", "quantum sensing")])
            .await
            .unwrap();
        indexer
            .ingest(&corpus, vec![RawDocument::new("d", "soft robotics")])
            .await
            .unwrap();

        let guard = corpus.read().await;
        assert!(guard.keyword_index().search_text("quantum", 5).is_empty());
        assert_eq!(guard.keyword_index().len(), guard.len());
    }
}
