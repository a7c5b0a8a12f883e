//! Hybrid search combining keyword and vector search with MMR reranking

use crate::chunking::ChunkId;
use crate::config::RetrievalConfig;
use crate::embedding::{cosine_similarity, Corpus, EmbeddingProvider};
use crate::error::{Result, TrendError};
use crate::retrieval::{jaccard_similarity, linear_fusion, FusionConfig, MmrReranker, RetrievalCandidate};
use ahash::{AHashMap, AHashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Knobs for one retrieval call
#[derive(Debug, Clone, Copy)]
pub struct RetrievalParams {
    pub k: usize,
    pub lambda: f32,
    pub alpha: f32,
    pub pool_multiplier: usize,
}

impl RetrievalParams {
    pub fn from_config(config: &RetrievalConfig) -> Self {
        Self {
            k: config.top_k,
            lambda: config.lambda,
            alpha: config.alpha,
            pool_multiplier: config.pool_multiplier,
        }
    }
}

/// Rank a corpus snapshot for a query.
///
/// `query_embedding` of `None` scores lexically only.
pub fn search_corpus(
    corpus: &Corpus,
    query: &str,
    query_embedding: Option<&[f32]>,
    params: &RetrievalParams,
) -> Result<Vec<RetrievalCandidate>> {
    let fusion = FusionConfig::new(params.alpha)?;
    let mmr = MmrReranker::new(params.lambda)?;

    if params.k == 0 {
        return Ok(Vec::new());
    }
    if corpus.is_empty() {
        return Err(TrendError::EmptyCorpus);
    }
    if query.trim().is_empty() {
        return Err(TrendError::InvalidQuery(
            "Query text cannot be empty".to_string(),
        ));
    }

    let pool = params
        .pool_multiplier
        .max(1)
        .saturating_mul(params.k)
        .min(corpus.len());

    let lexical = corpus.keyword_index().search_text(query, pool);
    let vector = match query_embedding {
        Some(embedding) if !corpus.vector_index().is_empty() => {
            corpus.vector_index().search(embedding, pool)?
        }
        _ => Vec::new(),
    };
    debug!(
        "Pools for '{}': {} lexical, {} vector (limit {})",
        query,
        lexical.len(),
        vector.len(),
        pool
    );

    let fused = linear_fusion(&lexical, &vector, &fusion);

    let tokenizer = corpus.keyword_index().tokenizer();
    let token_sets: AHashMap<ChunkId, AHashSet<String>> = fused
        .iter()
        .filter_map(|f| corpus.chunks().get(f.chunk_id))
        .map(|chunk| (chunk.id, tokenizer.tokenize(&chunk.text).into_iter().collect()))
        .collect();
    let empty = AHashSet::new();

    let vectors = corpus.vector_index();
    let similarity = |a: ChunkId, b: ChunkId| match (vectors.get(a), vectors.get(b)) {
        (Some(x), Some(y)) => cosine_similarity(x, y),
        _ => jaccard_similarity(
            token_sets.get(&a).unwrap_or(&empty),
            token_sets.get(&b).unwrap_or(&empty),
        ),
    };

    let selected = mmr.select(&fused, params.k, similarity);

    Ok(selected
        .into_iter()
        .filter_map(|score| {
            corpus.chunks().get(score.chunk_id).map(|chunk| RetrievalCandidate {
                chunk_id: chunk.id,
                lexical_score: score.lexical.unwrap_or(0.0),
                vector_score: score.vector.unwrap_or(0.0),
                fused_score: score.fused,
                text: chunk.text.clone(),
                source_doc_id: chunk.source_doc_id.clone(),
            })
        })
        .collect())
}

/// Hybrid retriever over a shared corpus
pub struct HybridRetriever {
    corpus: Arc<RwLock<Corpus>>,
    embedding_provider: Option<Arc<dyn EmbeddingProvider>>,
    config: RetrievalConfig,
}

impl HybridRetriever {
    pub fn new(
        corpus: Arc<RwLock<Corpus>>,
        embedding_provider: Option<Arc<dyn EmbeddingProvider>>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            corpus,
            embedding_provider,
            config,
        }
    }

    /// Retrieve up to `k` diverse, relevant chunks
    pub async fn retrieve(
        &self,
        query: &str,
        k: usize,
        lambda: f32,
    ) -> Result<Vec<RetrievalCandidate>> {
        let params = RetrievalParams {
            k,
            lambda,
            ..RetrievalParams::from_config(&self.config)
        };

        // Embed before taking the read guard
        let embedding = if k > 0 && !query.trim().is_empty() {
            self.embed_query(query).await
        } else {
            None
        };

        let corpus = self.corpus.read().await;
        search_corpus(&corpus, query, embedding.as_deref(), &params)
    }

    /// Retrieve with the configured `top_k` and `lambda`
    pub async fn retrieve_default(&self, query: &str) -> Result<Vec<RetrievalCandidate>> {
        self.retrieve(query, self.config.top_k, self.config.lambda)
            .await
    }

    pub fn corpus(&self) -> &Arc<RwLock<Corpus>> {
        &self.corpus
    }

    async fn embed_query(&self, query: &str) -> Option<Vec<f32>> {
        let provider = Arc::clone(self.embedding_provider.as_ref()?);
        let text = query.to_string();

        match tokio::task::spawn_blocking(move || provider.embed(&text)).await {
            Ok(Ok(embedding)) => Some(embedding),
            Ok(Err(e)) => {
                warn!("Query embedding failed, using lexical scores only: {}", e);
                None
            }
            Err(e) => {
                warn!("Query embedding task failed: {}", e);
                None
            }
        }
    }
}
