//! Hybrid retrieval & reranking
//!
//! Keyword (BM25) and vector (cosine) pools are min-max normalised, fused
//! linearly, and reranked with maximal marginal relevance.

mod candidate;
mod fusion;
mod hybrid;
mod reranker;

pub use candidate::RetrievalCandidate;
pub use fusion::{linear_fusion, min_max_normalize, FusedScore, FusionConfig, FusionError};
pub use hybrid::{search_corpus, HybridRetriever, RetrievalParams};
pub use reranker::{jaccard_similarity, MmrReranker, RerankError};
