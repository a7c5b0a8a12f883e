mod batch;
mod keyword_index;
/// Embedding & indexing
///
/// Local embedding generation plus the two indexes behind hybrid retrieval.
/// - EmbeddingProvider trait for abstraction
/// - FastEmbedProvider for local embedding (all-MiniLM-L6-v2, 384-dim)
/// - Exact cosine vector index
/// - BM25 keyword index on a tantivy analyzer
/// - Batch ingestion into a shared corpus
mod provider;
mod vector_index;

pub use batch::{BatchIndexer, Corpus, IngestReport};
pub use keyword_index::{Bm25Params, KeywordIndex, Posting, Tokenizer};
pub use provider::{EmbeddingError, EmbeddingProvider, FastEmbedProvider};
pub use vector_index::{cosine_similarity, VectorIndex};
