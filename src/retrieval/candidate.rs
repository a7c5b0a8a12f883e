//! Retrieval candidates returned to callers

use crate::chunking::ChunkId;
use serde::{Deserialize, Serialize};

/// A chunk selected for a query, with the scores that placed it.
///
/// Scores are the normalised [0, 1] values used by fusion; a score is 0 when
/// the chunk was absent from that index's pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalCandidate {
    pub chunk_id: ChunkId,
    pub lexical_score: f32,
    pub vector_score: f32,
    pub fused_score: f32,
    pub text: String,
    pub source_doc_id: String,
}

impl RetrievalCandidate {
    /// First `max_chars` characters of the text, ellipsised when cut
    pub fn preview(&self, max_chars: usize) -> String {
        if self.text.chars().count() <= max_chars {
            self.text.clone()
        } else {
            let cut: String = self.text.chars().take(max_chars).collect();
            format!("{}...", cut)
        }
    }
}
