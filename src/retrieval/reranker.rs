//! Maximal marginal relevance reranking

use super::fusion::FusedScore;
use crate::chunking::ChunkId;
use crate::error::TrendError;
use ahash::AHashSet;
use std::cmp::Ordering;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RerankError {
    #[error("Invalid MMR lambda: must be within [0, 1], got {0}")]
    InvalidLambda(f32),
}

impl From<RerankError> for TrendError {
    fn from(err: RerankError) -> Self {
        TrendError::InvalidConfig(err.to_string())
    }
}

/// Jaccard similarity of two token sets; two empty sets score 0
pub fn jaccard_similarity(a: &AHashSet<String>, b: &AHashSet<String>) -> f32 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f32 / union as f32
}

/// Diversity-aware selection over a fused candidate pool.
///
/// Picks greedily by `lambda * fused - (1 - lambda) * max_sim`, where
/// `max_sim` is the highest similarity to anything already picked. The first
/// pick is therefore the best fused score. Ties go to the higher fused score,
/// then the lower chunk id.
#[derive(Debug, Clone, Copy)]
pub struct MmrReranker {
    lambda: f32,
}

impl MmrReranker {
    pub fn new(lambda: f32) -> Result<Self, RerankError> {
        if !(0.0..=1.0).contains(&lambda) {
            return Err(RerankError::InvalidLambda(lambda));
        }
        Ok(Self { lambda })
    }

    pub fn lambda(&self) -> f32 {
        self.lambda
    }

    /// Select up to `k` candidates in MMR order
    pub fn select<F>(&self, pool: &[FusedScore], k: usize, similarity: F) -> Vec<FusedScore>
    where
        F: Fn(ChunkId, ChunkId) -> f32,
    {
        let mut remaining: Vec<FusedScore> = pool.to_vec();
        remaining.sort_by(|a, b| a.chunk_id.cmp(&b.chunk_id));
        remaining.dedup_by_key(|c| c.chunk_id);

        // Highest similarity of each remaining candidate to the selected set
        let mut max_sim = vec![0.0f32; remaining.len()];
        let mut selected: Vec<FusedScore> = Vec::with_capacity(k.min(remaining.len()));

        while selected.len() < k && !remaining.is_empty() {
            let mut best = 0;
            let mut best_score = self.marginal(&remaining[0], max_sim[0]);
            for i in 1..remaining.len() {
                let score = self.marginal(&remaining[i], max_sim[i]);
                let better = match score.total_cmp(&best_score) {
                    Ordering::Greater => true,
                    Ordering::Less => false,
                    Ordering::Equal => match remaining[i].fused.total_cmp(&remaining[best].fused) {
                        Ordering::Greater => true,
                        Ordering::Less => false,
                        Ordering::Equal => remaining[i].chunk_id < remaining[best].chunk_id,
                    },
                };
                if better {
                    best = i;
                    best_score = score;
                }
            }

            let picked = remaining.remove(best);
            max_sim.remove(best);
            for (candidate, sim) in remaining.iter().zip(max_sim.iter_mut()) {
                *sim = sim.max(similarity(candidate.chunk_id, picked.chunk_id));
            }
            selected.push(picked);
        }

        selected
    }

    fn marginal(&self, candidate: &FusedScore, max_sim: f32) -> f32 {
        self.lambda * candidate.fused - (1.0 - self.lambda) * max_sim
    }
}
