//! Min-max normalisation and linear score fusion

use crate::chunking::ChunkId;
use crate::error::TrendError;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FusionError {
    #[error("Invalid fusion weight: alpha must be within [0, 1], got {0}")]
    InvalidAlpha(f32),
}

impl From<FusionError> for TrendError {
    fn from(err: FusionError) -> Self {
        TrendError::InvalidConfig(err.to_string())
    }
}

/// Configuration for fusion
#[derive(Debug, Clone, Copy)]
pub struct FusionConfig {
    /// Weight of the lexical score; the vector score gets `1 - alpha`
    pub alpha: f32,
}

impl FusionConfig {
    pub fn new(alpha: f32) -> Result<Self, FusionError> {
        if !(0.0..=1.0).contains(&alpha) {
            return Err(FusionError::InvalidAlpha(alpha));
        }
        Ok(Self { alpha })
    }
}

/// One chunk's scores after fusion
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusedScore {
    pub chunk_id: ChunkId,
    /// Normalised lexical score, absent when the chunk was not in the lexical pool
    pub lexical: Option<f32>,
    /// Normalised vector score, absent when the chunk was not in the vector pool
    pub vector: Option<f32>,
    pub fused: f32,
}

/// Rescale scores to [0, 1]. A list with zero variance maps to 0.5.
pub fn min_max_normalize(scores: &[(ChunkId, f32)]) -> BTreeMap<ChunkId, f32> {
    let Some(first) = scores.first() else {
        return BTreeMap::new();
    };

    let (min, max) = scores
        .iter()
        .fold((first.1, first.1), |(lo, hi), (_, s)| (lo.min(*s), hi.max(*s)));
    let range = max - min;

    scores
        .iter()
        .map(|(id, s)| {
            let normalized = if range > 0.0 { (s - min) / range } else { 0.5 };
            (*id, normalized)
        })
        .collect()
}

/// Combine lexical and vector result lists.
///
/// `fused = alpha * lex + (1 - alpha) * vec`, with 0 standing in for a score
/// missing from one list. Output is sorted by fused score descending, ties
/// by chunk id ascending.
pub fn linear_fusion(
    lexical: &[(ChunkId, f32)],
    vector: &[(ChunkId, f32)],
    config: &FusionConfig,
) -> Vec<FusedScore> {
    let lexical = min_max_normalize(lexical);
    let vector = min_max_normalize(vector);

    let mut ids: Vec<ChunkId> = lexical.keys().chain(vector.keys()).copied().collect();
    ids.sort();
    ids.dedup();

    let mut fused: Vec<FusedScore> = ids
        .into_iter()
        .map(|id| {
            let lex = lexical.get(&id).copied();
            let vec = vector.get(&id).copied();
            FusedScore {
                chunk_id: id,
                lexical: lex,
                vector: vec,
                fused: config.alpha * lex.unwrap_or(0.0)
                    + (1.0 - config.alpha) * vec.unwrap_or(0.0),
            }
        })
        .collect();

    fused.sort_by(|a, b| b.fused.total_cmp(&a.fused).then(a.chunk_id.cmp(&b.chunk_id)));
    fused
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-5
    }

    #[test]
    fn test_normalize_range() {
        let scores = vec![(ChunkId(1), 2.0), (ChunkId(2), 4.0), (ChunkId(3), 3.0)];
        let norm = min_max_normalize(&scores);
        assert!(approx(norm[&ChunkId(1)], 0.0));
        assert!(approx(norm[&ChunkId(2)], 1.0));
        assert!(approx(norm[&ChunkId(3)], 0.5));
    }

    #[test]
    fn test_normalize_zero_variance() {
        let scores = vec![(ChunkId(1), 0.7), (ChunkId(2), 0.7)];
        let norm = min_max_normalize(&scores);
        assert!(norm.values().all(|v| approx(*v, 0.5)));
        assert!(min_max_normalize(&[]).is_empty());
    }

    #[test]
    fn test_missing_score_counts_as_zero() {
        let lexical = vec![(ChunkId(1), 3.0), (ChunkId(2), 1.0)];
        let vector = vec![(ChunkId(2), 0.9), (ChunkId(3), 0.1)];
        let fused = linear_fusion(&lexical, &vector, &FusionConfig::new(0.5).unwrap());

        let by_id = |id: u64| fused.iter().find(|f| f.chunk_id == ChunkId(id)).unwrap();
        assert!(approx(by_id(1).fused, 0.5));
        assert!(approx(by_id(2).fused, 0.5));
        assert!(approx(by_id(3).fused, 0.0));
        assert_eq!(by_id(3).lexical, None);

        // equal fused scores keep id order
        assert_eq!(fused[0].chunk_id, ChunkId(1));
        assert_eq!(fused[1].chunk_id, ChunkId(2));
    }

    #[test]
    fn test_alpha_extremes() {
        let lexical = vec![(ChunkId(1), 5.0), (ChunkId(2), 1.0)];
        let vector = vec![(ChunkId(1), 0.1), (ChunkId(2), 0.9)];

        let lexical_only = linear_fusion(&lexical, &vector, &FusionConfig::new(1.0).unwrap());
        assert_eq!(lexical_only[0].chunk_id, ChunkId(1));

        let vector_only = linear_fusion(&lexical, &vector, &FusionConfig::new(0.0).unwrap());
        assert_eq!(vector_only[0].chunk_id, ChunkId(2));
    }

    #[test]
    fn test_invalid_alpha() {
        assert!(FusionConfig::new(1.2).is_err());
        assert!(FusionConfig::new(-0.1).is_err());
    }
}
