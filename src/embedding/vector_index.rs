/// Exact cosine-similarity vector index
use crate::chunking::ChunkId;
use crate::error::{Result, TrendError};
use std::collections::BTreeMap;

/// Cosine similarity of two vectors.
///
/// Zero-norm input yields 0.0. Vectors of different length compare over the
/// shared prefix; callers that care check dimensions first.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0)
}

/// Brute-force nearest neighbour index keyed by chunk id.
///
/// Every stored vector has the same dimension. The dimension is fixed by
/// construction or by the first insert.
#[derive(Debug, Clone, Default)]
pub struct VectorIndex {
    vectors: BTreeMap<ChunkId, Vec<f32>>,
    dimension: Option<usize>,
}

impl VectorIndex {
    pub fn new(dimension: Option<usize>) -> Self {
        Self {
            vectors: BTreeMap::new(),
            dimension,
        }
    }

    /// Insert or replace the vector for a chunk
    pub fn upsert(&mut self, id: ChunkId, vector: Vec<f32>) -> Result<()> {
        if vector.is_empty() {
            return Err(TrendError::Embedding(format!("empty vector for {}", id)));
        }
        match self.dimension {
            Some(expected) if expected != vector.len() => {
                return Err(TrendError::DimensionMismatch {
                    expected,
                    actual: vector.len(),
                });
            }
            Some(_) => {}
            None => self.dimension = Some(vector.len()),
        }

        self.vectors.insert(id, vector);
        Ok(())
    }

    /// Top `k` chunks by cosine similarity, ties by chunk id
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(ChunkId, f32)>> {
        if let Some(expected) = self.dimension {
            if query.len() != expected {
                return Err(TrendError::DimensionMismatch {
                    expected,
                    actual: query.len(),
                });
            }
        }
        if k == 0 || self.vectors.is_empty() {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(ChunkId, f32)> = self
            .vectors
            .iter()
            .map(|(id, vector)| (*id, cosine_similarity(query, vector)))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored.truncate(k);
        Ok(scored)
    }

    pub fn get(&self, id: ChunkId) -> Option<&[f32]> {
        self.vectors.get(&id).map(Vec::as_slice)
    }

    pub fn remove(&mut self, id: ChunkId) -> bool {
        self.vectors.remove(&id).is_some()
    }

    /// Stored vectors in chunk id order
    pub fn iter(&self) -> impl Iterator<Item = (ChunkId, &[f32])> {
        self.vectors.iter().map(|(id, v)| (*id, v.as_slice()))
    }

    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_search_order() {
        let mut index = VectorIndex::new(Some(2));
        index.upsert(ChunkId(1), vec![0.0, 1.0]).unwrap();
        index.upsert(ChunkId(2), vec![1.0, 0.1]).unwrap();
        index.upsert(ChunkId(3), vec![1.0, 0.0]).unwrap();

        let results = index.search(&[1.0, 0.0], 2).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, ChunkId(3));
        assert_eq!(results[1].0, ChunkId(2));
    }

    #[test]
    fn test_ties_by_id() {
        let mut index = VectorIndex::new(None);
        index.upsert(ChunkId(9), vec![1.0, 1.0]).unwrap();
        index.upsert(ChunkId(4), vec![2.0, 2.0]).unwrap();

        let ids: Vec<ChunkId> = index
            .search(&[1.0, 1.0], 5)
            .unwrap()
            .into_iter()
            .map(|r| r.0)
            .collect();
        assert_eq!(ids, vec![ChunkId(4), ChunkId(9)]);
    }

    #[test]
    fn test_dimension_mismatch() {
        let mut index = VectorIndex::new(None);
        index.upsert(ChunkId(1), vec![1.0, 0.0, 0.0]).unwrap();
        assert_eq!(index.dimension(), Some(3));

        assert!(matches!(
            index.upsert(ChunkId(2), vec![1.0]),
            Err(TrendError::DimensionMismatch {
                expected: 3,
                actual: 1
            })
        ));
        assert!(matches!(
            index.search(&[1.0, 0.0], 1),
            Err(TrendError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_zero_vector_scores_zero() {
        let mut index = VectorIndex::new(Some(2));
        index.upsert(ChunkId(1), vec![0.0, 0.0]).unwrap();
        let results = index.search(&[1.0, 0.0], 1).unwrap();
        assert_eq!(results[0].1, 0.0);
    }

    #[test]
    fn test_upsert_replaces() {
        let mut index = VectorIndex::new(Some(2));
        index.upsert(ChunkId(1), vec![1.0, 0.0]).unwrap();
        index.upsert(ChunkId(1), vec![0.0, 1.0]).unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index.get(ChunkId(1)), Some(&[0.0, 1.0][..]));
        assert!(index.remove(ChunkId(1)));
        assert!(index.is_empty());
    }
}
