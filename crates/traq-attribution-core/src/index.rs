//! In-memory nearest-neighbor index over labeled activity embeddings.
//!
//! The index is an arena of [`LabeledVector`]s rebuilt wholesale from
//! storage by [`VectorIndex::load`] and swapped in under a single write
//! lock, so readers never observe a half-loaded set. Search is brute-force
//! cosine similarity, which is plenty for a single user's history.

use std::sync::{PoisonError, RwLock};

use anyhow::Result;

use crate::embedding::{blob_to_vec, cosine_similarity};
use crate::models::{AssignmentResult, AssignmentSource, EventType, SimilarityResult, StoredEmbedding};
use crate::store::Store;

/// Neighbors that vote in [`VectorIndex::suggest_project`].
pub const DEFAULT_NEIGHBORS: usize = 5;

#[derive(Debug, Clone)]
pub struct LabeledVector {
    pub event_type: EventType,
    pub event_id: i64,
    pub project_id: i64,
    pub project_name: String,
    pub embedding: Vec<f32>,
    pub source_text: String,
}

impl LabeledVector {
    /// Convert a stored row, dropping rows without a project label or
    /// with an undecodable or empty blob.
    pub fn from_stored(row: StoredEmbedding) -> Option<Self> {
        let project_id = row.project_id.filter(|&id| id != 0)?;
        let embedding = blob_to_vec(&row.embedding).filter(|v| !v.is_empty())?;
        Some(Self {
            event_type: row.event_type,
            event_id: row.event_id,
            project_id,
            project_name: row.project_name.unwrap_or_default(),
            embedding,
            source_text: row.context_text,
        })
    }
}

pub struct VectorIndex {
    vectors: RwLock<Vec<LabeledVector>>,
    neighbors: usize,
}

impl VectorIndex {
    pub fn new() -> Self {
        Self::with_neighbors(DEFAULT_NEIGHBORS)
    }

    pub fn with_neighbors(neighbors: usize) -> Self {
        Self {
            vectors: RwLock::new(Vec::new()),
            neighbors: neighbors.max(1),
        }
    }

    /// Rebuild from storage. Returns the number of usable vectors.
    pub async fn load(&self, store: &dyn Store) -> Result<usize> {
        let rows = store.labeled_embeddings().await?;
        let vectors: Vec<LabeledVector> =
            rows.into_iter().filter_map(LabeledVector::from_stored).collect();
        Ok(self.replace(vectors))
    }

    /// Swap in a new set of vectors in one step.
    pub fn replace(&self, vectors: Vec<LabeledVector>) -> usize {
        let count = vectors.len();
        *self.vectors.write().unwrap_or_else(PoisonError::into_inner) = vectors;
        count
    }

    pub fn len(&self) -> usize {
        self.vectors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Up to `k` entries ranked by descending cosine similarity.
    pub fn find_similar(&self, query: &[f32], k: usize) -> Vec<SimilarityResult> {
        if k == 0 || query.is_empty() {
            return Vec::new();
        }
        let vectors = self.vectors.read().unwrap_or_else(PoisonError::into_inner);

        let mut scored: Vec<(f64, &LabeledVector)> = vectors
            .iter()
            .map(|lv| (cosine_similarity(query, &lv.embedding), lv))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);

        scored
            .into_iter()
            .map(|(similarity, lv)| SimilarityResult {
                event_type: lv.event_type,
                event_id: lv.event_id,
                project_id: lv.project_id,
                project_name: lv.project_name.clone(),
                similarity,
                source_text: lv.source_text.clone(),
            })
            .collect()
    }

    /// Vote among the nearest neighbors for a project.
    ///
    /// Similarities are summed per project; the first project reaching the
    /// highest total wins. Confidence is that total divided by the number
    /// of neighbors considered. The color is left empty for the caller to
    /// resolve.
    pub fn suggest_project(&self, query: &[f32], min_confidence: f64) -> Option<AssignmentResult> {
        let similar = self.find_similar(query, self.neighbors);
        if similar.is_empty() {
            return None;
        }

        let mut votes: Vec<(i64, f64, &SimilarityResult)> = Vec::new();
        for result in &similar {
            match votes.iter_mut().find(|(pid, _, _)| *pid == result.project_id) {
                Some(entry) => entry.1 += result.similarity,
                None => votes.push((result.project_id, result.similarity, result)),
            }
        }

        let mut best: Option<&(i64, f64, &SimilarityResult)> = None;
        for vote in &votes {
            if best.map_or(true, |b| vote.1 > b.1) {
                best = Some(vote);
            }
        }
        let (project_id, score, first_hit) = best?;
        if *score <= 0.0 {
            return None;
        }

        let confidence = (score / similar.len() as f64).clamp(0.0, 1.0);
        if confidence < min_confidence {
            return None;
        }

        let top = &similar[0];
        Some(AssignmentResult {
            project_id: *project_id,
            project_name: first_hit.project_name.clone(),
            color: String::new(),
            confidence,
            source: AssignmentSource::Embedding,
            reason: format!(
                "Similar to {} previous activities (best match: {})",
                similar.len(),
                top.source_text
            ),
        })
    }
}

impl Default for VectorIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::vec_to_blob;

    fn lv(event_id: i64, project_id: i64, name: &str, embedding: Vec<f32>) -> LabeledVector {
        LabeledVector {
            event_type: EventType::Focus,
            event_id,
            project_id,
            project_name: name.to_string(),
            embedding,
            source_text: format!("event {}", event_id),
        }
    }

    #[test]
    fn test_find_similar_ranks_descending() {
        let index = VectorIndex::new();
        index.replace(vec![
            lv(1, 1, "a", vec![0.0, 1.0]),
            lv(2, 1, "a", vec![1.0, 0.0]),
            lv(3, 2, "b", vec![0.7, 0.7]),
        ]);
        let results = index.find_similar(&[1.0, 0.0], 2);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].event_id, 2);
        assert_eq!(results[1].event_id, 3);
        assert!(results[0].similarity >= results[1].similarity);
    }

    #[test]
    fn test_suggest_votes_by_summed_similarity() {
        let index = VectorIndex::new();
        index.replace(vec![
            lv(1, 1, "alpha", vec![1.0, 0.0]),
            lv(2, 2, "beta", vec![0.9, 0.1]),
            lv(3, 2, "beta", vec![0.8, 0.2]),
        ]);
        let result = index.suggest_project(&[1.0, 0.0], 0.0).unwrap();
        assert_eq!(result.project_id, 2);
        assert_eq!(result.project_name, "beta");
        assert_eq!(result.source, AssignmentSource::Embedding);
        assert!(result.confidence > 0.0 && result.confidence <= 1.0);
        assert!(result.reason.contains("event 1"));
    }

    #[test]
    fn test_suggest_respects_min_confidence() {
        let index = VectorIndex::new();
        index.replace(vec![
            lv(1, 1, "alpha", vec![1.0, 0.0]),
            lv(2, 2, "beta", vec![0.0, 1.0]),
        ]);
        // Best total 1.0 over two neighbors: confidence 0.5.
        assert!(index.suggest_project(&[1.0, 0.0], 0.9).is_none());
        let result = index.suggest_project(&[1.0, 0.0], 0.4).unwrap();
        assert_eq!(result.project_id, 1);
        assert!(result.confidence >= 0.4);
    }

    #[test]
    fn test_suggest_rejects_non_positive_scores() {
        let index = VectorIndex::new();
        index.replace(vec![lv(1, 1, "alpha", vec![-1.0, 0.0])]);
        assert!(index.suggest_project(&[1.0, 0.0], 0.0).is_none());
        assert!(VectorIndex::new().suggest_project(&[1.0, 0.0], 0.0).is_none());
    }

    #[test]
    fn test_from_stored_filters_unusable_rows() {
        let good = StoredEmbedding {
            event_type: EventType::Git,
            event_id: 7,
            embedding: vec_to_blob(&[1.0, 2.0]),
            context_text: "repo:traq".into(),
            project_id: Some(3),
            project_name: Some("Traq".into()),
        };
        assert!(LabeledVector::from_stored(good.clone()).is_some());

        let unlabeled = StoredEmbedding {
            project_id: None,
            ..good.clone()
        };
        assert!(LabeledVector::from_stored(unlabeled).is_none());

        let zero = StoredEmbedding {
            project_id: Some(0),
            ..good.clone()
        };
        assert!(LabeledVector::from_stored(zero).is_none());

        let corrupt = StoredEmbedding {
            embedding: vec![1, 2, 3],
            ..good
        };
        assert!(LabeledVector::from_stored(corrupt).is_none());
    }
}
