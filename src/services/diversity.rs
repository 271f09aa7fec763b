//! Diversity reranking with Maximal Marginal Relevance.
//!
//! Greedy selection over a pre-bounded candidate set: the first pick is the
//! most similar candidate, every further pick maximizes
//! `lambda * relevance - (1 - lambda) * max_similarity_to_selected`.
//! `lambda = 1.0` degenerates to plain similarity ranking.

use crate::utils::cosine_similarity;
use ndarray::Array2;

pub struct MmrReranker {
    lambda: f64,
}

impl MmrReranker {
    pub fn new(lambda: f64) -> Self {
        Self {
            lambda: lambda.clamp(0.0, 1.0),
        }
    }

    pub fn lambda(&self) -> f64 {
        self.lambda
    }

    /// Pick up to `top_n` candidate indices. `similarities[i]` is candidate
    /// i's relevance to the user; `vectors` holds one row per candidate and
    /// is used for the pairwise redundancy term.
    pub fn select(&self, similarities: &[f64], vectors: &Array2<f64>, top_n: usize) -> Vec<usize> {
        if similarities.is_empty() || top_n == 0 {
            return Vec::new();
        }

        let mut remaining: Vec<usize> = (0..similarities.len()).collect();
        let mut selected: Vec<usize> = Vec::with_capacity(top_n.min(similarities.len()));

        // First pick: plain best similarity.
        let first = remaining
            .iter()
            .copied()
            .max_by(|&a, &b| {
                similarities[a]
                    .partial_cmp(&similarities[b])
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .unwrap_or(0);
        selected.push(first);
        remaining.retain(|&i| i != first);

        while selected.len() < top_n && !remaining.is_empty() {
            let mut best_idx = remaining[0];
            let mut best_score = f64::NEG_INFINITY;

            for &i in &remaining {
                let max_selected_sim = selected
                    .iter()
                    .map(|&s| cosine_similarity(vectors.row(i), vectors.row(s)))
                    .fold(f64::NEG_INFINITY, f64::max);

                let score = self.lambda * similarities[i] - (1.0 - self.lambda) * max_selected_sim;
                if score > best_score {
                    best_score = score;
                    best_idx = i;
                }
            }

            selected.push(best_idx);
            remaining.retain(|&i| i != best_idx);
        }

        selected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::top_k_indices;
    use ndarray::array;

    fn sample_vectors() -> Array2<f64> {
        array![
            [1.0, 0.0, 0.0],
            [0.9, 0.1, 0.0],
            [0.0, 1.0, 0.0],
            [0.0, 0.0, 1.0],
        ]
    }

    #[test]
    fn test_empty_input() {
        let reranker = MmrReranker::new(0.5);
        let vectors = Array2::<f64>::zeros((0, 3));
        assert!(reranker.select(&[], &vectors, 5).is_empty());
    }

    #[test]
    fn test_output_bounded_by_top_n() {
        let reranker = MmrReranker::new(0.5);
        let sims = [0.9, 0.8, 0.7, 0.6];
        let selected = reranker.select(&sims, &sample_vectors(), 2);
        assert_eq!(selected.len(), 2);

        let all = reranker.select(&sims, &sample_vectors(), 10);
        assert_eq!(all.len(), 4);
    }

    #[test]
    fn test_first_pick_is_plain_argmax() {
        let reranker = MmrReranker::new(0.3);
        let sims = [0.2, 0.95, 0.5, 0.6];
        let selected = reranker.select(&sims, &sample_vectors(), 3);
        assert_eq!(selected[0], 1);
    }

    #[test]
    fn test_lambda_one_matches_similarity_order() {
        let reranker = MmrReranker::new(1.0);
        let sims = [0.2, 0.95, 0.5, 0.6];
        let selected = reranker.select(&sims, &sample_vectors(), 4);
        assert_eq!(selected, top_k_indices(&sims, 4));
    }

    #[test]
    fn test_diversity_prefers_dissimilar_candidates() {
        // Candidates 0 and 1 are near-duplicates; candidate 2 is orthogonal
        // with slightly lower relevance. With lambda favouring diversity the
        // second pick should skip the duplicate.
        let vectors = array![[1.0, 0.0], [0.99, 0.01], [0.0, 1.0]];
        let sims = [0.9, 0.89, 0.8];
        let reranker = MmrReranker::new(0.3);
        let selected = reranker.select(&sims, &vectors, 2);
        assert_eq!(selected, vec![0, 2]);
    }

    #[test]
    fn test_identical_vectors_never_reselect_same_index() {
        // Ten identical vectors: every pick after the first is an arbitrary
        // tied choice, but indices must never repeat.
        let vectors = Array2::from_shape_fn((10, 3), |(_, j)| if j == 0 { 1.0 } else { 0.5 });
        let sims = vec![0.7; 10];
        let reranker = MmrReranker::new(0.5);

        let selected = reranker.select(&sims, &vectors, 10);
        assert_eq!(selected.len(), 10);
        let unique: std::collections::HashSet<usize> = selected.iter().copied().collect();
        assert_eq!(unique.len(), 10);
    }
}
