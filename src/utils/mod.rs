//! Shared numeric helpers for the ranking pipeline.

use ndarray::ArrayView1;

/// Cosine similarity of two vectors; 0.0 when either has zero norm.
pub fn cosine_similarity(a: ArrayView1<'_, f64>, b: ArrayView1<'_, f64>) -> f64 {
    let dot = a.dot(&b);
    let norm_a = a.dot(&a).sqrt();
    let norm_b = b.dot(&b).sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Indices of the `k` largest values, highest first. NaNs sort last.
pub fn top_k_indices(values: &[f64], k: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| {
        values[b]
            .partial_cmp(&values[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    order.truncate(k);
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_cosine_identical_vectors() {
        let a = array![1.0, 2.0, 3.0];
        assert!((cosine_similarity(a.view(), a.view()) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_cosine_orthogonal_vectors() {
        let a = array![1.0, 0.0];
        let b = array![0.0, 1.0];
        assert!(cosine_similarity(a.view(), b.view()).abs() < 1e-12);
    }

    #[test]
    fn test_cosine_scale_invariance() {
        let a = array![0.3, 0.7, 0.1, 0.9];
        let b = array![0.5, 0.2, 0.8, 0.4];
        let scaled = &b * 42.0;
        let s1 = cosine_similarity(a.view(), b.view());
        let s2 = cosine_similarity(a.view(), scaled.view());
        assert!((s1 - s2).abs() < 1e-12);

        let scaled_a = &a * 0.001;
        let s3 = cosine_similarity(scaled_a.view(), b.view());
        assert!((s1 - s3).abs() < 1e-12);
    }

    #[test]
    fn test_cosine_zero_norm() {
        let a = array![0.0, 0.0];
        let b = array![1.0, 1.0];
        assert_eq!(cosine_similarity(a.view(), b.view()), 0.0);
    }

    #[test]
    fn test_top_k_indices() {
        let values = [0.1, 0.9, 0.5, 0.7];
        assert_eq!(top_k_indices(&values, 2), vec![1, 3]);
        assert_eq!(top_k_indices(&values, 10), vec![1, 3, 2, 0]);
        assert!(top_k_indices(&[], 3).is_empty());
    }
}
