//! Dimensionality-aware embedding distance.
//!
//! The 128-d classical space is calibrated for Euclidean distance, the
//! 512-d ArcFace spaces for cosine distance. The metric is picked from the
//! vector length.

use crate::types::Embedding;

/// Dimensionality of the classical encoder's embedding space.
pub const CLASSICAL_DIM: usize = 128;

/// Added to each norm in the cosine metric so zero vectors stay finite.
const NORM_EPSILON: f32 = 1e-10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Euclidean,
    Cosine,
}

impl Metric {
    /// Metric native to an embedding space of the given dimensionality.
    pub fn for_dim(dim: usize) -> Self {
        if dim > CLASSICAL_DIM {
            Metric::Cosine
        } else {
            Metric::Euclidean
        }
    }

    pub fn distance(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Metric::Euclidean => euclidean(a, b),
            Metric::Cosine => cosine(a, b),
        }
    }
}

/// Distance between two embeddings of equal dimensionality.
///
/// Returns `None` when the dimensionalities differ; such embeddings come
/// from unrelated encoders and are never comparable.
pub fn distance(a: &Embedding, b: &Embedding) -> Option<f32> {
    if a.dim() != b.dim() {
        return None;
    }
    Some(Metric::for_dim(a.dim()).distance(&a.values, &b.values))
}

fn euclidean(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f32>()
        .sqrt()
}

/// Cosine distance in [0, 2]: 0 for identical direction, 2 for opposite.
fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    1.0 - dot / ((norm_a.sqrt() + NORM_EPSILON) * (norm_b.sqrt() + NORM_EPSILON))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(dim: usize, axis: usize, scale: f32) -> Embedding {
        let mut v = vec![0.0; dim];
        v[axis] = scale;
        Embedding::new(v)
    }

    #[test]
    fn test_metric_for_dim() {
        assert_eq!(Metric::for_dim(128), Metric::Euclidean);
        assert_eq!(Metric::for_dim(512), Metric::Cosine);
    }

    #[test]
    fn test_euclidean_128() {
        let a = unit(128, 0, 0.0);
        let b = unit(128, 0, 0.3);
        assert!((distance(&a, &b).unwrap() - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_identical_512() {
        let a = unit(512, 3, 2.0);
        let b = unit(512, 3, 5.0);
        assert!(distance(&a, &b).unwrap().abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal_and_opposite() {
        let a = unit(512, 0, 1.0);
        let b = unit(512, 1, 1.0);
        let c = unit(512, 0, -1.0);
        assert!((distance(&a, &b).unwrap() - 1.0).abs() < 1e-6);
        assert!((distance(&a, &c).unwrap() - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_zero_vector_is_finite() {
        let a = Embedding::new(vec![0.0; 512]);
        let b = unit(512, 0, 1.0);
        let d = distance(&a, &b).unwrap();
        assert!(d.is_finite());
        assert!((d - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_mismatched_dims() {
        assert!(distance(&unit(128, 0, 1.0), &unit(512, 0, 1.0)).is_none());
    }
}
