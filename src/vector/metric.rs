//! Similarity metric and normalization policy.
//!
//! The index ranks by inner product. With [`Normalization::Unit`] every
//! stored vector is scaled to unit length before it is indexed, which makes
//! the inner product equal to cosine similarity. The policy is chosen once
//! when the store and index are constructed and applied to every vector.

use serde::{Deserialize, Serialize};

use crate::vector::types::VectorError;

/// Norms below this are treated as zero.
const EPSILON: f32 = 1e-10;

/// Vectors whose norm is within this distance of 1.0 are kept as-is.
const UNIT_TOLERANCE: f32 = 1e-4;

/// Normalization policy applied when a vector enters the store or index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Normalization {
    /// Scale every vector to unit length; zero vectors are rejected.
    #[default]
    Unit,
    /// Store vectors untouched; the caller guarantees they are comparable.
    None,
}

impl Normalization {
    /// Applies the policy, returning `None` when the input already satisfies it.
    ///
    /// Returning `None` lets callers keep sharing an existing buffer instead
    /// of allocating an identical copy.
    pub fn apply(self, vector: &[f32]) -> Result<Option<Vec<f32>>, VectorError> {
        match self {
            Normalization::None => Ok(None),
            Normalization::Unit => {
                let norm = l2_norm(vector);
                if norm < EPSILON {
                    return Err(VectorError::InvalidVector {
                        reason: "zero-length vector cannot be normalized".to_string(),
                    });
                }
                if (norm - 1.0).abs() <= UNIT_TOLERANCE {
                    return Ok(None);
                }
                Ok(Some(vector.iter().map(|v| v / norm).collect()))
            }
        }
    }
}

/// Inner product. Equal to cosine similarity for unit vectors.
pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vectors must have same dimension");
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// L2 norm (Euclidean length).
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Computes cosine similarity between two vectors.
///
/// Returns a value in [-1, 1], or 0.0 if either vector has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let norm_a = l2_norm(a);
    let norm_b = l2_norm(b);

    if norm_a < EPSILON || norm_b < EPSILON {
        0.0
    } else {
        dot_product(a, b) / (norm_a * norm_b)
    }
}

/// Normalizes a vector in-place to unit length.
///
/// Vectors with a norm below epsilon are left untouched.
pub fn normalize_vector(vector: &mut [f32]) {
    let norm = l2_norm(vector);
    if norm > EPSILON {
        for value in vector.iter_mut() {
            *value /= norm;
        }
    }
}

/// Creates a normalized copy of a vector.
pub fn normalize_vector_copy(vector: &[f32]) -> Vec<f32> {
    let mut normalized = vector.to_vec();
    normalize_vector(&mut normalized);
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-6);

        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < f32::EPSILON);

        let b = vec![-1.0, -2.0, -3.0];
        assert!((cosine_similarity(&a, &b) + 1.0).abs() < 1e-6);

        assert_eq!(cosine_similarity(&a, &[0.0, 0.0, 0.0]), 0.0);
    }

    #[test]
    fn test_dot_equals_cosine_for_unit_vectors() {
        let a = normalize_vector_copy(&[3.0, 4.0]);
        let b = normalize_vector_copy(&[0.9, 0.1]);
        assert!((dot_product(&a, &b) - cosine_similarity(&[3.0, 4.0], &[0.9, 0.1])).abs() < 1e-6);
    }

    #[test]
    fn test_normalize_vector() {
        let mut vector = vec![3.0, 4.0];
        normalize_vector(&mut vector);
        assert!((l2_norm(&vector) - 1.0).abs() < f32::EPSILON);
        assert!((vector[0] - 0.6).abs() < f32::EPSILON);
        assert!((vector[1] - 0.8).abs() < f32::EPSILON);
    }

    #[test]
    fn test_unit_policy() {
        let scaled = Normalization::Unit.apply(&[3.0, 4.0]).unwrap().unwrap();
        assert!((l2_norm(&scaled) - 1.0).abs() < 1e-6);

        // Already unit length: nothing to allocate.
        assert!(Normalization::Unit.apply(&[0.6, 0.8]).unwrap().is_none());

        assert!(matches!(
            Normalization::Unit.apply(&[0.0, 0.0]),
            Err(VectorError::InvalidVector { .. })
        ));
    }

    #[test]
    fn test_none_policy_keeps_input() {
        assert!(Normalization::None.apply(&[3.0, 4.0]).unwrap().is_none());
        assert!(Normalization::None.apply(&[0.0, 0.0]).unwrap().is_none());
    }
}
