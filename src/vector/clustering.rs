//! Spherical K-means used to partition snapshots into inverted lists.
//!
//! Centroids are kept at unit length and vectors are assigned by inner
//! product, so clustering agrees with the metric used at query time.
//!
//! # Algorithm Details
//! - Similarity: cosine (inner product of unit vectors)
//! - Initialization: K-means++ driven by a seeded RNG
//! - Assignment step runs in parallel with rayon
//!
//! Given the same input order, `k`, and seed, the result is bit-for-bit
//! reproducible. Snapshot rebuilds rely on that to stay idempotent.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use thiserror::Error;

use crate::vector::metric::{cosine_similarity, dot_product, normalize_vector, normalize_vector_copy};

/// Convergence tolerance for mean centroid movement (cosine distance).
const CONVERGENCE_TOLERANCE: f32 = 1e-4;

/// Epsilon for floating-point comparisons.
const EPSILON: f32 = 1e-10;

/// Below this many vectors the assignment step stays on the calling thread.
const PARALLEL_ASSIGNMENT_THRESHOLD: usize = 4096;

/// Parameters for a clustering run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KMeansParams {
    /// Number of clusters.
    pub k: usize,
    /// Upper bound on Lloyd iterations.
    pub max_iterations: usize,
    /// Seed for centroid initialization and empty-cluster reseeding.
    pub seed: u64,
}

/// Result of K-means clustering operation.
#[derive(Debug, Clone, PartialEq)]
pub struct KMeansResult {
    /// Unit-length cluster centroids.
    pub centroids: Vec<Vec<f32>>,

    /// Cluster index (0-based) for each input vector.
    pub assignments: Vec<usize>,

    /// Number of iterations until convergence.
    pub iterations: usize,
}

/// Errors that can occur during clustering operations.
#[derive(Error, Debug)]
pub enum ClusteringError {
    #[error(
        "Empty vector set provided for clustering\nSuggestion: Ensure vectors are ingested before rebuilding"
    )]
    EmptyVectorSet,

    #[error("Invalid cluster count: {0}\nSuggestion: Use k between 1 and the number of vectors")]
    InvalidClusterCount(usize),

    #[error(
        "Dimension mismatch in vectors\nSuggestion: Ensure all vectors come from the same embedding model"
    )]
    DimensionMismatch,
}

/// Performs spherical K-means over borrowed vectors.
///
/// # Algorithm
/// 1. Initialize centroids using K-means++ with a seeded RNG
/// 2. Iterate until assignments stop changing, centroids stop moving,
///    or `max_iterations` is reached:
///    - Assign each vector to the centroid with the highest inner product
///    - Recompute centroids as normalized means
///
/// When all points coincide, fewer than `k` distinct centroids may exist;
/// the result then holds only the distinct ones.
#[must_use = "clustering results should be used or the computation is wasted"]
pub fn kmeans_clustering(
    vectors: &[&[f32]],
    params: KMeansParams,
) -> Result<KMeansResult, ClusteringError> {
    if vectors.is_empty() {
        return Err(ClusteringError::EmptyVectorSet);
    }

    let k = params.k;
    if k == 0 || k > vectors.len() {
        return Err(ClusteringError::InvalidClusterCount(k));
    }

    let dimension = vectors[0].len();
    if vectors.iter().any(|v| v.len() != dimension) {
        return Err(ClusteringError::DimensionMismatch);
    }

    let mut rng = StdRng::seed_from_u64(params.seed);
    let mut centroids = initialize_centroids_kmeans_plus_plus(vectors, k, &mut rng);
    let mut assignments = vec![usize::MAX; vectors.len()];
    let mut iterations = 0;

    loop {
        iterations += 1;

        let new_assignments = assign_all(vectors, &centroids);
        let converged = new_assignments == assignments;
        assignments = new_assignments;

        if converged || iterations >= params.max_iterations.max(1) {
            break;
        }

        let new_centroids = update_centroids(vectors, &assignments, centroids.len(), &mut rng);
        let movement = calculate_centroid_movement(&centroids, &new_centroids);
        centroids = new_centroids;

        if movement < CONVERGENCE_TOLERANCE {
            assignments = assign_all(vectors, &centroids);
            break;
        }
    }

    if iterations >= params.max_iterations {
        tracing::debug!(
            "K-means stopped at the iteration cap ({}) before assignments settled",
            params.max_iterations
        );
    }

    Ok(KMeansResult {
        centroids,
        assignments,
        iterations,
    })
}

/// Returns the index of the centroid with the highest inner product.
///
/// Ties resolve to the lowest centroid index.
pub fn assign_to_nearest_centroid(vector: &[f32], centroids: &[Vec<f32>]) -> usize {
    let mut best_similarity = f32::NEG_INFINITY;
    let mut best_cluster = 0;

    for (i, centroid) in centroids.iter().enumerate() {
        let similarity = dot_product(vector, centroid);
        if similarity > best_similarity {
            best_similarity = similarity;
            best_cluster = i;
        }
    }

    best_cluster
}

/// Returns the indices of the `n` centroids closest to `vector`, best first.
pub fn nearest_centroids(vector: &[f32], centroids: &[Vec<f32>], n: usize) -> Vec<usize> {
    let mut ranked: Vec<(usize, f32)> = centroids
        .iter()
        .enumerate()
        .map(|(i, centroid)| (i, dot_product(vector, centroid)))
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    ranked.truncate(n);
    ranked.into_iter().map(|(i, _)| i).collect()
}

fn assign_all(vectors: &[&[f32]], centroids: &[Vec<f32>]) -> Vec<usize> {
    if vectors.len() >= PARALLEL_ASSIGNMENT_THRESHOLD {
        vectors
            .par_iter()
            .map(|vector| assign_to_nearest_centroid(vector, centroids))
            .collect()
    } else {
        vectors
            .iter()
            .map(|vector| assign_to_nearest_centroid(vector, centroids))
            .collect()
    }
}

/// Updates centroids as the normalized mean of their assigned vectors.
///
/// An empty cluster is reseeded from a vector drawn with the seeded RNG.
fn update_centroids(
    vectors: &[&[f32]],
    assignments: &[usize],
    k: usize,
    rng: &mut StdRng,
) -> Vec<Vec<f32>> {
    let dimension = vectors[0].len();
    let mut new_centroids = vec![vec![0.0; dimension]; k];
    let mut cluster_sizes = vec![0usize; k];

    for (vector, &cluster) in vectors.iter().zip(assignments.iter()) {
        for (sum, &value) in new_centroids[cluster].iter_mut().zip(vector.iter()) {
            *sum += value;
        }
        cluster_sizes[cluster] += 1;
    }

    for (centroid, &size) in new_centroids.iter_mut().zip(cluster_sizes.iter()) {
        if size == 0 {
            let random_idx = rng.random_range(0..vectors.len());
            *centroid = normalize_vector_copy(vectors[random_idx]);
        } else {
            for value in centroid.iter_mut() {
                *value /= size as f32;
            }
            normalize_vector(centroid);
        }
    }

    new_centroids
}

/// K-means++ initialization: spread initial centroids by squared cosine distance.
fn initialize_centroids_kmeans_plus_plus(
    vectors: &[&[f32]],
    k: usize,
    rng: &mut StdRng,
) -> Vec<Vec<f32>> {
    let mut centroids = Vec::with_capacity(k);

    let first_idx = rng.random_range(0..vectors.len());
    centroids.push(normalize_vector_copy(vectors[first_idx]));

    let mut min_distances: Vec<f32> = vectors
        .iter()
        .map(|vector| squared_cosine_distance(vector, &centroids[0]))
        .collect();

    while centroids.len() < k {
        let total_distance: f32 = min_distances.iter().sum();
        if total_distance < EPSILON {
            // Every remaining point coincides with an existing centroid.
            break;
        }

        let target = rng.random::<f32>() * total_distance;
        let mut cumulative = 0.0;
        let mut chosen = vectors.len() - 1;
        for (i, &distance) in min_distances.iter().enumerate() {
            cumulative += distance;
            if cumulative >= target && distance > 0.0 {
                chosen = i;
                break;
            }
        }

        let centroid = normalize_vector_copy(vectors[chosen]);
        for (slot, vector) in min_distances.iter_mut().zip(vectors.iter()) {
            *slot = slot.min(squared_cosine_distance(vector, &centroid));
        }
        centroids.push(centroid);
    }

    centroids
}

fn squared_cosine_distance(vector: &[f32], centroid: &[f32]) -> f32 {
    let distance = (1.0 - cosine_similarity(vector, centroid)).max(0.0);
    distance * distance
}

/// Mean cosine distance travelled by the centroids between iterations.
fn calculate_centroid_movement(old: &[Vec<f32>], new: &[Vec<f32>]) -> f32 {
    old.iter()
        .zip(new.iter())
        .map(|(old_c, new_c)| 1.0 - cosine_similarity(old_c, new_c))
        .sum::<f32>()
        / old.len() as f32
}
