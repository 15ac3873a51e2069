//! Vector primitives for the recommendation core.
//!
//! This module holds everything below the index: typed identifiers and
//! scores, the similarity metric, K-means clustering used to partition
//! snapshots, the encoder abstraction, and the durable vector log.
//!
//! # Architecture
//! Vectors are normalized once when they enter the store, so every
//! comparison further up is a plain inner product.

mod clustering;
mod embedding;
mod metric;
mod storage;
mod types;

// Re-export core types for public API
pub use clustering::{
    ClusteringError, KMeansParams, KMeansResult, assign_to_nearest_centroid, kmeans_clustering,
    nearest_centroids,
};
#[cfg(test)]
pub use embedding::MockEncoder;
pub use embedding::{
    Encoder, FastEmbedEncoder, default_models_dir, model_to_string, parse_embedding_model,
};
pub use metric::{
    Normalization, cosine_similarity, dot_product, l2_norm, normalize_vector,
    normalize_vector_copy,
};
pub use storage::{LOG_FILE_NAME, LogEntry, ReplayRecord, VectorLog, VectorStorageError};
pub use types::{
    EmbeddingVector, ItemId, Score, VECTOR_DIMENSION_384, VectorDimension, VectorError,
    validate_finite,
};
