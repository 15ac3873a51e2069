//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;

use folio::vector::{Normalization, VectorError, cosine_similarity, normalize_vector_copy};
use folio::{
    Encoder, IndexConfig, ItemId, SearchResult, VectorDimension, VectorIndex, VectorStore,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub fn id(n: u64) -> ItemId {
    ItemId::new(n).expect("test ids are non-zero")
}

/// Index config with background rebuilds off, so tests decide when to rebuild.
pub fn manual_config(dim: usize) -> IndexConfig {
    IndexConfig {
        auto_rebuild: false,
        ..IndexConfig::new(VectorDimension::new(dim).expect("non-zero test dimension"))
    }
}

/// In-memory store plus an index reading from it.
pub fn store_and_index(config: IndexConfig) -> (Arc<VectorStore>, Arc<VectorIndex>) {
    let store = Arc::new(VectorStore::in_memory(config.dimension, Normalization::Unit));
    let index = VectorIndex::new(config, store.clone()).expect("valid test config");
    (store, index)
}

/// Commits `vector` and stages it, the way the coordinator does.
pub fn put_and_add(store: &VectorStore, index: &VectorIndex, item_id: ItemId, vector: &[f32]) {
    let item = store.put(item_id, vector).expect("valid test vector");
    index.add(&item).expect("index accepts committed item");
}

/// Seeded random unit vectors.
pub fn random_unit_vectors(count: usize, dim: usize, seed: u64) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| {
            let raw: Vec<f32> = (0..dim).map(|_| rng.random_range(-1.0f32..1.0)).collect();
            normalize_vector_copy(&raw)
        })
        .collect()
}

/// Reference ranking by exhaustive cosine comparison, best first.
pub fn brute_force_top_k(
    items: &[(ItemId, Vec<f32>)],
    query: &[f32],
    k: usize,
) -> Vec<(ItemId, f32)> {
    let mut scored: Vec<(ItemId, f32)> = items
        .iter()
        .map(|(item_id, vector)| (*item_id, cosine_similarity(vector, query)))
        .collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    scored.truncate(k);
    scored
}

/// Checks `results` against the reference ranking.
///
/// Scores must agree rank by rank, and every returned item must carry its
/// true score. Items whose scores differ only by rounding may swap places.
pub fn assert_ranked_like_reference(
    results: &[SearchResult],
    items: &[(ItemId, Vec<f32>)],
    query: &[f32],
) {
    const TOLERANCE: f32 = 1e-5;
    let reference = brute_force_top_k(items, query, results.len().max(1));
    assert_eq!(results.len(), reference.len());

    for (result, (_, expected)) in results.iter().zip(&reference) {
        assert!(
            (result.score.get() - expected).abs() < TOLERANCE,
            "rank {} scored {} but the reference has {expected}",
            result.rank,
            result.score
        );
        let (_, vector) = items
            .iter()
            .find(|(item_id, _)| *item_id == result.item_id)
            .expect("result item was inserted");
        assert!((cosine_similarity(vector, query) - result.score.get()).abs() < TOLERANCE);
    }

    let unique: HashSet<ItemId> = results.iter().map(|r| r.item_id).collect();
    assert_eq!(unique.len(), results.len());
}

/// Deterministic bag-of-words encoder: each token lands in a hashed bucket.
pub struct HashEncoder {
    dimension: VectorDimension,
}

impl HashEncoder {
    pub fn new(dim: usize) -> Self {
        Self {
            dimension: VectorDimension::new(dim).expect("non-zero test dimension"),
        }
    }
}

impl Encoder for HashEncoder {
    fn encode_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, VectorError> {
        let dim = self.dimension.get();
        Ok(texts
            .iter()
            .map(|text| {
                let mut embedding = vec![0.0; dim];
                for token in text.split_whitespace() {
                    let bucket = token
                        .to_lowercase()
                        .bytes()
                        .fold(7usize, |acc, b| acc.wrapping_mul(131).wrapping_add(b as usize));
                    embedding[bucket % dim] += 1.0;
                }
                if embedding.iter().all(|v| *v == 0.0) {
                    embedding[0] = 1.0;
                }
                embedding
            })
            .collect())
    }

    fn dimension(&self) -> VectorDimension {
        self.dimension
    }

    fn model_name(&self) -> &str {
        "hash-bow"
    }
}

/// Encoder that always fails, for error propagation tests.
pub struct FailingEncoder {
    dimension: VectorDimension,
}

impl FailingEncoder {
    pub fn new(dim: usize) -> Self {
        Self {
            dimension: VectorDimension::new(dim).expect("non-zero test dimension"),
        }
    }
}

impl Encoder for FailingEncoder {
    fn encode_batch(&self, _texts: &[&str]) -> Result<Vec<Vec<f32>>, VectorError> {
        Err(VectorError::EmbeddingFailed("encoder offline".to_string()))
    }

    fn dimension(&self) -> VectorDimension {
        self.dimension
    }

    fn model_name(&self) -> &str {
        "failing"
    }
}
