//! Query pipeline: encode, search, filter, rank.
//!
//! The recommender never retries the encoder and never re-ranks: the final
//! order is the index's order (descending score, smaller id on ties) after
//! exclusions and the minimum-score threshold are applied.

use std::collections::HashSet;
use std::sync::Arc;

use crate::error::{CoreError, CoreResult};
use crate::index::{SearchResult, VectorIndex};
use crate::store::VectorStore;
use crate::vector::{Encoder, ItemId, Normalization, Score, dot_product, validate_finite};

/// What to find neighbours of.
#[derive(Debug, Clone, Copy)]
pub enum Query<'a> {
    /// Free text, encoded with the configured encoder.
    Text(&'a str),
    /// A raw vector of the index dimension.
    Vector(&'a [f32]),
}

/// Per-call filters.
#[derive(Debug, Clone, Default)]
pub struct RecommendFilters {
    /// Items never returned, removed before ranking.
    pub exclude_ids: HashSet<ItemId>,
    /// Drop results scoring below this; falls back to the recommender default.
    pub min_score: Option<f32>,
}

impl RecommendFilters {
    #[must_use]
    pub fn excluding(ids: impl IntoIterator<Item = ItemId>) -> Self {
        Self {
            exclude_ids: ids.into_iter().collect(),
            min_score: None,
        }
    }

    #[must_use]
    pub fn with_min_score(mut self, min_score: f32) -> Self {
        self.min_score = Some(min_score);
        self
    }
}

/// Recommendation engine over a shared index.
pub struct Recommender {
    encoder: Arc<dyn Encoder>,
    index: Arc<VectorIndex>,
    store: Arc<VectorStore>,
    default_min_score: Option<f32>,
}

impl std::fmt::Debug for Recommender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recommender")
            .field("model", &self.encoder.model_name())
            .field("default_min_score", &self.default_min_score)
            .finish()
    }
}

impl Recommender {
    /// Creates a recommender.
    ///
    /// # Errors
    /// `DimensionMismatch` if the encoder's output width differs from the
    /// index dimension.
    pub fn new(
        encoder: Arc<dyn Encoder>,
        index: Arc<VectorIndex>,
        store: Arc<VectorStore>,
        default_min_score: Option<f32>,
    ) -> CoreResult<Self> {
        let expected = index.dimension().get();
        let actual = encoder.dimension().get();
        if expected != actual {
            return Err(CoreError::DimensionMismatch { expected, actual });
        }
        Ok(Self {
            encoder,
            index,
            store,
            default_min_score,
        })
    }

    /// Ranked neighbours of `query`.
    ///
    /// # Errors
    /// - `EncodingFailed` if the encoder fails on a text query
    /// - `DimensionMismatch` / `InvalidVector` for a malformed vector query
    /// - `EmptyIndex` when nothing is indexed
    pub fn recommend(
        &self,
        query: Query<'_>,
        k: usize,
        filters: &RecommendFilters,
    ) -> CoreResult<Vec<SearchResult>> {
        let vector = match query {
            Query::Text(text) => self.encode(text)?,
            Query::Vector(vector) => self.prepare(vector.to_vec())?,
        };
        self.search(&vector, k, &filters.exclude_ids, filters.min_score)
    }

    /// "More like this": neighbours of a stored item, never the item itself.
    ///
    /// # Errors
    /// `NotFound` if the item is not in the Vector Store.
    pub fn recommend_similar(
        &self,
        item_id: ItemId,
        k: usize,
        filters: &RecommendFilters,
    ) -> CoreResult<Vec<SearchResult>> {
        let vector = self.store.get(item_id)?;
        let mut exclude = filters.exclude_ids.clone();
        exclude.insert(item_id);
        self.search(&vector, k, &exclude, filters.min_score)
    }

    /// Similarity of two texts under the index metric.
    ///
    /// Pure: the index is not consulted or modified.
    pub fn similarity(&self, text_a: &str, text_b: &str) -> CoreResult<Score> {
        reject_blank(text_a)?;
        reject_blank(text_b)?;
        let mut vectors = self.encoder.encode_batch(&[text_a, text_b])?.into_iter();
        let (Some(a), Some(b)) = (vectors.next(), vectors.next()) else {
            return Err(CoreError::EncodingFailed {
                reason: "encoder returned fewer vectors than texts".to_string(),
            });
        };
        let a = self.prepare(a)?;
        let b = self.prepare(b)?;
        if a == b {
            return Ok(Score::one());
        }
        Ok(Score::from_similarity(dot_product(&a, &b)))
    }

    /// Encodes text into a normalized query vector.
    pub fn encode(&self, text: &str) -> CoreResult<Vec<f32>> {
        reject_blank(text)?;
        let vector = self.encoder.encode(text)?;
        self.prepare(vector)
    }

    fn prepare(&self, vector: Vec<f32>) -> CoreResult<Vec<f32>> {
        self.index.dimension().validate_vector(&vector)?;
        validate_finite(&vector)?;
        Ok(match Normalization::Unit.apply(&vector)? {
            Some(normalized) => normalized,
            None => vector,
        })
    }

    fn search(
        &self,
        vector: &[f32],
        k: usize,
        exclude: &HashSet<ItemId>,
        min_score: Option<f32>,
    ) -> CoreResult<Vec<SearchResult>> {
        let results = self.index.search(vector, k, exclude)?;
        let Some(threshold) = min_score.or(self.default_min_score) else {
            return Ok(results);
        };
        Ok(results
            .into_iter()
            .filter(|result| result.score.get() >= threshold)
            .enumerate()
            .map(|(i, result)| SearchResult {
                rank: i + 1,
                ..result
            })
            .collect())
    }
}

fn reject_blank(text: &str) -> CoreResult<()> {
    if text.trim().is_empty() {
        return Err(CoreError::InvalidInput {
            reason: "query text is empty".to_string(),
        });
    }
    Ok(())
}
