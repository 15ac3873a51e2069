//! Owned composition of the recommendation core.
//!
//! [`RecommendationCore`] wires the Vector Store, index, recommender and
//! coordinator together. It is an ordinary value, not a global, so several
//! independent cores (one per tenant, one per test) can coexist.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::config::Settings;
use crate::error::{CoreError, CoreResult};
use crate::index::{IndexConfig, IndexStats, RebuildOutcome, SearchResult, VectorIndex};
use crate::recommend::{Query, RecommendFilters, Recommender};
use crate::store::VectorStore;
use crate::sync::{
    ConsistencyCoordinator, CoordinatorStats, CursorStore, ItemState, MetadataSource, SyncReport,
};
use crate::vector::{Encoder, ItemId, Normalization, Score};

/// Combined statistics for the CLI and operators.
#[derive(Debug, Clone, Serialize)]
pub struct CoreStats {
    pub model: String,
    pub durable: bool,
    pub stored_items: usize,
    pub log_records: u64,
    pub items: CoordinatorStats,
    pub index: IndexStats,
}

/// The recommendation core: ingest, recommend, similarity, delete, stats.
pub struct RecommendationCore {
    encoder: Arc<dyn Encoder>,
    store: Arc<VectorStore>,
    index: Arc<VectorIndex>,
    recommender: Recommender,
    coordinator: ConsistencyCoordinator,
    default_k: usize,
    sync_batch_size: usize,
}

impl std::fmt::Debug for RecommendationCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecommendationCore")
            .field("model", &self.encoder.model_name())
            .field("items", &self.store.len())
            .field("durable", &self.store.is_durable())
            .finish()
    }
}

impl RecommendationCore {
    /// Opens a durable core under `settings.data_dir()`.
    ///
    /// The vector log is replayed, every stored item is seeded as `Indexed`
    /// and the index is rebuilt from the store before this returns.
    pub fn open(settings: &Settings, encoder: Arc<dyn Encoder>) -> CoreResult<Self> {
        let config = settings.index.to_index_config()?;
        let data_dir = settings.data_dir();
        let store = VectorStore::open(
            &data_dir,
            config.dimension,
            Normalization::Unit,
            settings.storage.to_store_options(),
        )?;
        let cursors = CursorStore::load(settings.cursor_path())?;

        let core = Self::assemble(
            Arc::new(store),
            config,
            encoder,
            cursors,
            settings.recommend.min_score,
        )?
        .with_defaults(settings.recommend.default_k, settings.sync.batch_size);

        info!(
            "Opened recommendation core at {} with {} items",
            data_dir.display(),
            core.store.len()
        );
        Ok(core)
    }

    /// Creates a core that keeps everything in memory.
    pub fn in_memory(config: IndexConfig, encoder: Arc<dyn Encoder>) -> CoreResult<Self> {
        let store = VectorStore::in_memory(config.dimension, Normalization::Unit);
        Self::assemble(
            Arc::new(store),
            config,
            encoder,
            CursorStore::in_memory(),
            None,
        )
    }

    /// Builds a core around an existing store.
    pub fn assemble(
        store: Arc<VectorStore>,
        config: IndexConfig,
        encoder: Arc<dyn Encoder>,
        cursors: CursorStore,
        min_score: Option<f32>,
    ) -> CoreResult<Self> {
        if store.dimension() != config.dimension {
            return Err(CoreError::DimensionMismatch {
                expected: config.dimension.get(),
                actual: store.dimension().get(),
            });
        }
        let index = VectorIndex::new(config, store.clone())?;
        let recommender = Recommender::new(encoder.clone(), index.clone(), store.clone(), min_score)?;
        let coordinator =
            ConsistencyCoordinator::new(encoder.clone(), store.clone(), index.clone(), cursors);

        if !store.is_empty() {
            index.rebuild()?;
        }

        Ok(Self {
            encoder,
            store,
            index,
            recommender,
            coordinator,
            default_k: crate::config::RecommendSettings::default().default_k,
            sync_batch_size: crate::config::SyncSettings::default().batch_size,
        })
    }

    #[must_use]
    pub fn with_defaults(mut self, default_k: usize, sync_batch_size: usize) -> Self {
        self.default_k = default_k.max(1);
        self.sync_batch_size = sync_batch_size.max(1);
        self
    }

    /// Results returned when the caller gives no `k`.
    #[must_use]
    pub fn default_k(&self) -> usize {
        self.default_k
    }

    /// Embeds `text` and makes it searchable under `item_id`.
    ///
    /// Returns the committed store version.
    pub fn ingest(&self, item_id: ItemId, text: &str) -> CoreResult<u64> {
        self.coordinator.ingest(item_id, text)
    }

    /// Records an insert notification without embedding yet.
    pub fn register(&self, item_id: ItemId) -> bool {
        self.coordinator.register(item_id)
    }

    /// Removes `item_id`; `false` if it was not stored.
    pub fn delete(&self, item_id: ItemId) -> CoreResult<bool> {
        self.coordinator.delete(item_id)
    }

    /// Ranked neighbours of a text or vector query.
    pub fn recommend(
        &self,
        query: Query<'_>,
        k: usize,
        filters: &RecommendFilters,
    ) -> CoreResult<Vec<SearchResult>> {
        self.recommender.recommend(query, k, filters)
    }

    /// Neighbours of a stored item, excluding the item itself.
    pub fn recommend_similar(
        &self,
        item_id: ItemId,
        k: usize,
        filters: &RecommendFilters,
    ) -> CoreResult<Vec<SearchResult>> {
        self.recommender.recommend_similar(item_id, k, filters)
    }

    /// Pairwise similarity of two texts; never touches the index.
    pub fn similarity(&self, text_a: &str, text_b: &str) -> CoreResult<Score> {
        self.recommender.similarity(text_a, text_b)
    }

    #[must_use]
    pub fn state(&self, item_id: ItemId) -> Option<ItemState> {
        self.coordinator.state(item_id)
    }

    /// Per-state counts plus staging size and last rebuild time.
    #[must_use]
    pub fn stats(&self) -> CoordinatorStats {
        self.coordinator.stats()
    }

    /// Everything an operator might want to see.
    #[must_use]
    pub fn full_stats(&self) -> CoreStats {
        CoreStats {
            model: self.encoder.model_name().to_string(),
            durable: self.store.is_durable(),
            stored_items: self.store.len(),
            log_records: self.store.log_records(),
            items: self.coordinator.stats(),
            index: self.index.stats(),
        }
    }

    /// Synchronous rebuild; coalesces with one already in flight.
    ///
    /// Items committed while the index refused them settle afterwards.
    pub fn rebuild(&self) -> CoreResult<RebuildOutcome> {
        let outcome = self.index.rebuild()?;
        if let RebuildOutcome::Published { .. } = outcome {
            self.coordinator.reconcile();
        }
        Ok(outcome)
    }

    /// Rewrites the vector log without dead records.
    pub fn compact(&self) -> CoreResult<bool> {
        Ok(self.store.compact()?)
    }

    /// One batch from `source` using the configured batch size.
    pub fn sync_once(&self, source: &dyn MetadataSource) -> CoreResult<SyncReport> {
        self.coordinator.sync_once(source, self.sync_batch_size)
    }

    /// Drains `source` using the configured batch size.
    pub fn sync_all(&self, source: &dyn MetadataSource) -> CoreResult<SyncReport> {
        self.coordinator.sync_all(source, self.sync_batch_size)
    }

    #[must_use]
    pub fn encoder(&self) -> &Arc<dyn Encoder> {
        &self.encoder
    }

    #[must_use]
    pub fn store(&self) -> &Arc<VectorStore> {
        &self.store
    }

    #[must_use]
    pub fn index(&self) -> &Arc<VectorIndex> {
        &self.index
    }

    #[must_use]
    pub fn coordinator(&self) -> &ConsistencyCoordinator {
        &self.coordinator
    }

    /// Abandons any in-flight rebuild and refuses further index work.
    pub fn shutdown(&self) {
        self.index.shutdown();
    }
}

impl Drop for RecommendationCore {
    fn drop(&mut self) {
        self.index.shutdown();
    }
}
