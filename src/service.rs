//! Async facade over [`RecommendationCore`].
//!
//! Core operations are CPU-bound and synchronous, so each call runs on
//! tokio's blocking pool. A semaphore bounds how many run at once; callers
//! beyond that wait for a permit. Shutdown cancels waiting callers with
//! `ServiceUnavailable`, lets running calls finish, then stops the index.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::engine::RecommendationCore;
use crate::error::{CoreError, CoreResult};
use crate::index::SearchResult;
use crate::recommend::{Query, RecommendFilters};
use crate::sync::{CoordinatorStats, MetadataSource, SyncReport};
use crate::vector::{ItemId, Score};

fn unavailable() -> CoreError {
    CoreError::ServiceUnavailable {
        reason: "recommendation service is shutting down".to_string(),
    }
}

/// Bounded worker pool in front of a shared core.
#[derive(Debug, Clone)]
pub struct RecommendationService {
    core: Arc<RecommendationCore>,
    permits: Arc<Semaphore>,
    pool_size: usize,
    shutdown: CancellationToken,
}

impl RecommendationService {
    /// Serves `core` with at most `pool_size` concurrent calls.
    #[must_use]
    pub fn new(core: Arc<RecommendationCore>, pool_size: usize) -> Self {
        let pool_size = pool_size.clamp(1, Semaphore::MAX_PERMITS);
        Self {
            core,
            permits: Arc::new(Semaphore::new(pool_size)),
            pool_size,
            shutdown: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn core(&self) -> &Arc<RecommendationCore> {
        &self.core
    }

    #[must_use]
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    async fn run<T, F>(&self, op: F) -> CoreResult<T>
    where
        F: FnOnce(&RecommendationCore) -> CoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Err(unavailable()),
            permit = self.permits.clone().acquire_owned() => permit.map_err(|_| unavailable())?,
        };

        let core = self.core.clone();
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            op(&core)
        })
        .await
        .map_err(|e| CoreError::Internal {
            reason: format!("worker task failed: {e}"),
        })?
    }

    pub async fn ingest(&self, item_id: ItemId, text: String) -> CoreResult<u64> {
        self.run(move |core| core.ingest(item_id, &text)).await
    }

    pub async fn delete(&self, item_id: ItemId) -> CoreResult<bool> {
        self.run(move |core| core.delete(item_id)).await
    }

    pub async fn recommend_text(
        &self,
        text: String,
        k: usize,
        filters: RecommendFilters,
    ) -> CoreResult<Vec<SearchResult>> {
        self.run(move |core| core.recommend(Query::Text(&text), k, &filters))
            .await
    }

    pub async fn recommend_vector(
        &self,
        vector: Vec<f32>,
        k: usize,
        filters: RecommendFilters,
    ) -> CoreResult<Vec<SearchResult>> {
        self.run(move |core| core.recommend(Query::Vector(&vector), k, &filters))
            .await
    }

    pub async fn recommend_similar(
        &self,
        item_id: ItemId,
        k: usize,
        filters: RecommendFilters,
    ) -> CoreResult<Vec<SearchResult>> {
        self.run(move |core| core.recommend_similar(item_id, k, &filters))
            .await
    }

    pub async fn similarity(&self, text_a: String, text_b: String) -> CoreResult<Score> {
        self.run(move |core| core.similarity(&text_a, &text_b)).await
    }

    /// Drains a change feed on the worker pool.
    pub async fn sync_all(&self, source: Arc<dyn MetadataSource>) -> CoreResult<SyncReport> {
        self.run(move |core| core.sync_all(source.as_ref())).await
    }

    /// Tallies are read without a permit.
    #[must_use]
    pub fn stats(&self) -> CoordinatorStats {
        self.core.stats()
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stops accepting work and waits for running calls to finish.
    ///
    /// Callers still waiting for a permit fail with `ServiceUnavailable`.
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        debug!("Waiting for in-flight calls to finish");

        // Holding every permit means nothing is running.
        let all = u32::try_from(self.pool_size).unwrap_or(u32::MAX);
        if let Ok(permits) = self.permits.acquire_many(all).await {
            permits.forget();
        }
        self.permits.close();
        self.core.shutdown();
        info!("Recommendation service stopped");
    }
}
