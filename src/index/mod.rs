//! Approximate nearest-neighbour index over the Vector Store.
//!
//! The index is a derived, rebuildable view: an immutable [`IndexSnapshot`]
//! plus a small copy-on-write staging area. Both sit behind one `ArcSwap`,
//! so a search loads a consistent pair without taking a lock and keeps it
//! alive until it finishes, while writers and rebuilds publish new pairs.
//!
//! # Concurrency
//! - `search` never locks; it reads whatever view was current when it began
//! - `add` and `remove` serialize on a short writer lock that only guards
//!   the staging swap; the last committed store version wins regardless of
//!   arrival order
//! - at most one rebuild runs at a time; further triggers coalesce
//! - the snapshot is built outside the writer lock and rebased onto the
//!   staging that accumulated meanwhile when it is published

mod rebuild;
mod snapshot;
mod staging;
mod topk;

pub use rebuild::RebuildOutcome;
pub use snapshot::{IndexSnapshot, SnapshotParams};
pub use topk::{SearchResult, TopK};

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::error::{CoreError, CoreResult};
use crate::store::{IndexedItem, ItemsSnapshot, VectorStore};
use crate::vector::{ItemId, Score, VectorDimension, dot_product, validate_finite};

use rebuild::RebuildWorker;
use staging::{StaleReason, Staging};

/// Anything that can produce a point-in-time view of all items.
pub trait SnapshotSource: Send + Sync {
    fn iter_all(&self) -> ItemsSnapshot;
}

impl SnapshotSource for VectorStore {
    fn iter_all(&self) -> ItemsSnapshot {
        VectorStore::iter_all(self)
    }
}

/// Index tuning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexConfig {
    pub dimension: VectorDimension,
    /// Maximum staged vectors before an add forces a rebuild.
    pub staging_cap: usize,
    /// Rebuild once pending staging work exceeds this fraction of items.
    pub rebuild_fraction: f64,
    /// Never trigger a rebuild for less pending work than this.
    pub min_rebuild_staging: usize,
    pub linear_scan_threshold: usize,
    /// IVF partitions per snapshot; 0 picks roughly `sqrt(n)`.
    pub partitions: usize,
    /// Partitions probed per query.
    pub nprobe: usize,
    pub kmeans_seed: u64,
    pub max_kmeans_iterations: usize,
    /// Run the background worker and trigger policy.
    pub auto_rebuild: bool,
}

impl IndexConfig {
    /// Defaults for `dimension`.
    #[must_use]
    pub fn new(dimension: VectorDimension) -> Self {
        Self {
            dimension,
            staging_cap: 4096,
            rebuild_fraction: 0.05,
            min_rebuild_staging: 64,
            linear_scan_threshold: 2048,
            partitions: 0,
            nprobe: 8,
            kmeans_seed: 42,
            max_kmeans_iterations: 25,
            auto_rebuild: true,
        }
    }

    fn snapshot_params(&self) -> SnapshotParams {
        SnapshotParams {
            dimension: self.dimension,
            linear_scan_threshold: self.linear_scan_threshold,
            partitions: self.partitions,
            kmeans_seed: self.kmeans_seed,
            max_kmeans_iterations: self.max_kmeans_iterations,
        }
    }
}

/// Result of [`VectorIndex::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// The vector is searchable now.
    Staged,
    /// This exact version is already indexed.
    AlreadyIndexed,
    /// A newer version, or a delete, already won; nothing changed.
    Superseded,
}

/// Point-in-time index statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexStats {
    pub dimension: usize,
    pub snapshot_items: usize,
    pub staged_items: usize,
    pub tombstones: usize,
    pub live_items: usize,
    pub generation: u64,
    pub partitions: usize,
    pub last_rebuild_at: Option<DateTime<Utc>>,
    pub rebuild_in_flight: bool,
}

/// Snapshot and staging that are read together.
#[derive(Debug)]
struct IndexView {
    snapshot: Arc<IndexSnapshot>,
    staging: Arc<Staging>,
}

/// Incremental ANN index.
///
/// Construct with [`VectorIndex::new`]; the returned `Arc` is shared by
/// every caller and by the background rebuild worker.
pub struct VectorIndex {
    config: IndexConfig,
    source: Arc<dyn SnapshotSource>,
    view: ArcSwap<IndexView>,
    write_lock: Mutex<()>,
    rebuild_in_flight: AtomicBool,
    shutdown: AtomicBool,
    generation: AtomicU64,
    worker: Mutex<Option<RebuildWorker>>,
}

impl std::fmt::Debug for VectorIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorIndex")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl VectorIndex {
    /// Creates an empty index that rebuilds from `source`.
    ///
    /// With `auto_rebuild` set, a background worker thread is started.
    pub fn new(config: IndexConfig, source: Arc<dyn SnapshotSource>) -> CoreResult<Arc<Self>> {
        if !(0.0..=1.0).contains(&config.rebuild_fraction) {
            return Err(CoreError::Config {
                reason: format!(
                    "rebuild_fraction must be within [0, 1], got {}",
                    config.rebuild_fraction
                ),
            });
        }
        if config.staging_cap == 0 {
            return Err(CoreError::Config {
                reason: "staging_cap must be at least 1".to_string(),
            });
        }

        let index = Arc::new(Self {
            config,
            source,
            view: ArcSwap::from_pointee(IndexView {
                snapshot: Arc::new(IndexSnapshot::empty()),
                staging: Arc::new(Staging::default()),
            }),
            write_lock: Mutex::new(()),
            rebuild_in_flight: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            worker: Mutex::new(None),
        });

        if config.auto_rebuild {
            let worker = RebuildWorker::spawn(Arc::downgrade(&index))?;
            *index.worker.lock() = Some(worker);
        }

        Ok(index)
    }

    #[must_use]
    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    #[must_use]
    pub fn dimension(&self) -> VectorDimension {
        self.config.dimension
    }

    fn ensure_running(&self) -> CoreResult<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(CoreError::ServiceUnavailable {
                reason: "index is shut down".to_string(),
            });
        }
        Ok(())
    }

    /// Makes a committed item searchable.
    ///
    /// The vector must already be normalized by the store. Re-adding an item
    /// replaces its previous vector; an add carrying an older version than
    /// the index already holds is ignored.
    ///
    /// When staging is full a synchronous rebuild is forced once; if a
    /// rebuild is already in flight the add fails with `CapacityExceeded`.
    pub fn add(&self, item: &IndexedItem) -> CoreResult<AddOutcome> {
        self.ensure_running()?;
        self.config.dimension.validate_vector(&item.vector)?;

        let mut forced = false;
        loop {
            let staged = {
                let _guard = self.write_lock.lock();
                let view = self.view.load_full();

                match view
                    .staging
                    .check(item.item_id, item.version, &view.snapshot)
                {
                    Err(StaleReason::Current) => return Ok(AddOutcome::AlreadyIndexed),
                    Err(StaleReason::Superseded) => return Ok(AddOutcome::Superseded),
                    Ok(()) => {}
                }

                let full = !view.staging.contains(item.item_id)
                    && view.staging.len() >= self.config.staging_cap;
                if full {
                    None
                } else {
                    let staging =
                        view.staging
                            .with_entry(item.item_id, item.version, item.vector.clone());
                    let pending = staging.pending();
                    self.view.store(Arc::new(IndexView {
                        snapshot: Arc::clone(&view.snapshot),
                        staging: Arc::new(staging),
                    }));
                    Some((pending, view.snapshot.len()))
                }
            };

            if let Some((pending, snapshot_items)) = staged {
                self.maybe_trigger(pending, snapshot_items);
                return Ok(AddOutcome::Staged);
            }

            let staged_count = self.view.load().staging.len();
            if forced || !self.try_begin_rebuild() {
                return Err(CoreError::CapacityExceeded {
                    staged: staged_count,
                    cap: self.config.staging_cap,
                });
            }
            forced = true;

            tracing::warn!(
                "Staging full ({staged_count} entries); forcing a synchronous rebuild"
            );
            let outcome = self.rebuild_locked(self.source.as_ref());
            self.end_rebuild();
            if let RebuildOutcome::Abandoned = outcome? {
                return Err(CoreError::ServiceUnavailable {
                    reason: "rebuild abandoned during shutdown".to_string(),
                });
            }
        }
    }

    /// Records that every version of `item_id` up to `version` is deleted.
    ///
    /// Takes effect for searches immediately; the entry leaves the snapshot
    /// at the next rebuild.
    pub fn remove(&self, item_id: ItemId, version: u64) -> CoreResult<()> {
        self.ensure_running()?;
        let (pending, snapshot_items) = {
            let _guard = self.write_lock.lock();
            let view = self.view.load_full();
            let staging = view.staging.with_tombstone(item_id, version);
            let pending = staging.pending();
            self.view.store(Arc::new(IndexView {
                snapshot: Arc::clone(&view.snapshot),
                staging: Arc::new(staging),
            }));
            (pending, view.snapshot.len())
        };
        self.maybe_trigger(pending, snapshot_items);
        Ok(())
    }

    /// Version of `item_id` that searches currently serve, if any.
    #[must_use]
    pub fn indexed_version(&self, item_id: ItemId) -> Option<u64> {
        let view = self.view.load();
        if let Some(version) = view.staging.entry_version(item_id) {
            return Some(version);
        }
        view.snapshot
            .version_of(item_id)
            .filter(|&version| view.staging.snapshot_entry_visible(item_id, version))
    }

    /// Returns up to `k` items most similar to `query`, best first.
    ///
    /// Items in `exclude` are skipped before ranking, so they never take a
    /// slot. If `k` is at least the number of live items, every partition
    /// is scanned and all of them are returned.
    ///
    /// # Errors
    /// - `EmptyIndex` when nothing is indexed
    /// - `DimensionMismatch` / `InvalidVector` for a malformed query
    /// - `ServiceUnavailable` after shutdown
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        exclude: &HashSet<ItemId>,
    ) -> CoreResult<Vec<SearchResult>> {
        self.ensure_running()?;
        self.config.dimension.validate_vector(query)?;
        validate_finite(query)?;

        let view = self.view.load();
        let live = view.staging.live_count(&view.snapshot);
        if live == 0 {
            return Err(CoreError::EmptyIndex);
        }

        let nprobe = if k >= live {
            None
        } else {
            Some(self.config.nprobe)
        };

        let mut topk = TopK::new(k);
        let snapshot = &view.snapshot;
        let staging = &view.staging;
        for (item_id, entry) in staging.entries() {
            if !exclude.contains(item_id) {
                topk.push(
                    *item_id,
                    Score::from_similarity(dot_product(query, &entry.vector)),
                );
            }
        }
        // Probing widens past nprobe until k visible candidates are held.
        snapshot.scan(query, nprobe, |slot, similarity| {
            let item_id = snapshot.item_id(slot);
            if !exclude.contains(&item_id)
                && staging.snapshot_entry_visible(item_id, snapshot.version(slot))
            {
                topk.push(item_id, Score::from_similarity(similarity));
            }
            topk.is_full()
        });

        Ok(topk.into_results())
    }

    /// Rebuilds synchronously from the configured source.
    ///
    /// Returns `Coalesced` without doing anything if a rebuild is already
    /// in flight.
    pub fn rebuild(&self) -> CoreResult<RebuildOutcome> {
        self.rebuild_from(self.source.as_ref())
    }

    /// Rebuilds synchronously from an explicit source.
    pub fn rebuild_from(&self, source: &dyn SnapshotSource) -> CoreResult<RebuildOutcome> {
        self.ensure_running()?;
        if !self.try_begin_rebuild() {
            tracing::debug!("Rebuild requested while one is in flight; coalesced");
            return Ok(RebuildOutcome::Coalesced);
        }
        let outcome = self.rebuild_locked(source);
        self.end_rebuild();
        outcome
    }

    /// Schedules a background rebuild.
    ///
    /// Returns `false` if one was already in flight or no worker runs.
    pub fn request_rebuild(&self) -> bool {
        if self.shutdown.load(Ordering::Acquire) || !self.try_begin_rebuild() {
            return false;
        }
        let sent = self
            .worker
            .lock()
            .as_ref()
            .is_some_and(RebuildWorker::request);
        if !sent {
            self.end_rebuild();
        }
        sent
    }

    /// Entry point of the worker thread; the in-flight flag is held.
    pub(crate) fn run_background_rebuild(&self) {
        match self.rebuild_locked(self.source.as_ref()) {
            Ok(RebuildOutcome::Published {
                generation,
                items,
                elapsed,
                ..
            }) => {
                tracing::debug!(
                    "Background rebuild published generation {generation} ({items} items, {elapsed:?})"
                );
            }
            Ok(_) => {}
            Err(e) => tracing::error!("Background rebuild failed: {e}"),
        }
        self.end_rebuild();
    }

    fn try_begin_rebuild(&self) -> bool {
        self.rebuild_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn end_rebuild(&self) {
        self.rebuild_in_flight.store(false, Ordering::Release);
    }

    /// Builds and publishes a snapshot. The caller holds the in-flight flag.
    fn rebuild_locked(&self, source: &dyn SnapshotSource) -> CoreResult<RebuildOutcome> {
        let started = Instant::now();
        let items = source.iter_all();
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;

        tracing::info!("Rebuilding index generation {generation} from {} items", items.len());

        let Some(snapshot) = IndexSnapshot::build(
            &items,
            generation,
            &self.config.snapshot_params(),
            &self.shutdown,
        )?
        else {
            tracing::info!("Rebuild of generation {generation} abandoned");
            return Ok(RebuildOutcome::Abandoned);
        };

        let _guard = self.write_lock.lock();
        if self.shutdown.load(Ordering::Acquire) {
            tracing::info!("Rebuild of generation {generation} abandoned");
            return Ok(RebuildOutcome::Abandoned);
        }

        let current = self.view.load_full();
        let staging = current.staging.rebase(&snapshot);
        let outcome = RebuildOutcome::Published {
            generation,
            items: snapshot.len(),
            partitions: snapshot.partition_count(),
            elapsed: started.elapsed(),
        };
        tracing::info!(
            "Published index generation {generation}: {} items, {} partitions, {} still staged",
            snapshot.len(),
            snapshot.partition_count(),
            staging.pending()
        );
        self.view.store(Arc::new(IndexView {
            snapshot: Arc::new(snapshot),
            staging: Arc::new(staging),
        }));

        Ok(outcome)
    }

    fn maybe_trigger(&self, pending: usize, snapshot_items: usize) {
        if !self.config.auto_rebuild || pending < self.config.min_rebuild_staging {
            return;
        }
        let total = (snapshot_items + pending).max(1) as f64;
        if (pending as f64) / total > self.config.rebuild_fraction && self.request_rebuild() {
            tracing::debug!("Scheduled background rebuild ({pending} pending of {total})");
        }
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> IndexStats {
        let view = self.view.load();
        IndexStats {
            dimension: self.config.dimension.get(),
            snapshot_items: view.snapshot.len(),
            staged_items: view.staging.len(),
            tombstones: view.staging.tombstone_count(),
            live_items: view.staging.live_count(&view.snapshot),
            generation: view.snapshot.generation(),
            partitions: view.snapshot.partition_count(),
            last_rebuild_at: view.snapshot.built_at(),
            rebuild_in_flight: self.rebuild_in_flight.load(Ordering::Acquire),
        }
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Stops the index.
    ///
    /// An in-flight rebuild is abandoned and the worker thread joined.
    /// Searches and writes already running complete; later calls fail with
    /// `ServiceUnavailable`.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let worker = self.worker.lock().take();
        if let Some(mut worker) = worker {
            worker.stop();
        }
        tracing::info!("Index shut down");
    }
}

impl Drop for VectorIndex {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
    }
}
