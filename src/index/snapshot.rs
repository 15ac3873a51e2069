//! Immutable, queryable index snapshots.
//!
//! A snapshot is a slot table sorted by item id plus, above the linear-scan
//! threshold, an inverted file of K-means partitions. The slot table holds
//! shared handles to the store's vector buffers, never copies.
//!
//! Snapshots are built from an [`ItemsSnapshot`] and never change once
//! published, so any number of searches may read one concurrently.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};

use crate::error::{CoreError, CoreResult};
use crate::store::ItemsSnapshot;
use crate::vector::{
    EmbeddingVector, ItemId, KMeansParams, VectorDimension, dot_product, kmeans_clustering,
    nearest_centroids,
};

/// Build-time parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SnapshotParams {
    pub dimension: VectorDimension,
    /// Snapshots at or below this many items are searched exhaustively.
    pub linear_scan_threshold: usize,
    /// Partition count; 0 picks roughly `sqrt(n)`.
    pub partitions: usize,
    pub kmeans_seed: u64,
    pub max_kmeans_iterations: usize,
}

/// IVF partitions: centroids and the slots assigned to each.
#[derive(Debug)]
struct Partitions {
    centroids: Vec<Vec<f32>>,
    /// Slot numbers per partition, ascending.
    lists: Vec<Vec<u32>>,
}

/// Immutable search structure for one generation.
#[derive(Debug)]
pub struct IndexSnapshot {
    generation: u64,
    built_at: Option<DateTime<Utc>>,
    ids: Vec<ItemId>,
    versions: Vec<u64>,
    vectors: Vec<EmbeddingVector>,
    /// Last version of items deleted before the build, sorted by id.
    retired: Vec<(ItemId, u64)>,
    partitions: Option<Partitions>,
}

impl IndexSnapshot {
    /// The generation-0 snapshot every index starts from.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            generation: 0,
            built_at: None,
            ids: Vec::new(),
            versions: Vec::new(),
            vectors: Vec::new(),
            retired: Vec::new(),
            partitions: None,
        }
    }

    /// Builds a snapshot from `items`.
    ///
    /// Returns `Ok(None)` if `cancel` was raised during the build; the
    /// partial work is discarded. The same items and parameters always
    /// yield the same partitions.
    pub fn build(
        items: &ItemsSnapshot,
        generation: u64,
        params: &SnapshotParams,
        cancel: &AtomicBool,
    ) -> CoreResult<Option<Self>> {
        let started = Instant::now();
        let expected = params.dimension.get();

        let mut ids = Vec::with_capacity(items.len());
        let mut versions = Vec::with_capacity(items.len());
        let mut vectors = Vec::with_capacity(items.len());
        for item in items {
            if item.vector.dimension() != expected {
                return Err(CoreError::DimensionMismatch {
                    expected,
                    actual: item.vector.dimension(),
                });
            }
            ids.push(item.item_id);
            versions.push(item.version);
            vectors.push(item.vector.clone());
        }

        if cancel.load(Ordering::Acquire) {
            return Ok(None);
        }

        let partitions = match build_partitions(&vectors, params, cancel)? {
            PartitionBuild::Cancelled => return Ok(None),
            PartitionBuild::Flat => None,
            PartitionBuild::Built(partitions) => Some(partitions),
        };

        tracing::debug!(
            "Built snapshot generation {generation}: {} items, {} partitions in {:?}",
            ids.len(),
            partitions.as_ref().map(|p| p.centroids.len()).unwrap_or(0),
            started.elapsed()
        );

        Ok(Some(Self {
            generation,
            built_at: Some(Utc::now()),
            ids,
            versions,
            vectors,
            retired: items.retired().to_vec(),
            partitions,
        }))
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// When the snapshot was built; `None` for the initial empty snapshot.
    #[must_use]
    pub fn built_at(&self) -> Option<DateTime<Utc>> {
        self.built_at
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Number of IVF partitions, 0 when searched exhaustively.
    #[must_use]
    pub fn partition_count(&self) -> usize {
        self.partitions
            .as_ref()
            .map(|p| p.centroids.len())
            .unwrap_or(0)
    }

    /// Slot of `item_id` in the slot table.
    #[must_use]
    pub fn slot_of(&self, item_id: ItemId) -> Option<usize> {
        self.ids.binary_search(&item_id).ok()
    }

    /// Version of `item_id` held by this snapshot.
    #[must_use]
    pub fn version_of(&self, item_id: ItemId) -> Option<u64> {
        self.slot_of(item_id).map(|slot| self.versions[slot])
    }

    /// Highest version of `item_id` this snapshot knows about, live or
    /// deleted. Writes at or below it are stale.
    #[must_use]
    pub fn floor_version(&self, item_id: ItemId) -> Option<u64> {
        let retired = self
            .retired
            .binary_search_by_key(&item_id, |(id, _)| *id)
            .ok()
            .map(|i| self.retired[i].1);
        match (self.version_of(item_id), retired) {
            (Some(live), Some(dead)) => Some(live.max(dead)),
            (live, dead) => live.or(dead),
        }
    }

    #[must_use]
    pub fn item_id(&self, slot: usize) -> ItemId {
        self.ids[slot]
    }

    #[must_use]
    pub fn version(&self, slot: usize) -> u64 {
        self.versions[slot]
    }

    #[must_use]
    pub fn vector(&self, slot: usize) -> &EmbeddingVector {
        &self.vectors[slot]
    }

    /// Visits candidate slots with their inner product against `query`.
    ///
    /// With `nprobe = None`, or when the snapshot is unpartitioned, every
    /// slot is visited. Otherwise partitions are visited nearest centroid
    /// first: the `nprobe` closest always, then further ones until `visit`
    /// reports it has enough candidates or every partition has been seen.
    pub fn scan(
        &self,
        query: &[f32],
        nprobe: Option<usize>,
        mut visit: impl FnMut(usize, f32) -> bool,
    ) {
        match (&self.partitions, nprobe) {
            (Some(partitions), Some(nprobe)) if nprobe < partitions.centroids.len() => {
                let order =
                    nearest_centroids(query, &partitions.centroids, partitions.centroids.len());
                let mut satisfied = false;
                for (probed, cluster) in order.into_iter().enumerate() {
                    if probed >= nprobe.max(1) && satisfied {
                        break;
                    }
                    for &slot in &partitions.lists[cluster] {
                        let slot = slot as usize;
                        satisfied = visit(slot, dot_product(query, &self.vectors[slot]));
                    }
                }
            }
            _ => {
                for (slot, vector) in self.vectors.iter().enumerate() {
                    visit(slot, dot_product(query, vector));
                }
            }
        }
    }
}

enum PartitionBuild {
    Flat,
    Built(Partitions),
    Cancelled,
}

fn partition_count(n: usize, params: &SnapshotParams) -> usize {
    let requested = if params.partitions == 0 {
        (n as f64).sqrt().round() as usize
    } else {
        params.partitions
    };
    requested.min(n)
}

fn build_partitions(
    vectors: &[EmbeddingVector],
    params: &SnapshotParams,
    cancel: &AtomicBool,
) -> CoreResult<PartitionBuild> {
    let n = vectors.len();
    if n <= params.linear_scan_threshold {
        return Ok(PartitionBuild::Flat);
    }
    let k = partition_count(n, params);
    if k < 2 {
        return Ok(PartitionBuild::Flat);
    }

    let refs: Vec<&[f32]> = vectors.iter().map(EmbeddingVector::as_slice).collect();
    let result = kmeans_clustering(
        &refs,
        KMeansParams {
            k,
            max_iterations: params.max_kmeans_iterations,
            seed: params.kmeans_seed,
        },
    )?;

    if cancel.load(Ordering::Acquire) {
        return Ok(PartitionBuild::Cancelled);
    }

    let mut lists = vec![Vec::new(); result.centroids.len()];
    for (slot, &cluster) in result.assignments.iter().enumerate() {
        let slot = u32::try_from(slot).map_err(|_| CoreError::Internal {
            reason: format!("snapshot slot {slot} exceeds u32 range"),
        })?;
        lists[cluster].push(slot);
    }

    Ok(PartitionBuild::Built(Partitions {
        centroids: result.centroids,
        lists,
    }))
}
