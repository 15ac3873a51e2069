//! The Vector Store: single owner of embedding vectors.
//!
//! Every other component holds clones of the store's shared buffers and
//! never writes vectors back. `put` is the only mutation path that creates
//! or replaces a vector; it validates shape, applies the normalization
//! policy, assigns the next version and, when backed by a [`VectorLog`],
//! makes the write durable before it becomes visible.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::vector::{
    EmbeddingVector, ItemId, LogEntry, Normalization, ReplayRecord, VectorDimension, VectorError,
    VectorLog, VectorStorageError, validate_finite,
};

/// Below this many log records compaction is never worth the rewrite.
const MIN_COMPACT_RECORDS: u64 = 256;

/// A vector committed to the store.
///
/// Cloning is cheap: the vector is a shared buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedItem {
    pub item_id: ItemId,
    pub vector: EmbeddingVector,
    /// Strictly increasing per item, including across deletes.
    pub version: u64,
    pub inserted_at: DateTime<Utc>,
}

/// Options for a durable store.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StoreOptions {
    /// `sync_data` after every append.
    pub fsync: bool,
    /// Compact once dead records exceed this fraction of the log.
    pub compact_ratio: f64,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            fsync: false,
            compact_ratio: 0.5,
        }
    }
}

/// Point-in-time view of the store's contents, sorted by item id.
///
/// Taking the view copies only `Arc` handles. Iteration can be restarted
/// any number of times and never observes puts made after the view was
/// taken.
///
/// The view also carries the last version of every deleted item so that
/// consumers can tell a late write for a deleted version from a new one.
#[derive(Debug, Clone)]
pub struct ItemsSnapshot {
    items: Arc<[IndexedItem]>,
    retired: Arc<[(ItemId, u64)]>,
}

impl ItemsSnapshot {
    /// Builds a view from arbitrary items.
    ///
    /// Items are sorted by id; when an id repeats, the highest version wins.
    #[must_use]
    pub fn new(mut items: Vec<IndexedItem>, mut retired: Vec<(ItemId, u64)>) -> Self {
        items.sort_by(|a, b| a.item_id.cmp(&b.item_id).then(b.version.cmp(&a.version)));
        items.dedup_by_key(|item| item.item_id);
        retired.sort_unstable_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));
        retired.dedup_by_key(|(id, _)| *id);
        Self {
            items: items.into(),
            retired: retired.into(),
        }
    }

    /// Deleted items and the version each had when deleted, sorted by id.
    #[must_use]
    pub fn retired(&self) -> &[(ItemId, u64)] {
        &self.retired
    }

    pub fn iter(&self) -> std::slice::Iter<'_, IndexedItem> {
        self.items.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<'a> IntoIterator for &'a ItemsSnapshot {
    type Item = &'a IndexedItem;
    type IntoIter = std::slice::Iter<'a, IndexedItem>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

/// Version and time of a deleted item's last vector.
#[derive(Debug, Clone, Copy)]
struct Retired {
    version: u64,
    deleted_at_ms: i64,
}

#[derive(Debug, Default)]
struct StoreState {
    items: HashMap<ItemId, IndexedItem>,
    retired: HashMap<ItemId, Retired>,
    log: Option<VectorLog>,
}

impl StoreState {
    fn next_version(&self, item_id: ItemId) -> u64 {
        let current = self
            .items
            .get(&item_id)
            .map(|item| item.version)
            .or_else(|| self.retired.get(&item_id).map(|r| r.version))
            .unwrap_or(0);
        current + 1
    }

    fn apply(&mut self, record: ReplayRecord) {
        match record {
            ReplayRecord::Put {
                item_id,
                version,
                inserted_at_ms,
                vector,
            } => {
                self.retired.remove(&item_id);
                self.items.insert(
                    item_id,
                    IndexedItem {
                        item_id,
                        vector: EmbeddingVector::new(vector),
                        version,
                        inserted_at: DateTime::from_timestamp_millis(inserted_at_ms)
                            .unwrap_or_default(),
                    },
                );
            }
            ReplayRecord::Delete {
                item_id,
                version,
                deleted_at_ms,
            } => {
                self.items.remove(&item_id);
                self.retired.insert(
                    item_id,
                    Retired {
                        version,
                        deleted_at_ms,
                    },
                );
            }
        }
    }

    fn live_records(&self) -> u64 {
        (self.items.len() + self.retired.len()) as u64
    }

    fn compact(&mut self) -> Result<bool, VectorStorageError> {
        let Self {
            items,
            retired,
            log,
        } = self;
        let Some(log) = log.as_mut() else {
            return Ok(false);
        };

        let mut puts: Vec<&IndexedItem> = items.values().collect();
        puts.sort_by_key(|item| item.item_id);
        let mut deletes: Vec<(&ItemId, &Retired)> = retired.iter().collect();
        deletes.sort_by_key(|(id, _)| **id);

        let entries = puts
            .into_iter()
            .map(|item| LogEntry::Put {
                item_id: item.item_id,
                version: item.version,
                inserted_at_ms: item.inserted_at.timestamp_millis(),
                vector: item.vector.as_slice(),
            })
            .chain(deletes.into_iter().map(|(id, r)| LogEntry::Delete {
                item_id: *id,
                version: r.version,
                deleted_at_ms: r.deleted_at_ms,
            }));
        log.compact(entries)?;
        Ok(true)
    }
}

/// In-memory map of item vectors, optionally backed by a durable log.
#[derive(Debug)]
pub struct VectorStore {
    dimension: VectorDimension,
    normalization: Normalization,
    options: StoreOptions,
    state: RwLock<StoreState>,
}

impl VectorStore {
    /// Creates a store that keeps everything in memory.
    #[must_use]
    pub fn in_memory(dimension: VectorDimension, normalization: Normalization) -> Self {
        Self {
            dimension,
            normalization,
            options: StoreOptions::default(),
            state: RwLock::new(StoreState::default()),
        }
    }

    /// Opens a durable store in `dir`, replaying any existing log.
    pub fn open(
        dir: impl AsRef<Path>,
        dimension: VectorDimension,
        normalization: Normalization,
        options: StoreOptions,
    ) -> Result<Self, VectorStorageError> {
        let (log, records) = VectorLog::open(dir, dimension, options.fsync)?;

        let mut state = StoreState::default();
        for record in records {
            state.apply(record);
        }
        tracing::info!(
            "Opened vector store at {}: {} items, {} deleted",
            log.path().display(),
            state.items.len(),
            state.retired.len()
        );
        state.log = Some(log);

        Ok(Self {
            dimension,
            normalization,
            options,
            state: RwLock::new(state),
        })
    }

    /// Stores `vector` for `item_id`, replacing any prior vector.
    ///
    /// Returns the committed item carrying its new version.
    ///
    /// # Errors
    /// - `DimensionMismatch` if the vector has the wrong length
    /// - `InvalidVector` if a component is not finite or the vector is zero
    ///   under unit normalization
    /// - `Storage` if the durable append fails; the store is unchanged
    pub fn put(&self, item_id: ItemId, vector: &[f32]) -> Result<IndexedItem, VectorError> {
        self.dimension.validate_vector(vector)?;
        validate_finite(vector)?;
        let components = match self.normalization.apply(vector)? {
            Some(normalized) => normalized,
            None => vector.to_vec(),
        };
        let vector = EmbeddingVector::new(components);

        let mut state = self.state.write();
        let version = state.next_version(item_id);
        let inserted_at = Utc::now();

        if let Some(log) = state.log.as_mut() {
            log.append_put(item_id, version, inserted_at.timestamp_millis(), &vector)?;
        }

        let item = IndexedItem {
            item_id,
            vector,
            version,
            inserted_at,
        };
        state.retired.remove(&item_id);
        state.items.insert(item_id, item.clone());
        self.maybe_compact(&mut state);

        Ok(item)
    }

    /// Returns the stored vector for `item_id`.
    pub fn get(&self, item_id: ItemId) -> Result<EmbeddingVector, VectorError> {
        self.state
            .read()
            .items
            .get(&item_id)
            .map(|item| item.vector.clone())
            .ok_or(VectorError::NotFound(item_id))
    }

    /// Returns the full committed item, if present.
    #[must_use]
    pub fn get_item(&self, item_id: ItemId) -> Option<IndexedItem> {
        self.state.read().items.get(&item_id).cloned()
    }

    #[must_use]
    pub fn contains(&self, item_id: ItemId) -> bool {
        self.state.read().items.contains_key(&item_id)
    }

    /// Deletes `item_id`. Returns `false` if it was absent.
    pub fn delete(&self, item_id: ItemId) -> Result<bool, VectorError> {
        Ok(self.remove(item_id)?.is_some())
    }

    /// Deletes `item_id` and returns the item that was removed.
    ///
    /// The removed version is remembered so a later `put` continues the
    /// version sequence instead of restarting it.
    pub fn remove(&self, item_id: ItemId) -> Result<Option<IndexedItem>, VectorError> {
        let mut state = self.state.write();
        let Some(version) = state.items.get(&item_id).map(|item| item.version) else {
            return Ok(None);
        };

        let deleted_at_ms = Utc::now().timestamp_millis();
        if let Some(log) = state.log.as_mut() {
            log.append_delete(item_id, version, deleted_at_ms)?;
        }

        let removed = state.items.remove(&item_id);
        state.retired.insert(
            item_id,
            Retired {
                version,
                deleted_at_ms,
            },
        );
        self.maybe_compact(&mut state);
        Ok(removed)
    }

    /// Last version a deleted item had, if the item is currently deleted.
    #[must_use]
    pub fn retired_version(&self, item_id: ItemId) -> Option<u64> {
        self.state.read().retired.get(&item_id).map(|r| r.version)
    }

    /// Takes a point-in-time view of every stored item, sorted by id.
    #[must_use]
    pub fn iter_all(&self) -> ItemsSnapshot {
        let state = self.state.read();
        let items: Vec<IndexedItem> = state.items.values().cloned().collect();
        let retired: Vec<(ItemId, u64)> = state
            .retired
            .iter()
            .map(|(id, r)| (*id, r.version))
            .collect();
        drop(state);
        ItemsSnapshot::new(items, retired)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.read().items.is_empty()
    }

    #[must_use]
    pub fn dimension(&self) -> VectorDimension {
        self.dimension
    }

    #[must_use]
    pub fn normalization(&self) -> Normalization {
        self.normalization
    }

    #[must_use]
    pub fn is_durable(&self) -> bool {
        self.state.read().log.is_some()
    }

    /// Number of records in the durable log, or 0 for an in-memory store.
    #[must_use]
    pub fn log_records(&self) -> u64 {
        self.state
            .read()
            .log
            .as_ref()
            .map(VectorLog::record_count)
            .unwrap_or(0)
    }

    /// Rewrites the durable log to hold only live state.
    ///
    /// Returns `false` for an in-memory store.
    pub fn compact(&self) -> Result<bool, VectorError> {
        Ok(self.state.write().compact()?)
    }

    fn maybe_compact(&self, state: &mut StoreState) {
        let Some(total) = state.log.as_ref().map(VectorLog::record_count) else {
            return;
        };
        if total < MIN_COMPACT_RECORDS {
            return;
        }
        let dead = total.saturating_sub(state.live_records());
        if (dead as f64) / (total as f64) <= self.options.compact_ratio {
            return;
        }
        // The triggering write is already durable; a failed rewrite only
        // leaves the old log in place.
        if let Err(e) = state.compact() {
            tracing::warn!("Automatic log compaction failed: {e}");
        }
    }
}
