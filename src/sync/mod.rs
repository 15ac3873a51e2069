//! Consistency coordinator: keeps the index in step with the metadata store.
//!
//! The coordinator drives each item through its lifecycle (see
//! [`ItemState`]), commits vectors to the Vector Store before scheduling
//! the index add, and pulls change feeds with a durable cursor so a
//! restart resumes where the last committed change left off.
//!
//! Encoding failures are logged and returned; the item's state is left
//! where it was so the orchestration layer can see it and retry.

mod cursor;
mod source;
mod state;

pub use cursor::{CursorStore, SyncCursor};
pub use source::{ChangeKind, ChangeRecord, JsonlSource, MemorySource, MetadataSource, Watermark};
pub use state::ItemState;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{CoreError, CoreResult};
use crate::index::{AddOutcome, VectorIndex};
use crate::store::{IndexedItem, VectorStore};
use crate::vector::{Encoder, ItemId};

use state::StateTallies;

/// Tallies exposed by [`ConsistencyCoordinator::stats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoordinatorStats {
    pub unindexed: usize,
    pub embedding: usize,
    pub indexed: usize,
    pub reindexing: usize,
    pub deleted: usize,
    /// Vectors staged but not yet folded into a snapshot.
    pub staging_size: usize,
    pub last_rebuild_at: Option<DateTime<Utc>>,
}

/// Result of one or more sync batches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub fetched: usize,
    pub upserted: usize,
    pub deleted: usize,
    pub batches: usize,
    /// Whether the last batch reached the end of the feed.
    pub drained: bool,
}

impl SyncReport {
    fn merge(&mut self, other: &SyncReport) {
        self.fetched += other.fetched;
        self.upserted += other.upserted;
        self.deleted += other.deleted;
        self.batches += other.batches;
        self.drained = other.drained;
    }
}

/// Reconciles the Vector Store and index against external notifications.
pub struct ConsistencyCoordinator {
    encoder: Arc<dyn Encoder>,
    store: Arc<VectorStore>,
    index: Arc<VectorIndex>,
    states: DashMap<ItemId, ItemState>,
    tallies: StateTallies,
    /// Committed versions the index refused; settled after a rebuild.
    stalled: DashMap<ItemId, u64>,
    cursors: Mutex<CursorStore>,
}

impl std::fmt::Debug for ConsistencyCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsistencyCoordinator")
            .field("tracked", &self.states.len())
            .field("model", &self.encoder.model_name())
            .finish()
    }
}

impl ConsistencyCoordinator {
    /// Creates a coordinator; every item already in the store is `Indexed`.
    pub fn new(
        encoder: Arc<dyn Encoder>,
        store: Arc<VectorStore>,
        index: Arc<VectorIndex>,
        cursors: CursorStore,
    ) -> Self {
        let coordinator = Self {
            encoder,
            store,
            index,
            states: DashMap::new(),
            tallies: StateTallies::default(),
            stalled: DashMap::new(),
            cursors: Mutex::new(cursors),
        };
        let existing = coordinator.store.iter_all();
        for item in &existing {
            coordinator.transition(item.item_id, ItemState::Indexed);
        }
        if !existing.is_empty() {
            debug!("Seeded {} indexed items from the vector store", existing.len());
        }
        coordinator
    }

    /// Moves `item_id` to `to`, returning its previous state.
    fn transition(&self, item_id: ItemId, to: ItemState) -> Option<ItemState> {
        match self.states.entry(item_id) {
            Entry::Occupied(mut entry) => {
                let from = *entry.get();
                entry.insert(to);
                self.tallies.record(Some(from), to);
                Some(from)
            }
            Entry::Vacant(entry) => {
                entry.insert(to);
                self.tallies.record(None, to);
                None
            }
        }
    }

    /// Moves a committed item out of its pending state.
    ///
    /// Runs under the item's map entry, so a concurrent `delete` either
    /// removes the vector before the store is checked or transitions
    /// after this does. Returns the new state, or `None` when a newer
    /// version owns the item or the index does not serve `version` yet.
    fn settle(&self, item_id: ItemId, version: u64) -> Option<ItemState> {
        let Entry::Occupied(mut entry) = self.states.entry(item_id) else {
            return None;
        };
        let to = match self.store.get_item(item_id).map(|item| item.version) {
            None => ItemState::Deleted,
            Some(stored)
                if stored == version && self.index.indexed_version(item_id) == Some(version) =>
            {
                ItemState::Indexed
            }
            Some(_) => return None,
        };
        let from = *entry.get();
        entry.insert(to);
        self.tallies.record(Some(from), to);
        Some(to)
    }

    /// Settles items whose vector was committed but never staged.
    ///
    /// Returns how many left their pending state.
    pub fn reconcile(&self) -> usize {
        let stalled: Vec<(ItemId, u64)> = self
            .stalled
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();
        let mut settled = 0;
        for (item_id, version) in stalled {
            let resolved = match self.settle(item_id, version) {
                Some(_) => {
                    settled += 1;
                    true
                }
                None => self
                    .store
                    .get_item(item_id)
                    .is_none_or(|item| item.version != version),
            };
            if resolved {
                self.stalled.remove_if(&item_id, |_, v| *v == version);
            }
        }
        if settled > 0 {
            debug!("Reconciled {settled} items after rebuild");
        }
        settled
    }

    fn ensure_running(&self) -> CoreResult<()> {
        if self.index.is_shut_down() {
            return Err(CoreError::ServiceUnavailable {
                reason: "coordinator is shutting down".to_string(),
            });
        }
        Ok(())
    }

    /// Current lifecycle state of `item_id`, if known.
    #[must_use]
    pub fn state(&self, item_id: ItemId) -> Option<ItemState> {
        self.states.get(&item_id).map(|state| *state)
    }

    /// Records an insert notification without embedding yet.
    ///
    /// Returns `false` if the item was already tracked.
    pub fn register(&self, item_id: ItemId) -> bool {
        match self.states.entry(item_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(ItemState::Unindexed);
                self.tallies.record(None, ItemState::Unindexed);
                true
            }
        }
    }

    /// Embeds `text` and commits it as the item's vector.
    ///
    /// Returns the committed version. On `EncodingFailed` the item stays
    /// `Unindexed` (first ingest) or `Reindexing` (content change).
    pub fn ingest(&self, item_id: ItemId, text: &str) -> CoreResult<u64> {
        self.ensure_running()?;
        if text.trim().is_empty() {
            return Err(CoreError::InvalidInput {
                reason: format!("item {item_id} has no text to embed"),
            });
        }

        // This ingest now owns the item's state.
        self.stalled.remove(&item_id);
        let (pending, on_failure) = match self.state(item_id) {
            Some(ItemState::Indexed | ItemState::Reindexing) => {
                (ItemState::Reindexing, ItemState::Reindexing)
            }
            _ => (ItemState::Embedding, ItemState::Unindexed),
        };
        self.transition(item_id, pending);

        let vector = match self.encoder.encode(text) {
            Ok(vector) => vector,
            Err(e) => {
                self.transition(item_id, on_failure);
                warn!("Encoding item {item_id} failed, left {on_failure}: {e}");
                return Err(e.into());
            }
        };

        let item = match self.store.put(item_id, &vector) {
            Ok(item) => item,
            Err(e) => {
                self.transition(item_id, on_failure);
                warn!("Committing item {item_id} failed, left {on_failure}: {e}");
                return Err(e.into());
            }
        };

        self.stage_committed(&item, pending)
    }

    /// Stages a committed vector and settles the item's state.
    ///
    /// The vector is durable; a failed add leaves the item `pending` until
    /// a rebuild picks it up from the store and `reconcile` settles it.
    fn stage_committed(&self, item: &IndexedItem, pending: ItemState) -> CoreResult<u64> {
        let item_id = item.item_id;
        match self.index.add(item) {
            Ok(AddOutcome::Staged | AddOutcome::AlreadyIndexed) => {}
            Ok(AddOutcome::Superseded) => {
                debug!(
                    "Item {item_id} v{} superseded before staging",
                    item.version
                );
            }
            Err(e) => {
                self.stalled.insert(item_id, item.version);
                warn!(
                    "Item {item_id} v{} committed but not staged, left {pending}: {e}",
                    item.version
                );
                return Err(e);
            }
        }

        match self.settle(item_id, item.version) {
            Some(state) => debug!("Item {item_id} v{} is {state}", item.version),
            None => debug!("Item {item_id} v{} overtaken by a newer version", item.version),
        }
        Ok(item.version)
    }

    /// Deletes `item_id` from the store and hides it from searches.
    ///
    /// Returns `false` if the coordinator had nothing for the item.
    pub fn delete(&self, item_id: ItemId) -> CoreResult<bool> {
        self.ensure_running()?;
        let removed = self.store.remove(item_id)?;
        if let Some(item) = &removed {
            self.index.remove(item_id, item.version)?;
        }

        let tracked = matches!(
            self.state(item_id),
            Some(state) if state != ItemState::Deleted
        );
        if removed.is_some() || tracked {
            self.transition(item_id, ItemState::Deleted);
            debug!("Deleted item {item_id}");
            return Ok(true);
        }
        Ok(false)
    }

    /// State tallies plus index staging figures.
    #[must_use]
    pub fn stats(&self) -> CoordinatorStats {
        if !self.stalled.is_empty() {
            self.reconcile();
        }
        let index = self.index.stats();
        CoordinatorStats {
            unindexed: self.tallies.get(ItemState::Unindexed),
            embedding: self.tallies.get(ItemState::Embedding),
            indexed: self.tallies.get(ItemState::Indexed),
            reindexing: self.tallies.get(ItemState::Reindexing),
            deleted: self.tallies.get(ItemState::Deleted),
            staging_size: index.staged_items,
            last_rebuild_at: index.last_rebuild_at,
        }
    }

    /// Current cursor for `source_name`.
    #[must_use]
    pub fn cursor(&self, source_name: &str) -> SyncCursor {
        self.cursors.lock().get(source_name)
    }

    /// Applies one batch of changes from `source`.
    ///
    /// The cursor advances past each change only after it is committed and
    /// is persisted at the end of the batch. The first failing change stops
    /// the batch with its error; the cursor stays before it so the next
    /// sync retries it.
    pub fn sync_once(
        &self,
        source: &dyn MetadataSource,
        batch_size: usize,
    ) -> CoreResult<SyncReport> {
        let batch_size = batch_size.max(1);
        let name = source.name().to_string();
        let mut cursor = self.cursor(&name);
        let records = source.changes_since(cursor.watermark(), batch_size)?;

        let mut report = SyncReport {
            fetched: records.len(),
            batches: 1,
            drained: records.len() < batch_size,
            ..SyncReport::default()
        };

        let mut failure = None;
        for record in &records {
            let applied = match &record.kind {
                ChangeKind::Upsert { text } => self.ingest(record.item_id, text).map(|_| {
                    report.upserted += 1;
                }),
                ChangeKind::Delete => self.delete(record.item_id).map(|_| {
                    report.deleted += 1;
                }),
            };
            match applied {
                Ok(()) => cursor.advance(record),
                Err(e) => {
                    failure = Some((record.item_id, e));
                    break;
                }
            }
        }

        let applied = report.upserted + report.deleted;
        if applied > 0 {
            self.cursors.lock().update(&name, cursor)?;
        }

        if let Some((item_id, e)) = failure {
            warn!(
                "Sync of '{name}' stopped at item {item_id} after {applied} changes: {e}"
            );
            return Err(e);
        }

        info!(
            "Synced {applied} changes from '{name}' ({} upserts, {} deletes)",
            report.upserted, report.deleted
        );
        Ok(report)
    }

    /// Applies batches until the feed is drained or a change fails.
    pub fn sync_all(
        &self,
        source: &dyn MetadataSource,
        batch_size: usize,
    ) -> CoreResult<SyncReport> {
        let mut total = SyncReport::default();
        loop {
            let report = self.sync_once(source, batch_size)?;
            total.merge(&report);
            if report.drained {
                return Ok(total);
            }
        }
    }
}
