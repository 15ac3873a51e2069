//! Staging area for writes not yet folded into a snapshot.
//!
//! Staging holds the newest staged vector per item plus tombstones. It is
//! replaced wholesale on every write (copy-on-write), so a search holding
//! an older staging sees a consistent, if slightly stale, view.
//!
//! Visibility against a snapshot `S`:
//! - a snapshot entry `(id, v)` is hidden if staging holds a newer vector
//!   for `id` or a tombstone `>= v`
//! - a staged entry is always visible; tombstones remove older staged
//!   entries when they are recorded

use std::collections::HashMap;

use crate::index::snapshot::IndexSnapshot;
use crate::vector::{EmbeddingVector, ItemId};

#[derive(Debug, Clone)]
pub(crate) struct StagedEntry {
    pub version: u64,
    pub vector: EmbeddingVector,
}

/// Why an add was not staged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StaleReason {
    /// The same version is already indexed.
    Current,
    /// A newer version or a covering tombstone exists.
    Superseded,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Staging {
    entries: HashMap<ItemId, StagedEntry>,
    /// Item id to highest deleted version.
    tombstones: HashMap<ItemId, u64>,
}

impl Staging {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    /// Entries plus tombstones: the work a rebuild would fold in.
    pub fn pending(&self) -> usize {
        self.entries.len() + self.tombstones.len()
    }

    pub fn contains(&self, item_id: ItemId) -> bool {
        self.entries.contains_key(&item_id)
    }

    pub fn entry_version(&self, item_id: ItemId) -> Option<u64> {
        self.entries.get(&item_id).map(|entry| entry.version)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&ItemId, &StagedEntry)> {
        self.entries.iter()
    }

    /// Decides whether `(item_id, version)` may be staged.
    pub fn check(
        &self,
        item_id: ItemId,
        version: u64,
        snapshot: &IndexSnapshot,
    ) -> Result<(), StaleReason> {
        if self.tombstones.get(&item_id).is_some_and(|&t| t >= version) {
            return Err(StaleReason::Superseded);
        }
        let newest = self
            .entries
            .get(&item_id)
            .map(|e| e.version)
            .or_else(|| snapshot.floor_version(item_id));
        match newest {
            Some(existing) if existing > version => Err(StaleReason::Superseded),
            Some(existing) if existing == version => {
                // An equal retired version means the item was deleted.
                if snapshot.version_of(item_id) == Some(version) || self.contains(item_id) {
                    Err(StaleReason::Current)
                } else {
                    Err(StaleReason::Superseded)
                }
            }
            _ => Ok(()),
        }
    }

    /// Returns a copy with `item_id` staged at `version`.
    ///
    /// Callers run [`Staging::check`] first.
    pub fn with_entry(&self, item_id: ItemId, version: u64, vector: EmbeddingVector) -> Self {
        let mut next = self.clone();
        next.entries.insert(item_id, StagedEntry { version, vector });
        if next.tombstones.get(&item_id).is_some_and(|&t| t < version) {
            next.tombstones.remove(&item_id);
        }
        next
    }

    /// Returns a copy with a tombstone for everything up to `version`.
    pub fn with_tombstone(&self, item_id: ItemId, version: u64) -> Self {
        let mut next = self.clone();
        let tombstone = next.tombstones.entry(item_id).or_insert(version);
        *tombstone = (*tombstone).max(version);
        let floor = *tombstone;
        if next.entries.get(&item_id).is_some_and(|e| e.version <= floor) {
            next.entries.remove(&item_id);
        }
        next
    }

    /// Whether the snapshot entry at `slot` should be served.
    pub fn snapshot_entry_visible(&self, item_id: ItemId, version: u64) -> bool {
        if self.entries.contains_key(&item_id) {
            return false;
        }
        !self.tombstones.get(&item_id).is_some_and(|&t| t >= version)
    }

    /// Items visible through `snapshot` combined with this staging.
    pub fn live_count(&self, snapshot: &IndexSnapshot) -> usize {
        let mut live = snapshot.len();
        for item_id in self.entries.keys() {
            if snapshot.slot_of(*item_id).is_none() {
                live += 1;
            }
        }
        for (item_id, &tombstone) in &self.tombstones {
            if self.entries.contains_key(item_id) {
                continue;
            }
            if snapshot.version_of(*item_id).is_some_and(|v| v <= tombstone) {
                live -= 1;
            }
        }
        live
    }

    /// Carries staging over to a freshly built snapshot.
    ///
    /// Staged entries the snapshot already covers are dropped; tombstones
    /// survive only while the snapshot still serves a version they hide.
    pub fn rebase(&self, snapshot: &IndexSnapshot) -> Self {
        let entries = self
            .entries
            .iter()
            .filter(|(id, entry)| {
                snapshot
                    .floor_version(**id)
                    .is_none_or(|floor| floor < entry.version)
            })
            .map(|(id, entry)| (*id, entry.clone()))
            .collect();
        let tombstones = self
            .tombstones
            .iter()
            .filter(|(id, tombstone)| {
                snapshot
                    .version_of(**id)
                    .is_some_and(|version| version <= **tombstone)
            })
            .map(|(id, tombstone)| (*id, *tombstone))
            .collect();
        Self {
            entries,
            tombstones,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::snapshot::SnapshotParams;
    use crate::store::{IndexedItem, ItemsSnapshot};
    use crate::vector::VectorDimension;
    use chrono::Utc;
    use std::sync::atomic::AtomicBool;

    fn id(n: u64) -> ItemId {
        ItemId::new(n).unwrap()
    }

    fn vector() -> EmbeddingVector {
        EmbeddingVector::new(vec![1.0, 0.0])
    }

    fn snapshot_with(items: &[(u64, u64)], retired: &[(u64, u64)]) -> IndexSnapshot {
        let items = items
            .iter()
            .map(|&(n, version)| IndexedItem {
                item_id: id(n),
                vector: vector(),
                version,
                inserted_at: Utc::now(),
            })
            .collect();
        let retired = retired.iter().map(|&(n, v)| (id(n), v)).collect();
        let params = SnapshotParams {
            dimension: VectorDimension::new(2).unwrap(),
            linear_scan_threshold: 1000,
            partitions: 0,
            kmeans_seed: 1,
            max_kmeans_iterations: 10,
        };
        IndexSnapshot::build(
            &ItemsSnapshot::new(items, retired),
            1,
            &params,
            &AtomicBool::new(false),
        )
        .unwrap()
        .unwrap()
    }

    #[test]
    fn test_check_rejects_stale_versions() {
        let snapshot = snapshot_with(&[(1, 3)], &[(2, 5)]);
        let staging = Staging::default();

        assert_eq!(staging.check(id(1), 3, &snapshot), Err(StaleReason::Current));
        assert_eq!(staging.check(id(1), 2, &snapshot), Err(StaleReason::Superseded));
        assert_eq!(staging.check(id(1), 4, &snapshot), Ok(()));
        // Deleted at version 5 before the build.
        assert_eq!(staging.check(id(2), 5, &snapshot), Err(StaleReason::Superseded));
        assert_eq!(staging.check(id(2), 6, &snapshot), Ok(()));

        let staging = staging.with_tombstone(id(3), 2);
        assert_eq!(staging.check(id(3), 2, &snapshot), Err(StaleReason::Superseded));
        assert_eq!(staging.check(id(3), 3, &snapshot), Ok(()));
    }

    #[test]
    fn test_newer_entry_hides_snapshot_entry() {
        let snapshot = snapshot_with(&[(1, 1)], &[]);
        let staging = Staging::default().with_entry(id(1), 2, vector());
        assert!(!staging.snapshot_entry_visible(id(1), 1));
        assert_eq!(staging.live_count(&snapshot), 1);
    }

    #[test]
    fn test_tombstone_hides_and_removes() {
        let snapshot = snapshot_with(&[(1, 1), (2, 1)], &[]);
        let staging = Staging::default()
            .with_entry(id(3), 1, vector())
            .with_tombstone(id(1), 1)
            .with_tombstone(id(3), 1);

        assert!(!staging.snapshot_entry_visible(id(1), 1));
        assert!(staging.snapshot_entry_visible(id(2), 1));
        assert!(!staging.contains(id(3)));
        assert_eq!(staging.live_count(&snapshot), 1);
    }

    #[test]
    fn test_readd_after_tombstone_clears_it() {
        let staging = Staging::default()
            .with_tombstone(id(1), 1)
            .with_entry(id(1), 2, vector());
        assert_eq!(staging.tombstone_count(), 0);
        assert_eq!(staging.len(), 1);
    }

    #[test]
    fn test_rebase_drops_covered_work() {
        let staging = Staging::default()
            .with_entry(id(1), 2, vector())
            .with_entry(id(2), 1, vector())
            .with_tombstone(id(3), 1)
            .with_tombstone(id(4), 1);

        // Item 1 at v2 and the delete of 4 were captured; 2 at v1 was not,
        // and 3 was still live at v1 when the build read the store.
        let rebuilt = snapshot_with(&[(1, 2), (3, 1)], &[(4, 1)]);
        let rebased = staging.rebase(&rebuilt);

        assert!(!rebased.contains(id(1)));
        assert!(rebased.contains(id(2)));
        assert_eq!(rebased.tombstone_count(), 1);
        assert!(!rebased.snapshot_entry_visible(id(3), 1));
        assert_eq!(rebased.live_count(&rebuilt), 2);
    }
}
