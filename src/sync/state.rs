//! Per-item lifecycle states and their running tallies.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

/// Lifecycle of an item as seen by the coordinator.
///
/// `Unindexed → Embedding → Indexed → (Reindexing | Deleted)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemState {
    /// Known but without a vector, or a first encode failed.
    Unindexed,
    /// First encode in progress.
    Embedding,
    /// Vector committed and searchable.
    Indexed,
    /// Content changed; a re-encode is in progress or failed.
    Reindexing,
    Deleted,
}

impl ItemState {
    pub const ALL: [ItemState; 5] = [
        ItemState::Unindexed,
        ItemState::Embedding,
        ItemState::Indexed,
        ItemState::Reindexing,
        ItemState::Deleted,
    ];

    fn slot(self) -> usize {
        match self {
            ItemState::Unindexed => 0,
            ItemState::Embedding => 1,
            ItemState::Indexed => 2,
            ItemState::Reindexing => 3,
            ItemState::Deleted => 4,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ItemState::Unindexed => "unindexed",
            ItemState::Embedding => "embedding",
            ItemState::Indexed => "indexed",
            ItemState::Reindexing => "reindexing",
            ItemState::Deleted => "deleted",
        }
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Item count per state, maintained on every transition.
#[derive(Debug, Default)]
pub(crate) struct StateTallies {
    counts: [AtomicUsize; 5],
}

impl StateTallies {
    pub fn record(&self, from: Option<ItemState>, to: ItemState) {
        if from == Some(to) {
            return;
        }
        if let Some(from) = from {
            self.counts[from.slot()].fetch_sub(1, Ordering::AcqRel);
        }
        self.counts[to.slot()].fetch_add(1, Ordering::AcqRel);
    }

    pub fn get(&self, state: ItemState) -> usize {
        self.counts[state.slot()].load(Ordering::Acquire)
    }
}
