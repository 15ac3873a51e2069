//! Book recommendation core: text embeddings, an incrementally updated
//! approximate nearest-neighbour index, and synchronisation with an
//! external metadata store.

pub mod config;
pub mod display;
pub mod engine;
pub mod error;
pub mod index;
pub mod recommend;
pub mod service;
pub mod store;
pub mod sync;
pub mod vector;

// Explicit exports for better API clarity
pub use config::Settings;
pub use engine::{CoreStats, RecommendationCore};
pub use error::{CoreError, CoreResult};
pub use index::{AddOutcome, IndexConfig, IndexStats, RebuildOutcome, SearchResult, VectorIndex};
pub use recommend::{Query, RecommendFilters, Recommender};
pub use service::RecommendationService;
pub use store::{IndexedItem, ItemsSnapshot, VectorStore};
pub use sync::{
    ChangeKind, ChangeRecord, ConsistencyCoordinator, CoordinatorStats, CursorStore, ItemState,
    JsonlSource, MemorySource, MetadataSource, SyncCursor, SyncReport,
};
pub use vector::{EmbeddingVector, Encoder, FastEmbedEncoder, ItemId, Score, VectorDimension};
