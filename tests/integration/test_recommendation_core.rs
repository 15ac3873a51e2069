//! End-to-end behaviour of the recommendation core: ingest, recommend,
//! similarity, failure states, durable restart and change-feed sync.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use folio::{
    CoreError, Encoder, ItemState, JsonlSource, MemorySource, Query, RecommendFilters,
    RecommendationCore, Settings,
};
use tempfile::TempDir;

use crate::common::{FailingEncoder, HashEncoder, id, manual_config};

const DIM: usize = 64;

fn settings_in(dir: &Path) -> Settings {
    let mut settings = Settings {
        workspace_root: Some(dir.to_path_buf()),
        ..Settings::default()
    };
    settings.index.dimension = DIM;
    settings.index.auto_rebuild = false;
    settings.storage.fsync = false;
    settings.sync.batch_size = 2;
    settings
}

fn memory_core() -> RecommendationCore {
    RecommendationCore::in_memory(manual_config(DIM), Arc::new(HashEncoder::new(DIM))).unwrap()
}

fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap()
}

#[test]
fn test_ingest_is_deterministic_and_versioned() {
    let core = memory_core();
    let text = "A whaling voyage told by a sailor named Ishmael";

    assert_eq!(core.ingest(id(1), text).unwrap(), 1);
    let first = core.store().get(id(1)).unwrap();
    assert_eq!(core.ingest(id(1), text).unwrap(), 2);
    let second = core.store().get(id(1)).unwrap();

    assert_eq!(first.as_slice(), second.as_slice());
    assert_eq!(core.state(id(1)), Some(ItemState::Indexed));
    assert_eq!(core.stats().indexed, 1);
}

#[test]
fn test_similarity_of_identical_text_is_one() {
    let core = memory_core();
    for text in ["Pride and Prejudice", "x", "a long tale of two cities"] {
        assert_eq!(core.similarity(text, text).unwrap().get(), 1.0);
    }
    assert!(matches!(
        core.similarity("  ", "text"),
        Err(CoreError::InvalidInput { .. })
    ));
    // Pure: nothing was indexed
    assert_eq!(core.index().stats().live_items, 0);
}

#[test]
fn test_recommend_text_with_filters() {
    let core = memory_core();
    core.ingest(id(1), "space opera galactic empire").unwrap();
    core.ingest(id(2), "galactic empire politics and war").unwrap();
    core.ingest(id(3), "victorian cooking recipes").unwrap();

    let results = core
        .recommend(
            Query::Text("galactic empire"),
            3,
            &RecommendFilters::default(),
        )
        .unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results[2].item_id, id(3));

    let filters = RecommendFilters::excluding([id(1)]).with_min_score(0.1);
    let results = core
        .recommend(Query::Text("galactic empire"), 3, &filters)
        .unwrap();
    assert_eq!(results[0].item_id, id(2));
    assert!(results.iter().all(|r| r.item_id != id(1)));
    assert!(results.iter().all(|r| r.score.get() >= 0.1));

    let similar = core
        .recommend_similar(id(2), 1, &RecommendFilters::default())
        .unwrap();
    assert_eq!(similar[0].item_id, id(1));
}

#[test]
fn test_cold_start_is_empty_index() {
    let core = memory_core();
    assert!(matches!(
        core.recommend(Query::Text("anything"), 5, &RecommendFilters::default()),
        Err(CoreError::EmptyIndex)
    ));
    assert!(matches!(
        core.recommend_similar(id(4), 5, &RecommendFilters::default()),
        Err(CoreError::NotFound { .. })
    ));
}

#[test]
fn test_encoding_failure_leaves_item_unindexed() {
    let core =
        RecommendationCore::in_memory(manual_config(DIM), Arc::new(FailingEncoder::new(DIM)))
            .unwrap();
    assert!(core.register(id(5)));

    let err = core.ingest(id(5), "some text").unwrap_err();
    assert!(matches!(err, CoreError::EncodingFailed { .. }));
    assert!(err.is_retryable());
    assert_eq!(core.state(id(5)), Some(ItemState::Unindexed));

    let stats = core.stats();
    assert_eq!(stats.unindexed, 1);
    assert_eq!(stats.embedding, 0);
    assert!(!core.store().contains(id(5)));
}

#[test]
fn test_durable_restart_and_reindex_failure() {
    let temp_dir = TempDir::new().unwrap();
    let settings = settings_in(temp_dir.path());

    {
        let core = RecommendationCore::open(&settings, Arc::new(HashEncoder::new(DIM))).unwrap();
        core.ingest(id(1), "gothic horror castle").unwrap();
        core.ingest(id(2), "gothic romance castle moors").unwrap();
        core.ingest(id(3), "hard science fiction").unwrap();
        core.delete(id(3)).unwrap();
    }
    assert!(settings.data_dir().join("vectors.log").exists());

    // Restart with an encoder that can no longer embed
    let encoder: Arc<dyn Encoder> = Arc::new(FailingEncoder::new(DIM));
    let core = RecommendationCore::open(&settings, encoder).unwrap();
    assert_eq!(core.state(id(1)), Some(ItemState::Indexed));
    assert_eq!(core.state(id(3)), None);

    let index = core.index().stats();
    assert_eq!(index.snapshot_items, 2);
    assert!(index.last_rebuild_at.is_some());

    // Searches need no encoder for stored items
    let similar = core
        .recommend_similar(id(1), 5, &RecommendFilters::default())
        .unwrap();
    assert_eq!(similar.len(), 1);
    assert_eq!(similar[0].item_id, id(2));

    assert!(core.ingest(id(1), "new blurb").is_err());
    assert_eq!(core.state(id(1)), Some(ItemState::Reindexing));
    // The old vector keeps serving
    assert!(core.store().contains(id(1)));
}

#[test]
fn test_jsonl_sync_resumes_from_cursor() {
    let temp_dir = TempDir::new().unwrap();
    let settings = settings_in(temp_dir.path());
    let feed_path = temp_dir.path().join("catalog.jsonl");
    fs::write(
        &feed_path,
        r#"{"item_id": 1, "updated_at": "2024-01-01T00:00:00Z", "op": "upsert", "text": "murder on a train"}
{"item_id": 2, "updated_at": "2024-01-02T00:00:00Z", "op": "upsert", "text": "detective in london fog"}
{"item_id": 3, "updated_at": "2024-01-03T00:00:00Z", "op": "upsert", "text": "poems about the sea"}
"#,
    )
    .unwrap();

    {
        let core = RecommendationCore::open(&settings, Arc::new(HashEncoder::new(DIM))).unwrap();
        let report = core.sync_all(&JsonlSource::new(&feed_path)).unwrap();
        assert_eq!(report.upserted, 3);
        assert!(report.batches >= 2);
        assert!(report.drained);
        assert_eq!(core.stats().indexed, 3);
    }
    assert!(settings.cursor_path().exists());

    let mut content = fs::read_to_string(&feed_path).unwrap();
    content.push_str(
        r#"{"item_id": 3, "updated_at": "2024-01-04T00:00:00Z", "op": "delete"}
"#,
    );
    fs::write(&feed_path, content).unwrap();

    let core = RecommendationCore::open(&settings, Arc::new(HashEncoder::new(DIM))).unwrap();
    let report = core.sync_all(&JsonlSource::new(&feed_path)).unwrap();
    assert_eq!(report.fetched, 1);
    assert_eq!(report.deleted, 1);
    assert_eq!(core.store().len(), 2);
    assert_eq!(core.coordinator().cursor("catalog").applied, 4);
}

#[test]
fn test_sync_stops_at_failing_change() {
    let core = memory_core().with_defaults(10, 10);
    let source = MemorySource::new("books");
    source.upsert(id(1), at(100), "first book");
    source.upsert(id(2), at(200), "   ");
    source.upsert(id(3), at(300), "third book");

    let err = core.sync_once(&source).unwrap_err();
    assert!(matches!(err, CoreError::InvalidInput { .. }));

    let cursor = core.coordinator().cursor("books");
    assert_eq!(cursor.applied, 1);
    assert_eq!(cursor.item_id, Some(id(1)));
    assert!(!core.store().contains(id(3)));

    // The bad change is retried, not skipped
    assert!(core.sync_once(&source).is_err());
    assert_eq!(core.coordinator().cursor("books").applied, 1);
}
