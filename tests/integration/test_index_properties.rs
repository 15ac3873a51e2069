//! Search, rebuild, tombstone and concurrency properties of the index,
//! checked against an exhaustive reference scan.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use folio::{AddOutcome, CoreError, IndexConfig, ItemId, RebuildOutcome, VectorDimension};

use crate::common::{
    assert_ranked_like_reference, id, manual_config, put_and_add, random_unit_vectors,
    store_and_index,
};

fn ids(results: &[folio::SearchResult]) -> Vec<ItemId> {
    results.iter().map(|r| r.item_id).collect()
}

/// Config that partitions snapshots above a small item count.
fn partitioned_config(dim: usize) -> IndexConfig {
    IndexConfig {
        linear_scan_threshold: 64,
        nprobe: 4,
        ..manual_config(dim)
    }
}

#[test]
fn test_example_scenario() {
    let (store, index) = store_and_index(manual_config(2));
    put_and_add(&store, &index, id(1), &[1.0, 0.0]);
    put_and_add(&store, &index, id(2), &[0.0, 1.0]);
    put_and_add(&store, &index, id(3), &[0.9, 0.1]);

    let results = index.search(&[1.0, 0.0], 2, &HashSet::new()).unwrap();
    assert_eq!(ids(&results), vec![id(1), id(3)]);
    assert!((results[0].score.get() - 1.0).abs() < 1e-5);
    assert!((results[1].score.get() - 0.9939).abs() < 1e-3);
    assert_eq!(results[0].rank, 1);
    assert_eq!(results[1].rank, 2);

    // Same answer from a published snapshot
    index.rebuild().unwrap();
    let results = index.search(&[1.0, 0.0], 2, &HashSet::new()).unwrap();
    assert_eq!(ids(&results), vec![id(1), id(3)]);
}

#[test]
fn test_self_search_scores_one() {
    let dim = 16;
    let vectors = random_unit_vectors(400, dim, 7);
    let (store, index) = store_and_index(partitioned_config(dim));
    for (n, vector) in vectors.iter().enumerate() {
        put_and_add(&store, &index, id(n as u64 + 1), vector);
    }

    // Staged and snapshot paths both find every item as its own neighbour
    for phase in 0..2 {
        if phase == 1 {
            match index.rebuild().unwrap() {
                RebuildOutcome::Published { partitions, .. } => assert!(partitions > 1),
                other => panic!("expected a published snapshot, got {other:?}"),
            }
        }
        for (n, vector) in vectors.iter().enumerate() {
            let results = index.search(vector, 1, &HashSet::new()).unwrap();
            assert_eq!(results[0].item_id, id(n as u64 + 1));
            assert!((results[0].score.get() - 1.0).abs() < 1e-4);
        }
    }
}

#[test]
fn test_rebuild_is_idempotent() {
    let dim = 12;
    let vectors = random_unit_vectors(500, dim, 11);
    let queries = random_unit_vectors(25, dim, 99);
    let (store, index) = store_and_index(partitioned_config(dim));
    for (n, vector) in vectors.iter().enumerate() {
        put_and_add(&store, &index, id(n as u64 + 1), vector);
    }

    index.rebuild().unwrap();
    let first: Vec<_> = queries
        .iter()
        .map(|q| index.search(q, 10, &HashSet::new()).unwrap())
        .collect();
    let first_generation = index.stats().generation;

    index.rebuild().unwrap();
    assert!(index.stats().generation > first_generation);
    for (query, expected) in queries.iter().zip(&first) {
        let again = index.search(query, 10, &HashSet::new()).unwrap();
        assert_eq!(&again, expected);
    }
}

#[test]
fn test_partitioned_search_returns_k_past_probed_partitions() {
    let dim = 8;
    let vectors = random_unit_vectors(600, dim, 21);
    let (store, index) = store_and_index(partitioned_config(dim));
    for (n, vector) in vectors.iter().enumerate() {
        put_and_add(&store, &index, id(n as u64 + 1), vector);
    }
    index.rebuild().unwrap();
    let partitions = index.stats().partitions;
    assert!(partitions > 4);

    // Four probed partitions out of ~24 hold far fewer than 250 items.
    let query = &random_unit_vectors(1, dim, 22)[0];
    let results = index.search(query, 250, &HashSet::new()).unwrap();
    assert_eq!(results.len(), 250);

    // Exclusions thin out every partition; the probe keeps widening.
    let exclude: HashSet<ItemId> = (1..=400).map(id).collect();
    let results = index.search(query, 150, &exclude).unwrap();
    assert_eq!(results.len(), 150);
    assert!(results.iter().all(|r| !exclude.contains(&r.item_id)));
}

#[test]
fn test_full_scan_when_k_covers_everything() {
    let dim = 8;
    let vectors = random_unit_vectors(300, dim, 3);
    let (store, index) = store_and_index(partitioned_config(dim));
    let mut items = Vec::new();
    for (n, vector) in vectors.iter().enumerate() {
        put_and_add(&store, &index, id(n as u64 + 1), vector);
        items.push((id(n as u64 + 1), vector.clone()));
    }
    index.rebuild().unwrap();

    let query = &random_unit_vectors(1, dim, 4)[0];
    let results = index.search(query, 1000, &HashSet::new()).unwrap();
    assert_eq!(results.len(), 300);
    assert_ranked_like_reference(&results, &items, query);
}

#[test]
fn test_delete_hidden_before_rebuild() {
    let (store, index) = store_and_index(manual_config(2));
    put_and_add(&store, &index, id(1), &[1.0, 0.0]);
    put_and_add(&store, &index, id(2), &[0.8, 0.2]);
    index.rebuild().unwrap();
    put_and_add(&store, &index, id(3), &[0.7, 0.3]);

    // One deleted from the snapshot, one from staging
    for n in [1, 3] {
        let removed = store.remove(id(n)).unwrap().unwrap();
        index.remove(id(n), removed.version).unwrap();
    }

    let results = index.search(&[1.0, 0.0], 10, &HashSet::new()).unwrap();
    assert_eq!(ids(&results), vec![id(2)]);
    assert_eq!(index.stats().tombstones, 2);

    index.rebuild().unwrap();
    let stats = index.stats();
    assert_eq!(stats.snapshot_items, 1);
    assert_eq!(stats.tombstones, 0);

    let removed = store.remove(id(2)).unwrap().unwrap();
    index.remove(id(2), removed.version).unwrap();
    assert!(matches!(
        index.search(&[1.0, 0.0], 1, &HashSet::new()),
        Err(CoreError::EmptyIndex)
    ));
}

#[test]
fn test_readd_replaces_old_vector() {
    let (store, index) = store_and_index(manual_config(2));
    put_and_add(&store, &index, id(1), &[1.0, 0.0]);
    put_and_add(&store, &index, id(2), &[0.6, 0.8]);
    index.rebuild().unwrap();

    put_and_add(&store, &index, id(1), &[0.0, 1.0]);

    for phase in 0..2 {
        if phase == 1 {
            index.rebuild().unwrap();
        }
        let results = index.search(&[1.0, 0.0], 10, &HashSet::new()).unwrap();
        // Exactly one entry for item 1, scored with its new vector
        assert_eq!(ids(&results), vec![id(2), id(1)]);
        assert!(results[1].score.get().abs() < 1e-5);
    }
}

#[test]
fn test_readd_after_delete_is_visible() {
    let (store, index) = store_and_index(manual_config(2));
    put_and_add(&store, &index, id(1), &[1.0, 0.0]);
    let removed = store.remove(id(1)).unwrap().unwrap();
    index.remove(id(1), removed.version).unwrap();

    let item = store.put(id(1), &[0.0, 1.0]).unwrap();
    assert_eq!(item.version, 2);
    assert_eq!(index.add(&item).unwrap(), AddOutcome::Staged);

    let results = index.search(&[0.0, 1.0], 1, &HashSet::new()).unwrap();
    assert_eq!(results[0].item_id, id(1));
}

#[test]
fn test_exclusion_applies_before_top_k() {
    let (store, index) = store_and_index(manual_config(2));
    put_and_add(&store, &index, id(1), &[1.0, 0.0]);
    put_and_add(&store, &index, id(2), &[0.9, 0.1]);
    put_and_add(&store, &index, id(3), &[0.5, 0.5]);

    let exclude: HashSet<ItemId> = [id(1)].into_iter().collect();
    let results = index.search(&[1.0, 0.0], 2, &exclude).unwrap();
    assert_eq!(ids(&results), vec![id(2), id(3)]);
}

#[test]
fn test_concurrent_distinct_adds_match_brute_force() {
    let dim = 24;
    let vectors = random_unit_vectors(400, dim, 21);
    let config = IndexConfig {
        min_rebuild_staging: 16,
        ..IndexConfig::new(VectorDimension::new(dim).unwrap())
    };
    let (store, index) = store_and_index(config);

    let items: Vec<(ItemId, Vec<f32>)> = vectors
        .into_iter()
        .enumerate()
        .map(|(n, v)| (id(n as u64 + 1), v))
        .collect();

    thread::scope(|scope| {
        for chunk in items.chunks(100) {
            let store = Arc::clone(&store);
            let index = Arc::clone(&index);
            scope.spawn(move || {
                for (item_id, vector) in chunk {
                    put_and_add(&store, &index, *item_id, vector);
                }
            });
        }
    });

    assert_eq!(index.stats().live_items, 400);
    for query in random_unit_vectors(20, dim, 77) {
        let results = index.search(&query, 10, &HashSet::new()).unwrap();
        assert_ranked_like_reference(&results, &items, &query);
    }
    index.shutdown();
}

#[test]
fn test_concurrent_same_item_last_commit_wins() {
    let dim = 8;
    let vectors = random_unit_vectors(64, dim, 5);
    let (store, index) = store_and_index(manual_config(dim));
    let target = id(9);

    thread::scope(|scope| {
        for chunk in vectors.chunks(16) {
            let store = Arc::clone(&store);
            let index = Arc::clone(&index);
            scope.spawn(move || {
                for vector in chunk {
                    put_and_add(&store, &index, target, vector);
                }
            });
        }
    });

    let committed = store.get_item(target).unwrap();
    assert_eq!(committed.version, 64);
    assert_eq!(index.stats().live_items, 1);

    let results = index.search(&committed.vector, 1, &HashSet::new()).unwrap();
    assert_eq!(results[0].item_id, target);
    assert!((results[0].score.get() - 1.0).abs() < 1e-4);

    // A stale add of an older version changes nothing
    let stale = folio::IndexedItem {
        version: 1,
        ..committed.clone()
    };
    assert_eq!(index.add(&stale).unwrap(), AddOutcome::Superseded);
}

#[test]
fn test_full_staging_forces_rebuild() {
    let config = IndexConfig {
        staging_cap: 4,
        ..manual_config(2)
    };
    let (store, index) = store_and_index(config);
    let vectors = random_unit_vectors(5, 2, 1);
    for (n, vector) in vectors.iter().take(4).enumerate() {
        put_and_add(&store, &index, id(n as u64 + 1), vector);
    }
    assert_eq!(index.stats().staged_items, 4);

    let item = store.put(id(5), &vectors[4]).unwrap();
    assert_eq!(index.add(&item).unwrap(), AddOutcome::AlreadyIndexed);

    let stats = index.stats();
    assert_eq!(stats.snapshot_items, 5);
    assert_eq!(stats.staged_items, 0);
}

#[test]
fn test_dimension_mismatch_rejected() {
    let (_store, index) = store_and_index(manual_config(3));
    assert!(matches!(
        index.search(&[1.0, 0.0], 1, &HashSet::new()),
        Err(CoreError::DimensionMismatch {
            expected: 3,
            actual: 2
        })
    ));
}
