//! Real-model checks for the fastembed encoder.
//!
//! These download the model on first run, so they are ignored by default.

use std::sync::Arc;

use anyhow::Result;
use folio::vector::cosine_similarity;
use folio::{Encoder, FastEmbedEncoder, ItemId, Query, RecommendFilters, RecommendationCore};

use crate::common::manual_config;

/// Get a unique cache directory for each test to avoid conflicts
fn get_test_cache_dir(test_name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!(
        "folio_test_fastembed_{}_{}",
        test_name,
        std::process::id()
    ))
}

#[test]
#[ignore = "Downloads 86MB model - run with --ignored for embedding checks"]
fn test_blurbs_cluster_by_topic() -> Result<()> {
    let encoder = FastEmbedEncoder::from_name(
        "AllMiniLML6V2",
        Some(get_test_cache_dir("blurbs_cluster_by_topic")),
        false,
    )?;
    assert_eq!(encoder.dimension().get(), 384);

    let vectors = encoder.encode_batch(&[
        "A detective investigates a murder in foggy Victorian London",
        "An inspector hunts a killer through the streets of nineteenth century London",
        "A practical guide to growing tomatoes on a balcony",
    ])?;
    let mystery = cosine_similarity(&vectors[0], &vectors[1]);
    let unrelated = cosine_similarity(&vectors[0], &vectors[2]);
    println!("mystery pair: {mystery:.3}, unrelated pair: {unrelated:.3}");
    assert!(mystery > unrelated);

    // Same text, same vector
    let again = encoder.encode("A practical guide to growing tomatoes on a balcony")?;
    assert_eq!(again, vectors[2]);
    Ok(())
}

#[test]
#[ignore = "Downloads 86MB model - run with --ignored for embedding checks"]
fn test_recommendations_with_real_model() -> Result<()> {
    let encoder = FastEmbedEncoder::from_name(
        "AllMiniLML6V2",
        Some(get_test_cache_dir("recommendations_with_real_model")),
        false,
    )?;
    let core = RecommendationCore::in_memory(manual_config(384), Arc::new(encoder))?;

    let books = [
        (1, "Epic fantasy with dragons, a lost heir and a war for the throne"),
        (2, "A young wizard attends a school of magic and fights a dark lord"),
        (3, "Quarterly earnings analysis for small-cap technology stocks"),
    ];
    for (n, blurb) in books {
        core.ingest(ItemId::new(n).unwrap(), blurb)?;
    }

    let results = core.recommend(
        Query::Text("magic, dragons and sorcery"),
        2,
        &RecommendFilters::default(),
    )?;
    let top: Vec<u64> = results.iter().map(|r| r.item_id.get()).collect();
    assert!(!top.contains(&3), "finance book ranked in top 2: {top:?}");

    let score = core.similarity(books[0].1, books[0].1)?;
    assert!((score.get() - 1.0).abs() < 1e-6);
    Ok(())
}
