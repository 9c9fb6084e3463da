//! End-to-end serving scenarios over a real on-disk registry

use crate::common::{Harness, open_registry, two_input_model};
use anyhow::Result;
use pretty_assertions::assert_eq;
use prediction_engine::{ModelSource, PredictionError, ServingCache};
use rstest::*;
use std::fs;
use std::sync::Arc;

#[fixture]
fn harness() -> Harness {
    Harness::new(100).expect("Failed to create serving harness")
}

fn served_version(cache: &ServingCache, symbol: &str) -> Result<(String, bool)> {
    let resolved = cache.resolve_required(symbol)?;
    Ok(match resolved.source {
        ModelSource::Cached(v) => (v.version, true),
        ModelSource::Registry(v) => (v.version, false),
        ModelSource::Fallback => ("fallback".to_string(), false),
    })
}

#[rstest]
fn test_hot_reload_on_newer_version(harness: Harness) -> Result<()> {
    harness.register("BTC", "1", 1.0)?;
    assert_eq!(served_version(&harness.cache, "BTC")?, ("1".to_string(), false));
    assert_eq!(served_version(&harness.cache, "BTC")?, ("1".to_string(), true));
    assert!(!harness.cache.check_for_update("BTC"));

    harness.clock.set_secs(200);
    harness.register("BTC", "2", 2.0)?;
    assert!(harness.cache.check_for_update("BTC"));

    assert_eq!(served_version(&harness.cache, "BTC")?, ("2".to_string(), false));
    let resolved = harness.cache.resolve_required("BTC")?;
    assert_eq!(resolved.model.predict(&[0.0, 0.0])?, vec![2.0]);
    assert!(!harness.cache.check_for_update("BTC"));
    Ok(())
}

#[rstest]
fn test_equal_created_at_does_not_reload(harness: Harness) -> Result<()> {
    harness.register("BTC", "1", 1.0)?;
    harness.cache.resolve_required("BTC")?;

    // Same instant as the cached entry's load time
    harness.register("BTC", "2", 2.0)?;
    assert!(!harness.cache.check_for_update("BTC"));
    assert_eq!(served_version(&harness.cache, "BTC")?, ("1".to_string(), true));
    Ok(())
}

#[rstest]
fn test_delete_models_clears_registry_and_cache(harness: Harness) -> Result<()> {
    let v1 = harness.register("BTC", "1", 1.0)?;
    harness.cache.resolve_required("BTC")?;
    harness.clock.set_secs(200);
    let v2 = harness.register("BTC", "2", 2.0)?;
    harness.cache.resolve_required("BTC")?;

    assert_eq!(harness.cache.delete_models("BTC")?, 2);
    assert!(harness.registry.list_models("BTC").is_empty());
    assert!(!harness.dir.path().join(&v1.file_path).exists());
    assert!(!harness.dir.path().join(&v2.file_path).exists());
    assert!(harness.cache.cached_symbols().is_empty());
    assert!(harness.cache.resolve("BTC").is_none());
    Ok(())
}

#[rstest]
fn test_unknown_symbol_is_not_available(harness: Harness) {
    assert!(harness.cache.resolve("ZZZ").is_none());
    match harness.cache.resolve_required("ZZZ") {
        Err(PredictionError::ModelNotAvailable { symbol }) => assert_eq!(symbol, "ZZZ"),
        other => panic!("expected ModelNotAvailable, got {other:?}"),
    }
}

#[rstest]
fn test_fallback_serves_until_cleared(harness: Harness) -> Result<()> {
    harness.cache.set_fallback(Arc::new(two_input_model(9.0)));
    assert_eq!(served_version(&harness.cache, "ZZZ")?, ("fallback".to_string(), false));

    harness.cache.clear_fallback();
    assert!(harness.cache.resolve("ZZZ").is_none());
    Ok(())
}

#[rstest]
fn test_corrupted_latest_falls_back(harness: Harness) -> Result<()> {
    let entry = harness.register("ETH", "1", 1.0)?;
    fs::write(harness.dir.path().join(&entry.file_path), b"{\"tampered\":true}")?;

    assert!(matches!(
        harness.registry.load_model("ETH_price_prediction", None),
        Err(PredictionError::ChecksumMismatch { .. })
    ));
    assert!(harness.cache.resolve("ETH").is_none());

    harness.cache.set_fallback(Arc::new(two_input_model(0.0)));
    assert_eq!(served_version(&harness.cache, "ETH")?, ("fallback".to_string(), false));
    Ok(())
}

#[rstest]
#[case(1)]
#[case(3)]
#[case(5)]
fn test_each_update_registers_one_version(harness: Harness, #[case] updates: usize) -> Result<()> {
    harness.register("BTC", "0", 0.0)?;
    let batch = vec![vec![1.0, 2.0], vec![0.5, -1.0]];
    let targets = vec![vec![1.0], vec![0.0]];

    let mut produced = Vec::new();
    for i in 0..updates {
        harness.clock.set_secs(200 + i as i64);
        let version = harness.cache.update("BTC", &batch, &targets, 0.01)?;
        assert_eq!(
            version.metadata.tags.get("update").map(String::as_str),
            Some("online")
        );
        produced.push(version.version);
    }

    let versions = harness.registry.list_versions("BTC_price_prediction");
    assert_eq!(versions.len(), updates + 1);
    assert_eq!(versions.first().map(|v| v.version.clone()), produced.last().cloned());
    assert_eq!(served_version(&harness.cache, "BTC")?.0, versions[0].version);
    Ok(())
}

#[rstest]
fn test_updates_at_one_instant_stay_distinct(harness: Harness) -> Result<()> {
    harness.register("BTC", "0", 0.0)?;
    let batch = vec![vec![1.0, 1.0]];
    let targets = vec![vec![1.0]];

    let first = harness.cache.update("BTC", &batch, &targets, 0.01)?;
    let second = harness.cache.update("BTC", &batch, &targets, 0.01)?;
    assert_ne!(first.version, second.version);
    assert_eq!(
        second.metadata.tags.get("parent_version"),
        Some(&first.version)
    );
    Ok(())
}

#[rstest]
fn test_update_without_model_fails(harness: Harness) {
    let result = harness
        .cache
        .update("ZZZ", &[vec![1.0, 1.0]], &[vec![1.0]], 0.01);
    assert!(matches!(result, Err(PredictionError::ModelNotAvailable { .. })));

    let result = harness.cache.update("ZZZ", &[], &[], 0.01);
    assert!(matches!(result, Err(PredictionError::InvalidInput { .. })));
}

#[rstest]
fn test_deleting_latest_version_falls_back_to_previous(harness: Harness) -> Result<()> {
    harness.register("BTC", "1", 1.0)?;
    harness.clock.set_secs(200);
    harness.register("BTC", "2", 2.0)?;
    assert_eq!(served_version(&harness.cache, "BTC")?, ("2".to_string(), false));

    harness.registry.delete_version("BTC_price_prediction", "2")?;
    assert!(harness.cache.check_for_update("BTC"));
    assert_eq!(served_version(&harness.cache, "BTC")?, ("1".to_string(), false));

    let resolved = harness.cache.resolve_required("BTC")?;
    assert_eq!(resolved.model.predict(&[0.0, 0.0])?, vec![1.0]);
    Ok(())
}

#[rstest]
fn test_reconcile_keeps_operator_files(harness: Harness) -> Result<()> {
    harness.register("BTC", "1", 1.0)?;
    fs::write(harness.dir.path().join("config.toml"), b"[registry]\n")?;
    fs::write(harness.dir.path().join("notes.txt"), b"keep me")?;

    let report = open_registry(&harness.dir, harness.clock.clone())?.reconcile()?;
    assert!(report.orphaned_artifacts_removed.is_empty());
    assert!(harness.dir.path().join("config.toml").exists());
    assert!(harness.dir.path().join("notes.txt").exists());
    Ok(())
}

#[rstest]
fn test_restart_reconciles_orphans(harness: Harness) -> Result<()> {
    harness.register("BTC", "1", 1.0)?;
    fs::write(harness.dir.path().join("BTC_price_prediction_v7.json"), b"{}")?;

    let reopened = open_registry(&harness.dir, harness.clock.clone())?;
    let report = reopened.reconcile()?;
    assert_eq!(report.orphaned_artifacts_removed, vec!["BTC_price_prediction_v7.json"]);
    assert!(report.missing_artifacts.is_empty());

    let cache = ServingCache::new(Arc::new(reopened), harness.clock.clone());
    assert_eq!(served_version(&cache, "BTC")?, ("1".to_string(), false));
    Ok(())
}
