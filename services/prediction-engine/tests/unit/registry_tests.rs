//! Tests for the versioned model registry

use crate::common::{Harness, open_registry, two_input_model};
use anyhow::Result;
use pretty_assertions::assert_eq;
use prediction_engine::models::linear::ArtifactFormat;
use prediction_engine::{ModelMetadata, PredictionError, TrainableModel};
use rstest::*;
use std::fs;

#[fixture]
fn harness() -> Harness {
    Harness::new(100).expect("Failed to create registry harness")
}

#[rstest]
fn test_get_version_exact_lookup(harness: Harness) -> Result<()> {
    harness.register("BTC", "1", 0.0)?;
    harness.clock.set_secs(200);
    harness.register("BTC", "2", 1.0)?;

    let v1 = harness.registry.get_version("BTC_price_prediction", "1");
    assert_eq!(v1.map(|v| v.created_at.timestamp()), Some(100));
    assert!(harness.registry.get_version("BTC_price_prediction", "3").is_none());
    assert!(harness.registry.get_version("ETH_price_prediction", "1").is_none());
    Ok(())
}

#[rstest]
fn test_load_model_latest_and_pinned(harness: Harness) -> Result<()> {
    harness.register("BTC", "1", 1.0)?;
    harness.clock.set_secs(200);
    harness.register("BTC", "2", 2.0)?;

    let latest = harness.registry.load_model("BTC_price_prediction", None)?;
    assert_eq!(latest.predict(&[0.0, 0.0])?, vec![2.0]);
    let pinned = harness.registry.load_model("BTC_price_prediction", Some("1"))?;
    assert_eq!(pinned.predict(&[0.0, 0.0])?, vec![1.0]);
    Ok(())
}

#[rstest]
fn test_load_nonexistent_is_model_not_found(harness: Harness) -> Result<()> {
    match harness.registry.load_model("X", Some("v9")) {
        Err(PredictionError::ModelNotFound { model_id, version }) => {
            assert_eq!(model_id, "X");
            assert_eq!(version.as_deref(), Some("v9"));
        }
        other => panic!("expected ModelNotFound, got {other:?}"),
    }
    assert!(matches!(
        harness.registry.load_model("X", None),
        Err(PredictionError::ModelNotFound { version: None, .. })
    ));
    Ok(())
}

#[rstest]
fn test_corrupted_artifact_is_checksum_mismatch(
    harness: Harness,
    #[values(0.0, 0.25, 0.5, 0.75, 1.0)] position: f64,
    #[values(0x01, 0x80, 0xFF)] mask: u8,
) -> Result<()> {
    let entry = harness.register("BTC", "1", 0.0)?;
    let path = harness.dir.path().join(&entry.file_path);
    let mut bytes = fs::read(&path)?;
    let at = ((bytes.len() - 1) as f64 * position).round() as usize;
    bytes[at] ^= mask;
    fs::write(&path, bytes)?;

    match harness.registry.load_model("BTC_price_prediction", Some("1")) {
        Err(PredictionError::ChecksumMismatch {
            expected, actual, ..
        }) => {
            assert_eq!(expected, entry.checksum);
            assert_ne!(actual, entry.checksum);
        }
        other => panic!("expected ChecksumMismatch, got {other:?}"),
    }
    Ok(())
}

#[rstest]
fn test_checksum_matches_artifact_bytes(harness: Harness) -> Result<()> {
    let entry = harness.register("ETH", "1", 0.0)?;
    let bytes = fs::read(harness.dir.path().join(&entry.file_path))?;
    assert_eq!(prediction_engine::ModelStore::compute_checksum(&bytes), entry.checksum);
    Ok(())
}

#[rstest]
fn test_bincode_artifact_round_trip(harness: Harness) -> Result<()> {
    let model = two_input_model(3.0).with_format(ArtifactFormat::Bincode);
    let entry = harness
        .registry
        .register(&model, "SOL_price_prediction", "1", ModelMetadata::default())?;
    assert!(entry.file_path.ends_with(".bin"));

    let loaded = harness.registry.load_model("SOL_price_prediction", None)?;
    assert_eq!(loaded.predict(&[2.0, 4.0])?, model.predict(&[2.0, 4.0])?);
    Ok(())
}

#[rstest]
fn test_delete_version_removes_entry_and_file(harness: Harness) -> Result<()> {
    let v1 = harness.register("BTC", "1", 0.0)?;
    harness.clock.set_secs(200);
    harness.register("BTC", "2", 0.0)?;

    harness.registry.delete_version("BTC_price_prediction", "2")?;
    assert_eq!(
        harness
            .registry
            .get_latest_version("BTC_price_prediction")
            .map(|v| v.version),
        Some("1".to_string())
    );
    assert!(harness.dir.path().join(&v1.file_path).exists());
    assert!(!harness.dir.path().join("BTC_price_prediction_v2.json").exists());
    assert!(matches!(
        harness.registry.delete_version("BTC_price_prediction", "2"),
        Err(PredictionError::ModelNotFound { .. })
    ));
    Ok(())
}

#[rstest]
fn test_delete_models_uses_literal_prefix(harness: Harness) -> Result<()> {
    harness.register("BTC", "1", 0.0)?;
    harness.register("BTCUSD", "1", 0.0)?;
    harness.register("ETH", "1", 0.0)?;

    assert_eq!(harness.registry.delete_models("BTC")?, 2);
    assert!(harness.registry.list_models("BTC").is_empty());
    assert_eq!(harness.registry.model_ids(), vec!["ETH_price_prediction"]);
    assert_eq!(harness.registry.delete_models("DOGE")?, 0);
    Ok(())
}

#[rstest]
fn test_list_models_newest_first_across_ids(harness: Harness) -> Result<()> {
    harness.register("BTC", "1", 0.0)?;
    harness.clock.set_secs(300);
    harness.register("BTCUSD", "1", 0.0)?;
    harness.clock.set_secs(200);
    harness.register("BTC", "2", 0.0)?;

    let listed: Vec<(String, String)> = harness
        .registry
        .list_models("BTC")
        .into_iter()
        .map(|v| (v.model_id, v.version))
        .collect();
    assert_eq!(
        listed,
        vec![
            ("BTCUSD_price_prediction".to_string(), "1".to_string()),
            ("BTC_price_prediction".to_string(), "2".to_string()),
            ("BTC_price_prediction".to_string(), "1".to_string()),
        ]
    );
    Ok(())
}

#[rstest]
fn test_index_reopens_with_metadata(harness: Harness) -> Result<()> {
    harness.register("BTC", "1", 0.0)?;

    let reopened = open_registry(&harness.dir, harness.clock.clone())?;
    let entry = reopened
        .get_latest_version("BTC_price_prediction")
        .expect("entry survives reopen");
    assert_eq!(entry.metadata.tags.get("symbol").map(String::as_str), Some("BTC"));
    assert_eq!(entry.model_type, "linear");
    Ok(())
}

#[rstest]
fn test_unknown_model_type(harness: Harness) -> Result<()> {
    let store = prediction_engine::ModelStore::open(harness.dir.path())?;
    let bare = prediction_engine::ModelRegistry::open(
        store,
        "other.json",
        prediction_engine::ModelLoaders::new(),
        harness.clock.clone(),
    )?;
    bare.register(&two_input_model(0.0), "BTC_price_prediction", "1", ModelMetadata::default())?;

    assert!(matches!(
        bare.load_model("BTC_price_prediction", None),
        Err(PredictionError::UnknownModelType { .. })
    ));
    Ok(())
}
