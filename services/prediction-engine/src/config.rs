//! Prediction engine configuration

use crate::models::linear::ArtifactFormat;
use crate::volatility::GarchConfig;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Prediction engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Model registry configuration
    pub registry: RegistryConfig,
    /// GARCH estimator configuration
    pub garch: GarchConfig,
    /// Serving configuration
    pub serving: ServingConfig,
    /// Confidence scoring configuration
    pub confidence: ConfidenceConfig,
}

/// Model registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Root directory holding artifacts and the index file
    pub root: PathBuf,
    /// Index file name inside `root`
    pub index_file: String,
    /// Artifact encoding for models created by the engine
    pub artifact_format: ArtifactFormat,
}

/// Serving configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServingConfig {
    /// Minimum number of prices for a volatility request
    pub min_history: usize,
    /// Answer with formula-based heuristics when no model resolves
    pub heuristic_fallback: bool,
    /// Default step size for online updates
    pub update_learning_rate: f64,
}

/// Confidence scoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceConfig {
    /// Features a complete request is expected to carry
    pub expected_features: Vec<String>,
    /// Weight of the volatility penalty
    pub volatility_penalty: f64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("models"),
            index_file: "registry.json".to_string(),
            artifact_format: ArtifactFormat::Json,
        }
    }
}

impl Default for ServingConfig {
    fn default() -> Self {
        Self {
            min_history: 100,
            heuristic_fallback: true,
            update_learning_rate: 0.001,
        }
    }
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self {
            expected_features: vec![
                "price".to_string(),
                "volume".to_string(),
                "rsi".to_string(),
                "macd".to_string(),
                "sma_short".to_string(),
                "sma_long".to_string(),
                "volatility".to_string(),
            ],
            volatility_penalty: 10.0,
        }
    }
}

impl EngineConfig {
    /// Load configuration from file, overridden by `PREDICTION__*` environment variables
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("PREDICTION").separator("__"))
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Full path of the registry index file
    #[must_use]
    pub fn index_path(&self) -> PathBuf {
        self.registry.root.join(&self.registry.index_file)
    }
}
