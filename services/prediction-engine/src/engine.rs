//! Request-level prediction entry point
//!
//! Price and trend requests resolve a model through the [`ServingCache`];
//! volatility requests with a price history go to the GARCH estimator.
//! Confidence depends only on the request's own features.

use crate::clock::{Clock, SystemClock};
use crate::config::{ConfidenceConfig, EngineConfig};
use crate::error::{PredictionError, PredictionResult};
use crate::models::{LinearModel, ModelLoaders, ModelMetadata, TrainableModel, TrainingParams};
use crate::registry::{ModelRegistry, ModelVersion};
use crate::serving::{ServingCache, price_model_id};
use crate::store::ModelStore;
use crate::volatility::{GarchEstimator, VolatilityPrediction};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Model version reported for heuristic answers
pub const HEURISTIC_VERSION: &str = "heuristic";

/// Relative moving-average gap below which a trend is sideways
const TREND_DEADBAND: f64 = 0.001;
/// Largest per-request move the price heuristic extrapolates
const MAX_HEURISTIC_MOMENTUM: f64 = 0.1;

/// What a request asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionKind {
    /// Future price
    Price,
    /// Future volatility
    Volatility,
    /// Direction of the move
    Trend,
}

/// Prediction request from the API layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionRequest {
    /// Trading symbol (e.g. "BTC")
    pub symbol: String,
    /// Forecast horizon in steps
    pub time_horizon: u32,
    /// Feature vector keyed by name
    pub features: BTreeMap<String, f64>,
    /// Requested prediction
    pub model_type: PredictionKind,
}

/// Trend direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrendDirection {
    /// Rising
    Up,
    /// Falling
    Down,
    /// No clear direction
    Sideways,
}

/// Prediction payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Prediction {
    /// Predicted price
    Price {
        /// Price level
        value: f64,
    },
    /// Predicted volatility per step
    Volatility {
        /// One value per horizon step
        values: Vec<f64>,
    },
    /// Predicted trend
    Trend {
        /// Direction
        direction: TrendDirection,
        /// Strength in `[0, 1]`
        strength: f64,
    },
}

/// Prediction response to the API layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionResponse {
    /// Response identifier
    pub id: Uuid,
    /// Prediction payload
    pub prediction: Prediction,
    /// Confidence in `[0, 1]`
    pub confidence: f64,
    /// `1 - confidence`
    pub uncertainty: f64,
    /// Model version that produced the prediction
    pub model_version: String,
    /// When the prediction was made
    pub timestamp: DateTime<Utc>,
}

/// Feature-completeness ratio scaled by a volatility penalty
pub fn confidence_score(features: &BTreeMap<String, f64>, config: &ConfidenceConfig) -> f64 {
    let completeness = if config.expected_features.is_empty() {
        1.0
    } else {
        let present = config
            .expected_features
            .iter()
            .filter(|name| features.get(*name).is_some_and(|v| v.is_finite()))
            .count();
        present as f64 / config.expected_features.len() as f64
    };

    let volatility = features
        .get("volatility")
        .copied()
        .filter(|v| v.is_finite())
        .map_or(0.0, f64::abs);
    let penalty = 1.0 / (1.0 + config.volatility_penalty.max(0.0) * volatility);

    (completeness * penalty).clamp(0.0, 1.0)
}

/// Prediction engine over a serving cache and a GARCH estimator
#[derive(Debug)]
pub struct PredictionEngine {
    cache: Arc<ServingCache>,
    estimator: GarchEstimator,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
}

impl PredictionEngine {
    /// Engine over an existing cache
    pub fn new(cache: Arc<ServingCache>, config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            cache,
            estimator: GarchEstimator::new(config.garch.clone()),
            config,
            clock,
        }
    }

    /// Open the registry described by `config` and reconcile it
    pub fn from_config(config: EngineConfig) -> PredictionResult<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = ModelStore::open(&config.registry.root)?;
        let registry = ModelRegistry::open(
            store,
            config.registry.index_file.clone(),
            ModelLoaders::with_builtin(),
            Arc::clone(&clock),
        )?;

        let report = registry.reconcile()?;
        for (model_id, version) in &report.missing_artifacts {
            warn!("Registry entry {} v{} has no artifact", model_id, version);
        }

        let cache = Arc::new(ServingCache::new(Arc::new(registry), Arc::clone(&clock)));
        Ok(Self::new(cache, config, clock))
    }

    /// Serving cache
    pub fn cache(&self) -> &Arc<ServingCache> {
        &self.cache
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Answer a prediction request
    pub fn predict(&self, request: &PredictionRequest) -> PredictionResult<PredictionResponse> {
        let confidence = confidence_score(&request.features, &self.config.confidence);
        let (prediction, model_version) = match request.model_type {
            PredictionKind::Volatility => (self.heuristic(request)?, HEURISTIC_VERSION.to_string()),
            PredictionKind::Price | PredictionKind::Trend => match self.cache.resolve(&request.symbol) {
                Some(resolved) => {
                    let input = self.input_vector(&request.features);
                    let output = resolved
                        .model
                        .predict(&input)
                        .map_err(PredictionError::Model)?;
                    let raw = output.first().copied().ok_or_else(|| {
                        PredictionError::Model(anyhow::anyhow!("Model returned an empty output"))
                    })?;
                    (interpret(request.model_type, raw), resolved.source.version_label())
                }
                None if self.config.serving.heuristic_fallback => {
                    debug!("No model for {}, answering heuristically", request.symbol);
                    (self.heuristic(request)?, HEURISTIC_VERSION.to_string())
                }
                None => {
                    return Err(PredictionError::ModelNotAvailable {
                        symbol: request.symbol.clone(),
                    });
                }
            },
        };

        Ok(PredictionResponse {
            id: Uuid::new_v4(),
            prediction,
            confidence,
            uncertainty: 1.0 - confidence,
            model_version,
            timestamp: self.clock.now(),
        })
    }

    /// Fit GARCH(1,1) to `prices` and forecast `horizon` steps
    pub fn predict_volatility(
        &self,
        symbol: &str,
        prices: &[f64],
        horizon: usize,
    ) -> PredictionResult<VolatilityPrediction> {
        if horizon == 0 {
            return Err(PredictionError::invalid_input("horizon must be at least 1"));
        }
        if prices.len() < self.config.serving.min_history {
            return Err(PredictionError::InsufficientData {
                required: self.config.serving.min_history,
                actual: prices.len(),
            });
        }

        let fit = self.estimator.fit_prices(prices)?;
        let prediction = VolatilityPrediction::from_fit(symbol, self.clock.now(), horizon, &fit);
        info!(
            "Volatility forecast for {}: {} steps, r2 {:.4}, alpha+beta {:.4}",
            symbol,
            horizon,
            prediction.r2,
            fit.parameters.persistence()
        );
        Ok(prediction)
    }

    /// Train a fresh linear model for `symbol` and register it as a new version
    pub fn train_model(
        &self,
        symbol: &str,
        inputs: &[Vec<f64>],
        targets: &[Vec<f64>],
        params: &TrainingParams,
    ) -> PredictionResult<ModelVersion> {
        let input_size = inputs
            .first()
            .map(Vec::len)
            .ok_or_else(|| PredictionError::invalid_input("empty training set"))?;

        let mut model = LinearModel::new(input_size).with_format(self.config.registry.artifact_format);
        let result = model
            .train(inputs, targets, params)
            .map_err(PredictionError::Model)?;
        let metadata = ModelMetadata::from_training(&model, 1, &result, params).with_tag("symbol", symbol);

        let version = self
            .cache
            .registry()
            .register_next(&model, &price_model_id(symbol), metadata)?;
        self.cache.invalidate(symbol);
        Ok(version)
    }

    /// Online update of the served model for `symbol` at the configured learning rate
    pub fn update_model(
        &self,
        symbol: &str,
        batch: &[Vec<f64>],
        targets: &[Vec<f64>],
    ) -> PredictionResult<ModelVersion> {
        self.cache
            .update(symbol, batch, targets, self.config.serving.update_learning_rate)
    }

    /// Model input: expected features in configured order, or all features sorted by name
    fn input_vector(&self, features: &BTreeMap<String, f64>) -> Vec<f64> {
        let expected = &self.config.confidence.expected_features;
        if expected.is_empty() {
            return features.values().copied().collect();
        }
        expected
            .iter()
            .map(|name| features.get(name).copied().filter(|v| v.is_finite()).unwrap_or(0.0))
            .collect()
    }

    fn heuristic(&self, request: &PredictionRequest) -> PredictionResult<Prediction> {
        let feature = |name: &str| request.features.get(name).copied().filter(|v| v.is_finite());
        let ma_gap = match (feature("sma_short"), feature("sma_long")) {
            (Some(short), Some(long)) if long != 0.0 => Some(short / long - 1.0),
            _ => None,
        };

        match request.model_type {
            PredictionKind::Price => {
                let price = feature("price").ok_or_else(|| {
                    PredictionError::invalid_input("price heuristic needs a 'price' feature")
                })?;
                let momentum = feature("momentum").or(ma_gap).unwrap_or(0.0);
                Ok(Prediction::Price {
                    value: price * (1.0 + momentum.clamp(-MAX_HEURISTIC_MOMENTUM, MAX_HEURISTIC_MOMENTUM)),
                })
            }
            PredictionKind::Trend => Ok(trend(ma_gap.unwrap_or(0.0))),
            PredictionKind::Volatility => {
                let volatility = feature("volatility").map_or(0.0, f64::abs);
                Ok(Prediction::Volatility {
                    values: vec![volatility; request.time_horizon.max(1) as usize],
                })
            }
        }
    }
}

fn interpret(kind: PredictionKind, raw: f64) -> Prediction {
    match kind {
        PredictionKind::Trend => trend(raw),
        PredictionKind::Price | PredictionKind::Volatility => Prediction::Price { value: raw },
    }
}

fn trend(signal: f64) -> Prediction {
    let direction = if signal > TREND_DEADBAND {
        TrendDirection::Up
    } else if signal < -TREND_DEADBAND {
        TrendDirection::Down
    } else {
        TrendDirection::Sideways
    };
    Prediction::Trend {
        direction,
        strength: (signal.abs() * 100.0).min(1.0),
    }
}
