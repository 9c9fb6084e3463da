//! Prediction Engine for Crypto Market Forecasts
//!
//! Provides:
//! - Content-addressed artifact storage with SHA-256 integrity checks
//! - A versioned model registry persisted as a JSON index
//! - Per-symbol model serving with staleness detection and online updates
//! - GARCH(1,1) volatility fitting and forecasting

#![forbid(unsafe_code)]

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod models;
pub mod registry;
pub mod serving;
pub mod store;
pub mod volatility;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use engine::{
    Prediction, PredictionEngine, PredictionKind, PredictionRequest, PredictionResponse,
    TrendDirection,
};
pub use error::{PredictionError, PredictionResult};
pub use models::{
    LinearModel, ModelLoader, ModelLoaders, ModelMetadata, TrainableModel, TrainingParams,
    TrainingResult,
};
pub use registry::{ModelRegistry, ModelVersion, ReconcileReport};
pub use serving::{ModelSource, ResolvedModel, ServingCache, price_model_id};
pub use store::ModelStore;
pub use volatility::{GarchEstimator, GarchFit, GarchParameters, VolatilityPrediction};
