//! Statistical volatility estimators

pub mod garch;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use garch::{GarchConfig, GarchEstimator, GarchFit, GarchParameters, IterationState, log_returns};

/// Volatility forecast for one symbol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolatilityPrediction {
    /// Trading symbol
    pub symbol: String,
    /// When the forecast was produced
    pub timestamp: DateTime<Utc>,
    /// Number of forecast steps
    pub horizon: usize,
    /// Forecast volatility per step
    pub predicted_volatility: Vec<f64>,
    /// Goodness of fit in `[0, 1]`
    pub confidence: f64,
    /// Fitted model parameters
    pub parameters: GarchParameters,
    /// Coefficient of determination of the variance fit
    pub r2: f64,
    /// Mean squared error of the variance fit
    pub mse: f64,
}

impl VolatilityPrediction {
    /// Forecast `horizon` steps from `fit`
    pub fn from_fit(
        symbol: impl Into<String>,
        timestamp: DateTime<Utc>,
        horizon: usize,
        fit: &GarchFit,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            timestamp,
            horizon,
            predicted_volatility: fit.forecast(horizon),
            confidence: fit.confidence(),
            parameters: fit.parameters,
            r2: fit.r2(),
            mse: fit.mse(),
        }
    }
}
