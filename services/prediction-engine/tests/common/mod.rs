//! Shared fixtures for prediction-engine tests

#![allow(dead_code)]

use anyhow::Result;
use ndarray::array;
use prediction_engine::registry::DEFAULT_INDEX_FILE;
use prediction_engine::{
    LinearModel, ManualClock, ModelLoaders, ModelMetadata, ModelRegistry, ModelStore, ModelVersion,
    ServingCache, price_model_id,
};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use std::sync::Arc;
use tempfile::TempDir;

/// Registry, cache and manual clock over a temporary directory
pub struct Harness {
    pub dir: TempDir,
    pub clock: Arc<ManualClock>,
    pub registry: Arc<ModelRegistry>,
    pub cache: Arc<ServingCache>,
}

impl Harness {
    pub fn new(start_secs: i64) -> Result<Self> {
        let dir = TempDir::new()?;
        let clock = Arc::new(ManualClock::at_secs(start_secs));
        let registry = Arc::new(open_registry(&dir, Arc::clone(&clock))?);
        let cache = Arc::new(ServingCache::new(Arc::clone(&registry), clock.clone()));
        Ok(Self {
            dir,
            clock,
            registry,
            cache,
        })
    }

    /// Register a two-input linear price model for `symbol` that always predicts `bias` at the origin
    pub fn register(&self, symbol: &str, version: &str, bias: f64) -> Result<ModelVersion> {
        let entry = self.registry.register(
            &two_input_model(bias),
            &price_model_id(symbol),
            version,
            ModelMetadata::default().with_tag("symbol", symbol),
        )?;
        Ok(entry)
    }
}

pub fn open_registry(dir: &TempDir, clock: Arc<ManualClock>) -> Result<ModelRegistry> {
    let store = ModelStore::open(dir.path())?;
    let registry = ModelRegistry::open(store, DEFAULT_INDEX_FILE, ModelLoaders::with_builtin(), clock)?;
    Ok(registry)
}

pub fn two_input_model(bias: f64) -> LinearModel {
    LinearModel::from_weights(array![0.5, -0.25], bias)
}

/// Simulated GARCH(1,1) returns, started from the unconditional variance
pub fn simulate_garch(n: usize, omega: f64, alpha: f64, beta: f64, seed: u64) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 1.0).unwrap();
    let mut variance = omega / (1.0 - alpha - beta);
    let mut returns = Vec::with_capacity(n);
    for _ in 0..n {
        let shock = variance.sqrt() * normal.sample(&mut rng);
        returns.push(shock);
        variance = omega + alpha * shock * shock + beta * variance;
    }
    returns
}

/// Price path compounding `returns` from 100.0
pub fn prices_from_returns(returns: &[f64]) -> Vec<f64> {
    let mut price = 100.0;
    let mut prices = Vec::with_capacity(returns.len() + 1);
    prices.push(price);
    for r in returns {
        price *= r.exp();
        prices.push(price);
    }
    prices
}
