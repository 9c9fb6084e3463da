//! Trainable model boundary
//!
//! The registry and serving cache only ever see models through
//! [`TrainableModel`] and [`ModelLoader`]. Concrete architectures live
//! behind these traits.

pub mod linear;

use anyhow::Result;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

pub use linear::{LinearModel, LinearModelLoader};

/// Base trait for all persisted prediction models
pub trait TrainableModel: Send + Sync {
    /// Model type tag, used to pick a loader when reading an artifact back
    fn model_type(&self) -> &str;

    /// File extension of the artifact written by [`TrainableModel::save`]
    fn artifact_extension(&self) -> &str;

    /// Expected length of the input vector
    fn input_size(&self) -> usize;

    /// Make a prediction for one input vector
    fn predict(&self, input: &[f64]) -> Result<Vec<f64>>;

    /// Fit the model to a batch of samples
    fn train(
        &mut self,
        inputs: &[Vec<f64>],
        targets: &[Vec<f64>],
        params: &TrainingParams,
    ) -> Result<TrainingResult>;

    /// Serialize the model to `path`
    fn save(&self, path: &Path) -> Result<()>;

    /// Independent copy of this model
    fn clone_model(&self) -> Box<dyn TrainableModel>;
}

impl fmt::Debug for dyn TrainableModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrainableModel")
            .field("model_type", &self.model_type())
            .field("input_size", &self.input_size())
            .finish()
    }
}

/// Reads a model of one type back from an artifact file
pub trait ModelLoader: Send + Sync {
    /// Deserialize the artifact at `path`
    fn load(&self, path: &Path) -> Result<Box<dyn TrainableModel>>;

    /// File extensions this loader writes, without the dot
    fn artifact_extensions(&self) -> &[&str] {
        &[]
    }
}

/// Loaders keyed by [`TrainableModel::model_type`]
#[derive(Clone, Default)]
pub struct ModelLoaders {
    loaders: FxHashMap<String, Arc<dyn ModelLoader>>,
}

impl ModelLoaders {
    /// Empty loader table
    pub fn new() -> Self {
        Self::default()
    }

    /// Loader table with every model type shipped in this crate
    pub fn with_builtin() -> Self {
        let mut loaders = Self::new();
        loaders.register(linear::MODEL_TYPE, LinearModelLoader);
        loaders
    }

    /// Register `loader` for `model_type`, replacing any previous one
    pub fn register(&mut self, model_type: impl Into<String>, loader: impl ModelLoader + 'static) {
        self.loaders.insert(model_type.into(), Arc::new(loader));
    }

    /// Loader for `model_type`
    pub fn get(&self, model_type: &str) -> Option<Arc<dyn ModelLoader>> {
        self.loaders.get(model_type).cloned()
    }

    /// Every artifact extension a registered loader writes
    pub fn artifact_extensions(&self) -> BTreeSet<String> {
        self.loaders
            .values()
            .flat_map(|loader| loader.artifact_extensions().iter().map(|ext| ext.to_string()))
            .collect()
    }
}

impl fmt::Debug for ModelLoaders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&String> = self.loaders.keys().collect();
        types.sort();
        f.debug_struct("ModelLoaders").field("types", &types).finish()
    }
}

/// Hyperparameters for a training run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingParams {
    /// Passes over the batch
    pub epochs: usize,
    /// Step size
    pub learning_rate: f64,
    /// Fraction of samples held out for validation (0.0 disables it)
    pub validation_split: f64,
}

impl Default for TrainingParams {
    fn default() -> Self {
        Self {
            epochs: 1,
            learning_rate: 0.001,
            validation_split: 0.0,
        }
    }
}

/// Outcome of a training run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingResult {
    /// Loss after the last epoch
    pub final_loss: f64,
    /// Lowest loss seen during the run
    pub best_loss: f64,
    /// Epochs completed
    pub epochs: usize,
    /// Loss on the held-out split, if any
    pub validation_loss: Option<f64>,
}

/// Training provenance attached to a registered version
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// Architecture name (e.g. "linear", "lstm")
    pub architecture: String,
    /// Input vector length
    pub input_size: usize,
    /// Output vector length
    pub output_size: usize,
    /// Training epochs behind this version
    pub epochs: usize,
    /// Final training loss
    pub final_loss: f64,
    /// Validation loss, if measured
    pub validation_loss: Option<f64>,
    /// Accuracy, if the model is evaluated as a classifier
    pub accuracy: Option<f64>,
    /// Hyperparameters used for training
    pub hyperparameters: BTreeMap<String, f64>,
    /// Free-form string properties
    pub tags: BTreeMap<String, String>,
}

impl ModelMetadata {
    /// Metadata describing `model` after the training run `result`
    pub fn from_training(
        model: &dyn TrainableModel,
        output_size: usize,
        result: &TrainingResult,
        params: &TrainingParams,
    ) -> Self {
        let mut hyperparameters = BTreeMap::new();
        hyperparameters.insert("learning_rate".to_string(), params.learning_rate);
        hyperparameters.insert("validation_split".to_string(), params.validation_split);

        Self {
            architecture: model.model_type().to_string(),
            input_size: model.input_size(),
            output_size,
            epochs: result.epochs,
            final_loss: result.final_loss,
            validation_loss: result.validation_loss,
            accuracy: None,
            hyperparameters,
            tags: BTreeMap::new(),
        }
    }

    /// Add a string property
    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}
