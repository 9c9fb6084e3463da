//! Linear regression model with online SGD updates

use super::{ModelLoader, TrainableModel, TrainingParams, TrainingResult};
use anyhow::{Context, Result, bail};
use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// Model type tag for [`LinearModel`]
pub const MODEL_TYPE: &str = "linear";

/// On-disk encoding of a model artifact
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactFormat {
    /// Human-readable JSON (`.json`)
    #[default]
    Json,
    /// Compact bincode (`.bin`)
    Bincode,
}

impl ArtifactFormat {
    /// File extension for this format
    pub fn extension(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Bincode => "bin",
        }
    }

    /// Format implied by the extension of `path`
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Some(Self::Json),
            Some("bin") => Some(Self::Bincode),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct LinearArtifact {
    weights: Array1<f64>,
    bias: f64,
    training_samples: u64,
}

/// Single-output linear model
#[derive(Debug, Clone)]
pub struct LinearModel {
    weights: Array1<f64>,
    bias: f64,
    training_samples: u64,
    format: ArtifactFormat,
}

impl LinearModel {
    /// Zero-initialized model for `input_dim` features
    pub fn new(input_dim: usize) -> Self {
        Self::from_weights(Array1::zeros(input_dim), 0.0)
    }

    /// Initialize with pretrained weights
    pub fn from_weights(weights: Array1<f64>, bias: f64) -> Self {
        Self {
            weights,
            bias,
            training_samples: 0,
            format: ArtifactFormat::default(),
        }
    }

    /// Persist artifacts in `format`
    #[must_use]
    pub fn with_format(mut self, format: ArtifactFormat) -> Self {
        self.format = format;
        self
    }

    /// Current weights
    pub fn weights(&self) -> ArrayView1<'_, f64> {
        self.weights.view()
    }

    /// Current bias
    pub fn bias(&self) -> f64 {
        self.bias
    }

    /// Samples seen across all training runs
    pub fn training_samples(&self) -> u64 {
        self.training_samples
    }

    /// Read a model back from an artifact written by [`TrainableModel::save`]
    pub fn load(path: &Path) -> Result<Self> {
        let format = ArtifactFormat::from_path(path)
            .with_context(|| format!("Unrecognized artifact extension: {}", path.display()))?;
        let file = File::open(path)
            .with_context(|| format!("Failed to open artifact {}", path.display()))?;
        let reader = BufReader::new(file);

        let artifact: LinearArtifact = match format {
            ArtifactFormat::Json => serde_json::from_reader(reader)?,
            ArtifactFormat::Bincode => bincode::deserialize_from(reader)?,
        };

        Ok(Self {
            weights: artifact.weights,
            bias: artifact.bias,
            training_samples: artifact.training_samples,
            format,
        })
    }

    fn output(&self, input: ArrayView1<'_, f64>) -> f64 {
        input.dot(&self.weights) + self.bias
    }

    fn check_dimension(&self, len: usize) -> Result<()> {
        if len != self.weights.len() {
            bail!(
                "Feature dimension mismatch: expected {}, got {}",
                self.weights.len(),
                len
            );
        }
        Ok(())
    }

    fn mean_squared_error(&self, inputs: &[Array1<f64>], targets: &[f64]) -> f64 {
        if inputs.is_empty() {
            return 0.0;
        }
        let total: f64 = inputs
            .iter()
            .zip(targets)
            .map(|(x, y)| (self.output(x.view()) - y).powi(2))
            .sum();
        total / inputs.len() as f64
    }
}

impl TrainableModel for LinearModel {
    fn model_type(&self) -> &str {
        MODEL_TYPE
    }

    fn artifact_extension(&self) -> &str {
        self.format.extension()
    }

    fn input_size(&self) -> usize {
        self.weights.len()
    }

    fn predict(&self, input: &[f64]) -> Result<Vec<f64>> {
        self.check_dimension(input.len())?;
        Ok(vec![self.output(ArrayView1::from(input))])
    }

    fn train(
        &mut self,
        inputs: &[Vec<f64>],
        targets: &[Vec<f64>],
        params: &TrainingParams,
    ) -> Result<TrainingResult> {
        if inputs.is_empty() {
            bail!("Empty training batch");
        }
        if inputs.len() != targets.len() {
            bail!(
                "Batch size mismatch: {} inputs, {} targets",
                inputs.len(),
                targets.len()
            );
        }

        let mut samples = Vec::with_capacity(inputs.len());
        let mut labels = Vec::with_capacity(targets.len());
        for (input, target) in inputs.iter().zip(targets) {
            self.check_dimension(input.len())?;
            let label = target.first().copied().context("Empty target vector")?;
            samples.push(Array1::from_vec(input.clone()));
            labels.push(label);
        }

        let holdout = (samples.len() as f64 * params.validation_split.clamp(0.0, 0.5)) as usize;
        let split = samples.len() - holdout;
        let (train_x, valid_x) = samples.split_at(split);
        let (train_y, valid_y) = labels.split_at(split);

        let epochs = params.epochs.max(1);
        let mut best_loss = f64::INFINITY;
        let mut final_loss = f64::INFINITY;

        for _ in 0..epochs {
            for (x, y) in train_x.iter().zip(train_y) {
                let error = self.output(x.view()) - y;
                self.weights.scaled_add(-params.learning_rate * error, x);
                self.bias -= params.learning_rate * error;
            }
            final_loss = self.mean_squared_error(train_x, train_y);
            best_loss = best_loss.min(final_loss);
        }

        self.training_samples += (train_x.len() * epochs) as u64;

        let validation_loss = (!valid_x.is_empty()).then(|| self.mean_squared_error(valid_x, valid_y));

        Ok(TrainingResult {
            final_loss,
            best_loss,
            epochs,
            validation_loss,
        })
    }

    fn save(&self, path: &Path) -> Result<()> {
        let artifact = LinearArtifact {
            weights: self.weights.clone(),
            bias: self.bias,
            training_samples: self.training_samples,
        };

        let file = File::create(path)
            .with_context(|| format!("Failed to create artifact {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        match self.format {
            ArtifactFormat::Json => serde_json::to_writer(&mut writer, &artifact)?,
            ArtifactFormat::Bincode => bincode::serialize_into(&mut writer, &artifact)?,
        }
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()
            .with_context(|| format!("Failed to sync artifact {}", path.display()))?;
        Ok(())
    }

    fn clone_model(&self) -> Box<dyn TrainableModel> {
        Box::new(self.clone())
    }
}

/// [`ModelLoader`] for [`LinearModel`] artifacts
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearModelLoader;

impl ModelLoader for LinearModelLoader {
    fn load(&self, path: &Path) -> Result<Box<dyn TrainableModel>> {
        Ok(Box::new(LinearModel::load(path)?))
    }

    fn artifact_extensions(&self) -> &[&str] {
        &["json", "bin"]
    }
}
