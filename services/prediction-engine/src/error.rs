//! Error types for the prediction engine

use thiserror::Error;

/// Prediction engine error types
#[derive(Error, Debug)]
pub enum PredictionError {
    /// Not enough observations to fit a model
    #[error("Insufficient data: need at least {required} observations, got {actual}")]
    InsufficientData {
        /// Minimum number of observations required
        required: usize,
        /// Number of observations supplied
        actual: usize,
    },

    /// Requested model version is absent from the registry
    #[error("Model not found: {model_id} (version {})", .version.as_deref().unwrap_or("latest"))]
    ModelNotFound {
        /// Model identifier that was looked up
        model_id: String,
        /// Version that was requested, `None` for latest
        version: Option<String>,
    },

    /// Artifact bytes on disk no longer match the recorded digest
    #[error("Checksum mismatch for {model_id} v{version}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Model identifier of the corrupted artifact
        model_id: String,
        /// Version of the corrupted artifact
        version: String,
        /// Digest recorded at registration
        expected: String,
        /// Digest of the bytes currently on disk
        actual: String,
    },

    /// No cached, registry or fallback model could be resolved
    #[error("No model available for symbol {symbol}")]
    ModelNotAvailable {
        /// Symbol the caller asked for
        symbol: String,
    },

    /// A version with the same identifier is already registered
    #[error("Version {version} of {model_id} is already registered")]
    DuplicateVersion {
        /// Model identifier
        model_id: String,
        /// Conflicting version string
        version: String,
    },

    /// No loader is registered for an artifact's model type
    #[error("No loader registered for model type {model_type}")]
    UnknownModelType {
        /// Model type recorded in the index
        model_type: String,
    },

    /// Caller supplied an unusable argument
    #[error("Invalid input: {reason}")]
    InvalidInput {
        /// Why the input was rejected
        reason: String,
    },

    /// Store read/write/delete failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Index file could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Failure raised by an opaque trainable model
    #[error("Model error: {0}")]
    Model(#[source] anyhow::Error),
}

impl PredictionError {
    /// Shorthand for [`PredictionError::InvalidInput`]
    pub fn invalid_input(reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            reason: reason.into(),
        }
    }
}

/// Type alias for prediction engine results
pub type PredictionResult<T> = Result<T, PredictionError>;
