//! Per-symbol model serving cache
//!
//! Entries are immutable `Arc<CacheEntry>` values swapped whole in a
//! `DashMap`, so a concurrent reader sees either the previous entry or the
//! fully loaded replacement.

use crate::clock::Clock;
use crate::error::{PredictionError, PredictionResult};
use crate::models::{ModelMetadata, TrainableModel, TrainingParams};
use crate::registry::{ModelRegistry, ModelVersion};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Model id suffix for per-asset price models
pub const PRICE_MODEL_SUFFIX: &str = "_price_prediction";

/// Registry model id serving price predictions for `symbol`
pub fn price_model_id(symbol: &str) -> String {
    format!("{symbol}{PRICE_MODEL_SUFFIX}")
}

/// Loaded model held for one symbol
#[derive(Debug)]
pub struct CacheEntry {
    /// Shared model handle
    pub model: Arc<dyn TrainableModel>,
    /// Registry version the handle was loaded from
    pub version: ModelVersion,
    /// When the handle was installed
    pub loaded_at: DateTime<Utc>,
}

/// Where a resolved model came from
#[derive(Debug, Clone)]
pub enum ModelSource {
    /// Served from the cache without touching the registry
    Cached(ModelVersion),
    /// Freshly loaded from the registry
    Registry(ModelVersion),
    /// Process-wide shared fallback model
    Fallback,
}

impl ModelSource {
    /// Version string to report to callers
    pub fn version_label(&self) -> String {
        match self {
            Self::Cached(version) | Self::Registry(version) => version.version.clone(),
            Self::Fallback => "fallback".to_string(),
        }
    }
}

/// A model chosen for a symbol
#[derive(Debug, Clone)]
pub struct ResolvedModel {
    /// Model handle
    pub model: Arc<dyn TrainableModel>,
    /// Resolution path
    pub source: ModelSource,
}

/// Per-symbol model cache in front of the [`ModelRegistry`]
pub struct ServingCache {
    registry: Arc<ModelRegistry>,
    clock: Arc<dyn Clock>,
    entries: DashMap<String, Arc<CacheEntry>>,
    fallback: RwLock<Option<Arc<dyn TrainableModel>>>,
    update_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl std::fmt::Debug for ServingCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServingCache")
            .field("cached_symbols", &self.entries.len())
            .field("has_fallback", &self.fallback.read().is_some())
            .finish_non_exhaustive()
    }
}

impl ServingCache {
    /// Empty cache over `registry`
    pub fn new(registry: Arc<ModelRegistry>, clock: Arc<dyn Clock>) -> Self {
        Self {
            registry,
            clock,
            entries: DashMap::new(),
            fallback: RwLock::new(None),
            update_locks: DashMap::new(),
        }
    }

    /// Underlying registry
    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// Install the shared fallback model
    pub fn set_fallback(&self, model: Arc<dyn TrainableModel>) {
        *self.fallback.write() = Some(model);
        info!("Installed shared fallback model");
    }

    /// Remove the shared fallback model
    pub fn clear_fallback(&self) {
        *self.fallback.write() = None;
    }

    /// Resolve the model to serve for `symbol`
    pub fn resolve(&self, symbol: &str) -> Option<ResolvedModel> {
        let model_id = price_model_id(symbol);

        if let Some(entry) = self.entry(symbol) {
            if !self.is_stale(&entry, &model_id) {
                debug!("Cache hit for {} ({} v{})", symbol, model_id, entry.version.version);
                return Some(ResolvedModel {
                    model: Arc::clone(&entry.model),
                    source: ModelSource::Cached(entry.version.clone()),
                });
            }
            if !self.is_registered(&entry.version) {
                self.entries
                    .remove_if(symbol, |_, current| Arc::ptr_eq(current, &entry));
                info!(
                    "Dropped cached {} v{} for {}: version was deleted",
                    model_id, entry.version.version, symbol
                );
            }
        }

        if let Some(latest) = self.registry.get_latest_version(&model_id) {
            match self.registry.load_version(&latest) {
                Ok(model) => {
                    let installed = self.install(
                        symbol,
                        Arc::new(CacheEntry {
                            model: Arc::from(model),
                            version: latest,
                            loaded_at: self.clock.now(),
                        }),
                    );
                    info!("Loaded {} v{} for {}", model_id, installed.version.version, symbol);
                    return Some(ResolvedModel {
                        model: Arc::clone(&installed.model),
                        source: ModelSource::Registry(installed.version.clone()),
                    });
                }
                Err(e) => warn!("Failed to load {} v{}: {}", model_id, latest.version, e),
            }
        }

        let fallback = self.fallback.read().clone();
        fallback.map(|model| {
            debug!("Serving shared fallback model for {}", symbol);
            ResolvedModel {
                model,
                source: ModelSource::Fallback,
            }
        })
    }

    /// Like [`ServingCache::resolve`], failing with `ModelNotAvailable`
    pub fn resolve_required(&self, symbol: &str) -> PredictionResult<ResolvedModel> {
        self.resolve(symbol)
            .ok_or_else(|| PredictionError::ModelNotAvailable {
                symbol: symbol.to_string(),
            })
    }

    /// Whether the next resolve for `symbol` must consult the registry
    pub fn check_for_update(&self, symbol: &str) -> bool {
        match self.entry(symbol) {
            Some(entry) => self.is_stale(&entry, &price_model_id(symbol)),
            None => true,
        }
    }

    /// Train the current model for `symbol` on one batch and register the result as a new version
    pub fn update(
        &self,
        symbol: &str,
        batch: &[Vec<f64>],
        targets: &[Vec<f64>],
        learning_rate: f64,
    ) -> PredictionResult<ModelVersion> {
        if batch.is_empty() || batch.len() != targets.len() {
            return Err(PredictionError::invalid_input(format!(
                "update batch has {} inputs and {} targets",
                batch.len(),
                targets.len()
            )));
        }

        let lock = Arc::clone(self.update_locks.entry(symbol.to_string()).or_default().value());
        let _guard = lock.lock();

        let base = self.resolve_required(symbol)?;
        let mut model = base.model.clone_model();
        let params = TrainingParams {
            epochs: 1,
            learning_rate,
            validation_split: 0.0,
        };
        let result = model
            .train(batch, targets, &params)
            .map_err(PredictionError::Model)?;

        let output_size = targets.first().map_or(1, Vec::len);
        let metadata = ModelMetadata::from_training(model.as_ref(), output_size, &result, &params)
            .with_tag("symbol", symbol)
            .with_tag("update", "online")
            .with_tag("parent_version", base.source.version_label());

        let model_id = price_model_id(symbol);
        let version = self.registry.register_next(model.as_ref(), &model_id, metadata)?;

        self.install(
            symbol,
            Arc::new(CacheEntry {
                model: Arc::from(model),
                version: version.clone(),
                loaded_at: self.clock.now(),
            }),
        );
        info!(
            "Online update for {} registered {} v{} (loss {:.6})",
            symbol, model_id, version.version, result.final_loss
        );
        Ok(version)
    }

    /// Drop the cache entry for `symbol`
    pub fn invalidate(&self, symbol: &str) {
        if self.entries.remove(symbol).is_some() {
            debug!("Invalidated cache entry for {}", symbol);
        }
    }

    /// Delete all registry models for `asset_prefix` and the matching cache entries
    pub fn delete_models(&self, asset_prefix: &str) -> PredictionResult<usize> {
        let removed = self.registry.delete_models(asset_prefix)?;
        self.entries
            .retain(|symbol, _| !price_model_id(symbol).starts_with(asset_prefix));
        Ok(removed)
    }

    /// Symbols with a cache entry, sorted
    pub fn cached_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        symbols.sort();
        symbols
    }

    /// Current cache entry for `symbol`
    pub fn entry(&self, symbol: &str) -> Option<Arc<CacheEntry>> {
        self.entries.get(symbol).map(|e| Arc::clone(e.value()))
    }

    /// Stale when a newer version was registered after loading, or the cached version is gone
    fn is_stale(&self, entry: &CacheEntry, model_id: &str) -> bool {
        !self.is_registered(&entry.version)
            || self
                .registry
                .get_latest_version(model_id)
                .is_some_and(|latest| latest.created_at > entry.loaded_at)
    }

    fn is_registered(&self, version: &ModelVersion) -> bool {
        self.registry
            .get_version(&version.model_id, &version.version)
            .is_some()
    }

    /// Swap in `entry` unless the cache already holds a newer, still registered version
    fn install(&self, symbol: &str, entry: Arc<CacheEntry>) -> Arc<CacheEntry> {
        match self.entries.entry(symbol.to_string()) {
            Entry::Occupied(mut slot) => {
                let current = slot.get();
                if current.version.is_newer_than(&entry.version)
                    && self.is_registered(&current.version)
                {
                    Arc::clone(slot.get())
                } else {
                    slot.insert(Arc::clone(&entry));
                    entry
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&entry));
                entry
            }
        }
    }
}
