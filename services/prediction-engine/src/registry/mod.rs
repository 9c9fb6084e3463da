//! Versioned, integrity-checked model registry
//!
//! Consistency strategy: an artifact is staged, checksummed and renamed into
//! place before the index that references it is persisted, and the in-memory
//! index is only swapped after the persisted write succeeds. Deletions run in
//! the opposite order (index first, then files). A crash can therefore leave
//! an orphaned artifact, which [`ModelRegistry::reconcile`] removes, but never
//! an index entry pointing at a half-written file. An index entry whose file
//! went missing out-of-band is reported as [`PredictionError::ModelNotFound`].

use crate::clock::Clock;
use crate::error::{PredictionError, PredictionResult};
use crate::models::{ModelLoaders, ModelMetadata, TrainableModel};
use crate::store::ModelStore;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default index file name
pub const DEFAULT_INDEX_FILE: &str = "registry.json";

/// One persisted model artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVersion {
    /// Version string, sorts with creation order
    pub version: String,
    /// Stable model identifier (e.g. "BTC_price_prediction")
    pub model_id: String,
    /// Model type tag used to pick a loader
    pub model_type: String,
    /// Registration time
    pub created_at: DateTime<Utc>,
    /// Training provenance
    pub metadata: ModelMetadata,
    /// Artifact file name inside the store
    pub file_path: String,
    /// Hex SHA-256 of the artifact bytes
    pub checksum: String,
}

impl ModelVersion {
    fn sort_key(&self) -> (DateTime<Utc>, &str) {
        (self.created_at, self.version.as_str())
    }

    /// Whether `self` sorts after `other` by creation time, then version string
    pub fn is_newer_than(&self, other: &ModelVersion) -> bool {
        self.sort_key() > other.sort_key()
    }
}

/// Mapping of model id to its versions, oldest first
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegistryIndex {
    models: BTreeMap<String, Vec<ModelVersion>>,
}

impl RegistryIndex {
    fn insert(&mut self, entry: ModelVersion) {
        let versions = self.models.entry(entry.model_id.clone()).or_default();
        versions.push(entry);
        versions.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    }

    fn latest(&self, model_id: &str) -> Option<&ModelVersion> {
        self.models.get(model_id).and_then(|versions| versions.last())
    }

    fn find(&self, model_id: &str, version: &str) -> Option<&ModelVersion> {
        self.models
            .get(model_id)?
            .iter()
            .find(|entry| entry.version == version)
    }

    fn normalize(&mut self) {
        self.models.retain(|_, versions| !versions.is_empty());
        for versions in self.models.values_mut() {
            versions.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        }
    }

    fn owner_of(&self, file_name: &str) -> Option<&ModelVersion> {
        self.models
            .values()
            .flatten()
            .find(|entry| entry.file_path == file_name)
    }

    fn referenced_files(&self) -> BTreeSet<&str> {
        self.models
            .values()
            .flatten()
            .map(|entry| entry.file_path.as_str())
            .collect()
    }
}

/// Outcome of [`ModelRegistry::reconcile`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Interrupted staging files deleted
    pub stale_staging_removed: usize,
    /// Artifacts no index entry referenced, now deleted
    pub orphaned_artifacts_removed: Vec<String>,
    /// `(model_id, version)` entries whose artifact is missing
    pub missing_artifacts: Vec<(String, String)>,
}

/// Versioned model registry over a [`ModelStore`]
pub struct ModelRegistry {
    store: ModelStore,
    index_file: String,
    loaders: ModelLoaders,
    clock: Arc<dyn Clock>,
    index: RwLock<Arc<RegistryIndex>>,
    mutation: Mutex<()>,
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("root", &self.store.root())
            .field("index_file", &self.index_file)
            .field("loaders", &self.loaders)
            .finish_non_exhaustive()
    }
}

impl ModelRegistry {
    /// Open a registry over `store`, loading `index_file` if it exists
    pub fn open(
        store: ModelStore,
        index_file: impl Into<String>,
        loaders: ModelLoaders,
        clock: Arc<dyn Clock>,
    ) -> PredictionResult<Self> {
        let index_file = index_file.into();
        let mut index = if store.exists(&index_file) {
            serde_json::from_slice::<RegistryIndex>(&store.read(&index_file)?)?
        } else {
            RegistryIndex::default()
        };
        index.normalize();

        info!(
            "Loaded model registry from {} with {} models",
            store.path_of(&index_file).display(),
            index.models.len()
        );

        Ok(Self {
            store,
            index_file,
            loaders,
            clock,
            index: RwLock::new(Arc::new(index)),
            mutation: Mutex::new(()),
        })
    }

    /// Underlying store
    pub fn store(&self) -> &ModelStore {
        &self.store
    }

    /// Register `model` as `version` of `model_id`
    pub fn register(
        &self,
        model: &dyn TrainableModel,
        model_id: &str,
        version: &str,
        metadata: ModelMetadata,
    ) -> PredictionResult<ModelVersion> {
        let _guard = self.mutation.lock();
        self.register_locked(model, model_id, Some(version), metadata)
    }

    /// Register `model` under a freshly generated, timestamp-derived version
    pub fn register_next(
        &self,
        model: &dyn TrainableModel,
        model_id: &str,
        metadata: ModelMetadata,
    ) -> PredictionResult<ModelVersion> {
        let _guard = self.mutation.lock();
        self.register_locked(model, model_id, None, metadata)
    }

    fn register_locked(
        &self,
        model: &dyn TrainableModel,
        model_id: &str,
        version: Option<&str>,
        metadata: ModelMetadata,
    ) -> PredictionResult<ModelVersion> {
        validate_component("model id", model_id)?;
        let current = self.snapshot();
        let created_at = self.clock.now();

        let version = match version {
            Some(version) => {
                validate_component("version", version)?;
                if current.find(model_id, version).is_some() {
                    return Err(PredictionError::DuplicateVersion {
                        model_id: model_id.to_string(),
                        version: version.to_string(),
                    });
                }
                version.to_string()
            }
            None => next_version(&current, model_id, created_at),
        };

        let file_name = format!("{model_id}_v{version}.{}", model.artifact_extension());
        if let Some(owner) = current.owner_of(&file_name) {
            return Err(PredictionError::invalid_input(format!(
                "{model_id} v{version} would overwrite artifact {file_name} of {} v{}",
                owner.model_id, owner.version
            )));
        }
        let staging = self.store.staging_path(&file_name);
        if let Err(e) = model.save(&staging) {
            self.store.discard(&staging);
            return Err(PredictionError::Model(e));
        }
        let bytes = match fs::read(&staging) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.store.discard(&staging);
                return Err(PredictionError::Io(e));
            }
        };
        let checksum = ModelStore::compute_checksum(&bytes);
        self.store.commit(&staging, &file_name)?;

        let entry = ModelVersion {
            version,
            model_id: model_id.to_string(),
            model_type: model.model_type().to_string(),
            created_at,
            metadata,
            file_path: file_name,
            checksum,
        };

        let mut next = (*current).clone();
        next.insert(entry.clone());
        if let Err(e) = self.persist(&next) {
            if let Err(cleanup) = self.store.remove(&entry.file_path) {
                warn!("Failed to remove unindexed artifact {}: {}", entry.file_path, cleanup);
            }
            return Err(e);
        }
        *self.index.write() = Arc::new(next);

        info!(
            "Registered {} v{} ({} bytes, checksum {})",
            entry.model_id,
            entry.version,
            bytes.len(),
            &entry.checksum[..12]
        );
        Ok(entry)
    }

    /// Newest version of `model_id`; equal timestamps resolve to the greater version string
    pub fn get_latest_version(&self, model_id: &str) -> Option<ModelVersion> {
        self.index.read().latest(model_id).cloned()
    }

    /// Exact `(model_id, version)` lookup
    pub fn get_version(&self, model_id: &str, version: &str) -> Option<ModelVersion> {
        self.index.read().find(model_id, version).cloned()
    }

    /// Versions of `model_id`, newest first
    pub fn list_versions(&self, model_id: &str) -> Vec<ModelVersion> {
        self.index
            .read()
            .models
            .get(model_id)
            .map(|versions| versions.iter().rev().cloned().collect())
            .unwrap_or_default()
    }

    /// All registered model ids
    pub fn model_ids(&self) -> Vec<String> {
        self.index.read().models.keys().cloned().collect()
    }

    /// Load `version` of `model_id`, or its latest version when `None`
    pub fn load_model(
        &self,
        model_id: &str,
        version: Option<&str>,
    ) -> PredictionResult<Box<dyn TrainableModel>> {
        let entry = match version {
            Some(version) => self.get_version(model_id, version),
            None => self.get_latest_version(model_id),
        }
        .ok_or_else(|| PredictionError::ModelNotFound {
            model_id: model_id.to_string(),
            version: version.map(str::to_string),
        })?;

        self.load_version(&entry)
    }

    /// Load the artifact described by `entry`, verifying its checksum
    pub fn load_version(&self, entry: &ModelVersion) -> PredictionResult<Box<dyn TrainableModel>> {
        if !self.store.exists(&entry.file_path) {
            warn!(
                "Index entry {} v{} has no artifact at {}",
                entry.model_id, entry.version, entry.file_path
            );
            return Err(PredictionError::ModelNotFound {
                model_id: entry.model_id.clone(),
                version: Some(entry.version.clone()),
            });
        }

        let bytes = self.store.read(&entry.file_path)?;
        let actual = ModelStore::compute_checksum(&bytes);
        if actual != entry.checksum {
            warn!(
                "Checksum mismatch for {} v{}: expected {}, got {}",
                entry.model_id, entry.version, entry.checksum, actual
            );
            return Err(PredictionError::ChecksumMismatch {
                model_id: entry.model_id.clone(),
                version: entry.version.clone(),
                expected: entry.checksum.clone(),
                actual,
            });
        }

        let loader =
            self.loaders
                .get(&entry.model_type)
                .ok_or_else(|| PredictionError::UnknownModelType {
                    model_type: entry.model_type.clone(),
                })?;

        // Deserialize the verified bytes, not whatever the artifact holds by now.
        let verified = self.store.verify_path(&entry.file_path);
        fs::write(&verified, &bytes)?;
        let loaded = loader.load(&verified);
        self.store.discard(&verified);

        debug!("Loaded {} v{}", entry.model_id, entry.version);
        loaded.map_err(PredictionError::Model)
    }

    /// Delete one version and its artifact
    pub fn delete_version(&self, model_id: &str, version: &str) -> PredictionResult<()> {
        let _guard = self.mutation.lock();
        let current = self.snapshot();
        let entry = current
            .find(model_id, version)
            .cloned()
            .ok_or_else(|| PredictionError::ModelNotFound {
                model_id: model_id.to_string(),
                version: Some(version.to_string()),
            })?;

        let mut next = (*current).clone();
        if let Some(versions) = next.models.get_mut(model_id) {
            versions.retain(|v| v.version != version);
            if versions.is_empty() {
                next.models.remove(model_id);
            }
        }
        self.persist(&next)?;
        *self.index.write() = Arc::new(next);

        self.store.remove(&entry.file_path)?;
        info!("Deleted {} v{}", model_id, version);
        Ok(())
    }

    /// Delete every model whose id starts with `asset_prefix`, returning the number of versions removed
    pub fn delete_models(&self, asset_prefix: &str) -> PredictionResult<usize> {
        let _guard = self.mutation.lock();
        let current = self.snapshot();

        let mut next = (*current).clone();
        let mut removed = Vec::new();
        next.models.retain(|model_id, versions| {
            if model_id.starts_with(asset_prefix) {
                removed.append(versions);
                false
            } else {
                true
            }
        });

        if removed.is_empty() {
            return Ok(0);
        }
        self.persist(&next)?;
        *self.index.write() = Arc::new(next);

        for entry in &removed {
            if let Err(e) = self.store.remove(&entry.file_path) {
                warn!("Failed to delete artifact {}: {}", entry.file_path, e);
            }
        }

        info!("Deleted {} versions for prefix {}", removed.len(), asset_prefix);
        Ok(removed.len())
    }

    /// All versions across models whose id starts with `asset_prefix`, newest first
    pub fn list_models(&self, asset_prefix: &str) -> Vec<ModelVersion> {
        let index = self.index.read();
        let mut versions: Vec<ModelVersion> = index
            .models
            .iter()
            .filter(|(model_id, _)| model_id.starts_with(asset_prefix))
            .flat_map(|(_, versions)| versions.iter().cloned())
            .collect();
        versions.sort_by(|a, b| b.sort_key().cmp(&a.sort_key()));
        versions
    }

    /// Remove leftovers of interrupted writes and report dangling index entries
    ///
    /// Only files named like an artifact (`{model_id}_v{version}.{ext}` with an
    /// extension some loader or index entry uses) count as orphans. Anything
    /// else sharing the directory is left alone.
    pub fn reconcile(&self) -> PredictionResult<ReconcileReport> {
        let _guard = self.mutation.lock();
        let current = self.snapshot();
        let referenced = current.referenced_files();

        let mut extensions = self.loaders.artifact_extensions();
        extensions.extend(
            referenced
                .iter()
                .filter_map(|name| name.rsplit_once('.'))
                .map(|(_, ext)| ext.to_string()),
        );

        let stale_staging_removed = self.store.remove_stale_staging()?;

        let mut orphaned_artifacts_removed = Vec::new();
        for name in self.store.list_files(&self.index_file)? {
            if !referenced.contains(name.as_str()) && is_artifact_name(&name, &extensions) {
                self.store.remove(&name)?;
                warn!("Removed orphaned artifact {}", name);
                orphaned_artifacts_removed.push(name);
            }
        }

        let missing_artifacts = current
            .models
            .values()
            .flatten()
            .filter(|entry| !self.store.exists(&entry.file_path))
            .map(|entry| (entry.model_id.clone(), entry.version.clone()))
            .collect();

        Ok(ReconcileReport {
            stale_staging_removed,
            orphaned_artifacts_removed,
            missing_artifacts,
        })
    }

    fn snapshot(&self) -> Arc<RegistryIndex> {
        Arc::clone(&self.index.read())
    }

    fn persist(&self, index: &RegistryIndex) -> PredictionResult<()> {
        let bytes = serde_json::to_vec_pretty(index)?;
        self.store.write(&self.index_file, &bytes)
    }
}

fn validate_component(what: &str, value: &str) -> PredictionResult<()> {
    if value.is_empty() || value.contains(['/', '\\']) || value.starts_with('.') {
        return Err(PredictionError::invalid_input(format!(
            "{what} {value:?} is not a valid file name component"
        )));
    }
    Ok(())
}

/// Whether `name` has the `{model_id}_v{version}.{ext}` shape of a registered artifact
fn is_artifact_name(name: &str, extensions: &BTreeSet<String>) -> bool {
    let Some((stem, ext)) = name.rsplit_once('.') else {
        return false;
    };
    extensions.contains(ext)
        && stem
            .rsplit_once("_v")
            .is_some_and(|(model_id, version)| !model_id.is_empty() && !version.is_empty())
}

/// Timestamp-derived version for `created_at`, unique within `model_id`
fn next_version(index: &RegistryIndex, model_id: &str, created_at: DateTime<Utc>) -> String {
    let base = created_at.format("%Y%m%dT%H%M%S%.9f").to_string();
    if index.find(model_id, &base).is_none() {
        return base;
    }
    (1u32..)
        .map(|n| format!("{base}-{n:04}"))
        .find(|candidate| index.find(model_id, candidate).is_none())
        .unwrap_or(base)
}
