//! Byte storage for model artifacts and the registry index
//!
//! Every artifact is a single file directly under the store root. Writes go to
//! a hidden staging file first and are renamed into place, so a reader never
//! observes a partially written artifact or index.

use crate::error::{PredictionError, PredictionResult};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Prefix of in-flight staging files
const STAGING_PREFIX: &str = ".staging-";
/// Prefix of private copies held while a verified artifact is deserialized
const VERIFY_PREFIX: &str = ".verify-";

/// Directory-backed artifact store
#[derive(Debug)]
pub struct ModelStore {
    root: PathBuf,
    staging_counter: AtomicU64,
}

impl ModelStore {
    /// Open the store at `root`, creating the directory if needed
    pub fn open(root: impl Into<PathBuf>) -> PredictionResult<Self> {
        let root = root.into();
        if !root.exists() {
            fs::create_dir_all(&root)?;
        }
        info!("Opened model store at {}", root.display());

        Ok(Self {
            root,
            staging_counter: AtomicU64::new(0),
        })
    }

    /// Store root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of the file `name`
    pub fn path_of(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Write `bytes` to `name`, replacing any existing file
    pub fn write(&self, name: &str, bytes: &[u8]) -> PredictionResult<()> {
        let staging = self.staging_path(name);
        let result = (|| -> PredictionResult<()> {
            let mut file = fs::File::create(&staging)?;
            file.write_all(bytes)?;
            file.sync_all()?;
            Ok(())
        })();

        if let Err(e) = result {
            self.discard(&staging);
            return Err(e);
        }

        self.commit(&staging, name)?;
        debug!("Wrote {} bytes to {}", bytes.len(), name);
        Ok(())
    }

    /// Read the whole file `name`
    pub fn read(&self, name: &str) -> PredictionResult<Vec<u8>> {
        Ok(fs::read(self.path_of(name))?)
    }

    /// Whether `name` exists in the store
    pub fn exists(&self, name: &str) -> bool {
        self.path_of(name).is_file()
    }

    /// Remove `name`; a missing file is not an error
    pub fn remove(&self, name: &str) -> PredictionResult<()> {
        match fs::remove_file(self.path_of(name)) {
            Ok(()) => {
                debug!("Removed {}", name);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PredictionError::Io(e)),
        }
    }

    /// Fresh staging path for a file that will be committed as `name`
    pub fn staging_path(&self, name: &str) -> PathBuf {
        let n = self.staging_counter.fetch_add(1, Ordering::Relaxed);
        self.root
            .join(format!("{STAGING_PREFIX}{}-{n}-{name}", std::process::id()))
    }

    /// Fresh private path for deserializing a verified copy of `name`
    ///
    /// These files are never listed and never swept by
    /// [`ModelStore::remove_stale_staging`]; the caller discards them.
    pub fn verify_path(&self, name: &str) -> PathBuf {
        let n = self.staging_counter.fetch_add(1, Ordering::Relaxed);
        self.root
            .join(format!("{VERIFY_PREFIX}{}-{n}-{name}", std::process::id()))
    }

    /// Atomically move a staged file into place as `name`
    pub fn commit(&self, staging: &Path, name: &str) -> PredictionResult<()> {
        if let Err(e) = fs::rename(staging, self.path_of(name)) {
            self.discard(staging);
            return Err(PredictionError::Io(e));
        }
        Ok(())
    }

    /// Best-effort removal of a staging file
    pub fn discard(&self, staging: &Path) {
        if let Err(e) = fs::remove_file(staging) {
            if e.kind() != ErrorKind::NotFound {
                warn!("Failed to discard staging file {}: {}", staging.display(), e);
            }
        }
    }

    /// Names of all committed files, sorted, skipping staging and verify copies and `exclude`
    pub fn list_files(&self, exclude: &str) -> PredictionResult<Vec<String>> {
        let mut names: Vec<String> = fs::read_dir(&self.root)?
            .filter_map(Result::ok)
            .filter(|entry| entry.path().is_file())
            .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
            .filter(|name| {
                !name.starts_with(STAGING_PREFIX)
                    && !name.starts_with(VERIFY_PREFIX)
                    && name != exclude
            })
            .collect();

        names.sort();
        Ok(names)
    }

    /// Delete staging files left behind by an interrupted write
    pub fn remove_stale_staging(&self) -> PredictionResult<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.root)?.filter_map(Result::ok) {
            let is_staging = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(STAGING_PREFIX));
            if is_staging {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }

        if removed > 0 {
            info!("Removed {} stale staging files", removed);
        }
        Ok(removed)
    }

    /// Hex-encoded SHA-256 digest of `bytes`
    pub fn compute_checksum(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }
}
