//! On-disk stage cache
//!
//! Each pipeline stage output is stored as JSON under a key that fingerprints
//! everything it depends on: the parent stage key, the stage name, and the
//! stage parameters. The root key fingerprints the raw input bytes and the
//! trailing-days restriction, so a change anywhere re-keys only the stages
//! downstream of it.

use crate::error::ComputeError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Hex SHA-256 fingerprint of a stage and its ancestry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StageKey(String);

impl StageKey {
    /// Key of the raw input stage
    pub fn root(input: &[u8], days_to_process: Option<u32>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(input);
        hasher.update(b"|days=");
        if let Some(days) = days_to_process {
            hasher.update(days.to_string().as_bytes());
        }
        Self(hex::encode(hasher.finalize()))
    }

    /// Key of a stage derived from this one
    pub fn child<P: Serialize>(&self, stage: &str, params: &P) -> Result<Self, ComputeError> {
        let params = serde_json::to_string(params)?;
        let mut hasher = Sha256::new();
        hasher.update(self.0.as_bytes());
        hasher.update(b"|");
        hasher.update(stage.as_bytes());
        hasher.update(b"|");
        hasher.update(params.as_bytes());
        Ok(Self(hex::encode(hasher.finalize())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Directory of cached stage outputs
#[derive(Debug, Clone)]
pub struct StageCache {
    dir: PathBuf,
}

impl StageCache {
    /// Open (creating if needed) a cache rooted at `dir`
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, ComputeError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, stage: &str, key: &StageKey) -> PathBuf {
        self.dir.join(format!("{stage}-{key}.json"))
    }

    /// Cached output of `stage` under `key`
    ///
    /// Unreadable entries are treated as absent and will be overwritten.
    pub fn load<T: DeserializeOwned>(
        &self,
        stage: &str,
        key: &StageKey,
    ) -> Result<Option<T>, ComputeError> {
        let path = self.entry_path(stage, key);
        if !path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&path)?;
        match serde_json::from_str(&json) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(stage, path = %path.display(), error = %e, "Discarding corrupt cache entry");
                Ok(None)
            }
        }
    }

    /// Store the output of `stage` under `key`
    ///
    /// The entry is written to a uniquely named temporary file and moved into
    /// place, so concurrent writers of one key never see a partial entry.
    pub fn store<T: Serialize>(
        &self,
        stage: &str,
        key: &StageKey,
        value: &T,
    ) -> Result<(), ComputeError> {
        let path = self.entry_path(stage, key);
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&serde_json::to_vec(value)?)?;
        tmp.persist(&path).map_err(|e| ComputeError::Io(e.error))?;
        Ok(())
    }

    /// Cached value, or the result of `compute` stored for next time
    pub fn get_or_compute<T, F>(
        &self,
        stage: &str,
        key: &StageKey,
        compute: F,
    ) -> Result<T, ComputeError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T, ComputeError>,
    {
        if let Some(value) = self.load(stage, key)? {
            debug!(stage, key = %key, "Cache hit");
            return Ok(value);
        }
        debug!(stage, key = %key, "Cache miss");
        let value = compute()?;
        self.store(stage, key, &value)?;
        Ok(value)
    }
}

/// Run `compute` through `cache` when one is configured
pub fn cached<T, F>(
    cache: Option<&StageCache>,
    stage: &str,
    key: &StageKey,
    compute: F,
) -> Result<T, ComputeError>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Result<T, ComputeError>,
{
    match cache {
        Some(cache) => cache.get_or_compute(stage, key, compute),
        None => compute(),
    }
}
