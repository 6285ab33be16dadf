//! File persistence for the environment.
//!
//! The whole `Environment` is written as one JSON document. Writes go to a sibling
//! temp file which is then renamed over the target, so a crash mid-write leaves
//! either the old file or the new one, never a truncated mix.

use crate::model::Environment;
use chrono::Utc;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode environment: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("persisted state at {} is corrupt: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Reads and writes the environment file.
#[derive(Debug, Clone)]
pub struct EnvironmentStore {
    path: PathBuf,
}

impl EnvironmentStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".tmp");
        PathBuf::from(name)
    }

    /// Atomically replace the persisted environment.
    pub fn save(&self, environment: &Environment) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
            }
        }

        let bytes = serde_json::to_vec_pretty(environment).map_err(StoreError::Serialize)?;

        let temp_path = self.temp_path();
        let write_result = File::create(&temp_path).and_then(|mut file| {
            file.write_all(&bytes)?;
            file.sync_all()
        });
        if let Err(e) = write_result {
            let _ = fs::remove_file(&temp_path);
            return Err(StoreError::io(&temp_path, e));
        }

        if let Err(e) = fs::rename(&temp_path, &self.path) {
            let _ = fs::remove_file(&temp_path);
            return Err(StoreError::io(&self.path, e));
        }
        self.sync_parent()?;

        debug!(
            "Saved {} servers to {}",
            environment.servers.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Flush the directory entry so the rename itself survives a crash.
    #[cfg(unix)]
    fn sync_parent(&self) -> Result<(), StoreError> {
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        File::open(parent)
            .and_then(|dir| dir.sync_all())
            .map_err(|e| StoreError::io(parent, e))
    }

    #[cfg(not(unix))]
    fn sync_parent(&self) -> Result<(), StoreError> {
        Ok(())
    }

    /// Load the persisted environment.
    ///
    /// Returns `Ok(None)` when nothing has been saved yet and `StoreError::Corrupt` when
    /// the file exists but cannot be decoded.
    pub fn load(&self) -> Result<Option<Environment>, StoreError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No state file at {}, starting fresh", self.path.display());
                return Ok(None);
            }
            Err(e) => return Err(StoreError::io(&self.path, e)),
        };

        let environment: Environment =
            serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
                path: self.path.clone(),
                source,
            })?;

        info!(
            "Loaded {} servers from {}",
            environment.servers.len(),
            self.path.display()
        );
        Ok(Some(environment))
    }

    /// Move an unreadable state file aside so later saves cannot overwrite it.
    ///
    /// Returns the path the file was moved to.
    pub fn quarantine(&self) -> Result<PathBuf, StoreError> {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(format!(".corrupt-{}", Utc::now().format("%Y%m%dT%H%M%S%.3fZ")));
        let target = PathBuf::from(name);
        fs::rename(&self.path, &target).map_err(|e| StoreError::io(&self.path, e))?;
        Ok(target)
    }

    /// Load the environment, falling back to an empty one when nothing usable exists.
    ///
    /// A corrupt file is preserved next to the original for manual recovery.
    pub fn load_or_default(&self) -> Environment {
        match self.load() {
            Ok(Some(environment)) => environment,
            Ok(None) => Environment::default(),
            Err(StoreError::Corrupt { path, source }) => {
                warn!(
                    "State file {} could not be parsed ({}); starting with an empty environment",
                    path.display(),
                    source
                );
                match self.quarantine() {
                    Ok(target) => warn!("Corrupt state preserved at {}", target.display()),
                    Err(e) => warn!("Failed to preserve corrupt state file: {}", e),
                }
                Environment::default()
            }
            Err(e) => {
                warn!("Failed to read state file: {}; starting with an empty environment", e);
                Environment::default()
            }
        }
    }
}
