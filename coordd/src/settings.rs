//! File-backed persistence for the shared settings mapping.
//!
//! The file holds `{"version": n, "values": {...}}` as pretty JSON and is
//! rewritten whole on every mutation.

use std::io;
use std::path::{Path, PathBuf};

use coord_common::fs::write_json_atomic;
use coord_common::SharedSettings;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to load settings from {}: {source}", path.display())]
    Load {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to persist settings to {}: {source}", path.display())]
    Persist {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the file; a missing file is an empty mapping at version 0.
    pub async fn load(&self) -> Result<SharedSettings, SettingsError> {
        let load_err = |source| SettingsError::Load {
            path: self.path.clone(),
            source,
        };

        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No settings file yet; starting empty");
                return Ok(SharedSettings::default());
            }
            Err(err) => return Err(load_err(err)),
        };

        let settings: SharedSettings = serde_json::from_slice(&raw)
            .map_err(|err| load_err(io::Error::new(io::ErrorKind::InvalidData, err)))?;
        info!(
            path = %self.path.display(),
            version = settings.version,
            keys = settings.values.len(),
            "Loaded shared settings"
        );
        Ok(settings)
    }

    /// Durably replace the file with `settings`. Runs on a blocking thread.
    pub async fn persist(&self, settings: &SharedSettings) -> Result<(), SettingsError> {
        let path = self.path.clone();
        let snapshot = settings.clone();
        let result = tokio::task::spawn_blocking(move || write_json_atomic(&path, &snapshot))
            .await
            .unwrap_or_else(|join| Err(io::Error::new(io::ErrorKind::Other, join)));

        result.map_err(|source| SettingsError::Persist {
            path: self.path.clone(),
            source,
        })?;
        debug!(path = %self.path.display(), version = settings.version, "Settings persisted");
        Ok(())
    }
}
