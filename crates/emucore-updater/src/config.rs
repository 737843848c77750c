use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::UpdateError;

const DEFAULT_NETWORK_TIMEOUT_SECS: u64 = 30;

/// Settings for a [`crate::CoreUpdater`], persisted as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdaterConfig {
    /// Directory under which each core gets its `current` and `backup` installs.
    pub install_root: PathBuf,
    /// Registry file; `None` keeps the registry in memory.
    pub store_path: Option<PathBuf>,
    /// Upper bound on any single feed request.
    pub network_timeout_secs: u64,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        let base = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("EmuCores");
        Self {
            install_root: base.join("cores"),
            store_path: dirs::config_dir().map(|dir| dir.join("EmuCores").join("cores.json")),
            network_timeout_secs: DEFAULT_NETWORK_TIMEOUT_SECS,
        }
    }
}

impl UpdaterConfig {
    pub fn with_install_root(install_root: impl Into<PathBuf>) -> Self {
        Self {
            install_root: install_root.into(),
            store_path: None,
            ..Self::default()
        }
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.network_timeout_secs.max(1))
    }

    /// Reads settings from `path`; a missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, UpdateError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|err| {
            UpdateError::Disk(std::io::Error::new(std::io::ErrorKind::InvalidData, err))
        })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), UpdateError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|err| {
            UpdateError::Disk(std::io::Error::new(std::io::ErrorKind::InvalidData, err))
        })?;
        fs::write(path, json)?;
        Ok(())
    }
}
