//! Trust config persistence
//!
//! `~/.hostkey-gate/trust.json`. A file that can't be parsed is moved aside
//! and replaced by defaults, which keep every unknown key behind a prompt.

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, warn};

use super::types::{TrustConfig, CONFIG_VERSION};

/// Configuration storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to determine config directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config version {found} is newer than supported {supported}")]
    VersionTooNew { found: u32, supported: u32 },

    #[error("Invalid trust config: {0}")]
    Invalid(String),
}

/// Directory holding this crate's settings
pub fn config_dir() -> Result<PathBuf, StorageError> {
    dirs::home_dir()
        .map(|home| home.join(".hostkey-gate"))
        .ok_or(StorageError::NoConfigDir)
}

pub fn trust_config_file() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join("trust.json"))
}

pub struct ConfigStorage {
    path: PathBuf,
}

impl ConfigStorage {
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self::with_path(trust_config_file()?))
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load and validate the trust config
    ///
    /// Missing file: defaults. Unparseable file: moved aside, then defaults.
    /// A file that parses but carries unusable values is an error, never
    /// silently replaced.
    pub async fn load(&self) -> Result<TrustConfig, StorageError> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No trust config at {:?}, using defaults", self.path);
                return Ok(TrustConfig::default());
            }
            Err(e) => return Err(e.into()),
        };

        let config = match serde_json::from_str::<TrustConfig>(&contents) {
            Ok(config) => config,
            Err(e) => {
                warn!("Trust config {:?} corrupted: {}", self.path, e);
                match self.backup().await {
                    Ok(moved_to) => warn!("Corrupted trust config moved to {:?}", moved_to),
                    Err(backup_err) => {
                        error!("Failed to move corrupted trust config aside: {}", backup_err)
                    }
                }
                return Ok(TrustConfig::default());
            }
        };

        if config.version > CONFIG_VERSION {
            return Err(StorageError::VersionTooNew {
                found: config.version,
                supported: CONFIG_VERSION,
            });
        }
        config.validate()?;
        Ok(config)
    }

    /// Validate and write atomically (temp file + rename)
    pub async fn save(&self, config: &TrustConfig) -> Result<(), StorageError> {
        config.validate()?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let temp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(config)?;

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        fs::rename(&temp_path, &self.path).await?;

        debug!("Saved trust config to {:?}", self.path);
        Ok(())
    }

    /// Move the current file aside under a timestamped name
    pub async fn backup(&self) -> Result<PathBuf, StorageError> {
        let backup_path = self.path.with_extension(format!(
            "json.backup.{}",
            chrono::Utc::now().format("%Y%m%d_%H%M%S")
        ));
        fs::rename(&self.path, &backup_path).await?;
        Ok(backup_path)
    }
}
