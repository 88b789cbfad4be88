//! Configuration Storage
//!
//! Reads the settings file. The file is edited by hand; vaultshell never
//! writes it.
//! Location: ~/.vaultshell/settings.json, or %APPDATA%\vaultshell on Windows

use std::path::{Path, PathBuf};
use tokio::fs;

use super::types::{Settings, CONFIG_VERSION};

/// Configuration storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to determine config directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config version {found} is newer than supported {supported}")]
    VersionTooNew { found: u32, supported: u32 },
}

/// Get the vaultshell configuration directory
pub fn config_dir() -> Result<PathBuf, StorageError> {
    #[cfg(windows)]
    {
        if let Some(app_data) = dirs::config_dir() {
            return Ok(app_data.join("vaultshell"));
        }
        dirs::home_dir()
            .map(|home| home.join(".vaultshell"))
            .ok_or(StorageError::NoConfigDir)
    }

    #[cfg(not(windows))]
    {
        dirs::home_dir()
            .map(|home| home.join(".vaultshell"))
            .ok_or(StorageError::NoConfigDir)
    }
}

/// Get the settings file path
pub fn settings_file() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join("settings.json"))
}

/// Configuration storage manager
pub struct ConfigStorage {
    path: PathBuf,
}

impl ConfigStorage {
    /// Create a new storage manager with default path
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self {
            path: settings_file()?,
        })
    }

    /// Storage at a custom path (`--config`)
    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    /// Load settings from disk.
    /// A missing file gives the defaults. A corrupted file is backed up and
    /// the defaults are used.
    pub async fn load(&self) -> Result<Settings, StorageError> {
        match fs::read_to_string(&self.path).await {
            Ok(contents) => match serde_json::from_str::<Settings>(&contents) {
                Ok(settings) => {
                    if settings.version > CONFIG_VERSION {
                        return Err(StorageError::VersionTooNew {
                            found: settings.version,
                            supported: CONFIG_VERSION,
                        });
                    }
                    Ok(settings)
                }
                Err(e) => {
                    tracing::warn!("Settings file corrupted: {}", e);

                    match self.backup().await {
                        Ok(backup_path) => {
                            tracing::warn!(
                                "Corrupted settings backed up to {:?}, using defaults",
                                backup_path
                            );
                        }
                        Err(backup_err) => {
                            tracing::error!("Failed to backup corrupted settings: {}", backup_err);
                        }
                    }

                    Ok(Settings::default())
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No settings file at {:?}, using defaults", self.path);
                Ok(Settings::default())
            }
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy the settings file aside as `settings.json.backup.<timestamp>`
    async fn backup(&self) -> Result<PathBuf, StorageError> {
        let backup_path = self.path.with_extension(format!(
            "json.backup.{}",
            chrono::Utc::now().format("%Y%m%d_%H%M%S")
        ));
        fs::copy(&self.path, &backup_path).await?;
        Ok(backup_path)
    }
}
