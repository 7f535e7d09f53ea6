//! Configuration Storage
//!
//! Handles reading/writing the persisted state blob.
//! Location: ~/.dbnexus on macOS/Linux, %APPDATA%\DbNexus on Windows
//!
//! Loading always runs `migrate` (when the file is older than
//! [`CONFIG_VERSION`]) followed by `merge`, so the returned state is sanitized
//! no matter what is on disk.

use std::path::PathBuf;

use serde_json::Value;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::migrate::{merge, migrate, schema_version};
use super::types::{AppState, CONFIG_VERSION};

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
}

impl serde::Serialize for StorageError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Get the application configuration directory
pub fn config_dir() -> Result<PathBuf, StorageError> {
    #[cfg(windows)]
    {
        if let Some(app_data) = dirs::config_dir() {
            return Ok(app_data.join("DbNexus"));
        }
        dirs::home_dir()
            .map(|home| home.join(".dbnexus"))
            .ok_or(StorageError::NoConfigDir)
    }

    #[cfg(not(windows))]
    {
        dirs::home_dir()
            .map(|home| home.join(".dbnexus"))
            .ok_or(StorageError::NoConfigDir)
    }
}

/// Get the state file path
pub fn state_file() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join("state.json"))
}

/// Persisted state manager
pub struct ConfigStorage {
    path: PathBuf,
}

impl ConfigStorage {
    /// Create a new storage manager with default path
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self {
            path: state_file()?,
        })
    }

    /// Create storage manager with custom path
    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    async fn ensure_dir(&self) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Load state from disk.
    ///
    /// A missing file yields defaults. An unparsable file is backed up and
    /// replaced by defaults. A file from a newer schema is refused rather than
    /// downgraded.
    pub async fn load(&self) -> Result<AppState, StorageError> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No state file at {:?}, using defaults", self.path);
                return Ok(AppState::default());
            }
            Err(e) => return Err(StorageError::Io(e)),
        };

        let raw = match serde_json::from_str::<Value>(&contents) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!("State file corrupted: {}", e);
                match self.backup().await {
                    Ok(backup_path) => {
                        tracing::warn!(
                            "Corrupted state backed up to {:?}, using defaults",
                            backup_path
                        );
                    }
                    Err(backup_err) => {
                        tracing::error!("Failed to backup corrupted state: {}", backup_err);
                    }
                }
                return Ok(AppState::default());
            }
        };

        let version = schema_version(&raw);
        if version > CONFIG_VERSION {
            return Err(StorageError::VersionTooNew {
                found: version,
                supported: CONFIG_VERSION,
            });
        }

        let migrated = migrate(raw, version);
        Ok(merge(&migrated, &AppState::default()))
    }

    /// Save state to disk
    pub async fn save(&self, state: &AppState) -> Result<(), StorageError> {
        self.ensure_dir().await?;

        // Write to temp file first, then rename (atomic write)
        let temp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(state)?;

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;

        fs::rename(&temp_path, &self.path).await?;

        Ok(())
    }

    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path).await.is_ok()
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Copy the current file aside with a timestamp suffix
    pub async fn backup(&self) -> Result<PathBuf, StorageError> {
        let backup_path = self.path.with_extension(format!(
            "json.backup.{}",
            chrono::Utc::now().format("%Y%m%d_%H%M%S")
        ));

        if self.exists().await {
            fs::copy(&self.path, &backup_path).await?;
        }

        Ok(backup_path)
    }
}
