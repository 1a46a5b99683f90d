use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::CoreError;

/// Startup configuration, handed to the store and server constructors.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    /// SQLite database file shared by every server process.
    pub database_path: PathBuf,

    /// Upper bound on how long a transaction waits for the store's write lock.
    pub busy_timeout_ms: u64,

    pub max_devices_per_user: u32,

    /// How long a sharing invitation stays redeemable.
    pub invitation_lifetime_secs: u64,

    pub uploader_interval_secs: u64,

    /// How long a merged or discarded change stays queryable before the
    /// Uploader prunes it.
    pub deferred_retention_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("groupsync.db"),
            busy_timeout_ms: 5_000,
            max_devices_per_user: 10,
            invitation_lifetime_secs: 60 * 60 * 24,
            uploader_interval_secs: 30,
            deferred_retention_secs: 60 * 60 * 24,
        }
    }
}

impl SyncConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, CoreError> {
        let config: Self = toml::from_str(s).map_err(|e| CoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn uploader_interval(&self) -> Duration {
        Duration::from_secs(self.uploader_interval_secs)
    }

    fn validate(&self) -> Result<(), CoreError> {
        if self.max_devices_per_user == 0 {
            return Err(CoreError::Config("max_devices_per_user must be at least 1".into()));
        }
        if self.uploader_interval_secs == 0 {
            return Err(CoreError::Config("uploader_interval_secs must be at least 1".into()));
        }
        Ok(())
    }
}
