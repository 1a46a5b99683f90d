use std::path::Path;

use groupsync_core::{CoreError, SyncConfig};
use serde::Deserialize;

/// Settings for test deployments, loaded explicitly by each test. The
/// database always lives in the deployment's temporary directory.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TestConfig {
    pub busy_timeout_ms: u64,
    pub max_devices_per_user: u32,
    pub invitation_lifetime_secs: u64,
    pub uploader_interval_secs: u64,
    pub deferred_retention_secs: u64,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 10_000,
            max_devices_per_user: 5,
            invitation_lifetime_secs: 3_600,
            uploader_interval_secs: 1,
            deferred_retention_secs: 3_600,
        }
    }
}

impl TestConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, CoreError> {
        toml::from_str(s).map_err(|e| CoreError::Config(e.to_string()))
    }

    pub fn sync_config(&self, database_path: &Path) -> SyncConfig {
        SyncConfig {
            database_path: database_path.to_path_buf(),
            busy_timeout_ms: self.busy_timeout_ms,
            max_devices_per_user: self.max_devices_per_user,
            invitation_lifetime_secs: self.invitation_lifetime_secs,
            uploader_interval_secs: self.uploader_interval_secs,
            deferred_retention_secs: self.deferred_retention_secs,
        }
    }
}
