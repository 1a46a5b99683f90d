use std::time::{SystemTime, UNIX_EPOCH};

use crate::CoreError;

/// Current wall-clock time in whole seconds since the Unix epoch.
pub fn unix_now() -> Result<i64, CoreError> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .map_err(|_| CoreError::InvalidData("system clock before epoch".into()))
}
