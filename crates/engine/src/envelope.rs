use serde::Serialize;

use crate::error::{StatusCategory, SyncError};

/// What a caller receives for every request: the endpoint's payload, or an
/// error message with its status category. Built only after the request's
/// transaction has committed or rolled back.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Envelope<T> {
    Success {
        #[serde(rename = "statusCategory")]
        status_category: StatusCategory,
        #[serde(flatten)]
        payload: T,
    },
    Failure {
        #[serde(rename = "errorMessage")]
        error_message: String,
        #[serde(rename = "statusCategory")]
        status_category: StatusCategory,
        /// The group's current master version when the request lost a race
        /// for it, so the client can refresh without another round trip.
        #[serde(rename = "masterVersionUpdate", skip_serializing_if = "Option::is_none")]
        master_version_update: Option<u64>,
    },
}

impl<T> Envelope<T> {
    pub fn from_result(result: Result<T, SyncError>) -> Self {
        match result {
            Ok(payload) => Self::Success {
                status_category: StatusCategory::Ok,
                payload,
            },
            Err(err) => Self::Failure {
                error_message: err.to_string(),
                status_category: err.category(),
                master_version_update: match err {
                    SyncError::MasterVersionConflict { current } => Some(current),
                    _ => None,
                },
            },
        }
    }

    pub fn status_category(&self) -> StatusCategory {
        match self {
            Self::Success { status_category, .. } | Self::Failure { status_category, .. } => *status_category,
        }
    }

    pub fn payload(&self) -> Option<&T> {
        match self {
            Self::Success { payload, .. } => Some(payload),
            Self::Failure { .. } => None,
        }
    }
}

impl<T: Serialize> Envelope<T> {
    pub fn to_json(&self) -> Result<String, SyncError> {
        serde_json::to_string(self).map_err(|e| SyncError::Transaction(format!("response encoding: {e}")))
    }
}
