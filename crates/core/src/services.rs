//! Interfaces to the collaborators this crate drives but does not implement:
//! vendor cloud storage, identity providers, credential persistence, and push
//! delivery.

use std::fmt;

use crate::error::CoreError;
use crate::ids::{ContentHash, DeviceId, FileId, SharingGroupId, UserId};

/// Name of one version of a file in its owner's cloud storage. The device
/// is the one that uploaded version 0, so two devices racing to create the
/// same file never overwrite each other's object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CloudFileName {
    pub owner_user_id: UserId,
    pub device_id: DeviceId,
    pub file_id: FileId,
    pub file_version: u32,
}

impl CloudFileName {
    pub fn new(owner_user_id: UserId, device_id: DeviceId, file_id: FileId, file_version: u32) -> Self {
        Self {
            owner_user_id,
            device_id,
            file_id,
            file_version,
        }
    }

    pub fn next_version(&self) -> Self {
        Self {
            file_version: self.file_version + 1,
            ..*self
        }
    }
}

impl fmt::Display for CloudFileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}.{}.{}",
            self.owner_user_id, self.file_id, self.device_id, self.file_version
        )
    }
}

pub trait CloudStorage: Send + Sync {
    /// Stores `content`, replacing any object of the same name.
    fn upload(
        &self,
        name: &CloudFileName,
        mime_type: &str,
        content: &[u8],
    ) -> Result<ContentHash, CoreError>;

    fn download(&self, name: &CloudFileName) -> Result<Vec<u8>, CoreError>;

    fn delete(&self, name: &CloudFileName) -> Result<(), CoreError>;
}

/// Credentials presented with a request, opaque to this crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub account_type: String,
    pub token: String,
}

/// Identity established by an identity provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedAccount {
    pub account_type: String,
    pub creds_id: String,
    /// Set when the provider refreshed the stored credentials.
    pub refreshed_creds: Option<String>,
}

pub trait Authenticator: Send + Sync {
    fn authenticate(&self, credentials: &Credentials) -> Result<VerifiedAccount, CoreError>;
}

pub trait AccountDelegate: Send + Sync {
    fn save_credentials(&self, user_id: UserId, creds: &str) -> Result<(), CoreError>;
}

pub trait PushNotificationService: Send + Sync {
    fn publish(&self, sharing_group_id: SharingGroupId, message: &str) -> Result<(), CoreError>;
}
