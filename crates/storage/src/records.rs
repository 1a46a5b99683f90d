use groupsync_core::ids::*;
use serde::Serialize;

use crate::error::StorageError;

macro_rules! text_enum {
    ($name:ident, $label:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }

            pub fn parse(s: &str) -> Result<Self, StorageError> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    _ => Err(StorageError::Serialization(format!(concat!("unknown ", $label, ": {}"), s))),
                }
            }
        }
    };
}

/// Membership level within a sharing group. Ordered: read < write < admin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
    Admin,
}

text_enum!(Permission, "permission" {
    Read => "read",
    Write => "write",
    Admin => "admin",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum UploadState {
    Uploading,
    Uploaded,
}

text_enum!(UploadState, "upload state" {
    Uploading => "uploading",
    Uploaded => "uploaded",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DeferredStatus {
    PendingChange,
    /// Merged into a new file version.
    Processed,
    /// Dropped because the file was deleted before the merge.
    Discarded,
}

text_enum!(DeferredStatus, "deferred status" {
    PendingChange => "pendingChange",
    Processed => "processed",
    Discarded => "discarded",
});

/// Authoritative catalog metadata for one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileIndexEntry {
    pub sharing_group_id: SharingGroupId,
    pub file_id: FileId,
    pub file_group_id: Option<FileGroupId>,
    pub owner_user_id: UserId,
    /// Device that uploaded version 0.
    pub device_id: DeviceId,
    pub mime_type: String,
    pub app_meta_data: Option<String>,
    pub deleted: bool,
    pub file_version: u32,
    pub size_bytes: u64,
    pub checksum: Option<ContentHash>,
    pub change_resolver_name: Option<String>,
    pub creation_date: i64,
    pub update_date: i64,
}

/// A staged upload or deletion declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRecord {
    pub upload_id: Option<UploadId>,
    pub sharing_group_id: SharingGroupId,
    pub file_id: FileId,
    pub file_group_id: Option<FileGroupId>,
    pub owner_user_id: UserId,
    pub device_id: DeviceId,
    pub mime_type: Option<String>,
    pub app_meta_data: Option<String>,
    /// False for a deletion declaration.
    pub is_file_upload: bool,
    pub file_version: u32,
    pub state: UploadState,
    pub size_bytes: Option<u64>,
    pub checksum: Option<ContentHash>,
    pub change_resolver_name: Option<String>,
    /// Change payload of a vN upload.
    #[serde(skip)]
    pub contents: Option<Vec<u8>>,
}

impl UploadRecord {
    pub fn is_change(&self) -> bool {
        self.is_file_upload && self.file_version > 0
    }

    pub fn is_deletion(&self) -> bool {
        !self.is_file_upload
    }

    /// Required-field checks, run before any row is written.
    pub fn validate(&self) -> Result<(), StorageError> {
        if self.is_file_upload {
            match self.mime_type.as_deref() {
                Some(m) if !m.trim().is_empty() => {}
                _ => return Err(StorageError::Validation(format!("upload of {} has no mime type", self.file_id))),
            }
        }
        if self.is_change() && self.contents.is_none() {
            return Err(StorageError::Validation(format!(
                "change upload of {} has no payload",
                self.file_id
            )));
        }
        if self.is_file_upload
            && self.file_version == 0
            && self.state == UploadState::Uploaded
            && (self.size_bytes.is_none() || self.checksum.is_none())
        {
            return Err(StorageError::Validation(format!(
                "uploaded file {} is missing size or checksum",
                self.file_id
            )));
        }
        if self.is_deletion() && self.contents.is_some() {
            return Err(StorageError::Validation(format!(
                "deletion of {} carries contents",
                self.file_id
            )));
        }
        Ok(())
    }
}

/// A queued vN change awaiting the Uploader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredChangeRecord {
    pub deferred_upload_id: Option<DeferredUploadId>,
    pub sharing_group_id: SharingGroupId,
    pub file_group_id: Option<FileGroupId>,
    pub file_id: FileId,
    pub owner_user_id: UserId,
    pub status: DeferredStatus,
    pub change_resolver_name: String,
    /// Emptied once the change is processed or discarded.
    pub payload: Vec<u8>,
    pub completed_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub user_id: UserId,
    pub account_type: String,
    pub creds_id: String,
    pub creds: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceRecord {
    pub device_id: DeviceId,
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SharingGroupRecord {
    pub sharing_group_id: SharingGroupId,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipRecord {
    pub sharing_group_id: SharingGroupId,
    pub user_id: UserId,
    pub permission: Permission,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvitationRecord {
    pub code: InvitationCode,
    pub sharing_group_id: SharingGroupId,
    pub owning_user_id: UserId,
    pub permission: Permission,
    /// Unix seconds after which the code no longer redeems.
    pub expiry: i64,
}
