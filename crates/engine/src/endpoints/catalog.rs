use groupsync_core::CloudFileName;
use groupsync_core::ids::*;
use groupsync_storage::{FileIndexEntry, Permission, TxMode};
use serde::Serialize;

use crate::error::SyncError;
use crate::transaction::{Endpoint, RequestContext};

/// The group's catalog together with the master version it corresponds to.
#[derive(Debug, Clone)]
pub struct GetFileIndex {
    pub sharing_group_id: SharingGroupId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileIndexResponse {
    pub master_version: u64,
    pub files: Vec<FileIndexEntry>,
}

impl Endpoint for GetFileIndex {
    type Output = FileIndexResponse;

    fn name(&self) -> &'static str {
        "GetFileIndex"
    }

    fn access(&self) -> Option<(SharingGroupId, Permission)> {
        Some((self.sharing_group_id, Permission::Read))
    }

    fn tx_mode(&self) -> TxMode {
        TxMode::Deferred
    }

    fn process(&self, ctx: &mut RequestContext<'_, '_>) -> Result<FileIndexResponse, SyncError> {
        let tx = ctx.tx();
        let master_version = tx.master_versions().get(self.sharing_group_id)?;
        let files = tx.file_index().list_for_group(self.sharing_group_id)?;
        Ok(FileIndexResponse { master_version, files })
    }
}

#[derive(Debug, Clone)]
pub struct DownloadFile {
    pub sharing_group_id: SharingGroupId,
    pub file_id: FileId,
    pub file_version: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadFileResponse {
    pub file_version: u32,
    pub app_meta_data: Option<String>,
    pub checksum: Option<ContentHash>,
    #[serde(skip)]
    pub content: Vec<u8>,
}

impl Endpoint for DownloadFile {
    type Output = DownloadFileResponse;

    fn name(&self) -> &'static str {
        "DownloadFile"
    }

    fn access(&self) -> Option<(SharingGroupId, Permission)> {
        Some((self.sharing_group_id, Permission::Read))
    }

    fn tx_mode(&self) -> TxMode {
        TxMode::Deferred
    }

    fn process(&self, ctx: &mut RequestContext<'_, '_>) -> Result<DownloadFileResponse, SyncError> {
        let entry = ctx
            .tx()
            .file_index()
            .lookup(self.sharing_group_id, self.file_id)?
            .ok_or_else(|| SyncError::Validation(format!("no file {}", self.file_id)))?;
        if entry.deleted {
            return Err(SyncError::Validation(format!("file {} was deleted", self.file_id)));
        }
        if entry.file_version != self.file_version {
            return Err(SyncError::FileVersionConflict {
                file: self.file_id.to_string(),
                expected: entry.file_version,
                declared: self.file_version,
            });
        }
        let name = CloudFileName::new(entry.owner_user_id, entry.device_id, entry.file_id, entry.file_version);
        let content = ctx.server().services().cloud_storage.download(&name)?;
        Ok(DownloadFileResponse {
            file_version: entry.file_version,
            app_meta_data: entry.app_meta_data,
            checksum: entry.checksum,
            content,
        })
    }
}
