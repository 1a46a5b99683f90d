use groupsync_core::ids::*;
use groupsync_core::{CloudFileName, CoreError};
use groupsync_storage::{
    DeferredStatus, FileIndexEntry, MasterVersionUpdate, Permission, TxMode, UploadRecord, UploadRepo, UploadState,
};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::SyncError;
use crate::transaction::{Endpoint, PostCommit, RequestContext};

/// Upload of a whole file (`file_version == 0`) or of one change to an
/// existing file (`file_version > 0`).
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub sharing_group_id: SharingGroupId,
    pub file_id: FileId,
    pub file_group_id: Option<FileGroupId>,
    pub mime_type: String,
    pub app_meta_data: Option<String>,
    pub file_version: u32,
    pub change_resolver_name: Option<String>,
    pub master_version: u64,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadFileResponse {
    pub upload_id: UploadId,
    pub file_version: u32,
    pub size_bytes: u64,
    pub checksum: Option<ContentHash>,
}

impl Endpoint for UploadFile {
    type Output = UploadFileResponse;

    fn name(&self) -> &'static str {
        "UploadFile"
    }

    fn access(&self) -> Option<(SharingGroupId, Permission)> {
        Some((self.sharing_group_id, Permission::Write))
    }

    fn locks_group(&self) -> bool {
        true
    }

    fn process(&self, ctx: &mut RequestContext<'_, '_>) -> Result<UploadFileResponse, SyncError> {
        ctx.check_master_version(self.sharing_group_id, self.master_version)?;
        if self.file_version == 0 {
            self.upload_whole_file(ctx)
        } else {
            self.upload_change(ctx)
        }
    }
}

impl UploadFile {
    fn upload_whole_file(&self, ctx: &mut RequestContext<'_, '_>) -> Result<UploadFileResponse, SyncError> {
        let tx = ctx.tx();
        if tx.file_index().lookup(self.sharing_group_id, self.file_id)?.is_some() {
            return Err(SyncError::Validation(format!("file {} already exists", self.file_id)));
        }
        if let Some(name) = &self.change_resolver_name {
            if !ctx.resolvers().contains(name) {
                return Err(SyncError::Validation(format!("unknown change resolver {name}")));
            }
            ctx.resolvers()
                .resolver(name)?
                .validate_v0(&self.content)
                .map_err(|e| SyncError::Validation(e.to_string()))?;
        }

        let owner = ctx.user_id()?;
        let checksum = ContentHash::of(&self.content);
        let uploads = tx.uploads();
        if let Some(staged) = uploads.lookup(self.file_id, owner, ctx.device_id())?
            && let Some(id) = staged.upload_id
        {
            if staged.state == UploadState::Uploaded && staged.checksum == Some(checksum) && staged.file_version == 0 {
                debug!(file_id = %self.file_id, "upload already staged");
                return Ok(UploadFileResponse {
                    upload_id: id,
                    file_version: 0,
                    size_bytes: staged.size_bytes.unwrap_or_default(),
                    checksum: staged.checksum,
                });
            }
            uploads.remove(id)?;
        }

        let mut record = UploadRecord {
            upload_id: None,
            sharing_group_id: self.sharing_group_id,
            file_id: self.file_id,
            file_group_id: self.file_group_id,
            owner_user_id: owner,
            device_id: ctx.device_id(),
            mime_type: Some(self.mime_type.clone()),
            app_meta_data: self.app_meta_data.clone(),
            is_file_upload: true,
            file_version: 0,
            state: UploadState::Uploading,
            size_bytes: None,
            checksum: None,
            change_resolver_name: self.change_resolver_name.clone(),
            contents: None,
        };
        let upload_id = uploads.add(&record)?;

        let cloud_name = CloudFileName::new(owner, ctx.device_id(), self.file_id, 0);
        let stored = ctx
            .server()
            .services()
            .cloud_storage
            .upload(&cloud_name, &self.mime_type, &self.content)?;
        if stored != checksum {
            return Err(CoreError::CloudStorage(format!("checksum mismatch storing {cloud_name}")).into());
        }

        record.upload_id = Some(upload_id);
        record.state = UploadState::Uploaded;
        record.size_bytes = Some(self.content.len() as u64);
        record.checksum = Some(checksum);
        uploads.update(&record)?;

        debug!(file_id = %self.file_id, size = self.content.len(), "file uploaded");
        Ok(UploadFileResponse {
            upload_id,
            file_version: 0,
            size_bytes: self.content.len() as u64,
            checksum: Some(checksum),
        })
    }

    fn upload_change(&self, ctx: &mut RequestContext<'_, '_>) -> Result<UploadFileResponse, SyncError> {
        let tx = ctx.tx();
        let entry = tx
            .file_index()
            .lookup(self.sharing_group_id, self.file_id)?
            .ok_or_else(|| SyncError::Validation(format!("change to unknown file {}", self.file_id)))?;
        if entry.deleted {
            return Err(SyncError::Validation(format!("change to deleted file {}", self.file_id)));
        }
        let resolver_name = entry
            .change_resolver_name
            .clone()
            .ok_or_else(|| SyncError::Validation(format!("file {} has no change resolver", self.file_id)))?;
        let expected = entry.file_version + 1;
        if self.file_version != expected {
            return Err(SyncError::FileVersionConflict {
                file: self.file_id.to_string(),
                expected,
                declared: self.file_version,
            });
        }
        ctx.resolvers()
            .resolver(&resolver_name)?
            .validate(&self.content)
            .map_err(|e| SyncError::Validation(e.to_string()))?;

        let owner = ctx.user_id()?;
        let uploads = tx.uploads();
        if let Some(staged) = uploads.lookup(self.file_id, owner, ctx.device_id())?
            && let Some(id) = staged.upload_id
        {
            uploads.remove(id)?;
        }
        let upload_id = uploads.add(&UploadRecord {
            upload_id: None,
            sharing_group_id: self.sharing_group_id,
            file_id: self.file_id,
            file_group_id: entry.file_group_id,
            owner_user_id: owner,
            device_id: ctx.device_id(),
            mime_type: Some(entry.mime_type.clone()),
            app_meta_data: None,
            is_file_upload: true,
            file_version: self.file_version,
            state: UploadState::Uploaded,
            size_bytes: Some(self.content.len() as u64),
            checksum: None,
            change_resolver_name: Some(resolver_name),
            contents: Some(self.content.clone()),
        })?;

        debug!(file_id = %self.file_id, file_version = self.file_version, "change staged");
        Ok(UploadFileResponse {
            upload_id,
            file_version: self.file_version,
            size_bytes: self.content.len() as u64,
            checksum: None,
        })
    }
}

/// Deletion of one file, or of every live file in a file group. Exactly one
/// of `file_id` and `file_group_id` is set.
#[derive(Debug, Clone)]
pub struct UploadDeletion {
    pub sharing_group_id: SharingGroupId,
    pub file_id: Option<FileId>,
    pub file_group_id: Option<FileGroupId>,
    pub master_version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadDeletionResponse {
    /// One staged row per file, in catalog order.
    pub upload_ids: Vec<UploadId>,
}

impl Endpoint for UploadDeletion {
    type Output = UploadDeletionResponse;

    fn name(&self) -> &'static str {
        "UploadDeletion"
    }

    fn access(&self) -> Option<(SharingGroupId, Permission)> {
        Some((self.sharing_group_id, Permission::Write))
    }

    fn locks_group(&self) -> bool {
        true
    }

    fn process(&self, ctx: &mut RequestContext<'_, '_>) -> Result<UploadDeletionResponse, SyncError> {
        ctx.check_master_version(self.sharing_group_id, self.master_version)?;
        let tx = ctx.tx();
        let entries = match (self.file_id, self.file_group_id) {
            (Some(file_id), None) => {
                let entry = tx
                    .file_index()
                    .lookup(self.sharing_group_id, file_id)?
                    .ok_or_else(|| SyncError::Validation(format!("deletion of unknown file {file_id}")))?;
                if entry.deleted {
                    return Err(SyncError::Validation(format!("file {file_id} is already deleted")));
                }
                vec![entry]
            }
            (None, Some(file_group_id)) => {
                let live: Vec<FileIndexEntry> = tx
                    .file_index()
                    .list_for_file_group(self.sharing_group_id, file_group_id)?
                    .into_iter()
                    .filter(|entry| !entry.deleted)
                    .collect();
                if live.is_empty() {
                    return Err(SyncError::Validation(format!(
                        "file group {file_group_id} has no live files"
                    )));
                }
                live
            }
            _ => {
                return Err(SyncError::Validation(
                    "deletion needs exactly one of a file or a file group".into(),
                ));
            }
        };

        let owner = ctx.user_id()?;
        let uploads = tx.uploads();
        let mut upload_ids = Vec::with_capacity(entries.len());
        for entry in &entries {
            upload_ids.push(stage_deletion(&uploads, entry, owner, ctx.device_id())?);
        }
        debug!(files = upload_ids.len(), "deletion staged");
        Ok(UploadDeletionResponse { upload_ids })
    }
}

/// Stages a deletion of `entry`, reusing a deletion this device already staged.
fn stage_deletion(
    uploads: &UploadRepo<'_>,
    entry: &FileIndexEntry,
    owner: UserId,
    device_id: DeviceId,
) -> Result<UploadId, SyncError> {
    if let Some(staged) = uploads.lookup(entry.file_id, owner, device_id)?
        && let Some(id) = staged.upload_id
    {
        if staged.is_deletion() {
            return Ok(id);
        }
        uploads.remove(id)?;
    }
    let upload_id = uploads.add(&UploadRecord {
        upload_id: None,
        sharing_group_id: entry.sharing_group_id,
        file_id: entry.file_id,
        file_group_id: entry.file_group_id,
        owner_user_id: owner,
        device_id,
        mime_type: None,
        app_meta_data: None,
        is_file_upload: false,
        file_version: entry.file_version,
        state: UploadState::Uploaded,
        size_bytes: None,
        checksum: None,
        change_resolver_name: None,
        contents: None,
    })?;
    Ok(upload_id)
}

/// Finalizes everything the calling device has staged in one group.
#[derive(Debug, Clone)]
pub struct DoneUploads {
    pub sharing_group_id: SharingGroupId,
    pub master_version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DoneUploadsResponse {
    pub transferred: usize,
    pub master_version: u64,
    /// Queued changes; poll them with `GetUploadsResults`.
    pub deferred_upload_ids: Vec<DeferredUploadId>,
    /// Files this device staged at version 0 that another device created
    /// first. Their staged uploads were dropped.
    pub conflicts: Vec<FileId>,
}

impl Endpoint for DoneUploads {
    type Output = DoneUploadsResponse;

    fn name(&self) -> &'static str {
        "DoneUploads"
    }

    fn access(&self) -> Option<(SharingGroupId, Permission)> {
        Some((self.sharing_group_id, Permission::Write))
    }

    fn locks_group(&self) -> bool {
        true
    }

    fn process(&self, ctx: &mut RequestContext<'_, '_>) -> Result<DoneUploadsResponse, SyncError> {
        let group = self.sharing_group_id;
        let current = ctx.check_master_version(group, self.master_version)?;
        let owner = ctx.user_id()?;
        let tx = ctx.tx();

        let outcome = tx.uploads().finalize(group, owner, ctx.device_id(), ctx.now())?;
        for row in &outcome.conflicts {
            ctx.after_commit(PostCommit::DeleteCloudObject(CloudFileName::new(
                row.owner_user_id,
                row.device_id,
                row.file_id,
                0,
            )));
        }
        let conflicts: Vec<FileId> = outcome.conflicts.iter().map(|row| row.file_id).collect();
        if !conflicts.is_empty() {
            info!(%group, conflicts = conflicts.len(), "dropped uploads of files created elsewhere");
        }
        if outcome.transferred == 0 {
            return Ok(DoneUploadsResponse {
                transferred: 0,
                master_version: current,
                deferred_upload_ids: Vec::new(),
                conflicts,
            });
        }

        let master_version = match tx.master_versions().compare_and_increment(group, self.master_version)? {
            MasterVersionUpdate::Incremented { new_version } => new_version,
            MasterVersionUpdate::Conflict { current } => {
                return Err(SyncError::MasterVersionConflict { current });
            }
        };
        ctx.server().metrics().batch_finalized();

        for entry in &outcome.deleted {
            ctx.after_commit(PostCommit::DeleteCloudObject(CloudFileName::new(
                entry.owner_user_id,
                entry.device_id,
                entry.file_id,
                entry.file_version,
            )));
        }
        ctx.after_commit(PostCommit::Publish {
            sharing_group_id: group,
            message: format!("master version {master_version}"),
        });

        info!(
            %group,
            transferred = outcome.transferred,
            master_version,
            "batch committed"
        );
        Ok(DoneUploadsResponse {
            transferred: outcome.transferred,
            master_version,
            deferred_upload_ids: outcome.deferred,
            conflicts,
        })
    }
}

/// The calling device's staged rows in one group.
#[derive(Debug, Clone)]
pub struct GetUploads {
    pub sharing_group_id: SharingGroupId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GetUploadsResponse {
    pub uploads: Vec<UploadRecord>,
}

impl Endpoint for GetUploads {
    type Output = GetUploadsResponse;

    fn name(&self) -> &'static str {
        "GetUploads"
    }

    fn access(&self) -> Option<(SharingGroupId, Permission)> {
        Some((self.sharing_group_id, Permission::Read))
    }

    fn tx_mode(&self) -> TxMode {
        TxMode::Deferred
    }

    fn process(&self, ctx: &mut RequestContext<'_, '_>) -> Result<GetUploadsResponse, SyncError> {
        let uploads = ctx
            .tx()
            .uploads()
            .staged_for_device(self.sharing_group_id, ctx.user_id()?, ctx.device_id())?;
        Ok(GetUploadsResponse { uploads })
    }
}

/// Outcome of one queued change, visible to the user who uploaded it.
#[derive(Debug, Clone)]
pub struct GetUploadsResults {
    pub deferred_upload_id: DeferredUploadId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GetUploadsResultsResponse {
    /// `None` once the change has been pruned, or if it never existed.
    pub status: Option<DeferredStatus>,
}

impl Endpoint for GetUploadsResults {
    type Output = GetUploadsResultsResponse;

    fn name(&self) -> &'static str {
        "GetUploadsResults"
    }

    fn tx_mode(&self) -> TxMode {
        TxMode::Deferred
    }

    fn process(&self, ctx: &mut RequestContext<'_, '_>) -> Result<GetUploadsResultsResponse, SyncError> {
        let Some(change) = ctx.tx().deferred_uploads().get(self.deferred_upload_id)? else {
            return Ok(GetUploadsResultsResponse { status: None });
        };
        if change.owner_user_id != ctx.user_id()? {
            return Err(SyncError::Unauthorized(format!(
                "deferred upload {} belongs to another user",
                self.deferred_upload_id
            )));
        }
        Ok(GetUploadsResultsResponse {
            status: Some(change.status),
        })
    }
}
