use std::collections::BTreeSet;

use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::{debug, info};

use groupsync_core::ids::*;

use crate::deferred::DeferredUploadRepo;
use crate::error::StorageError;
use crate::file_index::{DeletionCriteria, FileIndexRepo};
use crate::records::{DeferredChangeRecord, DeferredStatus, FileIndexEntry, UploadRecord, UploadState};
use crate::store::{count_rows, id_bytes, opt_checksum, opt_id_bytes, opt_u64_col, text_col, u32_col};

const SELECT_COLUMNS: &str = "SELECT upload_id, sharing_group_id, file_id, file_group_id, owner_user_id, device_id, mime_type, app_meta_data, is_file_upload, file_version, state, size_bytes, checksum, change_resolver_name, contents FROM uploads";

/// What a finalize moved out of staging.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FinalizeOutcome {
    pub transferred: usize,
    /// Catalog entries created at version 0.
    pub created: Vec<FileIndexEntry>,
    /// Catalog entries this batch soft-deleted, as they were before deletion.
    pub deleted: Vec<FileIndexEntry>,
    pub deferred: Vec<DeferredUploadId>,
    /// Version 0 uploads of files another device already created. Their
    /// staged rows are dropped without touching the catalog.
    pub conflicts: Vec<UploadRecord>,
}

/// Staging area for upload and deletion declarations. One row per
/// (file, owner, device), so two devices of one user never collide.
pub struct UploadRepo<'a> {
    conn: &'a Connection,
}

fn read_upload(row: &Row) -> rusqlite::Result<UploadRecord> {
    Ok(UploadRecord {
        upload_id: Some(UploadId::from_raw(row.get(0)?)),
        sharing_group_id: SharingGroupId::from_bytes(id_bytes(row, 1)?),
        file_id: FileId::from_bytes(id_bytes(row, 2)?),
        file_group_id: opt_id_bytes(row, 3)?.map(FileGroupId::from_bytes),
        owner_user_id: UserId::from_bytes(id_bytes(row, 4)?),
        device_id: DeviceId::from_bytes(id_bytes(row, 5)?),
        mime_type: row.get(6)?,
        app_meta_data: row.get(7)?,
        is_file_upload: row.get(8)?,
        file_version: u32_col(row, 9)?,
        state: text_col(row, 10, UploadState::parse)?,
        size_bytes: opt_u64_col(row, 11)?,
        checksum: opt_checksum(row, 12)?,
        change_resolver_name: row.get(13)?,
        contents: row.get(14)?,
    })
}

/// Checks the file-group rule for a batch before anything is written. A batch
/// with change uploads holds only change uploads, all in one file group; an
/// ungrouped change may only travel alone.
fn check_batch(rows: &[UploadRecord]) -> Result<(), StorageError> {
    let changes = rows.iter().filter(|r| r.is_change()).count();
    if changes == 0 {
        return Ok(());
    }
    if changes != rows.len() {
        return Err(StorageError::BatchRejected(format!(
            "{changes} change uploads mixed with {} other uploads",
            rows.len() - changes
        )));
    }
    let groups: BTreeSet<Option<FileGroupId>> = rows.iter().map(|r| r.file_group_id).collect();
    if groups.len() > 1 {
        return Err(StorageError::BatchRejected(format!(
            "change uploads span {} file groups",
            groups.len()
        )));
    }
    if groups.contains(&None) && changes > 1 {
        return Err(StorageError::BatchRejected(format!(
            "{changes} change uploads without a file group"
        )));
    }
    Ok(())
}

impl<'a> UploadRepo<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn add(&self, record: &UploadRecord) -> Result<UploadId, StorageError> {
        record.validate()?;
        self.conn
            .execute(
                "INSERT INTO uploads (sharing_group_id, file_id, file_group_id, owner_user_id, device_id, mime_type, app_meta_data, is_file_upload, file_version, state, size_bytes, checksum, change_resolver_name, contents)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    record.sharing_group_id.as_bytes().as_slice(),
                    record.file_id.as_bytes().as_slice(),
                    record.file_group_id.as_ref().map(|g| g.as_bytes().as_slice()),
                    record.owner_user_id.as_bytes().as_slice(),
                    record.device_id.as_bytes().as_slice(),
                    record.mime_type,
                    record.app_meta_data,
                    record.is_file_upload,
                    record.file_version,
                    record.state.as_str(),
                    record.size_bytes.map(|s| s as i64),
                    record.checksum.map(|c| c.to_hex()),
                    record.change_resolver_name,
                    record.contents,
                ],
            )
            .map_err(|e| {
                StorageError::from_write(e, || {
                    format!("upload of {} already staged by device {}", record.file_id, record.device_id)
                })
            })?;
        Ok(UploadId::from_raw(self.conn.last_insert_rowid()))
    }

    /// Writes state and version. Optional fields absent from `record` keep
    /// their stored values.
    pub fn update(&self, record: &UploadRecord) -> Result<(), StorageError> {
        let upload_id = record
            .upload_id
            .ok_or_else(|| StorageError::Validation(format!("update of {} without an upload id", record.file_id)))?;
        record.validate()?;
        let changed = self.conn.execute(
            "UPDATE uploads SET
                 state = ?1,
                 file_version = ?2,
                 mime_type = COALESCE(?3, mime_type),
                 app_meta_data = COALESCE(?4, app_meta_data),
                 size_bytes = COALESCE(?5, size_bytes),
                 checksum = COALESCE(?6, checksum)
             WHERE upload_id = ?7",
            params![
                record.state.as_str(),
                record.file_version,
                record.mime_type,
                record.app_meta_data,
                record.size_bytes.map(|s| s as i64),
                record.checksum.map(|c| c.to_hex()),
                upload_id.raw(),
            ],
        )?;
        if changed != 1 {
            return Err(StorageError::NotFound(format!("upload {upload_id}")));
        }
        Ok(())
    }

    pub fn get(&self, upload_id: UploadId) -> Result<Option<UploadRecord>, StorageError> {
        let record = self
            .conn
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE upload_id = ?1"),
                params![upload_id.raw()],
                read_upload,
            )
            .optional()?;
        Ok(record)
    }

    pub fn lookup(
        &self,
        file_id: FileId,
        owner_user_id: UserId,
        device_id: DeviceId,
    ) -> Result<Option<UploadRecord>, StorageError> {
        let record = self
            .conn
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE file_id = ?1 AND owner_user_id = ?2 AND device_id = ?3"),
                params![
                    file_id.as_bytes().as_slice(),
                    owner_user_id.as_bytes().as_slice(),
                    device_id.as_bytes().as_slice()
                ],
                read_upload,
            )
            .optional()?;
        Ok(record)
    }

    /// Rows staged by one device in one group, any state, in staging order.
    pub fn staged_for_device(
        &self,
        sharing_group_id: SharingGroupId,
        owner_user_id: UserId,
        device_id: DeviceId,
    ) -> Result<Vec<UploadRecord>, StorageError> {
        self.select_for_device(sharing_group_id, owner_user_id, device_id, None)
    }

    fn select_for_device(
        &self,
        sharing_group_id: SharingGroupId,
        owner_user_id: UserId,
        device_id: DeviceId,
        state: Option<UploadState>,
    ) -> Result<Vec<UploadRecord>, StorageError> {
        let mut stmt = self.conn.prepare(&format!(
            "{SELECT_COLUMNS} WHERE sharing_group_id = ?1 AND owner_user_id = ?2 AND device_id = ?3
             AND (?4 IS NULL OR state = ?4) ORDER BY upload_id"
        ))?;
        let rows = stmt.query_map(
            params![
                sharing_group_id.as_bytes().as_slice(),
                owner_user_id.as_bytes().as_slice(),
                device_id.as_bytes().as_slice(),
                state.map(|s| s.as_str()),
            ],
            read_upload,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn remove(&self, upload_id: UploadId) -> Result<usize, StorageError> {
        Ok(self
            .conn
            .execute("DELETE FROM uploads WHERE upload_id = ?1", params![upload_id.raw()])?)
    }

    pub fn remove_for_owner(&self, owner_user_id: UserId) -> Result<usize, StorageError> {
        Ok(self.conn.execute(
            "DELETE FROM uploads WHERE owner_user_id = ?1",
            params![owner_user_id.as_bytes().as_slice()],
        )?)
    }

    pub fn count(&self) -> Result<u64, StorageError> {
        count_rows(self.conn, "uploads")
    }

    /// Moves every `uploaded` row of (group, owner, device) out of staging.
    /// Version 0 uploads become catalog entries, deletions soft-delete their
    /// entry, and change uploads join the deferred queue. A version 0 upload
    /// whose file is already in the catalog is reported in `conflicts` and
    /// not counted as transferred. Must run inside the caller's transaction;
    /// an error leaves the caller to roll back.
    pub fn finalize(
        &self,
        sharing_group_id: SharingGroupId,
        owner_user_id: UserId,
        device_id: DeviceId,
        now: i64,
    ) -> Result<FinalizeOutcome, StorageError> {
        let rows = self.select_for_device(sharing_group_id, owner_user_id, device_id, Some(UploadState::Uploaded))?;
        if rows.is_empty() {
            debug!(%sharing_group_id, %device_id, "nothing to finalize");
            return Ok(FinalizeOutcome::default());
        }
        check_batch(&rows)?;

        let file_index = FileIndexRepo::new(self.conn);
        let deferred = DeferredUploadRepo::new(self.conn);
        let mut outcome = FinalizeOutcome::default();

        for row in &rows {
            if row.is_deletion() {
                let entry = file_index
                    .lookup(sharing_group_id, row.file_id)?
                    .ok_or_else(|| StorageError::NotFound(format!("catalog entry for deleted file {}", row.file_id)))?;
                let changed = file_index.mark_deleted(
                    DeletionCriteria::File {
                        sharing_group_id,
                        file_id: row.file_id,
                    },
                    now,
                )?;
                if changed == 1 {
                    outcome.deleted.push(entry);
                }
            } else if row.is_change() {
                let change_resolver_name = row.change_resolver_name.clone().ok_or_else(|| {
                    StorageError::Validation(format!("change upload of {} has no resolver", row.file_id))
                })?;
                let payload = row.contents.clone().unwrap_or_default();
                let id = deferred.enqueue(&DeferredChangeRecord {
                    deferred_upload_id: None,
                    sharing_group_id,
                    file_group_id: row.file_group_id,
                    file_id: row.file_id,
                    owner_user_id: row.owner_user_id,
                    status: DeferredStatus::PendingChange,
                    change_resolver_name,
                    payload,
                    completed_at: None,
                })?;
                outcome.deferred.push(id);
            } else if file_index.lookup(sharing_group_id, row.file_id)?.is_some() {
                outcome.conflicts.push(row.clone());
            } else {
                let entry = FileIndexEntry {
                    sharing_group_id,
                    file_id: row.file_id,
                    file_group_id: row.file_group_id,
                    owner_user_id: row.owner_user_id,
                    device_id: row.device_id,
                    mime_type: row.mime_type.clone().unwrap_or_default(),
                    app_meta_data: row.app_meta_data.clone(),
                    deleted: false,
                    file_version: 0,
                    size_bytes: row.size_bytes.unwrap_or_default(),
                    checksum: row.checksum,
                    change_resolver_name: row.change_resolver_name.clone(),
                    creation_date: now,
                    update_date: now,
                };
                file_index.add(&entry)?;
                outcome.created.push(entry);
            }
        }

        let removed = self.conn.execute(
            "DELETE FROM uploads WHERE sharing_group_id = ?1 AND owner_user_id = ?2 AND device_id = ?3 AND state = ?4",
            params![
                sharing_group_id.as_bytes().as_slice(),
                owner_user_id.as_bytes().as_slice(),
                device_id.as_bytes().as_slice(),
                UploadState::Uploaded.as_str(),
            ],
        )?;
        if removed != rows.len() {
            return Err(StorageError::Validation(format!(
                "finalize removed {removed} staged rows but transferred {}",
                rows.len()
            )));
        }
        outcome.transferred = removed - outcome.conflicts.len();

        info!(
            %sharing_group_id,
            %device_id,
            transferred = outcome.transferred,
            created = outcome.created.len(),
            deleted = outcome.deleted.len(),
            deferred = outcome.deferred.len(),
            conflicts = outcome.conflicts.len(),
            "uploads finalized"
        );
        Ok(outcome)
    }
}
