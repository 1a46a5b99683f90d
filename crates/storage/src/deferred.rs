use rusqlite::{Connection, OptionalExtension, Row, params};

use groupsync_core::ids::*;

use crate::error::StorageError;
use crate::records::{DeferredChangeRecord, DeferredStatus};
use crate::store::{count_rows, id_bytes, opt_id_bytes, text_col};

const SELECT_COLUMNS: &str = "SELECT deferred_upload_id, sharing_group_id, file_group_id, file_id, owner_user_id, status, change_resolver_name, payload, completed_at FROM deferred_uploads";

/// Queue of change payloads waiting for the Uploader. Ids increase with
/// insertion, which is the order changes are merged in.
///
/// A merged or discarded change keeps its row, payload emptied, so clients
/// can poll its outcome until `prune_completed` removes it.
pub struct DeferredUploadRepo<'a> {
    conn: &'a Connection,
}

fn read_deferred(row: &Row) -> rusqlite::Result<DeferredChangeRecord> {
    Ok(DeferredChangeRecord {
        deferred_upload_id: Some(DeferredUploadId::from_raw(row.get(0)?)),
        sharing_group_id: SharingGroupId::from_bytes(id_bytes(row, 1)?),
        file_group_id: opt_id_bytes(row, 2)?.map(FileGroupId::from_bytes),
        file_id: FileId::from_bytes(id_bytes(row, 3)?),
        owner_user_id: UserId::from_bytes(id_bytes(row, 4)?),
        status: text_col(row, 5, DeferredStatus::parse)?,
        change_resolver_name: row.get(6)?,
        payload: row.get(7)?,
        completed_at: row.get(8)?,
    })
}

impl<'a> DeferredUploadRepo<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn enqueue(&self, record: &DeferredChangeRecord) -> Result<DeferredUploadId, StorageError> {
        if record.change_resolver_name.trim().is_empty() {
            return Err(StorageError::Validation(format!("change to {} has no resolver", record.file_id)));
        }
        self.conn.execute(
            "INSERT INTO deferred_uploads (sharing_group_id, file_group_id, file_id, owner_user_id, status, change_resolver_name, payload, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL)",
            params![
                record.sharing_group_id.as_bytes().as_slice(),
                record.file_group_id.as_ref().map(|g| g.as_bytes().as_slice()),
                record.file_id.as_bytes().as_slice(),
                record.owner_user_id.as_bytes().as_slice(),
                record.status.as_str(),
                record.change_resolver_name,
                record.payload,
            ],
        )?;
        Ok(DeferredUploadId::from_raw(self.conn.last_insert_rowid()))
    }

    /// Groups that have at least one pending change, oldest work first.
    pub fn groups_with_pending(&self) -> Result<Vec<SharingGroupId>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT sharing_group_id FROM deferred_uploads WHERE status = ?1
             GROUP BY sharing_group_id ORDER BY MIN(deferred_upload_id)",
        )?;
        let rows = stmt.query_map(params![DeferredStatus::PendingChange.as_str()], |row| {
            Ok(SharingGroupId::from_bytes(id_bytes(row, 0)?))
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn pending_for_group(&self, sharing_group_id: SharingGroupId) -> Result<Vec<DeferredChangeRecord>, StorageError> {
        let mut stmt = self.conn.prepare(&format!(
            "{SELECT_COLUMNS} WHERE sharing_group_id = ?1 AND status = ?2 ORDER BY deferred_upload_id"
        ))?;
        let rows = stmt.query_map(
            params![
                sharing_group_id.as_bytes().as_slice(),
                DeferredStatus::PendingChange.as_str()
            ],
            read_deferred,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn get(&self, id: DeferredUploadId) -> Result<Option<DeferredChangeRecord>, StorageError> {
        let record = self
            .conn
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE deferred_upload_id = ?1"),
                params![id.raw()],
                read_deferred,
            )
            .optional()?;
        Ok(record)
    }

    /// Moves pending rows to a final status and drops their payloads.
    /// Returns how many were still pending.
    pub fn complete(&self, ids: &[DeferredUploadId], status: DeferredStatus, now: i64) -> Result<usize, StorageError> {
        if status == DeferredStatus::PendingChange {
            return Err(StorageError::Validation("cannot complete a change as pending".into()));
        }
        let mut stmt = self.conn.prepare_cached(
            "UPDATE deferred_uploads SET status = ?1, payload = x'', completed_at = ?2
             WHERE deferred_upload_id = ?3 AND status = ?4",
        )?;
        let mut completed = 0;
        for id in ids {
            completed += stmt.execute(params![
                status.as_str(),
                now,
                id.raw(),
                DeferredStatus::PendingChange.as_str()
            ])?;
        }
        Ok(completed)
    }

    /// Deletes completed rows finished at or before `cutoff`.
    pub fn prune_completed(&self, cutoff: i64) -> Result<usize, StorageError> {
        Ok(self.conn.execute(
            "DELETE FROM deferred_uploads WHERE status != ?1 AND completed_at <= ?2",
            params![DeferredStatus::PendingChange.as_str(), cutoff],
        )?)
    }

    pub fn remove_for_owner(&self, owner_user_id: UserId) -> Result<usize, StorageError> {
        Ok(self.conn.execute(
            "DELETE FROM deferred_uploads WHERE owner_user_id = ?1",
            params![owner_user_id.as_bytes().as_slice()],
        )?)
    }

    pub fn count(&self) -> Result<u64, StorageError> {
        count_rows(self.conn, "deferred_uploads")
    }

    pub fn count_pending(&self) -> Result<u64, StorageError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM deferred_uploads WHERE status = ?1",
            params![DeferredStatus::PendingChange.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::open_in_memory;

    fn change(group: SharingGroupId, file_id: FileId, payload: &[u8]) -> DeferredChangeRecord {
        DeferredChangeRecord {
            deferred_upload_id: None,
            sharing_group_id: group,
            file_group_id: None,
            file_id,
            owner_user_id: UserId::new(),
            status: DeferredStatus::PendingChange,
            change_resolver_name: "AppendBytes".into(),
            payload: payload.to_vec(),
            completed_at: None,
        }
    }

    #[test]
    fn pending_changes_come_back_in_insertion_order() -> Result<(), StorageError> {
        let conn = open_in_memory()?;
        let repo = DeferredUploadRepo::new(&conn);
        let group = SharingGroupId::new();
        let file = FileId::new();
        repo.enqueue(&change(group, file, b"1"))?;
        repo.enqueue(&change(SharingGroupId::new(), file, b"other"))?;
        repo.enqueue(&change(group, file, b"2"))?;

        let payloads: Vec<_> = repo.pending_for_group(group)?.into_iter().map(|c| c.payload).collect();
        assert_eq!(payloads, vec![b"1".to_vec(), b"2".to_vec()]);
        Ok(())
    }

    #[test]
    fn groups_with_pending_lists_each_group_once() -> Result<(), StorageError> {
        let conn = open_in_memory()?;
        let repo = DeferredUploadRepo::new(&conn);
        let a = SharingGroupId::new();
        let b = SharingGroupId::new();
        repo.enqueue(&change(a, FileId::new(), b"1"))?;
        repo.enqueue(&change(b, FileId::new(), b"2"))?;
        repo.enqueue(&change(a, FileId::new(), b"3"))?;
        assert_eq!(repo.groups_with_pending()?, vec![a, b]);
        Ok(())
    }

    #[test]
    fn complete_touches_only_named_pending_rows() -> Result<(), StorageError> {
        let conn = open_in_memory()?;
        let repo = DeferredUploadRepo::new(&conn);
        let group = SharingGroupId::new();
        let first = repo.enqueue(&change(group, FileId::new(), b"1"))?;
        repo.enqueue(&change(group, FileId::new(), b"2"))?;

        assert_eq!(repo.complete(&[first], DeferredStatus::Processed, 100)?, 1);
        // Already completed: nothing left to move.
        assert_eq!(repo.complete(&[first], DeferredStatus::Discarded, 200)?, 0);
        assert_eq!(repo.count_pending()?, 1);
        assert_eq!(repo.pending_for_group(group)?.len(), 1);

        let done = repo.get(first)?.ok_or(StorageError::NotFound("first".into()))?;
        assert_eq!(done.status, DeferredStatus::Processed);
        assert!(done.payload.is_empty());
        assert_eq!(done.completed_at, Some(100));
        assert!(matches!(
            repo.complete(&[first], DeferredStatus::PendingChange, 300),
            Err(StorageError::Validation(_))
        ));
        Ok(())
    }

    #[test]
    fn prune_removes_only_old_completed_rows() -> Result<(), StorageError> {
        let conn = open_in_memory()?;
        let repo = DeferredUploadRepo::new(&conn);
        let group = SharingGroupId::new();
        let old = repo.enqueue(&change(group, FileId::new(), b"1"))?;
        let recent = repo.enqueue(&change(group, FileId::new(), b"2"))?;
        let pending = repo.enqueue(&change(group, FileId::new(), b"3"))?;
        repo.complete(&[old], DeferredStatus::Processed, 100)?;
        repo.complete(&[recent], DeferredStatus::Discarded, 500)?;

        assert_eq!(repo.prune_completed(200)?, 1);
        assert!(repo.get(old)?.is_none());
        assert!(repo.get(recent)?.is_some());
        assert!(repo.get(pending)?.is_some());
        Ok(())
    }

    #[test]
    fn blank_resolver_is_rejected() -> Result<(), StorageError> {
        let conn = open_in_memory()?;
        let repo = DeferredUploadRepo::new(&conn);
        let mut record = change(SharingGroupId::new(), FileId::new(), b"1");
        record.change_resolver_name = " ".into();
        assert!(matches!(repo.enqueue(&record), Err(StorageError::Validation(_))));
        Ok(())
    }
}
