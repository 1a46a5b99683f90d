use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::debug;

use groupsync_core::ids::*;

use crate::error::StorageError;
use crate::records::FileIndexEntry;
use crate::store::{count_rows, id_bytes, opt_checksum, opt_id_bytes, u32_col, u64_col};

const SELECT_COLUMNS: &str = "SELECT sharing_group_id, file_id, file_group_id, owner_user_id, device_id, mime_type, app_meta_data, deleted, file_version, size_bytes, checksum, change_resolver_name, creation_date, update_date FROM file_index";

/// Which catalog rows a bulk soft-delete applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionCriteria {
    Owner(UserId),
    File {
        sharing_group_id: SharingGroupId,
        file_id: FileId,
    },
}

/// The authoritative file catalog. Rows are never physically removed;
/// deletion sets `deleted`, and `file_version` only moves forward.
pub struct FileIndexRepo<'a> {
    conn: &'a Connection,
}

fn read_entry(row: &Row) -> rusqlite::Result<FileIndexEntry> {
    Ok(FileIndexEntry {
        sharing_group_id: SharingGroupId::from_bytes(id_bytes(row, 0)?),
        file_id: FileId::from_bytes(id_bytes(row, 1)?),
        file_group_id: opt_id_bytes(row, 2)?.map(FileGroupId::from_bytes),
        owner_user_id: UserId::from_bytes(id_bytes(row, 3)?),
        device_id: DeviceId::from_bytes(id_bytes(row, 4)?),
        mime_type: row.get(5)?,
        app_meta_data: row.get(6)?,
        deleted: row.get(7)?,
        file_version: u32_col(row, 8)?,
        size_bytes: u64_col(row, 9)?,
        checksum: opt_checksum(row, 10)?,
        change_resolver_name: row.get(11)?,
        creation_date: row.get(12)?,
        update_date: row.get(13)?,
    })
}

impl<'a> FileIndexRepo<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn add(&self, entry: &FileIndexEntry) -> Result<(), StorageError> {
        if entry.mime_type.trim().is_empty() {
            return Err(StorageError::Validation(format!("file {} has no mime type", entry.file_id)));
        }
        if entry.change_resolver_name.as_deref().is_some_and(|n| n.trim().is_empty()) {
            return Err(StorageError::Validation(format!(
                "file {} has an empty resolver name",
                entry.file_id
            )));
        }

        self.conn
            .execute(
                "INSERT INTO file_index (sharing_group_id, file_id, file_group_id, owner_user_id, device_id, mime_type, app_meta_data, deleted, file_version, size_bytes, checksum, change_resolver_name, creation_date, update_date)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    entry.sharing_group_id.as_bytes().as_slice(),
                    entry.file_id.as_bytes().as_slice(),
                    entry.file_group_id.as_ref().map(|g| g.as_bytes().as_slice()),
                    entry.owner_user_id.as_bytes().as_slice(),
                    entry.device_id.as_bytes().as_slice(),
                    entry.mime_type,
                    entry.app_meta_data,
                    entry.deleted,
                    entry.file_version,
                    entry.size_bytes as i64,
                    entry.checksum.map(|c| c.to_hex()),
                    entry.change_resolver_name,
                    entry.creation_date,
                    entry.update_date,
                ],
            )
            .map_err(|e| {
                StorageError::from_write(e, || {
                    format!("file {} owned by {} already in catalog", entry.file_id, entry.owner_user_id)
                })
            })?;
        Ok(())
    }

    pub fn lookup(
        &self,
        sharing_group_id: SharingGroupId,
        file_id: FileId,
    ) -> Result<Option<FileIndexEntry>, StorageError> {
        let entry = self
            .conn
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE sharing_group_id = ?1 AND file_id = ?2"),
                params![sharing_group_id.as_bytes().as_slice(), file_id.as_bytes().as_slice()],
                read_entry,
            )
            .optional()?;
        Ok(entry)
    }

    /// Every file ever associated with the group, soft-deleted ones included.
    pub fn list_for_group(&self, sharing_group_id: SharingGroupId) -> Result<Vec<FileIndexEntry>, StorageError> {
        let mut stmt = self
            .conn
            .prepare(&format!("{SELECT_COLUMNS} WHERE sharing_group_id = ?1 ORDER BY file_index_id"))?;
        let rows = stmt.query_map(params![sharing_group_id.as_bytes().as_slice()], read_entry)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn list_for_file_group(
        &self,
        sharing_group_id: SharingGroupId,
        file_group_id: FileGroupId,
    ) -> Result<Vec<FileIndexEntry>, StorageError> {
        let mut stmt = self.conn.prepare(&format!(
            "{SELECT_COLUMNS} WHERE sharing_group_id = ?1 AND file_group_id = ?2 ORDER BY file_index_id"
        ))?;
        let rows = stmt.query_map(
            params![sharing_group_id.as_bytes().as_slice(), file_group_id.as_bytes().as_slice()],
            read_entry,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Soft-deletes matching rows that are not deleted yet and returns how
    /// many changed, so repeating a call is harmless.
    pub fn mark_deleted(&self, criteria: DeletionCriteria, now: i64) -> Result<usize, StorageError> {
        let changed = match criteria {
            DeletionCriteria::Owner(owner_user_id) => self.conn.execute(
                "UPDATE file_index SET deleted = 1, update_date = ?1 WHERE owner_user_id = ?2 AND deleted = 0",
                params![now, owner_user_id.as_bytes().as_slice()],
            )?,
            DeletionCriteria::File {
                sharing_group_id,
                file_id,
            } => self.conn.execute(
                "UPDATE file_index SET deleted = 1, update_date = ?1 WHERE sharing_group_id = ?2 AND file_id = ?3 AND deleted = 0",
                params![
                    now,
                    sharing_group_id.as_bytes().as_slice(),
                    file_id.as_bytes().as_slice()
                ],
            )?,
        };
        debug!(?criteria, changed, "catalog rows marked deleted");
        Ok(changed)
    }

    /// Advances a file to its next version with the merged content's size
    /// and checksum. Returns the new version.
    pub fn bump_version(
        &self,
        file_id: FileId,
        owner_user_id: UserId,
        new_size: u64,
        new_checksum: ContentHash,
        now: i64,
    ) -> Result<u32, StorageError> {
        let new_version: Option<i64> = self
            .conn
            .query_row(
                "UPDATE file_index SET file_version = file_version + 1, size_bytes = ?1, checksum = ?2, update_date = ?3
                 WHERE file_id = ?4 AND owner_user_id = ?5 AND deleted = 0
                 RETURNING file_version",
                params![
                    new_size as i64,
                    new_checksum.to_hex(),
                    now,
                    file_id.as_bytes().as_slice(),
                    owner_user_id.as_bytes().as_slice(),
                ],
                |row| row.get(0),
            )
            .optional()?;
        let new_version =
            new_version.ok_or_else(|| StorageError::NotFound(format!("live catalog entry for {file_id}")))?;
        u32::try_from(new_version)
            .map_err(|_| StorageError::Serialization(format!("file version {new_version} out of range")))
    }

    pub fn count(&self) -> Result<u64, StorageError> {
        count_rows(self.conn, "file_index")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::open_in_memory;

    fn entry(group: SharingGroupId, owner: UserId) -> FileIndexEntry {
        FileIndexEntry {
            sharing_group_id: group,
            file_id: FileId::new(),
            file_group_id: None,
            owner_user_id: owner,
            device_id: DeviceId::new(),
            mime_type: "text/plain".into(),
            app_meta_data: Some("{\"title\":\"notes\"}".into()),
            deleted: false,
            file_version: 0,
            size_bytes: 5,
            checksum: Some(ContentHash::of(b"Hello")),
            change_resolver_name: Some("AppendBytes".into()),
            creation_date: 100,
            update_date: 100,
        }
    }

    #[test]
    fn file_group_listing_skips_other_groups() -> Result<(), StorageError> {
        let conn = open_in_memory()?;
        let repo = FileIndexRepo::new(&conn);
        let group = SharingGroupId::new();
        let owner = UserId::new();
        let file_group = FileGroupId::new();
        let mut first = entry(group, owner);
        first.file_group_id = Some(file_group);
        let mut second = entry(group, owner);
        second.file_group_id = Some(file_group);
        repo.add(&first)?;
        repo.add(&second)?;
        repo.add(&entry(group, owner))?;

        let listed = repo.list_for_file_group(group, file_group)?;
        assert_eq!(listed, vec![first, second]);
        assert!(repo.list_for_file_group(SharingGroupId::new(), file_group)?.is_empty());
        Ok(())
    }

    #[test]
    fn add_and_lookup() -> Result<(), StorageError> {
        let conn = open_in_memory()?;
        let repo = FileIndexRepo::new(&conn);
        let e = entry(SharingGroupId::new(), UserId::new());
        repo.add(&e)?;
        assert_eq!(repo.lookup(e.sharing_group_id, e.file_id)?, Some(e));
        Ok(())
    }

    #[test]
    fn duplicate_file_and_owner_is_rejected() -> Result<(), StorageError> {
        let conn = open_in_memory()?;
        let repo = FileIndexRepo::new(&conn);
        let e = entry(SharingGroupId::new(), UserId::new());
        repo.add(&e)?;
        let mut again = e.clone();
        again.sharing_group_id = SharingGroupId::new();
        assert!(matches!(repo.add(&again), Err(StorageError::ConstraintViolation(_))));
        Ok(())
    }

    #[test]
    fn empty_mime_type_is_rejected_before_insert() -> Result<(), StorageError> {
        let conn = open_in_memory()?;
        let repo = FileIndexRepo::new(&conn);
        let mut e = entry(SharingGroupId::new(), UserId::new());
        e.mime_type = String::new();
        assert!(matches!(repo.add(&e), Err(StorageError::Validation(_))));
        assert_eq!(repo.count()?, 0);
        Ok(())
    }

    #[test]
    fn list_includes_soft_deleted() -> Result<(), StorageError> {
        let conn = open_in_memory()?;
        let repo = FileIndexRepo::new(&conn);
        let group = SharingGroupId::new();
        let owner = UserId::new();
        let a = entry(group, owner);
        let b = entry(group, owner);
        repo.add(&a)?;
        repo.add(&b)?;
        repo.add(&entry(SharingGroupId::new(), owner))?;

        let changed = repo.mark_deleted(
            DeletionCriteria::File {
                sharing_group_id: group,
                file_id: a.file_id,
            },
            200,
        )?;
        assert_eq!(changed, 1);

        let listed = repo.list_for_group(group)?;
        assert_eq!(listed.len(), 2);
        assert!(listed[0].deleted);
        assert!(!listed[1].deleted);
        Ok(())
    }

    #[test]
    fn mark_deleted_by_owner_is_idempotent() -> Result<(), StorageError> {
        let conn = open_in_memory()?;
        let repo = FileIndexRepo::new(&conn);
        let owner = UserId::new();
        repo.add(&entry(SharingGroupId::new(), owner))?;
        repo.add(&entry(SharingGroupId::new(), owner))?;
        repo.add(&entry(SharingGroupId::new(), UserId::new()))?;
        assert_eq!(repo.mark_deleted(DeletionCriteria::Owner(owner), 1)?, 2);
        assert_eq!(repo.mark_deleted(DeletionCriteria::Owner(owner), 2)?, 0);
        assert_eq!(repo.count()?, 3);
        Ok(())
    }

    #[test]
    fn bump_version_advances_by_one() -> Result<(), StorageError> {
        let conn = open_in_memory()?;
        let repo = FileIndexRepo::new(&conn);
        let e = entry(SharingGroupId::new(), UserId::new());
        repo.add(&e)?;
        let merged = b"Hello, World";
        let v1 = repo.bump_version(e.file_id, e.owner_user_id, merged.len() as u64, ContentHash::of(merged), 300)?;
        let v2 = repo.bump_version(e.file_id, e.owner_user_id, merged.len() as u64, ContentHash::of(merged), 301)?;
        assert_eq!((v1, v2), (1, 2));
        let stored = repo.lookup(e.sharing_group_id, e.file_id)?.unwrap();
        assert_eq!(stored.file_version, 2);
        assert_eq!(stored.size_bytes, 12);
        assert_eq!(stored.checksum, Some(ContentHash::of(merged)));
        Ok(())
    }

    #[test]
    fn bump_version_of_deleted_file_fails() -> Result<(), StorageError> {
        let conn = open_in_memory()?;
        let repo = FileIndexRepo::new(&conn);
        let e = entry(SharingGroupId::new(), UserId::new());
        repo.add(&e)?;
        repo.mark_deleted(DeletionCriteria::Owner(e.owner_user_id), 1)?;
        assert!(matches!(
            repo.bump_version(e.file_id, e.owner_user_id, 1, ContentHash::of(b"x"), 2),
            Err(StorageError::NotFound(_))
        ));
        Ok(())
    }
}
