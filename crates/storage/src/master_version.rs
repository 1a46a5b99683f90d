use rusqlite::{Connection, OptionalExtension, params};

use groupsync_core::SharingGroupId;

use crate::error::StorageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterVersionUpdate {
    Incremented { new_version: u64 },
    /// The caller's expected version was stale; nothing was written.
    Conflict { current: u64 },
}

/// One monotonic version counter per sharing group.
pub struct MasterVersionRepo<'a> {
    conn: &'a Connection,
}

impl<'a> MasterVersionRepo<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn create(&self, sharing_group_id: SharingGroupId) -> Result<(), StorageError> {
        self.conn
            .execute(
                "INSERT INTO master_versions (sharing_group_id, version) VALUES (?1, 0)",
                params![sharing_group_id.as_bytes().as_slice()],
            )
            .map_err(|e| {
                StorageError::from_write(e, || format!("master version for {sharing_group_id}"))
            })?;
        Ok(())
    }

    pub fn get(&self, sharing_group_id: SharingGroupId) -> Result<u64, StorageError> {
        let version: Option<i64> = self
            .conn
            .query_row(
                "SELECT version FROM master_versions WHERE sharing_group_id = ?1",
                params![sharing_group_id.as_bytes().as_slice()],
                |row| row.get(0),
            )
            .optional()?;
        version
            .map(|v| v as u64)
            .ok_or_else(|| StorageError::NotFound(format!("master version for {sharing_group_id}")))
    }

    /// Increments only if the stored version equals `expected`. The compare
    /// and the increment are one statement, so a concurrent writer can never
    /// slip between them.
    pub fn compare_and_increment(
        &self,
        sharing_group_id: SharingGroupId,
        expected: u64,
    ) -> Result<MasterVersionUpdate, StorageError> {
        let changed = self.conn.execute(
            "UPDATE master_versions SET version = version + 1 WHERE sharing_group_id = ?1 AND version = ?2",
            params![sharing_group_id.as_bytes().as_slice(), expected as i64],
        )?;
        if changed == 1 {
            return Ok(MasterVersionUpdate::Incremented {
                new_version: expected + 1,
            });
        }
        let current = self.get(sharing_group_id)?;
        Ok(MasterVersionUpdate::Conflict { current })
    }
}
