use rusqlite::{Connection, params};
use tracing::debug;

use groupsync_core::SharingGroupId;

use crate::error::StorageError;

/// Per-group lock rows. The lock is held from `acquire` until the enclosing
/// transaction commits or rolls back; there is no unlock call.
///
/// `acquire` writes the group's lock row. A concurrent transaction writing
/// the same row waits (bounded by the connection's busy timeout) until the
/// holder ends. Callers that must see the holder's committed state begin
/// their transaction with `TxMode::Immediate`.
pub struct GroupLockRepo<'a> {
    conn: &'a Connection,
}

impl<'a> GroupLockRepo<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn create(&self, sharing_group_id: SharingGroupId) -> Result<(), StorageError> {
        self.conn
            .execute(
                "INSERT INTO sharing_group_locks (sharing_group_id) VALUES (?1)",
                params![sharing_group_id.as_bytes().as_slice()],
            )
            .map_err(|e| StorageError::from_write(e, || format!("lock row for {sharing_group_id}")))?;
        Ok(())
    }

    pub fn acquire(&self, sharing_group_id: SharingGroupId) -> Result<(), StorageError> {
        let changed = self
            .conn
            .execute(
                "UPDATE sharing_group_locks SET acquisitions = acquisitions + 1 WHERE sharing_group_id = ?1",
                params![sharing_group_id.as_bytes().as_slice()],
            )
            .map_err(|e| StorageError::from_write(e, || format!("group lock {sharing_group_id}")))?;
        if changed != 1 {
            return Err(StorageError::NotFound(format!("lock row for {sharing_group_id}")));
        }
        debug!(%sharing_group_id, "group lock acquired");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{SqliteStore, StoreTx, TxMode, open_in_memory};
    use std::time::Duration;

    #[test]
    fn acquire_without_row_is_not_found() -> Result<(), StorageError> {
        let conn = open_in_memory()?;
        let repo = GroupLockRepo::new(&conn);
        assert!(matches!(
            repo.acquire(SharingGroupId::new()),
            Err(StorageError::NotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn acquire_is_repeatable_within_one_transaction() -> Result<(), StorageError> {
        let conn = open_in_memory()?;
        let repo = GroupLockRepo::new(&conn);
        let group = SharingGroupId::new();
        repo.create(group)?;
        repo.acquire(group)?;
        repo.acquire(group)?;
        let count: i64 = conn.query_row("SELECT acquisitions FROM sharing_group_locks", [], |row| row.get(0))?;
        assert_eq!(count, 2);
        Ok(())
    }

    #[test]
    fn held_lock_times_out_second_writer() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let store = SqliteStore::open_path(&dir.path().join("lock.db"), Duration::from_millis(50))?;
        let group = SharingGroupId::new();
        {
            let mut conn = store.connect()?;
            let tx = StoreTx::begin(&mut conn, TxMode::Immediate)?;
            tx.group_locks().create(group)?;
            tx.commit()?;
        }

        let mut holder = store.connect()?;
        let held = StoreTx::begin(&mut holder, TxMode::Immediate)?;
        held.group_locks().acquire(group)?;

        let mut waiter = store.connect()?;
        {
            let blocked = StoreTx::begin(&mut waiter, TxMode::Immediate);
            assert!(matches!(blocked, Err(StorageError::LockTimeout(_))));
        }

        held.rollback()?;
        let tx = StoreTx::begin(&mut waiter, TxMode::Immediate)?;
        tx.group_locks().acquire(group)?;
        tx.commit()?;
        Ok(())
    }
}
