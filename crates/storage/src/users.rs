use rusqlite::{Connection, OptionalExtension, Row, params};

use groupsync_core::ids::*;

use crate::error::StorageError;
use crate::records::{DeviceRecord, UserRecord};

pub struct UserRepo<'a> {
    conn: &'a Connection,
}

fn read_user(row: &Row) -> rusqlite::Result<UserRecord> {
    Ok(UserRecord {
        user_id: UserId::from_bytes(crate::store::id_bytes(row, 0)?),
        account_type: row.get(1)?,
        creds_id: row.get(2)?,
        creds: row.get(3)?,
    })
}

impl<'a> UserRepo<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn add(&self, user: &UserRecord) -> Result<(), StorageError> {
        self.conn
            .execute(
                "INSERT INTO users (user_id, account_type, creds_id, creds) VALUES (?1, ?2, ?3, ?4)",
                params![user.user_id.as_bytes().as_slice(), user.account_type, user.creds_id, user.creds],
            )
            .map_err(|e| {
                StorageError::from_write(e, || format!("{} account {} already registered", user.account_type, user.creds_id))
            })?;
        Ok(())
    }

    pub fn get(&self, user_id: UserId) -> Result<Option<UserRecord>, StorageError> {
        let user = self
            .conn
            .query_row(
                "SELECT user_id, account_type, creds_id, creds FROM users WHERE user_id = ?1",
                params![user_id.as_bytes().as_slice()],
                read_user,
            )
            .optional()?;
        Ok(user)
    }

    pub fn lookup_by_creds(&self, account_type: &str, creds_id: &str) -> Result<Option<UserRecord>, StorageError> {
        let user = self
            .conn
            .query_row(
                "SELECT user_id, account_type, creds_id, creds FROM users WHERE account_type = ?1 AND creds_id = ?2",
                params![account_type, creds_id],
                read_user,
            )
            .optional()?;
        Ok(user)
    }

    pub fn update_creds(&self, user_id: UserId, creds: &str) -> Result<(), StorageError> {
        let changed = self.conn.execute(
            "UPDATE users SET creds = ?1 WHERE user_id = ?2",
            params![creds, user_id.as_bytes().as_slice()],
        )?;
        if changed != 1 {
            return Err(StorageError::NotFound(format!("user {user_id}")));
        }
        Ok(())
    }

    pub fn remove(&self, user_id: UserId) -> Result<usize, StorageError> {
        Ok(self
            .conn
            .execute("DELETE FROM users WHERE user_id = ?1", params![user_id.as_bytes().as_slice()])?)
    }
}

pub struct DeviceRepo<'a> {
    conn: &'a Connection,
}

impl<'a> DeviceRepo<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn lookup(&self, device_id: DeviceId) -> Result<Option<DeviceRecord>, StorageError> {
        let device = self
            .conn
            .query_row(
                "SELECT device_id, user_id FROM device_uuids WHERE device_id = ?1",
                params![device_id.as_bytes().as_slice()],
                |row| {
                    Ok(DeviceRecord {
                        device_id: DeviceId::from_bytes(crate::store::id_bytes(row, 0)?),
                        user_id: UserId::from_bytes(crate::store::id_bytes(row, 1)?),
                    })
                },
            )
            .optional()?;
        Ok(device)
    }

    pub fn count_for_user(&self, user_id: UserId) -> Result<u32, StorageError> {
        let count: u32 = self.conn.query_row(
            "SELECT COUNT(*) FROM device_uuids WHERE user_id = ?1",
            params![user_id.as_bytes().as_slice()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn add(&self, device: DeviceRecord) -> Result<(), StorageError> {
        self.conn
            .execute(
                "INSERT INTO device_uuids (device_id, user_id) VALUES (?1, ?2)",
                params![device.device_id.as_bytes().as_slice(), device.user_id.as_bytes().as_slice()],
            )
            .map_err(|e| StorageError::from_write(e, || format!("device {} already registered", device.device_id)))?;
        Ok(())
    }

    pub fn remove_for_user(&self, user_id: UserId) -> Result<usize, StorageError> {
        Ok(self.conn.execute(
            "DELETE FROM device_uuids WHERE user_id = ?1",
            params![user_id.as_bytes().as_slice()],
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::open_in_memory;

    fn user(creds_id: &str) -> UserRecord {
        UserRecord {
            user_id: UserId::new(),
            account_type: "Google".into(),
            creds_id: creds_id.into(),
            creds: None,
        }
    }

    #[test]
    fn lookup_by_creds_finds_registered_user() -> Result<(), StorageError> {
        let conn = open_in_memory()?;
        let repo = UserRepo::new(&conn);
        let u = user("alice");
        repo.add(&u)?;
        assert_eq!(repo.lookup_by_creds("Google", "alice")?, Some(u.clone()));
        assert_eq!(repo.lookup_by_creds("Dropbox", "alice")?, None);
        assert!(matches!(repo.add(&user("alice")), Err(StorageError::ConstraintViolation(_))));
        Ok(())
    }

    #[test]
    fn update_creds_requires_existing_user() -> Result<(), StorageError> {
        let conn = open_in_memory()?;
        let repo = UserRepo::new(&conn);
        let u = user("bob");
        repo.add(&u)?;
        repo.update_creds(u.user_id, "refreshed")?;
        assert_eq!(repo.get(u.user_id)?.unwrap().creds.as_deref(), Some("refreshed"));
        assert!(matches!(repo.update_creds(UserId::new(), "x"), Err(StorageError::NotFound(_))));
        Ok(())
    }

    #[test]
    fn devices_are_counted_per_user() -> Result<(), StorageError> {
        let conn = open_in_memory()?;
        let repo = DeviceRepo::new(&conn);
        let owner = UserId::new();
        let phone = DeviceRecord {
            device_id: DeviceId::new(),
            user_id: owner,
        };
        repo.add(phone)?;
        repo.add(DeviceRecord {
            device_id: DeviceId::new(),
            user_id: owner,
        })?;
        assert_eq!(repo.count_for_user(owner)?, 2);
        assert_eq!(repo.lookup(phone.device_id)?, Some(phone));
        assert_eq!(repo.remove_for_user(owner)?, 2);
        assert_eq!(repo.remove_for_user(owner)?, 0);
        Ok(())
    }
}
