use rusqlite::{Connection, OptionalExtension, Row, params};

use groupsync_core::ids::*;

use crate::error::StorageError;
use crate::records::{InvitationRecord, MembershipRecord, Permission, SharingGroupRecord};
use crate::store::{id_bytes, text_col};

/// Sharing groups, their members, and outstanding invitations.
pub struct SharingRepo<'a> {
    conn: &'a Connection,
}

fn read_membership(row: &Row) -> rusqlite::Result<MembershipRecord> {
    Ok(MembershipRecord {
        sharing_group_id: SharingGroupId::from_bytes(id_bytes(row, 0)?),
        user_id: UserId::from_bytes(id_bytes(row, 1)?),
        permission: text_col(row, 2, Permission::parse)?,
    })
}

impl<'a> SharingRepo<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn create_group(&self, sharing_group_id: SharingGroupId, name: Option<&str>) -> Result<(), StorageError> {
        self.conn
            .execute(
                "INSERT INTO sharing_groups (sharing_group_id, name) VALUES (?1, ?2)",
                params![sharing_group_id.as_bytes().as_slice(), name],
            )
            .map_err(|e| StorageError::from_write(e, || format!("sharing group {sharing_group_id} already exists")))?;
        Ok(())
    }

    pub fn group(&self, sharing_group_id: SharingGroupId) -> Result<Option<SharingGroupRecord>, StorageError> {
        let group = self
            .conn
            .query_row(
                "SELECT sharing_group_id, name FROM sharing_groups WHERE sharing_group_id = ?1",
                params![sharing_group_id.as_bytes().as_slice()],
                |row| {
                    Ok(SharingGroupRecord {
                        sharing_group_id: SharingGroupId::from_bytes(id_bytes(row, 0)?),
                        name: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(group)
    }

    pub fn add_member(&self, membership: MembershipRecord) -> Result<(), StorageError> {
        self.conn
            .execute(
                "INSERT INTO sharing_group_users (sharing_group_id, user_id, permission) VALUES (?1, ?2, ?3)",
                params![
                    membership.sharing_group_id.as_bytes().as_slice(),
                    membership.user_id.as_bytes().as_slice(),
                    membership.permission.as_str(),
                ],
            )
            .map_err(|e| {
                StorageError::from_write(e, || {
                    format!("user {} already in {}", membership.user_id, membership.sharing_group_id)
                })
            })?;
        Ok(())
    }

    pub fn membership(
        &self,
        sharing_group_id: SharingGroupId,
        user_id: UserId,
    ) -> Result<Option<MembershipRecord>, StorageError> {
        let membership = self
            .conn
            .query_row(
                "SELECT sharing_group_id, user_id, permission FROM sharing_group_users
                 WHERE sharing_group_id = ?1 AND user_id = ?2",
                params![sharing_group_id.as_bytes().as_slice(), user_id.as_bytes().as_slice()],
                read_membership,
            )
            .optional()?;
        Ok(membership)
    }

    pub fn members(&self, sharing_group_id: SharingGroupId) -> Result<Vec<MembershipRecord>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT sharing_group_id, user_id, permission FROM sharing_group_users
             WHERE sharing_group_id = ?1 ORDER BY user_id",
        )?;
        let rows = stmt.query_map(params![sharing_group_id.as_bytes().as_slice()], read_membership)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn remove_memberships_for_user(&self, user_id: UserId) -> Result<usize, StorageError> {
        Ok(self.conn.execute(
            "DELETE FROM sharing_group_users WHERE user_id = ?1",
            params![user_id.as_bytes().as_slice()],
        )?)
    }

    pub fn add_invitation(&self, invitation: &InvitationRecord) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT INTO sharing_invitations (code, sharing_group_id, owning_user_id, permission, expiry)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                invitation.code.as_bytes().as_slice(),
                invitation.sharing_group_id.as_bytes().as_slice(),
                invitation.owning_user_id.as_bytes().as_slice(),
                invitation.permission.as_str(),
                invitation.expiry,
            ],
        )?;
        Ok(())
    }

    /// An invitation that has not expired as of `now`.
    pub fn live_invitation(&self, code: InvitationCode, now: i64) -> Result<Option<InvitationRecord>, StorageError> {
        let invitation = self
            .conn
            .query_row(
                "SELECT code, sharing_group_id, owning_user_id, permission, expiry FROM sharing_invitations
                 WHERE code = ?1 AND expiry > ?2",
                params![code.as_bytes().as_slice(), now],
                |row| {
                    Ok(InvitationRecord {
                        code: InvitationCode::from_bytes(id_bytes(row, 0)?),
                        sharing_group_id: SharingGroupId::from_bytes(id_bytes(row, 1)?),
                        owning_user_id: UserId::from_bytes(id_bytes(row, 2)?),
                        permission: text_col(row, 3, Permission::parse)?,
                        expiry: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(invitation)
    }

    pub fn remove_invitation(&self, code: InvitationCode) -> Result<usize, StorageError> {
        Ok(self.conn.execute(
            "DELETE FROM sharing_invitations WHERE code = ?1",
            params![code.as_bytes().as_slice()],
        )?)
    }

    pub fn remove_invitations_owned_by(&self, user_id: UserId) -> Result<usize, StorageError> {
        Ok(self.conn.execute(
            "DELETE FROM sharing_invitations WHERE owning_user_id = ?1",
            params![user_id.as_bytes().as_slice()],
        )?)
    }
}
